#![no_main]

use libfuzzer_sys::fuzz_target;
use warden_guard::AgentPermissionSet;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(set) = serde_json::from_str::<AgentPermissionSet>(s) {
            let json = serde_json::to_string(&set).expect("serialize");
            let back: AgentPermissionSet = serde_json::from_str(&json).expect("reparse");
            assert_eq!(set, back);
        }
    }
});
