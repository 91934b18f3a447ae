#![no_main]

use libfuzzer_sys::fuzz_target;
use warden_guard::{CommandMatch, CommandMatcher};

fuzz_target!(|data: &[u8]| {
    let s = String::from_utf8_lossy(data);
    let Ok(matcher) = CommandMatcher::new(
        &["cargo *", "git status", "ls *"],
        &["rm -rf *", "sudo *", "curl * | sh"],
        &["python3"],
    ) else {
        return;
    };
    if let CommandMatch::Allowed { .. } = matcher.check(&s) {
        // an allowed command is never also blocked
        assert!(!s.trim_start().starts_with("sudo "));
    }
});
