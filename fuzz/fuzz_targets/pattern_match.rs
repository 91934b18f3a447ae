#![no_main]

use libfuzzer_sys::fuzz_target;
use warden_guard::pattern::normalize_path;
use warden_guard::{glob_match, PatternKind};

fuzz_target!(|data: &[u8]| {
    let s = String::from_utf8_lossy(data);
    let (pattern, subject) = s.split_once('\n').unwrap_or((&s, "src/lib.rs"));
    for kind in [PatternKind::Path, PatternKind::Host, PatternKind::Command] {
        let _ = glob_match(pattern, subject, kind);
    }
    // normalized paths never climb out of their root
    if let Some(norm) = normalize_path(subject) {
        assert!(!norm.split('/').any(|seg| seg == ".."));
    }
});
