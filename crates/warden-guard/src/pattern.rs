//! Anchored glob matching for paths, hosts and commands.
//!
//! Pattern syntax:
//! - `**` matches any sequence, separators included
//! - `**/` at the start of a segment also matches the empty prefix
//! - `/**` at the end also matches the bare directory
//! - `*` matches any sequence that does not contain the separator
//! - `?` matches exactly one non-separator character
//!
//! The separator depends on the [`PatternKind`]: `/` for paths, `.` for hosts,
//! none for commands (there `*` and `**` are equivalent). Matching is always
//! anchored to the full subject. Hosts compare case-insensitively.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::GuardError;

/// What a pattern is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// Filesystem paths, separated by `/`.
    Path,
    /// Host names, separated by `.`.
    Host,
    /// Shell command lines.
    Command,
}

impl PatternKind {
    fn separator(self) -> Option<char> {
        match self {
            PatternKind::Path => Some('/'),
            PatternKind::Host => Some('.'),
            PatternKind::Command => None,
        }
    }
}

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    kind: PatternKind,
    regex: Regex,
}

impl Pattern {
    /// Compile a glob pattern of the given kind.
    pub fn new(source: &str, kind: PatternKind) -> Result<Self, GuardError> {
        let normalized = match kind {
            PatternKind::Path => strip_current_dir(source),
            _ => source.trim(),
        };
        if normalized.is_empty() {
            return Err(GuardError::Validation(format!(
                "empty {kind:?} pattern '{source}'"
            )));
        }

        let regex = Regex::new(&glob_to_regex(normalized, kind)).map_err(|e| {
            GuardError::Validation(format!("invalid pattern '{source}': {e}"))
        })?;

        Ok(Self {
            source: source.to_string(),
            kind,
            regex,
        })
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// The kind this pattern was compiled for.
    pub fn kind(&self) -> PatternKind {
        self.kind
    }

    /// Check whether the subject matches this pattern.
    ///
    /// Path subjects are normalized first; a path that climbs above its root
    /// never matches.
    pub fn matches(&self, subject: &str) -> bool {
        match self.kind {
            PatternKind::Path => match normalize_path(subject) {
                Some(path) => self.regex.is_match(&path),
                None => false,
            },
            PatternKind::Host => self.regex.is_match(subject.trim_end_matches('.')),
            PatternKind::Command => self.regex.is_match(subject),
        }
    }
}

/// An ordered list of compiled patterns.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<Pattern>,
}

impl PatternSet {
    /// Compile every pattern, failing on the first invalid one.
    pub fn compile<S: AsRef<str>>(sources: &[S], kind: PatternKind) -> Result<Self, GuardError> {
        let patterns = sources
            .iter()
            .map(|s| Pattern::new(s.as_ref(), kind))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Return the first pattern matching the subject.
    pub fn first_match(&self, subject: &str) -> Option<&Pattern> {
        self.patterns.iter().find(|p| p.matches(subject))
    }

    /// Whether any pattern matches the subject.
    pub fn is_match(&self, subject: &str) -> bool {
        self.first_match(subject).is_some()
    }

    /// Whether the set holds no patterns.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Iterate over the compiled patterns.
    pub fn iter(&self) -> impl Iterator<Item = &Pattern> {
        self.patterns.iter()
    }
}

/// Check if a glob pattern matches a subject.
///
/// Compiles the pattern on every call; hold a [`Pattern`] for repeated use.
/// Malformed patterns never match.
pub fn glob_match(pattern: &str, subject: &str, kind: PatternKind) -> bool {
    Pattern::new(pattern, kind)
        .map(|p| p.matches(subject))
        .unwrap_or(false)
}

/// Normalize a path lexically.
///
/// Strips `./` prefixes, drops `.` and empty segments and resolves `..`.
/// Returns `None` when the path climbs above its root.
pub fn normalize_path(path: &str) -> Option<String> {
    let absolute = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    if absolute {
        Some(format!("/{joined}"))
    } else {
        Some(joined)
    }
}

fn strip_current_dir(pattern: &str) -> &str {
    let mut rest = pattern.trim();
    while let Some(stripped) = rest.strip_prefix("./") {
        rest = stripped;
    }
    rest
}

/// Convert a glob pattern to an anchored regex.
fn glob_to_regex(pattern: &str, kind: PatternKind) -> String {
    let sep = kind.separator();
    let mut regex = String::with_capacity(pattern.len() * 2 + 8);
    if kind == PatternKind::Host {
        regex.push_str("(?i)");
    }
    regex.push('^');

    let not_sep = match sep {
        Some(c) => format!("[^{}]", regex::escape(&c.to_string())),
        None => ".".to_string(),
    };

    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '*' if chars.get(i + 1) == Some(&'*') => {
                let at_segment_start = i == 0 || Some(chars[i - 1]) == sep;
                match (sep, chars.get(i + 2)) {
                    (Some(s), Some(&next)) if next == s && at_segment_start => {
                        // `**/` matches any prefix, including none
                        regex.push_str(&format!("(?:.*{})?", regex::escape(&s.to_string())));
                        i += 3;
                    }
                    _ => {
                        regex.push_str(".*");
                        i += 2;
                    }
                }
            }
            '*' => {
                regex.push_str(&not_sep);
                regex.push('*');
                i += 1;
            }
            '?' => {
                regex.push_str(&not_sep);
                i += 1;
            }
            c if Some(c) == sep
                && chars.get(i + 1) == Some(&'*')
                && chars.get(i + 2) == Some(&'*')
                && i + 3 == chars.len() =>
            {
                // trailing `/**` also matches the directory itself
                regex.push_str(&format!("(?:{}.*)?", regex::escape(&c.to_string())));
                i += 3;
            }
            other => {
                regex.push_str(&regex::escape(&other.to_string()));
                i += 1;
            }
        }
    }

    regex.push('$');
    regex
}
