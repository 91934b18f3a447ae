//! Shell command matching with allow/block semantics.
//!
//! Commands are tokenized with `shell-words` before any pattern is applied, so
//! quoting tricks (`"rm" "-rf" /`) cannot slip past a blocked pattern.

use std::collections::HashSet;

use crate::error::GuardError;
use crate::pattern::{Pattern, PatternKind};

/// Programs treated as interpreter invocations.
const INTERPRETERS: &[&str] = &[
    "sh", "bash", "zsh", "dash", "fish", "ksh", "pwsh", "python", "python2", "python3", "node",
    "deno", "bun", "ruby", "perl", "php", "lua", "osascript",
];

/// Outcome of matching one command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandMatch {
    /// Matched an allow pattern and nothing blocked it.
    Allowed {
        /// The allow pattern that matched.
        pattern: String,
    },
    /// Matched a blocked pattern.
    Blocked {
        /// The blocked pattern that matched.
        pattern: String,
    },
    /// Interpreter invocation not in the interpreter allow-list.
    InterpreterNotAllowed {
        /// Basename of the interpreter.
        interpreter: String,
    },
    /// Matched no allow pattern.
    NotAllowed,
    /// Empty command or unbalanced quoting.
    Malformed,
}

#[derive(Debug, Clone)]
struct CommandPattern {
    source: String,
    full: Pattern,
    words: Vec<Pattern>,
}

impl CommandPattern {
    fn compile(source: &str) -> Result<Self, GuardError> {
        let split = shell_words::split(source).map_err(|e| {
            GuardError::Validation(format!("invalid command pattern '{source}': {e}"))
        })?;
        if split.is_empty() {
            return Err(GuardError::Validation(format!(
                "empty command pattern '{source}'"
            )));
        }
        let words = split
            .iter()
            .map(|w| Pattern::new(w, PatternKind::Command))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            source: source.to_string(),
            full: Pattern::new(&split.join(" "), PatternKind::Command)?,
            words,
        })
    }

    fn words_match(&self, words: &[String]) -> bool {
        self.words.len() == words.len()
            && self.words.iter().zip(words).all(|(p, w)| p.matches(w))
    }

    /// Full glob match, or the pattern's words are a prefix of the command.
    fn allows(&self, joined: &str, words: &[String]) -> bool {
        if self.full.matches(joined) {
            return true;
        }
        words.len() >= self.words.len() && self.words_match(&words[..self.words.len()])
    }

    /// Like [`allows`](Self::allows), but the pattern may also appear as a
    /// contiguous word run anywhere in the command.
    fn blocks(&self, joined: &str, words: &[String]) -> bool {
        if self.full.matches(joined) {
            return true;
        }
        words
            .windows(self.words.len())
            .any(|window| self.words_match(window))
    }
}

/// Compiled shell command policy.
#[derive(Debug, Clone, Default)]
pub struct CommandMatcher {
    allowed: Vec<CommandPattern>,
    blocked: Vec<CommandPattern>,
    interpreters: HashSet<String>,
}

impl CommandMatcher {
    /// Compile allow, block and interpreter lists.
    pub fn new<S: AsRef<str>>(
        allowed: &[S],
        blocked: &[S],
        interpreters: &[S],
    ) -> Result<Self, GuardError> {
        let compile = |list: &[S]| {
            list.iter()
                .map(|s| CommandPattern::compile(s.as_ref()))
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            allowed: compile(allowed)?,
            blocked: compile(blocked)?,
            interpreters: interpreters
                .iter()
                .map(|s| basename(s.as_ref()).to_string())
                .collect(),
        })
    }

    /// Match a command line against the policy.
    ///
    /// Blocked patterns are checked first and win over any allow pattern.
    pub fn check(&self, command: &str) -> CommandMatch {
        let mut words = match shell_words::split(command) {
            Ok(w) if !w.is_empty() => w,
            _ => return CommandMatch::Malformed,
        };

        // `/usr/bin/rm` is matched as `rm`.
        let program = basename(&words[0]).to_string();
        let raw_joined = words.join(" ");
        words[0] = program.clone();
        let joined = words.join(" ");

        if let Some(blocked) = self
            .blocked
            .iter()
            .find(|p| p.blocks(&joined, &words) || p.full.matches(&raw_joined))
        {
            return CommandMatch::Blocked {
                pattern: blocked.source.clone(),
            };
        }

        if is_interpreter(&program) && !self.interpreters.contains(&program) {
            return CommandMatch::InterpreterNotAllowed {
                interpreter: program,
            };
        }

        match self.allowed.iter().find(|p| p.allows(&joined, &words)) {
            Some(p) => CommandMatch::Allowed {
                pattern: p.source.clone(),
            },
            None => CommandMatch::NotAllowed,
        }
    }
}

fn basename(program: &str) -> &str {
    program.rsplit('/').next().unwrap_or(program)
}

/// Whether a program name is a script interpreter (`python3.11` counts as `python`).
pub fn is_interpreter(program: &str) -> bool {
    let name = basename(program);
    if INTERPRETERS.contains(&name) {
        return true;
    }
    let stem = name.trim_end_matches(|c: char| c.is_ascii_digit() || c == '.');
    stem != name && INTERPRETERS.contains(&stem)
}
