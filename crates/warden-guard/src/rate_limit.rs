//! Sliding-window rate limiting per (agent, resource class).
//!
//! Each key keeps a log of admission instants. A request is admitted when the
//! number of admissions inside the window is below the limit; the check and
//! the record happen under one lock, so two concurrent requests can never both
//! take the last slot.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use quanta::{Clock, Instant};
use serde::{Deserialize, Serialize};

/// Resource classes with independent windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateClass {
    /// Filesystem operations.
    File,
    /// Network connections.
    Network,
    /// Shell commands.
    Shell,
    /// Model invocations.
    Llm,
}

impl fmt::Display for RateClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RateClass::File => "file",
            RateClass::Network => "network",
            RateClass::Shell => "shell",
            RateClass::Llm => "llm",
        })
    }
}

/// A limit of `max` requests per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Admissions allowed inside one window.
    pub max: u32,
    /// Window length.
    pub window: Duration,
}

impl RateLimit {
    /// `max` requests per minute.
    pub fn per_minute(max: u32) -> Self {
        Self {
            max,
            window: Duration::from_secs(60),
        }
    }

    /// `max` requests per hour.
    pub fn per_hour(max: u32) -> Self {
        Self {
            max,
            window: Duration::from_secs(3600),
        }
    }
}

type Key = (String, RateClass);

/// Sliding-window log rate limiter.
pub struct RateLimiter {
    clock: Clock,
    windows: Mutex<HashMap<Key, VecDeque<Instant>>>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("keys", &self.windows.lock().len())
            .finish()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Limiter on the system monotonic clock.
    pub fn new() -> Self {
        Self::with_clock(Clock::new())
    }

    /// Limiter on a caller-supplied clock (use `Clock::mock()` in tests).
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn prune(log: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(front) = log.front() {
            if now.saturating_duration_since(*front) >= window {
                log.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether a request would be admitted right now, without recording it.
    pub fn would_admit(&self, agent_id: &str, class: RateClass, limit: RateLimit) -> bool {
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        match windows.get_mut(&(agent_id.to_string(), class)) {
            Some(log) => {
                Self::prune(log, now, limit.window);
                log.len() < limit.max as usize
            }
            None => limit.max > 0,
        }
    }

    /// Admit and record a request if it fits inside the window.
    pub fn try_acquire(&self, agent_id: &str, class: RateClass, limit: RateLimit) -> bool {
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        let log = windows
            .entry((agent_id.to_string(), class))
            .or_default();
        Self::prune(log, now, limit.window);
        if log.len() < limit.max as usize {
            log.push_back(now);
            true
        } else {
            false
        }
    }

    /// Give back the most recent admission for the key.
    pub fn release(&self, agent_id: &str, class: RateClass) {
        if let Some(log) = self.windows.lock().get_mut(&(agent_id.to_string(), class)) {
            log.pop_back();
        }
    }

    /// Admissions recorded for the key inside `window`.
    pub fn usage(&self, agent_id: &str, class: RateClass, window: Duration) -> usize {
        let now = self.clock.now();
        let windows = self.windows.lock();
        windows
            .get(&(agent_id.to_string(), class))
            .map(|log| {
                log.iter()
                    .filter(|t| now.saturating_duration_since(**t) < window)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Forget every window belonging to the agent.
    pub fn reset(&self, agent_id: &str) {
        self.windows.lock().retain(|(agent, _), _| agent != agent_id);
    }
}
