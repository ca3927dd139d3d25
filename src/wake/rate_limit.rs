//! Per-session wake admission limiter
//!
//! Two rules, both keyed by session uid: a cooldown between consecutive
//! admissions, and a cap on admissions in any trailing 60 second
//! window. Repeated wake phrases inside one speech segment otherwise
//! fire a command per transcript revision.
//!
//! Options are passed per call so a pattern-file reload applies
//! immediately; the limiter itself only owns the admission windows.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::patterns::RateLimitOptions;

/// Length of the rolling admission window.
const WINDOW: Duration = Duration::from_secs(60);

/// Sessions idle this long are garbage-collected.
const SESSION_TTL: Duration = Duration::from_secs(600);

/// Session count that triggers opportunistic garbage collection.
const GC_THRESHOLD: usize = 512;

#[derive(Debug, Default)]
struct SessionWindow {
    admitted: VecDeque<Instant>,
}

impl SessionWindow {
    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.admitted.front() {
            if now.duration_since(*front) >= WINDOW {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Sliding-window admission limiter.
#[derive(Debug, Default)]
pub struct RateLimiter {
    sessions: Mutex<HashMap<String, SessionWindow>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether a detection for this session may become a
    /// command, recording the admission if so.
    pub fn admit(&self, session_uid: &str, options: &RateLimitOptions) -> bool {
        self.admit_at(session_uid, options, Instant::now())
    }

    fn admit_at(&self, session_uid: &str, options: &RateLimitOptions, now: Instant) -> bool {
        if !options.enabled {
            return true;
        }

        let key = if options.per_session { session_uid } else { "" };

        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());

        if sessions.len() >= GC_THRESHOLD {
            sessions.retain(|_, w| {
                w.admitted
                    .back()
                    .is_some_and(|last| now.duration_since(*last) < SESSION_TTL)
            });
        }

        let window = sessions.entry(key.to_string()).or_default();
        window.prune(now);

        if let Some(last) = window.admitted.back() {
            let cooldown = Duration::from_secs_f64(options.cooldown_s);
            if now.duration_since(*last) < cooldown {
                tracing::debug!(session_uid, "wake suppressed by cooldown");
                return false;
            }
        }

        if window.admitted.len() >= options.max_per_minute {
            tracing::debug!(session_uid, "wake suppressed by per-minute cap");
            return false;
        }

        window.admitted.push_back(now);
        true
    }
}
