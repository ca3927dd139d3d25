//! Wake pattern configuration
//!
//! Patterns are grouped into kinds with per-kind confidence thresholds.
//! Configuration comes from a JSON file (`WAKE_CONFIG_PATH`) and can be
//! hot-reloaded by sending SIGHUP to the wake detector process; absent
//! a file, built-in defaults cover the stock "hey raven" phrases.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Pattern taxonomy, in match-priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    /// Direct address: "hey raven"
    Primary,
    /// Softer address: "okay raven", bare "raven"
    Secondary,
    /// Imperatives: "raven can you", "raven help"
    Conversational,
    /// Interrogatives: "raven what", "raven where"
    Question,
    /// Punctuation-cued: "raven,", "raven?"
    Punctuation,
    /// Known recognizer mishearings, matched by edit distance
    Fuzzy,
}

impl PatternKind {
    /// All kinds in configuration order, which doubles as the final
    /// tie-break when two hits share confidence and offset.
    pub const ORDERED: [Self; 6] = [
        Self::Primary,
        Self::Secondary,
        Self::Conversational,
        Self::Question,
        Self::Punctuation,
        Self::Fuzzy,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Conversational => "conversational",
            Self::Question => "question",
            Self::Punctuation => "punctuation",
            Self::Fuzzy => "fuzzy",
        }
    }
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Edit-distance matching options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzyOptions {
    /// Whether fuzzy phrases participate in matching at all
    pub enabled: bool,
    /// Maximum Damerau-Levenshtein distance for a fuzzy hit
    pub max_edit_distance: usize,
}

impl Default for FuzzyOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_edit_distance: 2,
        }
    }
}

/// Bounds on the extracted question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionOptions {
    pub min_chars: usize,
    pub max_chars: usize,
}

impl Default for QuestionOptions {
    fn default() -> Self {
        Self {
            min_chars: 3,
            max_chars: 200,
        }
    }
}

/// Per-session admission limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitOptions {
    pub enabled: bool,
    /// Minimum seconds between admissions
    pub cooldown_s: f64,
    /// Admissions allowed in any trailing 60 s window
    pub max_per_minute: usize,
    /// Key the limiter by session uid; false shares one window
    pub per_session: bool,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_s: 3.0,
            max_per_minute: 15,
            per_session: true,
        }
    }
}

/// Full wake-detector pattern configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakePatterns {
    /// Phrases per kind; kinds keep [`PatternKind::ORDERED`] priority
    pub patterns: HashMap<PatternKind, Vec<String>>,
    /// Per-kind confidence; unlisted kinds inherit the higher of the
    /// primary and secondary thresholds
    pub thresholds: HashMap<PatternKind, f64>,
    pub fuzzy: FuzzyOptions,
    pub question: QuestionOptions,
    pub rate_limit: RateLimitOptions,
}

impl Default for WakePatterns {
    fn default() -> Self {
        let mut patterns = HashMap::new();
        patterns.insert(
            PatternKind::Primary,
            phrases(&["hey raven", "hello raven", "hi raven"]),
        );
        // A bare "raven" is deliberately absent: it matches incidental
        // mentions ("a raven bird"); the punctuation and question kinds
        // cover direct addresses instead.
        patterns.insert(
            PatternKind::Secondary,
            phrases(&["okay raven", "excuse me raven"]),
        );
        patterns.insert(
            PatternKind::Conversational,
            phrases(&[
                "raven can you",
                "raven could you",
                "raven will you",
                "raven help",
                "raven tell me",
            ]),
        );
        patterns.insert(
            PatternKind::Question,
            phrases(&[
                "raven what",
                "raven where",
                "raven when",
                "raven who",
                "raven why",
                "raven how",
            ]),
        );
        patterns.insert(
            PatternKind::Punctuation,
            phrases(&["raven,", "raven?"]),
        );
        patterns.insert(
            PatternKind::Fuzzy,
            phrases(&["hey haven", "hello haven", "hey ravin"]),
        );

        let mut thresholds = HashMap::new();
        thresholds.insert(PatternKind::Primary, 0.9);
        thresholds.insert(PatternKind::Secondary, 0.7);
        thresholds.insert(PatternKind::Fuzzy, 0.7);

        Self {
            patterns,
            thresholds,
            fuzzy: FuzzyOptions::default(),
            question: QuestionOptions::default(),
            rate_limit: RateLimitOptions::default(),
        }
    }
}

fn phrases(list: &[&str]) -> Vec<String> {
    list.iter().map(|p| (*p).to_string()).collect()
}

impl WakePatterns {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns error if the file is unreadable or not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let loaded: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("bad wake config {}: {e}", path.display())))?;

        tracing::info!(
            path = %path.display(),
            kinds = loaded.patterns.len(),
            fuzzy = loaded.fuzzy.enabled,
            "wake patterns loaded"
        );
        Ok(loaded)
    }

    /// Confidence assigned to a hit of the given kind.
    #[must_use]
    pub fn confidence(&self, kind: PatternKind) -> f64 {
        if let Some(t) = self.thresholds.get(&kind) {
            return *t;
        }

        let primary = self
            .thresholds
            .get(&PatternKind::Primary)
            .copied()
            .unwrap_or(0.9);
        let secondary = self
            .thresholds
            .get(&PatternKind::Secondary)
            .copied()
            .unwrap_or(0.7);
        primary.max(secondary)
    }

    /// Phrases of a kind, empty when unconfigured.
    #[must_use]
    pub fn phrases(&self, kind: PatternKind) -> &[String] {
        self.patterns.get(&kind).map_or(&[], Vec::as_slice)
    }
}

/// Hot-reloadable shared pattern handle.
pub type SharedPatterns = Arc<RwLock<WakePatterns>>;

/// Build the shared handle, preferring the file when given.
#[must_use]
pub fn shared(path: Option<&Path>) -> SharedPatterns {
    let patterns = match path {
        Some(p) => WakePatterns::load(p).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "falling back to built-in wake patterns");
            WakePatterns::default()
        }),
        None => WakePatterns::default(),
    };
    Arc::new(RwLock::new(patterns))
}

/// Reload the shared patterns on every SIGHUP.
///
/// Reload failures keep the previous configuration; a broken edit must
/// not take the detector down.
#[cfg(unix)]
pub fn spawn_reload_on_sighup(shared: SharedPatterns, path: PathBuf) {
    tokio::spawn(async move {
        let Ok(mut hangup) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        else {
            tracing::warn!("cannot install SIGHUP handler; hot reload disabled");
            return;
        };

        while hangup.recv().await.is_some() {
            match WakePatterns::load(&path) {
                Ok(fresh) => {
                    *shared.write().unwrap_or_else(|e| e.into_inner()) = fresh;
                    tracing::info!(path = %path.display(), "wake patterns reloaded");
                }
                Err(e) => {
                    tracing::error!(error = %e, "wake pattern reload failed, keeping previous");
                }
            }
        }
    });
}

#[cfg(not(unix))]
pub fn spawn_reload_on_sighup(_shared: SharedPatterns, _path: PathBuf) {
    tracing::warn!("hot reload is unix-only on this build");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_thresholds() {
        let p = WakePatterns::default();
        assert!((p.confidence(PatternKind::Primary) - 0.9).abs() < f64::EPSILON);
        assert!((p.confidence(PatternKind::Secondary) - 0.7).abs() < f64::EPSILON);
        assert!((p.confidence(PatternKind::Fuzzy) - 0.7).abs() < f64::EPSILON);
        // Unlisted kinds inherit the higher of primary/secondary
        assert!((p.confidence(PatternKind::Question) - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let parsed: WakePatterns =
            serde_json::from_str(r#"{"fuzzy":{"enabled":false,"max_edit_distance":1}}"#)
                .unwrap();
        assert!(!parsed.fuzzy.enabled);
        assert_eq!(parsed.fuzzy.max_edit_distance, 1);
        // Unspecified sections come from defaults
        assert_eq!(parsed.question.min_chars, 3);
        assert!(!parsed.phrases(PatternKind::Primary).is_empty());
    }

    #[test]
    fn kind_names_are_lowercase_on_the_wire() {
        assert_eq!(
            serde_json::to_string(&PatternKind::Primary).unwrap(),
            "\"primary\""
        );
        let kind: PatternKind = serde_json::from_str("\"fuzzy\"").unwrap();
        assert_eq!(kind, PatternKind::Fuzzy);
    }
}
