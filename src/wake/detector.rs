//! Wake phrase detection and question extraction

use super::fuzzy::find_fuzzy;
use super::patterns::{PatternKind, SharedPatterns};
use super::rate_limit::RateLimiter;

/// A successful detection on one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// The question following the wake phrase, trimmed
    pub question: String,
    /// Which pattern kind produced the winning hit
    pub kind: PatternKind,
    /// Confidence of that kind
    pub confidence: f64,
}

#[derive(Debug)]
struct Hit {
    kind: PatternKind,
    /// Byte offset of the match start in the normalized text
    offset: usize,
    /// Byte offset just past the match
    end: usize,
    confidence: f64,
    /// Phrase index within its kind, the last tie-break
    order: usize,
}

/// Detects wake phrases in transcript segments.
///
/// Matching runs over normalized text: lowercased, inner whitespace
/// collapsed, and leading/trailing punctuation stripped except `,`
/// and `?`, which are meaningful to the punctuation patterns.
pub struct WakeDetector {
    patterns: SharedPatterns,
    limiter: RateLimiter,
}

impl WakeDetector {
    #[must_use]
    pub fn new(patterns: SharedPatterns) -> Self {
        Self {
            patterns,
            limiter: RateLimiter::new(),
        }
    }

    /// Detect a wake phrase, extract the question, and apply the
    /// per-session rate limit. Returns `None` when the segment carries
    /// no admissible command.
    pub fn detect_and_extract(&self, text: &str, session_uid: &str) -> Option<Detection> {
        let detection = self.detect(text)?;

        let rate_limit = self
            .patterns
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .rate_limit
            .clone();
        if !self.limiter.admit(session_uid, &rate_limit) {
            tracing::debug!(session_uid, "detection rejected by rate limit");
            return None;
        }

        tracing::info!(
            session_uid,
            kind = %detection.kind,
            confidence = detection.confidence,
            question = %detection.question,
            "wake word detected"
        );
        Some(detection)
    }

    /// Pure detection without rate limiting: normalize, match every
    /// configured phrase, pick the best hit, and extract the question.
    pub fn detect(&self, text: &str) -> Option<Detection> {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return None;
        }

        let patterns = self.patterns.read().unwrap_or_else(|e| e.into_inner());

        let mut hits: Vec<Hit> = Vec::new();
        for kind in PatternKind::ORDERED {
            if kind == PatternKind::Fuzzy && !patterns.fuzzy.enabled {
                continue;
            }
            let confidence = patterns.confidence(kind);

            for (order, phrase) in patterns.phrases(kind).iter().enumerate() {
                let found = if kind == PatternKind::Fuzzy {
                    find_fuzzy(&normalized, phrase, patterns.fuzzy.max_edit_distance)
                } else {
                    normalized.find(phrase.as_str()).map(|at| (at, phrase.len()))
                };

                if let Some((offset, len)) = found {
                    hits.push(Hit {
                        kind,
                        offset,
                        end: offset + len,
                        confidence,
                        order,
                    });
                }
            }
        }

        let best = select_best(hits)?;
        let question = extract_question(&normalized, best.end);

        let bounds = &patterns.question;
        let length = question.chars().count();
        if length < bounds.min_chars || length > bounds.max_chars {
            tracing::debug!(
                length,
                min = bounds.min_chars,
                max = bounds.max_chars,
                "question length out of bounds, dropping"
            );
            return None;
        }

        Some(Detection {
            question,
            kind: best.kind,
            confidence: best.confidence,
        })
    }
}

/// Pick the best hit: highest confidence, then earliest offset, then
/// configuration order (kind order, then phrase order within the kind).
fn select_best(mut hits: Vec<Hit>) -> Option<Hit> {
    hits.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.offset.cmp(&b.offset))
            .then_with(|| {
                let ka = PatternKind::ORDERED.iter().position(|k| *k == a.kind);
                let kb = PatternKind::ORDERED.iter().position(|k| *k == b.kind);
                ka.cmp(&kb)
            })
            .then(a.order.cmp(&b.order))
    });
    hits.into_iter().next()
}

/// Normalize segment text for matching.
#[must_use]
pub fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_matches(|c: char| c.is_ascii_punctuation() && c != ',' && c != '?')
        .trim()
        .to_string()
}

/// The question is everything after the wake phrase up to the end of
/// text or the next strong punctuation boundary (kept inclusive, so
/// "what time is it?" retains its question mark).
fn extract_question(normalized: &str, phrase_end: usize) -> String {
    let tail = &normalized[phrase_end..];

    let cut = tail
        .char_indices()
        .find(|(_, c)| matches!(c, '.' | '!' | '?' | ';'))
        .map_or(tail.len(), |(at, c)| at + c.len_utf8());

    tail[..cut]
        .trim_start_matches(|c: char| c == ',' || c.is_whitespace())
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::super::patterns::{self, WakePatterns};
    use super::*;
    use std::sync::{Arc, RwLock};

    fn detector() -> WakeDetector {
        WakeDetector::new(patterns::shared(None))
    }

    fn detector_with(mut edit: impl FnMut(&mut WakePatterns)) -> WakeDetector {
        let mut p = WakePatterns::default();
        edit(&mut p);
        WakeDetector::new(Arc::new(RwLock::new(p)))
    }

    #[test]
    fn primary_phrase_with_question() {
        let d = detector().detect("hey raven what time is it?").unwrap();
        assert_eq!(d.question, "what time is it?");
        assert_eq!(d.kind, PatternKind::Primary);
        assert!((d.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn normalization_handles_case_and_whitespace() {
        let d = detector()
            .detect("  Hey   RAVEN   what   time is it?  ")
            .unwrap();
        assert_eq!(d.question, "what time is it?");
    }

    #[test]
    fn question_stops_at_strong_punctuation() {
        let d = detector()
            .detect("hey raven what time is it? we were just talking")
            .unwrap();
        assert_eq!(d.question, "what time is it?");
    }

    #[test]
    fn leading_comma_is_stripped_from_question() {
        let d = detector().detect("raven, can you help me out").unwrap();
        assert_eq!(d.question, "can you help me out");
    }

    #[test]
    fn fuzzy_match_when_enabled() {
        let d = detector().detect("hey haven can you help").unwrap();
        assert_eq!(d.kind, PatternKind::Fuzzy);
        assert_eq!(d.question, "can you help");
    }

    #[test]
    fn fuzzy_disabled_drops_misheard_phrase() {
        let d = detector_with(|p| p.fuzzy.enabled = false);
        assert!(d.detect("hey haven can you help").is_none());
    }

    #[test]
    fn no_wake_phrase_no_detection() {
        assert!(detector().detect("this is just a regular sentence").is_none());
        assert!(detector().detect("haven't seen it").is_none());
    }

    #[test]
    fn question_kind_extracts_after_full_phrase() {
        let d = detector().detect("raven what is happening here?").unwrap();
        assert_eq!(d.kind, PatternKind::Question);
        assert_eq!(d.question, "is happening here?");
    }

    #[test]
    fn empty_and_whitespace_only_segments() {
        assert!(detector().detect("").is_none());
        assert!(detector().detect("   ").is_none());
    }

    #[test]
    fn wake_phrase_alone_is_below_min_chars() {
        assert!(detector().detect("hey raven").is_none());
        assert!(detector().detect("hey raven ok").is_none());
    }

    #[test]
    fn question_above_max_chars_is_dropped() {
        let long = format!("hey raven {}", "a".repeat(300));
        assert!(detector().detect(&long).is_none());
    }

    #[test]
    fn earliest_offset_wins_among_equal_confidence() {
        // Both primary phrases appear; the earlier one anchors the
        // question extraction.
        let d = detector().detect("hey raven tell hello raven something fun").unwrap();
        assert_eq!(d.question, "tell hello raven something fun");
    }

    #[test]
    fn higher_confidence_beats_earlier_offset() {
        // Secondary "okay raven" sits at offset 0 but the primary
        // phrase further in outranks it.
        let d = detector().detect("okay raven hey raven what is the plan").unwrap();
        assert_eq!(d.kind, PatternKind::Primary);
        assert_eq!(d.question, "what is the plan");
    }

    #[test]
    fn rate_limit_applies_only_through_detect_and_extract() {
        let d = detector();
        assert!(d.detect_and_extract("hey raven what time is it?", "S1").is_some());
        // Within the 3 s cooldown
        assert!(d.detect_and_extract("hey raven what time is it?", "S1").is_none());
        // Pure detection is unaffected
        assert!(d.detect("hey raven what time is it?").is_some());
    }
}
