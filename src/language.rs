//! Cheap language detection for prompts and voice selection
//!
//! A longest-match heuristic over per-language character classes and
//! keyword hints. Precision only has to be good enough to pick a
//! persona preamble and a TTS voice; anything inconclusive falls back
//! to the configured primary language.

use serde::{Deserialize, Serialize};

/// Languages with localized persona preambles and TTS voices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    En,
    Es,
    Fr,
    De,
    It,
    Pt,
    Ja,
    Zh,
}

/// Detections at or above this confidence use the localized preamble.
pub const PREAMBLE_CONFIDENCE: f64 = 0.3;

impl Language {
    /// ISO 639-1 code, which doubles as the TTS voice identifier.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::En => "en",
            Self::Es => "es",
            Self::Fr => "fr",
            Self::De => "de",
            Self::It => "it",
            Self::Pt => "pt",
            Self::Ja => "ja",
            Self::Zh => "zh",
        }
    }

    /// Parse an ISO code, defaulting to English.
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        match code {
            "es" => Self::Es,
            "fr" => Self::Fr,
            "de" => Self::De,
            "it" => Self::It,
            "pt" => Self::Pt,
            "ja" => Self::Ja,
            "zh" => Self::Zh,
            _ => Self::En,
        }
    }

    /// Localized persona preamble.
    #[must_use]
    pub const fn preamble(self) -> &'static str {
        match self {
            Self::En => {
                "You are Raven, a helpful AI assistant integrated into a meeting system. \
                 Provide concise, helpful responses to questions during meetings. \
                 Keep responses brief and relevant to the meeting context. Respond in English."
            }
            Self::Es => {
                "Eres Raven, un asistente de IA útil integrado en un sistema de reuniones. \
                 Proporciona respuestas concisas y útiles a las preguntas durante las \
                 reuniones. Responde en español."
            }
            Self::Fr => {
                "Tu es Raven, un assistant IA utile intégré dans un système de réunion. \
                 Fournis des réponses concises et utiles aux questions pendant les \
                 réunions. Réponds en français."
            }
            Self::De => {
                "Du bist Raven, ein hilfreicher KI-Assistent in einem Meeting-System. \
                 Gib prägnante, hilfreiche Antworten auf Fragen während Meetings. \
                 Antworte auf Deutsch."
            }
            Self::It => {
                "Sei Raven, un assistente IA utile integrato in un sistema di riunioni. \
                 Fornisci risposte concise e utili alle domande durante le riunioni. \
                 Rispondi in italiano."
            }
            Self::Pt => {
                "Você é Raven, um assistente de IA útil integrado em um sistema de \
                 reuniões. Forneça respostas concisas e úteis durante reuniões. \
                 Responda em português."
            }
            Self::Ja => {
                "あなたはRavenです。会議システムに統合されたAIアシスタントです。\
                 会議中の質問に簡潔で有用な回答を日本語で提供してください。"
            }
            Self::Zh => {
                "你是Raven，一个集成在会议系统中的AI助手。\
                 请在会议期间用中文为问题提供简洁、有用的回答。"
            }
        }
    }

    /// Localized reply used when the LLM returns an empty completion,
    /// so the user still hears something.
    #[must_use]
    pub const fn fallback_reply(self) -> &'static str {
        match self {
            Self::En => "I don't have an answer for that right now.",
            Self::Es => "No tengo una respuesta para eso en este momento.",
            Self::Fr => "Je n'ai pas de réponse à cela pour le moment.",
            Self::De => "Darauf habe ich im Moment keine Antwort.",
            Self::It => "Al momento non ho una risposta a questo.",
            Self::Pt => "No momento não tenho uma resposta para isso.",
            Self::Ja => "今はその質問にお答えできません。",
            Self::Zh => "我目前无法回答这个问题。",
        }
    }
}

/// Detect the dominant language of `text`, returning the language and
/// a confidence in `[0, 1]`. English at 0.5 when nothing scores.
#[must_use]
pub fn detect(text: &str) -> (Language, f64) {
    let lower = text.to_lowercase();

    let mut best = (Language::En, 0.0_f64);
    for (language, score) in [
        (Language::Ja, score_japanese(text)),
        (Language::Zh, score_chinese(text)),
        (Language::Es, score_keywords(&lower, &["¿", "ñ", "qué", "dónde", "cuándo", "cómo", "hola"])),
        (Language::Fr, score_keywords(&lower, &["ç", "è", "ê", "où", "qu'", "bonjour", "pourquoi"])),
        (Language::De, score_keywords(&lower, &["ß", "ä", "ö", "ü", "kannst", "warum", "wie spät"])),
        (Language::It, score_keywords(&lower, &["perché", "cosa", "ciao", "puoi", "dove"])),
        (Language::Pt, score_keywords(&lower, &["ã", "õ", "você", "onde", "olá", "por que"])),
    ] {
        if score > best.1 {
            best = (language, score);
        }
    }

    if best.1 > 0.0 {
        (best.0, best.1.min(1.0))
    } else {
        (Language::En, 0.5)
    }
}

fn score_japanese(text: &str) -> f64 {
    // Hiragana and katakana are unambiguous; kanji alone could be Chinese
    let kana = text
        .chars()
        .any(|c| matches!(c, '\u{3040}'..='\u{309F}' | '\u{30A0}'..='\u{30FF}'));
    if kana {
        0.8
    } else {
        0.0
    }
}

fn score_chinese(text: &str) -> f64 {
    let han = text.chars().any(|c| matches!(c, '\u{4E00}'..='\u{9FFF}'));
    let kana = score_japanese(text) > 0.0;
    if han && !kana {
        0.8
    } else {
        0.0
    }
}

fn score_keywords(lower: &str, hints: &[&str]) -> f64 {
    let matched = hints.iter().filter(|h| lower.contains(*h)).count();
    matched as f64 * 0.3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn english_is_the_quiet_default() {
        let (lang, confidence) = detect("hey raven what time is it?");
        assert_eq!(lang, Language::En);
        assert!((confidence - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn spanish_keywords_score() {
        let (lang, confidence) = detect("Hola Raven, ¿qué hora es?");
        assert_eq!(lang, Language::Es);
        assert!(confidence >= PREAMBLE_CONFIDENCE);
    }

    #[test]
    fn kana_wins_over_shared_han() {
        let (lang, _) = detect("レイブンさん、今何時ですか");
        assert_eq!(lang, Language::Ja);
    }

    #[test]
    fn han_without_kana_is_chinese() {
        let (lang, _) = detect("雷文，现在几点了");
        assert_eq!(lang, Language::Zh);
    }

    #[test]
    fn code_round_trip() {
        for lang in [
            Language::En,
            Language::Es,
            Language::Fr,
            Language::De,
            Language::It,
            Language::Pt,
            Language::Ja,
            Language::Zh,
        ] {
            assert_eq!(Language::from_code(lang.code()), lang);
        }
    }

    #[test]
    fn unknown_code_falls_back_to_english() {
        assert_eq!(Language::from_code("tlh"), Language::En);
    }
}
