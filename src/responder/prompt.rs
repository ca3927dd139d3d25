//! Prompt assembly for the LLM gateway

use super::history::ConversationTurn;
use crate::language::{self, Language, PREAMBLE_CONFIDENCE};

/// Conversation turns inlined into the prompt.
const HISTORY_IN_PROMPT: usize = 3;

/// Build the generation prompt: persona preamble (localized when the
/// question's language is detected confidently), recent conversation
/// turns, the meeting context line, and the question itself.
#[must_use]
pub fn build_prompt(
    persona_preamble: &str,
    context: &str,
    history: &[ConversationTurn],
    question: &str,
) -> (String, Language) {
    let (detected, confidence) = language::detect(question);

    let preamble = if detected == Language::En || confidence < PREAMBLE_CONFIDENCE {
        persona_preamble
    } else {
        detected.preamble()
    };

    let mut parts: Vec<String> = vec![preamble.to_string()];

    let recent: Vec<&ConversationTurn> = history
        .iter()
        .rev()
        .take(HISTORY_IN_PROMPT)
        .rev()
        .collect();
    if !recent.is_empty() {
        parts.push("\nRecent conversation history:".to_string());
        for turn in recent {
            parts.push(format!("Q: {}", turn.question));
            parts.push(format!("A: {}", turn.response));
        }
    }

    if !context.is_empty() {
        parts.push(format!("\nMeeting context: {context}"));
    }

    parts.push(format!("\nQuestion: {question}"));
    parts.push("\nResponse:".to_string());

    (parts.join("\n"), detected)
}
