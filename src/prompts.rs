//! Prompt templates for batch card prioritization.
//!
//! Domain logic for rendering rating prompts. Provider-agnostic: the gateway
//! decides how system and user text are framed on the wire.

use serde::Serialize;

use crate::gateway::Message;
use crate::store::{Item, ItemId};
use crate::text_normalize::{normalize, truncate_field, DEFAULT_MAX_FIELD_CHARS};

// =============================================================================
// Card representation
// =============================================================================

/// Plain-text view of one card as sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardPayload {
    pub id: ItemId,
    pub question: String,
    pub answer: String,
}

impl CardPayload {
    pub fn new(id: ItemId, question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            id,
            question: question.into(),
            answer: answer.into(),
        }
    }

    /// Normalized question/answer fields of a stored card.
    pub fn from_item(item: &Item) -> Self {
        Self {
            id: item.id,
            question: normalize(item.question()),
            answer: normalize(item.answer()),
        }
    }
}

// =============================================================================
// Prompt templates
// =============================================================================

/// Rendered prompt ready for LLM.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: String,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// A system prompt template with `{group_name}` and `{focus}` placeholders.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
}

impl PromptTemplate {
    pub fn render(
        &self,
        group_name: &str,
        focus: Option<&str>,
        cards: &[CardPayload],
        max_field_chars: usize,
    ) -> PromptInstance {
        let focus_block = match focus.map(str::trim).filter(|f| !f.is_empty()) {
            Some(f) => format!("\nUSER FOCUS: {f}\n"),
            None => String::new(),
        };

        let system = self
            .system
            .replace("{group_name}", group_name)
            .replace("{focus}", &focus_block);

        PromptInstance {
            template_slug: self.slug.to_string(),
            system: system.trim().to_string(),
            user: render_cards(cards, max_field_chars),
        }
    }
}

/// One `ID: .. | Q: .. | A: ..` line per card, in batch order.
pub fn render_cards(cards: &[CardPayload], max_field_chars: usize) -> String {
    cards
        .iter()
        .map(|c| {
            format!(
                "ID: {} | Q: {} | A: {}",
                c.id,
                truncate_field(&c.question, max_field_chars),
                truncate_field(&c.answer, max_field_chars)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// =============================================================================
// Standard prompts
// =============================================================================

pub const RATING_PROMPT_V1: PromptTemplate = PromptTemplate {
    slug: "prio_rubric_v1",
    system: r#"You are a strict teacher for: '{group_name}'.
{focus}
Task: Prioritize these flashcards RELATIVE to each other.
Priorities (1-4):
1 (HIGH): Foundational concepts, exam-critical.
2 (MEDIUM): Standard, applied knowledge and important details.
3 (LOW): Niche, rarely tested, "nice to know".
4 (UNNECESSARY): Redundant or trivia.

Target distribution (a guide, not a quota): 15% Prio 1, 40% Prio 2, 30% Prio 3, 15% Prio 4.

Reply ONLY with one valid JSON object and nothing else (no prose, no markdown fences):
{"ratings": [{"id": 123456, "prio": 1}, {"id": 234567, "prio": 4}]}"#,
};

pub const DEFAULT_PROMPT: PromptTemplate = RATING_PROMPT_V1;

/// Render the default rubric prompt for one batch.
pub fn build_prompt(cards: &[CardPayload], group_name: &str, focus: Option<&str>) -> PromptInstance {
    DEFAULT_PROMPT.render(group_name, focus, cards, DEFAULT_MAX_FIELD_CHARS)
}

// =============================================================================
// TESTS
// =============================================================================
