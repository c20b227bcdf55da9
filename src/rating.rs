//! Batch rating: one model call per batch, then reconciliation of the reply
//! against the card store.
//!
//! The reply is untrusted. Parsing is lenient at the pair level: a pair whose
//! `id` or `prio` is not an integer is dropped on its own, and the rest of the
//! batch still applies. Anything that cannot be read as a JSON object at all
//! fails the whole batch.

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::gateway::{
    strip_code_fences, Attribution, ChatGateway, ChatModel, ChatRequest, ProviderError,
};
use crate::prompts::PromptInstance;
use crate::store::{ItemId, ItemStore, Priority};

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum RatingError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("unparseable rating reply: {0}")]
    Parse(String),
}

// =============================================================================
// Parsed reply
// =============================================================================

/// One `{id, prio}` pair as the model sent it. `None` means the value was
/// missing or not an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatingEntry {
    pub id: Option<ItemId>,
    pub prio: Option<i64>,
}

impl RatingEntry {
    pub fn new(id: ItemId, prio: i64) -> Self {
        Self {
            id: Some(id),
            prio: Some(prio),
        }
    }

    fn from_value(v: &Value) -> Self {
        Self {
            id: v.get("id").and_then(Value::as_i64),
            prio: v.get("prio").and_then(Value::as_i64),
        }
    }
}

/// Parsed model reply for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RatingResult {
    /// `None` when the reply had no (or a null) `ratings` key.
    pub ratings: Option<Vec<RatingEntry>>,
}

impl RatingResult {
    pub fn new(entries: impl IntoIterator<Item = RatingEntry>) -> Self {
        Self {
            ratings: Some(entries.into_iter().collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.ratings.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parse raw model text. Tolerates code fences and prose around the object.
    pub fn parse(raw: &str) -> Result<Self, RatingError> {
        let unfenced = strip_code_fences(raw);
        let json = extract_json(&unfenced);
        let value: Value = serde_json::from_str(json)
            .map_err(|e| RatingError::Parse(format!("invalid JSON: {e}")))?;

        let obj = value
            .as_object()
            .ok_or_else(|| RatingError::Parse("reply is not a JSON object".to_string()))?;

        let ratings = match obj.get("ratings") {
            None | Some(Value::Null) => None,
            Some(Value::Array(entries)) => {
                Some(entries.iter().map(RatingEntry::from_value).collect())
            }
            Some(other) => {
                return Err(RatingError::Parse(format!(
                    "`ratings` is not an array: {other}"
                )))
            }
        };

        Ok(Self { ratings })
    }
}

/// Extract a JSON object from LLM output that may contain surrounding prose.
pub fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();

    if trimmed.starts_with('{') {
        if let Some(end) = find_matching_brace(trimmed) {
            return &trimmed[..end];
        }
    }

    if let Some(start) = trimmed.find('{') {
        let remainder = &trimmed[start..];
        if let Some(end) = find_matching_brace(remainder) {
            return &remainder[..end];
        }
    }

    trimmed
}

/// Byte offset just past the brace closing the first `{`, ignoring braces
/// inside JSON strings.
fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in s.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

// =============================================================================
// Model call
// =============================================================================

/// Send one prompt and parse the reply.
pub async fn request_ratings(
    gateway: &dyn ChatGateway,
    model: &ChatModel,
    prompt: &PromptInstance,
    attribution: Attribution,
) -> Result<RatingResult, RatingError> {
    let req = ChatRequest::new(model.clone(), prompt.to_messages(), attribution).json();
    let resp = gateway.chat(req).await?;
    debug!(
        model = model.model_id(),
        input_tokens = resp.input_tokens,
        output_tokens = resp.output_tokens,
        latency_ms = resp.latency.as_millis() as u64,
        "rating reply received"
    );
    RatingResult::parse(&resp.content)
}

/// Like [`request_ratings`], but every failure collapses to `None` after a
/// warning. A failed batch never stops the run.
pub async fn rate_batch(
    gateway: &dyn ChatGateway,
    model: &ChatModel,
    prompt: &PromptInstance,
    attribution: Attribution,
) -> Option<RatingResult> {
    match request_ratings(gateway, model, prompt, attribution).await {
        Ok(result) => Some(result),
        Err(err) => {
            warn!(model = model.model_id(), error = %err, "batch rating failed");
            None
        }
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Apply parsed ratings to the store. Returns the number of cards updated.
///
/// Pairs with an out-of-range or non-integer priority are skipped silently.
/// Lookup and write failures are logged and skipped.
pub async fn apply_ratings(store: &dyn ItemStore, result: Option<&RatingResult>) -> usize {
    apply_ratings_scoped(store, result, None).await
}

/// [`apply_ratings`] restricted to the ids that were actually sent in the
/// batch. Ids outside `batch` are treated like unknown ids.
pub async fn apply_ratings_for_batch(
    store: &dyn ItemStore,
    result: Option<&RatingResult>,
    batch: &[ItemId],
) -> usize {
    apply_ratings_scoped(store, result, Some(batch)).await
}

async fn apply_ratings_scoped(
    store: &dyn ItemStore,
    result: Option<&RatingResult>,
    batch: Option<&[ItemId]>,
) -> usize {
    let Some(entries) = result.and_then(|r| r.ratings.as_ref()) else {
        return 0;
    };

    let mut applied = 0;
    for entry in entries {
        let Some(priority) = entry.prio.and_then(Priority::from_value) else {
            debug!(?entry, "ignoring rating with invalid priority");
            continue;
        };
        let Some(id) = entry.id else {
            debug!(?entry, "ignoring rating without integer id");
            continue;
        };
        if batch.is_some_and(|ids| !ids.contains(&id)) {
            warn!(id, "model rated a card that was not in the batch");
            continue;
        }

        let mut item = match store.get_item(id).await {
            Ok(item) => item,
            Err(err) => {
                warn!(id, error = %err, "could not load rated card");
                continue;
            }
        };
        item.set_priority(priority);
        if let Err(err) = store.update_item(&item).await {
            warn!(id, error = %err, "could not save rated card");
            continue;
        }
        applied += 1;
    }
    applied
}

// =============================================================================
// TESTS
// =============================================================================
