#![forbid(unsafe_code)]

//! # deckprio
//!
//! Sorts a flashcard collection into four priority tiers with an LLM.
//!
//! Cards are grouped by their deck hierarchy (undersized subdecks fold into the
//! nearest parent deck so every prompt carries enough peers for relative
//! judgment), sent in small batches to OpenAI or Gemini together with a fixed
//! rubric, and the returned `{"ratings": [{"id", "prio"}]}` object is checked and
//! written back as a single `prio:N` tag per card.
//!
//! The pieces are usable on their own: [`text_normalize`], [`grouping`],
//! [`prompts`], [`gateway`] and [`rating`]. [`Prioritizer`] wires them into one
//! run over an [`ItemStore`] and a [`Presenter`].

pub mod config;
pub mod gateway;
pub mod grouping;
pub mod orchestrator;
pub mod prompts;
pub mod rating;
pub mod store;
pub mod text_normalize;
pub mod trace;
pub mod ui;

pub use config::{ActiveProvider, Config, ConfigError};
pub use gateway::{
    Attribution, ChatGateway, ChatModel, ProviderError, ProviderGateway, ProviderKind, UsageSink,
};
pub use grouping::{batches, group_by_hierarchy, Batcher, Group};
pub use orchestrator::{Prioritizer, RunError, RunOutcome, RunStats, RunSummary};
pub use prompts::{build_prompt, CardPayload, PromptInstance};
pub use rating::{apply_ratings, rate_batch, RatingEntry, RatingError, RatingResult};
pub use store::{Item, ItemId, ItemStore, MemoryItemStore, Priority, SqliteItemStore, StoreError};
pub use text_normalize::normalize;
pub use trace::{BatchTrace, JsonlTraceSink, TraceError, TraceSink, TraceWorker};
pub use ui::{
    Presenter, RunMode, RunOptions, ScriptedPresenter, TerminalOptions, TerminalPresenter,
};
