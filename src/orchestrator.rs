//! The prioritization run: pick a deck, confirm options, walk its cards group by
//! group, rate them in batches, report.
//!
//! States run strictly in order: Init, Configuring, Running, Finalizing, Done.
//! Batches are dispatched one at a time and each batch's writes land before the
//! next batch is built, so an interrupted run keeps everything applied so far.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{ActiveProvider, Config, ConfigError};
use crate::gateway::{Attribution, ChatGateway};
use crate::grouping::{group_by_hierarchy, Batcher, Group};
use crate::prompts::{CardPayload, PromptTemplate, DEFAULT_PROMPT};
use crate::rating::{apply_ratings_for_batch, rate_batch};
use crate::store::{ItemId, ItemStore, StoreError};
use crate::trace::{now_epoch_ms, prompt_hash, BatchTrace, TraceSink};
use crate::ui::{progress_label, CollectionSummary, Presenter, ProgressPhase, RunOptions};

const CALLER: &str = "orchestrator::batch";

/// Trace `error` for a batch whose call or reply failed; details are in the log.
const FAILED_BATCH: &str = "no ratings: call or reply failed";

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Configuring,
    Running,
    Finalizing,
    Done,
}

/// Counters accumulated while a run walks its cards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub seen: usize,
    pub prioritized: usize,
    pub skipped: usize,
    pub batches_dispatched: usize,
    pub batches_failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub path: String,
    /// Human-readable provider name, e.g. "OpenAI".
    pub provider: &'static str,
    pub model: String,
    pub stats: RunStats,
    pub elapsed_ms: u64,
}

impl RunSummary {
    /// Final message shown to the user.
    pub fn message(&self) -> String {
        format!(
            "Done using {} ({})!\n{} prioritized.\n{} skipped.",
            self.provider, self.model, self.stats.prioritized, self.stats.skipped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// User backed out of a dialog; nothing was touched.
    Cancelled,
    /// The chosen deck holds no cards.
    NoItems { path: String },
    Completed(RunSummary),
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

// =============================================================================
// Prioritizer
// =============================================================================

/// One prioritization run over injected collaborators.
pub struct Prioritizer {
    store: Arc<dyn ItemStore>,
    presenter: Arc<dyn Presenter>,
    gateway: Arc<dyn ChatGateway>,
    config: Config,
    prompt: PromptTemplate,
    trace: Option<Arc<dyn TraceSink>>,
}

/// Calls `progress_finish` and `refresh_view` however the running phase ends,
/// including on panic or when the run future is dropped.
struct FinalizeGuard<'a> {
    presenter: &'a dyn Presenter,
}

impl Drop for FinalizeGuard<'_> {
    fn drop(&mut self) {
        debug!(state = ?RunState::Finalizing, "run state");
        if let Err(err) = self.presenter.progress_finish() {
            warn!(error = %err, "progress finish failed");
        }
        if let Err(err) = self.presenter.refresh_view() {
            warn!(error = %err, "view refresh failed");
        }
    }
}

/// Per-run values fixed once Configuring is over.
struct RunContext<'a> {
    run_id: Uuid,
    provider: &'a ActiveProvider,
    options: &'a RunOptions,
    total: usize,
}

impl Prioritizer {
    pub fn new(
        store: Arc<dyn ItemStore>,
        presenter: Arc<dyn Presenter>,
        gateway: Arc<dyn ChatGateway>,
        config: Config,
    ) -> Self {
        Self {
            store,
            presenter,
            gateway,
            config,
            prompt: DEFAULT_PROMPT,
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn with_prompt(mut self, prompt: PromptTemplate) -> Self {
        self.prompt = prompt;
        self
    }

    /// Run the whole state machine. Only configuration and whole-collection
    /// store failures surface as errors; per-batch failures only lower counts.
    pub async fn run(&self) -> Result<RunOutcome, RunError> {
        let started = Instant::now();

        // Init
        debug!(state = ?RunState::Init, "run state");
        let mut paths = self.store.list_collection_paths().await?;
        paths.sort();
        paths.dedup();
        let current = self.store.current_path().await?;
        let Some(path) = self.presenter.choose_path(&paths, current.as_deref()) else {
            info!("no deck chosen, nothing to do");
            return Ok(RunOutcome::Cancelled);
        };

        let provider = match self
            .config
            .validate()
            .and_then(|_| self.config.active_provider())
        {
            Ok(p) => p,
            Err(err) => {
                self.presenter.show_error(&err.to_string());
                return Err(err.into());
            }
        };

        // Configuring
        debug!(state = ?RunState::Configuring, "run state");
        let ids = self.store.find_items_by_path(&path).await?;
        if ids.is_empty() {
            self.presenter.show_info("No cards found.");
            return Ok(RunOutcome::NoItems { path });
        }

        let labeled = self.count_labeled(&ids).await;
        let summary = CollectionSummary {
            display_name: self.store.path_display_name(&path),
            path: path.clone(),
            total: ids.len(),
            labeled,
            provider: provider.kind.label(),
            model: provider.model.model_id().to_string(),
        };
        let Some(options) = self.presenter.confirm_options(&summary) else {
            info!(path = %path, "run cancelled at options");
            return Ok(RunOutcome::Cancelled);
        };

        // Running
        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            path = %path,
            cards = ids.len(),
            labeled,
            mode = ?options.mode,
            provider = provider.kind.as_str(),
            model = provider.model.model_id(),
            "starting prioritization run"
        );
        let ctx = RunContext {
            run_id,
            provider: &provider,
            options: &options,
            total: ids.len(),
        };
        let stats = {
            let _finalize = FinalizeGuard {
                presenter: self.presenter.as_ref(),
            };
            self.run_groups(&ctx, &path, &ids).await
        };

        // Done
        debug!(state = ?RunState::Done, "run state");
        let summary = RunSummary {
            run_id,
            path,
            provider: provider.kind.label(),
            model: provider.model.model_id().to_string(),
            stats,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            %run_id,
            seen = stats.seen,
            prioritized = stats.prioritized,
            skipped = stats.skipped,
            batches = stats.batches_dispatched,
            failed_batches = stats.batches_failed,
            elapsed_ms = summary.elapsed_ms,
            "prioritization run finished"
        );
        self.presenter.show_info(&summary.message());
        Ok(RunOutcome::Completed(summary))
    }

    async fn count_labeled(&self, ids: &[ItemId]) -> usize {
        let mut labeled = 0;
        for &id in ids {
            match self.store.get_item(id).await {
                Ok(item) if item.has_priority() => labeled += 1,
                Ok(_) => {}
                Err(err) => warn!(id, error = %err, "could not load card while counting"),
            }
        }
        labeled
    }

    async fn run_groups(&self, ctx: &RunContext<'_>, root: &str, ids: &[ItemId]) -> RunStats {
        debug!(state = ?RunState::Running, "run state");
        let mut stats = RunStats::default();
        self.progress_start(ctx.total);

        let mut located = Vec::with_capacity(ids.len());
        for &id in ids {
            let path = match self.store.item_path(id).await {
                Ok(p) => p,
                Err(err) => {
                    warn!(id, error = %err, "card path lookup failed, grouping under deck root");
                    root.to_string()
                }
            };
            located.push((id, path));
        }

        let groups = group_by_hierarchy(&located, self.config.min_context_size);
        info!(groups = groups.len(), "cards grouped");

        for group in &groups {
            self.run_group(ctx, group, &mut stats).await;
        }
        stats
    }

    async fn run_group(&self, ctx: &RunContext<'_>, group: &Group, stats: &mut RunStats) {
        let group_name = self.store.path_display_name(&group.key);
        debug!(group = %group.key, cards = group.len(), "processing group");

        let mut batcher = Batcher::new(self.config.batch_size);
        let mut batch_index = 0;
        let calling = ProgressPhase::Calling(ctx.provider.kind.label());

        for &id in &group.item_ids {
            stats.seen += 1;
            let item = match self.store.get_item(id).await {
                Ok(item) => item,
                Err(err) => {
                    warn!(id, error = %err, "could not load card, leaving it out");
                    continue;
                }
            };

            if ctx.options.skip_existing() && item.has_priority() {
                stats.skipped += 1;
                self.progress(
                    stats.seen,
                    progress_label(stats.seen, ctx.total, ProgressPhase::Skipping),
                );
                continue;
            }

            if let Some(batch) = batcher.push(CardPayload::from_item(&item)) {
                self.progress(stats.seen, progress_label(stats.seen, ctx.total, calling));
                self.dispatch(ctx, group, &group_name, batch_index, &batch, stats)
                    .await;
                batch_index += 1;
            }
        }

        if let Some(batch) = batcher.flush() {
            self.progress(
                stats.seen,
                progress_label(stats.seen, ctx.total, ProgressPhase::Finishing),
            );
            self.dispatch(ctx, group, &group_name, batch_index, &batch, stats)
                .await;
        }
    }

    async fn dispatch(
        &self,
        ctx: &RunContext<'_>,
        group: &Group,
        group_name: &str,
        batch_index: usize,
        batch: &[CardPayload],
        stats: &mut RunStats,
    ) {
        let ids: Vec<ItemId> = batch.iter().map(|c| c.id).collect();
        let prompt = self.prompt.render(
            group_name,
            ctx.options.focus(),
            batch,
            self.config.max_field_chars,
        );
        debug!(
            group = %group.key,
            batch_index,
            cards = ids.len(),
            "dispatching batch"
        );

        let attribution = Attribution::new(CALLER).with_run(ctx.run_id);
        let result = rate_batch(
            self.gateway.as_ref(),
            &ctx.provider.model,
            &prompt,
            attribution,
        )
        .instrument(info_span!("batch", group = %group.key, batch_index))
        .await;
        let error = result.is_none().then(|| FAILED_BATCH.to_string());

        let applied = apply_ratings_for_batch(self.store.as_ref(), result.as_ref(), &ids).await;
        stats.batches_dispatched += 1;
        if result.is_none() {
            stats.batches_failed += 1;
        }
        stats.prioritized += applied;

        if let Some(trace) = &self.trace {
            let event = BatchTrace {
                timestamp_ms: now_epoch_ms(),
                run_id: ctx.run_id.to_string(),
                group: group.key.clone(),
                batch_index,
                item_ids: ids,
                prompt_template_slug: prompt.template_slug.clone(),
                system_prompt_hash: prompt_hash(&prompt.system),
                provider: ctx.provider.kind.as_str().to_string(),
                model: ctx.provider.model.model_id().to_string(),
                returned: result.as_ref().map(|r| r.len()),
                applied,
                error,
            };
            if let Err(err) = trace.record(event) {
                warn!(error = %err, "trace record failed");
            }
        }

        tokio::task::yield_now().await;
    }

    fn progress_start(&self, max: usize) {
        if let Err(err) = self.presenter.progress_start(max, "Initializing...") {
            warn!(error = %err, "progress start failed");
        }
    }

    fn progress(&self, value: usize, label: String) {
        if let Err(err) = self.presenter.progress_update(value, &label) {
            warn!(error = %err, "progress update failed");
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
