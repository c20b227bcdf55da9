//! User-facing collaborators of a run: deck selection, run options, progress.
//!
//! The orchestrator only sees [`Presenter`]. [`TerminalPresenter`] drives a
//! line-oriented terminal (or runs unattended from CLI flags);
//! [`ScriptedPresenter`] answers from a script and records every call.

use std::io::{self, BufRead, BufReader, Stdin, Stdout, Write};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

// =============================================================================
// Types
// =============================================================================

/// Whether cards that already carry a priority are sent again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    SkipExisting,
    ReprioritizeAll,
}

/// Answers collected before a run starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub mode: RunMode,
    /// Free-text focus added to every prompt; blank means none.
    pub focus: Option<String>,
}

impl RunOptions {
    pub fn skip_existing(&self) -> bool {
        self.mode == RunMode::SkipExisting
    }

    /// Trimmed focus text, if any.
    pub fn focus(&self) -> Option<&str> {
        self.focus.as_deref().map(str::trim).filter(|f| !f.is_empty())
    }
}

/// What the user is shown before confirming a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionSummary {
    pub path: String,
    pub display_name: String,
    pub total: usize,
    pub labeled: usize,
    pub provider: &'static str,
    pub model: String,
}

#[derive(Debug, Error)]
pub enum UiError {
    #[error("terminal io error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Message(String),
}

/// Progress label shown while a run walks its cards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase<'a> {
    Skipping,
    Calling(&'a str),
    Finishing,
}

/// `Progress: N% | <phase>`; the percentage is floored.
pub fn progress_label(seen: usize, total: usize, phase: ProgressPhase<'_>) -> String {
    let percent = if total == 0 { 100 } else { seen * 100 / total };
    match phase {
        ProgressPhase::Skipping => format!("Progress: {percent}% | Skipping..."),
        ProgressPhase::Calling(provider) => {
            format!("Progress: {percent}% | Calling {provider}...")
        }
        ProgressPhase::Finishing => format!("Progress: {percent}% | Finishing..."),
    }
}

// =============================================================================
// Presenter trait
// =============================================================================

/// Everything the run needs from its host UI.
///
/// Selection and options return `None` when the user backs out. Progress and
/// view calls are advisory: the run logs their errors and carries on.
pub trait Presenter: Send + Sync {
    /// Pick a collection path from `paths` (sorted), preselecting `current`.
    fn choose_path(&self, paths: &[String], current: Option<&str>) -> Option<String>;

    fn confirm_options(&self, summary: &CollectionSummary) -> Option<RunOptions>;

    fn progress_start(&self, max: usize, label: &str) -> Result<(), UiError>;

    fn progress_update(&self, value: usize, label: &str) -> Result<(), UiError>;

    fn progress_finish(&self) -> Result<(), UiError>;

    /// Ask the host to redraw whatever shows card state.
    fn refresh_view(&self) -> Result<(), UiError>;

    fn show_info(&self, message: &str);

    fn show_error(&self, message: &str);
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Terminal presenter
// =============================================================================

/// Answers that let the terminal presenter run without prompting.
#[derive(Debug, Clone, Default)]
pub struct TerminalOptions {
    /// Deck to use instead of asking.
    pub deck: Option<String>,
    /// Skip every confirmation and use `mode` / `focus` as given.
    pub assume_yes: bool,
    pub mode: RunMode,
    pub focus: Option<String>,
}

pub struct TerminalPresenter<R, W> {
    input: Mutex<R>,
    output: Mutex<W>,
    options: TerminalOptions,
}

impl TerminalPresenter<BufReader<Stdin>, Stdout> {
    pub fn stdio(options: TerminalOptions) -> Self {
        Self::new(BufReader::new(io::stdin()), io::stdout(), options)
    }
}

impl<R, W> TerminalPresenter<R, W>
where
    R: BufRead + Send,
    W: Write + Send,
{
    pub fn new(input: R, output: W, options: TerminalOptions) -> Self {
        Self {
            input: Mutex::new(input),
            output: Mutex::new(output),
            options,
        }
    }

    /// Hand back the writer, e.g. to inspect what a test run printed.
    pub fn into_output(self) -> W {
        self.output
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self, text: &str) -> io::Result<()> {
        let mut out = lock(&self.output);
        out.write_all(text.as_bytes())?;
        out.flush()
    }

    /// Print `prompt` and read one trimmed line. `None` on EOF.
    fn ask(&self, prompt: &str) -> io::Result<Option<String>> {
        self.write(prompt)?;
        let mut line = String::new();
        let read = lock(&self.input).read_line(&mut line)?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }

    fn choose_interactively(
        &self,
        paths: &[String],
        current: Option<&str>,
    ) -> io::Result<Option<String>> {
        let default_index = current.and_then(|c| paths.iter().position(|p| p == c));

        let mut listing = String::from("Prioritize which deck? (subdecks included)\n");
        for (i, path) in paths.iter().enumerate() {
            let marker = if Some(i) == default_index { "*" } else { " " };
            listing.push_str(&format!("{marker}{:>3}. {path}\n", i + 1));
        }
        self.write(&listing)?;

        loop {
            let prompt = match default_index {
                Some(i) => format!("Deck number or name [{}]: ", i + 1),
                None => "Deck number or name: ".to_string(),
            };
            let Some(answer) = self.ask(&prompt)? else {
                return Ok(None);
            };
            if answer.is_empty() {
                match default_index {
                    Some(i) => return Ok(Some(paths[i].clone())),
                    None => return Ok(None),
                }
            }
            if let Ok(n) = answer.parse::<usize>() {
                if (1..=paths.len()).contains(&n) {
                    return Ok(Some(paths[n - 1].clone()));
                }
            } else if paths.iter().any(|p| *p == answer) {
                return Ok(Some(answer));
            }
            self.write(&format!("No deck matches '{answer}'.\n"))?;
        }
    }

    fn confirm_interactively(&self) -> io::Result<Option<RunOptions>> {
        let Some(mode) = self.ask("Re-prioritize cards that already have a priority? [y/N]: ")?
        else {
            return Ok(None);
        };
        let mode = if matches!(mode.to_lowercase().as_str(), "y" | "yes") {
            RunMode::ReprioritizeAll
        } else {
            RunMode::SkipExisting
        };

        let Some(focus) = self.ask("Focus for the model (optional, Enter to skip): ")? else {
            return Ok(None);
        };

        let Some(go) = self.ask("Start? [Y/n]: ")? else {
            return Ok(None);
        };
        if matches!(go.to_lowercase().as_str(), "n" | "no") {
            return Ok(None);
        }

        Ok(Some(RunOptions {
            mode,
            focus: (!focus.is_empty()).then_some(focus),
        }))
    }
}

impl<R, W> Presenter for TerminalPresenter<R, W>
where
    R: BufRead + Send,
    W: Write + Send,
{
    fn choose_path(&self, paths: &[String], current: Option<&str>) -> Option<String> {
        if paths.is_empty() {
            self.show_info("No decks found.");
            return None;
        }

        if let Some(deck) = &self.options.deck {
            if paths.iter().any(|p| p == deck) {
                return Some(deck.clone());
            }
            self.show_error(&format!("Deck '{deck}' not found."));
            return None;
        }

        if self.options.assume_yes {
            let chosen = current.filter(|c| paths.iter().any(|p| p == c));
            if chosen.is_none() {
                self.show_error("No current deck; pass --deck to choose one.");
            }
            return chosen.map(str::to_string);
        }

        match self.choose_interactively(paths, current) {
            Ok(choice) => choice,
            Err(err) => {
                warn!(error = %err, "deck selection failed");
                None
            }
        }
    }

    fn confirm_options(&self, summary: &CollectionSummary) -> Option<RunOptions> {
        let header = format!(
            "Found {} cards in '{}'.\n{} cards already have priority tags.\nUsing {} ({}).\n",
            summary.total, summary.display_name, summary.labeled, summary.provider, summary.model
        );
        if let Err(err) = self.write(&header) {
            warn!(error = %err, "could not print run summary");
        }

        if self.options.assume_yes {
            return Some(RunOptions {
                mode: self.options.mode,
                focus: self.options.focus.clone(),
            });
        }

        match self.confirm_interactively() {
            Ok(options) => options,
            Err(err) => {
                warn!(error = %err, "option dialog failed");
                None
            }
        }
    }

    fn progress_start(&self, max: usize, label: &str) -> Result<(), UiError> {
        self.write(&format!("{label} (0/{max})\n"))?;
        Ok(())
    }

    fn progress_update(&self, value: usize, label: &str) -> Result<(), UiError> {
        self.write(&format!("\r{label} [{value}]\x1b[K"))?;
        Ok(())
    }

    fn progress_finish(&self) -> Result<(), UiError> {
        self.write("\n")?;
        Ok(())
    }

    fn refresh_view(&self) -> Result<(), UiError> {
        Ok(())
    }

    fn show_info(&self, message: &str) {
        if let Err(err) = self.write(&format!("{message}\n")) {
            warn!(error = %err, "could not print message");
        }
    }

    fn show_error(&self, message: &str) {
        if let Err(err) = self.write(&format!("Error: {message}\n")) {
            warn!(error = %err, "could not print error");
        }
    }
}

// =============================================================================
// Scripted presenter
// =============================================================================

/// One recorded presenter call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    ChoosePath {
        offered: Vec<String>,
        current: Option<String>,
    },
    ConfirmOptions(CollectionSummary),
    ProgressStart(usize),
    ProgressUpdate { value: usize, label: String },
    ProgressFinish,
    RefreshView,
    Info(String),
    Error(String),
}

#[derive(Debug, Clone)]
enum PathAnswer {
    Current,
    Fixed(String),
    Cancel,
}

/// Presenter with canned answers. Accepts the current path and default options
/// unless told otherwise.
#[derive(Debug)]
pub struct ScriptedPresenter {
    path: PathAnswer,
    options: Option<RunOptions>,
    fail_progress: bool,
    events: Mutex<Vec<UiEvent>>,
}

impl Default for ScriptedPresenter {
    fn default() -> Self {
        Self {
            path: PathAnswer::Current,
            options: Some(RunOptions::default()),
            fail_progress: false,
            events: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn choose(mut self, path: impl Into<String>) -> Self {
        self.path = PathAnswer::Fixed(path.into());
        self
    }

    pub fn cancel_selection(mut self) -> Self {
        self.path = PathAnswer::Cancel;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn cancel_options(mut self) -> Self {
        self.options = None;
        self
    }

    /// Make every progress call return an error.
    pub fn failing_progress(mut self) -> Self {
        self.fail_progress = true;
        self
    }

    pub fn events(&self) -> Vec<UiEvent> {
        lock(&self.events).clone()
    }

    /// Labels of all progress updates, in order.
    pub fn progress_labels(&self) -> Vec<String> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                UiEvent::ProgressUpdate { label, .. } => Some(label.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn infos(&self) -> Vec<String> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                UiEvent::Info(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                UiEvent::Error(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: UiEvent) {
        lock(&self.events).push(event);
    }

    fn progress_result(&self) -> Result<(), UiError> {
        if self.fail_progress {
            Err(UiError::Message("progress widget unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Presenter for ScriptedPresenter {
    fn choose_path(&self, paths: &[String], current: Option<&str>) -> Option<String> {
        self.push(UiEvent::ChoosePath {
            offered: paths.to_vec(),
            current: current.map(str::to_string),
        });
        match &self.path {
            PathAnswer::Current => current.map(str::to_string),
            PathAnswer::Fixed(p) => Some(p.clone()),
            PathAnswer::Cancel => None,
        }
    }

    fn confirm_options(&self, summary: &CollectionSummary) -> Option<RunOptions> {
        self.push(UiEvent::ConfirmOptions(summary.clone()));
        self.options.clone()
    }

    fn progress_start(&self, max: usize, _label: &str) -> Result<(), UiError> {
        self.push(UiEvent::ProgressStart(max));
        self.progress_result()
    }

    fn progress_update(&self, value: usize, label: &str) -> Result<(), UiError> {
        self.push(UiEvent::ProgressUpdate {
            value,
            label: label.to_string(),
        });
        self.progress_result()
    }

    fn progress_finish(&self) -> Result<(), UiError> {
        self.push(UiEvent::ProgressFinish);
        self.progress_result()
    }

    fn refresh_view(&self) -> Result<(), UiError> {
        self.push(UiEvent::RefreshView);
        Ok(())
    }

    fn show_info(&self, message: &str) {
        self.push(UiEvent::Info(message.to_string()));
    }

    fn show_error(&self, message: &str) {
        self.push(UiEvent::Error(message.to_string()));
    }
}

// =============================================================================
// TESTS
// =============================================================================
