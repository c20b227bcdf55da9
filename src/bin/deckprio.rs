#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use deckprio::gateway::{ChatGateway, ProviderGateway, TracingUsageSink};
use deckprio::{
    ActiveProvider, Config, ConfigError, ItemStore, JsonlTraceSink, Prioritizer, RunMode,
    RunOutcome, SqliteItemStore, TerminalOptions, TerminalPresenter,
};

#[derive(Parser)]
#[command(name = "deckprio", version, about = "LLM batch prioritization for flashcard decks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rate every card of a deck (subdecks included) as prio:1 .. prio:4
    Prioritize {
        /// SQLite card store (default: $DECKPRIO_DB or ./deckprio.sqlite)
        #[arg(long)]
        db: Option<PathBuf>,

        /// TOML config file (default: $DECKPRIO_CONFIG, else built-in defaults)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Deck to prioritize instead of choosing interactively
        #[arg(long)]
        deck: Option<String>,

        /// Also re-rate cards that already carry a priority
        #[arg(long)]
        reprioritize_all: bool,

        /// Free-text focus added to every prompt
        #[arg(long)]
        focus: Option<String>,

        /// Do not ask for confirmation
        #[arg(long, short = 'y')]
        yes: bool,

        /// JSONL trace output, one line per batch
        #[arg(long)]
        trace: Option<PathBuf>,
    },
    /// List decks with their card counts (subdecks included)
    Decks {
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Import cards from a JSONL file ({"id", "path", "fields", "tags"} per line)
    Import {
        #[arg(long)]
        db: Option<PathBuf>,

        #[arg(long)]
        input: PathBuf,

        /// Remember this deck as the current one
        #[arg(long)]
        current: Option<String>,
    },
    /// Show the priority distribution of a deck
    Stats {
        #[arg(long)]
        db: Option<PathBuf>,

        #[arg(long)]
        deck: String,
    },
}

fn init_tracing() {
    // Logs go to stderr; stdout carries prompts and progress.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("deckprio=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

/// Load the config and resolve the credential before anything touches the network.
fn resolve_provider(path: Option<&Path>) -> Result<(Config, ActiveProvider), ConfigError> {
    let config = Config::load(path)?;
    let active = config.active_provider()?;
    Ok((config, active))
}

fn open_store(db: Option<PathBuf>) -> Result<SqliteItemStore, deckprio::StoreError> {
    SqliteItemStore::new(db.unwrap_or_else(SqliteItemStore::default_path))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Prioritize {
            db,
            config,
            deck,
            reprioritize_all,
            focus,
            yes,
            trace,
        } => {
            let (config, active) = match resolve_provider(config.as_deref()) {
                Ok(resolved) => resolved,
                Err(err) => {
                    eprintln!("deckprio: {err}");
                    std::process::exit(2);
                }
            };
            let gateway: Arc<dyn ChatGateway> = Arc::new(ProviderGateway::for_provider(
                active.kind,
                &active.api_key,
                active.base_url.as_deref(),
                config.timeout(),
                Arc::new(TracingUsageSink),
            )?);

            let store = Arc::new(open_store(db)?);
            let presenter = Arc::new(TerminalPresenter::stdio(TerminalOptions {
                deck,
                assume_yes: yes,
                mode: if reprioritize_all {
                    RunMode::ReprioritizeAll
                } else {
                    RunMode::SkipExisting
                },
                focus,
            }));

            let mut prioritizer = Prioritizer::new(store, presenter, gateway, config);
            let mut worker = None;
            if let Some(path) = trace {
                let (sink, w) = JsonlTraceSink::new(path)?;
                prioritizer = prioritizer.with_trace(Arc::new(sink));
                worker = Some(w);
            }

            let outcome = prioritizer.run().await;
            drop(prioritizer);
            if let Some(worker) = worker {
                worker.join()?;
            }

            match outcome {
                Ok(RunOutcome::Completed(summary)) => {
                    tracing::debug!(run_id = %summary.run_id, "run complete");
                }
                Ok(RunOutcome::Cancelled | RunOutcome::NoItems { .. }) => {}
                Err(err) => {
                    eprintln!("deckprio: {err}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Decks { db } => {
            let store = open_store(db)?;
            let direct = store.path_counts().await?;
            for path in store.list_collection_paths().await? {
                let prefix = format!("{path}::");
                let total: usize = direct
                    .iter()
                    .filter(|(p, _)| *p == path || p.starts_with(&prefix))
                    .map(|(_, n)| n)
                    .sum();
                println!("{path}\t{total}");
            }
        }
        Commands::Import { db, input, current } => {
            let store = open_store(db)?;
            let count = store.import_jsonl(&input).await?;
            if let Some(deck) = current {
                store.set_current_path(&deck).await?;
            }
            println!("imported {count} cards");
        }
        Commands::Stats { db, deck } => {
            let store = open_store(db)?;
            let counts = store.label_counts(&deck).await?;
            println!("{deck}: {} cards, {} unprioritized", counts.total, counts.unlabeled);
            for (prio, n) in &counts.by_priority {
                println!("  prio:{prio}\t{n}");
            }
        }
    }

    Ok(())
}
