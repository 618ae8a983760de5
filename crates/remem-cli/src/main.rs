mod embed;
mod train;

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use remem_core::{CancelFlag, Signal};
use remem_store::{CellStore, Config, Memory, RecallOutcome};
use tracing_subscriber::EnvFilter;

use crate::embed::Embedder;
use crate::train::RecordOutcome;

#[derive(Parser)]
#[command(name = "remem", about = "Learn and recall texts stored as per-cell neural models")]
struct Cli {
    /// Config file (TOML); defaults to $REM_CONFIG if set
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cell directory, overriding config and $REM_CELLS_DIR
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Memorize a text under a set of keywords
    Learn {
        /// Text to memorize
        text: String,

        /// Keyword to key the memory by (repeatable)
        #[arg(short, long = "keyword", required = true)]
        keywords: Vec<String>,

        /// Override the configured epoch cap
        #[arg(long)]
        max_epochs: Option<usize>,

        /// Print the learn report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Find the closest memory and reconstruct its text
    Recall {
        /// Query; read from stdin when omitted
        query: Option<String>,

        /// Number of ranked cells to show
        #[arg(long, default_value_t = 3)]
        top_k: usize,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Learn every record of a JSON dataset in parallel
    Train {
        /// Dataset file; defaults to the first *.json in ./data
        dataset: Option<PathBuf>,

        /// Worker threads (defaults to available parallelism)
        #[arg(long)]
        jobs: Option<usize>,

        /// Override the configured epoch cap
        #[arg(long)]
        max_epochs: Option<usize>,
    },

    /// Show store statistics
    Stats,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("failed to load config")?;
    if let Some(root) = &cli.root {
        config.store.root = root.clone();
    }
    Ok(config)
}

fn open_memory(config: &Config, max_epochs: Option<usize>) -> Result<Memory> {
    let store = CellStore::open(&config.store.root)
        .with_context(|| format!("failed to open store {}", config.store.root.display()))?;
    let mut fit = config.fit.to_fit_config();
    if let Some(max_epochs) = max_epochs {
        anyhow::ensure!(max_epochs > 0, "--max-epochs must be at least 1");
        fit.max_epochs = max_epochs;
    }
    let embedder = Arc::new(Embedder::from_section(&config.embedding));
    Ok(Memory::new(store, embedder, fit))
}

/// `--verbose` wins, then a parsable `RUST_LOG`, then `warn`.
fn log_filter(verbose: bool, rust_log: Option<&str>) -> EnvFilter {
    if verbose {
        return EnvFilter::new("debug");
    }
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("warn"))
}

fn init_tracing(verbose: bool) {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbose, rust_log.as_deref()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

/// Ctrl-C sets the flag; in-flight fits stop at the next epoch.
fn install_cancel_handler() -> CancelFlag {
    let cancel = CancelFlag::new();
    let handle = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handle.cancel()) {
        tracing::warn!("failed to set Ctrl+C handler: {e}");
    }
    cancel
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(&cli)?;

    match &cli.command {
        Commands::Learn {
            text,
            keywords,
            max_epochs,
            json,
        } => cmd_learn(&config, text, keywords, *max_epochs, *json),
        Commands::Recall { query, top_k, json } => {
            cmd_recall(&config, query.as_deref(), *top_k, *json)
        }
        Commands::Train {
            dataset,
            jobs,
            max_epochs,
        } => cmd_train(&config, dataset.as_deref(), *jobs, *max_epochs),
        Commands::Stats => cmd_stats(&config, cli.verbose),
    }
}

fn cmd_learn(
    config: &Config,
    text: &str,
    keywords: &[String],
    max_epochs: Option<usize>,
    json: bool,
) -> Result<()> {
    let memory = open_memory(config, max_epochs)?;
    let cancel = install_cancel_handler();
    let report = memory
        .learn_with_cancel(&Signal::Keywords(keywords.to_vec()), text, &cancel)
        .context("failed to learn")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "learned {}: {} tokens, {} epochs, final loss {:.6e}{}",
            report.cell_id,
            report.tokens_len,
            report.epochs,
            report.final_loss,
            if report.reached_target {
                ""
            } else {
                " (target not reached)"
            }
        );
    }
    Ok(())
}

fn read_query() -> Result<String> {
    print!("query: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read query")?;
    Ok(line.trim().to_string())
}

fn cmd_recall(config: &Config, query: Option<&str>, top_k: usize, json: bool) -> Result<()> {
    let query = match query {
        Some(q) => q.trim().to_string(),
        None => read_query()?,
    };
    if query.is_empty() {
        println!("empty query, nothing to recall");
        return Ok(());
    }

    let memory = open_memory(config, None)?;
    let outcome = memory.recall(&query, top_k).context("failed to recall")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    let result = match outcome {
        RecallOutcome::NoMatch => {
            println!("no memory found");
            return Ok(());
        }
        RecallOutcome::Match(result) => result,
    };
    println!("best match: {}", result.top_cell.cell_id);
    println!("similarity: {:.4}", result.top_cell.score);
    println!("text:       {}", result.top_cell.display_text());
    println!("distribution:");
    for ranked in &result.distribution {
        println!("  {}  {:.4}", ranked.cell_id, ranked.score);
    }
    Ok(())
}

fn cmd_train(
    config: &Config,
    dataset: Option<&Path>,
    jobs: Option<usize>,
    max_epochs: Option<usize>,
) -> Result<()> {
    let path = match dataset {
        Some(path) => path.to_path_buf(),
        None => train::default_dataset(Path::new("data"))?,
    };
    let records = train::load_dataset(&path)?;
    let jobs = jobs
        .filter(|&j| j > 0)
        .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
        .unwrap_or(1);

    let memory = open_memory(config, max_epochs)?;
    let cancel = install_cancel_handler();
    println!(
        "training {} records from {} on {jobs} threads",
        records.len(),
        path.display()
    );

    let (outcomes, summary) = train::train(&memory, &records, jobs, &cancel)?;
    for (index, outcome) in outcomes.iter().enumerate() {
        match outcome {
            RecordOutcome::Learned(report) => println!(
                "[{index}] ok      {} ({} epochs, loss {:.6e})",
                report.cell_id, report.epochs, report.final_loss
            ),
            RecordOutcome::Skipped(why) => println!("[{index}] skipped {why}"),
            RecordOutcome::Failed(why) => println!("[{index}] failed  {why}"),
        }
    }
    println!(
        "trained: {}, target reached: {}, skipped: {}, failed: {}",
        summary.trained, summary.reached_target, summary.skipped, summary.failed
    );
    Ok(())
}

fn cmd_stats(config: &Config, verbose: bool) -> Result<()> {
    let store = CellStore::open(&config.store.root).context("failed to open store")?;
    let ids = store.cell_ids().context("failed to list cells")?;

    println!("root:   {}", store.root().display());
    println!("cells:  {}", ids.len());
    if verbose {
        for id in ids {
            match store.load_config(id) {
                Ok(c) => println!(
                    "  {id}  {}→{}→{}  epochs {}/{}  loss {:.6e}{}",
                    c.input_dim,
                    c.hidden_dim,
                    c.output_dim,
                    c.actual_epochs,
                    c.epochs,
                    c.final_loss,
                    if c.reached_target() { "" } else { "  (target not reached)" }
                ),
                Err(e) => println!("  {id}  unreadable: {e}"),
            }
        }
    }
    Ok(())
}
