//! peruse CLI - resumable paper analysis.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use peruse::checkpoint::{self, ConsistencyReport, SubjectLock, identity, retention};
use peruse::models::LoggingConfig;
use peruse::{Config, LlmClient, LlmExecutor, Planner, ResumeRequest, ResumeSource, SnapshotStore, source};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "peruse")]
#[command(version)]
#[command(about = "Resumable multi-stage paper analysis over OpenAI-compatible endpoints")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a paper, optionally resuming an earlier run
    Run {
        /// Path to the paper
        paper: PathBuf,

        /// Resume from the newest snapshot of this paper
        #[arg(long, conflicts_with = "checkpoint")]
        resume: bool,

        /// Resume from a specific snapshot file
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Resume even if the snapshot no longer matches the input or config
        #[arg(long)]
        force: bool,

        /// Directory for the final report (overrides config)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// List snapshots recorded for a paper
    List {
        /// Path to the paper
        paper: PathBuf,
    },

    /// Apply the retention policy to the snapshot store
    Cleanup {
        /// Show what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete every snapshot in the store
    Reset {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool, logging: &LoggingConfig) -> Result<()> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact();

    let result = match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing::subscriber::set_global_default(
                builder.with_ansi(false).with_writer(Mutex::new(file)).finish(),
            )
        }
        None => tracing::subscriber::set_global_default(builder.with_writer(io::stderr).finish()),
    };
    result.context("Failed to set subscriber")
}

fn load_config(path: &Path) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load config from {}", path.display()))
}

/// Ask a yes/no question on the terminal; `false` when not interactive.
fn confirm(question: &str) -> bool {
    if !io::stdin().is_terminal() {
        return false;
    }
    eprint!("{question} [y/N] ");
    let _ = io::stderr().flush();
    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

fn accept_inconsistent(report: &ConsistencyReport, force: bool) -> bool {
    eprintln!("\nThe snapshot does not match the current run:");
    for difference in &report.differences {
        eprintln!("  - {difference}");
    }
    if force {
        eprintln!("Resuming anyway (--force).");
        return true;
    }
    confirm("Resume from this snapshot anyway?")
}

fn print_example_config() {
    let example = r#"# peruse configuration file

[api]
# API key (can also use the variable named by api_key_env)
# api_key = "${MY_KEY}"
api_key_env = "OPENAI_API_KEY"
base_url = "https://api.openai.com/v1"
timeout_secs = 120
max_retries = 3

[models]
# Strong model: structure analysis and answers
analyzer = { id = "gpt-4o", temperature = 0.3, max_tokens = 4096 }
# Fast model: question selection, verification, report
reviewer = { id = "gpt-4o-mini", temperature = 0.1, max_tokens = 2048 }

[workflow]
num_questions = 3
# Re-answers a verification may request per question
max_followups = 0
# "reviewer" (quick) or "analyzer" (deeper)
integration_model = "reviewer"

[output]
output_dir = "output"
checkpoint_dir = "checkpoints"
enable_checkpoints = true
readable_mirror = true

# Omit this block to never delete snapshots
[retention]
auto_cleanup = false
max_age_days = 30
keep_per_subject = 10
# max_files = 200
# max_size_mb = 500
protect_completed = true

[logging]
level = "info"
# file = "peruse.log"
"#;
    println!("{example}");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Example = cli.command {
        print_example_config();
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    setup_logging(cli.verbose, &config.logging)?;
    let store = SnapshotStore::from_config(&config);

    match cli.command {
        Commands::Example => print_example_config(),

        Commands::Validate => {
            config
                .resolve_api_key()
                .context("Failed to resolve API key")?;

            info!("Configuration is valid");
            info!("  Endpoint: {}", config.api.base_url);
            info!(
                "  Models: analyzer {}, reviewer {}",
                config.models.analyzer.id, config.models.reviewer.id
            );
            info!(
                "  Workflow: {} questions, {} follow-ups, integration by {:?}",
                config.workflow.num_questions,
                config.workflow.max_followups,
                config.workflow.integration_model
            );
            match config.active_retention() {
                Some(policy) => info!("  Retention: {policy:?}"),
                None => info!("  Retention: disabled"),
            }
        }

        Commands::Run {
            paper,
            resume,
            checkpoint,
            force,
            output_dir,
        } => {
            if !paper.is_file() {
                bail!("Paper not found: {}", paper.display());
            }

            if let Some(policy) = config.active_retention() {
                let report = retention::cleanup(store.root(), policy);
                info!(
                    deleted = report.deleted,
                    freed_bytes = report.freed_bytes,
                    failed = report.failed,
                    "Retention applied"
                );
            }

            let content = source::load(&paper).context("Failed to read paper")?;
            let subject_id = identity::resolve(&paper, &content, store.root());
            info!(subject = %subject_id, paper = %paper.display(), "Resolved subject");

            let _lock = if config.output.enable_checkpoints {
                Some(
                    SubjectLock::acquire(store.root(), &subject_id)
                        .context("Another run is using this paper")?,
                )
            } else {
                None
            };

            let api_key = config
                .resolve_api_key()
                .context("Failed to resolve API key")?;
            let client = LlmClient::new(&config.api, Some(api_key))?;
            let executor = LlmExecutor::new(client, &config, content);
            let planner = Planner::new(executor, store.clone())
                .with_checkpoints(config.output.enable_checkpoints)
                .with_progress(true);

            let resume_from = match checkpoint {
                Some(file) => ResumeSource::File(file),
                None if resume => ResumeSource::Latest,
                None => ResumeSource::Fresh,
            };
            let prepared = planner.prepare(
                ResumeRequest {
                    subject_id: &subject_id,
                    subject_path: &paper,
                    source: resume_from,
                    config: &config,
                },
                |report| accept_inconsistent(report, force),
            )?;

            let mut state = prepared.state;
            if let Some(from) = &prepared.resumed_from {
                println!("Resuming from {}", from.display());
            }

            if let Err(e) = planner.run(&mut state).await {
                eprintln!("\nRun stopped: {e}");
                eprintln!("Progress is saved. Continue with: peruse run {} --resume", paper.display());
                return Err(e.into());
            }

            let report = state.final_report.as_deref().unwrap_or_default();
            let output_dir = output_dir.unwrap_or_else(|| config.output.output_dir.clone());
            fs::create_dir_all(&output_dir)
                .with_context(|| format!("Failed to create {}", output_dir.display()))?;
            let report_path = output_dir.join(format!("{subject_id}_report.md"));
            fs::write(&report_path, report)
                .with_context(|| format!("Failed to write {}", report_path.display()))?;

            let (input_tokens, output_tokens) = planner.executor().client().total_tokens();
            println!("\n=== Analysis Complete ===");
            println!("Subject:     {subject_id}");
            println!("Questions:   {}", state.questions.len());
            println!("Stages:      {}", state.records.len());
            println!("Tokens:      {input_tokens} in / {output_tokens} out");
            println!("Report:      {}", report_path.display());
        }

        Commands::List { paper } => {
            let content = source::load_or_empty(&paper);
            let subject_id = identity::resolve(&paper, &content, store.root());
            let listing = store.list(&subject_id);

            if listing.is_empty() {
                println!("No snapshots for {subject_id}");
                return Ok(());
            }

            println!("Snapshots for {subject_id} (newest first):");
            for summary in listing.iter() {
                println!(
                    "  {}  {:<40}  {}/{} items  {} records  {:>8} bytes{}",
                    summary.saved_at.format("%Y-%m-%d %H:%M:%S"),
                    summary.stage_label,
                    summary.items_done,
                    summary.total_items,
                    summary.records,
                    summary.size,
                    if summary.is_completed { "  [completed]" } else { "" }
                );
                println!("      {}", summary.path.display());
            }
        }

        Commands::Cleanup { dry_run } => {
            let Some(policy) = config.active_retention() else {
                println!("Retention is disabled (set [retention] auto_cleanup = true)");
                return Ok(());
            };

            if dry_run {
                let plan = retention::plan(store.root(), policy, SystemTime::now());
                if plan.is_empty() {
                    println!("Nothing to delete");
                }
                for marked in &plan.marked {
                    println!("  {}  ({})", marked.path.display(), marked.reason);
                }
                println!("{} snapshots, {} bytes", plan.marked.len(), plan.bytes());
                return Ok(());
            }

            let report = checkpoint::cleanup(store.root(), policy);
            println!(
                "Deleted {} snapshots, freed {} bytes, {} failures",
                report.deleted, report.freed_bytes, report.failed
            );
        }

        Commands::Reset { yes } => {
            if !yes && !confirm(&format!("Delete every snapshot under {}?", store.root().display())) {
                warn!("Reset cancelled");
                return Ok(());
            }
            let report = store.reset()?;
            println!("Removed {} files ({} bytes)", report.files, report.bytes);
        }
    }

    Ok(())
}
