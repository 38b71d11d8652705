use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::env;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use covdiff::action::{compare_and_write, config_loader, Action};
use covdiff::artifacts::{ArtifactStore, GithubArtifactStore, LocalArtifactStore};
use covdiff::config::{Config, ConfigOverrides};
use covdiff::error::ActionError;
use covdiff::github::{GithubActions, Platform, RunContext};
use covdiff::report::ShieldsBadge;

const LOG_ENV: &str = "COVDIFF_LOG";

#[derive(Parser)]
#[command(name = "covdiff")]
#[command(about = "Compare pull request coverage against the base branch")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to config file (default: covdiff.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish or compare coverage depending on the workflow event (default)
    Run,

    /// Compare two local coverage reports
    Compare {
        /// Report of the current change
        head: PathBuf,

        /// Report to compare against
        #[arg(long)]
        base: Option<PathBuf>,
    },
}

fn main() {
    init_tracing();

    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            if env::var("GITHUB_ACTIONS").map(|v| v == "true").unwrap_or(false) {
                GithubActions::from_env().error(&format!("{:#}", e));
            }
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Declared but unset action inputs reach the process as empty strings
fn drop_empty_inputs() {
    let empty: Vec<_> = env::vars_os()
        .filter(|(key, value)| {
            value.is_empty() && key.to_str().is_some_and(|k| k.starts_with("INPUT_"))
        })
        .map(|(key, _)| key)
        .collect();

    for key in empty {
        env::remove_var(key);
    }
}

/// Returns whether the run passed
fn run() -> Result<bool> {
    drop_empty_inputs();
    let cli = Cli::parse();

    let mut config = Config::resolve(cli.config.as_deref())?;
    config.apply(cli.overrides)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run(&config),
        Commands::Compare { head, base } => cmd_compare(&config, &head, base.as_deref()),
    }
}

#[tokio::main]
async fn cmd_run(config: &Config) -> Result<bool> {
    let context = RunContext::from_env();
    let platform = GithubActions::from_env();
    let badges = ShieldsBadge::default();
    let store = artifact_store(config, &context)?;

    tracing::debug!("event: {}", context.event.name());

    let outcome = Action::new(config, &context, store.as_ref(), &platform, &badges)
        .run()
        .await?;

    Ok(outcome.passed())
}

fn artifact_store(config: &Config, context: &RunContext) -> Result<Box<dyn ArtifactStore>> {
    if let Some(dir) = config.artifact_dir()? {
        return Ok(Box::new(LocalArtifactStore::new(dir, &config.artifact_name)));
    }

    let token = config
        .token
        .clone()
        .or_else(|| env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty()));

    Ok(Box::new(GithubArtifactStore::new(
        &context.api_url,
        context.repository.clone(),
        token,
        &config.artifact_name,
    )))
}

fn cmd_compare(config: &Config, head: &Path, base: Option<&Path>) -> Result<bool> {
    if !head.is_file() {
        return Err(ActionError::input_unavailable(head).into());
    }

    let loader = config_loader(config)?;
    let head_snapshot = loader
        .load(head)
        .ok_or_else(|| ActionError::coverage_unreadable(head))?;
    let base_snapshot = match base {
        Some(path) => Some(
            loader
                .load(path)
                .ok_or_else(|| ActionError::coverage_unreadable(path))?,
        ),
        None => None,
    };

    let comparison = compare_and_write(
        config,
        &head_snapshot,
        base_snapshot.as_ref(),
        Path::new(""),
        &ShieldsBadge::default(),
    )?;

    print!("{}", comparison.report.markdown);
    println!(
        "\n{} Report generated: {}",
        "📊".cyan(),
        comparison.report_path.display().to_string().green()
    );
    comparison.diff.print_summary();

    Ok(comparison.diff.passed())
}
