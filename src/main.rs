//! # BusTrack: scheduled script runner
//!
//! Runs stored functions on demand or on a cron schedule, persisting each
//! task's result and uploading any images it returns.
//!
//! Usage:
//!   bustrack config init                          # Write default config
//!   bustrack function add scrape --file scrape.js --env STOP=1042
//!   bustrack cron add scrape "*/10 * * * *"       # Every 10 minutes
//!   bustrack task submit scrape                   # Ad hoc run
//!   bustrack run                                  # Cron manager + poller + workers

use anyhow::{Context, Result, bail};
use bustrack_core::{BusTrackConfig, Function};
use bustrack_scheduler::SchedulerEngine;
use bustrack_store::{SqliteTaskStore, TaskStore};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "bustrack",
    version,
    about = "🚌 BusTrack: run stored scripts on demand or on a cron schedule"
)]
struct Cli {
    /// Config file (default: ~/.bustrack/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the cron manager, poller, and execution workers until Ctrl-C
    Run,
    /// Manage stored functions
    #[command(subcommand)]
    Function(FunctionCommand),
    /// Manage crontabs
    #[command(subcommand)]
    Cron(CronCommand),
    /// Submit and inspect tasks
    #[command(subcommand)]
    Task(TaskCommand),
    /// Configuration helpers
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum FunctionCommand {
    /// Create or replace a function
    Add {
        id: String,
        /// Script source file
        #[arg(long)]
        file: PathBuf,
        /// Environment binding, repeatable
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
    },
}

#[derive(Subcommand)]
enum CronCommand {
    /// Schedule a function with a 5-field cron expression (UTC)
    Add {
        function_id: String,
        expression: String,
        #[arg(long, default_value = "local")]
        user: String,
    },
    /// Show every crontab and its next run
    List,
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Queue one pending task for a function
    Submit { function_id: String },
    /// Most recent tasks first
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Full task record as JSON
    Show { id: String },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "bustrack=debug,bustrack_scheduler=debug,bustrack_sandbox=debug,bustrack_blob=debug,bustrack_store=debug"
    } else {
        "bustrack=info,bustrack_scheduler=info,bustrack_sandbox=info,bustrack_blob=info,bustrack_store=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(BusTrackConfig::default_path);

    if let Command::Config(ConfigCommand::Init { force }) = &cli.command {
        if config_path.exists() && !force {
            bail!("{} already exists (use --force to overwrite)", config_path.display());
        }
        BusTrackConfig::default().save_to(&config_path)?;
        println!("✅ Wrote default config to {}", config_path.display());
        return Ok(());
    }

    let config = if config_path.exists() {
        BusTrackConfig::load_from(&config_path)?
    } else {
        BusTrackConfig::default().with_env_overrides()
    };

    match cli.command {
        Command::Run => run(&config).await,
        Command::Function(cmd) => function_command(&open_store(&config)?, cmd),
        Command::Cron(cmd) => cron_command(&open_store(&config)?, cmd),
        Command::Task(cmd) => task_command(&open_store(&config)?, cmd),
        Command::Config(_) => Ok(()),
    }
}

async fn run(config: &BusTrackConfig) -> Result<()> {
    let engine = SchedulerEngine::from_config(config)?;
    let handle = engine.start().await?;
    tracing::info!(
        "🚌 BusTrack running ({} worker(s), poll {}s, cron {}s). Ctrl-C to stop.",
        config.scheduler.workers,
        config.scheduler.poll_interval_secs,
        config.scheduler.cron_interval_secs
    );

    tokio::signal::ctrl_c().await.context("listening for Ctrl-C")?;
    tracing::info!("🛑 Shutdown requested, waiting for running tasks");
    handle.shutdown().await?;
    Ok(())
}

fn open_store(config: &BusTrackConfig) -> Result<SqliteTaskStore> {
    let path = config.database.resolved_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(SqliteTaskStore::open(&path)?)
}

fn parse_env(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("--env expects KEY=VALUE, got '{pair}'");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("--env key is empty in '{pair}'");
        }
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

fn function_command(store: &SqliteTaskStore, cmd: FunctionCommand) -> Result<()> {
    match cmd {
        FunctionCommand::Add { id, file, env } => {
            let code = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let env = parse_env(&env)?;
            let bindings = env.len();
            store.upsert_function(&Function { id: id.clone(), code, env })?;
            println!("✅ Function '{id}' saved ({bindings} env binding(s))");
        }
    }
    Ok(())
}

fn cron_command(store: &SqliteTaskStore, cmd: CronCommand) -> Result<()> {
    match cmd {
        CronCommand::Add {
            function_id,
            expression,
            user,
        } => {
            // Validates the function exists and the expression fires.
            store.get_function(&function_id)?;
            let next_run_at = bustrack_scheduler::next_run_from_cron(&expression, Utc::now())?;
            let crontab = store.add_crontab(&function_id, &user, &expression, next_run_at)?;
            println!("⏰ Crontab {} scheduled, next run {}", crontab.id, crontab.next_run_at);
        }
        CronCommand::List => {
            let crontabs = store.list_crontabs()?;
            if crontabs.is_empty() {
                println!("No crontabs.");
            }
            for c in crontabs {
                println!("{}  {:<16} {:<20} next {}", c.id, c.function_id, c.expression, c.next_run_at);
            }
        }
    }
    Ok(())
}

fn task_command(store: &SqliteTaskStore, cmd: TaskCommand) -> Result<()> {
    match cmd {
        TaskCommand::Submit { function_id } => {
            store.get_function(&function_id)?;
            let task_id = store.insert_pending_task(&function_id, None)?;
            println!("📥 Task {task_id} queued");
        }
        TaskCommand::List { limit } => {
            for task in store.list_tasks(limit)? {
                let outcome = match task.error.as_deref() {
                    Some(e) if !e.is_empty() => format!("error: {e}"),
                    _ => String::new(),
                };
                println!(
                    "{}  {:<8} {:<16} {}  {}",
                    task.id,
                    task.status.as_str(),
                    task.function_id,
                    task.created_at.format("%Y-%m-%d %H:%M:%S"),
                    outcome
                );
            }
        }
        TaskCommand::Show { id } => {
            let task = store.get_task(&id)?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_pairs() {
        let env = parse_env(&["STOP=1042".into(), "URL=https://x/?a=b".into()]).unwrap();
        assert_eq!(env["STOP"], "1042");
        assert_eq!(env["URL"], "https://x/?a=b");
        assert!(parse_env(&["NOEQUALS".into()]).is_err());
        assert!(parse_env(&["=x".into()]).is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["bustrack", "-v", "cron", "add", "fn-1", "0 * * * *"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Command::Cron(CronCommand::Add { ref expression, ref user, .. }) if expression == "0 * * * *" && user == "local"
        ));

        let cli = Cli::try_parse_from(["bustrack", "function", "add", "f", "--file", "a.js", "--env", "A=1", "--env", "B=2"]).unwrap();
        let Command::Function(FunctionCommand::Add { env, .. }) = cli.command else {
            panic!("expected function add");
        };
        assert_eq!(env.len(), 2);
    }
}
