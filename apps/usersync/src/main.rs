//! usersync - run the reconciliation engine from the command line
//!
//! This runner:
//! - Loads the YAML configuration and resolves connector settings
//! - Reads directory and dashboard users through file-backed connectors
//! - Prints the computed action plan as JSON
//! - Optionally journals the plan as applied, or writes a remove list

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use usersync_engine::{DirectoryConnector, RhaiScriptExecutor, SyncEngine};

mod config;
mod connectors;
mod error;
mod logging;
mod remove_list;

use config::{AppConfig, FileConnectorConfig};
use connectors::{JsonDashboardConnector, JsonDirectoryConnector};
use error::{CliError, CliResult};

/// usersync - directory to dashboard user provisioning
#[derive(Parser)]
#[command(name = "usersync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the action plan and optionally apply it
    Run(RunArgs),

    /// Validate configuration, mapping rules and hook scripts
    Check(CheckArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Configuration file
    #[arg(short, long, env = "USERSYNC_CONFIG", default_value = "./usersync.yml")]
    config: PathBuf,

    /// CSV file of users to remove (columns: type,user,domain)
    #[arg(long)]
    remove_list: Option<PathBuf>,

    /// Write removal candidates to this CSV file instead of removing them
    #[arg(long, conflicts_with = "apply")]
    write_remove_list: Option<PathBuf>,

    /// Send the plan to the dashboard connector
    #[arg(long)]
    apply: bool,

    /// Write the plan JSON to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Args)]
struct CheckArgs {
    /// Configuration file
    #[arg(short, long, env = "USERSYNC_CONFIG", default_value = "./usersync.yml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Check(args) => check(args),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

fn base_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default()
}

async fn run(args: RunArgs) -> CliResult<()> {
    let mut config = AppConfig::from_file(&args.config)?;
    logging::init(&config.logging, args.verbose);
    let base_dir = base_dir(&args.config);

    if let Some(path) = &args.remove_list {
        let file = std::fs::File::open(path).map_err(|e| {
            CliError::RemoveList(format!("Failed to open {}: {e}", path.display()))
        })?;
        let keys = remove_list::read_remove_list(file)?;
        config
            .sync
            .filters
            .remove_user_keys
            .extend(keys.iter().map(ToString::to_string));
    }

    let engine = SyncEngine::new(config.sync.clone())?;

    if config.connectors.directory.is_empty() {
        return Err(CliError::Config(
            "No directory connectors configured".to_string(),
        ));
    }
    let mut directories: Vec<Arc<dyn DirectoryConnector>> = Vec::new();
    for (name, value) in &config.connectors.directory {
        let settings = FileConnectorConfig::from_resolved(name, value.resolve(&base_dir)?, &base_dir)?;
        directories.push(Arc::new(JsonDirectoryConnector::new(name.clone(), &settings)));
    }

    let dashboard_value = config
        .connectors
        .dashboard
        .as_ref()
        .ok_or_else(|| CliError::Config("No dashboard connector configured".to_string()))?;
    let dashboard_settings = FileConnectorConfig::from_resolved(
        "dashboard",
        dashboard_value.resolve(&base_dir)?,
        &base_dir,
    )?;
    let dashboard = JsonDashboardConnector::open(&dashboard_settings)?;
    if args.apply && !dashboard.can_apply() {
        return Err(CliError::Config(
            "--apply needs a journal on the dashboard connector".to_string(),
        ));
    }

    let plan = engine.run_with(&directories, &dashboard).await?;

    let json = serde_json::to_string_pretty(&plan)
        .map_err(|e| CliError::Io(format!("Failed to serialize plan: {e}")))?;
    match &args.output {
        Some(path) => std::fs::write(path, format!("{json}\n"))?,
        None => println!("{json}"),
    }

    if let Some(path) = &args.write_remove_list {
        let file = std::fs::File::create(path)?;
        remove_list::write_remove_list(plan.removal_candidates(), file)?;
        info!(
            path = %path.display(),
            users = plan.removal_candidates().len(),
            "Remove list written"
        );
    }

    if plan.is_aborted() {
        let reason = plan.status().reason().unwrap_or("aborted").to_string();
        return Err(CliError::Aborted(reason));
    }

    if args.apply {
        let report = engine.execute(&plan, &dashboard).await?;
        if report.failed > 0 {
            return Err(CliError::ActionsFailed {
                failed: report.failed,
            });
        }
    } else if !plan.is_empty() {
        warn!(actions = plan.len(), "Plan not applied; rerun with --apply to send it");
    }

    Ok(())
}

fn check(args: CheckArgs) -> CliResult<()> {
    let config = AppConfig::from_file(&args.config)?;
    logging::init(&config.logging, false);

    let mut script_errors = 0;
    for hook in &config.sync.hooks {
        for error in RhaiScriptExecutor::validate_script(&hook.hook_source, &config.sync.hook_sandbox) {
            script_errors += 1;
            eprintln!(
                "hook '{}' line {} column {}: {}",
                hook.name,
                error.line.map_or_else(|| "?".to_string(), |l| l.to_string()),
                error.column.map_or_else(|| "?".to_string(), |c| c.to_string()),
                error.message
            );
        }
    }
    if script_errors > 0 {
        return Err(CliError::Config(format!(
            "{script_errors} hook script error(s)"
        )));
    }

    let engine = SyncEngine::new(config.sync)?;
    let table = engine.mapping_table();
    println!(
        "Configuration OK: {} mapping rules, {} managed dashboard groups, {} hooks, {} directory connectors",
        table.rules().count(),
        table.managed_groups().len(),
        engine.config().hooks.len(),
        config.connectors.directory.len()
    );
    Ok(())
}
