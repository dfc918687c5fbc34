//! stackconverge CLI entrypoint.
//!
//! This is the main entrypoint for the stackconverge command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use stackconverge::cancel::Cancellation;
use stackconverge::cli::{Cli, Commands, MessageLevel, OutputFormatter, StateCommands};
use stackconverge::config::{ConfigParser, ConfigValidator, StackConfig, find_config_file};
use stackconverge::error::Result;
use stackconverge::gateway::ResourceRegistry;
use stackconverge::reconciler::Reconciler;
use stackconverge::state::{LocalStateStore, STATE_DIR, StateStore};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Writes command output to stdout.
fn emit(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", output.trim_end())?;
    Ok(())
}

/// Main async entry point. Returns whether the command succeeded.
async fn run(cli: Cli) -> Result<bool> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, formatter),
        Commands::Plan {
            no_refresh,
            detailed,
        } => cmd_plan(config_path, !no_refresh, detailed, formatter).await,
        Commands::Apply { yes, timeout } => cmd_apply(config_path, yes, timeout, formatter).await,
        Commands::Refresh => cmd_refresh(config_path, formatter).await,
        Commands::Drift => cmd_drift(config_path, formatter).await,
        Commands::Destroy { yes } => cmd_destroy(config_path, yes, formatter).await,
        Commands::State { command } => cmd_state(config_path, command, formatter).await,
    }
}

/// Validate configuration.
fn cmd_validate(
    config_path: Option<&Path>,
    show_warnings: bool,
    formatter: OutputFormatter,
) -> Result<bool> {
    let (config, config_file) = load_config(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let result = ConfigValidator::new().check(&config);
    emit(&formatter.format_validation(&config, &result, show_warnings))?;
    Ok(result.is_valid())
}

/// Show the plan.
async fn cmd_plan(
    config_path: Option<&Path>,
    refresh: bool,
    detailed: bool,
    formatter: OutputFormatter,
) -> Result<bool> {
    let stack = Stack::load(config_path).await?;
    let plan = stack.reconciler().plan(refresh).await?;
    emit(&formatter.format_plan(&plan, detailed))?;
    Ok(true)
}

/// Converge to the configuration.
async fn cmd_apply(
    config_path: Option<&Path>,
    auto_approve: bool,
    timeout: Option<u64>,
    formatter: OutputFormatter,
) -> Result<bool> {
    let stack = Stack::load(config_path).await?;

    let plan = stack.reconciler().plan(true).await?;
    if plan.is_empty() {
        emit(&formatter.message(MessageLevel::Success, "No changes to apply."))?;
        return Ok(true);
    }
    emit(&formatter.format_plan(&plan, false))?;

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        emit(&formatter.message(MessageLevel::Warning, "Apply cancelled."))?;
        return Ok(true);
    }

    let cancel = interruptible(timeout);
    let result = stack.reconciler().with_cancellation(cancel).reconcile().await?;
    emit(&formatter.format_reconciliation("Apply", &result))?;
    Ok(result.success)
}

/// Refresh state from the remote system.
async fn cmd_refresh(config_path: Option<&Path>, formatter: OutputFormatter) -> Result<bool> {
    let stack = Stack::load(config_path).await?;
    let report = stack.reconciler().refresh().await?;
    emit(&formatter.format_refresh(&report))?;
    Ok(report.errors.is_empty())
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&Path>, formatter: OutputFormatter) -> Result<bool> {
    let stack = Stack::load(config_path).await?;
    let report = stack.reconciler().check_drift().await?;
    emit(&formatter.format_drift(&report))?;
    Ok(true)
}

/// Destroy every tracked resource.
async fn cmd_destroy(
    config_path: Option<&Path>,
    auto_approve: bool,
    formatter: OutputFormatter,
) -> Result<bool> {
    let stack = Stack::load(config_path).await?;

    let Some(state) = stack.store.load().await? else {
        emit(&formatter.message(MessageLevel::Success, "No resources to destroy."))?;
        return Ok(true);
    };
    if state.resources.is_empty() {
        emit(&formatter.message(MessageLevel::Success, "No resources to destroy."))?;
        return Ok(true);
    }

    if !auto_approve {
        eprintln!("The following resources will be destroyed:");
        for record in state.newest_first() {
            eprintln!(
                "  - {} ({} {})",
                record.name,
                record.instance.resource_type,
                record.instance.id().unwrap_or("-")
            );
        }
        if !confirm(
            "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
            "destroy",
        )? {
            emit(&formatter.message(MessageLevel::Warning, "Destruction cancelled."))?;
            return Ok(true);
        }
    }

    let result = stack
        .reconciler()
        .with_cancellation(interruptible(None))
        .destroy()
        .await?;
    emit(&formatter.format_reconciliation("Destroy", &result))?;
    Ok(result.success)
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&Path>,
    command: StateCommands,
    formatter: OutputFormatter,
) -> Result<bool> {
    let (config, config_file) = load_config(config_path)?;
    let store = state_store(&config, &config_file);

    match command {
        StateCommands::Show => {
            if let Some(state) = store.load().await? {
                emit(&formatter.format_state(&state))?;
            } else {
                emit(&formatter.message(MessageLevel::Warning, "No state found."))?;
            }
        }
        StateCommands::Lock { holder } => {
            let lock = store.acquire_lock(holder.as_deref().unwrap_or("")).await?;
            emit(&formatter.format_lock(&lock))?;
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                store.force_unlock().await?;
                emit(&formatter.message(MessageLevel::Success, "State forcefully unlocked."))?;
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                emit(&formatter.message(MessageLevel::Success, "State unlocked."))?;
            } else {
                emit(&formatter.message(
                    MessageLevel::Error,
                    "Please provide --lock-id or use --force",
                ))?;
                return Ok(false);
            }
        }
    }

    Ok(true)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Configuration, state store and registry for one invocation.
struct Stack {
    config: StackConfig,
    store: LocalStateStore,
    registry: ResourceRegistry,
}

impl Stack {
    /// Loads and validates the configuration, then builds the registry.
    async fn load(config_path: Option<&Path>) -> Result<Self> {
        let (config, config_file) = load_config(config_path)?;

        let result = ConfigValidator::new().validate(&config)?;
        for warning in &result.warnings {
            warn!("{}", warning);
        }

        let store = state_store(&config, &config_file);
        let registry = if config.provider.simulate {
            info!("Simulating remote APIs in memory");
            ResourceRegistry::simulated(store.load().await?.as_ref())
        } else {
            let token = ConfigParser::token(&config)?;
            ResourceRegistry::rest(&config.provider, &token)?
        };

        Ok(Self {
            config,
            store,
            registry,
        })
    }

    fn reconciler(&self) -> Reconciler<'_, LocalStateStore> {
        Reconciler::new(&self.config, &self.registry, &self.store)
    }
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))
}

/// Loads `.env`, the configuration file and environment overrides.
fn load_config(config_path: Option<&Path>) -> Result<(StackConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    let config = parser.load_with_env(&config_file)?;
    Ok((config, config_file))
}

fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// State store next to the configuration unless `state.path` says otherwise.
fn state_store(config: &StackConfig, config_file: &Path) -> LocalStateStore {
    let base = config_dir(config_file);
    config.state.path.as_ref().map_or_else(
        || LocalStateStore::with_base_dir(base.join(STATE_DIR)),
        |path| LocalStateStore::with_state_path(base.join(path)),
    )
}

/// Cancellation fired by Ctrl-C or after `timeout_secs`.
fn interruptible(timeout_secs: Option<u64>) -> Cancellation {
    let (handle, mut cancel) = Cancellation::new();
    if let Some(secs) = timeout_secs {
        cancel = cancel.with_timeout(Duration::from_secs(secs));
    }
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current call");
            handle.cancel();
        }
    });
    cancel
}

/// Prompts on stderr and compares the answer.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}
