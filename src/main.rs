use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use assetpipe::config::{DEFAULT_CONFIG_FILE, PipelineConfig};
use assetpipe::observability::{MetricsCollector, log_snapshot};
use assetpipe::orchestrator::{Orchestrator, OrchestratorContext, StartOptions};
use assetpipe::presets::{PRESETS, init_project};
use assetpipe::report::BuildReport;
use assetpipe::stages;
use assetpipe::task::{BuildRun, TaskStatus};
use assetpipe::validation::validate_config;
use clap::{CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::Shell;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_tracing(cli.verbose)?;

    let command = cli.command.clone().unwrap_or(Commands::Default);
    match command {
        Commands::Init { preset, force } => init_command(&cli, &preset, force),
        Commands::ListStages => {
            list_stages();
            Ok(())
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "assetpipe", &mut io::stdout());
            Ok(())
        }
        Commands::Validate => validate_command(&cli),
        Commands::ListTasks => list_tasks(&cli),
        Commands::Clean => {
            let orchestrator = load_orchestrator(&cli)?;
            orchestrator.clean()?;
            Ok(())
        }
        Commands::Html => run_single(&cli, "html"),
        Commands::Style => run_single(&cli, "style"),
        Commands::Scripts => run_single(&cli, "scripts"),
        Commands::Media => run_single(&cli, "media"),
        Commands::Run { task } => run_single(&cli, &task),
        Commands::Build {
            report,
            print_metrics,
        } => build_command(&cli, report, print_metrics),
        Commands::Watch => serve_forever(&cli, false, true, false),
        Commands::Server => serve_forever(&cli, false, false, true),
        Commands::Default => serve_forever(&cli, true, true, true),
    }
}

fn configure_tracing(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;

    Ok(())
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load_or_default(&cli.config)?;
    if let Some(src) = &cli.src {
        config.source_dir = src.clone();
    }
    if let Some(dist) = &cli.dist {
        config.output_dir = dist.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    Ok(config)
}

/// Loads, validates and wires up the pipeline. Validation errors abort.
fn load_orchestrator(cli: &Cli) -> Result<Orchestrator> {
    let config = load_config(cli)?;
    let registry = stages::default_registry();
    let report = validate_config(&config, &registry);
    for warning in &report.warnings {
        warn!(config = %cli.config.display(), "{warning}");
    }
    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(config = %cli.config.display(), "{error_msg}");
        }
        return Err(anyhow!(
            "Configuration is invalid: {} error(s)",
            report.errors.len()
        ));
    }
    Orchestrator::new(config, &registry, MetricsCollector::new())
}

fn run_single(cli: &Cli, task: &str) -> Result<()> {
    let orchestrator = load_orchestrator(cli)?;
    let result = orchestrator.run_task(task)?;
    match result.status {
        TaskStatus::Success => {
            for output in &result.outputs {
                info!(task, output = %output.display(), "Wrote");
            }
            Ok(())
        }
        TaskStatus::Failed { error } => Err(anyhow!("Task '{task}' failed: {error}")),
    }
}

fn build_command(cli: &Cli, report: Option<PathBuf>, print_metrics: bool) -> Result<()> {
    let orchestrator = load_orchestrator(cli)?;
    let run = orchestrator.build_all()?;
    summarize(&run);

    let snapshot = orchestrator.metrics().snapshot();
    if print_metrics {
        log_snapshot(&snapshot);
    }
    if let Some(path) = report {
        BuildReport::new(&run, &orchestrator.config().output_dir, Some(snapshot))?
            .write(&path)?;
        info!(report = %path.display(), "Build report written");
    }

    if run.succeeded() {
        Ok(())
    } else {
        Err(anyhow!(
            "Build failed: {}",
            run.failed_tasks().join(", ")
        ))
    }
}

/// Long-running entry points. Only returns on Ctrl-C or a fatal startup
/// error; task failures leave the pipeline running in degraded mode.
fn serve_forever(cli: &Cli, build_first: bool, watch: bool, serve: bool) -> Result<()> {
    let orchestrator = Arc::new(load_orchestrator(cli)?);
    if build_first {
        let run = orchestrator.build_all()?;
        summarize(&run);
        if !run.succeeded() {
            warn!(failed = ?run.failed_tasks(), "Continuing in degraded mode");
        }
    }
    let mut context = OrchestratorContext::new(orchestrator);
    context.start(StartOptions { watch, serve })?;
    context.run_until_shutdown()
}

fn summarize(run: &BuildRun) {
    for (name, result) in run.results() {
        match &result.status {
            TaskStatus::Success => info!(
                task = name.as_str(),
                outputs = result.outputs.len(),
                duration_ms = result.duration_ms,
                "ok"
            ),
            TaskStatus::Failed { error } => {
                error!(task = name.as_str(), error = error.as_str(), "failed")
            }
        }
    }
}

fn validate_command(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let registry = stages::default_registry();
    let report = validate_config(&config, &registry);

    for warning in &report.warnings {
        warn!(config = %cli.config.display(), "{warning}");
    }

    if report.is_ok() {
        info!(config = %cli.config.display(), "Configuration validation passed");
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(config = %cli.config.display(), "{error_msg}");
        }
        Err(anyhow!(
            "Configuration validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn list_stages() {
    let registry = stages::default_registry();
    println!("Available stages:");
    for name in registry.known_stages() {
        println!("- {name}");
    }
}

fn list_tasks(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    println!("Tasks:");
    for task in &config.tasks {
        let stages: Vec<_> = task.stages.iter().map(|s| s.stage.as_str()).collect();
        println!(
            "- {} [{}] -> {}: {}",
            task.name,
            task.inputs.join(", "),
            config.output_dir.join(&task.output).display(),
            stages.join(" > ")
        );
    }
    Ok(())
}

fn init_command(cli: &Cli, preset: &str, force: bool) -> Result<()> {
    let root = cli
        .config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let outcome = init_project(root, preset, force)?;
    println!("Wrote {}", outcome.config.display());
    for path in &outcome.created {
        println!("Created {}", path.display());
    }
    for path in &outcome.skipped {
        println!("Kept existing {}", path.display());
    }
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "assetpipe",
    version,
    about = "Incremental front-end asset pipeline with watch mode and live reload"
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        default_value = DEFAULT_CONFIG_FILE,
        value_hint = ValueHint::FilePath
    )]
    config: PathBuf,
    /// Source directory (overrides the config file)
    #[arg(long, global = true, value_name = "DIR", value_hint = ValueHint::DirPath)]
    src: Option<PathBuf>,
    /// Output directory (overrides the config file)
    #[arg(long, global = true, value_name = "DIR", value_hint = ValueHint::DirPath)]
    dist: Option<PathBuf>,
    #[arg(long, global = true)]
    port: Option<u16>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone)]
enum Commands {
    /// Clean, build everything, then watch and serve
    Default,
    Clean,
    Html,
    Style,
    Scripts,
    Media,
    /// Run any configured task by name
    Run {
        task: String,
    },
    /// Clean and build every task once
    Build {
        #[arg(long, value_hint = ValueHint::FilePath)]
        report: Option<PathBuf>,
        #[arg(long)]
        print_metrics: bool,
    },
    Watch,
    Server,
    Validate,
    Init {
        #[arg(long, default_value = "standard", value_parser = clap::builder::PossibleValuesParser::new(PRESETS.iter().copied()))]
        preset: String,
        #[arg(long)]
        force: bool,
    },
    ListTasks,
    ListStages,
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}
