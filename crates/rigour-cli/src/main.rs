//! Rigour: plan, run, judge, heal and explore end-to-end test scenes.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use rigour_cli::init::{CONFIG_FILE, CONNECTION_FILE, SCENES_FILE};
use rigour_cli::reporters::{load_last, save_last};
use rigour_cli::{ReportFormat, ReportWriter, TerminalReporter, Verbosity, init, loader};
use rigour_core::{FlakinessTracker, Orchestrator, RigourConfig, RunMode, events};
use rigour_proto::{Connection, Scene};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Color output mode for terminal display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
enum ColorMode {
    /// Colors when stderr is a terminal
    #[default]
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

impl ColorMode {
    fn should_use_colors(self) -> bool {
        match self {
            ColorMode::Always => true,
            ColorMode::Never => false,
            ColorMode::Auto => std::io::stderr().is_terminal(),
        }
    }
}

/// Which plan generator writes the test artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
enum Planner {
    /// Ask the agent backend to write the tests
    #[default]
    Agent,
    /// Render pytest/httpx tests from the scene steps without an agent
    Template,
}

/// Rigour - agent-driven end-to-end test orchestration
#[derive(Parser, Debug)]
#[command(name = "rigour", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (debug logs and every phase transition)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only print the final summary
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Color output mode (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorMode::Auto, global = true)]
    color: ColorMode,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run scenes through plan, execute, judge, heal and explore
    Run(RunArgs),

    /// Generate edge-case scenes from the first scene in a file
    Explore(ExploreArgs),

    /// Write example scene, connection and config files
    Init(InitArgs),

    /// Re-export a saved report
    Report(ReportArgs),
}

/// Options shared by commands that drive the pipeline.
#[derive(Args, Debug)]
struct PipelineArgs {
    /// Connection record (YAML). Defaults to RIGOUR_* environment variables
    #[arg(short = 'c', long)]
    connection: Option<PathBuf>,

    /// Environment to select from a multi-environment connection file
    #[arg(short, long)]
    env: Option<String>,

    /// Configuration file [default: ./rigour.yml when present]
    #[arg(long)]
    config: Option<PathBuf>,

    /// Plan generator
    #[arg(long, value_enum, default_value_t = Planner::Agent)]
    planner: Planner,

    /// Disable healing of failed scenes
    #[arg(long)]
    no_heal: bool,

    /// Cap on edge cases generated per scene
    #[arg(long)]
    max_edge_cases: Option<usize>,

    /// Test runner timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Scene file (YAML, or Gherkin with a .feature extension)
    #[arg(required_unless_present = "from_text")]
    scenes: Option<PathBuf>,

    /// Describe one scene in plain language; the agent backend writes it
    #[arg(long, conflicts_with = "scenes")]
    from_text: Option<String>,

    #[command(flatten)]
    pipeline: PipelineArgs,

    /// Run scenes concurrently
    #[arg(short, long)]
    parallel: bool,

    /// Skip edge-case exploration
    #[arg(long)]
    no_edge_cases: bool,

    /// Write the report here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Report format
    #[arg(short, long, value_enum, default_value_t = ReportFormat::Json)]
    format: ReportFormat,
}

#[derive(Args, Debug)]
struct ExploreArgs {
    /// Scene file (YAML or .feature); only the first scene is explored
    #[arg(required_unless_present = "from_text")]
    scene: Option<PathBuf>,

    /// Describe the scene in plain language instead of a file
    #[arg(long, conflicts_with = "scene")]
    from_text: Option<String>,

    #[command(flatten)]
    pipeline: PipelineArgs,

    /// Write the generated scenes to this YAML file instead of stdout
    #[arg(short, long)]
    write: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct InitArgs {
    /// Directory to write the files into
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,

    /// Overwrite existing files
    #[arg(long)]
    force: bool,
}

#[derive(Args, Debug)]
struct ReportArgs {
    /// Saved JSON report to export
    #[arg(conflicts_with = "last")]
    file: Option<PathBuf>,

    /// Export the most recent run (the default when no file is given)
    #[arg(long)]
    last: bool,

    /// Report format
    #[arg(short, long, value_enum, default_value_t = ReportFormat::Markdown)]
    format: ReportFormat,

    /// Write the report here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let use_colors = cli.color.should_use_colors();
    colored::control::set_override(use_colors);

    let filter_directive = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("RIGOUR_LOG")
        .unwrap_or_else(|_| EnvFilter::new(filter_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(use_colors)
        .with_target(false)
        .init();

    let verbosity = if cli.verbose {
        Verbosity::Verbose
    } else if cli.quiet {
        Verbosity::Quiet
    } else {
        Verbosity::Normal
    };

    let exit_code = match cli.command {
        Commands::Run(args) => run_command(args, verbosity).await?,
        Commands::Explore(args) => explore_command(args, verbosity).await?,
        Commands::Init(args) => {
            init_command(&args)?;
            0
        }
        Commands::Report(args) => {
            report_command(args)?;
            0
        }
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

/// Config file, then flag overrides, then validation. Invalid config is fatal.
fn load_config(args: &PipelineArgs) -> Result<RigourConfig> {
    let default_path = Path::new(CONFIG_FILE);
    let mut config = match &args.config {
        Some(path) => RigourConfig::from_file(path)?,
        None if default_path.exists() => RigourConfig::from_file(default_path)?,
        None => RigourConfig::default(),
    };

    if args.no_heal {
        config.pipeline.enable_healing = false;
    }
    if let Some(max) = args.max_edge_cases {
        config.pipeline.max_edge_cases_per_scene = max;
    }
    if let Some(secs) = args.timeout {
        config.executor.timeout_secs = secs;
    }

    config.validate()?;
    Ok(config)
}

fn load_connection(args: &PipelineArgs) -> Result<Connection> {
    if let Some(path) = &args.connection {
        return Ok(loader::load_connection(path, args.env.as_deref())?);
    }
    if args.env.is_some() {
        bail!("--env requires --connection");
    }

    let connection = Connection::from_env();
    connection
        .validate()
        .context("invalid connection from RIGOUR_* environment variables")?;
    Ok(connection)
}

/// Scenes from a file, or one scene written by the agent from `text`.
async fn resolve_scenes(
    file: Option<&Path>,
    text: Option<&str>,
    config: &RigourConfig,
) -> Result<Vec<Scene>> {
    match (file, text) {
        (Some(path), _) => Ok(loader::load_scenes(path)?),
        (None, Some(text)) => {
            let scene = rigour_adapters::agent(config)?
                .scene_from_text(text)
                .await
                .context("failed to turn the description into a scene")?;
            info!(scene_id = %scene.id(), title = %scene.title(), "Scene written from description");
            Ok(vec![scene])
        }
        (None, None) => bail!("a scene file or --from-text is required"),
    }
}

fn build_orchestrator(
    config: &RigourConfig,
    connection: Connection,
    planner: Planner,
) -> Result<Orchestrator> {
    let capabilities = rigour_adapters::capabilities(config, planner == Planner::Template)?;
    let executor = rigour_adapters::executor(config)?;
    Ok(
        Orchestrator::new(capabilities, Arc::new(executor), connection, config)
            .with_flakiness_tracker(Arc::new(FlakinessTracker::new())),
    )
}

async fn run_command(args: RunArgs, verbosity: Verbosity) -> Result<i32> {
    let mut config = load_config(&args.pipeline)?;
    if args.parallel {
        config.pipeline.parallel = true;
    }
    if args.no_edge_cases {
        config.pipeline.enable_exploration = false;
    }
    let connection = load_connection(&args.pipeline)?;
    let scenes =
        resolve_scenes(args.scenes.as_deref(), args.from_text.as_deref(), &config).await?;

    info!(
        scenes = scenes.len(),
        base_url = %connection.base_url,
        parallel = config.pipeline.parallel,
        "Starting run"
    );

    let reporter = TerminalReporter::new(verbosity);
    let (tx, rx) = events::channel();
    let progress = reporter.spawn(rx);

    let orchestrator =
        build_orchestrator(&config, connection, args.pipeline.planner)?.with_events(tx);
    let report = orchestrator
        .run(&scenes, RunMode::from_parallel(config.pipeline.parallel))
        .await;
    // Closes the event channel so the progress task can finish.
    drop(orchestrator);
    progress.await.context("progress reporter failed")?;

    match save_last(Path::new("."), &report) {
        Ok(path) => debug!(path = %path.display(), "Saved last report"),
        Err(e) => warn!(error = %e, "Failed to save last report"),
    }

    if let Some(path) = ReportWriter::new(args.output).write(&report, args.format)? {
        eprintln!("Report written to {}", path.display());
    }

    reporter.print_failures(&report);
    reporter.print_summary(&report);

    Ok(report.exit_code())
}

async fn explore_command(args: ExploreArgs, verbosity: Verbosity) -> Result<i32> {
    let mut config = load_config(&args.pipeline)?;
    config.pipeline.enable_exploration = true;
    let connection = load_connection(&args.pipeline)?;
    let scenes = resolve_scenes(args.scene.as_deref(), args.from_text.as_deref(), &config).await?;
    let scene = scenes.first().context("no scene to explore")?;
    if scenes.len() > 1 {
        warn!(ignored = scenes.len() - 1, "Only the first scene is explored");
    }

    let (tx, rx) = events::channel();
    let progress = TerminalReporter::new(verbosity).spawn(rx);
    let orchestrator =
        build_orchestrator(&config, connection, args.pipeline.planner)?.with_events(tx);
    let run = orchestrator.run_scene(scene).await;
    drop(orchestrator);
    progress.await.context("progress reporter failed")?;

    if let Some(error) = &run.error {
        eprintln!(
            "{} {} failed during {}: {}",
            "✗".red(),
            run.scene_id(),
            error.phase,
            error.message
        );
        return Ok(1);
    }

    let children = run.children();
    if children.is_empty() {
        eprintln!(
            "No edge cases generated for {} (status: {})",
            run.scene_id(),
            run.status().map_or("not run", |s| s.as_str())
        );
        return Ok(i32::from(run.status().is_none_or(|s| s.is_failure())));
    }

    let yaml = loader::scenes_to_yaml(children)?;
    match &args.write {
        Some(path) => {
            std::fs::write(path, &yaml)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!(
                "{} Wrote {} edge-case scene{} to {}",
                "✓".green(),
                children.len(),
                if children.len() == 1 { "" } else { "s" },
                path.display()
            );
        }
        None => print!("{yaml}"),
    }
    Ok(0)
}

fn init_command(args: &InitArgs) -> Result<()> {
    let written = init::init(&args.dir, args.force)?;
    for path in &written {
        println!("{} Created {}", "✓".green(), path.display());
    }

    let shown = |name: &str| args.dir.join(name).display().to_string();
    println!(
        "\nNext: {}",
        format!(
            "rigour run {} --connection {} --config {} --planner template",
            shown(SCENES_FILE),
            shown(CONNECTION_FILE),
            shown(CONFIG_FILE)
        )
        .bold()
    );
    Ok(())
}

fn report_command(args: ReportArgs) -> Result<()> {
    let report = match &args.file {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("{} is not a rigour report", path.display()))?
        }
        None => {
            if !args.last {
                debug!("No report file given, exporting the last run");
            }
            load_last(Path::new("."))?
        }
    };

    if let Some(path) = ReportWriter::new(args.output).write(&report, args.format)? {
        eprintln!("Report written to {}", path.display());
    }
    Ok(())
}
