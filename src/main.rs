//! pmctl: start, stop and inspect locally developed projects.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads the project file, builds the supervisor and dispatches the
//! requested command, either as a one-shot CLI action or as the long-running
//! web dashboard.

mod config;
mod dashboard;
mod disk;
mod error;
mod output;
mod ports;
mod process;
mod registry;
mod report;
mod runner;
mod state;
mod supervisor;
mod watch;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, ProjectConfig};
use crate::dashboard::DashboardServer;
use crate::error::SupervisorError;
use crate::output::DEFAULT_TAIL_LINES;
use crate::process::{ProjectState, StatusSnapshot};
use crate::registry::ProjectRegistry;
use crate::runner::ShutdownConfig;
use crate::state::{InstanceLock, StateStore};
use crate::supervisor::{StartOutcome, Supervisor, SupervisorSettings};

const LOG_ENV: &str = "PMCTL_LOG";

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "pmctl",
    version,
    about = "Start, stop and monitor local development projects",
    styles = help_styles(),
    color = clap::ColorChoice::Always,
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to the project file (projects.toml or projects.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory for the state file, the lock file and project logs.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    /// Time to wait after sending SIGINT before escalating (ms, 0 skips).
    #[arg(long, global = true)]
    shutdown_sigint_ms: Option<u64>,
    /// Time to wait after sending SIGTERM before force-killing (ms).
    #[arg(long, global = true)]
    shutdown_sigterm_ms: Option<u64>,
    /// More log output on stderr (-v, -vv, -vvv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List all projects with their state.
    #[command(alias = "ls")]
    List {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Show details of one project, or of all projects.
    Status {
        name: Option<String>,
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Start a project.
    Start { name: String },
    /// Stop a running project.
    Stop { name: String },
    /// Stop a project if it runs, then start it again.
    Restart { name: String },
    /// Show the last lines of a project's log.
    Logs {
        name: String,
        /// Number of lines.
        #[arg(short = 'n', long = "lines", default_value_t = DEFAULT_TAIL_LINES)]
        lines: usize,
        /// Keep ANSI escape codes.
        #[arg(long)]
        raw: bool,
    },
    /// Add a project to the project file.
    Add {
        name: String,
        /// Project directory; becomes the workdir.
        path: PathBuf,
        /// Command to run (default: start.sh, start-*.sh, run.sh or run_*.sh in the directory).
        #[arg(short, long)]
        command: Option<String>,
        /// Port the project listens on.
        #[arg(short, long)]
        port: Option<u16>,
        /// Short description shown by `list`.
        #[arg(short, long)]
        description: Option<String>,
    },
    /// Remove a project from the project file.
    Remove {
        name: String,
        /// Stop the project first if it is running.
        #[arg(short, long)]
        force: bool,
    },
    /// Show how much disk space each project directory uses.
    Disk {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Serve the web dashboard.
    Web {
        /// Dashboard port (default 7777).
        #[arg(short, long)]
        port: Option<u16>,
        /// Bind address (default 127.0.0.1).
        #[arg(long)]
        host: Option<String>,
        /// Do not reload the project file when it changes.
        #[arg(long)]
        no_watch: bool,
    },
}

impl Commands {
    fn project_name(&self) -> Option<&str> {
        match self {
            Self::Status { name, .. } => name.as_deref(),
            Self::Start { name } | Self::Stop { name } | Self::Restart { name } => Some(name),
            Self::Logs { name, .. } | Self::Remove { name, .. } => Some(name),
            Self::List { .. } | Self::Add { .. } | Self::Disk { .. } | Self::Web { .. } => None,
        }
    }

    // Commands that change processes must own the state directory.
    fn needs_lock(&self) -> bool {
        matches!(
            self,
            Self::Start { .. }
                | Self::Stop { .. }
                | Self::Restart { .. }
                | Self::Remove { .. }
                | Self::Web { .. }
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    // Adding works without an existing project file.
    if let Commands::Add {
        name,
        path,
        command,
        port,
        description,
    } = &cli.command
    {
        let config_path = config::resolve_config_path_for_write(cli.config.clone());
        return add_project(&config_path, name, path, command.clone(), *port, description.clone());
    }

    let config_path = config::resolve_config_path(cli.config.clone())?;
    let (config, registry) = ProjectRegistry::load_with_config(&config_path)?;
    let config_dir = registry
        .source()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_default();
    // Unknown names fail before touching the state directory.
    if let Some(name) = cli.command.project_name() {
        registry.get(name)?;
    }
    if registry.is_empty() {
        warn!(config = %config_path.display(), "project file defines no projects");
    }
    let settings = RunSettings::from_cli(&cli, &config, &config_dir);
    debug!(
        config = %config_path.display(),
        projects = registry.len(),
        state_dir = %settings.state_dir.display(),
        "loaded project file"
    );

    let store = StateStore::new(&settings.state_dir);
    let lock = if cli.command.needs_lock() {
        Some(InstanceLock::acquire(store.dir())?)
    } else {
        InstanceLock::try_acquire(store.dir())?
    };
    if let Some(lock) = &lock {
        debug!(lock = %lock.path().display(), "acquired instance lock");
    }
    let supervisor = Supervisor::new(registry, settings.supervisor, store, lock);
    if !supervisor.is_writable() {
        debug!("another pmctl instance owns the state directory; running read-only");
    }
    let color = use_color();

    match cli.command {
        Commands::List { json } => {
            let snapshots = supervisor.status_all();
            if json {
                println!("{}", report::render_json(&snapshots)?);
            } else {
                print!(
                    "{}",
                    report::render_list(
                        &snapshots,
                        &supervisor.projects(),
                        &supervisor.port_conflicts(),
                        color
                    )
                );
            }
        }
        Commands::Status { name, json } => match name {
            Some(name) => {
                let snapshot = supervisor.status(&name)?;
                if json {
                    println!("{}", report::render_json(&snapshot)?);
                } else {
                    print!("{}", status_block(&supervisor, &snapshot, color));
                }
            }
            None => {
                let snapshots = supervisor.status_all();
                if json {
                    println!("{}", report::render_json(&snapshots)?);
                } else {
                    let blocks: Vec<String> = snapshots
                        .iter()
                        .map(|snapshot| status_block(&supervisor, snapshot, color))
                        .collect();
                    print!("{}", blocks.join("\n"));
                }
            }
        },
        Commands::Start { name } => {
            let outcome = supervisor.start(&name).await?;
            print_start_outcome(&supervisor, &name, &outcome)?;
        }
        Commands::Stop { name } => match supervisor.stop(&name).await {
            Ok(_) => println!("stopped {}", name),
            Err(SupervisorError::NotRunning(_)) => println!("{} is not running", name),
            Err(err) => return Err(err.into()),
        },
        Commands::Restart { name } => {
            let outcome = supervisor.restart(&name).await?;
            print_start_outcome(&supervisor, &name, &outcome)?;
        }
        Commands::Logs { name, lines, raw } => {
            let path = supervisor.log_path(&name)?;
            let lines = output::read_tail(&path, lines, !raw)?;
            if lines.is_empty() {
                eprintln!("no log output for {} yet ({})", name, path.display());
            }
            for line in lines {
                println!("{}", line);
            }
        }
        Commands::Remove { name, force } => {
            if supervisor.status(&name)?.state.is_active() {
                if !force {
                    bail!("{} is running; stop it first or pass --force", name);
                }
                match supervisor.stop(&name).await {
                    Ok(_) => println!("stopped {}", name),
                    Err(SupervisorError::NotRunning(_)) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            ProjectRegistry::remove_from_file(&config_path, &name)?;
            println!("removed {}", name);
        }
        Commands::Disk { json } => {
            let projects = supervisor.projects();
            let usages = tokio::task::spawn_blocking(move || disk::measure(&projects))
                .await
                .context("disk usage scan failed")?;
            if json {
                println!("{}", report::render_json(&usages)?);
            } else {
                print!("{}", report::render_disk(&usages));
            }
        }
        Commands::Add { .. } => unreachable!("handled before loading the registry"),
        Commands::Web {
            port,
            host,
            no_watch,
        } => {
            let host = host
                .or(settings.dashboard_host)
                .unwrap_or_else(|| dashboard::DEFAULT_HOST.to_string());
            let preferred = port
                .or(settings.dashboard_port)
                .unwrap_or(dashboard::DEFAULT_PORT);
            let registry_url = ports::registry_url(settings.port_registry.as_deref());
            let port = ports::resolve_port(registry_url.as_deref(), preferred).await;
            run_dashboard(supervisor, &host, port, config_path, !no_watch).await?;
        }
    }

    Ok(())
}

fn add_project(
    config_path: &Path,
    name: &str,
    path: &Path,
    command: Option<String>,
    port: Option<u16>,
    description: Option<String>,
) -> Result<()> {
    let workdir = std::fs::canonicalize(path)
        .with_context(|| format!("project directory {} does not exist", path.display()))?;
    let start_script = match &command {
        Some(_) => None,
        None => registry::detect_start_script(&workdir),
    };
    if command.is_none() && start_script.is_none() {
        bail!(
            "no start script found in {}; pass --command",
            workdir.display()
        );
    }
    let entry = ProjectConfig {
        name: name.to_string(),
        command,
        start_script,
        workdir: Some(workdir.to_string_lossy().into_owned()),
        port,
        description,
        ..ProjectConfig::default()
    };
    let project = ProjectRegistry::add_to_file(config_path, entry)?;
    println!("added {} ({})", project.name, project.command);
    println!("project file: {}", config_path.display());
    Ok(())
}

async fn run_dashboard(
    supervisor: Supervisor,
    host: &str,
    port: u16,
    config_path: PathBuf,
    watch_config: bool,
) -> Result<()> {
    let supervisor = Arc::new(supervisor);
    let server = DashboardServer::bind(host, port, supervisor.clone())
        .await
        .with_context(|| format!("failed to bind dashboard on {}:{}", host, port))?;
    println!("pmctl dashboard: http://{}", server.local_addr()?);
    println!("Ctrl+C stops the dashboard; projects keep running");

    if watch_config {
        let (tx, rx) = mpsc::channel(4);
        watch::spawn_config_watcher(config_path.clone(), watch::DEFAULT_DEBOUNCE, tx);
        tokio::spawn(watch::reload_on_change(config_path, supervisor.clone(), rx));
    }

    server.serve(shutdown_signal()).await?;
    Ok(())
}

fn print_start_outcome(supervisor: &Supervisor, name: &str, outcome: &StartOutcome) -> Result<()> {
    let snapshot = outcome.snapshot();
    match outcome {
        StartOutcome::AlreadyRunning(_) => {
            println!("{} is already running{}", name, describe_pid(snapshot));
        }
        StartOutcome::Started(_) if snapshot.state == ProjectState::Crashed => {
            let code = snapshot
                .last_exit
                .and_then(|exit| exit.code)
                .map(|code| format!(" with code {}", code))
                .unwrap_or_default();
            let log = supervisor
                .log_path(name)
                .map(|path| path.display().to_string())
                .unwrap_or_default();
            bail!("{} exited right after starting{}; see {}", name, code, log);
        }
        StartOutcome::Started(_) => {
            let port = snapshot
                .port
                .map(|port| format!(" on port {}", port))
                .unwrap_or_default();
            println!("started {}{}{}", name, describe_pid(snapshot), port);
        }
    }
    Ok(())
}

fn status_block(supervisor: &Supervisor, snapshot: &StatusSnapshot, color: bool) -> String {
    let project = supervisor.project(&snapshot.name).ok();
    let log_path = supervisor.log_path(&snapshot.name).ok();
    report::render_status(snapshot, project.as_ref(), log_path.as_deref(), color)
}

fn describe_pid(snapshot: &StatusSnapshot) -> String {
    snapshot
        .pid
        .map(|pid| format!(" (pid {})", pid))
        .unwrap_or_default()
}

// Resolves when the dashboard should exit.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn init_tracing(cli: &Cli) {
    let base = if matches!(cli.command, Commands::Web { .. }) {
        1
    } else {
        0
    };
    let level = match base + cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(format!("pmctl={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn use_color() -> bool {
    std::env::var_os("NO_COLOR").is_none() && std::io::stdout().is_terminal()
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

/// Runtime configuration derived from CLI arguments and the project file.
#[derive(Debug, Clone)]
struct RunSettings {
    state_dir: PathBuf,
    supervisor: SupervisorSettings,
    dashboard_host: Option<String>,
    dashboard_port: Option<u16>,
    port_registry: Option<String>,
}

impl RunSettings {
    fn from_cli(cli: &Cli, config: &Config, config_dir: &Path) -> Self {
        const DEFAULT_SHUTDOWN_SIGINT_MS: u64 = 0;
        const DEFAULT_SHUTDOWN_SIGTERM_MS: u64 = 2_000;
        const DEFAULT_READY_TIMEOUT_MS: u64 = 12_000;
        const DEFAULT_START_SETTLE_MS: u64 = 300;

        let state_dir = cli
            .state_dir
            .clone()
            .or_else(|| {
                config
                    .state_dir
                    .as_deref()
                    .map(|dir| config_dir.join(dir))
            })
            .unwrap_or_else(state::default_state_dir);
        let sigint_ms = cli
            .shutdown_sigint_ms
            .or(config.shutdown_sigint_ms)
            .unwrap_or(DEFAULT_SHUTDOWN_SIGINT_MS);
        let sigterm_ms = cli
            .shutdown_sigterm_ms
            .or(config.shutdown_sigterm_ms)
            .unwrap_or(DEFAULT_SHUTDOWN_SIGTERM_MS);
        let supervisor = SupervisorSettings {
            shutdown: ShutdownConfig::new(sigint_ms, sigterm_ms),
            ready_timeout: Duration::from_millis(
                config.ready_timeout_ms.unwrap_or(DEFAULT_READY_TIMEOUT_MS),
            ),
            start_settle: Duration::from_millis(
                config.start_settle_ms.unwrap_or(DEFAULT_START_SETTLE_MS),
            ),
        };

        Self {
            state_dir,
            supervisor,
            dashboard_host: config.dashboard_host.clone(),
            dashboard_port: config.dashboard_port,
            port_registry: config.port_registry.clone(),
        }
    }
}
