mod config;
mod controller;
mod display;
mod filter;
mod process;
mod signals;
mod watcher;

use clap::Parser;
use config::{DevloopConfig, DEFAULT_CONFIG_FILE};
use controller::RestartController;
use display::{DisplayHandle, TerminalDisplay};
use filter::ChangeFilter;
use process::ProcessSupervisor;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use watcher::WatchSource;

/// Run a development command and restart it whenever project files change.
#[derive(Parser, Debug)]
#[command(name = "devloop", version, about)]
pub struct Cli {
    /// Shell command to supervise, e.g. "npm run dev"
    #[arg(value_name = "COMMAND")]
    command: String,

    /// Config file path (default: devloop.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory to watch (overrides config)
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Watched extension, repeatable; replaces the configured set
    #[arg(short = 'e', long = "ext", value_name = "EXT")]
    extensions: Vec<String>,

    /// Extra directory name to ignore, repeatable
    #[arg(short, long = "ignore", value_name = "DIR")]
    ignore: Vec<String>,

    /// Debounce window in milliseconds (overrides config)
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// Print the resolved configuration and exit without running anything
    #[arg(long)]
    dry_run: bool,

    /// Debug logging on stderr
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    tracing::debug!(?cli, "parsed CLI arguments");

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "devloop=debug" } else { "devloop=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

/// Load the config file and apply CLI overrides on top.
fn resolve_config(cli: &Cli) -> Result<DevloopConfig, config::ConfigError> {
    let mut config = match &cli.config {
        Some(path) => DevloopConfig::load(path, true)?,
        None => DevloopConfig::load(std::path::Path::new(DEFAULT_CONFIG_FILE), false)?,
    };

    if let Some(root) = &cli.root {
        config.watch.root = root.clone();
    }
    if !cli.extensions.is_empty() {
        config.watch.extensions = cli.extensions.iter().map(|e| normalize_ext(e)).collect();
    }
    for dir in &cli.ignore {
        if !config.watch.ignore_dirs.contains(dir) {
            config.watch.ignore_dirs.push(dir.clone());
        }
    }
    if let Some(ms) = cli.debounce_ms {
        config.restart.debounce_ms = ms;
    }
    Ok(config)
}

/// Accept `ts` as shorthand for `.ts`.
fn normalize_ext(ext: &str) -> String {
    if ext.starts_with('.') {
        ext.to_string()
    } else {
        format!(".{ext}")
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(&cli)?;

    if cli.dry_run {
        println!("command: {}", cli.command);
        println!("{config:#?}");
        return Ok(());
    }

    let filter = ChangeFilter::from_config(&config.watch)?;
    let shutdown = CancellationToken::new();
    signals::install(shutdown.clone())?;

    // Fails before any child is spawned if the root is unusable
    let (watch, changes) = WatchSource::start(&config.watch.root, filter, config.watch.event_buffer)?;
    tracing::debug!(
        root = %watch.root().display(),
        directories = ?watch.watched_dirs(),
        "initial watch registration"
    );

    let (display, inbox) = DisplayHandle::channel(config.display.inbox_capacity);
    let display_task = tokio::spawn(TerminalDisplay::stdout(config.display.max_lines).run(inbox));
    display::spawn_quit_listener(shutdown.clone());

    let controller = RestartController::new(
        cli.command,
        ProcessSupervisor::new(&config.process),
        display,
        config.restart.debounce(),
    );
    let result = controller.run(changes, shutdown.clone()).await;

    watch.close();
    shutdown.cancel();
    match display_task.await {
        Ok(renderer) => log_display_closed(&renderer),
        Err(e) => tracing::warn!(error = %e, "display task failed"),
    }

    result?;
    Ok(())
}

fn log_display_closed<W: std::io::Write>(renderer: &TerminalDisplay<W>) {
    tracing::debug!(
        status = ?renderer.status(),
        retained_lines = renderer.lines().count(),
        "display closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_is_required() {
        let err = Cli::try_parse_from(["devloop"]).unwrap_err();
        assert_eq!(
            err.kind(),
            clap::error::ErrorKind::MissingRequiredArgument
        );
    }

    #[test]
    fn test_single_positional_command() {
        let cli = Cli::try_parse_from(["devloop", "npm run dev"]).unwrap();
        assert_eq!(cli.command, "npm run dev");
        assert!(cli.extensions.is_empty());
        assert!(!cli.dry_run);
    }

    #[test]
    fn test_cli_overrides_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[restart]\ndebounce_ms = 900\n").unwrap();
        let path_str = path.to_str().unwrap();

        let cli = Cli::try_parse_from([
            "devloop",
            "-c",
            path_str,
            "--ext",
            "rs",
            "-e",
            ".toml",
            "--ignore",
            "target",
            "--ignore",
            "node_modules",
            "--root",
            "/srv/app",
            "go run .",
        ])
        .unwrap();
        let config = resolve_config(&cli).unwrap();

        assert_eq!(config.restart.debounce_ms, 900);
        assert_eq!(config.watch.extensions, vec![".rs", ".toml"]);
        assert!(config.watch.ignore_dirs.contains(&"target".to_string()));
        assert_eq!(
            config
                .watch
                .ignore_dirs
                .iter()
                .filter(|d| *d == "node_modules")
                .count(),
            1
        );
        assert_eq!(config.watch.root, PathBuf::from("/srv/app"));
    }

    #[test]
    fn test_debounce_flag_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devloop.toml");
        std::fs::write(&path, "[restart]\ndebounce_ms = 900\n").unwrap();
        let cli = Cli::try_parse_from([
            "devloop",
            "--config",
            path.to_str().unwrap(),
            "--debounce-ms",
            "10",
            "make",
        ])
        .unwrap();
        assert_eq!(resolve_config(&cli).unwrap().restart.debounce_ms, 10);
    }

    #[test]
    fn test_explicit_missing_config_fails() {
        let cli = Cli::try_parse_from(["devloop", "-c", "/nonexistent/devloop.toml", "make"])
            .unwrap();
        assert!(resolve_config(&cli).is_err());
    }

    #[test]
    fn test_log_display_closed_reads_final_state() {
        let mut renderer = TerminalDisplay::new(Vec::new(), 10, false);
        renderer
            .apply(display::DisplayMsg::Output("last line".to_string()))
            .unwrap();
        log_display_closed(&renderer);
        assert_eq!(renderer.lines().collect::<Vec<_>>(), vec!["last line"]);
    }

    #[test]
    fn test_normalize_ext() {
        assert_eq!(normalize_ext("ts"), ".ts");
        assert_eq!(normalize_ext(".ts"), ".ts");
    }
}
