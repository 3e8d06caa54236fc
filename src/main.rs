//! portrack: start, stop and track local development services by port.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads settings and the project catalog, and then either serves
//! the HTTP API or runs the `register` helper.

mod catalog;
mod config;
mod error;
mod lifecycle;
mod platform;
mod probe;
mod process;
mod project;
mod register;
mod registry;
mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::catalog::{Catalog, CatalogStore};
use crate::lifecycle::ServiceController;
use crate::platform::Capabilities;
use crate::probe::{PortProbe, DEFAULT_PROBE_TIMEOUT};
use crate::register::{read_project_file, Registered, RegistrationAgent};
use crate::registry::ProcessRegistry;
use crate::server::AppState;

const DEFAULT_BIND: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 5555;
const DEFAULT_CATALOG: &str = "config.json";
const DEFAULT_STATIC_DIR: &str = "static";

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "portrack",
    version,
    about = "Start, stop and track local dev services by port",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to portrack.toml settings file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ignore any portrack.toml in the current directory.
    #[arg(long, global = true)]
    no_config: bool,
    /// Path to the JSON project catalog.
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,
    /// Address to bind the API to.
    #[arg(long)]
    bind: Option<String>,
    /// Port to serve the API on.
    #[arg(long)]
    port: Option<u16>,
    /// Directory containing index.html.
    #[arg(long)]
    static_dir: Option<PathBuf>,
    /// Connect timeout for port probes (ms).
    #[arg(long)]
    probe_timeout_ms: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP API (default).
    Serve,
    /// Register or update a project from a JSON file.
    Register {
        /// Project document to register.
        file: PathBuf,
        /// Registration endpoint of a running manager.
        #[arg(long)]
        api_url: Option<String>,
    },
    /// Show version information.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("portrack=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let file_config = load_file_config(&cli)?;
    let settings = Settings::from_cli(&cli, file_config);

    match &cli.command {
        None | Some(Commands::Serve) => serve(settings).await,
        Some(Commands::Register { file, api_url }) => {
            let api_url = api_url.clone().unwrap_or_else(|| settings.api_url.clone());
            register(file, api_url, settings.catalog).await
        }
        Some(Commands::Version) => {
            println!("portrack {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn serve(settings: Settings) -> Result<()> {
    let store = CatalogStore::new(&settings.catalog);
    let catalog = Arc::new(Catalog::open(store)?);
    tracing::info!(
        catalog = %settings.catalog.display(),
        projects = catalog.projects().await.len(),
        "loaded catalog"
    );

    let services = ServiceController::new(
        catalog,
        Arc::new(ProcessRegistry::new()),
        PortProbe::new(settings.probe_timeout),
        Capabilities::for_host(),
    );
    let state = AppState::new(services, settings.static_dir.clone());

    let addr = format!("{}:{}", settings.bind, settings.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    server::serve(listener, state, shutdown_signal()).await
}

async fn register(file: &Path, api_url: String, catalog: PathBuf) -> Result<()> {
    let project = read_project_file(file)?;
    let agent = RegistrationAgent::new(api_url, CatalogStore::new(catalog));
    match agent
        .register(&project)
        .await
        .context("registration failed")?
    {
        Registered::Api => println!("registered {} via API", project.id),
        Registered::File(outcome) => {
            println!("registered {} in catalog file ({:?})", project.id, outcome)
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutting down");
}

fn load_file_config(cli: &Cli) -> Result<config::Config> {
    if cli.no_config {
        return Ok(config::Config::default());
    }
    let path = cli
        .config
        .clone()
        .or_else(|| default_config_path().filter(|path| path.exists()));
    match path {
        Some(path) => config::load_config(&path),
        None => Ok(config::Config::default()),
    }
}

fn default_config_path() -> Option<PathBuf> {
    let path = Path::new("portrack.toml");
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
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
}

/// Runtime settings derived from CLI arguments and the settings file.
#[derive(Debug, Clone)]
struct Settings {
    bind: String,
    port: u16,
    catalog: PathBuf,
    static_dir: PathBuf,
    probe_timeout: Duration,
    api_url: String,
}

impl Settings {
    fn from_cli(cli: &Cli, file: config::Config) -> Self {
        let probe_timeout = cli
            .probe_timeout_ms
            .or(file.probe_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_PROBE_TIMEOUT);
        let bind = cli
            .bind
            .clone()
            .or(file.bind)
            .unwrap_or_else(|| DEFAULT_BIND.to_string());
        let port = cli.port.or(file.port).unwrap_or(DEFAULT_PORT);
        let api_url = file
            .api_url
            .unwrap_or_else(|| local_api_url(&bind, port));
        Self {
            bind,
            port,
            catalog: cli
                .catalog
                .clone()
                .or(file.catalog)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG)),
            static_dir: cli
                .static_dir
                .clone()
                .or(file.static_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATIC_DIR)),
            probe_timeout,
            api_url,
        }
    }
}

// Registration endpoint of a manager serving on `bind:port`. A wildcard bind
// is reached through loopback.
fn local_api_url(bind: &str, port: u16) -> String {
    let host = match bind {
        "0.0.0.0" | "" => "127.0.0.1",
        "::" | "[::]" => "[::1]",
        host if host.contains(':') && !host.starts_with('[') => {
            return format!("http://[{}]:{}/projects", host, port);
        }
        host => host,
    };
    format!("http://{}:{}/projects", host, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_file_which_overrides_defaults() {
        let cli = Cli::parse_from(["portrack", "--port", "7000", "--catalog", "cli.json"]);
        let file = config::Config {
            bind: Some("0.0.0.0".into()),
            port: Some(6000),
            catalog: Some(PathBuf::from("file.json")),
            probe_timeout_ms: Some(50),
            ..Default::default()
        };
        let settings = Settings::from_cli(&cli, file);
        assert_eq!(settings.port, 7000);
        assert_eq!(settings.bind, "0.0.0.0");
        assert_eq!(settings.catalog, PathBuf::from("cli.json"));
        assert_eq!(settings.static_dir, PathBuf::from(DEFAULT_STATIC_DIR));
        assert_eq!(settings.probe_timeout, Duration::from_millis(50));
        assert_eq!(settings.api_url, "http://127.0.0.1:7000/projects");
    }

    #[test]
    fn register_targets_the_configured_port() {
        let cli = Cli::parse_from(["portrack", "register", "p.json"]);
        let file = config::Config {
            port: Some(6000),
            ..Default::default()
        };
        let settings = Settings::from_cli(&cli, file);
        assert_eq!(settings.api_url, "http://127.0.0.1:6000/projects");

        let file = config::Config {
            bind: Some("192.168.1.5".into()),
            port: Some(6000),
            api_url: Some("http://manager.local/projects".into()),
            ..Default::default()
        };
        let settings = Settings::from_cli(&cli, file);
        assert_eq!(settings.api_url, "http://manager.local/projects");
    }

    #[test]
    fn api_url_reaches_wildcard_binds_through_loopback() {
        assert_eq!(local_api_url("192.168.1.5", 80), "http://192.168.1.5:80/projects");
        assert_eq!(local_api_url("::", 5555), "http://[::1]:5555/projects");
        assert_eq!(local_api_url("::1", 5555), "http://[::1]:5555/projects");
    }

    #[test]
    fn defaults_apply_without_any_settings() {
        let cli = Cli::parse_from(["portrack"]);
        let settings = Settings::from_cli(&cli, config::Config::default());
        assert_eq!(settings.bind, DEFAULT_BIND);
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.catalog, PathBuf::from(DEFAULT_CATALOG));
        assert_eq!(settings.probe_timeout, DEFAULT_PROBE_TIMEOUT);
        assert_eq!(settings.api_url, "http://127.0.0.1:5555/projects");
    }

    #[test]
    fn register_subcommand_parses_file_and_url() {
        let cli = Cli::parse_from([
            "portrack",
            "register",
            "project.json",
            "--api-url",
            "http://localhost:9000/projects",
        ]);
        match cli.command {
            Some(Commands::Register { file, api_url }) => {
                assert_eq!(file, PathBuf::from("project.json"));
                assert_eq!(api_url.as_deref(), Some("http://localhost:9000/projects"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
