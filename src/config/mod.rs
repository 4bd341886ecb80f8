//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, path::PathBuf, str::FromStr};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "cartiera";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_PUBLIC_DIR: &str = "public";
const STORAGE_SUBDIR: &str = "storage";
const DEFAULT_WKHTMLTOPDF_PATH: &str = "wkhtmltopdf";
const DEFAULT_VIEWER_PATH: &str = "pdfjs/web/viewer.html";

/// Command-line arguments for the cartiera binary.
#[derive(Debug, Parser)]
#[command(name = "cartiera", version, about = "HTML-to-PDF rendering service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "CARTIERA_CONFIG_FILE",
        value_name = "PATH"
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the WebSocket rendering server.
    Serve(Box<ServeArgs>),
    /// Render a single local HTML file and print the produced file name.
    #[command(name = "render")]
    RenderFile(RenderFileArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub storage: StorageOverrides,

    #[command(flatten)]
    pub render: RenderOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct StorageOverrides {
    /// Override the public directory served at the site root.
    #[arg(long = "storage-public-dir", value_name = "PATH")]
    pub public_dir: Option<PathBuf>,

    /// Override the directory holding staged HTML and rendered PDFs.
    #[arg(long = "storage-dir", value_name = "PATH")]
    pub storage_dir: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RenderOverrides {
    /// Override the wkhtmltopdf executable path.
    #[arg(long = "render-wkhtmltopdf-path", value_name = "PATH")]
    pub wkhtmltopdf_path: Option<PathBuf>,

    /// Override the viewer path used to build download links.
    #[arg(long = "render-viewer-path", value_name = "PATH")]
    pub viewer_path: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct RenderFileArgs {
    #[command(flatten)]
    pub storage: StorageOverrides,

    #[command(flatten)]
    pub render: RenderOverrides,

    /// Path to the HTML file to render.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub file: PathBuf,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub storage: StorageSettings,
    pub render: RenderSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub public_dir: PathBuf,
    pub storage_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub wkhtmltopdf_path: PathBuf,
    pub viewer_path: String,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("CARTIERA").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::RenderFile(args)) => {
            raw.apply_storage_overrides(&args.storage);
            raw.apply_render_overrides(&args.render);
        }
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    storage: RawStorageSettings,
    render: RawRenderSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }

        self.apply_storage_overrides(&overrides.storage);
        self.apply_render_overrides(&overrides.render);
    }

    fn apply_storage_overrides(&mut self, overrides: &StorageOverrides) {
        if let Some(dir) = overrides.public_dir.as_ref() {
            self.storage.public_dir = Some(dir.clone());
        }
        if let Some(dir) = overrides.storage_dir.as_ref() {
            self.storage.storage_dir = Some(dir.clone());
        }
    }

    fn apply_render_overrides(&mut self, overrides: &RenderOverrides) {
        if let Some(path) = overrides.wkhtmltopdf_path.as_ref() {
            self.render.wkhtmltopdf_path = Some(path.clone());
        }
        if let Some(path) = overrides.viewer_path.as_ref() {
            self.render.viewer_path = Some(path.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            storage,
            render,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let storage = build_storage_settings(storage)?;
        let render = build_render_settings(render)?;

        Ok(Self {
            server,
            logging,
            storage,
            render,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    Ok(ServerSettings { addr })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_storage_settings(storage: RawStorageSettings) -> Result<StorageSettings, LoadError> {
    let public_dir = storage
        .public_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PUBLIC_DIR));
    if public_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "storage.public_dir",
            "path must not be empty",
        ));
    }

    // Staged HTML and rendered PDFs live under the public tree so the static
    // file server can hand them out at /storage/.
    let storage_dir = storage
        .storage_dir
        .unwrap_or_else(|| public_dir.join(STORAGE_SUBDIR));
    if storage_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "storage.storage_dir",
            "path must not be empty",
        ));
    }

    Ok(StorageSettings {
        public_dir,
        storage_dir,
    })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let wkhtmltopdf_path = render
        .wkhtmltopdf_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WKHTMLTOPDF_PATH));
    if wkhtmltopdf_path.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "render.wkhtmltopdf_path",
            "path must not be empty",
        ));
    }

    let viewer_path = render
        .viewer_path
        .unwrap_or_else(|| DEFAULT_VIEWER_PATH.to_string());
    if viewer_path.is_empty() {
        return Err(LoadError::invalid(
            "render.viewer_path",
            "path must not be empty",
        ));
    }

    Ok(RenderSettings {
        wkhtmltopdf_path,
        viewer_path,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStorageSettings {
    public_dir: Option<PathBuf>,
    storage_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    wkhtmltopdf_path: Option<PathBuf>,
    viewer_path: Option<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}
