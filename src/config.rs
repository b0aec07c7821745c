use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
};

/// Settings directory handed to plugins by the loader.
pub const PLUGIN_SETTINGS_ENV: &str = "DECKY_PLUGIN_SETTINGS_DIR";
/// Directory the plugin was installed into (holds the `clash/` assets).
pub const PLUGIN_DIR_ENV: &str = "DECKY_PLUGIN_DIR";

pub const DEFAULT_SERVER_PORT: u16 = 12345;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// `<name>.yml` / `<name>.meta.yml` pairs live here.
    #[serde(default = "default_profiles_dir")]
    pub profiles_dir: PathBuf,

    /// Runtime directory of the tunnel binary; `config.yml` is written here.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Shipped assets: binary, unit file, GeoIP db, dashboard, template.
    #[serde(default = "default_assets_dir")]
    pub assets_dir: PathBuf,

    /// Template document; defaults to `<assets_dir>/template.yml`.
    #[serde(default)]
    pub template: Option<PathBuf>,

    #[serde(default = "default_settings_file")]
    pub settings_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            profiles_dir: default_profiles_dir(),
            config_dir: default_config_dir(),
            assets_dir: default_assets_dir(),
            template: None,
            settings_file: default_settings_file(),
        }
    }
}

impl PathsConfig {
    pub fn template_path(&self) -> PathBuf {
        self.template
            .clone()
            .unwrap_or_else(|| self.assets_dir.join("template.yml"))
    }

    pub fn active_config_path(&self) -> PathBuf {
        self.config_dir.join("config.yml")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Time a stopping server gets between SIGTERM and SIGKILL.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Upper bound on a POST body (uploads included).
    #[serde(default = "default_max_body")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            stop_grace_ms: default_stop_grace_ms(),
            max_body_bytes: default_max_body(),
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FetchBackend {
    #[default]
    Http,
    Curl,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(default)]
    pub backend: FetchBackend,

    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            backend: FetchBackend::default(),
            timeout_secs: default_fetch_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Resolver that conflicts with the tunnel's DNS and is turned off on install.
    #[serde(default = "default_resolver_service")]
    pub resolver: String,

    #[serde(default = "default_unit_dir")]
    pub unit_dir: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            resolver: default_resolver_service(),
            unit_dir: default_unit_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// How often the host loop checks profiles for a due refresh.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// If set, logs are also appended here.
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Mirrors the plugin's `debug.backend` toggle. When off, routine
    /// supervisor/scheduler messages drop to debug level.
    #[serde(default = "default_true")]
    pub backend_debug: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            backend_debug: true,
        }
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/home/deck"))
}

fn tunup_home() -> PathBuf {
    home_dir().join(".config").join("tunup")
}

fn plugin_settings_dir() -> Option<PathBuf> {
    std::env::var_os(PLUGIN_SETTINGS_ENV)
        .map(PathBuf::from)
        .filter(|p| !p.as_os_str().is_empty())
}

fn default_profiles_dir() -> PathBuf {
    plugin_settings_dir()
        .map(|d| d.join("profiles"))
        .unwrap_or_else(|| tunup_home().join("profiles"))
}

fn default_config_dir() -> PathBuf {
    tunup_home()
}

fn default_assets_dir() -> PathBuf {
    std::env::var_os(PLUGIN_DIR_ENV)
        .map(|d| PathBuf::from(d).join("clash"))
        .unwrap_or_else(|| PathBuf::from("/home/deck/homebrew/plugins/TunUp/clash"))
}

fn default_settings_file() -> PathBuf {
    plugin_settings_dir()
        .unwrap_or_else(tunup_home)
        .join("settings.json")
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_port() -> u16 {
    DEFAULT_SERVER_PORT
}
fn default_stop_grace_ms() -> u64 {
    3000
}
fn default_max_body() -> usize {
    8 * 1024 * 1024
}
fn default_fetch_timeout() -> u64 {
    60
}
fn default_user_agent() -> String {
    concat!("tunup/", env!("CARGO_PKG_VERSION")).to_string()
}
fn default_service_name() -> String {
    "tunup".to_string()
}
fn default_resolver_service() -> String {
    "systemd-resolved".to_string()
}
fn default_unit_dir() -> PathBuf {
    PathBuf::from("/etc/systemd/system")
}
fn default_tick_secs() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let s = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        serde_json::from_str(&s).with_context(|| format!("parse json {}", path.display()))
    }

    /// `--config` when given, otherwise built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }
}
