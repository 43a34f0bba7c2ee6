use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::outpost::{
    net,
    tunnel::{
        listener::{DEFAULT_BACKLOG, DEFAULT_RECV_MAX},
        supervisor::DEFAULT_RECONNECT_INTERVAL,
    },
};

pub const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:9000";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: Option<PathBuf>,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
    /// No file anywhere; built-in defaults apply.
    Builtin,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
            ConfigPathSource::Builtin => write!(f, "builtin"),
        }
    }
}

pub fn resolve_config_path(explicit_flag_path: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: Some(normalize_explicit_path(&p)?),
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps OUTPOST_CONFIG into the flag already; this covers callers that bypass clap.
    if let Some(p) = std::env::var_os("OUTPOST_CONFIG") {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: Some(normalize_explicit_path(Path::new(&p))?),
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: Some(p),
            source: ConfigPathSource::Cwd,
        });
    }

    if let Some(p) = default_config_path() {
        if p.is_file() {
            return Ok(ResolvedConfigPath {
                path: Some(p),
                source: ConfigPathSource::Default,
            });
        }
    }

    Ok(ResolvedConfigPath {
        path: None,
        source: ConfigPathSource::Builtin,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }
    if p.is_dir() {
        return discover_config_path(p)
            .with_context(|| format!("config: no outpost.* in {}", p.display()));
    }
    if !p.is_file() {
        anyhow::bail!("config: {} does not exist", p.display());
    }
    Ok(p.to_path_buf())
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    ["outpost.toml", "outpost.yaml", "outpost.yml"]
        .iter()
        .map(|c| dir.join(c))
        .find(|p| p.is_file())
}

fn default_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Some(PathBuf::from("/etc/outpost/outpost.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("com", "outpost", "outpost")
            .map(|proj| proj.config_dir().join("outpost.toml"))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub broker_addr: SocketAddr,
    pub reconnect_interval: Duration,
    pub listen_backlog: i32,
    pub recv_max: usize,
    pub metrics_addr: Option<SocketAddr>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    broker_addr: Option<String>,
    reconnect_interval_ms: Option<i64>,
    listen_backlog: Option<i32>,
    recv_max: Option<i64>,
    #[serde(default)]
    metrics_addr: String,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

/// Loads `path`, or the built-in defaults when there is no file.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let fc = match path {
        Some(p) => read_file_config(p)?,
        None => FileConfig::default(),
    };
    Config::from_file_config(fc)
}

fn read_file_config(path: &Path) -> anyhow::Result<FileConfig> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display())),
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))
        }
        _ => anyhow::bail!("config: unsupported config extension {:?}", ext),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let broker = fc
            .broker_addr
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_BROKER_ADDR);
        let broker_addr = net::resolve_broker_addr(broker)
            .with_context(|| format!("config: invalid broker_addr {broker:?}"))?;

        let metrics_addr = match fc.metrics_addr.trim() {
            "" => None,
            a => Some(
                net::normalize_listen_addr(a)
                    .parse::<SocketAddr>()
                    .with_context(|| format!("config: invalid metrics_addr {a:?}"))?,
            ),
        };

        let mut cfg = Config {
            broker_addr,
            reconnect_interval: Duration::from_millis(
                fc.reconnect_interval_ms.unwrap_or(0).max(0) as u64,
            ),
            listen_backlog: fc.listen_backlog.unwrap_or(0).max(0),
            recv_max: fc.recv_max.unwrap_or(0).max(0) as usize,
            metrics_addr,
            logging: LoggingConfig::default(),
        };

        if cfg.reconnect_interval.is_zero() {
            cfg.reconnect_interval = DEFAULT_RECONNECT_INTERVAL;
        }
        if cfg.listen_backlog == 0 {
            cfg.listen_backlog = DEFAULT_BACKLOG;
        }
        if cfg.recv_max == 0 {
            cfg.recv_max = DEFAULT_RECV_MAX;
        }

        if let Some(l) = &fc.logging {
            if let Some(level) = l.level.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                cfg.logging.level = level.to_string();
            }
            if let Some(fmt) = l.format.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                cfg.logging.format = fmt.to_string();
            }
            if let Some(out) = l.output.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                cfg.logging.output = out.to_string();
            }
            cfg.logging.add_source = l.add_source;
        }

        Ok(cfg)
    }
}
