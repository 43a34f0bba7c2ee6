use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::outpost::{
    config, logging, telemetry,
    tunnel::{
        listener::BindOptions,
        protocol::{self, Metadata},
        session::SessionOptions,
        supervisor::{BrokerConnector, Supervisor},
    },
};

pub fn run(config_path: Option<PathBuf>, metadata_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let cfg = config::load_config(resolved.path.as_deref()).with_context(|| match &resolved.path {
        Some(p) => format!("load config: {}", p.display()),
        None => "load config: defaults".to_string(),
    })?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    let metadata = match &metadata_path {
        Some(p) => load_metadata(p)?,
        None => Metadata::new(),
    };

    if let Some(addr) = cfg.metrics_addr {
        telemetry::init_prometheus(addr)?;
        tracing::info!(addr = %addr, "metrics: prometheus exporter listening");
    }

    tracing::info!(
        config = %resolved.path.as_deref().map(|p| p.display().to_string()).unwrap_or_default(),
        source = %resolved.source,
        broker = %cfg.broker_addr,
        reconnect_interval = %humantime::format_duration(cfg.reconnect_interval),
        metadata_keys = metadata.len(),
        "outpost: starting"
    );

    let connector = BrokerConnector {
        opts: SessionOptions {
            broker: cfg.broker_addr,
            bind: BindOptions {
                backlog: cfg.listen_backlog,
                recv_max: cfg.recv_max,
            },
        },
        metadata,
    };
    Supervisor::new(connector, cfg.reconnect_interval).run(None);
    Ok(())
}

/// Reads the handshake metadata. Anything but a JSON object is a startup error.
fn load_metadata(path: &Path) -> anyhow::Result<Metadata> {
    let data = std::fs::read(path).with_context(|| format!("metadata: read {}", path.display()))?;
    protocol::parse_metadata(&data).with_context(|| format!("metadata: parse {}", path.display()))
}
