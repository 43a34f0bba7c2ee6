pub mod app;
pub mod config;
pub mod logging;
pub mod net;
pub mod telemetry;
pub mod tunnel;

pub fn run(
    config_path: Option<std::path::PathBuf>,
    metadata_path: Option<std::path::PathBuf>,
) -> anyhow::Result<()> {
    app::run(config_path, metadata_path)
}
