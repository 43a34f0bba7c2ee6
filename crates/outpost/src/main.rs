mod outpost;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "outpost",
    version,
    about = "Outpost - reverse tunnel agent that exposes loopback ports to a broker"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses OUTPOST_CONFIG; then auto-detects outpost.toml > outpost.yaml > outpost.yml from CWD; then falls back to the OS default path (Linux: /etc/outpost/outpost.toml; others: user config dir). Built-in defaults apply when none exists.
    #[arg(long, env = "OUTPOST_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// JSON file holding the metadata object sent to the broker on connect.
    metadata: Option<std::path::PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    outpost::run(cli.config, cli.metadata)
}
