mod infragate;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "infragate",
    version,
    about = "infragate - virtual-host gateway for Minecraft Java servers"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses INFRAGATE_CONFIG; then auto-detects infragate.toml > infragate.yaml > infragate.yml from CWD; then falls back to the OS default path (Linux: /etc/infragate/infragate.toml; others: user config dir).
    #[arg(long, env = "INFRAGATE_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    infragate::run(cli.config).await
}
