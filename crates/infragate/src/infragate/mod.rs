pub mod admin;
pub mod app;
pub mod backend;
pub mod config;
pub mod conn;
pub mod error;
pub mod events;
pub mod gateway;
pub mod listener;
pub mod logging;
pub mod net;
pub mod protocol;
pub mod proxy_protocol;
pub mod reload;
pub mod router;
pub mod routing;
pub mod session;
pub mod status;
pub mod telemetry;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
