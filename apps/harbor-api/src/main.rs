use anyhow::Result;
use clap::Parser;
use tracing::info;

use harbor_api::{
    app,
    config::{Cli, ServerConfig},
    telemetry::Telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine; real deployments use the environment.
    let _ = dotenvy::dotenv();

    let config = ServerConfig::try_from(Cli::parse())?;
    let telemetry = Telemetry::init(&config.telemetry)?;
    info!(
        service = %config.telemetry.service_name,
        api_addr = %config.api_addr,
        realtime_addr = %config.realtime_addr,
        redis_url = %config.redis_url,
        "starting harbor-api"
    );

    app::run(config, Some(telemetry.metrics_handle())).await
}
