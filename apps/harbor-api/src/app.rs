use std::sync::Arc;

use anyhow::{Context, Result};
use log_relay::{BusEvent, ChannelRouter, LogRelay, RedisLogSubscriber};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{signal, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::{OrchestratorSettings, ServerConfig},
    deploy::{self, ApiState},
    orchestrator::{EcsOrchestrator, InMemoryOrchestrator, Orchestrator},
    realtime::{self, RealtimeState},
};

/// Bus events buffered between the Redis subscriber and the relay task.
const BUS_QUEUE_DEPTH: usize = 1024;

/// Long-lived collaborators shared by both listeners.
#[derive(Clone)]
pub struct Services {
    pub router: ChannelRouter,
    pub orchestrator: Arc<dyn Orchestrator>,
}

impl Services {
    pub async fn from_config(config: &ServerConfig) -> Self {
        let orchestrator: Arc<dyn Orchestrator> = match &config.orchestrator {
            OrchestratorSettings::Ecs { aws, template } => {
                Arc::new(EcsOrchestrator::connect(aws, template.clone()).await)
            }
            OrchestratorSettings::DryRun => {
                warn!("dry-run mode: deploy requests are recorded, no workers are started");
                InMemoryOrchestrator::new()
            }
        };
        Self {
            router: ChannelRouter::new(),
            orchestrator,
        }
    }

    /// Starts the relay task and returns the sender bus sources feed into.
    pub fn spawn_relay(&self) -> (mpsc::Sender<BusEvent>, JoinHandle<()>) {
        let (bus_tx, bus_rx) = mpsc::channel(BUS_QUEUE_DEPTH);
        let handle = LogRelay::new(self.router.clone()).spawn(bus_rx);
        (bus_tx, handle)
    }
}

pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let services = Services::from_config(&config).await;
    let shutdown = CancellationToken::new();

    let (bus_tx, relay_handle) = services.spawn_relay();
    let bus_handle = RedisLogSubscriber::new(&config.redis_url, config.log_channel_pattern.clone())
        .context("failed to create redis client")?
        .spawn(bus_tx);

    let realtime_app = realtime::build_router(RealtimeState::new(
        services.router.clone(),
        shutdown.clone(),
    ));
    let api_app = deploy::build_router(
        ApiState {
            orchestrator: services.orchestrator.clone(),
            preview: config.preview.clone(),
            metrics,
        },
        config.allowed_origins.clone(),
    );

    let realtime_listener = tokio::net::TcpListener::bind(config.realtime_addr)
        .await
        .context("failed to bind realtime listener")?;
    let api_listener = tokio::net::TcpListener::bind(config.api_addr)
        .await
        .context("failed to bind API listener")?;
    info!(
        api_addr = %config.api_addr,
        realtime_addr = %config.realtime_addr,
        pattern = %config.log_channel_pattern,
        "harbor listening"
    );

    tokio::spawn(trigger_on_ctrl_c(shutdown.clone()));

    let realtime_server = axum::serve(realtime_listener, realtime_app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let api_server = axum::serve(api_listener, api_app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    let served = tokio::try_join!(
        async { realtime_server.await.context("realtime server error") },
        async { api_server.await.context("API server error") },
    );
    // Either server failing takes the other one down too.
    shutdown.cancel();

    bus_handle.abort();
    relay_handle.abort();
    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    served.map(|_| ())
}

async fn trigger_on_ctrl_c(shutdown: CancellationToken) {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        return;
    }
    shutdown.cancel();
}
