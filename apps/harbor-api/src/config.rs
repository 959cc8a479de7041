use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context, Result};
use axum::http::HeaderValue;
use clap::{builder::BoolishValueParser, ArgAction, Parser};
use log_relay::LOG_CHANNEL_PATTERN;

use crate::{
    deploy::PreviewConfig,
    orchestrator::{AwsSettings, EcsTaskTemplate, StaticCredentials},
    telemetry::TelemetryConfig,
};

#[derive(Debug, Parser)]
#[command(
    name = "harbor-api",
    author,
    version,
    about = "Deploy trigger and live build-log relay"
)]
pub struct Cli {
    /// Port for the deploy API.
    #[arg(long, env = "PORT", default_value_t = 9000)]
    pub port: u16,

    /// Port for the realtime log WebSocket server.
    #[arg(long, env = "REALTIME_PORT", default_value_t = 9002)]
    pub realtime_port: u16,

    /// Host both listeners bind to.
    #[arg(long, env = "BIND_HOST", default_value = "0.0.0.0")]
    pub bind_host: String,

    /// Redis connection URI carrying worker log channels.
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Wildcard pattern subscribed on the bus.
    #[arg(long, env = "LOG_CHANNEL_PATTERN", default_value = LOG_CHANNEL_PATTERN)]
    pub log_channel_pattern: String,

    /// Record deploy requests instead of starting ECS tasks (local development).
    #[arg(
        long,
        env = "HARBOR_DRY_RUN",
        action = ArgAction::SetTrue,
        value_parser = BoolishValueParser::new()
    )]
    pub dry_run: bool,

    #[arg(long, env = "AWS_REGION")]
    pub aws_region: Option<String>,

    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    pub aws_access_key_id: Option<String>,

    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub aws_secret_access_key: Option<String>,

    /// ECS cluster workers are started in.
    #[arg(long, env = "ECS_CLUSTER_ARN")]
    pub ecs_cluster: Option<String>,

    /// ECS task definition for the builder.
    #[arg(long, env = "ECS_TASK_ARN")]
    pub ecs_task: Option<String>,

    /// Container in the task definition that receives the worker environment.
    #[arg(long, env = "BUILDER_CONTAINER_NAME", default_value = "builder-image")]
    pub builder_container: String,

    /// Subnets for worker placement (comma separated).
    #[arg(long, env = "SUBNETS", value_delimiter = ',')]
    pub subnets: Vec<String>,

    /// Security groups for worker placement (comma separated).
    #[arg(long, env = "SECURITY_GROUPS", value_delimiter = ',')]
    pub security_groups: Vec<String>,

    /// Origins allowed to call the deploy API (comma separated). Empty allows any.
    #[arg(long, env = "FRONTEND_URL", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    #[arg(long, env = "PREVIEW_DOMAIN", default_value = "localhost:8000")]
    pub preview_domain: String,

    #[arg(long, env = "PREVIEW_SCHEME", default_value = "http")]
    pub preview_scheme: String,

    /// Service name attached to spans and metrics.
    #[arg(long, env = "HARBOR_SERVICE_NAME", default_value = "harbor-api")]
    pub service_name: String,

    /// Log filter directives.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,

    /// Export tracing spans to stdout via OpenTelemetry.
    #[arg(
        long,
        env = "HARBOR_OTEL_STDOUT",
        action = ArgAction::SetTrue,
        value_parser = BoolishValueParser::new()
    )]
    pub otel_stdout: bool,

    /// Grace period applied during shutdown.
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub enum OrchestratorSettings {
    Ecs {
        aws: AwsSettings,
        template: EcsTaskTemplate,
    },
    DryRun,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub api_addr: SocketAddr,
    pub realtime_addr: SocketAddr,
    pub redis_url: String,
    pub log_channel_pattern: String,
    pub orchestrator: OrchestratorSettings,
    pub allowed_origins: Vec<HeaderValue>,
    pub preview: PreviewConfig,
    pub telemetry: TelemetryConfig,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let api_addr = socket_addr(&cli.bind_host, cli.port)?;
        let realtime_addr = socket_addr(&cli.bind_host, cli.realtime_port)?;
        if api_addr == realtime_addr {
            bail!("deploy API and realtime server must listen on different ports");
        }

        let allowed_origins = non_empty(cli.allowed_origins)
            .into_iter()
            .map(|origin| {
                HeaderValue::from_str(origin.trim_end_matches('/'))
                    .with_context(|| format!("invalid allowed origin: {origin}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let orchestrator = if cli.dry_run {
            OrchestratorSettings::DryRun
        } else {
            let subnets = non_empty(cli.subnets);
            if subnets.is_empty() {
                bail!("at least one subnet is required (SUBNETS)");
            }
            let static_credentials = match (cli.aws_access_key_id, cli.aws_secret_access_key) {
                (Some(access_key_id), Some(secret_access_key)) => Some(StaticCredentials {
                    access_key_id,
                    secret_access_key,
                }),
                (None, None) => None,
                _ => bail!("AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY must be set together"),
            };
            OrchestratorSettings::Ecs {
                aws: AwsSettings {
                    region: cli.aws_region,
                    static_credentials,
                },
                template: EcsTaskTemplate {
                    cluster: cli.ecs_cluster.context("ECS_CLUSTER_ARN is required")?,
                    task_definition: cli.ecs_task.context("ECS_TASK_ARN is required")?,
                    container_name: cli.builder_container,
                    subnets,
                    security_groups: non_empty(cli.security_groups),
                },
            }
        };

        Ok(ServerConfig {
            api_addr,
            realtime_addr,
            redis_url: cli.redis_url,
            log_channel_pattern: cli.log_channel_pattern,
            orchestrator,
            allowed_origins,
            preview: PreviewConfig {
                scheme: cli.preview_scheme,
                domain: cli.preview_domain,
            },
            telemetry: TelemetryConfig {
                service_name: cli.service_name,
                log_filter: cli.log_filter,
                otel_stdout: cli.otel_stdout,
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr> {
    format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address: {host}:{port}"))
}

fn non_empty(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}
