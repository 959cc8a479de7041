use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_ecs::{
    config::{Credentials, Region},
    error::DisplayErrorContext,
    types::{
        AssignPublicIp, AwsVpcConfiguration, ContainerOverride, KeyValuePair, LaunchType,
        NetworkConfiguration, TaskOverride,
    },
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::slug::ProjectId;

/// Environment variable carrying the source location into the worker.
pub const SOURCE_LOCATION_ENV: &str = "GIT_REPOSITORY__URL";
/// Environment variable carrying the project id into the worker.
pub const PROJECT_ID_ENV: &str = "PROJECT_ID";

/// Parameters for one build worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLaunch {
    pub source_location: String,
    pub project_id: ProjectId,
}

impl WorkerLaunch {
    /// Variables the worker reads on startup.
    pub fn environment(&self) -> [(&'static str, String); 2] {
        [
            (SOURCE_LOCATION_ENV, self.source_location.clone()),
            (PROJECT_ID_ENV, self.project_id.to_string()),
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerHandle {
    /// Orchestrator-side identifier of the started worker, when it reports one.
    pub task_arn: Option<String>,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid worker request: {0}")]
    InvalidRequest(String),
    #[error("orchestrator rejected the worker: {0}")]
    Rejected(String),
    #[error("orchestrator request failed: {0}")]
    Request(String),
}

/// Starts build workers. One call per deploy request, never retried here.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn start_worker(&self, launch: &WorkerLaunch) -> Result<WorkerHandle, OrchestratorError>;
}

/// Fixed placement and task template for workers on ECS Fargate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcsTaskTemplate {
    pub cluster: String,
    pub task_definition: String,
    pub container_name: String,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
}

impl EcsTaskTemplate {
    pub fn network_configuration(&self) -> Result<NetworkConfiguration, OrchestratorError> {
        let vpc = AwsVpcConfiguration::builder()
            .set_subnets(Some(self.subnets.clone()))
            .set_security_groups(Some(self.security_groups.clone()))
            .assign_public_ip(AssignPublicIp::Enabled)
            .build()
            .map_err(|err| OrchestratorError::InvalidRequest(err.to_string()))?;
        Ok(NetworkConfiguration::builder()
            .awsvpc_configuration(vpc)
            .build())
    }

    pub fn overrides(&self, launch: &WorkerLaunch) -> TaskOverride {
        let mut container = ContainerOverride::builder().name(&self.container_name);
        for (name, value) in launch.environment() {
            container = container.environment(KeyValuePair::builder().name(name).value(value).build());
        }
        TaskOverride::builder()
            .container_overrides(container.build())
            .build()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AwsSettings {
    pub region: Option<String>,
    pub static_credentials: Option<StaticCredentials>,
}

#[derive(Clone)]
pub struct StaticCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Launches each worker as a single Fargate task via `RunTask`.
pub struct EcsOrchestrator {
    client: aws_sdk_ecs::Client,
    template: EcsTaskTemplate,
}

impl EcsOrchestrator {
    pub async fn connect(settings: &AwsSettings, template: EcsTaskTemplate) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &settings.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(creds) = &settings.static_credentials {
            loader = loader.credentials_provider(Credentials::new(
                creds.access_key_id.clone(),
                creds.secret_access_key.clone(),
                None,
                None,
                "harbor-static",
            ));
        }
        let sdk_config = loader.load().await;
        info!(
            cluster = %template.cluster,
            task_definition = %template.task_definition,
            region = ?sdk_config.region().map(|r| r.to_string()),
            "ECS orchestrator configured"
        );
        Self {
            client: aws_sdk_ecs::Client::new(&sdk_config),
            template,
        }
    }
}

#[async_trait]
impl Orchestrator for EcsOrchestrator {
    async fn start_worker(&self, launch: &WorkerLaunch) -> Result<WorkerHandle, OrchestratorError> {
        let output = self
            .client
            .run_task()
            .cluster(&self.template.cluster)
            .task_definition(&self.template.task_definition)
            .launch_type(LaunchType::Fargate)
            .count(1)
            .network_configuration(self.template.network_configuration()?)
            .overrides(self.template.overrides(launch))
            .send()
            .await
            .map_err(|err| OrchestratorError::Request(DisplayErrorContext(&err).to_string()))?;

        let task_arn = output
            .tasks()
            .first()
            .and_then(|task| task.task_arn())
            .map(str::to_string);

        if task_arn.is_none() && !output.failures().is_empty() {
            let reasons: Vec<String> = output
                .failures()
                .iter()
                .map(|failure| {
                    format!(
                        "{} ({})",
                        failure.reason().unwrap_or("unknown reason"),
                        failure.detail().unwrap_or("no detail")
                    )
                })
                .collect();
            return Err(OrchestratorError::Rejected(reasons.join("; ")));
        }

        debug!(project_id = %launch.project_id, task_arn = ?task_arn, "RunTask accepted");
        Ok(WorkerHandle { task_arn })
    }
}

/// Records launches instead of starting anything. Backs `--dry-run` and tests.
#[derive(Default)]
pub struct InMemoryOrchestrator {
    launches: Mutex<Vec<WorkerLaunch>>,
    failure: Mutex<Option<String>>,
}

impl InMemoryOrchestrator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every following launch fail with `reason`.
    pub async fn fail_with(&self, reason: impl Into<String>) {
        *self.failure.lock().await = Some(reason.into());
    }

    pub async fn launches(&self) -> Vec<WorkerLaunch> {
        self.launches.lock().await.clone()
    }
}

#[async_trait]
impl Orchestrator for InMemoryOrchestrator {
    async fn start_worker(&self, launch: &WorkerLaunch) -> Result<WorkerHandle, OrchestratorError> {
        if let Some(reason) = self.failure.lock().await.clone() {
            return Err(OrchestratorError::Rejected(reason));
        }
        let mut guard = self.launches.lock().await;
        guard.push(launch.clone());
        Ok(WorkerHandle {
            task_arn: Some(format!("local-task/{}", guard.len())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> EcsTaskTemplate {
        EcsTaskTemplate {
            cluster: "arn:aws:ecs:us-east-1:123:cluster/builder".into(),
            task_definition: "arn:aws:ecs:us-east-1:123:task-definition/builder-task".into(),
            container_name: "builder-image".into(),
            subnets: vec!["subnet-a".into(), "subnet-b".into()],
            security_groups: vec!["sg-1".into()],
        }
    }

    fn launch() -> WorkerLaunch {
        WorkerLaunch {
            source_location: "https://example.com/repo.git".into(),
            project_id: ProjectId::parse("demo123").unwrap(),
        }
    }

    #[test_timeout::timeout]
    fn overrides_pass_source_and_project_to_the_builder_container() {
        let overrides = template().overrides(&launch());
        let containers = overrides.container_overrides();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name(), Some("builder-image"));

        let env: Vec<(Option<&str>, Option<&str>)> = containers[0]
            .environment()
            .iter()
            .map(|kv| (kv.name(), kv.value()))
            .collect();
        assert_eq!(
            env,
            vec![
                (Some("GIT_REPOSITORY__URL"), Some("https://example.com/repo.git")),
                (Some("PROJECT_ID"), Some("demo123")),
            ]
        );
    }

    #[test_timeout::timeout]
    fn network_configuration_assigns_public_ip_in_configured_subnets() {
        let network = template().network_configuration().unwrap();
        let vpc = network.awsvpc_configuration().expect("awsvpc configuration");
        assert_eq!(vpc.subnets(), ["subnet-a", "subnet-b"]);
        assert_eq!(vpc.security_groups(), ["sg-1"]);
        assert_eq!(vpc.assign_public_ip(), Some(&AssignPublicIp::Enabled));
    }

    #[test_timeout::timeout]
    fn credentials_are_redacted_in_debug_output() {
        let creds = StaticCredentials {
            access_key_id: "AKIAEXAMPLE".into(),
            secret_access_key: "super-secret".into(),
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("AKIAEXAMPLE"));
        assert!(!rendered.contains("super-secret"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn in_memory_orchestrator_records_and_fails_on_demand() {
        let orchestrator = InMemoryOrchestrator::new();
        let handle = orchestrator.start_worker(&launch()).await.unwrap();
        assert_eq!(handle.task_arn.as_deref(), Some("local-task/1"));
        assert_eq!(orchestrator.launches().await, vec![launch()]);

        orchestrator.fail_with("no capacity").await;
        let err = orchestrator.start_worker(&launch()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Rejected(reason) if reason == "no capacity"));
        assert_eq!(orchestrator.launches().await.len(), 1);
    }
}
