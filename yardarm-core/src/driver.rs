//! Provider driver contract
//!
//! A `DistributedService` is one platform service deployed on one provider. The
//! trait carries only what differs per provider: descriptions, running-state
//! queries, provisioning and teardown. Everything built on top of it (pipeline
//! targets, red/black deploy documents, rollback planning, typed clients) lives
//! in free functions here so each provider gets it without re-implementing it.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{DeployError, Result};
use crate::pipeline::{
    Description, PipelineTarget, RollbackPlan, build_deploy_server_group_pipeline,
    build_upsert_load_balancer_task,
};
use crate::profile::ResolvedConfiguration;
use crate::running::RunningServiceDetails;
use crate::service::{DeployPriority, ServiceType};
use crate::settings::ServiceSettings;
use crate::staging::ConfigSource;

/// The account a service is deployed into
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDetails {
    /// Account name as the execution engine knows it
    pub name: String,
    /// Provider project the account's resources live in
    pub project: String,
    /// Deployment the published secrets belong to
    #[serde(default = "default_deployment")]
    pub deployment: String,
}

fn default_deployment() -> String {
    "default".to_string()
}

impl AccountDetails {
    pub fn new(name: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            project: project.into(),
            deployment: default_deployment(),
        }
    }

    pub fn with_deployment(mut self, deployment: impl Into<String>) -> Self {
        self.deployment = deployment.into();
        self
    }
}

/// Name of the resource group holding `version` of a service
pub fn versioned_name(service: ServiceType, version: u32) -> String {
    format!("{}-v{:03}", service.service_name(), version)
}

/// Recover the version from a resource group name.
///
/// Only names produced by [`versioned_name`] for this service parse; anything
/// else (another service sharing the prefix, a non-canonical number) is `None`.
pub fn parse_version(service: ServiceType, name: &str) -> Option<u32> {
    let prefix = format!("{}-v", service.service_name());
    let digits = name.strip_prefix(&prefix)?;
    if digits.len() < 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 3 && digits.starts_with('0') {
        return None;
    }
    digits.parse().ok()
}

/// The version a new deploy provisions
pub fn next_version(latest: Option<u32>) -> u32 {
    latest.map_or(0, |v| v + 1)
}

/// How to wait for new instances to come up
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// `None` waits forever
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: None,
        }
    }
}

impl PollPolicy {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Poll `probe` until it reports at least one running instance.
///
/// `probe` returns the number of running instances. Its errors abort the wait.
/// Returns the running count that satisfied the wait.
pub async fn wait_for_running<F, Fut>(
    policy: &PollPolicy,
    service: ServiceType,
    version: u32,
    mut probe: F,
) -> Result<usize>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<usize>>,
{
    let started = tokio::time::Instant::now();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let running = probe().await?;
        debug!(service = %service, version, attempt, running, "readiness poll");
        if running > 0 {
            return Ok(running);
        }

        if let Some(timeout) = policy.timeout {
            if started.elapsed() + policy.interval > timeout {
                return Err(DeployError::backend(
                    service.service_name(),
                    Some(version),
                    "wait-for-running",
                    format!("no instance reported running within {:?}", timeout),
                ));
            }
        }
        tokio::time::sleep(policy.interval).await;
    }
}

/// What `ensure_running` did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// An enabled version existed and nothing was provisioned
    AlreadyRunning(u32),
    /// A new version was provisioned and has a running instance
    Provisioned(u32),
}

impl EnsureOutcome {
    pub fn version(&self) -> u32 {
        match self {
            Self::AlreadyRunning(v) | Self::Provisioned(v) => *v,
        }
    }

    pub fn provisioned(&self) -> bool {
        matches!(self, Self::Provisioned(_))
    }
}

/// A management channel to one running instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub service: ServiceType,
    pub version: u32,
    pub instance: String,
    /// Local URL the channel is reachable at
    pub url: String,
}

/// A typed client bound to a service endpoint
pub trait ServiceClient: Sized {
    fn bind(endpoint: ServiceEndpoint) -> Result<Self>;
}

#[async_trait]
pub trait DistributedService: Send + Sync {
    fn service_type(&self) -> ServiceType;

    /// Provider id used in pipeline documents
    fn provider(&self) -> &str;

    fn health_providers(&self) -> Vec<String>;

    fn region(&self, settings: &ServiceSettings) -> String;

    fn availability_zones(&self, settings: &ServiceSettings) -> BTreeMap<String, Vec<String>> {
        BTreeMap::from([(self.region(settings), vec![settings.location.clone()])])
    }

    fn load_balancer_description(&self, account: &AccountDetails, settings: &ServiceSettings) -> Description;

    fn server_group_description(
        &self,
        account: &AccountDetails,
        settings: &ServiceSettings,
        config_sources: &[ConfigSource],
    ) -> Description;

    async fn get_running_service_details(
        &self,
        account: &AccountDetails,
        settings: &ServiceSettings,
    ) -> Result<RunningServiceDetails>;

    /// Publish this service's configuration for `version`
    async fn stage_profiles(
        &self,
        account: &AccountDetails,
        resolved: &ResolvedConfiguration,
        version: u32,
    ) -> Result<Vec<ConfigSource>>;

    /// Make sure some version is running, provisioning a new one when there is
    /// none or `recreate` is set. Blocks until the new version has a running
    /// instance.
    async fn ensure_running(
        &self,
        account: &AccountDetails,
        resolved: &ResolvedConfiguration,
        config_sources: &[ConfigSource],
        recreate: bool,
    ) -> Result<EnsureOutcome>;

    async fn connect(&self, account: &AccountDetails, settings: &ServiceSettings) -> Result<ServiceEndpoint>;

    /// Shell command an operator can run to reach the latest instance
    async fn connect_command(
        &self,
        account: &AccountDetails,
        settings: &ServiceSettings,
    ) -> Result<Option<String>>;

    /// Tear down one version. Absent versions are not an error.
    async fn delete_version(
        &self,
        account: &AccountDetails,
        settings: &ServiceSettings,
        version: u32,
    ) -> Result<()>;

    fn deploy_priority(&self) -> DeployPriority {
        self.service_type().deploy_priority()
    }

    fn required_to_bootstrap(&self) -> bool {
        self.service_type().required_to_bootstrap()
    }
}

pub fn pipeline_target(
    driver: &dyn DistributedService,
    account: &AccountDetails,
    settings: &ServiceSettings,
) -> PipelineTarget {
    PipelineTarget {
        service: driver.service_type(),
        cloud_provider: driver.provider().to_string(),
        account: account.name.clone(),
        region: driver.region(settings),
        health_providers: driver.health_providers(),
        availability_zones: driver.availability_zones(settings),
    }
}

/// Red/black deploy document for the service's next version
pub fn deploy_pipeline(
    driver: &dyn DistributedService,
    account: &AccountDetails,
    settings: &ServiceSettings,
    config_sources: &[ConfigSource],
    max_remaining: Option<u32>,
    scale_down: bool,
) -> Value {
    let target = pipeline_target(driver, account, settings);
    let server_group = driver.server_group_description(account, settings, config_sources);
    build_deploy_server_group_pipeline(&target, server_group, max_remaining, scale_down)
}

pub async fn rollback_pipeline(
    driver: &dyn DistributedService,
    account: &AccountDetails,
    settings: &ServiceSettings,
) -> Result<Value> {
    let details = driver.get_running_service_details(account, settings).await?;
    let plan = RollbackPlan::from_running(driver.service_type(), &details, settings)?;
    info!(
        service = %plan.service,
        ancestor = plan.ancestor,
        current = plan.current,
        "planned rollback"
    );
    Ok(plan.pipeline(&pipeline_target(driver, account, settings), settings))
}

pub fn upsert_load_balancer_task(
    driver: &dyn DistributedService,
    account: &AccountDetails,
    settings: &ServiceSettings,
) -> Value {
    let target = pipeline_target(driver, account, settings);
    let load_balancer = driver.load_balancer_description(account, settings);
    build_upsert_load_balancer_task(&target, load_balancer)
}

pub async fn connect_client<C: ServiceClient>(
    driver: &dyn DistributedService,
    account: &AccountDetails,
    settings: &ServiceSettings,
) -> Result<C> {
    let endpoint = driver.connect(account, settings).await?;
    C::bind(endpoint)
}

/// Result of deploying one service
#[derive(Clone, Debug)]
pub struct Deployment {
    pub service: ServiceType,
    pub outcome: EnsureOutcome,
    pub config_sources: Vec<ConfigSource>,
    pub pipeline: Value,
}

/// Stage, make sure the service runs, and build its deploy document.
///
/// Staging completes before anything is provisioned, so every config source a
/// new version references exists when its group is created.
pub async fn deploy_service(
    driver: &dyn DistributedService,
    account: &AccountDetails,
    resolved: &ResolvedConfiguration,
    recreate: bool,
) -> Result<Deployment> {
    let service = driver.service_type();
    let settings = resolved
        .service_settings(service)
        .ok_or_else(|| DeployError::invariant(format!("no settings resolved for {}", service)))?;

    let details = driver.get_running_service_details(account, settings).await?;
    let version = next_version(details.latest_enabled_version());
    let config_sources = driver.stage_profiles(account, resolved, version).await?;
    let outcome = driver
        .ensure_running(account, resolved, &config_sources, recreate)
        .await?;
    let pipeline = deploy_pipeline(driver, account, settings, &config_sources, None, true);

    Ok(Deployment {
        service,
        outcome,
        config_sources,
        pipeline,
    })
}
