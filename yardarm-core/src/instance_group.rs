//! Instance-group provider driver
//!
//! Each version of a service is a managed instance group named by
//! [`versioned_name`], built from its own instance template. Instances boot a
//! prebuilt image and pull their configuration from the secrets listed in the
//! template metadata.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::compute::{
    ComputeApi, ComputeError, InstanceGroupManager, InstanceTemplate, list_all_instance_group_managers,
};
use crate::driver::{
    AccountDetails, DistributedService, EnsureOutcome, PollPolicy, ServiceEndpoint, next_version,
    parse_version, versioned_name, wait_for_running,
};
use crate::error::{DeployError, Result};
use crate::pipeline::Description;
use crate::profile::ResolvedConfiguration;
use crate::running::{Instance, RunningServiceDetails};
use crate::secrets::SecretStore;
use crate::service::ServiceType;
use crate::settings::ServiceSettings;
use crate::staging::{self, ConfigSource, StagingCache, StagingContext};

pub const PROVIDER: &str = "google";

/// Metadata key holding the instance startup script
pub const STARTUP_SCRIPT_KEY: &str = "startup-script";
/// Metadata key holding the JSON list of config sources
pub const CONFIG_SOURCES_KEY: &str = "config-sources";

const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/devstorage.read_only",
    "https://www.googleapis.com/auth/logging.write",
    "https://www.googleapis.com/auth/monitoring.write",
    "https://www.googleapis.com/auth/servicecontrol",
    "https://www.googleapis.com/auth/service.management.readonly",
    "https://www.googleapis.com/auth/trace.append",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceGroupConfig {
    /// Project the service images are published in
    pub image_project: String,
    /// Version of the artifacts being deployed, e.g. "1.4.2"
    pub artifact_version: String,
    /// Directory on the image holding `startup.sh`
    pub startup_script_path: String,
    pub machine_type: String,
    pub poll: PollPolicy,
}

impl Default for InstanceGroupConfig {
    fn default() -> Self {
        Self {
            image_project: "marketplace-spinnaker-release".to_string(),
            artifact_version: "1.0.0".to_string(),
            startup_script_path: "/opt/spinnaker/install/".to_string(),
            machine_type: "n1-standard-1".to_string(),
            poll: PollPolicy::default(),
        }
    }
}

/// The instance-group driver for one service
#[derive(Clone)]
pub struct InstanceGroupService {
    service: ServiceType,
    compute: Arc<dyn ComputeApi>,
    secrets: Arc<dyn SecretStore>,
    cache: Arc<dyn StagingCache>,
    config: InstanceGroupConfig,
    last_stamp: Arc<AtomicU64>,
}

impl InstanceGroupService {
    pub fn new(
        service: ServiceType,
        compute: Arc<dyn ComputeApi>,
        secrets: Arc<dyn SecretStore>,
        cache: Arc<dyn StagingCache>,
    ) -> Self {
        Self {
            service,
            compute,
            secrets,
            cache,
            config: InstanceGroupConfig::default(),
            last_stamp: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_config(mut self, config: InstanceGroupConfig) -> Self {
        self.config = config;
        self
    }

    /// The same driver, for another service
    pub fn for_service(&self, service: ServiceType) -> Self {
        Self {
            service,
            ..self.clone()
        }
    }

    pub fn config(&self) -> &InstanceGroupConfig {
        &self.config
    }

    /// Image the service's instances boot from
    pub fn artifact_id(&self) -> String {
        format!(
            "projects/{}/global/images/spinnaker-{}-{}",
            self.config.image_project,
            self.service.artifact_name(),
            self.config.artifact_version.replace('.', "-")
        )
    }

    pub fn startup_script(&self) -> String {
        [
            "#!/usr/bin/env bash",
            "",
            "# AUTO-GENERATED BY YARDARM",
            "",
            &format!("{}startup.sh {}", self.config.startup_script_path, PROVIDER),
        ]
        .join("\n")
    }

    fn backend_error(&self, version: Option<u32>, operation: &'static str) -> impl FnOnce(ComputeError) -> DeployError {
        let service = self.service.service_name();
        move |e| DeployError::backend(service, version, operation, e.to_string())
    }

    /// Millisecond stamp for template names, strictly increasing per driver
    fn template_stamp(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let previous = self
            .last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or(now);
        now.max(previous + 1)
    }

    fn settings<'a>(&self, resolved: &'a ResolvedConfiguration) -> Result<&'a ServiceSettings> {
        resolved
            .service_settings(self.service)
            .ok_or_else(|| DeployError::invariant(format!("no settings resolved for {}", self.service)))
    }

    async fn build_template(
        &self,
        account: &AccountDetails,
        config_sources: &[ConfigSource],
    ) -> Result<InstanceTemplate> {
        let network = self
            .compute
            .ensure_network(&account.project)
            .await
            .map_err(self.backend_error(None, "ensure-network"))?;
        let service_account_email = self
            .compute
            .default_service_account(&account.project)
            .await
            .map_err(self.backend_error(None, "default-service-account"))?;

        let sources = serde_json::to_string(config_sources)
            .map_err(|e| DeployError::invariant(format!("config sources do not serialize: {}", e)))?;
        let metadata = BTreeMap::from([
            (STARTUP_SCRIPT_KEY.to_string(), self.startup_script()),
            (CONFIG_SOURCES_KEY.to_string(), sources),
        ]);

        Ok(InstanceTemplate {
            name: format!("{}-hal-{}", self.service.service_name(), self.template_stamp()),
            description: "yardarm-generated instance template for deploying Spinnaker".to_string(),
            machine_type: self.config.machine_type.clone(),
            source_image: self.artifact_id(),
            network,
            external_nat: true,
            service_account_email,
            scopes: SCOPES.iter().map(|s| s.to_string()).collect(),
            metadata,
        })
    }

    async fn running_count(&self, account: &AccountDetails, settings: &ServiceSettings, version: u32) -> Result<usize> {
        let instances = self
            .compute
            .list_managed_instances(&account.project, &settings.location, &versioned_name(self.service, version))
            .await
            .map_err(self.backend_error(Some(version), "list-instances"))?;
        Ok(instances.iter().filter(|i| i.is_running()).count())
    }

    /// First instance of the latest version, or why there is none
    async fn latest_instance(
        &self,
        account: &AccountDetails,
        settings: &ServiceSettings,
    ) -> Result<(u32, Instance)> {
        let details = self.get_running_service_details(account, settings).await?;
        let service = self.service.service_name();

        let version = details.latest_enabled_version().ok_or_else(|| DeployError::NotDeployed {
            service: service.clone(),
            reason: "no server groups have been deployed yet".to_string(),
        })?;
        let instance = details
            .instances_of(version)
            .first()
            .cloned()
            .ok_or_else(|| DeployError::NotDeployed {
                service,
                reason: format!("version {} has no instances", version),
            })?;
        Ok((version, instance))
    }
}

/// Region of a zone: the zone without its last `-suffix`
pub fn region_of(zone: &str) -> &str {
    zone.rsplit_once('-').map(|(region, _)| region).unwrap_or(zone)
}

#[async_trait]
impl DistributedService for InstanceGroupService {
    fn service_type(&self) -> ServiceType {
        self.service
    }

    fn provider(&self) -> &str {
        PROVIDER
    }

    fn health_providers(&self) -> Vec<String> {
        vec![PROVIDER.to_string()]
    }

    fn region(&self, settings: &ServiceSettings) -> String {
        region_of(&settings.location).to_string()
    }

    fn load_balancer_description(&self, account: &AccountDetails, settings: &ServiceSettings) -> Description {
        let mut lb = Description::new();
        lb.insert("loadBalancerName".into(), json!(self.service.service_name()));
        lb.insert("credentials".into(), json!(account.name));
        lb.insert("region".into(), json!(self.region(settings)));
        lb.insert("listeners".into(), json!([{ "port": settings.port.to_string() }]));
        if let Some(path) = &settings.health_endpoint {
            lb.insert(
                "healthCheck".into(),
                json!({ "port": settings.port.to_string(), "requestPath": path }),
            );
        }
        lb
    }

    fn server_group_description(
        &self,
        account: &AccountDetails,
        settings: &ServiceSettings,
        config_sources: &[ConfigSource],
    ) -> Description {
        let mut sg = Description::new();
        sg.insert("account".into(), json!(account.name));
        sg.insert("application".into(), json!(crate::pipeline::APPLICATION));
        sg.insert("stack".into(), json!(self.service.canonical_name()));
        sg.insert("image".into(), json!(self.artifact_id()));
        sg.insert("instanceType".into(), json!(self.config.machine_type));
        sg.insert("zone".into(), json!(settings.location));
        sg.insert("targetSize".into(), json!(settings.target_size.to_string()));
        sg.insert(
            "instanceMetadata".into(),
            json!({
                STARTUP_SCRIPT_KEY: self.startup_script(),
                CONFIG_SOURCES_KEY: config_sources,
            }),
        );
        sg
    }

    async fn get_running_service_details(
        &self,
        account: &AccountDetails,
        settings: &ServiceSettings,
    ) -> Result<RunningServiceDetails> {
        let groups = list_all_instance_group_managers(self.compute.as_ref(), &account.project, &settings.location)
            .await
            .map_err(self.backend_error(None, "list-instance-groups"))?;

        let mut instances = BTreeMap::new();
        for group in groups {
            let Some(version) = parse_version(self.service, &group.name) else {
                continue;
            };
            let managed = self
                .compute
                .list_managed_instances(&account.project, &settings.location, &group.name)
                .await
                .map_err(self.backend_error(Some(version), "list-instances"))?;

            let group_instances = managed
                .iter()
                .map(|m| Instance {
                    id: m.name().to_string(),
                    location: settings.location.clone(),
                    running: m.is_running(),
                    healthy: m.healthy,
                })
                .collect();
            instances.insert(version, group_instances);
        }

        let mut details = RunningServiceDetails::from_versions(instances);
        details.artifact_id = Some(self.artifact_id());
        details.internal_endpoint = Some(settings.base_url());
        Ok(details)
    }

    async fn stage_profiles(
        &self,
        account: &AccountDetails,
        resolved: &ResolvedConfiguration,
        version: u32,
    ) -> Result<Vec<ConfigSource>> {
        let ctx = StagingContext {
            deployment: &account.deployment,
            secrets: self.secrets.as_ref(),
            cache: self.cache.as_ref(),
        };
        staging::stage_profiles(&ctx, self.service, version, resolved).await
    }

    async fn ensure_running(
        &self,
        account: &AccountDetails,
        resolved: &ResolvedConfiguration,
        config_sources: &[ConfigSource],
        recreate: bool,
    ) -> Result<EnsureOutcome> {
        let settings = self.settings(resolved)?;
        let details = self.get_running_service_details(account, settings).await?;
        let latest = details.latest_enabled_version();

        if let (false, Some(version)) = (recreate, latest) {
            info!(
                service = %self.service,
                version,
                "already deployed and not safe to restart"
            );
            return Ok(EnsureOutcome::AlreadyRunning(version));
        }

        let version = next_version(latest);
        let template = self.build_template(account, config_sources).await?;
        let operation = self
            .compute
            .insert_instance_template(&account.project, &template)
            .await
            .map_err(self.backend_error(Some(version), "create-instance-template"))?;
        self.compute
            .wait_for_operation(&account.project, &operation)
            .await
            .map_err(self.backend_error(Some(version), "create-instance-template"))?;

        let name = versioned_name(self.service, version);
        info!(
            service = %self.service,
            version,
            group = %name,
            target_size = settings.target_size,
            "provisioning instance group"
        );
        let manager = InstanceGroupManager {
            name: name.clone(),
            base_instance_name: name,
            instance_template: operation.target_link,
            target_size: settings.target_size,
        };
        let operation = self
            .compute
            .insert_instance_group_manager(&account.project, &settings.location, &manager)
            .await
            .map_err(self.backend_error(Some(version), "create-instance-group"))?;
        self.compute
            .wait_for_operation(&account.project, &operation)
            .await
            .map_err(self.backend_error(Some(version), "create-instance-group"))?;

        let running = wait_for_running(&self.config.poll, self.service, version, || {
            self.running_count(account, settings, version)
        })
        .await?;
        info!(service = %self.service, version, running, "version running");
        Ok(EnsureOutcome::Provisioned(version))
    }

    async fn connect(&self, account: &AccountDetails, settings: &ServiceSettings) -> Result<ServiceEndpoint> {
        let (version, instance) = self.latest_instance(account, settings).await?;
        let url = self
            .compute
            .open_tunnel(&account.project, &settings.location, &instance.id, settings.port)
            .await
            .map_err(self.backend_error(Some(version), "open-tunnel"))?;

        Ok(ServiceEndpoint {
            service: self.service,
            version,
            instance: instance.id,
            url,
        })
    }

    async fn connect_command(
        &self,
        account: &AccountDetails,
        settings: &ServiceSettings,
    ) -> Result<Option<String>> {
        match self.latest_instance(account, settings).await {
            Ok((_, instance)) => Ok(Some(format!(
                "gcloud compute ssh {} --project {} --zone {} -- -L {port}:localhost:{port} -N",
                instance.id,
                account.project,
                settings.location,
                port = settings.port
            ))),
            Err(DeployError::NotDeployed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete_version(
        &self,
        account: &AccountDetails,
        settings: &ServiceSettings,
        version: u32,
    ) -> Result<()> {
        let name = versioned_name(self.service, version);
        let group = self
            .compute
            .get_instance_group_manager(&account.project, &settings.location, &name)
            .await
            .map_err(self.backend_error(Some(version), "get-instance-group"))?;

        let Some(group) = group else {
            info!(service = %self.service, version, "version already absent");
            return Ok(());
        };

        if let Some(operation) = self
            .compute
            .delete_instance_group_manager(&account.project, &settings.location, &name)
            .await
            .map_err(self.backend_error(Some(version), "delete-instance-group"))?
        {
            self.compute
                .wait_for_operation(&account.project, &operation)
                .await
                .map_err(self.backend_error(Some(version), "delete-instance-group"))?;
        }

        let template = group
            .instance_template
            .rsplit_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&group.instance_template);
        if let Some(operation) = self
            .compute
            .delete_instance_template(&account.project, template)
            .await
            .map_err(self.backend_error(Some(version), "delete-instance-template"))?
        {
            self.compute
                .wait_for_operation(&account.project, &operation)
                .await
                .map_err(self.backend_error(Some(version), "delete-instance-template"))?;
        }

        info!(service = %self.service, version, group = %name, "deleted version");
        Ok(())
    }
}
