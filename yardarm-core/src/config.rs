//! Deployment plan files
//!
//! A plan names the account to deploy into, how to wait for instances, and
//! per-service overrides of the default settings:
//!
//! ```yaml
//! name: default
//! account:
//!   name: my-gce
//!   project: my-project
//! default_location: us-central1-f
//! poll:
//!   interval_ms: 1000
//! services:
//!   front50:
//!     target_size: 2
//!   gate:
//!     override_base_url: https://gate.example.com
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::driver::{AccountDetails, PollPolicy};
use crate::instance_group::InstanceGroupConfig;
use crate::service::ServiceType;
use crate::settings::{ServiceSettings, validate_uri};

pub const PLAN_ENV_VAR: &str = "YARDARM_PLAN";
pub const PLAN_FILE_NAMES: [&str; 4] = ["yardarm.yaml", "yardarm.yml", ".yardarm.yaml", ".yardarm.yml"];

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PollConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,
    /// Absent means wait forever
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_poll_interval() -> u64 {
    1000
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
            timeout_ms: None,
        }
    }
}

/// Where service images come from and what they run on
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ArtifactConfig {
    #[serde(default = "default_image_project")]
    pub image_project: String,
    #[serde(default = "default_artifact_version")]
    pub version: String,
    #[serde(default = "default_machine_type")]
    pub machine_type: String,
    #[serde(default = "default_startup_script_path")]
    pub startup_script_path: String,
}

fn default_image_project() -> String {
    InstanceGroupConfig::default().image_project
}

fn default_artifact_version() -> String {
    InstanceGroupConfig::default().artifact_version
}

fn default_machine_type() -> String {
    InstanceGroupConfig::default().machine_type
}

fn default_startup_script_path() -> String {
    InstanceGroupConfig::default().startup_script_path
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            image_project: default_image_project(),
            version: default_artifact_version(),
            machine_type: default_machine_type(),
            startup_script_path: default_startup_script_path(),
        }
    }
}

/// Partial settings for one service; unset fields keep their defaults
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceOverride {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub scheme: Option<String>,
    #[serde(default)]
    pub health_endpoint: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub artifact_id: Option<String>,
    #[serde(default)]
    pub override_base_url: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub monitored: Option<bool>,
    #[serde(default)]
    pub safe_to_update: Option<bool>,
    #[serde(default)]
    pub target_size: Option<u32>,
}

impl ServiceOverride {
    fn apply(&self, mut settings: ServiceSettings) -> ServiceSettings {
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(address) = &self.address {
            settings.address = address.clone();
        }
        if let Some(host) = &self.host {
            settings.host = host.clone();
        }
        if let Some(scheme) = &self.scheme {
            settings.scheme = scheme.clone();
        }
        if let Some(path) = &self.health_endpoint {
            settings.health_endpoint = Some(path.clone());
        }
        if self.username.is_some() {
            settings.username = self.username.clone();
        }
        if self.password.is_some() {
            settings.password = self.password.clone();
        }
        settings
            .env
            .extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        if self.artifact_id.is_some() {
            settings.artifact_id = self.artifact_id.clone();
        }
        if self.override_base_url.is_some() {
            settings.override_base_url = self.override_base_url.clone();
        }
        if let Some(location) = &self.location {
            settings.location = location.clone();
        }
        if let Some(enabled) = self.enabled {
            settings.enabled = enabled;
        }
        if let Some(monitored) = self.monitored {
            settings.monitored = monitored;
        }
        if let Some(safe) = self.safe_to_update {
            settings.safe_to_update = safe;
        }
        if let Some(size) = self.target_size {
            settings.target_size = size;
        }
        settings
    }
}

/// Root plan document
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DeploymentPlan {
    /// Deployment name; secrets are published under it
    #[serde(default = "default_name")]
    pub name: String,

    pub account: AccountConfig,

    /// Location for services that do not set their own
    #[serde(default)]
    pub default_location: Option<String>,

    /// Where generated profiles are staged
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,

    #[serde(default)]
    pub poll: PollConfig,

    #[serde(default)]
    pub artifacts: ArtifactConfig,

    /// Canonical service name -> overrides
    #[serde(default)]
    pub services: BTreeMap<String, ServiceOverride>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct AccountConfig {
    pub name: String,
    pub project: String,
}

fn default_name() -> String {
    "default".into()
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unknown service '{name}'")]
    UnknownService { name: String },

    #[error("service '{service}' must run at least one instance")]
    InvalidTargetSize { service: String },

    #[error("service '{service}' has an invalid override URL '{url}': {reason}")]
    InvalidUrl {
        service: String,
        url: String,
        reason: String,
    },

    #[error("service '{service}' has no location and the plan sets no default_location")]
    MissingLocation { service: String },

    #[error("no plan file found, searched: {searched:?}")]
    NotFound { searched: Vec<PathBuf> },
}

impl DeploymentPlan {
    /// Load a plan from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load a plan from a string (useful for testing)
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let plan: DeploymentPlan = serde_yaml::from_str(content)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Search for a plan in standard locations
    pub fn discover(start_dir: &Path) -> Result<(PathBuf, Self), ConfigError> {
        let mut searched = Vec::new();

        if let Ok(env_path) = std::env::var(PLAN_ENV_VAR) {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Ok((path.clone(), Self::load(&path)?));
            }
            searched.push(path);
        }

        let mut dir = Some(start_dir);
        while let Some(current) = dir {
            for name in &PLAN_FILE_NAMES {
                let path = current.join(name);
                if path.exists() {
                    return Ok((path.clone(), Self::load(&path)?));
                }
                searched.push(path);
            }
            dir = current.parent();
        }

        Err(ConfigError::NotFound { searched })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for name in self.services.keys() {
            ServiceType::resolve(name).map_err(|_| ConfigError::UnknownService { name: name.clone() })?;
        }

        for (service, settings) in self.all_service_settings() {
            let name = service.canonical_name().to_string();

            if settings.target_size == 0 {
                return Err(ConfigError::InvalidTargetSize { service: name });
            }

            if let Some(url) = settings.override_base_url.as_deref().filter(|u| !u.is_empty()) {
                if let Err(e) = validate_uri(url) {
                    return Err(ConfigError::InvalidUrl {
                        service: name,
                        url: url.to_string(),
                        reason: e.to_string(),
                    });
                }
            }

            if settings.enabled && !settings.sidecar && settings.location.is_empty() {
                return Err(ConfigError::MissingLocation { service: name });
            }
        }
        Ok(())
    }

    fn override_for(&self, service: ServiceType) -> Option<&ServiceOverride> {
        self.services
            .iter()
            .find(|(name, _)| ServiceType::resolve(name).is_ok_and(|ty| ty == service))
            .map(|(_, o)| o)
    }

    /// Effective settings of a service: defaults, then the plan's location, then overrides
    pub fn service_settings(&self, service: ServiceType) -> ServiceSettings {
        let mut settings = ServiceSettings::defaults(service);
        if let Some(location) = &self.default_location {
            settings.location = location.clone();
        }
        match self.override_for(service) {
            Some(o) => o.apply(settings),
            None => settings,
        }
    }

    /// Effective settings of every registered service
    pub fn all_service_settings(&self) -> BTreeMap<ServiceType, ServiceSettings> {
        ServiceType::ALL
            .iter()
            .map(|&ty| (ty, self.service_settings(ty)))
            .collect()
    }

    pub fn account_details(&self) -> AccountDetails {
        AccountDetails::new(&self.account.name, &self.account.project).with_deployment(&self.name)
    }

    pub fn poll_policy(&self) -> PollPolicy {
        let policy = PollPolicy::default().with_interval(Duration::from_millis(self.poll.interval_ms));
        match self.poll.timeout_ms {
            Some(ms) => policy.with_timeout(Duration::from_millis(ms)),
            None => policy,
        }
    }

    pub fn instance_group_config(&self) -> InstanceGroupConfig {
        InstanceGroupConfig {
            image_project: self.artifacts.image_project.clone(),
            artifact_version: self.artifacts.version.clone(),
            startup_script_path: self.artifacts.startup_script_path.clone(),
            machine_type: self.artifacts.machine_type.clone(),
            poll: self.poll_policy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
name: staging
account:
  name: my-gce
  project: my-project
default_location: us-central1-f
poll:
  interval_ms: 500
  timeout_ms: 60000
services:
  front50:
    target_size: 2
  Clouddriver_Bootstrap:
    location: us-east1-b
  gate:
    override_base_url: https://gate.example.com:9999/api
    env:
      EXTRA: "1"
"#;

    #[test]
    fn test_parse_plan() {
        let plan = DeploymentPlan::from_str(PLAN).unwrap();
        assert_eq!(plan.name, "staging");
        assert_eq!(plan.services.len(), 3);

        let account = plan.account_details();
        assert_eq!(account.project, "my-project");
        assert_eq!(account.deployment, "staging");

        let policy = plan.poll_policy();
        assert_eq!(policy.interval, Duration::from_millis(500));
        assert_eq!(policy.timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_overrides_merge_onto_defaults() {
        let plan = DeploymentPlan::from_str(PLAN).unwrap();

        let front50 = plan.service_settings(ServiceType::Front50);
        assert_eq!(front50.target_size, 2);
        assert_eq!(front50.port, 8080);
        assert_eq!(front50.location, "us-central1-f");

        let bootstrap = plan.service_settings(ServiceType::ClouddriverBootstrap);
        assert_eq!(bootstrap.location, "us-east1-b");

        let gate = plan.service_settings(ServiceType::Gate);
        assert_eq!(gate.base_url(), "https://gate.example.com:9999/api");
        assert_eq!(gate.env.get("EXTRA").map(String::as_str), Some("1"));

        let echo = plan.service_settings(ServiceType::Echo);
        assert_eq!(echo, ServiceSettings::defaults(ServiceType::Echo).with_location("us-central1-f"));
    }

    #[test]
    fn test_defaults_without_poll_section() {
        let plan = DeploymentPlan::from_str(
            "account: {name: a, project: p}\ndefault_location: us-central1-f\n",
        )
        .unwrap();
        assert_eq!(plan.name, "default");
        assert_eq!(plan.poll_policy(), PollPolicy::default());
        assert_eq!(plan.instance_group_config().machine_type, "n1-standard-1");
    }

    #[test]
    fn test_unknown_service() {
        let yaml = "account: {name: a, project: p}\ndefault_location: z-a\nservices:\n  nonexistent: {}\n";
        let result = DeploymentPlan::from_str(yaml);
        assert!(matches!(result, Err(ConfigError::UnknownService { ref name }) if name == "nonexistent"));
    }

    #[test]
    fn test_zero_target_size() {
        let yaml = "account: {name: a, project: p}\ndefault_location: z-a\nservices:\n  orca:\n    target_size: 0\n";
        let result = DeploymentPlan::from_str(yaml);
        assert!(matches!(result, Err(ConfigError::InvalidTargetSize { .. })));
    }

    #[test]
    fn test_invalid_override_url() {
        let yaml = "account: {name: a, project: p}\ndefault_location: z-a\nservices:\n  gate:\n    override_base_url: \"https://x.example/a b%zz\"\n";
        let result = DeploymentPlan::from_str(yaml);
        assert!(matches!(result, Err(ConfigError::InvalidUrl { .. })));
    }

    #[test]
    fn test_missing_location() {
        let yaml = "account: {name: a, project: p}\nservices:\n  front50: {}\n";
        let result = DeploymentPlan::from_str(yaml);
        assert!(matches!(result, Err(ConfigError::MissingLocation { .. })));

        let yaml = "account: {name: a, project: p}\ndefault_location: z-a\nservices:\n  front50:\n    location: \"\"\n";
        let result = DeploymentPlan::from_str(yaml);
        assert!(matches!(
            result,
            Err(ConfigError::MissingLocation { service }) if service == "front50"
        ));

        let sidecar = "account: {name: a, project: p}\ndefault_location: z-a\nservices:\n  consul-client:\n    location: \"\"\n";
        assert!(DeploymentPlan::from_str(sidecar).is_ok());

        let disabled = "account: {name: a, project: p}\ndefault_location: z-a\nservices:\n  front50:\n    location: \"\"\n    enabled: false\n";
        assert!(DeploymentPlan::from_str(disabled).is_ok());
    }

    #[test]
    fn test_unlisted_services_need_a_location() {
        let result = DeploymentPlan::from_str("account: {name: a, project: p}\n");
        assert!(matches!(result, Err(ConfigError::MissingLocation { .. })));

        let plan = DeploymentPlan::from_str("account: {name: a, project: p}\ndefault_location: us-central1-f\n").unwrap();
        assert_eq!(plan.service_settings(ServiceType::Front50).location, "us-central1-f");
    }

    #[test]
    fn test_unknown_override_field() {
        let yaml = "account: {name: a, project: p}\ndefault_location: z-a\nservices:\n  front50:\n    prot: 1\n";
        assert!(matches!(DeploymentPlan::from_str(yaml), Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_discover_walks_up() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(root.path().join(".yardarm.yml"), PLAN).unwrap();

        let (path, plan) = DeploymentPlan::discover(&nested).unwrap();
        assert_eq!(path, root.path().join(".yardarm.yml"));
        assert_eq!(plan.name, "staging");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = DeploymentPlan::load(&dir.path().join("nope.yaml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
