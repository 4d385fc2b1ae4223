//! Generated profiles
//!
//! Rendering configuration files is the job of a profile generator outside this
//! crate. What the deployment core needs from it is the list of files it staged for
//! each service: where each file was written, where it must appear on a running
//! instance, and which other files it references.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::service::ServiceType;
use crate::settings::ServiceSettings;

/// Name of the monitoring daemon's own configuration profile
pub const MONITORING_PROFILE_NAME: &str = "monitoring.yml";

/// Name of the monitoring registry entry generated for a monitored service
pub fn registry_profile_name(service: ServiceType) -> String {
    format!("registry/{}.yml", service.canonical_name())
}

/// One configuration file produced by the profile generator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    /// Logical profile name, e.g. "front50.yml"
    pub name: String,
    /// Where the generator wrote the file
    pub staged_path: PathBuf,
    /// Where the running instance must see the file
    pub output_file: PathBuf,
    /// Other files this profile references by path (certificates, keystores, ...)
    #[serde(default)]
    pub required_files: Vec<PathBuf>,
}

impl StagedFile {
    pub fn new(name: impl Into<String>, staged_path: impl Into<PathBuf>, output_file: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            staged_path: staged_path.into(),
            output_file: output_file.into(),
            required_files: Vec::new(),
        }
    }

    pub fn with_required_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.required_files.push(path.into());
        self
    }
}

/// Profile name -> staged file
pub type GeneratedProfiles = BTreeMap<String, StagedFile>;

/// Produces the configuration files for a service
pub trait ProfileGenerator: Send + Sync {
    fn generate_profiles(
        &self,
        service: ServiceType,
        settings: &ServiceSettings,
        all_settings: &BTreeMap<ServiceType, ServiceSettings>,
    ) -> Result<GeneratedProfiles>;
}

/// Settings plus generated profiles for every service in a deployment
#[derive(Clone, Debug, Default)]
pub struct ResolvedConfiguration {
    pub settings: BTreeMap<ServiceType, ServiceSettings>,
    pub profiles: BTreeMap<ServiceType, GeneratedProfiles>,
}

impl ResolvedConfiguration {
    pub fn new(settings: BTreeMap<ServiceType, ServiceSettings>) -> Self {
        Self {
            settings,
            profiles: BTreeMap::new(),
        }
    }

    /// Run the generator for every enabled service
    pub fn generate(
        settings: BTreeMap<ServiceType, ServiceSettings>,
        generator: &dyn ProfileGenerator,
    ) -> Result<Self> {
        let mut profiles = BTreeMap::new();
        for (service, service_settings) in &settings {
            if !service_settings.enabled {
                continue;
            }
            let generated = generator.generate_profiles(*service, service_settings, &settings)?;
            profiles.insert(*service, generated);
        }
        Ok(Self { settings, profiles })
    }

    pub fn with_profiles(mut self, service: ServiceType, profiles: GeneratedProfiles) -> Self {
        self.profiles.insert(service, profiles);
        self
    }

    pub fn service_settings(&self, service: ServiceType) -> Option<&ServiceSettings> {
        self.settings.get(&service)
    }

    pub fn profiles_for(&self, service: ServiceType) -> Option<&GeneratedProfiles> {
        self.profiles.get(&service)
    }

    /// Whether the monitoring daemon is part of this deployment
    pub fn monitoring_enabled(&self) -> bool {
        self.service_settings(ServiceType::MonitoringDaemon)
            .is_some_and(|s| s.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OneFileGenerator;

    impl ProfileGenerator for OneFileGenerator {
        fn generate_profiles(
            &self,
            service: ServiceType,
            _settings: &ServiceSettings,
            _all: &BTreeMap<ServiceType, ServiceSettings>,
        ) -> Result<GeneratedProfiles> {
            let name = format!("{}.yml", service.canonical_name());
            let file = StagedFile::new(
                name.clone(),
                format!("/tmp/staging/{}", name),
                format!("/opt/spinnaker/config/{}", name),
            );
            Ok(BTreeMap::from([(name, file)]))
        }
    }

    #[test]
    fn test_generate_skips_disabled_services() {
        let mut settings = BTreeMap::new();
        settings.insert(ServiceType::Front50, ServiceSettings::defaults(ServiceType::Front50));
        let mut deck = ServiceSettings::defaults(ServiceType::Deck);
        deck.enabled = false;
        settings.insert(ServiceType::Deck, deck);

        let resolved = ResolvedConfiguration::generate(settings, &OneFileGenerator).unwrap();
        assert!(resolved.profiles_for(ServiceType::Front50).is_some());
        assert!(resolved.profiles_for(ServiceType::Deck).is_none());
        assert!(!resolved.monitoring_enabled());
    }

    #[test]
    fn test_registry_profile_name() {
        assert_eq!(registry_profile_name(ServiceType::Front50), "registry/front50.yml");
    }
}
