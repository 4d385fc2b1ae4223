//! Profile generation for offline previews
//!
//! Each service gets one profile holding its effective settings. When the
//! monitoring daemon is deployed it also gets a registry entry per monitored
//! service plus its own daemon profile.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use yardarm_core::error::{DeployError, Result};
use yardarm_core::profile::{
    GeneratedProfiles, MONITORING_PROFILE_NAME, ProfileGenerator, StagedFile, registry_profile_name,
};
use yardarm_core::service::ServiceType;
use yardarm_core::settings::ServiceSettings;

const CONFIG_ROOT: &str = "/opt/spinnaker/config";
const MONITORING_ROOT: &str = "/opt/spinnaker-monitoring";

pub struct SettingsProfileGenerator {
    staging_dir: PathBuf,
}

#[derive(Serialize)]
struct RegistryEntry<'a> {
    metrics_url: String,
    service: &'a str,
}

impl SettingsProfileGenerator {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
        }
    }

    fn write<T: Serialize>(&self, file_name: &str, value: &T) -> Result<PathBuf> {
        let yaml = serde_yaml::to_string(value)
            .map_err(|e| DeployError::invariant(format!("profile {} does not serialize: {}", file_name, e)))?;
        std::fs::create_dir_all(&self.staging_dir)?;
        let path = self.staging_dir.join(file_name);
        std::fs::write(&path, yaml)?;
        Ok(path)
    }

    fn staged(&self, name: &str, file_name: &str, output: impl AsRef<Path>, value: &impl Serialize) -> Result<StagedFile> {
        let staged_path = self.write(file_name, value)?;
        Ok(StagedFile::new(name, staged_path, output.as_ref()))
    }
}

impl ProfileGenerator for SettingsProfileGenerator {
    fn generate_profiles(
        &self,
        service: ServiceType,
        settings: &ServiceSettings,
        all_settings: &BTreeMap<ServiceType, ServiceSettings>,
    ) -> Result<GeneratedProfiles> {
        let mut profiles = GeneratedProfiles::new();

        let name = format!("{}.yml", service.canonical_name());
        let profile = self.staged(&name, &name, Path::new(CONFIG_ROOT).join(&name), settings)?;
        profiles.insert(name, profile);

        if service == ServiceType::MonitoringDaemon {
            for (other, other_settings) in all_settings {
                if !other_settings.monitored || !other_settings.enabled {
                    continue;
                }
                let registry = registry_profile_name(*other);
                let entry = RegistryEntry {
                    metrics_url: format!("{}/spectator/metrics", other_settings.base_url()),
                    service: other.canonical_name(),
                };
                let file_name = format!("registry-{}.yml", other.canonical_name());
                let profile = self.staged(&registry, &file_name, Path::new(MONITORING_ROOT).join(&registry), &entry)?;
                profiles.insert(registry, profile);
            }

            let daemon = BTreeMap::from([("port", settings.port)]);
            let profile = self.staged(
                MONITORING_PROFILE_NAME,
                MONITORING_PROFILE_NAME,
                Path::new(MONITORING_ROOT).join("config").join(MONITORING_PROFILE_NAME),
                &daemon,
            )?;
            profiles.insert(MONITORING_PROFILE_NAME.to_string(), profile);
        }

        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitoring_daemon_gets_registry_entries() {
        let dir = tempfile::tempdir().unwrap();
        let generator = SettingsProfileGenerator::new(dir.path());
        let all: BTreeMap<_, _> = [ServiceType::Front50, ServiceType::Deck, ServiceType::MonitoringDaemon]
            .into_iter()
            .map(|s| (s, ServiceSettings::defaults(s)))
            .collect();

        let profiles = generator
            .generate_profiles(ServiceType::MonitoringDaemon, &all[&ServiceType::MonitoringDaemon], &all)
            .unwrap();

        assert!(profiles.contains_key("monitoring-daemon.yml"));
        assert!(profiles.contains_key(MONITORING_PROFILE_NAME));
        assert!(profiles.contains_key(&registry_profile_name(ServiceType::Front50)));
        // deck is not monitored
        assert!(!profiles.contains_key(&registry_profile_name(ServiceType::Deck)));
        assert!(profiles.values().all(|p| p.staged_path.exists()));
    }
}
