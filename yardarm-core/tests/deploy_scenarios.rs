use std::collections::BTreeMap;
use std::sync::Arc;

use yardarm_core::compute::InMemoryCompute;
use yardarm_core::driver::{
    AccountDetails, DistributedService, EnsureOutcome, ServiceClient, ServiceEndpoint, connect_client,
    deploy_service, rollback_pipeline, upsert_load_balancer_task,
};
use yardarm_core::error::{DeployError, ErrorClass, Result};
use yardarm_core::instance_group::InstanceGroupService;
use yardarm_core::pipeline::{DESTROY_REF_ID, ENABLE_REF_ID, RESIZE_REF_ID};
use yardarm_core::profile::{
    GeneratedProfiles, MONITORING_PROFILE_NAME, ProfileGenerator, ResolvedConfiguration, StagedFile,
    registry_profile_name,
};
use yardarm_core::secrets::InMemorySecretStore;
use yardarm_core::service::{ServiceType, deploy_order};
use yardarm_core::settings::ServiceSettings;
use yardarm_core::staging::MemoryStagingCache;

const ZONE: &str = "us-central1-f";
const PROJECT: &str = "my-project";

/// Writes one profile per service into the staging cache
struct CacheProfileGenerator {
    cache: Arc<MemoryStagingCache>,
}

impl ProfileGenerator for CacheProfileGenerator {
    fn generate_profiles(
        &self,
        service: ServiceType,
        _settings: &ServiceSettings,
        all_settings: &BTreeMap<ServiceType, ServiceSettings>,
    ) -> Result<GeneratedProfiles> {
        let mut profiles = GeneratedProfiles::new();
        let name = format!("{}.yml", service.canonical_name());
        let staged = format!("/staging/{}", name);
        self.cache.insert(&staged, format!("service: {}\n", service));

        let mut profile = StagedFile::new(&name, &staged, format!("/opt/spinnaker/config/{}", name));
        if service == ServiceType::Front50 {
            self.cache.insert("/home/op/.gcp/key.json", "{}");
            profile = profile.with_required_file("/home/op/.gcp/key.json");
        }
        profiles.insert(name, profile);

        if service == ServiceType::MonitoringDaemon {
            for (other, settings) in all_settings {
                if !settings.monitored {
                    continue;
                }
                let registry = registry_profile_name(*other);
                let staged = format!("/staging/{}", registry.replace('/', "-"));
                self.cache.insert(&staged, "metrics_url: x\n");
                profiles.insert(
                    registry.clone(),
                    StagedFile::new(&registry, &staged, format!("/opt/spinnaker-monitoring/{}", registry)),
                );
            }
            let staged = format!("/staging/{}", MONITORING_PROFILE_NAME);
            self.cache.insert(&staged, "server: {}\n");
            profiles.insert(
                MONITORING_PROFILE_NAME.to_string(),
                StagedFile::new(
                    MONITORING_PROFILE_NAME,
                    &staged,
                    format!("/opt/spinnaker-monitoring/config/{}", MONITORING_PROFILE_NAME),
                ),
            );
        }
        Ok(profiles)
    }
}

struct Harness {
    compute: Arc<InMemoryCompute>,
    secrets: Arc<InMemorySecretStore>,
    cache: Arc<MemoryStagingCache>,
    account: AccountDetails,
}

impl Harness {
    fn new() -> Self {
        Self {
            compute: Arc::new(InMemoryCompute::new()),
            secrets: Arc::new(InMemorySecretStore::new()),
            cache: Arc::new(MemoryStagingCache::new("/staging")),
            account: AccountDetails::new("my-gce", PROJECT),
        }
    }

    fn driver(&self, service: ServiceType) -> InstanceGroupService {
        InstanceGroupService::new(service, self.compute.clone(), self.secrets.clone(), self.cache.clone())
    }

    fn resolved(&self, services: &[ServiceType]) -> ResolvedConfiguration {
        let settings = services
            .iter()
            .map(|&s| (s, ServiceSettings::defaults(s).with_location(ZONE)))
            .collect();
        let generator = CacheProfileGenerator {
            cache: self.cache.clone(),
        };
        ResolvedConfiguration::generate(settings, &generator).unwrap()
    }
}

#[tokio::test(start_paused = true)]
async fn test_front50_first_deploy_provisions_version_zero() {
    let h = Harness::new();
    let driver = h.driver(ServiceType::Front50);
    let resolved = h.resolved(&[ServiceType::Front50]);
    let settings = resolved.service_settings(ServiceType::Front50).unwrap();

    let before = driver.get_running_service_details(&h.account, settings).await.unwrap();
    assert_eq!(before.latest_enabled_version(), None);

    let outcome = driver
        .ensure_running(&h.account, &resolved, &[], false)
        .await
        .unwrap();
    assert_eq!(outcome, EnsureOutcome::Provisioned(0));

    let details = driver.get_running_service_details(&h.account, settings).await.unwrap();
    assert_eq!(details.latest_enabled_version(), Some(0));
    assert!(details.running_count(0) >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_ensure_running_is_idempotent() {
    let h = Harness::new();
    let driver = h.driver(ServiceType::Orca);
    let resolved = h.resolved(&[ServiceType::Orca]);

    driver.ensure_running(&h.account, &resolved, &[], false).await.unwrap();
    let inserts = h.compute.group_inserts();

    for _ in 0..3 {
        let outcome = driver
            .ensure_running(&h.account, &resolved, &[], false)
            .await
            .unwrap();
        assert_eq!(outcome, EnsureOutcome::AlreadyRunning(0));
    }
    assert_eq!(h.compute.group_inserts(), inserts);
}

#[tokio::test(start_paused = true)]
async fn test_recreate_provisions_next_version() {
    let h = Harness::new();
    let driver = h.driver(ServiceType::Clouddriver);
    let resolved = h.resolved(&[ServiceType::Clouddriver]);

    for expected in 0..3 {
        let outcome = driver
            .ensure_running(&h.account, &resolved, &[], true)
            .await
            .unwrap();
        assert_eq!(outcome, EnsureOutcome::Provisioned(expected));
    }
    assert_eq!(
        h.compute.group_names(PROJECT, ZONE),
        vec!["spin-clouddriver-v000", "spin-clouddriver-v001", "spin-clouddriver-v002"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_deploy_service_stages_before_provisioning() {
    let h = Harness::new();
    let driver = h.driver(ServiceType::Front50);
    let resolved = h.resolved(&[ServiceType::Front50, ServiceType::MonitoringDaemon]);

    let deployment = deploy_service(&driver, &h.account, &resolved, false).await.unwrap();
    assert_eq!(deployment.outcome, EnsureOutcome::Provisioned(0));

    // registry entry, daemon profile, own profile, one dependency
    assert_eq!(deployment.config_sources.len(), 4);
    assert!(deployment.config_sources[0].id.starts_with("hal-front50-registry/front50.yml-0-"));
    assert!(deployment.config_sources[2].id.starts_with("hal-front50-profile-front50.yml-0-"));
    assert!(deployment.config_sources[3].id.starts_with("hal-front50-dependencies-/home/op/.gcp/key.json-0-"));
    assert_eq!(
        deployment.config_sources[3].mount_path,
        std::path::PathBuf::from("/home/op/.gcp/key.json")
    );

    let published = h.secrets.names("default").await;
    assert_eq!(published.len(), 4);
    for source in &deployment.config_sources {
        assert!(published.contains(&source.id));
    }

    let template = h.compute.template_names(PROJECT).pop().unwrap();
    let metadata = &h.compute.template(PROJECT, &template).unwrap().metadata;
    for source in &deployment.config_sources {
        assert!(metadata["config-sources"].contains(&source.id));
    }

    let stage = &deployment.pipeline["stages"][0];
    assert_eq!(stage["type"], "createServerGroup");
    assert_eq!(stage["strategy"], "redblack");
    assert_eq!(stage["region"], "us-central1");
}

#[tokio::test(start_paused = true)]
async fn test_missing_monitoring_profile_is_a_defect() {
    let h = Harness::new();
    let driver = h.driver(ServiceType::Gate);
    let mut resolved = h.resolved(&[ServiceType::Gate, ServiceType::MonitoringDaemon]);
    resolved
        .profiles
        .get_mut(&ServiceType::MonitoringDaemon)
        .unwrap()
        .remove(MONITORING_PROFILE_NAME);

    let err = deploy_service(&driver, &h.account, &resolved, false).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Defect);
    assert_eq!(h.compute.group_inserts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rollback_of_two_versions() {
    let h = Harness::new();
    let driver = h.driver(ServiceType::Front50);
    let mut resolved = h.resolved(&[ServiceType::Front50]);
    resolved
        .settings
        .insert(ServiceType::Front50, ServiceSettings::defaults(ServiceType::Front50).with_location(ZONE).with_target_size(3));
    let settings = resolved.service_settings(ServiceType::Front50).unwrap().clone();

    let err = rollback_pipeline(&driver, &h.account, &settings).await.unwrap_err();
    assert!(matches!(err, DeployError::NothingToRollBack { .. }));

    driver.ensure_running(&h.account, &resolved, &[], false).await.unwrap();
    driver.ensure_running(&h.account, &resolved, &[], true).await.unwrap();

    let doc = rollback_pipeline(&driver, &h.account, &settings).await.unwrap();
    let stages = doc["stages"].as_array().unwrap();
    assert_eq!(stages.len(), 3);

    let by_ref = |id: &str| stages.iter().find(|s| s["refId"] == id).unwrap().clone();
    let resize = by_ref(RESIZE_REF_ID);
    assert_eq!(resize["capacity"]["desired"], "3");
    assert_eq!(resize["serverGroupName"], "spin-front50-v000");
    assert_eq!(by_ref(ENABLE_REF_ID)["requisiteStageRefIds"], serde_json::json!([RESIZE_REF_ID]));
    let destroy = by_ref(DESTROY_REF_ID);
    assert_eq!(destroy["serverGroupName"], "spin-front50-v001");
    assert_eq!(destroy["requisiteStageRefIds"], serde_json::json!([ENABLE_REF_ID]));
}

#[tokio::test(start_paused = true)]
async fn test_delete_version_then_redeploy() {
    let h = Harness::new();
    let driver = h.driver(ServiceType::Echo);
    let resolved = h.resolved(&[ServiceType::Echo]);
    let settings = resolved.service_settings(ServiceType::Echo).unwrap();

    driver.ensure_running(&h.account, &resolved, &[], false).await.unwrap();
    driver.ensure_running(&h.account, &resolved, &[], true).await.unwrap();
    driver.delete_version(&h.account, settings, 1).await.unwrap();

    let details = driver.get_running_service_details(&h.account, settings).await.unwrap();
    assert_eq!(details.versions(), vec![0]);

    let outcome = driver.ensure_running(&h.account, &resolved, &[], true).await.unwrap();
    assert_eq!(outcome, EnsureOutcome::Provisioned(1));
}

#[derive(Debug)]
struct FakeClient {
    base: String,
}

impl ServiceClient for FakeClient {
    fn bind(endpoint: ServiceEndpoint) -> Result<Self> {
        Ok(Self { base: endpoint.url })
    }
}

#[tokio::test(start_paused = true)]
async fn test_connect_client_binds_tunnel() {
    let h = Harness::new();
    let driver = h.driver(ServiceType::Gate);
    let resolved = h.resolved(&[ServiceType::Gate]);
    let settings = resolved.service_settings(ServiceType::Gate).unwrap();

    let err = connect_client::<FakeClient>(&driver, &h.account, settings).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::NotDeployed);

    driver.ensure_running(&h.account, &resolved, &[], false).await.unwrap();
    let client: FakeClient = connect_client(&driver, &h.account, settings).await.unwrap();
    assert_eq!(client.base, "http://localhost:8084");
}

#[test]
fn test_upsert_load_balancer_uses_driver_zones() {
    let h = Harness::new();
    let driver = h.driver(ServiceType::Gate);
    let settings = ServiceSettings::defaults(ServiceType::Gate).with_location("europe-west4-a");

    let task = upsert_load_balancer_task(&driver, &h.account, &settings);
    let stage = &task["job"][0];
    assert_eq!(stage["loadBalancerName"], "spin-gate");
    assert_eq!(stage["availabilityZones"]["europe-west4"], serde_json::json!(["europe-west4-a"]));
}

#[test]
fn test_override_urls() {
    let settings = ServiceSettings::defaults(ServiceType::Gate).with_override_base_url("https://x.example:9999/a");
    assert_eq!(settings.base_url(), "https://x.example:9999/a");

    let invalid = ServiceSettings::defaults(ServiceType::Gate).with_override_base_url("https://x.example/a b%zz");
    let err = invalid.auth_base_url().unwrap_err();
    assert!(matches!(err, DeployError::InvalidUrl { .. }));
    assert_eq!(err.class(), ErrorClass::User);
}

#[test]
fn test_drivers_sort_by_priority() {
    let h = Harness::new();
    let mut services = vec![ServiceType::Gate, ServiceType::Redis, ServiceType::Front50, ServiceType::Orca];
    deploy_order(&mut services);

    let priorities: Vec<_> = services.iter().map(|&s| h.driver(s).deploy_priority()).collect();
    assert!(priorities.windows(2).all(|w| w[0] >= w[1]));
    assert_eq!(services[0], ServiceType::Redis);
    assert_eq!(services.last(), Some(&ServiceType::Gate));
}
