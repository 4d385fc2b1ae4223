//! Subcommand implementations

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use serde_json::Value;

use yardarm_core::config::DeploymentPlan;
use yardarm_core::driver::{
    AccountDetails, DistributedService, deploy_service, rollback_pipeline, upsert_load_balancer_task,
};
use yardarm_core::instance_group::InstanceGroupService;
use yardarm_core::profile::ResolvedConfiguration;
use yardarm_core::service::{ServiceType, deploy_order};
use yardarm_core::settings::ServiceSettings;
use yardarm_core::staging::DirStagingCache;

use crate::backend::SimulatedBackend;
use crate::profiles::SettingsProfileGenerator;

const DEFAULT_STAGING_DIR: &str = ".yardarm/staging";

/// Everything a command needs: the plan and the backend it runs against
pub struct Context {
    plan: DeploymentPlan,
    account: AccountDetails,
    backend: SimulatedBackend,
    driver: InstanceGroupService,
    staging_dir: PathBuf,
}

impl Context {
    pub fn new(plan: DeploymentPlan, backend: SimulatedBackend) -> Self {
        let staging_dir = plan
            .staging_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STAGING_DIR));
        let driver = InstanceGroupService::new(
            ServiceType::Front50,
            backend.compute.clone(),
            backend.secrets.clone(),
            Arc::new(DirStagingCache::new(&staging_dir)),
        )
        .with_config(plan.instance_group_config());

        Self {
            account: plan.account_details(),
            plan,
            backend,
            driver,
            staging_dir,
        }
    }

    fn driver(&self, service: ServiceType) -> InstanceGroupService {
        self.driver.for_service(service)
    }

    fn settings(&self, service: ServiceType) -> ServiceSettings {
        self.plan.service_settings(service)
    }

    pub async fn save(&self) -> Result<()> {
        self.backend.save().await
    }
}

fn resolve(name: &str) -> Result<ServiceType> {
    Ok(ServiceType::resolve(name)?)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn run_services() {
    let mut services = ServiceType::ALL.to_vec();
    deploy_order(&mut services);

    println!("{:<24} {:>8}  {:<10} NAME", "SERVICE", "PRIORITY", "BOOTSTRAP");
    for service in services {
        println!(
            "{:<24} {:>8}  {:<10} {}",
            service.canonical_name(),
            service.deploy_priority().0,
            if service.required_to_bootstrap() { "yes" } else { "no" },
            service.service_name()
        );
    }
}

pub async fn run_deploy(ctx: &Context, names: &[String], recreate: bool) -> Result<()> {
    let mut services = names.iter().map(|n| resolve(n)).collect::<Result<Vec<_>>>()?;
    deploy_order(&mut services);

    let generator = SettingsProfileGenerator::new(&ctx.staging_dir);
    let resolved = ResolvedConfiguration::generate(ctx.plan.all_service_settings(), &generator)
        .context("failed to generate profiles")?;

    for service in services {
        let driver = ctx.driver(service);
        let deployment = deploy_service(&driver, &ctx.account, &resolved, recreate).await?;
        // Persist after every service so a later failure keeps earlier progress
        ctx.save().await?;

        eprintln!(
            "{}: version {} ({}), {} config source(s)",
            service.service_name(),
            deployment.outcome.version(),
            if deployment.outcome.provisioned() { "provisioned" } else { "already running" },
            deployment.config_sources.len()
        );
        print_json(&deployment.pipeline)?;
    }
    Ok(())
}

pub async fn run_status(ctx: &Context, name: &str) -> Result<()> {
    let service = resolve(name)?;
    let details = ctx
        .driver(service)
        .get_running_service_details(&ctx.account, &ctx.settings(service))
        .await?;
    ctx.save().await?;
    print_json(&serde_json::to_value(&details)?)
}

pub async fn run_rollback(ctx: &Context, name: &str) -> Result<()> {
    let service = resolve(name)?;
    let doc = rollback_pipeline(&ctx.driver(service), &ctx.account, &ctx.settings(service)).await?;
    ctx.save().await?;
    print_json(&doc)
}

pub fn run_upsert_lb(ctx: &Context, name: &str) -> Result<()> {
    let service = resolve(name)?;
    let task = upsert_load_balancer_task(&ctx.driver(service), &ctx.account, &ctx.settings(service));
    print_json(&task)
}

pub async fn run_delete_version(ctx: &Context, name: &str, version: u32) -> Result<()> {
    let service = resolve(name)?;
    ctx.driver(service)
        .delete_version(&ctx.account, &ctx.settings(service), version)
        .await?;
    ctx.save().await?;
    eprintln!("{}: version {} deleted", service.service_name(), version);
    Ok(())
}

pub async fn run_connect(ctx: &Context, name: &str) -> Result<()> {
    let service = resolve(name)?;
    let driver = ctx.driver(service);
    let settings = ctx.settings(service);

    let endpoint = driver.connect(&ctx.account, &settings).await?;
    ctx.save().await?;
    println!("{} version {} via {}: {}", endpoint.service, endpoint.version, endpoint.instance, endpoint.url);
    if let Some(command) = driver.connect_command(&ctx.account, &settings).await? {
        println!("{}", command);
    }
    Ok(())
}
