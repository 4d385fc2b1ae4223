//! Pipeline documents for the execution engine
//!
//! Pure construction, no I/O. The documents are nested key/value structures
//! whose field names (`stages`, `refId`, `requisiteStageRefIds`, `type`, ...) are a
//! contract with the engine that runs them. Values the engine reads as strings
//! (capacities, flags) are emitted as strings.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

use crate::error::{DeployError, Result};
use crate::running::RunningServiceDetails;
use crate::service::ServiceType;
use crate::settings::ServiceSettings;

pub const APPLICATION: &str = "spin";
pub const DESCRIPTION: &str = "Auto-generated by yardarm";

pub const CREATE_SERVER_GROUP: &str = "createServerGroup";
pub const UPSERT_LOAD_BALANCER: &str = "upsertLoadBalancer";
pub const RESIZE_SERVER_GROUP: &str = "resizeServerGroup";
pub const ENABLE_SERVER_GROUP: &str = "enableServerGroup";
pub const DESTROY_SERVER_GROUP: &str = "destroyServerGroup";

pub const DEPLOY_REF_ID: &str = "deployredblack";
pub const UPSERT_LB_REF_ID: &str = "upsertlb";
pub const RESIZE_REF_ID: &str = "resize";
pub const ENABLE_REF_ID: &str = "enable";
pub const DESTROY_REF_ID: &str = "destroy";

const ANCESTOR_TARGET: &str = "ancestor_asg_dynamic";
const CURRENT_TARGET: &str = "current_asg_dynamic";

/// Provider-specific key/value description of a resource
pub type Description = Map<String, Value>;

/// Where a pipeline acts: provider, account, region, and the service's cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineTarget {
    pub service: ServiceType,
    pub cloud_provider: String,
    pub account: String,
    pub region: String,
    pub health_providers: Vec<String>,
    pub availability_zones: BTreeMap<String, Vec<String>>,
}

impl PipelineTarget {
    fn cluster(&self) -> String {
        self.service.service_name()
    }

    fn base_description(&self) -> Description {
        let mut base = Map::new();
        base.insert("cloudProvider".into(), json!(self.cloud_provider));
        base.insert("cloudProviderType".into(), json!(self.cloud_provider));
        base.insert("region".into(), json!(self.region));
        base.insert("credentials".into(), json!(self.account));
        base.insert("cluster".into(), json!(self.cluster()));
        base
    }
}

fn pipeline(name: String, stages: Vec<Value>) -> Value {
    json!({
        "stages": stages,
        "application": APPLICATION,
        "name": name,
        "description": DESCRIPTION,
    })
}

/// Single-stage red/black deploy of a new server group.
///
/// `server_group` is the provider's description of the group to create; the
/// stage fields common to every provider are layered on top of it.
pub fn build_deploy_server_group_pipeline(
    target: &PipelineTarget,
    server_group: Description,
    max_remaining: Option<u32>,
    scale_down: bool,
) -> Value {
    let mut deploy = server_group;
    deploy.insert("interestingHealthProviders".into(), json!(target.health_providers));
    deploy.insert("type".into(), json!(CREATE_SERVER_GROUP));
    deploy.insert("cloudProvider".into(), json!(target.cloud_provider));
    deploy.insert("refId".into(), json!(DEPLOY_REF_ID));
    deploy.insert("region".into(), json!(target.region));
    deploy.insert("strategy".into(), json!("redblack"));
    if let Some(max) = max_remaining {
        deploy.insert("maxRemainingAsgs".into(), json!(max.to_string()));
    }
    deploy.insert("scaleDown".into(), json!(scale_down.to_string()));

    pipeline(
        format!("Deploy/Upgrade {}", target.cluster()),
        vec![Value::Object(deploy)],
    )
}

/// Resize the ancestor back, enable it, then destroy the current group.
///
/// The current group is destroyed rather than disabled: a rolled-back group is
/// fixed by redeploying, and the engine cannot re-enable a destroyed group anyway.
pub fn build_rollback_pipeline(target: &PipelineTarget, settings: &ServiceSettings) -> Value {
    let base = target.base_description();
    let cluster = target.cluster();

    let mut resize = base.clone();
    resize.insert("name".into(), json!(format!("Resize old {} to prior size", cluster)));
    resize.insert("capacity".into(), json!({ "desired": settings.target_size.to_string() }));
    resize.insert("type".into(), json!(RESIZE_SERVER_GROUP));
    resize.insert("refId".into(), json!(RESIZE_REF_ID));
    resize.insert("target".into(), json!(ANCESTOR_TARGET));
    resize.insert("action".into(), json!("scale_exact"));
    resize.insert("requisiteStageRefIds".into(), json!([]));

    let mut enable = base.clone();
    enable.insert("name".into(), json!(format!("Enable old {}", cluster)));
    enable.insert("type".into(), json!(ENABLE_SERVER_GROUP));
    enable.insert("refId".into(), json!(ENABLE_REF_ID));
    enable.insert("target".into(), json!(ANCESTOR_TARGET));
    enable.insert("requisiteStageRefIds".into(), json!([RESIZE_REF_ID]));

    let mut destroy = base;
    destroy.insert("name".into(), json!(format!("Destroy current {}", cluster)));
    destroy.insert("type".into(), json!(DESTROY_SERVER_GROUP));
    destroy.insert("refId".into(), json!(DESTROY_REF_ID));
    destroy.insert("target".into(), json!(CURRENT_TARGET));
    destroy.insert("requisiteStageRefIds".into(), json!([ENABLE_REF_ID]));

    pipeline(
        format!("Rollback {}", cluster),
        vec![Value::Object(resize), Value::Object(enable), Value::Object(destroy)],
    )
}

/// One-stage task guaranteeing the service's load balancer exists
pub fn build_upsert_load_balancer_task(target: &PipelineTarget, load_balancer: Description) -> Value {
    let mut upsert = load_balancer;
    upsert.insert("type".into(), json!(UPSERT_LOAD_BALANCER));
    upsert.insert("cloudProvider".into(), json!(target.cloud_provider));
    upsert.insert("refId".into(), json!(UPSERT_LB_REF_ID));
    upsert.insert("application".into(), json!(APPLICATION));
    upsert.insert("availabilityZones".into(), json!(target.availability_zones));

    json!({
        "job": [Value::Object(upsert)],
        "application": APPLICATION,
        "name": format!("Upsert LB of {}", target.cluster()),
        "description": DESCRIPTION,
    })
}

/// Concrete versions a rollback acts on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RollbackPlan {
    pub service: ServiceType,
    /// Version to restore
    pub ancestor: u32,
    /// Version to destroy
    pub current: u32,
    pub ancestor_target_size: u32,
}

impl RollbackPlan {
    /// Ancestor is the second-highest provisioned version, current the highest
    pub fn from_running(
        service: ServiceType,
        details: &RunningServiceDetails,
        settings: &ServiceSettings,
    ) -> Result<Self> {
        let versions = details.versions();
        if versions.len() < 2 {
            return Err(DeployError::NothingToRollBack {
                service: service.service_name(),
                versions,
            });
        }

        let n = versions.len();
        Ok(Self {
            service,
            ancestor: versions[n - 2],
            current: versions[n - 1],
            ancestor_target_size: settings.target_size,
        })
    }

    /// Rollback pipeline with each stage pinned to its concrete server group
    pub fn pipeline(&self, target: &PipelineTarget, settings: &ServiceSettings) -> Value {
        let mut sized = settings.clone();
        sized.target_size = self.ancestor_target_size;
        let mut doc = build_rollback_pipeline(target, &sized);

        let ancestor = crate::driver::versioned_name(self.service, self.ancestor);
        let current = crate::driver::versioned_name(self.service, self.current);
        if let Some(stages) = doc.get_mut("stages").and_then(Value::as_array_mut) {
            for stage in stages {
                let group = match stage.get("refId").and_then(Value::as_str) {
                    Some(DESTROY_REF_ID) => &current,
                    _ => &ancestor,
                };
                if let Some(obj) = stage.as_object_mut() {
                    obj.insert("serverGroupName".into(), json!(group));
                }
            }
        }
        doc
    }
}
