//! Compute backend collaborator
//!
//! The subset of a cloud compute API the instance-group driver relies on:
//! idempotent creates that return long-running operation handles, a wait
//! primitive for those operations, and paginated listing.

mod memory;

pub use memory::{ComputeState, InMemoryCompute};

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ComputeError {
    #[error("resource not found: {resource}")]
    NotFound { resource: String },
    #[error("resource already exists with a different definition: {resource}")]
    AlreadyExists { resource: String },
    #[error("operation {operation} failed: {message}")]
    OperationFailed { operation: String, message: String },
    #[error("{message}")]
    Api { message: String },
}

pub type ComputeResult<T> = std::result::Result<T, ComputeError>;

/// Handle to a long-running backend operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    /// URL of the resource the operation acts on
    pub target_link: String,
    /// Zone for zonal operations, `None` for global ones
    pub zone: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceTemplate {
    pub name: String,
    pub description: String,
    pub machine_type: String,
    /// Boot disk image
    pub source_image: String,
    pub network: String,
    pub external_nat: bool,
    pub service_account_email: String,
    pub scopes: Vec<String>,
    /// Instance metadata (startup script, config source references, ...)
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceGroupManager {
    pub name: String,
    pub base_instance_name: String,
    /// URL of the instance template
    pub instance_template: String,
    pub target_size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedInstance {
    /// Instance URL; the instance name is its last path segment
    pub instance: String,
    /// e.g. "PROVISIONING", "STAGING", "RUNNING"
    pub instance_status: Option<String>,
    /// Result of the group's health check, when one is configured
    pub healthy: bool,
}

impl ManagedInstance {
    pub fn name(&self) -> &str {
        self.instance
            .rsplit_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&self.instance)
    }

    pub fn is_running(&self) -> bool {
        self.instance_status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("running"))
    }
}

/// One page of a listing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Make sure the deployment network exists, returning its URL
    async fn ensure_network(&self, project: &str) -> ComputeResult<String>;

    /// Service account instances run as
    async fn default_service_account(&self, project: &str) -> ComputeResult<String>;

    async fn insert_instance_template(
        &self,
        project: &str,
        template: &InstanceTemplate,
    ) -> ComputeResult<Operation>;

    /// Returns `None` when the template does not exist
    async fn delete_instance_template(&self, project: &str, name: &str) -> ComputeResult<Option<Operation>>;

    async fn insert_instance_group_manager(
        &self,
        project: &str,
        zone: &str,
        manager: &InstanceGroupManager,
    ) -> ComputeResult<Operation>;

    /// Returns `None` when the group does not exist
    async fn delete_instance_group_manager(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> ComputeResult<Option<Operation>>;

    async fn get_instance_group_manager(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> ComputeResult<Option<InstanceGroupManager>>;

    async fn list_instance_group_managers(
        &self,
        project: &str,
        zone: &str,
        page_token: Option<&str>,
    ) -> ComputeResult<Page<InstanceGroupManager>>;

    async fn list_managed_instances(
        &self,
        project: &str,
        zone: &str,
        manager: &str,
    ) -> ComputeResult<Vec<ManagedInstance>>;

    /// Block until the operation finishes; `Err` if it finished unsuccessfully
    async fn wait_for_operation(&self, project: &str, operation: &Operation) -> ComputeResult<()>;

    /// Open a tunnel to `port` on an instance, returning the local URL
    async fn open_tunnel(
        &self,
        project: &str,
        zone: &str,
        instance: &str,
        port: u16,
    ) -> ComputeResult<String>;
}

/// Collect every page of instance group managers in a zone
pub async fn list_all_instance_group_managers(
    api: &dyn ComputeApi,
    project: &str,
    zone: &str,
) -> ComputeResult<Vec<InstanceGroupManager>> {
    let mut all = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = api
            .list_instance_group_managers(project, zone, token.as_deref())
            .await?;
        all.extend(page.items);
        match page.next_page_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_managed_instance_name_and_status() {
        let instance = ManagedInstance {
            instance: "https://compute.example/projects/p/zones/z/instances/spin-gate-v000-0001".into(),
            instance_status: Some("Running".into()),
            healthy: false,
        };
        assert_eq!(instance.name(), "spin-gate-v000-0001");
        assert!(instance.is_running());

        let booting = ManagedInstance {
            instance: "bare-name".into(),
            instance_status: None,
            healthy: false,
        };
        assert_eq!(booting.name(), "bare-name");
        assert!(!booting.is_running());
    }
}
