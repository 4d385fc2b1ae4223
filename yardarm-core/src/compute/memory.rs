//! Simulated compute backend
//!
//! Keeps templates and instance groups in memory. Instances start out
//! provisioning and report running after a fixed number of listings, which is
//! enough to exercise readiness polling without a cloud account. The whole state
//! is serializable so a front-end can persist it between invocations.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    ComputeApi, ComputeError, ComputeResult, InstanceGroupManager, InstanceTemplate,
    ManagedInstance, Operation, Page,
};

const DEFAULT_PAGE_SIZE: usize = 2;
const DEFAULT_BOOT_TICKS: u32 = 2;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulatedInstance {
    pub name: String,
    /// Listings left before the instance reports running
    pub ticks_until_running: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulatedGroup {
    pub project: String,
    pub zone: String,
    pub manager: InstanceGroupManager,
    pub instances: Vec<SimulatedInstance>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulatedOperation {
    pub operation: Operation,
    pub error: Option<String>,
}

/// Everything the simulated backend knows
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ComputeState {
    /// "<project>/<name>" -> template
    pub templates: BTreeMap<String, InstanceTemplate>,
    /// "<project>/<zone>/<name>" -> group
    pub groups: BTreeMap<String, SimulatedGroup>,
    pub operations: BTreeMap<String, SimulatedOperation>,
    pub tunnels: Vec<String>,
    pub next_id: u64,
    /// Number of instance group inserts accepted
    pub group_inserts: u64,
}

impl ComputeState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn record_operation(&mut self, target_link: String, zone: Option<&str>, error: Option<String>) -> Operation {
        let operation = Operation {
            name: format!("operation-{}", uuid::Uuid::new_v4()),
            target_link,
            zone: zone.map(str::to_string),
        };
        self.operations.insert(
            operation.name.clone(),
            SimulatedOperation {
                operation: operation.clone(),
                error,
            },
        );
        operation
    }
}

fn template_key(project: &str, name: &str) -> String {
    format!("{}/{}", project, name)
}

fn group_key(project: &str, zone: &str, name: &str) -> String {
    format!("{}/{}/{}", project, zone, name)
}

fn template_url(project: &str, name: &str) -> String {
    format!("projects/{}/global/instanceTemplates/{}", project, name)
}

fn group_url(project: &str, zone: &str, name: &str) -> String {
    format!("projects/{}/zones/{}/instanceGroupManagers/{}", project, zone, name)
}

fn instance_url(project: &str, zone: &str, name: &str) -> String {
    format!("projects/{}/zones/{}/instances/{}", project, zone, name)
}

pub struct InMemoryCompute {
    state: Mutex<ComputeState>,
    page_size: usize,
    boot_ticks: u32,
    /// Operations whose target link contains this fragment fail
    fail_matching: Option<String>,
}

impl Default for InMemoryCompute {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCompute {
    pub fn new() -> Self {
        Self::from_state(ComputeState::default())
    }

    pub fn from_state(state: ComputeState) -> Self {
        Self {
            state: Mutex::new(state),
            page_size: DEFAULT_PAGE_SIZE,
            boot_ticks: DEFAULT_BOOT_TICKS,
            fail_matching: None,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Number of instance listings before a new instance reports running
    pub fn with_boot_ticks(mut self, ticks: u32) -> Self {
        self.boot_ticks = ticks;
        self
    }

    pub fn failing_on(mut self, fragment: impl Into<String>) -> Self {
        self.fail_matching = Some(fragment.into());
        self
    }

    fn lock(&self) -> ComputeResult<MutexGuard<'_, ComputeState>> {
        self.state.lock().map_err(|_| ComputeError::Api {
            message: "compute state lock poisoned".to_string(),
        })
    }

    fn failure_for(&self, target: &str) -> Option<String> {
        self.fail_matching
            .as_deref()
            .filter(|fragment| target.contains(fragment))
            .map(|_| "simulated backend failure".to_string())
    }

    pub fn snapshot(&self) -> ComputeResult<ComputeState> {
        Ok(self.lock()?.clone())
    }

    pub fn group_inserts(&self) -> u64 {
        self.lock().map(|s| s.group_inserts).unwrap_or_default()
    }

    pub fn group_names(&self, project: &str, zone: &str) -> Vec<String> {
        let prefix = format!("{}/{}/", project, zone);
        self.lock()
            .map(|s| {
                s.groups
                    .iter()
                    .filter(|(k, _)| k.starts_with(&prefix))
                    .map(|(_, g)| g.manager.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn template_names(&self, project: &str) -> Vec<String> {
        let prefix = format!("{}/", project);
        self.lock()
            .map(|s| {
                s.templates
                    .iter()
                    .filter(|(k, _)| k.starts_with(&prefix))
                    .map(|(_, t)| t.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn template(&self, project: &str, name: &str) -> Option<InstanceTemplate> {
        self.lock()
            .ok()
            .and_then(|s| s.templates.get(&template_key(project, name)).cloned())
    }
}

#[async_trait]
impl ComputeApi for InMemoryCompute {
    async fn ensure_network(&self, project: &str) -> ComputeResult<String> {
        Ok(format!("projects/{}/global/networks/spinnaker-hal", project))
    }

    async fn default_service_account(&self, project: &str) -> ComputeResult<String> {
        Ok(format!("spinnaker-hal@{}.iam.gserviceaccount.com", project))
    }

    async fn insert_instance_template(
        &self,
        project: &str,
        template: &InstanceTemplate,
    ) -> ComputeResult<Operation> {
        let url = template_url(project, &template.name);
        let error = self.failure_for(&url);
        let mut state = self.lock()?;
        let key = template_key(project, &template.name);

        match state.templates.get(&key) {
            Some(existing) if existing != template => {
                return Err(ComputeError::AlreadyExists { resource: url });
            }
            Some(_) => {}
            None if error.is_none() => {
                state.templates.insert(key, template.clone());
            }
            None => {}
        }
        Ok(state.record_operation(url, None, error))
    }

    async fn delete_instance_template(&self, project: &str, name: &str) -> ComputeResult<Option<Operation>> {
        let mut state = self.lock()?;
        if state.templates.remove(&template_key(project, name)).is_none() {
            return Ok(None);
        }
        Ok(Some(state.record_operation(template_url(project, name), None, None)))
    }

    async fn insert_instance_group_manager(
        &self,
        project: &str,
        zone: &str,
        manager: &InstanceGroupManager,
    ) -> ComputeResult<Operation> {
        let url = group_url(project, zone, &manager.name);
        let error = self.failure_for(&url);
        let boot_ticks = self.boot_ticks;
        let mut state = self.lock()?;

        let template_known = state
            .templates
            .iter()
            .any(|(k, t)| k.starts_with(&format!("{}/", project)) && template_url(project, &t.name) == manager.instance_template);
        if !template_known {
            return Err(ComputeError::NotFound {
                resource: manager.instance_template.clone(),
            });
        }

        let key = group_key(project, zone, &manager.name);
        match state.groups.get(&key) {
            Some(existing) if existing.manager != *manager => {
                return Err(ComputeError::AlreadyExists { resource: url });
            }
            Some(_) => return Ok(state.record_operation(url, Some(zone), None)),
            None => {}
        }

        if error.is_none() {
            let instances = (0..manager.target_size)
                .map(|_| {
                    let id = state.next_id();
                    SimulatedInstance {
                        name: format!("{}-{:04x}", manager.base_instance_name, id),
                        ticks_until_running: boot_ticks,
                    }
                })
                .collect();
            state.groups.insert(
                key,
                SimulatedGroup {
                    project: project.to_string(),
                    zone: zone.to_string(),
                    manager: manager.clone(),
                    instances,
                },
            );
            state.group_inserts += 1;
        }
        Ok(state.record_operation(url, Some(zone), error))
    }

    async fn delete_instance_group_manager(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> ComputeResult<Option<Operation>> {
        let mut state = self.lock()?;
        if state.groups.remove(&group_key(project, zone, name)).is_none() {
            return Ok(None);
        }
        Ok(Some(state.record_operation(group_url(project, zone, name), Some(zone), None)))
    }

    async fn get_instance_group_manager(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> ComputeResult<Option<InstanceGroupManager>> {
        let state = self.lock()?;
        Ok(state
            .groups
            .get(&group_key(project, zone, name))
            .map(|g| g.manager.clone()))
    }

    async fn list_instance_group_managers(
        &self,
        project: &str,
        zone: &str,
        page_token: Option<&str>,
    ) -> ComputeResult<Page<InstanceGroupManager>> {
        let offset = match page_token {
            Some(token) => token.parse::<usize>().map_err(|_| ComputeError::Api {
                message: format!("invalid page token '{}'", token),
            })?,
            None => 0,
        };

        let state = self.lock()?;
        let matching: Vec<_> = state
            .groups
            .values()
            .filter(|g| g.project == project && g.zone == zone)
            .map(|g| g.manager.clone())
            .collect();

        let end = (offset + self.page_size).min(matching.len());
        let items = matching.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_page_token = (end < matching.len()).then(|| end.to_string());
        Ok(Page {
            items,
            next_page_token,
        })
    }

    async fn list_managed_instances(
        &self,
        project: &str,
        zone: &str,
        manager: &str,
    ) -> ComputeResult<Vec<ManagedInstance>> {
        let mut state = self.lock()?;
        let group = state
            .groups
            .get_mut(&group_key(project, zone, manager))
            .ok_or_else(|| ComputeError::NotFound {
                resource: group_url(project, zone, manager),
            })?;

        let mut result = Vec::with_capacity(group.instances.len());
        for instance in &mut group.instances {
            let running = instance.ticks_until_running == 0;
            let status = if running {
                "RUNNING"
            } else if instance.ticks_until_running == 1 {
                "STAGING"
            } else {
                "PROVISIONING"
            };
            result.push(ManagedInstance {
                instance: instance_url(project, zone, &instance.name),
                instance_status: Some(status.to_string()),
                healthy: running,
            });
            instance.ticks_until_running = instance.ticks_until_running.saturating_sub(1);
        }
        Ok(result)
    }

    async fn wait_for_operation(&self, _project: &str, operation: &Operation) -> ComputeResult<()> {
        let state = self.lock()?;
        let recorded = state
            .operations
            .get(&operation.name)
            .ok_or_else(|| ComputeError::NotFound {
                resource: operation.name.clone(),
            })?;
        match &recorded.error {
            Some(message) => Err(ComputeError::OperationFailed {
                operation: operation.name.clone(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn open_tunnel(
        &self,
        project: &str,
        zone: &str,
        instance: &str,
        port: u16,
    ) -> ComputeResult<String> {
        let mut state = self.lock()?;
        let exists = state
            .groups
            .values()
            .filter(|g| g.project == project && g.zone == zone)
            .any(|g| g.instances.iter().any(|i| i.name == instance));
        if !exists {
            return Err(ComputeError::NotFound {
                resource: instance_url(project, zone, instance),
            });
        }

        state.tunnels.push(format!("{}:{}", instance, port));
        Ok(format!("http://localhost:{}", port))
    }
}
