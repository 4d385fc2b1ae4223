//! Point-in-time view of what is deployed for a service in an account
//!
//! Rebuilt from the backend on every query and never persisted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub location: String,
    pub running: bool,
    pub healthy: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub exists: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningServiceDetails {
    /// Healthy instances across all versions
    pub healthy: usize,
    pub load_balancer: LoadBalancer,
    pub artifact_id: Option<String>,
    pub internal_endpoint: Option<String>,
    pub external_endpoint: Option<String>,
    /// Version number -> instances of that version. Empty means never deployed.
    pub instances: BTreeMap<u32, Vec<Instance>>,
}

impl RunningServiceDetails {
    /// Build a snapshot from instances grouped by version
    pub fn from_versions(instances: BTreeMap<u32, Vec<Instance>>) -> Self {
        let healthy = instances.values().flatten().filter(|i| i.healthy).count();
        Self {
            healthy,
            instances,
            ..Default::default()
        }
    }

    /// The highest provisioned version, if any
    pub fn latest_enabled_version(&self) -> Option<u32> {
        self.instances.keys().next_back().copied()
    }

    /// Versions in ascending order
    pub fn versions(&self) -> Vec<u32> {
        self.instances.keys().copied().collect()
    }

    pub fn instances_of(&self, version: u32) -> &[Instance] {
        self.instances
            .get(&version)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn running_count(&self, version: u32) -> usize {
        self.instances_of(version).iter().filter(|i| i.running).count()
    }

    pub fn is_deployed(&self) -> bool {
        !self.instances.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn instance(id: &str, running: bool, healthy: bool) -> Instance {
        Instance {
            id: id.to_string(),
            location: "us-central1-f".to_string(),
            running,
            healthy,
        }
    }

    #[test]
    fn test_empty_snapshot_has_no_version() {
        let details = RunningServiceDetails::default();
        assert_eq!(details.latest_enabled_version(), None);
        assert!(!details.is_deployed());
        assert_eq!(details.running_count(0), 0);
    }

    #[test]
    fn test_counts() {
        let mut versions = BTreeMap::new();
        versions.insert(0, vec![instance("a", true, true), instance("b", false, false)]);
        versions.insert(1, vec![instance("c", true, true)]);
        let details = RunningServiceDetails::from_versions(versions);

        assert_eq!(details.healthy, 2);
        assert_eq!(details.running_count(0), 1);
        assert_eq!(details.latest_enabled_version(), Some(1));
        assert_eq!(details.versions(), vec![0, 1]);
    }

    proptest! {
        #[test]
        fn latest_version_is_max_of_contiguous_set(k in 0u32..500) {
            let versions = (0..=k).map(|v| (v, Vec::new())).collect();
            let details = RunningServiceDetails::from_versions(versions);
            prop_assert_eq!(details.latest_enabled_version(), Some(k));
        }

        #[test]
        fn latest_version_is_max_of_any_set(set in prop::collection::btree_set(0u32..10_000, 1..20)) {
            let max = set.iter().max().copied();
            let versions = set.into_iter().map(|v| (v, Vec::new())).collect();
            let details = RunningServiceDetails::from_versions(versions);
            prop_assert_eq!(details.latest_enabled_version(), max);
        }
    }
}
