//! Service type registry
//!
//! A [`ServiceType`] is one kind of platform component. Its canonical name is the
//! stable, user-facing key ("front50"); its service name ("spin-front50") is what
//! cloud resources are named after and is the join key for everything else.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DeployError, Result};

/// Used to sequence multi-service rollouts. Higher priority deploys first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeployPriority(pub i32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ServiceType {
    Clouddriver,
    ClouddriverBootstrap,
    ConsulClient,
    ConsulServer,
    Deck,
    Echo,
    Fiat,
    Front50,
    Gate,
    Igor,
    Orca,
    OrcaBootstrap,
    Redis,
    RedisBootstrap,
    Rosco,
    MonitoringDaemon,
    VaultClient,
    VaultServer,
}

impl ServiceType {
    pub const ALL: [ServiceType; 18] = [
        ServiceType::Clouddriver,
        ServiceType::ClouddriverBootstrap,
        ServiceType::ConsulClient,
        ServiceType::ConsulServer,
        ServiceType::Deck,
        ServiceType::Echo,
        ServiceType::Fiat,
        ServiceType::Front50,
        ServiceType::Gate,
        ServiceType::Igor,
        ServiceType::Orca,
        ServiceType::OrcaBootstrap,
        ServiceType::Redis,
        ServiceType::RedisBootstrap,
        ServiceType::Rosco,
        ServiceType::MonitoringDaemon,
        ServiceType::VaultClient,
        ServiceType::VaultServer,
    ];

    /// Stable, user-facing name
    pub fn canonical_name(&self) -> &'static str {
        match self {
            ServiceType::Clouddriver => "clouddriver",
            ServiceType::ClouddriverBootstrap => "clouddriver-bootstrap",
            ServiceType::ConsulClient => "consul-client",
            ServiceType::ConsulServer => "consul-server",
            ServiceType::Deck => "deck",
            ServiceType::Echo => "echo",
            ServiceType::Fiat => "fiat",
            ServiceType::Front50 => "front50",
            ServiceType::Gate => "gate",
            ServiceType::Igor => "igor",
            ServiceType::Orca => "orca",
            ServiceType::OrcaBootstrap => "orca-bootstrap",
            ServiceType::Redis => "redis",
            ServiceType::RedisBootstrap => "redis-bootstrap",
            ServiceType::Rosco => "rosco",
            ServiceType::MonitoringDaemon => "monitoring-daemon",
            ServiceType::VaultClient => "vault-client",
            ServiceType::VaultServer => "vault-server",
        }
    }

    /// Internal name; prefix of every cloud resource belonging to this service
    pub fn service_name(&self) -> String {
        format!("spin-{}", self.canonical_name())
    }

    /// Name of the released artifact (image family) this service runs
    pub fn artifact_name(&self) -> &'static str {
        match self {
            ServiceType::Clouddriver | ServiceType::ClouddriverBootstrap => "clouddriver",
            ServiceType::ConsulClient | ServiceType::ConsulServer => "consul",
            ServiceType::Deck => "deck",
            ServiceType::Echo => "echo",
            ServiceType::Fiat => "fiat",
            ServiceType::Front50 => "front50",
            ServiceType::Gate => "gate",
            ServiceType::Igor => "igor",
            ServiceType::Orca | ServiceType::OrcaBootstrap => "orca",
            ServiceType::Redis | ServiceType::RedisBootstrap => "redis",
            ServiceType::Rosco => "rosco",
            ServiceType::MonitoringDaemon => "spinnaker-monitoring-daemon",
            ServiceType::VaultClient | ServiceType::VaultServer => "vault",
        }
    }

    pub fn deploy_priority(&self) -> DeployPriority {
        let p = match self {
            ServiceType::ConsulServer | ServiceType::VaultServer => 10,
            ServiceType::Redis | ServiceType::RedisBootstrap => 5,
            ServiceType::Clouddriver | ServiceType::ClouddriverBootstrap | ServiceType::Front50 => 4,
            ServiceType::Orca | ServiceType::OrcaBootstrap => 3,
            ServiceType::Fiat => 2,
            _ => 0,
        };
        DeployPriority(p)
    }

    /// Whether this service must exist before the platform can deploy itself
    pub fn required_to_bootstrap(&self) -> bool {
        matches!(
            self,
            ServiceType::ClouddriverBootstrap
                | ServiceType::OrcaBootstrap
                | ServiceType::RedisBootstrap
                | ServiceType::ConsulServer
                | ServiceType::VaultServer
        )
    }

    /// Look up a service by canonical name, ignoring case, `-` and `_`
    pub fn resolve(canonical_name: &str) -> Result<ServiceType> {
        let wanted = reduce_name(canonical_name);
        ServiceType::ALL
            .iter()
            .copied()
            .find(|t| reduce_name(t.canonical_name()) == wanted)
            .ok_or_else(|| DeployError::UnknownService {
                name: canonical_name.to_string(),
            })
    }
}

fn reduce_name(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "spin-{}", self.canonical_name())
    }
}

impl FromStr for ServiceType {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self> {
        ServiceType::resolve(s)
    }
}

impl TryFrom<String> for ServiceType {
    type Error = DeployError;

    fn try_from(value: String) -> Result<Self> {
        ServiceType::resolve(&value)
    }
}

impl From<ServiceType> for String {
    fn from(value: ServiceType) -> Self {
        value.canonical_name().to_string()
    }
}

/// Sort services into rollout order: highest priority first, ties by canonical name
pub fn deploy_order(services: &mut [ServiceType]) {
    services.sort_by(|a, b| {
        b.deploy_priority()
            .cmp(&a.deploy_priority())
            .then_with(|| a.canonical_name().cmp(b.canonical_name()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_normalizes_separators_and_case() {
        assert_eq!(ServiceType::resolve("front50").unwrap(), ServiceType::Front50);
        assert_eq!(
            ServiceType::resolve("Monitoring_Daemon").unwrap(),
            ServiceType::MonitoringDaemon
        );
        assert_eq!(
            ServiceType::resolve("clouddriverbootstrap").unwrap(),
            ServiceType::ClouddriverBootstrap
        );
    }

    #[test]
    fn test_resolve_unknown() {
        let err = ServiceType::resolve("kayenta").unwrap_err();
        assert!(matches!(err, DeployError::UnknownService { ref name } if name == "kayenta"));
    }

    #[test]
    fn test_canonical_names_round_trip() {
        for ty in ServiceType::ALL {
            assert_eq!(ServiceType::resolve(ty.canonical_name()).unwrap(), ty);
            assert_eq!(ty.service_name(), format!("spin-{}", ty.canonical_name()));
        }
    }

    #[test]
    fn test_deploy_order() {
        let mut services = vec![
            ServiceType::Deck,
            ServiceType::Front50,
            ServiceType::Redis,
            ServiceType::Gate,
            ServiceType::Orca,
        ];
        deploy_order(&mut services);
        assert_eq!(
            services,
            vec![
                ServiceType::Redis,
                ServiceType::Front50,
                ServiceType::Orca,
                ServiceType::Deck,
                ServiceType::Gate,
            ]
        );
    }

    #[test]
    fn test_serde_uses_canonical_name() {
        let json = serde_json::to_string(&ServiceType::Front50).unwrap();
        assert_eq!(json, "\"front50\"");
        let back: ServiceType = serde_json::from_str("\"front-50\"").unwrap();
        assert_eq!(back, ServiceType::Front50);
    }
}
