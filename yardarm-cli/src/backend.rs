//! Simulated cloud and secret backends, persisted between invocations

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use yardarm_core::compute::{ComputeState, InMemoryCompute};
use yardarm_core::secrets::{InMemorySecretStore, StoredSecret};

pub const DEFAULT_STATE_FILE: &str = ".yardarm-state.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct BackendState {
    #[serde(default)]
    compute: ComputeState,
    /// deployment -> secret name -> secret
    #[serde(default)]
    secrets: BTreeMap<String, BTreeMap<String, StoredSecret>>,
}

pub struct SimulatedBackend {
    path: PathBuf,
    pub compute: Arc<InMemoryCompute>,
    pub secrets: Arc<InMemorySecretStore>,
}

impl SimulatedBackend {
    /// Load backend state from `path`; a missing file is an empty backend
    pub fn load(path: &Path) -> Result<Self> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read backend state {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("corrupt backend state {}", path.display()))?
        } else {
            BackendState::default()
        };

        tracing::debug!(
            path = %path.display(),
            groups = state.compute.groups.len(),
            "loaded simulated backend"
        );
        Ok(Self {
            path: path.to_path_buf(),
            compute: Arc::new(InMemoryCompute::from_state(state.compute)),
            secrets: Arc::new(InMemorySecretStore::from_snapshot(state.secrets)),
        })
    }

    pub async fn save(&self) -> Result<()> {
        let state = BackendState {
            compute: self.compute.snapshot()?,
            secrets: self.secrets.snapshot().await,
        };
        let content = serde_json::to_string_pretty(&state)?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("failed to write backend state {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yardarm_core::secrets::SecretStore;

    #[tokio::test]
    async fn test_state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let backend = SimulatedBackend::load(&path).unwrap();
        backend
            .secrets
            .publish("default", "hal-gate-profile-gate.yml-0-abc", Path::new("/s/gate.yml"), b"x")
            .await
            .unwrap();
        backend.save().await.unwrap();

        let reloaded = SimulatedBackend::load(&path).unwrap();
        assert_eq!(
            reloaded.secrets.names("default").await,
            vec!["hal-gate-profile-gate.yml-0-abc".to_string()]
        );
    }
}
