//! Secret distribution collaborator
//!
//! Staged configuration reaches running instances through a flat, shared secret
//! namespace. Publishing overwrites or creates; a published secret is retrievable
//! by name at deploy time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{DeployError, Result};

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Publish `contents` (read from `file`) under `secret_name`
    async fn publish(
        &self,
        deployment: &str,
        secret_name: &str,
        file: &Path,
        contents: &[u8],
    ) -> Result<()>;

    /// Fetch a published secret's contents
    async fn fetch(&self, deployment: &str, secret_name: &str) -> Result<Option<Vec<u8>>>;
}

/// A published secret
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSecret {
    pub source: PathBuf,
    pub contents: Vec<u8>,
}

/// Secret store kept in process memory
#[derive(Debug, Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<BTreeMap<String, BTreeMap<String, StoredSecret>>>,
    /// Publishes whose secret name contains this fragment fail
    fail_matching: Option<String>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a store from a previous [`snapshot`](Self::snapshot)
    pub fn from_snapshot(secrets: BTreeMap<String, BTreeMap<String, StoredSecret>>) -> Self {
        Self {
            secrets: RwLock::new(secrets),
            fail_matching: None,
        }
    }

    /// Make publishes of matching secret names fail (for exercising error paths)
    pub fn failing_on(mut self, fragment: impl Into<String>) -> Self {
        self.fail_matching = Some(fragment.into());
        self
    }

    pub async fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, StoredSecret>> {
        self.secrets.read().await.clone()
    }

    /// Secret names published for a deployment, in name order
    pub async fn names(&self, deployment: &str) -> Vec<String> {
        self.secrets
            .read()
            .await
            .get(deployment)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.secrets.read().await.values().map(BTreeMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn publish(
        &self,
        deployment: &str,
        secret_name: &str,
        file: &Path,
        contents: &[u8],
    ) -> Result<()> {
        if let Some(fragment) = &self.fail_matching {
            if secret_name.contains(fragment.as_str()) {
                return Err(DeployError::SecretPublish {
                    secret: secret_name.to_string(),
                    message: "secret store rejected the write".to_string(),
                });
            }
        }

        self.secrets
            .write()
            .await
            .entry(deployment.to_string())
            .or_default()
            .insert(
                secret_name.to_string(),
                StoredSecret {
                    source: file.to_path_buf(),
                    contents: contents.to_vec(),
                },
            );
        Ok(())
    }

    async fn fetch(&self, deployment: &str, secret_name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .secrets
            .read()
            .await
            .get(deployment)
            .and_then(|m| m.get(secret_name))
            .map(|s| s.contents.clone()))
    }
}
