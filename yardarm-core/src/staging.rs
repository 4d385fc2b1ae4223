//! Configuration staging
//!
//! Turns generated profiles and the files they depend on into secrets, and
//! returns where each secret must be mounted on the instances of a version.
//!
//! Files referenced by a profile can live anywhere on the operator's machine.
//! They are first flattened into a staging area by a [`StagingCache`], keyed by a
//! hash of their source path so two files with the same name never clash.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{DeployError, Result};
use crate::profile::{MONITORING_PROFILE_NAME, ResolvedConfiguration, StagedFile, registry_profile_name};
use crate::secrets::SecretStore;
use crate::service::ServiceType;

/// Length of the random suffix appended to secret names
const SECRET_SUFFIX_LEN: usize = 10;
const SECRET_SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// A secret and the path its contents must appear at on a running instance
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConfigSource {
    pub id: String,
    pub mount_path: PathBuf,
}

impl ConfigSource {
    pub fn new(id: impl Into<String>, mount_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            mount_path: mount_path.into(),
        }
    }
}

/// Secret name for one piece of a service's configuration at a version.
///
/// The secret namespace is flat and shared by every deployment, so the name
/// ends in a random suffix: the same (service, detail, version) staged twice
/// must not overwrite an earlier run's secret.
pub fn secret_name(service: ServiceType, detail: &str, version: u32) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SECRET_SUFFIX_LEN)
        .map(|_| SECRET_SUFFIX_CHARSET[rng.gen_range(0..SECRET_SUFFIX_CHARSET.len())] as char)
        .collect();
    format!(
        "hal-{}-{}-{}-{}",
        service.canonical_name(),
        detail,
        version,
        suffix
    )
}

/// Flattens files into a staging area and reads staged files back
pub trait StagingCache: Send + Sync {
    /// Copy `source` into the staging area, returning its staged path.
    /// Files already inside the staging area are returned unchanged.
    fn stage(&self, source: &Path) -> Result<PathBuf>;

    /// Read a staged file's contents
    fn read(&self, staged: &Path) -> Result<Vec<u8>>;
}

/// Staged file name for a source path: `<hash of path>-<file name>`
pub fn staged_file_name(source: &Path) -> String {
    let digest = Sha256::digest(source.to_string_lossy().as_bytes());
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}-{}", hex::encode(&digest[..8]), name)
}

/// Staging area backed by a directory on disk
#[derive(Clone, Debug)]
pub struct DirStagingCache {
    root: PathBuf,
}

impl DirStagingCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl StagingCache for DirStagingCache {
    fn stage(&self, source: &Path) -> Result<PathBuf> {
        if source.parent() == Some(self.root.as_path()) {
            return Ok(source.to_path_buf());
        }

        std::fs::create_dir_all(&self.root)?;
        let staged = self.root.join(staged_file_name(source));
        std::fs::copy(source, &staged).map_err(|e| {
            DeployError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to back up user file {}: {}", source.display(), e),
            ))
        })?;
        Ok(staged)
    }

    fn read(&self, staged: &Path) -> Result<Vec<u8>> {
        Ok(std::fs::read(staged)?)
    }
}

/// Staging area held in memory; source files are registered up front
#[derive(Debug, Default)]
pub struct MemoryStagingCache {
    root: PathBuf,
    files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
}

impl MemoryStagingCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a file's contents at a path
    pub fn insert(&self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(path.into(), contents.into());
        }
    }

    pub fn with_file(self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        self.insert(path, contents);
        self
    }

    fn lookup(&self, path: &Path) -> Result<Vec<u8>> {
        let files = self
            .files
            .lock()
            .map_err(|_| DeployError::invariant("staging cache lock poisoned"))?;
        files.get(path).cloned().ok_or_else(|| {
            DeployError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no staged file at {}", path.display()),
            ))
        })
    }
}

impl StagingCache for MemoryStagingCache {
    fn stage(&self, source: &Path) -> Result<PathBuf> {
        if source.parent() == Some(self.root.as_path()) {
            return Ok(source.to_path_buf());
        }
        let contents = self.lookup(source)?;
        let staged = self.root.join(staged_file_name(source));
        self.insert(staged.clone(), contents);
        Ok(staged)
    }

    fn read(&self, staged: &Path) -> Result<Vec<u8>> {
        self.lookup(staged)
    }
}

/// Collaborators used while staging one deployment's configuration
pub struct StagingContext<'a> {
    /// Deployment the secrets belong to
    pub deployment: &'a str,
    pub secrets: &'a dyn SecretStore,
    pub cache: &'a dyn StagingCache,
}

impl StagingContext<'_> {
    async fn publish(&self, secret: &str, staged: &Path) -> Result<()> {
        let contents = self.cache.read(staged)?;
        debug!(secret = %secret, file = %staged.display(), bytes = contents.len(), "publishing secret");
        self.secrets
            .publish(self.deployment, secret, staged, &contents)
            .await
    }

    async fn publish_profile(&self, secret: String, profile: &StagedFile) -> Result<ConfigSource> {
        self.publish(&secret, &profile.staged_path).await?;
        Ok(ConfigSource::new(secret, profile.output_file.clone()))
    }
}

/// Publish every config file a service needs at `version`.
///
/// Order of the result: monitoring profiles (when monitored), the service's own
/// profiles by name, then dependency files by declared path. The first failed
/// publish aborts staging; secrets already published are left in place.
pub async fn stage_profiles(
    ctx: &StagingContext<'_>,
    service: ServiceType,
    version: u32,
    resolved: &ResolvedConfiguration,
) -> Result<Vec<ConfigSource>> {
    let settings = resolved.service_settings(service).ok_or_else(|| {
        DeployError::invariant(format!("no settings resolved for {}", service))
    })?;

    info!(service = %service, version, "staging profiles");
    let mut config_sources = Vec::new();

    if settings.monitored && resolved.monitoring_enabled() {
        let monitoring = resolved.profiles_for(ServiceType::MonitoringDaemon);
        let registry_name = registry_profile_name(service);

        let registry = monitoring.and_then(|p| p.get(&registry_name)).ok_or_else(|| {
            DeployError::invariant(format!(
                "monitoring enabled for {} but no registry entry '{}' was generated",
                service, registry_name
            ))
        })?;
        let secret = secret_name(service, &registry.name, version);
        config_sources.push(ctx.publish_profile(secret, registry).await?);

        let daemon = monitoring
            .and_then(|p| p.get(MONITORING_PROFILE_NAME))
            .ok_or_else(|| {
                DeployError::invariant(format!(
                    "monitoring enabled for {} but no '{}' profile was generated",
                    service, MONITORING_PROFILE_NAME
                ))
            })?;
        let secret = secret_name(service, &daemon.name, version);
        config_sources.push(ctx.publish_profile(secret, daemon).await?);
    }

    let mut required_files = BTreeSet::new();
    if let Some(profiles) = resolved.profiles_for(service) {
        for profile in profiles.values() {
            required_files.extend(profile.required_files.iter().cloned());

            let secret = secret_name(service, &format!("profile-{}", profile.name), version);
            config_sources.push(ctx.publish_profile(secret, profile).await?);
        }
    }

    // Mounted at the declared path; the cache only supplies the bytes
    for file in &required_files {
        let staged = ctx.cache.stage(file)?;
        let secret = secret_name(
            service,
            &format!("dependencies-{}", file.display()),
            version,
        );
        ctx.publish(&secret, &staged).await?;
        config_sources.push(ConfigSource::new(secret, file.clone()));
    }

    info!(
        service = %service,
        version,
        config_sources = config_sources.len(),
        "staged profiles"
    );
    Ok(config_sources)
}
