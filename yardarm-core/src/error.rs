//! Error taxonomy for deployment orchestration
//!
//! Every failure in staging, provisioning, or polling surfaces as a
//! [`DeployError`]. Callers that need to decide how to present a failure
//! (bug report vs. fix-your-config vs. "deploy first") use [`DeployError::class`].

use thiserror::Error;

use crate::config::ConfigError;

/// Broad category of a [`DeployError`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input from the operator (unknown service, malformed URL, bad plan)
    User,
    /// A cloud or secret-store call failed
    Backend,
    /// A collaborator broke its contract; this is a bug, not a user error
    Defect,
    /// Nothing is deployed to act on
    NotDeployed,
}

impl ErrorClass {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClass::User => "user error",
            ErrorClass::Backend => "backend failure",
            ErrorClass::Defect => "internal defect",
            ErrorClass::NotDeployed => "not deployed",
        }
    }
}

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("no service with canonical name '{name}' exists")]
    UnknownService { name: String },

    #[error("illegal override base URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid deployment plan: {0}")]
    Config(#[from] ConfigError),

    #[error("{operation} failed for {service}{}: {message}", version_suffix(.version))]
    Backend {
        service: String,
        version: Option<u32>,
        operation: String,
        message: String,
    },

    #[error("failed to publish secret '{secret}': {message}")]
    SecretPublish { secret: String, message: String },

    #[error("assertion violated: {message}")]
    Invariant { message: String },

    #[error("cannot connect to {service}: {reason}")]
    NotDeployed { service: String, reason: String },

    #[error("cannot roll back {service}: need at least two versions, found {versions:?}")]
    NothingToRollBack { service: String, versions: Vec<u32> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn version_suffix(version: &Option<u32>) -> String {
    match version {
        Some(v) => format!(" (version {})", v),
        None => String::new(),
    }
}

impl DeployError {
    /// Wrap a failed backend call with the service and version it was acting on
    pub fn backend(
        service: impl Into<String>,
        version: Option<u32>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        DeployError::Backend {
            service: service.into(),
            version,
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        DeployError::Invariant {
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            DeployError::UnknownService { .. }
            | DeployError::InvalidUrl { .. }
            | DeployError::Config(_) => ErrorClass::User,
            DeployError::Backend { .. } | DeployError::SecretPublish { .. } | DeployError::Io(_) => {
                ErrorClass::Backend
            }
            DeployError::Invariant { .. } => ErrorClass::Defect,
            DeployError::NotDeployed { .. } | DeployError::NothingToRollBack { .. } => {
                ErrorClass::NotDeployed
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, DeployError>;
