pub mod config;
pub mod error;
pub mod service;
pub mod settings;

// Deployment state and generated configuration
pub mod profile;
pub mod running;

// Publishing config to instances
pub mod secrets;
pub mod staging;

// Execution-engine documents
pub mod pipeline;

// Provider drivers
pub mod compute;
pub mod driver;
pub mod instance_group;

pub use error::{DeployError, ErrorClass, Result};
