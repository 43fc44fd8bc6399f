use std::{fmt, path::PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{manifest::JsonLinesFile, storage::ObjectUri, training::ResourceConfig};

/// Request to put a model behind an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Endpoint name, unique among live endpoints.
    pub name: String,
    /// Model archive produced by training.
    pub model_artifact: ObjectUri,
    /// Serving compute.
    pub resources: ResourceConfig,
}

/// Endpoint lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    /// Being provisioned.
    Creating,
    /// Accepting requests.
    InService,
    /// Torn down.
    Deleted,
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creating => f.write_str("creating"),
            Self::InService => f.write_str("in_service"),
            Self::Deleted => f.write_str("deleted"),
        }
    }
}

/// A deployed model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Endpoint name.
    pub name: String,
    /// Invocation URL.
    pub url: String,
    /// Served model archive.
    pub model_artifact: ObjectUri,
    /// Serving compute.
    pub resources: ResourceConfig,
    /// Lifecycle state.
    pub status: EndpointStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Errors raised by hosting services.
#[derive(Debug, Error)]
pub enum HostingError {
    /// A live endpoint already uses the name.
    #[error("endpoint '{0}' already exists")]
    AlreadyExists(String),
    /// No live endpoint with that name.
    #[error("endpoint '{0}' not found")]
    NotFound(String),
    /// Configuration rejected before provisioning.
    #[error("invalid endpoint config: {0}")]
    InvalidConfig(String),
    /// Registry persistence failed.
    #[error(transparent)]
    Registry(#[from] anyhow::Error),
}

/// Remote hosting boundary.
#[async_trait]
pub trait HostingService: Send + Sync {
    /// Provisions an endpoint serving `config.model_artifact`.
    async fn deploy(&self, config: &EndpointConfig) -> Result<Endpoint, HostingError>;

    /// Current record of a live endpoint.
    async fn describe(&self, name: &str) -> Result<Endpoint, HostingError>;

    /// Tears down a live endpoint.
    async fn delete(&self, name: &str) -> Result<Endpoint, HostingError>;
}

/// Bookkeeping-only hosting: endpoints are rows in a JSON-lines registry and
/// resolve to `{base_url}/endpoints/{name}/invocations` on a model server
/// managed outside this process.
#[derive(Debug)]
pub struct RegistryHostingService {
    base_url: String,
    registry: JsonLinesFile<Endpoint>,
}

impl RegistryHostingService {
    /// Creates a service with its registry at `registry_path`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, registry_path: impl Into<PathBuf>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            registry: JsonLinesFile::new(registry_path),
        }
    }

    /// Invocation URL for an endpoint name.
    #[must_use]
    pub fn invocation_url(&self, name: &str) -> String {
        format!("{}/endpoints/{name}/invocations", self.base_url)
    }

    /// Every endpoint ever recorded, oldest first.
    pub fn history(&self) -> Result<Vec<Endpoint>, HostingError> {
        Ok(self.registry.read_all()?)
    }

    fn live(&self, name: &str) -> Result<Option<Endpoint>, HostingError> {
        Ok(self
            .registry
            .read_all()?
            .into_iter()
            .rev()
            .find(|e| e.name == name && e.status != EndpointStatus::Deleted))
    }
}

fn validate_name(name: &str) -> Result<(), HostingError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !name.starts_with('-');
    if valid {
        Ok(())
    } else {
        Err(HostingError::InvalidConfig(format!(
            "name '{name}' must be 1-63 alphanumerics or '-', not starting with '-'"
        )))
    }
}

#[async_trait]
impl HostingService for RegistryHostingService {
    async fn deploy(&self, config: &EndpointConfig) -> Result<Endpoint, HostingError> {
        validate_name(&config.name)?;
        if config.resources.instance_count == 0 {
            return Err(HostingError::InvalidConfig(
                "instance_count must be > 0".into(),
            ));
        }
        if self.live(&config.name)?.is_some() {
            return Err(HostingError::AlreadyExists(config.name.clone()));
        }
        let endpoint = Endpoint {
            name: config.name.clone(),
            url: self.invocation_url(&config.name),
            model_artifact: config.model_artifact.clone(),
            resources: config.resources.clone(),
            status: EndpointStatus::InService,
            created_at: Utc::now(),
        };
        self.registry.append(&endpoint)?;
        Ok(endpoint)
    }

    async fn describe(&self, name: &str) -> Result<Endpoint, HostingError> {
        self.live(name)?
            .ok_or_else(|| HostingError::NotFound(name.to_string()))
    }

    async fn delete(&self, name: &str) -> Result<Endpoint, HostingError> {
        let mut endpoint = self.describe(name).await?;
        let created_at = endpoint.created_at;
        self.registry.update(|entry| {
            let target = entry.name == name
                && entry.created_at == created_at
                && entry.status != EndpointStatus::Deleted;
            if target {
                entry.status = EndpointStatus::Deleted;
            }
            target
        })?;
        endpoint.status = EndpointStatus::Deleted;
        Ok(endpoint)
    }
}
