//! Provider registry: builds one backend per configured provider and hands
//! them out by provider id.

use super::{LocalBackend, MemoryBackend, StorageBackend};
use crate::{
    config::{ProviderConfig, ProviderKind},
    errors::{BackendError, ConfigError},
};
use std::{collections::HashMap, sync::Arc};
use tracing::{info, warn};

#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn StorageBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a backend for every provider, selecting the implementation by
    /// provider type.
    pub async fn from_providers(providers: &[ProviderConfig]) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for provider in providers {
            info!(
                provider_id = %provider.id,
                provider_type = provider.kind.type_name(),
                "initializing storage provider"
            );
            let backend = match build_backend(&provider.kind).await {
                Ok(backend) => backend,
                Err(source) => {
                    registry.close_all().await;
                    return Err(ConfigError::Backend {
                        id: provider.id.clone(),
                        source,
                    });
                }
            };
            registry.register(provider.id.clone(), backend);
        }
        Ok(registry)
    }

    /// Add or replace the backend for `id`.
    pub fn register(&mut self, id: impl Into<String>, backend: Arc<dyn StorageBackend>) {
        self.backends.insert(id.into(), backend);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn StorageBackend>, ConfigError> {
        self.backends
            .get(id)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownProvider(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Close every backend, logging failures instead of stopping at the first.
    pub async fn close_all(&self) {
        for (id, backend) in &self.backends {
            if let Err(err) = backend.close().await {
                warn!(provider_id = %id, "failed to close storage provider: {}", err);
            }
        }
        info!("storage provider connections closed");
    }
}

async fn build_backend(kind: &ProviderKind) -> Result<Arc<dyn StorageBackend>, BackendError> {
    match kind {
        ProviderKind::Local { root } => {
            tokio::fs::create_dir_all(root)
                .await
                .map_err(|err| BackendError::io(format!("create root {}", root.display()), err))?;
            Ok(Arc::new(LocalBackend::new(root.clone())))
        }
        ProviderKind::Memory => Ok(Arc::new(MemoryBackend::new())),
    }
}
