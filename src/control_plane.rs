//! Wiring of store, engine, registry and workflows.

use std::sync::Arc;
use std::time::Duration;

use armada_tasks::engine::TaskEngine;
use armada_tasks::store::file::FileBackend;
use armada_tasks::store::memory::InMemoryBackend;
use armada_tasks::store::TaskStore;
use tokio::task::JoinHandle;

use crate::config::{BackendKind, ControlPlaneConfig};
use crate::error::{ConfigError, ControlPlaneError};
use crate::registry::ResourceRegistry;
use crate::workflows::{register_all, Adapters, Services};

/// A running control plane: one engine with every workflow registered.
///
/// # Examples
///
/// ```
/// use armada::config::ControlPlaneConfig;
/// use armada::control_plane::ControlPlane;
/// use armada::workflows::Adapters;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let plane = ControlPlane::from_config(ControlPlaneConfig::default(), Adapters::scripted())
///     .await
///     .unwrap();
/// assert!(plane.engine().is_registered("container-host-provisioning"));
/// assert_eq!(plane.recover().await.unwrap(), 0);
/// # });
/// ```
#[derive(Clone)]
pub struct ControlPlane {
    engine: TaskEngine,
    registry: Arc<ResourceRegistry>,
    config: ControlPlaneConfig,
}

impl ControlPlane {
    /// Opens the configured store and registers all workflows with a
    /// fresh registry.
    ///
    /// # Errors
    ///
    /// - [`ControlPlaneError::Config`] for a backend without its settings,
    ///   or Redis without the `redis` feature.
    /// - [`ControlPlaneError::Storage`] if the backend can not be opened.
    pub async fn from_config(config: ControlPlaneConfig, adapters: Adapters) -> Result<Self, ControlPlaneError> {
        Self::with_registry(config, adapters, Arc::new(ResourceRegistry::new())).await
    }

    /// Like [`from_config`](Self::from_config) with an existing registry.
    ///
    /// # Errors
    ///
    /// See [`from_config`](Self::from_config).
    pub async fn with_registry(
        config: ControlPlaneConfig,
        adapters: Adapters,
        registry: Arc<ResourceRegistry>,
    ) -> Result<Self, ControlPlaneError> {
        let store = open_store(&config).await?;
        let engine = TaskEngine::new(store, config.engine.clone());
        let services = Services::new(Arc::clone(&registry), adapters).with_settings(config.workflows.clone());
        register_all(&engine, &services);
        tracing::info!(backend = ?config.store.backend, "control plane ready");
        Ok(Self {
            engine,
            registry,
            config,
        })
    }

    pub fn engine(&self) -> &TaskEngine {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    /// Resumes the non-terminal tasks found in the store and fails the
    /// overdue ones. Returns the number of resumed tasks.
    ///
    /// # Errors
    ///
    /// Returns the first store failure.
    pub async fn recover(&self) -> Result<usize, ControlPlaneError> {
        let expired = self.engine.expire_overdue().await?;
        let resumed = self.engine.resume_all().await?;
        if resumed + expired > 0 {
            tracing::info!(resumed, expired, "recovered tasks");
        }
        Ok(resumed)
    }

    /// Expires overdue tasks and deletes expired terminal records every
    /// `interval` until the handle is aborted.
    pub fn spawn_maintenance(&self, interval: Duration) -> JoinHandle<()> {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = engine.expire_overdue().await {
                    tracing::warn!(error = %e, "expiring overdue tasks failed");
                }
                match engine.store().cleanup_expired().await {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(removed, "deleted expired task records"),
                    Err(e) => tracing::warn!(error = %e, "task record cleanup failed"),
                }
            }
        })
    }
}

async fn open_store(config: &ControlPlaneConfig) -> Result<TaskStore, ControlPlaneError> {
    let settings = &config.store;
    let store = match settings.backend {
        BackendKind::Memory => TaskStore::new(InMemoryBackend::new()),
        BackendKind::File => {
            let path = settings.path.clone().ok_or_else(|| ConfigError::Invalid {
                key: "store.path".to_string(),
                message: "the file backend needs a directory".to_string(),
            })?;
            TaskStore::new(FileBackend::open(path).await?)
        }
        BackendKind::Redis => open_redis(settings).await?,
    };
    Ok(store.with_config(settings.store_config()))
}

#[cfg(feature = "redis")]
async fn open_redis(settings: &crate::config::StoreSettings) -> Result<TaskStore, ControlPlaneError> {
    use armada_tasks::store::redis::RedisBackend;

    let url = settings.url.as_deref().ok_or_else(|| ConfigError::Invalid {
        key: "store.url".to_string(),
        message: "the redis backend needs a connection URL".to_string(),
    })?;
    let mut backend = RedisBackend::new(url).await?;
    if let Some(prefix) = &settings.prefix {
        backend = backend.with_prefix(prefix);
    }
    Ok(TaskStore::new(backend))
}

#[cfg(not(feature = "redis"))]
async fn open_redis(_settings: &crate::config::StoreSettings) -> Result<TaskStore, ControlPlaneError> {
    Err(ConfigError::Invalid {
        key: "store.backend".to_string(),
        message: "built without the redis feature".to_string(),
    }
    .into())
}
