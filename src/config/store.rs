use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by a TOML file
///
/// Uses `ArcSwap` for lock-free reads, so hot paths can call [`get`](Self::get)
/// freely.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    /// Lock-free cache using ArcSwap for zero-cost reads
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub path: PathBuf,
}

impl ConfigStore {
    /// Load configuration from `path`, writing defaults if the file is missing
    pub async fn new(path: &Path) -> Result<Self> {
        let config = if tokio::fs::try_exists(path).await? {
            let raw = tokio::fs::read_to_string(path).await?;
            toml::from_str::<AppConfig>(&raw)
                .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?
        } else {
            tracing::info!(
                "Config file {} not found, writing defaults",
                path.display()
            );
            let config = AppConfig::default();
            Self::persist(path, &config).await?;
            config
        };

        Ok(Self::with_config(path, config))
    }

    /// Build a store around an in-memory config (nothing read from disk)
    pub fn with_config(path: &Path, config: AppConfig) -> Self {
        let (change_tx, _) = broadcast::channel(16);
        Self {
            path: path.to_path_buf(),
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        }
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Replace the whole configuration and persist it
    pub async fn set(&self, config: AppConfig) -> Result<()> {
        Self::persist(&self.path, &config).await?;
        self.cache.store(Arc::new(config));
        let _ = self.change_tx.send(ConfigChange {
            path: self.path.clone(),
        });
        Ok(())
    }

    /// Update configuration with a closure and persist it
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = (*self.get()).clone();
        f(&mut config);
        self.set(config).await
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(path: &Path, config: &AppConfig) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let raw = toml::to_string_pretty(config)
            .map_err(|e| AppError::Config(format!("failed to serialize config: {}", e)))?;
        tokio::fs::write(path, raw).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.toml");

        let store = ConfigStore::new(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(*store.get(), AppConfig::default());
    }

    #[tokio::test]
    async fn test_update_persists_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mirror.toml");

        let store = ConfigStore::new(&path).await.unwrap();
        let mut rx = store.subscribe();

        store
            .update(|cfg| cfg.transport.max_outstanding_bytes = 4096)
            .await
            .unwrap();

        assert_eq!(store.get().transport.max_outstanding_bytes, 4096);
        assert!(rx.recv().await.is_ok());

        let reloaded = ConfigStore::new(&path).await.unwrap();
        assert_eq!(reloaded.get().transport.max_outstanding_bytes, 4096);
    }

    #[tokio::test]
    async fn test_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        tokio::fs::write(&path, "[web\nhttp_port = ").await.unwrap();

        let result = ConfigStore::new(&path).await;
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
