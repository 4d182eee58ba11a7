use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store, optionally backed by a TOML file
///
/// Uses `ArcSwap` for lock-free reads; the client loads a fresh snapshot every
/// time it connects, so updates apply to the next connection.
#[derive(Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub key: String,
}

impl ConfigStore {
    /// In-memory store with the given configuration
    pub fn new(config: AppConfig) -> Self {
        let (change_tx, _) = broadcast::channel(16);
        Self {
            path: None,
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        }
    }

    /// Load from a TOML file; a missing file means defaults
    pub async fn open(path: &Path) -> Result<Self> {
        let config = match tokio::fs::read_to_string(path).await {
            Ok(text) => {
                info!("Loading configuration from {}", path.display());
                toml::from_str(&text)
                    .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No configuration at {}, using defaults", path.display());
                AppConfig::default()
            }
            Err(e) => return Err(e.into()),
        };

        let mut store = Self::new(config);
        store.path = Some(path.to_path_buf());
        Ok(store)
    }

    async fn persist(&self, config: &AppConfig) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let text = toml::to_string_pretty(config).map_err(|e| AppError::Config(e.to_string()))?;
        tokio::fs::write(path, text).await?;
        Ok(())
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Update configuration with a closure, persisting first when file-backed
    ///
    /// Read-modify-write: for concurrent updates the last write wins.
    pub async fn update<F>(&self, key: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let current = self.cache.load();
        let mut config = (**current).clone();
        f(&mut config);

        self.persist(&config).await?;
        self.cache.store(Arc::new(config));

        let _ = self.change_tx.send(ConfigChange {
            key: key.to_string(),
        });
        Ok(())
    }

    /// Apply overrides for this run only; nothing is written
    pub fn override_with<F>(&self, f: F)
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = (**self.cache.load()).clone();
        f(&mut config);
        self.cache.store(Arc::new(config));
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
