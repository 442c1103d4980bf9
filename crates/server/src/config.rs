use anyhow::{Context, Result};
use nvent_core::storage::{FileStore, MemoryStore, Store};
use nvent_core::{NventService, RuntimeConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    File,
}

fn default_backend() -> StorageBackend {
    StorageBackend::File
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                runtime: RuntimeConfig::default(),
                storage: StorageConfig::default(),
            }
        };

        config.data_dir = data_dir;
        Ok(config)
    }

    pub fn open_store(&self) -> Result<Arc<dyn Store>> {
        Ok(match self.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
            StorageBackend::File => Arc::new(
                FileStore::new(&self.data_dir).context("Failed to open file store")?,
            ),
        })
    }
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<NventService>,
    /// Flips to true when the process is shutting down; WebSocket peers
    /// get a 1001 close so clients reconnect with backoff.
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(service: Arc<NventService>) -> (Self, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                service,
                shutdown: rx,
            },
            tx,
        )
    }
}
