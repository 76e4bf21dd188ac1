//! File-backed connectors.
//!
//! Directory and dashboard data are read from JSON files holding either a
//! batch object (`{"users": [...], "complete": true}`) or a bare array of
//! users. Applied actions are appended to a JSON-lines journal.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use usersync_engine::{
    Action, DashboardBatch, DashboardConnector, DashboardUser, DirectoryBatch, DirectoryConnector,
    DirectoryUser, SyncError, SyncResult,
};

use crate::config::FileConnectorConfig;

#[derive(Deserialize)]
#[serde(untagged)]
enum FileBatch<U> {
    Batch {
        users: Vec<U>,
        #[serde(default = "default_true")]
        complete: bool,
    },
    Users(Vec<U>),
}

fn default_true() -> bool {
    true
}

async fn read_users<U: DeserializeOwned>(path: &Path) -> SyncResult<(Vec<U>, bool)> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| SyncError::connector(format!("Failed to read {}: {e}", path.display())))?;
    let batch: FileBatch<U> = serde_json::from_str(&content)
        .map_err(|e| SyncError::connector(format!("Failed to parse {}: {e}", path.display())))?;
    Ok(match batch {
        FileBatch::Batch { users, complete } => (users, complete),
        FileBatch::Users(users) => (users, true),
    })
}

/// Directory connector reading a JSON file.
pub struct JsonDirectoryConnector {
    name: String,
    path: PathBuf,
}

impl JsonDirectoryConnector {
    pub fn new(name: impl Into<String>, config: &FileConnectorConfig) -> Self {
        Self {
            name: name.into(),
            path: config.path.clone(),
        }
    }
}

#[async_trait]
impl DirectoryConnector for JsonDirectoryConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load_users(&self) -> SyncResult<DirectoryBatch> {
        let (users, complete) = read_users::<DirectoryUser>(&self.path).await?;
        debug!(connector = %self.name, users = users.len(), "Directory file read");
        Ok(DirectoryBatch { users, complete })
    }
}

/// Dashboard connector reading a JSON file and journaling applied actions.
pub struct JsonDashboardConnector {
    path: PathBuf,
    journal: Option<Mutex<File>>,
}

impl JsonDashboardConnector {
    /// Open the connector. The journal file is created or appended to.
    pub fn open(config: &FileConnectorConfig) -> SyncResult<Self> {
        let journal = config
            .journal
            .as_ref()
            .map(|path| {
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map(|file| Mutex::new(File::from_std(file)))
                    .map_err(|e| {
                        SyncError::connector(format!("Failed to open journal {}: {e}", path.display()))
                    })
            })
            .transpose()?;
        Ok(Self {
            path: config.path.clone(),
            journal,
        })
    }

    /// Whether applied actions can be recorded.
    pub fn can_apply(&self) -> bool {
        self.journal.is_some()
    }
}

#[async_trait]
impl DashboardConnector for JsonDashboardConnector {
    async fn load_users(&self) -> SyncResult<DashboardBatch> {
        let (users, complete) = read_users::<DashboardUser>(&self.path).await?;
        Ok(DashboardBatch { users, complete })
    }

    async fn apply(&self, action: &Action) -> SyncResult<()> {
        let journal = self
            .journal
            .as_ref()
            .ok_or_else(|| SyncError::connector("dashboard connector has no journal configured"))?;
        let mut line = serde_json::to_string(action)?;
        line.push('\n');
        let mut file = journal.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
