//! Persistence for agent records and their status history
//!
//! The registry only talks to [`AgentStore`]. Two implementations ship with
//! the crate: [`MemoryStore`] keeps everything in process, and
//! [`JsonFileStore`] mirrors the same data into a JSON file so known agents
//! survive a broker restart.

use crate::agent::{AgentRecord, AgentStatus, StatusChange};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur in store implementations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage format error: {0}")]
    Format(#[from] serde_json::Error),
}

/// Trait for persisting agents
#[async_trait]
pub trait AgentStore: Send + Sync {
    /// All known agents
    async fn load_agents(&self) -> Result<Vec<AgentRecord>, StoreError>;

    /// Insert or replace an agent record
    async fn save_agent(&self, record: &AgentRecord) -> Result<(), StoreError>;

    /// Append to an agent's status history
    async fn log_status_change(
        &self,
        hw_id: u64,
        status: AgentStatus,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Remove an agent and its history. Returns whether it existed.
    async fn delete_agent(&self, hw_id: u64) -> Result<bool, StoreError>;

    /// Status history of an agent, oldest first
    async fn status_log(&self, hw_id: u64) -> Result<Vec<StatusChange>, StoreError>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreData {
    agents: BTreeMap<u64, AgentRecord>,
    #[serde(default)]
    log: BTreeMap<u64, Vec<StatusChange>>,
}

impl StoreData {
    fn save(&mut self, record: &AgentRecord) {
        self.agents.insert(record.hw_id, record.clone());
    }

    fn log(&mut self, hw_id: u64, status: AgentStatus, timestamp: DateTime<Utc>) {
        self.log
            .entry(hw_id)
            .or_default()
            .push(StatusChange { status, timestamp });
    }

    fn delete(&mut self, hw_id: u64) -> bool {
        self.log.remove(&hw_id);
        self.agents.remove(&hw_id).is_some()
    }

    fn history(&self, hw_id: u64) -> Vec<StatusChange> {
        self.log.get(&hw_id).cloned().unwrap_or_default()
    }
}

/// In-memory agent store (default implementation)
/// All data is lost when the broker restarts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate with known agents
    pub fn with_agents(records: impl IntoIterator<Item = AgentRecord>) -> Self {
        let mut data = StoreData::default();
        for record in records {
            data.save(&record);
        }
        Self {
            data: Mutex::new(data),
        }
    }

    fn with_data<T>(&self, f: impl FnOnce(&mut StoreData) -> T) -> T {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut data)
    }
}

#[async_trait]
impl AgentStore for MemoryStore {
    async fn load_agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
        Ok(self.with_data(|data| data.agents.values().cloned().collect()))
    }

    async fn save_agent(&self, record: &AgentRecord) -> Result<(), StoreError> {
        self.with_data(|data| data.save(record));
        Ok(())
    }

    async fn log_status_change(
        &self,
        hw_id: u64,
        status: AgentStatus,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_data(|data| data.log(hw_id, status, timestamp));
        Ok(())
    }

    async fn delete_agent(&self, hw_id: u64) -> Result<bool, StoreError> {
        Ok(self.with_data(|data| data.delete(hw_id)))
    }

    async fn status_log(&self, hw_id: u64) -> Result<Vec<StatusChange>, StoreError> {
        Ok(self.with_data(|data| data.history(hw_id)))
    }
}

/// Agent store backed by a JSON file.
///
/// The whole file is rewritten after every change, through a temporary
/// file that is renamed into place.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    data: tokio::sync::Mutex<StoreData>,
}

impl JsonFileStore {
    /// Open the store, starting empty if the file does not exist yet
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => return Err(e.into()),
        };

        debug!(path = %path.display(), "Opened agent store");
        Ok(Self {
            path,
            data: tokio::sync::Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, data: &StoreData) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl AgentStore for JsonFileStore {
    async fn load_agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
        Ok(self.data.lock().await.agents.values().cloned().collect())
    }

    async fn save_agent(&self, record: &AgentRecord) -> Result<(), StoreError> {
        let mut data = self.data.lock().await;
        data.save(record);
        self.persist(&data).await
    }

    async fn log_status_change(
        &self,
        hw_id: u64,
        status: AgentStatus,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut data = self.data.lock().await;
        data.log(hw_id, status, timestamp);
        self.persist(&data).await
    }

    async fn delete_agent(&self, hw_id: u64) -> Result<bool, StoreError> {
        let mut data = self.data.lock().await;
        let existed = data.delete(hw_id);
        self.persist(&data).await?;
        Ok(existed)
    }

    async fn status_log(&self, hw_id: u64) -> Result<Vec<StatusChange>, StoreError> {
        Ok(self.data.lock().await.history(hw_id))
    }
}
