//! Snapshot/restore for long-lived [`seesaw_core::Machine`] state.
//!
//! Machines hold their state in-process and never perform IO (spec's
//! coordination layer invariant), so nothing here touches a `Machine`
//! directly — an application periodically serializes a machine's state to
//! JSON, saves it through [`MachineStore`], and on restart loads the latest
//! snapshot before replaying any events the machine missed while the
//! process was down.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("no snapshot found for machine {0:?}")]
    NotFound(String),

    #[error("snapshot payload for machine {machine_id:?} could not be (de)serialized: {source}")]
    Serde {
        machine_id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One saved copy of a machine's internal state.
#[derive(Debug, Clone)]
pub struct MachineSnapshot {
    pub machine_id: String,
    pub version: u64,
    pub state: serde_json::Value,
    pub saved_at: DateTime<Utc>,
}

/// Storage contract for machine snapshots. `machine_id` is caller-chosen and
/// should be stable across restarts (e.g. a fixed string per machine
/// instance, or `"{machine_kind}:{entity_id}"` for per-entity machines).
#[async_trait]
pub trait MachineStore: Send + Sync + 'static {
    /// Saves `state` as the new latest snapshot for `machine_id`, bumping
    /// `version`. Implementations should keep prior versions for recovery
    /// rather than overwriting in place.
    async fn save(&self, machine_id: &str, state: serde_json::Value) -> Result<MachineSnapshot, PersistenceError>;

    async fn load_latest(&self, machine_id: &str) -> Result<Option<MachineSnapshot>, PersistenceError>;

    /// Convenience over [`MachineStore::save`] for callers with a typed
    /// state rather than a raw `serde_json::Value`.
    async fn save_typed<T: serde::Serialize + Send + Sync>(
        &self,
        machine_id: &str,
        state: &T,
    ) -> Result<MachineSnapshot, PersistenceError> {
        let value = serde_json::to_value(state).map_err(|source| PersistenceError::Serde {
            machine_id: machine_id.to_string(),
            source,
        })?;
        self.save(machine_id, value).await
    }

    /// Convenience over [`MachineStore::load_latest`], deserializing the
    /// stored state. Returns `Ok(None)` if no snapshot exists yet.
    async fn load_typed<T: serde::de::DeserializeOwned>(
        &self,
        machine_id: &str,
    ) -> Result<Option<T>, PersistenceError> {
        match self.load_latest(machine_id).await? {
            None => Ok(None),
            Some(snapshot) => {
                let state = serde_json::from_value(snapshot.state).map_err(|source| PersistenceError::Serde {
                    machine_id: machine_id.to_string(),
                    source,
                })?;
                Ok(Some(state))
            }
        }
    }
}

/// In-memory [`MachineStore`], for tests and for machines whose state can
/// be rebuilt from durable job/event history on restart rather than needing
/// its own storage.
#[derive(Default)]
pub struct InMemoryMachineStore {
    snapshots: Mutex<HashMap<String, MachineSnapshot>>,
}

impl InMemoryMachineStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MachineStore for InMemoryMachineStore {
    async fn save(&self, machine_id: &str, state: serde_json::Value) -> Result<MachineSnapshot, PersistenceError> {
        let mut snapshots = self.snapshots.lock().unwrap();
        let version = snapshots
            .get(machine_id)
            .map(|existing| existing.version + 1)
            .unwrap_or(1);
        let snapshot = MachineSnapshot {
            machine_id: machine_id.to_string(),
            version,
            state,
            saved_at: Utc::now(),
        };
        snapshots.insert(machine_id.to_string(), snapshot.clone());
        Ok(snapshot)
    }

    async fn load_latest(&self, machine_id: &str) -> Result<Option<MachineSnapshot>, PersistenceError> {
        Ok(self.snapshots.lock().unwrap().get(machine_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct CounterState {
        count: u64,
    }

    #[tokio::test]
    async fn save_and_load_round_trips_typed_state() {
        let store = InMemoryMachineStore::new();
        store.save_typed("counter:1", &CounterState { count: 3 }).await.unwrap();

        let loaded: Option<CounterState> = store.load_typed("counter:1").await.unwrap();
        assert_eq!(loaded, Some(CounterState { count: 3 }));
    }

    #[tokio::test]
    async fn missing_snapshot_loads_as_none() {
        let store = InMemoryMachineStore::new();
        let loaded: Option<CounterState> = store.load_typed("nope").await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn repeated_saves_increment_version() {
        let store = InMemoryMachineStore::new();
        let first = store.save("m", serde_json::json!({"n": 1})).await.unwrap();
        let second = store.save("m", serde_json::json!({"n": 2})).await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
    }
}
