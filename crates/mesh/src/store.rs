//! Durable local log of emergency broadcasts, deduplicated by id

use shared::{EmergencyBroadcast, KeyValueStore};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Storage key holding the serialized broadcast list
pub const STORAGE_KEY: &str = "offline-broadcasts";

/// Local broadcast store
///
/// Broadcasts are kept in insertion order and persisted as a whole list after
/// every admission. The in-memory list is authoritative; a failed write is
/// logged and the next successful write catches storage up.
pub struct LocalBroadcastStore {
    broadcasts: Mutex<Vec<EmergencyBroadcast>>,
    storage: Arc<dyn KeyValueStore>,
}

impl LocalBroadcastStore {
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self {
            broadcasts: Mutex::new(Vec::new()),
            storage,
        }
    }

    /// Restore the persisted list
    ///
    /// Missing or unreadable state yields an empty store. Broadcasts already
    /// admitted in memory are kept.
    pub async fn load(&self) {
        let restored: Vec<EmergencyBroadcast> = match self.storage.get(STORAGE_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(list) => list,
                Err(e) => {
                    warn!(key = STORAGE_KEY, "Discarding unparseable broadcast log: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(key = STORAGE_KEY, class = %e.class(), "Failed to read broadcast log: {}", e);
                Vec::new()
            }
        };

        let mut broadcasts = self.broadcasts.lock().await;
        let in_memory = std::mem::take(&mut *broadcasts);
        for broadcast in restored.into_iter().chain(in_memory) {
            if !broadcasts.iter().any(|b| b.id == broadcast.id) {
                broadcasts.push(broadcast);
            }
        }

        info!("Loaded {} stored broadcasts", broadcasts.len());
    }

    /// Admit a broadcast if its id is new
    ///
    /// # Returns
    /// * `true` if the broadcast was admitted
    /// * `false` if a broadcast with the same id is already stored
    pub async fn record(&self, broadcast: EmergencyBroadcast) -> bool {
        let mut broadcasts = self.broadcasts.lock().await;

        if broadcasts.iter().any(|b| b.id == broadcast.id) {
            debug!(broadcast_id = %broadcast.id, "Duplicate broadcast, dropping");
            return false;
        }

        debug!(broadcast_id = %broadcast.id, "Recording broadcast");
        broadcasts.push(broadcast);

        // Lock stays held so writes land in admission order
        self.persist(&broadcasts).await;
        true
    }

    async fn persist(&self, broadcasts: &[EmergencyBroadcast]) {
        let raw = match serde_json::to_string(broadcasts) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to serialize broadcast log: {}", e);
                return;
            }
        };

        if let Err(e) = self.storage.set(STORAGE_KEY, &raw).await {
            warn!(key = STORAGE_KEY, class = %e.class(), "Failed to persist broadcast log: {}", e);
        }
    }

    /// All broadcasts, newest first; equal timestamps keep admission order
    pub async fn all(&self) -> Vec<EmergencyBroadcast> {
        let mut sorted = self.broadcasts.lock().await.clone();
        sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sorted
    }

    /// The `limit` most recent broadcasts
    pub async fn recent(&self, limit: usize) -> Vec<EmergencyBroadcast> {
        let mut sorted = self.all().await;
        sorted.truncate(limit);
        sorted
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.broadcasts.lock().await.iter().any(|b| b.id == id)
    }

    pub async fn len(&self) -> usize {
        self.broadcasts.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.broadcasts.lock().await.is_empty()
    }
}
