//! Installation peer id and the authenticated-user boundary

use crate::channel::PeerId;
use rand::Rng;
use shared::{now_millis, KeyValueStore};
use tracing::{debug, info, warn};

/// Storage key holding this installation's peer id
pub const PEER_ID_KEY: &str = "mesh-peer-id";

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Supplies the currently authenticated user, if any
pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> Option<String>;
}

/// Identity fixed at construction time
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    user_id: Option<String>,
}

impl StaticIdentity {
    pub fn new(user_id: Option<String>) -> Self {
        Self { user_id }
    }

    pub fn anonymous() -> Self {
        Self { user_id: None }
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user_id(&self) -> Option<String> {
        self.user_id.clone()
    }
}

/// Generate a fresh id of the form `peer-<epoch-ms>-<9 base36 chars>`
pub fn generate_peer_id() -> PeerId {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("peer-{}-{}", now_millis(), suffix)
}

/// Read the persisted peer id, creating and persisting one on first run
///
/// Storage failures never prevent startup: the id is then valid for this
/// process only.
pub async fn load_or_create_peer_id(storage: &dyn KeyValueStore) -> PeerId {
    match storage.get(PEER_ID_KEY).await {
        Ok(Some(id)) if !id.trim().is_empty() => {
            debug!(peer_id = %id, "Loaded peer id");
            return id;
        }
        Ok(_) => {}
        Err(e) => warn!(class = %e.class(), "Failed to read peer id: {}", e),
    }

    let id = generate_peer_id();
    if let Err(e) = storage.set(PEER_ID_KEY, &id).await {
        warn!(
            class = %e.class(),
            "Failed to persist peer id, using it for this session only: {}",
            e
        );
    }
    info!(peer_id = %id, "Generated new peer id");
    id
}
