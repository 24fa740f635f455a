pub mod models;
pub mod error;
pub mod config;
pub mod storage;

pub use error::{Error, ErrorClass, Result};
pub use models::{now_millis, BroadcastKind, EmergencyBroadcast, GeoLocation};
pub use storage::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
