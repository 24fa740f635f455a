use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub signaling: SignalingConfig,
    pub proximity: ProximityConfig,
    pub storage: StorageConfig,
    /// Identifier of the signed-in user, used as the broadcast originator
    pub user_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Name of the same-device discovery channel (default: emergency-mesh)
    pub channel_name: String,
    /// Interval of the signaling peer sweep in seconds (default: 30)
    pub peer_sweep_interval_secs: u64,
    /// Negotiating peers idle longer than this are dropped (default: 30)
    pub negotiation_timeout_secs: u64,
    /// Open peers idle longer than this are dropped (default: 600)
    pub peer_idle_timeout_secs: u64,
    /// Early candidates buffered per not-yet-known peer (default: 32)
    pub max_pending_candidates: usize,
    /// First loopback UDP port used to bridge signaling between processes (default: 47800)
    pub bridge_base_port: u16,
    /// Number of consecutive bridge ports, one per process (default: 8)
    pub bridge_slots: u16,
}

#[derive(Debug, Clone)]
pub struct ProximityConfig {
    /// Whether short-range radio discovery should be attempted (default: true)
    pub enabled: bool,
    /// Length of a single scan before it auto-stops (default: 10)
    pub scan_window_secs: u64,
    /// Interval of the stale nearby-peer sweep (default: 5)
    pub sweep_interval_secs: u64,
    /// Nearby peers unseen for longer than this are evicted (default: 30)
    pub stale_after_secs: u64,
    /// Interval between automatic re-scans when idle (default: 15)
    pub rescan_interval_secs: u64,
    /// Calibrated signal strength at one metre, in dBm (default: -59)
    pub reference_rssi: i16,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory for persisted broadcasts and peer identity (default: .emergency-mesh)
    pub dir: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            channel_name: "emergency-mesh".to_string(),
            peer_sweep_interval_secs: 30,
            negotiation_timeout_secs: 30,
            peer_idle_timeout_secs: 600,
            max_pending_candidates: 32,
            bridge_base_port: 47800,
            bridge_slots: 8,
        }
    }
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_window_secs: 10,
            sweep_interval_secs: 5,
            stale_after_secs: 30,
            rescan_interval_secs: 15,
            reference_rssi: -59,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: ".emergency-mesh".to_string(),
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            proximity: ProximityConfig::default(),
            storage: StorageConfig::default(),
            user_id: None,
        }
    }
}

impl SignalingConfig {
    pub fn peer_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.peer_sweep_interval_secs)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn peer_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_idle_timeout_secs)
    }
}

impl ProximityConfig {
    pub fn scan_window(&self) -> Duration {
        Duration::from_secs(self.scan_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs)
    }
}

impl MeshConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let defaults = MeshConfig::default();

        Ok(MeshConfig {
            signaling: SignalingConfig {
                channel_name: env::var("MESH_CHANNEL_NAME")
                    .unwrap_or(defaults.signaling.channel_name),
                peer_sweep_interval_secs: env::var("MESH_PEER_SWEEP_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()?,
                negotiation_timeout_secs: env::var("MESH_NEGOTIATION_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()?,
                peer_idle_timeout_secs: env::var("MESH_PEER_IDLE_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "600".to_string())
                    .parse()?,
                max_pending_candidates: env::var("MESH_MAX_PENDING_CANDIDATES")
                    .unwrap_or_else(|_| "32".to_string())
                    .parse()?,
                bridge_base_port: env::var("MESH_BRIDGE_PORT")
                    .unwrap_or_else(|_| "47800".to_string())
                    .parse()?,
                bridge_slots: env::var("MESH_BRIDGE_SLOTS")
                    .unwrap_or_else(|_| "8".to_string())
                    .parse()?,
            },
            proximity: ProximityConfig {
                enabled: env::var("MESH_PROXIMITY_ENABLED")
                    .unwrap_or_else(|_| "true".to_string())
                    .parse()?,
                scan_window_secs: env::var("MESH_SCAN_WINDOW_SECS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()?,
                sweep_interval_secs: env::var("MESH_NEARBY_SWEEP_SECS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()?,
                stale_after_secs: env::var("MESH_NEARBY_STALE_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()?,
                rescan_interval_secs: env::var("MESH_RESCAN_INTERVAL_SECS")
                    .unwrap_or_else(|_| "15".to_string())
                    .parse()?,
                reference_rssi: env::var("MESH_REFERENCE_RSSI")
                    .unwrap_or_else(|_| "-59".to_string())
                    .parse()?,
            },
            storage: StorageConfig {
                dir: env::var("MESH_STORAGE_DIR").unwrap_or(defaults.storage.dir),
            },
            user_id: env::var("MESH_USER_ID").ok().filter(|id| !id.trim().is_empty()),
        })
    }
}
