mod logging;

use anyhow::Result;
use mesh::{
    EmergencyMesh, MeshDependencies, SignalingHub, StaticIdentity, TcpLinkFactory,
    TracingStatusSink, UdpSignalBridge,
};
use proximity::{default_radio, RadioPlatform};
use shared::config::MeshConfig;
use shared::FileKeyValueStore;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging(logging::LogFormat::from_env());

    tracing::info!("Starting emergency mesh node");

    let config = MeshConfig::from_env()?;
    tracing::info!(
        channel = %config.signaling.channel_name,
        storage_dir = %config.storage.dir,
        proximity = config.proximity.enabled,
        "Configuration loaded"
    );

    let storage = Arc::new(FileKeyValueStore::new(config.storage.dir.clone()));

    let radio: Option<Arc<dyn RadioPlatform>> = if config.proximity.enabled {
        Some(default_radio())
    } else {
        tracing::info!("Proximity discovery disabled");
        None
    };

    if config.user_id.is_none() {
        tracing::warn!("MESH_USER_ID not set; this node can relay but not originate");
    }

    // Other mesh processes on this device reach the hub through the bridge
    let hub = SignalingHub::new();
    let bridge = UdpSignalBridge::bind(
        &hub,
        &config.signaling.channel_name,
        config.signaling.bridge_base_port,
        config.signaling.bridge_slots,
    )
    .await?;

    let mesh = EmergencyMesh::new(
        config.clone(),
        MeshDependencies {
            storage,
            hub,
            links: Arc::new(TcpLinkFactory::new()),
            radio,
            identity: Arc::new(StaticIdentity::new(config.user_id.clone())),
            status: Arc::new(TracingStatusSink),
        },
    );

    mesh.on_broadcast(|broadcast| {
        tracing::warn!(
            broadcast_id = %broadcast.id,
            kind = %broadcast.kind,
            originator = %broadcast.originator_id,
            latitude = broadcast.location.latitude,
            longitude = broadcast.location.longitude,
            "EMERGENCY: {}",
            broadcast.message
        );
    });

    mesh.start().await?;
    tracing::info!(
        peer_id = %mesh.local_peer_id().unwrap_or_default(),
        stored = mesh.all_broadcasts().await.len(),
        "Mesh node running; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    mesh.shutdown().await;
    bridge.shutdown();
    Ok(())
}
