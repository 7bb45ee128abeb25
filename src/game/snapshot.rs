//! State-update building and serialization

use std::sync::Arc;

use crate::util::time::unix_millis;
use crate::ws::protocol::{PlayerDelta, ProjectileUpdate, ServerMsg};

/// A serialized state update ready for room fan-out.
pub struct BroadcastFrame {
    pub frame: Arc<str>,
    pub bytes: usize,
}

/// Build and serialize one `stateUpdate`. Serialization happens once; every
/// session receives the same shared buffer.
pub fn build_state_update(
    server_tick: u64,
    players: Vec<PlayerDelta>,
    projectiles: Vec<ProjectileUpdate>,
) -> Result<BroadcastFrame, serde_json::Error> {
    let msg = ServerMsg::StateUpdate {
        s_tick: server_tick,
        s_time: unix_millis(),
        players,
        projectiles,
    };
    let json = serde_json::to_string(&msg)?;
    let bytes = json.len();
    Ok(BroadcastFrame {
        frame: Arc::from(json),
        bytes,
    })
}

/// Running byte accounting for broadcast traffic
#[derive(Debug, Default)]
pub struct SnapshotStats {
    pub total_broadcasts: u64,
    pub total_bytes: u64,
}

impl SnapshotStats {
    pub fn record(&mut self, bytes: usize) {
        self.total_broadcasts += 1;
        self.total_bytes += bytes as u64;
    }
}
