//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Matchmaking regions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    NA,
    EU,
    ASIA,
    GLOBAL,
}

impl FromStr for Region {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NA" => Ok(Region::NA),
            "EU" => Ok(Region::EU),
            "ASIA" => Ok(Region::ASIA),
            "GLOBAL" => Ok(Region::GLOBAL),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Region::NA => "NA",
            Region::EU => "EU",
            Region::ASIA => "ASIA",
            Region::GLOBAL => "GLOBAL",
        };
        f.write_str(s)
    }
}

/// Mouse target carried by a shooting input. `id` is the client-assigned
/// projectile id echoed back in state updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MouseTarget {
    pub x: f64,
    pub y: f64,
    pub id: String,
}

/// Directional input for one tick. `x` and `y` are -1, 0 or 1; `y < 0` is a
/// jump request. A `mouse` target means the client fired this tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputVector {
    pub x: i8,
    pub y: i8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mouse: Option<MouseTarget>,
}

impl InputVector {
    pub fn idle() -> Self {
        Self {
            x: 0,
            y: 0,
            mouse: None,
        }
    }

    /// Clamp components into {-1, 0, 1}. Behavior for out-of-range values is
    /// unspecified by clients; the server never integrates anything larger.
    pub fn sanitized(mut self) -> Self {
        self.x = self.x.clamp(-1, 1);
        self.y = self.y.clamp(-1, 1);
        self
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMsg {
    /// Ask the matchmaker for a seat; `player_match_id` requests a reconnect
    #[serde(rename_all = "camelCase")]
    JoinQueue {
        region: Region,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        player_match_id: Option<String>,
    },

    /// Player input for one client tick
    #[serde(rename_all = "camelCase")]
    PlayerInput { tick: u64, vector: InputVector },

    /// Shooter-reported projectile hit
    #[serde(rename_all = "camelCase")]
    ProjectileHit {
        enemy_id: String,
        projectile_id: String,
    },

    /// Toggle spectator/combatant state
    ToggleBystander,

    /// Latency probe; payload is opaque and echoed back
    #[serde(rename = "m-ping")]
    MPing {
        #[serde(flatten)]
        payload: serde_json::Map<String, serde_json::Value>,
    },
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMsg {
    /// Seat assigned by the matchmaker
    #[serde(rename_all = "camelCase")]
    MatchFound {
        match_id: String,
        region: Region,
        player_id: String,
    },

    /// Reconnect routed back into the original match
    #[serde(rename_all = "camelCase")]
    RejoinedMatch { match_id: String, region: Region },

    /// Authoritative world state (delta fields unless a full state is due)
    #[serde(rename_all = "camelCase")]
    StateUpdate {
        s_tick: u64,
        s_time: u64,
        players: Vec<PlayerDelta>,
        projectiles: Vec<ProjectileUpdate>,
    },

    /// Scores and positions were reset for a new round
    MatchReset,

    /// Round over; scores sorted by kills descending
    GameOver { scores: Vec<ScoreEntry> },

    /// The stream went live
    ShowIsLive,

    AfkWarning { message: String },

    AfkRemoved { message: String },

    Error { message: String },

    /// Latency probe response
    #[serde(rename = "m-pong", rename_all = "camelCase")]
    MPong {
        server_time: u64,
        #[serde(flatten)]
        echoed: serde_json::Map<String, serde_json::Value>,
    },
}

/// Per-player entry in a state update. The kinematic fields and the last
/// processed input tick are always present; the rest is included only when it
/// changed since the previous broadcast (or on a full-state broadcast).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerDelta {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub tick: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hp: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_dead: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kills: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deaths: Option<u32>,
}

/// Ephemeral projectile event published in the broadcast after the input that
/// created it. `dud` tells clients to despawn the projectile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectileUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vx: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dud: Option<bool>,
}

/// Final standing entry for `gameOver`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreEntry {
    pub player_id: String,
    pub kills: u32,
    pub deaths: u32,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_events_use_wire_names() {
        let msg: ClientMsg = serde_json::from_str(
            r#"{"type":"playerInput","tick":7,"vector":{"x":1,"y":-1,"mouse":{"x":50.0,"y":60.0,"id":"p1"}}}"#,
        )
        .unwrap();
        match msg {
            ClientMsg::PlayerInput { tick, vector } => {
                assert_eq!(tick, 7);
                assert_eq!(vector.x, 1);
                assert_eq!(vector.mouse.unwrap().id, "p1");
            }
            other => panic!("unexpected message: {:?}", other),
        }

        let ping: ClientMsg =
            serde_json::from_str(r#"{"type":"m-ping","t":123,"nonce":"abc"}"#).unwrap();
        match ping {
            ClientMsg::MPing { payload } => assert_eq!(payload.len(), 2),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn state_update_uses_short_field_names() {
        let msg = ServerMsg::StateUpdate {
            s_tick: 42,
            s_time: 1000,
            players: vec![],
            projectiles: vec![],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"stateUpdate""#));
        assert!(json.contains(r#""sTick":42"#));
        assert!(json.contains(r#""sTime":1000"#));
    }

    #[test]
    fn delta_omits_unchanged_fields() {
        let delta = PlayerDelta {
            id: "p1".into(),
            x: 1.0,
            y: 2.0,
            vx: 0.0,
            vy: 0.0,
            tick: 3,
            hp: None,
            by: None,
            name: None,
            is_dead: None,
            kills: Some(2),
            deaths: None,
        };
        let json = serde_json::to_string(&delta).unwrap();
        assert!(json.contains(r#""kills":2"#));
        assert!(!json.contains("hp"));
        assert!(!json.contains("isDead"));
    }

    #[test]
    fn input_vector_sanitizes_out_of_range_components() {
        let v = InputVector {
            x: 5,
            y: -3,
            mouse: None,
        }
        .sanitized();
        assert_eq!((v.x, v.y), (1, -1));
    }

    #[test]
    fn region_parses_case_insensitively() {
        assert_eq!("eu".parse::<Region>(), Ok(Region::EU));
        assert_eq!("ASIA".parse::<Region>(), Ok(Region::ASIA));
        assert!("MOON".parse::<Region>().is_err());
    }
}
