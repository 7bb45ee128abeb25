//! Game simulation modules

pub mod r#match;
pub mod platform;
pub mod player;
pub mod snapshot;
pub mod timers;
pub mod vector;

pub use platform::Platform;
pub use player::Player;
pub use r#match::{GameMatch, MatchError};

use crate::ws::protocol::InputVector;
use vector::Bounds;

/// Arena dimensions shared by every match
pub const ARENA_WIDTH: f64 = 1920.0;
pub const ARENA_HEIGHT: f64 = 1080.0;

/// The playable area. `top` is 0 and `bottom` is the floor; y grows downward.
pub fn game_bounds() -> Bounds {
    Bounds {
        left: 0.0,
        right: ARENA_WIDTH,
        top: 0.0,
        bottom: ARENA_HEIGHT,
        width: ARENA_WIDTH,
        height: ARENA_HEIGHT,
    }
}

/// One `playerInput` payload queued for integration
#[derive(Debug, Clone, PartialEq)]
pub struct InputPayload {
    pub tick: u64,
    pub vector: InputVector,
}

/// The input most recently integrated for a player, real or predicted
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedInput {
    pub tick: u64,
    pub vector: InputVector,
}

impl Default for ProcessedInput {
    fn default() -> Self {
        Self {
            tick: 0,
            vector: InputVector::idle(),
        }
    }
}

/// How a physics sub-step was sourced, for trace logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepTag {
    /// Synthesized while the client's inputs were in flight
    Predicted,
    /// Applied directly from a client payload
    Fresh,
    /// Applied after clearing a diverged prediction stack
    Diverged,
}

/// Callbacks a match uses to keep the matchmaker's reconnect index current.
/// The match never holds a pointer back into the matchmaker itself.
pub trait MatchmakerHooks: Send + Sync {
    /// A player disconnected and entered the grace period.
    fn on_disconnect(&self, player_match_id: &str, match_id: &str);
    /// A player's reconnect window closed (rejoined or grace expired).
    fn on_reconnect_cleared(&self, player_match_id: &str);
}

/// No-op hooks for matches driven without a matchmaker.
#[cfg(test)]
pub struct NullHooks;

#[cfg(test)]
impl MatchmakerHooks for NullHooks {
    fn on_disconnect(&self, _player_match_id: &str, _match_id: &str) {}
    fn on_reconnect_cleared(&self, _player_match_id: &str) {}
}
