//! Player entity: physics state, input queue, input-debt stack, score

use std::collections::VecDeque;

use tracing::trace;

use crate::util::rate_limit::PlayerRateLimiter;
use crate::ws::protocol::{InputVector, MouseTarget, PlayerDelta};
use crate::ws::SessionHandle;

use super::platform::Platform;
use super::vector::Bounds;
use super::{game_bounds, InputPayload, ProcessedInput, StepTag};

/// Movement constants (units/second)
pub const SPEED: f64 = 750.0;
pub const JUMP_STRENGTH: f64 = 750.0;
pub const GRAVITY: f64 = 1500.0;
pub const MAX_FALL_SPEED: f64 = 1500.0;

/// Hitbox: 50 wide, 50 tall, pivot at bottom-center
pub const PLAYER_HALF_WIDTH: f64 = 25.0;
pub const PLAYER_HEIGHT: f64 = 50.0;

pub const MAX_HP: i32 = 100;
pub const STARTING_X: f64 = 100.0;
pub const STARTING_Y: f64 = 100.0;

/// Delta-eligible fields as last sent to clients
#[derive(Debug, Clone, PartialEq)]
struct BroadcastBaseline {
    hp: i32,
    is_bystander: bool,
    name: String,
    is_dead: bool,
    kills: u32,
    deaths: u32,
}

/// One player's authoritative state inside a match
pub struct Player {
    // Identity
    pub player_match_id: String,
    pub name: String,

    // Physics
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub is_on_surface: bool,
    pub can_double_jump: bool,
    pub is_jumping: bool,

    // Gameplay
    pub hp: i32,
    pub is_bystander: bool,
    pub is_dead: bool,
    pub kills: u32,
    pub deaths: u32,

    // Networking
    pub input_queue: VecDeque<InputPayload>,
    pub last_processed_input: ProcessedInput,
    input_debt: Vec<InputVector>,
    pub last_input_timestamp: u64,
    pub is_disconnected: bool,
    pub session: Option<SessionHandle>,
    pub rate_limiter: PlayerRateLimiter,
    last_broadcast: Option<BroadcastBaseline>,

    /// Set by `update` when an applied input fired; drained by the match.
    pending_shot: Option<MouseTarget>,
}

impl Player {
    pub fn new(player_match_id: String, name: String, session: SessionHandle, now: u64) -> Self {
        Self {
            player_match_id,
            name,
            x: STARTING_X,
            y: STARTING_Y,
            vx: 0.0,
            vy: 0.0,
            is_on_surface: false,
            can_double_jump: true,
            is_jumping: false,
            hp: MAX_HP,
            is_bystander: false,
            is_dead: false,
            kills: 0,
            deaths: 0,
            input_queue: VecDeque::new(),
            last_processed_input: ProcessedInput::default(),
            input_debt: Vec::new(),
            last_input_timestamp: now,
            is_disconnected: false,
            session: Some(session),
            rate_limiter: PlayerRateLimiter::new(),
            last_broadcast: None,
            pending_shot: None,
        }
    }

    /// Append a payload to the input queue. Rate limiting happens in the
    /// match before this is called; nothing is discarded here.
    pub fn queue_input(&mut self, payload: InputPayload, now: u64) {
        self.input_queue.push_back(payload);
        self.last_input_timestamp = now;
    }

    /// One physics sub-step of `dt` seconds driven by `vector`.
    pub fn update(
        &mut self,
        vector: &InputVector,
        dt: f64,
        tick: u64,
        tag: StepTag,
        platforms: &[Platform],
    ) {
        // Horizontal movement is velocity-set, not accelerated
        if vector.x != 0 {
            self.vx = vector.x as f64 * SPEED;
        } else {
            self.vx = 0.0;
        }

        // Jump request; a second mid-air jump consumes the double jump
        if vector.y < 0 {
            if self.is_on_surface {
                self.vy = vector.y as f64 * JUMP_STRENGTH;
                self.can_double_jump = true;
                self.is_on_surface = false;
                self.is_jumping = true;
            } else if self.can_double_jump {
                self.vy = vector.y as f64 * JUMP_STRENGTH;
                self.can_double_jump = false;
            }
        }

        // Gravity, capped at terminal velocity
        self.vy = (self.vy + GRAVITY * dt).min(MAX_FALL_SPEED);

        self.x += self.vx * dt;
        self.y += self.vy * dt;

        let bounds = game_bounds();
        self.x = self
            .x
            .clamp(bounds.left + PLAYER_HALF_WIDTH, bounds.right - PLAYER_HALF_WIDTH);
        self.y = self.y.clamp(bounds.top, bounds.bottom);

        // Ground check: the arena floor restores all jump state
        if self.y == bounds.bottom {
            self.is_on_surface = true;
            self.vy = 0.0;
            self.is_jumping = false;
            self.can_double_jump = true;
        }

        self.resolve_platform_collisions(platforms);

        if vector.mouse.is_some() && !self.is_bystander {
            self.pending_shot = vector.mouse.clone();
        }

        trace!(
            player = %self.player_match_id,
            tick,
            ?tag,
            x = self.x,
            y = self.y,
            "physics step"
        );
    }

    /// Land on the first platform (insertion order) the player is falling
    /// through or resting on. Landing snaps to the surface and restores the
    /// double jump, but does not count as the arena floor.
    fn resolve_platform_collisions(&mut self, platforms: &[Platform]) {
        if self.vy <= 0.0 {
            return;
        }
        let p = self.bounds();
        for platform in platforms {
            let f = platform.bounds();
            let horizontal = p.right > f.left && p.left < f.right;
            let landed = p.bottom == f.top || (p.bottom > f.top && p.bottom < f.bottom);
            if horizontal && landed {
                self.y = f.top;
                self.vy = 0.0;
                self.can_double_jump = true;
                self.is_jumping = false;
                break;
            }
        }
    }

    /// Hitbox bounds; pivot is bottom-center.
    pub fn bounds(&self) -> Bounds {
        Bounds {
            left: self.x - PLAYER_HALF_WIDTH,
            right: self.x + PLAYER_HALF_WIDTH,
            top: self.y - PLAYER_HEIGHT,
            bottom: self.y,
            width: PLAYER_HALF_WIDTH * 2.0,
            height: PLAYER_HEIGHT,
        }
    }

    /// Idle on a surface counts as AFK; airborne players are still moving.
    pub fn is_afk(&self, vector: &InputVector) -> bool {
        vector.x == 0 && vector.y == 0 && self.is_on_surface
    }

    // Input-debt stack: predicted vectors awaiting acknowledgement (LIFO)

    pub fn add_input_debt(&mut self, vector: InputVector) {
        self.input_debt.push(vector);
    }

    pub fn peek_debt(&self) -> Option<&InputVector> {
        self.input_debt.last()
    }

    pub fn pop_debt(&mut self) -> Option<InputVector> {
        self.input_debt.pop()
    }

    pub fn clear_debt(&mut self) {
        self.input_debt.clear();
    }

    pub fn debt_len(&self) -> usize {
        self.input_debt.len()
    }

    pub fn take_pending_shot(&mut self) -> Option<MouseTarget> {
        self.pending_shot.take()
    }

    pub fn damage(&mut self, amount: i32) {
        self.hp = (self.hp - amount).max(0);
    }

    pub fn heal(&mut self, amount: i32) {
        self.hp = (self.hp + amount).min(MAX_HP);
    }

    /// Death clears the networking queues: a dead player integrates nothing.
    pub fn add_death(&mut self) {
        self.is_dead = true;
        self.deaths += 1;
        self.vx = 0.0;
        self.vy = 0.0;
        self.input_queue.clear();
        self.input_debt.clear();
        self.pending_shot = None;
    }

    pub fn add_kill(&mut self) {
        self.kills += 1;
    }

    pub fn respawn(&mut self, x: f64, y: f64) {
        self.x = x;
        self.y = y;
        self.vx = 0.0;
        self.vy = 0.0;
        self.hp = MAX_HP;
        self.is_dead = false;
        self.is_on_surface = false;
        self.can_double_jump = true;
        self.is_jumping = false;
    }

    /// Revive in place with full HP (round end with a pending respawn).
    pub fn revive_in_place(&mut self) {
        self.heal(MAX_HP);
        self.is_dead = false;
    }

    fn baseline(&self) -> BroadcastBaseline {
        BroadcastBaseline {
            hp: self.hp,
            is_bystander: self.is_bystander,
            name: self.name.clone(),
            is_dead: self.is_dead,
            kills: self.kills,
            deaths: self.deaths,
        }
    }

    /// Every field, for first join / rejoin / match reset broadcasts.
    pub fn full_broadcast_state(&mut self) -> PlayerDelta {
        let state = PlayerDelta {
            id: self.player_match_id.clone(),
            x: self.x,
            y: self.y,
            vx: self.vx,
            vy: self.vy,
            tick: self.last_processed_input.tick,
            hp: Some(self.hp),
            by: Some(self.is_bystander),
            name: Some(self.name.clone()),
            is_dead: Some(self.is_dead),
            kills: Some(self.kills),
            deaths: Some(self.deaths),
        };
        self.last_broadcast = Some(self.baseline());
        state
    }

    /// Kinematics plus whichever fields changed since the last broadcast.
    pub fn latest_state_delta(&mut self) -> PlayerDelta {
        let current = self.baseline();
        let mut delta = PlayerDelta {
            id: self.player_match_id.clone(),
            x: self.x,
            y: self.y,
            vx: self.vx,
            vy: self.vy,
            tick: self.last_processed_input.tick,
            hp: None,
            by: None,
            name: None,
            is_dead: None,
            kills: None,
            deaths: None,
        };

        match &self.last_broadcast {
            None => {
                delta.hp = Some(current.hp);
                delta.by = Some(current.is_bystander);
                delta.name = Some(current.name.clone());
                delta.is_dead = Some(current.is_dead);
                delta.kills = Some(current.kills);
                delta.deaths = Some(current.deaths);
            }
            Some(prev) => {
                if prev.hp != current.hp {
                    delta.hp = Some(current.hp);
                }
                if prev.is_bystander != current.is_bystander {
                    delta.by = Some(current.is_bystander);
                }
                if prev.name != current.name {
                    delta.name = Some(current.name.clone());
                }
                if prev.is_dead != current.is_dead {
                    delta.is_dead = Some(current.is_dead);
                }
                if prev.kills != current.kills {
                    delta.kills = Some(current.kills);
                }
                if prev.deaths != current.deaths {
                    delta.deaths = Some(current.deaths);
                }
            }
        }

        self.last_broadcast = Some(current);
        delta
    }
}
