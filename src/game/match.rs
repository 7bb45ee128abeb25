//! Match state and authoritative fixed-step simulation

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::util::time::{FIXED_STEP_MS, FIXED_STEP_S, MAX_FRAME_MS};
use crate::ws::protocol::{
    MouseTarget, ProjectileUpdate, Region, ScoreEntry, ServerMsg,
};
use crate::ws::SessionHandle;

use super::platform::{default_platforms, Platform};
use super::player::{Player, MAX_HP, PLAYER_HEIGHT, STARTING_X, STARTING_Y};
use super::snapshot::{build_state_update, SnapshotStats};
use super::timers::{TimerId, TimerKind, TimerQueue};
use super::vector::{launch_velocity, PROJECTILE_SPEED};
use super::{InputPayload, MatchmakerHooks, ProcessedInput, StepTag};

/// Kills needed to end a round
pub const MAX_KILL_AMOUNT: u32 = 4;
/// Damage per confirmed projectile hit
pub const DAMAGE_PER_HIT: i32 = 10;

const RESPAWN_DELAY_MS: u64 = 3_000;
const MATCH_RESET_DELAY_MS: u64 = 10_000;
const AFK_WARNING_MS: u64 = 60_000;
const AFK_REMOVAL_MS: u64 = 10_000;
const GRACE_PERIOD_MS: u64 = 20_000;
const CLEANUP_INTERVAL_MS: u64 = 3_000;

/// Round state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPhase {
    /// Round in progress
    Active,
    /// A round just ended; waiting for the reset timer
    AwaitingReset,
}

/// Match-level errors surfaced to the gateway
#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("Match is full")]
    MatchFull,

    #[error("Unknown player: {0}")]
    PlayerNotFound(String),
}

/// One match: world state plus everything the driver ticks at 30 Hz.
/// All operations are synchronous and run under the owning mutex.
pub struct GameMatch {
    id: String,
    region: Region,
    players: HashMap<String, Player>,
    platforms: Vec<Platform>,

    server_tick: u64,
    accumulator: f64,
    last_update_time: u64,
    phase: MatchPhase,
    should_remove: bool,

    /// Projectile events pending for the next broadcast, keyed by
    /// the client-supplied projectile id
    projectile_updates: HashMap<String, ProjectileUpdate>,
    /// Disconnect time per player, for the grace-period sweep
    disconnected_cleanup: HashMap<String, u64>,
    last_cleanup_sweep: u64,

    timers: TimerQueue,
    afk_timers: HashMap<String, TimerId>,
    respawn_timers: HashMap<String, TimerId>,
    reset_timer: Option<TimerId>,

    pending_full_broadcast: bool,
    snapshot_stats: SnapshotStats,

    hooks: Arc<dyn MatchmakerHooks>,
    metrics: Arc<Metrics>,
    max_players: usize,
}

impl GameMatch {
    pub fn new(
        id: String,
        region: Region,
        max_players: usize,
        hooks: Arc<dyn MatchmakerHooks>,
        metrics: Arc<Metrics>,
        now: u64,
    ) -> Self {
        Self {
            id,
            region,
            players: HashMap::new(),
            platforms: default_platforms(),
            server_tick: 0,
            accumulator: 0.0,
            last_update_time: now,
            phase: MatchPhase::Active,
            should_remove: false,
            projectile_updates: HashMap::new(),
            disconnected_cleanup: HashMap::new(),
            last_cleanup_sweep: now,
            timers: TimerQueue::new(),
            afk_timers: HashMap::new(),
            respawn_timers: HashMap::new(),
            reset_timer: None,
            pending_full_broadcast: false,
            snapshot_stats: SnapshotStats::default(),
            hooks,
            metrics,
            max_players,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn server_tick(&self) -> u64 {
        self.server_tick
    }

    pub fn phase(&self) -> MatchPhase {
        self.phase
    }

    pub fn should_remove(&self) -> bool {
        self.should_remove
    }

    pub fn player(&self, player_match_id: &str) -> Option<&Player> {
        self.players.get(player_match_id)
    }

    #[cfg(test)]
    pub fn player_mut(&mut self, player_match_id: &str) -> Option<&mut Player> {
        self.players.get_mut(player_match_id)
    }

    /// Stable id surviving reconnects: session id minus its volatile tail,
    /// suffixed with the match id's tail.
    fn derive_player_match_id(&self, session_id: &str) -> String {
        let head = session_id.len().saturating_sub(4);
        let tail = self.id.len().saturating_sub(3);
        format!("{}{}", &session_id[..head], &self.id[tail..])
    }

    /// Seat a new player. Re-adding an existing id (including a session-id
    /// collision) returns the existing id without touching state.
    pub fn add_player(
        &mut self,
        session: SessionHandle,
        name: &str,
        now: u64,
    ) -> Result<String, MatchError> {
        let player_match_id = self.derive_player_match_id(session.session_id());
        if self.players.contains_key(&player_match_id) {
            debug!(match_id = %self.id, player_id = %player_match_id, "player already present");
            return Ok(player_match_id);
        }
        if self.players.len() >= self.max_players {
            return Err(MatchError::MatchFull);
        }

        let player = Player::new(player_match_id.clone(), name.to_string(), session, now);
        self.players.insert(player_match_id.clone(), player);
        self.pending_full_broadcast = true;
        self.metrics.record_connect(&player_match_id);

        info!(
            match_id = %self.id,
            player_id = %player_match_id,
            player_count = self.players.len(),
            "player joined match"
        );

        Ok(player_match_id)
    }

    /// Re-attach a disconnected player's new session within the grace period.
    pub fn rejoin_player(
        &mut self,
        session: SessionHandle,
        player_match_id: &str,
        now: u64,
    ) -> Result<(), MatchError> {
        let player = self
            .players
            .get_mut(player_match_id)
            .ok_or_else(|| MatchError::PlayerNotFound(player_match_id.to_string()))?;

        player.is_disconnected = false;
        player.session = Some(session);
        player.last_input_timestamp = now;
        self.disconnected_cleanup.remove(player_match_id);
        self.pending_full_broadcast = true;
        self.metrics.record_reconnect();

        info!(
            match_id = %self.id,
            player_id = %player_match_id,
            "player rejoined match"
        );

        Ok(())
    }

    /// Accept a `playerInput` payload. Unknown players and over-quota senders
    /// are dropped with a warning; everything else enters the FIFO untouched.
    pub fn queue_input(&mut self, player_match_id: &str, payload: InputPayload, now: u64) {
        let Some(player) = self.players.get_mut(player_match_id) else {
            warn!(match_id = %self.id, player_id = %player_match_id, "input for unknown player");
            return;
        };
        if player.is_dead {
            return;
        }
        if !player.rate_limiter.check_input() {
            warn!(match_id = %self.id, player_id = %player_match_id, "input rate limit exceeded");
            return;
        }

        player.queue_input(payload, now);

        // Any input disarms a pending AFK removal
        if let Some(timer_id) = self.afk_timers.remove(player_match_id) {
            self.timers.cancel(timer_id);
        }
    }

    /// Shooter-reported hit. Validates both parties and applies flat damage;
    /// the projectile is marked as a dud so clients despawn it.
    pub fn handle_projectile_hit(
        &mut self,
        shooter_id: &str,
        enemy_id: &str,
        projectile_id: &str,
        now: u64,
    ) {
        if !self.players.contains_key(shooter_id) {
            warn!(match_id = %self.id, player_id = %shooter_id, "hit from unknown shooter");
            return;
        }
        let Some(enemy) = self.players.get_mut(enemy_id) else {
            warn!(match_id = %self.id, player_id = %enemy_id, "hit on unknown target");
            return;
        };
        if enemy.is_bystander || enemy.is_dead {
            return;
        }

        enemy.damage(DAMAGE_PER_HIT);
        let killed = enemy.hp <= 0;

        self.projectile_updates
            .entry(projectile_id.to_string())
            .and_modify(|update| update.dud = Some(true))
            .or_insert_with(|| ProjectileUpdate {
                id: projectile_id.to_string(),
                owner_id: None,
                x: None,
                y: None,
                vx: None,
                vy: None,
                dud: Some(true),
            });

        if killed {
            self.handle_kill(shooter_id, enemy_id, now);
        }
    }

    fn handle_kill(&mut self, killer_id: &str, victim_id: &str, now: u64) {
        if let Some(victim) = self.players.get_mut(victim_id) {
            victim.add_death();
        }
        if let Some(killer) = self.players.get_mut(killer_id) {
            killer.add_kill();
        }

        info!(
            match_id = %self.id,
            killer = %killer_id,
            victim = %victim_id,
            "player killed"
        );

        let timer_id = self.timers.schedule(
            now + RESPAWN_DELAY_MS,
            TimerKind::Respawn {
                player_match_id: victim_id.to_string(),
            },
        );
        self.respawn_timers.insert(victim_id.to_string(), timer_id);

        self.check_win_condition(now);
    }

    /// End the round once any player reaches the kill target.
    fn check_win_condition(&mut self, now: u64) {
        if self.phase != MatchPhase::Active {
            return;
        }

        let mut scores: Vec<ScoreEntry> = self
            .players
            .values()
            .map(|p| ScoreEntry {
                player_id: p.player_match_id.clone(),
                kills: p.kills,
                deaths: p.deaths,
                name: p.name.clone(),
            })
            .collect();
        scores.sort_by(|a, b| b.kills.cmp(&a.kills));

        let Some(top) = scores.first() else { return };
        if top.kills < MAX_KILL_AMOUNT {
            return;
        }

        info!(match_id = %self.id, winner = %top.player_id, "round over");
        self.phase = MatchPhase::AwaitingReset;
        self.metrics.record_round();
        self.emit_room(ServerMsg::GameOver { scores });

        // Pending respawns are resolved on the spot so nobody sits dead
        // through the intermission
        for (player_match_id, timer_id) in self.respawn_timers.drain() {
            self.timers.cancel(timer_id);
            if let Some(player) = self.players.get_mut(&player_match_id) {
                player.revive_in_place();
            }
        }

        if self.reset_timer.is_none() {
            self.reset_timer = Some(
                self.timers
                    .schedule(now + MATCH_RESET_DELAY_MS, TimerKind::MatchReset),
            );
        }
    }

    fn reset_match(&mut self) {
        self.projectile_updates.clear();
        for player in self.players.values_mut() {
            player.hp = MAX_HP;
            player.kills = 0;
            player.deaths = 0;
            player.is_dead = false;
        }
        self.pending_full_broadcast = true;
        self.phase = MatchPhase::Active;
        self.emit_room(ServerMsg::MatchReset);

        info!(match_id = %self.id, "match reset");
    }

    /// Flip spectator state. Entering spectator mode also clears combat
    /// residue so the player re-enters at full strength later.
    pub fn toggle_bystander(&mut self, player_match_id: &str) {
        let Some(player) = self.players.get_mut(player_match_id) else {
            warn!(match_id = %self.id, player_id = %player_match_id, "toggle for unknown player");
            return;
        };
        player.is_bystander = !player.is_bystander;
        if player.is_bystander {
            player.take_pending_shot();
            player.heal(MAX_HP);
        }
        debug!(
            match_id = %self.id,
            player_id = %player_match_id,
            bystander = player.is_bystander,
            "bystander toggled"
        );
    }

    /// Session dropped. The player stays in the world for the grace period;
    /// only the matchmaker index and the session handle change.
    pub fn handle_disconnect(&mut self, player_match_id: &str, now: u64) {
        let Some(player) = self.players.get_mut(player_match_id) else {
            return;
        };
        if player.is_disconnected {
            return;
        }

        player.is_disconnected = true;
        player.session = None;
        self.disconnected_cleanup
            .insert(player_match_id.to_string(), now);
        self.hooks.on_disconnect(player_match_id, &self.id);
        if let Some(timer_id) = self.afk_timers.remove(player_match_id) {
            self.timers.cancel(timer_id);
        }
        self.metrics.record_disconnect();

        info!(
            match_id = %self.id,
            player_id = %player_match_id,
            "player disconnected, grace period started"
        );
    }

    /// Advance the simulation. Driver-invoked at the broadcast rate; runs as
    /// many fixed steps as the accumulator affords.
    pub fn update(&mut self, now: u64) {
        self.fire_due_timers(now);

        let frame = now
            .saturating_sub(self.last_update_time)
            .min(MAX_FRAME_MS) as f64;
        self.last_update_time = now;
        self.accumulator += frame;

        while self.accumulator >= FIXED_STEP_MS {
            self.integrate_player_inputs(FIXED_STEP_S);
            self.process_afk_players(now);
            self.accumulator -= FIXED_STEP_MS;
            self.server_tick += 1;
        }

        self.sweep_grace_period(now);
    }

    fn fire_due_timers(&mut self, now: u64) {
        for (_, kind) in self.timers.pop_due(now) {
            match kind {
                TimerKind::AfkRemoval { player_match_id } => {
                    self.afk_timers.remove(&player_match_id);
                    if let Some(player) = self.players.get(&player_match_id) {
                        if let Some(session) = &player.session {
                            session.emit(ServerMsg::AfkRemoved {
                                message: "Removed for inactivity".to_string(),
                            });
                            session.disconnect();
                        }
                    }
                    info!(match_id = %self.id, player_id = %player_match_id, "afk player removed");
                }
                TimerKind::Respawn { player_match_id } => {
                    self.respawn_timers.remove(&player_match_id);
                    if let Some(player) = self.players.get_mut(&player_match_id) {
                        if player.is_dead {
                            player.respawn(STARTING_X, STARTING_Y);
                        }
                    }
                }
                TimerKind::MatchReset => {
                    self.reset_timer = None;
                    self.reset_match();
                }
            }
        }
    }

    /// The reconciliation core: at most one input per player per fixed step.
    /// A missing payload is predicted from the last processed vector (jump
    /// and fire stripped) and recorded as input debt; a real payload matching
    /// the debt top is acknowledged by popping without re-applying; anything
    /// else clears the debt and applies the client's truth.
    fn integrate_player_inputs(&mut self, dt: f64) {
        let platforms = &self.platforms;
        let mut shots: Vec<(String, f64, f64, MouseTarget)> = Vec::new();

        for player in self.players.values_mut() {
            if player.is_dead {
                continue;
            }

            match player.input_queue.pop_front() {
                None => {
                    let mut predicted = player.last_processed_input.vector.clone();
                    predicted.y = 0;
                    predicted.mouse = None;

                    if !player.is_afk(&predicted) {
                        player.add_input_debt(predicted.clone());
                    }

                    let new_tick = player.last_processed_input.tick + 1;
                    player.update(&predicted, dt, new_tick, StepTag::Predicted, platforms);
                    player.last_processed_input = ProcessedInput {
                        tick: new_tick,
                        vector: predicted,
                    };
                }
                Some(payload) => {
                    let paid_by_prediction = payload.vector.mouse.is_none()
                        && player
                            .peek_debt()
                            .is_some_and(|top| {
                                top.x == payload.vector.x && top.y == payload.vector.y
                            });

                    if paid_by_prediction {
                        // Already applied as a predicted step; acknowledge only
                        player.pop_debt();
                        continue;
                    }

                    let tag = if player.debt_len() > 0 {
                        debug!(
                            player = %player.player_match_id,
                            debt = player.debt_len(),
                            "prediction diverged, debt cleared"
                        );
                        player.clear_debt();
                        StepTag::Diverged
                    } else {
                        StepTag::Fresh
                    };

                    player.update(&payload.vector, dt, payload.tick, tag, platforms);
                    player.last_processed_input = ProcessedInput {
                        tick: payload.tick,
                        vector: payload.vector,
                    };
                }
            }

            if let Some(shot) = player.take_pending_shot() {
                shots.push((player.player_match_id.clone(), player.x, player.y, shot));
            }
        }

        for (player_match_id, x, y, shot) in shots {
            self.spawn_projectile(&player_match_id, x, y, shot);
        }
    }

    /// Publish a projectile's initial state. The server never simulates its
    /// flight; clients report hits back.
    fn spawn_projectile(&mut self, owner_id: &str, x: f64, y: f64, shot: MouseTarget) {
        let muzzle_y = y - PLAYER_HEIGHT;
        let velocity = launch_velocity(x, muzzle_y, shot.x, shot.y, PROJECTILE_SPEED);
        self.projectile_updates.insert(
            shot.id.clone(),
            ProjectileUpdate {
                id: shot.id,
                owner_id: Some(owner_id.to_string()),
                x: Some(x),
                y: Some(muzzle_y),
                vx: Some(velocity.x),
                vy: Some(velocity.y),
                dud: None,
            },
        );
    }

    fn process_afk_players(&mut self, now: u64) {
        let mut to_warn: Vec<String> = Vec::new();
        for player in self.players.values() {
            if player.is_disconnected {
                continue;
            }
            if now.saturating_sub(player.last_input_timestamp) > AFK_WARNING_MS
                && !self.afk_timers.contains_key(&player.player_match_id)
            {
                to_warn.push(player.player_match_id.clone());
            }
        }

        for player_match_id in to_warn {
            if let Some(player) = self.players.get(&player_match_id) {
                if let Some(session) = &player.session {
                    session.emit(ServerMsg::AfkWarning {
                        message: "You will be removed for inactivity".to_string(),
                    });
                }
            }
            let timer_id = self.timers.schedule(
                now + AFK_REMOVAL_MS,
                TimerKind::AfkRemoval {
                    player_match_id: player_match_id.clone(),
                },
            );
            self.afk_timers.insert(player_match_id, timer_id);
        }
    }

    /// Every few seconds, drop players whose grace period expired. An empty
    /// world marks the match for the driver to reap.
    fn sweep_grace_period(&mut self, now: u64) {
        if now.saturating_sub(self.last_cleanup_sweep) < CLEANUP_INTERVAL_MS {
            return;
        }
        self.last_cleanup_sweep = now;

        let expired: Vec<String> = self
            .disconnected_cleanup
            .iter()
            .filter(|(_, &t)| now.saturating_sub(t) > GRACE_PERIOD_MS)
            .map(|(id, _)| id.clone())
            .collect();

        for player_match_id in expired {
            self.disconnected_cleanup.remove(&player_match_id);
            if let Some(timer_id) = self.respawn_timers.remove(&player_match_id) {
                self.timers.cancel(timer_id);
            }
            if let Some(timer_id) = self.afk_timers.remove(&player_match_id) {
                self.timers.cancel(timer_id);
            }
            self.players.remove(&player_match_id);
            self.hooks.on_reconnect_cleared(&player_match_id);
            info!(
                match_id = %self.id,
                player_id = %player_match_id,
                "grace period expired, player removed"
            );
        }

        if self.players.is_empty() && !self.should_remove {
            self.should_remove = true;
            info!(match_id = %self.id, "match empty, marked for removal");
        }
    }

    /// Serialize and fan out the world state. Returns the frame size in
    /// bytes, or zero when nothing was sent.
    pub fn broadcast_game_state(&mut self) -> usize {
        if self.players.is_empty() {
            return 0;
        }

        let full = std::mem::take(&mut self.pending_full_broadcast);
        let player_states = self
            .players
            .values_mut()
            .map(|p| {
                if full {
                    p.full_broadcast_state()
                } else {
                    p.latest_state_delta()
                }
            })
            .collect();
        let projectiles = self
            .projectile_updates
            .drain()
            .map(|(_, update)| update)
            .collect();

        match build_state_update(self.server_tick, player_states, projectiles) {
            Ok(out) => {
                for player in self.players.values() {
                    if let Some(session) = &player.session {
                        session.emit_frame(out.frame.clone());
                    }
                }
                self.snapshot_stats.record(out.bytes);
                out.bytes
            }
            Err(e) => {
                warn!(match_id = %self.id, error = %e, "state serialization failed");
                self.metrics.record_error();
                0
            }
        }
    }

    pub fn inform_show_is_live(&self) {
        self.emit_room(ServerMsg::ShowIsLive);
    }

    fn emit_room(&self, msg: ServerMsg) {
        for player in self.players.values() {
            if let Some(session) = &player.session {
                session.emit(msg.clone());
            }
        }
    }

    /// Tear down everything. Safe to call more than once.
    pub fn clean_up_session(&mut self) {
        debug!(
            match_id = %self.id,
            cancelled_timers = self.timers.pending(),
            broadcasts = self.snapshot_stats.total_broadcasts,
            bytes_sent = self.snapshot_stats.total_bytes,
            "cleaning up match"
        );
        self.timers.clear();
        self.afk_timers.clear();
        self.respawn_timers.clear();
        self.reset_timer = None;

        for player in self.players.values() {
            if let Some(session) = &player.session {
                session.disconnect();
            }
        }
        self.players.clear();
        self.projectile_updates.clear();
        self.disconnected_cleanup.clear();
        self.should_remove = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::player::MAX_HP;
    use crate::game::{NullHooks, ARENA_HEIGHT};
    use crate::ws::protocol::InputVector;
    use crate::ws::Outbound;
    use tokio::sync::mpsc::UnboundedReceiver;

    const STEP: u64 = 34;

    fn new_match(now: u64) -> GameMatch {
        GameMatch::new(
            "match-abc123".to_string(),
            Region::NA,
            10,
            Arc::new(NullHooks),
            Arc::new(Metrics::new()),
            now,
        )
    }

    fn join(
        m: &mut GameMatch,
        session_id: &str,
        name: &str,
        now: u64,
    ) -> (String, UnboundedReceiver<Outbound>) {
        let (session, rx) = SessionHandle::new(session_id.to_string());
        let pid = m.add_player(session, name, now).unwrap();
        (pid, rx)
    }

    fn ground(m: &mut GameMatch, pid: &str) {
        let p = m.player_mut(pid).unwrap();
        p.y = ARENA_HEIGHT;
        p.is_on_surface = true;
    }

    fn walk_right() -> InputVector {
        InputVector {
            x: 1,
            y: 0,
            mouse: None,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn frames_of(outbound: &[Outbound]) -> Vec<serde_json::Value> {
        outbound
            .iter()
            .filter_map(|o| match o {
                Outbound::Frame(f) => serde_json::from_str(f).ok(),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn player_match_id_is_stable_and_derived() {
        let mut m = new_match(0);
        let (pid, _rx) = join(&mut m, "sessionid-abcd", "alice", 0);
        // session id minus last 4 chars, plus match id's last 3
        assert_eq!(pid, "sessionid-123");

        // Same session id joins again: idempotent
        let (session, _rx2) = SessionHandle::new("sessionid-abcd".to_string());
        let again = m.add_player(session, "alice", 0).unwrap();
        assert_eq!(again, pid);
        assert_eq!(m.player_count(), 1);
    }

    #[test]
    fn match_rejects_players_beyond_capacity() {
        let mut m = GameMatch::new(
            "match-xyz999".to_string(),
            Region::EU,
            2,
            Arc::new(NullHooks),
            Arc::new(Metrics::new()),
            0,
        );
        join(&mut m, "aaaaaaaa-0001", "a", 0);
        join(&mut m, "bbbbbbbb-0002", "b", 0);
        let (session, _rx) = SessionHandle::new("cccccccc-0003".to_string());
        assert!(matches!(
            m.add_player(session, "c", 0),
            Err(MatchError::MatchFull)
        ));
    }

    #[test]
    fn server_tick_advances_with_accumulator() {
        let mut m = new_match(0);
        join(&mut m, "sessionid-abcd", "alice", 0);
        m.update(34);
        assert_eq!(m.server_tick(), 1);
        m.update(68);
        assert_eq!(m.server_tick(), 2);
        // Frame clamp: a long stall cannot trigger a step avalanche
        m.update(10_000);
        assert_eq!(m.server_tick(), 5);
    }

    #[test]
    fn input_debt_pays_for_predicted_steps() {
        // Run A: four inputs delivered on time
        let mut a = new_match(0);
        let (pid_a, _rx) = join(&mut a, "sessionid-abcd", "alice", 0);
        ground(&mut a, &pid_a);
        let mut now = 0;
        for tick in 1..=4u64 {
            a.queue_input(
                &pid_a,
                InputPayload {
                    tick,
                    vector: walk_right(),
                },
                now,
            );
            now += STEP;
            a.update(now);
        }
        let x_a = a.player(&pid_a).unwrap().x;

        // Run B: first input, a stall predicted twice, then the backlog
        let mut b = new_match(0);
        let (pid_b, _rx) = join(&mut b, "sessionid-abcd", "alice", 0);
        ground(&mut b, &pid_b);
        let mut now = 0;
        b.queue_input(
            &pid_b,
            InputPayload {
                tick: 1,
                vector: walk_right(),
            },
            now,
        );
        for _ in 0..3 {
            now += STEP;
            b.update(now);
        }
        assert_eq!(b.player(&pid_b).unwrap().debt_len(), 2);

        for tick in 2..=4u64 {
            b.queue_input(
                &pid_b,
                InputPayload {
                    tick,
                    vector: walk_right(),
                },
                now,
            );
        }
        for _ in 0..3 {
            now += STEP;
            b.update(now);
        }

        let player_b = b.player(&pid_b).unwrap();
        assert_eq!(player_b.debt_len(), 0);
        assert!((player_b.x - x_a).abs() < 1e-9);
    }

    #[test]
    fn diverging_input_clears_the_debt_stack() {
        let mut m = new_match(0);
        let (pid, _rx) = join(&mut m, "sessionid-abcd", "alice", 0);
        ground(&mut m, &pid);

        let mut now = 0;
        m.queue_input(
            &pid,
            InputPayload {
                tick: 1,
                vector: walk_right(),
            },
            now,
        );
        for _ in 0..3 {
            now += STEP;
            m.update(now);
        }
        assert_eq!(m.player(&pid).unwrap().debt_len(), 2);

        m.queue_input(
            &pid,
            InputPayload {
                tick: 2,
                vector: InputVector {
                    x: -1,
                    y: 0,
                    mouse: None,
                },
            },
            now,
        );
        now += STEP;
        m.update(now);

        let player = m.player(&pid).unwrap();
        assert_eq!(player.debt_len(), 0);
        assert!(player.vx < 0.0);
    }

    #[test]
    fn prediction_never_jumps() {
        let mut m = new_match(0);
        let (pid, _rx) = join(&mut m, "sessionid-abcd", "alice", 0);
        ground(&mut m, &pid);

        let mut now = 0;
        m.queue_input(
            &pid,
            InputPayload {
                tick: 1,
                vector: InputVector {
                    x: 0,
                    y: -1,
                    mouse: None,
                },
            },
            now,
        );
        now += STEP;
        m.update(now);
        assert!(m.player(&pid).unwrap().vy < 0.0);

        // Stall long enough to land again, then keep stalling
        for _ in 0..70 {
            now += STEP;
            m.update(now);
        }
        let player = m.player(&pid).unwrap();
        assert_eq!(player.y, ARENA_HEIGHT);
        assert!(player.is_on_surface);

        for _ in 0..10 {
            now += STEP;
            m.update(now);
            assert_eq!(m.player(&pid).unwrap().y, ARENA_HEIGHT);
        }
    }

    #[test]
    fn afk_prediction_accrues_no_debt() {
        let mut m = new_match(0);
        let (pid, _rx) = join(&mut m, "sessionid-abcd", "alice", 0);
        ground(&mut m, &pid);

        let mut now = 0;
        for _ in 0..5 {
            now += STEP;
            m.update(now);
        }
        assert_eq!(m.player(&pid).unwrap().debt_len(), 0);
    }

    #[test]
    fn rate_limit_drops_excess_inputs() {
        let mut m = new_match(0);
        let (pid, _rx) = join(&mut m, "sessionid-abcd", "alice", 0);
        for tick in 0..150u64 {
            m.queue_input(
                &pid,
                InputPayload {
                    tick,
                    vector: walk_right(),
                },
                0,
            );
        }
        assert_eq!(m.player(&pid).unwrap().input_queue.len(), 100);
    }

    #[test]
    fn shot_publishes_projectile_then_hit_marks_dud() {
        let mut m = new_match(0);
        let (shooter, mut shooter_rx) = join(&mut m, "sessionid-abcd", "alice", 0);
        let (victim, _victim_rx) = join(&mut m, "othersess-wxyz", "bob", 0);
        ground(&mut m, &shooter);

        m.queue_input(
            &shooter,
            InputPayload {
                tick: 1,
                vector: InputVector {
                    x: 0,
                    y: 0,
                    mouse: Some(MouseTarget {
                        x: 500.0,
                        y: 500.0,
                        id: "proj-1".to_string(),
                    }),
                },
            },
            0,
        );
        m.update(STEP);
        drain(&mut shooter_rx);
        m.broadcast_game_state();

        let frames = frames_of(&drain(&mut shooter_rx));
        let projectiles = frames[0]["projectiles"].as_array().unwrap();
        assert_eq!(projectiles.len(), 1);
        assert_eq!(projectiles[0]["id"], "proj-1");
        assert_eq!(projectiles[0]["ownerId"], shooter.as_str());
        assert!(projectiles[0]["vx"].as_f64().is_some());
        assert!(projectiles[0].get("dud").is_none());

        // Hit report: damage lands and the projectile is flagged for despawn
        m.handle_projectile_hit(&shooter, &victim, "proj-1", STEP);
        assert_eq!(m.player(&victim).unwrap().hp, MAX_HP - DAMAGE_PER_HIT);

        m.broadcast_game_state();
        let frames = frames_of(&drain(&mut shooter_rx));
        let projectiles = frames[0]["projectiles"].as_array().unwrap();
        assert_eq!(projectiles[0]["dud"], true);
    }

    #[test]
    fn bystanders_are_immune_and_unarmed() {
        let mut m = new_match(0);
        let (shooter, _rx1) = join(&mut m, "sessionid-abcd", "alice", 0);
        let (target, _rx2) = join(&mut m, "othersess-wxyz", "bob", 0);
        m.toggle_bystander(&target);

        m.handle_projectile_hit(&shooter, &target, "proj-9", 0);
        assert_eq!(m.player(&target).unwrap().hp, MAX_HP);
    }

    #[test]
    fn kill_respawns_after_delay() {
        let mut m = new_match(0);
        let (shooter, _rx1) = join(&mut m, "sessionid-abcd", "alice", 0);
        let (victim, _rx2) = join(&mut m, "othersess-wxyz", "bob", 0);

        for i in 0..10 {
            m.handle_projectile_hit(&shooter, &victim, &format!("p{}", i), 100);
        }
        let v = m.player(&victim).unwrap();
        assert!(v.is_dead);
        assert_eq!(v.deaths, 1);
        assert_eq!(m.player(&shooter).unwrap().kills, 1);

        // Before the timer: still dead. After: revived at the spawn point.
        m.update(2_000);
        assert!(m.player(&victim).unwrap().is_dead);
        m.update(3_200);
        let v = m.player(&victim).unwrap();
        assert!(!v.is_dead);
        assert_eq!(v.hp, MAX_HP);
        assert_eq!((v.x, v.y), (STARTING_X, STARTING_Y));
    }

    #[test]
    fn dead_players_integrate_nothing() {
        let mut m = new_match(0);
        let (shooter, _rx1) = join(&mut m, "sessionid-abcd", "alice", 0);
        let (victim, _rx2) = join(&mut m, "othersess-wxyz", "bob", 0);
        for i in 0..10 {
            m.handle_projectile_hit(&shooter, &victim, &format!("p{}", i), 0);
        }

        m.queue_input(
            &victim,
            InputPayload {
                tick: 1,
                vector: walk_right(),
            },
            0,
        );
        assert!(m.player(&victim).unwrap().input_queue.is_empty());

        let x_before = m.player(&victim).unwrap().x;
        m.update(STEP);
        assert_eq!(m.player(&victim).unwrap().x, x_before);
    }

    #[test]
    fn win_emits_game_over_and_reset_follows() {
        let mut m = new_match(0);
        let (shooter, mut shooter_rx) = join(&mut m, "sessionid-abcd", "alice", 0);
        let (victim, _rx2) = join(&mut m, "othersess-wxyz", "bob", 0);
        let (by1, _rx3) = join(&mut m, "thirdsess-qrst", "carol", 0);
        m.toggle_bystander(&by1);

        let mut now = 0;
        for _ in 0..MAX_KILL_AMOUNT {
            // 10 hits to kill, then let the respawn land before the next run
            for i in 0..10 {
                m.handle_projectile_hit(&shooter, &victim, &format!("p{}-{}", now, i), now);
            }
            now += 3_100;
            m.update(now);
        }

        let outbound = drain(&mut shooter_rx);
        let game_over = outbound.iter().find_map(|o| match o {
            Outbound::Msg(ServerMsg::GameOver { scores }) => Some(scores.clone()),
            _ => None,
        });
        let scores = game_over.expect("gameOver emitted");
        assert_eq!(scores[0].kills, MAX_KILL_AMOUNT);
        assert_eq!(scores[0].player_id, shooter);
        assert_eq!(m.phase(), MatchPhase::AwaitingReset);

        let tick_at_game_over = m.server_tick();

        // Reset fires 10 s later; scores clear, positions survive
        let x_before = m.player(&shooter).unwrap().x;
        m.update(now + 10_050);
        assert_eq!(m.phase(), MatchPhase::Active);
        let shooter_state = m.player(&shooter).unwrap();
        assert_eq!(shooter_state.kills, 0);
        assert_eq!(shooter_state.hp, MAX_HP);
        assert_eq!(shooter_state.x, x_before);
        assert!(m.player(&by1).unwrap().is_bystander);
        assert!(m.server_tick() > tick_at_game_over);

        let outbound = drain(&mut shooter_rx);
        assert!(outbound
            .iter()
            .any(|o| matches!(o, Outbound::Msg(ServerMsg::MatchReset))));
    }

    #[test]
    fn disconnect_within_grace_rejoins_with_full_state() {
        let mut m = new_match(0);
        let (pid, _rx) = join(&mut m, "sessionid-abcd", "alice", 0);
        let (_other, mut other_rx) = join(&mut m, "othersess-wxyz", "bob", 0);
        m.player_mut(&pid).unwrap().kills = 2;

        m.handle_disconnect(&pid, 1_000);
        assert!(m.player(&pid).unwrap().is_disconnected);

        // Flush the join-time full broadcast so the rejoin one is observable
        m.broadcast_game_state();
        drain(&mut other_rx);

        // 15 s later: rejoin succeeds, scores intact, full state pending
        let (session2, mut rx2) = SessionHandle::new("freshsess-9999".to_string());
        m.rejoin_player(session2, &pid, 16_000).unwrap();
        let p = m.player(&pid).unwrap();
        assert!(!p.is_disconnected);
        assert_eq!(p.kills, 2);

        m.broadcast_game_state();
        let frames = frames_of(&drain(&mut rx2));
        let players = frames[0]["players"].as_array().unwrap();
        // Full state: every entry carries hp and name
        assert!(players.iter().all(|p| p.get("hp").is_some()));
        assert!(players.iter().all(|p| p.get("name").is_some()));
    }

    #[test]
    fn grace_expiry_removes_player_and_empty_match() {
        let mut m = new_match(0);
        let (pid, _rx) = join(&mut m, "sessionid-abcd", "alice", 0);

        m.handle_disconnect(&pid, 1_000);
        m.update(10_000);
        assert_eq!(m.player_count(), 1);

        // Past the 20 s grace period
        m.update(22_000);
        assert_eq!(m.player_count(), 0);
        assert!(m.should_remove());

        // Rejoin attempts now fail
        let (session, _rx2) = SessionHandle::new("freshsess-9999".to_string());
        assert!(m.rejoin_player(session, &pid, 25_000).is_err());
    }

    #[test]
    fn afk_player_is_warned_then_removed() {
        let mut m = new_match(0);
        let (pid, mut rx) = join(&mut m, "sessionid-abcd", "alice", 0);
        ground(&mut m, &pid);

        m.update(61_000);
        let outbound = drain(&mut rx);
        assert!(outbound
            .iter()
            .any(|o| matches!(o, Outbound::Msg(ServerMsg::AfkWarning { .. }))));

        m.update(71_500);
        let outbound = drain(&mut rx);
        assert!(outbound
            .iter()
            .any(|o| matches!(o, Outbound::Msg(ServerMsg::AfkRemoved { .. }))));
        assert!(outbound
            .iter()
            .any(|o| matches!(o, Outbound::Close)));
    }

    #[test]
    fn input_cancels_afk_removal() {
        let mut m = new_match(0);
        let (pid, mut rx) = join(&mut m, "sessionid-abcd", "alice", 0);
        ground(&mut m, &pid);

        m.update(61_000);
        assert!(drain(&mut rx)
            .iter()
            .any(|o| matches!(o, Outbound::Msg(ServerMsg::AfkWarning { .. }))));

        m.queue_input(
            &pid,
            InputPayload {
                tick: 1,
                vector: walk_right(),
            },
            61_500,
        );

        m.update(72_000);
        assert!(!drain(&mut rx)
            .iter()
            .any(|o| matches!(o, Outbound::Msg(ServerMsg::AfkRemoved { .. }))));
    }

    #[test]
    fn broadcast_reports_bytes_and_drains_projectiles() {
        let mut m = new_match(0);
        let (pid, mut rx) = join(&mut m, "sessionid-abcd", "alice", 0);
        ground(&mut m, &pid);

        m.queue_input(
            &pid,
            InputPayload {
                tick: 1,
                vector: InputVector {
                    x: 0,
                    y: 0,
                    mouse: Some(MouseTarget {
                        x: 900.0,
                        y: 900.0,
                        id: "proj-7".to_string(),
                    }),
                },
            },
            0,
        );
        m.update(STEP);

        let bytes = m.broadcast_game_state();
        assert!(bytes > 0);
        let frames = frames_of(&drain(&mut rx));
        assert_eq!(frames[0]["projectiles"].as_array().unwrap().len(), 1);

        // Drained: the next broadcast has none
        m.update(2 * STEP);
        m.broadcast_game_state();
        let frames = frames_of(&drain(&mut rx));
        assert!(frames[0]["projectiles"].as_array().unwrap().is_empty());
    }

    #[test]
    fn clean_up_session_is_idempotent_and_total() {
        let mut m = new_match(0);
        let (pid, mut rx) = join(&mut m, "sessionid-abcd", "alice", 0);
        let _ = pid;

        m.clean_up_session();
        assert_eq!(m.player_count(), 0);
        assert!(m.should_remove());
        assert!(drain(&mut rx)
            .iter()
            .any(|o| matches!(o, Outbound::Close)));

        // Second call is a no-op
        m.clean_up_session();
    }

    #[test]
    fn broadcast_invariants_hold_under_chaotic_input() {
        let mut m = new_match(0);
        let (pid, _rx) = join(&mut m, "sessionid-abcd", "alice", 0);
        let vectors = [(1, 0), (-1, 0), (0, -1), (1, -1), (0, 0)];

        let mut now = 0;
        for (i, &(x, y)) in vectors.iter().cycle().take(120).enumerate() {
            m.queue_input(
                &pid,
                InputPayload {
                    tick: i as u64 + 1,
                    vector: InputVector { x, y, mouse: None },
                },
                now,
            );
            now += STEP;
            m.update(now);

            let p = m.player(&pid).unwrap();
            assert!(p.hp >= 0 && p.hp <= MAX_HP);
            assert!(p.x >= 25.0 && p.x <= 1895.0);
            assert!(p.y >= 0.0 && p.y <= ARENA_HEIGHT);
            assert!(p.vy <= 1500.0);
        }
    }
}
