//! Matchmaker: match registry, region first-fit placement, reconnect
//! routing, and the 30 Hz driver that advances every match

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tracing::{error, info, warn};

use crate::game::{GameMatch, MatchError, MatchmakerHooks};
use crate::metrics::Metrics;
use crate::store::Store;
use crate::util::time::{monotonic_ms, FIXED_STEP_MS, Timer};
use crate::ws::protocol::{Region, ServerMsg};
use crate::ws::SessionHandle;

const MATCH_ID_SUFFIX_LEN: usize = 6;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Placement failures surfaced to the gateway
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("No match to reconnect to")]
    ReconnectFailed,
}

/// Registry of live matches. Lookup is concurrent; the creation-order list
/// drives both first-fit placement and driver iteration.
struct MatchRegistry {
    matches: DashMap<String, Arc<Mutex<GameMatch>>>,
    order: Mutex<Vec<String>>,
}

impl MatchRegistry {
    fn new() -> Self {
        Self {
            matches: DashMap::new(),
            order: Mutex::new(Vec::new()),
        }
    }

    fn get(&self, id: &str) -> Option<Arc<Mutex<GameMatch>>> {
        self.matches.get(id).map(|entry| entry.value().clone())
    }

    fn insert(&self, id: String, handle: Arc<Mutex<GameMatch>>) {
        self.matches.insert(id.clone(), handle);
        self.order
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(id);
    }

    fn remove(&self, id: &str) {
        self.matches.remove(id);
        self.order
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|existing| existing != id);
    }

    fn ids_in_order(&self) -> Vec<String> {
        self.order.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn len(&self) -> usize {
        self.matches.len()
    }
}

/// Reconnect index: player_match_id -> match id, written by match
/// disconnect/reconnect paths through the hooks interface.
struct DisconnectIndex {
    map: DashMap<String, String>,
}

impl MatchmakerHooks for DisconnectIndex {
    fn on_disconnect(&self, player_match_id: &str, match_id: &str) {
        self.map
            .insert(player_match_id.to_string(), match_id.to_string());
    }

    fn on_reconnect_cleared(&self, player_match_id: &str) {
        self.map.remove(player_match_id);
    }
}

pub struct Matchmaker {
    registry: MatchRegistry,
    disconnected: Arc<DisconnectIndex>,
    show_is_live: AtomicBool,
    shutting_down: AtomicBool,
    max_players_per_match: usize,
    metrics: Arc<Metrics>,
    store: Store,
}

impl Matchmaker {
    pub fn new(max_players_per_match: usize, metrics: Arc<Metrics>, store: Store) -> Self {
        Self {
            registry: MatchRegistry::new(),
            disconnected: Arc::new(DisconnectIndex {
                map: DashMap::new(),
            }),
            show_is_live: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            max_players_per_match,
            metrics,
            store,
        }
    }

    pub fn active_matches(&self) -> usize {
        self.registry.len()
    }

    pub fn total_players(&self) -> usize {
        self.registry
            .ids_in_order()
            .iter()
            .filter_map(|id| self.registry.get(id))
            .map(|handle| {
                handle
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .player_count()
            })
            .sum()
    }

    /// Mark the next driver pass to tell every match the stream is live.
    pub fn mark_show_is_live(&self) {
        self.show_is_live.store(true, Ordering::Relaxed);
    }

    /// Place a session: reconnect if a grace entry points to a live match,
    /// else first-fit by region, else a fresh match. Emits `rejoinedMatch` or
    /// `matchFound` before returning so it always precedes the first
    /// `stateUpdate`.
    pub fn enqueue_player(
        &self,
        session: SessionHandle,
        name: &str,
        region: Region,
        player_match_id: Option<String>,
        now: u64,
    ) -> Result<(Arc<Mutex<GameMatch>>, String), EnqueueError> {
        // Reconnect path: a supplied id is honored only within its grace entry
        if let Some(requested_id) = player_match_id {
            let target = self
                .disconnected
                .map
                .get(&requested_id)
                .map(|entry| entry.value().clone());
            let Some(match_id) = target else {
                warn!(player_id = %requested_id, "reconnect with no grace entry");
                return Err(EnqueueError::ReconnectFailed);
            };
            let Some(handle) = self.registry.get(&match_id) else {
                warn!(player_id = %requested_id, match_id = %match_id, "reconnect to reaped match");
                self.disconnected.map.remove(&requested_id);
                return Err(EnqueueError::ReconnectFailed);
            };

            let mut game_match = handle.lock().unwrap_or_else(|e| e.into_inner());
            match game_match.rejoin_player(session.clone(), &requested_id, now) {
                Ok(()) => {
                    session.emit(ServerMsg::RejoinedMatch {
                        match_id: match_id.clone(),
                        region: game_match.region(),
                    });
                    drop(game_match);
                    self.disconnected.map.remove(&requested_id);
                    return Ok((handle.clone(), requested_id));
                }
                Err(e) => {
                    warn!(player_id = %requested_id, error = %e, "rejoin failed");
                    return Err(EnqueueError::ReconnectFailed);
                }
            }
        }

        // First fit: oldest same-region match with a free slot
        for id in self.registry.ids_in_order() {
            let Some(handle) = self.registry.get(&id) else {
                continue;
            };
            let mut game_match = handle.lock().unwrap_or_else(|e| e.into_inner());
            if game_match.region() != region
                || game_match.player_count() >= self.max_players_per_match
                || game_match.should_remove()
            {
                continue;
            }
            match game_match.add_player(session.clone(), name, now) {
                Ok(player_id) => {
                    session.emit(ServerMsg::MatchFound {
                        match_id: id.clone(),
                        region,
                        player_id: player_id.clone(),
                    });
                    drop(game_match);
                    return Ok((handle.clone(), player_id));
                }
                Err(MatchError::MatchFull) => continue,
                Err(e) => {
                    warn!(match_id = %id, error = %e, "placement failed");
                    continue;
                }
            }
        }

        // No seat anywhere: open a new match
        let match_id = new_match_id();
        let handle = Arc::new(Mutex::new(GameMatch::new(
            match_id.clone(),
            region,
            self.max_players_per_match,
            self.disconnected.clone(),
            self.metrics.clone(),
            now,
        )));

        let player_id = {
            let mut game_match = handle.lock().unwrap_or_else(|e| e.into_inner());
            // A fresh match always has room
            let player_id = game_match
                .add_player(session.clone(), name, now)
                .expect("empty match cannot be full");
            session.emit(ServerMsg::MatchFound {
                match_id: match_id.clone(),
                region,
                player_id: player_id.clone(),
            });
            player_id
        };

        self.registry.insert(match_id.clone(), handle.clone());
        info!(match_id = %match_id, %region, "created match");

        Ok((handle, player_id))
    }

    /// One driver pass: reap finished matches, then advance and broadcast the
    /// rest. Simulation faults are contained per match.
    pub fn drive_once(&self, now: u64) {
        let show_live = self.show_is_live.swap(false, Ordering::Relaxed);

        for id in self.registry.ids_in_order() {
            let Some(handle) = self.registry.get(&id) else {
                continue;
            };

            let remove = handle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .should_remove();
            if remove {
                // Registry first, cleanup second: the driver cannot re-enter
                // a match it can no longer find
                self.registry.remove(&id);
                self.disconnected.map.retain(|_, match_id| match_id != &id);
                handle
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clean_up_session();
                info!(match_id = %id, "match reaped");
                continue;
            }

            let result = catch_unwind(AssertUnwindSafe(|| {
                let mut game_match = handle.lock().unwrap_or_else(|e| e.into_inner());
                if show_live {
                    game_match.inform_show_is_live();
                }
                game_match.update(now);
                game_match.broadcast_game_state()
            }));

            match result {
                Ok(bytes) => {
                    if bytes > 0 {
                        self.metrics.record_broadcast(bytes);
                    }
                }
                Err(_) => {
                    error!(match_id = %id, "simulation fault, match continues next pass");
                    self.metrics.record_error();
                }
            }
        }
    }

    /// The global 30 Hz driver loop. Runs until shutdown is requested.
    pub async fn run(self: Arc<Self>) {
        info!("matchmaker driver started");
        let step = FIXED_STEP_MS as u64;
        let mut last_pass: u64 = 0;

        while !self.shutting_down.load(Ordering::Relaxed) {
            let timer = Timer::new();
            let now = monotonic_ms();

            if now.saturating_sub(last_pass) >= step {
                last_pass = now;
                self.drive_once(now);
                self.metrics.record_loop(Duration::from_micros(timer.elapsed_micros()));
                self.metrics.check_thresholds();
                self.maybe_persist_rollup().await;
            }

            let elapsed = timer.elapsed_ms();
            tokio::time::sleep(Duration::from_millis(step.saturating_sub(elapsed).max(1))).await;
        }

        info!("matchmaker driver stopped");
    }

    /// Persist the previous day's rollup once the local date rolls over.
    /// Counters reset only after the store accepts the document.
    async fn maybe_persist_rollup(&self) {
        let Some(rollup) = self.metrics.pending_rollup() else {
            return;
        };
        match self.store.upsert_daily_rollup(&rollup).await {
            Ok(()) => {
                info!(date = %rollup.date, "daily rollup persisted");
                self.metrics.commit_rollup();
            }
            Err(e) => {
                warn!(date = %rollup.date, error = %e, "daily rollup persist failed, will retry");
                self.metrics.record_error();
            }
        }
    }

    /// Stop the driver, flush a final rollup, and tear down every match.
    pub async fn shutdown(&self) {
        info!("matchmaker shutting down");
        self.shutting_down.store(true, Ordering::Relaxed);

        let rollup = self.metrics.flush_rollup();
        if let Err(e) = self.store.upsert_daily_rollup(&rollup).await {
            warn!(error = %e, "final rollup flush failed");
        }

        for id in self.registry.ids_in_order() {
            if let Some(handle) = self.registry.get(&id) {
                handle
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clean_up_session();
            }
            self.registry.remove(&id);
        }
        self.disconnected.map.clear();
    }
}

fn new_match_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..MATCH_ID_SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("match-{}", suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::Outbound;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn matchmaker(max_players: usize) -> Matchmaker {
        Matchmaker::new(max_players, Arc::new(Metrics::new()), Store::disabled())
    }

    fn session(id: &str) -> (SessionHandle, UnboundedReceiver<Outbound>) {
        SessionHandle::new(id.to_string())
    }

    fn first_msg(rx: &mut UnboundedReceiver<Outbound>) -> ServerMsg {
        loop {
            match rx.try_recv().expect("expected a message") {
                Outbound::Msg(msg) => return msg,
                _ => continue,
            }
        }
    }

    #[test]
    fn match_ids_carry_base36_suffix() {
        let id = new_match_id();
        assert!(id.starts_with("match-"));
        assert_eq!(id.len(), "match-".len() + MATCH_ID_SUFFIX_LEN);
        assert!(id["match-".len()..]
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn same_region_players_share_a_match() {
        let mm = matchmaker(10);
        let (s1, mut rx1) = session("aaaaaaaaaaaa0001");
        let (s2, _rx2) = session("bbbbbbbbbbbb0002");

        let (m1, _p1) = mm.enqueue_player(s1, "alice", Region::NA, None, 0).unwrap();
        let (m2, _p2) = mm.enqueue_player(s2, "bob", Region::NA, None, 0).unwrap();

        assert!(Arc::ptr_eq(&m1, &m2));
        assert_eq!(mm.active_matches(), 1);
        assert_eq!(mm.total_players(), 2);

        match first_msg(&mut rx1) {
            ServerMsg::MatchFound { region, .. } => assert_eq!(region, Region::NA),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn different_regions_never_share() {
        let mm = matchmaker(10);
        let (s1, _rx1) = session("aaaaaaaaaaaa0001");
        let (s2, _rx2) = session("bbbbbbbbbbbb0002");

        let (m1, _) = mm.enqueue_player(s1, "alice", Region::NA, None, 0).unwrap();
        let (m2, _) = mm.enqueue_player(s2, "bob", Region::EU, None, 0).unwrap();

        assert!(!Arc::ptr_eq(&m1, &m2));
        assert_eq!(mm.active_matches(), 2);
    }

    #[test]
    fn full_match_overflows_into_a_new_one() {
        let mm = matchmaker(2);
        let (s1, _r1) = session("aaaaaaaaaaaa0001");
        let (s2, _r2) = session("bbbbbbbbbbbb0002");
        let (s3, _r3) = session("cccccccccccc0003");

        let (m1, _) = mm.enqueue_player(s1, "a", Region::NA, None, 0).unwrap();
        let (_m2, _) = mm.enqueue_player(s2, "b", Region::NA, None, 0).unwrap();
        let (m3, _) = mm.enqueue_player(s3, "c", Region::NA, None, 0).unwrap();

        assert!(!Arc::ptr_eq(&m1, &m3));
        assert_eq!(mm.active_matches(), 2);
    }

    #[test]
    fn reconnect_routes_back_to_the_original_match() {
        let mm = matchmaker(10);
        let (s1, _rx1) = session("aaaaaaaaaaaa0001");
        let (handle, pid) = mm.enqueue_player(s1, "alice", Region::NA, None, 0).unwrap();

        {
            let mut game_match = handle.lock().unwrap();
            game_match.player_mut(&pid).unwrap().kills = 3;
            game_match.handle_disconnect(&pid, 1_000);
        }

        let (s2, mut rx2) = session("dddddddddddd0009");
        let (handle2, pid2) = mm
            .enqueue_player(s2, "alice", Region::NA, Some(pid.clone()), 16_000)
            .unwrap();

        assert!(Arc::ptr_eq(&handle, &handle2));
        assert_eq!(pid2, pid);
        assert!(matches!(
            first_msg(&mut rx2),
            ServerMsg::RejoinedMatch { .. }
        ));
        let game_match = handle.lock().unwrap();
        assert_eq!(game_match.player(&pid).unwrap().kills, 3);
        assert!(!game_match.player(&pid).unwrap().is_disconnected);
    }

    #[test]
    fn reconnect_without_grace_entry_fails() {
        let mm = matchmaker(10);
        let (s, _rx) = session("aaaaaaaaaaaa0001");
        let result = mm.enqueue_player(s, "ghost", Region::NA, Some("missing-pid".into()), 0);
        assert!(matches!(result, Err(EnqueueError::ReconnectFailed)));
    }

    #[test]
    fn reconnect_after_grace_expiry_fails() {
        let mm = matchmaker(10);
        let (s1, _rx1) = session("aaaaaaaaaaaa0001");
        let (handle, pid) = mm.enqueue_player(s1, "alice", Region::NA, None, 0).unwrap();

        {
            let mut game_match = handle.lock().unwrap();
            game_match.handle_disconnect(&pid, 0);
        }

        // Drive past the grace period; the sweep clears the index entry
        mm.drive_once(25_000);

        let (s2, _rx2) = session("dddddddddddd0009");
        let result = mm.enqueue_player(s2, "alice", Region::NA, Some(pid), 25_500);
        assert!(matches!(result, Err(EnqueueError::ReconnectFailed)));
    }

    #[test]
    fn driver_reaps_empty_matches() {
        let mm = matchmaker(10);
        let (s1, _rx1) = session("aaaaaaaaaaaa0001");
        let (handle, pid) = mm.enqueue_player(s1, "alice", Region::NA, None, 0).unwrap();

        handle.lock().unwrap().handle_disconnect(&pid, 0);

        // Grace expires, the match empties and marks itself
        mm.drive_once(25_000);
        assert!(handle.lock().unwrap().should_remove());

        // Next pass reaps it
        mm.drive_once(25_100);
        assert_eq!(mm.active_matches(), 0);
    }

    #[test]
    fn driver_advances_and_broadcasts() {
        let mm = matchmaker(10);
        let (s1, mut rx1) = session("aaaaaaaaaaaa0001");
        let (handle, _pid) = mm.enqueue_player(s1, "alice", Region::NA, None, 0).unwrap();

        mm.drive_once(40);
        assert_eq!(handle.lock().unwrap().server_tick(), 1);
        let got_frame = std::iter::from_fn(|| rx1.try_recv().ok())
            .any(|o| matches!(o, Outbound::Frame(_)));
        assert!(got_frame);
    }

    #[test]
    fn show_is_live_is_one_shot() {
        let mm = matchmaker(10);
        let (s1, mut rx1) = session("aaaaaaaaaaaa0001");
        mm.enqueue_player(s1, "alice", Region::NA, None, 0).unwrap();

        mm.mark_show_is_live();
        mm.drive_once(40);
        let msgs: Vec<Outbound> = std::iter::from_fn(|| rx1.try_recv().ok()).collect();
        assert!(msgs
            .iter()
            .any(|o| matches!(o, Outbound::Msg(ServerMsg::ShowIsLive))));

        mm.drive_once(80);
        let msgs: Vec<Outbound> = std::iter::from_fn(|| rx1.try_recv().ok()).collect();
        assert!(!msgs
            .iter()
            .any(|o| matches!(o, Outbound::Msg(ServerMsg::ShowIsLive))));
    }
}
