//! Metrics aggregator: counters, rolling windows, threshold alerts, rollups
//!
//! The only state shared across matches. Lifetime counters are atomics;
//! the sample windows sit behind one mutex and are pruned on insert.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::warn;

use crate::store::DailyRollup;
use crate::util::time::{monotonic_ms, FIXED_STEP_MS};

/// Short window for loop/broadcast statistics
const STATS_WINDOW_MS: u64 = 10_000;
/// Rolling window for connection/error counts
const EVENT_WINDOW_MS: u64 = 60_000;
/// A driver loop slower than one fixed step is counted as slow
const SLOW_LOOP_MS: f64 = FIXED_STEP_MS;
/// Minimum spacing between threshold alerts
const ALERT_COOLDOWN_MS: u64 = 10_000;

const MAX_AVG_LOOP_MS: f64 = FIXED_STEP_MS;
const MAX_MEMORY_PERCENT: f64 = 90.0;
const MAX_BANDWIDTH_MB_PER_SEC: f64 = 50.0;
const MIN_LOOPS_PER_SEC: f64 = 25.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Connect,
    Disconnect,
    Reconnect,
    SlowLoop,
    Error,
}

#[derive(Default)]
struct SampleWindow {
    /// (timestamp ms, loop duration µs)
    loops: VecDeque<(u64, u64)>,
    /// (timestamp ms, broadcast bytes)
    broadcasts: VecDeque<(u64, usize)>,
    /// (timestamp ms, event)
    events: VecDeque<(u64, EventKind)>,
}

impl SampleWindow {
    fn prune(&mut self, now: u64) {
        let stats_cutoff = now.saturating_sub(STATS_WINDOW_MS);
        while self.loops.front().is_some_and(|&(t, _)| t < stats_cutoff) {
            self.loops.pop_front();
        }
        while self
            .broadcasts
            .front()
            .is_some_and(|&(t, _)| t < stats_cutoff)
        {
            self.broadcasts.pop_front();
        }
        let event_cutoff = now.saturating_sub(EVENT_WINDOW_MS);
        while self.events.front().is_some_and(|&(t, _)| t < event_cutoff) {
            self.events.pop_front();
        }
    }
}

/// Counters feeding the daily rollup, reset after each successful persist
struct DailyCounters {
    date: String,
    unique_players: HashSet<String>,
    peak_concurrent: u64,
    concurrent_sum: u64,
    concurrent_samples: u64,
    rounds: u64,
    disconnects: u64,
    temporary_disconnects: u64,
    reconnects: u64,
    slow_loops: u64,
    errors: u64,
    peak_memory_mb: f64,
    peak_bandwidth_mb_per_sec: f64,
}

impl DailyCounters {
    fn new(date: String) -> Self {
        Self {
            date,
            unique_players: HashSet::new(),
            peak_concurrent: 0,
            concurrent_sum: 0,
            concurrent_samples: 0,
            rounds: 0,
            disconnects: 0,
            temporary_disconnects: 0,
            reconnects: 0,
            slow_loops: 0,
            errors: 0,
            peak_memory_mb: 0.0,
            peak_bandwidth_mb_per_sec: 0.0,
        }
    }
}

/// Point-in-time view over the 10 s window
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowStats {
    pub avg_loop_ms: f64,
    pub max_loop_ms: f64,
    pub loops_per_sec: f64,
    pub broadcasts_per_sec: f64,
    pub avg_broadcast_kb: f64,
    pub bandwidth_mb_per_sec: f64,
    pub rss_mb: f64,
}

/// Event counts over the rolling 60 s window
#[derive(Debug, Clone, Copy, Default)]
pub struct RollingCounts {
    pub connections: u64,
    pub disconnects: u64,
    pub reconnects: u64,
    pub slow_loops: u64,
    pub errors: u64,
}

pub struct Metrics {
    connects_total: AtomicU64,
    disconnects_total: AtomicU64,
    reconnects_total: AtomicU64,
    errors_total: AtomicU64,
    rounds_total: AtomicU64,
    current_players: AtomicI64,

    window: Mutex<SampleWindow>,
    daily: Mutex<DailyCounters>,
    last_alert: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connects_total: AtomicU64::new(0),
            disconnects_total: AtomicU64::new(0),
            reconnects_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            rounds_total: AtomicU64::new(0),
            current_players: AtomicI64::new(0),
            window: Mutex::new(SampleWindow::default()),
            daily: Mutex::new(DailyCounters::new(local_date())),
            last_alert: AtomicU64::new(0),
        }
    }

    pub fn record_connect(&self, player_match_id: &str) {
        self.connects_total.fetch_add(1, Ordering::Relaxed);
        let current = self.current_players.fetch_add(1, Ordering::Relaxed) + 1;
        self.record_event(EventKind::Connect);

        let mut daily = self.daily.lock().unwrap_or_else(|e| e.into_inner());
        daily.unique_players.insert(player_match_id.to_string());
        daily.peak_concurrent = daily.peak_concurrent.max(current.max(0) as u64);
    }

    pub fn record_disconnect(&self) {
        self.disconnects_total.fetch_add(1, Ordering::Relaxed);
        self.current_players.fetch_sub(1, Ordering::Relaxed);
        self.record_event(EventKind::Disconnect);

        let mut daily = self.daily.lock().unwrap_or_else(|e| e.into_inner());
        daily.disconnects += 1;
    }

    pub fn record_reconnect(&self) {
        self.reconnects_total.fetch_add(1, Ordering::Relaxed);
        let current = self.current_players.fetch_add(1, Ordering::Relaxed) + 1;
        self.record_event(EventKind::Reconnect);

        let mut daily = self.daily.lock().unwrap_or_else(|e| e.into_inner());
        daily.reconnects += 1;
        daily.temporary_disconnects += 1;
        daily.peak_concurrent = daily.peak_concurrent.max(current.max(0) as u64);
    }

    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        self.record_event(EventKind::Error);

        let mut daily = self.daily.lock().unwrap_or_else(|e| e.into_inner());
        daily.errors += 1;
    }

    pub fn record_round(&self) {
        self.rounds_total.fetch_add(1, Ordering::Relaxed);
        let mut daily = self.daily.lock().unwrap_or_else(|e| e.into_inner());
        daily.rounds += 1;
    }

    pub fn record_loop(&self, duration: Duration) {
        self.record_loop_at(monotonic_ms(), duration);
    }

    fn record_loop_at(&self, now: u64, duration: Duration) {
        let micros = duration.as_micros() as u64;
        let slow = micros as f64 / 1000.0 > SLOW_LOOP_MS;

        {
            let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
            window.loops.push_back((now, micros));
            if slow {
                window.events.push_back((now, EventKind::SlowLoop));
            }
            window.prune(now);
        }

        let current = self.current_players.load(Ordering::Relaxed).max(0) as u64;
        let mut daily = self.daily.lock().unwrap_or_else(|e| e.into_inner());
        daily.concurrent_sum += current;
        daily.concurrent_samples += 1;
        if slow {
            daily.slow_loops += 1;
        }
    }

    pub fn record_broadcast(&self, bytes: usize) {
        self.record_broadcast_at(monotonic_ms(), bytes);
    }

    fn record_broadcast_at(&self, now: u64, bytes: usize) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.broadcasts.push_back((now, bytes));
        window.prune(now);
    }

    fn record_event(&self, kind: EventKind) {
        let now = monotonic_ms();
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.events.push_back((now, kind));
        window.prune(now);
    }

    /// Statistics over the last 10 seconds
    pub fn window_stats(&self) -> WindowStats {
        self.window_stats_at(monotonic_ms())
    }

    fn window_stats_at(&self, now: u64) -> WindowStats {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.prune(now);

        let window_secs = STATS_WINDOW_MS as f64 / 1000.0;
        let loop_count = window.loops.len();
        let (sum_us, max_us) = window
            .loops
            .iter()
            .fold((0u64, 0u64), |(sum, max), &(_, us)| (sum + us, max.max(us)));

        let broadcast_count = window.broadcasts.len();
        let total_bytes: u64 = window.broadcasts.iter().map(|&(_, b)| b as u64).sum();

        WindowStats {
            avg_loop_ms: if loop_count > 0 {
                sum_us as f64 / loop_count as f64 / 1000.0
            } else {
                0.0
            },
            max_loop_ms: max_us as f64 / 1000.0,
            loops_per_sec: loop_count as f64 / window_secs,
            broadcasts_per_sec: broadcast_count as f64 / window_secs,
            avg_broadcast_kb: if broadcast_count > 0 {
                total_bytes as f64 / broadcast_count as f64 / 1024.0
            } else {
                0.0
            },
            bandwidth_mb_per_sec: total_bytes as f64 / window_secs / (1024.0 * 1024.0),
            rss_mb: rss_mb(),
        }
    }

    /// Event counts over the rolling last 60 seconds
    pub fn rolling_counts(&self) -> RollingCounts {
        let now = monotonic_ms();
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.prune(now);

        let mut counts = RollingCounts::default();
        for &(_, kind) in &window.events {
            match kind {
                EventKind::Connect => counts.connections += 1,
                EventKind::Disconnect => counts.disconnects += 1,
                EventKind::Reconnect => counts.reconnects += 1,
                EventKind::SlowLoop => counts.slow_loops += 1,
                EventKind::Error => counts.errors += 1,
            }
        }
        counts
    }

    pub fn current_players(&self) -> u64 {
        self.current_players.load(Ordering::Relaxed).max(0) as u64
    }

    /// Compare the 10 s window against the health bounds and log alerts,
    /// rate-limited to one batch per cooldown.
    pub fn check_thresholds(&self) {
        let now = monotonic_ms();
        let last = self.last_alert.load(Ordering::Relaxed);
        if now.saturating_sub(last) < ALERT_COOLDOWN_MS {
            return;
        }

        let stats = self.window_stats_at(now);
        let mut alerted = false;

        if stats.avg_loop_ms > MAX_AVG_LOOP_MS {
            warn!(
                avg_loop_ms = stats.avg_loop_ms,
                limit = MAX_AVG_LOOP_MS,
                "driver loop is running slow"
            );
            alerted = true;
        }
        if stats.bandwidth_mb_per_sec > MAX_BANDWIDTH_MB_PER_SEC {
            warn!(
                bandwidth_mb_per_sec = stats.bandwidth_mb_per_sec,
                limit = MAX_BANDWIDTH_MB_PER_SEC,
                "broadcast bandwidth above limit"
            );
            alerted = true;
        }
        if stats.loops_per_sec > 0.0 && stats.loops_per_sec < MIN_LOOPS_PER_SEC {
            warn!(
                loops_per_sec = stats.loops_per_sec,
                limit = MIN_LOOPS_PER_SEC,
                "driver is being starved"
            );
            alerted = true;
        }
        let mem_percent = memory_percent();
        if mem_percent > MAX_MEMORY_PERCENT {
            warn!(
                memory_percent = mem_percent,
                limit = MAX_MEMORY_PERCENT,
                "process memory usage is high"
            );
            alerted = true;
        }

        // Track peaks for the daily rollup while we are here
        {
            let mut daily = self.daily.lock().unwrap_or_else(|e| e.into_inner());
            daily.peak_memory_mb = daily.peak_memory_mb.max(stats.rss_mb);
            daily.peak_bandwidth_mb_per_sec =
                daily.peak_bandwidth_mb_per_sec.max(stats.bandwidth_mb_per_sec);
        }

        if alerted {
            self.last_alert.store(now, Ordering::Relaxed);
        }
    }

    /// A rollup for the previous day, once the local date has rolled over.
    /// The counters stay intact until `commit_rollup` so a failed persist is
    /// retried on the next pass.
    pub fn pending_rollup(&self) -> Option<DailyRollup> {
        let daily = self.daily.lock().unwrap_or_else(|e| e.into_inner());
        if daily.date == local_date() {
            return None;
        }
        Some(build_rollup(&daily))
    }

    /// A rollup for the current partial day (shutdown flush).
    pub fn flush_rollup(&self) -> DailyRollup {
        let daily = self.daily.lock().unwrap_or_else(|e| e.into_inner());
        build_rollup(&daily)
    }

    /// Reset daily counters after a successful persist.
    pub fn commit_rollup(&self) {
        let mut daily = self.daily.lock().unwrap_or_else(|e| e.into_inner());
        *daily = DailyCounters::new(local_date());
    }

    /// Prometheus text exposition of the aggregate state
    pub fn render_prometheus(&self) -> String {
        let stats = self.window_stats();
        let rolling = self.rolling_counts();
        let mut out = String::with_capacity(1024);

        let counters = [
            ("arena_connections_total", self.connects_total.load(Ordering::Relaxed)),
            ("arena_disconnects_total", self.disconnects_total.load(Ordering::Relaxed)),
            ("arena_reconnects_total", self.reconnects_total.load(Ordering::Relaxed)),
            ("arena_errors_total", self.errors_total.load(Ordering::Relaxed)),
            ("arena_rounds_total", self.rounds_total.load(Ordering::Relaxed)),
        ];
        for (name, value) in counters {
            out.push_str(&format!("# TYPE {} counter\n{} {}\n", name, name, value));
        }

        let gauges = [
            ("arena_current_players", self.current_players() as f64),
            ("arena_loop_avg_ms", stats.avg_loop_ms),
            ("arena_loop_max_ms", stats.max_loop_ms),
            ("arena_loops_per_sec", stats.loops_per_sec),
            ("arena_broadcasts_per_sec", stats.broadcasts_per_sec),
            ("arena_broadcast_avg_kb", stats.avg_broadcast_kb),
            ("arena_bandwidth_mb_per_sec", stats.bandwidth_mb_per_sec),
            ("arena_rss_mb", stats.rss_mb),
            ("arena_connections_60s", rolling.connections as f64),
            ("arena_disconnects_60s", rolling.disconnects as f64),
            ("arena_reconnects_60s", rolling.reconnects as f64),
            ("arena_slow_loops_60s", rolling.slow_loops as f64),
            ("arena_errors_60s", rolling.errors as f64),
        ];
        for (name, value) in gauges {
            out.push_str(&format!("# TYPE {} gauge\n{} {}\n", name, name, value));
        }

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn build_rollup(daily: &DailyCounters) -> DailyRollup {
    let avg_concurrent = if daily.concurrent_samples > 0 {
        daily.concurrent_sum as f64 / daily.concurrent_samples as f64
    } else {
        0.0
    };
    let reconnect_rate = if daily.disconnects > 0 {
        daily.reconnects as f64 / daily.disconnects as f64
    } else {
        0.0
    };

    DailyRollup {
        date: daily.date.clone(),
        total_players_connected: daily.unique_players.len() as u64,
        peak_concurrent_players: daily.peak_concurrent,
        avg_concurrent_players: avg_concurrent,
        total_rounds_played: daily.rounds,
        total_disconnects: daily.disconnects,
        temporary_disconnects: daily.temporary_disconnects,
        reconnects: daily.reconnects,
        reconnect_rate,
        slow_loops_count: daily.slow_loops,
        error_count: daily.errors,
        peak_memory_usage_mb: daily.peak_memory_mb,
        peak_bandwidth_mb_per_sec: daily.peak_bandwidth_mb_per_sec,
    }
}

/// Local calendar date used as the rollup key
fn local_date() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

/// Resident set size in MB, read from procfs; zero where unavailable
fn rss_mb() -> f64 {
    read_status_kb("VmRSS:").map(|kb| kb / 1024.0).unwrap_or(0.0)
}

/// Resident set as a share of system memory, in percent
fn memory_percent() -> f64 {
    let rss = match read_status_kb("VmRSS:") {
        Some(kb) => kb,
        None => return 0.0,
    };
    let total = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|text| parse_kb_line(&text, "MemTotal:"));
    match total {
        Some(total_kb) if total_kb > 0.0 => rss / total_kb * 100.0,
        _ => 0.0,
    }
}

fn read_status_kb(field: &str) -> Option<f64> {
    let text = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_kb_line(&text, field)
}

fn parse_kb_line(text: &str, field: &str) -> Option<f64> {
    text.lines()
        .find(|line| line.starts_with(field))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|value| value.parse::<f64>().ok())
}
