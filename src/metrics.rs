//! Outcome collection for stress runs.
//!
//! Counters are atomics so submission tasks never contend on a lock for the
//! common path; latencies and the rolling failure window sit behind short
//! mutexes. [`Stats::snapshot`] can be taken at any time while a run is live.
//!
//! Latency percentiles come from a fixed-size uniform reservoir, so memory
//! stays flat however long a run goes. Count, mean and extremes are exact.

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use alloy_primitives::B256;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::account::Layer;

/// Latency samples kept for percentiles.
const LATENCY_RESERVOIR: usize = 10_000;

/// Terminal classification of a submitted intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeKind {
    Confirmed,
    Failed,
    TimedOut,
    Rejected,
}

impl OutcomeKind {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Confirmed)
    }
}

/// Immutable record of what happened to one intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutcome {
    pub intent_id: String,
    pub account_id: String,
    pub layer: Layer,
    /// Absent when the intent failed before a nonce was reserved.
    pub nonce: Option<u64>,
    pub hash: Option<B256>,
    pub kind: OutcomeKind,
    pub latency: Duration,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct KindCounters {
    confirmed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    rejected: AtomicU64,
}

impl KindCounters {
    fn get(&self, kind: OutcomeKind) -> &AtomicU64 {
        match kind {
            OutcomeKind::Confirmed => &self.confirmed,
            OutcomeKind::Failed => &self.failed,
            OutcomeKind::TimedOut => &self.timed_out,
            OutcomeKind::Rejected => &self.rejected,
        }
    }
}

/// Thread-safe aggregator of transaction outcomes.
#[derive(Debug)]
pub struct Stats {
    started: Instant,
    kinds: KindCounters,
    per_layer: [AtomicU64; 2],
    dispatched: AtomicU64,
    deferred: AtomicU64,
    latencies: Mutex<LatencyReservoir>,
    window: Mutex<VecDeque<bool>>,
    window_size: usize,
}

impl Stats {
    /// `window_size` is the number of most recent outcomes used for
    /// [`Stats::failure_rate`].
    pub fn new(window_size: usize) -> Self {
        Self {
            started: Instant::now(),
            kinds: KindCounters::default(),
            per_layer: [AtomicU64::new(0), AtomicU64::new(0)],
            dispatched: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            latencies: Mutex::new(LatencyReservoir::new(LATENCY_RESERVOIR)),
            window: Mutex::new(VecDeque::with_capacity(window_size)),
            window_size: window_size.max(1),
        }
    }

    pub fn record(&self, outcome: &TransactionOutcome) {
        self.kinds.get(outcome.kind).fetch_add(1, Ordering::Relaxed);
        self.per_layer[layer_index(outcome.layer)].fetch_add(1, Ordering::Relaxed);

        if let Ok(mut latencies) = self.latencies.lock() {
            latencies.push(outcome.latency);
        }
        if let Ok(mut window) = self.window.lock() {
            if window.len() == self.window_size {
                window.pop_front();
            }
            window.push_back(outcome.kind.is_success());
        }
    }

    pub fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// A scheduling tick had to wait for an in-flight slot.
    pub fn record_deferred(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, kind: OutcomeKind) -> u64 {
        self.kinds.get(kind).load(Ordering::Relaxed)
    }

    pub fn recorded(&self) -> u64 {
        self.per_layer.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    /// Failure share over the rolling window, once the window is full.
    pub fn failure_rate(&self) -> Option<f64> {
        let window = self.window.lock().ok()?;
        if window.len() < self.window_size {
            return None;
        }
        let failures = window.iter().filter(|ok| !**ok).count();
        Some(failures as f64 / window.len() as f64)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let elapsed = self.started.elapsed();
        let recorded = self.recorded();
        // copy under the lock, sort outside it
        let latency = self
            .latencies
            .lock()
            .map(|l| l.clone())
            .map(|l| l.summary())
            .unwrap_or_default();

        StatsSnapshot {
            elapsed_secs: elapsed.as_secs_f64(),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            deferred_ticks: self.deferred.load(Ordering::Relaxed),
            recorded,
            confirmed: self.count(OutcomeKind::Confirmed),
            failed: self.count(OutcomeKind::Failed),
            timed_out: self.count(OutcomeKind::TimedOut),
            rejected: self.count(OutcomeKind::Rejected),
            l1_outcomes: self.per_layer[0].load(Ordering::Relaxed),
            l2_outcomes: self.per_layer[1].load(Ordering::Relaxed),
            achieved_rate: rate(recorded, elapsed),
            latency,
        }
    }
}

fn layer_index(layer: Layer) -> usize {
    match layer {
        Layer::L1 => 0,
        Layer::L2 => 1,
    }
}

fn rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 { 0.0 } else { count as f64 / secs }
}

/// Algorithm R sample of every latency seen, plus exact aggregates.
#[derive(Debug, Clone)]
struct LatencyReservoir {
    samples: Vec<Duration>,
    capacity: usize,
    seen: u64,
    total: Duration,
    min: Duration,
    max: Duration,
}

impl LatencyReservoir {
    fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::new(),
            capacity: capacity.max(1),
            seen: 0,
            total: Duration::ZERO,
            min: Duration::MAX,
            max: Duration::ZERO,
        }
    }

    fn push(&mut self, latency: Duration) {
        self.seen += 1;
        self.total = self.total.saturating_add(latency);
        self.min = self.min.min(latency);
        self.max = self.max.max(latency);

        if self.samples.len() < self.capacity {
            self.samples.push(latency);
            return;
        }
        let slot = rand::rng().random_range(0..self.seen);
        if let Some(kept) = usize::try_from(slot).ok().and_then(|i| self.samples.get_mut(i)) {
            *kept = latency;
        }
    }

    fn summary(self) -> LatencySummary {
        if self.seen == 0 {
            return LatencySummary::default();
        }
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        LatencySummary {
            min_ms: ms(self.min),
            avg_ms: ms(self.total) / self.seen as f64,
            max_ms: ms(self.max),
            ..LatencySummary::from_samples(&self.samples)
        }
    }
}

/// Latency distribution in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub min_ms: f64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl LatencySummary {
    pub fn from_samples(samples: &[Duration]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();

        let total: Duration = sorted.iter().sum();
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;

        Self {
            min_ms: ms(sorted[0]),
            avg_ms: ms(total) / sorted.len() as f64,
            p50_ms: ms(percentile(&sorted, 50.0)),
            p90_ms: ms(percentile(&sorted, 90.0)),
            p99_ms: ms(percentile(&sorted, 99.0)),
            max_ms: ms(sorted[sorted.len() - 1]),
        }
    }
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[Duration], pct: f64) -> Duration {
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub elapsed_secs: f64,
    pub dispatched: u64,
    pub deferred_ticks: u64,
    pub recorded: u64,
    pub confirmed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub rejected: u64,
    pub l1_outcomes: u64,
    pub l2_outcomes: u64,
    pub achieved_rate: f64,
    pub latency: LatencySummary,
}

// ---------- Printing ----------
pub fn print_snapshot(title: &str, target_rate: f64, snapshot: &StatsSnapshot) {
    let width = 44;
    println!();
    println!("{title}");
    println!("{:-<1$}", "", width);

    let rows: [(&str, String); 12] = [
        ("Target rate (tx/s)", format!("{target_rate:.2}")),
        ("Achieved rate (tx/s)", format!("{:.2}", snapshot.achieved_rate)),
        ("Elapsed (s)", format!("{:.2}", snapshot.elapsed_secs)),
        ("Dispatched", snapshot.dispatched.to_string()),
        ("Deferred ticks", snapshot.deferred_ticks.to_string()),
        ("Confirmed", snapshot.confirmed.to_string()),
        ("Failed", snapshot.failed.to_string()),
        ("Timed out", snapshot.timed_out.to_string()),
        ("Rejected", snapshot.rejected.to_string()),
        (
            "Outcomes L1 / L2",
            format!("{} / {}", snapshot.l1_outcomes, snapshot.l2_outcomes),
        ),
        (
            "Latency min/avg (ms)",
            format!("{:.1} / {:.1}", snapshot.latency.min_ms, snapshot.latency.avg_ms),
        ),
        (
            "Latency p50/p90/p99 (ms)",
            format!(
                "{:.1} / {:.1} / {:.1}",
                snapshot.latency.p50_ms, snapshot.latency.p90_ms, snapshot.latency.p99_ms
            ),
        ),
    ];
    for (name, value) in rows {
        println!("{name:<26}{value:>18}");
    }
    println!("{:-<1$}", "", width);
}
