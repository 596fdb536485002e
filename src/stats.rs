// src/stats.rs

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Process-wide search counters, updated from many tasks at once.
///
/// `queryall` counts every node lookup, `chessdbq` the subset that actually
/// went out to CDB. The in-flight sums are sampled at the start of each
/// logical query, so dividing by `chessdbq` yields time-averaged in-flight
/// counts the way the periodic stats block reports them.
pub struct Counters {
    pub queryall: AtomicU64,
    pub chessdbq: AtomicU64,
    pub enqueued: AtomicU64,
    pub requeued: AtomicU64,
    pub unscored: AtomicU64,
    pub reprobed: AtomicU64,
    inflight_r: AtomicU64,
    inflight_q: AtomicU64,
    sum_inflight_r: AtomicU64,
    sum_inflight_q: AtomicU64,
    cdb_micros: AtomicU64,
    iter_level: AtomicU64,
    max_level: AtomicU64,
    start: Instant,
}

impl Counters {
    pub fn new() -> Self {
        Counters {
            queryall: AtomicU64::new(0),
            chessdbq: AtomicU64::new(0),
            enqueued: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            unscored: AtomicU64::new(0),
            reprobed: AtomicU64::new(0),
            inflight_r: AtomicU64::new(0),
            inflight_q: AtomicU64::new(0),
            sum_inflight_r: AtomicU64::new(0),
            sum_inflight_q: AtomicU64::new(0),
            cdb_micros: AtomicU64::new(0),
            iter_level: AtomicU64::new(0),
            max_level: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    /// One logical CDB query begins; samples both in-flight gauges.
    pub fn logical_begin(&self) {
        self.chessdbq.fetch_add(1, Ordering::Relaxed);
        let q = self.inflight_q.fetch_add(1, Ordering::Relaxed) + 1;
        self.sum_inflight_q.fetch_add(q, Ordering::Relaxed);
        let r = self.inflight_r.load(Ordering::Relaxed);
        self.sum_inflight_r.fetch_add(r, Ordering::Relaxed);
    }

    pub fn logical_end(&self, elapsed: Duration) {
        self.inflight_q.fetch_sub(1, Ordering::Relaxed);
        self.cdb_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn raw_begin(&self) {
        self.inflight_r.fetch_add(1, Ordering::Relaxed);
    }

    pub fn raw_end(&self) {
        self.inflight_r.fetch_sub(1, Ordering::Relaxed);
    }

    /// Records that the search visited a node `level` plies below the root.
    pub fn touch_level(&self, level: u64) {
        self.iter_level.fetch_max(level, Ordering::Relaxed);
        self.max_level.fetch_max(level, Ordering::Relaxed);
    }

    pub fn begin_iteration(&self) {
        self.iter_level.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self, depth: u32) -> CounterSnapshot {
        let queryall = self.queryall.load(Ordering::Relaxed);
        let chessdbq = self.chessdbq.load(Ordering::Relaxed);
        let denom = chessdbq.max(1);
        CounterSnapshot {
            queryall,
            chessdbq,
            enqueued: self.enqueued.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            unscored: self.unscored.load(Ordering::Relaxed),
            reprobed: self.reprobed.load(Ordering::Relaxed),
            bf: (queryall as f64).powf(1.0 / f64::from(depth.max(1))),
            inflight_q: self.sum_inflight_q.load(Ordering::Relaxed) as f64 / denom as f64,
            inflight_r: self.sum_inflight_r.load(Ordering::Relaxed) as f64 / denom as f64,
            cdb_time_ms: self.cdb_micros.load(Ordering::Relaxed) / 1000 / denom,
            level: self.iter_level.load(Ordering::Relaxed),
            max_level: self.max_level.load(Ordering::Relaxed),
            elapsed: self.start.elapsed(),
        }
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time copy of the counters, with the derived figures the
/// per-depth report needs already computed.
#[derive(Clone, Debug)]
pub struct CounterSnapshot {
    pub queryall: u64,
    pub chessdbq: u64,
    pub enqueued: u64,
    pub requeued: u64,
    pub unscored: u64,
    pub reprobed: u64,
    /// Effective branching factor, `queryall^(1/depth)`.
    pub bf: f64,
    pub inflight_q: f64,
    pub inflight_r: f64,
    /// Mean wall time per logical CDB query.
    pub cdb_time_ms: u64,
    pub level: u64,
    pub max_level: u64,
    pub elapsed: Duration,
}
