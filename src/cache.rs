// src/cache.rs

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::RwLock;

use crate::cdb::{CdbClient, QueryResult, QueryStatus};
use crate::stats::Counters;

/// One shared query handle. The slot is fetched under the entry's write
/// lock, so any number of concurrent lookups for the same fingerprint share
/// a single CDB request: the first one fetches, the rest block on the lock
/// and then read the stored result.
struct CacheEntry {
    slot: RwLock<Option<QueryResult>>,
    fetched: Mutex<Option<Instant>>,
    reprobes: AtomicU32,
    requeued: AtomicBool,
}

impl CacheEntry {
    fn new() -> Self {
        CacheEntry {
            slot: RwLock::new(None),
            fetched: Mutex::new(None),
            reprobes: AtomicU32::new(0),
            requeued: AtomicBool::new(false),
        }
    }
}

/// Process-wide map from position fingerprint to shared query handle.
/// No eviction during a run; a wide search revisits transpositions far too
/// often to throw results away.
pub struct PositionCache {
    map: DashMap<String, Arc<CacheEntry>>,
    client: Arc<CdbClient>,
    counters: Arc<Counters>,
}

impl PositionCache {
    pub fn new(client: Arc<CdbClient>, counters: Arc<Counters>) -> Self {
        PositionCache {
            map: DashMap::new(),
            client,
            counters,
        }
    }

    /// Returns the move list for `epd`, fetching from CDB on a miss.
    ///
    /// `reprobe` forces a fresh queryall even for a resolved entry; the
    /// engine sets it for positions on the principal variation, which are
    /// the nodes most worth pushing CDB to extend. A reprobe of an entry
    /// that is still `unknown` first asks `queryscore` whether CDB has
    /// processed the enqueue, and keeps the stale entry if not.
    pub async fn lookup(&self, epd: &str, reprobe: bool) -> QueryResult {
        self.counters.queryall.fetch_add(1, Ordering::Relaxed);
        let entry = self
            .map
            .entry(epd.to_string())
            .or_insert_with(|| Arc::new(CacheEntry::new()))
            .clone();

        if !reprobe {
            if let Some(result) = entry.slot.read().await.as_ref() {
                return result.clone();
            }
        }

        let mut slot = entry.slot.write().await;
        if !reprobe {
            // somebody else fetched while we waited for the lock
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
        }

        let previous = (*slot).clone();
        if let Some(prev) = &previous {
            if prev.status == QueryStatus::Unknown
                && self.client.queryscore(epd).await.is_none()
            {
                // still not processed; no point in a full queryall yet
                return prev.clone();
            }
            self.counters.reprobed.fetch_add(1, Ordering::Relaxed);
            entry.reprobes.fetch_add(1, Ordering::Relaxed);
        }

        let fresh = self.client.queryall(epd).await;
        if fresh.status == QueryStatus::Unavailable {
            if let Some(prev) = &previous {
                // a failed refresh must not clobber usable data
                return prev.clone();
            }
        }
        if let Some(prev) = &previous {
            if prev.status == QueryStatus::Ok {
                let gained = newly_scored(prev, &fresh);
                if gained > 0 {
                    self.counters.unscored.fetch_add(gained, Ordering::Relaxed);
                }
            }
        }
        *slot = Some(fresh.clone());
        *entry.fetched.lock() = Some(Instant::now());
        fresh
    }

    /// Non-blocking view of a resolved entry; `None` while a fetch is in
    /// flight or the position was never looked up.
    pub fn peek(&self, epd: &str) -> Option<QueryResult> {
        let entry = self.map.get(epd)?.clone();
        let slot = entry.slot.try_read().ok()?;
        slot.clone()
    }

    /// Marks `epd` as requeued; true only for the first caller, so an
    /// under-populated position is queued at most once per run.
    pub fn mark_requeued(&self, epd: &str) -> bool {
        self.map
            .get(epd)
            .map(|e| !e.requeued.swap(true, Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Moves scored in `new` that had no score in `old`.
fn newly_scored(old: &QueryResult, new: &QueryResult) -> u64 {
    new.moves
        .iter()
        .filter(|m| !old.moves.iter().any(|o| o.uci == m.uci))
        .count() as u64
}
