// src/search.rs
//
// Iterative-deepening minimax over the CDB move lists, with a decay-based
// width gate. Sibling subtrees run as independent tasks; the CDB semaphore
// is the only brake on how fast the frontier can grow.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::board::{Board, Terminal};
use crate::cache::PositionCache;
use crate::cdb::{self, CdbClient, HttpTransport, QueryStatus, Transport, TransportError};
use crate::report::{self, PvTag, Snapshot};
use crate::stats::Counters;

#[derive(Clone, Debug)]
pub struct Config {
    /// Stop after this iteration; `None` keeps deepening forever.
    pub depth_limit: Option<u32>,
    /// Do not start a new iteration past this wall-clock budget.
    pub time_limit: Option<Duration>,
    /// Permits on the CDB semaphore.
    pub concurrency: usize,
    /// Centipawns of eval deficit per depth of pruning; 0 searches PV only.
    pub eval_decay: i32,
    pub cursed_wins: bool,
    /// Expand tablebase-scored positions instead of treating them as leaves.
    pub tb_search: bool,
    pub prove_mates: bool,
    pub chess960: bool,
    /// Added to the user-agent header.
    pub user: Option<String>,
    pub suppress_errors: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            depth_limit: None,
            time_limit: None,
            concurrency: 16,
            eval_decay: 2,
            cursed_wins: false,
            tb_search: false,
            prove_mates: false,
            chess960: false,
            user: None,
            suppress_errors: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("cdb reports the root position as invalid")]
    InvalidPosition,
    #[error("failed to set up the http client: {0}")]
    Client(#[from] TransportError),
}

/// What one node contributed this pass. `Unknown` nodes stay in the tree
/// and are retried on the next iteration once CDB has caught up.
#[derive(Clone, Copy, Debug)]
enum NodeEval {
    Score { score: i32, pv_len: u32 },
    Unknown,
    Invalid,
}

/// Remaining depth for a child move. Moves arrive sorted by score, so the
/// first negative result terminates the scan. With `decay == 0` only the
/// top move survives the gate.
fn child_depth(depth: i32, best: i32, score: i32, decay: i32, is_top: bool) -> i32 {
    if decay == 0 {
        return if is_top { depth - 1 } else { -1 };
    }
    depth - 1 - (best - score) / decay
}

pub struct Explorer {
    config: Config,
    client: Arc<CdbClient>,
    cache: Arc<PositionCache>,
    counters: Arc<Counters>,
    /// Best move found per fingerprint; the PV is rebuilt from this after
    /// each iteration settles.
    pv_hints: DashMap<String, String>,
    /// Positions on the previously reported PV, each forced to re-fetch
    /// once during the next iteration.
    reprobe_set: Mutex<HashSet<String>>,
}

impl Explorer {
    pub fn new(config: Config) -> Result<Self, SearchError> {
        let agent = cdb::user_agent(config.user.as_deref());
        let transport = Arc::new(HttpTransport::new(&agent)?);
        Ok(Self::with_transport(config, transport))
    }

    /// Wires the engine to an arbitrary transport; this is how the tests
    /// substitute a stubbed CDB.
    pub fn with_transport(mut config: Config, transport: Arc<dyn Transport>) -> Self {
        config.concurrency = config.concurrency.max(1);
        config.eval_decay = config.eval_decay.max(0);
        let counters = Arc::new(Counters::new());
        let client = Arc::new(CdbClient::new(
            transport,
            config.concurrency,
            config.chess960,
            config.suppress_errors,
            Arc::clone(&counters),
        ));
        let cache = Arc::new(PositionCache::new(
            Arc::clone(&client),
            Arc::clone(&counters),
        ));
        Explorer {
            config,
            client,
            cache,
            counters,
            pv_hints: DashMap::new(),
            reprobe_set: Mutex::new(HashSet::new()),
        }
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Runs the iterative deepening loop on its own task and returns the
    /// stream of per-depth snapshots.
    pub fn start(
        self: &Arc<Self>,
        root: Board,
    ) -> (mpsc::Receiver<Snapshot>, JoinHandle<Result<(), SearchError>>) {
        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(Arc::clone(self).run(root, tx));
        (rx, handle)
    }

    async fn run(
        self: Arc<Self>,
        root: Board,
        tx: mpsc::Sender<Snapshot>,
    ) -> Result<(), SearchError> {
        let root_epd = root.epd();
        let started = Instant::now();
        let mut depth: u32 = 1;
        loop {
            if let Some(limit) = self.config.depth_limit {
                if depth > limit {
                    break;
                }
            }
            if let Some(limit) = self.config.time_limit {
                if started.elapsed() >= limit {
                    break;
                }
            }

            self.counters.begin_iteration();
            let eval = Arc::clone(&self)
                .search_node(root.clone(), depth as i32, 0)
                .await;

            let (score, pv, tag) = match eval {
                NodeEval::Invalid => return Err(SearchError::InvalidPosition),
                NodeEval::Unknown => (None, Vec::new(), None),
                NodeEval::Score { score, .. } => {
                    let (mut pv, mut end) = self.reconstruct_pv(&root);
                    let mut proven = false;
                    if cdb::is_mate_score(score) && self.config.prove_mates && !pv.is_empty() {
                        let plies = cdb::mate_distance(score);
                        proven = Arc::clone(&self)
                            .prove_node(root.clone(), plies, score > 0)
                            .await;
                        // the proof's lookups extend the cached mate line
                        (pv, end) = self.reconstruct_pv(&root);
                    }
                    let tag = if proven {
                        Some(PvTag::MateProven)
                    } else if cdb::is_mate_score(score)
                        || end.is_terminal() == Some(Terminal::Checkmate)
                    {
                        Some(PvTag::Mate)
                    } else if end.is_terminal().is_some() {
                        Some(PvTag::Draw)
                    } else {
                        None
                    };
                    (Some(score), pv, tag)
                }
            };

            self.schedule_reprobe(&root, &pv);
            let snapshot = Snapshot {
                epd: root_epd.clone(),
                depth,
                score,
                url: report::cdb_url(&root_epd, &pv),
                pv,
                tag,
                counters: self.counters.snapshot(depth),
            };
            let proven = snapshot.tag == Some(PvTag::MateProven);
            let exhausted = snapshot.score.is_some() && snapshot.pv.is_empty();
            if tx.send(snapshot).await.is_err() {
                break; // consumer went away
            }
            if proven || exhausted {
                break;
            }
            depth += 1;
        }
        Ok(())
    }

    /// Minimax body for one node. Scores are from the side to move; each
    /// explored child is negated on the way up, and a deeper result
    /// supersedes the cache score of the move that produced it.
    fn search_node(
        self: Arc<Self>,
        board: Board,
        depth: i32,
        level: u64,
    ) -> BoxFuture<'static, NodeEval> {
        async move {
            self.counters.touch_level(level);

            if let Some(terminal) = board.is_terminal() {
                let score = match terminal {
                    Terminal::Checkmate => -cdb::CDB_MATE,
                    Terminal::Stalemate | Terminal::Draw => 0,
                };
                return NodeEval::Score { score, pv_len: 0 };
            }

            let epd = board.epd();
            // the root entry is reprobed at the start of every iteration
            let reprobe = level == 0 || self.take_reprobe(&epd);
            let result = self.cache.lookup(&epd, reprobe).await;
            match result.status {
                QueryStatus::InvalidBoard => return NodeEval::Invalid,
                QueryStatus::Unknown | QueryStatus::Unavailable => return NodeEval::Unknown,
                QueryStatus::Checkmate => {
                    return NodeEval::Score {
                        score: -cdb::CDB_MATE,
                        pv_len: 0,
                    }
                }
                QueryStatus::Stalemate => return NodeEval::Score { score: 0, pv_len: 0 },
                QueryStatus::NoBestMove => {
                    // known position without a usable move list: ask cdb to
                    // work on it and skip the node this pass
                    if !board.legal_moves().is_empty() && self.cache.mark_requeued(&epd) {
                        self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                        self.spawn_queue(epd);
                    }
                    return NodeEval::Unknown;
                }
                QueryStatus::Ok => {}
            }
            if result.moves.is_empty() {
                return NodeEval::Unknown;
            }

            let legal_count = board.legal_moves().len();
            if !result.is_complete(legal_count) && self.cache.mark_requeued(&epd) {
                self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                self.spawn_queue(epd.clone());
            }

            // cursed clipping can disturb cdb's ordering, so restore it
            let mut scored: Vec<(String, i32)> = result
                .moves
                .iter()
                .map(|m| {
                    (
                        m.uci.clone(),
                        cdb::clip_cursed(m.score, self.config.cursed_wins),
                    )
                })
                .collect();
            scored.sort_by(|a, b| b.1.cmp(&a.1));
            let cache_best = scored[0].1;

            // tablebase positions are exact; leave them as leaves unless
            // the configuration asks to search into them
            if result.tb_hit && !self.config.tb_search {
                return NodeEval::Score {
                    score: cache_best,
                    pv_len: 0,
                };
            }

            if depth <= 0 {
                return NodeEval::Score {
                    score: cache_best,
                    pv_len: 0,
                };
            }

            // gates are computed from the cache's view; qualifying children
            // run concurrently and settle in any order
            let mut tasks: Vec<(String, i32, JoinHandle<NodeEval>)> = Vec::new();
            let mut candidates: Vec<(String, i32, u32)> = Vec::new();
            for (i, (uci, score)) in scored.iter().enumerate() {
                let r_child = child_depth(depth, cache_best, *score, self.config.eval_decay, i == 0);
                if r_child < 0 {
                    // sorted by score: this move and all after it fail the gate
                    for (uci, score) in &scored[i..] {
                        candidates.push((uci.clone(), *score, 1));
                    }
                    break;
                }
                match board.apply(uci) {
                    Ok(child) => {
                        let task = tokio::spawn(Arc::clone(&self).search_node(
                            child,
                            r_child,
                            level + 1,
                        ));
                        tasks.push((uci.clone(), *score, task));
                    }
                    // cdb offered a move the board rejects; drop it
                    Err(_) => {}
                }
            }

            for (uci, cache_score, task) in tasks {
                match task.await {
                    Ok(NodeEval::Score { score, pv_len }) => {
                        candidates.push((uci, cdb::age_mate(-score), pv_len + 1));
                    }
                    // no information this pass; fall back to the cache score
                    Ok(NodeEval::Unknown) => candidates.push((uci, cache_score, 1)),
                    Ok(NodeEval::Invalid) => {}
                    Err(err) => {
                        warn!(%err, "search task failed");
                        candidates.push((uci, cache_score, 1));
                    }
                }
            }

            if candidates.is_empty() {
                return NodeEval::Unknown;
            }
            let mut best = &candidates[0];
            for c in &candidates[1..] {
                // on equal scores prefer the longer line
                if c.1 > best.1 || (c.1 == best.1 && c.2 > best.2) {
                    best = c;
                }
            }
            self.pv_hints.insert(epd, best.0.clone());
            NodeEval::Score {
                score: best.1,
                pv_len: best.2,
            }
        }
        .boxed()
    }

    /// Verifies a claimed mate: the attacker follows its best move, the
    /// defender must lose with every legal reply. An unscored or unknown
    /// defender reply leaves the mate unproven for this iteration, with the
    /// missing positions pushed towards CDB.
    fn prove_node(
        self: Arc<Self>,
        board: Board,
        plies: i32,
        attacker: bool,
    ) -> BoxFuture<'static, bool> {
        async move {
            match board.is_terminal() {
                Some(Terminal::Checkmate) => return true,
                Some(_) => return false,
                None => {}
            }
            if plies <= 0 {
                return false;
            }
            let epd = board.epd();
            let result = self.cache.lookup(&epd, false).await;
            if result.status != QueryStatus::Ok || result.moves.is_empty() {
                // an unknown position was enqueued by the lookup itself
                return false;
            }

            if attacker {
                let mut best: Option<(&str, i32)> = None;
                for m in &result.moves {
                    let score = cdb::clip_cursed(m.score, self.config.cursed_wins);
                    if best.map_or(true, |(_, s)| score > s) {
                        best = Some((&m.uci, score));
                    }
                }
                let Some((uci, score)) = best else {
                    return false;
                };
                if !cdb::is_mate_score(score) || score <= 0 {
                    return false;
                }
                return match board.apply(uci) {
                    Ok(child) => self.prove_node(child, plies - 1, false).await,
                    Err(_) => false,
                };
            }

            let legal = board.legal_moves();
            if result.moves.len() < legal.len() {
                // help cdb complete the defence before claiming a proof
                for mv in &legal {
                    if result.moves.iter().any(|m| &m.uci == mv) {
                        continue;
                    }
                    if let Ok(child) = board.apply(mv) {
                        self.counters.unscored.fetch_add(1, Ordering::Relaxed);
                        let cache = Arc::clone(&self.cache);
                        tokio::spawn(async move {
                            cache.lookup(&child.epd(), false).await;
                        });
                    }
                }
                return false;
            }
            let mut proofs = Vec::new();
            for mv in &legal {
                match board.apply(mv) {
                    Ok(child) => {
                        proofs.push(tokio::spawn(Arc::clone(&self).prove_node(
                            child,
                            plies - 1,
                            true,
                        )));
                    }
                    Err(_) => return false,
                }
            }
            for proof in proofs {
                if !proof.await.unwrap_or(false) {
                    return false;
                }
            }
            true
        }
        .boxed()
    }

    /// Follows the hints written during the last pass; once they run out a
    /// mate line may continue through cached replies, since mate distances
    /// are exact.
    fn reconstruct_pv(&self, root: &Board) -> (Vec<String>, Board) {
        let mut pv = Vec::new();
        let mut board = root.clone();
        let mut visited = HashSet::new();
        loop {
            if board.is_terminal().is_some() {
                break;
            }
            let epd = board.epd();
            if !visited.insert(epd.clone()) {
                break; // transposition cycle
            }
            let hint = self.pv_hints.get(&epd).map(|h| h.value().clone());
            let next = match hint {
                Some(mv) => Some(mv),
                None => self.mate_continuation(&epd),
            };
            let Some(mv) = next else { break };
            match board.apply(&mv) {
                Ok(after) => {
                    pv.push(mv);
                    board = after;
                }
                Err(_) => break,
            }
        }
        (pv, board)
    }

    fn mate_continuation(&self, epd: &str) -> Option<String> {
        let result = self.cache.peek(epd)?;
        if result.status != QueryStatus::Ok {
            return None;
        }
        let mut best: Option<(&str, i32)> = None;
        for m in &result.moves {
            let score = cdb::clip_cursed(m.score, self.config.cursed_wins);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((&m.uci, score));
            }
        }
        let (uci, score) = best?;
        if cdb::is_mate_score(score) {
            Some(uci.to_string())
        } else {
            None
        }
    }

    fn schedule_reprobe(&self, root: &Board, pv: &[String]) {
        let mut set = HashSet::new();
        let mut board = root.clone();
        set.insert(board.epd());
        for mv in pv {
            match board.apply(mv) {
                Ok(after) => {
                    board = after;
                    set.insert(board.epd());
                }
                Err(_) => break,
            }
        }
        *self.reprobe_set.lock() = set;
    }

    fn take_reprobe(&self, epd: &str) -> bool {
        self.reprobe_set.lock().remove(epd)
    }

    fn spawn_queue(&self, epd: String) {
        let client = Arc::clone(&self.client);
        tokio::spawn(async move {
            client.queue(&epd).await;
        });
    }
}
