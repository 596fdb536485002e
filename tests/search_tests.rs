//! End-to-end engine tests against a stubbed CDB transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;

use cdbexplore::board::Board;
use cdbexplore::cache::PositionCache;
use cdbexplore::cdb::{CdbClient, Transport, TransportError};
use cdbexplore::report::{PvTag, Snapshot};
use cdbexplore::search::{Config, Explorer, SearchError};
use cdbexplore::stats::Counters;

/// Five scored replies for either side, so positions look fully analysed.
const BLACK_MOVES: &str = "move:e7e5,score:-30|move:c7c5,score:-35|move:d7d5,score:-40|move:g8f6,score:-45|move:b8c6,score:-50";
const WHITE_MOVES: &str = "move:e2e4,score:-30|move:d2d4,score:-35|move:g1f3,score:-40|move:b1c3,score:-45|move:a2a3,score:-50";

fn default_reply(action: &str, board: &str) -> String {
    match action {
        "queryall" => {
            if board.contains(" w ") {
                WHITE_MOVES.to_string()
            } else {
                BLACK_MOVES.to_string()
            }
        }
        _ => "ok".to_string(),
    }
}

type ReplyFn = Box<dyn Fn(&str, &str) -> String + Send + Sync>;

/// Canned CDB: answers from a closure, records every request, tracks how
/// many are in flight at once.
struct StubCdb {
    reply: ReplyFn,
    log: Mutex<Vec<(String, String)>>,
    delay: Duration,
    inflight: AtomicUsize,
    max_inflight: AtomicUsize,
}

impl StubCdb {
    fn new(reply: impl Fn(&str, &str) -> String + Send + Sync + 'static) -> Arc<Self> {
        Self::with_delay(reply, Duration::ZERO)
    }

    fn with_delay(
        reply: impl Fn(&str, &str) -> String + Send + Sync + 'static,
        delay: Duration,
    ) -> Arc<Self> {
        Arc::new(StubCdb {
            reply: Box::new(reply),
            log: Mutex::new(Vec::new()),
            delay,
            inflight: AtomicUsize::new(0),
            max_inflight: AtomicUsize::new(0),
        })
    }

    fn calls(&self, action: &str) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter(|(a, _)| a == action)
            .map(|(_, board)| board.clone())
            .collect()
    }
}

fn query_param(url: &str, key: &str) -> String {
    let query = url.split_once('?').map(|(_, q)| q).unwrap_or_default();
    let prefix = format!("{key}=");
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix(prefix.as_str()))
        .unwrap_or_default()
        .replace('+', " ")
}

impl Transport for StubCdb {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String, TransportError>> {
        async move {
            let action = query_param(url, "action");
            let board = query_param(url, "board");
            let now = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_inflight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.inflight.fetch_sub(1, Ordering::SeqCst);
            self.log.lock().push((action.clone(), board.clone()));
            Ok((self.reply)(&action, &board))
        }
        .boxed()
    }
}

fn root_after_g4() -> Board {
    Board::startpos().apply("g2g4").unwrap()
}

fn config(depth_limit: u32, eval_decay: i32) -> Config {
    Config {
        depth_limit: Some(depth_limit),
        eval_decay,
        suppress_errors: true,
        ..Config::default()
    }
}

async fn run_search(
    stub: &Arc<StubCdb>,
    config: Config,
    root: Board,
) -> (Vec<Snapshot>, Result<(), SearchError>) {
    let explorer = Arc::new(Explorer::with_transport(
        config,
        Arc::clone(stub) as Arc<dyn Transport>,
    ));
    let (mut snapshots, engine) = explorer.start(root);
    let mut collected = Vec::new();
    while let Some(snapshot) = snapshots.recv().await {
        collected.push(snapshot);
    }
    let result = engine.await.expect("engine task panicked");
    (collected, result)
}

#[tokio::test]
async fn pv_only_descent_fetches_root_and_best_child() {
    let stub = StubCdb::new(default_reply);
    let (snaps, result) = run_search(&stub, config(1, 0), root_after_g4()).await;
    result.unwrap();

    assert_eq!(snaps.len(), 1);
    let snap = &snaps[0];
    // the best child's deeper leaf evaluation supersedes the cache score
    assert_eq!(snap.score, Some(30));
    assert_eq!(snap.pv, vec!["e7e5".to_string()]);
    assert_eq!(snap.counters.chessdbq, 2, "root reprobe + best child");
    assert_eq!(snap.counters.queryall, 2);
    assert_eq!(snap.counters.enqueued, 0);
    assert_eq!(snap.counters.requeued, 0);
    assert!(snap.url.ends_with("_moves_e7e5"));
}

#[tokio::test]
async fn width_gate_is_monotone_in_eval_decay() {
    let mut visited = Vec::new();
    for decay in [0, 5, 50] {
        let stub = StubCdb::new(default_reply);
        let (snaps, result) = run_search(&stub, config(2, decay), root_after_g4()).await;
        result.unwrap();
        visited.push(snaps.last().unwrap().counters.queryall);
    }
    assert!(visited[0] <= visited[1] && visited[1] <= visited[2]);
    assert!(visited[0] < visited[2], "a wider gate must visit more nodes");
}

#[tokio::test]
async fn unknown_position_is_enqueued_once_then_scored() {
    let child_epd = root_after_g4().apply("e7e5").unwrap().epd();
    let queued = Arc::new(AtomicBool::new(false));
    let stub = StubCdb::new({
        let child_epd = child_epd.clone();
        let queued = Arc::clone(&queued);
        move |action, board| {
            if board != child_epd {
                return default_reply(action, board);
            }
            match action {
                "queryall" if queued.load(Ordering::SeqCst) => WHITE_MOVES.to_string(),
                "queryall" => "unknown".to_string(),
                "queue" => {
                    queued.store(true, Ordering::SeqCst);
                    "ok".to_string()
                }
                "queryscore" if queued.load(Ordering::SeqCst) => "eval:20".to_string(),
                _ => "unknown".to_string(),
            }
        }
    });

    let (snaps, result) = run_search(&stub, config(2, 0), root_after_g4()).await;
    result.unwrap();
    assert_eq!(snaps.len(), 2);

    // first pass: the unknown child is enqueued and its cache score stands in
    assert_eq!(snaps[0].score, Some(-30));
    assert_eq!(snaps[0].counters.enqueued, 1);

    // second pass: the PV reprobe rechecks via queryscore, then refetches
    assert_eq!(snaps[1].score, Some(-30));
    assert_eq!(snaps[1].pv, vec!["e7e5".to_string(), "e2e4".to_string()]);
    assert_eq!(snaps[1].counters.enqueued, 1, "enqueued exactly once");
    assert!(snaps[1].counters.reprobed >= 1);
    assert_eq!(stub.calls("queryscore"), vec![child_epd.clone()]);
    let queue_calls = stub.calls("queue");
    assert_eq!(
        queue_calls.iter().filter(|b| **b == child_epd).count(),
        1,
        "exactly one queue for the unknown position"
    );
}

#[tokio::test]
async fn cursed_scores_clip_to_draws_unless_enabled() {
    fn reply(root_epd: &str, child_epd: &str, action: &str, board: &str) -> String {
        if action != "queryall" {
            return "ok".to_string();
        }
        if board == root_epd {
            "move:e7e5,score:22000|move:c7c5,score:-50".to_string()
        } else if board == child_epd {
            "move:e2e4,score:-22000".to_string()
        } else {
            default_reply(action, board)
        }
    }

    let root = root_after_g4();
    let root_epd = root.epd();
    let child_epd = root.apply("e7e5").unwrap().epd();

    let stub = StubCdb::new({
        let (r, c) = (root_epd.clone(), child_epd.clone());
        move |action, board| reply(&r, &c, action, board)
    });
    let (snaps, result) = run_search(&stub, config(1, 0), root.clone()).await;
    result.unwrap();
    assert_eq!(snaps[0].score, Some(0), "cursed win is a draw by default");

    let stub = StubCdb::new({
        let (r, c) = (root_epd.clone(), child_epd.clone());
        move |action, board| reply(&r, &c, action, board)
    });
    let mut cfg = config(1, 0);
    cfg.cursed_wins = true;
    let (snaps, result) = run_search(&stub, cfg, root).await;
    result.unwrap();
    assert_eq!(snaps[0].score, Some(22000), "cursed win counts when enabled");
}

#[tokio::test]
async fn sparse_known_position_is_requeued_not_enqueued() {
    let root_epd = root_after_g4().epd();
    let stub = StubCdb::new({
        let root_epd = root_epd.clone();
        move |action, board| {
            if action == "queryall" && board == root_epd {
                // 3 scored moves out of ~20 legal
                "move:e7e5,score:10|move:c7c5,score:5|move:d7d5,score:0".to_string()
            } else {
                default_reply(action, board)
            }
        }
    });

    let (snaps, result) = run_search(&stub, config(1, 0), root_after_g4()).await;
    result.unwrap();
    let snap = &snaps[0];
    assert_eq!(snap.counters.requeued, 1);
    assert_eq!(snap.counters.enqueued, 0);
    // the queue request runs on its own task; let it drain
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(stub.calls("queue"), vec![root_epd]);
}

#[tokio::test]
async fn concurrent_requests_stay_within_the_semaphore() {
    let stub = StubCdb::with_delay(default_reply, Duration::from_millis(15));
    let mut cfg = config(2, 100);
    cfg.concurrency = 4;
    let (_, result) = run_search(&stub, cfg, root_after_g4()).await;
    result.unwrap();

    let peak = stub.max_inflight.load(Ordering::SeqCst);
    assert!(peak <= 4, "in-flight requests exceeded the permit count: {peak}");
    assert!(peak >= 2, "siblings should have overlapped: {peak}");
}

#[tokio::test]
async fn identical_fingerprints_share_one_fetch() {
    let stub = StubCdb::with_delay(default_reply, Duration::from_millis(10));
    let counters = Arc::new(Counters::new());
    let client = Arc::new(CdbClient::new(
        Arc::clone(&stub) as Arc<dyn Transport>,
        16,
        false,
        true,
        Arc::clone(&counters),
    ));
    let cache = Arc::new(PositionCache::new(client, Arc::clone(&counters)));

    let epd = root_after_g4().epd();
    let mut lookups = Vec::new();
    for _ in 0..32 {
        let cache = Arc::clone(&cache);
        let epd = epd.clone();
        lookups.push(tokio::spawn(async move { cache.lookup(&epd, false).await }));
    }
    for lookup in lookups {
        assert!(lookup.await.unwrap().known());
    }

    assert_eq!(stub.calls("queryall").len(), 1, "one request per fingerprint");
    assert_eq!(counters.chessdbq.load(Ordering::Relaxed), 1);
    assert_eq!(counters.queryall.load(Ordering::Relaxed), 32);
}

#[tokio::test]
async fn invalid_root_aborts_the_search() {
    let root_epd = root_after_g4().epd();
    let stub = StubCdb::new({
        move |action, board| {
            if action == "queryall" && board == root_epd {
                "invalid board".to_string()
            } else {
                default_reply(action, board)
            }
        }
    });

    let (snaps, result) = run_search(&stub, config(3, 0), root_after_g4()).await;
    assert!(snaps.is_empty());
    assert!(matches!(result, Err(SearchError::InvalidPosition)));
}

#[tokio::test]
async fn mate_is_proven_and_rendered_upper_case() {
    let root = Board::from_epd("6k1/5ppp/8/8/8/8/8/4Q2K w - -", false).unwrap();
    let root_epd = root.epd();
    let stub = StubCdb::new({
        move |action, board| {
            if action == "queryall" && board == root_epd {
                "move:e1e8,score:29999|move:e1e2,score:10".to_string()
            } else {
                default_reply(action, board)
            }
        }
    });

    let mut cfg = config(3, 0);
    cfg.prove_mates = true;
    let (snaps, result) = run_search(&stub, cfg, root).await;
    result.unwrap();

    assert_eq!(snaps.len(), 1, "a proven mate stops the deepening loop");
    let snap = &snaps[0];
    assert_eq!(snap.score, Some(29_999));
    assert_eq!(snap.pv, vec!["e1e8".to_string()]);
    assert_eq!(snap.tag, Some(PvTag::MateProven));
    assert!(snap.to_string().contains("CHECKMATE (#1)"));
}

/// The ten-ply mate: every CDB reply for the full defence tree comes from
/// the canned fixture, so the proof pass has to walk multi-ply mate-score
/// propagation end to end instead of reading the answer off the root.
#[tokio::test]
async fn ten_ply_mate_is_proven_with_exact_distance() {
    let table: HashMap<String, String> = include_str!("data/mate_proof.tsv")
        .lines()
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            let (epd, body) = line.split_once('\t').expect("malformed fixture line");
            (epd.to_string(), body.to_string())
        })
        .collect();

    let root = Board::from_epd(
        "3r4/3N2kr/1p6/pBpn1p2/Q2PR1p1/P7/1P4P1/2q3K1 w - -",
        false,
    )
    .unwrap();
    let stub = StubCdb::new(move |action, board| {
        if action == "queryall" {
            // anything outside the proof tree would come back unknown and
            // visibly break the proof
            table
                .get(board)
                .cloned()
                .unwrap_or_else(|| "unknown".to_string())
        } else {
            "ok".to_string()
        }
    });

    let mut cfg = config(1, 0);
    cfg.prove_mates = true;
    let (snaps, result) = run_search(&stub, cfg, root).await;
    result.unwrap();

    assert_eq!(snaps.len(), 1);
    let snap = &snaps[0];
    assert_eq!(snap.score, Some(-29_990));
    assert_eq!(snap.pv.len(), 10, "PV: {}", snap.pv_line());
    assert_eq!(snap.tag, Some(PvTag::MateProven));
    assert!(snap.pv_line().ends_with("CHECKMATE (#-5)"));
    assert_eq!(snap.counters.enqueued, 0, "the whole tree is known");
}

#[tokio::test]
async fn rerunning_the_same_root_is_idempotent() {
    let mut outcomes = Vec::new();
    for _ in 0..2 {
        let stub = StubCdb::new(default_reply);
        let (snaps, result) = run_search(&stub, config(2, 5), root_after_g4()).await;
        result.unwrap();
        let last = snaps.last().unwrap();
        outcomes.push((last.score, last.pv.clone()));
    }
    assert_eq!(outcomes[0], outcomes[1]);
}
