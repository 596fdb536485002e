// src/cdb.rs
//
// Client for the chessdb.cn HTTP API. All traffic funnels through one
// counting semaphore, so `concurrency` bounds logical queries rather than
// raw sockets: a queryall that has to queue an unknown position keeps its
// permit for the whole compound interaction.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use rand::Rng;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::stats::Counters;

pub const CDB_API: &str = "https://chessdb.cn/cdb.php";

// Score conventions on chessdb.cn. Mate scores encode the distance to mate
// as `CDB_MATE - plies`; the band between CDB_CURSED and the mate band holds
// tablebase wins and cursed wins (drawn under the 50-move rule).
pub const CDB_MATE: i32 = 30_000;
pub const MATE_BAND: i32 = 500;
pub const CDB_CURSED: i32 = 20_000;
/// Minimum number of scored moves for CDB to consider a position analysed.
pub const CDB_SIEVED: usize = 5;

const MAX_ATTEMPTS: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(30);

pub fn is_mate_score(score: i32) -> bool {
    score.abs() >= CDB_MATE - MATE_BAND
}

/// Distance to mate in plies encoded by a mate-band score.
pub fn mate_distance(score: i32) -> i32 {
    CDB_MATE - score.abs()
}

/// Mate scores lose one ply of distance each time they travel up the tree,
/// keeping local evaluations in sync with the distances CDB reports.
pub fn age_mate(score: i32) -> i32 {
    if is_mate_score(score) {
        score - score.signum()
    } else {
        score
    }
}

/// Cursed wins and losses count as decided only when `cursed_wins` is set;
/// otherwise they are draws under the 50-move rule and clip to 0.
pub fn clip_cursed(score: i32, cursed_wins: bool) -> i32 {
    if !cursed_wins && !is_mate_score(score) && score.abs() > CDB_CURSED {
        0
    } else {
        score
    }
}

pub fn user_agent(user: Option<&str>) -> String {
    match user {
        Some(u) => format!("cdbexplore/{} (user={})", env!("CARGO_PKG_VERSION"), u),
        None => format!("cdbexplore/{}", env!("CARGO_PKG_VERSION")),
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("http status {0}")]
    Status(u16),
    #[error("empty body")]
    EmptyBody,
}

/// The wire seam. Production uses `HttpTransport`; tests substitute a stub
/// that replays canned CDB replies.
pub trait Transport: Send + Sync + 'static {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String, TransportError>>;
}

pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(HttpTransport { http })
    }
}

impl Transport for HttpTransport {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String, TransportError>> {
        async move {
            let response = self.http.get(url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(TransportError::Status(status.as_u16()));
            }
            let body = response.text().await?;
            if body.trim().is_empty() {
                return Err(TransportError::EmptyBody);
            }
            Ok(body)
        }
        .boxed()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStatus {
    /// CDB returned a scored move list.
    Ok,
    /// CDB does not know the position; a queue request has been issued.
    Unknown,
    Checkmate,
    Stalemate,
    /// Known position without a usable move list.
    NoBestMove,
    InvalidBoard,
    /// No usable reply within the retry budget; retried on a later pass.
    Unavailable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScoredMove {
    pub uci: String,
    /// Centipawns from the side to move, in CDB's extended range.
    pub score: i32,
}

/// One position's answer from CDB, in CDB's own move ordering (best first).
#[derive(Clone, Debug)]
pub struct QueryResult {
    pub status: QueryStatus,
    pub moves: Vec<ScoredMove>,
    pub tb_hit: bool,
    /// CDB's internal depth estimate; informational only.
    pub ply: Option<u32>,
}

impl QueryResult {
    pub fn with_status(status: QueryStatus) -> Self {
        QueryResult {
            status,
            moves: Vec::new(),
            tb_hit: false,
            ply: None,
        }
    }

    /// Whether CDB had the position at all.
    pub fn known(&self) -> bool {
        !matches!(self.status, QueryStatus::Unknown | QueryStatus::Unavailable)
    }

    /// A move list counts as complete once CDB scored at least five moves or
    /// the position has fewer legal moves than that.
    pub fn is_complete(&self, legal_moves: usize) -> bool {
        self.moves.len() >= CDB_SIEVED || self.moves.len() >= legal_moves
    }
}

pub(crate) enum Reply {
    Result(QueryResult),
    Unknown,
    Busy,
    Malformed,
}

/// Parses a queryall body: either a status word or `move:<uci>,score:<int>`
/// records separated by `|`, an optional `egtb` prefix, and an optional
/// trailing `ply:<int>` line.
pub(crate) fn parse_queryall(body: &str) -> Reply {
    let text = body.trim();
    if text.is_empty() {
        return Reply::Malformed;
    }
    if text.starts_with("unknown") {
        return Reply::Unknown;
    }
    if text.starts_with("checkmate") {
        return Reply::Result(QueryResult::with_status(QueryStatus::Checkmate));
    }
    if text.starts_with("stalemate") {
        return Reply::Result(QueryResult::with_status(QueryStatus::Stalemate));
    }
    if text.starts_with("nobestmove") {
        return Reply::Result(QueryResult::with_status(QueryStatus::NoBestMove));
    }
    if text.starts_with("invalid board") {
        return Reply::Result(QueryResult::with_status(QueryStatus::InvalidBoard));
    }
    if text.contains("rate limit") || text.contains("busy") {
        return Reply::Busy;
    }

    let mut lines = text.lines();
    let mut first = lines.next().unwrap_or_default().trim();
    let tb_hit = if let Some(rest) = first.strip_prefix("egtb") {
        first = rest.trim_start_matches('|').trim();
        true
    } else {
        false
    };

    let mut moves = Vec::new();
    for record in first.split('|') {
        let mut uci = None;
        let mut score = None;
        for field in record.split(',') {
            let field = field.trim();
            if let Some(v) = field.strip_prefix("move:") {
                uci = Some(v.to_string());
            } else if let Some(v) = field.strip_prefix("score:") {
                score = v.parse::<i32>().ok();
            }
            // rank, winrate and friends are ignored
        }
        match (uci, score) {
            (Some(uci), Some(score)) if !uci.is_empty() => moves.push(ScoredMove { uci, score }),
            // partial move information means the whole reply is suspect
            _ => return Reply::Malformed,
        }
    }
    if moves.is_empty() {
        return Reply::Malformed;
    }

    let ply = lines
        .find_map(|l| l.trim().strip_prefix("ply:"))
        .and_then(|v| v.trim().parse::<u32>().ok());

    Reply::Result(QueryResult {
        status: QueryStatus::Ok,
        moves,
        tb_hit,
        ply,
    })
}

enum ScoreReply {
    Known(i32),
    Unknown,
    Busy,
}

fn parse_queryscore(body: &str) -> ScoreReply {
    let text = body.trim();
    if let Some(v) = text.strip_prefix("eval:") {
        if let Ok(score) = v.trim().parse::<i32>() {
            return ScoreReply::Known(score);
        }
    }
    if text.contains("rate limit") || text.contains("busy") {
        return ScoreReply::Busy;
    }
    ScoreReply::Unknown
}

pub struct CdbClient {
    transport: Arc<dyn Transport>,
    gate: Semaphore,
    chess960: bool,
    suppress_errors: bool,
    counters: Arc<Counters>,
}

impl CdbClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        concurrency: usize,
        chess960: bool,
        suppress_errors: bool,
        counters: Arc<Counters>,
    ) -> Self {
        CdbClient {
            transport,
            gate: Semaphore::new(concurrency.max(1)),
            chess960,
            suppress_errors,
            counters,
        }
    }

    /// Asks CDB for the scored move list at `epd`. An `unknown` reply makes
    /// the client queue the position for analysis and report `Unknown`;
    /// transport trouble is retried with backoff and eventually degrades to
    /// `Unavailable`. Never fails the caller.
    pub async fn queryall(&self, epd: &str) -> QueryResult {
        let Ok(_permit) = self.gate.acquire().await else {
            return QueryResult::with_status(QueryStatus::Unavailable);
        };
        self.counters.logical_begin();
        let started = Instant::now();
        let result = self.queryall_gated(epd).await;
        self.counters.logical_end(started.elapsed());
        result
    }

    async fn queryall_gated(&self, epd: &str) -> QueryResult {
        let mut delay = RETRY_DELAY;
        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(jittered(delay)).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
            let body = match self.fetch_action("queryall", epd, "&learn=1").await {
                Ok(body) => body,
                Err(err) => {
                    if !self.suppress_errors {
                        warn!(epd, %err, "queryall transport failure");
                    }
                    continue;
                }
            };
            match parse_queryall(&body) {
                Reply::Result(result) => return result,
                Reply::Unknown => {
                    // extend the database so a later pass finds a score
                    self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                    if let Err(err) = self.fetch_action("queue", epd, "").await {
                        if !self.suppress_errors {
                            warn!(epd, %err, "queue transport failure");
                        }
                    }
                    return QueryResult::with_status(QueryStatus::Unknown);
                }
                Reply::Busy => {
                    delay = (delay * 4).min(MAX_DELAY);
                }
                Reply::Malformed => {
                    if !self.suppress_errors {
                        warn!(epd, "malformed queryall reply");
                    }
                }
            }
        }
        if !self.suppress_errors {
            warn!(epd, "no usable queryall reply after {MAX_ATTEMPTS} attempts");
        }
        QueryResult::with_status(QueryStatus::Unavailable)
    }

    /// Requests that CDB add and evaluate the position. Failures are logged
    /// and dropped; the position stays eligible for a later pass.
    pub async fn queue(&self, epd: &str) {
        let Ok(_permit) = self.gate.acquire().await else {
            return;
        };
        let mut delay = RETRY_DELAY;
        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(jittered(delay)).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
            match self.fetch_action("queue", epd, "").await {
                Ok(_) => return,
                Err(err) => {
                    if !self.suppress_errors {
                        warn!(epd, %err, "queue transport failure");
                    }
                }
            }
        }
    }

    /// Re-checks a position that previously came back `unknown`; returns the
    /// score once CDB has processed the enqueue.
    pub async fn queryscore(&self, epd: &str) -> Option<i32> {
        let Ok(_permit) = self.gate.acquire().await else {
            return None;
        };
        let mut delay = RETRY_DELAY;
        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(jittered(delay)).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
            let body = match self.fetch_action("queryscore", epd, "").await {
                Ok(body) => body,
                Err(err) => {
                    if !self.suppress_errors {
                        warn!(epd, %err, "queryscore transport failure");
                    }
                    continue;
                }
            };
            match parse_queryscore(&body) {
                ScoreReply::Known(score) => return Some(score),
                ScoreReply::Unknown => return None,
                ScoreReply::Busy => delay = (delay * 4).min(MAX_DELAY),
            }
        }
        None
    }

    async fn fetch_action(
        &self,
        action: &str,
        epd: &str,
        extra: &str,
    ) -> Result<String, TransportError> {
        let url = self.request_url(action, epd, extra);
        self.counters.raw_begin();
        let result = self.transport.fetch(&url).await;
        self.counters.raw_end();
        result
    }

    pub(crate) fn request_url(&self, action: &str, epd: &str, extra: &str) -> String {
        let mut url = format!(
            "{CDB_API}?action={action}&board={}{extra}",
            epd.replace(' ', "+")
        );
        if self.chess960 {
            url.push_str("&endgame=1");
        }
        url
    }
}

fn jittered(delay: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
    delay + Duration::from_millis(jitter)
}
