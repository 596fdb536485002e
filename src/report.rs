// src/report.rs
//
// One snapshot per completed depth. The text layout is stable: downstream
// log consumers parse the two-space indent, the 10-character label field and
// the colon-space separator.

use std::fmt;
use std::time::Duration;

use crate::cdb;
use crate::stats::CounterSnapshot;

/// Marker appended after the PV moves when the line ends in a finished game.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PvTag {
    /// Mate verified by the proof pass.
    MateProven,
    /// Mate claimed by the scores but not (yet) proven.
    Mate,
    Draw,
}

#[derive(Clone, Debug)]
pub struct Snapshot {
    /// EPD of the root position the search ran from.
    pub epd: String,
    pub depth: u32,
    /// `None` when CDB did not know the root this pass.
    pub score: Option<i32>,
    pub pv: Vec<String>,
    pub tag: Option<PvTag>,
    pub counters: CounterSnapshot,
    pub url: String,
}

impl Snapshot {
    pub fn pv_line(&self) -> String {
        let mut line = self.pv.join(" ");
        let token = match self.tag {
            Some(PvTag::MateProven) => match self.score {
                Some(score) => format!("CHECKMATE ({})", mate_token(score)),
                None => "CHECKMATE".to_string(),
            },
            Some(PvTag::Mate) => "checkmate".to_string(),
            Some(PvTag::Draw) => "draw".to_string(),
            None => return line,
        };
        if !line.is_empty() {
            line.push(' ');
        }
        line.push_str(&token);
        line
    }
}

/// `#k` with the sign of the mating side, moves rounded up for the winner.
fn mate_token(score: i32) -> String {
    let plies = cdb::mate_distance(score);
    if score > 0 {
        format!("#{}", (plies + 1) / 2)
    } else {
        format!("#-{}", plies / 2)
    }
}

/// `queryc_en` link for the root position plus the PV, spaces as underscores.
pub fn cdb_url(epd: &str, pv: &[String]) -> String {
    let mut line = epd.to_string();
    if !pv.is_empty() {
        line.push_str(" moves");
        for mv in pv {
            line.push(' ');
            line.push_str(mv);
        }
    }
    format!("https://chessdb.cn/queryc_en/?{}", line.replace(' ', "_"))
}

fn fmt_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let centis = elapsed.subsec_millis() / 10;
    format!(
        "{}:{:02}:{:02}.{:02}",
        total / 3600,
        total / 60 % 60,
        total % 60,
        centis
    )
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counters;
        writeln!(f, "Search at depth  {}", self.depth)?;
        match self.score {
            Some(score) => writeln!(f, "  {:<10}:  {}", "score", score)?,
            None => writeln!(f, "  {:<10}:  unknown", "score")?,
        }
        writeln!(f, "  {:<10}:  {}", "PV", self.pv_line())?;
        writeln!(f, "  {:<10}:  {}", "PV len", self.pv.len())?;
        writeln!(f, "  {:<10}:  {}", "level", c.level)?;
        writeln!(f, "  {:<10}:  {}", "max level", c.max_level)?;
        writeln!(f, "  {:<10}:  {}", "queryall", c.queryall)?;
        writeln!(f, "  {:<10}:  {:.2}", "bf", c.bf)?;
        writeln!(
            f,
            "  {:<10}:  {} ({:.2}% of queryall)",
            "chessdbq",
            c.chessdbq,
            percent(c.chessdbq, c.queryall)
        )?;
        writeln!(f, "  {:<10}:  {}", "enqueued", c.enqueued)?;
        writeln!(f, "  {:<10}:  {}", "requeued", c.requeued)?;
        writeln!(
            f,
            "  {:<10}:  {} ({:.2}% of enqueued)",
            "unscored",
            c.unscored,
            percent(c.unscored, c.enqueued)
        )?;
        writeln!(
            f,
            "  {:<10}:  {} ({:.2}% of chessdbq)",
            "reprobed",
            c.reprobed,
            percent(c.reprobed, c.chessdbq)
        )?;
        writeln!(f, "  {:<10}:  {:.2}", "inflightQ", c.inflight_q)?;
        writeln!(f, "  {:<10}:  {:.2}", "inflightR", c.inflight_r)?;
        writeln!(f, "  {:<10}:  {}", "cdb time", c.cdb_time_ms)?;
        writeln!(f, "  {:<10}:  {}", "total time", fmt_elapsed(c.elapsed))?;
        write!(f, "  {:<10}:  {}", "URL", self.url)
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    part as f64 / whole.max(1) as f64 * 100.0
}
