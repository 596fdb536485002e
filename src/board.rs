use shakmaty::fen::{Epd, Fen};
use shakmaty::uci::UciMove;
use shakmaty::zobrist::{Zobrist64, ZobristHash};
use shakmaty::{CastlingMode, Chess, EnPassantMode, Position};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("invalid EPD {epd:?}: {reason}")]
    InvalidEpd { epd: String, reason: String },
    #[error("illegal move {uci:?} in {epd}")]
    IllegalMove { uci: String, epd: String },
}

/// How a finished game ended, from the point of view of the side to move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Terminal {
    Checkmate,
    Stalemate,
    Draw,
}

/// A chess position plus the history of the line that reached it.
///
/// The position itself is a plain value; `apply` returns a new board, so each
/// search branch owns its own copy. The history carries Zobrist hashes of all
/// positions seen on this line, which is what repetition detection needs.
#[derive(Clone)]
pub struct Board {
    pos: Chess,
    seen: Vec<Zobrist64>,
}

impl Board {
    /// Parses an EPD or FEN (move counters optional). `chess960` selects
    /// Shredder-FEN castling semantics.
    pub fn from_epd(epd: &str, chess960: bool) -> Result<Self, BoardError> {
        let fen: Fen = epd.trim().parse().map_err(|e| BoardError::InvalidEpd {
            epd: epd.to_string(),
            reason: format!("{e}"),
        })?;
        let mode = if chess960 {
            CastlingMode::Chess960
        } else {
            CastlingMode::Standard
        };
        let pos: Chess = fen.into_position(mode).map_err(|e| BoardError::InvalidEpd {
            epd: epd.to_string(),
            reason: format!("{e}"),
        })?;
        let hash = pos.zobrist_hash::<Zobrist64>(EnPassantMode::Legal);
        Ok(Board {
            pos,
            seen: vec![hash],
        })
    }

    pub fn startpos() -> Self {
        let pos = Chess::default();
        let hash = pos.zobrist_hash::<Zobrist64>(EnPassantMode::Legal);
        Board {
            pos,
            seen: vec![hash],
        }
    }

    /// Applies a UCI move, returning the resulting board. The original board
    /// is untouched.
    pub fn apply(&self, uci: &str) -> Result<Self, BoardError> {
        let illegal = || BoardError::IllegalMove {
            uci: uci.to_string(),
            epd: self.epd(),
        };
        let parsed: UciMove = uci.parse().map_err(|_| illegal())?;
        let mv = parsed.to_move(&self.pos).map_err(|_| illegal())?;
        let pos = self.pos.clone().play(&mv).map_err(|_| illegal())?;
        let mut seen = self.seen.clone();
        seen.push(pos.zobrist_hash::<Zobrist64>(EnPassantMode::Legal));
        Ok(Board { pos, seen })
    }

    /// Legal moves in UCI notation, in move generator order.
    pub fn legal_moves(&self) -> Vec<String> {
        let mode = self.pos.castles().mode();
        self.pos
            .legal_moves()
            .iter()
            .map(|m| m.to_uci(mode).to_string())
            .collect()
    }

    /// The position fingerprint: piece placement, side to move, castling
    /// rights and en-passant square, without move counters.
    pub fn epd(&self) -> String {
        Epd::from_position(self.pos.clone(), EnPassantMode::Legal).to_string()
    }

    /// Plies played on this line since the board was constructed.
    pub fn ply(&self) -> usize {
        self.seen.len() - 1
    }

    /// Checkmate, stalemate, or a draw by insufficient material, the 50-move
    /// rule or threefold repetition. Repetitions are only visible within the
    /// history this board carries.
    pub fn is_terminal(&self) -> Option<Terminal> {
        if self.pos.is_checkmate() {
            return Some(Terminal::Checkmate);
        }
        if self.pos.is_stalemate() {
            return Some(Terminal::Stalemate);
        }
        if self.pos.is_insufficient_material() || self.pos.halfmoves() >= 100 {
            return Some(Terminal::Draw);
        }
        let current = self.seen[self.seen.len() - 1];
        if self.seen.iter().filter(|h| **h == current).count() >= 3 {
            return Some(Terminal::Draw);
        }
        None
    }
}
