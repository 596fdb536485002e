//! Explore and extend the Chess Cloud Database (https://chessdb.cn/queryc_en/).
//! Builds a search tree under a given root position and reports the PV,
//! score and query statistics after every completed depth.
//!
//! Usage: cdbexplore [--epd "<EPD> [moves m1 m2 ...]"] [--depthLimit N] [OPTIONS]

use std::sync::Arc;
use std::time::Duration;

use cdbexplore::board::Board;
use cdbexplore::search::{Config, Explorer};

const STARTPOS: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq -";

fn print_usage() {
    println!("Usage: cdbexplore [OPTIONS]");
    println!("  --epd EPD          Position to explore; accepts FENs w/ and w/o move");
    println!("                     counters, as well as the extended \"moves m1 m2\"");
    println!("                     syntax from cdb's API (default: startpos after g2g4)");
    println!("  --depthLimit N     Finish the exploration at the specified depth");
    println!("  --timeLimit S      Do not start a new iteration after S seconds");
    println!("  --concurrency N    Maximum number of concurrent requests to cdb (default: 16)");
    println!("  --evalDecay N      Depth decrease per cp eval-to-best; 0 follows PV lines only");
    println!("                     (default: 2)");
    println!("  --cursedWins       Treat cursed wins as wins");
    println!("  --TBsearch         Extend the search into cdb's EGTB");
    println!("  --proveMates       Attempt to prove that mate PVs have no better defence");
    println!("  --chess960         Use Shredder-FEN castling semantics");
    println!("  --user NAME        Add this username to the http user-agent header");
    println!("  --suppressErrors   Do not print transport error messages");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let mut epd = format!("{STARTPOS} moves g2g4");
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--epd" => {
                i += 1;
                epd = args[i].clone();
            }
            "--depthLimit" => {
                i += 1;
                config.depth_limit = Some(args[i].parse()?);
            }
            "--timeLimit" => {
                i += 1;
                config.time_limit = Some(Duration::from_secs_f64(args[i].parse()?));
            }
            "--concurrency" => {
                i += 1;
                config.concurrency = args[i].parse()?;
            }
            "--evalDecay" => {
                i += 1;
                config.eval_decay = args[i].parse()?;
            }
            "--cursedWins" => config.cursed_wins = true,
            "--TBsearch" => config.tb_search = true,
            "--proveMates" => config.prove_mates = true,
            "--chess960" => config.chess960 = true,
            "--user" => {
                i += 1;
                config.user = Some(args[i].clone());
            }
            "--suppressErrors" => config.suppress_errors = true,
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    // cdb's extended "<EPD> moves m1 m2 ..." syntax
    let (fen, moves) = match epd.split_once("moves") {
        Some((fen, moves)) => (fen.to_string(), moves.split_whitespace().map(String::from).collect()),
        None => (epd.clone(), Vec::new()),
    };
    let mut board = Board::from_epd(&fen, config.chess960)?;
    for mv in &moves {
        board = board.apply(mv)?;
    }

    println!("Root position:  {}", board.epd());
    println!("evalDecay    :  {}", config.eval_decay);
    println!("Concurrency  :  {}", config.concurrency);
    if let Some(user) = &config.user {
        println!("User name    :  {user}");
    }
    if let Some(limit) = config.depth_limit {
        println!("Depth limit  :  {limit}");
    }
    if let Some(limit) = config.time_limit {
        println!("Time limit   :  {}s", limit.as_secs_f64());
    }
    if config.cursed_wins {
        println!("Cursed Wins  :  True");
    }
    if config.tb_search {
        println!("TB search    :  True");
    }
    if config.prove_mates {
        println!("Prove Mates  :  True");
    }
    println!();

    let explorer = Arc::new(Explorer::new(config)?);
    let (mut snapshots, engine) = explorer.start(board);

    loop {
        tokio::select! {
            snapshot = snapshots.recv() => match snapshot {
                Some(snapshot) => {
                    println!("{snapshot}");
                    println!();
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                // abandon outstanding queries and leave
                eprintln!("interrupted");
                return Ok(());
            }
        }
    }

    match engine.await {
        Ok(result) => result?,
        Err(err) if err.is_cancelled() => {}
        Err(err) => return Err(err.into()),
    }
    Ok(())
}
