//! lumen-tail: follow a chat room from the terminal.
//!
//! Replays the locally cached history, backfills the newest page over HTTP
//! and then prints live messages as they arrive. Lines typed on stdin are
//! sent to the room; `/more` loads older history and `/quit` exits.

mod render;
mod settings;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use lumen_chat::{
    CoordinatorConfig, HttpPageFetcher, PageOutcome, RocksCache, SyncCoordinator, SyncError,
    SyncHandle, WsLiveFeed,
};
use lumen_core::MessageDraft;
use tokio::io::{AsyncBufReadExt, BufReader};

use render::Printer;
use settings::Settings;

/// A line typed by the user.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    More,
    Quit,
    Say(String),
    Nothing,
}

fn parse_input(line: &str) -> Input {
    match line.trim() {
        "" => Input::Nothing,
        "/more" => Input::More,
        "/quit" | "/exit" => Input::Quit,
        text => Input::Say(text.to_string()),
    }
}

async fn load_more(handle: &SyncHandle) {
    match handle.load_next_page().await {
        Ok(PageOutcome::Loaded { received, exhausted }) => {
            info!("Loaded {received} older messages");
            if exhausted {
                println!("-- beginning of history --");
            }
        }
        Ok(PageOutcome::Exhausted) => println!("-- beginning of history --"),
        Ok(PageOutcome::InFlight) => println!("-- still loading --"),
        Ok(PageOutcome::Discarded) => {}
        Err(e) => warn!("Could not load older messages: {e}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let settings = Settings::load()?;
    let room = std::env::args()
        .nth(1)
        .or_else(|| settings.room.clone())
        .context("no room given: pass it as the first argument or set LUMEN__ROOM")?;

    info!("Starting lumen-tail for room {room}");

    let cache = Arc::new(
        RocksCache::open(settings.cache_config()).context("failed to open message cache")?,
    );
    let fetcher = Arc::new(
        HttpPageFetcher::new(settings.fetcher_config()).context("failed to build HTTP client")?,
    );

    let mut live = WsLiveFeed::new(settings.live_config());
    let events = live
        .take_event_rx()
        .context("live event queue already taken")?;
    if let Err(e) = live.connect().await {
        warn!("Live feed unavailable ({e}); showing cached history only");
    }
    let live = Arc::new(live);

    let (handle, task) = SyncCoordinator::spawn(
        cache,
        fetcher,
        live.clone(),
        events,
        CoordinatorConfig::default(),
    );

    match handle.open_room(room.as_str()).await {
        Ok(()) => {}
        Err(SyncError::Disconnected) => warn!("Not connected; will join {room} once the live feed is up"),
        Err(e) => return Err(e).context("failed to open room"),
    }
    if let Err(e) = handle.load_initial_page().await {
        warn!("Could not load recent history: {e}");
    }

    let mut printer = Printer::new();
    let mut view = handle.view();
    printer.print_new(&view.borrow_and_update());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = view.borrow_and_update().clone();
                printer.print_new(&current);
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match parse_input(&line) {
                    Input::Nothing => {}
                    Input::Quit => break,
                    Input::More => load_more(&handle).await,
                    Input::Say(text) => {
                        if let Err(e) = handle.send(MessageDraft::text(text)).await {
                            warn!("Message not sent: {e}");
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Shutting down");
    handle.close_room().await?;
    live.disconnect().await;
    drop(handle);
    task.await.context("coordinator task panicked")?;
    Ok(())
}
