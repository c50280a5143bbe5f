mod cli;

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use cli::{Cli, Command, SESSION_HELP, SessionCommand, SideArgs};
use pitchside_core::config::Config;
use pitchside_core::match_state::MatchStateDocument;
use pitchside_core::rendezvous::RendezvousConnector;
use pitchside_core::session::{SessionController, SessionStatus};
use pitchside_core::store::{Change, Store};
use pitchside_core::telemetry::logging;
use pitchside_core::transport::WebRtcEstablisher;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("failed to initialise logging")?;

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(url) = &cli.signaling_url {
        config = config.with_signaling_url(url)?;
    }
    if let Some(dir) = &cli.data_dir {
        config = config.with_data_dir(dir.clone());
    }

    let store = Store::open(&config.data_dir)
        .await
        .with_context(|| format!("failed to open store in {}", config.data_dir.display()))?;
    let handshakes = RendezvousConnector::new(config.handshake_url()?, config.rendezvous_timeouts());
    let establisher = WebRtcEstablisher::new(config.signaling_url.clone(), config.webrtc_config());
    let controller = SessionController::new(store, Arc::new(handshakes), Arc::new(establisher))
        .await
        .context("failed to open match state")?;

    match cli.command {
        Command::Host(side) => {
            let printer = tokio::spawn(print_status(controller.status()));
            let hosted = tokio::select! {
                result = controller.start_host() => result,
                _ = tokio::signal::ctrl_c() => {
                    printer.abort();
                    return Ok(());
                }
            };
            printer.abort();
            let session_id = hosted.context("hosting failed")?;
            println!("connected: session {session_id}");
            attach(&controller, &side).await
        }
        Command::Join(args) => {
            let joined = tokio::select! {
                result = controller.join_session(args.code) => result,
                _ = tokio::signal::ctrl_c() => return Ok(()),
            };
            let session_id = joined.context("joining failed")?;
            println!("connected: session {session_id}");
            attach(&controller, &args.side).await
        }
        Command::Reconnect => {
            if !controller.reconnect().await.context("reconnect failed")? {
                println!("no saved session to resume");
                return Ok(());
            }
            println!("reconnected");
            attach(&controller, &SideArgs::default()).await
        }
        Command::Leave => {
            controller.leave().await?;
            println!("left network match");
            Ok(())
        }
        Command::Status => {
            match controller.saved_session().await? {
                Some(keys) => {
                    println!("session {}", keys.gid);
                    println!("  you      {}", keys.uid);
                    println!("  opponent {}", keys.oid);
                }
                None => println!("no saved session"),
            }
            for side in controller.match_state().sides().await? {
                print_side(&side);
            }
            Ok(())
        }
    }
}

async fn print_status(mut status: tokio::sync::watch::Receiver<SessionStatus>) {
    loop {
        match &*status.borrow_and_update() {
            SessionStatus::Hosting { code } => println!("pairing code: {code}"),
            SessionStatus::Connecting => println!("peer found, connecting..."),
            _ => {}
        }
        if status.changed().await.is_err() {
            return;
        }
    }
}

/// Print match state changes and apply edits typed on stdin until Ctrl-C,
/// `leave`, or until the peer goes away.
async fn attach(controller: &SessionController, sheet: &SideArgs) -> Result<()> {
    let keys = controller
        .saved_session()
        .await?
        .ok_or_else(|| anyhow!("session ended before the match state was ready"))?;
    let state = controller.match_state();
    let mut events = state.collection().subscribe().await?;
    sheet
        .apply(state, keys.uid)
        .await
        .context("failed to apply team sheet")?;
    for side in state.sides().await? {
        print_side(&side);
    }
    println!("{SESSION_HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut status = controller.status();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line.context("failed to read stdin")? else {
                    stdin_open = false;
                    continue;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<SessionCommand>() {
                    Ok(SessionCommand::Leave) => {
                        controller.leave().await?;
                        println!("left network match");
                        return Ok(());
                    }
                    Ok(SessionCommand::Show) => {
                        for side in state.sides().await? {
                            print_side(&side);
                        }
                    }
                    Ok(command) => match command.apply(state, keys.uid).await {
                        Ok(Some(reply)) => println!("{reply}"),
                        Ok(None) => {}
                        Err(err) => eprintln!("error: {err}"),
                    },
                    Err(usage) => eprintln!("{usage}"),
                }
            }
            changed = status.wait_for(|status| *status == SessionStatus::Disconnected) => {
                changed.map_err(|_| anyhow!("session controller dropped"))?;
                println!("peer disconnected; run `pitchside reconnect` to resume");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(event) => match event.change {
                    Change::Upsert(doc) => match doc.decode::<MatchStateDocument>() {
                        Ok(side) => print_side(&side),
                        Err(err) => tracing::debug!(target: "pitchside::cli", error = %err, "skipping undecodable side"),
                    },
                    Change::Remove { id } => println!("side {id} removed"),
                },
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

fn print_side(side: &MatchStateDocument) {
    println!(
        "{} guild={} score={} momentum={} screen={}",
        side.player,
        side.guild.as_deref().unwrap_or("-"),
        side.score,
        side.momentum,
        side.navigate_to.as_deref().unwrap_or("-"),
    );
    for entry in &side.roster {
        println!("    {:<20} {}", entry.name, entry.health);
    }
}
