mod cli;
mod repl;
mod shutdown;

use std::sync::Arc;

use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use evalbot_core::credentials::{BotCredentials, load_credentials};
use evalbot_engine::{EngineEvent, start_bot};

use crate::cli::Cli;
use crate::repl::run_repl;
use crate::shutdown::{ShutdownController, ShutdownEvent, spawn_signal_handler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if cli.repl {
        return run_repl(&cli).await;
    }

    let file_creds = match load_credentials() {
        Ok(creds) => creds.unwrap_or_default(),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "failed to read credentials file");
            BotCredentials::default()
        }
    };
    let creds = BotCredentials {
        identifier: cli.identifier.clone(),
        password: cli.password.clone(),
        service: None,
    }
    .merge(file_creds);

    let identifier = creds.identifier.ok_or_else(|| {
        anyhow::anyhow!("no identifier configured (--identifier, EVALBOT_IDENTIFIER, or the credentials file)")
    })?;
    let password = creds.password.ok_or_else(|| {
        anyhow::anyhow!("no password configured (--password, EVALBOT_PASSWORD, or the credentials file)")
    })?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        use_queue = cli.use_queue,
        "starting evalbot"
    );

    let bot = start_bot(cli.bot_config(identifier, password));
    let mut events = bot.subscribe();

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_signal_handler(shutdown.clone(), shutdown_tx);

    let mut immediate_exit = false;

    loop {
        tokio::select! {
            ev_opt = shutdown_rx.recv() => {
                match ev_opt {
                    Some(ShutdownEvent::Graceful) => {
                        eprintln!("Stop requested — draining in-flight work (press CTRL+C again to exit immediately).");
                        bot.request_stop();
                    }
                    Some(ShutdownEvent::Immediate) => {
                        eprintln!("Stop requested again — exiting immediately.");
                        immediate_exit = true;
                        break;
                    }
                    None => {}
                }
            }
            evt = events.recv() => {
                let evt = match evt {
                    Ok(evt) => evt,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                if matches!(evt, EngineEvent::Stopped) {
                    break;
                }
                log_event(evt);
            }
        }
    }

    if immediate_exit {
        std::process::exit(130);
    }

    bot.wait().await?;
    Ok(())
}

fn log_event(event: EngineEvent) {
    match event {
        EngineEvent::Started => info!("engine started"),
        EngineEvent::StopRequested => info!("graceful stop requested"),
        EngineEvent::FirehoseConnected => info!("firehose connected"),
        EngineEvent::FirehoseDisconnected { reason } => {
            warn!(%reason, "firehose disconnected, reconnecting");
        }
        EngineEvent::MentionSeen {
            author_did,
            post_uri,
        } => debug!(%author_did, %post_uri, "mention seen"),
        EngineEvent::MentionRejected { author_did, reason } => {
            debug!(%author_did, ?reason, "mention rejected");
        }
        EngineEvent::ReplyPosted {
            author_did,
            elapsed_ms,
            ..
        } => info!(%author_did, elapsed_ms, "reply posted"),
        EngineEvent::JobFailed { post_uri, message } => {
            warn!(%post_uri, %message, "job failed");
        }
        EngineEvent::Warning { message } => warn!("{message}"),
        EngineEvent::Error { message } => error!("{message}"),
        EngineEvent::Stopped => {}
    }
}
