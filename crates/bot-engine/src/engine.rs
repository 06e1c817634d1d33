//! Orchestrator: login, firehose, dispatch, snapshots, graceful drain.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::api::{BotConfig, BotHandle, EngineEvent, StatusSnapshot};
use crate::bsky::BskyClient;
use crate::firehose::{FirehoseEvent, run_firehose};
use crate::ledger::HttpBudgetLedger;
use crate::queue::{JobQueue, MentionHandler, QueuePolicy};
use crate::worker::{BotMetrics, WorkerContext, handle_mention};
use crate::admission::AdmissionController;

/// How far the firehose may run ahead of dispatch before the socket read
/// back-pressures.
const MENTION_CHANNEL_DEPTH: usize = 1_024;
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(2);

pub(crate) struct EngineInner {
    pub(crate) event_tx: broadcast::Sender<EngineEvent>,
    pub(crate) snapshot_rx: watch::Receiver<StatusSnapshot>,
    stop_requested: AtomicBool,
    notify: tokio::sync::Notify,
}

impl EngineInner {
    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(EngineEvent::StopRequested);
            self.notify.notify_waiters();
        }
    }

    fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

enum Dispatch {
    /// Handlers run as in-process tasks, bounded only by admission.
    Direct,
    /// Handlers run on the durable queue's consumer pool.
    Queue(JobQueue),
}

pub(crate) fn start_bot(config: BotConfig) -> BotHandle {
    let (event_tx, _) = broadcast::channel::<EngineEvent>(1024);
    let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot::default());

    let inner = Arc::new(EngineInner {
        event_tx,
        snapshot_rx,
        stop_requested: AtomicBool::new(false),
        notify: tokio::sync::Notify::new(),
    });

    let join = tokio::spawn(run_bot(inner.clone(), snapshot_tx, config));
    BotHandle { inner, join }
}

async fn run_bot(
    inner: Arc<EngineInner>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    mut cfg: BotConfig,
) -> anyhow::Result<()> {
    if cfg.concurrency == 0 {
        cfg.concurrency = BotConfig::DEFAULT_CONCURRENCY;
    }
    if cfg.reply_grapheme_limit == 0 {
        cfg.reply_grapheme_limit = BotConfig::DEFAULT_REPLY_GRAPHEME_LIMIT;
    }

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()?;

    let client = Arc::new(BskyClient::new(http.clone(), cfg.service.clone()));
    let identity = client.login(&cfg.identifier, &cfg.password).await?;
    // Mention matching uses the canonical handle, which can differ from the
    // identifier the session was created with.
    let identity = match client.get_profile(&identity.did).await {
        Ok(profile) => profile,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "profile lookup failed, using session identity");
            identity
        }
    };
    info!(did = %identity.did, handle = %identity.handle, "logged in");

    let metrics = Arc::new(BotMetrics::default());
    let worker_ctx = Arc::new(WorkerContext {
        identity: identity.clone(),
        admission: Arc::new(AdmissionController::new(cfg.admission.clone())),
        ledger: Arc::new(HttpBudgetLedger::new(cfg.http.clone())),
        client,
        http,
        sandbox_limits: cfg.sandbox.clone(),
        reply_grapheme_limit: cfg.reply_grapheme_limit,
        metrics: metrics.clone(),
        events: inner.event_tx.clone(),
    });

    let mut dispatch = if cfg.use_queue {
        let handler_ctx = worker_ctx.clone();
        let handler: MentionHandler = Arc::new(move |mention| {
            let ctx = handler_ctx.clone();
            Box::pin(async move { handle_mention(&ctx, mention).await })
        });
        let queue = JobQueue::open(
            &cfg.redis,
            &cfg.queue_name,
            QueuePolicy::default(),
            cfg.concurrency,
            handler,
        )
        .await?;
        Dispatch::Queue(queue)
    } else {
        Dispatch::Direct
    };
    let mut direct_tasks: JoinSet<()> = JoinSet::new();

    let (firehose_tx, mut firehose_rx) = mpsc::channel::<FirehoseEvent>(MENTION_CHANNEL_DEPTH);
    let firehose = tokio::spawn(run_firehose(
        cfg.firehose_url.clone(),
        identity.clone(),
        firehose_tx,
        metrics.clone(),
    ));

    let emit = |event: EngineEvent| {
        let _ = inner.event_tx.send(event);
    };
    emit(EngineEvent::Started);

    let mut snapshot_tick = tokio::time::interval(SNAPSHOT_INTERVAL);
    snapshot_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    enum LoopAction {
        Recheck,
        Snapshot,
        Firehose(Option<FirehoseEvent>),
        Reaped,
    }

    loop {
        if inner.should_stop() {
            break;
        }

        let action = tokio::select! {
            _ = inner.notify.notified() => LoopAction::Recheck,
            _ = snapshot_tick.tick() => LoopAction::Snapshot,
            event = firehose_rx.recv() => LoopAction::Firehose(event),
            Some(_) = direct_tasks.join_next(), if !direct_tasks.is_empty() => LoopAction::Reaped,
        };

        match action {
            LoopAction::Recheck | LoopAction::Reaped => {}
            LoopAction::Snapshot => {
                push_snapshot(&inner, &snapshot_tx, &metrics, &dispatch).await;
            }
            LoopAction::Firehose(None) => {
                emit(EngineEvent::Error {
                    message: "firehose task stopped unexpectedly".to_string(),
                });
                break;
            }
            LoopAction::Firehose(Some(FirehoseEvent::Connected)) => {
                emit(EngineEvent::FirehoseConnected);
            }
            LoopAction::Firehose(Some(FirehoseEvent::Disconnected { reason })) => {
                emit(EngineEvent::FirehoseDisconnected { reason });
            }
            LoopAction::Firehose(Some(FirehoseEvent::Mention(mention))) => {
                emit(EngineEvent::MentionSeen {
                    author_did: mention.author_did.clone(),
                    post_uri: mention.post_uri.clone(),
                });
                match &dispatch {
                    Dispatch::Queue(queue) => {
                        if let Err(err) = queue.enqueue(mention).await {
                            emit(EngineEvent::Error {
                                message: format!("enqueue failed: {err:#}"),
                            });
                        }
                    }
                    Dispatch::Direct => {
                        let ctx = worker_ctx.clone();
                        direct_tasks.spawn(async move {
                            if let Err(err) = handle_mention(&ctx, mention).await {
                                warn!(error = %format!("{err:#}"), "direct job failed");
                            }
                        });
                    }
                }
            }
        }
    }

    // Drain: stop the firehose, stop enqueueing, let in-flight work finish.
    firehose.abort();
    drop(firehose_rx);

    while direct_tasks.join_next().await.is_some() {}
    if let Dispatch::Queue(queue) = std::mem::replace(&mut dispatch, Dispatch::Direct) {
        if let Err(err) = queue.close().await {
            warn!(error = %format!("{err:#}"), "queue close failed");
        }
    }

    let final_snapshot = StatusSnapshot {
        stop_requested: inner.should_stop(),
        metrics: metrics.snapshot(),
        queue: None,
    };
    let _ = snapshot_tx.send(final_snapshot);
    emit(EngineEvent::Stopped);
    info!("engine stopped");
    Ok(())
}

async fn push_snapshot(
    inner: &EngineInner,
    snapshot_tx: &watch::Sender<StatusSnapshot>,
    metrics: &BotMetrics,
    dispatch: &Dispatch,
) {
    let queue = match dispatch {
        Dispatch::Queue(queue) => {
            match tokio::time::timeout(Duration::from_secs(2), queue.stats()).await {
                Ok(Ok(stats)) => Some(stats),
                Ok(Err(err)) => {
                    warn!(error = %format!("{err:#}"), "queue stats failed");
                    None
                }
                Err(_) => None,
            }
        }
        Dispatch::Direct => None,
    };

    let _ = snapshot_tx.send(StatusSnapshot {
        stop_requested: inner.should_stop(),
        metrics: metrics.snapshot(),
        queue,
    });
}
