//! Per-job pipeline: admit, parse, execute, format, reply, count.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::warn;

use evalbot_core::command::{extract_code, format_result, truncate_graphemes};

use crate::admission::AdmissionController;
use crate::api::{BotIdentity, EngineEvent, Mention, MetricsSnapshot, SandboxLimits};
use crate::bsky::ReplyClient;
use crate::ledger::HttpBudgetLedger;
use crate::sandbox::Sandbox;

const NO_CODE_REPLY: &str = "No code found in your mention.";
const INTERNAL_ERROR_REPLY: &str = "Error: evaluation could not be started";

/// Shared monotonic counters; concurrent increments are fine.
#[derive(Debug, Default)]
pub(crate) struct BotMetrics {
    processed: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    rate_limited: AtomicU64,
    malformed_events: AtomicU64,
}

impl BotMetrics {
    pub(crate) fn note_malformed_event(&self) {
        self.malformed_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            malformed_events: self.malformed_events.load(Ordering::Relaxed),
        }
    }
}

/// Everything a worker needs to process one mention. Shared across the pool;
/// the sandbox itself is constructed fresh per job.
pub(crate) struct WorkerContext {
    pub(crate) identity: BotIdentity,
    pub(crate) admission: Arc<AdmissionController>,
    pub(crate) ledger: Arc<HttpBudgetLedger>,
    pub(crate) client: Arc<dyn ReplyClient>,
    pub(crate) http: reqwest::Client,
    pub(crate) sandbox_limits: SandboxLimits,
    pub(crate) reply_grapheme_limit: usize,
    pub(crate) metrics: Arc<BotMetrics>,
    pub(crate) events: broadcast::Sender<EngineEvent>,
}

impl WorkerContext {
    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}

/// Handles one delivery. `Err` is only returned for failures the queue
/// should retry (after a best-effort error reply); admission rejects and
/// reply-post failures resolve to `Ok`.
pub(crate) async fn handle_mention(ctx: &WorkerContext, mention: Mention) -> anyhow::Result<()> {
    let permit = match ctx.admission.try_admit(&mention.author_did) {
        Ok(permit) => permit,
        Err(reject) => {
            ctx.metrics.rate_limited.fetch_add(1, Ordering::Relaxed);
            ctx.emit(EngineEvent::MentionRejected {
                author_did: mention.author_did.clone(),
                reason: reject.into(),
            });
            return Ok(());
        }
    };

    let started = Instant::now();
    let result = run_job(ctx, &mention, started).await;
    drop(permit);

    if let Err(err) = &result {
        ctx.emit(EngineEvent::JobFailed {
            post_uri: mention.post_uri.clone(),
            message: format!("{err:#}"),
        });
    }
    result
}

async fn run_job(
    ctx: &WorkerContext,
    mention: &Mention,
    started: Instant,
) -> anyhow::Result<()> {
    let Some(code) = extract_code(&mention.record, &ctx.identity.handle, &ctx.identity.did)
    else {
        ctx.metrics.processed.fetch_add(1, Ordering::Relaxed);
        post_reply(ctx, mention, NO_CODE_REPLY, started).await;
        return Ok(());
    };

    let sandbox = match Sandbox::new(&ctx.sandbox_limits, ctx.ledger.clone(), ctx.http.clone())
        .await
    {
        Ok(sandbox) => sandbox,
        Err(err) => {
            // Handler-level failure: best-effort error reply, then surface
            // the error for queue retry accounting.
            post_reply(ctx, mention, INTERNAL_ERROR_REPLY, started).await;
            return Err(err.context("sandbox construction failed"));
        }
    };

    let outcome = sandbox.execute(&code, &mention.author_did).await;
    let text = truncate_graphemes(&format_result(&outcome), ctx.reply_grapheme_limit);

    ctx.metrics.processed.fetch_add(1, Ordering::Relaxed);
    if outcome.success {
        ctx.metrics.successful.fetch_add(1, Ordering::Relaxed);
    } else {
        ctx.metrics.failed.fetch_add(1, Ordering::Relaxed);
    }

    post_reply(ctx, mention, &text, started).await;
    Ok(())
}

/// Posts the reply, threading root and parent from the mention. A post
/// failure is logged and dropped: the run already happened, so a queue retry
/// would re-execute user code for a reply that may have landed.
async fn post_reply(ctx: &WorkerContext, mention: &Mention, text: &str, started: Instant) {
    let parent = mention.post_ref();
    let root = mention.root_ref();
    match ctx.client.post_reply(text, &parent, &root).await {
        Ok(()) => {
            let elapsed_ms = started.elapsed().as_millis().min(u64::MAX as u128) as u64;
            ctx.emit(EngineEvent::ReplyPosted {
                author_did: mention.author_did.clone(),
                post_uri: mention.post_uri.clone(),
                elapsed_ms,
            });
        }
        Err(err) => {
            warn!(author = %mention.author_did, error = %format!("{err:#}"), "reply post failed");
        }
    }
}
