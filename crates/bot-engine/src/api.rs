//! Public API types for the in-process `evalbot` engine.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use evalbot_core::post::{PostRecord, PostRef};

/// Resource bounds for one sandbox run.
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    /// Wall-clock budget for the whole run, including promise settlement.
    pub timeout: Duration,
    /// Interpreter heap cap in bytes.
    pub heap_bytes: usize,
    /// Interpreter stack cap in bytes.
    pub stack_bytes: usize,
}

impl SandboxLimits {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5_000);
    pub const DEFAULT_HEAP_BYTES: usize = 32 * 1024 * 1024;
    pub const DEFAULT_STACK_BYTES: usize = 512 * 1024;
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: Self::DEFAULT_TIMEOUT,
            heap_bytes: Self::DEFAULT_HEAP_BYTES,
            stack_bytes: Self::DEFAULT_STACK_BYTES,
        }
    }
}

/// HTTP budget configuration shared by the ledger and the sandbox
/// capabilities.
#[derive(Debug, Clone)]
pub struct HttpLimits {
    /// Max requests within one eval.
    pub per_eval_limit: u32,
    /// Max requests per principal within the rolling window.
    pub window_limit: u32,
    /// Rolling window length.
    pub window: Duration,
    /// Max outbound POST body size in bytes.
    pub post_body_limit_bytes: usize,
    /// Max response body size in bytes.
    pub response_size_limit_bytes: usize,
    /// Total deadline for one outbound request.
    pub request_timeout: Duration,
}

impl HttpLimits {
    pub const DEFAULT_PER_EVAL_LIMIT: u32 = 5;
    pub const DEFAULT_WINDOW_LIMIT: u32 = 25;
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
    pub const DEFAULT_POST_BODY_LIMIT_BYTES: usize = 150_000;
    pub const DEFAULT_RESPONSE_SIZE_LIMIT_BYTES: usize = 150_000;
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5_000);
}

impl Default for HttpLimits {
    fn default() -> Self {
        Self {
            per_eval_limit: Self::DEFAULT_PER_EVAL_LIMIT,
            window_limit: Self::DEFAULT_WINDOW_LIMIT,
            window: Self::DEFAULT_WINDOW,
            post_body_limit_bytes: Self::DEFAULT_POST_BODY_LIMIT_BYTES,
            response_size_limit_bytes: Self::DEFAULT_RESPONSE_SIZE_LIMIT_BYTES,
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Admission control configuration.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Minimum interval between completed mentions of one principal.
    pub cooldown: Duration,
    /// Global cap on concurrently processed mentions.
    pub max_in_flight: usize,
}

impl AdmissionConfig {
    pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(5_000);
    pub const DEFAULT_MAX_IN_FLIGHT_DIRECT: usize = 100;
    pub const DEFAULT_MAX_IN_FLIGHT_QUEUE: usize = 1_000;
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            cooldown: Self::DEFAULT_COOLDOWN,
            max_in_flight: Self::DEFAULT_MAX_IN_FLIGHT_DIRECT,
        }
    }
}

/// Redis connection parameters for queue mode.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
        }
    }
}

/// Configuration for the in-process bot engine.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Protocol service base URL (e.g. `https://bsky.social`).
    pub service: Url,
    /// Account identifier (handle or DID) used to log in.
    pub identifier: String,
    /// App password.
    pub password: String,
    /// Jetstream subscription endpoint.
    pub firehose_url: String,
    /// Dispatch through the durable queue instead of in-process tasks.
    pub use_queue: bool,
    /// Queue backing store location (queue mode only).
    pub redis: RedisConfig,
    /// Queue key prefix.
    pub queue_name: String,
    /// Parallel queue consumers (queue mode only).
    pub concurrency: usize,
    /// DIDs allowed to use the external admin command surface.
    pub admin_dids: HashSet<String>,
    pub sandbox: SandboxLimits,
    pub http: HttpLimits,
    pub admission: AdmissionConfig,
    /// Grapheme budget for reply text.
    pub reply_grapheme_limit: usize,
}

impl BotConfig {
    pub const DEFAULT_FIREHOSE_URL: &'static str =
        "wss://jetstream2.us-east.bsky.network/subscribe";
    pub const DEFAULT_QUEUE_NAME: &'static str = "evalbot:mentions";
    pub const DEFAULT_CONCURRENCY: usize = 10;
    pub const DEFAULT_REPLY_GRAPHEME_LIMIT: usize = 300;
}

/// The bot account as seen by the protocol service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BotIdentity {
    pub did: String,
    pub handle: String,
}

/// A post that mentions the bot, as emitted by the firehose filter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mention {
    /// The post record as carried by the commit event.
    pub record: PostRecord,
    /// DID of the post author: the rate-limiting principal.
    pub author_did: String,
    /// `at://` URI of the mentioning post.
    pub post_uri: String,
    /// CID of the mentioning post.
    pub post_cid: String,
    /// Root of the thread the post belongs to, when it is itself a reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_root: Option<PostRef>,
    pub received_at: DateTime<Utc>,
}

impl Mention {
    /// Strong ref to the mentioning post (the reply parent).
    pub fn post_ref(&self) -> PostRef {
        PostRef {
            uri: self.post_uri.clone(),
            cid: self.post_cid.clone(),
        }
    }

    /// Thread root for the reply: the mention's own root when it is a reply,
    /// otherwise the mention itself.
    pub fn root_ref(&self) -> PostRef {
        self.thread_root.clone().unwrap_or_else(|| self.post_ref())
    }
}

/// Why a mention was refused admission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Principal is inside its cooldown window.
    Rate,
    /// Global in-flight cap reached.
    QueueFull,
}

/// Engine event stream payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Engine started (logged in, firehose starting).
    Started,
    /// Graceful shutdown requested.
    StopRequested,
    /// Firehose subscription established.
    FirehoseConnected,
    /// Firehose subscription lost; the subscriber will reconnect.
    FirehoseDisconnected {
        /// Transport-level reason.
        reason: String,
    },
    /// A mention passed the filter and was handed to dispatch.
    MentionSeen {
        author_did: String,
        post_uri: String,
    },
    /// A mention was refused by the admission controller (no reply is sent).
    MentionRejected {
        author_did: String,
        reason: RejectReason,
    },
    /// A reply was posted.
    ReplyPosted {
        author_did: String,
        post_uri: String,
        elapsed_ms: u64,
    },
    /// A job failed after reply-path handling.
    JobFailed {
        post_uri: String,
        message: String,
    },
    /// A warning from the engine.
    Warning {
        message: String,
    },
    /// A non-fatal error from the engine.
    Error {
        message: String,
    },
    /// Engine stopped.
    Stopped,
}

/// Monotonic counters collected by the workers and the firehose filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Mentions that reached the worker pipeline.
    pub processed: u64,
    /// Runs whose reply reported success.
    pub successful: u64,
    /// Runs whose reply reported an error.
    pub failed: u64,
    /// Mentions dropped by admission control.
    pub rate_limited: u64,
    /// Firehose frames that could not be decoded.
    pub malformed_events: u64,
}

/// Queue depth counters (queue mode only).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub total: u64,
}

/// Current engine state snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    /// Whether the engine has been asked to stop.
    pub stop_requested: bool,
    pub metrics: MetricsSnapshot,
    /// Present in queue mode when the backing store is reachable.
    pub queue: Option<QueueStats>,
}

/// Handle to a running in-process bot instance.
pub struct BotHandle {
    pub(crate) inner: std::sync::Arc<crate::engine::EngineInner>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

/// Start a new in-process bot instance.
pub fn start_bot(config: BotConfig) -> BotHandle {
    crate::engine::start_bot(config)
}

impl BotHandle {
    /// Subscribe to the engine event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Get the latest engine snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.snapshot_rx.borrow().clone()
    }

    /// Request a graceful shutdown (stop subscribing, drain in-flight work).
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// Wait for the engine to stop, returning the engine task result.
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("engine task join error: {err}")),
        }
    }
}
