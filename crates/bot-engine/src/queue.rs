//! Durable mention queue over redis.
//!
//! Layout under the `{queue_name}` prefix: an id counter, a `waiting` list,
//! a `delayed` zset scored by next-attempt time, an `active` list, capped
//! `completed`/`failed` lists of terminal job JSON, and one JSON blob per
//! live job. Consumers pop `waiting → active` so an active job is invisible
//! to the rest of the pool; delivery is at-least-once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::api::{Mention, QueueStats, RedisConfig};

/// How often an idle consumer polls for work.
const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Backoff after a backing-store error before the consumer retries.
const STORE_ERROR_BACKOFF: Duration = Duration::from_secs(1);
/// Max delayed jobs promoted per poll.
const PROMOTE_BATCH: usize = 16;

/// Per-queue retry and retention policy.
#[derive(Debug, Clone)]
pub struct QueuePolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(2_000),
            keep_completed: 100,
            keep_failed: 500,
        }
    }
}

/// Exponential backoff: `base * 2^(failures - 1)`.
pub(crate) fn backoff_delay(policy: &QueuePolicy, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    policy.backoff_base.saturating_mul(1 << exponent)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

/// One queued mention plus delivery metadata, stored as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct QueuedJob {
    pub(crate) job_id: u64,
    pub(crate) payload: Mention,
    /// Deliveries started so far.
    pub(crate) attempt: u32,
    pub(crate) max_attempts: u32,
    /// Epoch milliseconds before which the job must not be dispatched.
    pub(crate) next_attempt_at: i64,
    pub(crate) state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) finished_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) last_error: Option<String>,
}

/// Handler invoked for each delivery; an `Err` triggers retry accounting.
pub(crate) type MentionHandler =
    Arc<dyn Fn(Mention) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Clone)]
struct QueueKeys {
    id: String,
    waiting: String,
    delayed: String,
    active: String,
    completed: String,
    failed: String,
    job_prefix: String,
}

impl QueueKeys {
    fn new(name: &str) -> Self {
        Self {
            id: format!("{name}:id"),
            waiting: format!("{name}:waiting"),
            delayed: format!("{name}:delayed"),
            active: format!("{name}:active"),
            completed: format!("{name}:completed"),
            failed: format!("{name}:failed"),
            job_prefix: format!("{name}:job:"),
        }
    }

    fn job(&self, id: &str) -> String {
        format!("{}{id}", self.job_prefix)
    }
}

/// A durable FIFO of mentions with a consumer pool.
pub struct JobQueue {
    conn: ConnectionManager,
    keys: QueueKeys,
    policy: QueuePolicy,
    paused: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    consumers: JoinSet<()>,
}

impl JobQueue {
    /// Connects to the backing store and spawns `concurrency` consumers
    /// feeding `handler`.
    pub(crate) async fn open(
        redis: &RedisConfig,
        queue_name: &str,
        policy: QueuePolicy,
        concurrency: usize,
        handler: MentionHandler,
    ) -> anyhow::Result<Self> {
        let client = redis::Client::open(format!("redis://{}:{}/", redis.host, redis.port))?;
        let conn = client.get_connection_manager().await?;

        let keys = QueueKeys::new(queue_name);
        let paused = Arc::new(AtomicBool::new(false));
        let closing = Arc::new(AtomicBool::new(false));

        let mut consumers = JoinSet::new();
        for consumer_idx in 0..concurrency.max(1) {
            consumers.spawn(consumer_loop(
                consumer_idx,
                conn.clone(),
                keys.clone(),
                policy.clone(),
                paused.clone(),
                closing.clone(),
                handler.clone(),
            ));
        }

        Ok(Self {
            conn,
            keys,
            policy,
            paused,
            closing,
            consumers,
        })
    }

    /// Appends a mention as a new waiting job and returns its id.
    pub async fn enqueue(&self, payload: Mention) -> anyhow::Result<u64> {
        let mut conn = self.conn.clone();
        let job_id: u64 = conn.incr(&self.keys.id, 1).await?;
        let job = QueuedJob {
            job_id,
            payload,
            attempt: 0,
            max_attempts: self.policy.max_attempts,
            next_attempt_at: Utc::now().timestamp_millis(),
            state: JobState::Waiting,
            finished_at: None,
            last_error: None,
        };
        let raw = serde_json::to_string(&job)?;
        let id = job_id.to_string();
        let _: () = conn.set(self.keys.job(&id), raw).await?;
        let _: () = conn.lpush(&self.keys.waiting, &id).await?;
        Ok(job_id)
    }

    /// Blocks new dispatch; already-active jobs run to completion.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Queue depth counters.
    pub async fn stats(&self) -> anyhow::Result<QueueStats> {
        let mut conn = self.conn.clone();
        let waiting: u64 = conn.llen(&self.keys.waiting).await?;
        let active: u64 = conn.llen(&self.keys.active).await?;
        let completed: u64 = conn.llen(&self.keys.completed).await?;
        let failed: u64 = conn.llen(&self.keys.failed).await?;
        let delayed: u64 = conn.zcard(&self.keys.delayed).await?;
        Ok(QueueStats {
            waiting,
            active,
            completed,
            failed,
            delayed,
            total: waiting + active + completed + failed + delayed,
        })
    }

    /// Drops terminal jobs older than `grace`; returns how many were removed.
    pub async fn clean(&self, grace: Duration) -> anyhow::Result<usize> {
        let horizon =
            Utc::now().timestamp_millis() - grace.as_millis().min(i64::MAX as u128) as i64;
        let mut removed = 0;
        let mut conn = self.conn.clone();
        for key in [&self.keys.completed, &self.keys.failed] {
            let raw_jobs: Vec<String> = conn.lrange(key, 0, -1).await?;
            let total = raw_jobs.len();
            let kept: Vec<String> = raw_jobs
                .into_iter()
                .filter(|raw| match serde_json::from_str::<QueuedJob>(raw) {
                    Ok(job) => job.finished_at.unwrap_or(i64::MAX) >= horizon,
                    Err(_) => false,
                })
                .collect();
            removed += total - kept.len();
            let _: () = conn.del(key).await?;
            if !kept.is_empty() {
                let _: () = conn.rpush(key, &kept).await?;
            }
        }
        Ok(removed)
    }

    /// Stops dispatch, awaits in-flight jobs, then releases the connection.
    pub async fn close(mut self) -> anyhow::Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        while let Some(res) = self.consumers.join_next().await {
            if let Err(err) = res {
                warn!(error = %err, "queue consumer join error");
            }
        }
        Ok(())
    }
}

async fn consumer_loop(
    consumer_idx: usize,
    mut conn: ConnectionManager,
    keys: QueueKeys,
    policy: QueuePolicy,
    paused: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    handler: MentionHandler,
) {
    loop {
        if closing.load(Ordering::SeqCst) {
            return;
        }
        if paused.load(Ordering::SeqCst) {
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        }

        match dispatch_one(&mut conn, &keys, &policy, &handler).await {
            Ok(true) => {}
            Ok(false) => tokio::time::sleep(POLL_INTERVAL).await,
            Err(err) => {
                warn!(consumer_idx, error = %err, "queue consumer store error");
                tokio::time::sleep(STORE_ERROR_BACKOFF).await;
            }
        }
    }
}

/// Promotes due delayed jobs and runs at most one waiting job. Returns
/// whether a job was dispatched.
async fn dispatch_one(
    conn: &mut ConnectionManager,
    keys: &QueueKeys,
    policy: &QueuePolicy,
    handler: &MentionHandler,
) -> anyhow::Result<bool> {
    promote_due(conn, keys).await?;

    let popped: Option<String> = conn.rpoplpush(&keys.waiting, &keys.active).await?;
    let Some(id) = popped else {
        return Ok(false);
    };

    let raw: Option<String> = conn.get(keys.job(&id)).await?;
    let Some(raw) = raw else {
        // Orphaned id (cleaned or corrupted); drop it from active.
        let _: () = conn.lrem(&keys.active, 1, &id).await?;
        return Ok(true);
    };
    let mut job: QueuedJob = match serde_json::from_str(&raw) {
        Ok(job) => job,
        Err(err) => {
            warn!(job_id = %id, error = %err, "dropping undecodable job");
            let _: () = conn.lrem(&keys.active, 1, &id).await?;
            let _: () = conn.del(keys.job(&id)).await?;
            return Ok(true);
        }
    };

    job.state = JobState::Active;
    job.attempt += 1;
    let _: () = conn.set(keys.job(&id), serde_json::to_string(&job)?).await?;
    debug!(job_id = job.job_id, attempt = job.attempt, "job dispatched");

    let result = handler(job.payload.clone()).await;
    finish_job(conn, keys, policy, job, result).await?;
    Ok(true)
}

async fn finish_job(
    conn: &mut ConnectionManager,
    keys: &QueueKeys,
    policy: &QueuePolicy,
    mut job: QueuedJob,
    result: anyhow::Result<()>,
) -> anyhow::Result<()> {
    let id = job.job_id.to_string();
    let now = Utc::now().timestamp_millis();

    match result {
        Ok(()) => {
            job.state = JobState::Completed;
            job.finished_at = Some(now);
            let _: () = conn
                .lpush(&keys.completed, serde_json::to_string(&job)?)
                .await?;
            let _: () = conn
                .ltrim(&keys.completed, 0, policy.keep_completed.max(1) as isize - 1)
                .await?;
            let _: () = conn.del(keys.job(&id)).await?;
        }
        Err(err) if job.attempt >= job.max_attempts => {
            job.state = JobState::Failed;
            job.finished_at = Some(now);
            job.last_error = Some(format!("{err:#}"));
            let _: () = conn
                .lpush(&keys.failed, serde_json::to_string(&job)?)
                .await?;
            let _: () = conn
                .ltrim(&keys.failed, 0, policy.keep_failed.max(1) as isize - 1)
                .await?;
            let _: () = conn.del(keys.job(&id)).await?;
            warn!(job_id = job.job_id, attempts = job.attempt, "job failed terminally");
        }
        Err(err) => {
            let delay = backoff_delay(policy, job.attempt);
            job.state = JobState::Delayed;
            job.next_attempt_at = now + delay.as_millis().min(i64::MAX as u128) as i64;
            job.last_error = Some(format!("{err:#}"));
            let _: () = conn.set(keys.job(&id), serde_json::to_string(&job)?).await?;
            let _: () = conn.zadd(&keys.delayed, &id, job.next_attempt_at).await?;
            debug!(
                job_id = job.job_id,
                attempt = job.attempt,
                delay_ms = delay.as_millis() as u64,
                "job rescheduled"
            );
        }
    }

    let _: () = conn.lrem(&keys.active, 1, &id).await?;
    Ok(())
}

async fn promote_due(conn: &mut ConnectionManager, keys: &QueueKeys) -> anyhow::Result<()> {
    let now = Utc::now().timestamp_millis();
    let due: Vec<String> = conn
        .zrangebyscore_limit(&keys.delayed, "-inf", now, 0, PROMOTE_BATCH as isize)
        .await?;

    for id in due {
        // Only the consumer that wins the zrem promotes this id.
        let claimed: i64 = conn.zrem(&keys.delayed, &id).await?;
        if claimed == 1 {
            let _: () = conn.lpush(&keys.waiting, &id).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use evalbot_core::post::PostRecord;

    #[test]
    fn backoff_schedule_is_exponential_from_base() {
        let policy = QueuePolicy::default();
        assert_eq!(backoff_delay(&policy, 1), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(&policy, 3), Duration::from_millis(8_000));
    }

    #[test]
    fn backoff_exponent_is_capped() {
        let policy = QueuePolicy::default();
        assert_eq!(backoff_delay(&policy, 40), backoff_delay(&policy, 17));
    }

    #[test]
    fn queued_job_round_trips_through_json() {
        let job = QueuedJob {
            job_id: 7,
            payload: Mention {
                record: PostRecord {
                    text: "@bot.example.com 2 + 2".to_string(),
                    ..PostRecord::default()
                },
                author_did: "did:plc:author".to_string(),
                post_uri: "at://did:plc:author/app.bsky.feed.post/3kabc".to_string(),
                post_cid: "bafyreia".to_string(),
                thread_root: None,
                received_at: chrono::Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            },
            attempt: 1,
            max_attempts: 3,
            next_attempt_at: 1_700_000_000_000,
            state: JobState::Delayed,
            finished_at: None,
            last_error: Some("reply failed".to_string()),
        };

        let raw = serde_json::to_string(&job).unwrap();
        let back: QueuedJob = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.job_id, 7);
        assert_eq!(back.state, JobState::Delayed);
        assert_eq!(back.payload.author_did, "did:plc:author");
        assert_eq!(back.last_error.as_deref(), Some("reply failed"));
    }

    #[test]
    fn job_states_serialize_lowercase() {
        assert_eq!(
            serde_json::to_string(&JobState::Waiting).unwrap(),
            r#""waiting""#
        );
        assert_eq!(
            serde_json::to_string(&JobState::Failed).unwrap(),
            r#""failed""#
        );
    }
}
