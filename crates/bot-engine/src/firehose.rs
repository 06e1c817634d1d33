//! Jetstream subscription and mention filtering.
//!
//! The task owns its reconnect loop (exponential backoff, cursor resume) and
//! surfaces connectivity transitions alongside mentions on one bounded
//! channel, so back-pressure from dispatch reaches the socket read.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use evalbot_core::command::mentions_handle;
use evalbot_core::post::PostRecord;

use crate::api::{BotIdentity, Mention};
use crate::worker::BotMetrics;

const POST_COLLECTION: &str = "app.bsky.feed.post";
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub(crate) enum FirehoseEvent {
    Connected,
    Disconnected { reason: String },
    Mention(Mention),
}

#[derive(Debug, Deserialize)]
struct JetstreamEvent {
    did: String,
    time_us: u64,
    #[serde(default)]
    commit: Option<CommitEvent>,
}

#[derive(Debug, Deserialize)]
struct CommitEvent {
    operation: String,
    collection: String,
    rkey: String,
    #[serde(default)]
    cid: Option<String>,
    #[serde(default)]
    record: Option<serde_json::Value>,
}

/// Runs until the receiving side of `events` is dropped.
pub(crate) async fn run_firehose(
    base_url: String,
    identity: BotIdentity,
    events: mpsc::Sender<FirehoseEvent>,
    metrics: Arc<BotMetrics>,
) {
    let mut cursor: Option<u64> = None;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let endpoint = subscribe_url(&base_url, cursor);
        match connect_async(&endpoint).await {
            Ok((stream, _response)) => {
                backoff = INITIAL_BACKOFF;
                if events.send(FirehoseEvent::Connected).await.is_err() {
                    return;
                }

                let (_write, mut read) = stream.split();
                let reason = loop {
                    match read.next().await {
                        Some(Ok(Message::Text(raw))) => {
                            if let Some(mention) =
                                handle_frame(&raw, &identity, &mut cursor, &metrics)
                            {
                                if events.send(FirehoseEvent::Mention(mention)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) => break "stream closed".to_string(),
                        Some(Ok(_)) => {}
                        Some(Err(err)) => break err.to_string(),
                        None => break "stream ended".to_string(),
                    }
                };

                if events
                    .send(FirehoseEvent::Disconnected { reason })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(err) => {
                if events
                    .send(FirehoseEvent::Disconnected {
                        reason: format!("connect failed: {err}"),
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
        if events.is_closed() {
            return;
        }
    }
}

fn subscribe_url(base: &str, cursor: Option<u64>) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    let mut url = format!("{base}{separator}wantedCollections={POST_COLLECTION}");
    if let Some(cursor) = cursor {
        url.push_str(&format!("&cursor={cursor}"));
    }
    url
}

fn handle_frame(
    raw: &str,
    identity: &BotIdentity,
    cursor: &mut Option<u64>,
    metrics: &BotMetrics,
) -> Option<Mention> {
    let event: JetstreamEvent = match serde_json::from_str(raw) {
        Ok(event) => event,
        Err(err) => {
            metrics.note_malformed_event();
            debug!(error = %err, "skipping undecodable firehose frame");
            return None;
        }
    };
    *cursor = Some(event.time_us);
    mention_from_event(event, identity, metrics)
}

fn mention_from_event(
    event: JetstreamEvent,
    identity: &BotIdentity,
    metrics: &BotMetrics,
) -> Option<Mention> {
    let commit = event.commit?;
    if commit.operation != "create" || commit.collection != POST_COLLECTION {
        return None;
    }

    let Some(cid) = commit.cid else {
        metrics.note_malformed_event();
        return None;
    };
    let Some(raw_record) = commit.record else {
        metrics.note_malformed_event();
        return None;
    };
    let record: PostRecord = match serde_json::from_value(raw_record) {
        Ok(record) => record,
        Err(err) => {
            metrics.note_malformed_event();
            warn!(error = %err, did = %event.did, "skipping undecodable post record");
            return None;
        }
    };

    if !mentions_handle(&record.text, &identity.handle) && !record.mentions_did(&identity.did) {
        return None;
    }

    let thread_root = record.reply.as_ref().map(|reply| reply.root.clone());
    Some(Mention {
        post_uri: format!("at://{}/{}/{}", event.did, POST_COLLECTION, commit.rkey),
        post_cid: cid,
        author_did: event.did,
        thread_root,
        record,
        received_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> BotIdentity {
        BotIdentity {
            did: "did:plc:bot".to_string(),
            handle: "bot.example.com".to_string(),
        }
    }

    fn frame(operation: &str, collection: &str, text: &str) -> String {
        serde_json::json!({
            "did": "did:plc:author",
            "time_us": 1_700_000_000_000_000u64,
            "kind": "commit",
            "commit": {
                "rev": "abc",
                "operation": operation,
                "collection": collection,
                "rkey": "3kabc",
                "cid": "bafyreia",
                "record": { "text": text }
            }
        })
        .to_string()
    }

    #[test]
    fn create_with_text_mention_is_kept() {
        let metrics = BotMetrics::default();
        let mut cursor = None;
        let raw = frame("create", POST_COLLECTION, "@Bot.Example.Com 2 + 2");

        let mention = handle_frame(&raw, &identity(), &mut cursor, &metrics).unwrap();
        assert_eq!(mention.author_did, "did:plc:author");
        assert_eq!(
            mention.post_uri,
            "at://did:plc:author/app.bsky.feed.post/3kabc"
        );
        assert_eq!(cursor, Some(1_700_000_000_000_000));
    }

    #[test]
    fn facet_mention_is_kept_without_text_match() {
        let metrics = BotMetrics::default();
        let mut cursor = None;
        let raw = serde_json::json!({
            "did": "did:plc:author",
            "time_us": 1u64,
            "commit": {
                "operation": "create",
                "collection": POST_COLLECTION,
                "rkey": "3kabc",
                "cid": "bafyreia",
                "record": {
                    "text": "hey bot, 1 + 1",
                    "facets": [{
                        "index": { "byteStart": 4, "byteEnd": 7 },
                        "features": [{
                            "$type": "app.bsky.richtext.facet#mention",
                            "did": "did:plc:bot"
                        }]
                    }]
                }
            }
        })
        .to_string();

        assert!(handle_frame(&raw, &identity(), &mut cursor, &metrics).is_some());
    }

    #[test]
    fn non_create_operations_are_dropped() {
        let metrics = BotMetrics::default();
        let mut cursor = None;
        let raw = frame("delete", POST_COLLECTION, "@bot.example.com 1");
        assert!(handle_frame(&raw, &identity(), &mut cursor, &metrics).is_none());
    }

    #[test]
    fn other_collections_are_dropped() {
        let metrics = BotMetrics::default();
        let mut cursor = None;
        let raw = frame("create", "app.bsky.feed.like", "@bot.example.com 1");
        assert!(handle_frame(&raw, &identity(), &mut cursor, &metrics).is_none());
    }

    #[test]
    fn posts_without_mention_are_dropped() {
        let metrics = BotMetrics::default();
        let mut cursor = None;
        let raw = frame("create", POST_COLLECTION, "just chatting");
        assert!(handle_frame(&raw, &identity(), &mut cursor, &metrics).is_none());
    }

    #[test]
    fn malformed_frames_bump_the_counter_and_advance_nothing() {
        let metrics = BotMetrics::default();
        let mut cursor = None;
        assert!(handle_frame("{not json", &identity(), &mut cursor, &metrics).is_none());
        assert_eq!(metrics.snapshot().malformed_events, 1);
        assert_eq!(cursor, None);
    }

    #[test]
    fn reply_posts_carry_their_thread_root() {
        let metrics = BotMetrics::default();
        let mut cursor = None;
        let raw = serde_json::json!({
            "did": "did:plc:author",
            "time_us": 2u64,
            "commit": {
                "operation": "create",
                "collection": POST_COLLECTION,
                "rkey": "3kdef",
                "cid": "bafyreib",
                "record": {
                    "text": "@bot.example.com 2 + 2",
                    "reply": {
                        "root": { "uri": "at://did:plc:x/app.bsky.feed.post/root", "cid": "cidroot" },
                        "parent": { "uri": "at://did:plc:y/app.bsky.feed.post/p", "cid": "cidp" }
                    }
                }
            }
        })
        .to_string();

        let mention = handle_frame(&raw, &identity(), &mut cursor, &metrics).unwrap();
        let root = mention.root_ref();
        assert_eq!(root.uri, "at://did:plc:x/app.bsky.feed.post/root");
        assert_eq!(mention.post_ref().cid, "bafyreib");
    }

    #[test]
    fn subscribe_url_appends_collection_and_cursor() {
        assert_eq!(
            subscribe_url("wss://jetstream.example/subscribe", None),
            "wss://jetstream.example/subscribe?wantedCollections=app.bsky.feed.post"
        );
        assert_eq!(
            subscribe_url("wss://jetstream.example/subscribe", Some(42)),
            "wss://jetstream.example/subscribe?wantedCollections=app.bsky.feed.post&cursor=42"
        );
    }
}
