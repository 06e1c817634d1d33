//! Minimal XRPC protocol client: session login, reply posting, profile
//! lookup. The worker only sees the `ReplyClient` capability so tests can
//! substitute a recording client.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use evalbot_core::post::{PostRef, ReplyRef};

use crate::api::BotIdentity;

const POST_COLLECTION: &str = "app.bsky.feed.post";

/// The reply-posting capability consumed by workers.
#[async_trait]
pub(crate) trait ReplyClient: Send + Sync {
    async fn post_reply(&self, text: &str, parent: &PostRef, root: &PostRef)
    -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Deserialize)]
struct Session {
    did: String,
    handle: String,
    #[serde(rename = "accessJwt")]
    access_jwt: String,
}

#[derive(Debug, Serialize)]
struct CreateSessionRequest<'a> {
    identifier: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateRecordRequest<'a> {
    repo: &'a str,
    collection: &'a str,
    record: ReplyRecord<'a>,
}

#[derive(Debug, Serialize)]
struct ReplyRecord<'a> {
    #[serde(rename = "$type")]
    record_type: &'a str,
    text: &'a str,
    #[serde(rename = "createdAt")]
    created_at: String,
    reply: ReplyRef,
}

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    did: String,
    handle: String,
}

/// XRPC client holding one app-password session.
pub(crate) struct BskyClient {
    http: reqwest::Client,
    service: Url,
    session: RwLock<Option<Session>>,
}

impl BskyClient {
    pub(crate) fn new(http: reqwest::Client, service: Url) -> Self {
        Self {
            http,
            service,
            session: RwLock::new(None),
        }
    }

    /// Creates a session and returns the account identity.
    pub(crate) async fn login(&self, identifier: &str, password: &str) -> anyhow::Result<BotIdentity> {
        let url = self.service.join("xrpc/com.atproto.server.createSession")?;
        let res = self
            .http
            .post(url)
            .json(&CreateSessionRequest {
                identifier,
                password,
            })
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("login failed: http {status}: {body}");
        }

        let session: Session = res.json().await?;
        let identity = BotIdentity {
            did: session.did.clone(),
            handle: session.handle.clone(),
        };
        *self.session.write().await = Some(session);
        Ok(identity)
    }

    /// Resolves an actor's current handle and DID.
    pub(crate) async fn get_profile(&self, actor: &str) -> anyhow::Result<BotIdentity> {
        let (access_jwt, _) = self.auth().await?;
        let url = self.service.join("xrpc/app.bsky.actor.getProfile")?;
        let res = self
            .http
            .get(url)
            .bearer_auth(access_jwt)
            .query(&[("actor", actor)])
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("getProfile failed: http {status}: {body}");
        }

        let profile: ProfileResponse = res.json().await?;
        Ok(BotIdentity {
            did: profile.did,
            handle: profile.handle,
        })
    }

    async fn auth(&self) -> anyhow::Result<(String, String)> {
        let session = self.session.read().await;
        let session = session
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("not logged in"))?;
        Ok((session.access_jwt.clone(), session.did.clone()))
    }
}

#[async_trait]
impl ReplyClient for BskyClient {
    async fn post_reply(
        &self,
        text: &str,
        parent: &PostRef,
        root: &PostRef,
    ) -> anyhow::Result<()> {
        let (access_jwt, did) = self.auth().await?;
        let url = self.service.join("xrpc/com.atproto.repo.createRecord")?;
        let res = self
            .http
            .post(url)
            .bearer_auth(access_jwt)
            .json(&CreateRecordRequest {
                repo: &did,
                collection: POST_COLLECTION,
                record: ReplyRecord {
                    record_type: POST_COLLECTION,
                    text,
                    created_at: Utc::now().to_rfc3339(),
                    reply: ReplyRef {
                        root: root.clone(),
                        parent: parent.clone(),
                    },
                },
            })
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("createRecord failed: http {status}: {body}");
        }
        Ok(())
    }
}
