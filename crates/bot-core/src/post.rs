//! Post record model: the subset of the post lexicon the bot reads and
//! writes (text, richtext mention facets, reply threading refs).

use serde::{Deserialize, Serialize};

/// A strong reference to a post (AT-URI plus content hash).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRef {
    /// `at://` URI of the post record.
    pub uri: String,
    /// CID of the post record.
    pub cid: String,
}

/// Reply threading metadata carried by a post record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRef {
    /// First post of the thread.
    pub root: PostRef,
    /// Post being replied to.
    pub parent: PostRef,
}

/// Byte range of a richtext facet within the post text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetIndex {
    #[serde(rename = "byteStart")]
    pub byte_start: usize,
    #[serde(rename = "byteEnd")]
    pub byte_end: usize,
}

/// A single richtext feature attached to a facet range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "$type")]
pub enum FacetFeature {
    /// A mention of an account, carrying its DID.
    #[serde(rename = "app.bsky.richtext.facet#mention")]
    Mention {
        /// DID of the mentioned account.
        did: String,
    },
    /// Any feature the bot does not interpret (links, tags, ...).
    #[serde(other)]
    Other,
}

/// A richtext annotation over a byte range of the post text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facet {
    pub index: FacetIndex,
    #[serde(default)]
    pub features: Vec<FacetFeature>,
}

/// The post record payload as it appears in commit events.
///
/// Unknown fields (langs, embeds, timestamps) are ignored on read and never
/// written back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostRecord {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub facets: Vec<Facet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<ReplyRef>,
}

impl PostRecord {
    /// True when any mention facet identifies `did`.
    pub fn mentions_did(&self, did: &str) -> bool {
        self.facets.iter().any(|facet| {
            facet
                .features
                .iter()
                .any(|feature| matches!(feature, FacetFeature::Mention { did: d } if d == did))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_record_with_mention_facet() {
        let raw = serde_json::json!({
            "text": "@bot.example.com 1 + 1",
            "facets": [{
                "index": { "byteStart": 0, "byteEnd": 16 },
                "features": [{ "$type": "app.bsky.richtext.facet#mention", "did": "did:plc:bot" }]
            }],
            "reply": {
                "root": { "uri": "at://did:plc:a/app.bsky.feed.post/1", "cid": "cid1" },
                "parent": { "uri": "at://did:plc:b/app.bsky.feed.post/2", "cid": "cid2" }
            },
            "createdAt": "2026-01-01T00:00:00Z"
        });

        let record: PostRecord = serde_json::from_value(raw).unwrap();
        assert!(record.mentions_did("did:plc:bot"));
        assert!(!record.mentions_did("did:plc:other"));
        assert_eq!(record.reply.as_ref().unwrap().root.cid, "cid1");
    }

    #[test]
    fn unknown_facet_features_are_tolerated() {
        let raw = serde_json::json!({
            "text": "see https://example.com",
            "facets": [{
                "index": { "byteStart": 4, "byteEnd": 23 },
                "features": [{ "$type": "app.bsky.richtext.facet#link", "uri": "https://example.com" }]
            }]
        });

        let record: PostRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(record.facets.len(), 1);
        assert!(matches!(record.facets[0].features[0], FacetFeature::Other));
    }
}
