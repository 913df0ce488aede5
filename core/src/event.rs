//! Event records — the opaque unit of publish/subscribe
//!
//! The core does not sign, verify, or interpret events. It moves them
//! between relays and subscriptions, matching on the envelope fields
//! (`id`, `pubkey`, `created_at`, `kind`, `tags`) only.

use serde::{Deserialize, Serialize};

/// Hex-encoded event identifier.
pub type EventId = String;

/// Hex-encoded author public key.
pub type AuthorId = String;

/// A record as it travels over the wire.
///
/// `content` and `sig` are carried verbatim; producing and checking
/// them is the job of the signing layer, not this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event ID (hash of the serialized event, hex)
    pub id: EventId,
    /// Author public key (hex)
    pub pubkey: AuthorId,
    /// Unix timestamp (seconds)
    pub created_at: u64,
    /// Event kind
    pub kind: u32,
    /// Tags: each tag is a list of strings, first element is the tag name
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    /// Opaque content
    #[serde(default)]
    pub content: String,
    /// Signature over the event (hex), verified elsewhere
    #[serde(default)]
    pub sig: String,
}

impl Event {
    /// Values of every tag whose name matches `name` exactly.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }
}
