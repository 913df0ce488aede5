//! Relay information documents (NIP-11)
//!
//! Relays serve a JSON self-description over HTTP on the same
//! authority as their websocket endpoint. Fetching is blocking
//! (`ureq`), so it runs on the blocking pool.

use crate::relay::RelayUrl;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const FETCH_TIMEOUT_SECS: u64 = 10;

/// Info document fetch error types
#[derive(Debug, Error)]
pub enum InfoError {
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Invalid info document: {0}")]
    Malformed(String),
    #[error("Fetch task cancelled")]
    Cancelled,
}

/// Limits a relay advertises in its info document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelayLimitation {
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub payment_required: bool,
    pub max_subscriptions: Option<u32>,
    pub max_filters: Option<u32>,
    pub max_limit: Option<u32>,
    pub max_message_length: Option<u32>,
}

/// Subset of the relay info document the client acts on.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelayInformation {
    pub name: Option<String>,
    pub description: Option<String>,
    pub pubkey: Option<String>,
    pub contact: Option<String>,
    pub software: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub supported_nips: Vec<u32>,
    pub limitation: Option<RelayLimitation>,
}

impl RelayInformation {
    pub fn requires_auth(&self) -> bool {
        self.limitation
            .as_ref()
            .map(|l| l.auth_required)
            .unwrap_or(false)
    }
}

/// GET the relay's info document over the scheme-translated HTTP URL.
pub async fn fetch_relay_information(url: &RelayUrl) -> Result<RelayInformation, InfoError> {
    let http_url = url.to_http();
    debug!(url = %url, "fetching relay info document");
    tokio::task::spawn_blocking(move || {
        let response = ureq::get(&http_url)
            .set("Accept", "application/nostr+json")
            .timeout(std::time::Duration::from_secs(FETCH_TIMEOUT_SECS))
            .call()
            .map_err(|e| InfoError::Request(e.to_string()))?;
        response
            .into_json::<RelayInformation>()
            .map_err(|e| InfoError::Malformed(e.to_string()))
    })
    .await
    .map_err(|_| InfoError::Cancelled)?
}
