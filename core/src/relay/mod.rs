//! Relay connections — identity, connectivity, pool, selection
//!
//! A relay is identified by its normalized websocket URL. The pool is
//! the sole owner of live relay handles; every other component keeps
//! `RelayUrl` keys and resolves them through the pool.

pub mod connectivity;
pub mod info;
pub mod pool;
pub mod sets;

pub use connectivity::{ConnectionStats, Relay, RelayEvent, RelayStatus};
pub use info::{RelayInformation, RelayLimitation};
pub use pool::{PoolEvent, PoolStats, RelayPool};
pub use sets::{calculate_relay_sets, correct_relay_set, OutboxSnapshot, RelaySetMapping};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Relay addressing error types
#[derive(Debug, Clone, Error)]
pub enum RelayUrlError {
    #[error("Invalid relay URL: {0}")]
    Invalid(String),
    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),
}

/// Normalized relay URL.
///
/// Scheme and host are lower-cased, the default path gets a trailing
/// slash, and any fragment is stripped, so two spellings of the same
/// relay always collide in pool and ledger maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelayUrl(String);

impl RelayUrl {
    /// Parse and normalize a relay URL. Accepts `ws`/`wss` schemes.
    pub fn parse(raw: &str) -> Result<Self, RelayUrlError> {
        let mut url =
            url::Url::parse(raw.trim()).map_err(|e| RelayUrlError::Invalid(e.to_string()))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(RelayUrlError::UnsupportedScheme(other.to_string())),
        }
        url.set_fragment(None);
        // url already lower-cases scheme and host during parsing;
        // normalize the empty path to "/" so keys compare equal
        if url.path().is_empty() {
            url.set_path("/");
        }
        Ok(Self(url.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The HTTP(S) translation of this URL, for the info document.
    pub fn to_http(&self) -> String {
        if let Some(rest) = self.0.strip_prefix("wss://") {
            format!("https://{rest}")
        } else if let Some(rest) = self.0.strip_prefix("ws://") {
            format!("http://{rest}")
        } else {
            self.0.clone()
        }
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for RelayUrl {
    type Err = RelayUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization_lowercases_and_adds_slash() {
        let url = RelayUrl::parse("WSS://Relay.Example.COM").unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com/");
    }

    #[test]
    fn test_normalization_strips_fragment() {
        let url = RelayUrl::parse("wss://relay.example.com/path#frag").unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com/path");
    }

    #[test]
    fn test_equal_spellings_collide() {
        let a = RelayUrl::parse("wss://relay.example.com").unwrap();
        let b = RelayUrl::parse("wss://RELAY.example.com/").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_non_websocket_schemes() {
        assert!(matches!(
            RelayUrl::parse("https://relay.example.com"),
            Err(RelayUrlError::UnsupportedScheme(_))
        ));
        assert!(RelayUrl::parse("not a url").is_err());
    }

    #[test]
    fn test_http_translation() {
        let wss = RelayUrl::parse("wss://relay.example.com").unwrap();
        assert_eq!(wss.to_http(), "https://relay.example.com/");
        let ws = RelayUrl::parse("ws://127.0.0.1:7777").unwrap();
        assert_eq!(ws.to_http(), "http://127.0.0.1:7777/");
    }
}
