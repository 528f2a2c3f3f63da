//! Client identity keys.

use crate::storage::blocked_key;

/// The identity a request is counted against.
///
/// A non-empty API token always wins over the client IP.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateKey {
    /// Counted per client address, stored as `ip:<addr>`
    Ip(String),
    /// Counted per API token, stored as `token:<value>`
    Token(String),
}

impl RateKey {
    /// Classify a request by its token if one is present, else by IP.
    ///
    /// An empty token counts as no token. An empty IP is not special-cased
    /// and yields the key `ip:`.
    pub fn classify(ip: &str, token: Option<&str>) -> Self {
        match token.filter(|t| !t.is_empty()) {
            Some(token) => RateKey::Token(token.to_string()),
            None => RateKey::Ip(ip.to_string()),
        }
    }

    /// Name of this key's block marker, `<key>:blocked`.
    pub fn blocked_marker(&self) -> String {
        blocked_key(&self.to_string())
    }

    pub fn is_token(&self) -> bool {
        matches!(self, RateKey::Token(_))
    }
}

impl std::fmt::Display for RateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateKey::Ip(ip) => write!(f, "ip:{}", ip),
            RateKey::Token(token) => write!(f, "token:{}", token),
        }
    }
}
