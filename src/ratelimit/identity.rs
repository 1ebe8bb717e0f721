//! Request identity classification.

use std::fmt;

/// Which request attribute an identity was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityKind {
    /// The `API_KEY` credential header
    Token,
    /// The peer network address
    Address,
}

impl IdentityKind {
    /// Short name used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityKind::Token => "token",
            IdentityKind::Address => "address",
        }
    }
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The key a request is counted under and the threshold that applies to it.
///
/// Token and address keys are stored unprefixed in the same key space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// The store key
    pub key: String,
    /// Where the key came from
    pub kind: IdentityKind,
    /// Maximum admitted requests before blocking
    pub limit: u64,
}

/// Derives an [`Identity`] from request metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classifier {
    token_limit: u64,
    address_limit: u64,
}

impl Classifier {
    /// Create a classifier with the per-token and per-address thresholds.
    pub fn new(token_limit: u64, address_limit: u64) -> Self {
        Self {
            token_limit,
            address_limit,
        }
    }

    /// Classify a request.
    ///
    /// A present, non-empty token wins and only the token threshold applies;
    /// otherwise the address and its threshold are used. The two are never
    /// combined.
    pub fn classify(&self, address: &str, token: Option<&str>) -> Identity {
        match token {
            Some(token) if !token.is_empty() => Identity {
                key: token.to_string(),
                kind: IdentityKind::Token,
                limit: self.token_limit,
            },
            _ => Identity {
                key: address.to_string(),
                kind: IdentityKind::Address,
                limit: self.address_limit,
            },
        }
    }
}
