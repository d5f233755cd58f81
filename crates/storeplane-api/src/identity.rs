//! Caller identity
//!
//! Identity is an opaque string trusted from an upstream header; no
//! authentication happens here. A missing or empty header resolves to the
//! `default` identity, and an explicit owner on the request wins over the
//! caller identity.

use axum::http::HeaderMap;

/// Header carrying the opaque caller identity
pub const IDENTITY_HEADER: &str = "x-user-id";

/// The identity used when the header is missing or empty
pub const DEFAULT_IDENTITY: &str = "default";

/// Extract the caller identity from request headers.
pub fn caller_identity(headers: &HeaderMap) -> String {
    headers
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_IDENTITY)
        .to_string()
}

/// Resolve the owner for a create request: an explicit owner wins, an
/// empty or `default` owner falls back to the caller identity.
pub fn resolve_owner(requested: Option<&str>, caller: &str) -> String {
    match requested {
        Some(owner) if !owner.is_empty() && owner != DEFAULT_IDENTITY => owner.to_string(),
        _ => caller.to_string(),
    }
}

/// Privileged identities may see and act on every owner's stores.
#[derive(Debug, Clone, Default)]
pub struct Privileged(Vec<String>);

impl Privileged {
    pub fn new(identities: Vec<String>) -> Self {
        Self(identities)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.0.iter().any(|p| p == identity)
    }
}

/// Whether `caller` may see a store owned by `owner`.
pub fn can_see(caller: &str, owner: &str, privileged: &Privileged) -> bool {
    caller == owner || privileged.contains(caller)
}
