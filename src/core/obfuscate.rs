//! Deterministic scope obfuscation for agent-visible records.
//!
//! Hidden-requirement discovery depends on scope labels not leaking their
//! meaning: a raw scope like `divisible_by_7` would hand the agent the rule
//! on a plate. Scopes outside a small transparent set are replaced by a
//! stable short token derived from the scope text alone, so the same raw
//! scope maps to the same token in every run.

use sha2::{Digest, Sha256};

/// Scopes passed through verbatim.
pub const TRANSPARENT_SCOPES: [&str; 6] =
    ["error", "unknown", "consistency", "direct", "ordering", "nested"];

/// Length of the hex digest prefix in obfuscated tokens.
const TOKEN_HEX_LEN: usize = 6;

/// Whether a raw scope is emitted without obfuscation.
pub fn is_transparent(scope: &str) -> bool {
    TRANSPARENT_SCOPES.contains(&scope)
}

/// Map a raw scope to its agent-visible form.
///
/// Transparent scopes pass through; everything else becomes
/// `scope_<first 6 hex of SHA-256(scope)>`. The digest function is part of
/// the wire contract and must never change: agents may correlate tokens
/// across runs.
pub fn obfuscate_scope(scope: &str) -> String {
    if is_transparent(scope) {
        return scope.to_string();
    }
    let digest = Sha256::digest(scope.as_bytes());
    let hex = hex::encode(digest);
    format!("scope_{}", &hex[..TOKEN_HEX_LEN])
}
