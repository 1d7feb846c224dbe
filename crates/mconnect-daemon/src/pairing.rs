//! Pairing codes and bearer tokens.
//!
//! A pairing code is a short-lived, single-use, human-readable handle that a
//! mobile browser exchanges at `GET /api/pair` for the session's long-lived
//! bearer token. Tokens are opaque 128-bit random strings compared in
//! constant time and are invalidated when their session completes.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use rand::Rng;
use tracing::{debug, info};

/// Code alphabet: uppercase alphanumerics minus the easily confused 0/O/1/I.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 6;

/// Pairing codes live at most five minutes.
pub const CODE_TTL_MS: u64 = 5 * 60 * 1_000;

/// Constant-time string comparison to prevent timing side channels.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Generate a bearer token: 32 hex characters (128 bits of entropy).
pub fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.r#gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug, Clone)]
struct PairingRecord {
    session_id: String,
    token: String,
    expires_at_ms: u64,
}

/// Outcome of a pairing-code validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidateOutcome {
    Valid { token: String, session_id: String },
    Expired,
    Invalid,
}

/// Process-wide pairing-code broker. Codes are single-use; expired entries
/// are swept opportunistically on every call.
#[derive(Default)]
pub struct PairingManager {
    codes: Mutex<HashMap<String, PairingRecord>>,
}

impl PairingManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PairingRecord>> {
        match self.codes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Create a fresh code bound to a session and its token.
    pub fn create_code(&self, session_id: &str, token: &str, now_ms: u64) -> String {
        let mut codes = self.lock();
        codes.retain(|_, record| record.expires_at_ms > now_ms);

        // Regenerate on the (unlikely) collision with a live code.
        let mut code = generate_code();
        while codes.contains_key(&code) {
            code = generate_code();
        }

        codes.insert(
            code.clone(),
            PairingRecord {
                session_id: session_id.to_string(),
                token: token.to_string(),
                expires_at_ms: now_ms + CODE_TTL_MS,
            },
        );
        info!(
            event = "daemon.pairing.code_created",
            session_id = session_id,
        );
        code
    }

    /// Validate and consume a code. A hit purges the code (single use); an
    /// expired code is purged and reported distinctly from an unknown one.
    pub fn validate_code(&self, code: &str, now_ms: u64) -> ValidateOutcome {
        let mut codes = self.lock();
        let Some(record) = codes.remove(code) else {
            debug!(event = "daemon.pairing.code_unknown");
            return ValidateOutcome::Invalid;
        };
        if record.expires_at_ms <= now_ms {
            debug!(event = "daemon.pairing.code_expired");
            return ValidateOutcome::Expired;
        }
        info!(
            event = "daemon.pairing.code_redeemed",
            session_id = %record.session_id,
        );
        ValidateOutcome::Valid {
            token: record.token,
            session_id: record.session_id,
        }
    }

    pub fn live_code_count(&self, now_ms: u64) -> usize {
        self.lock()
            .values()
            .filter(|r| r.expires_at_ms > now_ms)
            .count()
    }
}

/// Bearer tokens, scoped one per session.
#[derive(Default)]
pub struct TokenStore {
    tokens: Mutex<HashMap<String, String>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        match self.tokens.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Issue (or return the existing) token for a session.
    pub fn issue(&self, session_id: &str) -> String {
        let mut tokens = self.lock();
        tokens
            .entry(session_id.to_string())
            .or_insert_with(generate_token)
            .clone()
    }

    pub fn token_for(&self, session_id: &str) -> Option<String> {
        self.lock().get(session_id).cloned()
    }

    /// Resolve a presented token to the session it is scoped to.
    pub fn session_for(&self, token: &str) -> Option<String> {
        self.lock()
            .iter()
            .find(|(_, t)| constant_time_eq(t, token))
            .map(|(session_id, _)| session_id.clone())
    }

    /// Drop a session's token (called when the session completes).
    pub fn invalidate(&self, session_id: &str) {
        if self.lock().remove(session_id).is_some() {
            info!(
                event = "daemon.pairing.token_invalidated",
                session_id = session_id,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc123", "abc123"));
        assert!(!constant_time_eq("abc123", "abc124"));
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn test_token_entropy_and_format() {
        let token = generate_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate_token(), generate_token());
    }

    #[test]
    fn test_code_alphabet_excludes_confusables() {
        for _ in 0..50 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            for c in code.chars() {
                assert!(!"0O1I".contains(c), "confusable char in code: {code}");
                assert!(c.is_ascii_uppercase() || c.is_ascii_digit());
            }
        }
    }

    #[test]
    fn test_code_roundtrip_single_use() {
        let mgr = PairingManager::new();
        let code = mgr.create_code("s1", "tok", 1_000);

        match mgr.validate_code(&code, 2_000) {
            ValidateOutcome::Valid { token, session_id } => {
                assert_eq!(token, "tok");
                assert_eq!(session_id, "s1");
            }
            other => panic!("expected Valid, got {:?}", other),
        }

        // Immediately repeating the exchange fails: the code was consumed.
        assert_eq!(mgr.validate_code(&code, 2_001), ValidateOutcome::Invalid);
    }

    #[test]
    fn test_code_expiry() {
        let mgr = PairingManager::new();
        let code = mgr.create_code("s1", "tok", 1_000);

        // 5 minutes + 1 ms later the code reports expired.
        let outcome = mgr.validate_code(&code, 1_000 + CODE_TTL_MS + 1);
        assert_eq!(outcome, ValidateOutcome::Expired);
        // And it was purged: a retry is plain invalid.
        assert_eq!(
            mgr.validate_code(&code, 1_000 + CODE_TTL_MS + 2),
            ValidateOutcome::Invalid
        );
    }

    #[test]
    fn test_expired_codes_swept_on_create() {
        let mgr = PairingManager::new();
        mgr.create_code("s1", "tok", 1_000);
        assert_eq!(mgr.live_code_count(2_000), 1);

        // Creating a new code past the TTL sweeps the stale one.
        mgr.create_code("s2", "tok2", 1_000 + CODE_TTL_MS + 1);
        assert_eq!(mgr.live_code_count(1_000 + CODE_TTL_MS + 2), 1);
    }

    #[test]
    fn test_unknown_code_invalid() {
        let mgr = PairingManager::new();
        assert_eq!(mgr.validate_code("ZZZZZZ", 0), ValidateOutcome::Invalid);
    }

    #[test]
    fn test_token_store_issue_is_stable() {
        let store = TokenStore::new();
        let t1 = store.issue("s1");
        let t2 = store.issue("s1");
        assert_eq!(t1, t2);
        assert_eq!(store.token_for("s1"), Some(t1.clone()));
        assert_eq!(store.session_for(&t1).as_deref(), Some("s1"));
    }

    #[test]
    fn test_token_store_invalidate() {
        let store = TokenStore::new();
        let token = store.issue("s1");
        store.invalidate("s1");
        assert!(store.token_for("s1").is_none());
        assert!(store.session_for(&token).is_none());
        // Re-issue generates a fresh token.
        assert_ne!(store.issue("s1"), token);
    }
}
