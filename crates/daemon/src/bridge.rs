//! Challenge/response bridge
//!
//! Holds the HTTP-01 responses the CA will fetch while an automated
//! issuance is in flight. Sources publish a value under its full URL path
//! (`/.well-known/acme-challenge/<token>`) and the plain HTTP responder looks
//! paths up on request, answering 404 on a miss.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// URL path the CA requests for an HTTP-01 token
pub fn challenge_path(token: &str) -> String {
    format!("{}{}", ACME_CHALLENGE_PREFIX, token)
}

/// Shared map of URL path to response body
///
/// Cloning shares the underlying map. Entries have no TTL; the issuing flow
/// clears what it sets on both success and failure (see [`ChallengeGuard`]).
#[derive(Debug, Clone, Default)]
pub struct ChallengeResponder {
    responses: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl ChallengeResponder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a response body at `path`
    pub fn set(&self, path: &str, value: impl Into<Vec<u8>>) {
        debug!(path = %path, "Publishing challenge response");
        self.responses.write().insert(path.to_string(), value.into());
    }

    /// Remove the response at `path`, if any
    pub fn clear(&self, path: &str) {
        if self.responses.write().remove(path).is_some() {
            debug!(path = %path, "Cleared challenge response");
        }
    }

    /// Response body for a requested path
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        let result = self.responses.read().get(path).cloned();
        trace!(path = %path, found = result.is_some(), "Challenge lookup");
        result
    }

    /// Number of published responses
    pub fn pending_count(&self) -> usize {
        self.responses.read().len()
    }

    /// Publish a response and return a guard that clears it when dropped
    pub fn publish(&self, path: &str, value: impl Into<Vec<u8>>) -> ChallengeGuard {
        self.set(path, value);
        ChallengeGuard {
            responder: self.clone(),
            path: path.to_string(),
        }
    }
}

/// Clears its published challenge response on drop
#[derive(Debug)]
#[must_use = "the challenge response is cleared as soon as the guard is dropped"]
pub struct ChallengeGuard {
    responder: ChallengeResponder,
    path: String,
}

impl ChallengeGuard {
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for ChallengeGuard {
    fn drop(&mut self) {
        self.responder.clear(&self.path);
    }
}
