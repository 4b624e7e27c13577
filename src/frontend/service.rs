//! Admission request handling.

use std::sync::Arc;

use serde::Serialize;
use tracing::{instrument, trace, warn};

use crate::error::GatekeeperError;
use crate::ratelimit::{ClientKey, Limiter, Verdict};

/// One output line of the front end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum AdmissionResponse {
    /// The limiter's decision for a client
    Decision {
        key: String,
        #[serde(flatten)]
        verdict: Verdict,
    },
    /// The input line could not be turned into a client key
    Error { error: String },
}

/// Turns request lines into admission decisions.
#[derive(Debug, Clone)]
pub struct AdmissionService {
    /// The limiter instance
    limiter: Arc<Limiter>,
}

impl AdmissionService {
    /// Create a new AdmissionService with the given limiter.
    pub fn new(limiter: Arc<Limiter>) -> Self {
        Self { limiter }
    }

    /// Decide one request line.
    ///
    /// Returns `None` for blank lines, which carry no request.
    #[instrument(level = "trace", skip(self))]
    pub fn handle_line(&self, line: &str) -> Option<AdmissionResponse> {
        if line.trim().is_empty() {
            return None;
        }

        let key = match ClientKey::parse(line) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "Received admission request with unusable identity");
                return Some(AdmissionResponse::Error {
                    error: e.to_string(),
                });
            }
        };

        let verdict = self.limiter.check(key.as_str());
        trace!(key = %key, ?verdict, "Admission decision made");

        Some(AdmissionResponse::Decision {
            key: key.to_string(),
            verdict,
        })
    }

    /// Answer a line that could not be read as an identity at all.
    pub fn reject(&self, reason: &str) -> AdmissionResponse {
        let error = GatekeeperError::InvalidKey(reason.to_string());
        warn!(error = %error, "Received unreadable admission request");
        AdmissionResponse::Error {
            error: error.to_string(),
        }
    }
}
