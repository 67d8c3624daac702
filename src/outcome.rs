//! Events handed to the aggregation pipeline by request-issuing workers.
//!
//! Each worker executes the scenario once per iteration, recording one
//! [`RequestOutcome`] for every scenario item it attempts. When the iteration
//! finishes, the outcomes are grouped into an [`IterationEnvelope`] and sent on
//! the delivery queue to the [`AggregationEngine`](../engine/struct.AggregationEngine.html).
//!
//! Items skipped because an earlier item in the same iteration failed fatally are
//! simply absent from the envelope.

use chrono::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use strum_macros::{Display, EnumIter, EnumString};

/// Well-known error reason codes.
///
/// Reasons are plain strings so workers can report reasons not listed here; the
/// reason is used as-is as the key of the per-item error distribution.
pub mod reason {
    /// The proxy refused or dropped the connection.
    pub const PROXY_FAILED: &str = "proxy-failed";
    /// The proxy did not answer in time.
    pub const PROXY_TIMEOUT: &str = "proxy-timeout";
    /// The connection to the target could not be established in time.
    pub const CONNECTION_TIMEOUT: &str = "connection-timeout";
    /// The target refused the connection.
    pub const CONNECTION_REFUSED: &str = "connection-refused";
    /// The response was not read in time.
    pub const READ_TIMEOUT: &str = "read-timeout";
    /// The request was canceled before it completed.
    pub const CONTEXT_CANCELED: &str = "context-canceled";
}

/// Coarse classification of a failed request.
///
/// The aggregation pipeline never looks at the kind, only at the reason. The kind
/// is carried so reporters and request logs can group failures if they want to.
#[derive(
    Clone, Copy, Debug, Display, EnumIter, EnumString, Eq, Hash, PartialEq, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
#[serde(rename_all = "kebab-case")]
pub enum RequestErrorKind {
    Proxy,
    Connection,
    Dns,
    Parse,
    Address,
    InvalidRequest,
    Intended,
    Unknown,
}

/// A classified request failure.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct RequestError {
    /// What layer the failure happened in.
    pub kind: RequestErrorKind,
    /// Specific reason code, for example [`reason::CONNECTION_TIMEOUT`].
    pub reason: String,
}
impl RequestError {
    pub fn new(kind: RequestErrorKind, reason: &str) -> Self {
        RequestError {
            kind,
            reason: reason.to_string(),
        }
    }
}

/// The recorded result of attempting one scenario item once.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    /// Which scenario item this request belongs to.
    pub scenario_item_id: u16,
    /// When the request was sent.
    pub request_time: DateTime<Utc>,
    /// The returned status code, `None` if no status was received.
    pub status_code: Option<u16>,
    /// Total wall time of the attempt.
    pub duration: Duration,
    /// Per-component latencies (dns, connection, tls, ...), keyed by component name.
    pub timing_breakdown: HashMap<String, Duration>,
    /// Set if the request failed.
    pub error: Option<RequestError>,
}
impl RequestOutcome {
    pub fn new(scenario_item_id: u16, duration: Duration) -> Self {
        RequestOutcome {
            scenario_item_id,
            request_time: Utc::now(),
            status_code: None,
            duration,
            timing_breakdown: HashMap::new(),
            error: None,
        }
    }

    /// Record the returned status code. A code of `0` means no status was received.
    pub fn set_status_code(&mut self, status_code: u16) {
        self.status_code = if status_code == 0 {
            None
        } else {
            Some(status_code)
        };
    }

    /// Mark the outcome as failed.
    pub fn set_error(&mut self, kind: RequestErrorKind, reason: &str) {
        self.error = Some(RequestError::new(kind, reason));
    }

    /// Record how long one latency component took.
    pub fn add_timing(&mut self, component: &str, elapsed: Duration) {
        self.timing_breakdown.insert(component.to_string(), elapsed);
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// All outcomes recorded during one iteration of the scenario.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IterationEnvelope {
    /// When the iteration started.
    pub start_time: DateTime<Utc>,
    /// One outcome per attempted scenario item, in execution order.
    pub outcomes: Vec<RequestOutcome>,
}
impl IterationEnvelope {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        IterationEnvelope {
            start_time,
            outcomes: Vec::new(),
        }
    }

    pub fn push(&mut self, outcome: RequestOutcome) {
        self.outcomes.push(outcome);
    }

    /// Sum of the durations of every outcome in the iteration.
    pub fn total_duration(&self) -> Duration {
        self.outcomes.iter().map(|outcome| outcome.duration).sum()
    }

    /// An iteration fails if any of its outcomes failed.
    pub fn has_failure(&self) -> bool {
        self.outcomes.iter().any(|outcome| !outcome.is_success())
    }
}
