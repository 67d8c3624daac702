use chrono::Utc;
use gumdrop::Options;
use std::time::Duration;

use volley::outcome::{IterationEnvelope, RequestErrorKind, RequestOutcome};
use volley::VolleyConfiguration;

/// Not all functions are used by all tests, so we enable allow(dead_code) to avoid
/// compiler warnings during testing.

/// Build a configuration from command line style options.
#[allow(dead_code)]
pub fn build_configuration(custom: Vec<&str>) -> VolleyConfiguration {
    VolleyConfiguration::parse_args_default(&custom)
        .expect("failed to parse options and generate a configuration")
}

/// A successful outcome with dns and connection timings, all in seconds.
#[allow(dead_code)]
pub fn success(id: u16, status_code: u16, duration: u64, dns: u64, conn: u64) -> RequestOutcome {
    let mut outcome = RequestOutcome::new(id, Duration::from_secs(duration));
    outcome.set_status_code(status_code);
    outcome.add_timing("dnsDuration", Duration::from_secs(dns));
    outcome.add_timing("connDuration", Duration::from_secs(conn));
    outcome
}

/// A failed outcome that never received a status code.
#[allow(dead_code)]
pub fn failure(id: u16, reason: &str, duration: u64, dns: u64, conn: u64) -> RequestOutcome {
    let mut outcome = success(id, 0, duration, dns, conn);
    outcome.set_error(RequestErrorKind::Connection, reason);
    outcome
}

#[allow(dead_code)]
pub fn iteration(outcomes: Vec<RequestOutcome>) -> IterationEnvelope {
    let mut envelope = IterationEnvelope::new(Utc::now());
    for outcome in outcomes {
        envelope.push(outcome);
    }
    envelope
}

/// Compare floats produced by running means.
#[allow(dead_code)]
pub fn assert_close(found: f64, expected: f64) {
    assert!(
        (found - expected).abs() < 1e-9,
        "expected {} found {}",
        expected,
        found
    );
}
