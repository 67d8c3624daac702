//! Volley prelude.

pub use crate::config::VolleyConfiguration;
pub use crate::engine::{AggregationEngine, Completion, CompletionSignal};
pub use crate::metrics::{RunAggregate, RunProgress, ScenarioItemAggregate, TOTAL_DURATION_KEY};
pub use crate::outcome::{
    reason, IterationEnvelope, RequestError, RequestErrorKind, RequestOutcome,
};
pub use crate::report::{
    ConsoleReporter, JsonReporter, ReportFormat, Reporter, ReporterCore,
};
pub use crate::{ReportPipeline, VolleyError};
