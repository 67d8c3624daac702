//! # Volley
//!
//! Volley turns the stream of request outcomes produced by a load test into
//! live, human- and machine-readable statistics.
//!
//! Request-issuing workers record one [`RequestOutcome`](outcome/struct.RequestOutcome.html)
//! per scenario item they attempt, group the outcomes of one run through the
//! scenario into an [`IterationEnvelope`](outcome/struct.IterationEnvelope.html), and
//! send it on a bounded [`flume`](https://docs.rs/flume/) channel. Each
//! [`Reporter`](report/trait.Reporter.html) drains its own copy of that channel
//! with a private [`AggregationEngine`](engine/struct.AggregationEngine.html),
//! folding every envelope into a [`RunAggregate`](metrics/struct.RunAggregate.html):
//!  - per scenario item: success and failure counts and percentages, a status code
//!    distribution, an error reason distribution, and the mean of every latency
//!    component plus the mean total duration,
//!  - per run: successful and failed iterations, and the mean iteration duration.
//!
//! Closing the channel (dropping every sender) ends the run. Each reporter then
//! renders the finalized aggregate and fires its completion signal.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use volley::prelude::*;
//!
//! fn main() -> Result<(), VolleyError> {
//!     let pipeline = ReportPipeline::initialize_with_config(VolleyConfiguration::default())?
//!         .register_reporter(Box::new(JsonReporter::new()));
//!     let (tx, rx) = pipeline.queue();
//!
//!     let worker = std::thread::spawn(move || {
//!         for _ in 0..10 {
//!             let mut iteration = IterationEnvelope::new(chrono::Utc::now());
//!             let mut outcome = RequestOutcome::new(1, Duration::from_millis(12));
//!             outcome.set_status_code(200);
//!             outcome.add_timing("dnsDuration", Duration::from_millis(2));
//!             iteration.push(outcome);
//!             if tx.send(iteration).is_err() {
//!                 break;
//!             }
//!         }
//!         // Dropping the last sender closes the queue.
//!     });
//!
//!     let aggregates = pipeline.execute(rx)?;
//!     let _ = worker.join();
//!     assert_eq!(aggregates[0].success_count, 10);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## License
//!
//! Licensed under the Apache License, Version 2.0 (the "License");
//! you may not use this file except in compliance with the License.
//! You may obtain a copy of the License at
//!
//! <http://www.apache.org/licenses/LICENSE-2.0>

#[macro_use]
extern crate log;

pub mod config;
pub mod engine;
pub mod metrics;
pub mod outcome;
pub mod prelude;
pub mod report;
pub mod util;

use gumdrop::Options;
use std::sync::Arc;
use std::{fmt, io};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

pub use crate::config::VolleyConfiguration;
use crate::metrics::RunAggregate;
use crate::outcome::IterationEnvelope;
use crate::report::{fan_out, new_reporter, Reporter};

/// An enumeration of all errors a [`ReportPipeline`](./struct.ReportPipeline.html) can return.
#[derive(Debug)]
pub enum VolleyError {
    /// Wraps a [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    Io(io::Error),
    /// Wraps a [`tokio::task::JoinError`](https://docs.rs/tokio/latest/tokio/task/struct.JoinError.html).
    TokioJoin(tokio::task::JoinError),
    /// Invalid option or value specified, may only be invalid in context.
    InvalidOption {
        /// The invalid option that caused this error, may be only invalid in context.
        option: String,
        /// The invalid value that caused this error, may be only invalid in context.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// A reporter was started, or its completion requested, before it was initialized.
    NotInitialized {
        /// The reporter's name.
        reporter: String,
    },
    /// A reporter was initialized more than once.
    AlreadyInitialized {
        /// The reporter's name.
        reporter: String,
    },
    /// A reporter was started more than once.
    AlreadyStarted {
        /// The reporter's name.
        reporter: String,
    },
    /// A completion signal went away without the run being finalized.
    Aborted {
        /// An optional explanation of the error.
        detail: String,
    },
}
/// Implement a helper to provide a text description of all possible types of errors.
impl VolleyError {
    fn describe(&self) -> &str {
        match *self {
            VolleyError::Io(_) => "io::Error",
            VolleyError::TokioJoin(_) => "tokio::task::JoinError",
            VolleyError::InvalidOption { .. } => "invalid option or value specified",
            VolleyError::NotInitialized { .. } => "reporter not initialized",
            VolleyError::AlreadyInitialized { .. } => "reporter already initialized",
            VolleyError::AlreadyStarted { .. } => "reporter already started",
            VolleyError::Aborted { .. } => "aggregation aborted",
        }
    }
}

/// Implement format trait to allow displaying errors.
impl fmt::Display for VolleyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            VolleyError::Io(ref source) => {
                write!(f, "VolleyError: {} ({})", self.describe(), source)
            }
            VolleyError::TokioJoin(ref source) => {
                write!(f, "VolleyError: {} ({})", self.describe(), source)
            }
            VolleyError::InvalidOption { ref detail, .. } | VolleyError::Aborted { ref detail } => {
                write!(f, "VolleyError: {} ({})", self.describe(), detail)
            }
            VolleyError::NotInitialized { ref reporter }
            | VolleyError::AlreadyInitialized { ref reporter }
            | VolleyError::AlreadyStarted { ref reporter } => {
                write!(f, "VolleyError: {} ({})", self.describe(), reporter)
            }
        }
    }
}

// Define the lower level source of this error, if any.
impl std::error::Error for VolleyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            VolleyError::Io(ref source) => Some(source),
            VolleyError::TokioJoin(ref source) => Some(source),
            _ => None,
        }
    }
}

/// Auto-convert IO errors.
impl From<io::Error> for VolleyError {
    fn from(err: io::Error) -> VolleyError {
        VolleyError::Io(err)
    }
}

/// Auto-convert TokioJoin errors.
impl From<tokio::task::JoinError> for VolleyError {
    fn from(err: tokio::task::JoinError) -> VolleyError {
        VolleyError::TokioJoin(err)
    }
}

/// Wires the producer-facing queue to every reporter and waits for them to finish.
pub struct ReportPipeline {
    configuration: VolleyConfiguration,
    reporters: Vec<Box<dyn Reporter>>,
}
impl ReportPipeline {
    /// Load configuration from the command line and initialize a pipeline.
    ///
    /// # Example
    /// ```rust,no_run
    /// use volley::prelude::*;
    ///
    /// let pipeline = ReportPipeline::initialize();
    /// ```
    pub fn initialize() -> Result<ReportPipeline, VolleyError> {
        ReportPipeline::initialize_with_config(VolleyConfiguration::parse_args_default_or_exit())
    }

    /// Initialize a pipeline with an already loaded configuration.
    pub fn initialize_with_config(
        configuration: VolleyConfiguration,
    ) -> Result<ReportPipeline, VolleyError> {
        configuration.validate()?;
        Ok(ReportPipeline {
            configuration,
            reporters: Vec::new(),
        })
    }

    /// Add a reporter. When none are registered, reporters are built from the
    /// configured `--output` formats.
    pub fn register_reporter(mut self, reporter: Box<dyn Reporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    pub fn configuration(&self) -> &VolleyConfiguration {
        &self.configuration
    }

    /// Create the producer-facing delivery queue.
    ///
    /// Workers clone the sender; the run ends when every sender is dropped.
    pub fn queue(
        &self,
    ) -> (
        flume::Sender<IterationEnvelope>,
        flume::Receiver<IterationEnvelope>,
    ) {
        flume::bounded(self.configuration.delivery_queue_capacity())
    }

    /// Start every reporter on `rx` and wait until all of them have rendered.
    ///
    /// Returns each reporter's finalized aggregate, in registration order. Logging
    /// is not set up here; call
    /// [`VolleyConfiguration::initialize_logger`](./config/struct.VolleyConfiguration.html#method.initialize_logger)
    /// first, or use [`execute`](#method.execute) which does.
    pub async fn run(
        mut self,
        rx: flume::Receiver<IterationEnvelope>,
    ) -> Result<Vec<Arc<RunAggregate>>, VolleyError> {
        if self.reporters.is_empty() {
            for format in self.configuration.outputs() {
                self.reporters
                    .push(new_reporter(format, &self.configuration));
            }
        }

        let mut completions = Vec::with_capacity(self.reporters.len());
        for reporter in self.reporters.iter_mut() {
            reporter.initialize()?;
            completions.push(reporter.completion()?);
        }

        // A single reporter drains the delivery queue directly.
        let (queues, forwarding) = if self.reporters.len() == 1 {
            (vec![rx], None)
        } else {
            let (queues, forwarding) = fan_out(
                rx,
                self.reporters.len(),
                self.configuration.delivery_queue_capacity(),
            );
            (queues, Some(forwarding))
        };

        for (reporter, queue) in self.reporters.iter_mut().zip(queues) {
            info!("starting {} reporter", reporter.name());
            reporter.start(queue).await?;
        }

        finish_run(completions, forwarding).await
    }

    /// Initialize logging, then run the pipeline on a new tokio runtime, blocking
    /// until every reporter has rendered.
    pub fn execute(
        self,
        rx: flume::Receiver<IterationEnvelope>,
    ) -> Result<Vec<Arc<RunAggregate>>, VolleyError> {
        self.configuration.initialize_logger();
        let rt = Runtime::new()?;
        rt.block_on(self.run(rx))
    }
}

/// Wait on every reporter, then on the task copying envelopes to them.
///
/// Reporters finalize when their queue closes, so a forwarding task that died
/// leaves them with partial data. That is reported as an error.
async fn finish_run(
    completions: Vec<engine::Completion>,
    forwarding: Option<JoinHandle<()>>,
) -> Result<Vec<Arc<RunAggregate>>, VolleyError> {
    let aggregates = report::wait_for_all(completions).await?;
    if let Some(forwarding) = forwarding {
        forwarding.await?;
    }
    Ok(aggregates)
}
