//! Reporters render aggregated runs.
//!
//! Every reporter owns a private [`AggregationEngine`]. The lifecycle is always
//! the same:
//!  1. [`Reporter::initialize`] allocates the engine and the completion signal,
//!  2. [`Reporter::start`] spawns a task that drains the reporter's queue, renders
//!     the finalized [`RunAggregate`], and then fires the completion signal,
//!  3. [`Reporter::completion`] hands out a [`Completion`] to wait on.
//!
//! Calling these out of order is an error: initializing twice returns
//! [`VolleyError::AlreadyInitialized`], starting or asking for the completion
//! before initializing returns [`VolleyError::NotInitialized`], and starting twice
//! returns [`VolleyError::AlreadyStarted`].
//!
//! When several reporters observe one run, [`fan_out`] copies every envelope from
//! the producer-facing queue into one queue per reporter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::{Display, EnumIter, EnumString};
use tokio::task::JoinHandle;

use crate::config::VolleyConfiguration;
use crate::engine::{AggregationEngine, Completion, CompletionSignal};
use crate::metrics::RunAggregate;
use crate::outcome::IterationEnvelope;
use crate::VolleyError;

/// Built-in report outputs, selected with `--output`.
#[derive(
    Clone, Copy, Debug, Display, EnumIter, EnumString, Eq, Hash, PartialEq, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
#[serde(rename_all = "kebab-case")]
pub enum ReportFormat {
    /// Human readable tables on stdout.
    Console,
    /// Pretty printed JSON on stdout.
    Json,
}

/// A consumer of the iteration stream.
#[async_trait]
pub trait Reporter: Send {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Allocate the reporter's engine and completion signal. Must be called
    /// exactly once, before [`Reporter::start`].
    fn initialize(&mut self) -> Result<(), VolleyError>;

    /// Start draining `rx` on a background task and return immediately.
    async fn start(
        &mut self,
        rx: flume::Receiver<IterationEnvelope>,
    ) -> Result<(), VolleyError>;

    /// A handle that resolves once the run has been finalized and rendered.
    fn completion(&self) -> Result<Completion, VolleyError>;
}

enum ReporterState {
    Uninitialized,
    Initialized {
        engine: AggregationEngine,
        done: CompletionSignal,
    },
    Started,
}

/// Lifecycle bookkeeping shared by the built-in reporters.
pub struct ReporterCore {
    name: &'static str,
    state: ReporterState,
    completion: Option<Completion>,
}
impl ReporterCore {
    pub fn new(name: &'static str) -> Self {
        ReporterCore {
            name,
            state: ReporterState::Uninitialized,
            completion: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn initialize(&mut self) -> Result<(), VolleyError> {
        if !matches!(self.state, ReporterState::Uninitialized) {
            return Err(VolleyError::AlreadyInitialized {
                reporter: self.name.to_string(),
            });
        }
        let done = CompletionSignal::new();
        self.completion = Some(done.subscribe());
        self.state = ReporterState::Initialized {
            engine: AggregationEngine::new(),
            done,
        };
        debug!("initialized {} reporter", self.name);
        Ok(())
    }

    /// Take the engine and the signal out of the core, marking it started.
    ///
    /// The core keeps no copy of the signal, so if the task owning it dies
    /// without firing, waiters get [`VolleyError::Aborted`].
    pub fn begin(&mut self) -> Result<(AggregationEngine, CompletionSignal), VolleyError> {
        match mem::replace(&mut self.state, ReporterState::Started) {
            ReporterState::Initialized { engine, done } => Ok((engine, done)),
            ReporterState::Uninitialized => {
                self.state = ReporterState::Uninitialized;
                Err(VolleyError::NotInitialized {
                    reporter: self.name.to_string(),
                })
            }
            ReporterState::Started => Err(VolleyError::AlreadyStarted {
                reporter: self.name.to_string(),
            }),
        }
    }

    pub fn completion(&self) -> Result<Completion, VolleyError> {
        self.completion
            .clone()
            .ok_or_else(|| VolleyError::NotInitialized {
                reporter: self.name.to_string(),
            })
    }
}

/// Spawn the task that aggregates, renders, and then signals completion.
///
/// With `running_metrics` set, a progress line is printed at that interval until
/// the queue closes.
fn spawn_reporter<F>(
    name: &'static str,
    engine: AggregationEngine,
    done: CompletionSignal,
    rx: flume::Receiver<IterationEnvelope>,
    running_metrics: Option<Duration>,
    render: F,
) where
    F: FnOnce(&RunAggregate) + Send + 'static,
{
    tokio::spawn(async move {
        let progress = engine.progress();
        let mut aggregating = tokio::spawn(engine.start(rx));

        let finished = match running_metrics {
            Some(every) => {
                let mut progress = progress;
                let mut timer = tokio::time::interval(every);
                // The first tick completes immediately.
                timer.tick().await;
                loop {
                    tokio::select! {
                        finished = &mut aggregating => break finished,
                        _ = timer.tick() => {
                            let snapshot = *progress.borrow_and_update();
                            println!(" RUNNING {}", snapshot);
                        }
                    }
                }
            }
            None => {
                drop(progress);
                aggregating.await
            }
        };

        match finished {
            Ok(aggregate) => {
                info!("{} reporter rendering final metrics", name);
                render(&aggregate);
                done.fire(aggregate);
            }
            Err(e) => {
                error!("{} reporter failed to aggregate: {}", name, e);
            }
        }
    });
}

/// Renders the finalized run as tables on stdout.
pub struct ConsoleReporter {
    core: ReporterCore,
    running_metrics: Option<Duration>,
}
impl ConsoleReporter {
    pub fn new() -> Self {
        ConsoleReporter {
            core: ReporterCore::new("console"),
            running_metrics: None,
        }
    }

    /// Also print a progress line at this interval while the run is going.
    ///
    /// A zero interval disables running metrics.
    pub fn set_running_metrics(mut self, every: Duration) -> Self {
        self.running_metrics = Some(every).filter(|every| !every.is_zero());
        self
    }
}
impl Default for ConsoleReporter {
    fn default() -> Self {
        ConsoleReporter::new()
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    fn name(&self) -> &'static str {
        self.core.name()
    }

    fn initialize(&mut self) -> Result<(), VolleyError> {
        self.core.initialize()
    }

    async fn start(
        &mut self,
        rx: flume::Receiver<IterationEnvelope>,
    ) -> Result<(), VolleyError> {
        let (engine, done) = self.core.begin()?;
        spawn_reporter(
            self.core.name(),
            engine,
            done,
            rx,
            self.running_metrics,
            |aggregate| print!("{}", aggregate),
        );
        Ok(())
    }

    fn completion(&self) -> Result<Completion, VolleyError> {
        self.core.completion()
    }
}

/// Renders the finalized run as JSON on stdout.
pub struct JsonReporter {
    core: ReporterCore,
}
impl JsonReporter {
    pub fn new() -> Self {
        JsonReporter {
            core: ReporterCore::new("json"),
        }
    }
}
impl Default for JsonReporter {
    fn default() -> Self {
        JsonReporter::new()
    }
}

#[async_trait]
impl Reporter for JsonReporter {
    fn name(&self) -> &'static str {
        self.core.name()
    }

    fn initialize(&mut self) -> Result<(), VolleyError> {
        self.core.initialize()
    }

    async fn start(
        &mut self,
        rx: flume::Receiver<IterationEnvelope>,
    ) -> Result<(), VolleyError> {
        let (engine, done) = self.core.begin()?;
        spawn_reporter(
            self.core.name(),
            engine,
            done,
            rx,
            None,
            |aggregate| match serde_json::to_string_pretty(aggregate) {
                Ok(json) => println!("{}", json),
                Err(e) => error!("failed to serialize aggregate: {}", e),
            },
        );
        Ok(())
    }

    fn completion(&self) -> Result<Completion, VolleyError> {
        self.core.completion()
    }
}

/// Build the reporter for a built-in format.
pub fn new_reporter(format: ReportFormat, configuration: &VolleyConfiguration) -> Box<dyn Reporter> {
    match format {
        ReportFormat::Console => {
            let mut reporter = ConsoleReporter::new();
            if let Some(every) = configuration.running_metrics_interval() {
                reporter = reporter.set_running_metrics(every);
            }
            Box::new(reporter)
        }
        ReportFormat::Json => Box::new(JsonReporter::new()),
    }
}

/// Copy every envelope from `rx` into `targets` new bounded queues.
///
/// The forwarding task ends, closing every returned queue, once `rx` is closed
/// and drained. A returned queue that is dropped early stops receiving copies
/// while the others carry on. Must be called from within a tokio runtime.
pub fn fan_out(
    rx: flume::Receiver<IterationEnvelope>,
    targets: usize,
    capacity: usize,
) -> (Vec<flume::Receiver<IterationEnvelope>>, JoinHandle<()>) {
    let (mut senders, receivers): (Vec<_>, Vec<_>) =
        (0..targets).map(|_| flume::bounded(capacity)).unzip();

    let handle = tokio::spawn(async move {
        while let Ok(envelope) = rx.recv_async().await {
            let mut closed = Vec::new();
            for (index, tx) in senders.iter().enumerate() {
                if tx.send_async(envelope.clone()).await.is_err() {
                    closed.push(index);
                }
            }
            for index in closed.into_iter().rev() {
                senders.remove(index);
                warn!(
                    "reporter queue closed early, {} queues still receiving",
                    senders.len()
                );
            }
        }
        debug!("delivery queue closed, closing {} reporter queues", senders.len());
    });

    (receivers, handle)
}

/// Wait for every reporter to finish rendering, in order.
pub async fn wait_for_all(
    completions: Vec<Completion>,
) -> Result<Vec<Arc<RunAggregate>>, VolleyError> {
    futures::future::try_join_all(completions.into_iter().map(|mut completion| async move {
        completion.wait().await
    }))
    .await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::outcome::RequestOutcome;
    use chrono::Utc;
    use std::str::FromStr;

    fn envelope(id: u16) -> IterationEnvelope {
        let mut envelope = IterationEnvelope::new(Utc::now());
        envelope.push(RequestOutcome::new(id, Duration::from_millis(5)));
        envelope
    }

    #[test]
    fn formats() {
        assert_eq!(ReportFormat::from_str("console"), Ok(ReportFormat::Console));
        assert_eq!(ReportFormat::from_str("JSON"), Ok(ReportFormat::Json));
        assert!(ReportFormat::from_str("html").is_err());
        assert_eq!(ReportFormat::Json.to_string(), "json");
    }

    #[test]
    fn initialize_twice_rejected() {
        let mut reporter = ConsoleReporter::new();
        assert!(reporter.initialize().is_ok());
        assert!(matches!(
            reporter.initialize(),
            Err(VolleyError::AlreadyInitialized { .. })
        ));
        // The first initialization is untouched.
        assert!(reporter.completion().is_ok());
    }

    #[test]
    fn completion_before_initialize_rejected() {
        let reporter = JsonReporter::new();
        assert!(matches!(
            reporter.completion(),
            Err(VolleyError::NotInitialized { .. })
        ));
    }

    #[tokio::test]
    async fn start_before_initialize_rejected() {
        let mut reporter = ConsoleReporter::new();
        let (_tx, rx) = flume::bounded(1);
        assert!(matches!(
            reporter.start(rx).await,
            Err(VolleyError::NotInitialized { .. })
        ));
        // Still usable afterwards.
        assert!(reporter.initialize().is_ok());
    }

    #[tokio::test]
    async fn zero_running_metrics_interval_disabled() {
        let mut reporter = ConsoleReporter::new().set_running_metrics(Duration::ZERO);
        assert!(reporter.running_metrics.is_none());

        reporter.initialize().unwrap();
        let mut completion = reporter.completion().unwrap();
        let (tx, rx) = flume::bounded(1);
        reporter.start(rx).await.unwrap();
        tx.send_async(envelope(1)).await.unwrap();
        drop(tx);

        let aggregate = tokio::time::timeout(Duration::from_secs(5), completion.wait())
            .await
            .expect("reporter never completed")
            .unwrap();
        assert_eq!(aggregate.success_count, 1);
    }

    #[tokio::test]
    async fn start_twice_rejected() {
        let mut reporter = JsonReporter::new();
        reporter.initialize().unwrap();
        let (tx, rx) = flume::bounded(1);
        reporter.start(rx.clone()).await.unwrap();
        assert!(matches!(
            reporter.start(rx).await,
            Err(VolleyError::AlreadyStarted { .. })
        ));
        assert!(matches!(
            reporter.initialize(),
            Err(VolleyError::AlreadyInitialized { .. })
        ));
        drop(tx);
        let aggregate = reporter.completion().unwrap().wait().await.unwrap();
        assert_eq!(aggregate.total_count(), 0);
    }

    #[tokio::test]
    async fn console_reporter_completes() {
        let mut reporter = ConsoleReporter::new().set_running_metrics(Duration::from_millis(10));
        reporter.initialize().unwrap();
        let completion = reporter.completion().unwrap();
        let (tx, rx) = flume::bounded(10);
        reporter.start(rx).await.unwrap();

        tx.send_async(envelope(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!completion.is_done());
        tx.send_async(envelope(2)).await.unwrap();
        drop(tx);

        let mut waiting = completion.clone();
        let aggregate = tokio::time::timeout(Duration::from_secs(5), waiting.wait())
            .await
            .expect("reporter never completed")
            .unwrap();
        assert_eq!(aggregate.success_count, 2);
        assert_eq!(aggregate.item_aggregates.len(), 2);
        assert!(completion.is_done());
    }

    #[tokio::test]
    async fn fan_out_copies_everything() {
        let (tx, rx) = flume::bounded(4);
        let (mut receivers, handle) = fan_out(rx, 3, 4);
        assert_eq!(receivers.len(), 3);

        // Drop one consumer early, the others keep receiving.
        drop(receivers.pop());

        let consumers: Vec<_> = receivers
            .into_iter()
            .map(|rx| tokio::spawn(AggregationEngine::new().start(rx)))
            .collect();

        for id in 0..20 {
            tx.send_async(envelope(id % 4)).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        for consumer in consumers {
            let aggregate = consumer.await.unwrap();
            assert_eq!(aggregate.success_count, 20);
            assert_eq!(aggregate.item_aggregates.len(), 4);
        }
    }

    #[tokio::test]
    async fn wait_for_every_reporter() {
        let configuration = VolleyConfiguration::default();
        let mut reporters = vec![
            new_reporter(ReportFormat::Console, &configuration),
            new_reporter(ReportFormat::Json, &configuration),
        ];
        let (tx, rx) = flume::bounded(4);
        let (queues, _) = fan_out(rx, reporters.len(), 4);

        let mut completions = Vec::new();
        for (reporter, queue) in reporters.iter_mut().zip(queues) {
            reporter.initialize().unwrap();
            completions.push(reporter.completion().unwrap());
            reporter.start(queue).await.unwrap();
        }
        tx.send_async(envelope(9)).await.unwrap();
        drop(tx);

        let aggregates = wait_for_all(completions).await.unwrap();
        assert_eq!(aggregates.len(), 2);
        for aggregate in aggregates {
            assert_eq!(aggregate.item(9).unwrap().success_count, 1);
        }
    }
}
