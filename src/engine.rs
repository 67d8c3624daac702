//! The single-writer aggregation loop.
//!
//! Request-issuing workers never touch a [`RunAggregate`]. They send an
//! [`IterationEnvelope`] on a [`flume`](https://docs.rs/flume/) channel for every
//! finished iteration, and one [`AggregationEngine`] per reporter drains that
//! channel and folds each envelope in turn. Exactly one task ever mutates the
//! aggregate, so no lock guards it.
//!
//! Dropping every sender closes the channel. Once the engine has folded the last
//! queued envelope it fires its [`CompletionSignal`], handing the finalized
//! aggregate out behind an [`Arc`] so it can no longer change.

use std::sync::Arc;
use tokio::sync::watch;

use crate::metrics::{RunAggregate, RunProgress};
use crate::outcome::IterationEnvelope;
use crate::VolleyError;

/// Fires once when a run has been finalized.
#[derive(Debug)]
pub struct CompletionSignal {
    tx: watch::Sender<Option<Arc<RunAggregate>>>,
}
impl CompletionSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        CompletionSignal { tx }
    }

    /// Publish the finalized aggregate and wake every waiter.
    ///
    /// Returns `true` if this call fired the signal. Later calls are no-ops and
    /// return `false`; the first aggregate is the one waiters see.
    pub fn fire(&self, aggregate: Arc<RunAggregate>) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(aggregate);
            true
        })
    }

    pub fn is_fired(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Get a handle for waiting on this signal.
    pub fn subscribe(&self) -> Completion {
        Completion {
            rx: self.tx.subscribe(),
        }
    }
}
impl Default for CompletionSignal {
    fn default() -> Self {
        CompletionSignal::new()
    }
}

/// A handle for waiting on a [`CompletionSignal`].
///
/// Handles are cheap to clone; any number of tasks can wait on the same signal.
#[derive(Clone, Debug)]
pub struct Completion {
    rx: watch::Receiver<Option<Arc<RunAggregate>>>,
}
impl Completion {
    /// Wait until the signal fires and return the finalized aggregate.
    ///
    /// Returns immediately if the signal already fired. Fails with
    /// [`VolleyError::Aborted`] if the signal was dropped without firing, for
    /// example because the aggregating task panicked.
    pub async fn wait(&mut self) -> Result<Arc<RunAggregate>, VolleyError> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(slot) => match &*slot {
                Some(aggregate) => Ok(Arc::clone(aggregate)),
                None => Err(VolleyError::Aborted {
                    detail: "completion signaled without an aggregate".to_string(),
                }),
            },
            Err(_) => Err(VolleyError::Aborted {
                detail: "completion signal dropped before the run was finalized".to_string(),
            }),
        }
    }

    /// Whether the signal has fired, without waiting.
    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The finalized aggregate if the signal has fired, without waiting.
    pub fn result(&self) -> Option<Arc<RunAggregate>> {
        self.rx.borrow().clone()
    }
}

/// Drains a delivery queue into a [`RunAggregate`].
#[derive(Debug)]
pub struct AggregationEngine {
    aggregate: RunAggregate,
    progress: watch::Sender<RunProgress>,
    done: CompletionSignal,
}
impl AggregationEngine {
    pub fn new() -> Self {
        let (progress, _) = watch::channel(RunProgress::default());
        AggregationEngine {
            aggregate: RunAggregate::new(),
            progress,
            done: CompletionSignal::new(),
        }
    }

    /// A handle that resolves to the finalized aggregate.
    pub fn completion(&self) -> Completion {
        self.done.subscribe()
    }

    /// Subscribe to in-progress snapshots, updated after every folded iteration.
    pub fn progress(&self) -> watch::Receiver<RunProgress> {
        self.progress.subscribe()
    }

    /// The aggregate as folded so far.
    pub fn aggregate(&self) -> &RunAggregate {
        &self.aggregate
    }

    /// Fold one iteration. All of its outcomes are folded before returning.
    pub fn fold(&mut self, envelope: &IterationEnvelope) {
        self.aggregate.fold(envelope);
        // Skip building snapshots nobody reads.
        if self.progress.receiver_count() > 0 {
            self.progress.send_replace(self.aggregate.progress());
        }
    }

    /// Drain `rx` until every sender is dropped and the queue is empty, then
    /// finalize the aggregate and fire the completion signal.
    ///
    /// The engine has no timeout of its own: it waits for as long as any sender
    /// remains.
    pub async fn start(mut self, rx: flume::Receiver<IterationEnvelope>) -> Arc<RunAggregate> {
        while let Ok(envelope) = rx.recv_async().await {
            trace!(
                "folding iteration started at {} with {} outcomes",
                envelope.start_time,
                envelope.outcomes.len()
            );
            self.fold(&envelope);
        }
        self.finish()
    }

    /// Finalize the aggregate without draining a queue.
    pub fn finish(self) -> Arc<RunAggregate> {
        let aggregate = Arc::new(self.aggregate);
        info!(
            "aggregation complete: {} iterations, {} scenario items",
            aggregate.total_count(),
            aggregate.item_aggregates.len()
        );
        self.done.fire(Arc::clone(&aggregate));
        aggregate
    }
}
impl Default for AggregationEngine {
    fn default() -> Self {
        AggregationEngine::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::outcome::RequestOutcome;
    use chrono::Utc;
    use std::time::Duration;

    fn envelope(durations: &[u64]) -> IterationEnvelope {
        let mut envelope = IterationEnvelope::new(Utc::now());
        for (id, duration) in durations.iter().enumerate() {
            let mut outcome = RequestOutcome::new(id as u16, Duration::from_secs(*duration));
            outcome.set_status_code(200);
            envelope.push(outcome);
        }
        envelope
    }

    #[test]
    fn signal_fires_once() {
        let signal = CompletionSignal::new();
        let completion = signal.subscribe();
        assert!(!signal.is_fired());
        assert!(!completion.is_done());
        assert!(completion.result().is_none());

        let mut first = RunAggregate::new();
        first.success_count = 1;
        assert!(signal.fire(Arc::new(first)));
        assert!(signal.is_fired());

        // A second fire is ignored and the first aggregate is kept.
        assert!(!signal.fire(Arc::new(RunAggregate::new())));
        assert!(completion.is_done());
        assert_eq!(completion.result().map(|r| r.success_count), Some(1));
    }

    #[tokio::test]
    async fn wait_after_completion_returns_immediately() {
        let signal = CompletionSignal::new();
        signal.fire(Arc::new(RunAggregate::new()));
        // Subscribing late still sees the fired signal.
        let mut completion = signal.subscribe();
        let aggregate = tokio::time::timeout(Duration::from_millis(100), completion.wait())
            .await
            .expect("wait blocked after completion")
            .unwrap();
        assert_eq!(aggregate.total_count(), 0);
    }

    #[tokio::test]
    async fn dropped_signal_aborts() {
        let signal = CompletionSignal::new();
        let mut completion = signal.subscribe();
        drop(signal);
        assert!(matches!(
            completion.wait().await,
            Err(VolleyError::Aborted { .. })
        ));
    }

    #[tokio::test]
    async fn engine_drains_queue() {
        let (tx, rx) = flume::bounded(4);
        let engine = AggregationEngine::new();
        let mut completion = engine.completion();
        let handle = tokio::spawn(engine.start(rx));

        tx.send_async(envelope(&[1, 2])).await.unwrap();
        tx.send_async(envelope(&[3])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The queue is still open, so the run isn't finished.
        assert!(!completion.is_done());

        drop(tx);
        let finalized = completion.wait().await.unwrap();
        let returned = handle.await.unwrap();
        assert!(Arc::ptr_eq(&finalized, &returned));
        assert_eq!(finalized.success_count, 2);
        assert!((finalized.avg_duration - 3.0).abs() < 1e-9);
        assert_eq!(finalized.item(0).unwrap().total_count(), 2);
        assert_eq!(finalized.item(1).unwrap().total_count(), 1);
    }

    #[tokio::test]
    async fn queued_envelopes_drained_after_close() {
        let (tx, rx) = flume::unbounded();
        for _ in 0..100 {
            tx.send(envelope(&[1])).unwrap();
        }
        // Closing before the engine starts still folds everything already queued.
        drop(tx);
        let aggregate = AggregationEngine::new().start(rx).await;
        assert_eq!(aggregate.success_count, 100);
    }

    #[tokio::test]
    async fn progress_snapshots() {
        let mut engine = AggregationEngine::new();
        let mut progress = engine.progress();
        engine.fold(&envelope(&[2]));
        assert!(progress.has_changed().unwrap());
        assert_eq!(progress.borrow_and_update().success_count, 1);
        engine.fold(&envelope(&[4]));
        let snapshot = *progress.borrow_and_update();
        assert_eq!(snapshot.success_count, 2);
        assert!((snapshot.avg_duration - 3.0).abs() < 1e-9);
        assert_eq!(engine.aggregate().total_count(), 2);
    }

    #[tokio::test]
    async fn many_producers() {
        let (tx, rx) = flume::bounded(8);
        let engine = AggregationEngine::new();
        let handle = tokio::spawn(engine.start(rx));

        let mut producers = Vec::new();
        for _ in 0..10 {
            let tx = tx.clone();
            producers.push(tokio::spawn(async move {
                for _ in 0..100 {
                    tx.send_async(envelope(&[1, 1])).await.unwrap();
                }
            }));
        }
        drop(tx);
        for producer in producers {
            producer.await.unwrap();
        }

        let aggregate = handle.await.unwrap();
        assert_eq!(aggregate.total_count(), 1_000);
        assert_eq!(aggregate.item(0).unwrap().success_count, 1_000);
        assert_eq!(aggregate.item(1).unwrap().status_code_distribution[&200], 1_000);
    }
}
