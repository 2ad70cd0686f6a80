//! Per-call result aggregation.
//!
//! A `Collector` is created for every caller request. The scatter step pushes one
//! `(key, Option<value>)` pair per submission into it; once the expected number of pairs has
//! arrived, the result stream is closed and the caller's future resolves with the collected map.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use futures::StreamExt as _;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::error::FailureClass;

/// Final per-call result: every requested key mapped to its value, or `None` when not found.
pub type Lookup<V> = HashMap<String, Option<V>>;

/// One delivered result.
pub type Entry<V> = (String, Option<V>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What happened to a single [`Collector::submit`] call.
pub enum SubmitOutcome {
    /// Accepted; more results are still expected.
    Accepted,
    /// Accepted, and it was the last expected result. The stream is now closed.
    Completed,
    /// The result stream could not take the entry and has been closed early.
    Faulted,
    /// The stream was already closed; the entry was discarded.
    Closed,
}

struct State<V> {
    received: usize,
    tx: Option<mpsc::Sender<Entry<V>>>,
}

pub struct Collector<V> {
    id: Uuid,
    expected: usize,
    state: Mutex<State<V>>,
    rx: Mutex<Option<mpsc::Receiver<Entry<V>>>>,
}

impl<V> Collector<V> {
    /// Create a collector expecting `expected` results.
    ///
    /// The result buffer holds exactly `expected` entries, which is enough for every normal
    /// delivery even when the caller hasn't started draining yet.
    pub fn new(expected: usize) -> Self {
        Self::with_capacity(expected, expected)
    }

    /// Create a collector whose result buffer is smaller (or larger) than `expected`.
    pub fn with_capacity(expected: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = Uuid::new_v4();
        tracing::debug!(collector = %id, expected, "collector started");
        Self {
            id,
            expected,
            state: Mutex::new(State {
                received: 0,
                // Nothing to wait for: close right away so the caller resolves to an empty map.
                tx: (expected > 0).then_some(tx),
            }),
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Deliver one result. Safe to call concurrently and more often than expected.
    pub fn submit(&self, key: String, value: Option<V>) -> SubmitOutcome {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = state.tx.as_ref() else {
            tracing::trace!(collector = %self.id, key = %key, "collector closed, dropping result");
            return SubmitOutcome::Closed;
        };

        if let Err(err) = tx.try_send((key, value)) {
            let (key, _) = match err {
                mpsc::error::TrySendError::Full(entry) => entry,
                mpsc::error::TrySendError::Closed(entry) => entry,
            };
            state.tx = None;
            tracing::debug!(
                event = "collector_closed",
                class = %FailureClass::CollectorFault,
                collector = %self.id,
                key = %key,
                expected = self.expected,
                received = state.received,
                "collector completed abnormally"
            );
            return SubmitOutcome::Faulted;
        }

        state.received += 1;
        if state.received == self.expected {
            state.tx = None;
            tracing::debug!(
                event = "collector_closed",
                collector = %self.id,
                expected = self.expected,
                "collector completed normally"
            );
            return SubmitOutcome::Completed;
        }
        SubmitOutcome::Accepted
    }

    /// Take the result stream. Only the first call gets it.
    pub fn result_stream(&self) -> Option<ReceiverStream<Entry<V>>> {
        self.rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(ReceiverStream::new)
    }

    /// Drain the result stream into a map.
    ///
    /// If the stream is unavailable, every requested key maps to `None` instead; this never fails.
    pub async fn collect(&self, requested: &[String]) -> Lookup<V> {
        match self.result_stream() {
            Some(stream) => stream.collect().await,
            None => {
                tracing::warn!(
                    collector = %self.id,
                    "result stream already taken, resolving every key as absent"
                );
                requested.iter().map(|key| (key.clone(), None)).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn keys(ks: &[&str]) -> Vec<String> {
        ks.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn completes_after_expected_submissions() {
        let collector = Collector::<f64>::new(2);
        assert_eq!(
            collector.submit("A".to_string(), Some(1.5)),
            SubmitOutcome::Accepted
        );
        assert_eq!(
            collector.submit("B".to_string(), None),
            SubmitOutcome::Completed
        );

        let out = collector.collect(&keys(&["A", "B"])).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out["A"], Some(1.5));
        assert_eq!(out["B"], None);
    }

    #[tokio::test]
    async fn submissions_after_completion_are_dropped() {
        let collector = Collector::<String>::new(1);
        collector.submit("A".to_string(), Some("first".to_string()));
        assert_eq!(
            collector.submit("A".to_string(), Some("second".to_string())),
            SubmitOutcome::Closed
        );

        let out = collector.collect(&keys(&["A"])).await;
        assert_eq!(out["A"].as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn duplicate_keys_count_separately_and_collapse_in_the_map() {
        let collector = Collector::<f64>::new(3);
        collector.submit("A".to_string(), Some(1.0));
        collector.submit("A".to_string(), Some(1.0));
        assert_eq!(
            collector.submit("B".to_string(), Some(2.0)),
            SubmitOutcome::Completed
        );

        let out = collector.collect(&keys(&["A", "A", "B"])).await;
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn full_buffer_closes_early_and_leaves_keys_missing() {
        let collector = Collector::<f64>::with_capacity(3, 1);
        assert_eq!(
            collector.submit("A".to_string(), Some(1.0)),
            SubmitOutcome::Accepted
        );
        assert_eq!(
            collector.submit("B".to_string(), Some(2.0)),
            SubmitOutcome::Faulted
        );
        assert_eq!(
            collector.submit("C".to_string(), Some(3.0)),
            SubmitOutcome::Closed
        );

        let out = collector.collect(&keys(&["A", "B", "C"])).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out["A"], Some(1.0));
        assert!(!out.contains_key("B"));
    }

    #[tokio::test]
    async fn dropped_receiver_faults_the_collector() {
        let collector = Collector::<f64>::new(2);
        drop(collector.result_stream());
        assert_eq!(
            collector.submit("A".to_string(), Some(1.0)),
            SubmitOutcome::Faulted
        );
    }

    #[tokio::test]
    async fn taken_stream_falls_back_to_all_absent() {
        let collector = Collector::<f64>::new(1);
        let _stream = collector.result_stream();
        let out = collector.collect(&keys(&["A", "B"])).await;
        assert_eq!(out.len(), 2);
        assert!(out.values().all(Option::is_none));
    }

    #[tokio::test]
    async fn zero_expected_resolves_empty() {
        let collector = Collector::<f64>::new(0);
        assert!(collector.collect(&[]).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submissions_all_arrive() {
        let n = 64;
        let collector = Arc::new(Collector::<usize>::new(n));
        let mut tasks = Vec::new();
        for i in 0..n {
            let collector = Arc::clone(&collector);
            tasks.push(tokio::spawn(async move {
                collector.submit(format!("k{i}"), Some(i))
            }));
        }

        let mut completed = 0;
        for task in tasks {
            if task.await.unwrap() == SubmitOutcome::Completed {
                completed += 1;
            }
        }
        assert_eq!(completed, 1);

        let out = collector.collect(&[]).await;
        assert_eq!(out.len(), n);
        assert_eq!(out["k7"], Some(7));
    }
}
