//! Per-kind request coalescing and windowed batch dispatch.
//!
//! Every [`Pipeline`] owns a bounded coalescing channel and one background window task. Callers
//! publish one [`Submission`] per key; the window task groups submissions until either the
//! maximum batch size is reached or the maximum wait (measured from the first item of the window)
//! elapses, then hands the window to a dispatch task. Dispatch issues one downstream call for the
//! distinct keys of the window, retries under a hard timeout, and scatters the per-key results
//! back into each submission's collector.
//!
//! The max-wait deadline starts when the window task dequeues the first item, not when that item
//! was enqueued. While every dispatch permit is taken the window task stops draining the channel,
//! so queued keys can wait longer than `max_wait`; the backlog is bounded by `max_queue_depth`,
//! past which new keys resolve to absent instead.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::Context as _;
use futures::future::{self, BoxFuture};
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, Semaphore};

use crate::{
    collector::{Collector, Lookup, SubmitOutcome},
    config::PipelineConfig,
    downstream::Downstream,
    error::FailureClass,
    kind::ResourceKind,
};

/// One key of one caller's request, waiting to be batched.
pub struct Submission<V> {
    pub key: String,
    pub collector: Arc<Collector<V>>,
}

#[derive(Debug, Clone)]
/// Windowing, retry and resource limits for one pipeline.
pub struct BatchingConfig {
    /// Flush a window once it holds this many submissions.
    pub max_batch_size: usize,
    /// Flush a window this long after its first submission, even if not full.
    pub max_wait: Duration,
    /// Retries after the first failed downstream attempt.
    pub retry_count: usize,
    /// Upper bound on the whole retrying downstream call.
    pub dispatch_timeout: Duration,
    /// Maximum number of windows being dispatched at the same time.
    pub dispatch_parallelism: usize,
    /// Coalescing channel capacity. When full, new keys resolve to absent immediately.
    pub max_queue_depth: usize,
}

impl From<&PipelineConfig> for BatchingConfig {
    fn from(cfg: &PipelineConfig) -> Self {
        Self {
            max_batch_size: cfg.max_batch_size,
            max_wait: Duration::from_millis(cfg.max_wait_ms),
            retry_count: cfg.retry_count,
            dispatch_timeout: Duration::from_millis(cfg.dispatch_timeout_ms),
            dispatch_parallelism: cfg.dispatch_parallelism,
            max_queue_depth: cfg.max_queue_depth,
        }
    }
}

#[derive(Debug)]
/// Errors that can occur while enqueueing a submission.
pub enum PublishError {
    /// The coalescing channel is at capacity.
    QueueFull,
    /// The window task exited.
    PipelineClosed,
}

/// Handle to one resource kind's coalescing pipeline.
pub struct Pipeline<V> {
    kind: ResourceKind,
    tx: mpsc::Sender<Submission<V>>,
    publish_lock: Arc<Mutex<()>>,
}

impl<V> Clone for Pipeline<V> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            tx: self.tx.clone(),
            publish_lock: Arc::clone(&self.publish_lock),
        }
    }
}

impl<V> Pipeline<V>
where
    V: DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Create the coalescing channel and spawn the window task. Requires a Tokio runtime.
    pub fn start(
        kind: ResourceKind,
        downstream: Arc<dyn Downstream>,
        cfg: BatchingConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(cfg.max_queue_depth.max(1));
        tracing::info!(
            event = "pipeline_started",
            kind = %kind,
            max_batch_size = cfg.max_batch_size,
            max_wait_ms = cfg.max_wait.as_millis() as u64,
            retry_count = cfg.retry_count,
            dispatch_timeout_ms = cfg.dispatch_timeout.as_millis() as u64,
            dispatch_parallelism = cfg.dispatch_parallelism,
            "starting pipeline"
        );
        tokio::spawn(window_task(kind, rx, downstream, cfg));
        Self {
            kind,
            tx,
            publish_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Publish every key of one caller's request and return a future for the collected results.
    ///
    /// Publishing happens before this returns. The future never fails: keys that could not be
    /// looked up map to `None`.
    pub fn submit(&self, keys: &[String]) -> BoxFuture<'static, Lookup<V>> {
        if keys.is_empty() {
            return Box::pin(future::ready(HashMap::new()));
        }

        let collector = Arc::new(Collector::new(keys.len()));
        self.publish_all(keys, &collector);

        let requested = keys.to_vec();
        Box::pin(async move { collector.collect(&requested).await })
    }

    /// Enqueue a single submission without waiting for capacity.
    ///
    /// On failure the submission is handed back so the caller can resolve it.
    pub fn try_publish(
        &self,
        submission: Submission<V>,
    ) -> Result<(), (PublishError, Submission<V>)> {
        match self.tx.try_send(submission) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(s)) => Err((PublishError::QueueFull, s)),
            Err(mpsc::error::TrySendError::Closed(s)) => Err((PublishError::PipelineClosed, s)),
        }
    }

    fn publish_all(&self, keys: &[String], collector: &Arc<Collector<V>>) {
        // One caller's keys go in as a contiguous run.
        let _guard = self
            .publish_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        for key in keys {
            let submission = Submission {
                key: key.clone(),
                collector: Arc::clone(collector),
            };
            if let Err((reason, submission)) = self.try_publish(submission) {
                tracing::error!(
                    event = "enqueue_rejected",
                    class = %FailureClass::ChannelOverflow,
                    kind = %self.kind,
                    key = %submission.key,
                    collector = %collector.id(),
                    reason = ?reason,
                    "unable to enqueue key, resolving it as absent"
                );
                submission.collector.submit(submission.key, None);
            }
        }
    }
}

async fn window_task<V>(
    kind: ResourceKind,
    mut rx: mpsc::Receiver<Submission<V>>,
    downstream: Arc<dyn Downstream>,
    cfg: BatchingConfig,
) where
    V: DeserializeOwned + Clone + Send + Sync + 'static,
{
    let inflight = Arc::new(Semaphore::new(cfg.dispatch_parallelism.max(1)));

    while let Some(first) = rx.recv().await {
        let mut window = vec![first];

        if cfg.max_batch_size > 1 {
            let flush_at = tokio::time::Instant::now() + cfg.max_wait;
            while window.len() < cfg.max_batch_size {
                match tokio::time::timeout_at(flush_at, rx.recv()).await {
                    Ok(Some(submission)) => window.push(submission),
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
        }

        let permit = match Arc::clone(&inflight).acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                scatter(kind, window, &HashMap::new());
                continue;
            }
        };

        let downstream = Arc::clone(&downstream);
        let cfg = cfg.clone();
        tokio::spawn(async move {
            let _permit = permit;
            dispatch_window(kind, downstream.as_ref(), &cfg, window).await;
        });
    }

    tracing::debug!(event = "pipeline_stopped", kind = %kind, "coalescing channel closed");
}

#[derive(Debug)]
enum DispatchError {
    Timeout { attempts: usize },
    Exhausted { attempts: usize, last: anyhow::Error },
}

impl DispatchError {
    fn class(&self) -> FailureClass {
        match self {
            Self::Timeout { .. } => FailureClass::DownstreamTimeout,
            Self::Exhausted { .. } => FailureClass::DownstreamFailure,
        }
    }
}

async fn dispatch_window<V>(
    kind: ResourceKind,
    downstream: &dyn Downstream,
    cfg: &BatchingConfig,
    window: Vec<Submission<V>>,
) where
    V: DeserializeOwned + Clone,
{
    if window.is_empty() {
        return;
    }

    let keys = distinct_keys(&window).join(",");
    tracing::debug!(
        event = "batch_dispatch",
        kind = %kind,
        keys = %keys,
        window_size = window.len(),
        "dispatching window"
    );

    let response = match fetch_with_retry::<V>(kind, downstream, cfg, &keys).await {
        Ok(r) => r,
        Err(err) => {
            log_dispatch_failure(kind, &keys, cfg, &err);
            HashMap::new()
        }
    };

    scatter(kind, window, &response);
}

fn log_dispatch_failure(
    kind: ResourceKind,
    keys: &str,
    cfg: &BatchingConfig,
    err: &DispatchError,
) {
    match err {
        DispatchError::Timeout { attempts } => tracing::warn!(
            event = "batch_failed",
            class = %err.class(),
            kind = %kind,
            keys = %keys,
            attempts,
            timeout_ms = cfg.dispatch_timeout.as_millis() as u64,
            "timed out awaiting downstream response, resolving window as absent"
        ),
        DispatchError::Exhausted { attempts, last } => tracing::error!(
            event = "batch_failed",
            class = %err.class(),
            kind = %kind,
            keys = %keys,
            attempts,
            error = %format!("{last:#}"),
            "downstream call failed, resolving window as absent"
        ),
    }
}

/// Keys of a window in first-seen order, each once.
fn distinct_keys<V>(window: &[Submission<V>]) -> Vec<&str> {
    let mut seen = HashSet::with_capacity(window.len());
    window
        .iter()
        .map(|s| s.key.as_str())
        .filter(|key| seen.insert(*key))
        .collect()
}

async fn fetch_with_retry<V>(
    kind: ResourceKind,
    downstream: &dyn Downstream,
    cfg: &BatchingConfig,
    keys: &str,
) -> Result<HashMap<String, V>, DispatchError>
where
    V: DeserializeOwned,
{
    let mut attempts = 0usize;
    let retrying = async {
        loop {
            attempts += 1;
            let err = match fetch_once::<V>(kind, downstream, keys).await {
                Ok(map) => return Ok(map),
                Err(err) => err,
            };
            if attempts > cfg.retry_count {
                return Err(err);
            }
            tracing::debug!(
                event = "batch_retry",
                kind = %kind,
                keys = %keys,
                attempt = attempts,
                error = %format!("{err:#}"),
                "downstream call failed, retrying"
            );
        }
    };

    let outcome = tokio::time::timeout(cfg.dispatch_timeout, retrying).await;
    match outcome {
        Ok(Ok(map)) => Ok(map),
        Ok(Err(last)) => Err(DispatchError::Exhausted { attempts, last }),
        Err(_) => Err(DispatchError::Timeout { attempts }),
    }
}

async fn fetch_once<V>(
    kind: ResourceKind,
    downstream: &dyn Downstream,
    keys: &str,
) -> anyhow::Result<HashMap<String, V>>
where
    V: DeserializeOwned,
{
    let body = downstream.fetch(kind, keys).await?;
    // `null` values mean "not found", same as a missing key.
    let parsed: HashMap<String, Option<V>> =
        serde_json::from_slice(&body).context("decode downstream response")?;
    Ok(parsed
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key, v)))
        .collect())
}

fn scatter<V: Clone>(
    kind: ResourceKind,
    window: Vec<Submission<V>>,
    response: &HashMap<String, V>,
) {
    let window_size = window.len();
    let mut found = 0usize;
    let mut dropped = 0usize;

    for Submission { key, collector } in window {
        let value = response.get(&key).cloned();
        if value.is_some() {
            found += 1;
        }
        if matches!(
            collector.submit(key, value),
            SubmitOutcome::Faulted | SubmitOutcome::Closed
        ) {
            dropped += 1;
        }
    }

    tracing::debug!(
        event = "batch_scattered",
        kind = %kind,
        window_size,
        found,
        dropped,
        "window results delivered"
    );
}
