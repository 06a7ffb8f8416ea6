//! Bounded worker pool for per-item work.

use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{with_retry, RetryConfig, RunControl, RunSignal};
use crate::errors::{PipelineError, Result};
use crate::models::ModelRouter;

/// What happened to a batch handed to [`WorkerPool::run`].
#[derive(Debug)]
pub struct PoolReport<U> {
    /// Items whose work and commit succeeded.
    pub completed: Vec<(String, U)>,
    /// Items that failed after the retry policy gave up.
    pub failed: Vec<(String, PipelineError)>,
    /// Items that were never started or were cancelled before committing.
    pub pending: Vec<String>,
    /// Dispatch stopped after a phase-level error.
    pub halted: bool,
    /// Set if dispatch stopped because of a pause or abort.
    pub interrupted: Option<RunSignal>,
}

impl<U> Default for PoolReport<U> {
    fn default() -> Self {
        Self {
            completed: Vec::new(),
            failed: Vec::new(),
            pending: Vec::new(),
            halted: false,
            interrupted: None,
        }
    }
}

impl<U> PoolReport<U> {
    /// Items that reached a final outcome.
    #[must_use]
    pub fn processed(&self) -> usize {
        self.completed.len() + self.failed.len()
    }

    /// The first phase-level failure, if dispatch halted.
    #[must_use]
    pub fn halt_error(&self) -> Option<&PipelineError> {
        self.failed
            .iter()
            .map(|(_, e)| e)
            .find(|e| e.is_phase_level())
    }

    /// Removes and returns the first phase-level failure.
    pub fn take_halt_error(&mut self) -> Option<(String, PipelineError)> {
        let pos = self.failed.iter().position(|(_, e)| e.is_phase_level())?;
        Some(self.failed.remove(pos))
    }
}

/// Runs per-item work with bounded concurrency.
///
/// Each item goes through two steps: `work`, which may call the network
/// and is retried, timed out and cancelled on abort; then `commit`, which
/// is never cancelled once started so flag transitions stay whole.
#[derive(Clone)]
pub struct WorkerPool {
    workers: usize,
    item_timeout: Duration,
    retry: RetryConfig,
    control: RunControl,
    router: Option<Arc<ModelRouter>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .field("item_timeout", &self.item_timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Creates a pool.
    #[must_use]
    pub fn new(workers: usize, item_timeout: Duration, retry: RetryConfig, control: RunControl) -> Self {
        Self {
            workers: workers.max(1),
            item_timeout,
            retry,
            control,
            router: None,
        }
    }

    /// Lets the retry policy refresh capabilities through `router`.
    #[must_use]
    pub fn with_router(mut self, router: Arc<ModelRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// The run control this pool obeys.
    #[must_use]
    pub fn control(&self) -> &RunControl {
        &self.control
    }

    /// The retry policy.
    #[must_use]
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Processes `ids`. `observe` sees every final outcome as it happens.
    pub async fn run<T, U, W, WFut, C, CFut, O>(
        &self,
        ids: Vec<String>,
        work: W,
        commit: C,
        mut observe: O,
    ) -> PoolReport<U>
    where
        W: Fn(String) -> WFut,
        WFut: Future<Output = Result<T>>,
        C: Fn(String, T) -> CFut,
        CFut: Future<Output = Result<U>>,
        O: FnMut(&str, std::result::Result<&U, &PipelineError>),
    {
        let mut report = PoolReport::default();
        let mut queue = ids.into_iter();
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() < self.workers
                && !self.control.should_stop()
                && !report.halted
            {
                let Some(id) = queue.next() else {
                    break;
                };
                in_flight.push(self.process(id, &work, &commit));
            }

            let Some((id, outcome)) = in_flight.next().await else {
                break;
            };
            match outcome {
                Ok(value) => {
                    observe(&id, Ok(&value));
                    report.completed.push((id, value));
                }
                Err(PipelineError::Cancelled(_)) => report.pending.push(id),
                Err(error) => {
                    observe(&id, Err(&error));
                    if error.is_phase_level() && !report.halted {
                        debug!(item_id = %id, error = %error, "Phase-level error, halting dispatch");
                        report.halted = true;
                    }
                    report.failed.push((id, error));
                }
            }
        }

        report.pending.extend(queue);
        if self.control.should_stop() {
            report.interrupted = Some(self.control.signal());
        }
        report
    }

    async fn process<T, U, W, WFut, C, CFut>(
        &self,
        id: String,
        work: &W,
        commit: &C,
    ) -> (String, Result<U>)
    where
        W: Fn(String) -> WFut,
        WFut: Future<Output = Result<T>>,
        C: Fn(String, T) -> CFut,
        CFut: Future<Output = Result<U>>,
    {
        let key = id.clone();
        let attempt = with_retry(&self.retry, &key, self.router.as_deref(), || {
            let timeout = self.item_timeout;
            let fut = work(key.clone());
            async move {
                tokio::time::timeout(timeout, fut).await.unwrap_or_else(|_| {
                    Err(PipelineError::transient(format!(
                        "timed out after {}ms",
                        timeout.as_millis()
                    )))
                })
            }
        });

        let output = tokio::select! {
            biased;
            () = self.control.aborted() => {
                return (id, Err(PipelineError::Cancelled("aborted before commit".into())));
            }
            output = attempt => output,
        };
        // Finished work is discarded if an abort landed meanwhile.
        if self.control.is_aborted() {
            return (id, Err(PipelineError::Cancelled("aborted before commit".into())));
        }

        let result = match output {
            Ok(value) => commit(id.clone(), value).await,
            Err(error) => Err(error),
        };
        (id, result)
    }
}
