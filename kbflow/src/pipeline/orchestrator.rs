//! Pipeline orchestrator.
//!
//! Drives the seven phase executors in order for each execution, one
//! background task per live execution. Every state change is written to
//! the execution record in memory first and then persisted, so `status`
//! always reflects the latest transition.
//!
//! Pause is honoured between items: the task stops at the next item or
//! phase boundary, persists the cursor and exits. Resume starts a new task
//! from the cursor. Both decisions are taken under the same lock, so a
//! resume that races with a pausing task either keeps that task going or
//! starts a fresh one, never neither.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{PipelineConfig, PipelineExecution, RunControl, RunSignal};
use crate::core::{ExecutionStatus, Phase, PhaseStatus, ProgressEvent};
use crate::errors::{PipelineError, Result};
use crate::events::{EventSink, NoOpEventSink};
use crate::models::{ModelRouter, RoutingConfig};
use crate::observability::{execution_summary, SpanTimer};
use crate::phases::{default_executors, PhaseContext, PhaseExecutor};
use crate::ports::{AiBackend, ContentSource, Exporter, Store};
use crate::state::{ItemLocks, SubPhaseTracker};

/// Collaborators an orchestrator is built from.
pub struct OrchestratorDeps {
    /// Persistence.
    pub store: Arc<dyn Store>,
    /// Where posts come from.
    pub source: Arc<dyn ContentSource>,
    /// AI backends the router may pick from.
    pub backends: Vec<Arc<dyn AiBackend>>,
    /// Defaults, fallbacks and capability TTL.
    pub routing: RoutingConfig,
    /// Export target.
    pub exporter: Arc<dyn Exporter>,
    /// Progress notifications.
    pub sink: Arc<dyn EventSink>,
    /// One executor per phase.
    pub executors: Vec<Arc<dyn PhaseExecutor>>,
}

impl OrchestratorDeps {
    /// Bundles the required collaborators with default routing, no event
    /// sink and the standard executors.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn ContentSource>,
        backends: Vec<Arc<dyn AiBackend>>,
        exporter: Arc<dyn Exporter>,
    ) -> Self {
        Self {
            store,
            source,
            backends,
            routing: RoutingConfig::default(),
            exporter,
            sink: Arc::new(NoOpEventSink),
            executors: default_executors(),
        }
    }

    /// Sets the routing configuration.
    #[must_use]
    pub fn with_routing(mut self, routing: RoutingConfig) -> Self {
        self.routing = routing;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replaces the executor for the executor's phase.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn PhaseExecutor>) -> Self {
        self.executors.retain(|e| e.phase() != executor.phase());
        self.executors.push(executor);
        self
    }
}

/// Why a run of the phase loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Finished(ExecutionStatus),
    Paused,
    Aborted,
}

/// Live state of one execution.
struct RunHandle {
    control: RunControl,
    locks: ItemLocks,
    execution: RwLock<PipelineExecution>,
    /// A task is driving the execution.
    running: Mutex<bool>,
    /// True while no task is driving the execution.
    idle: watch::Sender<bool>,
}

impl RunHandle {
    fn new(execution: PipelineExecution, locks: &ItemLocks) -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            control: RunControl::new(),
            locks: locks.scoped(execution.id),
            execution: RwLock::new(execution),
            running: Mutex::new(false),
            idle,
        }
    }

    fn id(&self) -> Uuid {
        self.execution.read().id
    }

    fn snapshot(&self) -> PipelineExecution {
        self.execution.read().clone()
    }

    fn update<R>(&self, f: impl FnOnce(&mut PipelineExecution) -> R) -> R {
        f(&mut self.execution.write())
    }

    /// Signals idleness once no task is driving the execution.
    fn settle(&self) {
        let running = self.running.lock();
        if !*running {
            self.idle.send_replace(true);
        }
    }
}

struct Inner {
    store: Arc<dyn Store>,
    source: Arc<dyn ContentSource>,
    router: Arc<ModelRouter>,
    exporter: Arc<dyn Exporter>,
    sink: Arc<dyn EventSink>,
    executors: Vec<Arc<dyn PhaseExecutor>>,
    runs: DashMap<Uuid, Arc<RunHandle>>,
    /// One table for every execution over the store.
    locks: ItemLocks,
}

/// Starts, steers and reports on pipeline executions.
///
/// Cheap to clone; clones share executions.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("executions", &self.inner.runs.len())
            .field("executors", &self.inner.executors)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(deps: OrchestratorDeps) -> Self {
        let router = Arc::new(ModelRouter::new(
            deps.backends,
            deps.routing,
            deps.store.clone(),
        ));
        Self {
            inner: Arc::new(Inner {
                store: deps.store,
                source: deps.source,
                router,
                exporter: deps.exporter,
                sink: deps.sink,
                executors: deps.executors,
                runs: DashMap::new(),
                locks: ItemLocks::new(),
            }),
        }
    }

    /// The shared model router.
    #[must_use]
    pub fn router(&self) -> &Arc<ModelRouter> {
        &self.inner.router
    }

    /// Validates `config`, persists a new execution and starts driving it.
    pub async fn start(&self, config: PipelineConfig) -> Result<Uuid> {
        config.validate()?;
        let execution = PipelineExecution::new(config);
        let id = execution.id;
        self.inner.store.put_execution(&execution).await?;

        let handle = Arc::new(RunHandle::new(execution, &self.inner.locks));
        self.inner.runs.insert(id, handle.clone());
        info!(execution_id = %id, "Pipeline started");
        self.inner
            .sink
            .try_emit(ProgressEvent::new("pipeline.started", id));
        self.inner.launch(&handle, || Ok(()))?;
        Ok(id)
    }

    /// Current state of an execution.
    pub async fn status(&self, id: Uuid) -> Result<PipelineExecution> {
        match self.inner.handle(id) {
            Some(handle) => Ok(handle.snapshot()),
            None => self.inner.load(id).await,
        }
    }

    /// Asks a running execution to stop at the next item boundary.
    pub async fn pause(&self, id: Uuid) -> Result<()> {
        let handle = self
            .inner
            .handle(id)
            .ok_or_else(|| PipelineError::Config(format!("execution {id} is not running")))?;
        if handle.execution.read().status.is_terminal() {
            return Err(PipelineError::Config(format!("execution {id} has finished")));
        }
        handle.control.pause();
        info!(execution_id = %id, "Pause requested");
        Ok(())
    }

    /// Continues a paused execution from its cursor.
    ///
    /// Executions unknown to this orchestrator (for example after a
    /// restart) are reloaded from the store.
    pub async fn resume(&self, id: Uuid) -> Result<()> {
        let handle = match self.inner.handle(id) {
            Some(handle) => handle,
            None => {
                let execution = self.inner.load(id).await?;
                if !execution.status.is_resumable() {
                    return Err(PipelineError::Config(format!(
                        "execution {id} is {} and cannot be resumed",
                        execution.status
                    )));
                }
                let handle = Arc::new(RunHandle::new(execution, &self.inner.locks));
                self.inner.runs.entry(id).or_insert(handle).value().clone()
            }
        };
        self.inner.launch(&handle, || {
            let status = handle.execution.read().status;
            if !status.is_resumable() {
                return Err(PipelineError::Config(format!(
                    "execution {id} is {status} and cannot be resumed"
                )));
            }
            handle.control.resume();
            Ok(())
        })?;
        info!(execution_id = %id, "Pipeline resumed");
        self.inner
            .sink
            .try_emit(ProgressEvent::new("pipeline.resumed", id));
        Ok(())
    }

    /// Stops an execution for good. In-flight calls are cancelled and
    /// results not yet committed are discarded.
    pub async fn abort(&self, id: Uuid) -> Result<()> {
        let Some(handle) = self.inner.handle(id) else {
            let mut execution = self.inner.load(id).await?;
            if execution.status.is_terminal() {
                return Ok(());
            }
            execution.error.get_or_insert_with(|| "aborted".to_string());
            execution.set_status(ExecutionStatus::Aborted);
            self.inner.store.put_execution(&execution).await?;
            self.inner.emit_finished(&execution);
            return Ok(());
        };

        let finalize_here = {
            let running = handle.running.lock();
            handle.control.abort("aborted by request");
            !*running && !handle.execution.read().status.is_terminal()
        };
        let released = handle.locks.release_all();
        info!(execution_id = %id, released_locks = released, "Abort requested");

        if finalize_here {
            self.inner.finalize(&handle, Exit::Aborted).await;
            handle.settle();
            self.inner.retire(&handle);
        }
        Ok(())
    }

    /// Waits until no task is driving the execution and returns it.
    ///
    /// Returns on completion, failure, abort and pause alike.
    pub async fn wait(&self, id: Uuid) -> Result<PipelineExecution> {
        let Some(handle) = self.inner.handle(id) else {
            return self.inner.load(id).await;
        };
        let mut idle = handle.idle.subscribe();
        idle.wait_for(|idle| *idle)
            .await
            .map_err(|_| PipelineError::Internal(format!("execution {id} lost its driver")))?;
        Ok(handle.snapshot())
    }
}

impl Inner {
    fn handle(&self, id: Uuid) -> Option<Arc<RunHandle>> {
        self.runs.get(&id).map(|h| Arc::clone(h.value()))
    }

    /// Forgets a finished execution; later lookups go to the store.
    fn retire(&self, handle: &Arc<RunHandle>) {
        let id = handle.id();
        self.runs.remove_if(&id, |_, live| Arc::ptr_eq(live, handle));
    }

    async fn load(&self, id: Uuid) -> Result<PipelineExecution> {
        self.store
            .get_execution(id)
            .await?
            .ok_or_else(|| PipelineError::Config(format!("unknown execution {id}")))
    }

    async fn persist(&self, handle: &RunHandle) -> Result<()> {
        self.store.put_execution(&handle.snapshot()).await
    }

    fn emit(&self, event: ProgressEvent) {
        self.sink.try_emit(event);
    }

    fn executor_for(&self, phase: Phase) -> Result<Arc<dyn PhaseExecutor>> {
        self.executors
            .iter()
            .find(|e| e.phase() == phase)
            .cloned()
            .ok_or_else(|| PipelineError::Config(format!("no executor for phase {phase}")))
    }

    /// Runs `check` and, if no task is driving the execution, starts one.
    fn launch(
        self: &Arc<Self>,
        handle: &Arc<RunHandle>,
        check: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        let mut running = handle.running.lock();
        check()?;
        if *running {
            return Ok(());
        }
        *running = true;
        handle.idle.send_replace(false);
        drop(running);

        let inner = Arc::clone(self);
        let handle = Arc::clone(handle);
        tokio::spawn(async move { inner.drive(handle).await });
        Ok(())
    }

    async fn drive(self: Arc<Self>, handle: Arc<RunHandle>) {
        let id = handle.id();
        let mut finished = false;
        loop {
            handle.update(|e| e.set_status(ExecutionStatus::Running));
            let exit = match self.run_phases(&handle).await {
                Ok(exit) => exit,
                Err(err) => {
                    error!(execution_id = %id, error = %err, "Execution failed");
                    handle.update(|e| e.error = Some(err.to_string()));
                    Exit::Finished(ExecutionStatus::Failed)
                }
            };

            if exit == Exit::Paused {
                // A resume that arrived after the pool stopped keeps this
                // task going.
                let parked = {
                    let mut running = handle.running.lock();
                    if handle.control.signal() == RunSignal::Pause {
                        *running = false;
                        handle.update(|e| e.set_status(ExecutionStatus::Paused));
                        true
                    } else {
                        false
                    }
                };
                if !parked {
                    debug!(execution_id = %id, "Resumed before parking");
                    continue;
                }
                if let Err(err) = self.persist(&handle).await {
                    warn!(execution_id = %id, error = %err, "Could not persist paused execution");
                }
                info!(execution_id = %id, cursor = ?handle.snapshot().cursor, "Pipeline paused");
                self.emit(ProgressEvent::new("pipeline.paused", id));
            } else {
                *handle.running.lock() = false;
                self.finalize(&handle, exit).await;
                finished = true;
            }
            break;
        }
        handle.settle();
        if finished {
            self.retire(&handle);
        }
    }

    /// Writes the terminal status and announces it.
    async fn finalize(&self, handle: &RunHandle, exit: Exit) {
        let reason = handle.control.abort_reason();
        let execution = handle.update(|e| {
            match exit {
                Exit::Finished(status) => e.set_status(status),
                Exit::Aborted | Exit::Paused => {
                    if let Some(reason) = reason {
                        e.error.get_or_insert(reason);
                    }
                    e.set_status(ExecutionStatus::Aborted);
                }
            }
            e.clone()
        });
        if let Err(err) = self.store.put_execution(&execution).await {
            warn!(execution_id = %execution.id, error = %err, "Could not persist final execution state");
        }
        info!(
            execution_id = %execution.id,
            status = %execution.status,
            items_committed = execution.items_committed,
            "Pipeline finished"
        );
        self.emit_finished(&execution);
    }

    fn emit_finished(&self, execution: &PipelineExecution) {
        let event_type = if execution.status == ExecutionStatus::Aborted {
            "pipeline.aborted"
        } else {
            "pipeline.completed"
        };
        let elapsed = execution
            .finished_at
            .map_or(0.0, |end| (end - execution.created_at).num_milliseconds() as f64);
        self.emit(
            ProgressEvent::new(event_type, execution.id)
                .with_elapsed(elapsed)
                .add_data("status", serde_json::json!(execution.status))
                .add_data("summary", execution_summary(execution)),
        );
    }

    /// Runs phases from the cursor until the end, a pause, an abort or a
    /// phase failure.
    async fn run_phases(&self, handle: &RunHandle) -> Result<Exit> {
        let id = handle.id();
        let config = Arc::new(handle.snapshot().config);
        let tracker = SubPhaseTracker::with_locks(self.store.clone(), handle.locks.clone());
        self.persist(handle).await?;

        loop {
            let cursor = handle.snapshot().cursor;
            let Some(phase) = cursor.phase() else {
                break;
            };
            match handle.control.signal() {
                RunSignal::Abort => return Ok(Exit::Aborted),
                RunSignal::Pause => return Ok(Exit::Paused),
                RunSignal::Run => {}
            }

            if config.is_skipped(phase) {
                handle.update(|e| e.finish_phase(phase, PhaseStatus::Skipped, 0.0));
                self.persist(handle).await?;
                info!(execution_id = %id, phase = %phase, "Phase skipped");
                self.emit(
                    ProgressEvent::phase_completed(id, phase, 0, 0, 0.0)
                        .add_data("status", serde_json::json!(PhaseStatus::Skipped)),
                );
                continue;
            }

            let executor = self.executor_for(phase)?;
            handle.update(|e| e.begin_phase(phase));
            self.persist(handle).await?;
            info!(execution_id = %id, phase = %phase, "Phase started");
            self.emit(ProgressEvent::phase_started(id, phase));

            let resume_at = (phase == Phase::ContentProcessing)
                .then_some(cursor.sub_phase)
                .flatten();
            let ctx = PhaseContext::new(
                id,
                config.clone(),
                self.store.clone(),
                self.source.clone(),
                self.router.clone(),
                tracker.clone(),
                self.exporter.clone(),
                self.sink.clone(),
                handle.control.clone(),
            )
            .with_resume_at(resume_at);

            let timer = SpanTimer::start(phase.as_str());
            let result = executor.execute(&ctx).await;
            let elapsed = timer.finish();
            handle.update(|e| e.items_committed += ctx.committed());

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(err) if handle.control.is_aborted() => {
                    debug!(execution_id = %id, phase = %phase, error = %err, "Phase cancelled");
                    handle.update(|e| e.finish_phase(phase, PhaseStatus::Interrupted, elapsed));
                    self.persist(handle).await?;
                    return Ok(Exit::Aborted);
                }
                Err(err) => {
                    error!(execution_id = %id, phase = %phase, error = %err, "Phase failed");
                    let committed = handle.update(|e| {
                        e.finish_phase(phase, PhaseStatus::Failed, elapsed);
                        e.phase_mut(phase).error = Some(err.to_string());
                        e.error = Some(format!("{phase}: {err}"));
                        e.items_committed
                    });
                    self.persist(handle).await?;
                    self.emit(ProgressEvent::phase_failed(id, phase, &err.to_string()).with_elapsed(elapsed));
                    if err.is_fatal() {
                        handle.control.abort(err.to_string());
                        return Ok(Exit::Aborted);
                    }
                    let status = if committed > 0 {
                        ExecutionStatus::Partial
                    } else {
                        ExecutionStatus::Failed
                    };
                    return Ok(Exit::Finished(status));
                }
            };

            // Counts accumulate across a pause; the resumed pass only sees
            // the remaining work.
            handle.update(|e| {
                let record = e.phase_mut(phase);
                let before = record.processed;
                record.processed += outcome.processed;
                record.total = before + outcome.total;
                record.failed += outcome.failed;
            });

            if let Some(signal) = outcome.interrupted {
                handle.update(|e| {
                    e.finish_phase(phase, PhaseStatus::Interrupted, elapsed);
                    e.cursor.sub_phase = outcome.resume_at;
                });
                self.persist(handle).await?;
                info!(
                    execution_id = %id,
                    phase = %phase,
                    sub_phase = ?outcome.resume_at,
                    "Phase interrupted"
                );
                return Ok(if signal == RunSignal::Abort {
                    Exit::Aborted
                } else {
                    Exit::Paused
                });
            }

            let status = if outcome.failed > 0 {
                PhaseStatus::Partial
            } else {
                PhaseStatus::Completed
            };
            handle.update(|e| e.finish_phase(phase, status, elapsed));
            self.persist(handle).await?;
            info!(
                execution_id = %id,
                phase = %phase,
                processed = outcome.processed,
                total = outcome.total,
                failed = outcome.failed,
                elapsed_ms = elapsed,
                "Phase completed"
            );
            self.emit(
                ProgressEvent::phase_completed(id, phase, outcome.processed, outcome.total, elapsed)
                    .add_data("failed", serde_json::json!(outcome.failed))
                    .add_data("status", serde_json::json!(status)),
            );
        }

        let partial = handle.execution.read().has_partial_phase();
        Ok(Exit::Finished(if partial {
            ExecutionStatus::Partial
        } else {
            ExecutionStatus::Completed
        }))
    }
}
