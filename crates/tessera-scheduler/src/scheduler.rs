//! The batching scheduler.
//!
//! # Flow
//!
//! ```text
//! submit ─► decompose ─► PendingQueue ─► acquire slot ─► fill ─► dispatch
//!                                                                   │
//!            poll ◄─ task table ◄─ demultiplex ◄─ reconciler ◄─ completion
//! ```
//!
//! Fill and dispatch run on the caller's task.  Asynchronous completions are
//! produced on engine threads and delivered as messages on an unbounded
//! channel; a single reconciler task drains it, demultiplexes the batch and
//! returns the slot to the pool.
//!
//! # Lifecycle
//!
//! `Initialized` (network read) → `Ready` (compiled, slots created) on the
//! first execution or output probe.  A failed initialization leaves the model
//! `Failed`; [`Scheduler::teardown`] leaves it `Closed`.
//!
//! # Locking
//!
//! Submissions and flushes hold the submission lock.  Short std mutexes guard
//! the pending queue, the task table and the in-flight map; when both are
//! needed the pending queue is locked before the task table.  No std guard is
//! held across an `.await`.  Pre- and post-processing hooks run under the
//! task-table lock and must not re-enter the scheduler.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tessera_core::backend::{
    AsyncCompletion, DispatchRejected, ExecutableNetwork, InferRequest, InferenceEngine, Network,
    find_port,
};
use tessera_core::error::{BindingKind, EngineError, Result};
use tessera_core::model::{DnnModel, ModelHooks};
use tessera_core::task::{ExecMode, PollResult, Task};
use tessera_core::types::{
    DataType, Frame, FunctionKind, InputInfo, Layout, PixelFormat, PortDesc, Precision,
};

use crate::batch::{self, Routing};
use crate::config::SchedulerConfig;
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::pool::{RequestSlot, SlotPool};
use crate::queue::{self, PendingQueue, SubInference};
use crate::task_table::{TaskId, TaskTable};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── State ───────────────────────────────────────────────────────────────────

/// Observable lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Initialized,
    Ready,
    Failed,
    Closed,
}

enum Lifecycle {
    Initialized { network: Box<dyn Network> },
    Ready(Compiled),
    Failed,
    Closed,
}

/// Field order is release order.
struct Compiled {
    exec: Box<dyn ExecutableNetwork>,
    network: Box<dyn Network>,
}

struct Completion {
    slot_id: usize,
    request: Box<dyn InferRequest>,
    outcome: Result<()>,
}

struct InFlight {
    occupants: Vec<SubInference>,
    dispatched_at: Instant,
}

/// What [`Scheduler::teardown`] released.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub slots_released: usize,
    pub sub_inferences_dropped: usize,
    pub tasks_dropped: usize,
}

struct Shared {
    name: String,
    kind: FunctionKind,
    config: SchedulerConfig,
    nireq: usize,
    hooks: ModelHooks,
    submit: tokio::sync::Mutex<()>,
    pending: Mutex<PendingQueue>,
    tasks: Mutex<TaskTable>,
    in_flight: Mutex<HashMap<usize, InFlight>>,
    pool: SlotPool,
    completion_tx: Mutex<Option<UnboundedSender<Completion>>>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
    metrics: SchedulerMetrics,
    lifecycle: Mutex<Lifecycle>,
    engine: Arc<dyn InferenceEngine>,
}

// ─── Scheduler ───────────────────────────────────────────────────────────────

/// Batched model executor over a pool of engine requests.
///
/// Cheap to clone; clones share the same model.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("model", &self.shared.name)
            .field("kind", &self.shared.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Read the network and validate options.  No slots exist yet.
    pub fn load(
        engine: Arc<dyn InferenceEngine>,
        model_path: &Path,
        kind: FunctionKind,
        config: SchedulerConfig,
        hooks: ModelHooks,
    ) -> Result<Self> {
        config.validate()?;
        if kind != FunctionKind::ProcessFrame && hooks.post_process.is_none() {
            return Err(EngineError::Config(format!(
                "{kind:?} models need a post-processing hook"
            )));
        }

        let network = engine.read_network(model_path)?;
        let name = network.name().to_string();
        let nireq = config.resolved_nireq();
        info!(
            model = %name,
            path = %model_path.display(),
            engine = engine.name(),
            ?kind,
            device = %config.device,
            nireq,
            batch_size = config.batch_size,
            "Network read"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                name,
                kind,
                config,
                nireq,
                hooks,
                submit: tokio::sync::Mutex::new(()),
                pending: Mutex::new(PendingQueue::default()),
                tasks: Mutex::new(TaskTable::default()),
                in_flight: Mutex::new(HashMap::new()),
                pool: SlotPool::new(),
                completion_tx: Mutex::new(None),
                reconciler: Mutex::new(None),
                metrics: SchedulerMetrics::new(),
                lifecycle: Mutex::new(Lifecycle::Initialized { network }),
                engine,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn kind(&self) -> FunctionKind {
        self.shared.kind
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Slot count once ready.
    pub fn nireq(&self) -> usize {
        self.shared.nireq
    }

    pub fn state(&self) -> ModelState {
        match &*lock(&self.shared.lifecycle) {
            Lifecycle::Initialized { .. } => ModelState::Initialized,
            Lifecycle::Ready(_) => ModelState::Ready,
            Lifecycle::Failed => ModelState::Failed,
            Lifecycle::Closed => ModelState::Closed,
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot(self.shared.pool.peak_busy())
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending_len()
    }

    /// Idle slots currently in the pool.
    pub fn idle_slots(&self) -> usize {
        self.shared
            .pool
            .capacity()
            .saturating_sub(self.shared.pool.busy())
    }

    /// Check sub-inference conservation against what is queued or in flight.
    pub fn verify_conservation(&self) -> Result<()> {
        let live = self.shared.pending_len() + self.shared.in_flight_rows();
        self.metrics().check_conservation(live)
    }

    pub async fn input_info(&self, input_name: &str) -> Result<InputInfo> {
        self.shared.input_info(input_name)
    }

    /// Input and output ports as the network currently reports them.
    pub fn ports(&self) -> Result<(Vec<PortDesc>, Vec<PortDesc>)> {
        self.shared
            .with_network(|network| (network.inputs(), network.outputs()))
    }

    /// Probe the output size a frame-processing model produces for a
    /// `width × height` input.
    pub async fn output_dims(
        &self,
        input_name: &str,
        width: u32,
        height: u32,
        output_name: &str,
    ) -> Result<(u32, u32)> {
        let shared = &self.shared;
        if shared.kind != FunctionKind::ProcessFrame {
            return Err(EngineError::UnsupportedFeature(
                "output dims can only be probed for frame-processing models".into(),
            ));
        }
        let _submit = shared.submit.lock().await;
        if shared.config.input_resizable {
            shared.reshape_for_probe(input_name, width, height)?;
        }
        shared.ensure_ready(input_name, output_name)?;

        let probe = Task::new(
            input_name,
            output_name,
            Frame::placeholder(width, height, PixelFormat::Gray8),
            Frame::placeholder(0, 0, PixelFormat::Gray8),
        )
        .with_ioproc(false);
        let done = shared.run_sync(probe).await?;
        Ok((done.out_frame.width, done.out_frame.height))
    }

    /// Run one task to completion on the caller's task.
    pub async fn submit_sync(&self, task: Task) -> Result<Task> {
        let shared = &self.shared;
        let _submit = shared.submit.lock().await;
        if shared.kind == FunctionKind::AnalyticsClassify {
            return Err(EngineError::UnsupportedFeature(
                "classification with synchronous execution".into(),
            ));
        }
        if shared.config.batch_size > 1 {
            return Err(EngineError::UnsupportedFeature(
                "batch mode for synchronous execution".into(),
            ));
        }
        let output = task.single_output()?.to_string();
        shared.ensure_ready(&task.input_name, &output)?;
        shared.run_sync(task).await
    }

    /// Queue a task; dispatch full batches while enough sub-inferences wait.
    pub async fn submit_async(&self, task: Task) -> Result<()> {
        let shared = &self.shared;
        let _submit = shared.submit.lock().await;
        let output = task.single_output()?.to_string();
        shared.ensure_ready(&task.input_name, &output)?;
        shared.enqueue(task, ExecMode::Async)?;

        while shared.pending_len() >= shared.config.batch_size {
            let slot = shared.pool.acquire().await?;
            shared.dispatch_async(slot)?;
        }
        Ok(())
    }

    /// Oldest asynchronous task, once every one of its sub-inferences settled.
    pub fn poll_completed(&self) -> PollResult {
        let result = lock(&self.shared.tasks).poll();
        let metrics = &self.shared.metrics;
        match &result {
            PollResult::Done(_) => SchedulerMetrics::add(&metrics.tasks_completed, 1),
            PollResult::Failed(_) => SchedulerMetrics::add(&metrics.tasks_failed, 1),
            PollResult::Empty | PollResult::NotReady => {}
        }
        result
    }

    /// Dispatch one partial batch from whatever is pending.
    ///
    /// A no-op when nothing is queued; callers repeat until the queue is empty.
    pub async fn flush(&self) -> Result<()> {
        let shared = &self.shared;
        let _submit = shared.submit.lock().await;
        if shared.pending_len() == 0 {
            return Ok(());
        }
        let slot = shared.pool.acquire().await?;
        shared.dispatch_async(slot)
    }

    /// Wait for in-flight batches, then release slots, queued work, the
    /// compiled network and the network, in that order.
    pub async fn teardown(&self) -> Result<TeardownReport> {
        let shared = &self.shared;
        let _submit = shared.submit.lock().await;
        let previous = std::mem::replace(&mut *lock(&shared.lifecycle), Lifecycle::Closed);
        if matches!(previous, Lifecycle::Closed) {
            return Err(EngineError::Closed);
        }

        // In-flight callbacks hold sender clones; the reconciler exits once
        // the last of them reported.
        drop(shared.take_completion_sender());
        if let Some(reconciler) = shared.take_reconciler()
            && let Err(e) = reconciler.await
        {
            error!(model = %shared.name, error = %e, "Reconciler task failed");
        }

        let report = shared.release_work();
        drop(previous);

        shared.metrics.snapshot(shared.pool.peak_busy()).report(&shared.name);
        info!(
            model = %shared.name,
            slots = report.slots_released,
            sub_inferences_dropped = report.sub_inferences_dropped,
            tasks_dropped = report.tasks_dropped,
            "Model torn down"
        );
        Ok(report)
    }
}

#[async_trait]
impl DnnModel for Scheduler {
    async fn input_info(&self, input_name: &str) -> Result<InputInfo> {
        Scheduler::input_info(self, input_name).await
    }

    async fn output_dims(
        &self,
        input_name: &str,
        width: u32,
        height: u32,
        output_name: &str,
    ) -> Result<(u32, u32)> {
        Scheduler::output_dims(self, input_name, width, height, output_name).await
    }

    async fn execute(&self, task: Task) -> Result<Task> {
        self.submit_sync(task).await
    }

    async fn execute_async(&self, task: Task) -> Result<()> {
        self.submit_async(task).await
    }

    fn poll_result(&self) -> PollResult {
        self.poll_completed()
    }

    async fn flush(&self) -> Result<()> {
        Scheduler::flush(self).await
    }
}

// ─── Shared internals ────────────────────────────────────────────────────────

impl Shared {
    fn routing(&self) -> Routing<'_> {
        Routing {
            kind: self.kind,
            hooks: &self.hooks,
            batch_size: self.config.batch_size,
        }
    }

    fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    fn in_flight_rows(&self) -> usize {
        lock(&self.in_flight)
            .values()
            .map(|f| f.occupants.len())
            .sum()
    }

    fn take_completion_sender(&self) -> Option<UnboundedSender<Completion>> {
        lock(&self.completion_tx).take()
    }

    fn take_reconciler(&self) -> Option<JoinHandle<()>> {
        lock(&self.reconciler).take()
    }

    fn with_network<T>(&self, f: impl FnOnce(&dyn Network) -> T) -> Result<T> {
        match &*lock(&self.lifecycle) {
            Lifecycle::Initialized { network } => Ok(f(network.as_ref())),
            Lifecycle::Ready(compiled) => Ok(f(compiled.network.as_ref())),
            Lifecycle::Failed => Err(EngineError::ModelUnusable),
            Lifecycle::Closed => Err(EngineError::Closed),
        }
    }

    fn input_info(&self, input_name: &str) -> Result<InputInfo> {
        let inputs = self.with_network(|network| network.inputs())?;
        let port = find_port(&inputs, BindingKind::Input, input_name)?;
        let resizable = self.config.input_resizable;
        Ok(InputInfo {
            channels: port.dims[1],
            height: (!resizable).then_some(port.dims[2]),
            width: (!resizable).then_some(port.dims[3]),
            dtype: DataType::try_from(port.precision)?,
        })
    }

    fn reshape_for_probe(&self, input_name: &str, width: u32, height: u32) -> Result<()> {
        match &mut *lock(&self.lifecycle) {
            Lifecycle::Initialized { network } => {
                network.reshape_input(input_name, height as usize, width as usize)?;
                debug!(input = input_name, width, height, "Reshaped input for probe");
                Ok(())
            }
            Lifecycle::Ready(_) => {
                warn!(
                    model = %self.name,
                    input = input_name,
                    width,
                    height,
                    "Network already compiled; probe uses the compiled input size"
                );
                Ok(())
            }
            Lifecycle::Failed => Err(EngineError::ModelUnusable),
            Lifecycle::Closed => Err(EngineError::Closed),
        }
    }

    // ── Initialization ───────────────────────────────────────────────

    fn ensure_ready(self: &Arc<Self>, input_name: &str, output_name: &str) -> Result<()> {
        let mut life = lock(&self.lifecycle);
        let mut network = match std::mem::replace(&mut *life, Lifecycle::Failed) {
            Lifecycle::Initialized { network } => network,
            Lifecycle::Ready(compiled) => {
                *life = Lifecycle::Ready(compiled);
                return Ok(());
            }
            Lifecycle::Failed => return Err(EngineError::ModelUnusable),
            Lifecycle::Closed => {
                *life = Lifecycle::Closed;
                return Err(EngineError::Closed);
            }
        };

        match self.initialize(network.as_mut(), input_name, output_name) {
            Ok(exec) => {
                *life = Lifecycle::Ready(Compiled { exec, network });
                Ok(())
            }
            Err(e) => {
                error!(model = %self.name, error = %e, "Initialization failed; model is unusable");
                Err(e)
            }
        }
    }

    fn initialize(
        self: &Arc<Self>,
        network: &mut dyn Network,
        input_name: &str,
        output_name: &str,
    ) -> Result<Box<dyn ExecutableNetwork>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::Config(format!("scheduler needs a tokio runtime: {e}")))?;
        let batch_size = self.config.batch_size;

        if batch_size > 1 {
            network.reshape_batch(batch_size)?;
            debug!(batch_size, "Reshaped batch dimension");
        }
        find_port(&network.inputs(), BindingKind::Input, input_name)?;
        find_port(&network.outputs(), BindingKind::Output, output_name)?;
        network.set_input_layout(input_name, Layout::Nhwc)?;
        network.set_output_layout(output_name, Layout::Nhwc)?;
        if self.kind != FunctionKind::ProcessFrame {
            network.set_input_precision(input_name, Precision::U8)?;
        }

        let device = &self.config.device;
        let exec = network.compile(device).map_err(|e| {
            let reason = match e {
                EngineError::Compile(msg) => msg,
                other => other.to_string(),
            };
            EngineError::Compile(format!(
                "{reason}; device \"{device}\" may not be supported, all available devices are: \"{}\"",
                self.engine.available_devices().join(" ")
            ))
        })?;

        let mut slots = Vec::new();
        slots
            .try_reserve(self.nireq)
            .map_err(|e| EngineError::Allocation(format!("request slots: {e}")))?;
        for id in 0..self.nireq {
            let mut occupants = Vec::new();
            occupants
                .try_reserve(batch_size)
                .map_err(|e| EngineError::Allocation(format!("slot occupancy: {e}")))?;
            slots.push(RequestSlot {
                id,
                request: exec.create_request()?,
                occupants,
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let reconciler = runtime.spawn(reconcile(Arc::downgrade(self), rx));
        *lock(&self.completion_tx) = Some(tx);
        *lock(&self.reconciler) = Some(reconciler);
        self.pool.populate(slots);

        info!(
            model = %self.name,
            device = %device,
            nireq = self.nireq,
            batch_size,
            input = input_name,
            output = output_name,
            "Model ready"
        );
        Ok(exec)
    }

    // ── Submission ───────────────────────────────────────────────────

    /// Decompose `task` and queue its sub-inferences.
    ///
    /// Returns the task id and how many sub-inferences were queued.  On
    /// failure a synchronous task is withdrawn entirely; an asynchronous one
    /// keeps whatever was queued and surfaces later as `Failed`.
    fn enqueue(&self, mut task: Task, mode: ExecMode) -> Result<(TaskId, usize)> {
        let regions = queue::plan_regions(self.kind, &task);
        task.begin(mode, regions.len() as u32);

        let mut pending = lock(&self.pending);
        let mut tasks = lock(&self.tasks);
        let id = tasks.insert(task, mode == ExecMode::Async)?;
        SchedulerMetrics::add(&self.metrics.tasks_submitted, 1);

        match queue::enqueue_regions(&mut pending, id, &regions) {
            Ok(queued) => {
                SchedulerMetrics::add(&self.metrics.sub_inferences_created, queued);
                tasks.get_mut(id)?.outstanding = queued;
                debug!(task = id, ?mode, sub_inferences = queued, "Task queued");
                Ok((id, queued))
            }
            Err(e) => {
                let queued = match &e {
                    EngineError::PartialSubmission { queued, .. } => *queued,
                    _ => 0,
                };
                SchedulerMetrics::add(&self.metrics.sub_inferences_created, queued);
                match mode {
                    ExecMode::Sync => {
                        let retracted = pending.retract(id);
                        SchedulerMetrics::add(&self.metrics.sub_inferences_dropped, retracted);
                        SchedulerMetrics::add(&self.metrics.tasks_failed, 1);
                        tasks.remove(id);
                    }
                    ExecMode::Async => {
                        let entry = tasks.get_mut(id)?;
                        entry.outstanding = queued;
                        entry.failed = true;
                    }
                }
                warn!(task = id, queued, error = %e, "Task decomposition failed");
                Err(e)
            }
        }
    }

    fn fill(&self, slot: &mut RequestSlot) -> Result<usize> {
        let mut pending = lock(&self.pending);
        let tasks = lock(&self.tasks);
        batch::fill_slot(self.routing(), slot, &mut pending, &tasks)
    }

    fn release(&self, slot: RequestSlot) {
        if let Err(slot) = self.pool.release(slot) {
            debug!(slot = slot.id, "Pool closed; releasing request handle");
        }
    }

    /// Drop whatever the slot packed and hand it back.
    fn abort_slot(&self, mut slot: RequestSlot) {
        if !slot.occupants.is_empty() {
            let mut tasks = lock(&self.tasks);
            batch::drop_occupants(&mut slot.occupants, &mut tasks, &self.metrics);
        }
        SchedulerMetrics::add(&self.metrics.dispatch_failures, 1);
        self.release(slot);
    }

    // ── Synchronous path ─────────────────────────────────────────────

    async fn run_sync(self: &Arc<Self>, task: Task) -> Result<Task> {
        if self.pending_len() > 0 {
            return Err(EngineError::Config(
                "synchronous execution while asynchronous work is pending; flush first".into(),
            ));
        }
        let (id, queued) = self.enqueue(task, ExecMode::Sync)?;
        if queued == 0 {
            return self.finish_sync(id, None);
        }

        // From here on the caller may go away at any await; `run` owns the
        // task and the slot until they are settled.
        let mut run = SyncRun {
            shared: Arc::clone(self),
            id,
            slot: None,
            settled: false,
        };
        let slot = run.slot.insert(self.pool.acquire().await?);
        let occupancy = match self.fill(slot) {
            Ok(n) => n,
            Err(e) => {
                warn!(task = id, error = %e, "Fill failed");
                return run.settle(Some(e));
            }
        };

        match tokio::task::spawn_blocking(move || run.execute(occupancy)).await {
            Ok(result) => result,
            Err(e) => {
                error!(task = id, error = %e, "Synchronous inference task failed");
                Err(EngineError::Inference(format!("inference task failed: {e}")))
            }
        }
    }

    fn finish_sync(&self, id: TaskId, failure: Option<EngineError>) -> Result<Task> {
        let entry = lock(&self.tasks)
            .remove(id)
            .ok_or_else(|| EngineError::InvariantViolation(format!("task {id} vanished")))?;
        let failure = failure.or_else(|| {
            (entry.failed || !entry.task.is_complete()).then(|| {
                EngineError::Inference(format!(
                    "task finished {}/{} sub-inference(s)",
                    entry.task.inference_done(),
                    entry.task.inference_todo()
                ))
            })
        });
        match failure {
            Some(e) => {
                SchedulerMetrics::add(&self.metrics.tasks_failed, 1);
                Err(e)
            }
            None => {
                SchedulerMetrics::add(&self.metrics.tasks_completed, 1);
                Ok(entry.task)
            }
        }
    }

    /// Withdraw a synchronous task that was abandoned before it settled.
    fn withdraw_sync(&self, id: TaskId) {
        let mut pending = lock(&self.pending);
        let mut tasks = lock(&self.tasks);
        let retracted = pending.retract(id);
        SchedulerMetrics::add(&self.metrics.sub_inferences_dropped, retracted);
        SchedulerMetrics::add(&self.metrics.tasks_failed, 1);
        tasks.remove(id);
    }

    // ── Asynchronous path ────────────────────────────────────────────

    fn dispatch_async(&self, mut slot: RequestSlot) -> Result<()> {
        let Some(tx) = lock(&self.completion_tx).clone() else {
            self.release(slot);
            return Err(EngineError::Closed);
        };
        let occupancy = match self.fill(&mut slot) {
            Ok(0) => {
                self.release(slot);
                return Ok(());
            }
            Ok(n) => n,
            Err(e) => {
                warn!(slot = slot.id, error = %e, "Fill failed; dropping batch");
                self.abort_slot(slot);
                return Err(e);
            }
        };

        let RequestSlot {
            id,
            request,
            occupants,
        } = slot;
        lock(&self.in_flight).insert(
            id,
            InFlight {
                occupants,
                dispatched_at: Instant::now(),
            },
        );
        let on_complete: AsyncCompletion = Box::new(move |request, outcome| {
            // A closed channel means the scheduler is gone; the request drops here.
            let _ = tx.send(Completion {
                slot_id: id,
                request,
                outcome,
            });
        });

        match request.infer_async(on_complete) {
            Ok(()) => {
                SchedulerMetrics::add(&self.metrics.batches_dispatched, 1);
                SchedulerMetrics::add(&self.metrics.rows_dispatched, occupancy);
                debug!(slot = id, occupancy, "Batch dispatched");
                Ok(())
            }
            Err(DispatchRejected { request, error }) => {
                warn!(slot = id, occupancy, error = %error, "Async dispatch rejected");
                let occupants = lock(&self.in_flight)
                    .remove(&id)
                    .map(|f| f.occupants)
                    .unwrap_or_default();
                self.abort_slot(RequestSlot {
                    id,
                    request,
                    occupants,
                });
                Err(error)
            }
        }
    }

    fn on_completion(&self, done: Completion) {
        let Completion {
            slot_id,
            request,
            outcome,
        } = done;
        let Some(flight) = lock(&self.in_flight).remove(&slot_id) else {
            error!(slot = slot_id, "Completion for a slot that is not in flight");
            return;
        };
        self.metrics
            .record_inference(flight.dispatched_at.elapsed().as_micros() as u64);

        let mut slot = RequestSlot {
            id: slot_id,
            request,
            occupants: flight.occupants,
        };
        {
            let mut tasks = lock(&self.tasks);
            let result = outcome.and_then(|()| {
                batch::complete_batch(
                    self.routing(),
                    slot.request.as_ref(),
                    &mut slot.occupants,
                    &mut tasks,
                    &self.metrics,
                )
                .map(|_| ())
            });
            if let Err(e) = result {
                error!(slot = slot_id, occupancy = slot.occupants.len(), error = %e, "Batch failed; dropping its sub-inferences");
                SchedulerMetrics::add(&self.metrics.dispatch_failures, 1);
                batch::drop_occupants(&mut slot.occupants, &mut tasks, &self.metrics);
            }
        }
        self.release(slot);
    }

    // ── Teardown ─────────────────────────────────────────────────────

    fn release_work(&self) -> TeardownReport {
        let slots = self.pool.close();
        let slots_released = slots.len();
        drop(slots);

        let sub_inferences_dropped = lock(&self.pending).clear();
        SchedulerMetrics::add(&self.metrics.sub_inferences_dropped, sub_inferences_dropped);
        let tasks = lock(&self.tasks).drain();
        let tasks_dropped = tasks.len();
        drop(tasks);

        TeardownReport {
            slots_released,
            sub_inferences_dropped,
            tasks_dropped,
        }
    }
}

/// One synchronous task and the slot it holds.
///
/// Dropped unsettled (caller cancelled, blocking task never ran or panicked)
/// it drops the packed rows, returns the slot and withdraws the task.
struct SyncRun {
    shared: Arc<Shared>,
    id: TaskId,
    slot: Option<RequestSlot>,
    settled: bool,
}

impl SyncRun {
    /// Blocking part: run the slot, demultiplex, hand the slot back.
    fn execute(mut self, occupancy: usize) -> Result<Task> {
        let failure = match self.slot.as_mut() {
            Some(slot) => run_slot(&self.shared, self.id, slot, occupancy),
            None => Some(EngineError::InvariantViolation(
                "synchronous run without a slot".into(),
            )),
        };
        self.settle(failure)
    }

    /// Return the slot and hand the task back or fail it.
    fn settle(mut self, failure: Option<EngineError>) -> Result<Task> {
        self.settled = true;
        if let Some(slot) = self.slot.take() {
            if slot.occupants.is_empty() {
                self.shared.release(slot);
            } else {
                self.shared.abort_slot(slot);
            }
        }
        self.shared.finish_sync(self.id, failure)
    }
}

/// Run a filled slot on the calling thread and route its rows.
fn run_slot(
    shared: &Shared,
    id: TaskId,
    slot: &mut RequestSlot,
    occupancy: usize,
) -> Option<EngineError> {
    let started = Instant::now();
    let outcome = slot.request.infer();
    shared
        .metrics
        .record_inference(started.elapsed().as_micros() as u64);
    SchedulerMetrics::add(&shared.metrics.batches_dispatched, 1);
    SchedulerMetrics::add(&shared.metrics.rows_dispatched, occupancy);

    if let Err(e) = outcome {
        warn!(task = id, error = %e, "Synchronous inference failed");
        return Some(e);
    }
    let mut tasks = lock(&shared.tasks);
    match batch::complete_batch(
        shared.routing(),
        slot.request.as_ref(),
        &mut slot.occupants,
        &mut tasks,
        &shared.metrics,
    ) {
        Ok(failures) => failures.into_iter().find(|(t, _)| *t == id).map(|(_, e)| e),
        Err(e) => {
            batch::drop_occupants(&mut slot.occupants, &mut tasks, &shared.metrics);
            Some(e)
        }
    }
}

impl Drop for SyncRun {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        warn!(task = self.id, "Synchronous task abandoned; returning its slot");
        if let Some(slot) = self.slot.take() {
            self.shared.abort_slot(slot);
        }
        self.shared.withdraw_sync(self.id);
    }
}

/// Drain completions until every sender is gone.
async fn reconcile(shared: Weak<Shared>, mut rx: UnboundedReceiver<Completion>) {
    while let Some(done) = rx.recv().await {
        match shared.upgrade() {
            Some(shared) => shared.on_completion(done),
            None => debug!(slot = done.slot_id, "Scheduler dropped; discarding completion"),
        }
    }
    debug!("Completion channel closed");
}
