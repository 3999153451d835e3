//! Orchestration Engine
//!
//! Advances plan executions node by node:
//! - Facilitation picks SYNC, TASK, CHILD or CHILDREN for each node
//! - Suspended TASK nodes hold no thread and resume on notification
//! - Advisers decide what follows a terminal outcome
//! - Chains fan in to their parent section, or finish the plan
//!
//! All record changes are version-guarded updates through the store. Two
//! paths racing for the same node (a resume and a timeout, an interrupt and
//! a completing step) are decided by whichever update lands first; the
//! loser sees a status it does not expect and backs off.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use serde_json::Value;

use super::advisor::{self, Advise, AdviseKind};
use super::facilitator::ExecutionMode;
use super::interrupt::{Interrupt, InterruptPackage};
use super::registry::{Executor, StepContext, StepDefinition, StepRegistry, StepResponse};
use super::watcher::{DelayedQueue, Watcher};
use super::worker::WorkerPool;
use crate::config::EngineConfig;
use crate::dispatch::{LoopbackDispatcher, TaskDispatcher};
use crate::error::{EngineError, PlanError, Result, StoreError};
use crate::execution::{ExecutionMetadata, FailureInfo, FailureType, NodeExecution, PlanExecution, Status};
use crate::monitoring::{ExecutionObserver, ObserverHub};
use crate::plan::{condition, validate_plan, AdviserConfig, AdviserKind, OutcomeMap, Plan, PlanNode, RepairAction};
use crate::store::{ExecutionStore, MemoryStore};
use crate::waiting::{NotifyCallback, NotifyResponse, ProgressCallback, WaitNotifyService, WaitRequest};

/// Statuses a plan can be finalised from.
const UNFINISHED: &[Status] = &[Status::Queued, Status::Running, Status::Paused];

/// A resumption waiting for its plan to be resumed.
#[derive(Debug, Clone)]
pub(crate) struct DeferredResume {
    pub node_execution_id: String,
    pub responses: HashMap<String, NotifyResponse>,
    pub is_error: bool,
}

enum Job {
    Start { node_id: String, delayed: bool },
    Rerun(String),
    Resume(DeferredResume),
    Interrupt(Interrupt),
}

/// What [`OrchestrationEngine::recover`] re-drove.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub rewaited: usize,
    pub rerun: usize,
    pub sections: usize,
}

/// Shared engine state. Jobs and callbacks hold it through `Arc`/`Weak`.
pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<dyn ExecutionStore>,
    pub(crate) registry: StepRegistry,
    pub(crate) notify: Arc<WaitNotifyService>,
    pub(crate) dispatcher: Arc<dyn TaskDispatcher>,
    pub(crate) observers: ObserverHub,
    pub(crate) deferred: Mutex<HashMap<String, Vec<DeferredResume>>>,
    pool: WorkerPool,
    delayed: DelayedQueue,
    watcher: OnceCell<Watcher>,
    completion: Mutex<()>,
    completion_cv: Condvar,
    run_sequence: AtomicU64,
    violations: AtomicU64,
    shutting_down: AtomicBool,
    self_ref: Weak<EngineInner>,
}

/// Composition root for an [`OrchestrationEngine`].
///
/// # Example
///
/// ```rust,no_run
/// use std::collections::BTreeMap;
/// use std::time::Duration;
/// use planrunner::orchestration::OrchestrationEngine;
/// use planrunner::plan::load_plan;
/// use planrunner::steps::builtin_registry;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = OrchestrationEngine::builder()
///         .registry(builtin_registry())
///         .build()?;
///
///     let plan = load_plan("deploy.yaml")?;
///     let execution = engine.start_execution(plan, BTreeMap::new())?;
///     let finished = engine.wait_for_plan(&execution.id, Duration::from_secs(60))?;
///     println!("{}", finished.status);
///     Ok(())
/// }
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn ExecutionStore>>,
    registry: StepRegistry,
    notify: Option<Arc<WaitNotifyService>>,
    dispatcher: Option<Arc<dyn TaskDispatcher>>,
    observers: Vec<Arc<dyn ExecutionObserver>>,
    watcher: bool,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            store: None,
            registry: StepRegistry::new(),
            notify: None,
            dispatcher: None,
            observers: Vec::new(),
            watcher: true,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(mut self, registry: StepRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Adds a single step type to the registry.
    pub fn step(mut self, step_type: impl Into<String>, definition: StepDefinition) -> Self {
        self.registry.register(step_type, definition);
        self
    }

    /// Shares a notify service with collaborators built before the engine.
    pub fn notify(mut self, notify: Arc<WaitNotifyService>) -> Self {
        self.notify = Some(notify);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Leaves ticking to the caller (`expire_overdue` / `fire_due`).
    pub fn without_watcher(mut self) -> Self {
        self.watcher = false;
        self
    }

    pub fn build(self) -> Result<OrchestrationEngine> {
        let config = self.config;
        let notify = self
            .notify
            .unwrap_or_else(|| Arc::new(WaitNotifyService::with_ttl(config.response_ttl())));
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let dispatcher = self
            .dispatcher
            .unwrap_or_else(|| Arc::new(LoopbackDispatcher::new(Arc::clone(&notify), Duration::ZERO)));
        let pool = WorkerPool::new(config.workers, "planrunner-worker")?;

        let observers = ObserverHub::new();
        for observer in self.observers {
            observers.add(observer);
        }

        let inner = Arc::new_cyclic(|weak| EngineInner {
            config: config.clone(),
            store,
            registry: self.registry,
            notify,
            dispatcher,
            observers,
            deferred: Mutex::new(HashMap::new()),
            pool,
            delayed: DelayedQueue::new(),
            watcher: OnceCell::new(),
            completion: Mutex::new(()),
            completion_cv: Condvar::new(),
            run_sequence: AtomicU64::new(0),
            violations: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            self_ref: weak.clone(),
        });

        if self.watcher {
            let weak = Arc::downgrade(&inner);
            let watcher = Watcher::spawn(config.watch_interval(), move || match weak.upgrade() {
                Some(inner) => {
                    inner.tick(Utc::now());
                    true
                }
                None => false,
            })
            .map_err(|e| {
                error!("Failed to start watcher: {}", e);
                EngineError::ShuttingDown
            })?;
            if let Err(watcher) = inner.watcher.set(watcher) {
                warn!("Watcher already running; stopping the duplicate");
                watcher.stop();
            }
        }

        info!(
            "Engine started ({} worker(s), {} step type(s))",
            inner.pool.size(),
            inner.registry.len()
        );

        Ok(OrchestrationEngine { inner })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Workflow orchestration engine.
///
/// Dropping the engine shuts it down.
pub struct OrchestrationEngine {
    inner: Arc<EngineInner>,
}

impl OrchestrationEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Validates `plan`, creates a QUEUED plan execution and schedules its
    /// start node. Returns without waiting for any node to run.
    pub fn start_execution(&self, plan: Plan, setup_abstractions: BTreeMap<String, String>) -> Result<PlanExecution> {
        self.start_execution_with(plan, setup_abstractions, ExecutionMetadata::default())
    }

    /// Like [`start_execution`](Self::start_execution) with caller metadata.
    pub fn start_execution_with(
        &self,
        mut plan: Plan,
        setup_abstractions: BTreeMap<String, String>,
        metadata: ExecutionMetadata,
    ) -> Result<PlanExecution> {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }

        plan.fill_identifiers();
        validate_plan(&plan)?;
        if let Some(unknown) = plan.step_types().into_iter().find(|t| !inner.registry.contains(t)) {
            return Err(EngineError::UnknownStepType(unknown));
        }

        let plan = Arc::new(plan);
        let start = plan
            .start_node()
            .ok_or_else(|| PlanError::Invalid(vec![format!("Start node '{}' not found", plan.start)]))?;

        let mut execution = PlanExecution::new(Arc::clone(&plan), setup_abstractions);
        execution.metadata = metadata;
        execution.metadata.run_sequence = inner.run_sequence.fetch_add(1, Ordering::SeqCst) + 1;

        let node = NodeExecution::new(&execution.id, start, &execution.root_ambiance(), None, None);
        inner.store.insert_plan_execution(execution.clone())?;
        inner.store.insert_node_execution(node.clone())?;

        info!(
            "Started execution {} of plan '{}' ({} nodes)",
            execution.id,
            plan.id,
            plan.len()
        );

        inner.submit_start(&node.id, false)?;
        Ok(execution)
    }

    /// Re-entry point for completed TASK work.
    ///
    /// Idempotent: a node that is no longer ASYNC_WAITING ignores the call.
    pub fn resume_node_execution(
        &self,
        node_execution_id: &str,
        responses: HashMap<String, NotifyResponse>,
        is_error: bool,
    ) -> Result<()> {
        self.inner.store.get_node_execution(node_execution_id)?;
        self.inner.submit_resume(DeferredResume {
            node_execution_id: node_execution_id.to_string(),
            responses,
            is_error,
        })
    }

    /// Persists an interrupt and applies it asynchronously.
    pub fn register_interrupt(&self, package: InterruptPackage) -> Result<Interrupt> {
        let inner = &self.inner;
        let plan = inner.store.get_plan_execution(&package.plan_execution_id)?;
        if plan.status.is_terminal() {
            return Err(EngineError::PlanFinished(plan.id));
        }

        if package.interrupt_type.requires_node() && package.node_execution_id.is_none() {
            return Err(EngineError::InvalidInterrupt(format!(
                "{} requires a node execution id",
                package.interrupt_type
            )));
        }
        if let Some(node_id) = &package.node_execution_id {
            let node = inner.store.get_node_execution(node_id)?;
            if node.plan_execution_id != plan.id {
                return Err(EngineError::InvalidInterrupt(format!(
                    "node execution '{}' does not belong to plan execution '{}'",
                    node_id, plan.id
                )));
            }
        }

        let interrupt = Interrupt::new(package);
        inner.store.save_interrupt(interrupt.clone())?;
        info!(
            "Registered {} interrupt {} for plan {}",
            interrupt.interrupt_type, interrupt.id, interrupt.plan_execution_id
        );

        inner.submit(Job::Interrupt(interrupt.clone()))?;
        Ok(interrupt)
    }

    /// Blocks until the plan is terminal or `timeout` passes, returning the
    /// latest record either way.
    pub fn wait_for_plan(&self, plan_execution_id: &str, timeout: Duration) -> Result<PlanExecution> {
        let inner = &self.inner;
        let deadline = Instant::now() + timeout;
        let mut guard = inner.completion.lock();

        loop {
            let plan = inner.store.get_plan_execution(plan_execution_id)?;
            let now = Instant::now();
            if plan.status.is_terminal() || now >= deadline {
                return Ok(plan);
            }
            inner.completion_cv.wait_for(&mut guard, deadline - now);
        }
    }

    /// Blocks until no job is queued or running, or `timeout` passes.
    /// Returns true if the engine went idle.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.inner.pool.in_flight() == 0 {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        self.inner.pool.in_flight() == 0
    }

    /// Expires waiting nodes whose deadline is at or before `now`.
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize> {
        self.inner.expire_overdue(now)
    }

    /// Starts delayed nodes due at or before `now`.
    pub fn fire_due(&self, now: DateTime<Utc>) -> Result<usize> {
        self.inner.fire_due(now)
    }

    /// One watcher pass at `now`.
    pub fn tick(&self, now: DateTime<Utc>) {
        self.inner.tick(now);
    }

    /// Re-drives unfinished executions found in the store, e.g. after
    /// restarting from a snapshot.
    pub fn recover(&self) -> Result<RecoveryReport> {
        self.inner.recover()
    }

    pub fn plan_execution(&self, plan_execution_id: &str) -> Result<PlanExecution> {
        Ok(self.inner.store.get_plan_execution(plan_execution_id)?)
    }

    pub fn node_execution(&self, node_execution_id: &str) -> Result<NodeExecution> {
        Ok(self.inner.store.get_node_execution(node_execution_id)?)
    }

    /// Node executions of a plan, oldest first.
    pub fn node_executions(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        Ok(self.inner.store.find_node_executions_for_plan(plan_execution_id)?)
    }

    pub fn interrupts(&self, plan_execution_id: &str) -> Result<Vec<Interrupt>> {
        Ok(self.inner.store.find_interrupts_for_plan(plan_execution_id)?)
    }

    pub fn add_observer(&self, observer: Arc<dyn ExecutionObserver>) {
        self.inner.observers.add(observer);
    }

    pub fn store(&self) -> Arc<dyn ExecutionStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn notify_service(&self) -> Arc<WaitNotifyService> {
        Arc::clone(&self.inner.notify)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Invalid transitions detected so far. Non-zero means a bug.
    pub fn invariant_violations(&self) -> u64 {
        self.inner.violations.load(Ordering::SeqCst)
    }

    /// Stops the watcher and drains the worker pool.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for OrchestrationEngine {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl EngineInner {
    fn submit(&self, job: Job) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        let inner = self.self_ref.upgrade().ok_or(EngineError::ShuttingDown)?;
        self.pool.execute(move || inner.run_job(job))
    }

    pub(crate) fn submit_start(&self, node_id: &str, delayed: bool) -> Result<()> {
        self.submit(Job::Start {
            node_id: node_id.to_string(),
            delayed,
        })
    }

    pub(crate) fn submit_resume(&self, resume: DeferredResume) -> Result<()> {
        self.submit(Job::Resume(resume))
    }

    fn run_job(&self, job: Job) {
        let (context, result) = match job {
            Job::Start { node_id, delayed } => ("start", self.start_node(&node_id, delayed)),
            Job::Rerun(node_id) => ("rerun", self.rerun_node(&node_id)),
            Job::Resume(resume) => ("resume", self.handle_resume(resume)),
            Job::Interrupt(interrupt) => ("interrupt", self.process_interrupt(&interrupt).map(|_| ())),
        };

        if let Err(err) = result {
            self.report(context, &err);
        }
    }

    fn report(&self, context: &str, err: &EngineError) {
        if err.is_invariant_violation() {
            self.violations.fetch_add(1, Ordering::SeqCst);
            error!("Engine invariant violated during {}: {}", context, err);
        } else if matches!(err, EngineError::ShuttingDown) {
            debug!("Dropped {} work during shutdown", context);
        } else {
            error!("Failed to {} node: {}", context, err);
        }
    }

    fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(watcher) = self.watcher.get() {
            watcher.stop();
        }
        self.pool.shutdown(self.config.shutdown_grace());
        info!("Engine stopped");
    }

    // ------------------------------------------------------------------
    // Versioned updates
    // ------------------------------------------------------------------

    /// Moves a node from one of `from` to `to`, applying `apply` in the same
    /// update. Returns `None` if the node is terminal or not in `from`.
    pub(crate) fn transition_node<F>(&self, id: &str, from: &[Status], to: Status, apply: F) -> Result<Option<NodeExecution>>
    where
        F: FnMut(&mut NodeExecution),
    {
        self.transition_node_with(id, from, |_| to, apply)
    }

    /// Like [`transition_node`](Self::transition_node) with the target
    /// derived from the current record.
    pub(crate) fn transition_node_with<T, F>(
        &self,
        id: &str,
        from: &[Status],
        mut target: T,
        mut apply: F,
    ) -> Result<Option<NodeExecution>>
    where
        T: FnMut(&NodeExecution) -> Status,
        F: FnMut(&mut NodeExecution),
    {
        loop {
            let current = self.store.get_node_execution(id)?;
            if current.status.is_terminal() || !from.contains(&current.status) {
                debug!("Node {} is {}; transition skipped", id, current.status);
                return Ok(None);
            }

            let to = target(&current);
            if !current.status.can_transition_to(to) {
                return Err(EngineError::InvalidTransition {
                    id: id.to_string(),
                    from: current.status,
                    to,
                });
            }

            let now = Utc::now();
            let result = self.store.update_node_execution(id, current.version, &mut |n| {
                n.status = to;
                stamp_node(n, to, now);
                apply(n);
            });

            match result {
                Ok(updated) => {
                    debug!(
                        "Node {} ({}) {} -> {}",
                        updated.identifier, updated.id, current.status, updated.status
                    );
                    self.observers.node_status(&updated, current.status);
                    return Ok(Some(updated));
                }
                Err(StoreError::VersionConflict { .. }) => {
                    debug!("Version conflict on node {}; re-reading", id);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Applies a status-preserving change. `f` returns false to abandon it.
    pub(crate) fn update_node<F>(&self, id: &str, mut f: F) -> Result<Option<NodeExecution>>
    where
        F: FnMut(&mut NodeExecution) -> bool,
    {
        loop {
            let current = self.store.get_node_execution(id)?;
            let mut next = current.clone();
            if !f(&mut next) {
                return Ok(None);
            }
            next.status = current.status;

            match self
                .store
                .update_node_execution(id, current.version, &mut |n| *n = next.clone())
            {
                Ok(updated) => return Ok(Some(updated)),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Plan counterpart of [`update_node`](Self::update_node).
    pub(crate) fn update_plan<F>(&self, id: &str, mut f: F) -> Result<Option<PlanExecution>>
    where
        F: FnMut(&mut PlanExecution) -> bool,
    {
        loop {
            let current = self.store.get_plan_execution(id)?;
            let mut next = current.clone();
            if !f(&mut next) {
                return Ok(None);
            }

            match self
                .store
                .update_plan_execution(id, current.version, &mut |p| *p = next.clone())
            {
                Ok(updated) => return Ok(Some(updated)),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub(crate) fn transition_plan(&self, id: &str, from: &[Status], to: Status) -> Result<Option<PlanExecution>> {
        let mut previous = None;
        let mut invalid = None;
        let now = Utc::now();

        let updated = self.update_plan(id, |p| {
            if p.status.is_terminal() || !from.contains(&p.status) {
                return false;
            }
            if !p.status.can_transition_to(to) {
                invalid = Some(p.status);
                return false;
            }
            previous = Some(p.status);
            p.status = to;
            if to == Status::Running && p.started_at.is_none() {
                p.started_at = Some(now);
            }
            if to.is_terminal() {
                p.ended_at = Some(now);
            }
            true
        })?;

        if let Some(from) = invalid {
            return Err(EngineError::InvalidTransition {
                id: id.to_string(),
                from,
                to,
            });
        }

        if let (Some(plan), Some(previous)) = (&updated, previous) {
            self.observers.plan_status(plan, previous);
            if to.is_terminal() {
                self.deferred.lock().remove(id);
                let _guard = self.completion.lock();
                self.completion_cv.notify_all();
            }
        }
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Node lifecycle
    // ------------------------------------------------------------------

    fn start_node(&self, node_id: &str, delayed: bool) -> Result<()> {
        let node = self.store.get_node_execution(node_id)?;
        if node.status != Status::Queued {
            debug!("Node {} is {}; start skipped", node_id, node.status);
            return Ok(());
        }

        let plan = self.store.get_plan_execution(&node.plan_execution_id)?;
        if plan.status.is_terminal() || plan.abort_requested {
            self.abort_quietly(&node, "Plan is no longer running")?;
            return Ok(());
        }
        if plan.status == Status::Paused {
            return self.park(&node);
        }
        self.transition_plan(&plan.id, &[Status::Queued], Status::Running)?;

        let (plan_node, definition) = match self.resolve(&plan, &node) {
            Ok(found) => found,
            Err(message) => return self.conclude_unstarted(node_id, StepResponse::failed(message, vec![FailureType::Internal])),
        };
        let inputs = self.outcome_map(&plan.id)?;

        if let Some(expression) = &plan_node.skip_condition {
            match condition::evaluate(expression, &node.ambiance, &inputs) {
                Ok(true) => {
                    info!("Skipping node {} ({})", node.identifier, expression);
                    return self.conclude_unstarted(node_id, StepResponse::skipped());
                }
                Ok(false) => {}
                Err(message) => {
                    warn!("Node {} has an invalid skip condition: {}", node.identifier, message);
                    return self.conclude_unstarted(
                        node_id,
                        StepResponse::failed(format!("Invalid skip condition: {}", message), vec![FailureType::Verification]),
                    );
                }
            }
        }

        let facilitation = definition.facilitator.facilitate(
            &node.ambiance,
            &plan_node.step_parameters,
            &plan_node.facilitator,
            &inputs,
        );

        if !delayed && !facilitation.initial_wait.is_zero() {
            debug!("Node {} starts in {:?}", node.identifier, facilitation.initial_wait);
            self.delayed
                .schedule(node_id, Utc::now() + to_chrono(facilitation.initial_wait));
            return Ok(());
        }

        let mode = facilitation.mode;
        let running = match self.transition_node(node_id, &[Status::Queued], Status::Running, |n| n.mode = Some(mode))? {
            Some(running) => running,
            None => return Ok(()),
        };

        info!("Running node {} ({}) as {}", running.identifier, running.step_type, mode);
        self.run_mode(&plan, &running, plan_node, definition, mode, &inputs)
    }

    /// Parks a queued node of a paused plan.
    fn park(&self, node: &NodeExecution) -> Result<()> {
        if self.transition_node(&node.id, &[Status::Queued], Status::Paused, |_| {})?.is_none() {
            return Ok(());
        }

        // The plan may have been resumed between the read and the park.
        let plan = self.store.get_plan_execution(&node.plan_execution_id)?;
        if plan.status == Status::Running {
            if let Some(requeued) = self.transition_node(&node.id, &[Status::Paused], Status::Queued, |_| {})? {
                self.submit_start(&requeued.id, false)?;
            }
        }
        Ok(())
    }

    /// Concludes a node that never reached RUNNING through the normal path.
    fn conclude_unstarted(&self, node_id: &str, response: StepResponse) -> Result<()> {
        if self.transition_node(node_id, &[Status::Queued], Status::Running, |_| {})?.is_some() {
            self.complete_node(node_id, response)?;
        }
        Ok(())
    }

    fn resolve<'p>(
        &'p self,
        plan: &'p PlanExecution,
        node: &NodeExecution,
    ) -> std::result::Result<(&'p PlanNode, &'p StepDefinition), String> {
        let plan_node = plan
            .plan
            .node(&node.plan_node_id)
            .ok_or_else(|| format!("Plan node '{}' not found", node.plan_node_id))?;
        let definition = self
            .registry
            .get(&node.step_type)
            .ok_or_else(|| format!("Step type '{}' is not registered", node.step_type))?;
        Ok((plan_node, definition))
    }

    fn run_mode(
        &self,
        plan: &PlanExecution,
        node: &NodeExecution,
        plan_node: &PlanNode,
        definition: &StepDefinition,
        mode: ExecutionMode,
        inputs: &OutcomeMap,
    ) -> Result<()> {
        match (mode, &definition.executor) {
            (ExecutionMode::Sync, Executor::Sync(executor)) => {
                let ctx = StepContext {
                    node,
                    plan_node,
                    inputs,
                };
                let response = match catch_unwind(AssertUnwindSafe(|| executor.execute(&ctx))) {
                    Ok(Ok(response)) => response,
                    Ok(Err(err)) => {
                        warn!("Node {} failed: {}", node.identifier, err);
                        err.into()
                    }
                    Err(panic) => panicked(node, panic),
                };
                self.complete_node(&node.id, response)
            }
            (ExecutionMode::Sync, Executor::Section) => self.complete_node(&node.id, StepResponse::success()),
            (ExecutionMode::Task, Executor::Task(executor)) => {
                let ctx = StepContext {
                    node,
                    plan_node,
                    inputs,
                };
                let started = catch_unwind(AssertUnwindSafe(|| executor.start(&ctx, self.dispatcher.as_ref())));
                let correlation_ids = match started {
                    Ok(Ok(ids)) => ids,
                    Ok(Err(err)) => {
                        warn!("Node {} could not start its task: {}", node.identifier, err);
                        return self.complete_node(&node.id, err.into());
                    }
                    Err(panic) => return self.complete_node(&node.id, panicked(node, panic)),
                };
                self.suspend(node, plan_node, correlation_ids)
            }
            (mode, _) if mode.has_children() => self.start_children(plan, node, plan_node, mode),
            (mode, executor) => self.complete_node(
                &node.id,
                StepResponse::failed(
                    format!(
                        "Step type '{}' cannot run in {} mode with a {:?} executor",
                        node.step_type, mode, executor
                    ),
                    vec![FailureType::Internal],
                ),
            ),
        }
    }

    /// RUNNING -> ASYNC_WAITING, then registers the wait.
    fn suspend(&self, node: &NodeExecution, plan_node: &PlanNode, correlation_ids: Vec<String>) -> Result<()> {
        let timeout = plan_node
            .timeout_secs
            .map(Duration::from_secs)
            .or_else(|| self.config.default_wait_timeout());
        let timeout_at = timeout.map(|t| Utc::now() + to_chrono(t));

        let waiting = self.transition_node(&node.id, &[Status::Running], Status::AsyncWaiting, |n| {
            n.correlation_ids = correlation_ids.clone();
            n.timeout_at = timeout_at;
        })?;

        if let Some(waiting) = waiting {
            debug!(
                "Node {} waiting on {} correlation id(s)",
                waiting.identifier,
                waiting.correlation_ids.len()
            );
            self.register_wait(&waiting);
        }
        Ok(())
    }

    fn register_wait(&self, node: &NodeExecution) {
        let callback = Arc::new(ResumeOnNotify {
            engine: self.self_ref.clone(),
            node_execution_id: node.id.clone(),
        });
        let progress = Arc::new(RelayProgress {
            engine: self.self_ref.clone(),
            node_execution_id: node.id.clone(),
        });
        self.notify.wait_for_all_on(
            WaitRequest::new(node.id.clone(), node.correlation_ids.clone(), callback).with_progress(progress),
        );
    }

    fn handle_resume(&self, resume: DeferredResume) -> Result<()> {
        let node = self.store.get_node_execution(&resume.node_execution_id)?;
        if node.status != Status::AsyncWaiting {
            debug!("Stale resumption of node {} ({})", node.id, node.status);
            return Ok(());
        }

        {
            let mut deferred = self.deferred.lock();
            let plan = self.store.get_plan_execution(&node.plan_execution_id)?;
            if plan.status == Status::Paused {
                debug!("Plan {} is paused; deferring resumption of {}", plan.id, node.id);
                deferred.entry(plan.id).or_default().push(resume);
                return Ok(());
            }
        }

        let running = match self.transition_node(&node.id, &[Status::AsyncWaiting], Status::Running, |_| {})? {
            Some(running) => running,
            None => return Ok(()),
        };

        let plan = self.store.get_plan_execution(&running.plan_execution_id)?;
        let response = match self.resolve(&plan, &running) {
            Ok((plan_node, StepDefinition { executor: Executor::Task(executor), .. })) => {
                let inputs = self.outcome_map(&plan.id)?;
                let ctx = StepContext {
                    node: &running,
                    plan_node,
                    inputs: &inputs,
                };
                match catch_unwind(AssertUnwindSafe(|| executor.handle_response(&ctx, &resume.responses))) {
                    Ok(response) => response,
                    Err(panic) => panicked(&running, panic),
                }
            }
            Ok(_) if resume.is_error => StepResponse::failed("Task reported an error", vec![FailureType::Application]),
            Ok(_) => StepResponse::success(),
            Err(message) => StepResponse::failed(message, vec![FailureType::Internal]),
        };

        self.complete_node(&running.id, response)
    }

    /// Re-executes a node found RUNNING during recovery.
    fn rerun_node(&self, node_id: &str) -> Result<()> {
        let node = self.store.get_node_execution(node_id)?;
        if node.status != Status::Running {
            return Ok(());
        }
        let plan = self.store.get_plan_execution(&node.plan_execution_id)?;
        let (plan_node, definition) = match self.resolve(&plan, &node) {
            Ok(found) => found,
            Err(message) => return self.complete_node(node_id, StepResponse::failed(message, vec![FailureType::Internal])),
        };
        let inputs = self.outcome_map(&plan.id)?;
        let mode = match node.mode {
            Some(mode) => mode,
            None => {
                definition
                    .facilitator
                    .facilitate(&node.ambiance, &plan_node.step_parameters, &plan_node.facilitator, &inputs)
                    .mode
            }
        };

        info!("Re-running node {} after recovery", node.identifier);
        self.run_mode(&plan, &node, plan_node, definition, mode, &inputs)
    }

    /// Concludes a RUNNING node with `response` and applies its advise.
    pub(crate) fn complete_node(&self, node_id: &str, response: StepResponse) -> Result<()> {
        let response = if response.status.is_terminal() {
            response
        } else {
            StepResponse::failed(
                format!("Step returned non-terminal status {}", response.status),
                vec![FailureType::Internal],
            )
        };

        let node = self.store.get_node_execution(node_id)?;
        if node.status != Status::Running {
            debug!("Node {} is {}; completion ignored", node_id, node.status);
            return Ok(());
        }

        let failure_types = response.failure_types();
        let advise = self.advise_for(&node, response.status, &failure_types)?;
        let StepResponse {
            status,
            outcomes,
            failure,
        } = response;

        if advise.kind == AdviseKind::InterveneManual {
            let timeout_at = advise.timeout.map(|t| Utc::now() + to_chrono(t));
            let held = self.transition_node(node_id, &[Status::Running], Status::InterventionWaiting, |n| {
                n.intervention_status = Some(status);
                n.outcomes.extend(outcomes.clone());
                n.failure_info = failure.clone();
                n.advise = Some(AdviseKind::InterveneManual);
                n.timeout_at = timeout_at;
            })?;
            if let Some(held) = held {
                warn!(
                    "Node {} ({}) ended {} and is waiting for manual intervention",
                    held.identifier, held.id, status
                );
            }
            return Ok(());
        }

        let concluded = self.transition_node(node_id, &[Status::Running], status, |n| {
            n.outcomes.extend(outcomes.clone());
            n.failure_info = failure.clone();
            n.advise = Some(advise.kind);
        })?;

        if let Some(concluded) = concluded {
            match &concluded.failure_info {
                Some(info) if status.is_failure() => warn!(
                    "Node {} ({}) {}: {}",
                    concluded.identifier, concluded.id, status, info.message
                ),
                _ => info!("Node {} ({}) {}", concluded.identifier, concluded.id, status),
            }
            self.apply_advise(&concluded, advise)?;
        }
        Ok(())
    }

    fn advise_for(&self, node: &NodeExecution, status: Status, failure_types: &[FailureType]) -> Result<Advise> {
        let plan = self.store.get_plan_execution(&node.plan_execution_id)?;
        let node_advisers: &[AdviserConfig] = plan
            .plan
            .node(&node.plan_node_id)
            .map(|n| n.advisers.as_slice())
            .unwrap_or(&[]);
        let step_advisers: &[AdviserConfig] = self
            .registry
            .get(&node.step_type)
            .map(|d| d.advisers.as_slice())
            .unwrap_or(&[]);
        let transient = self.transient_retry_adviser();

        Ok(advisor::advise(
            status,
            failure_types,
            node.retry_count(),
            node_advisers.iter().chain(step_advisers).chain(transient.iter()),
        ))
    }

    /// Last-resort retry for dispatch failures.
    fn transient_retry_adviser(&self) -> Option<AdviserConfig> {
        if self.config.default_max_retries == 0 {
            return None;
        }
        Some(
            AdviserConfig::new(AdviserKind::Retry {
                max_retries: self.config.default_max_retries,
                wait_intervals_secs: Vec::new(),
                on_exhausted: RepairAction::MarkFailed,
            })
            .on(&[Status::Failed])
            .for_failure_types(&[FailureType::Connectivity]),
        )
    }

    pub(crate) fn apply_advise(&self, node: &NodeExecution, advise: Advise) -> Result<()> {
        match advise.kind {
            AdviseKind::Proceed => self.proceed(node),
            AdviseKind::Retry => self.retry(node, advise.wait),
            AdviseKind::MarkFailed => self.end_chain(node),
            AdviseKind::EndPlan => self.end_plan(node),
            AdviseKind::InterveneManual => {
                warn!("Manual intervention requested for concluded node {}", node.id);
                self.end_chain(node)
            }
        }
    }

    fn proceed(&self, node: &NodeExecution) -> Result<()> {
        let plan = self.store.get_plan_execution(&node.plan_execution_id)?;
        let next = plan
            .plan
            .node(&node.plan_node_id)
            .and_then(|n| n.next.as_deref())
            .and_then(|next| plan.plan.node(next));

        let next = match next {
            Some(next) => next,
            None => return self.end_chain(node),
        };

        if plan.status.is_terminal() || plan.abort_requested {
            debug!("Plan {} is finishing; not starting '{}'", plan.id, next.id);
            return Ok(());
        }

        let successor = NodeExecution::new(
            &node.plan_execution_id,
            next,
            &node.ambiance.without_last_level(),
            node.parent_id.clone(),
            Some(node.id.clone()),
        );
        self.store.insert_node_execution(successor.clone())?;
        self.submit_start(&successor.id, false)
    }

    fn retry(&self, node: &NodeExecution, wait: Duration) -> Result<()> {
        let plan = self.store.get_plan_execution(&node.plan_execution_id)?;
        let plan_node = match plan.plan.node(&node.plan_node_id) {
            Some(plan_node) => plan_node,
            None => return self.end_chain(node),
        };
        if plan.status.is_terminal() || plan.abort_requested {
            return Ok(());
        }

        let attempt = node.new_attempt(plan_node);
        self.store.insert_node_execution(attempt.clone())?;
        self.update_node(&node.id, |n| {
            if n.old_retry {
                return false;
            }
            n.old_retry = true;
            true
        })?;

        info!(
            "Retrying node {} (attempt {}, backoff {:?})",
            node.identifier,
            attempt.retry_count() + 1,
            wait
        );

        if wait.is_zero() {
            self.submit_start(&attempt.id, true)
        } else {
            self.delayed.schedule(attempt.id, Utc::now() + to_chrono(wait));
            Ok(())
        }
    }

    /// The chain `node` belongs to has run to its end.
    fn end_chain(&self, node: &NodeExecution) -> Result<()> {
        match &node.parent_id {
            Some(parent_id) => {
                self.update_node(parent_id, |p| {
                    p.ended_children += 1;
                    true
                })?;
                self.section_progress(parent_id)
            }
            None => self.finalize_plan(&node.plan_execution_id).map(|_| ()),
        }
    }

    fn end_plan(&self, node: &NodeExecution) -> Result<()> {
        let aborted = self.abort_live_nodes(&node.plan_execution_id, "Plan ended by adviser")?;
        info!(
            "Node {} ended plan {} ({} node(s) aborted)",
            node.identifier, node.plan_execution_id, aborted
        );
        // Ancestors were aborted on the way out; the plan still reports the
        // node that ended it.
        self.finalize_plan_with(&node.plan_execution_id, Some(node.status))
            .map(|_| ())
    }

    // ------------------------------------------------------------------
    // Sections
    // ------------------------------------------------------------------

    fn start_children(
        &self,
        plan: &PlanExecution,
        node: &NodeExecution,
        plan_node: &PlanNode,
        mode: ExecutionMode,
    ) -> Result<()> {
        if plan_node.children.is_empty() {
            return self.complete_node(&node.id, StepResponse::success());
        }

        match mode {
            ExecutionMode::Children { parallel: true } => {
                let total = plan_node.children.len();
                let claimed = self.update_node(&node.id, |p| {
                    if p.started_children != 0 {
                        return false;
                    }
                    p.started_children = total;
                    true
                })?;
                if claimed.is_none() {
                    return Ok(());
                }
                for child_id in &plan_node.children {
                    self.spawn_child(plan, node, child_id)?;
                }
                Ok(())
            }
            _ => self.start_child_at(plan, node, plan_node, 0),
        }
    }

    /// Starts the `index`-th child chain if nobody else did.
    fn start_child_at(&self, plan: &PlanExecution, parent: &NodeExecution, plan_node: &PlanNode, index: usize) -> Result<()> {
        let claimed = self.update_node(&parent.id, |p| {
            if p.started_children != index {
                return false;
            }
            p.started_children = index + 1;
            true
        })?;
        match (claimed, plan_node.children.get(index)) {
            (Some(_), Some(child_id)) => self.spawn_child(plan, parent, child_id),
            _ => Ok(()),
        }
    }

    fn spawn_child(&self, plan: &PlanExecution, parent: &NodeExecution, child_id: &str) -> Result<()> {
        let child_node = plan.plan.node(child_id).ok_or_else(|| {
            EngineError::InvalidPlan(PlanError::Invalid(vec![format!("Child node '{}' not found", child_id)]))
        })?;
        let child = NodeExecution::new(
            &parent.plan_execution_id,
            child_node,
            &parent.ambiance,
            Some(parent.id.clone()),
            None,
        );
        self.store.insert_node_execution(child.clone())?;
        self.submit_start(&child.id, false)
    }

    /// Fan-in: concludes the section once its chains are done, or starts
    /// the next sequential chain.
    fn section_progress(&self, parent_id: &str) -> Result<()> {
        let parent = self.store.get_node_execution(parent_id)?;
        if parent.status != Status::Running {
            return Ok(());
        }
        let mode = match parent.mode {
            Some(mode) if mode.has_children() => mode,
            _ => return Ok(()),
        };

        let plan = self.store.get_plan_execution(&parent.plan_execution_id)?;
        let plan_node = match plan.plan.node(&parent.plan_node_id) {
            Some(plan_node) => plan_node,
            None => return Ok(()),
        };
        let expected = match mode {
            ExecutionMode::Child => plan_node.children.len().min(1),
            _ => plan_node.children.len(),
        };
        let sequential = !matches!(mode, ExecutionMode::Children { parallel: true });

        let children = self.store.find_children(parent_id)?;
        let status = Status::aggregate(
            children
                .iter()
                .filter(|c| c.status.is_terminal() && c.counts_toward_status())
                .map(|c| c.status),
        );

        if parent.ended_children >= expected || (sequential && status.is_failure()) {
            return self.complete_node(parent_id, section_response(status, &children));
        }

        if sequential && parent.started_children == parent.ended_children {
            self.start_child_at(&plan, &parent, plan_node, parent.started_children)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Plan completion
    // ------------------------------------------------------------------

    /// Computes the plan's final status from its top-level nodes and
    /// records it. Only one caller wins; the rest see `None`.
    pub(crate) fn finalize_plan(&self, plan_id: &str) -> Result<Option<PlanExecution>> {
        self.finalize_plan_with(plan_id, None)
    }

    /// Like [`finalize_plan`](Self::finalize_plan), ranking `cause` with the
    /// top-level statuses.
    fn finalize_plan_with(&self, plan_id: &str, cause: Option<Status>) -> Result<Option<PlanExecution>> {
        let plan = self.store.get_plan_execution(plan_id)?;
        if plan.status.is_terminal() {
            return Ok(None);
        }

        let status = if plan.abort_requested {
            Status::Aborted
        } else {
            let nodes = self.store.find_node_executions_for_plan(plan_id)?;
            Status::aggregate(
                nodes
                    .iter()
                    .filter(|n| n.parent_id.is_none() && n.status.is_terminal() && n.counts_toward_status())
                    .map(|n| n.status)
                    .chain(cause),
            )
        };

        let finished = self.transition_plan(plan_id, UNFINISHED, status)?;
        if let Some(finished) = &finished {
            let elapsed = finished
                .started_at
                .zip(finished.ended_at)
                .map(|(start, end)| (end - start).num_milliseconds())
                .unwrap_or(0);
            info!("Plan execution {} finished {} in {} ms", plan_id, status, elapsed);
        }
        Ok(finished)
    }

    pub(crate) fn abort_live_nodes(&self, plan_id: &str, reason: &str) -> Result<usize> {
        let mut aborted = 0;
        for node in self.store.find_node_executions_for_plan(plan_id)? {
            if self.abort_quietly(&node, reason)? {
                aborted += 1;
            }
        }
        Ok(aborted)
    }

    fn outcome_map(&self, plan_id: &str) -> Result<OutcomeMap> {
        let mut outcomes = OutcomeMap::new();
        for node in self.store.find_node_executions_for_plan(plan_id)? {
            if node.status.is_terminal() && !node.old_retry && !node.outcomes.is_empty() {
                outcomes.insert(node.identifier.clone(), node.outcomes);
            }
        }
        Ok(outcomes)
    }

    // ------------------------------------------------------------------
    // Watcher duties and recovery
    // ------------------------------------------------------------------

    fn tick(&self, now: DateTime<Utc>) {
        if let Err(err) = self.expire_overdue(now) {
            self.report("expire", &err);
        }
        if let Err(err) = self.fire_due(now) {
            self.report("start delayed", &err);
        }
        let purged = self.notify.purge_expired(now);
        if purged.expired_responses > 0 || purged.timed_out_waits > 0 {
            debug!(
                "Purged {} response(s), timed out {} wait(s)",
                purged.expired_responses, purged.timed_out_waits
            );
        }
    }

    fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize> {
        let waiting = self
            .store
            .find_node_executions_by_status(&[Status::AsyncWaiting, Status::InterventionWaiting])?;

        let mut expired = 0;
        for node in waiting {
            if !node.timeout_at.map(|at| at <= now).unwrap_or(false) {
                continue;
            }
            let result = match node.status {
                Status::AsyncWaiting => self.expire_task(&node),
                _ => self.expire_intervention(&node),
            };
            match result {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(err) => self.report("expire", &err),
            }
        }
        Ok(expired)
    }

    fn expire_task(&self, node: &NodeExecution) -> Result<bool> {
        // Claiming RUNNING first makes a racing resume stale.
        if self
            .transition_node(&node.id, &[Status::AsyncWaiting], Status::Running, |_| {})?
            .is_none()
        {
            return Ok(false);
        }
        self.notify.cancel(&node.id);

        warn!("Node {} ({}) timed out waiting for its task", node.identifier, node.id);
        let response = StepResponse {
            status: Status::Expired,
            outcomes: HashMap::new(),
            failure: Some(FailureInfo::new(
                "Timed out waiting for task completion",
                vec![FailureType::Expired],
            )),
        };
        self.complete_node(&node.id, response)?;
        Ok(true)
    }

    fn expire_intervention(&self, node: &NodeExecution) -> Result<bool> {
        let failure = FailureInfo::new("Manual intervention timed out", vec![FailureType::Expired]);
        let expired = self.transition_node(&node.id, &[Status::InterventionWaiting], Status::Expired, |n| {
            n.failure_info = Some(failure.clone());
            n.advise = Some(AdviseKind::MarkFailed);
        })?;
        match expired {
            Some(expired) => {
                warn!("Node {} ({}) was not attended in time", expired.identifier, expired.id);
                self.apply_advise(&expired, Advise::mark_failed())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn fire_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.delayed.take_due(now);
        let count = due.len();
        for node_id in due {
            self.submit_start(&node_id, true)?;
        }
        Ok(count)
    }

    fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for plan in self.store.find_plan_executions_by_status(UNFINISHED)? {
            for node in self.store.find_node_executions_for_plan(&plan.id)? {
                match node.status {
                    Status::Queued => {
                        // Retry attempts never re-apply the initial wait.
                        self.submit_start(&node.id, !node.retry_ids.is_empty())?;
                        report.requeued += 1;
                    }
                    Status::AsyncWaiting => {
                        self.register_wait(&node);
                        report.rewaited += 1;
                    }
                    Status::Running => match node.mode {
                        Some(mode) if mode.has_children() => {
                            self.section_progress(&node.id)?;
                            report.sections += 1;
                        }
                        _ => {
                            self.submit(Job::Rerun(node.id.clone()))?;
                            report.rerun += 1;
                        }
                    },
                    _ => {}
                }
            }
        }

        info!(
            "Recovery re-drove {} queued, {} waiting, {} running and {} section node(s)",
            report.requeued, report.rewaited, report.rerun, report.sections
        );
        Ok(report)
    }
}

/// Resumes a node once its wait is satisfied.
struct ResumeOnNotify {
    engine: Weak<EngineInner>,
    node_execution_id: String,
}

impl NotifyCallback for ResumeOnNotify {
    fn on_notify(&self, responses: HashMap<String, NotifyResponse>) {
        let engine = match self.engine.upgrade() {
            Some(engine) => engine,
            None => {
                warn!("Engine gone; dropping resumption of {}", self.node_execution_id);
                return;
            }
        };

        let is_error = responses.values().any(|r| r.is_error);
        let resume = DeferredResume {
            node_execution_id: self.node_execution_id.clone(),
            responses,
            is_error,
        };
        if let Err(err) = engine.submit_resume(resume) {
            engine.report("resume", &err);
        }
    }
}

/// Forwards task progress to observers.
struct RelayProgress {
    engine: Weak<EngineInner>,
    node_execution_id: String,
}

impl ProgressCallback for RelayProgress {
    fn on_progress(&self, _correlation_id: &str, data: &Value) {
        if let Some(engine) = self.engine.upgrade() {
            engine.observers.progress(&self.node_execution_id, data);
        }
    }
}

/// Timestamps implied by entering `status`.
fn stamp_node(node: &mut NodeExecution, status: Status, now: DateTime<Utc>) {
    match status {
        Status::Running => {
            if node.started_at.is_none() {
                node.started_at = Some(now);
            }
            node.timeout_at = None;
        }
        Status::AsyncWaiting | Status::InterventionWaiting => node.waiting_since = Some(now),
        s if s.is_terminal() => {
            node.ended_at = Some(now);
            node.timeout_at = None;
        }
        _ => {}
    }
}

fn section_response(status: Status, children: &[NodeExecution]) -> StepResponse {
    if !status.is_failure() {
        return StepResponse::success();
    }

    let failed: Vec<&NodeExecution> = children
        .iter()
        .filter(|c| c.counts_toward_status() && c.status.is_failure())
        .collect();
    let mut failure_types: Vec<FailureType> = Vec::new();
    for failure_type in failed.iter().flat_map(|c| c.failure_types()) {
        if !failure_types.contains(&failure_type) {
            failure_types.push(failure_type);
        }
    }

    StepResponse {
        status,
        outcomes: HashMap::new(),
        failure: Some(FailureInfo::new(
            format!("{} child node(s) did not succeed", failed.len()),
            failure_types,
        )),
    }
}

fn panicked(node: &NodeExecution, payload: Box<dyn Any + Send>) -> StepResponse {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    error!("Node {} panicked: {}", node.identifier, message);
    StepResponse::failed(format!("Step panicked: {}", message), vec![FailureType::Unknown])
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}
