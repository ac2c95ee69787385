//! Session lifecycle and the main scheduling loop.
//!
//! The coordinator is the only dispatcher. It hands ready tasks to workers,
//! applies the outcomes they report, enforces per-class deadlines, opens gates
//! at phase boundaries, evaluates the extension policy, writes a checkpoint
//! whenever a phase completes, and finally drains and closes the session.
//!
//! ```text
//! start_session -> run loop -> drain (shutdown handshake) -> close_session -> RunReport
//! ```

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::dag::{EdgeKind, TaskGraph, Transition};
use crate::core::task::{FailureReason, Phase, TaskId, TaskOutput, TaskSpec, TaskStatus};
use crate::orchestration::actor::GraphHandle;
use crate::orchestration::cost::{CostLedger, COST_METRIC};
use crate::orchestration::extension::{ExtensionPlan, ExtensionPolicy};
use crate::orchestration::gate::{Approver, Decision, GateController, GateKind, GateSpec, Presentation};
use crate::orchestration::report::RunReport;
use crate::orchestration::router::{Endpoint, Mailbox, Message, MessageKind, MessageRouter};
use crate::orchestration::worker::{Worker, WorkerEnv, WorkerEvent, WorkerHandle, WorkerId, WorkerOutcome, WorkerSpec};
use crate::session::{SessionId, SessionRegistry, SessionState, TeamSession};
use crate::state::{restore_into, Checkpoint, CheckpointStore};
use crate::util::{backoff_delay, blocking};
use crate::workflow::{BuiltPipeline, Profile};
use crate::{clog, clog_debug, clog_error, clog_trace, clog_warn, Error, Result};

/// Upper bound on the wait between two shutdown attempts.
const MAX_SHUTDOWN_WAIT: Duration = Duration::from_secs(30);

/// Parameters for [`Coordinator::start_session`].
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub name: String,
    pub metadata: BTreeMap<String, String>,
    /// Restore every phase before this one from checkpoints.
    pub resume_from: Option<Phase>,
}

impl SessionConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn resume_from(mut self, phase: Phase) -> Self {
        self.resume_from = Some(phase);
        self
    }

    pub fn meta(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    worker: WorkerId,
    limit: Duration,
}

enum Activity {
    Cancelled,
    Event(Option<WorkerEvent>),
    Message(Option<Message>),
    DeadlineReached,
}

pub struct Coordinator {
    config: Config,
    pipeline: String,
    profile: Profile,
    phases: Vec<Phase>,
    workspace: PathBuf,
    /// Graph waiting for `start_session`.
    template: Option<TaskGraph>,
    gates: VecDeque<GateSpec>,
    extension: Option<ExtensionPolicy>,
    extension_done: bool,
    pending_extension: Option<ExtensionPlan>,
    store: CheckpointStore,
    executor: Arc<dyn Worker>,
    approver: Arc<dyn Approver>,
    gate_controller: Option<GateController>,
    sessions: SessionRegistry,
    session: Option<String>,
    graph: Option<GraphHandle>,
    graph_join: Option<JoinHandle<TaskGraph>>,
    router: MessageRouter,
    mailbox: Mailbox,
    workers: BTreeMap<WorkerId, WorkerHandle>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    deadlines: HashMap<TaskId, Deadline>,
    /// Tasks reserved by `spawn_worker` and not yet handed over.
    bound: BTreeMap<TaskId, WorkerId>,
    ledger: CostLedger,
    checkpointed: BTreeSet<Phase>,
    cancel: CancellationToken,
    aborted: bool,
    started_at: DateTime<Utc>,
}

impl Coordinator {
    /// Create a coordinator for a built pipeline.
    ///
    /// # Arguments
    ///
    /// * `config` - Engine configuration (worker cap, timeouts, checkpoint root)
    /// * `pipeline` - Graph, gates and extension policy resolved for one profile
    /// * `executor` - Runs every task; shared by all workers
    /// * `approver` - Decides gates
    pub fn new(
        config: Config,
        pipeline: BuiltPipeline,
        executor: Arc<dyn Worker>,
        approver: Arc<dyn Approver>,
    ) -> Result<Self> {
        config.validate()?;
        let store = CheckpointStore::new(config.effective_checkpoint_dir()?);
        let workspace = match pipeline.workspace {
            Some(ws) => ws,
            None => std::env::current_dir()?,
        };
        let router = MessageRouter::new();
        let mailbox = router.subscribe(Endpoint::Coordinator);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut phases: Vec<Phase> = pipeline.phases.iter().map(|p| p.number).collect();
        phases.sort_unstable();

        Ok(Self {
            ledger: CostLedger::new(config.cost_warning_threshold),
            config,
            pipeline: pipeline.name,
            profile: pipeline.profile,
            phases,
            workspace,
            template: Some(pipeline.graph),
            gates: pipeline.gates.into(),
            extension: pipeline.extension,
            extension_done: false,
            pending_extension: None,
            store,
            executor,
            approver,
            gate_controller: None,
            sessions: SessionRegistry::new(),
            session: None,
            graph: None,
            graph_join: None,
            router,
            mailbox,
            workers: BTreeMap::new(),
            events_tx,
            events_rx,
            deadlines: HashMap::new(),
            bound: BTreeMap::new(),
            checkpointed: BTreeSet::new(),
            cancel: CancellationToken::new(),
            aborted: false,
            started_at: Utc::now(),
        })
    }

    pub fn with_store(mut self, store: CheckpointStore) -> Self {
        self.store = store;
        self
    }

    /// Use an external cancellation token (for example one tied to Ctrl-C).
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Control surface of the running session's graph.
    pub fn graph(&self) -> Result<&GraphHandle> {
        self.graph
            .as_ref()
            .ok_or_else(|| Error::SessionNotFound("no session started".to_string()))
    }

    pub fn session(&self) -> Option<&TeamSession> {
        self.session.as_deref().and_then(|name| self.sessions.get(name))
    }

    fn session_mut(&mut self) -> Result<&mut TeamSession> {
        let name = self
            .session
            .clone()
            .ok_or_else(|| Error::SessionNotFound("no session started".to_string()))?;
        self.sessions.get_mut(&name)
    }

    fn warn(&mut self, warning: String) {
        match self.session_mut() {
            Ok(session) => session.warn(warning),
            Err(_) => clog_warn!("{}", warning),
        }
    }

    fn ensure_active(&self) -> Result<()> {
        match self.session() {
            Some(session) if session.is_active() => Ok(()),
            Some(session) => Err(Error::InvalidSessionTransition {
                from: session.state.to_string(),
                to: "active".to_string(),
            }),
            None => Err(Error::SessionNotFound("no session started".to_string())),
        }
    }

    /// Open the session, restoring earlier phases when resuming.
    pub async fn start_session(&mut self, config: SessionConfig) -> Result<SessionId> {
        if let Some(name) = &self.session {
            return Err(Error::SessionExists(name.clone()));
        }
        let template = self
            .template
            .as_ref()
            .ok_or_else(|| Error::Validation("pipeline graph was already used by a session".to_string()))?;

        let mut graph = template.clone();
        let mut restored_phases = Vec::new();
        let mut warnings = Vec::new();
        if let Some(resume) = config.resume_from {
            if !self.phases.contains(&resume) {
                return Err(Error::Validation(format!(
                    "cannot resume from phase {}: not part of the {} pipeline",
                    resume, self.profile
                )));
            }
            restored_phases = self.phases.iter().copied().filter(|p| *p < resume).collect();
            let pipeline = self.pipeline.clone();
            let store = self.store.clone();
            let phases = restored_phases.clone();
            let checkpoints = blocking(move || store.load_required(&pipeline, &phases)).await?;
            for checkpoint in &checkpoints {
                if checkpoint.profile != self.profile {
                    warnings.push(format!(
                        "phase {} checkpoint was written under profile {}, resuming under {}",
                        checkpoint.phase, checkpoint.profile, self.profile
                    ));
                }
            }
            let restored = restore_into(&mut graph, &checkpoints, resume)?;
            clog!("Resuming {} from phase {}: {} tasks restored", self.pipeline, resume, restored.len());

            self.gates
                .retain(|g| g.kind == GateKind::Parameters || g.before_phase >= resume);
            if let Some(policy) = &self.extension {
                let source_done = graph
                    .get_by_key(&policy.source)
                    .is_some_and(|t| t.status == TaskStatus::Completed);
                if source_done {
                    self.extension_done = true;
                }
            }
        }

        let id = self.sessions.create_session(&config.name, config.metadata)?;
        self.session = Some(config.name.trim().to_string());
        for warning in warnings {
            self.warn(warning);
        }
        self.template = None;
        self.checkpointed.extend(restored_phases);

        let (handle, join) = GraphHandle::spawn(graph);
        self.graph = Some(handle);
        self.graph_join = Some(join);
        self.gate_controller = Some(GateController::new(
            Arc::clone(&self.approver),
            self.profile,
            self.config.gate_timeout(),
            self.cancel.clone(),
        ));
        self.started_at = Utc::now();
        clog!(
            "Session '{}' ({}) started for {} under {}",
            config.name,
            id.short(),
            self.pipeline,
            self.profile
        );
        Ok(id)
    }

    /// Add a task to the running session.
    pub async fn create_task(&mut self, spec: TaskSpec, blocked_by: Vec<(TaskId, EdgeKind)>) -> Result<TaskId> {
        self.ensure_active()?;
        let graph = self.graph()?.clone();
        let id = graph.create_task(spec).await?;
        for (blocker, kind) in blocked_by {
            let transition = graph.write(move |g| g.add_edge(id, blocker, kind)).await??;
            self.apply_transition(transition);
        }
        Ok(id)
    }

    /// Spawn a worker and reserve `task` for it.
    ///
    /// The task may still be blocked. It is handed to the worker once it is
    /// ready and no gate stands in front of its phase; its deadline starts
    /// then. On failure the new worker is dropped again.
    pub async fn spawn_worker(&mut self, task: TaskId, spec: WorkerSpec) -> Result<WorkerId> {
        self.ensure_active()?;
        let graph = self.graph()?.clone();
        let worker = self.new_worker(spec)?;
        if let Err(e) = graph.claim(task, worker).await {
            self.discard_worker(worker);
            return Err(e);
        }
        self.bound.insert(task, worker);
        clog_debug!("Reserved {} for worker {}", task, worker.short());
        Ok(worker)
    }

    fn discard_worker(&mut self, worker: WorkerId) {
        if let Some(handle) = self.workers.remove(&worker) {
            handle.discard();
        }
        if let Ok(session) = self.session_mut() {
            session.workers.remove(&worker);
        }
    }

    fn is_bound(&self, worker: WorkerId) -> bool {
        self.bound.values().any(|w| *w == worker)
    }

    fn live_workers(&self) -> usize {
        self.workers.values().filter(|w| !w.is_closed()).count()
    }

    fn running_count(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.current_task().is_some())
            .count()
    }

    fn new_worker(&mut self, spec: WorkerSpec) -> Result<WorkerId> {
        if self.live_workers() >= self.config.max_workers {
            return Err(Error::WorkerPoolFull {
                max: self.config.max_workers,
            });
        }
        let env = WorkerEnv {
            graph: self.graph()?.clone(),
            router: self.router.clone(),
            workspace: self.workspace.clone(),
            events: self.events_tx.clone(),
        };
        let handle = WorkerHandle::spawn(spec, Arc::clone(&self.executor), env);
        let id = handle.id();
        self.workers.insert(id, handle);
        self.session_mut()?.workers.insert(id);
        Ok(id)
    }

    /// Claim `task` for `worker` and hand it over.
    async fn dispatch_to(&mut self, worker: WorkerId, task: TaskId) -> Result<()> {
        let graph = self.graph()?.clone();
        if !self.workers.contains_key(&worker) {
            return Err(Error::WorkerNotFound(worker));
        }
        graph.claim(task, worker).await?;
        if let Err(e) = self.hand_over(worker, task).await {
            graph.release(task, worker).await?;
            return Err(e);
        }
        Ok(())
    }

    /// Assign an already claimed task and arm its deadline.
    async fn hand_over(&mut self, worker: WorkerId, task: TaskId) -> Result<()> {
        let graph = self.graph()?.clone();
        let cancel = self.cancel.clone();
        match self.workers.get_mut(&worker) {
            Some(handle) => handle.assign(task, &cancel)?,
            None => return Err(Error::WorkerNotFound(worker)),
        }

        let class = graph
            .get_task(task)
            .await?
            .and_then(|t| t.class);
        let limit = self.config.timeout_for(class.as_deref());
        self.deadlines.insert(
            task,
            Deadline {
                at: Instant::now() + limit,
                worker,
                limit,
            },
        );
        clog_debug!("Dispatched {} to worker {} (deadline {:?})", task, worker.short(), limit);
        Ok(())
    }

    /// Drive the session to completion and return its report.
    ///
    /// Starts a session named after the pipeline if none was started.
    pub async fn run(&mut self) -> Result<RunReport> {
        if self.session.is_none() {
            let name = self.pipeline.clone();
            self.start_session(SessionConfig::new(&name)).await?;
        }
        if let Err(e) = self.drive().await {
            clog_error!("Session loop failed: {}", e);
            let _ = self.drain().await;
            return Err(e);
        }
        self.drain().await?;
        self.close_session().await
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            self.process_queued_events().await?;
            self.checkpoint_completed_phases().await?;

            if let Some(plan) = self.pending_extension.take() {
                self.decide_extension(plan).await?;
                continue;
            }

            // Cancelling fails running work, which can make the graph terminal
            // before the loop sees the token.
            if self.cancel.is_cancelled() && !self.aborted {
                self.abort("session cancelled").await?;
                continue;
            }
            let graph = self.graph()?.clone();
            if graph.is_terminal().await? {
                clog!("Graph is terminal");
                return Ok(());
            }

            let frontier = self.gates.front().map(|g| g.before_phase);
            if let Some(phase) = frontier {
                if self.gate_is_due(phase).await? {
                    if let Some(gate) = self.gates.pop_front() {
                        self.open_gate(gate).await?;
                    }
                    continue;
                }
            }

            self.start_bound(frontier).await?;
            if !self.aborted {
                self.dispatch_ready(frontier).await?;
            }

            if self.running_count() == 0 && self.events_rx.is_empty() {
                let stuck: Vec<String> = graph
                    .read(|g| {
                        g.tasks()
                            .into_iter()
                            .filter(|t| !t.is_finished())
                            .map(|t| format!("{} ({})", t.key, t.status))
                            .collect()
                    })
                    .await?;
                return Err(Error::Validation(format!(
                    "no runnable work and no gate due; waiting: {}",
                    stuck.join(", ")
                )));
            }

            self.wait_for_activity().await?;
        }
    }

    async fn wait_for_activity(&mut self) -> Result<()> {
        let next_deadline = self.deadlines.values().map(|d| d.at).min();
        let activity = tokio::select! {
            _ = self.cancel.cancelled(), if !self.aborted => Activity::Cancelled,
            event = self.events_rx.recv() => Activity::Event(event),
            message = self.mailbox.recv() => Activity::Message(message),
            _ = sleep_until(next_deadline) => Activity::DeadlineReached,
        };
        match activity {
            Activity::Cancelled => Ok(()),
            Activity::Event(Some(event)) => self.handle_event(event).await,
            Activity::Event(None) => Err(Error::ChannelClosed("worker events")),
            Activity::Message(Some(message)) => {
                self.handle_message(&message);
                Ok(())
            }
            Activity::Message(None) => Err(Error::ChannelClosed("coordinator mailbox")),
            Activity::DeadlineReached => self.expire_deadlines().await,
        }
    }

    async fn process_queued_events(&mut self) -> Result<()> {
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event).await?;
        }
        while let Some(message) = self.mailbox.try_recv() {
            self.handle_message(&message);
        }
        Ok(())
    }

    fn handle_message(&self, message: &Message) {
        match &message.kind {
            MessageKind::Progress { task, .. } => {
                let task = task.map(|t| t.to_string()).unwrap_or_default();
                clog_trace!("{} {}: {}", message.sender, task, message.summary);
            }
            other => clog_debug!("Coordinator ignored {:?} from {}", other, message.sender),
        }
    }

    async fn handle_event(&mut self, event: WorkerEvent) -> Result<()> {
        let graph = self.graph()?.clone();
        match event {
            WorkerEvent::Finished {
                worker,
                task,
                outcome,
            } => {
                self.deadlines.remove(&task);
                self.mailbox.forget_task(task);
                if let Some(handle) = self.workers.get_mut(&worker) {
                    handle.finish(task);
                }
                match outcome {
                    WorkerOutcome::Completed(output) => self.on_completed(task, output).await?,
                    WorkerOutcome::Failed(reason) => {
                        let message = reason.to_string();
                        match graph.fail(task, reason).await {
                            Ok(transition) => {
                                clog_warn!("{} failed: {}", task, message);
                                self.apply_transition(transition);
                            }
                            Err(e) => clog_debug!("Late failure report for {} ignored: {}", task, e),
                        }
                    }
                    WorkerOutcome::Cancelled => {
                        let still_running = graph
                            .get_task(task)
                            .await?
                            .is_some_and(|t| t.status == TaskStatus::InProgress);
                        if still_running {
                            let transition = graph.fail(task, FailureReason::UserAborted).await?;
                            self.apply_transition(transition);
                        }
                    }
                    WorkerOutcome::NotStarted(reason) => {
                        clog_debug!("{} not started by {}: {}", task, worker.short(), reason);
                        let _ = graph.release(task, worker).await;
                    }
                }
            }
            WorkerEvent::Exited { worker, panicked } => {
                let reserved: Vec<TaskId> = self
                    .bound
                    .iter()
                    .filter(|(_, w)| **w == worker)
                    .map(|(t, _)| *t)
                    .collect();
                for task in reserved {
                    self.bound.remove(&task);
                    let _ = graph.release(task, worker).await;
                }
                let current = self.workers.get(&worker).and_then(|h| h.current_task());
                if let Some(task) = current {
                    self.deadlines.remove(&task);
                    let status = graph.get_task(task).await?.map(|t| t.status);
                    match status {
                        Some(TaskStatus::InProgress) => {
                            let transition = graph.fail(task, FailureReason::WorkerLost).await?;
                            self.apply_transition(transition);
                        }
                        Some(status) if !status.is_terminal() => {
                            let _ = graph.release(task, worker).await;
                        }
                        _ => {}
                    }
                }
                if let Some(handle) = self.workers.get_mut(&worker) {
                    if let Some(task) = current {
                        handle.finish(task);
                    }
                    if !handle.is_closed() {
                        handle.mark_closed();
                    }
                }
                if panicked {
                    self.warn(format!("worker {} panicked", worker.short()));
                }
            }
        }
        Ok(())
    }

    async fn on_completed(&mut self, task: TaskId, output: TaskOutput) -> Result<()> {
        let graph = self.graph()?.clone();
        let cost = output.metric(COST_METRIC);
        let metrics = output.metrics.clone();
        let transition = match graph.complete(task, output).await {
            Ok(transition) => transition,
            Err(e) => {
                clog_debug!("Late completion of {} ignored: {}", task, e);
                return Ok(());
            }
        };
        self.apply_transition(transition);

        let Some(done) = graph.get_task(task).await? else {
            return Ok(());
        };
        clog!("{} ({}) completed", done.key, task);
        if let Some(amount) = cost {
            if let Some(warning) = self.ledger.record(done.phase, amount, &done.key) {
                self.warn(warning);
            }
        }

        let Some(policy) = self.extension.clone() else {
            return Ok(());
        };
        if self.extension_done || policy.source != done.key {
            return Ok(());
        }
        self.extension_done = true;
        let Some(value) = metrics.get(&policy.metric).copied() else {
            self.warn(format!(
                "{} did not report metric '{}'; extension skipped",
                done.key, policy.metric
            ));
            return Ok(());
        };
        match policy.evaluate_extension(value, done.phase) {
            None => clog!("{} = {} is below the extension band", policy.metric, value),
            Some(plan) if plan.needs_approval() => {
                clog!("{} = {} needs approval to extend", policy.metric, value);
                self.pending_extension = Some(plan);
            }
            Some(plan) => {
                clog!("{} = {} extends the graph", policy.metric, value);
                self.splice(plan).await?;
            }
        }
        Ok(())
    }

    /// Forward cascade results: cancel cascaded work, clear its deadlines.
    fn apply_transition(&mut self, transition: Transition) {
        if !transition.cascaded.is_empty() {
            clog_error!(
                "Required dependency failure cascaded to {} task(s): {:?}",
                transition.cascaded.len(),
                transition.cascaded
            );
        }
        for task in &transition.annotated {
            clog_debug!("{} received an optional-source annotation", task);
        }
        for task in &transition.cascaded {
            self.deadlines.remove(task);
        }
        for (task, owner) in &transition.cancelled {
            if let Some(handle) = self.workers.get(owner) {
                if handle.current_task() == Some(*task) {
                    handle.cancel_current();
                }
            }
        }
    }

    async fn expire_deadlines(&mut self) -> Result<()> {
        let now = Instant::now();
        let expired: Vec<(TaskId, Deadline)> = self
            .deadlines
            .iter()
            .filter(|(_, d)| d.at <= now)
            .map(|(t, d)| (*t, *d))
            .collect();
        let graph = self.graph()?.clone();
        for (task, deadline) in expired {
            self.deadlines.remove(&task);
            let reason = FailureReason::WorkerTimeout {
                after_secs: deadline.limit.as_secs(),
            };
            match graph.fail(task, reason).await {
                Ok(transition) => {
                    self.warn(format!(
                        "{} timed out after {:?} on worker {}",
                        task,
                        deadline.limit,
                        deadline.worker.short()
                    ));
                    if let Some(handle) = self.workers.get(&deadline.worker) {
                        handle.cancel_current();
                    }
                    self.apply_transition(transition);
                }
                Err(e) => clog_debug!("Deadline for {} had nothing to fail: {}", task, e),
            }
        }
        Ok(())
    }

    async fn dispatch_ready(&mut self, frontier: Option<Phase>) -> Result<()> {
        let graph = self.graph()?.clone();
        let ready = graph
            .read(|g| {
                g.ready_tasks()
                    .into_iter()
                    .filter_map(|id| g.get(id).cloned())
                    .collect::<Vec<_>>()
            })
            .await?;

        for task in ready {
            if frontier.is_some_and(|gate_phase| task.phase >= gate_phase) {
                continue;
            }
            let idle = self
                .workers
                .values()
                .find(|w| w.is_idle() && !self.is_bound(w.id()))
                .map(|w| w.id());
            let worker = match idle {
                Some(worker) => worker,
                None if self.live_workers() < self.config.max_workers => {
                    self.new_worker(WorkerSpec::for_task(&task))?
                }
                None => break,
            };
            if let Err(e) = self.dispatch_to(worker, task.id).await {
                clog_warn!("Could not dispatch {}: {}", task.key, e);
            }
        }
        Ok(())
    }

    /// Hand reserved tasks to their workers once they are ready and ahead of
    /// the next gate. Reservations on finished tasks are dropped.
    async fn start_bound(&mut self, frontier: Option<Phase>) -> Result<()> {
        if self.bound.is_empty() {
            return Ok(());
        }
        let graph = self.graph()?.clone();
        let tasks: Vec<TaskId> = self.bound.keys().copied().collect();
        let states = graph
            .read(move |g| {
                tasks
                    .into_iter()
                    .filter_map(|id| g.get(id).map(|t| (id, t.phase, t.is_ready(), t.is_finished())))
                    .collect::<Vec<_>>()
            })
            .await?;

        for (task, phase, ready, finished) in states {
            if finished {
                self.bound.remove(&task);
                continue;
            }
            if !ready || self.aborted || frontier.is_some_and(|gate_phase| phase >= gate_phase) {
                continue;
            }
            let Some(worker) = self.bound.remove(&task) else {
                continue;
            };
            if let Err(e) = self.hand_over(worker, task).await {
                let _ = graph.release(task, worker).await;
                self.warn(format!("reserved task {} not started: {}", task, e));
            }
        }
        Ok(())
    }

    /// A gate opens once nothing runs and every earlier phase is finished.
    async fn gate_is_due(&self, before_phase: Phase) -> Result<bool> {
        if self.running_count() > 0 {
            return Ok(false);
        }
        self.graph()?
            .read(move |g| {
                g.tasks()
                    .into_iter()
                    .filter(|t| t.phase < before_phase)
                    .all(|t| t.is_finished())
            })
            .await
    }

    async fn open_gate(&mut self, gate: GateSpec) -> Result<()> {
        let graph = self.graph()?.clone();
        let presentation = self.presentation_for(&gate).await?;
        let decision = match self.gate_controller.as_mut() {
            Some(controller) => controller.await_gate(&gate, &presentation).await,
            None => return Err(Error::SessionNotFound("no session started".to_string())),
        };
        match decision {
            Decision::Proceed => Ok(()),
            Decision::Modify(patch) => {
                if patch.skip_extension {
                    self.extension_done = true;
                }
                let touched = graph.apply_patch(patch).await?;
                clog!("Gate {} patched {} task(s)", gate.id, touched.len());
                Ok(())
            }
            Decision::Abort => self.abort(&format!("gate {} aborted the session", gate.id)).await,
        }
    }

    async fn presentation_for(&self, gate: &GateSpec) -> Result<Presentation> {
        let before = gate.before_phase;
        let lines: Vec<String> = self
            .graph()?
            .read(move |g| {
                g.tasks()
                    .into_iter()
                    .filter(|t| t.phase >= before && !t.is_finished())
                    .map(|t| format!("[{}] {}: {}", t.phase, t.key, t.subject))
                    .collect()
            })
            .await?;

        let mut presentation = Presentation::new(if gate.description.is_empty() {
            gate.title.clone()
        } else {
            format!("{}\n{}", gate.title, gate.description)
        });
        if gate.kind == GateKind::Parameters {
            presentation.params.insert("pipeline".into(), self.pipeline.clone().into());
            presentation.params.insert("profile".into(), self.profile.to_string().into());
            presentation.params.insert("max_workers".into(), self.config.max_workers.into());
            presentation
                .params
                .insert("workspace".into(), self.workspace.display().to_string().into());
        }
        for line in lines {
            presentation = presentation.detail(line);
        }
        Ok(presentation)
    }

    async fn decide_extension(&mut self, plan: ExtensionPlan) -> Result<()> {
        let Some(policy) = self.extension.clone() else {
            return Ok(());
        };
        let phase = plan.splice.tasks.first().map(|t| t.phase).unwrap_or_default();
        let mut gate = GateSpec::new(
            &format!("extend-{}", policy.source),
            policy
                .gate_title
                .as_deref()
                .unwrap_or("Extend the graph with follow-up work?"),
            phase,
        );
        gate.kind = GateKind::Extension;

        let mut presentation = Presentation::new(format!(
            "{} reported {} = {:.3} (auto-extend above {}, ignore below {})",
            policy.source, policy.metric, plan.metric, policy.high_threshold, policy.low_threshold
        ));
        for task in &plan.splice.tasks {
            presentation = presentation.detail(format!("+ {}: {}", task.key, task.subject));
        }

        let decision = match self.gate_controller.as_mut() {
            Some(controller) => controller.await_gate(&gate, &presentation).await,
            None => return Err(Error::SessionNotFound("no session started".to_string())),
        };
        match decision {
            Decision::Proceed => self.splice(plan).await,
            Decision::Modify(patch) if patch.skip_extension => {
                clog!("Extension declined at gate {}", gate.id);
                Ok(())
            }
            Decision::Modify(patch) => {
                self.splice(plan).await?;
                self.graph()?.apply_patch(patch).await?;
                Ok(())
            }
            Decision::Abort => self.abort(&format!("gate {} aborted the session", gate.id)).await,
        }
    }

    async fn splice(&mut self, plan: ExtensionPlan) -> Result<()> {
        match self.graph()?.apply_splice(plan.splice).await {
            Ok(added) => {
                clog!("Extension added {} task(s)", added.len());
                Ok(())
            }
            Err(e) => {
                self.warn(format!("extension rejected: {}", e));
                Ok(())
            }
        }
    }

    /// Fail everything that has not started and move to `Draining`.
    async fn abort(&mut self, reason: &str) -> Result<()> {
        self.aborted = true;
        self.gates.clear();
        self.pending_extension = None;
        let failed = self
            .graph()?
            .abort_remaining(FailureReason::UserAborted)
            .await?;
        self.warn(format!("{} ({} task(s) not run)", reason, failed.len()));
        let session = self.session_mut()?;
        if session.state == SessionState::Active {
            session.transition(SessionState::Draining)?;
        }
        Ok(())
    }

    async fn checkpoint_completed_phases(&mut self) -> Result<()> {
        if self.pending_extension.is_some() {
            return Ok(());
        }
        let graph = self.graph()?.clone();
        for phase in self.phases.clone() {
            if self.checkpointed.contains(&phase) {
                continue;
            }
            let pipeline = self.pipeline.clone();
            let profile = self.profile;
            let checkpoint = graph
                .read(move |g| Checkpoint::from_graph(&pipeline, profile, phase, g))
                .await?;
            let Some(checkpoint) = checkpoint else {
                continue;
            };
            self.checkpointed.insert(phase);
            match self.store.save(&checkpoint).await {
                Ok(path) => clog!("Phase {} checkpointed to {}", phase, path.display()),
                Err(e) => self.warn(format!("phase {} checkpoint not written: {}", phase, e)),
            }
        }
        Ok(())
    }

    /// Move to `Draining` and shut every worker down.
    ///
    /// Each live worker gets up to `shutdown_retries` requests with
    /// exponential backoff between them. Workers that never approve are
    /// force-closed and a warning is recorded.
    pub async fn drain(&mut self) -> Result<()> {
        {
            let session = self.session_mut()?;
            if session.state == SessionState::Active {
                session.transition(SessionState::Draining)?;
            }
        }

        let mut pending: BTreeSet<WorkerId> = self
            .workers
            .values()
            .filter(|w| !w.is_closed())
            .map(|w| w.id())
            .collect();
        let mut reasons: HashMap<WorkerId, String> = HashMap::new();
        let retries = self.config.shutdown_retries;
        clog!("Draining {} worker(s)", pending.len());

        for attempt in 0..retries {
            if pending.is_empty() {
                break;
            }
            for id in &pending {
                if let Some(handle) = self.workers.get(id) {
                    if let Err(e) = handle.request_shutdown(attempt) {
                        clog_debug!("Shutdown request to {} failed: {}", id.short(), e);
                    }
                }
            }

            let wait = backoff_delay(self.config.shutdown_backoff(), attempt, MAX_SHUTDOWN_WAIT);
            let deadline = Instant::now() + wait;
            while !pending.is_empty() {
                let message = tokio::select! {
                    message = self.mailbox.recv() => message,
                    _ = tokio::time::sleep_until(deadline) => break,
                };
                let Some(message) = message else { break };
                let (MessageKind::ShutdownResponse { approve, reason }, Endpoint::Worker(id)) =
                    (&message.kind, message.sender)
                else {
                    continue;
                };
                if !pending.contains(&id) {
                    continue;
                }
                if *approve {
                    pending.remove(&id);
                    if let Some(handle) = self.workers.get_mut(&id) {
                        handle.mark_closed();
                    }
                } else {
                    let reason = reason.clone().unwrap_or_else(|| "no reason given".to_string());
                    clog_debug!("Worker {} declined shutdown: {}", id.short(), reason);
                    reasons.insert(id, reason);
                }
            }
        }

        for id in pending {
            if let Some(handle) = self.workers.get_mut(&id) {
                handle.force_close();
            }
            let reason = reasons
                .remove(&id)
                .map(|r| format!(": {}", r))
                .unwrap_or_default();
            self.warn(format!(
                "worker {} force-closed after {} shutdown attempt(s){}",
                id.short(),
                retries,
                reason
            ));
        }

        for handle in self.workers.values_mut() {
            if tokio::time::timeout(MAX_SHUTDOWN_WAIT, handle.join()).await.is_err() {
                clog_warn!("Worker {} did not stop in time", handle.id().short());
            }
            clog_debug!(
                "Worker {} closed after {} task(s)",
                handle.id().short(),
                handle.finished_count()
            );
        }
        Ok(())
    }

    /// Close a drained session and build its report.
    pub async fn close_session(&mut self) -> Result<RunReport> {
        let name = self
            .session
            .clone()
            .ok_or_else(|| Error::SessionNotFound("no session started".to_string()))?;
        self.sessions.get_mut(&name)?.transition(SessionState::Closed)?;

        let graph = self.graph()?.clone_graph().await?;
        let session = self
            .sessions
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(name.clone()))?;

        let mut warnings = session.warnings.clone();
        if self.config.audit_log {
            let path = self
                .store
                .pipeline_dir(&self.pipeline)
                .join(format!("audit-{}.jsonl", session.id.short()));
            let router = self.router.clone();
            match blocking(move || router.write_audit(&path)).await {
                Ok(count) => clog_debug!("Audit log: {} message(s)", count),
                Err(e) => warnings.push(format!("audit log not written: {}", e)),
            }
        }
        self.router.close();

        let mut report = RunReport::from_graph(session.id, &graph, self.aborted);
        report.session_name = session.name.clone();
        report.pipeline = self.pipeline.clone();
        report.profile = self.profile;
        report.warnings = warnings;
        report.gates = self
            .gate_controller
            .as_ref()
            .map(|c| c.history().to_vec())
            .unwrap_or_default();
        report.cost = self.ledger.summary();
        report.started_at = self.started_at;

        self.sessions.delete_session(&name)?;
        self.session = None;
        self.graph = None;
        if let Some(join) = self.graph_join.take() {
            let _ = join.await;
        }

        if report.success {
            clog!("Session '{}' closed: {}", name, report.outcome);
        } else {
            clog_error!("Session '{}' closed: {}", name, report.outcome);
        }
        Ok(report)
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => futures::future::pending().await,
    }
}
