//! Task graph with required/optional blocking edges.
//!
//! `TaskGraph` owns every task of a session and resolves readiness as tasks
//! finish. Edges point from blocker to dependent. Completing a blocker
//! releases its dependents; failing one releases optional dependents (with
//! an annotation) and cascades failure along required edges, so nothing is
//! left waiting on a predecessor that can never succeed.
//!
//! The graph is a `StableDiGraph`: node indices survive later insertions and
//! task ids are plain arena counters, so splicing new work into a running
//! session never invalidates ids held elsewhere.

use crate::core::task::{Annotation, FailureReason, Phase, Task, TaskId, TaskOutput, TaskSpec, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::WorkerId;
use crate::clog_debug;
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;

/// Kind of a blocking edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// The blocker must complete successfully; its failure cascades.
    #[default]
    Required,
    /// The blocker only orders scheduling; its failure is annotated.
    Optional,
}

impl EdgeKind {
    /// The weaker of two kinds, used when an elided task's edges are merged.
    pub fn weaker(self, other: EdgeKind) -> EdgeKind {
        if self == EdgeKind::Optional || other == EdgeKind::Optional {
            EdgeKind::Optional
        } else {
            EdgeKind::Required
        }
    }
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeKind::Required => write!(f, "required"),
            EdgeKind::Optional => write!(f, "optional"),
        }
    }
}

/// Side effects of a graph mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transition {
    /// Tasks that became ready.
    pub unblocked: Vec<TaskId>,
    /// Tasks failed by a required-dependency cascade.
    pub cascaded: Vec<TaskId>,
    /// Tasks that received an optional-blocker annotation.
    pub annotated: Vec<TaskId>,
    /// Cascaded tasks that were running; their owners should stop.
    pub cancelled: Vec<(TaskId, WorkerId)>,
}

impl Transition {
    pub fn merge(&mut self, other: Transition) {
        self.unblocked.extend(other.unblocked);
        self.cascaded.extend(other.cascaded);
        self.annotated.extend(other.annotated);
        self.cancelled.extend(other.cancelled);
    }

    pub fn is_empty(&self) -> bool {
        self.unblocked.is_empty()
            && self.cascaded.is_empty()
            && self.annotated.is_empty()
            && self.cancelled.is_empty()
    }
}

/// Filter for listing tasks. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub phase: Option<Phase>,
    /// Status name as returned by `TaskStatus::name`.
    pub status: Option<String>,
    pub owner: Option<WorkerId>,
    pub ready_only: bool,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.phase.map_or(true, |p| task.phase == p)
            && self.status.as_deref().map_or(true, |s| task.status.name() == s)
            && self.owner.map_or(true, |o| task.owner == Some(o))
            && (!self.ready_only || (task.is_ready() && task.owner.is_none()))
    }
}

/// Partial update through the task control surface.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    /// `Some(Some(w))` claims for `w`, `Some(None)` releases.
    pub owner: Option<Option<WorkerId>>,
    pub add_blocked_by: Vec<(TaskId, EdgeKind)>,
    pub remove_blocked_by: Vec<TaskId>,
}

/// Which not-yet-started tasks a patch touches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "scope", content = "value")]
pub enum PatchTarget {
    #[default]
    All,
    Phase(Phase),
    Keys(Vec<String>),
}

/// Re-parameterisation of tasks that have not started, applied by a gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GraphPatch {
    #[serde(default)]
    pub target: PatchTarget,
    #[serde(default)]
    pub set: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub unset: Vec<String>,
    /// Decline a pending graph extension while still proceeding.
    #[serde(default)]
    pub skip_extension: bool,
}

/// A sub-DAG to insert into a running graph.
#[derive(Debug, Clone, Default)]
pub struct Splice {
    pub tasks: Vec<TaskSpec>,
    /// `(task key, blocker key, kind)`; keys may name existing or new tasks.
    pub edges: Vec<(String, String, EdgeKind)>,
    /// Existing task that must now wait for the new work.
    pub consumer: String,
    /// New tasks the consumer will depend on (required).
    pub terminal: Vec<String>,
    /// Prior blocker of the consumer to drop, for replace-style splices.
    pub replace: Option<String>,
}

/// Serializable view of the whole graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub tasks: Vec<Task>,
    pub edges: Vec<EdgeRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub task: TaskId,
    pub blocker: TaskId,
    pub kind: EdgeKind,
}

/// The session's task graph.
#[derive(Clone)]
pub struct TaskGraph {
    /// Edges run blocker -> dependent.
    graph: StableDiGraph<Task, EdgeKind>,
    index: HashMap<TaskId, NodeIndex>,
    keys: HashMap<String, TaskId>,
    next_id: u64,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            index: HashMap::new(),
            keys: HashMap::new(),
            next_id: 0,
        }
    }

    /// Add a task and return its id. Keys must be unique.
    pub fn add_task(&mut self, spec: TaskSpec) -> Result<TaskId> {
        if spec.key.is_empty() {
            return Err(Error::Validation("task key cannot be empty".to_string()));
        }
        if self.keys.contains_key(&spec.key) {
            return Err(Error::Validation(format!(
                "duplicate task key: {}",
                spec.key
            )));
        }
        let id = TaskId(self.next_id);
        self.next_id += 1;
        let key = spec.key.clone();
        let node = self.graph.add_node(Task::from_spec(id, spec));
        self.index.insert(id, node);
        self.keys.insert(key, id);
        clog_debug!("TaskGraph::add_task {} ({})", id, self.graph[node].key);
        Ok(id)
    }

    /// Declare that `task` waits for `blocker`.
    ///
    /// Fails with `CycleDetected` if `blocker` already (transitively) waits
    /// for `task`. Only tasks that have not started can gain blockers.
    /// Re-adding an existing edge with another kind re-resolves it as if it
    /// were new.
    pub fn add_edge(&mut self, task: TaskId, blocker: TaskId, kind: EdgeKind) -> Result<Transition> {
        let task_ix = self.node(task)?;
        let blocker_ix = self.node(blocker)?;

        if task == blocker || has_path_connecting(&self.graph, task_ix, blocker_ix, None) {
            return Err(Error::CycleDetected { task, blocker });
        }
        let status = &self.graph[task_ix].status;
        if !matches!(status, TaskStatus::Pending | TaskStatus::Blocked) {
            return Err(Error::Validation(format!(
                "cannot add a blocker to {} task {}",
                status.name(),
                task
            )));
        }

        if let Some(edge) = self.graph.find_edge(blocker_ix, task_ix) {
            if self.graph[edge] == kind {
                return Ok(Transition::default());
            }
            self.graph.remove_edge(edge);
            self.graph[task_ix].annotations.retain(|a| a.blocker != blocker);
            clog_debug!("TaskGraph::add_edge {} <- {} kind now {}", task, blocker, kind);
        }
        self.graph.add_edge(blocker_ix, task_ix, kind);
        clog_debug!("TaskGraph::add_edge {} <- {} ({})", task, blocker, kind);

        let mut transition = Transition::default();
        let blocker_status = self.graph[blocker_ix].status.clone();
        match (&blocker_status, kind) {
            (TaskStatus::Completed, EdgeKind::Required) => {}
            (TaskStatus::Completed, EdgeKind::Optional)
            | (TaskStatus::Failed { .. }, EdgeKind::Optional) => {
                self.annotate(task_ix, blocker_ix);
                transition.annotated.push(task);
            }
            (TaskStatus::Failed { .. }, EdgeKind::Required) => {
                let reason = self.upstream_reason(blocker_ix);
                self.cascade(task_ix, reason, &mut transition);
                self.propagate(task, &mut transition);
            }
            _ => {
                let node = &mut self.graph[task_ix];
                node.blocked_by.insert(blocker);
                if node.status == TaskStatus::Pending {
                    node.set_status(TaskStatus::Blocked);
                }
            }
        }
        Ok(transition)
    }

    /// Drop `blocker` from `task`'s blockers, releasing it if nothing else remains.
    pub fn remove_edge(&mut self, task: TaskId, blocker: TaskId) -> Result<Transition> {
        let task_ix = self.node(task)?;
        let blocker_ix = self.node(blocker)?;
        let mut transition = Transition::default();
        if let Some(edge) = self.graph.find_edge(blocker_ix, task_ix) {
            self.graph.remove_edge(edge);
        }
        self.release_blocker(task_ix, blocker, &mut transition);
        Ok(transition)
    }

    /// Record that `worker` owns `task`. At most one owner at a time.
    ///
    /// A blocked task can be reserved ahead of time; starting it still waits
    /// for its blockers.
    pub fn claim(&mut self, task: TaskId, worker: WorkerId) -> Result<()> {
        let ix = self.node(task)?;
        let node = &mut self.graph[ix];
        match node.owner {
            Some(owner) if owner == worker => return Ok(()),
            Some(owner) => return Err(Error::OwnerConflict { task, owner }),
            None => {}
        }
        if !matches!(node.status, TaskStatus::Pending | TaskStatus::Blocked) {
            return Err(Error::Validation(format!(
                "task {} cannot be claimed ({})",
                task, node.status
            )));
        }
        node.owner = Some(worker);
        clog_debug!("TaskGraph::claim {} by {}", task, worker.short());
        Ok(())
    }

    /// Give up ownership of a task that has not started.
    pub fn release(&mut self, task: TaskId, worker: WorkerId) -> Result<()> {
        let ix = self.node(task)?;
        let node = &mut self.graph[ix];
        if node.owner != Some(worker) {
            return Ok(());
        }
        if node.status == TaskStatus::InProgress {
            return Err(Error::Validation(format!(
                "task {} is in progress and cannot be released",
                task
            )));
        }
        if !node.is_finished() {
            node.owner = None;
        }
        Ok(())
    }

    /// Move a task to `InProgress`, `Completed` or `Failed` and resolve its dependents.
    ///
    /// `Pending` and `Blocked` are derived from the blocker set and cannot be
    /// requested directly.
    pub fn mark_status(
        &mut self,
        id: TaskId,
        status: TaskStatus,
        note: Option<&str>,
    ) -> Result<Transition> {
        let ix = self.node(id)?;
        let current = self.graph[ix].status.clone();

        if matches!(status, TaskStatus::Pending | TaskStatus::Blocked) {
            return Err(Error::Validation(format!(
                "{} is derived from blockers and cannot be set on {}",
                status.name(),
                id
            )));
        }
        if !current.can_transition_to(&status) {
            return Err(Error::InvalidTransition {
                task: id,
                from: current,
                to: status,
            });
        }
        {
            let node = &self.graph[ix];
            if status == TaskStatus::InProgress {
                if node.owner.is_none() {
                    return Err(Error::Validation(format!(
                        "task {} has no owner to run it",
                        id
                    )));
                }
                if !node.blocked_by.is_empty() {
                    return Err(Error::Validation(format!("task {} is still blocked", id)));
                }
            }
            if status == TaskStatus::Completed && !node.blocked_by.is_empty() {
                let required_open = self.blockers(id).iter().any(|(b, kind)| {
                    *kind == EdgeKind::Required && node.blocked_by.contains(b)
                });
                if required_open {
                    return Err(Error::Validation(format!(
                        "task {} cannot complete before its required blockers",
                        id
                    )));
                }
            }
        }

        let node = &mut self.graph[ix];
        if let Some(note) = note {
            node.note = Some(note.to_string());
        }
        node.set_status(status);
        clog_debug!("TaskGraph::mark_status {} {} -> {}", id, current, node.status);

        let mut transition = Transition::default();
        if self.graph[ix].is_finished() {
            self.propagate(id, &mut transition);
        }
        Ok(transition)
    }

    /// Complete a task and store what it produced.
    pub fn complete(&mut self, id: TaskId, output: TaskOutput) -> Result<Transition> {
        let transition = self.mark_status(id, TaskStatus::Completed, output.note.as_deref())?;
        let ix = self.node(id)?;
        self.graph[ix].output = Some(output);
        Ok(transition)
    }

    /// Mark a task done from a checkpoint without running it.
    pub fn restore(&mut self, id: TaskId, output: TaskOutput) -> Result<Transition> {
        let ix = self.node(id)?;
        if self.graph[ix].status != TaskStatus::Pending || !self.graph[ix].blocked_by.is_empty() {
            return Err(Error::Validation(format!(
                "task {} cannot be restored while {}",
                id, self.graph[ix].status
            )));
        }
        self.complete(id, output)
    }

    /// Apply a control-surface update: ownership, then edges, then status.
    pub fn update(&mut self, id: TaskId, update: TaskUpdate) -> Result<Transition> {
        self.node(id)?;
        let mut transition = Transition::default();
        match update.owner {
            Some(Some(worker)) => self.claim(id, worker)?,
            Some(None) => {
                if let Some(owner) = self.get(id).and_then(|t| t.owner) {
                    self.release(id, owner)?;
                }
            }
            None => {}
        }
        for (blocker, kind) in update.add_blocked_by {
            transition.merge(self.add_edge(id, blocker, kind)?);
        }
        for blocker in update.remove_blocked_by {
            transition.merge(self.remove_edge(id, blocker)?);
        }
        if let Some(status) = update.status {
            transition.merge(self.mark_status(id, status, None)?);
        }
        Ok(transition)
    }

    /// Tasks that can be handed to a worker now, ordered by phase then id.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        let mut ready: Vec<&Task> = self
            .graph
            .node_weights()
            .filter(|t| t.is_ready() && t.owner.is_none())
            .collect();
        ready.sort_by_key(|t| (t.phase, t.id));
        ready.into_iter().map(|t| t.id).collect()
    }

    /// True when every task is `Completed` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        self.graph.node_weights().all(Task::is_finished)
    }

    /// Fail every task that has not started. Used when a gate aborts.
    pub fn abort_remaining(&mut self, reason: FailureReason) -> Vec<TaskId> {
        let targets: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&ix| {
                matches!(
                    self.graph[ix].status,
                    TaskStatus::Pending | TaskStatus::Blocked
                )
            })
            .collect();
        let mut aborted = Vec::with_capacity(targets.len());
        for ix in targets {
            let node = &mut self.graph[ix];
            node.set_status(TaskStatus::failed(reason.clone()));
            aborted.push(node.id);
        }
        aborted.sort();
        aborted
    }

    /// Re-parameterise not-yet-started tasks. Returns the tasks changed.
    pub fn apply_patch(&mut self, patch: &GraphPatch) -> Vec<TaskId> {
        let mut patched = Vec::new();
        for node in self.graph.node_weights_mut() {
            if !matches!(node.status, TaskStatus::Pending | TaskStatus::Blocked) {
                continue;
            }
            let selected = match &patch.target {
                PatchTarget::All => true,
                PatchTarget::Phase(p) => node.phase == *p,
                PatchTarget::Keys(keys) => keys.iter().any(|k| *k == node.key),
            };
            if !selected {
                continue;
            }
            for (name, value) in &patch.set {
                node.params.insert(name.clone(), value.clone());
            }
            for name in &patch.unset {
                node.params.remove(name);
            }
            patched.push(node.id);
        }
        patched.sort();
        patched
    }

    /// Insert a sub-DAG and rewire its consumer in one step.
    ///
    /// The splice is staged on a copy and swapped in only if every step
    /// succeeds, so no caller ever sees a half-applied extension.
    pub fn apply_splice(&mut self, splice: &Splice) -> Result<Vec<TaskId>> {
        let mut staged = self.clone();
        let consumer = staged.id_for(&splice.consumer)?;
        match staged.get(consumer).map(|t| &t.status) {
            Some(TaskStatus::Pending) | Some(TaskStatus::Blocked) => {}
            Some(status) => {
                return Err(Error::Validation(format!(
                    "consumer {} already {}",
                    splice.consumer, status
                )))
            }
            None => return Err(Error::TaskNotFound(splice.consumer.clone())),
        }

        let mut added = Vec::with_capacity(splice.tasks.len());
        for spec in &splice.tasks {
            added.push(staged.add_task(spec.clone())?);
        }
        for (task, blocker, kind) in &splice.edges {
            let task = staged.id_for(task)?;
            let blocker = staged.id_for(blocker)?;
            staged.add_edge(task, blocker, *kind)?;
        }
        for terminal in &splice.terminal {
            let terminal = staged.id_for(terminal)?;
            staged.add_edge(consumer, terminal, EdgeKind::Required)?;
        }
        if let Some(prior) = &splice.replace {
            let prior = staged.id_for(prior)?;
            staged.remove_edge(consumer, prior)?;
        }

        *self = staged;
        clog_debug!(
            "TaskGraph::apply_splice added {} tasks before {}",
            added.len(),
            splice.consumer
        );
        Ok(added)
    }

    /// Check the artifact convention: outputs are disjoint and every
    /// required input produced inside the graph comes from an upstream task.
    pub fn validate_contracts(&self) -> Result<()> {
        let mut producers: HashMap<PathBuf, TaskId> = HashMap::new();
        for task in self.graph.node_weights() {
            for output in &task.outputs {
                if let Some(other) = producers.insert(output.path.clone(), task.id) {
                    return Err(Error::Validation(format!(
                        "{} is declared as output by both {} and {}",
                        output.path.display(),
                        self.key_of(other),
                        task.key
                    )));
                }
            }
        }
        for ix in self.graph.node_indices() {
            let task = &self.graph[ix];
            for input in task.inputs.iter().filter(|i| i.is_required()) {
                let Some(&producer) = producers.get(&input.path) else {
                    continue;
                };
                let producer_ix = self.index[&producer];
                if producer_ix == ix || !has_path_connecting(&self.graph, producer_ix, ix, None) {
                    return Err(Error::Validation(format!(
                        "{} reads {} but its producer {} is not upstream",
                        task.key,
                        input.path.display(),
                        self.key_of(producer)
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.index.get(&id).map(|&ix| &self.graph[ix])
    }

    pub fn get_by_key(&self, key: &str) -> Option<&Task> {
        self.keys.get(key).and_then(|id| self.get(*id))
    }

    pub fn id_for(&self, key: &str) -> Result<TaskId> {
        self.keys
            .get(key)
            .copied()
            .ok_or_else(|| Error::TaskNotFound(key.to_string()))
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All tasks ordered by id.
    pub fn tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.graph.node_weights().collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    pub fn list(&self, filter: &TaskFilter) -> Vec<&Task> {
        self.tasks().into_iter().filter(|t| filter.matches(t)).collect()
    }

    /// Blockers of `id` with their edge kinds, resolved or not.
    pub fn blockers(&self, id: TaskId) -> Vec<(TaskId, EdgeKind)> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that wait for `id`.
    pub fn dependents(&self, id: TaskId) -> Vec<(TaskId, EdgeKind)> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Tasks nothing depends on: the pipeline's final consumers.
    pub fn sinks(&self) -> Vec<TaskId> {
        let mut sinks: Vec<TaskId> = self
            .graph
            .node_indices()
            .filter(|&ix| {
                self.graph
                    .edges_directed(ix, Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .map(|ix| self.graph[ix].id)
            .collect();
        sinks.sort();
        sinks
    }

    pub fn phases(&self) -> BTreeSet<Phase> {
        self.graph.node_weights().map(|t| t.phase).collect()
    }

    pub fn tasks_in_phase(&self, phase: Phase) -> Vec<&Task> {
        self.tasks().into_iter().filter(|t| t.phase == phase).collect()
    }

    /// Tasks ordered so each appears after all of its blockers.
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            Error::Validation(format!(
                "cycle detected at task {}",
                self.graph[cycle.node_id()].key
            ))
        })?;
        Ok(sorted.into_iter().map(|ix| self.graph[ix].id).collect())
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let tasks = self.tasks().into_iter().cloned().collect();
        let mut edges: Vec<EdgeRecord> = self
            .graph
            .edge_references()
            .map(|e| EdgeRecord {
                task: self.graph[e.target()].id,
                blocker: self.graph[e.source()].id,
                kind: *e.weight(),
            })
            .collect();
        edges.sort_by_key(|e| (e.task, e.blocker));
        GraphSnapshot { tasks, edges }
    }

    fn neighbors(&self, id: TaskId, direction: Direction) -> Vec<(TaskId, EdgeKind)> {
        let Some(&ix) = self.index.get(&id) else {
            return Vec::new();
        };
        let mut out: Vec<(TaskId, EdgeKind)> = self
            .graph
            .edges_directed(ix, direction)
            .map(|e| {
                let other = match direction {
                    Direction::Incoming => e.source(),
                    Direction::Outgoing => e.target(),
                };
                (self.graph[other].id, *e.weight())
            })
            .collect();
        out.sort();
        out
    }

    fn node(&self, id: TaskId) -> Result<NodeIndex> {
        self.index
            .get(&id)
            .copied()
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    fn key_of(&self, id: TaskId) -> &str {
        self.get(id).map(|t| t.key.as_str()).unwrap_or("?")
    }

    fn upstream_reason(&self, blocker_ix: NodeIndex) -> FailureReason {
        let blocker = &self.graph[blocker_ix];
        FailureReason::UpstreamFailed {
            blocker: blocker.id,
            blocker_key: blocker.key.clone(),
        }
    }

    fn annotate(&mut self, task_ix: NodeIndex, blocker_ix: NodeIndex) {
        let blocker = &self.graph[blocker_ix];
        let annotation = Annotation {
            blocker: blocker.id,
            blocker_key: blocker.key.clone(),
            outcome: blocker.status.clone(),
        };
        let node = &mut self.graph[task_ix];
        node.annotations.retain(|a| a.blocker != annotation.blocker);
        node.annotations.push(annotation);
    }

    fn release_blocker(&mut self, task_ix: NodeIndex, blocker: TaskId, transition: &mut Transition) {
        let node = &mut self.graph[task_ix];
        if node.blocked_by.remove(&blocker)
            && node.blocked_by.is_empty()
            && node.status == TaskStatus::Blocked
        {
            node.set_status(TaskStatus::Pending);
            transition.unblocked.push(node.id);
        }
    }

    fn cascade(&mut self, task_ix: NodeIndex, reason: FailureReason, transition: &mut Transition) {
        let node = &mut self.graph[task_ix];
        if node.is_finished() {
            return;
        }
        if node.status == TaskStatus::InProgress {
            if let Some(owner) = node.owner {
                transition.cancelled.push((node.id, owner));
            }
        }
        node.set_status(TaskStatus::failed(reason));
        transition.cascaded.push(node.id);
    }

    /// Resolve dependents of a task that just reached a terminal status.
    fn propagate(&mut self, finished: TaskId, transition: &mut Transition) {
        let mut queue = VecDeque::from([finished]);
        while let Some(id) = queue.pop_front() {
            let ix = self.index[&id];
            let failed = self.graph[ix].status.is_failed();
            let dependents: Vec<(NodeIndex, EdgeKind)> = self
                .graph
                .edges_directed(ix, Direction::Outgoing)
                .map(|e| (e.target(), *e.weight()))
                .collect();

            for (dep_ix, kind) in dependents {
                if self.graph[dep_ix].is_finished() {
                    continue;
                }
                match (kind, failed) {
                    (EdgeKind::Required, true) => {
                        let reason = self.upstream_reason(ix);
                        self.cascade(dep_ix, reason, transition);
                        queue.push_back(self.graph[dep_ix].id);
                    }
                    (EdgeKind::Required, false) => {
                        self.release_blocker(dep_ix, id, transition);
                    }
                    (EdgeKind::Optional, _) => {
                        self.annotate(dep_ix, ix);
                        transition.annotated.push(self.graph[dep_ix].id);
                        self.release_blocker(dep_ix, id, transition);
                    }
                }
            }
        }
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.len())
            .field("edges", &self.edge_count())
            .finish()
    }
}
