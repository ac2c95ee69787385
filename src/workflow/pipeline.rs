//! Pipeline definitions and graph construction.
//!
//! A pipeline file declares phases, tasks with their blocking edges and
//! artifacts, gates and an optional extension rule. [`PipelineSpec::build`]
//! turns it into a [`BuiltPipeline`] for one profile: `deep_only` phases are
//! elided for shallow runs, and consumers of elided tasks are rewired to the
//! elided tasks' own blockers.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::core::artifact::{ArtifactDescriptor, Requirement};
use crate::core::dag::{EdgeKind, TaskGraph};
use crate::core::task::{Phase, TaskSpec};
use crate::orchestration::ExtensionPolicy;
use crate::orchestration::{ensure_parameter_gate, GateSpec};
use crate::workflow::Profile;
use crate::{clog_debug, clog_warn, Error, Result};

static KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_.-]*$").unwrap());

/// A blocker reference: a bare key (required) or `{ task, kind }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BlockerDecl {
    Key(String),
    Edge {
        task: String,
        #[serde(default)]
        kind: EdgeKind,
    },
}

impl BlockerDecl {
    pub fn task(&self) -> &str {
        match self {
            BlockerDecl::Key(key) => key,
            BlockerDecl::Edge { task, .. } => task,
        }
    }

    pub fn kind(&self) -> EdgeKind {
        match self {
            BlockerDecl::Key(_) => EdgeKind::Required,
            BlockerDecl::Edge { kind, .. } => *kind,
        }
    }
}

/// A task as written in a pipeline file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDef {
    pub key: String,
    pub subject: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub active_form: Option<String>,
    #[serde(default)]
    pub phase: Option<Phase>,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub inputs: Vec<ArtifactDescriptor>,
    #[serde(default)]
    pub outputs: Vec<ArtifactDescriptor>,
    #[serde(default)]
    pub blocked_by: Vec<BlockerDecl>,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl TaskDef {
    pub fn to_spec(&self, default_phase: Option<Phase>) -> TaskSpec {
        TaskSpec {
            key: self.key.clone(),
            subject: self.subject.clone(),
            description: self.description.clone(),
            active_form: self.active_form.clone(),
            phase: self.phase.or(default_phase).unwrap_or_default(),
            class: self.class.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            params: self.params.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub number: Phase,
    pub name: String,
    /// Left out of shallow and auto runs.
    #[serde(default)]
    pub deep_only: bool,
}

/// A pipeline file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Directory artifact paths resolve against. Defaults to the file's directory.
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    pub phases: Vec<PhaseSpec>,
    pub tasks: Vec<TaskDef>,
    #[serde(default)]
    pub gates: Vec<GateSpec>,
    #[serde(default)]
    pub extension: Option<ExtensionPolicy>,
}

/// A pipeline resolved for one profile.
#[derive(Debug)]
pub struct BuiltPipeline {
    pub name: String,
    pub profile: Profile,
    pub workspace: Option<PathBuf>,
    pub phases: Vec<PhaseSpec>,
    pub graph: TaskGraph,
    /// Ordered by phase; the parameter gate comes first.
    pub gates: Vec<GateSpec>,
    pub extension: Option<ExtensionPolicy>,
    /// Keys of tasks left out by the profile.
    pub elided: Vec<String>,
}

impl BuiltPipeline {
    pub fn first_phase(&self) -> Option<Phase> {
        self.phases.iter().map(|p| p.number).min()
    }

    pub fn phase_name(&self, phase: Phase) -> Option<&str> {
        phase_name(&self.phases, phase)
    }
}

fn phase_name(phases: &[PhaseSpec], phase: Phase) -> Option<&str> {
    phases.iter().find(|p| p.number == phase).map(|p| p.name.as_str())
}

impl PipelineSpec {
    /// Declared name of `phase`, if any.
    pub fn phase_name(&self, phase: Phase) -> Option<&str> {
        phase_name(&self.phases, phase)
    }

    pub fn load(path: &Path) -> Result<Self> {
        clog_debug!("PipelineSpec::load path={}", path.display());
        let mut spec: Self = toml::from_str(&fs::read_to_string(path)?)?;
        if spec.workspace.is_none() {
            spec.workspace = path.parent().map(Path::to_path_buf);
        } else if let Some(ws) = &spec.workspace {
            if ws.is_relative() {
                spec.workspace = path.parent().map(|dir| dir.join(ws));
            }
        }
        Ok(spec)
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("pipeline name cannot be empty".to_string()));
        }
        if self.phases.is_empty() {
            return Err(Error::Validation(format!("pipeline {} declares no phases", self.name)));
        }

        let mut phases = HashSet::new();
        for phase in &self.phases {
            if !phases.insert(phase.number) {
                return Err(Error::Validation(format!("duplicate phase {}", phase.number)));
            }
        }

        let mut keys = HashSet::new();
        for task in &self.tasks {
            if !KEY_RE.is_match(&task.key) {
                return Err(Error::Validation(format!(
                    "invalid task key '{}' (lowercase letters, digits, '_', '.', '-')",
                    task.key
                )));
            }
            if !keys.insert(task.key.as_str()) {
                return Err(Error::Validation(format!("duplicate task key: {}", task.key)));
            }
            match task.phase {
                Some(p) if phases.contains(&p) => {}
                Some(p) => {
                    return Err(Error::Validation(format!(
                        "task {} is in undeclared phase {}",
                        task.key, p
                    )))
                }
                None => {
                    return Err(Error::Validation(format!("task {} has no phase", task.key)))
                }
            }
        }
        let phase_of: HashMap<&str, Option<Phase>> =
            self.tasks.iter().map(|t| (t.key.as_str(), t.phase)).collect();
        for task in &self.tasks {
            for blocker in &task.blocked_by {
                let Some(blocker_phase) = phase_of.get(blocker.task()) else {
                    return Err(Error::TaskNotFound(format!(
                        "{} (blocker of {})",
                        blocker.task(),
                        task.key
                    )));
                };
                // Gates sit between phases, so work never waits on a later phase.
                if *blocker_phase > task.phase {
                    return Err(Error::Validation(format!(
                        "task {} cannot wait for {} from a later phase",
                        task.key,
                        blocker.task()
                    )));
                }
            }
        }
        self.check_acyclic()?;

        let mut gate_ids = HashSet::new();
        for gate in &self.gates {
            if !gate_ids.insert(gate.id.as_str()) {
                return Err(Error::Validation(format!("duplicate gate id: {}", gate.id)));
            }
            if !phases.contains(&gate.before_phase) {
                return Err(Error::Validation(format!(
                    "gate {} precedes undeclared phase {}",
                    gate.id, gate.before_phase
                )));
            }
            gate.validate()?;
        }

        if let Some(ext) = &self.extension {
            ext.validate()?;
            for key in [&ext.source, &ext.consumer] {
                if !keys.contains(key.as_str()) {
                    return Err(Error::TaskNotFound(format!("{} (extension)", key)));
                }
            }
            for template in &ext.tasks {
                if !KEY_RE.is_match(&template.key) || keys.contains(template.key.as_str()) {
                    return Err(Error::Validation(format!(
                        "extension task key '{}' is invalid or already used",
                        template.key
                    )));
                }
            }
        }
        Ok(())
    }

    /// Reject dependency cycles across every declared task, elided or not.
    ///
    /// Ids in the error follow declaration order, which is also the order a
    /// full build assigns them in.
    fn check_acyclic(&self) -> Result<()> {
        let mut declared = TaskGraph::new();
        let mut ids = HashMap::new();
        for def in &self.tasks {
            ids.insert(def.key.as_str(), declared.add_task(def.to_spec(None))?);
        }
        for def in &self.tasks {
            for blocker in &def.blocked_by {
                declared.add_edge(ids[def.key.as_str()], ids[blocker.task()], blocker.kind())?;
            }
        }
        Ok(())
    }

    /// Build the task graph and gate list for `profile`.
    pub fn build(&self, profile: Profile) -> Result<BuiltPipeline> {
        self.validate()?;

        let kept_phases: Vec<PhaseSpec> = self
            .phases
            .iter()
            .filter(|p| profile.includes_deep_phases() || !p.deep_only)
            .cloned()
            .collect();
        let kept: BTreeSet<Phase> = kept_phases.iter().map(|p| p.number).collect();
        let first_phase = kept.iter().next().copied().ok_or_else(|| {
            Error::Validation(format!("profile {} leaves no phases to run", profile))
        })?;

        let defs: HashMap<&str, &TaskDef> = self.tasks.iter().map(|t| (t.key.as_str(), t)).collect();
        let is_kept = |key: &str| defs.get(key).and_then(|t| t.phase).is_some_and(|p| kept.contains(&p));
        let elided: Vec<String> = self
            .tasks
            .iter()
            .filter(|t| !is_kept(&t.key))
            .map(|t| t.key.clone())
            .collect();

        // Outputs of elided producers become optional for their readers.
        let elided_outputs: HashSet<&PathBuf> = self
            .tasks
            .iter()
            .filter(|t| !is_kept(&t.key))
            .flat_map(|t| t.outputs.iter().map(|o| &o.path))
            .collect();

        let mut resolver = EdgeResolver {
            defs: &defs,
            is_kept: &is_kept,
            memo: HashMap::new(),
        };

        let mut graph = TaskGraph::new();
        let mut ids = HashMap::new();
        for def in self.tasks.iter().filter(|t| is_kept(&t.key)) {
            let mut spec = def.to_spec(None);
            for input in &mut spec.inputs {
                if elided_outputs.contains(&input.path) {
                    input.requirement = Requirement::Optional;
                }
            }
            ids.insert(def.key.as_str(), graph.add_task(spec)?);
        }
        for def in self.tasks.iter().filter(|t| is_kept(&t.key)) {
            let task = ids[def.key.as_str()];
            for (blocker, kind) in resolver.effective_blockers(&def.key)? {
                graph.add_edge(task, ids[blocker.as_str()], kind)?;
            }
        }
        graph.validate_contracts()?;

        let mut gates: Vec<GateSpec> = Vec::new();
        for gate in &self.gates {
            if kept.contains(&gate.before_phase) {
                gates.push(gate.clone());
            } else {
                clog_debug!("Gate {} dropped with its phase under {}", gate.id, profile);
            }
        }
        ensure_parameter_gate(&mut gates, first_phase)?;

        let extension = match &self.extension {
            Some(ext) if profile.extends_dynamically() => {
                if is_kept(&ext.source) && is_kept(&ext.consumer) {
                    Some(ext.clone())
                } else {
                    clog_warn!(
                        "Extension disabled: {} or {} is not part of the {} graph",
                        ext.source,
                        ext.consumer,
                        profile
                    );
                    None
                }
            }
            _ => None,
        };

        clog_debug!(
            "Pipeline {} built for {}: {} tasks, {} elided, {} gates",
            self.name,
            profile,
            graph.len(),
            elided.len(),
            gates.len()
        );

        Ok(BuiltPipeline {
            name: self.name.clone(),
            profile,
            workspace: self.workspace.clone(),
            phases: kept_phases,
            graph,
            gates,
            extension,
            elided,
        })
    }
}

/// Resolves each kept task's blockers through elided tasks.
struct EdgeResolver<'a, F: Fn(&str) -> bool> {
    defs: &'a HashMap<&'a str, &'a TaskDef>,
    is_kept: &'a F,
    memo: HashMap<String, Vec<(String, EdgeKind)>>,
}

impl<F: Fn(&str) -> bool> EdgeResolver<'_, F> {
    /// Kept blockers of `key`, looking through elided ones.
    ///
    /// A path through an elided task carries the weaker of its edge kinds. When
    /// several paths reach the same blocker, the strongest wins. The declared
    /// graph is acyclic by the time this runs.
    fn effective_blockers(&mut self, key: &str) -> Result<Vec<(String, EdgeKind)>> {
        if let Some(done) = self.memo.get(key) {
            return Ok(done.clone());
        }

        let def = self.defs[key];
        let mut merged: Vec<(String, EdgeKind)> = Vec::new();
        for blocker in &def.blocked_by {
            let candidates = if (self.is_kept)(blocker.task()) {
                vec![(blocker.task().to_string(), blocker.kind())]
            } else {
                self.effective_blockers(blocker.task())?
                    .into_iter()
                    .map(|(b, k)| (b, k.weaker(blocker.kind())))
                    .collect()
            };
            for (b, k) in candidates {
                match merged.iter_mut().find(|(existing, _)| *existing == b) {
                    Some(entry) if k == EdgeKind::Required => entry.1 = EdgeKind::Required,
                    Some(_) => {}
                    None => merged.push((b, k)),
                }
            }
        }

        self.memo.insert(key.to_string(), merged.clone());
        Ok(merged)
    }
}
