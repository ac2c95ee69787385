//! Durable phase checkpoints.
//!
//! One JSON file per completed phase under `<root>/<pipeline>/phase-NN.json`.
//! A checkpoint lists every task of the phase by key with the output it
//! produced, which is enough to mark those tasks done on a later run without
//! executing them again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::artifact::write_atomic;
use crate::core::dag::TaskGraph;
use crate::core::task::{Phase, TaskId, TaskOutput, TaskStatus};
use crate::util::blocking;
use crate::workflow::Profile;
use crate::{clog, clog_debug, clog_warn, Error, Result};

const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub subject: String,
    pub output: TaskOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub pipeline: String,
    pub phase: Phase,
    pub profile: Profile,
    pub created_at: DateTime<Utc>,
    pub tasks: BTreeMap<String, CheckpointEntry>,
}

impl Checkpoint {
    /// Snapshot a phase, or `None` while any of its tasks is not `Completed`.
    pub fn from_graph(pipeline: &str, profile: Profile, phase: Phase, graph: &TaskGraph) -> Option<Self> {
        let tasks = graph.tasks_in_phase(phase);
        if tasks.is_empty() || tasks.iter().any(|t| t.status != TaskStatus::Completed) {
            return None;
        }
        let tasks = tasks
            .into_iter()
            .map(|t| {
                (
                    t.key.clone(),
                    CheckpointEntry {
                        subject: t.subject.clone(),
                        output: t.output.clone().unwrap_or_default(),
                    },
                )
            })
            .collect();
        Some(Self {
            version: CHECKPOINT_VERSION,
            pipeline: pipeline.to_string(),
            phase,
            profile,
            created_at: Utc::now(),
            tasks,
        })
    }
}

/// Mark every task before `resume_from` as completed from its checkpoint.
///
/// Tasks are restored in topological order so each one's blockers are
/// already complete. Fails with `CheckpointMissing` if a phase has no
/// checkpoint or its checkpoint lacks one of the phase's tasks.
pub fn restore_into(
    graph: &mut TaskGraph,
    checkpoints: &[Checkpoint],
    resume_from: Phase,
) -> Result<Vec<TaskId>> {
    let by_phase: BTreeMap<Phase, &Checkpoint> = checkpoints.iter().map(|c| (c.phase, c)).collect();
    let mut restored = Vec::new();
    for id in graph.topological_order()? {
        let Some(task) = graph.get(id) else { continue };
        if task.phase >= resume_from {
            continue;
        }
        let phase = task.phase;
        let entry = by_phase
            .get(&phase)
            .and_then(|c| c.tasks.get(&task.key))
            .ok_or(Error::CheckpointMissing { phase })?;
        let output = entry.output.clone();
        graph.restore(id, output)?;
        restored.push(id);
    }
    clog_debug!("Restored {} tasks before phase {}", restored.len(), resume_from);
    Ok(restored)
}

/// Filesystem store for checkpoints.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pipeline_dir(&self, pipeline: &str) -> PathBuf {
        self.root.join(sanitize_name(pipeline))
    }

    pub fn path_for(&self, pipeline: &str, phase: Phase) -> PathBuf {
        self.pipeline_dir(pipeline).join(format!("phase-{:02}.json", phase))
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        let store = self.clone();
        let checkpoint = checkpoint.clone();
        blocking(move || store.save_sync(&checkpoint)).await
    }

    /// Write a checkpoint, keeping the previous file as `.bak`.
    pub fn save_sync(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        let path = self.path_for(&checkpoint.pipeline, checkpoint.phase);
        if path.exists() {
            let backup_path = path.with_extension("json.bak");
            clog_debug!("Creating checkpoint backup: {}", backup_path.display());
            fs::copy(&path, &backup_path)?;
        }
        let contents = serde_json::to_string_pretty(checkpoint)?;
        write_atomic(&path, contents.as_bytes())?;
        clog!(
            "Checkpoint written: {} phase {} ({} tasks)",
            checkpoint.pipeline,
            checkpoint.phase,
            checkpoint.tasks.len()
        );
        Ok(path)
    }

    pub fn load(&self, pipeline: &str, phase: Phase) -> Result<Option<Checkpoint>> {
        let path = self.path_for(pipeline, phase);
        clog_debug!("CheckpointStore::load path={}", path.display());
        if !path.exists() {
            return Ok(None);
        }
        let checkpoint: Checkpoint = serde_json::from_str(&fs::read_to_string(&path)?)?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(Error::Validation(format!(
                "checkpoint {} has version {}, expected {}",
                path.display(),
                checkpoint.version,
                CHECKPOINT_VERSION
            )));
        }
        if checkpoint.phase != phase {
            return Err(Error::Validation(format!(
                "checkpoint {} records phase {}",
                path.display(),
                checkpoint.phase
            )));
        }
        Ok(Some(checkpoint))
    }

    /// Load the checkpoints for `phases`, failing on the first one missing.
    pub fn load_required(&self, pipeline: &str, phases: &[Phase]) -> Result<Vec<Checkpoint>> {
        let mut loaded = Vec::with_capacity(phases.len());
        for &phase in phases {
            match self.load(pipeline, phase)? {
                Some(checkpoint) => loaded.push(checkpoint),
                None => {
                    clog_warn!("No checkpoint for {} phase {}", pipeline, phase);
                    return Err(Error::CheckpointMissing { phase });
                }
            }
        }
        Ok(loaded)
    }

    /// Phases with a stored checkpoint, ascending.
    pub fn list(&self, pipeline: &str) -> Result<Vec<Phase>> {
        let dir = self.pipeline_dir(pipeline);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut phases: Vec<Phase> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| parse_phase(&entry.file_name().to_string_lossy()))
            .collect();
        phases.sort_unstable();
        Ok(phases)
    }

    /// Remove every checkpoint of a pipeline. Returns how many were removed.
    pub fn clear(&self, pipeline: &str) -> Result<usize> {
        let dir = self.pipeline_dir(pipeline);
        if !dir.exists() {
            return Ok(0);
        }
        let count = self.list(pipeline)?.len();
        fs::remove_dir_all(&dir)?;
        clog!("Cleared {} checkpoints for {}", count, pipeline);
        Ok(count)
    }
}

fn parse_phase(file_name: &str) -> Option<Phase> {
    file_name
        .strip_prefix("phase-")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

/// Pipeline names become directory names.
fn sanitize_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
