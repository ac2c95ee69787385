//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Temporary workspaces with a checkpoint directory and fast shutdown timing
//! - A scripted worker whose behaviour is chosen per task key
//! - A scripted approver that replays queued gate decisions
//! - Predefined pipelines

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tempfile::TempDir;

use cadre::config::Config;
use cadre::core::task::TaskOutput;
use cadre::orchestration::{Approver, Coordinator, Decision, GateSpec, Presentation, TaskContext, Worker};
use cadre::workflow::{BuiltPipeline, PipelineSpec, Profile};

/// Research pipeline: two collectors, an analysis and a report.
///
/// `tracker` is an optional source for `analyze`; `report` needs both
/// `analyze` and `web`. A review gate sits before the report phase and is
/// skipped under the shallow profile. Under `auto`, a high `gap_score` from
/// `analyze` splices in another collect/analyze round before the report.
pub const RESEARCH: &str = r#"
name = "research"

[[phases]]
number = 1
name = "collect"

[[phases]]
number = 2
name = "analyze"

[[phases]]
number = 3
name = "report"

[[tasks]]
key = "web"
subject = "Collect web sources"
phase = 1
outputs = [{ path = "raw/web.json", schema = "json" }]

[[tasks]]
key = "tracker"
subject = "Collect tracker issues"
phase = 1
outputs = [{ path = "raw/tracker.json", schema = "json" }]

[[tasks]]
key = "analyze"
subject = "Analyze sources"
phase = 2
blocked_by = ["web", { task = "tracker", kind = "optional" }]
inputs = [
    { path = "raw/web.json" },
    { path = "raw/tracker.json", requirement = "optional" },
]
outputs = [{ path = "analysis.json", schema = "json" }]

[[tasks]]
key = "report"
subject = "Write report"
phase = 3
blocked_by = ["analyze", "web"]
inputs = [{ path = "analysis.json" }]
outputs = [{ path = "report.md" }]

[[gates]]
id = "review-analysis"
title = "Review the analysis"
before_phase = 3
[gates.modes]
shallow = "skip"

[extension]
source = "analyze"
metric = "gap_score"
high_threshold = 0.7
low_threshold = 0.4
consumer = "report"
gate_title = "Collect more before reporting?"

[[extension.tasks]]
key = "collect-more"
subject = "Collect additional sources"

[[extension.tasks]]
key = "reanalyze"
subject = "Re-run the analysis"
blocked_by = ["collect-more"]
"#;

/// A temporary workspace with its own checkpoint directory.
pub struct TestWorkspace {
    pub temp_dir: TempDir,
    pub config: Config,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = Config {
            checkpoint_dir: Some(temp_dir.path().join("checkpoints").display().to_string()),
            shutdown_backoff_ms: 10,
            gate_timeout_secs: 5,
            ..Config::default()
        };
        std::fs::create_dir_all(temp_dir.path().join("work")).expect("Failed to create workspace");
        Self { temp_dir, config }
    }

    pub fn work_dir(&self) -> PathBuf {
        self.temp_dir.path().join("work")
    }

    pub fn build(&self, pipeline: &str, profile: Profile) -> BuiltPipeline {
        let mut built = PipelineSpec::parse(pipeline)
            .expect("pipeline parses")
            .build(profile)
            .expect("pipeline builds");
        built.workspace = Some(self.work_dir());
        built
    }

    pub fn coordinator(
        &self,
        pipeline: &str,
        profile: Profile,
        worker: Arc<dyn Worker>,
        approver: Arc<dyn Approver>,
    ) -> Coordinator {
        Coordinator::new(self.config.clone(), self.build(pipeline, profile), worker, approver)
            .expect("coordinator")
    }
}

/// What the scripted worker does for one task key.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Write every declared output and report these metrics.
    Succeed(Vec<(&'static str, f64)>),
    Fail(&'static str),
    /// Sleep before succeeding.
    Slow(Duration),
    /// Never finish unless cancelled.
    Hang,
}

/// Worker whose behaviour is looked up by task key; unknown keys succeed.
#[derive(Default)]
pub struct ScriptedWorker {
    behaviors: HashMap<String, Behavior>,
    pub started: Mutex<Vec<String>>,
    /// Params each task was started with, by key.
    pub params: Mutex<HashMap<String, serde_json::Map<String, serde_json::Value>>>,
    pub missing: Mutex<HashMap<String, Vec<String>>>,
    running: AtomicUsize,
    pub max_running: AtomicUsize,
}

impl ScriptedWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, key: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(key.to_string(), behavior);
        self
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn ran(&self, key: &str) -> bool {
        self.started().iter().any(|k| k == key)
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutput, String> {
        let key = ctx.task.key.clone();
        self.started.lock().unwrap().push(key.clone());
        self.params
            .lock()
            .unwrap()
            .insert(key.clone(), ctx.task.params.clone());
        self.missing
            .lock()
            .unwrap()
            .insert(key.clone(), ctx.missing_sources());

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let result = self.behave(ctx, &key).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn behave(&self, ctx: &TaskContext, key: &str) -> Result<TaskOutput, String> {
        let behavior = self
            .behaviors
            .get(key)
            .cloned()
            .unwrap_or(Behavior::Succeed(Vec::new()));
        let metrics = match behavior {
            Behavior::Fail(message) => return Err(message.to_string()),
            Behavior::Hang => {
                futures::future::pending::<()>().await;
                Vec::new()
            }
            Behavior::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Vec::new()
            }
            Behavior::Succeed(metrics) => metrics,
        };

        let mut output = TaskOutput::default().with_note(key);
        for artifact in &ctx.task.outputs {
            let path = artifact.resolve(&ctx.workspace);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| e.to_string())?;
            }
            tokio::fs::write(&path, "{}\n").await.map_err(|e| e.to_string())?;
            output.produced.push(path);
        }
        for (name, value) in metrics {
            output = output.with_metric(name, value);
        }
        Ok(output)
    }
}

impl Worker for ScriptedWorker {
    fn execute<'a>(&'a self, ctx: &'a TaskContext) -> BoxFuture<'a, Result<TaskOutput, String>> {
        self.run(ctx).boxed()
    }
}

/// Replays queued decisions, then proceeds.
#[derive(Default)]
pub struct ScriptedApprover {
    decisions: Mutex<VecDeque<Decision>>,
    pub seen: Mutex<Vec<String>>,
}

impl ScriptedApprover {
    pub fn new(decisions: Vec<Decision>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl Approver for ScriptedApprover {
    fn decide<'a>(&'a self, gate: &'a GateSpec, _presentation: &'a Presentation) -> BoxFuture<'a, Decision> {
        self.seen.lock().unwrap().push(gate.id.clone());
        let decision = self
            .decisions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Decision::Proceed);
        async move { decision }.boxed()
    }
}
