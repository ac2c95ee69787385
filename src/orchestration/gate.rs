//! Whole-session approval gates.
//!
//! A gate sits in front of a phase and stops all dispatching until an
//! [`Approver`] returns a [`Decision`]. Unlike task blocking, nothing in the
//! session advances while a gate is open.
//!
//! Every session opens with exactly one parameter-confirmation gate. The
//! remaining gates carry a mode per profile:
//! - `mandatory`: wait for a decision; timing out aborts the session
//! - `optional`: wait for a decision; timing out proceeds
//! - `skip`: proceed without asking

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::core::dag::GraphPatch;
use crate::core::task::Phase;
use crate::workflow::Profile;
use crate::{clog, clog_debug, clog_warn, Error, Result};

/// Id of the gate synthesised when a pipeline declares none.
pub const PARAMETER_GATE_ID: &str = "confirm-parameters";

/// How a gate behaves under a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GateMode {
    #[default]
    Mandatory,
    Optional,
    Skip,
}

impl std::fmt::Display for GateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateMode::Mandatory => write!(f, "mandatory"),
            GateMode::Optional => write!(f, "optional"),
            GateMode::Skip => write!(f, "skip"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    /// Confirms run parameters before any work starts.
    Parameters,
    /// Reviews intermediate results at a phase boundary.
    #[default]
    Review,
    /// Decides an extension whose metric fell in the intermediate band.
    Extension,
}

/// A declared gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSpec {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Dispatching of this phase waits for the gate.
    pub before_phase: Phase,
    #[serde(default)]
    pub kind: GateKind,
    /// Mode for profiles without an entry in `modes`.
    #[serde(default)]
    pub default_mode: GateMode,
    /// Keyed by profile name.
    #[serde(default)]
    pub modes: BTreeMap<String, GateMode>,
}

impl GateSpec {
    pub fn new(id: &str, title: &str, before_phase: Phase) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: String::new(),
            before_phase,
            kind: GateKind::Review,
            default_mode: GateMode::Mandatory,
            modes: BTreeMap::new(),
        }
    }

    pub fn parameters(before_phase: Phase) -> Self {
        Self {
            kind: GateKind::Parameters,
            ..Self::new(PARAMETER_GATE_ID, "Confirm run parameters", before_phase)
        }
    }

    pub fn with_mode(mut self, profile: Profile, mode: GateMode) -> Self {
        self.modes.insert(profile.to_string(), mode);
        self
    }

    /// Effective mode. The parameter gate is mandatory under every profile.
    pub fn mode_for(&self, profile: Profile) -> GateMode {
        if self.kind == GateKind::Parameters {
            return GateMode::Mandatory;
        }
        self.modes
            .get(profile.as_str())
            .copied()
            .unwrap_or(self.default_mode)
    }

    /// Reject mode entries for profiles that do not exist.
    pub fn validate(&self) -> Result<()> {
        for name in self.modes.keys() {
            name.parse::<Profile>().map_err(|_| {
                Error::Validation(format!("gate {}: unknown profile '{}'", self.id, name))
            })?;
        }
        Ok(())
    }
}

/// Make sure exactly one parameter gate exists and that it comes first.
pub fn ensure_parameter_gate(gates: &mut Vec<GateSpec>, first_phase: Phase) -> Result<()> {
    let count = gates.iter().filter(|g| g.kind == GateKind::Parameters).count();
    match count {
        0 => {
            clog_debug!("Synthesising parameter gate before phase {}", first_phase);
            gates.insert(0, GateSpec::parameters(first_phase));
        }
        1 => {}
        n => {
            return Err(Error::Validation(format!(
                "exactly one parameter gate is allowed, found {}",
                n
            )))
        }
    }
    if let Some(gate) = gates.iter_mut().find(|g| g.kind == GateKind::Parameters) {
        gate.before_phase = gate.before_phase.min(first_phase);
    }
    gates.sort_by_key(|g| (g.before_phase, g.kind != GateKind::Parameters));
    Ok(())
}

/// What the approver sees.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Presentation {
    pub summary: String,
    pub details: Vec<String>,
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl Presentation {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Default::default()
        }
    }

    pub fn detail(mut self, line: impl Into<String>) -> Self {
        self.details.push(line.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Proceed,
    Modify(GraphPatch),
    Abort,
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Proceed => "proceed",
            Decision::Modify(_) => "modify",
            Decision::Abort => "abort",
        }
    }
}

/// Source of gate decisions: a person at a terminal, a policy, a test script.
pub trait Approver: Send + Sync {
    fn decide<'a>(&'a self, gate: &'a GateSpec, presentation: &'a Presentation) -> BoxFuture<'a, Decision>;
}

/// Answers every gate with the same decision.
#[derive(Debug, Clone)]
pub struct AutoApprover {
    decision: Decision,
}

impl AutoApprover {
    pub fn new(decision: Decision) -> Self {
        Self { decision }
    }
}

impl Default for AutoApprover {
    fn default() -> Self {
        Self::new(Decision::Proceed)
    }
}

impl Approver for AutoApprover {
    fn decide<'a>(&'a self, gate: &'a GateSpec, _presentation: &'a Presentation) -> BoxFuture<'a, Decision> {
        Box::pin(async move {
            clog_debug!("AutoApprover: {} -> {}", gate.id, self.decision.label());
            self.decision.clone()
        })
    }
}

/// Prompts on stdin.
///
/// Accepted answers: `y`/`proceed`, `n`/`abort`, `skip` (decline a pending
/// extension), or one or more `key=value` pairs which become a patch on
/// every task that has not started yet.
#[derive(Debug, Default)]
pub struct TerminalApprover;

impl Approver for TerminalApprover {
    fn decide<'a>(&'a self, gate: &'a GateSpec, presentation: &'a Presentation) -> BoxFuture<'a, Decision> {
        Box::pin(async move {
            let mut prompt = format!("\n== {} ==\n{}\n", gate.title, presentation.summary);
            for line in &presentation.details {
                prompt.push_str(&format!("  {}\n", line));
            }
            for (name, value) in &presentation.params {
                prompt.push_str(&format!("  {} = {}\n", name, value));
            }
            prompt.push_str("[y]es / [n]o / skip / key=value ... > ");

            let mut stdout = tokio::io::stdout();
            if stdout.write_all(prompt.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                return Decision::Abort;
            }
            let mut line = String::new();
            match BufReader::new(tokio::io::stdin()).read_line(&mut line).await {
                Ok(0) | Err(_) => Decision::Abort,
                Ok(_) => parse_answer(&line),
            }
        })
    }
}

/// Parse a free-form terminal answer into a decision.
pub fn parse_answer(line: &str) -> Decision {
    let answer = line.trim();
    match answer.to_ascii_lowercase().as_str() {
        "" | "y" | "yes" | "proceed" => return Decision::Proceed,
        "n" | "no" | "abort" => return Decision::Abort,
        "skip" => {
            return Decision::Modify(GraphPatch {
                skip_extension: true,
                ..Default::default()
            })
        }
        _ => {}
    }

    let mut patch = GraphPatch::default();
    for pair in answer.split_whitespace() {
        let Some((name, raw)) = pair.split_once('=') else {
            clog_warn!("Ignoring gate answer fragment without '=': {}", pair);
            continue;
        };
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        patch.set.insert(name.to_string(), value);
    }
    if patch.set.is_empty() {
        Decision::Abort
    } else {
        Decision::Modify(patch)
    }
}

/// One resolved gate, kept for the run report.
#[derive(Debug, Clone, Serialize)]
pub struct GateRecord {
    pub gate: String,
    pub mode: GateMode,
    pub decision: String,
    pub timed_out: bool,
    pub decided_at: DateTime<Utc>,
}

/// Evaluates gates for one session.
pub struct GateController {
    approver: Arc<dyn Approver>,
    profile: Profile,
    timeout: Duration,
    cancel: CancellationToken,
    history: Vec<GateRecord>,
}

impl GateController {
    pub fn new(
        approver: Arc<dyn Approver>,
        profile: Profile,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            approver,
            profile,
            timeout,
            cancel,
            history: Vec::new(),
        }
    }

    /// Block until the gate is decided.
    ///
    /// Resolves to `Abort` if the session is cancelled. A timeout resolves to
    /// `Abort` for mandatory gates and `Proceed` for optional ones.
    pub async fn await_gate(&mut self, gate: &GateSpec, presentation: &Presentation) -> Decision {
        let mode = gate.mode_for(self.profile);
        if mode == GateMode::Skip {
            clog_debug!("Gate {} skipped under profile {}", gate.id, self.profile);
            self.record(gate, mode, &Decision::Proceed, false);
            return Decision::Proceed;
        }

        clog!("Gate {} ({}) waiting for a decision", gate.id, mode);
        let approver = Arc::clone(&self.approver);
        let (decision, timed_out) = tokio::select! {
            _ = self.cancel.cancelled() => {
                clog_warn!("Gate {} cancelled", gate.id);
                (Decision::Abort, false)
            }
            result = tokio::time::timeout(self.timeout, approver.decide(gate, presentation)) => {
                match result {
                    Ok(decision) => (decision, false),
                    Err(_) => {
                        let fallback = match mode {
                            GateMode::Optional => Decision::Proceed,
                            _ => Decision::Abort,
                        };
                        clog_warn!(
                            "Gate {} timed out after {:?}, resolving to {}",
                            gate.id,
                            self.timeout,
                            fallback.label()
                        );
                        (fallback, true)
                    }
                }
            }
        };

        clog!("Gate {} resolved: {}", gate.id, decision.label());
        self.record(gate, mode, &decision, timed_out);
        decision
    }

    pub fn history(&self) -> &[GateRecord] {
        &self.history
    }

    fn record(&mut self, gate: &GateSpec, mode: GateMode, decision: &Decision, timed_out: bool) {
        self.history.push(GateRecord {
            gate: gate.id.clone(),
            mode,
            decision: decision.label().to_string(),
            timed_out,
            decided_at: Utc::now(),
        });
    }
}
