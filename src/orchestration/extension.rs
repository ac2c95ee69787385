//! Runtime graph extension driven by a metric.
//!
//! When the source task completes, the metric it reported is classified:
//! above `high_threshold` the follow-up sub-DAG is spliced in automatically,
//! between the thresholds an approval gate decides, below `low_threshold`
//! nothing happens.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::core::dag::{EdgeKind, Splice};
use crate::core::task::Phase;
use crate::workflow::TaskDef;
use crate::{Error, Result};

/// How the consumer is rewired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpliceMode {
    /// The consumer waits for the new work instead of the source.
    #[default]
    Replace,
    /// The consumer waits for both.
    Additional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricBand {
    Low,
    Intermediate,
    High,
}

/// Extension rule declared by a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionPolicy {
    /// Task whose output carries the metric.
    pub source: String,
    /// Metric name in the source's `TaskOutput::metrics`.
    pub metric: String,
    pub high_threshold: f64,
    pub low_threshold: f64,
    /// Task that must wait for the new work.
    pub consumer: String,
    #[serde(default)]
    pub mode: SpliceMode,
    /// Title of the gate raised for intermediate values.
    #[serde(default)]
    pub gate_title: Option<String>,
    /// Templates; those without `blocked_by` wait on the source.
    pub tasks: Vec<TaskDef>,
}

/// A concrete extension ready to splice.
#[derive(Debug, Clone)]
pub struct ExtensionPlan {
    pub metric: f64,
    pub band: MetricBand,
    pub splice: Splice,
}

impl ExtensionPlan {
    /// Intermediate values need a gate decision before splicing.
    pub fn needs_approval(&self) -> bool {
        self.band == MetricBand::Intermediate
    }
}

impl ExtensionPolicy {
    pub fn classify(&self, metric: f64) -> MetricBand {
        if metric > self.high_threshold {
            MetricBand::High
        } else if metric >= self.low_threshold {
            MetricBand::Intermediate
        } else {
            MetricBand::Low
        }
    }

    /// Build the plan for `metric`, or `None` when it is below the band.
    ///
    /// Templates without an explicit phase land in `phase`, the source's phase.
    pub fn evaluate_extension(&self, metric: f64, phase: Phase) -> Option<ExtensionPlan> {
        let band = self.classify(metric);
        if band == MetricBand::Low || metric.is_nan() {
            return None;
        }

        let keys: HashSet<&str> = self.tasks.iter().map(|t| t.key.as_str()).collect();
        let mut depended_on: HashSet<&str> = HashSet::new();
        let mut edges = Vec::new();
        let mut specs = Vec::with_capacity(self.tasks.len());

        for template in &self.tasks {
            specs.push(template.to_spec(Some(phase)));
            if template.blocked_by.is_empty() {
                edges.push((template.key.clone(), self.source.clone(), EdgeKind::Required));
            }
            for blocker in &template.blocked_by {
                if keys.contains(blocker.task()) {
                    depended_on.insert(blocker.task());
                }
                edges.push((template.key.clone(), blocker.task().to_string(), blocker.kind()));
            }
        }

        let terminal = self
            .tasks
            .iter()
            .filter(|t| !depended_on.contains(t.key.as_str()))
            .map(|t| t.key.clone())
            .collect();

        Some(ExtensionPlan {
            metric,
            band,
            splice: Splice {
                tasks: specs,
                edges,
                consumer: self.consumer.clone(),
                terminal,
                replace: match self.mode {
                    SpliceMode::Replace => Some(self.source.clone()),
                    SpliceMode::Additional => None,
                },
            },
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !self.high_threshold.is_finite() || !self.low_threshold.is_finite() {
            return Err(Error::Validation(
                "extension thresholds must be finite".to_string(),
            ));
        }
        if self.low_threshold > self.high_threshold {
            return Err(Error::Validation(format!(
                "extension low_threshold {} exceeds high_threshold {}",
                self.low_threshold, self.high_threshold
            )));
        }
        if self.tasks.is_empty() {
            return Err(Error::Validation(
                "extension declares no tasks".to_string(),
            ));
        }
        if self.source == self.consumer {
            return Err(Error::Validation(
                "extension source and consumer must differ".to_string(),
            ));
        }
        Ok(())
    }
}
