//! Per-phase spend tracking.
//!
//! Workers report spend as the `cost` metric on their output. Crossing the
//! configured threshold in a phase produces one advisory warning; it never
//! stops the session.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::clog_warn;
use crate::core::task::Phase;

/// Metric name workers use to report spend.
pub const COST_METRIC: &str = "cost";

#[derive(Debug, Clone, Default, Serialize)]
pub struct CostSummary {
    pub total: f64,
    pub by_phase: BTreeMap<Phase, f64>,
}

#[derive(Debug, Default)]
pub struct CostLedger {
    threshold: Option<f64>,
    totals: BTreeMap<Phase, f64>,
    warned: BTreeSet<Phase>,
}

impl CostLedger {
    pub fn new(threshold: Option<f64>) -> Self {
        Self {
            threshold,
            ..Default::default()
        }
    }

    /// Add spend to a phase. Returns a warning the first time the phase
    /// total exceeds the threshold.
    pub fn record(&mut self, phase: Phase, amount: f64, label: &str) -> Option<String> {
        if !amount.is_finite() || amount <= 0.0 {
            return None;
        }
        let total = self.totals.entry(phase).or_insert(0.0);
        *total += amount;
        let total = *total;

        let threshold = self.threshold?;
        if total > threshold && self.warned.insert(phase) {
            let warning = format!(
                "phase {} spend {:.2} exceeded warning threshold {:.2} (last: {})",
                phase, total, threshold, label
            );
            clog_warn!("{}", warning);
            return Some(warning);
        }
        None
    }

    pub fn phase_total(&self, phase: Phase) -> f64 {
        self.totals.get(&phase).copied().unwrap_or(0.0)
    }

    pub fn total(&self) -> f64 {
        self.totals.values().sum()
    }

    pub fn summary(&self) -> CostSummary {
        CostSummary {
            total: self.total(),
            by_phase: self.totals.clone(),
        }
    }
}
