// =============================================================================
// Status Snapshot — read-only view of the weights engine for display layers
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::types::{WeatherModel, WindVector};

use super::manager::WeightsManager;
use super::model::CyclePhase;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStatus {
    pub initial_weight: f64,
    pub current_weight: f64,
    pub normalized_weight: f64,
    pub avg_dir_error: f64,
    pub avg_speed_error: f64,
    pub comparisons: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub phase: CyclePhase,
    pub scat_timestamp: String,
    pub cycle_start: DateTime<Utc>,
    pub reference: WindVector,
    pub models: BTreeMap<WeatherModel, ModelStatus>,
}

impl WeightsManager {
    /// Build a status snapshot. Never mutates state.
    pub fn status(&self) -> StatusSnapshot {
        let normalized = self.get_normalized_weights();
        let state = self.state();
        StatusSnapshot {
            phase: state.phase(),
            scat_timestamp: state.scat_timestamp.clone(),
            cycle_start: state.cycle_start,
            reference: state.reference(),
            models: state
                .weights
                .iter()
                .map(|(model, w)| {
                    (
                        *model,
                        ModelStatus {
                            initial_weight: w.initial_weight,
                            current_weight: self.get_weight(*model),
                            normalized_weight: normalized.get(model).copied().unwrap_or(0.0),
                            avg_dir_error: w.direction_error,
                            avg_speed_error: w.speed_error,
                            comparisons: w.comparison_count,
                        },
                    )
                })
                .collect(),
        }
    }

    /// Log the status as a fixed-width table.
    pub fn log_status(&self) {
        for line in self.status().table_lines() {
            info!("{line}");
        }
    }
}

impl StatusSnapshot {
    /// Fixed-width table rows: header, reference, then one row per model.
    pub fn table_lines(&self) -> Vec<String> {
        let rule = "=".repeat(70);
        let thin = "-".repeat(70);
        let mut lines = vec![
            rule.clone(),
            "MODEL WEIGHTS STATUS".to_string(),
            rule.clone(),
            format!("Phase: {}", self.phase),
            format!("SCAT timestamp: {}", self.scat_timestamp),
            format!("Cycle start: {}", self.cycle_start.to_rfc3339()),
            format!(
                "Reference: {:.1} kt @ {:.0}°",
                self.reference.speed, self.reference.direction
            ),
            thin.clone(),
            format!(
                "{:<25} {:>8} {:>8} {:>8} {:>8} {:>8} {:>4}",
                "Model", "Initial", "Current", "Norm%", "ΔDir", "ΔVel", "N"
            ),
            thin,
        ];
        for (model, s) in &self.models {
            lines.push(format!(
                "{:<25} {:>8.3} {:>8.3} {:>7.1}% {:>+7.1}° {:>+6.1}kt {:>4}",
                model.as_str(),
                s.initial_weight,
                s.current_weight,
                s.normalized_weight * 100.0,
                s.avg_dir_error,
                s.avg_speed_error,
                s.comparisons
            ));
        }
        lines.push(rule);
        lines
    }
}
