// =============================================================================
// Weight Model — per-model confidence and the per-cycle state record
// =============================================================================
//
// Life-cycle:
//   Uninitialized  ->  CycleActive  ->  (new observation)  ->  CycleActive ...
//
// Transitions:
//   start_cycle        every model back to the neutral 1.0 placeholder,
//                      counters cleared, new reference recorded.
//   apply_initial      first comparison: placeholder replaced by the combined
//                      divergence score, errors seeded, count = 1.
//   apply_update       later comparisons: damped update against the cycle's
//                      fixed initial weight, errors become running means.
//                      Falls back to apply_initial while count == 0.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::divergence::DivergenceLimits;
use crate::types::{WeatherModel, WindVector};

/// Whether a cycle has ever been started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CyclePhase {
    Uninitialized,
    CycleActive,
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "Uninitialized"),
            Self::CycleActive => write!(f, "CycleActive"),
        }
    }
}

/// Confidence record for a single forecast model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelWeight {
    pub model_name: WeatherModel,
    /// Score from the first comparison of the cycle.
    pub initial_weight: f64,
    /// Score after the latest in-cycle update.
    pub current_weight: f64,
    /// Running mean of the signed direction divergence (degrees).
    #[serde(default)]
    pub direction_error: f64,
    /// Running mean of the signed speed divergence (knots).
    #[serde(default)]
    pub speed_error: f64,
    #[serde(default)]
    pub comparison_count: u32,
    pub last_updated: DateTime<Utc>,
}

impl ModelWeight {
    /// Neutral placeholder used at the start of every cycle.
    pub fn placeholder(model: WeatherModel, now: DateTime<Utc>) -> Self {
        Self {
            model_name: model,
            initial_weight: 1.0,
            current_weight: 1.0,
            direction_error: 0.0,
            speed_error: 0.0,
            comparison_count: 0,
            last_updated: now,
        }
    }

    fn apply_initial(
        &mut self,
        limits: &DivergenceLimits,
        reference: WindVector,
        forecast: WindVector,
        now: DateTime<Utc>,
    ) -> f64 {
        let score = limits.combined_initial_weight(
            reference.direction,
            forecast.direction,
            reference.speed,
            forecast.speed,
        );
        self.initial_weight = score.combined;
        self.current_weight = score.combined;
        self.direction_error = score.direction.variation;
        self.speed_error = score.speed.variation;
        self.comparison_count = 1;
        self.last_updated = now;
        score.combined
    }

    fn apply_update(
        &mut self,
        limits: &DivergenceLimits,
        reference: WindVector,
        forecast: WindVector,
        now: DateTime<Utc>,
    ) -> f64 {
        let update = limits.update_comparison(
            self.initial_weight,
            reference.direction,
            forecast.direction,
            reference.speed,
            forecast.speed,
        );
        let n = self.comparison_count as f64;
        self.current_weight = update.new_weight;
        self.direction_error = (self.direction_error * n + update.direction_error) / (n + 1.0);
        self.speed_error = (self.speed_error * n + update.speed_error) / (n + 1.0);
        self.comparison_count = self.comparison_count.saturating_add(1);
        self.last_updated = now;
        update.new_weight
    }
}

/// The single persisted record of the weighting engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightsState {
    /// Observation timestamp that defines the active cycle.
    #[serde(default)]
    pub scat_timestamp: String,
    /// Fingerprint of the last consumed observation; empty before any cycle.
    #[serde(default)]
    pub scat_file_hash: String,
    pub cycle_start: DateTime<Utc>,
    #[serde(default)]
    pub reference_speed_kt: f64,
    #[serde(default)]
    pub reference_direction: f64,
    #[serde(default)]
    pub weights: BTreeMap<WeatherModel, ModelWeight>,
}

impl WeightsState {
    /// Fresh state: every model at equal placeholder weight, no reference.
    pub fn initial(now: DateTime<Utc>) -> Self {
        let mut state = Self {
            scat_timestamp: String::new(),
            scat_file_hash: String::new(),
            cycle_start: now,
            reference_speed_kt: 0.0,
            reference_direction: 0.0,
            weights: BTreeMap::new(),
        };
        state.ensure_roster(now);
        state
    }

    pub fn phase(&self) -> CyclePhase {
        if self.scat_file_hash.is_empty() {
            CyclePhase::Uninitialized
        } else {
            CyclePhase::CycleActive
        }
    }

    pub fn reference(&self) -> WindVector {
        WindVector::new(self.reference_direction, self.reference_speed_kt)
    }

    /// Add a placeholder for any roster model missing from the record.
    ///
    /// Returns the number of entries added.
    pub fn ensure_roster(&mut self, now: DateTime<Utc>) -> usize {
        let mut added = 0;
        for model in WeatherModel::ALL {
            self.weights.entry(model).or_insert_with(|| {
                added += 1;
                ModelWeight::placeholder(model, now)
            });
        }
        added
    }

    /// Replace the record wholesale with a new cycle.
    pub fn start_cycle(
        &mut self,
        scat_timestamp: impl Into<String>,
        fingerprint: impl Into<String>,
        reference: WindVector,
        now: DateTime<Utc>,
    ) {
        *self = Self {
            scat_timestamp: scat_timestamp.into(),
            scat_file_hash: fingerprint.into(),
            cycle_start: now,
            reference_speed_kt: reference.speed,
            reference_direction: reference.direction,
            weights: BTreeMap::new(),
        };
        self.ensure_roster(now);
    }

    /// First comparison for `model` in the current cycle.
    ///
    /// Returns the new weight, or `None` if the model has no entry.
    pub fn apply_initial(
        &mut self,
        model: WeatherModel,
        forecast: WindVector,
        limits: &DivergenceLimits,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        let reference = self.reference();
        let weight = self.weights.get_mut(&model)?;
        Some(weight.apply_initial(limits, reference, forecast, now))
    }

    /// Subsequent comparison for `model`, against `actual` when supplied and
    /// the cycle reference otherwise.
    ///
    /// A model still on its placeholder has had no comparison this cycle, so
    /// the first-comparison rule applies instead of the damped update.
    pub fn apply_update(
        &mut self,
        model: WeatherModel,
        forecast: WindVector,
        actual: Option<WindVector>,
        limits: &DivergenceLimits,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        let reference = actual.unwrap_or_else(|| self.reference());
        let weight = self.weights.get_mut(&model)?;
        if weight.comparison_count == 0 {
            return Some(weight.apply_initial(limits, reference, forecast, now));
        }
        Some(weight.apply_update(limits, reference, forecast, now))
    }
}
