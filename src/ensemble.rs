// =============================================================================
// Ensemble Aggregator — blend per-model values with normalized weights
// =============================================================================
//
// Scalars:     Σ w_i · v_i / Σ w_i         over models with a finite value
// Directions:  weighted circular mean      over models with a finite value
//
// Models with a missing or non-finite value drop out of both numerator and
// denominator. When nothing usable remains the result is the neutral 0.0,
// which callers must read as "no data", not as a real zero.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::angular;
use crate::types::WeatherModel;
use crate::weights::WeightsManager;

/// Value returned when no model contributed.
pub const NO_DATA: f64 = 0.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnsembleAggregator {
    weights: BTreeMap<WeatherModel, f64>,
}

impl EnsembleAggregator {
    pub fn new(weights: BTreeMap<WeatherModel, f64>) -> Self {
        Self { weights }
    }

    /// Snapshot the manager's current normalized weights.
    pub fn from_manager(manager: &WeightsManager) -> Self {
        Self::new(manager.get_normalized_weights())
    }

    pub fn weights(&self) -> &BTreeMap<WeatherModel, f64> {
        &self.weights
    }

    fn contributions<'a>(
        &'a self,
        values: &'a HashMap<WeatherModel, Option<f64>>,
    ) -> impl Iterator<Item = (f64, f64)> + 'a {
        values.iter().filter_map(|(model, value)| {
            let value = (*value)?;
            let weight = *self.weights.get(model)?;
            (value.is_finite() && weight > 0.0).then_some((value, weight))
        })
    }

    /// Weighted mean of scalar values such as speed or wave height.
    pub fn weighted_average(&self, values: &HashMap<WeatherModel, Option<f64>>) -> f64 {
        let (total, weight_sum) = self
            .contributions(values)
            .fold((0.0, 0.0), |(t, s), (v, w)| (t + v * w, s + w));
        if weight_sum > 0.0 {
            total / weight_sum
        } else {
            NO_DATA
        }
    }

    /// Weighted circular mean of directions in degrees, in `[0, 360)`.
    pub fn weighted_circular_average(&self, directions: &HashMap<WeatherModel, Option<f64>>) -> f64 {
        let (angles, weights): (Vec<f64>, Vec<f64>) = self.contributions(directions).unzip();
        angular::circular_weighted_mean(&angles, &weights).unwrap_or(NO_DATA)
    }
}
