// =============================================================================
// Divergence Scoring — forecast vs. reference agreement in [0, 1]
// =============================================================================
//
// Per-axis linear scores:
//
//   direction: w_dir = max(0, 1 - |Δθ| / 180)      Δθ = shortest rotation
//   speed:     w_spd = max(0, 1 - |Δv| / 30 kt)
//
// First impression at cycle start:   w0 = (w_dir + w_spd) / 2
// Damped in-cycle update:            w  = sqrt(max(0, w0 * w_cmp))
//
// The geometric mean keeps every update inside [0, max(w0, w_cmp)] and
// anchors it to the model's opening score for the cycle.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::angular;

/// Absolute direction divergence (degrees) at which the direction score is 0.
pub const MAX_DIRECTION_VARIATION: f64 = 180.0;

/// Absolute speed divergence (knots) at which the speed score is 0.
pub const MAX_SPEED_VARIATION: f64 = 30.0;

/// Score of a single axis plus the signed divergence that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisScore {
    pub weight: f64,
    /// Signed divergence (model minus reference) in the axis's units.
    pub variation: f64,
}

/// Breakdown returned by [`DivergenceLimits::combined_initial_weight`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CombinedScore {
    pub combined: f64,
    pub direction: AxisScore,
    pub speed: AxisScore,
}

/// Result of a damped in-cycle comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComparisonUpdate {
    pub new_weight: f64,
    pub direction_error: f64,
    pub speed_error: f64,
}

/// Divergence at which each axis bottoms out at a zero score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DivergenceLimits {
    pub max_direction_variation: f64,
    pub max_speed_variation: f64,
}

impl Default for DivergenceLimits {
    fn default() -> Self {
        Self {
            max_direction_variation: MAX_DIRECTION_VARIATION,
            max_speed_variation: MAX_SPEED_VARIATION,
        }
    }
}

impl DivergenceLimits {
    pub fn new(max_direction_variation: f64, max_speed_variation: f64) -> Self {
        Self {
            max_direction_variation,
            max_speed_variation,
        }
    }

    /// Direction agreement: 1 at zero divergence, 0 at opposite directions.
    pub fn direction_weight(&self, reference_dir: f64, model_dir: f64) -> AxisScore {
        AxisScore {
            weight: linear_score(
                angular::absolute_difference(reference_dir, model_dir),
                self.max_direction_variation,
            ),
            variation: angular::signed_difference(reference_dir, model_dir),
        }
    }

    /// Speed agreement: 1 at equal speeds, 0 at or beyond the speed limit.
    pub fn speed_weight(&self, reference_speed: f64, model_speed: f64) -> AxisScore {
        let variation = model_speed - reference_speed;
        AxisScore {
            weight: linear_score(variation.abs(), self.max_speed_variation),
            variation,
        }
    }

    /// Cycle-opening confidence: mean of the direction and speed scores.
    pub fn combined_initial_weight(
        &self,
        reference_dir: f64,
        model_dir: f64,
        reference_speed: f64,
        model_speed: f64,
    ) -> CombinedScore {
        let direction = self.direction_weight(reference_dir, model_dir);
        let speed = self.speed_weight(reference_speed, model_speed);
        CombinedScore {
            combined: (direction.weight + speed.weight) / 2.0,
            direction,
            speed,
        }
    }

    /// Damped update anchored on the cycle's `initial_weight`.
    pub fn update_comparison(
        &self,
        initial_weight: f64,
        reference_dir: f64,
        model_dir: f64,
        reference_speed: f64,
        model_speed: f64,
    ) -> ComparisonUpdate {
        let cmp =
            self.combined_initial_weight(reference_dir, model_dir, reference_speed, model_speed);
        ComparisonUpdate {
            new_weight: damped_weight(initial_weight, cmp.combined),
            direction_error: cmp.direction.variation,
            speed_error: cmp.speed.variation,
        }
    }
}

/// Geometric mean of the anchor and comparative weights, clamped at zero.
pub fn damped_weight(initial_weight: f64, comparative_weight: f64) -> f64 {
    let product = initial_weight * comparative_weight;
    if product.is_nan() {
        return 0.0;
    }
    product.max(0.0).sqrt()
}

fn linear_score(abs_variation: f64, limit: f64) -> f64 {
    if limit <= 0.0 || !abs_variation.is_finite() {
        return if abs_variation == 0.0 { 1.0 } else { 0.0 };
    }
    (1.0 - abs_variation / limit).clamp(0.0, 1.0)
}
