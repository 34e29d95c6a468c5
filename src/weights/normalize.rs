// =============================================================================
// Bounded Normalization — per-model shares that sum to 1 within [min, max]
// =============================================================================
//
//   1. raw_i   = max(floor, current_weight_i)         (no model starves)
//   2. share_i = raw_i / Σ raw
//   3. Repeat until no free model violates the bounds:
//        - any free share above `max_share` is pinned at exactly `max_share`
//        - otherwise any free share below `min_share` is pinned at `min_share`
//        - the remaining mass (1 - Σ pinned) is re-spread over the free models
//          in proportion to their raw weights
//
// Each pass pins at least one more model, so the loop ends after at most
// N passes; `max_passes` caps it regardless.
//
// Bounds are only enforced when feasible: the max clamp needs
// N * max_share >= 1 and the min clamp needs N * min_share <= 1.
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::types::WeatherModel;

pub const DEFAULT_WEIGHT_FLOOR: f64 = 0.001;
pub const DEFAULT_MIN_SHARE: f64 = 0.05;
pub const DEFAULT_MAX_SHARE: f64 = 0.40;
pub const DEFAULT_MAX_PASSES: usize = 64;

/// Share limits applied by [`normalize_weights`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizationBounds {
    pub weight_floor: f64,
    pub min_share: f64,
    pub max_share: f64,
    pub max_passes: usize,
}

impl Default for NormalizationBounds {
    fn default() -> Self {
        Self {
            weight_floor: DEFAULT_WEIGHT_FLOOR,
            min_share: DEFAULT_MIN_SHARE,
            max_share: DEFAULT_MAX_SHARE,
            max_passes: DEFAULT_MAX_PASSES,
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Slot {
    Free,
    Pinned(f64),
}

/// Normalize raw per-model weights into bounded shares summing to 1.
pub fn normalize_weights(
    raw: &BTreeMap<WeatherModel, f64>,
    bounds: &NormalizationBounds,
) -> BTreeMap<WeatherModel, f64> {
    if raw.is_empty() {
        return BTreeMap::new();
    }

    let floor = if bounds.weight_floor > 0.0 {
        bounds.weight_floor
    } else {
        DEFAULT_WEIGHT_FLOOR
    };
    let models: Vec<WeatherModel> = raw.keys().copied().collect();
    let floored: Vec<f64> = raw
        .values()
        .map(|w| if w.is_finite() { w.max(floor) } else { floor })
        .collect();

    let n = models.len() as f64;
    let enforce_max = bounds.max_share > 0.0 && n * bounds.max_share >= 1.0;
    let enforce_min = bounds.min_share > 0.0 && n * bounds.min_share <= 1.0;
    if !enforce_max || !enforce_min {
        debug!(
            models = models.len(),
            enforce_max,
            enforce_min,
            "share bounds infeasible for roster size, relaxing"
        );
    }

    let mut slots = vec![Slot::Free; floored.len()];
    let mut shares = spread(&floored, &slots);

    for pass in 0..bounds.max_passes.max(1) {
        let above: Vec<usize> = if enforce_max {
            violators(&shares, &slots, |s| s > bounds.max_share)
        } else {
            Vec::new()
        };
        let to_pin = if !above.is_empty() {
            above.into_iter().map(|i| (i, bounds.max_share)).collect::<Vec<_>>()
        } else if enforce_min {
            violators(&shares, &slots, |s| s < bounds.min_share)
                .into_iter()
                .map(|i| (i, bounds.min_share))
                .collect()
        } else {
            Vec::new()
        };

        if to_pin.is_empty() {
            trace!(pass, "normalization converged");
            break;
        }
        for (i, value) in to_pin {
            slots[i] = Slot::Pinned(value);
        }
        shares = spread(&floored, &slots);
    }

    models.into_iter().zip(shares).collect()
}

fn violators(shares: &[f64], slots: &[Slot], out_of_bounds: impl Fn(f64) -> bool) -> Vec<usize> {
    shares
        .iter()
        .zip(slots)
        .enumerate()
        .filter(|(_, (s, slot))| **slot == Slot::Free && out_of_bounds(**s))
        .map(|(i, _)| i)
        .collect()
}

/// Pinned slots keep their value; free slots split the remaining mass in
/// proportion to their raw weights.
fn spread(raw: &[f64], slots: &[Slot]) -> Vec<f64> {
    let pinned: f64 = slots
        .iter()
        .map(|s| match s {
            Slot::Pinned(v) => *v,
            Slot::Free => 0.0,
        })
        .sum();
    let free_raw: f64 = raw
        .iter()
        .zip(slots)
        .filter(|(_, s)| **s == Slot::Free)
        .map(|(r, _)| *r)
        .sum();
    let remaining = (1.0 - pinned).max(0.0);

    let mut shares: Vec<f64> = raw
        .iter()
        .zip(slots)
        .map(|(r, s)| match s {
            Slot::Pinned(v) => *v,
            Slot::Free if free_raw > 0.0 => r / free_raw * remaining,
            Slot::Free => 0.0,
        })
        .collect();

    // Everything pinned: rescale so the shares still sum to 1.
    let total: f64 = shares.iter().sum();
    if free_raw <= 0.0 && total > 0.0 && (total - 1.0).abs() > 1e-12 {
        for s in &mut shares {
            *s /= total;
        }
    }
    shares
}
