// =============================================================================
// Reference Wind Extraction — one ground-truth vector per observation pass
// =============================================================================
//
// Selection:
//   1. Points within `search_radius_nm` of the reference coordinate, using a
//      planar distance in degrees (1 NM ~ 1/60 deg). Non-geodesic, which is
//      fine for small regional radii.
//   2. If none fall inside, the `nearest_fallback` closest points.
//
// Aggregation: arithmetic mean of speeds, circular mean of directions, then
// the calibration offset is applied to the mean direction. The scatterometer
// feed reports where the wind comes from; the default 180 deg offset flips it
// to the convention the forecast models are compared in. The offset is a
// config value and must be re-checked whenever the provider changes.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::angular;
use crate::types::{ObservationPoint, WindVector};

pub const DEFAULT_SEARCH_RADIUS_NM: f64 = 50.0;
pub const DEFAULT_NEAREST_FALLBACK: usize = 10;
pub const DEFAULT_CALIBRATION_OFFSET_DEG: f64 = 180.0;

/// How the reference points were chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selection {
    WithinRadius,
    NearestFallback,
    /// No observation points at all: the reference is a zero vector.
    Degenerate,
}

/// Output of [`ReferenceExtractor::extract`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferenceExtraction {
    pub wind: WindVector,
    pub points_used: usize,
    pub selection: Selection,
}

impl ReferenceExtraction {
    pub fn is_degenerate(&self) -> bool {
        self.selection == Selection::Degenerate
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceExtractor {
    pub lat: f64,
    pub lon: f64,
    pub search_radius_nm: f64,
    pub nearest_fallback: usize,
    pub calibration_offset_deg: f64,
}

impl ReferenceExtractor {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            search_radius_nm: DEFAULT_SEARCH_RADIUS_NM,
            nearest_fallback: DEFAULT_NEAREST_FALLBACK,
            calibration_offset_deg: DEFAULT_CALIBRATION_OFFSET_DEG,
        }
    }

    fn search_radius_deg(&self) -> f64 {
        self.search_radius_nm / 60.0
    }

    fn distance_deg(&self, p: &ObservationPoint) -> f64 {
        ((p.lat - self.lat).powi(2) + (p.lon - self.lon).powi(2)).sqrt()
    }

    pub fn extract(&self, winds: &[ObservationPoint]) -> ReferenceExtraction {
        let radius = self.search_radius_deg();
        let mut selected: Vec<&ObservationPoint> =
            winds.iter().filter(|p| self.distance_deg(p) <= radius).collect();
        let mut selection = Selection::WithinRadius;

        if selected.is_empty() {
            let mut by_distance: Vec<(f64, &ObservationPoint)> =
                winds.iter().map(|p| (self.distance_deg(p), p)).collect();
            by_distance.sort_by(|a, b| a.0.total_cmp(&b.0));
            selected = by_distance
                .into_iter()
                .take(self.nearest_fallback)
                .map(|(_, p)| p)
                .collect();
            selection = Selection::NearestFallback;
        }

        let directions: Vec<f64> = selected.iter().map(|p| p.direction).collect();
        let Some(mean_dir) = angular::circular_mean(&directions) else {
            debug!(points = winds.len(), "no usable observation points, degenerate reference");
            return ReferenceExtraction {
                wind: WindVector::default(),
                points_used: 0,
                selection: Selection::Degenerate,
            };
        };

        let mean_speed = selected.iter().map(|p| p.speed).sum::<f64>() / selected.len() as f64;
        let direction = angular::normalize(mean_dir - self.calibration_offset_deg);

        debug!(
            points = selected.len(),
            ?selection,
            raw_direction = format!("{:.1}", mean_dir),
            direction = format!("{:.1}", direction),
            speed_kt = format!("{:.1}", mean_speed),
            "reference wind extracted"
        );

        ReferenceExtraction {
            wind: WindVector::new(direction, mean_speed),
            points_used: selected.len(),
            selection,
        }
    }
}
