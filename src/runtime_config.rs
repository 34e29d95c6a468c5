// =============================================================================
// Engine Configuration — tunable settings with atomic save
// =============================================================================
//
// Central configuration hub for the model weights engine: file locations,
// the reference position, divergence limits, share bounds and loop timing.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::divergence::{DivergenceLimits, MAX_DIRECTION_VARIATION, MAX_SPEED_VARIATION};
use crate::reference::{
    ReferenceExtractor, DEFAULT_CALIBRATION_OFFSET_DEG, DEFAULT_NEAREST_FALLBACK,
    DEFAULT_SEARCH_RADIUS_NM,
};
use crate::weights::normalize::{
    NormalizationBounds, DEFAULT_MAX_PASSES, DEFAULT_MAX_SHARE, DEFAULT_MIN_SHARE,
    DEFAULT_WEIGHT_FLOOR,
};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_weights_file() -> PathBuf {
    PathBuf::from("docs/model_weights.json")
}

fn default_observation_file() -> PathBuf {
    PathBuf::from("docs/scatterometer_latest.json")
}

fn default_forecast_file() -> PathBuf {
    PathBuf::from("docs/model_forecasts.json")
}

fn default_reference_lat() -> f64 {
    -22.50
}

fn default_reference_lon() -> f64 {
    -40.50
}

fn default_search_radius_nm() -> f64 {
    DEFAULT_SEARCH_RADIUS_NM
}

fn default_nearest_fallback_count() -> usize {
    DEFAULT_NEAREST_FALLBACK
}

fn default_calibration_offset_deg() -> f64 {
    DEFAULT_CALIBRATION_OFFSET_DEG
}

fn default_max_direction_variation_deg() -> f64 {
    MAX_DIRECTION_VARIATION
}

fn default_max_speed_variation_kt() -> f64 {
    MAX_SPEED_VARIATION
}

fn default_weight_floor() -> f64 {
    DEFAULT_WEIGHT_FLOOR
}

fn default_min_share() -> f64 {
    DEFAULT_MIN_SHARE
}

fn default_max_share() -> f64 {
    DEFAULT_MAX_SHARE
}

fn default_max_normalization_passes() -> usize {
    DEFAULT_MAX_PASSES
}

fn default_refresh_interval_secs() -> u64 {
    300
}

fn default_status_interval_secs() -> u64 {
    900
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the weights engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Files ---------------------------------------------------------------

    /// Persisted weights record.
    #[serde(default = "default_weights_file")]
    pub weights_file: PathBuf,

    /// Latest scatterometer observation pass (JSON).
    #[serde(default = "default_observation_file")]
    pub observation_file: PathBuf,

    /// Per-model forecast time series (JSON).
    #[serde(default = "default_forecast_file")]
    pub forecast_file: PathBuf,

    // --- Reference extraction ------------------------------------------------

    #[serde(default = "default_reference_lat")]
    pub reference_lat: f64,

    #[serde(default = "default_reference_lon")]
    pub reference_lon: f64,

    /// Radius around the reference position, in nautical miles.
    #[serde(default = "default_search_radius_nm")]
    pub search_radius_nm: f64,

    /// Points used when none fall inside the search radius.
    #[serde(default = "default_nearest_fallback_count")]
    pub nearest_fallback_count: usize,

    /// Offset subtracted from the averaged observation direction.
    /// Must match the provider's direction convention.
    #[serde(default = "default_calibration_offset_deg")]
    pub direction_calibration_offset_deg: f64,

    /// Keep the previous cycle when an observation yields no points.
    #[serde(default)]
    pub skip_degenerate_reference: bool,

    // --- Divergence scoring --------------------------------------------------

    #[serde(default = "default_max_direction_variation_deg")]
    pub max_direction_variation_deg: f64,

    #[serde(default = "default_max_speed_variation_kt")]
    pub max_speed_variation_kt: f64,

    // --- Normalization -------------------------------------------------------

    #[serde(default = "default_weight_floor")]
    pub weight_floor: f64,

    #[serde(default = "default_min_share")]
    pub min_share: f64,

    #[serde(default = "default_max_share")]
    pub max_share: f64,

    #[serde(default = "default_max_normalization_passes")]
    pub max_normalization_passes: usize,

    // --- Timing --------------------------------------------------------------

    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,

    /// How long a writer waits for the weights lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            weights_file: default_weights_file(),
            observation_file: default_observation_file(),
            forecast_file: default_forecast_file(),
            reference_lat: default_reference_lat(),
            reference_lon: default_reference_lon(),
            search_radius_nm: default_search_radius_nm(),
            nearest_fallback_count: default_nearest_fallback_count(),
            direction_calibration_offset_deg: default_calibration_offset_deg(),
            skip_degenerate_reference: false,
            max_direction_variation_deg: default_max_direction_variation_deg(),
            max_speed_variation_kt: default_max_speed_variation_kt(),
            weight_floor: default_weight_floor(),
            min_share: default_min_share(),
            max_share: default_max_share(),
            max_normalization_passes: default_max_normalization_passes(),
            refresh_interval_secs: default_refresh_interval_secs(),
            status_interval_secs: default_status_interval_secs(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            weights_file = %config.weights_file.display(),
            reference_lat = config.reference_lat,
            reference_lon = config.reference_lon,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Apply `WEIGHTS_FILE`, `SCAT_FILE` and `FORECAST_FILE` overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = non_empty("WEIGHTS_FILE") {
            self.weights_file = PathBuf::from(v.trim());
        }
        if let Some(v) = non_empty("SCAT_FILE") {
            self.observation_file = PathBuf::from(v.trim());
        }
        if let Some(v) = non_empty("FORECAST_FILE") {
            self.forecast_file = PathBuf::from(v.trim());
        }
    }

    pub fn reference_extractor(&self) -> ReferenceExtractor {
        ReferenceExtractor {
            search_radius_nm: self.search_radius_nm,
            nearest_fallback: self.nearest_fallback_count,
            calibration_offset_deg: self.direction_calibration_offset_deg,
            ..ReferenceExtractor::new(self.reference_lat, self.reference_lon)
        }
    }

    pub fn divergence_limits(&self) -> DivergenceLimits {
        DivergenceLimits::new(self.max_direction_variation_deg, self.max_speed_variation_kt)
    }

    pub fn normalization_bounds(&self) -> NormalizationBounds {
        NormalizationBounds {
            weight_floor: self.weight_floor,
            min_share: self.min_share,
            max_share: self.max_share,
            max_passes: self.max_normalization_passes,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.weights_file, PathBuf::from("docs/model_weights.json"));
        assert!((cfg.reference_lat + 22.5).abs() < f64::EPSILON);
        assert!((cfg.search_radius_nm - 50.0).abs() < f64::EPSILON);
        assert_eq!(cfg.nearest_fallback_count, 10);
        assert!((cfg.direction_calibration_offset_deg - 180.0).abs() < f64::EPSILON);
        assert!((cfg.max_speed_variation_kt - 30.0).abs() < f64::EPSILON);
        assert!((cfg.min_share - 0.05).abs() < f64::EPSILON);
        assert!((cfg.max_share - 0.40).abs() < f64::EPSILON);
        assert!(!cfg.skip_degenerate_reference);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "max_speed_variation_kt": 20.0, "skip_degenerate_reference": true }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert!((cfg.max_speed_variation_kt - 20.0).abs() < f64::EPSILON);
        assert!(cfg.skip_degenerate_reference);
        assert_eq!(cfg.nearest_fallback_count, 10);
        assert!((cfg.divergence_limits().max_speed_variation - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights_config.json");
        let mut cfg = EngineConfig::default();
        cfg.reference_lat = -23.1;
        cfg.save(&path).unwrap();
        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(EngineConfig::load(dir.path().join("nope.json")).is_err());
    }

    #[test]
    fn overrides_replace_file_paths() {
        let mut cfg = EngineConfig::default();
        cfg.apply_overrides(|key| match key {
            "WEIGHTS_FILE" => Some("/tmp/w.json".to_string()),
            "SCAT_FILE" => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(cfg.weights_file, PathBuf::from("/tmp/w.json"));
        assert_eq!(cfg.observation_file, default_observation_file());
    }
}
