// =============================================================================
// Collaborator Sources — observation and forecast feeds consumed by the engine
// =============================================================================
//
// The engine never fetches anything itself. Downloaders drop their results as
// JSON files and these adapters read them:
//
//   observation file:  { "timestamp": "...", "source": "...",
//                        "winds": [ {lat, lon, speed|speed_kt, direction} ] }
//   forecast file:     { "models": { "<model>": [ {time, direction, speed} ] } }
//
// The observation fingerprint is the SHA-256 of the file bytes. `load` hashes
// the same bytes it parses, so the fingerprint recorded for a cycle always
// belongs to the content that was actually consumed.
// =============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::types::{ObservationBatch, ObservationPoint, WeatherModel, WindVector};

/// Supplier of scatterometer observation passes.
pub trait ObservationSource {
    /// Cheap change fingerprint of the current observation, or `None` when
    /// the source is missing or unreadable.
    fn fingerprint(&self) -> Option<String>;

    /// Load the current observation pass.
    fn load(&self) -> Result<ObservationBatch>;
}

/// Supplier of per-model wind forecasts.
pub trait ForecastSource {
    /// Forecast wind for `model` at (or nearest to) `at`.
    fn forecast(&self, model: WeatherModel, at: DateTime<Utc>) -> Result<Option<WindVector>>;

    /// Forecasts for every roster model that has one at `at`.
    fn forecasts(&self, at: DateTime<Utc>) -> Result<BTreeMap<WeatherModel, WindVector>> {
        let mut out = BTreeMap::new();
        for model in WeatherModel::ALL {
            if let Some(wind) = self.forecast(model, at)? {
                out.insert(model, wind);
            }
        }
        Ok(out)
    }
}

/// Parse an observation timestamp: RFC 3339, or naive ISO-8601 taken as UTC.
pub fn parse_observation_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

// =============================================================================
// Observation file
// =============================================================================

#[derive(Debug, Deserialize)]
struct ObservationFile {
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    winds: Vec<ObservationPoint>,
}

/// Observation pass stored as a JSON file on disk.
#[derive(Debug, Clone)]
pub struct JsonObservationFile {
    path: PathBuf,
}

impl JsonObservationFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ObservationSource for JsonObservationFile {
    fn fingerprint(&self) -> Option<String> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Some(content_hash(&bytes)),
            Err(e) => {
                trace!(path = %self.path.display(), error = %e, "observation file unavailable");
                None
            }
        }
    }

    fn load(&self) -> Result<ObservationBatch> {
        let bytes = std::fs::read(&self.path)
            .with_context(|| format!("failed to read observation file {}", self.path.display()))?;
        let file: ObservationFile = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse observation file {}", self.path.display()))?;

        debug!(
            path = %self.path.display(),
            source = file.source.as_deref().unwrap_or("unknown"),
            points = file.winds.len(),
            timestamp = %file.timestamp,
            "observation file loaded"
        );

        Ok(ObservationBatch {
            timestamp: file.timestamp,
            fingerprint: content_hash(&bytes),
            winds: file.winds,
        })
    }
}

// =============================================================================
// Forecast file
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
struct ForecastEntry {
    time: String,
    #[serde(flatten)]
    wind: WindVector,
}

#[derive(Debug, Deserialize)]
struct ForecastFile {
    #[serde(default)]
    models: BTreeMap<String, Vec<ForecastEntry>>,
}

/// Per-model forecast time series stored as a JSON file on disk.
///
/// The file is re-read on every lookup so downloaders can replace it at any
/// time. Model names not in the roster are ignored.
#[derive(Debug, Clone)]
pub struct JsonForecastFile {
    path: PathBuf,
}

impl JsonForecastFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(&self) -> Result<ForecastFile> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read forecast file {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse forecast file {}", self.path.display()))
    }

    /// Nearest forecast at `at` for every model in the file, keyed by the
    /// name as written, roster member or not.
    pub fn named_forecasts(&self, at: DateTime<Utc>) -> Result<BTreeMap<String, WindVector>> {
        let file = self.read()?;
        Ok(file
            .models
            .iter()
            .filter_map(|(name, entries)| Some((name.clone(), Self::nearest(entries, at)?)))
            .collect())
    }

    fn nearest(entries: &[ForecastEntry], at: DateTime<Utc>) -> Option<WindVector> {
        entries
            .iter()
            .filter_map(|e| parse_observation_time(&e.time).map(|t| (t, e.wind)))
            .min_by_key(|(t, _)| (*t - at).num_seconds().abs())
            .map(|(_, wind)| wind)
    }
}

impl ForecastSource for JsonForecastFile {
    fn forecast(&self, model: WeatherModel, at: DateTime<Utc>) -> Result<Option<WindVector>> {
        let file = self.read()?;
        Ok(file
            .models
            .get(model.as_str())
            .and_then(|entries| Self::nearest(entries, at)))
    }

    fn forecasts(&self, at: DateTime<Utc>) -> Result<BTreeMap<WeatherModel, WindVector>> {
        let mut out = BTreeMap::new();
        for (name, wind) in self.named_forecasts(at)? {
            match name.parse::<WeatherModel>() {
                Ok(model) => {
                    out.insert(model, wind);
                }
                Err(_) => debug!(model = %name, "ignoring forecast for unknown model"),
            }
        }
        Ok(out)
    }
}
