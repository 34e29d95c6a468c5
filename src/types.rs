// =============================================================================
// Shared types used across the model weights engine
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The closed roster of forecast models blended by the engine.
///
/// Serialised as the stable provider identifier (e.g. `"ecmwf_ifs025"`), which
/// is also the key used in the persisted weights record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WeatherModel {
    #[serde(rename = "ecmwf_ifs025")]
    EcmwfIfs025,
    #[serde(rename = "icon_seamless")]
    IconSeamless,
    #[serde(rename = "gfs_seamless")]
    GfsSeamless,
    #[serde(rename = "meteofrance_seamless")]
    MeteofranceSeamless,
    #[serde(rename = "jma_seamless")]
    JmaSeamless,
}

impl WeatherModel {
    /// Every supported model, in roster order.
    pub const ALL: [WeatherModel; 5] = [
        Self::EcmwfIfs025,
        Self::IconSeamless,
        Self::GfsSeamless,
        Self::MeteofranceSeamless,
        Self::JmaSeamless,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EcmwfIfs025 => "ecmwf_ifs025",
            Self::IconSeamless => "icon_seamless",
            Self::GfsSeamless => "gfs_seamless",
            Self::MeteofranceSeamless => "meteofrance_seamless",
            Self::JmaSeamless => "jma_seamless",
        }
    }
}

impl std::fmt::Display for WeatherModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WeatherModel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s.trim())
            .ok_or_else(|| anyhow::anyhow!("unknown weather model: {s}"))
    }
}

/// A single wind vector: direction in degrees and speed in knots.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WindVector {
    pub direction: f64,
    #[serde(alias = "speed_kt")]
    pub speed: f64,
}

impl WindVector {
    pub fn new(direction: f64, speed: f64) -> Self {
        Self { direction, speed }
    }
}

/// One scatterometer retrieval.
///
/// Fields missing from the source JSON default to zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ObservationPoint {
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lon: f64,
    #[serde(default, alias = "speed_kt")]
    pub speed: f64,
    #[serde(default)]
    pub direction: f64,
}

/// A full observation pass as consumed by the manager.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObservationBatch {
    /// Observation timestamp as reported by the provider.
    pub timestamp: String,
    /// Change fingerprint of the exact content this batch was parsed from.
    pub fingerprint: String,
    pub winds: Vec<ObservationPoint>,
}
