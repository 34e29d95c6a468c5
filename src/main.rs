// =============================================================================
// Model Weights Engine — Main Entry Point
// =============================================================================
//
// Keeps per-model confidence weights in sync with the latest scatterometer
// observation. The refresh loop starts a new cycle whenever the observation
// changes and otherwise refines each model's weight from its current
// forecast; the status loop periodically logs the weights table.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod angular;
mod divergence;
mod ensemble;
mod reference;
mod runtime_config;
mod sources;
mod types;
mod weights;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::ensemble::EnsembleAggregator;
use crate::runtime_config::EngineConfig;
use crate::sources::{
    parse_observation_time, ForecastSource, JsonForecastFile, JsonObservationFile,
};
use crate::types::WeatherModel;
use crate::weights::{CycleCheck, WeightsManager};

const DEFAULT_CONFIG_PATH: &str = "weights_config.json";

/// One pass of the refresh loop.
///
/// Does blocking file I/O and may wait on the cross-process weights lock, so
/// it runs on the blocking pool.
fn refresh_once(
    manager: &RwLock<WeightsManager>,
    observations: &JsonObservationFile,
    forecasts: &JsonForecastFile,
) -> anyhow::Result<()> {
    let mut manager = manager.write();
    let check = manager.check_and_reset_if_new_observation(observations)?;

    if check.is_reset() {
        // Initial weights compare against forecasts valid at observation time.
        let at = parse_observation_time(&manager.state().scat_timestamp).unwrap_or_else(|| {
            warn!(
                scat_timestamp = %manager.state().scat_timestamp,
                "unparseable observation timestamp, using current time"
            );
            Utc::now()
        });
        let cycle_forecasts = forecasts.forecasts(at)?;
        if cycle_forecasts.is_empty() {
            // Models stay on placeholders; their first in-cycle update
            // takes the initial comparison instead.
            warn!(at = %at, "no forecasts available for the new cycle");
            return Ok(());
        }
        manager.calculate_initial_weights(&cycle_forecasts)?;
        return Ok(());
    }
    if check == CycleCheck::SkippedDegenerate {
        debug!("degenerate observation skipped, previous cycle kept");
    }

    let current = forecasts.named_forecasts(Utc::now())?;
    let mut updated = 0;
    for (name, wind) in &current {
        if manager.update_model_weight_by_name(name, *wind, None)?.is_some() {
            updated += 1;
        }
    }
    debug!(models = updated, "in-cycle weights refreshed");
    Ok(())
}

/// Log the weighted ensemble wind for the current forecasts.
fn log_ensemble_wind(blend: &EnsembleAggregator, forecasts: &JsonForecastFile) {
    let current = match forecasts.forecasts(Utc::now()) {
        Ok(current) => current,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "forecasts unavailable for ensemble wind");
            return;
        }
    };
    if current.is_empty() {
        return;
    }
    let speeds: HashMap<WeatherModel, Option<f64>> =
        current.iter().map(|(m, w)| (*m, Some(w.speed))).collect();
    let directions: HashMap<WeatherModel, Option<f64>> =
        current.iter().map(|(m, w)| (*m, Some(w.direction))).collect();
    info!(
        speed_kt = format!("{:.1}", blend.weighted_average(&speeds)),
        direction = format!("{:.0}", blend.weighted_circular_average(&directions)),
        models = current.len(),
        weights = ?blend.weights(),
        "ensemble wind"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Model weights engine starting up");

    let config_path =
        std::env::var("WEIGHTS_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });
    config.apply_env_overrides();

    // ── 2. Build shared state ────────────────────────────────────────────
    let manager = Arc::new(RwLock::new(WeightsManager::from_config(&config)));
    let observations = JsonObservationFile::new(&config.observation_file);
    let forecasts = JsonForecastFile::new(&config.forecast_file);

    info!(
        weights_file = %config.weights_file.display(),
        observation_file = %observations.path().display(),
        forecast_file = %config.forecast_file.display(),
        calibration_offset_deg = config.direction_calibration_offset_deg,
        phase = %manager.read().phase(),
        "Engine configured"
    );

    // ── 3. Refresh loop ──────────────────────────────────────────────────
    let refresh_manager = manager.clone();
    let status_forecasts = forecasts.clone();
    let refresh_secs = config.refresh_interval_secs.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(refresh_secs));
        loop {
            interval.tick().await;
            let manager = refresh_manager.clone();
            let observations = observations.clone();
            let forecasts = forecasts.clone();
            let result = tokio::task::spawn_blocking(move || {
                refresh_once(&manager, &observations, &forecasts)
            })
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %format!("{e:#}"), "weights refresh failed"),
                Err(e) => error!(error = %e, "weights refresh task panicked"),
            }
        }
    });

    // ── 4. Status loop ───────────────────────────────────────────────────
    let status_manager = manager.clone();
    let status_secs = config.status_interval_secs.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(status_secs));
        loop {
            interval.tick().await;
            let manager = status_manager.clone();
            let forecasts = status_forecasts.clone();
            // The read lock can wait behind a refresh holding the write lock.
            let result = tokio::task::spawn_blocking(move || {
                let blend = {
                    let manager = manager.read();
                    manager.log_status();
                    EnsembleAggregator::from_manager(&manager)
                };
                log_ensemble_wind(&blend, &forecasts);
            })
            .await;
            if let Err(e) = result {
                error!(error = %e, "status task panicked");
            }
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Err(e) = config.save(&config_path) {
        error!(error = %e, "Failed to save engine config on shutdown");
    }

    info!("Model weights engine shut down complete.");
    Ok(())
}
