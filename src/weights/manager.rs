// =============================================================================
// Weights Manager — cycle detection, weight updates and persistence
// =============================================================================
//
// Every mutating call is one locked read-modify-write of the persisted record:
//
//   lock  ->  reload state  ->  mutate  ->  save  ->  unlock
//
// so several processes sharing the same weights file never drop each other's
// updates. Read-only queries (normalized weights, status) work on the state
// returned by the last operation.
//
// Cycle reset is driven by the observation fingerprint:
//   - source missing / unreadable   -> no change, cycle continues
//   - fingerprint equal to recorded -> no change
//   - fingerprint differs           -> load, extract reference, reset
// =============================================================================

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::divergence::DivergenceLimits;
use crate::reference::{ReferenceExtraction, ReferenceExtractor};
use crate::runtime_config::EngineConfig;
use crate::sources::ObservationSource;
use crate::types::{WeatherModel, WindVector};

use super::model::{CyclePhase, WeightsState};
use super::normalize::{normalize_weights, NormalizationBounds};
use super::store::WeightsStore;

/// Outcome of [`WeightsManager::check_and_reset_if_new_observation`].
#[derive(Debug, Clone, PartialEq)]
pub enum CycleCheck {
    /// Observation unchanged or unavailable; the current cycle continues.
    Unchanged,
    /// A new cycle was started from this reference.
    Reset(ReferenceExtraction),
    /// The observation changed but yielded no usable reference and
    /// `skip_degenerate_reference` kept the previous cycle.
    SkippedDegenerate,
}

impl CycleCheck {
    pub fn is_reset(&self) -> bool {
        matches!(self, Self::Reset(_))
    }
}

pub struct WeightsManager {
    store: WeightsStore,
    state: WeightsState,
    extractor: ReferenceExtractor,
    limits: DivergenceLimits,
    bounds: NormalizationBounds,
    skip_degenerate_reference: bool,
}

impl WeightsManager {
    /// Build a manager from the engine configuration, loading persisted state.
    pub fn from_config(config: &EngineConfig) -> Self {
        let store = WeightsStore::new(
            &config.weights_file,
            Duration::from_millis(config.lock_timeout_ms),
        );
        Self::new(
            store,
            config.reference_extractor(),
            config.divergence_limits(),
            config.normalization_bounds(),
        )
        .with_skip_degenerate_reference(config.skip_degenerate_reference)
    }

    pub fn new(
        store: WeightsStore,
        extractor: ReferenceExtractor,
        limits: DivergenceLimits,
        bounds: NormalizationBounds,
    ) -> Self {
        let state = store.load_or_default();
        Self {
            store,
            state,
            extractor,
            limits,
            bounds,
            skip_degenerate_reference: false,
        }
    }

    pub fn with_skip_degenerate_reference(mut self, skip: bool) -> Self {
        self.skip_degenerate_reference = skip;
        self
    }

    pub fn state(&self) -> &WeightsState {
        &self.state
    }

    pub fn phase(&self) -> CyclePhase {
        self.state.phase()
    }

    /// Re-read the persisted record, picking up other writers' changes.
    pub fn refresh(&mut self) {
        self.state = self.store.load_or_default();
    }

    /// Locked read-modify-write of the persisted state.
    fn transact<T>(&mut self, mutate: impl FnOnce(&mut WeightsState) -> T) -> Result<T> {
        let _lock = self.store.lock()?;
        let mut state = self.store.load_or_default();
        let out = mutate(&mut state);
        self.store.save(&state)?;
        self.state = state;
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Cycle detection
    // -------------------------------------------------------------------------

    /// Start a new cycle if the observation source has changed since the
    /// last consumed pass.
    pub fn check_and_reset_if_new_observation(
        &mut self,
        source: &dyn ObservationSource,
    ) -> Result<CycleCheck> {
        let Some(fingerprint) = source.fingerprint() else {
            debug!("observation source unavailable, cycle unchanged");
            return Ok(CycleCheck::Unchanged);
        };

        // Another process may have consumed this observation already.
        self.refresh();
        if fingerprint == self.state.scat_file_hash {
            return Ok(CycleCheck::Unchanged);
        }

        let batch = match source.load() {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "new observation detected but could not be loaded");
                return Ok(CycleCheck::Unchanged);
            }
        };
        if batch.fingerprint == self.state.scat_file_hash {
            return Ok(CycleCheck::Unchanged);
        }

        let extraction = self.extractor.extract(&batch.winds);
        if extraction.is_degenerate() {
            warn!(
                scat_timestamp = %batch.timestamp,
                "observation yielded no reference points, reference is a zero vector"
            );
            if self.skip_degenerate_reference {
                return Ok(CycleCheck::SkippedDegenerate);
            }
        }

        info!(
            scat_timestamp = %batch.timestamp,
            speed_kt = format!("{:.1}", extraction.wind.speed),
            direction = format!("{:.0}", extraction.wind.direction),
            points = extraction.points_used,
            selection = ?extraction.selection,
            "new observation detected, starting weights cycle"
        );

        let started = self.transact(|state| {
            // Re-checked under the lock: a concurrent writer may have started
            // this cycle since the unlocked check above.
            if state.scat_file_hash == batch.fingerprint {
                return false;
            }
            state.start_cycle(batch.timestamp, batch.fingerprint, extraction.wind, Utc::now());
            true
        })?;
        if !started {
            debug!("observation already consumed by another writer, cycle unchanged");
            return Ok(CycleCheck::Unchanged);
        }
        Ok(CycleCheck::Reset(extraction))
    }

    // -------------------------------------------------------------------------
    // Weight computation
    // -------------------------------------------------------------------------

    /// First comparison of the cycle for every model in `forecasts`.
    pub fn calculate_initial_weights(
        &mut self,
        forecasts: &BTreeMap<WeatherModel, WindVector>,
    ) -> Result<()> {
        let limits = self.limits;
        self.transact(|state| {
            let reference = state.reference();
            info!(
                reference_speed_kt = format!("{:.1}", reference.speed),
                reference_direction = format!("{:.0}", reference.direction),
                models = forecasts.len(),
                "calculating initial weights"
            );
            let now = Utc::now();
            for (&model, &forecast) in forecasts {
                if let Some(weight) = state.apply_initial(model, forecast, &limits, now) {
                    let entry = &state.weights[&model];
                    info!(
                        model = %model,
                        forecast_speed_kt = format!("{:.1}", forecast.speed),
                        forecast_direction = format!("{:.0}", forecast.direction),
                        direction_error = format!("{:+.1}", entry.direction_error),
                        speed_error = format!("{:+.1}", entry.speed_error),
                        initial_weight = format!("{:.3}", weight),
                        "initial weight set"
                    );
                }
            }
        })
    }

    /// Damped in-cycle update for `model`.
    ///
    /// `actual` overrides the cycle reference when a fresher ground truth is
    /// available.
    pub fn update_model_weight(
        &mut self,
        model: WeatherModel,
        forecast: WindVector,
        actual: Option<WindVector>,
    ) -> Result<Option<f64>> {
        let limits = self.limits;
        let updated =
            self.transact(|state| state.apply_update(model, forecast, actual, &limits, Utc::now()))?;
        if let Some(weight) = updated {
            debug!(model = %model, weight = format!("{:.3}", weight), "model weight updated");
        }
        Ok(updated)
    }

    /// String-keyed variant of [`Self::update_model_weight`]; unknown model
    /// names are ignored.
    pub fn update_model_weight_by_name(
        &mut self,
        model_name: &str,
        forecast: WindVector,
        actual: Option<WindVector>,
    ) -> Result<Option<f64>> {
        match model_name.parse::<WeatherModel>() {
            Ok(model) => self.update_model_weight(model, forecast, actual),
            Err(_) => {
                debug!(model = %model_name, "ignoring update for unknown model");
                Ok(None)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Raw current weight of `model`; 1.0 when the model has no entry.
    pub fn get_weight(&self, model: WeatherModel) -> f64 {
        self.state
            .weights
            .get(&model)
            .map(|w| w.current_weight)
            .unwrap_or(1.0)
    }

    /// Bounded shares summing to 1.
    pub fn get_normalized_weights(&self) -> BTreeMap<WeatherModel, f64> {
        let raw: BTreeMap<WeatherModel, f64> = self
            .state
            .weights
            .iter()
            .map(|(m, w)| (*m, w.current_weight))
            .collect();
        normalize_weights(&raw, &self.bounds)
    }
}

impl std::fmt::Debug for WeightsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightsManager")
            .field("store", &self.store.path())
            .field("phase", &self.state.phase())
            .field("scat_timestamp", &self.state.scat_timestamp)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ObservationBatch, ObservationPoint};
    use parking_lot::Mutex;

    const EPS: f64 = 1e-9;

    /// In-memory observation feed with a settable fingerprint.
    struct FakeObservations {
        batch: Mutex<Option<ObservationBatch>>,
    }

    impl FakeObservations {
        fn empty() -> Self {
            Self {
                batch: Mutex::new(None),
            }
        }

        fn publish(&self, fingerprint: &str, winds: Vec<ObservationPoint>) {
            *self.batch.lock() = Some(ObservationBatch {
                timestamp: format!("obs-{fingerprint}"),
                fingerprint: fingerprint.to_string(),
                winds,
            });
        }
    }

    impl ObservationSource for FakeObservations {
        fn fingerprint(&self) -> Option<String> {
            self.batch.lock().as_ref().map(|b| b.fingerprint.clone())
        }

        fn load(&self) -> Result<ObservationBatch> {
            self.batch
                .lock()
                .clone()
                .ok_or_else(|| anyhow::anyhow!("no observation"))
        }
    }

    /// Observation points at the reference position whose calibrated mean is
    /// `direction` / `speed`.
    fn winds_for(direction: f64, speed: f64) -> Vec<ObservationPoint> {
        vec![ObservationPoint {
            lat: -22.5,
            lon: -40.5,
            speed,
            direction: direction + 180.0,
        }]
    }

    fn manager_in(dir: &tempfile::TempDir) -> WeightsManager {
        let store = WeightsStore::new(dir.path().join("weights.json"), Duration::from_millis(200));
        WeightsManager::new(
            store,
            ReferenceExtractor::new(-22.5, -40.5),
            DivergenceLimits::default(),
            NormalizationBounds::default(),
        )
    }

    fn all_models(forecast: WindVector) -> BTreeMap<WeatherModel, WindVector> {
        WeatherModel::ALL.iter().map(|m| (*m, forecast)).collect()
    }

    #[test]
    fn fresh_manager_is_uninitialized() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager_in(&dir);
        assert_eq!(m.phase(), CyclePhase::Uninitialized);
        let shares = m.get_normalized_weights();
        for s in shares.values() {
            assert!((s - 0.2).abs() < EPS);
        }
    }

    #[test]
    fn missing_observation_is_no_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager_in(&dir);
        let check = m.check_and_reset_if_new_observation(&FakeObservations::empty()).unwrap();
        assert_eq!(check, CycleCheck::Unchanged);
        assert_eq!(m.phase(), CyclePhase::Uninitialized);
    }

    #[test]
    fn unchanged_fingerprint_never_resets() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager_in(&dir);
        let obs = FakeObservations::empty();
        obs.publish("v1", winds_for(270.0, 15.0));

        assert!(m.check_and_reset_if_new_observation(&obs).unwrap().is_reset());
        m.calculate_initial_weights(&all_models(WindVector::new(90.0, 15.0))).unwrap();
        let before = m.state().clone();

        for _ in 0..2 {
            let check = m.check_and_reset_if_new_observation(&obs).unwrap();
            assert_eq!(check, CycleCheck::Unchanged);
        }
        assert_eq!(m.state(), &before);
    }

    #[test]
    fn changed_fingerprint_resets_to_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager_in(&dir);
        let obs = FakeObservations::empty();
        obs.publish("v1", winds_for(270.0, 15.0));
        m.check_and_reset_if_new_observation(&obs).unwrap();
        m.calculate_initial_weights(&all_models(WindVector::new(90.0, 15.0))).unwrap();
        assert!(m.get_weight(WeatherModel::EcmwfIfs025) < 1.0);

        obs.publish("v2", winds_for(0.0, 10.0));
        let check = m.check_and_reset_if_new_observation(&obs).unwrap();
        let CycleCheck::Reset(extraction) = check else {
            panic!("expected reset, got {check:?}");
        };
        assert!((extraction.wind.speed - 10.0).abs() < EPS);
        assert_eq!(m.state().scat_file_hash, "v2");
        assert_eq!(m.state().scat_timestamp, "obs-v2");
        for w in m.state().weights.values() {
            assert_eq!(w.initial_weight, 1.0);
            assert_eq!(w.current_weight, 1.0);
            assert_eq!(w.comparison_count, 0);
        }
    }

    #[test]
    fn identical_forecasts_end_at_equal_shares() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager_in(&dir);
        let obs = FakeObservations::empty();
        obs.publish("v1", winds_for(270.0, 15.0));
        m.check_and_reset_if_new_observation(&obs).unwrap();
        assert!((m.state().reference_direction - 270.0).abs() < 1e-6);

        m.calculate_initial_weights(&all_models(WindVector::new(270.0, 15.0))).unwrap();
        for w in m.state().weights.values() {
            assert!((w.initial_weight - 1.0).abs() < 1e-6);
            assert_eq!(w.comparison_count, 1);
        }
        let shares = m.get_normalized_weights();
        assert_eq!(shares.len(), 5);
        for s in shares.values() {
            assert!((s - 0.2).abs() < 1e-6);
        }
    }

    #[test]
    fn perfect_and_opposite_models_get_expected_initial_weights() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager_in(&dir);
        let obs = FakeObservations::empty();
        obs.publish("v1", winds_for(270.0, 15.0));
        m.check_and_reset_if_new_observation(&obs).unwrap();

        let mut forecasts = BTreeMap::new();
        forecasts.insert(WeatherModel::EcmwfIfs025, WindVector::new(270.0, 15.0));
        forecasts.insert(WeatherModel::GfsSeamless, WindVector::new(90.0, 15.0));
        m.calculate_initial_weights(&forecasts).unwrap();

        assert!((m.get_weight(WeatherModel::EcmwfIfs025) - 1.0).abs() < 1e-6);
        assert!((m.get_weight(WeatherModel::GfsSeamless) - 0.5).abs() < 1e-6);
        // Models without a forecast keep the placeholder.
        assert_eq!(m.get_weight(WeatherModel::JmaSeamless), 1.0);
    }

    #[test]
    fn updates_persist_and_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager_in(&dir);
        let obs = FakeObservations::empty();
        obs.publish("v1", winds_for(0.0, 10.0));
        m.check_and_reset_if_new_observation(&obs).unwrap();
        m.calculate_initial_weights(&all_models(WindVector::new(350.0, 10.0))).unwrap();

        let w = m
            .update_model_weight(WeatherModel::IconSeamless, WindVector::new(0.0, 10.0), None)
            .unwrap()
            .unwrap();
        let initial: f64 = 1.0 - (10.0 / 180.0) / 2.0;
        assert!((w - initial.sqrt()).abs() < 1e-6);

        let reloaded = manager_in(&dir);
        assert_eq!(reloaded.state(), m.state());
        assert_eq!(
            reloaded.state().weights[&WeatherModel::IconSeamless].comparison_count,
            2
        );
    }

    #[test]
    fn update_after_reset_without_initial_weights_uses_first_comparison() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager_in(&dir);
        let obs = FakeObservations::empty();
        obs.publish("v1", winds_for(270.0, 15.0));
        assert!(m.check_and_reset_if_new_observation(&obs).unwrap().is_reset());
        assert_eq!(
            m.check_and_reset_if_new_observation(&obs).unwrap(),
            CycleCheck::Unchanged
        );

        let w = m
            .update_model_weight(WeatherModel::GfsSeamless, WindVector::new(90.0, 15.0), None)
            .unwrap()
            .unwrap();
        assert!((w - 0.5).abs() < 1e-6);
        let entry = &m.state().weights[&WeatherModel::GfsSeamless];
        assert!((entry.initial_weight - 0.5).abs() < 1e-6);
        assert_eq!(entry.comparison_count, 1);

        // The next update is damped against the 0.5 anchor.
        let w = m
            .update_model_weight(WeatherModel::GfsSeamless, WindVector::new(270.0, 15.0), None)
            .unwrap()
            .unwrap();
        assert!((w - 0.5f64.sqrt()).abs() < 1e-6);
    }

    /// Feed that lets a rival writer consume the observation while it is
    /// being loaded, after the caller's unlocked fingerprint check.
    struct RivalConsumesOnLoad<'a> {
        inner: &'a FakeObservations,
        rival: Mutex<Option<WeightsManager>>,
    }

    impl ObservationSource for RivalConsumesOnLoad<'_> {
        fn fingerprint(&self) -> Option<String> {
            self.inner.fingerprint()
        }

        fn load(&self) -> Result<ObservationBatch> {
            if let Some(mut rival) = self.rival.lock().take() {
                assert!(rival.check_and_reset_if_new_observation(self.inner)?.is_reset());
                rival.calculate_initial_weights(&all_models(WindVector::new(100.0, 12.0)))?;
            }
            self.inner.load()
        }
    }

    #[test]
    fn concurrent_reset_of_the_same_observation_keeps_first_writers_weights() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager_in(&dir);
        let obs = FakeObservations::empty();
        obs.publish("v1", winds_for(90.0, 12.0));
        let racing = RivalConsumesOnLoad {
            inner: &obs,
            rival: Mutex::new(Some(manager_in(&dir))),
        };

        let check = m.check_and_reset_if_new_observation(&racing).unwrap();
        assert_eq!(check, CycleCheck::Unchanged);
        assert_eq!(m.state().scat_file_hash, "v1");
        for w in m.state().weights.values() {
            assert_eq!(w.comparison_count, 1);
            assert!(w.initial_weight < 1.0);
        }
    }

    #[test]
    fn unknown_model_name_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager_in(&dir);
        let before = m.state().clone();
        let out = m
            .update_model_weight_by_name("made_up_model", WindVector::new(0.0, 0.0), None)
            .unwrap();
        assert!(out.is_none());
        assert_eq!(m.state(), &before);
    }

    #[test]
    fn degenerate_reference_resets_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager_in(&dir);
        let obs = FakeObservations::empty();
        obs.publish("empty", Vec::new());
        let check = m.check_and_reset_if_new_observation(&obs).unwrap();
        let CycleCheck::Reset(extraction) = check else {
            panic!("expected reset, got {check:?}");
        };
        assert!(extraction.is_degenerate());
        assert_eq!(m.state().reference(), WindVector::default());
    }

    #[test]
    fn degenerate_reference_can_be_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager_in(&dir).with_skip_degenerate_reference(true);
        let obs = FakeObservations::empty();
        obs.publish("v1", winds_for(90.0, 12.0));
        m.check_and_reset_if_new_observation(&obs).unwrap();

        obs.publish("empty", Vec::new());
        let check = m.check_and_reset_if_new_observation(&obs).unwrap();
        assert_eq!(check, CycleCheck::SkippedDegenerate);
        assert_eq!(m.state().scat_file_hash, "v1");
    }

    #[test]
    fn observation_consumed_by_another_writer_is_not_reset_again() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = manager_in(&dir);
        let mut second = manager_in(&dir);
        let obs = FakeObservations::empty();
        obs.publish("v1", winds_for(90.0, 12.0));

        assert!(first.check_and_reset_if_new_observation(&obs).unwrap().is_reset());
        first
            .calculate_initial_weights(&all_models(WindVector::new(100.0, 12.0)))
            .unwrap();
        assert_eq!(
            second.check_and_reset_if_new_observation(&obs).unwrap(),
            CycleCheck::Unchanged
        );
        assert_eq!(second.state().weights, first.state().weights);
    }
}
