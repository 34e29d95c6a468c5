// =============================================================================
// Weights Store — durable JSON record with atomic save and an exclusive lock
// =============================================================================
//
// Persistence uses the same atomic tmp + rename pattern as the engine config
// so a crash mid-write never leaves a truncated record behind.
//
// Missing, unreadable or corrupt records are not fatal: `load_or_default`
// logs the problem and hands back a fresh state.
//
// Cross-process writers serialise through `<file>.lock`, created with
// `create_new` so only one holder can exist. The lock carries a UUID owner
// token and is released on drop. Locks older than `STALE_LOCK_AGE` are
// considered abandoned and broken by renaming them aside first.
// =============================================================================

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::WeightsState;

/// Age after which an existing lock file is treated as abandoned.
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);
/// Delay between lock acquisition attempts.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(25);

/// File-backed store for [`WeightsState`].
#[derive(Debug, Clone)]
pub struct WeightsStore {
    path: PathBuf,
    lock_timeout: Duration,
}

impl WeightsStore {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Read and parse the persisted record.
    pub fn load(&self) -> Result<WeightsState> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read weights state from {}", self.path.display()))?;
        let mut state: WeightsState = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse weights state from {}", self.path.display()))?;

        let added = state.ensure_roster(Utc::now());
        if added > 0 {
            warn!(path = %self.path.display(), added, "weights state was missing models, placeholders added");
        }
        Ok(state)
    }

    /// Load the record, falling back to a fresh state when it is missing or
    /// cannot be parsed.
    pub fn load_or_default(&self) -> WeightsState {
        if !self.path.exists() {
            info!(path = %self.path.display(), "no persisted weights state, starting fresh");
            return WeightsState::initial(Utc::now());
        }
        match self.load() {
            Ok(state) => {
                debug!(
                    path = %self.path.display(),
                    scat_timestamp = %state.scat_timestamp,
                    "weights state loaded"
                );
                state
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "discarding unusable weights state, starting fresh");
                WeightsState::initial(Utc::now())
            }
        }
    }

    /// Persist `state` atomically (write to `.tmp`, then rename).
    pub fn save(&self, state: &WeightsState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let content =
            serde_json::to_string_pretty(state).context("failed to serialise weights state")?;
        let tmp_path = self.path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp state to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename tmp state to {}", self.path.display()))?;

        debug!(path = %self.path.display(), "weights state saved (atomic)");
        Ok(())
    }

    /// Acquire the exclusive lock, waiting up to the configured timeout.
    pub fn lock(&self) -> Result<StoreLock> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.lock_timeout;

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
                Ok(mut file) => {
                    file.write_all(token.as_bytes()).with_context(|| {
                        format!("failed to write lock token to {}", lock_path.display())
                    })?;
                    return Ok(StoreLock {
                        path: lock_path,
                        token,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&lock_path) && break_stale_lock(&lock_path) {
                        continue;
                    }
                    if Instant::now() >= deadline {
                        bail!(
                            "timed out after {:?} waiting for weights lock {}",
                            self.lock_timeout,
                            lock_path.display()
                        );
                    }
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to create weights lock {}", lock_path.display())
                    })
                }
            }
        }
    }
}

/// Move a stale lock aside and delete it.
///
/// The rename is atomic, so of several writers racing to break the same lock
/// only one moves it. The moved file is checked again: if it turns out to be
/// a live lock created after the staleness check, it is linked back in place
/// unless a new holder already exists.
fn break_stale_lock(lock_path: &Path) -> bool {
    let mut aside = lock_path.as_os_str().to_owned();
    aside.push(format!(".stale-{}", Uuid::new_v4().simple()));
    let aside = PathBuf::from(aside);

    if std::fs::rename(lock_path, &aside).is_err() {
        return false;
    }
    let broken = lock_is_stale(&aside);
    if broken {
        warn!(path = %lock_path.display(), "breaking stale weights lock");
    } else if let Err(e) = std::fs::hard_link(&aside, lock_path) {
        warn!(path = %lock_path.display(), error = %e, "could not restore live weights lock");
    }
    let _ = std::fs::remove_file(&aside);
    broken
}

fn lock_is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age > STALE_LOCK_AGE)
        .unwrap_or(false)
}

/// Held exclusive lock on the weights record; released on drop.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
    token: String,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        // Only remove the file if it still carries our token.
        match std::fs::read_to_string(&self.path) {
            Ok(owner) if owner == self.token => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "failed to release weights lock");
                }
            }
            Ok(_) => warn!(path = %self.path.display(), "weights lock taken over by another writer"),
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::divergence::DivergenceLimits;
    use crate::types::{WeatherModel, WindVector};

    fn store_in(dir: &tempfile::TempDir) -> WeightsStore {
        WeightsStore::new(dir.path().join("model_weights.json"), Duration::from_millis(100))
    }

    #[test]
    fn missing_file_falls_back_to_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = store_in(&dir).load_or_default();
        assert_eq!(state.weights.len(), WeatherModel::ALL.len());
        assert!(state.scat_file_hash.is_empty());
    }

    #[test]
    fn corrupt_file_falls_back_to_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "{ not json").unwrap();
        assert!(store.load().is_err());
        let state = store.load_or_default();
        assert_eq!(state.weights.len(), WeatherModel::ALL.len());
    }

    #[test]
    fn save_then_load_is_field_for_field_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let now = Utc::now();
        let mut state = WeightsState::initial(now);
        state.start_cycle("2026-03-01T06:00:00", "f00d", WindVector::new(93.7, 14.2), now);
        let limits = DivergenceLimits::default();
        state.apply_initial(WeatherModel::EcmwfIfs025, WindVector::new(101.3, 12.9), &limits, now);
        state.apply_update(WeatherModel::EcmwfIfs025, WindVector::new(88.1, 15.7), None, &limits, now);

        store.save(&state).unwrap();
        let reloaded = store.load().unwrap();
        assert_eq!(reloaded, state);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn persisted_record_uses_documented_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save(&WeightsState::initial(Utc::now())).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        for key in [
            "scat_timestamp",
            "scat_file_hash",
            "cycle_start",
            "reference_speed_kt",
            "reference_direction",
            "weights",
        ] {
            assert!(raw.get(key).is_some(), "missing key {key}");
        }
        let ecmwf = &raw["weights"]["ecmwf_ifs025"];
        assert_eq!(ecmwf["model_name"], "ecmwf_ifs025");
        assert_eq!(ecmwf["comparison_count"], 0);
    }

    fn backdate(path: &Path, age: Duration) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let lock_path = store.lock_path();
        std::fs::write(&lock_path, "abandoned").unwrap();
        backdate(&lock_path, Duration::from_secs(120));

        let guard = store.lock().unwrap();
        assert_eq!(std::fs::read_to_string(&lock_path).unwrap(), guard.token);
        drop(guard);
        assert!(!lock_path.exists());
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn live_lock_moved_aside_is_restored() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let guard = store.lock().unwrap();
        let lock_path = store.lock_path();

        assert!(!break_stale_lock(&lock_path));
        assert_eq!(std::fs::read_to_string(&lock_path).unwrap(), guard.token);
        assert!(store.lock().is_err(), "restored lock must still be held");
        drop(guard);
        assert!(!lock_path.exists());
    }

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let guard = store.lock().unwrap();
        assert!(store.lock().is_err(), "second lock must time out");
        drop(guard);
        assert!(store.lock().is_ok());
    }
}
