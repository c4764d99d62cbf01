//! Distributor checkpoint file
//!
//! The checkpoint records how far distribution got so a restarted
//! Distributor can resume after the last distributed key instead of
//! replaying the whole record store.

use crate::error::{CheckpointError, PropertiesError};
use crate::properties::PropertiesFile;
use chrono::Utc;
use std::path::Path;

const REASON: &str = "Reason";
const PID: &str = "PID";
const LAST_KEY: &str = "Last Key";
const NUM_KEYS: &str = "Num Keys";
const SKIPPED_AFTER_LAST_KEY: &str = "Skipped After Last Key";
const RANDOM_SEED: &str = "Random Seed";
const SAVED_AT: &str = "Saved At";

/// Contents of one checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub reason: String,
    pub pid: u32,
    /// Last key that was read successfully and distributed
    pub last_key: String,
    /// Keys taken from the store so far, `total - remaining`
    pub num_keys: u64,
    /// Unreadable keys consumed after `last_key`
    pub skipped_after_last_key: u64,
    /// Seed of a shuffled record order
    pub random_seed: Option<u64>,
    pub saved_at: Option<String>,
}

impl Checkpoint {
    pub fn new(reason: &str, last_key: &str, num_keys: u64, skipped_after_last_key: u64) -> Self {
        Self {
            reason: reason.to_string(),
            pid: std::process::id(),
            last_key: last_key.to_string(),
            num_keys,
            skipped_after_last_key,
            random_seed: None,
            saved_at: None,
        }
    }

    pub fn with_random_seed(mut self, seed: Option<u64>) -> Self {
        self.random_seed = seed;
        self
    }

    /// Write the checkpoint to `path`, replacing any previous one
    pub fn save(&self, path: &Path) -> Result<(), PropertiesError> {
        let mut props = PropertiesFile::create(path);
        props.set_property(REASON, &self.reason);
        props.set_property_from_integer(PID, i64::from(self.pid));
        props.set_property(LAST_KEY, &self.last_key);
        props.set_property(NUM_KEYS, &self.num_keys.to_string());
        props.set_property(
            SKIPPED_AFTER_LAST_KEY,
            &self.skipped_after_last_key.to_string(),
        );
        if let Some(seed) = self.random_seed {
            props.set_property(RANDOM_SEED, &seed.to_string());
        }
        props.set_property(SAVED_AT, &Utc::now().to_rfc3339());
        props.sync()
    }

    /// Read a checkpoint; `Last Key` and `Num Keys` are mandatory
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let corrupt = |source| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            source,
        };
        let props = PropertiesFile::open(path).map_err(corrupt)?;

        let last_key = props.get_property(LAST_KEY).map_err(corrupt)?.to_string();
        let num_keys = unsigned(&props, NUM_KEYS).map_err(corrupt)?;
        let skipped_after_last_key = match unsigned(&props, SKIPPED_AFTER_LAST_KEY) {
            Ok(n) => n,
            Err(PropertiesError::NotFound(_)) => 0,
            Err(e) => return Err(corrupt(e)),
        };
        let random_seed = match unsigned(&props, RANDOM_SEED) {
            Ok(seed) => Some(seed),
            Err(PropertiesError::NotFound(_)) => None,
            Err(e) => return Err(corrupt(e)),
        };

        Ok(Self {
            reason: props.get_property(REASON).unwrap_or_default().to_string(),
            pid: props
                .get_property_as_integer(PID)
                .ok()
                .and_then(|pid| u32::try_from(pid).ok())
                .unwrap_or(0),
            last_key,
            num_keys,
            skipped_after_last_key,
            random_seed,
            saved_at: props.get_property(SAVED_AT).ok().map(str::to_string),
        })
    }
}

fn unsigned(props: &PropertiesFile, key: &str) -> Result<u64, PropertiesError> {
    let value = props.get_property(key)?;
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| PropertiesError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Distributor.chk");

        Checkpoint::new("Work package distributed", "k0007", 8, 0)
            .save(&path)
            .unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.reason, "Work package distributed");
        assert_eq!(loaded.pid, std::process::id());
        assert_eq!(loaded.last_key, "k0007");
        assert_eq!(loaded.num_keys, 8);
        assert_eq!(loaded.skipped_after_last_key, 0);
        assert_eq!(loaded.random_seed, None);
        assert!(loaded.saved_at.is_some());
    }

    #[test]
    fn test_random_seed_kept() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Distributor.chk");

        Checkpoint::new("Exit signal", "17", 3, 0)
            .with_random_seed(Some(u64::MAX))
            .save(&path)
            .unwrap();
        assert_eq!(Checkpoint::load(&path).unwrap().random_seed, Some(u64::MAX));

        std::fs::write(&path, "Last Key = 1\nNum Keys = 1\nRandom Seed = soon\n").unwrap();
        assert!(matches!(
            Checkpoint::load(&path),
            Err(CheckpointError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_missing_last_key_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Distributor.chk");
        std::fs::write(&path, "Reason = Exit signal\nNum Keys = 4\n").unwrap();

        assert!(matches!(
            Checkpoint::load(&path),
            Err(CheckpointError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_negative_count_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Distributor.chk");
        std::fs::write(&path, "Last Key = a\nNum Keys = -3\n").unwrap();

        assert!(matches!(
            Checkpoint::load(&path),
            Err(CheckpointError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_corrupt() {
        let dir = tempdir().unwrap();
        assert!(Checkpoint::load(&dir.path().join("absent.chk")).is_err());
    }
}
