//! Persistent stage -> services mapping
//!
//! The `enabled_services` file in the configuration directory records which
//! services boot automatically and in which stage. The current format is a
//! YAML mapping from stage number to an ordered list of names. The historical
//! format was a bare newline-delimited list; it is read once, promoted to
//! stage 3 and rewritten in the structured form.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Stage that legacy plain-text entries are promoted to.
const LEGACY_STAGE: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("could not write enabled services file: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not encode enabled services file: {0}")]
    Encode(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone)]
pub struct EnabledStore {
    path: PathBuf,
}

impl EnabledStore {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            path: config_dir.join("enabled_services"),
        }
    }

    /// Read the stage mapping. A missing file yields an empty map; a file in
    /// the legacy format is migrated and rewritten on the spot.
    pub fn read(&self) -> BTreeMap<u32, Vec<String>> {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return BTreeMap::new();
        };

        match serde_yaml::from_str(&raw) {
            Ok(stages) => stages,
            Err(_) => {
                // Legacy plain-text format: one name per line.
                let mut stages = BTreeMap::new();
                let names: Vec<String> = raw
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect();
                if !names.is_empty() {
                    stages.insert(LEGACY_STAGE, names);
                }
                if let Err(e) = self.write(&stages) {
                    log::warn!("could not migrate enabled services file: {}", e);
                }
                stages
            }
        }
    }

    /// Move `name` to `stage`, keeping the order of everything else. Stage 0
    /// means disabled and only removes. The file is rewritten atomically.
    pub fn set(&self, name: &str, stage: u32) -> Result<(), StoreError> {
        let mut stages = self.read();
        for names in stages.values_mut() {
            names.retain(|n| n != name);
        }
        if stage != 0 {
            stages.entry(stage).or_default().push(name.to_string());
        }
        stages.retain(|_, names| !names.is_empty());
        self.write(&stages)
    }

    fn write(&self, stages: &BTreeMap<u32, Vec<String>>) -> Result<(), StoreError> {
        let encoded = serde_yaml::to_string(stages)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, encoded)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
