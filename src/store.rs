// Persisted vehicle configuration (config.json)
//
// Only the keys the control core reads or writes are typed; everything else
// (wifi, admin credentials, led settings...) is carried through untouched so
// saving never drops fields owned by other parts of the firmware.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VehicleConfig {
    #[serde(rename = "vehicleType", default)]
    pub vehicle_type: Option<String>,

    #[serde(rename = "vehicleTag", default)]
    pub vehicle_tag: Option<String>,

    #[serde(rename = "vehicleName", default)]
    pub vehicle_name: Option<String>,

    /// Motor name -> motor number (key into the pin table)
    #[serde(default)]
    pub motor_numbers: BTreeMap<String, u8>,

    /// Motor name -> duty floor
    #[serde(default)]
    pub motor_min: BTreeMap<String, u16>,

    #[serde(default)]
    pub motor_reversed: BTreeMap<String, bool>,

    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

impl VehicleConfig {
    /// Minimal config written on first boot
    pub fn minimal_default() -> Self {
        Self {
            vehicle_type: Some("RokDevice".to_string()),
            vehicle_tag: Some(format!("RokDevice-{}", random_tag())),
            ..Self::default()
        }
    }
}

/// Random 6-character tag, e.g. `Q7K2XD`
pub fn random_tag() -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::rng();
    (0..6)
        .map(|_| CHARS[rng.random_range(0..CHARS.len())] as char)
        .collect()
}

/// Where the registry reads its persisted table from and writes it back to
pub trait ConfigStore: Send {
    fn load(&self) -> Result<VehicleConfig, ConfigError>;
    fn save(&self, cfg: &VehicleConfig) -> Result<(), ConfigError>;
}

/// JSON file on disk
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Open the store, creating the file with defaults if it does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let store = Self { path: path.into() };
        if !store.path.exists() {
            info!("No config at {}, writing defaults", store.path.display());
            if let Some(dir) = store.path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?;
            }
            store.save(&VehicleConfig::minimal_default())?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for JsonFileStore {
    fn load(&self) -> Result<VehicleConfig, ConfigError> {
        let text = fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        let mut cfg: VehicleConfig = serde_json::from_str(&text)?;

        // A shipped image carries a "...DEFAULT" tag; give each board its own
        if let Some(tag) = cfg.vehicle_tag.as_mut().filter(|t| t.ends_with("DEFAULT")) {
            *tag = tag.replace("DEFAULT", &random_tag());
            if let Err(e) = self.save(&cfg) {
                warn!("Failed to persist generated vehicle tag: {}", e);
            }
        }
        Ok(cfg)
    }

    fn save(&self, cfg: &VehicleConfig) -> Result<(), ConfigError> {
        let text = serde_json::to_string(cfg)?;
        fs::write(&self.path, text).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// In-memory store for tests and embedding
#[derive(Default)]
pub struct MemoryStore {
    cfg: Mutex<VehicleConfig>,
}

impl MemoryStore {
    pub fn new(cfg: VehicleConfig) -> Self {
        Self {
            cfg: Mutex::new(cfg),
        }
    }

    /// Copy of what was last saved
    pub fn snapshot(&self) -> VehicleConfig {
        self.cfg.lock().clone()
    }
}

impl ConfigStore for MemoryStore {
    fn load(&self) -> Result<VehicleConfig, ConfigError> {
        Ok(self.cfg.lock().clone())
    }

    fn save(&self, cfg: &VehicleConfig) -> Result<(), ConfigError> {
        *self.cfg.lock() = cfg.clone();
        Ok(())
    }
}

impl<S: ConfigStore + Sync> ConfigStore for std::sync::Arc<S> {
    fn load(&self) -> Result<VehicleConfig, ConfigError> {
        (**self).load()
    }

    fn save(&self, cfg: &VehicleConfig) -> Result<(), ConfigError> {
        (**self).save(cfg)
    }
}
