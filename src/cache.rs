//! # Local Cache
//!
//! Persistent storage for the list, favorites and settings while no family is
//! joined. One JSON file per key under the configured data directory.
//!
//! Load failures are never fatal: a missing or corrupt file yields the default
//! value with a warning.
use std::{
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
};

use serde::{Serialize, de::DeserializeOwned};
use tracing::warn;

use crate::models::{Product, Settings, sort_products};

pub const LIST_KEY: &str = "list";
pub const FAVORITES_KEY: &str = "favorites";
pub const SETTINGS_KEY: &str = "settings";

pub struct LocalCache {
    dir: PathBuf,
}

impl LocalCache {
    pub fn new(dir: &Path) -> Self {
        if let Err(e) = fs::create_dir_all(dir) {
            warn!("Failed to create data directory {}: {e}", dir.display());
        }
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn load_list(&self) -> Vec<Product> {
        let mut list: Vec<Product> = self.load(LIST_KEY);
        sort_products(&mut list);
        list
    }

    pub fn store_list(&self, list: &[Product]) {
        self.store(LIST_KEY, &list);
    }

    pub fn load_favorites(&self) -> Vec<Product> {
        self.load(FAVORITES_KEY)
    }

    pub fn store_favorites(&self, favorites: &[Product]) {
        self.store(FAVORITES_KEY, &favorites);
    }

    pub fn load_settings(&self) -> Settings {
        self.load(SETTINGS_KEY)
    }

    pub fn store_settings(&self, settings: &Settings) {
        self.store(SETTINGS_KEY, settings);
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn load<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        let path = self.path(key);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return T::default(),
        };

        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("Corrupt cache entry {key}, falling back to default: {e}");
            T::default()
        })
    }

    fn store<T: Serialize>(&self, key: &str, value: &T) {
        let raw = match serde_json::to_vec(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to serialize cache entry {key}: {e}");
                return;
            }
        };

        // Write-then-rename so a crash mid-write never leaves a torn file.
        let tmp = self.path(&format!("{key}.tmp"));
        let result = fs::write(&tmp, raw).and_then(|()| fs::rename(&tmp, self.path(key)));
        if let Err(e) = result {
            warn!("Failed to persist cache entry {key}: {e}");
        }
    }
}

/// Settings shared between the HTTP layer and the sync bridge, written through
/// to the cache on every change.
pub struct SettingsHandle {
    cache: std::sync::Arc<LocalCache>,
    current: RwLock<Settings>,
}

impl SettingsHandle {
    pub fn load(cache: std::sync::Arc<LocalCache>) -> Self {
        let current = RwLock::new(cache.load_settings());
        Self { cache, current }
    }

    pub fn get(&self) -> Settings {
        self.current.read().expect("settings lock poisoned").clone()
    }

    pub fn update(&self, apply: impl FnOnce(&mut Settings)) {
        let mut current = self.current.write().expect("settings lock poisoned");
        apply(&mut current);
        self.cache.store_settings(&current);
    }
}
