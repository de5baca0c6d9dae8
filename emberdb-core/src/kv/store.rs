//! Stores and the engine-held store manager

use super::family::{Family, FamilyOptions};
use crate::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// A directory of families
pub struct Store {
    name: String,
    dir: PathBuf,
    families: RwLock<HashMap<String, Arc<Family>>>,
}

impl Store {
    /// Open or create the store directory
    pub fn open(root: &Path, name: &str) -> Result<Arc<Self>> {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir)?;
        info!(store = name, dir = %dir.display(), "opened kv store");
        Ok(Arc::new(Self {
            name: name.to_string(),
            dir,
            families: RwLock::new(HashMap::new()),
        }))
    }

    /// Store name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Get or create a family
    pub fn get_or_create_family(
        &self,
        name: &str,
        options: FamilyOptions,
    ) -> Result<Arc<Family>> {
        if let Some(family) = self.families.read().get(name) {
            return Ok(family.clone());
        }
        let mut families = self.families.write();
        if let Some(family) = families.get(name) {
            return Ok(family.clone());
        }
        let family = Family::open(&self.dir, name, options)?;
        families.insert(name.to_string(), family.clone());
        Ok(family)
    }

    /// Existing family, if open
    pub fn get_family(&self, name: &str) -> Option<Arc<Family>> {
        self.families.read().get(name).cloned()
    }

    /// Names of the open families
    pub fn family_names(&self) -> Vec<String> {
        self.families.read().keys().cloned().collect()
    }

    /// Run cleanup on every family
    pub fn cleanup(&self, ttl: Duration) {
        for family in self.families.read().values() {
            family.cleanup(ttl);
        }
    }

    /// Families with a compaction due
    pub fn families_needing_compaction(&self) -> Vec<Arc<Family>> {
        self.families
            .read()
            .values()
            .filter(|family| family.needs_compaction())
            .cloned()
            .collect()
    }
}

/// Engine-held registry of stores; replaces process-global state
pub struct StoreManager {
    root: PathBuf,
    stores: RwLock<HashMap<String, Arc<Store>>>,
}

impl StoreManager {
    /// Manager rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stores: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create a named store
    pub fn get_or_create_store(&self, name: &str) -> Result<Arc<Store>> {
        if let Some(store) = self.stores.read().get(name) {
            return Ok(store.clone());
        }
        let mut stores = self.stores.write();
        if let Some(store) = stores.get(name) {
            return Ok(store.clone());
        }
        let store = Store::open(&self.root, name)?;
        stores.insert(name.to_string(), store.clone());
        Ok(store)
    }

    /// Existing store, if open
    pub fn get_store(&self, name: &str) -> Option<Arc<Store>> {
        self.stores.read().get(name).cloned()
    }

    /// Names of the open stores
    pub fn store_names(&self) -> Vec<String> {
        self.stores.read().keys().cloned().collect()
    }

    /// All open stores
    pub fn stores(&self) -> Vec<Arc<Store>> {
        self.stores.read().values().cloned().collect()
    }
}
