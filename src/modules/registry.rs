//! Module registry: the local module loader.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::modules::Module;
use crate::paths;

/// Registry of in-process modules keyed by normalized path.
pub struct ModuleRegistry {
    base_dir: PathBuf,
    modules: RwLock<HashMap<PathBuf, Arc<dyn Module>>>,
    /// Paths registered as built-in (protected from shadowing).
    builtin_paths: RwLock<HashSet<PathBuf>>,
}

impl ModuleRegistry {
    /// Create an empty registry resolving relative references against `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            modules: RwLock::new(HashMap::new()),
            builtin_paths: RwLock::new(HashSet::new()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Normalize a reference the way lookups do.
    pub fn key_for(&self, reference: &str) -> PathBuf {
        paths::normalize(&self.base_dir, reference)
    }

    /// Register a module. Returns false if it would shadow a built-in module.
    pub async fn register(&self, reference: &str, module: Arc<dyn Module>) -> bool {
        let key = self.key_for(reference);
        if self.builtin_paths.read().await.contains(&key) {
            tracing::warn!(
                module = %key.display(),
                "Rejected module registration: would shadow a built-in module"
            );
            return false;
        }
        self.modules.write().await.insert(key.clone(), module);
        tracing::debug!(module = %key.display(), "Registered module");
        true
    }

    /// Register a built-in module (sync version for startup).
    ///
    /// Returns `false` without registering anything if the registry is
    /// locked by a concurrent reader or writer.
    pub fn register_builtin(&self, reference: &str, module: Arc<dyn Module>) -> bool {
        let key = self.key_for(reference);
        let (Ok(mut modules), Ok(mut builtins)) =
            (self.modules.try_write(), self.builtin_paths.try_write())
        else {
            tracing::warn!(
                module = %key.display(),
                "Skipped built-in module registration: registry is locked"
            );
            return false;
        };
        modules.insert(key.clone(), module);
        builtins.insert(key.clone());
        tracing::debug!(module = %key.display(), "Registered built-in module");
        true
    }

    /// Remove a module. Built-in modules stay put.
    pub async fn unregister(&self, reference: &str) -> Option<Arc<dyn Module>> {
        let key = self.key_for(reference);
        if self.builtin_paths.read().await.contains(&key) {
            return None;
        }
        self.modules.write().await.remove(&key)
    }

    /// Look up a module by reference.
    pub async fn get(&self, reference: &str) -> Option<Arc<dyn Module>> {
        let key = self.key_for(reference);
        self.modules.read().await.get(&key).cloned()
    }

    pub async fn has(&self, reference: &str) -> bool {
        let key = self.key_for(reference);
        self.modules.read().await.contains_key(&key)
    }

    /// List registered module paths.
    pub async fn list(&self) -> Vec<PathBuf> {
        let mut keys: Vec<PathBuf> = self.modules.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn count(&self) -> usize {
        self.modules.try_read().map(|m| m.len()).unwrap_or(0)
    }
}
