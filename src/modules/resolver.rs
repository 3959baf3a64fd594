//! Module resolvers: "given a location, produce a module".

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ResolveError;
use crate::modules::{Module, ModuleRegistry};
use crate::paths;

/// Resolves a module reference to a module.
#[async_trait]
pub trait ModuleResolver: Send + Sync {
    async fn resolve(&self, reference: &str) -> Result<Arc<dyn Module>, ResolveError>;
}

/// Resolves filesystem-style references against a [`ModuleRegistry`].
pub struct LocalResolver {
    registry: Arc<ModuleRegistry>,
}

impl LocalResolver {
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }
}

#[async_trait]
impl ModuleResolver for LocalResolver {
    async fn resolve(&self, reference: &str) -> Result<Arc<dyn Module>, ResolveError> {
        if paths::is_remote(reference) {
            return Err(ResolveError::Unsupported {
                reference: reference.to_string(),
            });
        }
        self.registry
            .get(reference)
            .await
            .ok_or_else(|| ResolveError::NotFound {
                reference: self.registry.key_for(reference).display().to_string(),
            })
    }
}

/// Dispatches on the reference form: URLs go to the remote resolver,
/// everything else to the local one.
#[derive(Default)]
pub struct SchemeResolver {
    local: Option<Arc<dyn ModuleResolver>>,
    remote: Option<Arc<dyn ModuleResolver>>,
}

impl SchemeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local(mut self, resolver: Arc<dyn ModuleResolver>) -> Self {
        self.local = Some(resolver);
        self
    }

    pub fn with_remote(mut self, resolver: Arc<dyn ModuleResolver>) -> Self {
        self.remote = Some(resolver);
        self
    }
}

#[async_trait]
impl ModuleResolver for SchemeResolver {
    async fn resolve(&self, reference: &str) -> Result<Arc<dyn Module>, ResolveError> {
        let target = if paths::is_remote(reference) {
            &self.remote
        } else {
            &self.local
        };
        match target {
            Some(resolver) => resolver.resolve(reference).await,
            None => Err(ResolveError::Unsupported {
                reference: reference.to_string(),
            }),
        }
    }
}
