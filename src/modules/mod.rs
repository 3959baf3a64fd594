//! Modules and their exports.
//!
//! A module is anything that can answer "which callable is bound to this
//! name". Resolvers turn a module reference into a module; the execution
//! context then looks up and invokes the named export.

pub mod builtin;
pub mod registry;
pub mod remote;
pub mod resolver;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::codec::Argument;

pub use registry::ModuleRegistry;
pub use remote::RemoteResolver;
pub use resolver::{LocalResolver, ModuleResolver, SchemeResolver};

/// A callable export.
#[async_trait]
pub trait Export: Send + Sync {
    /// Invoke with positional arguments.
    async fn invoke(&self, args: Vec<Argument>) -> anyhow::Result<Value>;
}

/// A value bound to a name in a module.
#[derive(Clone)]
pub enum Binding {
    Function(Arc<dyn Export>),
    /// Present but not callable.
    Value(Value),
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Function(_) => f.write_str("Function(..)"),
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
        }
    }
}

/// A resolved module.
pub trait Module: Send + Sync {
    /// Look up a binding by name.
    fn get(&self, name: &str) -> Option<Binding>;

    /// Names of all bindings.
    fn names(&self) -> Vec<String>;
}

/// A synchronous function export. Runs on the blocking pool of the owning
/// context so a long computation does not stall termination.
pub struct SyncFn<F>(Arc<F>);

impl<F> SyncFn<F>
where
    F: Fn(Vec<Argument>) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self(Arc::new(f))
    }
}

#[async_trait]
impl<F> Export for SyncFn<F>
where
    F: Fn(Vec<Argument>) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    async fn invoke(&self, args: Vec<Argument>) -> anyhow::Result<Value> {
        let f = Arc::clone(&self.0);
        match tokio::task::spawn_blocking(move || f(args)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(anyhow::anyhow!("blocking call did not complete: {e}")),
        }
    }
}

/// An asynchronous function export.
pub struct AsyncFn<F>(F);

impl<F> AsyncFn<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Export for AsyncFn<F>
where
    F: Fn(Vec<Argument>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn invoke(&self, args: Vec<Argument>) -> anyhow::Result<Value> {
        (self.0)(args).await
    }
}

/// In-process module built from closures and constants.
#[derive(Clone, Default)]
pub struct ExportTable {
    bindings: HashMap<String, Binding>,
}

impl ExportTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a synchronous function.
    pub fn function<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Argument>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.export(name, Arc::new(SyncFn::new(f)))
    }

    /// Bind an asynchronous function.
    pub fn async_function<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Argument>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.export(name, Arc::new(AsyncFn::new(f)))
    }

    /// Bind any export implementation.
    pub fn export(mut self, name: impl Into<String>, export: Arc<dyn Export>) -> Self {
        self.bindings.insert(name.into(), Binding::Function(export));
        self
    }

    /// Bind a non-callable value.
    pub fn constant(mut self, name: impl Into<String>, value: Value) -> Self {
        self.bindings.insert(name.into(), Binding::Value(value));
        self
    }
}

impl Module for ExportTable {
    fn get(&self, name: &str) -> Option<Binding> {
        self.bindings.get(name).cloned()
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bindings.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Extract and deserialize the positional argument at `index`.
pub fn param<T: DeserializeOwned>(args: &[Argument], index: usize) -> anyhow::Result<T> {
    let raw = args
        .get(index)
        .with_context(|| format!("missing argument {index}"))?;
    serde_json::from_value(raw.clone())
        .with_context(|| format!("argument {index} has the wrong type"))
}
