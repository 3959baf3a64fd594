//! Remote modules served over HTTP.
//!
//! Wire contract with a module server:
//! - `GET <url>` returns the manifest `{"exports": [..], "constants": {..}}`
//! - `POST <url>/<name>` with `{"parameters": [..]}` returns
//!   `{"message": ..}` or `{"error": {"name", "message", "stack"}}`

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::Argument;
use crate::error::{ResolveError, ThrownError};
use crate::modules::{Binding, Export, Module, ModuleResolver};
use crate::paths;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves `http://` and `https://` module references.
#[derive(Clone)]
pub struct RemoteResolver {
    client: reqwest::Client,
}

impl RemoteResolver {
    pub fn new() -> reqwest::Result<Self> {
        // Pooled connections belong to the runtime that opened them, and
        // every execution context runs its own runtime.
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    exports: Vec<String>,
    #[serde(default)]
    constants: Map<String, Value>,
}

#[async_trait]
impl ModuleResolver for RemoteResolver {
    async fn resolve(&self, reference: &str) -> Result<Arc<dyn Module>, ResolveError> {
        if !paths::is_remote(reference) {
            return Err(ResolveError::Unsupported {
                reference: reference.to_string(),
            });
        }

        let response = self
            .client
            .get(reference)
            .send()
            .await
            .map_err(|e| ResolveError::Fetch {
                reference: reference.to_string(),
                reason: e.to_string(),
            })?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(ResolveError::NotFound {
                    reference: reference.to_string(),
                });
            }
            status => {
                return Err(ResolveError::Fetch {
                    reference: reference.to_string(),
                    reason: format!("HTTP {status}"),
                });
            }
        }

        let manifest: Manifest =
            response
                .json()
                .await
                .map_err(|e| ResolveError::InvalidManifest {
                    reference: reference.to_string(),
                    reason: e.to_string(),
                })?;

        tracing::debug!(
            module = %reference,
            exports = manifest.exports.len(),
            "Resolved remote module"
        );

        Ok(Arc::new(RemoteModule {
            url: reference.trim_end_matches('/').to_string(),
            exports: manifest.exports.into_iter().collect(),
            constants: manifest.constants,
            client: self.client.clone(),
        }))
    }
}

/// A module whose exports are invoked over HTTP.
pub struct RemoteModule {
    url: String,
    exports: HashSet<String>,
    constants: Map<String, Value>,
    client: reqwest::Client,
}

impl Module for RemoteModule {
    fn get(&self, name: &str) -> Option<Binding> {
        if self.exports.contains(name) {
            return Some(Binding::Function(Arc::new(RemoteExport {
                endpoint: format!("{}/{}", self.url, name),
                client: self.client.clone(),
            })));
        }
        self.constants.get(name).cloned().map(Binding::Value)
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .exports
            .iter()
            .chain(self.constants.keys())
            .cloned()
            .collect();
        names.sort();
        names
    }
}

struct RemoteExport {
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct InvokeRequest<'a> {
    parameters: &'a [Argument],
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    name: String,
    message: String,
    #[serde(default)]
    stack: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InvokeResponse {
    Failure { error: RemoteError },
    Success { message: Value },
}

#[async_trait]
impl Export for RemoteExport {
    async fn invoke(&self, args: Vec<Argument>) -> anyhow::Result<Value> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&InvokeRequest { parameters: &args })
            .send()
            .await
            .with_context(|| format!("calling remote export {}", self.endpoint))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("reading reply from {}", self.endpoint))?;

        match serde_json::from_str::<InvokeResponse>(&body) {
            Ok(InvokeResponse::Success { message }) if status.is_success() => Ok(message),
            Ok(InvokeResponse::Failure { error }) => {
                let mut thrown = ThrownError::new(error.name, error.message);
                thrown.stack = error.stack;
                Err(thrown.into())
            }
            _ => Err(anyhow::anyhow!(
                "remote export {} returned HTTP {status}",
                self.endpoint
            )),
        }
    }
}
