//! Execution context adapter: turns request frames into response frames.
//!
//! Every request ends in exactly one reply: resolution failures, missing
//! exports, errors returned by the target and panics inside it are all
//! projected into a `Failure` response.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde::Deserialize;

use crate::codec::{self, RequestMessage, ResponseMessage};
use crate::error::{ErrorKind, ErrorRecord};
use crate::modules::{Binding, ModuleResolver};
use crate::worker::task::TaskId;

/// Runs inside an execution context. Holds no per-task state.
pub struct Adapter {
    resolver: Arc<dyn ModuleResolver>,
    max_message_bytes: usize,
}

impl Adapter {
    pub fn new(resolver: Arc<dyn ModuleResolver>, max_message_bytes: usize) -> Self {
        Self {
            resolver,
            max_message_bytes,
        }
    }

    /// Handle one request frame and produce its reply frame.
    pub async fn handle(&self, frame: &[u8]) -> Vec<u8> {
        let request = match codec::decode_request(frame) {
            Ok(request) => request,
            Err(e) => {
                let task_id = peek_task_id(frame);
                tracing::warn!(task_id = %task_id, error = %e, "Undecodable request");
                return codec::reply_frame(
                    task_id,
                    ResponseMessage::Failure {
                        error: ErrorRecord::serialization(e.to_string()),
                    },
                    self.max_message_bytes,
                );
            }
        };

        let task_id = request.task_id;
        let start = Instant::now();
        let module = request.module_reference.clone();
        let export = request.tasker_name.clone();

        let outcome = match AssertUnwindSafe(self.execute(request)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => ResponseMessage::Failure {
                error: panic_record(payload),
            },
        };

        match &outcome {
            ResponseMessage::Success { .. } => tracing::debug!(
                task_id = %task_id,
                module = %module,
                export = %export,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Invocation succeeded"
            ),
            ResponseMessage::Failure { error } => tracing::debug!(
                task_id = %task_id,
                module = %module,
                export = %export,
                elapsed_ms = start.elapsed().as_millis() as u64,
                kind = %error.kind,
                error = %error.message,
                "Invocation failed"
            ),
        }

        codec::reply_frame(task_id, outcome, self.max_message_bytes)
    }

    async fn execute(&self, request: RequestMessage) -> ResponseMessage {
        let module = match self.resolver.resolve(&request.module_reference).await {
            Ok(module) => module,
            Err(e) => {
                return ResponseMessage::Failure {
                    error: ErrorRecord::module_resolution(&e),
                };
            }
        };

        let export = match module.get(&request.tasker_name) {
            Some(Binding::Function(f)) => f,
            Some(Binding::Value(_)) => {
                return ResponseMessage::Failure {
                    error: ErrorRecord::export_not_found(
                        &request.module_reference,
                        &request.tasker_name,
                        "is not callable",
                    ),
                };
            }
            None => {
                return ResponseMessage::Failure {
                    error: ErrorRecord::export_not_found(
                        &request.module_reference,
                        &request.tasker_name,
                        "does not exist",
                    ),
                };
            }
        };

        match export.invoke(request.parameters).await {
            Ok(message) => ResponseMessage::Success { message },
            Err(e) => ResponseMessage::Failure {
                error: ErrorRecord::from_thrown(&e),
            },
        }
    }
}

/// Best-effort recovery of the task id from a frame that failed to decode.
fn peek_task_id(frame: &[u8]) -> TaskId {
    #[derive(Deserialize)]
    struct Probe {
        task_id: TaskId,
    }
    serde_json::from_slice::<Probe>(frame)
        .map(|p| p.task_id)
        .unwrap_or_else(|_| TaskId::nil())
}

fn panic_record(payload: Box<dyn Any + Send>) -> ErrorRecord {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    };
    ErrorRecord::new(ErrorKind::Execution, "Panic", message)
}
