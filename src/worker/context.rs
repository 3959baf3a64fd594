//! Execution contexts: isolated worker threads.
//!
//! Each context is a dedicated OS thread running its own single-threaded
//! runtime. The manager talks to it over two unidirectional channels
//! (requests in, events out) plus a control channel for termination. Only
//! owned byte frames cross these channels.

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::worker::adapter::Adapter;
use crate::worker::state::{ContextLifecycle, ContextState};

/// Identifier of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(u64);

impl ContextId {
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Messages from a context back to the manager.
#[derive(Debug)]
pub enum ContextEvent {
    /// Reply frame for the request in flight.
    Response { context_id: ContextId, frame: Vec<u8> },
    /// The context thread is exiting.
    Exited { context_id: ContextId, cause: ExitCause },
}

/// Why a context thread exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitCause {
    /// The manager asked it to stop.
    Terminated,
    /// The manager side of a channel went away.
    Disconnected,
    /// The thread failed on its own.
    Crashed(String),
}

impl fmt::Display for ExitCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminated => write!(f, "terminated"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Crashed(reason) => write!(f, "crashed: {reason}"),
        }
    }
}

/// A request the context could not take. Carries the frame back.
#[derive(Debug, thiserror::Error)]
#[error("{reason}")]
pub struct DispatchError {
    pub reason: String,
    pub frame: Vec<u8>,
}

#[derive(Debug)]
enum ContextControl {
    Terminate,
}

/// Manager-side handle to one execution context.
pub struct ExecutionContext {
    lifecycle: ContextLifecycle,
    request_tx: mpsc::UnboundedSender<Vec<u8>>,
    control_tx: mpsc::UnboundedSender<ContextControl>,
    thread: Option<JoinHandle<()>>,
}

impl ExecutionContext {
    /// Start a context thread.
    pub fn spawn(
        id: ContextId,
        adapter: Arc<Adapter>,
        events: mpsc::UnboundedSender<ContextEvent>,
        thread_name: String,
    ) -> std::io::Result<Self> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let thread = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || run_context(id, adapter, request_rx, control_rx, events))?;

        tracing::debug!(context_id = %id, "Spawned execution context");

        Ok(Self {
            lifecycle: ContextLifecycle::new(id),
            request_tx,
            control_tx,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> ContextId {
        self.lifecycle.context_id
    }

    pub fn state(&self) -> ContextState {
        self.lifecycle.state
    }

    pub fn lifecycle(&self) -> &ContextLifecycle {
        &self.lifecycle
    }

    /// Send one request frame. Only an idle context accepts work.
    pub fn dispatch(&mut self, frame: Vec<u8>) -> Result<(), DispatchError> {
        if !self.lifecycle.state.accepts_work() {
            return Err(DispatchError {
                reason: format!(
                    "Context {} is {} and cannot take a request",
                    self.id(),
                    self.lifecycle.state
                ),
                frame,
            });
        }
        if let Err(mpsc::error::SendError(frame)) = self.request_tx.send(frame) {
            return Err(DispatchError {
                reason: format!("Context {} is no longer running", self.id()),
                frame,
            });
        }
        self.lifecycle
            .transition_to(ContextState::Busy, None)
            .map_err(|reason| DispatchError {
                reason,
                frame: Vec::new(),
            })
    }

    /// Return a busy context to idle after its reply arrived.
    pub fn release(&mut self) -> Result<(), String> {
        self.lifecycle.transition_to(ContextState::Idle, None)
    }

    /// Ask the thread to stop and hand back its join handle.
    ///
    /// An in-flight invocation is dropped at its next suspension point.
    pub fn terminate(&mut self, reason: &str) -> Option<JoinHandle<()>> {
        let _ = self.control_tx.send(ContextControl::Terminate);
        if !self.lifecycle.state.is_terminal() {
            let _ = self
                .lifecycle
                .transition_to(ContextState::Terminated, Some(reason.to_string()));
        }
        self.thread.take()
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        let _ = self.control_tx.send(ContextControl::Terminate);
    }
}

/// Sends `Exited` however the thread leaves, including by panic.
struct ExitGuard {
    context_id: ContextId,
    events: mpsc::UnboundedSender<ContextEvent>,
    cause: ExitCause,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let cause = std::mem::replace(&mut self.cause, ExitCause::Terminated);
        let _ = self.events.send(ContextEvent::Exited {
            context_id: self.context_id,
            cause,
        });
    }
}

fn run_context(
    id: ContextId,
    adapter: Arc<Adapter>,
    mut request_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut control_rx: mpsc::UnboundedReceiver<ContextControl>,
    events: mpsc::UnboundedSender<ContextEvent>,
) {
    let mut guard = ExitGuard {
        context_id: id,
        events: events.clone(),
        cause: ExitCause::Crashed("context thread panicked".to_string()),
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            guard.cause = ExitCause::Crashed(format!("failed to build runtime: {e}"));
            return;
        }
    };

    tracing::debug!(context_id = %id, "Execution context started");

    let cause = runtime.block_on(serve(id, &adapter, &mut request_rx, &mut control_rx, events));

    // Abandon blocking calls that are still running instead of waiting on them.
    runtime.shutdown_background();

    tracing::debug!(context_id = %id, cause = %cause, "Execution context stopped");
    guard.cause = cause;
}

async fn serve(
    id: ContextId,
    adapter: &Adapter,
    request_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    control_rx: &mut mpsc::UnboundedReceiver<ContextControl>,
    events: mpsc::UnboundedSender<ContextEvent>,
) -> ExitCause {
    loop {
        tokio::select! {
            biased;

            control = control_rx.recv() => return control_exit(control),

            request = request_rx.recv() => {
                let Some(frame) = request else {
                    return ExitCause::Disconnected;
                };

                let reply = adapter.handle(&frame);
                tokio::pin!(reply);

                tokio::select! {
                    biased;

                    control = control_rx.recv() => return control_exit(control),

                    frame = &mut reply => {
                        let event = ContextEvent::Response { context_id: id, frame };
                        if events.send(event).is_err() {
                            return ExitCause::Disconnected;
                        }
                    }
                }
            }
        }
    }
}

fn control_exit(control: Option<ContextControl>) -> ExitCause {
    match control {
        Some(ContextControl::Terminate) => ExitCause::Terminated,
        None => ExitCause::Disconnected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, ResponseMessage};
    use crate::modules::{ExportTable, LocalResolver, ModuleRegistry};
    use crate::worker::task::{Task, TaskId};
    use serde_json::json;
    use std::time::Duration;

    const LIMIT: usize = 1024 * 1024;

    fn adapter() -> Arc<Adapter> {
        let registry = Arc::new(ModuleRegistry::new("/app"));
        registry.register_builtin(
            "./slow",
            Arc::new(
                ExportTable::new()
                    .function("double", |args| {
                        let n: i64 = crate::modules::param(&args, 0)?;
                        Ok(json!(n * 2))
                    })
                    .async_function("forever", |_args| async move {
                        futures::future::pending::<()>().await;
                        Ok::<_, anyhow::Error>(json!(null))
                    }),
            ),
        );
        Arc::new(Adapter::new(Arc::new(LocalResolver::new(registry)), LIMIT))
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ContextEvent>) -> ContextEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("context event timed out")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn serves_sequential_requests() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let id = ContextId::from_raw(1);
        let mut ctx =
            ExecutionContext::spawn(id, adapter(), events_tx, "test-ctx-1".into()).unwrap();
        assert_eq!(ctx.state(), ContextState::Idle);
        assert!(ctx.lifecycle().transitions.is_empty());

        for n in 1..=3 {
            let task_id = TaskId::new();
            let task = Task::new("slow", "double").args([json!(n)]);
            let frame = codec::encode(task_id, &task, LIMIT).unwrap();
            ctx.dispatch(frame).unwrap();
            assert_eq!(ctx.state(), ContextState::Busy);

            // A busy context refuses a second request.
            assert!(ctx.dispatch(Vec::new()).is_err());

            match next_event(&mut events_rx).await {
                ContextEvent::Response { context_id, frame } => {
                    assert_eq!(context_id, id);
                    let envelope = codec::decode(&frame).unwrap();
                    assert_eq!(envelope.task_id, task_id);
                    let expected = ResponseMessage::Success { message: json!(n * 2) };
                    assert_eq!(envelope.outcome, expected);
                }
                other => panic!("unexpected event {other:?}"),
            }
            ctx.release().unwrap();
        }
        assert_eq!(ctx.lifecycle().tasks_completed, 3);

        let handle = ctx.terminate("test done").unwrap();
        match next_event(&mut events_rx).await {
            ContextEvent::Exited { context_id, cause } => {
                assert_eq!(context_id, id);
                assert_eq!(cause, ExitCause::Terminated);
            }
            other => panic!("unexpected event {other:?}"),
        }
        handle.join().unwrap();
        assert_eq!(ctx.state(), ContextState::Terminated);
    }

    #[tokio::test]
    async fn terminate_interrupts_in_flight_request() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let id = ContextId::from_raw(2);
        let mut ctx =
            ExecutionContext::spawn(id, adapter(), events_tx, "test-ctx-2".into()).unwrap();

        let frame = codec::encode(TaskId::new(), &Task::new("slow", "forever"), LIMIT).unwrap();
        ctx.dispatch(frame).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let handle = ctx.terminate("deadline").unwrap();
        match next_event(&mut events_rx).await {
            ContextEvent::Exited { cause, .. } => assert_eq!(cause, ExitCause::Terminated),
            other => panic!("unexpected event {other:?}"),
        }
        handle.join().unwrap();
    }

    #[test]
    fn context_id_display() {
        assert_eq!(ContextId::from_raw(7).to_string(), "ctx-7");
    }
}
