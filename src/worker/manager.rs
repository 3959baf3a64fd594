//! Tasker manager: pool of execution contexts behind a single control loop.
//!
//! `Tasker` is a cheap handle. All bookkeeping (context table, idle pool,
//! FIFO queue, in-flight correlation) is owned by one spawned task that
//! processes commands from handles and events from contexts in turn, so no
//! locks guard it.
//!
//! Callbacks run on the control loop. Keep them short; hand heavy work off
//! to another task.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::codec;
use crate::config::TaskerConfig;
use crate::error::{ConfigError, ErrorRecord, ManagerError, TaskError};
use crate::modules::ModuleResolver;
use crate::worker::adapter::Adapter;
use crate::worker::context::{ContextEvent, ContextId, ExecutionContext};
use crate::worker::task::{Task, TaskId, TaskResult, TaskerCallback};

/// How long shutdown waits for terminated context threads to exit.
const CONTEXT_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Wake-up used when nothing has a deadline.
const IDLE_WAKE: Duration = Duration::from_secs(3600);

/// Result of [`Tasker::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The task was still queued and has been removed.
    Dequeued,
    /// The task was running; its context is being terminated.
    Terminating,
    /// No queued or running task has this id.
    NotFound,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub live_contexts: usize,
    pub idle_contexts: usize,
    pub busy_contexts: usize,
    pub queued_tasks: usize,
    /// Highest number of simultaneously busy contexts so far.
    pub peak_busy: usize,
    /// Tasks settled with a value.
    pub completed: u64,
    /// Tasks settled with an error.
    pub failed: u64,
}

/// Summary of a completed shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Queued tasks failed with `TaskCancelled`.
    pub cancelled: usize,
    /// In-flight tasks still running when the grace period ended.
    pub terminated: usize,
    /// Context threads joined.
    pub contexts_joined: usize,
    pub completed: u64,
    pub failed: u64,
}

enum Command {
    Submit(Pending),
    Cancel {
        task_id: TaskId,
        reply: oneshot::Sender<CancelOutcome>,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    Shutdown {
        grace: Duration,
        reply: oneshot::Sender<Result<ShutdownReport, ManagerError>>,
    },
}

/// An encoded task waiting for (or holding) a context.
struct Pending {
    task_id: TaskId,
    frame: Vec<u8>,
    timeout: Option<Duration>,
    module: String,
    export: String,
    callback: Option<TaskerCallback>,
    submitted_at: Instant,
}

struct InFlight {
    pending: Pending,
    deadline: Option<(Instant, Duration)>,
}

struct ShutdownState {
    deadline: Instant,
    repliers: Vec<oneshot::Sender<Result<ShutdownReport, ManagerError>>>,
    cancelled: usize,
}

/// Handle to a running manager.
#[derive(Clone)]
pub struct Tasker {
    commands: mpsc::UnboundedSender<Command>,
    max_message_bytes: usize,
    shutdown_grace: Duration,
}

impl Tasker {
    /// Validate the config and spawn the control loop on the current runtime.
    pub fn start(
        config: TaskerConfig,
        resolver: Arc<dyn ModuleResolver>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tracing::info!(
            max_contexts = config.max_concurrent_contexts,
            context_reuse = config.context_reuse,
            default_timeout_ms = config.default_timeout.map(|t| t.as_millis() as u64),
            "Starting Tasker"
        );

        let handle = Self {
            commands: commands_tx,
            max_message_bytes: config.max_message_bytes,
            shutdown_grace: config.shutdown_grace_period,
        };

        let adapter = Arc::new(Adapter::new(resolver, config.max_message_bytes));
        let pool = Pool::new(config, adapter, events_tx);
        tokio::spawn(pool.run(commands_rx, events_rx));

        Ok(handle)
    }

    /// Submit a task; `callback` receives its outcome exactly once.
    ///
    /// Parameters that cannot be encoded fail the task before this returns.
    pub fn run<F>(&self, task: Task, callback: F) -> TaskId
    where
        F: FnOnce(TaskResult) + Send + 'static,
    {
        self.submit(task, Some(Box::new(callback)))
    }

    /// Submit a task nobody waits on. Its outcome is only logged.
    pub fn run_detached(&self, task: Task) -> TaskId {
        self.submit(task, None)
    }

    /// Submit a task and wait for its outcome.
    pub async fn call(&self, task: Task) -> TaskResult {
        let (tx, rx) = oneshot::channel();
        self.run(task, move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or_else(|_| {
            Err(ErrorRecord::context_terminated("Tasker stopped before the task completed").into())
        })
    }

    /// Cancel a queued or running task.
    pub async fn cancel(&self, task_id: TaskId) -> CancelOutcome {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Cancel { task_id, reply }).is_err() {
            return CancelOutcome::NotFound;
        }
        rx.await.unwrap_or(CancelOutcome::NotFound)
    }

    pub async fn stats(&self) -> Result<PoolStats, ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats { reply })
            .map_err(|_| ManagerError::Stopped)?;
        rx.await.map_err(|_| ManagerError::Stopped)
    }

    /// Shut down using the configured grace period.
    pub async fn shutdown(&self) -> Result<ShutdownReport, ManagerError> {
        self.shutdown_with_grace(self.shutdown_grace).await
    }

    /// Stop accepting tasks, cancel queued ones, give in-flight tasks up to
    /// `grace` to finish, then terminate every context.
    ///
    /// Concurrent calls all receive the same result. Calls after the
    /// manager has stopped return [`ManagerError::Stopped`].
    pub async fn shutdown_with_grace(
        &self,
        grace: Duration,
    ) -> Result<ShutdownReport, ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { grace, reply })
            .map_err(|_| ManagerError::Stopped)?;
        rx.await.map_err(|_| ManagerError::Stopped)?
    }

    /// Whether the control loop is still running.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    fn submit(&self, task: Task, callback: Option<TaskerCallback>) -> TaskId {
        let task_id = TaskId::new();

        let frame = match codec::encode(task_id, &task, self.max_message_bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(
                    task_id = %task_id,
                    module = %task.module_reference,
                    export = %task.tasker_name,
                    error = %e,
                    "Task parameters cannot be sent"
                );
                deliver(
                    task_id,
                    callback,
                    Err(ErrorRecord::serialization(e.to_string()).into()),
                );
                return task_id;
            }
        };

        let pending = Pending {
            task_id,
            frame,
            timeout: task.timeout,
            module: task.module_reference,
            export: task.tasker_name,
            callback,
            submitted_at: Instant::now(),
        };

        if let Err(mpsc::error::SendError(Command::Submit(pending))) =
            self.commands.send(Command::Submit(pending))
        {
            tracing::debug!(task_id = %task_id, "Task submitted after the manager stopped");
            deliver(task_id, pending.callback, Err(ErrorRecord::rejected().into()));
        }

        task_id
    }
}

/// Hand an outcome to its callback, or log it for detached tasks.
fn deliver(task_id: TaskId, callback: Option<TaskerCallback>, result: TaskResult) {
    match callback {
        Some(callback) => {
            if std::panic::catch_unwind(AssertUnwindSafe(move || callback(result))).is_err() {
                tracing::error!(task_id = %task_id, "Task callback panicked");
            }
        }
        None => match result {
            Ok(_) => tracing::debug!(task_id = %task_id, "Detached task completed"),
            Err(e) => tracing::warn!(task_id = %task_id, error = %e, "Detached task failed"),
        },
    }
}

enum Acquire {
    Ready(ContextId),
    Full,
    SpawnFailed(std::io::Error),
}

/// State owned by the control loop.
struct Pool {
    config: TaskerConfig,
    adapter: Arc<Adapter>,
    events_tx: mpsc::UnboundedSender<ContextEvent>,
    contexts: HashMap<ContextId, ExecutionContext>,
    /// Idle contexts, most recently released last.
    idle: Vec<ContextId>,
    queue: VecDeque<Pending>,
    in_flight: HashMap<ContextId, InFlight>,
    /// Threads of terminated contexts not yet joined.
    exiting: Vec<JoinHandle<()>>,
    next_context_id: u64,
    peak_busy: usize,
    completed: u64,
    failed: u64,
    shutdown: Option<ShutdownState>,
}

impl Pool {
    fn new(
        config: TaskerConfig,
        adapter: Arc<Adapter>,
        events_tx: mpsc::UnboundedSender<ContextEvent>,
    ) -> Self {
        Self {
            config,
            adapter,
            events_tx,
            contexts: HashMap::new(),
            idle: Vec::new(),
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
            exiting: Vec::new(),
            next_context_id: 1,
            peak_busy: 0,
            completed: 0,
            failed: 0,
            shutdown: None,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<ContextEvent>,
    ) {
        let mut handles_open = true;

        loop {
            if self.should_stop(handles_open) {
                break;
            }

            let wake = self
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + IDLE_WAKE);

            tokio::select! {
                command = commands.recv(), if handles_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        tracing::debug!("All Tasker handles dropped, draining remaining work");
                        handles_open = false;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
                _ = tokio::time::sleep_until(wake) => {}
            }

            self.expire_overdue();
        }

        let repliers = self
            .shutdown
            .as_mut()
            .map(|s| std::mem::take(&mut s.repliers))
            .unwrap_or_default();

        let result = self.finish().await;
        match &result {
            Ok(report) => tracing::info!(
                cancelled = report.cancelled,
                terminated = report.terminated,
                contexts_joined = report.contexts_joined,
                "Tasker stopped"
            ),
            Err(e) => tracing::error!(error = %e, "Tasker stopped with errors"),
        }

        // Late commands get a definite answer instead of a dropped reply.
        commands.close();
        while let Ok(command) = commands.try_recv() {
            match command {
                Command::Submit(pending) => {
                    self.settle(pending, Err(ErrorRecord::rejected().into()));
                }
                Command::Cancel { reply, .. } => {
                    let _ = reply.send(CancelOutcome::NotFound);
                }
                Command::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
                Command::Shutdown { reply, .. } => {
                    let _ = reply.send(result.clone());
                }
            }
        }

        for reply in repliers {
            let _ = reply.send(result.clone());
        }
    }

    fn should_stop(&self, handles_open: bool) -> bool {
        if let Some(shutdown) = &self.shutdown {
            return self.in_flight.is_empty() || Instant::now() >= shutdown.deadline;
        }
        !handles_open && self.queue.is_empty() && self.in_flight.is_empty()
    }

    fn next_deadline(&self) -> Option<Instant> {
        let task_deadline = self
            .in_flight
            .values()
            .filter_map(|f| f.deadline.map(|(at, _)| at))
            .min();
        let shutdown_deadline = self.shutdown.as_ref().map(|s| s.deadline);
        match (task_deadline, shutdown_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit(pending) => {
                if self.shutdown.is_some() {
                    tracing::debug!(task_id = %pending.task_id, "Rejecting task during shutdown");
                    self.settle(pending, Err(ErrorRecord::rejected().into()));
                    return;
                }
                tracing::debug!(
                    task_id = %pending.task_id,
                    module = %pending.module,
                    export = %pending.export,
                    "Task queued"
                );
                self.queue.push_back(pending);
                self.drain_queue();
            }
            Command::Cancel { task_id, reply } => {
                let _ = reply.send(self.cancel(task_id));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown { grace, reply } => self.begin_shutdown(grace, reply),
        }
    }

    fn handle_event(&mut self, event: ContextEvent) {
        match event {
            ContextEvent::Response { context_id, frame } => {
                self.on_response(context_id, frame);
            }
            ContextEvent::Exited { context_id, cause } => {
                if let Some(mut context) = self.contexts.remove(&context_id) {
                    tracing::warn!(
                        context_id = %context_id,
                        cause = %cause,
                        state = %context.state(),
                        "Execution context exited unexpectedly"
                    );
                    self.idle.retain(|id| *id != context_id);
                    if let Some(thread) = context.terminate("exited unexpectedly") {
                        self.exiting.push(thread);
                    }
                    if let Some(flight) = self.in_flight.remove(&context_id) {
                        self.settle(
                            flight.pending,
                            Err(ErrorRecord::context_terminated(format!(
                                "Execution context {context_id} exited ({cause}) \
                                 while running the task"
                            ))
                            .into()),
                        );
                    }
                } else {
                    tracing::debug!(
                        context_id = %context_id,
                        cause = %cause,
                        "Execution context exited"
                    );
                }
                self.exiting.retain(|thread| !thread.is_finished());
                self.drain_queue();
            }
        }
    }

    fn on_response(&mut self, context_id: ContextId, frame: Vec<u8>) {
        let Some(flight) = self.in_flight.remove(&context_id) else {
            tracing::warn!(context_id = %context_id, "Ignoring response with no task in flight");
            return;
        };
        let task_id = flight.pending.task_id;

        match codec::decode(&frame) {
            Ok(envelope) if envelope.task_id == task_id => {
                let result = match envelope.outcome {
                    codec::ResponseMessage::Success { message } => Ok(message),
                    codec::ResponseMessage::Failure { error } => Err(error.into()),
                };
                self.release(context_id);
                self.settle(flight.pending, result);
            }
            Ok(envelope) => {
                tracing::warn!(
                    context_id = %context_id,
                    expected = %task_id,
                    received = %envelope.task_id,
                    "Response correlated to a different task"
                );
                self.retire(context_id, "mismatched response");
                self.settle(
                    flight.pending,
                    Err(ErrorRecord::serialization(format!(
                        "Response from {context_id} answered task {} instead",
                        envelope.task_id
                    ))
                    .into()),
                );
            }
            Err(e) => {
                tracing::warn!(
                    context_id = %context_id,
                    task_id = %task_id,
                    error = %e,
                    "Undecodable response"
                );
                self.release(context_id);
                self.settle(flight.pending, Err(ErrorRecord::serialization(e.to_string()).into()));
            }
        }

        self.drain_queue();
    }

    /// Dispatch queued tasks while contexts are available.
    fn drain_queue(&mut self) {
        if self.shutdown.is_some() {
            return;
        }

        while let Some(mut pending) = self.queue.pop_front() {
            let context_id = match self.acquire_context() {
                Acquire::Ready(id) => id,
                Acquire::Full => {
                    self.queue.push_front(pending);
                    return;
                }
                Acquire::SpawnFailed(e) => {
                    tracing::error!(
                        task_id = %pending.task_id,
                        error = %e,
                        "Failed to start execution context"
                    );
                    self.settle(
                        pending,
                        Err(ErrorRecord::context_terminated(format!(
                            "Failed to start an execution context: {e}"
                        ))
                        .into()),
                    );
                    continue;
                }
            };

            let Some(context) = self.contexts.get_mut(&context_id) else {
                self.queue.push_front(pending);
                return;
            };

            let frame = std::mem::take(&mut pending.frame);
            match context.dispatch(frame) {
                Ok(()) => {
                    let deadline = pending
                        .timeout
                        .or(self.config.default_timeout)
                        .map(|limit| (Instant::now() + limit, limit));
                    tracing::debug!(
                        task_id = %pending.task_id,
                        context_id = %context_id,
                        module = %pending.module,
                        export = %pending.export,
                        "Dispatched task"
                    );
                    self.in_flight.insert(context_id, InFlight { pending, deadline });
                    self.peak_busy = self.peak_busy.max(self.in_flight.len());
                }
                Err(e) => {
                    tracing::warn!(context_id = %context_id, error = %e, "Dispatch failed");
                    pending.frame = e.frame;
                    self.retire(context_id, "dispatch failed");
                    self.queue.push_front(pending);
                    // The context's exit event drains again.
                    return;
                }
            }
        }
    }

    fn acquire_context(&mut self) -> Acquire {
        if let Some(id) = self.idle.pop() {
            return Acquire::Ready(id);
        }
        if self.contexts.len() >= self.config.max_concurrent_contexts {
            return Acquire::Full;
        }

        let id = ContextId::from_raw(self.next_context_id);
        self.next_context_id += 1;
        let thread_name = format!("{}-{}", self.config.thread_name_prefix, id.get());

        let spawned =
            ExecutionContext::spawn(id, self.adapter.clone(), self.events_tx.clone(), thread_name);
        match spawned {
            Ok(context) => {
                self.contexts.insert(id, context);
                Acquire::Ready(id)
            }
            Err(e) => Acquire::SpawnFailed(e),
        }
    }

    /// Return a context to the idle pool, or retire it when reuse is off.
    fn release(&mut self, context_id: ContextId) {
        if !self.config.context_reuse {
            self.retire(context_id, "context reuse disabled");
            return;
        }
        if self.shutdown.is_some() {
            self.retire(context_id, "shutting down");
            return;
        }
        let Some(context) = self.contexts.get_mut(&context_id) else {
            return;
        };
        match context.release() {
            Ok(()) => self.idle.push(context_id),
            Err(e) => {
                tracing::warn!(context_id = %context_id, error = %e, "Cannot release context");
                self.retire(context_id, "invalid release");
            }
        }
    }

    /// Terminate a context and drop it from the pool.
    fn retire(&mut self, context_id: ContextId, reason: &str) {
        self.idle.retain(|id| *id != context_id);
        if let Some(mut context) = self.contexts.remove(&context_id) {
            tracing::debug!(
                context_id = %context_id,
                reason,
                tasks_completed = context.lifecycle().tasks_completed,
                "Retiring execution context"
            );
            if let Some(thread) = context.terminate(reason) {
                self.exiting.push(thread);
            }
        }
    }

    /// Fail in-flight tasks whose deadline has passed.
    fn expire_overdue(&mut self) {
        let now = Instant::now();
        let overdue: Vec<ContextId> = self
            .in_flight
            .iter()
            .filter(|(_, flight)| flight.deadline.is_some_and(|(at, _)| at <= now))
            .map(|(id, _)| *id)
            .collect();

        if overdue.is_empty() {
            return;
        }

        for context_id in overdue {
            let Some(flight) = self.in_flight.remove(&context_id) else {
                continue;
            };
            let limit = flight.deadline.map(|(_, limit)| limit).unwrap_or_default();
            tracing::warn!(
                task_id = %flight.pending.task_id,
                context_id = %context_id,
                module = %flight.pending.module,
                export = %flight.pending.export,
                timeout_ms = limit.as_millis() as u64,
                "Task timed out"
            );
            self.retire(context_id, "task timed out");
            self.settle(flight.pending, Err(ErrorRecord::timeout(limit.as_millis()).into()));
        }

        self.drain_queue();
    }

    fn cancel(&mut self, task_id: TaskId) -> CancelOutcome {
        if let Some(index) = self.queue.iter().position(|p| p.task_id == task_id) {
            if let Some(pending) = self.queue.remove(index) {
                tracing::debug!(task_id = %task_id, "Cancelled queued task");
                self.settle(
                    pending,
                    Err(ErrorRecord::cancelled(format!(
                        "Task {task_id} was cancelled before dispatch"
                    ))
                    .into()),
                );
            }
            return CancelOutcome::Dequeued;
        }

        let running = self
            .in_flight
            .iter()
            .find(|(_, flight)| flight.pending.task_id == task_id)
            .map(|(id, _)| *id);

        let Some(context_id) = running else {
            return CancelOutcome::NotFound;
        };

        if let Some(flight) = self.in_flight.remove(&context_id) {
            tracing::info!(task_id = %task_id, context_id = %context_id, "Cancelling running task");
            self.retire(context_id, "task cancelled");
            self.settle(
                flight.pending,
                Err(ErrorRecord::context_terminated(format!(
                    "Task {task_id} was cancelled while running and its context terminated"
                ))
                .into()),
            );
        }
        self.drain_queue();
        CancelOutcome::Terminating
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            live_contexts: self.contexts.len(),
            idle_contexts: self.idle.len(),
            busy_contexts: self.in_flight.len(),
            queued_tasks: self.queue.len(),
            peak_busy: self.peak_busy,
            completed: self.completed,
            failed: self.failed,
        }
    }

    fn begin_shutdown(
        &mut self,
        grace: Duration,
        reply: oneshot::Sender<Result<ShutdownReport, ManagerError>>,
    ) {
        if let Some(shutdown) = &mut self.shutdown {
            shutdown.repliers.push(reply);
            return;
        }

        tracing::info!(
            queued = self.queue.len(),
            in_flight = self.in_flight.len(),
            grace_ms = grace.as_millis() as u64,
            "Shutting down Tasker"
        );

        let queued: Vec<Pending> = self.queue.drain(..).collect();
        let cancelled = queued.len();
        for pending in queued {
            self.settle(pending, Err(not_dispatched()));
        }

        for context_id in std::mem::take(&mut self.idle) {
            self.retire(context_id, "shutting down");
        }

        self.shutdown = Some(ShutdownState {
            deadline: Instant::now() + grace,
            repliers: vec![reply],
            cancelled,
        });
    }

    /// Terminate whatever is left and join every context thread.
    async fn finish(&mut self) -> Result<ShutdownReport, ManagerError> {
        let mut report = ShutdownReport {
            cancelled: self.shutdown.as_ref().map(|s| s.cancelled).unwrap_or(0),
            ..ShutdownReport::default()
        };

        let queued: Vec<Pending> = self.queue.drain(..).collect();
        report.cancelled += queued.len();
        for pending in queued {
            self.settle(pending, Err(not_dispatched()));
        }

        let stragglers: Vec<(ContextId, InFlight)> = self.in_flight.drain().collect();
        report.terminated = stragglers.len();
        for (context_id, flight) in stragglers {
            tracing::warn!(
                task_id = %flight.pending.task_id,
                context_id = %context_id,
                "Terminating task still running at shutdown"
            );
            let record =
                ErrorRecord::context_terminated("Tasker shut down before the task completed");
            self.settle(flight.pending, Err(record.into()));
        }

        let remaining: Vec<ContextId> = self.contexts.keys().copied().collect();
        for context_id in remaining {
            self.retire(context_id, "shutdown");
        }

        let threads = std::mem::take(&mut self.exiting);
        let (joined, unresponsive) = join_contexts(threads, CONTEXT_EXIT_TIMEOUT).await;
        report.contexts_joined = joined;
        report.completed = self.completed;
        report.failed = self.failed;

        if unresponsive > 0 {
            return Err(ManagerError::ContextsUnresponsive {
                count: unresponsive,
            });
        }
        Ok(report)
    }

    fn settle(&mut self, pending: Pending, result: TaskResult) {
        let elapsed_ms = pending.submitted_at.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => {
                self.completed += 1;
                tracing::debug!(task_id = %pending.task_id, elapsed_ms, "Task completed");
            }
            Err(e) => {
                self.failed += 1;
                tracing::debug!(
                    task_id = %pending.task_id,
                    elapsed_ms,
                    kind = %e.kind(),
                    "Task failed"
                );
            }
        }
        deliver(pending.task_id, pending.callback, result);
    }
}

fn not_dispatched() -> TaskError {
    ErrorRecord::cancelled("Tasker shut down before the task was dispatched").into()
}

/// Join finished threads until all are done or `timeout` passes.
/// Returns (joined, still running).
async fn join_contexts(mut threads: Vec<JoinHandle<()>>, timeout: Duration) -> (usize, usize) {
    let deadline = Instant::now() + timeout;
    let mut joined = 0;

    loop {
        let (finished, running): (Vec<_>, Vec<_>) =
            threads.into_iter().partition(|thread| thread.is_finished());
        for thread in finished {
            if thread.join().is_err() {
                tracing::warn!("Execution context thread panicked");
            }
            joined += 1;
        }
        threads = running;

        if threads.is_empty() || Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(JOIN_POLL_INTERVAL).await;
    }

    if !threads.is_empty() {
        tracing::error!(count = threads.len(), "Execution context threads did not exit");
    }
    (joined, threads.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::modules::{ExportTable, LocalResolver, ModuleRegistry, param};
    use serde_json::json;

    fn tasker(config: TaskerConfig) -> Tasker {
        let registry = Arc::new(ModuleRegistry::new("/srv"));
        registry.register_builtin(
            "./calc",
            Arc::new(
                ExportTable::new()
                    .function("square", |args| {
                        let n: i64 = param(&args, 0)?;
                        Ok(json!(n * n))
                    })
                    .async_function("nap", |args| async move {
                        let ms: u64 = param(&args, 0)?;
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        Ok::<_, anyhow::Error>(json!(ms))
                    }),
            ),
        );
        Tasker::start(config, Arc::new(LocalResolver::new(registry))).unwrap()
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let registry = Arc::new(ModuleRegistry::new("/srv"));
        let result = Tasker::start(
            TaskerConfig::default().with_max_contexts(0),
            Arc::new(LocalResolver::new(registry)),
        );
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[tokio::test]
    async fn reused_context_stays_idle() {
        let tasker = tasker(TaskerConfig::default().with_max_contexts(2));

        for n in 0..4 {
            let value = tasker.call(Task::new("./calc", "square").args([json!(n)])).await.unwrap();
            assert_eq!(value, json!(n * n));
        }

        let stats = tasker.stats().await.unwrap();
        assert_eq!(stats.live_contexts, 1);
        assert_eq!(stats.idle_contexts, 1);
        assert_eq!(stats.busy_contexts, 0);
        assert_eq!(stats.completed, 4);

        let report = tasker.shutdown().await.unwrap();
        assert_eq!(report.completed, 4);
        assert_eq!(report.contexts_joined, 1);
    }

    #[tokio::test]
    async fn cancel_unknown_task() {
        let tasker = tasker(TaskerConfig::default());
        assert_eq!(tasker.cancel(TaskId::new()).await, CancelOutcome::NotFound);
        tasker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn stopped_manager_reports_stopped() {
        let tasker = tasker(TaskerConfig::default());
        tasker.shutdown().await.unwrap();

        assert_eq!(tasker.shutdown().await.unwrap_err(), ManagerError::Stopped);
        assert_eq!(tasker.stats().await.unwrap_err(), ManagerError::Stopped);
        assert!(!tasker.is_running());

        let err = tasker.call(Task::new("./calc", "square").args([json!(2)])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rejected);
    }

    #[tokio::test]
    async fn dropped_handles_drain_in_flight_work() {
        let tasker = tasker(TaskerConfig::default().with_max_contexts(1));
        let (tx, rx) = oneshot::channel();
        tasker.run(Task::new("./calc", "nap").args([json!(30)]), move |result| {
            let _ = tx.send(result);
        });
        drop(tasker);

        let result = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        assert_eq!(result.unwrap(), json!(30));
    }

    #[tokio::test]
    async fn panicking_callback_does_not_stop_the_manager() {
        let tasker = tasker(TaskerConfig::default());
        tasker.run(Task::new("./calc", "square").args([json!(3)]), |_| panic!("callback bug"));

        let value = tasker.call(Task::new("./calc", "square").args([json!(5)])).await.unwrap();
        assert_eq!(value, json!(25));
        tasker.shutdown().await.unwrap();
    }
}
