//! [`CommandExecutor`] – uniform submit / poll-completion interface.
//!
//! # Lifecycle
//!
//! ```text
//! submit ──► validate (catalog, no I/O) ──► BUSY? ──► PENDING
//!                                                      │
//!              sync: send, bounded by command timeout  │  async: send on a worker
//!                           ▼                          ▼
//!            COMPLETED / FAILED / TIMED_OUT        IN_PROGRESS ──poll_completion──► terminal
//! ```
//!
//! * At most one in-flight task per device. A second submission is refused
//!   with [`RejectReason::Busy`] before any network call; it is never queued.
//! * Mutating commands are sent exactly once. Read-only commands and
//!   completion queries are retried on communication failures, up to
//!   `query_retries` attempts.
//! * The command-level deadline is independent of per-call network
//!   timeouts: an asynchronous task still running past it becomes
//!   `TIMED_OUT` on its next poll (or on the next submission to the device).
//! * A completed command forces an out-of-cycle poll of the attributes it
//!   affects.
//! * Every terminal transition is published as
//!   [`EventPayload::CommandFinished`].
//!
//! Task tables are partitioned per device and purged of terminal tasks
//! older than the retention window.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tilemon_hal::{DeviceEndpoint, DeviceRegistry};
use tilemon_kernel::{CommandCatalog, CommandSpec};
use tilemon_middleware::EventBus;
use tilemon_types::{
    CommandResponse, CommandStatus, CommandTask, CompletionState, DeviceId, Event, EventPayload,
    RejectReason, ResponseStatus, TaskHandle, TaskId, TileError,
};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::poller::PollerHandle;

const SOURCE: &str = "tilemon-runtime::executor";

/// Worker pool and bookkeeping policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Concurrent command submissions and completion queries.
    pub workers: usize,
    /// How long terminal tasks stay queryable.
    pub retention_ms: u64,
    /// Interval between completion queries in [`CommandExecutor::wait`].
    pub completion_poll_ms: u64,
    /// Attempts per completion query before giving up for this poll.
    pub query_retries: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            retention_ms: 300_000,
            completion_poll_ms: 500,
            query_retries: 3,
        }
    }
}

impl ExecutorConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn completion_poll_interval(&self) -> Duration {
        Duration::from_millis(self.completion_poll_ms)
    }

    /// # Errors
    ///
    /// [`TileError::Configuration`] on an empty worker pool or zero poll
    /// interval.
    pub fn validate(&self) -> Result<(), TileError> {
        if self.workers == 0 {
            return Err(TileError::Configuration("executor needs at least one worker".into()));
        }
        if self.completion_poll_ms == 0 {
            return Err(TileError::Configuration(
                "executor completion_poll_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Hook into the programming lifecycle of the boards.
///
/// The executor calls [`accept`](Self::accept) while it holds the device's
/// task slot, so a refusal leaves no task behind, and
/// [`finished`](Self::finished) once a task reaches a terminal status.
pub trait TransitionTracker: Send + Sync {
    /// # Errors
    ///
    /// [`RejectReason::DuplicateTransition`] when the transition `spec`
    /// drives is already pending.
    fn accept(&self, device: &DeviceId, spec: &CommandSpec) -> Result<(), TileError>;

    fn finished(&self, device: &DeviceId, spec: &CommandSpec, status: CommandStatus);
}

struct TaskRecord {
    task: CommandTask,
    deadline: Instant,
    finished_at: Option<Instant>,
}

#[derive(Default)]
struct TaskTable {
    tasks: HashMap<TaskId, TaskRecord>,
    in_flight: Option<TaskId>,
    last_failure: Option<TileError>,
}

impl TaskTable {
    fn purge(&mut self, now: Instant, retention: Duration) {
        self.tasks.retain(|_, record| {
            record
                .finished_at
                .is_none_or(|at| now.saturating_duration_since(at) <= retention)
        });
    }
}

struct Inner {
    registry: Arc<DeviceRegistry>,
    catalog: CommandCatalog,
    config: ExecutorConfig,
    tables: BTreeMap<DeviceId, Mutex<TaskTable>>,
    workers: Semaphore,
    pollers: PollerHandle,
    tracker: Option<Arc<dyn TransitionTracker>>,
    bus: EventBus,
}

/// Cloneable command executor shared by the orchestrators.
#[derive(Clone)]
pub struct CommandExecutor {
    inner: Arc<Inner>,
}

impl CommandExecutor {
    /// One task table per registered device.
    pub fn new(
        registry: Arc<DeviceRegistry>,
        catalog: CommandCatalog,
        config: ExecutorConfig,
        pollers: PollerHandle,
        bus: EventBus,
    ) -> Self {
        Self::build(registry, catalog, config, pollers, bus, None)
    }

    pub fn with_tracker(
        registry: Arc<DeviceRegistry>,
        catalog: CommandCatalog,
        config: ExecutorConfig,
        pollers: PollerHandle,
        bus: EventBus,
        tracker: Arc<dyn TransitionTracker>,
    ) -> Self {
        Self::build(registry, catalog, config, pollers, bus, Some(tracker))
    }

    fn build(
        registry: Arc<DeviceRegistry>,
        catalog: CommandCatalog,
        config: ExecutorConfig,
        pollers: PollerHandle,
        bus: EventBus,
        tracker: Option<Arc<dyn TransitionTracker>>,
    ) -> Self {
        let tables = registry
            .ids()
            .map(|id| (id.clone(), Mutex::new(TaskTable::default())))
            .collect();
        let workers = Semaphore::new(config.workers.max(1));
        Self {
            inner: Arc::new(Inner {
                registry,
                catalog,
                config,
                tables,
                workers,
                pollers,
                tracker,
                bus,
            }),
        }
    }

    pub fn catalog(&self) -> &CommandCatalog {
        &self.inner.catalog
    }

    /// Submit `command` to `device`.
    ///
    /// Synchronous commands are sent and resolved before this returns.
    /// Asynchronous commands return a `PENDING` task immediately and are sent
    /// on a worker; drive them with [`poll_completion`](Self::poll_completion)
    /// or [`wait`](Self::wait).
    ///
    /// # Errors
    ///
    /// Refusals that happen before anything reaches the hardware:
    /// [`TileError::UnknownDevice`], and [`TileError::CommandRejected`] for an
    /// unknown command, invalid parameters, an offline device, a busy device
    /// (locally or as reported by the hardware) or a duplicate transition.
    #[instrument(skip_all, fields(device = %device, command = %command))]
    pub async fn submit(
        &self,
        device: &DeviceId,
        command: &str,
        params: serde_json::Value,
    ) -> Result<TaskHandle, TileError> {
        let inner = &self.inner;
        let table = inner
            .tables
            .get(device)
            .ok_or_else(|| TileError::UnknownDevice(device.clone()))?;
        let (spec, params) = inner.catalog.validate(device, command, &params)?;
        let endpoint = inner.registry.require(device)?;
        if !endpoint.is_online() {
            return Err(TileError::rejected(device, command, RejectReason::DeviceOffline));
        }

        let now = Instant::now();
        let expired = {
            let mut table = table.lock();
            table.purge(now, inner.config.retention());
            let expired = table.in_flight.filter(|id| {
                table
                    .tasks
                    .get(id)
                    .is_some_and(|record| now >= record.deadline)
            });
            if table.in_flight.is_some() && expired.is_none() {
                debug!(command, "refused, task in flight");
                return Err(TileError::rejected(device, command, RejectReason::Busy));
            }
            expired
        };
        if let Some(id) = expired {
            self.time_out(device, id);
        }

        let handle = {
            let mut table = table.lock();
            if table.in_flight.is_some() {
                return Err(TileError::rejected(device, command, RejectReason::Busy));
            }
            if let Some(tracker) = &inner.tracker {
                tracker.accept(device, spec)?;
            }
            let task = CommandTask::new(device.clone(), command, params.clone());
            let handle = task.handle();
            table.tasks.insert(
                task.id,
                TaskRecord {
                    task,
                    deadline: now + spec.timeout_duration(),
                    finished_at: None,
                },
            );
            table.in_flight = Some(handle.id);
            handle
        };
        info!(command, task_id = %handle.id, "command accepted");

        if spec.is_async() {
            let executor = self.clone();
            let spec = spec.clone();
            let task = handle.clone();
            tokio::spawn(async move {
                executor.dispatch_async(&task, &spec, &params).await;
            });
            return Ok(handle);
        }

        let response = {
            let _worker = inner
                .workers
                .acquire()
                .await
                .map_err(|_| TileError::Configuration("executor worker pool closed".into()))?;
            self.send(endpoint, spec, &params, spec.timeout_duration())
                .await
        };
        match response {
            Ok(response) if response.status == ResponseStatus::Busy => {
                self.withdraw(&handle, spec);
                Err(TileError::rejected(device, command, RejectReason::Busy))
            }
            Ok(response) => {
                self.resolve_sync(&handle, spec, response);
                Ok(handle)
            }
            Err(error) => {
                self.fail(&handle, spec, &error);
                Ok(handle)
            }
        }
    }

    async fn dispatch_async(&self, handle: &TaskHandle, spec: &CommandSpec, params: &serde_json::Value) {
        let inner = &self.inner;
        let Ok(endpoint) = inner.registry.require(&handle.device) else {
            return;
        };
        let response = {
            let Ok(_worker) = inner.workers.acquire().await else {
                return;
            };
            self.send(endpoint, spec, params, endpoint.io_timeout()).await
        };
        match response {
            Ok(response) => match response.status {
                ResponseStatus::Started => self.mark_in_progress(handle),
                ResponseStatus::Ok => self.finish(handle, spec, CommandStatus::Completed, None),
                ResponseStatus::Busy => {
                    let error = TileError::rejected(&handle.device, &handle.command, RejectReason::Busy);
                    self.fail(handle, spec, &error);
                }
                ResponseStatus::Error => {
                    let error = hardware_error(handle, &response);
                    self.fail(handle, spec, &error);
                }
            },
            Err(error) => self.fail(handle, spec, &error),
        }
    }

    /// Send `spec` once, or up to `query_retries` times for a read-only
    /// command failing on communication.
    async fn send(
        &self,
        endpoint: &DeviceEndpoint,
        spec: &CommandSpec,
        params: &serde_json::Value,
        deadline: Duration,
    ) -> Result<CommandResponse, TileError> {
        let attempts = if spec.mutating {
            1
        } else {
            self.inner.config.query_retries.max(1)
        };
        let mut attempt = 1;
        loop {
            match endpoint.execute_command(&spec.name, params, deadline).await {
                Err(e) if attempt < attempts && is_transient(&e) => {
                    debug!(command = %spec.name, attempt, error = %e, "retrying read-only command");
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    fn resolve_sync(&self, handle: &TaskHandle, spec: &CommandSpec, response: CommandResponse) {
        match response.status {
            ResponseStatus::Ok => self.finish(handle, spec, CommandStatus::Completed, None),
            // The hardware chose to run it in the background; poll like an
            // asynchronous command.
            ResponseStatus::Started => self.mark_in_progress(handle),
            ResponseStatus::Busy | ResponseStatus::Error => {
                let error = hardware_error(handle, &response);
                self.fail(handle, spec, &error);
            }
        }
    }

    /// Query the hardware once for the completion of `handle` and return the
    /// resulting status. Terminal tasks answer from the table.
    ///
    /// # Errors
    ///
    /// [`TileError::UnknownDevice`] for a device without a task table,
    /// [`TileError::UnknownTask`] once the task has been purged, and the last
    /// communication error when every completion query attempt
    /// failed (the task stays `IN_PROGRESS`).
    pub async fn poll_completion(&self, handle: &TaskHandle) -> Result<CommandStatus, TileError> {
        let inner = &self.inner;
        let status = self.task_status(handle)?;
        if status.is_terminal() {
            return Ok(status);
        }
        if self.deadline_passed(handle)? {
            self.time_out(&handle.device, handle.id);
            return self.task_status(handle);
        }
        if status == CommandStatus::Pending {
            return Ok(status);
        }

        let endpoint = inner.registry.require(&handle.device)?;
        let attempts = inner.config.query_retries.max(1);
        let mut last_error = None;
        let mut state = None;
        {
            let _worker = inner
                .workers
                .acquire()
                .await
                .map_err(|_| TileError::Configuration("executor worker pool closed".into()))?;
            for attempt in 1..=attempts {
                match endpoint.query_completion(&handle.command).await {
                    Ok(reported) => {
                        state = Some(reported);
                        break;
                    }
                    Err(e) => {
                        debug!(task_id = %handle.id, attempt, error = %e, "completion query failed");
                        last_error = Some(e);
                    }
                }
            }
        }
        let Some(spec) = inner.catalog.get(&handle.command) else {
            return Err(TileError::rejected(&handle.device, &handle.command, RejectReason::UnknownCommand));
        };
        match state {
            Some(CompletionState::Running) => {}
            Some(CompletionState::Completed) => {
                self.finish(handle, spec, CommandStatus::Completed, None);
            }
            Some(CompletionState::Failed(why)) => {
                let error = TileError::rejected(&handle.device, &handle.command, RejectReason::Hardware(why));
                self.fail(handle, spec, &error);
            }
            None => {
                if let Some(error) = last_error {
                    warn!(task_id = %handle.id, error = %error, "completion unknown");
                    return Err(error);
                }
            }
        }
        self.task_status(handle)
    }

    /// Poll until `handle` reaches a terminal status.
    ///
    /// # Errors
    ///
    /// [`TileError::UnknownDevice`] when the task's device has no table and
    /// [`TileError::UnknownTask`] when the task is no longer retained.
    /// Failed completion queries are logged and retried until the command
    /// deadline turns the task `TIMED_OUT`.
    pub async fn wait(&self, handle: &TaskHandle) -> Result<CommandStatus, TileError> {
        loop {
            match self.poll_completion(handle).await {
                Ok(status) if status.is_terminal() => return Ok(status),
                Ok(_) => {}
                Err(e @ (TileError::UnknownDevice(_) | TileError::UnknownTask { .. })) => return Err(e),
                Err(e) => debug!(task_id = %handle.id, error = %e, "retrying completion poll"),
            }
            tokio::time::sleep(self.inner.config.completion_poll_interval()).await;
        }
    }

    /// Stop tracking an in-flight task. The hardware mutation, if already
    /// issued, is not retracted.
    ///
    /// # Errors
    ///
    /// [`TileError::UnknownDevice`] when the device has no table and
    /// [`TileError::UnknownTask`] when the task is no longer retained.
    pub fn cancel(&self, handle: &TaskHandle) -> Result<CommandStatus, TileError> {
        let status = self.task_status(handle)?;
        if status.is_in_flight() {
            if let Some(spec) = self.inner.catalog.get(&handle.command) {
                self.finish(handle, spec, CommandStatus::Cancelled, None);
            }
        }
        self.task_status(handle)
    }

    /// The task behind `handle`, while retained.
    pub fn task(&self, handle: &TaskHandle) -> Option<CommandTask> {
        let table = self.inner.tables.get(&handle.device)?.lock();
        table.tasks.get(&handle.id).map(|record| record.task.clone())
    }

    pub fn in_flight(&self, device: &DeviceId) -> Option<TaskHandle> {
        let table = self.inner.tables.get(device)?.lock();
        let id = table.in_flight?;
        table.tasks.get(&id).map(|record| record.task.handle())
    }

    /// Most recent unresolved command failure of `device`. Cleared by the
    /// next successful command.
    pub fn last_failure(&self, device: &DeviceId) -> Option<TileError> {
        self.inner.tables.get(device)?.lock().last_failure.clone()
    }

    fn task_status(&self, handle: &TaskHandle) -> Result<CommandStatus, TileError> {
        let table = self
            .inner
            .tables
            .get(&handle.device)
            .ok_or_else(|| TileError::UnknownDevice(handle.device.clone()))?
            .lock();
        table
            .tasks
            .get(&handle.id)
            .map(|record| record.task.status)
            .ok_or_else(|| TileError::UnknownTask {
                device: handle.device.clone(),
                task_id: handle.id,
            })
    }

    fn deadline_passed(&self, handle: &TaskHandle) -> Result<bool, TileError> {
        let table = self
            .inner
            .tables
            .get(&handle.device)
            .ok_or_else(|| TileError::UnknownDevice(handle.device.clone()))?
            .lock();
        Ok(table
            .tasks
            .get(&handle.id)
            .is_some_and(|record| Instant::now() >= record.deadline))
    }

    fn mark_in_progress(&self, handle: &TaskHandle) {
        if let Some(table) = self.inner.tables.get(&handle.device) {
            let mut table = table.lock();
            if let Some(record) = table.tasks.get_mut(&handle.id) {
                if record.task.status == CommandStatus::Pending {
                    record.task.status = CommandStatus::InProgress;
                }
            }
        }
    }

    fn time_out(&self, device: &DeviceId, id: TaskId) {
        let Some(handle) = self
            .inner
            .tables
            .get(device)
            .and_then(|table| table.lock().tasks.get(&id).map(|r| r.task.handle()))
        else {
            return;
        };
        let Some(spec) = self.inner.catalog.get(&handle.command) else {
            return;
        };
        let error = TileError::CommandTimeout {
            device: device.clone(),
            command: handle.command.clone(),
            timeout_ms: spec.timeout_ms,
        };
        self.fail(&handle, spec, &error);
    }

    fn fail(&self, handle: &TaskHandle, spec: &CommandSpec, error: &TileError) {
        let status = match error {
            TileError::CommandTimeout { .. } => CommandStatus::TimedOut,
            _ => CommandStatus::Failed,
        };
        self.finish(handle, spec, status, Some(error.clone()));
    }

    /// The hardware refused the command outright: forget the task.
    fn withdraw(&self, handle: &TaskHandle, spec: &CommandSpec) {
        if let Some(table) = self.inner.tables.get(&handle.device) {
            let mut table = table.lock();
            table.tasks.remove(&handle.id);
            if table.in_flight == Some(handle.id) {
                table.in_flight = None;
            }
        }
        if let Some(tracker) = &self.inner.tracker {
            tracker.finished(&handle.device, spec, CommandStatus::Failed);
        }
    }

    /// Move an in-flight task to `status`. No-op when it already finished.
    fn finish(
        &self,
        handle: &TaskHandle,
        spec: &CommandSpec,
        status: CommandStatus,
        error: Option<TileError>,
    ) {
        let inner = &self.inner;
        let Some(table) = inner.tables.get(&handle.device) else {
            return;
        };
        {
            let mut table = table.lock();
            let Some(record) = table.tasks.get_mut(&handle.id) else {
                return;
            };
            if record.task.status.is_terminal() {
                return;
            }
            record.task.status = status;
            record.task.completed_at = Some(Utc::now());
            record.task.error = error.as_ref().map(ToString::to_string);
            record.finished_at = Some(Instant::now());
            if table.in_flight == Some(handle.id) {
                table.in_flight = None;
            }
            match (&error, status) {
                (Some(e), _) => table.last_failure = Some(e.clone()),
                (None, CommandStatus::Completed) => table.last_failure = None,
                _ => {}
            }
        }

        match &error {
            Some(e) => warn!(device = %handle.device, command = %handle.command, task_id = %handle.id, ?status, error = %e, "command finished"),
            None => info!(device = %handle.device, command = %handle.command, task_id = %handle.id, ?status, "command finished"),
        }
        inner.bus.publish(Event::new(
            SOURCE,
            EventPayload::CommandFinished {
                device: handle.device.clone(),
                task_id: handle.id,
                command: handle.command.clone(),
                status,
            },
        ));
        if let Some(tracker) = &inner.tracker {
            tracker.finished(&handle.device, spec, status);
        }
        if status == CommandStatus::Completed {
            inner.pollers.force_poll(&handle.device, &spec.affects);
        }
    }
}

fn is_transient(error: &TileError) -> bool {
    matches!(
        error,
        TileError::Communication { permanent: false, .. } | TileError::CommandTimeout { .. }
    )
}

fn hardware_error(handle: &TaskHandle, response: &CommandResponse) -> TileError {
    let reason = match response.status {
        ResponseStatus::Busy => RejectReason::Busy,
        _ => RejectReason::Hardware(
            response
                .error
                .clone()
                .unwrap_or_else(|| "no error detail".to_string()),
        ),
    };
    TileError::rejected(&handle.device, &handle.command, reason)
}
