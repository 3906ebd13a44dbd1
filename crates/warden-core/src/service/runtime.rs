//! Per-service workers.
//!
//! Every service has one execution worker draining its [`TaskQueue`] and a
//! named set of auxiliary workers:
//!
//! | worker               | role                                            |
//! |----------------------|-------------------------------------------------|
//! | `self-save`          | queues `save` at SYSTEM priority on an interval |
//! | `recurring:<action>` | re-queues `<action>` no sooner than its period  |
//! | `retention`          | trims the task archive, when configured         |
//! | `validate`           | retries validation before the first start       |
//!
//! Nothing drains a queue before the [`StartupGate`] opens.
//!
//! [`TaskQueue`]: crate::task::TaskQueue

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::gate::StartupGate;
use crate::service::Service;
use crate::task::{priority, Task, TaskState};
use crate::template::{Args, SAVE_ACTION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Process shutdown or upgrade: close the archive, keep everything.
    Shutdown,
    /// Run delete callbacks and drop the archive.
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerKind {
    Recurring,
    Support,
}

struct Worker {
    kind: WorkerKind,
    handle: JoinHandle<()>,
}

pub struct Runtime {
    config: RuntimeConfig,
    gate: StartupGate,
    stop_tx: watch::Sender<bool>,
    executor: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<BTreeMap<String, Worker>>,
}

impl Runtime {
    pub(crate) fn new(config: RuntimeConfig, gate: StartupGate) -> Self {
        Self {
            config,
            gate,
            stop_tx: watch::Sender::new(false),
            executor: Mutex::new(None),
            workers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn is_started(&self) -> bool {
        self.executor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Names of the auxiliary workers spawned so far.
    pub fn worker_names(&self) -> Vec<String> {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Spawn the execution worker and every auxiliary worker. A second call,
    /// or a call after `stop`, does nothing.
    pub(crate) fn start(&self, service: &Arc<Service>) {
        if self.is_stopping() {
            return;
        }
        {
            let mut executor = self.executor.lock().unwrap_or_else(|e| e.into_inner());
            if executor.is_some() {
                return;
            }
            *executor = Some(tokio::spawn(execution_loop(
                service.clone(),
                self.gate.clone(),
                self.stop_tx.subscribe(),
                self.config.poll_timeout(),
            )));
        }

        self.spawn_worker(
            "self-save",
            WorkerKind::Support,
            self_save_loop(
                service.clone(),
                self.gate.clone(),
                self.stop_tx.subscribe(),
                self.config.save_interval(),
            ),
        );
        for spec in service.template().recurring() {
            self.spawn_worker(
                format!("recurring:{}", spec.action),
                WorkerKind::Recurring,
                recurring_loop(
                    service.clone(),
                    self.gate.clone(),
                    self.stop_tx.subscribe(),
                    spec.action.clone(),
                    spec.period,
                ),
            );
        }
        if let Some(retention) = self.config.task_retention() {
            self.spawn_worker(
                "retention",
                WorkerKind::Support,
                retention_loop(
                    service.clone(),
                    self.gate.clone(),
                    self.stop_tx.subscribe(),
                    retention,
                    self.config.retention_interval(),
                ),
            );
        }
        info!(guid = %service.guid(), service = %service.name(), "service runtime started");
    }

    pub(crate) fn start_after_validation(&self, service: &Arc<Service>) {
        if self.is_stopping() {
            return;
        }
        self.spawn_worker(
            "validate",
            WorkerKind::Support,
            validation_retry_loop(
                service.clone(),
                self.stop_tx.subscribe(),
                self.config.validate_retry(),
            ),
        );
    }

    fn spawn_worker<F>(&self, name: impl Into<String>, kind: WorkerKind, worker: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(worker);
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = workers.insert(name.into(), Worker { kind, handle }) {
            old.handle.abort();
        }
    }

    /// Stop every worker, bounded by `timeout` for the running task.
    ///
    /// Order: signal stop, drop recurring workers, wait for the execution
    /// worker (cancelled at the deadline), run delete callbacks if deleting,
    /// join the remaining workers, then close or drop the archive.
    pub(crate) async fn stop(&self, service: &Service, timeout: Duration, mode: StopMode) {
        let deadline = Instant::now() + timeout;
        self.stop_tx.send_replace(true);

        let (recurring, support): (Vec<_>, Vec<_>) = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *workers)
                .into_iter()
                .partition(|(_, w)| w.kind == WorkerKind::Recurring)
        };
        for (_, worker) in &recurring {
            worker.handle.abort();
        }

        let executor = self
            .executor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut handle) = executor {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!(
                    guid = %service.guid(),
                    running = ?service.queue().current().map(|t| t.action_name),
                    "execution worker did not stop in time, cancelling"
                );
                handle.abort();
                let _ = handle.await;
            }
        }

        if mode == StopMode::Delete {
            self.run_delete_callbacks(service).await;
        }

        for (name, worker) in support {
            worker.handle.abort();
            if let Err(e) = worker.handle.await {
                if !e.is_cancelled() {
                    error!(guid = %service.guid(), worker = %name, error = %e, "worker failed");
                }
            }
        }
        for (_, worker) in recurring {
            let _ = worker.handle.await;
        }

        let closed = service
            .queue()
            .with_archive(move |archive| match mode {
                StopMode::Shutdown => archive.close(),
                StopMode::Delete => archive.drop_all(),
            })
            .await;
        if let Err(e) = closed {
            error!(guid = %service.guid(), error = %e, "failed to release task archive");
        }
        info!(guid = %service.guid(), ?mode, "service runtime stopped");
    }

    /// Best effort: failures and timeouts are logged, never returned.
    async fn run_delete_callbacks(&self, service: &Service) {
        let callbacks = service.template().on_delete();
        if callbacks.is_empty() {
            return;
        }
        let run_all = async {
            for action in callbacks {
                let mut task = Task::new(action.clone(), Args::new());
                task.priority = priority::SYSTEM;
                let _ = task.transition(TaskState::Running);
                let outcome = service.run(task).await;
                debug!(guid = %service.guid(), action = %action, state = %outcome, "delete callback finished");
            }
        };
        if tokio::time::timeout(self.config.delete_callback_timeout(), run_all)
            .await
            .is_err()
        {
            warn!(guid = %service.guid(), "delete callbacks timed out");
        }
    }
}

// ---------------------------------------------------------------------------
// Worker loops
// ---------------------------------------------------------------------------

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|s| *s).await;
}

/// Wait for the startup gate. `false` if stop came first.
async fn gate_opened(gate: &StartupGate, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = stopped(stop) => false,
        _ = gate.wait() => true,
    }
}

/// Sleep for `period`. `false` if stop came first.
async fn pause(period: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = stopped(stop) => false,
        _ = tokio::time::sleep(period) => true,
    }
}

async fn execution_loop(
    service: Arc<Service>,
    gate: StartupGate,
    mut stop: watch::Receiver<bool>,
    poll: Duration,
) {
    if !gate_opened(&gate, &mut stop).await {
        return;
    }
    debug!(guid = %service.guid(), "execution worker running");
    loop {
        let next = tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            next = service.queue().get(poll) => next,
        };
        // the dequeued task always runs to completion; stop is checked after
        if let Some(task) = next {
            service.run(task).await;
        }
    }
    debug!(guid = %service.guid(), "execution worker exited");
}

async fn self_save_loop(
    service: Arc<Service>,
    gate: StartupGate,
    mut stop: watch::Receiver<bool>,
    interval: Duration,
) {
    if !gate_opened(&gate, &mut stop).await {
        return;
    }
    while pause(interval, &mut stop).await {
        if !service.queue().contains_action(SAVE_ACTION) {
            service
                .queue()
                .put(Task::new(SAVE_ACTION, Args::new()), priority::SYSTEM);
        }
    }
}

/// Keep one instance of `action` in flight, waiting for it to finish before
/// measuring the next period.
async fn recurring_loop(
    service: Arc<Service>,
    gate: StartupGate,
    mut stop: watch::Receiver<bool>,
    action: String,
    period: Duration,
) {
    if !gate_opened(&gate, &mut stop).await {
        return;
    }
    loop {
        if service.queue().contains_action(&action) {
            debug!(guid = %service.guid(), action = %action, "recurring action already queued");
        } else {
            let waiter = service
                .queue()
                .put(Task::new(action.clone(), Args::new()), priority::RECURRING);
            tokio::select! {
                biased;
                _ = stopped(&mut stop) => break,
                _ = waiter.wait() => {}
            }
        }
        if !pause(period, &mut stop).await {
            break;
        }
    }
}

async fn retention_loop(
    service: Arc<Service>,
    gate: StartupGate,
    mut stop: watch::Receiver<bool>,
    retention: Duration,
    interval: Duration,
) {
    let Ok(retention) = chrono::Duration::from_std(retention) else {
        warn!(guid = %service.guid(), "task retention out of range, trimming disabled");
        return;
    };
    if !gate_opened(&gate, &mut stop).await {
        return;
    }
    while pause(interval, &mut stop).await {
        let cutoff = Utc::now() - retention;
        match service
            .queue()
            .with_archive(move |a| a.delete_until(cutoff))
            .await
        {
            Ok(0) => {}
            Ok(removed) => info!(guid = %service.guid(), removed, "archived tasks trimmed"),
            Err(e) => error!(guid = %service.guid(), error = %e, "archive trim failed"),
        }
    }
}

async fn validation_retry_loop(
    service: Arc<Service>,
    mut stop: watch::Receiver<bool>,
    retry: Duration,
) {
    let mut attempt: u32 = 1;
    while pause(retry, &mut stop).await {
        attempt += 1;
        match service.validate().await {
            Ok(()) => {
                info!(guid = %service.guid(), attempt, "validation passed");
                service.start();
                return;
            }
            Err(e) => warn!(guid = %service.guid(), attempt, error = %e, "validation failed, retrying"),
        }
    }
}
