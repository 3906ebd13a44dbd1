//! Live services: a template instance with its own data, state, task queue
//! and runtime.

pub mod registry;
pub mod runtime;
pub mod state;

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::{ArchiveBackend, RuntimeConfig};
use crate::error::{Result, WardenError};
use crate::gate::StartupGate;
use crate::paths::validate_service_name;
use crate::snapshot::{ServiceInfo, ServiceSnapshot, SnapshotStore};
use crate::task::{archive, Priority, Task, TaskQueue, TaskState};
use crate::template::{
    ActionContext, ActionFailure, ActionResult, Args, Template, SAVE_ACTION,
};

pub use registry::{ServiceFilter, ServiceRegistry};
pub use runtime::{Runtime, StopMode};
pub use state::{Data, ServiceState, StateValue};

/// Counters kept by the execution worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionStats {
    pub executed: u64,
    pub failed: u64,
    pub total_latency: Duration,
}

impl ExecutionStats {
    pub fn mean_latency(&self) -> Option<Duration> {
        if self.executed == 0 {
            return None;
        }
        Some(self.total_latency.div_f64(self.executed as f64))
    }
}

pub struct Service {
    guid: String,
    name: String,
    public: bool,
    template: Arc<Template>,
    data: Arc<RwLock<Data>>,
    state: Arc<RwLock<ServiceState>>,
    queue: Arc<TaskQueue>,
    store: Arc<dyn SnapshotStore>,
    runtime: Runtime,
    stats: Mutex<ExecutionStats>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("guid", &self.guid)
            .field("name", &self.name)
            .field("template", &self.template.uid().to_string())
            .finish_non_exhaustive()
    }
}

impl Service {
    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_public(&self) -> bool {
        self.public
    }

    pub fn template(&self) -> &Arc<Template> {
        &self.template
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn data(&self) -> Data {
        self.data.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn state(&self) -> ServiceState {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn stats(&self) -> ExecutionStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn info(&self) -> ServiceInfo {
        ServiceInfo::new(self.template.uid(), &self.name, &self.guid, self.public)
    }

    /// Everything the snapshot store needs to rebuild this service.
    pub fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            info: self.info(),
            state: self.state(),
            data: self.data(),
            tasks: self.queue.pending_tasks(),
        }
    }

    pub async fn save(&self) -> Result<()> {
        self.store.save(&self.snapshot()).await
    }

    /// Queue `action` after checking it exists and accepts `args`. Nothing is
    /// queued when the check fails.
    pub fn schedule(&self, action: &str, args: Args, priority: Priority) -> Result<Task> {
        self.template.check_call(action, &args)?;
        let mut task = Task::new(action, args);
        task.priority = priority;
        let queued = task.clone();
        self.queue.put(task, priority);
        debug!(guid = %self.guid, action, task = %queued.guid, priority, "task scheduled");
        Ok(queued)
    }

    /// Run the template's validation hook, if any.
    pub async fn validate(&self) -> Result<()> {
        let Some(hook) = self.template.validate_hook() else {
            return Ok(());
        };
        let call = hook.call(self.context(), Args::new());
        let outcome = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(panic_failure(panic.as_ref())),
        };
        outcome.map(|_| ()).map_err(|failure| WardenError::ValidationFailed {
            service: self.guid.clone(),
            reason: failure.to_string(),
        })
    }

    pub fn context(&self) -> ActionContext {
        ActionContext::new(
            self.guid.clone(),
            self.name.clone(),
            self.template.uid().clone(),
            self.data.clone(),
            self.state.clone(),
        )
    }

    /// Start the execution worker and auxiliary workers.
    pub fn start(self: &Arc<Self>) {
        self.runtime.start(self);
    }

    /// Keep the workers down and retry validation in the background until it
    /// passes, then start.
    pub fn start_after_validation(self: &Arc<Self>) {
        self.runtime.start_after_validation(self);
    }

    pub async fn stop(&self, timeout: Duration, mode: StopMode) {
        self.runtime.stop(self, timeout, mode).await;
    }

    async fn invoke(&self, task: &Task) -> ActionResult {
        if task.action_name == SAVE_ACTION {
            return self
                .save()
                .await
                .map(|()| Value::Null)
                .map_err(ActionFailure::from);
        }
        let Some(spec) = self.template.action(&task.action_name) else {
            return Err(WardenError::ActionNotFound {
                action: task.action_name.clone(),
                template: self.template.uid().to_string(),
            }
            .into());
        };
        let call = spec.handler.call(self.context(), task.args.clone());
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(panic_failure(panic.as_ref())),
        }
    }

    /// Execute a dequeued task and archive it. Used by the execution worker
    /// and for delete callbacks.
    pub(crate) async fn run(&self, mut task: Task) -> TaskState {
        let started = tokio::time::Instant::now();
        let outcome = self.invoke(&task).await;
        let elapsed = started.elapsed();

        {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.executed += 1;
            stats.total_latency += elapsed;
            if outcome.is_err() {
                stats.failed += 1;
            }
        }
        if let Err(failure) = &outcome {
            warn!(
                guid = %self.guid,
                action = %task.action_name,
                task = %task.guid,
                category = %failure.category,
                error = %failure.message,
                "task failed"
            );
        }
        // never report a zero duration for a task that ran
        let seconds = elapsed.as_secs_f64().max(f64::EPSILON);
        if let Err(e) = task.finish(outcome, seconds) {
            warn!(guid = %self.guid, task = %task.guid, error = %e, "task not finishable");
        }
        debug!(
            guid = %self.guid,
            action = %task.action_name,
            latency_ms = elapsed.as_millis() as u64,
            "task finished"
        );
        let state = task.state;
        if let Err(e) = self.queue.finish(task).await {
            error!(guid = %self.guid, error = %e, "failed to archive task");
        }
        state
    }
}

fn panic_failure(panic: &(dyn std::any::Any + Send)) -> ActionFailure {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "action panicked".to_string());
    ActionFailure::new("panic", message)
}

// ---------------------------------------------------------------------------
// ServiceFactory
// ---------------------------------------------------------------------------

/// Builds services, fresh or from a snapshot, wired to the shared store,
/// archive backend and startup gate.
#[derive(Clone)]
pub struct ServiceFactory {
    store: Arc<dyn SnapshotStore>,
    archive: ArchiveBackend,
    runtime: RuntimeConfig,
    gate: StartupGate,
}

impl ServiceFactory {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        archive: ArchiveBackend,
        runtime: RuntimeConfig,
        gate: StartupGate,
    ) -> Self {
        Self {
            store,
            archive,
            runtime,
            gate,
        }
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    pub fn runtime_config(&self) -> &RuntimeConfig {
        &self.runtime
    }

    /// A new service with a fresh guid. `name` defaults to the guid; `data`
    /// is merged over the template's default data.
    pub fn create(
        &self,
        template: Arc<Template>,
        name: Option<&str>,
        data: Option<Data>,
        public: bool,
    ) -> Result<Arc<Service>> {
        let guid = uuid::Uuid::new_v4().to_string();
        let name = name.map(str::to_string).unwrap_or_else(|| guid.clone());
        validate_service_name(&name)?;
        let mut merged = template.default_data().clone();
        merged.extend(data.unwrap_or_default());
        let service = self.build(template, guid, name, public, merged, ServiceState::new())?;
        info!(guid = %service.guid, service = %service.name, template = %service.template.uid(), "service created");
        Ok(service)
    }

    /// Rebuild a service from its snapshot. Pending tasks go back on the
    /// queue; a task caught mid-run is failed as `interrupted` and archived.
    ///
    /// Every pending task must still be a valid call on `template`; nothing
    /// is opened or archived otherwise.
    pub async fn materialize(
        &self,
        template: Arc<Template>,
        snapshot: ServiceSnapshot,
    ) -> Result<Arc<Service>> {
        let ServiceSnapshot {
            info,
            state,
            data,
            tasks,
        } = snapshot;
        for task in tasks.iter().filter(|t| t.state == TaskState::New) {
            template.check_call(&task.action_name, &task.args)?;
        }
        let service = self.build(template, info.guid, info.name, info.public, data, state)?;

        for mut task in tasks {
            match task.state {
                TaskState::New => {
                    let priority = task.priority;
                    service.queue.put(task, priority);
                }
                TaskState::Running => {
                    warn!(guid = %service.guid, task = %task.guid, action = %task.action_name, "task interrupted");
                    let failure =
                        ActionFailure::new("interrupted", "service stopped while the task was running");
                    let duration = task.duration.unwrap_or_default();
                    task.finish(Err(failure), duration)?;
                    archive_recovered(&service, task).await?;
                }
                TaskState::Ok | TaskState::Error => archive_recovered(&service, task).await?,
            }
        }
        Ok(service)
    }

    fn build(
        &self,
        template: Arc<Template>,
        guid: String,
        name: String,
        public: bool,
        data: Data,
        state: ServiceState,
    ) -> Result<Arc<Service>> {
        let archive = archive::open(&self.archive, &guid)?;
        Ok(Arc::new(Service {
            guid,
            name,
            public,
            template,
            data: Arc::new(RwLock::new(data)),
            state: Arc::new(RwLock::new(state)),
            queue: Arc::new(TaskQueue::new(archive)),
            store: self.store.clone(),
            runtime: Runtime::new(self.runtime.clone(), self.gate.clone()),
            stats: Mutex::new(ExecutionStats::default()),
        }))
    }
}

/// Archive a task found in a snapshot. Already archived is fine.
async fn archive_recovered(service: &Service, task: Task) -> Result<()> {
    match service.queue.archive_task(task).await {
        Ok(()) | Err(WardenError::TaskConflict(_)) => Ok(()),
        Err(e) => Err(e),
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::task::priority::{NORMAL, SYSTEM};
    use crate::template::handler_fn;
    use serde_json::json;

    async fn run_next(svc: &Service) -> Task {
        let task = svc.queue.get(Duration::from_millis(10)).await.unwrap();
        let guid = task.guid.clone();
        svc.run(task).await;
        svc.queue.get_by_guid(&guid).await.unwrap()
    }

    #[tokio::test]
    async fn schedule_checks_the_action_table() {
        let svc = service("svc1");
        let err = svc.schedule("frobnicate", Args::new(), NORMAL).unwrap_err();
        assert!(matches!(err, WardenError::ActionNotFound { .. }));
        let mut bad = Args::new();
        bad.insert("unexpected".into(), json!(1));
        assert!(matches!(
            svc.schedule("start", bad, NORMAL),
            Err(WardenError::BadArguments { .. })
        ));
        assert!(svc.queue.is_empty());

        let task = svc.schedule("start", Args::new(), NORMAL).unwrap();
        assert_eq!(task.state, TaskState::New);
        assert_eq!(svc.queue.len(), 1);
    }

    #[tokio::test]
    async fn run_records_outcome_and_archives() {
        let svc = service("svc1");
        svc.schedule("start", Args::new(), NORMAL).unwrap();
        let done = run_next(&svc).await;
        assert_eq!(done.state, TaskState::Ok);
        assert_eq!(done.result, Some(json!("started")));
        assert!(done.duration.unwrap() > 0.0);
        assert_eq!(svc.state().get("actions", "start"), Some(StateValue::Ok));
        assert!(svc.queue.current().is_none());
        assert_eq!(svc.queue.with_archive(|a| a.count()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failures_and_panics_become_error_records() {
        let svc = service("svc1");
        svc.schedule("fail", Args::new(), NORMAL).unwrap();
        let failed = run_next(&svc).await;
        assert_eq!(failed.state, TaskState::Error);
        let record = failed.error_record.unwrap();
        assert_eq!(record.category, "deploy");
        assert_eq!(record.message, "target unreachable");

        svc.schedule("boom", Args::new(), NORMAL).unwrap();
        let panicked = run_next(&svc).await;
        let record = panicked.error_record.unwrap();
        assert_eq!(record.category, "panic");
        assert!(record.message.contains("handler exploded"));

        let stats = svc.stats();
        assert_eq!((stats.executed, stats.failed), (2, 2));
    }

    #[tokio::test]
    async fn save_action_persists_without_listing_itself() {
        let svc = service("svc1");
        svc.schedule("start", Args::new(), NORMAL).unwrap();
        svc.schedule(SAVE_ACTION, Args::new(), SYSTEM).unwrap();
        let saved = run_next(&svc).await;
        assert_eq!(saved.action_name, SAVE_ACTION);
        assert_eq!(saved.state, TaskState::Ok);

        let stored = svc.store.list().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].info, svc.info());
        let pending: Vec<_> = stored[0].tasks.iter().map(|t| t.action_name.as_str()).collect();
        assert_eq!(pending, ["start"]);
    }

    #[test]
    fn create_merges_data_and_checks_name() {
        let factory = factory();
        let template = Arc::new(template("0.0.1"));
        let mut data = Data::new();
        data.insert("replicas".into(), json!(3));
        let svc = factory
            .create(template.clone(), None, Some(data), true)
            .unwrap();
        assert_eq!(svc.name(), svc.guid());
        assert!(svc.is_public());
        assert_eq!(svc.data()["port"], json!(8080));
        assert_eq!(svc.data()["replicas"], json!(3));

        let err = factory
            .create(template, Some("has space"), None, false)
            .unwrap_err();
        assert!(matches!(err, WardenError::InvalidServiceName(_)));
    }

    #[tokio::test]
    async fn materialize_requeues_and_fails_interrupted() {
        let factory = factory();
        let original = service("svc1");
        original.context().set_state("install", "package", StateValue::Ok);

        let mut snapshot = original.snapshot();
        let pending = queued_task("start", 3);
        let mut interrupted = queued_task("fail", NORMAL);
        interrupted.transition(TaskState::Running).unwrap();
        snapshot.tasks = vec![pending.clone(), interrupted.clone()];

        let svc = factory
            .materialize(Arc::new(template("0.0.1")), snapshot)
            .await
            .unwrap();
        assert_eq!(svc.guid(), original.guid());
        assert_eq!(svc.state(), original.state());
        assert_eq!(svc.data(), original.data());

        let queued = svc.queue.list_tasks(false).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].guid, pending.guid);
        assert_eq!(queued[0].priority, 3);
        assert_eq!(queued[0].created, pending.created);

        let archived = svc.queue.get_by_guid(&interrupted.guid).await.unwrap();
        assert_eq!(archived.state, TaskState::Error);
        assert_eq!(archived.error_record.unwrap().category, "interrupted");
    }

    #[tokio::test]
    async fn validation_hook_failure_is_typed() {
        let template = Template::builder(uid("0.0.2"))
            .validate(handler_fn(|ctx, _args| async move {
                if ctx.data().contains_key("host") {
                    Ok(Value::Null)
                } else {
                    Err(ActionFailure::new("config", "host is not set"))
                }
            }))
            .build()
            .unwrap();
        let template = Arc::new(template);
        let factory = factory();

        let bad = factory.create(template.clone(), Some("a"), None, false).unwrap();
        let err = bad.validate().await.unwrap_err();
        assert!(matches!(err, WardenError::ValidationFailed { .. }));
        assert!(err.to_string().contains("host is not set"));

        let mut data = Data::new();
        data.insert("host".into(), json!("db1"));
        let good = factory.create(template, Some("b"), Some(data), false).unwrap();
        good.validate().await.unwrap();
    }

    #[test]
    fn mean_latency_survives_large_counts() {
        let stats = ExecutionStats {
            executed: 1 << 32,
            failed: 0,
            total_latency: Duration::from_secs(1 << 32),
        };
        assert_eq!(stats.mean_latency(), Some(Duration::from_secs(1)));
        assert_eq!(ExecutionStats::default().mean_latency(), None);
    }

    #[tokio::test]
    async fn materialize_rejects_work_the_template_cannot_run() {
        let mut snapshot = service("svc1").snapshot();
        let mut stray = queued_task("start", NORMAL);
        stray.args.insert("unexpected".into(), json!(true));
        snapshot.tasks = vec![stray];

        let err = factory()
            .materialize(Arc::new(template("0.0.1")), snapshot.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::BadArguments { .. }));

        snapshot.tasks = vec![queued_task("frobnicate", NORMAL)];
        let err = factory()
            .materialize(Arc::new(template("0.0.1")), snapshot)
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::ActionNotFound { .. }));
    }
}
