//! Top-level owner of templates, services and the snapshot store.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Result, WardenError};
use crate::gate::StartupGate;
use crate::service::{Data, Service, ServiceFactory, ServiceFilter, ServiceRegistry, StopMode};
use crate::snapshot::{open_store, SnapshotStore};
use crate::task::{priority, Task};
use crate::template::{Args, HandlerCatalog, Template, TemplateRegistry};

/// What [`Orchestrator::start`] found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StartReport {
    pub templates: usize,
    pub recovered: usize,
    /// Recovered services whose validation failed; they start once it passes.
    pub awaiting_validation: Vec<String>,
}

pub struct Orchestrator {
    config: Config,
    templates: TemplateRegistry,
    services: ServiceRegistry,
    factory: ServiceFactory,
    gate: StartupGate,
}

impl Orchestrator {
    pub fn new(config: Config, catalog: HandlerCatalog) -> Result<Self> {
        let store = open_store(&config.storage)?;
        Self::with_store(config, catalog, store)
    }

    /// Use an already-open snapshot store instead of the configured one.
    pub fn with_store(
        config: Config,
        catalog: HandlerCatalog,
        store: Arc<dyn SnapshotStore>,
    ) -> Result<Self> {
        let gate = StartupGate::new();
        let factory = ServiceFactory::new(
            store,
            config.archive.clone(),
            config.runtime.clone(),
            gate.clone(),
        );
        Ok(Self {
            templates: TemplateRegistry::new(catalog),
            services: ServiceRegistry::new()?,
            factory,
            gate,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Templates can also be registered here directly before [`start`](Self::start).
    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn is_started(&self) -> bool {
        self.gate.is_open()
    }

    /// Load template sources, recover every persisted service and open the
    /// startup gate.
    ///
    /// Services whose validation fails are registered but not started; they
    /// retry in the background.
    pub async fn start(&self) -> Result<StartReport> {
        for source in &self.config.template_sources {
            let loaded = self.templates.load(&source.url, &source.path)?;
            info!(source = %source.url, count = loaded.len(), "templates loaded");
        }

        let mut recovered = Vec::new();
        for snapshot in self.factory.store().list().await? {
            // created through this orchestrator before start
            if self.services.get_by_guid(&snapshot.info.guid).is_ok() {
                continue;
            }
            let declared = snapshot.info.template_uid()?;
            let template = self.templates.resolve_declared(&declared)?;
            if !template.uid().same_template(&declared) {
                return Err(WardenError::TemplateMismatch {
                    declared: declared.to_string(),
                    location: template.uid().to_string(),
                });
            }
            let service = self.factory.materialize(template, snapshot).await?;
            self.services.add(service.clone())?;
            info!(guid = %service.guid(), service = %service.name(), template = %service.template().uid(), "service recovered");
            recovered.push(service);
        }

        let mut report = StartReport {
            templates: self.templates.len(),
            recovered: recovered.len(),
            awaiting_validation: Vec::new(),
        };
        for service in &recovered {
            match service.validate().await {
                Ok(()) => service.start(),
                Err(e) => {
                    warn!(guid = %service.guid(), error = %e, "validation failed, service suspended");
                    service.start_after_validation();
                    report.awaiting_validation.push(service.guid().to_string());
                }
            }
        }

        self.gate.open();
        info!(
            templates = report.templates,
            recovered = report.recovered,
            suspended = report.awaiting_validation.len(),
            "orchestrator started"
        );
        Ok(report)
    }

    /// Create, validate, persist, register and start a service. A service
    /// that fails any step before it is registered is discarded.
    pub async fn create_service(
        &self,
        template_ref: &str,
        name: Option<&str>,
        data: Option<Data>,
        public: bool,
    ) -> Result<Arc<Service>> {
        let template = self.templates.resolve(template_ref)?;
        let service = self.factory.create(template, name, data, public)?;
        if let Err(e) = service.validate().await {
            discard(&service).await;
            return Err(e);
        }
        if let Err(e) = service.save().await {
            error!(guid = %service.guid(), error = %e, "new service not persisted");
            discard(&service).await;
            return Err(e);
        }
        if let Err(e) = self.services.add(service.clone()) {
            if let Err(delete_err) = self.factory.store().delete(&service.info()).await {
                warn!(guid = %service.guid(), error = %delete_err, "snapshot of unregistered service left behind");
            }
            discard(&service).await;
            return Err(e);
        }
        service.start();
        Ok(service)
    }

    /// Queue `action` on a service at normal priority.
    pub fn schedule_action(&self, guid: &str, action: &str, args: Option<Args>) -> Result<Task> {
        let service = self.services.get_by_guid(guid)?;
        service.schedule(action, args.unwrap_or_default(), priority::NORMAL)
    }

    pub async fn get_task(&self, guid: &str, task_guid: &str) -> Result<Task> {
        let service = self.services.get_by_guid(guid)?;
        service.queue().get_by_guid(task_guid).await
    }

    /// Wait up to `timeout` for a task to finish and return it. A task that
    /// is still pending at the deadline is returned as it stands.
    pub async fn wait_task(&self, guid: &str, task_guid: &str, timeout: Duration) -> Result<Task> {
        let service = self.services.get_by_guid(guid)?;
        if let Some(waiter) = service.queue().waiter(task_guid) {
            let _ = tokio::time::timeout(timeout, waiter.wait()).await;
        }
        service.queue().get_by_guid(task_guid).await
    }

    pub fn get_service(&self, guid: &str) -> Result<Arc<Service>> {
        self.services.get_by_guid(guid)
    }

    pub fn list_services(&self, filter: &ServiceFilter) -> Result<Vec<Arc<Service>>> {
        self.services.find(filter)
    }

    pub fn list_templates(&self) -> Vec<Arc<Template>> {
        self.templates.list()
    }

    /// Drop pending work, run delete callbacks, stop the runtime and remove
    /// every trace of the service.
    ///
    /// The service leaves the registry before anything else, so deletion
    /// completes even when the snapshot cannot be removed; that error is
    /// still returned.
    pub async fn delete_service(&self, guid: &str) -> Result<()> {
        let service = self.services.delete(guid)?;
        let dropped = service.queue().clear();
        service
            .stop(self.config.runtime.shutdown_timeout(), StopMode::Delete)
            .await;
        if let Err(e) = self.factory.store().delete(&service.info()).await {
            error!(guid, error = %e, "service deleted but its snapshot remains");
            return Err(e);
        }
        info!(guid, service = %service.name(), dropped, "service deleted");
        Ok(())
    }

    pub async fn upgrade_service(&self, guid: &str, template_ref: &str) -> Result<Arc<Service>> {
        let service = self.services.get_by_guid(guid)?;
        let template = self.templates.resolve(template_ref)?;
        if !template.uid().same_template(service.template().uid()) {
            return Err(WardenError::TemplateMismatch {
                declared: template.uid().to_string(),
                location: service.template().uid().to_string(),
            });
        }
        self.services
            .upgrade(
                &service,
                template,
                &self.factory,
                self.config.runtime.shutdown_timeout(),
            )
            .await
    }

    pub async fn health(&self) -> Result<()> {
        self.factory.store().health().await
    }

    /// Stop and persist every service in turn, all within one shared
    /// deadline. Returns the first persistence error after trying them all.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut first_err = None;
        for service in self.services.list()? {
            let remaining = deadline.saturating_duration_since(Instant::now());
            service.stop(remaining, StopMode::Shutdown).await;
            if let Err(e) = service.save().await {
                error!(guid = %service.guid(), error = %e, "failed to persist service on shutdown");
                first_err.get_or_insert(e);
            }
        }
        info!("orchestrator stopped");
        first_err.map_or(Ok(()), Err)
    }
}

/// Release the archive of a service that never made it into the registry.
async fn discard(service: &Service) {
    if let Err(e) = service.queue().with_archive(|a| a.drop_all()).await {
        warn!(guid = %service.guid(), error = %e, "failed to drop archive of discarded service");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::fixtures;
    use crate::snapshot::kv::memory::FlakyStore;
    use crate::task::TaskState;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn orchestrator(root: &std::path::Path) -> Orchestrator {
        let orch = Orchestrator::new(Config::with_root(root), HandlerCatalog::new()).unwrap();
        orch.templates()
            .register(fixtures::template("0.0.1"))
            .unwrap();
        orch
    }

    #[tokio::test]
    async fn create_schedule_and_wait() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(dir.path());
        orch.start().await.unwrap();

        let svc = orch
            .create_service("node", Some("svc1"), None, false)
            .await
            .unwrap();
        let task = orch.schedule_action(svc.guid(), "start", None).unwrap();
        let done = orch
            .wait_task(svc.guid(), &task.guid, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.state, TaskState::Ok);
        assert_eq!(orch.get_task(svc.guid(), &task.guid).await.unwrap(), done);

        orch.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_template_and_service_are_not_found() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(dir.path());
        let err = orch
            .create_service("github.com/acct/repo/vm", None, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::TemplateNotFound(_)));
        assert!(matches!(
            orch.schedule_action("nope", "start", None),
            Err(WardenError::ServiceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn upgrade_across_templates_is_refused() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(dir.path());
        let other = Template::builder("github.com/acct/repo/vm/0.0.1".parse().unwrap())
            .build()
            .unwrap();
        orch.templates().register(other).unwrap();
        orch.start().await.unwrap();
        let svc = orch.create_service("node", None, None, false).await.unwrap();
        let err = orch
            .upgrade_service(svc.guid(), "github.com/acct/repo/vm/0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::TemplateMismatch { .. }));
        orch.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn health_probes_the_store() {
        let dir = TempDir::new().unwrap();
        orchestrator(dir.path()).health().await.unwrap();
    }
    fn flaky_orchestrator(root: &std::path::Path) -> (Orchestrator, Arc<FlakyStore>) {
        let store = Arc::new(FlakyStore::new());
        let orch =
            Orchestrator::with_store(Config::with_root(root), HandlerCatalog::new(), store.clone())
                .unwrap();
        orch.templates()
            .register(fixtures::template("0.0.1"))
            .unwrap();
        (orch, store)
    }

    #[tokio::test]
    async fn service_that_cannot_be_persisted_is_not_registered() {
        let dir = TempDir::new().unwrap();
        let (orch, store) = flaky_orchestrator(dir.path());
        orch.start().await.unwrap();

        store.fail_save.store(true, Ordering::SeqCst);
        let err = orch
            .create_service("node", Some("svc1"), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::Snapshot(_)));
        assert!(orch.list_services(&ServiceFilter::default()).unwrap().is_empty());
        assert!(matches!(
            orch.services().get_by_name("svc1"),
            Err(WardenError::ServiceNotFound(_))
        ));

        store.fail_save.store(false, Ordering::SeqCst);
        let svc = orch
            .create_service("node", Some("svc1"), None, false)
            .await
            .unwrap();
        assert!(svc.runtime().is_started());
        assert_eq!(orch.services().len(), 1);
        orch.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn delete_completes_when_the_snapshot_cannot_be_removed() {
        let dir = TempDir::new().unwrap();
        let (orch, store) = flaky_orchestrator(dir.path());
        orch.start().await.unwrap();
        let svc = orch
            .create_service("node", Some("svc1"), None, false)
            .await
            .unwrap();

        store.fail_delete.store(true, Ordering::SeqCst);
        let err = orch.delete_service(svc.guid()).await.unwrap_err();
        assert!(matches!(err, WardenError::Snapshot(_)));

        assert!(svc.runtime().is_stopping());
        assert!(matches!(
            orch.get_service(svc.guid()),
            Err(WardenError::ServiceNotFound(_))
        ));
        assert!(matches!(
            orch.schedule_action(svc.guid(), "start", None),
            Err(WardenError::ServiceNotFound(_))
        ));
        // the snapshot is the only leftover
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
