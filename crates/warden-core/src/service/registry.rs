//! Live services keyed by guid, with a secondary index for filtered lookups.
//!
//! The index is an in-memory SQLite table mirroring each service's identity.
//! Every filtered lookup goes through it; the map only resolves guids.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rusqlite::{params, params_from_iter, Connection};
use tracing::{error, info, warn};

use crate::error::{Result, WardenError};
use crate::service::{Service, ServiceFactory, StopMode};
use crate::snapshot::{ServiceInfo, ServiceSnapshot};
use crate::template::Template;

const SCHEMA: &str = "
CREATE TABLE services (
    guid     TEXT PRIMARY KEY,
    name     TEXT NOT NULL,
    host     TEXT NOT NULL,
    account  TEXT NOT NULL,
    repo     TEXT NOT NULL,
    template TEXT NOT NULL,
    version  TEXT NOT NULL
);
CREATE INDEX services_name ON services (name);
CREATE INDEX services_template ON services (host, account, repo, template, version);
";

fn index_err(e: rusqlite::Error) -> WardenError {
    WardenError::Index(e.to_string())
}

/// Any subset of identity fields. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceFilter {
    pub guid: Option<String>,
    pub name: Option<String>,
    pub host: Option<String>,
    pub account: Option<String>,
    pub repo: Option<String>,
    /// Template name.
    pub template: Option<String>,
    pub version: Option<String>,
}

impl ServiceFilter {
    pub fn by_guid(guid: impl Into<String>) -> Self {
        Self {
            guid: Some(guid.into()),
            ..Self::default()
        }
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    fn clauses(&self) -> Vec<(&'static str, &str)> {
        [
            ("guid", &self.guid),
            ("name", &self.name),
            ("host", &self.host),
            ("account", &self.account),
            ("repo", &self.repo),
            ("template", &self.template),
            ("version", &self.version),
        ]
        .into_iter()
        .filter_map(|(column, value)| value.as_deref().map(|v| (column, v)))
        .collect()
    }

    fn describe(&self) -> String {
        self.clauses()
            .iter()
            .map(|(column, value)| format!("{column}={value}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<Service>>>,
    index: Mutex<Connection>,
}

impl ServiceRegistry {
    pub fn new() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(index_err)?;
        conn.execute_batch(SCHEMA).map_err(index_err)?;
        Ok(Self {
            services: RwLock::new(HashMap::new()),
            index: Mutex::new(conn),
        })
    }

    fn index(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `service`. A second service with the same guid is a conflict
    /// and leaves the first in place.
    pub fn add(&self, service: Arc<Service>) -> Result<()> {
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        if services.contains_key(service.guid()) {
            return Err(WardenError::ServiceConflict(service.guid().to_string()));
        }
        let uid = service.template().uid();
        let version = uid.version.as_deref().unwrap_or_default();
        self.index()
            .execute(
                "INSERT INTO services (guid, name, host, account, repo, template, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    service.guid(),
                    service.name(),
                    uid.host,
                    uid.account,
                    uid.repo,
                    uid.name,
                    version
                ],
            )
            .map_err(index_err)?;
        services.insert(service.guid().to_string(), service);
        Ok(())
    }

    /// Services matching every set field of `filter`, ordered by name then guid.
    pub fn find(&self, filter: &ServiceFilter) -> Result<Vec<Arc<Service>>> {
        let clauses = filter.clauses();
        let mut sql = String::from("SELECT guid FROM services");
        for (i, (column, _)) in clauses.iter().enumerate() {
            sql.push_str(if i == 0 { " WHERE " } else { " AND " });
            sql.push_str(column);
            sql.push_str(&format!(" = ?{}", i + 1));
        }
        sql.push_str(" ORDER BY name, guid");

        let guids: Vec<String> = {
            let conn = self.index();
            let mut stmt = conn.prepare(&sql).map_err(index_err)?;
            let rows = stmt
                .query_map(params_from_iter(clauses.iter().map(|(_, v)| *v)), |row| {
                    row.get(0)
                })
                .map_err(index_err)?;
            rows.collect::<rusqlite::Result<_>>().map_err(index_err)?
        };

        let services = self.services.read().unwrap_or_else(|e| e.into_inner());
        Ok(guids
            .iter()
            .filter_map(|guid| services.get(guid).cloned())
            .collect())
    }

    pub fn get_by_guid(&self, guid: &str) -> Result<Arc<Service>> {
        self.find(&ServiceFilter::by_guid(guid))?
            .into_iter()
            .next()
            .ok_or_else(|| WardenError::ServiceNotFound(guid.to_string()))
    }

    /// Names are not unique; more than one match is an error.
    pub fn get_by_name(&self, name: &str) -> Result<Arc<Service>> {
        let filter = ServiceFilter::by_name(name);
        let mut found = self.find(&filter)?;
        match found.len() {
            0 => Err(WardenError::ServiceNotFound(name.to_string())),
            1 => Ok(found.remove(0)),
            _ => Err(WardenError::TooManyResults(filter.describe())),
        }
    }

    pub fn list(&self) -> Result<Vec<Arc<Service>>> {
        self.find(&ServiceFilter::default())
    }

    /// Remove from both the map and the index.
    pub fn delete(&self, guid: &str) -> Result<Arc<Service>> {
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        let service = services
            .remove(guid)
            .ok_or_else(|| WardenError::ServiceNotFound(guid.to_string()))?;
        if let Err(e) = self
            .index()
            .execute("DELETE FROM services WHERE guid = ?1", params![guid])
        {
            services.insert(guid.to_string(), service);
            return Err(index_err(e));
        }
        Ok(service)
    }

    pub fn len(&self) -> usize {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move `service` onto `template`, keeping its guid, name, data, state and
    /// pending tasks.
    ///
    /// The service leaves the registry before its runtime stops, so nothing
    /// can be scheduled onto the old instance. It is then rebuilt from its
    /// final snapshot, persisted, re-registered and started. If any of that
    /// fails the original template is restored and the error returned.
    pub async fn upgrade(
        &self,
        service: &Arc<Service>,
        template: Arc<Template>,
        factory: &ServiceFactory,
        timeout: Duration,
    ) -> Result<Arc<Service>> {
        let guid = service.guid().to_string();
        let from = service.template().uid().to_string();

        self.delete(&guid)?;
        service.stop(timeout, StopMode::Shutdown).await;
        let snapshot = service.snapshot();

        match self.rebuild(snapshot.clone(), template, factory).await {
            Ok(upgraded) => {
                info!(guid = %guid, from = %from, to = %upgraded.template().uid(), "service upgraded");
                Ok(upgraded)
            }
            Err(e) => {
                error!(guid = %guid, error = %e, "upgrade failed, restoring previous template");
                let restored = factory
                    .materialize(service.template().clone(), snapshot)
                    .await?;
                self.add(restored.clone())?;
                if let Err(save_err) = restored.save().await {
                    warn!(guid = %guid, error = %save_err, "restored service not persisted");
                }
                restored.start();
                Err(e)
            }
        }
    }

    async fn rebuild(
        &self,
        mut snapshot: ServiceSnapshot,
        template: Arc<Template>,
        factory: &ServiceFactory,
    ) -> Result<Arc<Service>> {
        let previous = &snapshot.info;
        let info = ServiceInfo::new(template.uid(), &previous.name, &previous.guid, previous.public);
        snapshot.info = info;

        let upgraded = factory.materialize(template, snapshot).await?;
        let registered = match upgraded.save().await {
            Ok(()) => self.add(upgraded.clone()),
            Err(e) => Err(e),
        };
        if let Err(e) = registered {
            if let Err(close_err) = upgraded.queue().with_archive(|a| a.close()).await {
                warn!(guid = %upgraded.guid(), error = %close_err, "failed to close archive");
            }
            return Err(e);
        }
        upgraded.start();
        Ok(upgraded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArchiveBackend, RuntimeConfig};
    use crate::gate::StartupGate;
    use crate::service::fixtures::{factory, factory_with_store, service, template, uid};
    use crate::service::StateValue;
    use crate::snapshot::kv::memory::FlakyStore;
    use crate::snapshot::SnapshotStore;
    use crate::task::{priority, TaskState};
    use crate::template::{handler_fn, ActionSpec, Args};
    use serde_json::Value;
    use std::sync::atomic::Ordering;

    #[test]
    fn duplicate_guid_is_a_conflict() {
        let reg = ServiceRegistry::new().unwrap();
        let first = service("svc1");
        reg.add(first.clone()).unwrap();
        let err = reg.add(first.clone()).unwrap_err();
        assert!(matches!(err, WardenError::ServiceConflict(_)));
        assert_eq!(reg.len(), 1);
        assert!(Arc::ptr_eq(&reg.get_by_guid(first.guid()).unwrap(), &first));
    }

    #[test]
    fn find_filters_on_identity_fields() {
        let reg = ServiceRegistry::new().unwrap();
        let f = factory();
        let v1 = Arc::new(template("0.0.1"));
        let v2 = Arc::new(template("0.0.2"));
        let a = f.create(v1.clone(), Some("alpha"), None, false).unwrap();
        let b = f.create(v2, Some("beta"), None, false).unwrap();
        let c = f.create(v1, Some("gamma"), None, false).unwrap();
        for s in [&a, &b, &c] {
            reg.add(s.clone()).unwrap();
        }

        let names = |filter: ServiceFilter| -> Vec<String> {
            reg.find(&filter)
                .unwrap()
                .iter()
                .map(|s| s.name().to_string())
                .collect()
        };
        assert_eq!(names(ServiceFilter::default()), ["alpha", "beta", "gamma"]);
        assert_eq!(
            names(ServiceFilter {
                version: Some("0.0.1".into()),
                ..Default::default()
            }),
            ["alpha", "gamma"]
        );
        assert_eq!(
            names(ServiceFilter {
                host: Some("github.com".into()),
                template: Some("node".into()),
                name: Some("beta".into()),
                ..Default::default()
            }),
            ["beta"]
        );
        assert!(names(ServiceFilter {
            repo: Some("other".into()),
            ..Default::default()
        })
        .is_empty());
    }

    #[test]
    fn names_may_repeat_until_looked_up() {
        let reg = ServiceRegistry::new().unwrap();
        reg.add(service("web")).unwrap();
        reg.add(service("web")).unwrap();
        assert_eq!(reg.len(), 2);
        let err = reg.get_by_name("web").unwrap_err();
        assert!(matches!(err, WardenError::TooManyResults(_)));
        assert!(matches!(
            reg.get_by_name("db"),
            Err(WardenError::ServiceNotFound(_))
        ));
    }

    #[test]
    fn delete_removes_from_map_and_index() {
        let reg = ServiceRegistry::new().unwrap();
        let svc = service("svc1");
        reg.add(svc.clone()).unwrap();
        reg.delete(svc.guid()).unwrap();
        assert!(reg.is_empty());
        assert!(reg.find(&ServiceFilter::by_name("svc1")).unwrap().is_empty());
        assert!(matches!(
            reg.delete(svc.guid()),
            Err(WardenError::ServiceNotFound(_))
        ));
        // the guid is free again
        reg.add(svc).unwrap();
    }

    #[tokio::test]
    async fn upgrade_keeps_identity_and_pending_work() {
        let reg = ServiceRegistry::new().unwrap();
        let f = factory();
        let svc = f
            .create(Arc::new(template("0.0.1")), Some("svc1"), None, true)
            .unwrap();
        svc.context().set_state("install", "package", StateValue::Ok);
        let pending = svc.schedule("start", Args::new(), priority::NORMAL).unwrap();
        reg.add(svc.clone()).unwrap();

        let upgraded = reg
            .upgrade(&svc, Arc::new(template("0.0.2")), &f, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(upgraded.guid(), svc.guid());
        assert_eq!(upgraded.template().uid(), &uid("0.0.2"));
        assert_eq!(upgraded.state(), svc.state());
        assert!(upgraded.is_public());
        let queued = upgraded.queue().get_by_guid(&pending.guid).await.unwrap();
        assert_eq!(queued.state, TaskState::New);

        assert!(Arc::ptr_eq(&reg.get_by_guid(svc.guid()).unwrap(), &upgraded));
        let found = reg
            .find(&ServiceFilter {
                version: Some("0.0.2".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(found.len(), 1);

        let stored = f.store().list().await.unwrap();
        assert_eq!(stored[0].info.version, "0.0.2");
        upgraded.stop(Duration::from_secs(1), StopMode::Shutdown).await;
    }
    /// Same action surface as the fixture, except `start` now needs a port.
    fn stricter_template() -> Arc<Template> {
        let t = Template::builder(uid("0.0.2"))
            .action(
                ActionSpec::new("start", handler_fn(|_c, _a| async { Ok(Value::Null) }))
                    .required(["port"]),
            )
            .build()
            .unwrap();
        Arc::new(t)
    }

    #[tokio::test]
    async fn failed_upgrade_restores_the_previous_template() {
        let reg = ServiceRegistry::new().unwrap();
        let f = factory();
        let svc = f
            .create(Arc::new(template("0.0.1")), Some("svc1"), None, false)
            .unwrap();
        let pending = svc.schedule("start", Args::new(), priority::NORMAL).unwrap();
        reg.add(svc.clone()).unwrap();

        let err = reg
            .upgrade(&svc, stricter_template(), &f, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::BadArguments { .. }));

        let restored = reg.get_by_guid(svc.guid()).unwrap();
        assert!(!Arc::ptr_eq(&restored, &svc));
        assert_eq!(restored.template().uid(), &uid("0.0.1"));
        assert!(restored.runtime().is_started());
        let queued = restored.queue().get_by_guid(&pending.guid).await.unwrap();
        assert_eq!(queued.state, TaskState::New);
        restored.stop(Duration::from_secs(1), StopMode::Shutdown).await;
    }

    #[tokio::test]
    async fn upgrade_that_cannot_persist_is_rolled_back() {
        let store = Arc::new(FlakyStore::new());
        let f = factory_with_store(store.clone());
        let reg = ServiceRegistry::new().unwrap();
        let svc = f
            .create(Arc::new(template("0.0.1")), Some("svc1"), None, false)
            .unwrap();
        let pending = svc.schedule("start", Args::new(), priority::NORMAL).unwrap();
        reg.add(svc.clone()).unwrap();

        store.fail_save.store(true, Ordering::SeqCst);
        let err = reg
            .upgrade(&svc, Arc::new(template("0.0.2")), &f, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::Snapshot(_)));

        assert_eq!(reg.len(), 1);
        let restored = reg.get_by_guid(svc.guid()).unwrap();
        assert_eq!(restored.template().uid(), &uid("0.0.1"));
        assert!(restored.queue().get_by_guid(&pending.guid).await.is_ok());
        assert!(store.list().await.unwrap().is_empty());
        restored.stop(Duration::from_secs(1), StopMode::Shutdown).await;
    }

    #[tokio::test(start_paused = true)]
    async fn service_is_unreachable_while_upgrading() {
        let slow = |version: &str| {
            let t = Template::builder(uid(version))
                .action(ActionSpec::new(
                    "slow",
                    handler_fn(|_c, _a| async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(Value::Null)
                    }),
                ))
                .build()
                .unwrap();
            Arc::new(t)
        };
        let gate = StartupGate::new();
        gate.open();
        let store: Arc<dyn SnapshotStore> = Arc::new(FlakyStore::new());
        let f = ServiceFactory::new(store, ArchiveBackend::Memory, RuntimeConfig::default(), gate);
        let reg = Arc::new(ServiceRegistry::new().unwrap());
        let svc = f.create(slow("0.0.1"), Some("svc1"), None, false).unwrap();
        reg.add(svc.clone()).unwrap();
        svc.schedule("slow", Args::new(), priority::NORMAL).unwrap();
        svc.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(svc.queue().current().is_some());

        let upgrading = {
            let (reg, svc, f) = (reg.clone(), svc.clone(), f.clone());
            let target = slow("0.0.2");
            tokio::spawn(async move {
                reg.upgrade(&svc, target, &f, Duration::from_secs(30)).await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(matches!(
            reg.get_by_guid(svc.guid()),
            Err(WardenError::ServiceNotFound(_))
        ));

        let upgraded = upgrading.await.unwrap().unwrap();
        assert_eq!(upgraded.template().uid(), &uid("0.0.2"));
        assert!(Arc::ptr_eq(&reg.get_by_guid(svc.guid()).unwrap(), &upgraded));
        assert_eq!(upgraded.stats().executed, 0);
        upgraded.stop(Duration::from_secs(1), StopMode::Shutdown).await;
    }
}
