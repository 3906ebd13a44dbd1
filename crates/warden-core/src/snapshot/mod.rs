//! Durable service snapshots.
//!
//! A snapshot is four records per service: identity (`service`), `state`,
//! `data` and pending `tasks`. [`SnapshotStore`] hides where they live; the
//! backend is picked once from [`StorageBackend`] and never branched on again.

pub mod fs;
pub mod http_kv;
pub mod kv;
pub mod redb_kv;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::StorageBackend;
use crate::error::{Result, WardenError};
use crate::service::state::{Data, ServiceState};
use crate::task::Task;
use crate::template::uid::TemplateUid;

pub use fs::FsSnapshotStore;
pub use http_kv::HttpKvClient;
pub use kv::{KvClient, KvSnapshotStore};
pub use redb_kv::RedbKvClient;

/// Identity record persisted as `service.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Template uid without version.
    pub template: String,
    pub version: String,
    pub name: String,
    pub guid: String,
    #[serde(default)]
    pub public: bool,
}

impl ServiceInfo {
    pub fn new(template: &TemplateUid, name: &str, guid: &str, public: bool) -> Self {
        Self {
            template: template.unversioned().to_string(),
            version: template.version.clone().unwrap_or_default(),
            name: name.to_string(),
            guid: guid.to_string(),
            public,
        }
    }

    /// The full declared uid, version included.
    pub fn template_uid(&self) -> Result<TemplateUid> {
        let mut uid: TemplateUid = self.template.parse()?;
        if !self.version.is_empty() {
            crate::template::uid::validate_version(&self.version)?;
            uid.version = Some(self.version.clone());
        }
        Ok(uid)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSnapshot {
    pub info: ServiceInfo,
    pub state: ServiceState,
    pub data: Data,
    pub tasks: Vec<Task>,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &ServiceSnapshot) -> Result<()>;

    /// Every persisted service, for bulk recovery.
    async fn list(&self) -> Result<Vec<ServiceSnapshot>>;

    async fn delete(&self, info: &ServiceInfo) -> Result<()>;

    /// Write then delete a probe record.
    async fn health(&self) -> Result<()>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

pub fn open_store(backend: &StorageBackend) -> Result<Arc<dyn SnapshotStore>> {
    let store: Arc<dyn SnapshotStore> = match backend {
        StorageBackend::Filesystem { path } => Arc::new(FsSnapshotStore::new(path.clone())),
        StorageBackend::EmbeddedKv { path, prefix } => Arc::new(KvSnapshotStore::new(
            RedbKvClient::open(path)?,
            prefix.clone(),
        )),
        StorageBackend::HttpKv { url, prefix, token } => Arc::new(KvSnapshotStore::new(
            HttpKvClient::new(url, token.clone())?,
            prefix.clone(),
        )),
    };
    tracing::info!(store = %store.describe(), "snapshot store opened");
    Ok(store)
}

/// Run blocking storage work off the async worker threads.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| WardenError::Snapshot(format!("storage worker failed: {e}")))?
}

#[cfg(test)]
pub(crate) mod conformance {
    //! Behaviour every store must share.

    use super::*;
    use crate::service::state::StateValue;
    use crate::task::{priority, Task};
    use crate::template::action::Args;
    use serde_json::json;

    pub fn snapshot(name: &str, guid: &str) -> ServiceSnapshot {
        let uid: TemplateUid = "github.com/acct/repo/node/0.0.1".parse().unwrap();
        let mut state = ServiceState::new();
        state.set("install", "package", StateValue::Ok);
        state.set("health", "http", StateValue::Warning);
        let mut task = Task::new("start", Args::new());
        task.priority = priority::RECURRING;
        ServiceSnapshot {
            info: ServiceInfo::new(&uid, name, guid, true),
            state,
            data: json!({"port": 8080, "tags": ["a", "b"]})
                .as_object()
                .cloned()
                .unwrap(),
            tasks: vec![task],
        }
    }

    pub async fn save_list_delete(store: &dyn SnapshotStore) {
        assert!(store.list().await.unwrap().is_empty());

        let a = snapshot("svc1", "guid-a");
        let b = snapshot("svc2", "guid-b");
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();
        // saving again overwrites in place
        store.save(&a).await.unwrap();

        let mut listed = store.list().await.unwrap();
        listed.sort_by(|x, y| x.info.guid.cmp(&y.info.guid));
        assert_eq!(listed, vec![a.clone(), b.clone()]);

        store.delete(&a.info).await.unwrap();
        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].info.guid, "guid-b");

        store.health().await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
