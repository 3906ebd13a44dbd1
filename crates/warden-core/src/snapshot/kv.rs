use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, WardenError};
use crate::snapshot::{ServiceInfo, ServiceSnapshot, SnapshotStore};

const SERVICE_KEY: &str = "service";
const STATE_KEY: &str = "state";
const DATA_KEY: &str = "data";
const TASKS_KEY: &str = "tasks";
const HEALTH_SEGMENT: &str = ".health";

/// Minimal key/value surface a snapshot backend needs.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Delete every key starting with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    /// Every key starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    fn describe(&self) -> String;
}

/// Snapshots stored as `<prefix>/<guid>/{service,state,data,tasks}`, each
/// value a YAML document.
pub struct KvSnapshotStore<C> {
    client: C,
    prefix: String,
}

impl<C: KvClient> KvSnapshotStore<C> {
    pub fn new(client: C, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        Self { client, prefix }
    }

    fn key(&self, guid: &str, record: &str) -> String {
        format!("{}/{guid}/{record}", self.prefix)
    }

    async fn put_yaml<T: Serialize>(&self, guid: &str, record: &str, value: &T) -> Result<()> {
        let body = serde_yaml::to_string(value)?;
        self.client
            .put(&self.key(guid, record), body.into_bytes())
            .await
    }

    async fn get_yaml<T: DeserializeOwned + Default>(&self, guid: &str, record: &str) -> Result<T> {
        let key = self.key(guid, record);
        match self.client.get(&key).await? {
            None => Ok(T::default()),
            Some(raw) => serde_yaml::from_slice(&raw)
                .map_err(|e| WardenError::Snapshot(format!("{key}: {e}"))),
        }
    }

    async fn read(&self, guid: &str) -> Result<Option<ServiceSnapshot>> {
        let key = self.key(guid, SERVICE_KEY);
        let Some(raw) = self.client.get(&key).await? else {
            return Ok(None);
        };
        let info: ServiceInfo = serde_yaml::from_slice(&raw)
            .map_err(|e| WardenError::Snapshot(format!("{key}: {e}")))?;
        if info.guid != guid {
            return Err(WardenError::Snapshot(format!(
                "{key} declares guid {} but is stored under {guid}",
                info.guid
            )));
        }
        // surface an unparseable uid here rather than at recovery
        info.template_uid()?;
        Ok(Some(ServiceSnapshot {
            state: self.get_yaml(guid, STATE_KEY).await?,
            data: self.get_yaml(guid, DATA_KEY).await?,
            tasks: self.get_yaml(guid, TASKS_KEY).await?,
            info,
        }))
    }
}

#[async_trait]
impl<C: KvClient> SnapshotStore for KvSnapshotStore<C> {
    async fn save(&self, snapshot: &ServiceSnapshot) -> Result<()> {
        let guid = &snapshot.info.guid;
        self.put_yaml(guid, STATE_KEY, &snapshot.state).await?;
        self.put_yaml(guid, DATA_KEY, &snapshot.data).await?;
        self.put_yaml(guid, TASKS_KEY, &snapshot.tasks).await?;
        // identity last: a service without it is invisible to `list`
        self.put_yaml(guid, SERVICE_KEY, &snapshot.info).await
    }

    async fn list(&self) -> Result<Vec<ServiceSnapshot>> {
        let root = format!("{}/", self.prefix);
        let mut guids = BTreeSet::new();
        for key in self.client.keys(&root).await? {
            let Some((guid, record)) = key.strip_prefix(&root).and_then(|k| k.split_once('/'))
            else {
                continue;
            };
            if guid == HEALTH_SEGMENT {
                continue;
            }
            if record == SERVICE_KEY {
                guids.insert(guid.to_string());
            }
        }
        let mut out = Vec::with_capacity(guids.len());
        for guid in &guids {
            if let Some(snapshot) = self.read(guid).await? {
                out.push(snapshot);
            }
        }
        Ok(out)
    }

    async fn delete(&self, info: &ServiceInfo) -> Result<()> {
        self.client
            .delete_prefix(&format!("{}/{}/", self.prefix, info.guid))
            .await
    }

    async fn health(&self) -> Result<()> {
        let key = self.key(HEALTH_SEGMENT, &uuid::Uuid::new_v4().to_string());
        self.client.put(&key, b"ok".to_vec()).await?;
        self.client.delete_prefix(&key).await
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.client.describe(), self.prefix)
    }
}
