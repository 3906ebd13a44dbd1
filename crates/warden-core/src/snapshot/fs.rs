use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::{Result, WardenError};
use crate::io::{atomic_write, ensure_dir, prune_empty_parents, remove_dir_if_exists};
use crate::paths::{self, DATA_FILE, SERVICE_FILE, STATE_FILE, TASKS_FILE};
use crate::snapshot::{blocking, ServiceInfo, ServiceSnapshot, SnapshotStore};

/// Snapshots laid out as
/// `<root>/<host>/<account>/<repo>/<name>/<service name>/<guid>/{service,state,data,tasks}.yaml`.
///
/// The layout is part of the disaster-recovery contract and must stay stable.
pub struct FsSnapshotStore {
    root: PathBuf,
}

/// Directory depth of a service below the root.
const LAYOUT_DEPTH: usize = 6;

impl FsSnapshotStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn service_dir(&self, info: &ServiceInfo) -> Result<PathBuf> {
        Ok(paths::service_dir(
            &self.root,
            &info.template_uid()?,
            &info.name,
            &info.guid,
        ))
    }
}

fn save_sync(root: &Path, snapshot: &ServiceSnapshot) -> Result<()> {
    let info = &snapshot.info;
    let dir = paths::service_dir(root, &info.template_uid()?, &info.name, &info.guid);
    ensure_dir(&dir)?;
    atomic_write(&dir.join(SERVICE_FILE), serde_yaml::to_string(info)?.as_bytes())?;
    atomic_write(&dir.join(STATE_FILE), serde_yaml::to_string(&snapshot.state)?.as_bytes())?;
    atomic_write(&dir.join(DATA_FILE), serde_yaml::to_string(&snapshot.data)?.as_bytes())?;
    atomic_write(&dir.join(TASKS_FILE), serde_yaml::to_string(&snapshot.tasks)?.as_bytes())?;
    Ok(())
}

fn read_yaml<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&raw)
        .map_err(|e| WardenError::Snapshot(format!("{}: {e}", path.display())))
}

/// Read one service directory and check it sits where its declared identity
/// says it should.
fn read_service(dir: &Path, components: &[String]) -> Result<ServiceSnapshot> {
    let raw = std::fs::read_to_string(dir.join(SERVICE_FILE))?;
    let info: ServiceInfo = serde_yaml::from_str(&raw)
        .map_err(|e| WardenError::Snapshot(format!("{}: {e}", dir.join(SERVICE_FILE).display())))?;
    let declared = info.template_uid()?;

    let [host, account, repo, name, service_name, guid] = components else {
        return Err(WardenError::Snapshot(format!(
            "{} is not a service directory",
            dir.display()
        )));
    };
    let mismatch = || WardenError::TemplateMismatch {
        declared: format!("{declared} ({}/{})", info.name, info.guid),
        location: dir.display().to_string(),
    };
    if (host, account, repo, name)
        != (&declared.host, &declared.account, &declared.repo, &declared.name)
    {
        return Err(mismatch());
    }
    if service_name != &info.name || guid != &info.guid {
        return Err(mismatch());
    }

    Ok(ServiceSnapshot {
        state: read_yaml(&dir.join(STATE_FILE))?,
        data: read_yaml(&dir.join(DATA_FILE))?,
        tasks: read_yaml(&dir.join(TASKS_FILE))?,
        info,
    })
}

fn subdirs(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        out.push((name, entry.path()));
    }
    out.sort();
    Ok(out)
}

fn walk(dir: &Path, components: &mut Vec<String>, out: &mut Vec<ServiceSnapshot>) -> Result<()> {
    if components.len() == LAYOUT_DEPTH {
        if dir.join(SERVICE_FILE).exists() {
            out.push(read_service(dir, components)?);
        }
        return Ok(());
    }
    for (name, path) in subdirs(dir)? {
        components.push(name);
        walk(&path, components, out)?;
        components.pop();
    }
    Ok(())
}

fn list_sync(root: &Path) -> Result<Vec<ServiceSnapshot>> {
    let mut out = Vec::new();
    if root.is_dir() {
        walk(root, &mut Vec::with_capacity(LAYOUT_DEPTH), &mut out)?;
    }
    Ok(out)
}

fn delete_sync(root: &Path, info: &ServiceInfo) -> Result<()> {
    let dir = paths::service_dir(root, &info.template_uid()?, &info.name, &info.guid);
    remove_dir_if_exists(&dir)?;
    prune_empty_parents(&dir, root);
    Ok(())
}

fn health_sync(root: &Path) -> Result<()> {
    ensure_dir(root)?;
    let probe = root.join(format!(".health-{}", uuid::Uuid::new_v4()));
    atomic_write(&probe, b"ok")?;
    std::fs::remove_file(&probe)?;
    Ok(())
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    async fn save(&self, snapshot: &ServiceSnapshot) -> Result<()> {
        let root = self.root.clone();
        let snapshot = snapshot.clone();
        blocking(move || save_sync(&root, &snapshot)).await
    }

    async fn list(&self) -> Result<Vec<ServiceSnapshot>> {
        let root = self.root.clone();
        blocking(move || list_sync(&root)).await
    }

    async fn delete(&self, info: &ServiceInfo) -> Result<()> {
        let root = self.root.clone();
        let info = info.clone();
        blocking(move || delete_sync(&root, &info)).await
    }

    async fn health(&self) -> Result<()> {
        let root = self.root.clone();
        blocking(move || health_sync(&root)).await
    }

    fn describe(&self) -> String {
        format!("filesystem:{}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::conformance;
    use tempfile::TempDir;

    #[tokio::test]
    async fn save_list_delete() {
        let dir = TempDir::new().unwrap();
        let store = FsSnapshotStore::new(dir.path().join("services"));
        conformance::save_list_delete(&store).await;
    }

    #[tokio::test]
    async fn writes_four_files_in_stable_layout() {
        let dir = TempDir::new().unwrap();
        let store = FsSnapshotStore::new(dir.path().to_path_buf());
        let snap = conformance::snapshot("svc1", "g1");
        store.save(&snap).await.unwrap();

        let svc_dir = dir.path().join("github.com/acct/repo/node/svc1/g1");
        for file in [SERVICE_FILE, STATE_FILE, DATA_FILE, TASKS_FILE] {
            assert!(svc_dir.join(file).is_file(), "missing {file}");
        }
        assert_eq!(store.service_dir(&snap.info).unwrap(), svc_dir);
    }

    #[tokio::test]
    async fn delete_prunes_empty_parents() {
        let dir = TempDir::new().unwrap();
        let store = FsSnapshotStore::new(dir.path().to_path_buf());
        let snap = conformance::snapshot("svc1", "g1");
        store.save(&snap).await.unwrap();
        store.delete(&snap.info).await.unwrap();
        assert!(!dir.path().join("github.com").exists());
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn relocated_directory_is_a_template_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = FsSnapshotStore::new(dir.path().to_path_buf());
        let snap = conformance::snapshot("svc1", "g1");
        store.save(&snap).await.unwrap();

        let from = dir.path().join("github.com/acct/repo/node");
        let to = dir.path().join("github.com/acct/repo/vm");
        std::fs::rename(&from, &to).unwrap();

        let err = store.list().await.unwrap_err();
        assert!(matches!(err, WardenError::TemplateMismatch { .. }), "{err}");
    }

    #[tokio::test]
    async fn missing_optional_files_default_to_empty() {
        let dir = TempDir::new().unwrap();
        let store = FsSnapshotStore::new(dir.path().to_path_buf());
        let snap = conformance::snapshot("svc1", "g1");
        store.save(&snap).await.unwrap();
        let svc_dir = store.service_dir(&snap.info).unwrap();
        std::fs::remove_file(svc_dir.join(TASKS_FILE)).unwrap();
        std::fs::remove_file(svc_dir.join(STATE_FILE)).unwrap();

        let listed = store.list().await.unwrap();
        assert!(listed[0].tasks.is_empty());
        assert!(listed[0].state.is_empty());
        assert_eq!(listed[0].data, snap.data);
    }

    #[tokio::test]
    async fn health_leaves_no_probe_behind() {
        let dir = TempDir::new().unwrap();
        let store = FsSnapshotStore::new(dir.path().join("fresh"));
        store.health().await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path().join("fresh")).unwrap().count(), 0);
    }
}
