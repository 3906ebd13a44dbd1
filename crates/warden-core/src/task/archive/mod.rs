//! Durable storage for tasks that left the queue.
//!
//! Two interchangeable backends:
//! - [`SqliteArchive`]: one table indexed on creation time
//! - [`FileArchive`]: one YAML file per task named `<seq>_<guid>.yaml`
//!
//! Every service owns exactly one archive handle; handles are never shared.

pub mod files;
pub mod sqlite;

use std::path::Path;

use chrono::{DateTime, Utc};

use crate::config::ArchiveBackend;
use crate::error::Result;
use crate::task::Task;

pub use files::FileArchive;
pub use sqlite::SqliteArchive;

pub trait TaskArchive: Send {
    /// Store a task. Fails with `TaskConflict` if its guid is already archived.
    fn add(&mut self, task: &Task) -> Result<()>;

    /// Fails with `TaskNotFound` for an unknown guid.
    fn get(&self, guid: &str) -> Result<Task>;

    /// Tasks whose creation time lies in `[from, to]`, oldest first.
    fn list(&self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Result<Vec<Task>>;

    fn count(&self) -> Result<usize>;

    /// Remove every task created at or before `until`. Returns how many were removed.
    fn delete_until(&mut self, until: DateTime<Utc>) -> Result<usize>;

    /// Remove every task and the backing storage, then close the handle.
    fn drop_all(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Open the archive of service `guid` with the configured backend.
pub fn open(backend: &ArchiveBackend, guid: &str) -> Result<Box<dyn TaskArchive>> {
    Ok(match backend {
        ArchiveBackend::Sqlite { path } => Box::new(SqliteArchive::open(&service_dir(path, guid))?),
        ArchiveBackend::Files { path } => Box::new(FileArchive::open(&service_dir(path, guid))?),
        ArchiveBackend::Memory => Box::new(SqliteArchive::open_in_memory()?),
    })
}

fn service_dir(root: &Path, guid: &str) -> std::path::PathBuf {
    root.join(guid)
}

fn in_range(task: &Task, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> bool {
    from.map_or(true, |f| task.created >= f) && to.map_or(true, |t| task.created <= t)
}
