use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::{Result, WardenError};
use crate::io::{atomic_write, ensure_dir, remove_dir_if_exists};
use crate::task::archive::{in_range, TaskArchive};
use crate::task::Task;

/// Archive stored as `<dir>/<seq>_<guid>.yaml`, one file per task.
///
/// The zero-padded sequence prefix keeps directory order equal to insertion
/// order; the next sequence number is recovered by scanning at open.
pub struct FileArchive {
    dir: PathBuf,
    next_seq: u64,
    closed: bool,
}

struct Entry {
    seq: u64,
    guid: String,
    path: PathBuf,
}

impl FileArchive {
    pub fn open(dir: &Path) -> Result<Self> {
        ensure_dir(dir)?;
        let mut archive = Self {
            dir: dir.to_path_buf(),
            next_seq: 0,
            closed: false,
        };
        archive.next_seq = archive.entries()?.last().map_or(0, |e| e.seq + 1);
        Ok(archive)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(WardenError::Archive("archive is closed".into()));
        }
        Ok(())
    }

    /// Entries sorted by sequence number. Files that do not follow the naming
    /// scheme are ignored.
    fn entries(&self) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        if !self.dir.exists() {
            return Ok(out);
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(stem) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".yaml"))
            else {
                continue;
            };
            let Some((seq, guid)) = stem.split_once('_') else {
                continue;
            };
            let Ok(seq) = seq.parse::<u64>() else {
                continue;
            };
            out.push(Entry {
                seq,
                guid: guid.to_string(),
                path: path.clone(),
            });
        }
        out.sort_by_key(|e| e.seq);
        Ok(out)
    }

    fn read(path: &Path) -> Result<Task> {
        let raw = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&raw)
            .map_err(|e| WardenError::Archive(format!("{}: {e}", path.display())))
    }
}

impl TaskArchive for FileArchive {
    fn add(&mut self, task: &Task) -> Result<()> {
        self.check_open()?;
        if self.entries()?.iter().any(|e| e.guid == task.guid) {
            return Err(WardenError::TaskConflict(task.guid.clone()));
        }
        let path = self
            .dir
            .join(format!("{:020}_{}.yaml", self.next_seq, task.guid));
        atomic_write(&path, serde_yaml::to_string(task)?.as_bytes())?;
        self.next_seq += 1;
        Ok(())
    }

    fn get(&self, guid: &str) -> Result<Task> {
        self.check_open()?;
        let entry = self
            .entries()?
            .into_iter()
            .find(|e| e.guid == guid)
            .ok_or_else(|| WardenError::TaskNotFound(guid.to_string()))?;
        Self::read(&entry.path)
    }

    fn list(&self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Result<Vec<Task>> {
        self.check_open()?;
        let mut tasks = Vec::new();
        for entry in self.entries()? {
            let task = Self::read(&entry.path)?;
            if in_range(&task, from, to) {
                tasks.push(task);
            }
        }
        // stable: equal timestamps keep insertion order
        tasks.sort_by_key(|t| t.created);
        Ok(tasks)
    }

    fn count(&self) -> Result<usize> {
        self.check_open()?;
        Ok(self.entries()?.len())
    }

    fn delete_until(&mut self, until: DateTime<Utc>) -> Result<usize> {
        self.check_open()?;
        let mut removed = 0;
        for entry in self.entries()? {
            if Self::read(&entry.path)?.created <= until {
                std::fs::remove_file(&entry.path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn drop_all(&mut self) -> Result<()> {
        self.check_open()?;
        remove_dir_if_exists(&self.dir)?;
        self.closed = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
