//! SQLite-backed task archive.
//!
//! # Table design
//!
//! ```text
//! tasks(seq INTEGER PRIMARY KEY, guid TEXT UNIQUE, created REAL, payload TEXT)
//! ```
//!
//! `created` is indexed so range listing and retention trims are index scans;
//! `payload` holds the JSON-encoded task and is the source of truth on read.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use crate::error::{Result, WardenError};
use crate::task::archive::TaskArchive;
use crate::task::{epoch, Task};

pub const DB_FILE: &str = "tasks.sqlite";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    seq     INTEGER PRIMARY KEY AUTOINCREMENT,
    guid    TEXT NOT NULL UNIQUE,
    created REAL NOT NULL,
    payload TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS tasks_created ON tasks(created);
";

fn db_err(e: rusqlite::Error) -> WardenError {
    WardenError::Archive(e.to_string())
}

pub struct SqliteArchive {
    conn: Option<Connection>,
    dir: Option<PathBuf>,
}

impl SqliteArchive {
    /// Open or create the archive database inside `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        crate::io::ensure_dir(dir)?;
        let conn = Connection::open(dir.join(DB_FILE)).map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Some(conn),
            dir: Some(dir.to_path_buf()),
        })
    }

    /// A throwaway archive that lives as long as the handle.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Some(conn),
            dir: None,
        })
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| WardenError::Archive("archive is closed".into()))
    }

    fn decode(payload: String) -> Result<Task> {
        serde_json::from_str(&payload).map_err(|e| WardenError::Archive(e.to_string()))
    }
}

impl TaskArchive for SqliteArchive {
    fn add(&mut self, task: &Task) -> Result<()> {
        let payload = serde_json::to_string(task)?;
        let res = self.conn()?.execute(
            "INSERT INTO tasks (guid, created, payload) VALUES (?1, ?2, ?3)",
            params![task.guid, epoch::to_secs(&task.created), payload],
        );
        match res {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(WardenError::TaskConflict(task.guid.clone()))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    fn get(&self, guid: &str) -> Result<Task> {
        let payload: Option<String> = self
            .conn()?
            .query_row(
                "SELECT payload FROM tasks WHERE guid = ?1",
                params![guid],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match payload {
            Some(p) => Self::decode(p),
            None => Err(WardenError::TaskNotFound(guid.to_string())),
        }
    }

    fn list(&self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Result<Vec<Task>> {
        let lo = from.map_or(f64::NEG_INFINITY, |t| epoch::to_secs(&t));
        let hi = to.map_or(f64::INFINITY, |t| epoch::to_secs(&t));
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT payload FROM tasks WHERE created >= ?1 AND created <= ?2 \
                 ORDER BY created, seq",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![lo, hi], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(Self::decode(row.map_err(db_err)?)?);
        }
        Ok(tasks)
    }

    fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(n as usize)
    }

    fn delete_until(&mut self, until: DateTime<Utc>) -> Result<usize> {
        self.conn()?
            .execute(
                "DELETE FROM tasks WHERE created <= ?1",
                params![epoch::to_secs(&until)],
            )
            .map_err(db_err)
    }

    fn drop_all(&mut self) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM tasks", [])
            .map_err(db_err)?;
        self.close()?;
        if let Some(dir) = &self.dir {
            crate::io::remove_dir_if_exists(dir)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| db_err(e))?;
        }
        Ok(())
    }
}
