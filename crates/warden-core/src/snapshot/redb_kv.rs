//! Embedded key/value backend on a single redb file.
//!
//! # Table design
//!
//! One `SNAPSHOTS` table, `&str -> &[u8]`. Keys are `<prefix>/<guid>/<record>`
//! so every service's records are contiguous and a prefix range scan finds
//! them without post-filtering.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{Result, WardenError};
use crate::snapshot::{blocking, KvClient};

const SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");

fn db_err(e: impl std::fmt::Display) -> WardenError {
    WardenError::Snapshot(e.to_string())
}

#[derive(Clone)]
pub struct RedbKvClient {
    db: Arc<Database>,
    path: String,
}

impl RedbKvClient {
    /// Open or create the database at `path`, creating the table up front.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            crate::io::ensure_dir(parent)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(SNAPSHOTS).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self {
            db: Arc::new(db),
            path: path.display().to_string(),
        })
    }

    fn get_sync(db: &Database, key: &str) -> Result<Option<Vec<u8>>> {
        let rt = db.begin_read().map_err(db_err)?;
        let table = rt.open_table(SNAPSHOTS).map_err(db_err)?;
        Ok(table
            .get(key)
            .map_err(db_err)?
            .map(|v| v.value().to_vec()))
    }

    fn put_sync(db: &Database, key: &str, value: &[u8]) -> Result<()> {
        let wt = db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(SNAPSHOTS).map_err(db_err)?;
            table.insert(key, value).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    fn keys_in<T: ReadableTable<&'static str, &'static [u8]>>(
        table: &T,
        prefix: &str,
    ) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in table.range(prefix..).map_err(db_err)? {
            let (k, _) = entry.map_err(db_err)?;
            let key = k.value();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_string());
        }
        Ok(keys)
    }

    fn delete_prefix_sync(db: &Database, prefix: &str) -> Result<()> {
        let wt = db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(SNAPSHOTS).map_err(db_err)?;
            let doomed = Self::keys_in(&table, prefix)?;
            for key in doomed {
                table.remove(key.as_str()).map_err(db_err)?;
            }
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    fn keys_sync(db: &Database, prefix: &str) -> Result<Vec<String>> {
        let rt = db.begin_read().map_err(db_err)?;
        let table = rt.open_table(SNAPSHOTS).map_err(db_err)?;
        Self::keys_in(&table, prefix)
    }
}

#[async_trait]
impl KvClient for RedbKvClient {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let db = self.db.clone();
        let key = key.to_string();
        blocking(move || Self::get_sync(&db, &key)).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let db = self.db.clone();
        let key = key.to_string();
        blocking(move || Self::put_sync(&db, &key, &value)).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let db = self.db.clone();
        let prefix = prefix.to_string();
        blocking(move || Self::delete_prefix_sync(&db, &prefix)).await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let db = self.db.clone();
        let prefix = prefix.to_string();
        blocking(move || Self::keys_sync(&db, &prefix)).await
    }

    fn describe(&self) -> String {
        format!("redb:{}", self.path)
    }
}
