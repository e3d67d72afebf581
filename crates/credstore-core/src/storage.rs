//! SQLite-backed secrets storage plugin.

use crate::error::{StoreError, StoreResult};
use credstore_provider::SecretsStorage;
use log::{debug, info};
use rusqlite::Connection;
use std::path::Path;

/// Opens one SQLite database per store. The orchestrator opens this against
/// the mounted encrypted filesystem and closes it before unmount, so a
/// lingering connection can never pin the mount.
#[derive(Default)]
pub struct SqliteSecretsStorage {
    conn: Option<Connection>,
}

impl SqliteSecretsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.conn.as_ref()
    }
}

impl SecretsStorage for SqliteSecretsStorage {
    type Error = StoreError;

    fn open(&mut self, path: &Path) -> StoreResult<()> {
        if self.conn.is_some() {
            debug!("secrets database already open");
            return Ok(());
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS credentials (
                 id INTEGER PRIMARY KEY,
                 caller TEXT NOT NULL,
                 username TEXT NOT NULL,
                 secret BLOB NOT NULL,
                 updated_at INTEGER NOT NULL DEFAULT (strftime('%s','now')),
                 UNIQUE (caller, username)
             );",
        )?;
        info!("secrets database open at {}", path.display());
        self.conn = Some(conn);
        Ok(())
    }

    fn close(&mut self) -> StoreResult<()> {
        if let Some(conn) = self.conn.take() {
            conn.close()
                .map_err(|(_, err)| StoreError::Storage(err.to_string()))?;
            info!("secrets database closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.conn.is_some()
    }
}
