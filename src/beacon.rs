//! SQLite store for beacon records and live session bookkeeping.
//!
//! Beacons are peers whose identity and reachability the relay tracks
//! durably: one row per (port, pub_key), created when a genesis block
//! arrives from a new peer and refreshed (last ping) on every block after
//! that.  The `alive_beams` table tracks which secure channels are
//! currently open in this process so a connection broadcast can fan out to
//! them.  The node's own keypair lives in the `identity` table.
//!
//! The store is shared by every relay task in the process; the connection
//! sits behind a mutex and writes rely on SQLite's uniqueness constraint
//! with an update-in-place fallback, so concurrent connections can race
//! freely on the same peer key.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};

use crate::crypto::NodeKeypair;

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    PoisonedLock,
    MissingIdentity,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StoreError::PoisonedLock => write!(f, "store lock poisoned"),
            StoreError::MissingIdentity => write!(f, "no node identity in store"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

/// A persisted beacon record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconRow {
    pub pub_key: String,
    pub ipv4: String,
    pub port: u16,
    pub version: u32,
    pub last_ping: u64,
}

/// A currently-open secure channel in this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliveBeamRow {
    pub pub_key: String,
    pub ready: bool,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Shared handle to the relay's SQLite store.
#[derive(Clone)]
pub struct BeaconStore {
    conn: Arc<Mutex<Connection>>,
}

impl BeaconStore {
    /// Open or create a database at the given path. Creates schema if needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_schema()?;
        Ok(store)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS identity (
                signing_pub  TEXT NOT NULL,
                signing_priv TEXT NOT NULL,
                enc_pub      TEXT NOT NULL,
                enc_priv     TEXT NOT NULL,
                created_at   INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS node_info (
                pub_key    TEXT NOT NULL,
                ipv4       TEXT NOT NULL,
                port       INTEGER NOT NULL,
                version    INTEGER NOT NULL,
                last_ping  INTEGER NOT NULL,
                UNIQUE(port, pub_key)
            );
            CREATE INDEX IF NOT EXISTS idx_node_info_pub
                ON node_info(pub_key);

            CREATE TABLE IF NOT EXISTS alive_beams (
                pub_key  TEXT PRIMARY KEY,
                ready    INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS known_keys (
                pub_key     TEXT PRIMARY KEY,
                can_encrypt INTEGER NOT NULL DEFAULT 0,
                description TEXT,
                added_at    INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::PoisonedLock)
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    /// Load the node keypair, generating and persisting one on first run.
    pub fn load_or_create_identity(&self) -> Result<NodeKeypair, StoreError> {
        if let Some(existing) = self.get_identity()? {
            return Ok(existing);
        }
        let keypair = NodeKeypair::generate();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO identity (signing_pub, signing_priv, enc_pub, enc_priv, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                keypair.signing_public_key_hex,
                keypair.signing_private_key_hex,
                keypair.enc_public_key_hex,
                keypair.enc_private_key_hex,
                now_secs() as i64,
            ],
        )?;
        Ok(keypair)
    }

    pub fn get_identity(&self) -> Result<Option<NodeKeypair>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT signing_pub, signing_priv, enc_pub, enc_priv FROM identity LIMIT 1",
        )?;
        let row = stmt
            .query_row([], |row| {
                Ok(NodeKeypair {
                    signing_public_key_hex: row.get(0)?,
                    signing_private_key_hex: row.get(1)?,
                    enc_public_key_hex: row.get(2)?,
                    enc_private_key_hex: row.get(3)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    // -----------------------------------------------------------------------
    // Beacon records
    // -----------------------------------------------------------------------

    /// Persist a new beacon.  A (port, pub_key) conflict means the peer
    /// reconnected; fall back to refreshing its last ping in place.
    pub fn save_beacon(&self, row: &BeaconRow) -> Result<(), StoreError> {
        let result = {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO node_info (pub_key, ipv4, port, version, last_ping)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    row.pub_key,
                    row.ipv4,
                    row.port as i64,
                    row.version as i64,
                    row.last_ping as i64,
                ],
            )
        };
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                self.update_beacon(&row.pub_key)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Refresh a beacon's last-ping timestamp.  A no-op for unknown keys.
    pub fn update_beacon(&self, pub_key: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let affected = conn.execute(
            "UPDATE node_info SET last_ping = ?1 WHERE pub_key = ?2",
            params![now_secs() as i64, pub_key],
        )?;
        Ok(affected > 0)
    }

    pub fn get_beacon(&self, pub_key: &str) -> Result<Option<BeaconRow>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT pub_key, ipv4, port, version, last_ping
             FROM node_info WHERE pub_key = ?1",
        )?;
        let row = stmt
            .query_row(params![pub_key], |row| {
                Ok(BeaconRow {
                    pub_key: row.get(0)?,
                    ipv4: row.get(1)?,
                    port: row.get::<_, i64>(2)? as u16,
                    version: row.get::<_, i64>(3)? as u32,
                    last_ping: row.get::<_, i64>(4)? as u64,
                })
            })
            .optional()?;
        Ok(row)
    }

    pub fn beacon_count(&self) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM node_info", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Remove the record for an explicitly disconnected beacon.
    pub fn delete_beacon(&self, port: u16, pub_key: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let affected = conn.execute(
            "DELETE FROM node_info WHERE port = ?1 AND pub_key = ?2",
            params![port as i64, pub_key],
        )?;
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Alive beams
    // -----------------------------------------------------------------------

    pub fn mark_beam_alive(&self, pub_key: &str, ready: bool) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO alive_beams (pub_key, ready) VALUES (?1, ?2)",
            params![pub_key, ready as i32],
        )?;
        Ok(())
    }

    pub fn remove_alive_beam(&self, pub_key: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let affected = conn.execute(
            "DELETE FROM alive_beams WHERE pub_key = ?1",
            params![pub_key],
        )?;
        Ok(affected > 0)
    }

    /// All beams currently marked ready, the broadcast fan-out set.
    pub fn list_ready_beams(&self) -> Result<Vec<AliveBeamRow>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT pub_key, ready FROM alive_beams WHERE ready = 1")?;
        let rows = stmt.query_map([], |row| {
            Ok(AliveBeamRow {
                pub_key: row.get(0)?,
                ready: row.get::<_, i32>(1)? != 0,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Known keys (acknowledged contacts)
    // -----------------------------------------------------------------------

    pub fn save_known_key(
        &self,
        pub_key: &str,
        can_encrypt: bool,
        description: &str,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO known_keys (pub_key, can_encrypt, description, added_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![pub_key, can_encrypt as i32, description, now_secs() as i64],
        )?;
        Ok(())
    }
}
