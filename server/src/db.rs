//! SQLite-backed player and group stores
//!
//! Player and group documents are kept as JSON text next to the columns
//! they are looked up by:
//! - `players`: `_id` primary key, unique serial number, last socket id
//! - `groups`: `_id` primary key, indexed name
//!
//! The unique index on the serial number is what keeps a serial from ever
//! owning two records, even if two processes share one database file.

use crate::error::StoreError;
use crate::model::{GroupRecord, PlayerRecord};
use crate::store::{GroupStore, PlayerStore};
use async_trait::async_trait;
use log::info;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Player and group documents in one SQLite database
///
/// Implements both [`PlayerStore`] and [`GroupStore`]; wrap it in an `Arc`
/// and hand the same instance to the check-in processor for both.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path` and makes sure the tables exist
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use server::db::SqliteStore;
    /// use std::path::Path;
    ///
    /// let store = SqliteStore::open(Path::new("players.db")).unwrap();
    /// ```
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self::init(conn)?;
        info!("Opened player database {}", path.display());
        Ok(store)
    }

    /// Opens a private database that disappears with the store
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS players (
                id TEXT PRIMARY KEY,
                serial TEXT NOT NULL UNIQUE,
                socket TEXT,
                document TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_players_socket ON players (socket);
            CREATE TABLE IF NOT EXISTS groups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                document TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_groups_name ON groups (name);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Inserts or replaces group documents by `_id`
    ///
    /// Used to seed the database from a groups file at startup. All groups
    /// are written in one transaction.
    pub fn upsert_groups(&self, groups: &[GroupRecord]) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for group in groups {
            tx.execute(
                "INSERT INTO groups (id, name, document) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     document = excluded.document",
                params![group.id, group.name, to_document(group)?],
            )?;
        }
        tx.commit()?;
        Ok(groups.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("database connection poisoned".to_string()))
    }

    fn find_player(&self, sql: &str, key: &str) -> Result<Option<PlayerRecord>, StoreError> {
        let conn = self.lock()?;
        let document: Option<String> = conn
            .query_row(sql, params![key], |row| row.get(0))
            .optional()?;
        document.as_deref().map(from_document).transpose()
    }

    fn find_group(&self, sql: &str, key: &str) -> Result<Option<GroupRecord>, StoreError> {
        let conn = self.lock()?;
        let document: Option<String> = conn
            .query_row(sql, params![key], |row| row.get(0))
            .optional()?;
        document.as_deref().map(from_document).transpose()
    }
}

fn to_document<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::InvalidDocument(e.to_string()))
}

fn from_document<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, StoreError> {
    serde_json::from_str(text).map_err(|e| StoreError::InvalidDocument(e.to_string()))
}

#[async_trait]
impl PlayerStore for SqliteStore {
    async fn find_by_serial(&self, serial: &str) -> Result<Option<PlayerRecord>, StoreError> {
        self.find_player("SELECT document FROM players WHERE serial = ?1", serial)
    }

    async fn find_by_socket(&self, socket: &str) -> Result<Option<PlayerRecord>, StoreError> {
        self.find_player(
            "SELECT document FROM players WHERE socket = ?1 LIMIT 1",
            socket,
        )
    }

    async fn save(&self, record: &PlayerRecord) -> Result<(), StoreError> {
        if record.cpu_serial_number.is_empty() {
            return Err(StoreError::InvalidDocument(
                "cpuSerialNumber cannot be blank".to_string(),
            ));
        }
        let document = to_document(record)?;

        let conn = self.lock()?;
        let owner: Option<String> = conn
            .query_row(
                "SELECT id FROM players WHERE serial = ?1",
                params![record.cpu_serial_number],
                |row| row.get(0),
            )
            .optional()?;
        if owner.is_some_and(|owner| owner != record.id) {
            return Err(StoreError::DuplicateSerial(
                record.cpu_serial_number.clone(),
            ));
        }

        conn.execute(
            "INSERT INTO players (id, serial, socket, document) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 serial = excluded.serial,
                 socket = excluded.socket,
                 document = excluded.document",
            params![record.id, record.cpu_serial_number, record.socket, document],
        )?;
        Ok(())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM players", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    async fn mark_all_disconnected(&self) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let rows: Vec<(String, String)> = {
            let mut stmt = tx.prepare("SELECT id, document FROM players")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<_, _>>()?
        };

        let mut changed = 0;
        for (id, document) in rows {
            let mut player: PlayerRecord = from_document(&document)?;
            if !player.is_connected {
                continue;
            }
            player.is_connected = false;
            tx.execute(
                "UPDATE players SET document = ?2 WHERE id = ?1",
                params![id, to_document(&player)?],
            )?;
            changed += 1;
        }

        tx.commit()?;
        Ok(changed)
    }
}

#[async_trait]
impl GroupStore for SqliteStore {
    async fn find_by_name(&self, name: &str) -> Result<Option<GroupRecord>, StoreError> {
        // Lowest id wins so repeated lookups agree when names collide
        self.find_group(
            "SELECT document FROM groups WHERE name = ?1 ORDER BY id LIMIT 1",
            name,
        )
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<GroupRecord>, StoreError> {
        self.find_group("SELECT document FROM groups WHERE id = ?1", id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_reopen_and_find_player() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("players.db");

        let mut player = PlayerRecord::new("a1", "PI-001");
        player.name = Some("Lobby TV".to_string());
        player.socket = Some("ws_1a2b3c4d_7".to_string());
        player.registered = true;
        player.server_service_disabled = true;
        player.reported.insert("version".to_string(), json!("2.4.1"));

        {
            let store = SqliteStore::open(&path).unwrap();
            store.save(&player).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.find_by_serial("PI-001").await.unwrap(), Some(player.clone()));
        assert_eq!(
            store.find_by_socket("ws_1a2b3c4d_7").await.unwrap(),
            Some(player)
        );
        assert_eq!(store.find_by_serial("PI-404").await.unwrap(), None);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_save_replaces_same_document() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut player = PlayerRecord::new("a1", "PI-001");
        player.socket = Some("ws_x_1".to_string());
        store.save(&player).await.unwrap();

        player.socket = Some("ws_x_2".to_string());
        player.last_upload = 300;
        store.save(&player).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.find_by_socket("ws_x_1").await.unwrap().is_none());
        let stored = store.find_by_socket("ws_x_2").await.unwrap().unwrap();
        assert_eq!(stored.last_upload, 300);
    }

    #[tokio::test]
    async fn test_save_rejects_second_record_for_serial() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save(&PlayerRecord::new("a1", "PI-001")).await.unwrap();

        let err = store
            .save(&PlayerRecord::new("b2", "PI-001"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateSerial(serial) if serial == "PI-001"));
        assert_eq!(store.count().await.unwrap(), 1);

        let err = store.save(&PlayerRecord::new("c3", "")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidDocument(_)));
    }

    #[tokio::test]
    async fn test_mark_all_disconnected_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("players.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            for (id, serial, connected) in [("a1", "PI-001", true), ("b2", "PI-002", false)] {
                let mut player = PlayerRecord::new(id, serial);
                player.is_connected = connected;
                store.save(&player).await.unwrap();
            }
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.mark_all_disconnected().await.unwrap(), 1);
        drop(store);

        let store = SqliteStore::open(&path).unwrap();
        let player = store.find_by_serial("PI-001").await.unwrap().unwrap();
        assert!(!player.is_connected);
        assert_eq!(store.mark_all_disconnected().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_group_lookup() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut lobby = GroupRecord::new("g3", "lobby");
        lobby
            .settings
            .insert("orientation".to_string(), json!("portrait"));

        let written = store
            .upsert_groups(&[
                GroupRecord::new("g2", "default"),
                GroupRecord::new("g1", "default"),
                lobby,
            ])
            .unwrap();
        assert_eq!(written, 3);

        assert_eq!(store.find_by_name("default").await.unwrap().unwrap().id, "g1");
        let lobby = store.find_by_id("g3").await.unwrap().unwrap();
        assert_eq!(lobby.name, "lobby");
        assert_eq!(lobby.settings["orientation"], "portrait");
        assert!(store.find_by_name("kiosk").await.unwrap().is_none());

        // Re-seeding replaces by id
        store.upsert_groups(&[GroupRecord::new("g3", "kiosk")]).unwrap();
        assert_eq!(store.find_by_name("kiosk").await.unwrap().unwrap().id, "g3");
        assert!(store.find_by_name("lobby").await.unwrap().is_none());
    }
}
