//! Player and group document stores
//!
//! The check-in processor only talks to the [`PlayerStore`] and
//! [`GroupStore`] traits. The in-memory stores here back the tests and a
//! server started without a database; each call is atomic for a single
//! document. The durable implementation lives in [`crate::db`].

use crate::error::StoreError;
use crate::model::{GroupRecord, PlayerRecord};
use async_trait::async_trait;
use log::info;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;

/// Persistence for player documents, one per hardware serial number
#[async_trait]
pub trait PlayerStore: Send + Sync {
    /// Returns the record for `serial`, or `None` if it was never saved
    async fn find_by_serial(&self, serial: &str) -> Result<Option<PlayerRecord>, StoreError>;

    /// Returns a record whose stored socket id equals `socket`
    async fn find_by_socket(&self, socket: &str) -> Result<Option<PlayerRecord>, StoreError>;

    /// Inserts or replaces the record with the same `_id`
    ///
    /// Must refuse to create a second record for a serial number that already
    /// belongs to a different `_id`.
    async fn save(&self, record: &PlayerRecord) -> Result<(), StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;

    /// Clears `isConnected` on every stored player
    ///
    /// Called once at startup: sockets from an earlier process are gone, so
    /// no stored player can still be connected. Returns how many records
    /// were changed.
    async fn mark_all_disconnected(&self) -> Result<usize, StoreError>;
}

/// Read access to group documents
#[async_trait]
pub trait GroupStore: Send + Sync {
    /// Returns one group with this name; repeated calls return the same one
    async fn find_by_name(&self, name: &str) -> Result<Option<GroupRecord>, StoreError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<GroupRecord>, StoreError>;
}

/// Reads a JSON array of group documents
pub async fn load_groups_file(path: &Path) -> Result<Vec<GroupRecord>, StoreError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))?;
    let groups: Vec<GroupRecord> = serde_json::from_str(&text)
        .map_err(|e| StoreError::InvalidDocument(format!("{}: {}", path.display(), e)))?;

    info!("Loaded {} groups from {}", groups.len(), path.display());
    Ok(groups)
}

/// Player documents indexed by hardware serial number
#[derive(Default)]
pub struct MemoryPlayerStore {
    players: RwLock<HashMap<String, PlayerRecord>>,
}

impl MemoryPlayerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlayerStore for MemoryPlayerStore {
    async fn find_by_serial(&self, serial: &str) -> Result<Option<PlayerRecord>, StoreError> {
        Ok(self.players.read().await.get(serial).cloned())
    }

    async fn find_by_socket(&self, socket: &str) -> Result<Option<PlayerRecord>, StoreError> {
        let players = self.players.read().await;
        Ok(players
            .values()
            .find(|player| player.socket.as_deref() == Some(socket))
            .cloned())
    }

    async fn save(&self, record: &PlayerRecord) -> Result<(), StoreError> {
        if record.cpu_serial_number.is_empty() {
            return Err(StoreError::InvalidDocument(
                "cpuSerialNumber cannot be blank".to_string(),
            ));
        }

        let mut players = self.players.write().await;
        if let Some(existing) = players.get(&record.cpu_serial_number) {
            if existing.id != record.id {
                return Err(StoreError::DuplicateSerial(
                    record.cpu_serial_number.clone(),
                ));
            }
        }
        players.insert(record.cpu_serial_number.clone(), record.clone());
        Ok(())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.players.read().await.len())
    }

    async fn mark_all_disconnected(&self) -> Result<usize, StoreError> {
        let mut players = self.players.write().await;
        let mut changed = 0;
        for player in players.values_mut().filter(|player| player.is_connected) {
            player.is_connected = false;
            changed += 1;
        }
        Ok(changed)
    }
}

/// Group documents indexed by `_id`
#[derive(Default)]
pub struct MemoryGroupStore {
    groups: RwLock<HashMap<String, GroupRecord>>,
}

impl MemoryGroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_groups(groups: Vec<GroupRecord>) -> Self {
        let groups = groups
            .into_iter()
            .map(|group| (group.id.clone(), group))
            .collect();
        Self {
            groups: RwLock::new(groups),
        }
    }

    pub async fn insert(&self, group: GroupRecord) {
        self.groups.write().await.insert(group.id.clone(), group);
    }

    pub async fn len(&self) -> usize {
        self.groups.read().await.len()
    }
}

#[async_trait]
impl GroupStore for MemoryGroupStore {
    async fn find_by_name(&self, name: &str) -> Result<Option<GroupRecord>, StoreError> {
        let groups = self.groups.read().await;
        // Lowest id wins so repeated lookups agree when names collide
        Ok(groups
            .values()
            .filter(|group| group.name == name)
            .min_by(|a, b| a.id.cmp(&b.id))
            .cloned())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<GroupRecord>, StoreError> {
        Ok(self.groups.read().await.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_find_player() {
        let store = MemoryPlayerStore::new();
        let mut player = PlayerRecord::new("a1", "PI-001");
        player.socket = Some("ws_3".to_string());

        store.save(&player).await.unwrap();

        assert_eq!(store.find_by_serial("PI-001").await.unwrap(), Some(player.clone()));
        assert_eq!(store.find_by_socket("ws_3").await.unwrap(), Some(player));
        assert_eq!(store.find_by_serial("PI-404").await.unwrap(), None);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_save_replaces_same_document() {
        let store = MemoryPlayerStore::new();
        let mut player = PlayerRecord::new("a1", "PI-001");
        store.save(&player).await.unwrap();

        player.name = Some("Lobby TV".to_string());
        store.save(&player).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let stored = store.find_by_serial("PI-001").await.unwrap().unwrap();
        assert_eq!(stored.name.as_deref(), Some("Lobby TV"));
    }

    #[tokio::test]
    async fn test_save_rejects_second_record_for_serial() {
        let store = MemoryPlayerStore::new();
        store.save(&PlayerRecord::new("a1", "PI-001")).await.unwrap();

        let err = store
            .save(&PlayerRecord::new("b2", "PI-001"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateSerial(serial) if serial == "PI-001"));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_save_rejects_blank_serial() {
        let store = MemoryPlayerStore::new();
        let err = store.save(&PlayerRecord::new("a1", "")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidDocument(_)));
    }

    #[tokio::test]
    async fn test_mark_all_disconnected() {
        let store = MemoryPlayerStore::new();
        let mut online = PlayerRecord::new("a1", "PI-001");
        online.is_connected = true;
        store.save(&online).await.unwrap();
        store.save(&PlayerRecord::new("b2", "PI-002")).await.unwrap();

        assert_eq!(store.mark_all_disconnected().await.unwrap(), 1);
        let stored = store.find_by_serial("PI-001").await.unwrap().unwrap();
        assert!(!stored.is_connected);
        assert_eq!(store.mark_all_disconnected().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_group_lookup() {
        let store = MemoryGroupStore::with_groups(vec![
            GroupRecord::new("g2", "default"),
            GroupRecord::new("g1", "default"),
        ]);
        store.insert(GroupRecord::new("g3", "lobby")).await;

        let default = store.find_by_name("default").await.unwrap().unwrap();
        assert_eq!(default.id, "g1");
        assert_eq!(store.find_by_id("g3").await.unwrap().unwrap().name, "lobby");
        assert!(store.find_by_id("missing").await.unwrap().is_none());
        assert!(store.find_by_name("kiosk").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_groups_from_json_file() {
        let path = std::env::temp_dir().join(format!("groups-{}.json", std::process::id()));
        tokio::fs::write(
            &path,
            r#"[{"_id": "g1", "name": "default", "orientation": "portrait"}]"#,
        )
        .await
        .unwrap();

        let store = MemoryGroupStore::with_groups(load_groups_file(&path).await.unwrap());
        let _ = tokio::fs::remove_file(&path).await;

        assert_eq!(store.len().await, 1);
        let group = store.find_by_id("g1").await.unwrap().unwrap();
        assert_eq!(group.settings["orientation"], "portrait");
    }

    #[tokio::test]
    async fn test_groups_from_missing_file() {
        let result = load_groups_file(Path::new("/nonexistent/groups.json")).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
