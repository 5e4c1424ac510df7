//! Player check-in processing
//!
//! Every status report from a player goes through [`CheckInProcessor`]:
//! - The stored record is found by hardware serial number, or created
//! - Reported fields are reconciled onto the stored record
//! - New players are placed in the group named "default"
//! - Players whose server service is disabled lose their socket reference
//! - The player is counted as active for this process
//! - Unregistered players, and players asking for it, get a configuration
//!   push unless one went out within the throttle interval
//! - The record is saved
//!
//! Check-ins for the same serial number are serialized by a per-serial lock,
//! so two concurrent first reports cannot create two records.

use crate::device::ConfigDispatcher;
use crate::error::{CheckInError, StoreError};
use crate::model::{new_object_id, CheckIn, GroupRecord, GroupRef, PlayerRecord, DEFAULT_GROUP_NAME};
use crate::registry::{PlayerRegistry, Throttle};
use crate::store::{GroupStore, PlayerStore};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};

/// Installation label stamped on new players unless configured otherwise
pub const DEFAULT_INSTALLATION: &str = "local";

/// What happened to the configuration push for one check-in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushDecision {
    /// Player is registered and did not ask for its configuration
    NotRequested,
    /// Configuration handed to the dispatcher
    Dispatched,
    /// A push went out to this player too recently
    Suppressed,
    /// The player's group could not be found; nothing to push
    GroupMissing,
}

/// Result of one successful check-in
#[derive(Debug, Clone)]
pub struct CheckInOutcome {
    /// The record as it was saved
    pub player: PlayerRecord,
    /// True when this check-in created the record
    pub created: bool,
    pub push: PushDecision,
}

/// Applies status reports to player records
///
/// Holds the stores, the configuration dispatcher and the shared
/// [`PlayerRegistry`]. One processor serves every connection task; wrap it
/// in an `Arc` and share it.
pub struct CheckInProcessor {
    players: Arc<dyn PlayerStore>,
    groups: Arc<dyn GroupStore>,
    dispatcher: Arc<dyn ConfigDispatcher>,
    registry: Arc<RwLock<PlayerRegistry>>,
    installation: String,
    serial_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CheckInProcessor {
    /// Creates a processor over the given stores and dispatcher
    ///
    /// New players are stamped with the `"local"` installation until
    /// [`CheckInProcessor::with_installation`] says otherwise. The registry
    /// is shared so callers can read active counts without going through
    /// the processor.
    pub fn new(
        players: Arc<dyn PlayerStore>,
        groups: Arc<dyn GroupStore>,
        dispatcher: Arc<dyn ConfigDispatcher>,
        registry: Arc<RwLock<PlayerRegistry>>,
    ) -> Self {
        Self {
            players,
            groups,
            dispatcher,
            registry,
            installation: DEFAULT_INSTALLATION.to_string(),
            serial_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the installation label stamped on players this processor creates
    ///
    /// Existing records keep whatever installation they were created with.
    pub fn with_installation(mut self, installation: impl Into<String>) -> Self {
        self.installation = installation.into();
        self
    }

    /// Shared handle to the active set and push timestamps
    pub fn registry(&self) -> Arc<RwLock<PlayerRegistry>> {
        Arc::clone(&self.registry)
    }

    /// Number of distinct players that checked in since this process started
    pub async fn active_player_count(&self) -> usize {
        self.registry.read().await.active_count()
    }

    /// Processes one check-in against the wall clock
    ///
    /// Looks up or creates the player, reconciles the report, decides on a
    /// configuration push and saves the record. The push, if any, is sent
    /// only after the save succeeded. Errors leave the stored record
    /// untouched.
    pub async fn process_check_in(
        &self,
        check_in: CheckIn,
    ) -> Result<CheckInOutcome, CheckInError> {
        self.process_check_in_at(check_in, Instant::now()).await
    }

    /// Processes one check-in with `now` as the throttle clock
    ///
    /// Same as [`CheckInProcessor::process_check_in`]; tests pass their own
    /// instants to step through the push interval.
    pub async fn process_check_in_at(
        &self,
        check_in: CheckIn,
        now: Instant,
    ) -> Result<CheckInOutcome, CheckInError> {
        let lock = self.serial_lock(&check_in.serial).await;
        let _guard = lock.lock().await;

        let stored = self
            .players
            .find_by_serial(&check_in.serial)
            .await
            .map_err(|source| CheckInError::Lookup {
                serial: check_in.serial.clone(),
                source,
            })?;

        let (mut player, created) = match stored {
            Some(stored) => (reconcile(&stored, &check_in), false),
            None => {
                let group = self.resolve_default_group(&check_in.serial).await;
                let player = new_player(
                    &check_in,
                    group,
                    &self.installation,
                    shared::timestamp_millis(),
                );
                info!(
                    "New player {} registered in group {}",
                    player.cpu_serial_number, player.group.name
                );
                (player, true)
            }
        };

        if player.server_service_disabled {
            player.socket = None;
        }

        self.registry.write().await.mark_active(&player.id);

        let (push, group) = if !player.registered || check_in.request {
            self.decide_push(&player, check_in.priority, now).await
        } else {
            (PushDecision::NotRequested, None)
        };

        self.players
            .save(&player)
            .await
            .map_err(|source| CheckInError::Persist {
                serial: player.cpu_serial_number.clone(),
                source,
            })?;

        if let Some(group) = group {
            self.dispatcher.send_config(&player, &group).await;
        }

        debug!(
            "Check-in from {} processed (created: {}, push: {:?})",
            player.cpu_serial_number, created, push
        );

        Ok(CheckInOutcome {
            player,
            created,
            push,
        })
    }

    /// Marks the player last seen on `socket_id` as disconnected
    ///
    /// Returns the updated record, or `None` when no connected player was
    /// using that socket.
    pub async fn mark_disconnected(
        &self,
        socket_id: &str,
    ) -> Result<Option<PlayerRecord>, StoreError> {
        let serial = match self.players.find_by_socket(socket_id).await? {
            Some(player) => player.cpu_serial_number,
            None => return Ok(None),
        };

        let lock = self.serial_lock(&serial).await;
        let _guard = lock.lock().await;

        // Re-read under the lock: the player may have reconnected meanwhile
        let mut player = match self.players.find_by_serial(&serial).await? {
            Some(player) if player.socket.as_deref() == Some(socket_id) && player.is_connected => {
                player
            }
            _ => return Ok(None),
        };

        player.is_connected = false;
        self.players.save(&player).await?;
        info!("Player {} disconnected", player.cpu_serial_number);
        Ok(Some(player))
    }

    async fn serial_lock(&self, serial: &str) -> Arc<Mutex<()>> {
        let mut locks = self.serial_locks.lock().await;
        Arc::clone(locks.entry(serial.to_string()).or_default())
    }

    async fn resolve_default_group(&self, serial: &str) -> GroupRef {
        match self.groups.find_by_name(DEFAULT_GROUP_NAME).await {
            Ok(Some(group)) => group.reference(),
            Ok(None) => {
                warn!(
                    "No \"{}\" group exists, player {} gets a group reference without id",
                    DEFAULT_GROUP_NAME, serial
                );
                GroupRef::fallback()
            }
            Err(e) => {
                warn!(
                    "Default group lookup failed for player {}: {}",
                    serial, e
                );
                GroupRef::fallback()
            }
        }
    }

    async fn decide_push(
        &self,
        player: &PlayerRecord,
        priority: bool,
        now: Instant,
    ) -> (PushDecision, Option<GroupRecord>) {
        let group = match player.group.id.as_deref() {
            Some(group_id) => match self.groups.find_by_id(group_id).await {
                Ok(group) => group,
                Err(e) => {
                    warn!(
                        "Group {} lookup failed for player {}: {}",
                        group_id, player.cpu_serial_number, e
                    );
                    None
                }
            },
            None => None,
        };

        let Some(group) = group else {
            warn!(
                "No group found for player {} ({}), skipping config push",
                player.cpu_serial_number, player.group.name
            );
            return (PushDecision::GroupMissing, None);
        };

        let throttle = self
            .registry
            .write()
            .await
            .try_push(&player.id, priority, now);

        match throttle {
            Throttle::Allow => (PushDecision::Dispatched, Some(group)),
            Throttle::Suppress { .. } => (PushDecision::Suppressed, None),
        }
    }
}

/// Applies a check-in to an existing record
///
/// The last-upload time never moves backwards and a missing or empty name
/// never blanks a known one. Everything else the device reports replaces
/// the stored value field by field.
pub fn reconcile(stored: &PlayerRecord, incoming: &CheckIn) -> PlayerRecord {
    let mut player = stored.clone();

    if let Some(name) = incoming.name.as_deref().filter(|name| !name.is_empty()) {
        player.name = Some(name.to_string());
    }

    if let Some(last_upload) = incoming.last_upload {
        if last_upload >= stored.last_upload {
            player.last_upload = last_upload;
        }
    }

    if let Some(ip) = &incoming.ip {
        player.ip = Some(ip.clone());
    }
    if let Some(socket) = &incoming.socket {
        player.socket = Some(socket.clone());
    }
    if let Some(server_name) = &incoming.server_name {
        player.server_name = Some(server_name.clone());
    }
    if let Some(last_reported) = incoming.last_reported {
        player.last_reported = Some(last_reported);
    }

    for (key, value) in &incoming.reported {
        player.reported.insert(key.clone(), value.clone());
    }

    player.is_connected = true;
    player
}

/// Builds the record for a serial number seen for the first time
pub fn new_player(
    check_in: &CheckIn,
    group: GroupRef,
    installation: &str,
    created_at: u64,
) -> PlayerRecord {
    let mut player = PlayerRecord::new(new_object_id(), check_in.serial.clone());
    player.name = check_in.name.clone().filter(|name| !name.is_empty());
    player.group = group;
    player.installation = Some(installation.to_string());
    player.ip = check_in.ip.clone();
    player.socket = check_in.socket.clone();
    player.server_name = check_in.server_name.clone();
    player.last_upload = check_in.last_upload.unwrap_or(0);
    player.last_reported = check_in.last_reported;
    player.is_connected = true;
    player.created_at = created_at;
    player.reported = check_in.reported.clone();
    player
}
