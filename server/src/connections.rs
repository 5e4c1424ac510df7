//! Open player socket connections
//!
//! This module handles the server-side bookkeeping of connected sockets:
//! - Socket id assignment (`ws_<instance>_1`, `ws_<instance>_2`, ...) for
//!   new connections, where the instance tag is random per process
//! - Remote address and last activity per connection
//! - Which player serial a connection last reported for
//! - A capacity limit on simultaneous connections
//!
//! Player records themselves live in the player store; a connection only
//! remembers enough to route acknowledgements and detect disconnects.
//! Because stored records outlive the process, socket ids carry the
//! instance tag so an id from an earlier run never matches a new socket.

use log::info;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// One open socket
///
/// Each connection tracks:
/// - Its socket id and remote address
/// - When any frame last arrived, for idle detection
/// - The serial number it last reported for, once it has sent a status
#[derive(Debug)]
pub struct Connection {
    /// Socket id handed to the check-in processor
    pub socket_id: String,
    /// Remote address of the player
    pub addr: SocketAddr,
    /// Last time any frame arrived on this socket
    pub last_seen: Instant,
    /// Serial number from the last status report on this socket
    pub serial: Option<String>,
    /// Signalled when the server wants this socket closed
    pub shutdown: Arc<Notify>,
}

impl Connection {
    /// Creates a connection that has not identified a player yet
    ///
    /// The connection counts as active from the moment it is created.
    pub fn new(socket_id: String, addr: SocketAddr) -> Self {
        Self {
            socket_id,
            addr,
            last_seen: Instant::now(),
            serial: None,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Checks whether the socket has been silent for longer than `timeout`
    ///
    /// Any frame counts as activity, including pings and frames that were
    /// dropped as malformed.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Tracks every open player socket
///
/// The ConnectionManager hands out socket ids, enforces the connection
/// limit, and answers which sockets are idle or belong to a given serial.
/// Shared between connection tasks behind an `Arc<RwLock<_>>`.
pub struct ConnectionManager {
    connections: HashMap<String, Connection>,
    instance: String,
    next_connection_id: u64,
    max_connections: usize,
}

impl ConnectionManager {
    /// Creates an empty manager with a fresh random instance tag
    ///
    /// The tag is eight hex characters and stays fixed for the lifetime of
    /// the manager.
    pub fn new(max_connections: usize) -> Self {
        let instance = format!("{:08x}", rand::thread_rng().gen::<u32>());
        Self::with_instance(max_connections, instance)
    }

    /// Creates an empty manager whose socket ids use the given instance tag
    pub fn with_instance(max_connections: usize, instance: impl Into<String>) -> Self {
        Self {
            connections: HashMap::new(),
            instance: instance.into(),
            next_connection_id: 1,
            max_connections,
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Registers a new socket and returns its socket id
    ///
    /// Socket ids are `ws_<instance>_<n>` with `n` counting up from 1 and
    /// never reused within the process. Returns None if the server is at
    /// capacity.
    pub fn add_connection(&mut self, addr: SocketAddr) -> Option<String> {
        if self.connections.len() >= self.max_connections {
            return None;
        }

        let socket_id = format!("ws_{}_{}", self.instance, self.next_connection_id);
        self.next_connection_id += 1;

        info!("Connection {} opened from {}", socket_id, addr);
        self.connections
            .insert(socket_id.clone(), Connection::new(socket_id.clone(), addr));

        Some(socket_id)
    }

    /// Forgets a socket and returns its bookkeeping
    ///
    /// Returns None if the socket id is unknown, e.g. when it was already
    /// removed.
    pub fn remove_connection(&mut self, socket_id: &str) -> Option<Connection> {
        let removed = self.connections.remove(socket_id);
        if let Some(connection) = &removed {
            info!("Connection {} from {} closed", connection.socket_id, connection.addr);
        }
        removed
    }

    /// Records activity on a socket, remembering the reporting serial if known
    ///
    /// A `None` serial refreshes the activity time without forgetting a
    /// serial seen earlier. Returns false if the socket id is unknown.
    pub fn touch(&mut self, socket_id: &str, serial: Option<&str>) -> bool {
        match self.connections.get_mut(socket_id) {
            Some(connection) => {
                connection.last_seen = Instant::now();
                if let Some(serial) = serial {
                    connection.serial = Some(serial.to_string());
                }
                true
            }
            None => false,
        }
    }

    /// Looks up a connection by socket id
    pub fn get(&self, socket_id: &str) -> Option<&Connection> {
        self.connections.get(socket_id)
    }

    /// Asks the task serving `socket_id` to close it
    ///
    /// The request is remembered if the task is not waiting yet, so it is
    /// never lost. Returns false if the socket id is unknown.
    pub fn request_close(&self, socket_id: &str) -> bool {
        match self.connections.get(socket_id) {
            Some(connection) => {
                connection.shutdown.notify_one();
                true
            }
            None => false,
        }
    }

    /// Finds the open connection that last reported for `serial`
    ///
    /// If a player somehow reports on two sockets at once, either may be
    /// returned.
    pub fn find_by_serial(&self, serial: &str) -> Option<&Connection> {
        self.connections
            .values()
            .find(|connection| connection.serial.as_deref() == Some(serial))
    }

    /// Socket ids with no traffic for longer than `timeout`
    pub fn idle_connections(&self, timeout: Duration) -> Vec<String> {
        self.connections
            .values()
            .filter(|connection| connection.is_idle(timeout))
            .map(|connection| connection.socket_id.clone())
            .collect()
    }

    /// Number of connections that have identified a player
    pub fn identified(&self) -> usize {
        self.connections
            .values()
            .filter(|connection| connection.serial.is_some())
            .count()
    }

    /// Number of open connections, identified or not
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    #[test]
    fn test_connection_manager_creation() {
        let manager = ConnectionManager::new(5);
        assert_eq!(manager.max_connections, 5);
        assert!(manager.is_empty());
        assert_eq!(manager.len(), 0);
    }

    #[test]
    fn test_socket_ids_are_sequential() {
        let mut manager = ConnectionManager::with_instance(3, "1a2b3c4d");

        assert_eq!(
            manager.add_connection(test_addr()).as_deref(),
            Some("ws_1a2b3c4d_1")
        );
        assert_eq!(
            manager.add_connection(test_addr2()).as_deref(),
            Some("ws_1a2b3c4d_2")
        );
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_socket_ids_differ_between_managers() {
        let mut first = ConnectionManager::new(1);
        let mut second = ConnectionManager::new(1);
        assert_eq!(first.instance().len(), 8);

        // Both start counting at 1; the instance tag keeps the ids apart
        let first_id = first.add_connection(test_addr()).unwrap();
        let second_id = second.add_connection(test_addr()).unwrap();
        assert!(first_id.starts_with("ws_") && first_id.ends_with("_1"));
        if first.instance() != second.instance() {
            assert_ne!(first_id, second_id);
        }
    }

    #[test]
    fn test_socket_ids_not_reused() {
        let mut manager = ConnectionManager::new(3);

        let first = manager.add_connection(test_addr()).unwrap();
        manager.remove_connection(&first);
        let second = manager.add_connection(test_addr()).unwrap();

        assert_ne!(first, second);
    }

    #[test]
    fn test_max_capacity() {
        let mut manager = ConnectionManager::new(1);

        assert!(manager.add_connection(test_addr()).is_some());
        assert!(manager.add_connection(test_addr2()).is_none());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_remove_connection() {
        let mut manager = ConnectionManager::new(2);
        let socket_id = manager.add_connection(test_addr()).unwrap();

        let removed = manager.remove_connection(&socket_id).unwrap();
        assert_eq!(removed.addr, test_addr());
        assert!(manager.is_empty());
        assert!(manager.remove_connection(&socket_id).is_none());
    }

    #[test]
    fn test_touch_records_serial() {
        let mut manager = ConnectionManager::new(2);
        let socket_id = manager.add_connection(test_addr()).unwrap();

        assert!(manager.touch(&socket_id, None));
        assert_eq!(manager.identified(), 0);

        assert!(manager.touch(&socket_id, Some("PI-001")));
        assert_eq!(manager.identified(), 1);
        assert_eq!(
            manager.find_by_serial("PI-001").map(|c| c.socket_id.as_str()),
            Some(socket_id.as_str())
        );

        assert!(!manager.touch("ws_404", Some("PI-002")));
    }

    #[test]
    fn test_idle_connections() {
        let mut manager = ConnectionManager::new(2);
        let quiet = manager.add_connection(test_addr()).unwrap();
        let busy = manager.add_connection(test_addr2()).unwrap();

        if let Some(connection) = manager.connections.get_mut(&quiet) {
            connection.last_seen = Instant::now() - Duration::from_secs(120);
        }

        let idle = manager.idle_connections(Duration::from_secs(60));
        assert_eq!(idle, vec![quiet.clone()]);
        assert!(manager.get(&busy).is_some());
    }

    #[tokio::test]
    async fn test_request_close_wakes_connection() {
        let mut manager = ConnectionManager::new(2);
        let socket_id = manager.add_connection(test_addr()).unwrap();
        let shutdown = manager.get(&socket_id).unwrap().shutdown.clone();

        assert!(manager.request_close(&socket_id));
        // The permit is stored even though nobody was waiting yet
        tokio::time::timeout(Duration::from_secs(1), shutdown.notified())
            .await
            .unwrap();

        assert!(!manager.request_close("ws_404"));
    }
}
