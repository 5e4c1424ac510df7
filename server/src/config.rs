use crate::checkin::DEFAULT_INSTALLATION;
use crate::registry::DEFAULT_PUSH_INTERVAL;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime settings for the player server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    /// Minimum time between configuration pushes to one player
    pub push_interval: Duration,
    /// Label stamped on players created by this server
    pub installation: String,
    /// How often aggregate connection and player counts are logged
    pub stats_interval: Duration,
    /// Sockets silent for longer than this are closed
    pub idle_timeout: Duration,
    /// Connections that have not finished the WebSocket handshake by then
    /// are dropped
    pub handshake_timeout: Duration,
    /// JSON array of group documents to seed the group store with
    pub groups_file: Option<PathBuf>,
    /// SQLite database for players and groups; in memory when unset
    pub db_path: Option<PathBuf>,
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: shared::DEFAULT_PORT,
            max_connections: 1024,
            push_interval: DEFAULT_PUSH_INTERVAL,
            installation: DEFAULT_INSTALLATION.to_string(),
            stats_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(600),
            handshake_timeout: Duration::from_secs(10),
            groups_file: None,
            db_path: None,
        }
    }
}
