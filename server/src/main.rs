use clap::Parser;
use log::{error, info, warn};
use server::checkin::CheckInProcessor;
use server::config::ServerConfig;
use server::db::SqliteStore;
use server::device::{LoggingDeviceEvents, LoggingDispatcher};
use server::network::Server;
use server::registry::PlayerRegistry;
use server::store::{load_groups_file, GroupStore, MemoryGroupStore, MemoryPlayerStore, PlayerStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value_t = shared::DEFAULT_PORT)]
    port: u16,

    /// Maximum simultaneous player connections
    #[arg(short = 'm', long, default_value = "1024")]
    max_connections: usize,

    /// Minimum seconds between configuration pushes to one player
    #[arg(long, default_value = "60")]
    push_interval: u64,

    /// Installation label stamped on new players
    #[arg(long, default_value = "local")]
    installation: String,

    /// Seconds between statistics log lines
    #[arg(long, default_value = "60")]
    stats_interval: u64,

    /// Seconds of silence before a player socket is closed
    #[arg(long, default_value = "600")]
    idle_timeout: u64,

    /// Seconds a new connection gets to finish the WebSocket handshake
    #[arg(long, default_value = "10")]
    handshake_timeout: u64,

    /// JSON file with group documents to load at startup
    #[arg(short, long)]
    groups: Option<PathBuf>,

    /// SQLite database file for players and groups (kept in memory if unset)
    #[arg(long)]
    db: Option<PathBuf>,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            host: args.host,
            port: args.port,
            max_connections: args.max_connections,
            push_interval: Duration::from_secs(args.push_interval),
            installation: args.installation,
            stats_interval: Duration::from_secs(args.stats_interval.max(1)),
            idle_timeout: Duration::from_secs(args.idle_timeout),
            handshake_timeout: Duration::from_secs(args.handshake_timeout.max(1)),
            groups_file: args.groups,
            db_path: args.db,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let config = ServerConfig::from(Args::parse());

    let (players, groups) = open_stores(&config).await?;

    // Sockets from an earlier run are gone
    let reset = players.mark_all_disconnected().await?;
    if reset > 0 {
        info!("Marked {} players from a previous run as disconnected", reset);
    }

    let processor = Arc::new(
        CheckInProcessor::new(
            players,
            groups,
            Arc::new(LoggingDispatcher),
            Arc::new(RwLock::new(PlayerRegistry::new(config.push_interval))),
        )
        .with_installation(config.installation.clone()),
    );

    let server = Server::bind(&config, processor, Arc::new(LoggingDeviceEvents)).await?;
    let server_handle = tokio::spawn(server.run());

    tokio::select! {
        result = server_handle => {
            match result {
                Ok(Err(e)) => error!("Server stopped: {}", e),
                Err(e) => error!("Server task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}

async fn open_stores(
    config: &ServerConfig,
) -> Result<(Arc<dyn PlayerStore>, Arc<dyn GroupStore>), Box<dyn std::error::Error + Send + Sync>>
{
    let seed = match &config.groups_file {
        Some(path) => Some(load_groups_file(path).await?),
        None => None,
    };

    match &config.db_path {
        Some(path) => {
            let store = Arc::new(SqliteStore::open(path)?);
            match seed {
                Some(groups) => {
                    let written = store.upsert_groups(&groups)?;
                    info!("Seeded {} groups into {}", written, path.display());
                }
                None => info!("Using groups already stored in {}", path.display()),
            }
            let players: Arc<dyn PlayerStore> = store.clone();
            let groups: Arc<dyn GroupStore> = store;
            Ok((players, groups))
        }
        None => {
            warn!("No database given, player records will not survive a restart");
            let groups = match seed {
                Some(groups) => MemoryGroupStore::with_groups(groups),
                None => {
                    warn!("No groups file given, new players will get a group without id");
                    MemoryGroupStore::new()
                }
            };
            let players: Arc<dyn PlayerStore> = Arc::new(MemoryPlayerStore::new());
            let groups: Arc<dyn GroupStore> = Arc::new(groups);
            Ok((players, groups))
        }
    }
}
