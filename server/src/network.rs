//! Server network layer handling player WebSocket connections
//!
//! Every accepted socket gets its own task. The task sends the welcome
//! frame, then reads tagged-array frames and dispatches them by tag:
//! status reports go to the check-in processor, acknowledgements and
//! uploads go to the device event hooks. A background task logs aggregate
//! counts and closes sockets that have gone quiet.

use crate::checkin::CheckInProcessor;
use crate::config::ServerConfig;
use crate::connections::ConnectionManager;
use crate::device::DeviceEvents;
use crate::model::{CheckIn, ConnectionInfo};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{PlayerMessage, ServerMessage};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

pub type ServerError = Box<dyn Error + Send + Sync>;

/// Shortest stats/idle tick; `tokio::time::interval` rejects zero
const MIN_STATS_INTERVAL: Duration = Duration::from_millis(10);

/// Accepts player connections and feeds their frames to the processor
pub struct Server {
    listener: TcpListener,
    handler: ConnectionHandler,
    stats_interval: Duration,
    idle_timeout: Duration,
}

/// Everything a connection task needs, cloned into each task
#[derive(Clone)]
struct ConnectionHandler {
    processor: Arc<CheckInProcessor>,
    events: Arc<dyn DeviceEvents>,
    connections: Arc<RwLock<ConnectionManager>>,
    server_name: String,
    handshake_timeout: Duration,
}

impl Server {
    /// Binds the listener and prepares shared connection state
    ///
    /// Nothing is accepted until [`Server::run`] is called. A zero stats
    /// interval is raised to a small minimum.
    pub async fn bind(
        config: &ServerConfig,
        processor: Arc<CheckInProcessor>,
        events: Arc<dyn DeviceEvents>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_address()).await?;
        let local_addr = listener.local_addr()?;
        info!("Player server listening on {}", local_addr);

        Ok(Server {
            listener,
            handler: ConnectionHandler {
                processor,
                events,
                connections: Arc::new(RwLock::new(ConnectionManager::new(
                    config.max_connections,
                ))),
                server_name: local_addr.ip().to_string(),
                handshake_timeout: config.handshake_timeout,
            },
            stats_interval: config.stats_interval.max(MIN_STATS_INTERVAL),
            idle_timeout: config.idle_timeout,
        })
    }

    /// Address the listener is bound to, with the real port when bound to 0
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared handle to the open connection table
    pub fn connections(&self) -> Arc<RwLock<ConnectionManager>> {
        Arc::clone(&self.handler.connections)
    }

    /// Spawns task that logs counts and closes idle sockets
    fn spawn_stats_reporter(&self) {
        let connections = Arc::clone(&self.handler.connections);
        let processor = Arc::clone(&self.handler.processor);
        let stats_interval = self.stats_interval;
        let idle_timeout = self.idle_timeout;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(stats_interval);
            // Skip the first tick since it fires immediately
            interval.tick().await;

            loop {
                interval.tick().await;

                let (open, identified) = {
                    let connections = connections.read().await;
                    for socket_id in connections.idle_connections(idle_timeout) {
                        connections.request_close(&socket_id);
                    }
                    (connections.len(), connections.identified())
                };
                let active = processor.active_player_count().await;

                info!(
                    "{} open connections ({} identified), {} players active since start",
                    open, identified, active
                );
            }
        });
    }

    /// Main accept loop; only returns if the listener fails for good
    pub async fn run(self) -> Result<(), ServerError> {
        self.spawn_stats_reporter();
        info!("Server started successfully");

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };

            let handler = self.handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.serve(stream, addr).await {
                    warn!("Connection from {} ended with error: {}", addr, e);
                }
            });
        }
    }
}

impl ConnectionHandler {
    async fn serve(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), ServerError> {
        let handshake =
            tokio::time::timeout(self.handshake_timeout, tokio_tungstenite::accept_async(stream));
        let ws = match handshake.await {
            Ok(ws) => ws?,
            Err(_) => {
                warn!("WebSocket handshake from {} timed out", addr);
                return Ok(());
            }
        };
        let (mut sink, mut frames) = ws.split();

        let registered = {
            let mut connections = self.connections.write().await;
            connections.add_connection(addr).and_then(|socket_id| {
                connections
                    .get(&socket_id)
                    .map(|connection| (socket_id, Arc::clone(&connection.shutdown)))
            })
        };
        let Some((socket_id, shutdown)) = registered else {
            warn!("Rejecting connection from {}: server full", addr);
            sink.send(Message::Close(None)).await?;
            return Ok(());
        };

        let result = self
            .read_frames(&socket_id, addr, &mut sink, &mut frames, &shutdown)
            .await;

        self.connections.write().await.remove_connection(&socket_id);
        if let Err(e) = self.processor.mark_disconnected(&socket_id).await {
            error!("Failed to mark {} disconnected: {}", socket_id, e);
        }

        result
    }

    async fn read_frames<S, F>(
        &self,
        socket_id: &str,
        addr: SocketAddr,
        sink: &mut S,
        frames: &mut F,
        shutdown: &tokio::sync::Notify,
    ) -> Result<(), ServerError>
    where
        S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
        F: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        let welcome = ServerMessage::welcome().to_frame()?;
        sink.send(Message::Text(welcome)).await?;

        loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_frame(socket_id, addr, &text).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => self.handle_frame(socket_id, addr, &text).await,
                        Err(_) => warn!("Dropping non UTF-8 binary frame from {}", socket_id),
                    },
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {
                        // Ping, pong or raw frame: still counts as activity
                        self.connections.write().await.touch(socket_id, None);
                    }
                    Some(Err(e)) => return Err(e.into()),
                },
                _ = shutdown.notified() => {
                    info!("Closing idle connection {}", socket_id);
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }

    async fn handle_frame(&self, socket_id: &str, addr: SocketAddr, text: &str) {
        let message = match PlayerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping frame from {}: {}", socket_id, e);
                self.connections.write().await.touch(socket_id, None);
                return;
            }
        };
        debug!("{} frame from {}", message.tag(), socket_id);

        match message {
            PlayerMessage::Status {
                settings,
                status,
                priority,
            } => {
                let connection = ConnectionInfo {
                    socket_id: socket_id.to_string(),
                    peer_ip: addr.ip().to_string(),
                    server_name: self.server_name.clone(),
                };
                let now = shared::timestamp_millis();

                match CheckIn::from_status(settings, status, priority, &connection, now) {
                    Ok(check_in) => self.handle_check_in(socket_id, check_in).await,
                    Err(e) => {
                        warn!("Dropping status from {}: {}", socket_id, e);
                        self.connections.write().await.touch(socket_id, None);
                    }
                }
            }
            PlayerMessage::SecretAck { ok } => {
                self.connections.write().await.touch(socket_id, None);
                self.events.acknowledge_secret(socket_id, !ok).await;
            }
            PlayerMessage::ShellAck { response } => {
                self.connections.write().await.touch(socket_id, None);
                self.events.acknowledge_shell(socket_id, &response).await;
            }
            PlayerMessage::Snapshot { response } => {
                self.connections.write().await.touch(socket_id, None);
                self.events.acknowledge_screenshot(socket_id, &response).await;
            }
            PlayerMessage::Upload {
                player_id,
                filename,
                data,
            } => {
                self.connections.write().await.touch(socket_id, None);
                self.events
                    .receive_upload(&player_id, &filename, data.as_ref())
                    .await;
            }
        }
    }

    async fn handle_check_in(&self, socket_id: &str, check_in: CheckIn) {
        {
            let mut connections = self.connections.write().await;
            let previous = connections
                .find_by_serial(&check_in.serial)
                .map(|connection| connection.socket_id.clone());
            if let Some(previous) = previous.filter(|previous| previous != socket_id) {
                info!(
                    "Player {} now reporting on {} (previously {})",
                    check_in.serial, socket_id, previous
                );
            }
            connections.touch(socket_id, Some(&check_in.serial));
        }

        let serial = check_in.serial.clone();
        match self.processor.process_check_in(check_in).await {
            Ok(outcome) => debug!(
                "Player {} checked in on {} (push: {:?})",
                serial, socket_id, outcome.push
            ),
            Err(e) => error!("Check-in from {} on {} failed: {}", serial, socket_id, e),
        }
    }
}
