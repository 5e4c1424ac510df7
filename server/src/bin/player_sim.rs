//! Simulated signage player
//!
//! Connects to the server, waits for the welcome frame and then sends a
//! status report every few seconds, the way player firmware does.

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use serde_json::{json, Map, Value};
use shared::{PlayerMessage, ServerMessage};
use std::time::Duration;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server WebSocket URL
    #[arg(short, long, default_value = "ws://127.0.0.1:3000")]
    url: String,

    /// Hardware serial number to report
    #[arg(long, default_value = "SIM-0001")]
    serial: String,

    /// Player name to report
    #[arg(short, long, default_value = "Simulated player")]
    name: String,

    /// Seconds between status reports
    #[arg(short, long, default_value = "5")]
    interval: u64,

    /// Number of reports to send before disconnecting
    #[arg(short, long, default_value = "10")]
    count: u32,

    /// Flag the first report as priority
    #[arg(long)]
    priority: bool,
}

fn status_report(args: &Args, last_upload: u64, priority: bool) -> PlayerMessage {
    let mut settings = Map::new();
    settings.insert("cpuSerialNumber".to_string(), json!(args.serial));
    settings.insert("version".to_string(), json!(env!("CARGO_PKG_VERSION")));

    let mut status = Map::new();
    status.insert("name".to_string(), json!(args.name));
    status.insert("lastUpload".to_string(), json!(last_upload));
    status.insert("playlistOn".to_string(), Value::Bool(true));
    status.insert("tvStatus".to_string(), Value::Bool(true));

    PlayerMessage::Status {
        settings,
        status,
        priority,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let args = Args::parse();

    info!("Connecting to {}", args.url);
    let (ws, _) = connect_async(args.url.as_str()).await?;
    let (mut sink, mut frames) = ws.split();

    match frames.next().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
            Ok(ServerMessage::Welcome { message }) => info!("Server says: {}", message),
            Err(e) => warn!("Unexpected first frame {}: {}", text, e),
        },
        other => warn!("Expected welcome frame, got {:?}", other),
    }

    let last_upload = shared::timestamp_millis();
    for i in 0..args.count {
        let report = status_report(&args, last_upload, args.priority && i == 0);

        info!("Sending status report {}/{}", i + 1, args.count);
        sink.send(Message::Text(report.to_frame())).await?;

        sleep(Duration::from_secs(args.interval)).await;
    }

    sink.send(Message::Close(None)).await?;
    info!("Player simulation finished");

    Ok(())
}
