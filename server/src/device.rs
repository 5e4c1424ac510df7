//! Collaborators the transport and check-in processor call out to
//!
//! Device management (secrets, remote shell, screenshots, uploads) and the
//! configuration push protocol live outside this server. Both are modelled
//! as traits with log-only implementations until a real backend exists.

use crate::model::{GroupRecord, PlayerRecord};
use async_trait::async_trait;
use log::info;
use serde_json::Value;

/// Acknowledgements and uploads a player sends outside of status reports
#[async_trait]
pub trait DeviceEvents: Send + Sync {
    async fn acknowledge_secret(&self, socket_id: &str, has_error: bool);

    async fn acknowledge_shell(&self, socket_id: &str, response: &Value);

    async fn acknowledge_screenshot(&self, socket_id: &str, response: &Value);

    async fn receive_upload(&self, player_id: &str, filename: &str, data: Option<&Value>);
}

/// Hands a player's group configuration to the device
#[async_trait]
pub trait ConfigDispatcher: Send + Sync {
    async fn send_config(&self, player: &PlayerRecord, group: &GroupRecord);
}

pub struct LoggingDeviceEvents;

#[async_trait]
impl DeviceEvents for LoggingDeviceEvents {
    async fn acknowledge_secret(&self, socket_id: &str, has_error: bool) {
        info!("Secret acknowledgment for {}, error: {}", socket_id, has_error);
    }

    async fn acknowledge_shell(&self, socket_id: &str, response: &Value) {
        info!("Shell acknowledgment for {}: {}", socket_id, response);
    }

    async fn acknowledge_screenshot(&self, socket_id: &str, response: &Value) {
        info!(
            "Screenshot for {}: {} bytes",
            socket_id,
            shared::payload_len(response)
        );
    }

    async fn receive_upload(&self, player_id: &str, filename: &str, data: Option<&Value>) {
        info!(
            "Upload for {}: {}, size: {}",
            player_id,
            filename,
            data.map(shared::payload_len).unwrap_or(0)
        );
    }
}

pub struct LoggingDispatcher;

#[async_trait]
impl ConfigDispatcher for LoggingDispatcher {
    async fn send_config(&self, player: &PlayerRecord, group: &GroupRecord) {
        info!(
            "Config push for {} ({}) from group {}",
            player.cpu_serial_number,
            player.socket.as_deref().unwrap_or("no socket"),
            group.name
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_logging_hooks_accept_any_payload() {
        let events = LoggingDeviceEvents;
        tokio_test::block_on(async {
            events.acknowledge_secret("ws_1", false).await;
            events.acknowledge_shell("ws_1", &json!({"stdout": "ok"})).await;
            events.acknowledge_screenshot("ws_1", &json!("iVBORw0KGgo")).await;
            events.receive_upload("p1", "log.txt", None).await;
            events
                .receive_upload("p1", "log.txt", Some(&json!("abcd")))
                .await;
        });
    }

    #[test]
    fn test_logging_dispatcher() {
        let player = PlayerRecord::new("a1", "PI-001");
        let group = GroupRecord::new("g1", "default");
        tokio_test::block_on(LoggingDispatcher.send_config(&player, &group));
    }
}
