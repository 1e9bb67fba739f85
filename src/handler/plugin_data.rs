use crate::client::Client;
use crate::edge::Edge;
use crate::error::MumbleError;
use crate::handler::Handler;
use crate::proto::mumble::PluginDataTransmission;
use crate::proto::MessageKind;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;

/// Relays opaque plugin payloads to the named receiver sessions hosted on
/// this edge.
#[async_trait]
impl Handler for PluginDataTransmission {
    async fn handle(&self, edge: &Edge, client: Arc<RwLock<Client>>) -> Result<(), MumbleError> {
        let sender_session = { client.read_err().await?.session_id };

        let forwarded = PluginDataTransmission {
            sender_session: Some(sender_session),
            receiver_sessions: Vec::new(),
            data: self.data.clone(),
            data_id: self.data_id.clone(),
        };

        let state_read = edge.state.read_err().await?;

        for receiver in &self.receiver_sessions {
            if *receiver == sender_session {
                continue;
            }

            if let Some(receiver_client) = state_read.clients.get(receiver) {
                let receiver_read = receiver_client.read_err().await?;

                if let Err(e) = receiver_read.queue_message(MessageKind::PluginDataTransmission, &forwarded) {
                    tracing::debug!("[{}] plugin data not delivered: {}", receiver, e);
                }
            }
        }

        Ok(())
    }
}
