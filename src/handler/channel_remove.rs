use crate::client::Client;
use crate::edge::Edge;
use crate::error::MumbleError;
use crate::handler::{send_permission_denied, Handler};
use crate::proto::mumble::{permission_denied::DenyType, ChannelRemove};
use crate::rpc::RemoveChannelParams;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
impl Handler for ChannelRemove {
    async fn handle(&self, edge: &Edge, client: Arc<RwLock<Client>>) -> Result<(), MumbleError> {
        let actor = { crate::edge::actor_of(&*client.read_err().await?) };

        let params = RemoveChannelParams {
            actor,
            channel_id: self.channel_id,
        };

        if let Err(e) = edge.hub.remove_channel(params).await {
            tracing::debug!("channel remove rejected: {}", e);

            return send_permission_denied(&client, DenyType::Permission, Some(self.channel_id), None, &e.to_string()).await;
        }

        Ok(())
    }
}
