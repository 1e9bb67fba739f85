use crate::client::Client;
use crate::edge::Edge;
use crate::error::{MumbleError, RpcError};
use crate::handler::{send_permission_denied, Handler};
use crate::proto::mumble::{permission_denied::DenyType, ChannelState};
use crate::rpc::{CreateChannelParams, UpdateChannelParams};
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;

fn deny_of(error: &RpcError) -> DenyType {
    match error.deny_type() {
        Some(10) => DenyType::NestingLimit,
        Some(11) => DenyType::ChannelCountLimit,
        Some(3) => DenyType::ChannelName,
        _ => DenyType::Permission,
    }
}

/// Channel creation and edits. The tree is owned by the hub: this handler
/// only validates shape and forwards, the mutation comes back as a
/// notification applied by the edge supervisor.
#[async_trait]
impl Handler for ChannelState {
    async fn handle(&self, edge: &Edge, client: Arc<RwLock<Client>>) -> Result<(), MumbleError> {
        let actor = { crate::edge::actor_of(&*client.read_err().await?) };

        if let Some(channel_id) = self.channel_id {
            // edit of an existing channel
            let params = UpdateChannelParams {
                actor,
                channel_id,
                name: self.name.clone(),
                description: self.description.clone(),
                position: self.position,
                max_users: self.max_users,
                parent: self.parent,
                links_add: self.links_add.clone(),
                links_remove: self.links_remove.clone(),
            };

            if let Err(e) = edge.hub.update_channel(params).await {
                tracing::debug!("channel update rejected: {}", e);

                return send_permission_denied(&client, deny_of(&e), Some(channel_id), None, &e.to_string()).await;
            }

            return Ok(());
        }

        let parent = match self.parent {
            Some(parent) => parent,
            None => {
                tracing::warn!("cannot create channel: channel must have a parent");

                return Ok(());
            }
        };

        let name = match &self.name {
            Some(name) => name.clone(),
            None => {
                tracing::warn!("cannot create channel: channel must have a name");

                return Ok(());
            }
        };

        let temporary = self.temporary.unwrap_or(false);

        let params = CreateChannelParams {
            actor,
            parent,
            name,
            temporary,
            position: self.position.unwrap_or(0),
            max_users: self.max_users.unwrap_or(0),
            description: self.description.clone().unwrap_or_default(),
        };

        let created = match edge.hub.create_channel(params).await {
            Ok(created) => created,
            Err(e) => {
                tracing::debug!("channel creation rejected: {}", e);

                return send_permission_denied(&client, deny_of(&e), Some(parent), None, &e.to_string()).await;
            }
        };

        // apply immediately; the hub's broadcast skips the requesting edge
        crate::edge::apply_channel_snapshot(edge, *created.channel).await?;

        if temporary {
            let move_state = crate::proto::mumble::UserState {
                channel_id: Some(created.channel_id),
                ..Default::default()
            };

            move_state.handle(edge, client).await?;
        }

        Ok(())
    }
}
