use crate::client::Client;
use crate::edge::Edge;
use crate::error::MumbleError;
use crate::handler::{send_permission_denied, Handler};
use crate::proto::mumble::{permission_denied::DenyType, Acl};
use crate::proto::MessageKind;
use crate::rpc::HandleAclParams;
use crate::sync::RwLock;
use async_trait::async_trait;
use prost::Message;
use std::sync::Arc;

/// ACL reads and writes both traverse the hub, which owns the authoritative
/// tree: the raw client message rides along and the hub answers either with
/// the serialized ACL state (query) or applies the update and fans the
/// change out to every edge.
#[async_trait]
impl Handler for Acl {
    async fn handle(&self, edge: &Edge, client: Arc<RwLock<Client>>) -> Result<(), MumbleError> {
        let actor = { crate::edge::actor_of(&*client.read_err().await?) };
        let query = self.query.unwrap_or(false);

        let edge_id = { edge.state.read_err().await?.edge_id };

        let params = HandleAclParams {
            edge_id,
            actor,
            channel_id: self.channel_id,
            query,
            raw_data: self.encode_to_vec(),
        };

        let result = match edge.hub.handle_acl(params).await {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!("acl request failed: {}", e);

                return send_permission_denied(&client, DenyType::Permission, Some(self.channel_id), None, &e.to_string()).await;
            }
        };

        if result.permission_denied {
            let reason = result.error.unwrap_or_else(|| "permission denied".to_string());

            return send_permission_denied(&client, DenyType::Permission, Some(self.channel_id), None, &reason).await;
        }

        if query {
            if let Some(raw) = result.raw_data {
                let acl_state = Acl::decode(raw.as_slice())?;
                client.read_err().await?.queue_message(MessageKind::ACL, &acl_state)?;
            }
        }

        Ok(())
    }
}
