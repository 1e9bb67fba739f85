use crate::acl::perm;
use crate::client::Client;
use crate::edge::Edge;
use crate::error::MumbleError;
use crate::handler::Handler;
use crate::proto::mumble::PermissionQuery;
use crate::proto::MessageKind;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
impl Handler for PermissionQuery {
    async fn handle(&self, edge: &Edge, client: Arc<RwLock<Client>>) -> Result<(), MumbleError> {
        let channel_id = self.channel_id.unwrap_or(0);
        let subject = { client.read_err().await?.subject() };

        let state_read = edge.state.read_err().await?;

        if !state_read.tree.contains(channel_id) {
            return Ok(());
        }

        let granted = state_read.acl_cache.get_or_compute(&state_read.tree, &subject, channel_id);

        let response = PermissionQuery {
            channel_id: Some(channel_id),
            permissions: Some(granted | perm::CACHED),
            flush: None,
        };

        client.read_err().await?.queue_message(MessageKind::PermissionQuery, &response)
    }
}
