use crate::acl::perm;
use crate::channel::ROOT_CHANNEL_ID;
use crate::client::Client;
use crate::edge::Edge;
use crate::error::MumbleError;
use crate::handler::{send_permission_denied, Handler};
use crate::proto::mumble::{permission_denied::DenyType, user_list, UserList};
use crate::proto::MessageKind;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;

/// Registered-user listing for administrators, served from the hub's user
/// table.
#[async_trait]
impl Handler for UserList {
    async fn handle(&self, edge: &Edge, client: Arc<RwLock<Client>>) -> Result<(), MumbleError> {
        let subject = { client.read_err().await?.subject() };

        let allowed = {
            let state_read = edge.state.read_err().await?;
            state_read
                .acl_cache
                .has_permission(&state_read.tree, &subject, ROOT_CHANNEL_ID, perm::REGISTER)
        };

        if !allowed {
            return send_permission_denied(
                &client,
                DenyType::Permission,
                Some(ROOT_CHANNEL_ID),
                Some(perm::REGISTER),
                "user list denied",
            )
            .await;
        }

        let users = match edge.hub.list_users().await {
            Ok(users) => users,
            Err(e) => {
                tracing::debug!("user list unavailable: {}", e);

                return Ok(());
            }
        };

        let response = UserList {
            users: users
                .into_iter()
                .map(|user| user_list::User {
                    user_id: user.user_id,
                    name: Some(user.name),
                    last_seen: user.last_seen.map(|seen| seen.to_string()),
                    last_channel: user.last_channel,
                })
                .collect(),
        };

        client.read_err().await?.queue_message(MessageKind::UserList, &response)
    }
}
