use crate::client::Client;
use crate::edge::Edge;
use crate::error::MumbleError;
use crate::handler::Handler;
use crate::proto::mumble::QueryUsers;
use crate::proto::MessageKind;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;

/// Resolves registered user ids to names and back, against the hub's user
/// table. The reply carries matched pairs only.
#[async_trait]
impl Handler for QueryUsers {
    async fn handle(&self, edge: &Edge, client: Arc<RwLock<Client>>) -> Result<(), MumbleError> {
        if self.ids.is_empty() && self.names.is_empty() {
            return Ok(());
        }

        let users = match edge.hub.list_users().await {
            Ok(users) => users,
            Err(e) => {
                tracing::debug!("user query unavailable: {}", e);

                return Ok(());
            }
        };

        let mut response = QueryUsers::default();

        for id in &self.ids {
            if let Some(user) = users.iter().find(|user| user.user_id == *id) {
                response.ids.push(user.user_id);
                response.names.push(user.name.clone());
            }
        }

        for name in &self.names {
            if let Some(user) = users.iter().find(|user| &user.name == name) {
                response.ids.push(user.user_id);
                response.names.push(user.name.clone());
            }
        }

        client.read_err().await?.queue_message(MessageKind::QueryUsers, &response)
    }
}
