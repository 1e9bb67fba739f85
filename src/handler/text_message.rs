use crate::acl::perm;
use crate::client::Client;
use crate::edge::Edge;
use crate::error::MumbleError;
use crate::handler::{send_permission_denied, Handler};
use crate::proto::mumble::{permission_denied::DenyType, TextMessage};
use crate::proto::MessageKind;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Text delivery to sessions, channels and subtrees on this edge. The
/// control plane carries no cross-edge text fan-out; remote members of a
/// channel are reached by their own edge only for voice.
#[async_trait]
impl Handler for TextMessage {
    async fn handle(&self, edge: &Edge, client: Arc<RwLock<Client>>) -> Result<(), MumbleError> {
        let (sender_session, subject) = {
            let client_read = client.read_err().await?;
            (client_read.session_id, client_read.subject())
        };

        let state_read = edge.state.read_err().await?;

        let limit = state_read.config.message_length;

        if limit > 0 && self.message.len() as u32 > limit {
            drop(state_read);

            return send_permission_denied(&client, DenyType::TextTooLong, None, None, "message too long").await;
        }

        let mut recipients: BTreeSet<u32> = BTreeSet::new();

        for session in &self.session {
            if state_read.clients.contains_key(session) {
                recipients.insert(*session);
            }
        }

        let mut channels: Vec<u32> = self.channel_id.clone();

        for tree_id in &self.tree_id {
            channels.extend(state_read.tree.subtree(*tree_id));
        }

        channels.sort_unstable();
        channels.dedup();

        for channel_id in channels {
            if !state_read.tree.contains(channel_id) {
                continue;
            }

            if !state_read
                .acl_cache
                .has_permission(&state_read.tree, &subject, channel_id, perm::TEXT_MESSAGE)
            {
                drop(state_read);

                return send_permission_denied(
                    &client,
                    DenyType::Permission,
                    Some(channel_id),
                    Some(perm::TEXT_MESSAGE),
                    "text message denied",
                )
                .await;
            }

            recipients.extend(state_read.local_sessions_in(channel_id).copied());
        }

        recipients.remove(&sender_session);

        let outgoing = TextMessage {
            actor: Some(sender_session),
            session: Vec::new(),
            channel_id: self.channel_id.clone(),
            tree_id: self.tree_id.clone(),
            message: self.message.clone(),
        };

        for session in recipients {
            if let Some(recipient) = state_read.clients.get(&session) {
                let recipient_read = recipient.read_err().await?;

                if let Err(e) = recipient_read.queue_message(MessageKind::TextMessage, &outgoing) {
                    tracing::debug!("[{}] text message not delivered: {}", session, e);
                }
            }
        }

        Ok(())
    }
}
