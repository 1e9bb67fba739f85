use crate::acl::perm;
use crate::ban::Ban;
use crate::channel::ROOT_CHANNEL_ID;
use crate::client::Client;
use crate::edge::Edge;
use crate::error::MumbleError;
use crate::handler::{send_permission_denied, Handler};
use crate::proto::mumble::{permission_denied::DenyType, BanList};
use crate::proto::MessageKind;
use crate::rpc::UpdateBansParams;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;

/// Ban list query and full-list edits. Bans live at the hub; edges keep a
/// synced copy they enforce at accept time.
#[async_trait]
impl Handler for BanList {
    async fn handle(&self, edge: &Edge, client: Arc<RwLock<Client>>) -> Result<(), MumbleError> {
        let (subject, actor) = {
            let client_read = client.read_err().await?;
            (client_read.subject(), crate::edge::actor_of(&client_read))
        };

        let allowed = {
            let state_read = edge.state.read_err().await?;
            state_read
                .acl_cache
                .has_permission(&state_read.tree, &subject, ROOT_CHANNEL_ID, perm::BAN)
        };

        if !allowed {
            return send_permission_denied(&client, DenyType::Permission, Some(ROOT_CHANNEL_ID), Some(perm::BAN), "ban denied").await;
        }

        if self.query.unwrap_or(false) {
            let response = {
                let state_read = edge.state.read_err().await?;

                BanList {
                    bans: state_read.bans.iter().map(Ban::to_entry).collect(),
                    query: None,
                }
            };

            return client.read_err().await?.queue_message(MessageKind::BanList, &response);
        }

        let bans: Vec<Ban> = self
            .bans
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| Ban::from_entry(index as u32, entry))
            .map(|mut ban| {
                ban.created_by = Some(actor.username.clone());
                ban
            })
            .collect();

        if let Err(e) = edge.hub.update_bans(UpdateBansParams { actor, bans, replace: true }).await {
            tracing::debug!("ban update rejected: {}", e);

            return send_permission_denied(&client, DenyType::Permission, Some(ROOT_CHANNEL_ID), Some(perm::BAN), &e.to_string()).await;
        }

        Ok(())
    }
}
