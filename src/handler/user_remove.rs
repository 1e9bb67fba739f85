use crate::acl::perm;
use crate::ban::{unix_now, Ban};
use crate::channel::ROOT_CHANNEL_ID;
use crate::client::Client;
use crate::edge::Edge;
use crate::error::MumbleError;
use crate::handler::{send_permission_denied, Handler};
use crate::proto::mumble::{permission_denied::DenyType, UserRemove};
use crate::proto::MessageKind;
use crate::rpc::{KickSessionParams, UpdateBansParams};
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;

/// Kick, optionally with a ban. Local targets are removed directly; targets
/// on other edges are kicked through the hub, which relays to the owner.
#[async_trait]
impl Handler for UserRemove {
    async fn handle(&self, edge: &Edge, client: Arc<RwLock<Client>>) -> Result<(), MumbleError> {
        let ban = self.ban.unwrap_or(false);
        let reason = self.reason.clone().unwrap_or_default();

        let (actor_session, subject, actor) = {
            let client_read = client.read_err().await?;
            (client_read.session_id, client_read.subject(), crate::edge::actor_of(&client_read))
        };

        let wanted = if ban { perm::BAN } else { perm::KICK };

        let allowed = {
            let state_read = edge.state.read_err().await?;
            state_read
                .acl_cache
                .has_permission(&state_read.tree, &subject, ROOT_CHANNEL_ID, wanted)
        };

        if !allowed {
            return send_permission_denied(&client, DenyType::Permission, Some(ROOT_CHANNEL_ID), Some(wanted), "kick denied").await;
        }

        let target = {
            let state_read = edge.state.read_err().await?;
            state_read.clients.get(&self.session).cloned()
        };

        match target {
            Some(target) => {
                if ban {
                    let ban_entry = {
                        let target_read = target.read_err().await?;

                        Ban {
                            id: 0,
                            address: Some(target_read.ip),
                            mask: 128,
                            name: Some(target_read.name.clone()),
                            hash: target_read.cert_hash.clone(),
                            reason: reason.clone(),
                            start: unix_now(),
                            duration_s: 0,
                            created_by: Some(actor.username.clone()),
                        }
                    };

                    if let Err(e) = edge
                        .hub
                        .update_bans(UpdateBansParams {
                            actor: actor.clone(),
                            bans: vec![ban_entry],
                            replace: false,
                        })
                        .await
                    {
                        tracing::warn!("kick-ban not recorded at hub: {}", e);
                    }
                }

                let removal = UserRemove {
                    session: self.session,
                    actor: Some(actor_session),
                    reason: Some(reason),
                    ban: Some(ban),
                };

                {
                    let state_read = edge.state.read_err().await?;
                    state_read.broadcast_message(MessageKind::UserRemove, &removal).await?;
                }

                target.read_err().await?.disconnect();

                Ok(())
            }
            None => {
                let is_remote = { edge.state.read_err().await?.remote.get(self.session).is_some() };

                if !is_remote {
                    return Ok(());
                }

                if let Err(e) = edge
                    .hub
                    .kick_session(KickSessionParams {
                        actor,
                        session: self.session,
                        reason,
                        ban,
                    })
                    .await
                {
                    tracing::debug!("remote kick failed: {}", e);

                    return send_permission_denied(&client, DenyType::Permission, None, Some(wanted), &e.to_string()).await;
                }

                Ok(())
            }
        }
    }
}
