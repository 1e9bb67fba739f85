use crate::acl::perm;
use crate::client::Client;
use crate::edge::Edge;
use crate::error::MumbleError;
use crate::handler::{send_permission_denied, Handler};
use crate::proto::mumble::{permission_denied::DenyType, UserState};
use crate::proto::MessageKind;
use crate::rpc::UpdateSessionParams;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
impl Handler for UserState {
    async fn handle(&self, edge: &Edge, client: Arc<RwLock<Client>>) -> Result<(), MumbleError> {
        let actor_session = { client.read_err().await?.session_id };
        let target_session = self.session.unwrap_or(actor_session);

        if target_session != actor_session {
            return handle_other(self, edge, client, target_session).await;
        }

        let mut delta = UserState {
            session: Some(actor_session),
            actor: Some(actor_session),
            ..Default::default()
        };
        let mut hub_update = UpdateSessionParams {
            session: actor_session,
            ..Default::default()
        };
        let mut changed = false;

        {
            let mut client_write = client.write_err().await?;

            if let Some(self_mute) = self.self_mute {
                client_write.self_mute = self_mute;
                delta.self_mute = Some(self_mute);
                hub_update.self_mute = Some(self_mute);
                changed = true;
            }

            if let Some(self_deaf) = self.self_deaf {
                client_write.self_deaf = self_deaf;
                delta.self_deaf = Some(self_deaf);
                hub_update.self_deaf = Some(self_deaf);

                // a deafened client cannot talk either
                if self_deaf && !client_write.self_mute {
                    client_write.self_mute = true;
                    delta.self_mute = Some(true);
                    hub_update.self_mute = Some(true);
                }

                changed = true;
            }

            if let Some(recording) = self.recording {
                client_write.recording = recording;
                delta.recording = Some(recording);
                hub_update.recording = Some(recording);
                changed = true;
            }

            if let Some(priority_speaker) = self.priority_speaker {
                client_write.priority_speaker = priority_speaker;
                delta.priority_speaker = Some(priority_speaker);
                hub_update.priority_speaker = Some(priority_speaker);
                changed = true;
            }

            if self.plugin_context.is_some() {
                client_write.plugin_context = self.plugin_context.clone();
            }

            if self.plugin_identity.is_some() {
                client_write.plugin_identity = self.plugin_identity.clone();
            }

            if let Some(comment) = &self.comment {
                client_write.comment = Some(comment.clone());
                delta.comment = Some(comment.clone());
                changed = true;
            }
        }

        // textures are content-addressed at the hub
        if let Some(texture) = &self.texture {
            match edge.hub.put_blob(texture.clone()).await {
                Ok(hash) => {
                    let hash_bytes = crate::blob::hex_to_bytes(&hash).unwrap_or_default();
                    client.write_err().await?.texture_hash = Some(hash_bytes.clone());
                    delta.texture_hash = Some(hash_bytes);
                    changed = true;
                }
                Err(e) => tracing::warn!("texture upload failed: {}", e),
            }
        }

        if let Some(channel_id) = self.channel_id {
            if move_self(edge, &client, channel_id, &mut delta, &mut hub_update).await? {
                changed = true;
            }
        }

        if apply_listening(self, edge, &client, &mut delta, &mut hub_update).await? {
            changed = true;
        }

        if changed {
            {
                let state_read = edge.state.read_err().await?;
                state_read.broadcast_message(MessageKind::UserState, &delta).await?;
            }

            if let Err(e) = edge.hub.update_session(hub_update).await {
                tracing::warn!("session update not reported to hub: {}", e);
            }
        }

        Ok(())
    }
}

/// Moves the acting client into `channel_id` after the Enter and capacity
/// checks; recomputes `suppress` against the destination's ACL.
async fn move_self(
    edge: &Edge,
    client: &Arc<RwLock<Client>>,
    channel_id: u32,
    delta: &mut UserState,
    hub_update: &mut UpdateSessionParams,
) -> Result<bool, MumbleError> {
    let (subject, current_channel, self_mute) = {
        let client_read = client.read_err().await?;
        (client_read.subject(), client_read.channel_id, client_read.self_mute)
    };

    if channel_id == current_channel {
        return Ok(false);
    }

    let suppress = {
        let state_read = edge.state.read_err().await?;

        let channel = match state_read.tree.get(channel_id) {
            Some(channel) => channel,
            None => return Ok(false),
        };

        if !state_read.acl_cache.has_permission(&state_read.tree, &subject, channel_id, perm::ENTER) {
            send_permission_denied(client, DenyType::Permission, Some(channel_id), Some(perm::ENTER), "enter denied").await?;

            return Ok(false);
        }

        if channel.max_users > 0 {
            let local = state_read.local_sessions_in(channel_id).count();
            let remote = state_read.remote.sessions().filter(|info| info.channel_id == channel_id).count();

            if (local + remote) as u32 >= channel.max_users {
                send_permission_denied(client, DenyType::ChannelFull, Some(channel_id), None, "channel is full").await?;

                return Ok(false);
            }
        }

        !state_read.acl_cache.has_permission(&state_read.tree, &subject, channel_id, perm::SPEAK) && !self_mute
    };

    {
        let mut client_write = client.write_err().await?;
        client_write.join_channel(channel_id);
        delta.channel_id = Some(channel_id);
        hub_update.channel_id = Some(channel_id);

        if client_write.suppress != suppress {
            client_write.suppress = suppress;
            delta.suppress = Some(suppress);
            hub_update.suppress = Some(suppress);
        }
    }

    {
        let session = { client.read_err().await?.session_id };
        let mut state_write = edge.state.write_err().await?;
        state_write.move_session_index(session, current_channel, channel_id);
    }

    Ok(true)
}

/// Applies listener subscriptions: Listen permission plus the per-channel
/// and per-user caps, each rejection answered with the specific deny type.
async fn apply_listening(
    state_change: &UserState,
    edge: &Edge,
    client: &Arc<RwLock<Client>>,
    delta: &mut UserState,
    hub_update: &mut UpdateSessionParams,
) -> Result<bool, MumbleError> {
    if state_change.listening_channel_add.is_empty() && state_change.listening_channel_remove.is_empty() {
        return Ok(false);
    }

    let (session, subject, listening_count) = {
        let client_read = client.read_err().await?;
        (client_read.session_id, client_read.subject(), client_read.listening_channels.len() as u32)
    };

    let mut changed = false;
    let mut accepted = 0u32;

    for channel_id in &state_change.listening_channel_add {
        let verdict = {
            let state_read = edge.state.read_err().await?;

            match state_read.tree.get(*channel_id) {
                None => None,
                Some(channel) => {
                    if !state_read.acl_cache.has_permission(&state_read.tree, &subject, *channel_id, perm::LISTEN) {
                        Some(Err((DenyType::Permission, "listen denied")))
                    } else if state_read.config.listeners_per_channel > 0
                        && channel.listeners.len() as u32
                            + state_read
                                .remote
                                .sessions()
                                .filter(|info| info.listening.contains(channel_id))
                                .count() as u32
                            >= state_read.config.listeners_per_channel
                    {
                        Some(Err((DenyType::ChannelListenerLimit, "channel listener limit reached")))
                    } else if state_read.config.listeners_per_user > 0
                        && listening_count + accepted >= state_read.config.listeners_per_user
                    {
                        Some(Err((DenyType::UserListenerLimit, "user listener limit reached")))
                    } else {
                        Some(Ok(()))
                    }
                }
            }
        };

        match verdict {
            None => continue,
            Some(Err((deny, reason))) => {
                send_permission_denied(client, deny, Some(*channel_id), Some(perm::LISTEN), reason).await?;
            }
            Some(Ok(())) => {
                {
                    let mut state_write = edge.state.write_err().await?;

                    if let Some(channel) = state_write.tree.get_mut(*channel_id) {
                        channel.listeners.insert(session);
                    }
                }

                client.write_err().await?.listening_channels.insert(*channel_id);
                delta.listening_channel_add.push(*channel_id);
                hub_update.listening_add.push(*channel_id);
                accepted += 1;
                changed = true;
            }
        }
    }

    for channel_id in &state_change.listening_channel_remove {
        let removed = { client.write_err().await?.listening_channels.remove(channel_id) };

        if removed {
            {
                let mut state_write = edge.state.write_err().await?;

                if let Some(channel) = state_write.tree.get_mut(*channel_id) {
                    channel.listeners.remove(&session);
                }
            }

            delta.listening_channel_remove.push(*channel_id);
            hub_update.listening_remove.push(*channel_id);
            changed = true;
        }
    }

    Ok(changed)
}

/// State changes applied to another session: mute/deafen and moves, gated on
/// MuteDeafen/Move. Only sessions hosted on this edge can be administered;
/// the control surface for remote sessions is the kick path.
async fn handle_other(
    state_change: &UserState,
    edge: &Edge,
    client: Arc<RwLock<Client>>,
    target_session: u32,
) -> Result<(), MumbleError> {
    let actor = {
        let client_read = client.read_err().await?;
        (client_read.session_id, client_read.subject())
    };

    let target = {
        let state_read = edge.state.read_err().await?;
        state_read.clients.get(&target_session).cloned()
    };

    let target = match target {
        Some(target) => target,
        None => {
            let is_remote = { edge.state.read_err().await?.remote.get(target_session).is_some() };

            if is_remote {
                send_permission_denied(&client, DenyType::Permission, None, None, "user is hosted on another node").await?;
            }

            return Ok(());
        }
    };

    let target_channel = { target.read_err().await?.channel_id };

    let mut delta = UserState {
        session: Some(target_session),
        actor: Some(actor.0),
        ..Default::default()
    };
    let mut hub_update = UpdateSessionParams {
        session: target_session,
        ..Default::default()
    };
    let mut changed = false;

    if state_change.mute.is_some() || state_change.deaf.is_some() || state_change.priority_speaker.is_some() {
        let allowed = {
            let state_read = edge.state.read_err().await?;
            state_read
                .acl_cache
                .has_permission(&state_read.tree, &actor.1, target_channel, perm::MUTE_DEAFEN)
        };

        if !allowed {
            return send_permission_denied(
                &client,
                DenyType::Permission,
                Some(target_channel),
                Some(perm::MUTE_DEAFEN),
                "mute/deafen denied",
            )
            .await;
        }

        let mut target_write = target.write_err().await?;

        if let Some(mute) = state_change.mute {
            target_write.mute = mute;
            delta.mute = Some(mute);
            hub_update.mute = Some(mute);
            changed = true;
        }

        if let Some(deaf) = state_change.deaf {
            target_write.deaf = deaf;
            delta.deaf = Some(deaf);
            hub_update.deaf = Some(deaf);

            if deaf && !target_write.mute {
                target_write.mute = true;
                delta.mute = Some(true);
                hub_update.mute = Some(true);
            }

            changed = true;
        }

        if let Some(priority_speaker) = state_change.priority_speaker {
            target_write.priority_speaker = priority_speaker;
            delta.priority_speaker = Some(priority_speaker);
            hub_update.priority_speaker = Some(priority_speaker);
            changed = true;
        }
    }

    if let Some(channel_id) = state_change.channel_id {
        if channel_id != target_channel {
            let allowed = {
                let state_read = edge.state.read_err().await?;
                state_read.tree.contains(channel_id)
                    && state_read.acl_cache.has_permission(&state_read.tree, &actor.1, channel_id, perm::MOVE)
            };

            if !allowed {
                return send_permission_denied(&client, DenyType::Permission, Some(channel_id), Some(perm::MOVE), "move denied").await;
            }

            {
                target.write_err().await?.join_channel(channel_id);
            }

            {
                let mut state_write = edge.state.write_err().await?;
                state_write.move_session_index(target_session, target_channel, channel_id);
            }

            delta.channel_id = Some(channel_id);
            hub_update.channel_id = Some(channel_id);
            changed = true;
        }
    }

    if changed {
        {
            let state_read = edge.state.read_err().await?;
            state_read.broadcast_message(MessageKind::UserState, &delta).await?;
        }

        if let Err(e) = edge.hub.update_session(hub_update).await {
            tracing::warn!("session update not reported to hub: {}", e);
        }
    }

    Ok(())
}
