use crate::blob::bytes_to_hex;
use crate::client::Client;
use crate::edge::Edge;
use crate::error::MumbleError;
use crate::handler::Handler;
use crate::proto::mumble::{ChannelState, RequestBlob, UserState};
use crate::proto::MessageKind;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;

/// Serves texture/comment/description content on demand. Blob bytes live at
/// the hub's content-addressed store; edges fetch over RPC and hand the
/// resolved state to the requesting client only.
#[async_trait]
impl Handler for RequestBlob {
    async fn handle(&self, edge: &Edge, client: Arc<RwLock<Client>>) -> Result<(), MumbleError> {
        for session in &self.session_texture {
            let hash = {
                let state_read = edge.state.read_err().await?;

                match state_read.clients.get(session) {
                    Some(target) => target.read_err().await?.texture_hash.clone(),
                    None => None,
                }
            };

            if let Some(hash) = hash {
                match edge.hub.get_blob(bytes_to_hex(&hash)).await {
                    Ok(data) => {
                        let state = UserState {
                            session: Some(*session),
                            texture: Some(data),
                            ..Default::default()
                        };
                        client.read_err().await?.queue_message(MessageKind::UserState, &state)?;
                    }
                    Err(e) => tracing::debug!("texture blob for {} unavailable: {}", session, e),
                }
            }
        }

        for session in &self.session_comment {
            let comment = {
                let state_read = edge.state.read_err().await?;

                match state_read.clients.get(session) {
                    Some(target) => target.read_err().await?.comment.clone(),
                    None => None,
                }
            };

            if let Some(comment) = comment {
                let state = UserState {
                    session: Some(*session),
                    comment: Some(comment),
                    ..Default::default()
                };
                client.read_err().await?.queue_message(MessageKind::UserState, &state)?;
            }
        }

        for channel_id in &self.channel_description {
            let description = {
                let state_read = edge.state.read_err().await?;
                state_read.tree.get(*channel_id).map(|channel| channel.description.clone())
            };

            if let Some(description) = description {
                let state = ChannelState {
                    channel_id: Some(*channel_id),
                    description: Some(description),
                    ..Default::default()
                };
                client.read_err().await?.queue_message(MessageKind::ChannelState, &state)?;
            }
        }

        Ok(())
    }
}
