use crate::client::Client;
use crate::edge::Edge;
use crate::error::MumbleError;
use crate::handler::Handler;
use crate::proto::mumble::VoiceTarget;
use crate::sync::RwLock;
use crate::target::ChannelTarget;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// Rewrites one of the session's 30 whisper slots. Slots are local to the
/// owning edge; the router resolves them at send time, so a slot may name
/// sessions and channels hosted anywhere in the cluster.
#[async_trait]
impl Handler for VoiceTarget {
    async fn handle(&self, edge: &Edge, client: Arc<RwLock<Client>>) -> Result<(), MumbleError> {
        let id = match self.id {
            Some(id @ 1..=30) => id,
            Some(id) => {
                tracing::error!("invalid voice target id: {}", id);

                return Ok(());
            }
            None => return Ok(()),
        };

        let target = match client.read_err().await?.get_target((id - 1) as usize) {
            Some(target) => target,
            None => return Ok(()),
        };

        let mut sessions = HashSet::new();
        let mut channels = Vec::new();

        {
            let state_read = edge.state.read_err().await?;

            for target_item in &self.targets {
                for session in &target_item.session {
                    let known = state_read.clients.contains_key(session) || state_read.remote.get(*session).is_some();

                    if known {
                        sessions.insert(*session);
                    }
                }

                if let Some(channel_id) = target_item.channel_id {
                    if state_read.tree.contains(channel_id) {
                        channels.push(ChannelTarget {
                            channel_id,
                            group: target_item.group.clone(),
                            links: target_item.links.unwrap_or(false),
                            children: target_item.children.unwrap_or(false),
                        });
                    }
                }
            }
        }

        {
            let mut target_write = target.write_err().await?;
            target_write.sessions = sessions;
            target_write.channels = channels;
        }

        Ok(())
    }
}
