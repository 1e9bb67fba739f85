use crate::acl::perm;
use crate::channel::ROOT_CHANNEL_ID;
use crate::client::Client;
use crate::edge::Edge;
use crate::error::MumbleError;
use crate::handler::Handler;
use crate::proto::mumble::{user_stats, UserStats};
use crate::proto::MessageKind;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;

/// Session statistics: full detail for yourself or for administrators,
/// presence-only for everyone else. Only sessions on this edge have live
/// counters to report.
#[async_trait]
impl Handler for UserStats {
    async fn handle(&self, edge: &Edge, client: Arc<RwLock<Client>>) -> Result<(), MumbleError> {
        let (actor_session, subject) = {
            let client_read = client.read_err().await?;
            (client_read.session_id, client_read.subject())
        };

        let target_session = self.session.unwrap_or(actor_session);

        let target = {
            let state_read = edge.state.read_err().await?;
            state_read.clients.get(&target_session).cloned()
        };

        let target = match target {
            Some(target) => target,
            None => return Ok(()),
        };

        let full = target_session == actor_session || {
            let state_read = edge.state.read_err().await?;
            state_read
                .acl_cache
                .has_permission(&state_read.tree, &subject, ROOT_CHANNEL_ID, perm::REGISTER)
        };

        let mut response = UserStats {
            session: Some(target_session),
            ..Default::default()
        };

        {
            let target_read = target.read_err().await?;

            response.onlinesecs = Some(target_read.connected_at.elapsed().as_secs() as u32);
            response.idlesecs = Some(target_read.last_ping.read_err().await?.elapsed().as_secs() as u32);
            response.opus = Some(target_read.use_opus);

            if full {
                let crypt_state = target_read.crypt_state.read_err().await?;

                response.from_client = Some(user_stats::Stats {
                    good: Some(crypt_state.good),
                    late: Some(crypt_state.late),
                    lost: Some(crypt_state.lost),
                    resync: Some(crypt_state.resync),
                });

                response.address = Some(match target_read.ip {
                    IpAddr::V4(v4) => v4.to_ipv6_mapped().octets().to_vec(),
                    IpAddr::V6(v6) => v6.octets().to_vec(),
                });
            }
        }

        client.read_err().await?.queue_message(MessageKind::UserStats, &response)
    }
}
