use crate::client::Client;
use crate::edge::Edge;
use crate::error::MumbleError;
use crate::handler::Handler;
use crate::proto::mumble::Ping;
use crate::proto::MessageKind;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

#[async_trait]
impl Handler for Ping {
    async fn handle(&self, _edge: &Edge, client: Arc<RwLock<Client>>) -> Result<(), MumbleError> {
        let client_read = client.read_err().await?;

        {
            *client_read.last_ping.write_err().await? = Instant::now();
        }

        let mut pong = Ping {
            timestamp: self.timestamp,
            ..Default::default()
        };

        {
            let crypt_state = client_read.crypt_state.read_err().await?;
            pong.good = Some(crypt_state.good);
            pong.late = Some(crypt_state.late);
            pong.lost = Some(crypt_state.lost);
            pong.resync = Some(crypt_state.resync);
        }

        client_read.queue_message(MessageKind::Ping, &pong)
    }
}
