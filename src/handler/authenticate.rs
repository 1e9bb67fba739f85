use crate::client::Client;
use crate::edge::Edge;
use crate::error::MumbleError;
use crate::handler::Handler;
use crate::proto::mumble::Authenticate;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;

/// A second Authenticate after the handshake only refreshes the session's
/// access tokens; identity is fixed for the lifetime of the connection.
#[async_trait]
impl Handler for Authenticate {
    async fn handle(&self, _edge: &Edge, client: Arc<RwLock<Client>>) -> Result<(), MumbleError> {
        client.write_err().await?.tokens = self.tokens.clone();

        Ok(())
    }
}
