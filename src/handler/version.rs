use crate::client::Client;
use crate::edge::Edge;
use crate::error::MumbleError;
use crate::handler::Handler;
use crate::proto::mumble::Version;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
impl Handler for Version {
    async fn handle(&self, _edge: &Edge, client: Arc<RwLock<Client>>) -> Result<(), MumbleError> {
        client.write_err().await?.version = self.clone();

        Ok(())
    }
}
