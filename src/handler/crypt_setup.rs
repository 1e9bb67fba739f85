use crate::client::Client;
use crate::edge::Edge;
use crate::error::MumbleError;
use crate::handler::Handler;
use crate::proto::mumble::CryptSetup;
use crate::proto::MessageKind;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;

/// A CryptSetup carrying a client nonce resynchronizes our decrypt side; an
/// empty one asks us to resend the full crypt parameters.
#[async_trait]
impl Handler for CryptSetup {
    async fn handle(&self, _edge: &Edge, client: Arc<RwLock<Client>>) -> Result<(), MumbleError> {
        let client_read = client.read_err().await?;

        match &self.client_nonce {
            Some(client_nonce) => {
                client_read.crypt_state.write_err().await?.set_decrypt_nonce(client_nonce);
            }
            None => {
                let crypt_setup = { client_read.crypt_state.read_err().await?.get_crypt_setup() };
                client_read.queue_message(MessageKind::CryptSetup, &crypt_setup)?;
            }
        }

        Ok(())
    }
}
