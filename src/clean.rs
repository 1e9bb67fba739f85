use crate::error::MumbleError;
use crate::state::ServerState;
use crate::sync::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// Sweeps sessions with no control activity past the configured timeout.
pub async fn clean_loop(state: Arc<RwLock<ServerState>>, client_timeout: Duration) {
    loop {
        tracing::trace!("cleaning clients");

        match clean_run(state.clone(), client_timeout).await {
            Ok(_) => (),
            Err(e) => {
                tracing::error!("error in clean loop: {}", e);
            }
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
    }
}

async fn clean_run(state: Arc<RwLock<ServerState>>, client_timeout: Duration) -> Result<(), MumbleError> {
    let mut idle_clients = Vec::new();

    {
        for client in state.read_err().await?.clients.values() {
            let client_read = client.read_err().await?;
            let idle = { client_read.last_ping.read_err().await?.elapsed() };

            if idle > client_timeout {
                tracing::info!("[{}] idle for {:?}, disconnecting", client_read.name, idle);
                idle_clients.push(client.clone());
            }
        }
    }

    for client in idle_clients {
        client.read_err().await?.disconnect();
    }

    Ok(())
}
