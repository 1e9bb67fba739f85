use crate::acl::AclCache;
use crate::ban::Ban;
use crate::channel::ChannelTree;
use crate::client::Client;
use crate::edge::remote::RemoteDirectory;
use crate::error::MumbleError;
use crate::proto::mumble::{CodecVersion, UserRemove};
use crate::proto::{message_to_bytes, MessageKind};
use crate::rpc::SyncedConfig;
use crate::sync::RwLock;
use bytes::BytesMut;
use prost::Message;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;

pub struct CodecState {
    pub opus: bool,
    pub alpha: i32,
    pub beta: i32,
    pub prefer_alpha: bool,
}

impl Default for CodecState {
    fn default() -> Self {
        Self {
            opus: true,
            alpha: 0,
            beta: 0,
            prefer_alpha: false,
        }
    }
}

impl CodecState {
    pub fn get_version(&self) -> i32 {
        if self.prefer_alpha {
            return self.alpha;
        }

        self.beta
    }

    pub fn get_codec_version(&self) -> CodecVersion {
        CodecVersion {
            alpha: self.alpha,
            beta: self.beta,
            prefer_alpha: self.prefer_alpha,
            opus: Some(self.opus),
        }
    }
}

/// Everything an edge knows: its local sessions, the synced channel tree and
/// bans, and the remote session directory.
pub struct ServerState {
    pub edge_id: u32,
    pub clients: HashMap<u32, Arc<RwLock<Client>>>,
    pub clients_by_socket: HashMap<SocketAddr, Arc<RwLock<Client>>>,
    /// session ids of local members per channel.
    pub sessions_by_channel: HashMap<u32, HashSet<u32>>,
    pub tree: ChannelTree,
    pub acl_cache: AclCache,
    pub codec_state: RwLock<CodecState>,
    pub remote: RemoteDirectory,
    pub bans: Vec<Ban>,
    pub config: SyncedConfig,
    pub socket: Arc<UdpSocket>,
}

impl ServerState {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self {
            edge_id: 0,
            clients: HashMap::new(),
            clients_by_socket: HashMap::new(),
            sessions_by_channel: HashMap::new(),
            tree: ChannelTree::default(),
            acl_cache: AclCache::default(),
            codec_state: RwLock::new(CodecState::default()),
            remote: RemoteDirectory::default(),
            bans: Vec::new(),
            config: SyncedConfig::default(),
            socket,
        }
    }

    pub fn add_client(&mut self, client: Client) -> Arc<RwLock<Client>> {
        let session_id = client.session_id;
        let channel_id = client.channel_id;

        let client = Arc::new(RwLock::new(client));
        self.clients.insert(session_id, client.clone());
        self.sessions_by_channel.entry(channel_id).or_default().insert(session_id);

        client
    }

    pub fn move_session_index(&mut self, session: u32, from: u32, to: u32) {
        if let Some(sessions) = self.sessions_by_channel.get_mut(&from) {
            sessions.remove(&session);

            if sessions.is_empty() {
                self.sessions_by_channel.remove(&from);
            }
        }

        self.sessions_by_channel.entry(to).or_default().insert(session);
    }

    pub fn local_sessions_in(&self, channel_id: u32) -> impl Iterator<Item = &u32> {
        self.sessions_by_channel.get(&channel_id).into_iter().flatten()
    }

    pub async fn get_client_by_name(&self, name: &str) -> Result<Option<Arc<RwLock<Client>>>, MumbleError> {
        for client in self.clients.values() {
            {
                let client_read = client.read_err().await?;

                if client_read.name == name {
                    return Ok(Some(client.clone()));
                }
            }
        }

        Ok(None)
    }

    pub async fn set_client_socket(&mut self, client: Arc<RwLock<Client>>, addr: SocketAddr) -> Result<(), MumbleError> {
        {
            let client_read = client.read_err().await?;

            if let Some(existing_addr) = client_read.udp_socket_addr {
                self.clients_by_socket.remove(&existing_addr);
            }
        }

        {
            client.write_err().await?.udp_socket_addr = Some(addr);
        }

        self.clients_by_socket.insert(addr, client);

        Ok(())
    }

    pub fn get_client_by_socket(&self, socket_addr: &SocketAddr) -> Option<Arc<RwLock<Client>>> {
        self.clients_by_socket.get(socket_addr).cloned()
    }

    pub fn remove_client_by_socket(&mut self, socket_addr: &SocketAddr) {
        self.clients_by_socket.remove(socket_addr);
    }

    /// Queues `message` for every authenticated local client.
    pub async fn broadcast_message<T: Message>(&self, kind: MessageKind, message: &T) -> Result<(), MumbleError> {
        tracing::trace!("broadcast message: {:?}, {:?}", std::any::type_name::<T>(), message);

        let bytes = message_to_bytes(kind, message)?;

        for client in self.clients.values() {
            {
                let client_read = client.read_err().await?;

                if let Err(e) = client_read.queue_bytes(kind, bytes.clone()) {
                    tracing::debug!("[{}] dropped from broadcast: {}", client_read.session_id, e);
                }
            }
        }

        Ok(())
    }

    /// Same as [broadcast_message], excluding one session.
    pub async fn broadcast_message_except<T: Message>(&self, kind: MessageKind, message: &T, except: u32) -> Result<(), MumbleError> {
        let bytes = message_to_bytes(kind, message)?;

        for (session_id, client) in &self.clients {
            if *session_id == except {
                continue;
            }

            {
                let client_read = client.read_err().await?;

                if let Err(e) = client_read.queue_bytes(kind, bytes.clone()) {
                    tracing::debug!("[{}] dropped from broadcast: {}", client_read.session_id, e);
                }
            }
        }

        Ok(())
    }

    /// Identifies the session behind an unknown-source datagram by trying
    /// every local session's cipher. Returns the matching client and the
    /// decrypted payload, plus any socket mappings that went stale.
    pub async fn find_client_for_packet(
        &self,
        bytes: &BytesMut,
    ) -> Result<(Option<(Arc<RwLock<Client>>, BytesMut)>, Vec<SocketAddr>), MumbleError> {
        let mut address_to_remove = Vec::new();

        for c in self.clients.values() {
            let crypt_state = { c.read_err().await?.crypt_state.clone() };
            let mut try_buf = bytes.clone();
            let decrypt_result = { crypt_state.write_err().await?.decrypt(&mut try_buf) };

            match decrypt_result {
                Ok(()) => {
                    return Ok((Some((c.clone(), try_buf)), address_to_remove));
                }
                Err(err) => {
                    let duration = { Instant::now().duration_since(crypt_state.read_err().await?.last_good).as_millis() };

                    // last good packet was more than 5sec ago, reset
                    if duration > 5000 {
                        let send_crypt_setup = { c.read_err().await?.send_crypt_setup(true).await };

                        if let Err(e) = send_crypt_setup {
                            tracing::error!("failed to send crypt setup: {:?}", e);
                        }

                        let address_option = { c.read_err().await?.udp_socket_addr };

                        if let Some(address) = address_option {
                            address_to_remove.push(address);

                            c.write_err().await?.udp_socket_addr = None;
                        }
                    }

                    tracing::debug!("failed to decrypt packet: {:?}, continue to next client", err);
                }
            }
        }

        Ok((None, address_to_remove))
    }

    /// Removes a disconnected client from every structure and tells the
    /// remaining local clients. Returns `(session_id, channel_id)`.
    pub async fn disconnect(&mut self, client: Arc<RwLock<Client>>) -> Result<(u32, u32), MumbleError> {
        let (session_id, channel_id) = {
            let client_read = client.read_err().await?;
            (client_read.session_id, client_read.channel_id)
        };

        self.clients.remove(&session_id);

        if let Some(sessions) = self.sessions_by_channel.get_mut(&channel_id) {
            sessions.remove(&session_id);

            if sessions.is_empty() {
                self.sessions_by_channel.remove(&channel_id);
            }
        }

        {
            if let Some(socket_addr) = client.read_err().await?.udp_socket_addr {
                self.clients_by_socket.remove(&socket_addr);
            }
        }

        let channel_ids: Vec<u32> = self.tree.channels().map(|channel| channel.id).collect();

        for id in channel_ids {
            if let Some(channel) = self.tree.get_mut(id) {
                channel.listeners.remove(&session_id);
            }
        }

        for other in self.clients.values() {
            {
                let other_read = other.read_err().await?;

                for target in &other_read.targets {
                    {
                        target.write_err().await?.sessions.remove(&session_id);
                    }
                }
            }
        }

        self.acl_cache.forget_session(session_id);

        let remove = UserRemove {
            session: session_id,
            actor: None,
            reason: Some("disconnected".to_string()),
            ban: None,
        };

        if let Err(e) = self.broadcast_message(MessageKind::UserRemove, &remove).await {
            tracing::error!("failed to broadcast user remove: {:?}", e);
        }

        Ok((session_id, channel_id))
    }

    /// Applies a hub full sync: tree, bans, limits and the remote directory.
    pub fn apply_full_sync(&mut self, sync: crate::rpc::FullSyncResult, edge_id: u32) {
        self.edge_id = edge_id;
        self.tree.replace_all(sync.channels);
        self.bans = sync.bans;
        self.config = sync.configs;
        self.remote.replace_all(sync.sessions, edge_id);
        self.acl_cache.clear();
    }

    /// Drops all cluster-derived state ahead of a rejoin.
    pub fn clear_for_rejoin(&mut self) {
        self.tree = ChannelTree::default();
        self.bans.clear();
        self.remote.clear();
        self.acl_cache.clear();
    }

    pub async fn check_codec(&self) -> Result<Option<CodecVersion>, MumbleError> {
        let current_version = { self.codec_state.read_err().await?.get_version() };
        let mut new_version = current_version;
        let mut versions = HashMap::new();

        for client in self.clients.values() {
            {
                let client = client.read_err().await?;

                for version in &client.codecs {
                    *versions.entry(*version).or_insert(0) += 1;
                }
            }
        }

        let mut max = 0;

        for (version, count) in versions {
            if count > max {
                new_version = version;
                max = count;
            }
        }

        if new_version == current_version {
            return Ok(Some(self.codec_state.read_err().await?.get_codec_version()));
        }

        let codec_version = {
            let mut codec_state = self.codec_state.write_err().await?;
            codec_state.prefer_alpha = !codec_state.prefer_alpha;

            if codec_state.prefer_alpha {
                codec_state.alpha = new_version;
            } else {
                codec_state.beta = new_version;
            }

            codec_state.get_codec_version()
        };

        match self.broadcast_message(MessageKind::CodecVersion, &codec_version).await {
            Ok(_) => (),
            Err(e) => {
                tracing::error!("failed to broadcast codec version: {:?}", e);
            }
        }

        Ok(None)
    }
}
