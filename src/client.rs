use crate::acl::AclSubject;
use crate::crypt::CryptState;
use crate::error::MumbleError;
use crate::message::ClientMessage;
use crate::proto::mumble::{UserState, Version};
use crate::proto::{message_to_bytes, MessageKind};
use crate::rpc::{AuthResult, RemoteSessionInfo};
use crate::sync::RwLock;
use crate::target::VoiceTarget;
use prost::Message;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tokio::sync::Notify;

/// The `UserState` subset a client may send before authenticating; buffered
/// and applied right after authentication succeeds.
#[derive(Default, Debug, Clone)]
pub struct PreConnectState {
    pub self_mute: Option<bool>,
    pub self_deaf: Option<bool>,
    pub plugin_context: Option<Vec<u8>>,
    pub plugin_identity: Option<String>,
    pub comment: Option<String>,
}

impl PreConnectState {
    pub fn merge(&mut self, state: &UserState) {
        if state.self_mute.is_some() {
            self.self_mute = state.self_mute;
        }
        if state.self_deaf.is_some() {
            self.self_deaf = state.self_deaf;
        }
        if state.plugin_context.is_some() {
            self.plugin_context = state.plugin_context.clone();
        }
        if state.plugin_identity.is_some() {
            self.plugin_identity = state.plugin_identity.clone();
        }
        if state.comment.is_some() {
            self.comment = state.comment.clone();
        }
    }
}

/// One authenticated local session.
pub struct Client {
    pub version: Version,
    pub session_id: u32,
    pub user_id: u32,
    pub name: String,
    pub super_user: bool,
    pub channel_id: u32,
    pub mute: bool,
    pub deaf: bool,
    pub suppress: bool,
    pub self_mute: bool,
    pub self_deaf: bool,
    pub priority_speaker: bool,
    pub recording: bool,
    pub listening_channels: HashSet<u32>,
    pub tokens: Vec<String>,
    pub cert_hash: Option<String>,
    pub ip: IpAddr,
    pub comment: Option<String>,
    pub texture_hash: Option<Vec<u8>>,
    pub comment_hash: Option<Vec<u8>>,
    pub plugin_context: Option<Vec<u8>>,
    pub plugin_identity: Option<String>,
    pub crypt_state: Arc<RwLock<CryptState>>,
    pub udp_socket_addr: Option<SocketAddr>,
    pub use_opus: bool,
    pub codecs: Vec<i32>,
    /// Bounded outbound queue drained by this client's writer task.
    pub publisher: Sender<ClientMessage>,
    /// Signalled to tear the connection down from any task.
    pub shutdown: Arc<Notify>,
    pub targets: Vec<Arc<RwLock<VoiceTarget>>>,
    pub last_ping: RwLock<Instant>,
    pub connected_at: Instant,
    pub start_time: u64,
}

#[allow(clippy::too_many_arguments)]
impl Client {
    pub fn new(
        version: Version,
        auth: &AuthResult,
        session_id: u32,
        tokens: Vec<String>,
        opus: bool,
        codecs: Vec<i32>,
        ip: IpAddr,
        cert_hash: Option<String>,
        crypt_state: CryptState,
        publisher: Sender<ClientMessage>,
        shutdown: Arc<Notify>,
    ) -> Self {
        let mut targets = Vec::with_capacity(30);
        targets.resize_with(30, Default::default);

        Self {
            version,
            session_id,
            user_id: auth.user_id,
            name: auth.username.clone(),
            super_user: auth.super_user,
            channel_id: 0,
            mute: false,
            deaf: false,
            suppress: false,
            self_mute: false,
            self_deaf: false,
            priority_speaker: false,
            recording: false,
            listening_channels: HashSet::new(),
            tokens,
            cert_hash,
            ip,
            comment: None,
            texture_hash: None,
            comment_hash: None,
            plugin_context: None,
            plugin_identity: None,
            crypt_state: Arc::new(RwLock::new(crypt_state)),
            udp_socket_addr: None,
            use_opus: opus,
            codecs,
            publisher,
            shutdown,
            targets,
            last_ping: RwLock::new(Instant::now()),
            connected_at: Instant::now(),
            start_time: crate::ban::unix_now(),
        }
    }

    pub fn get_target(&self, id: usize) -> Option<Arc<RwLock<VoiceTarget>>> {
        self.targets.get(id).cloned()
    }

    /// Queues a control message for the writer task. A full queue means the
    /// client cannot keep up and is torn down instead of blocking the server.
    pub fn queue_message<T: Message>(&self, kind: MessageKind, message: &T) -> Result<(), MumbleError> {
        tracing::trace!("[{}] [{}] send message: {:?}, {:?}", self.name, self.session_id, kind, message);

        let bytes = message_to_bytes(kind, message)?;

        self.queue_bytes(kind, bytes)
    }

    /// Queue variant for pre-serialized frames shared across a broadcast.
    pub fn queue_bytes(&self, kind: MessageKind, bytes: bytes::Bytes) -> Result<(), MumbleError> {
        crate::metrics::MESSAGES_TOTAL
            .with_label_values(&["tcp", "output", kind.to_string().as_str()])
            .inc();
        crate::metrics::MESSAGES_BYTES
            .with_label_values(&["tcp", "output", kind.to_string().as_str()])
            .inc_by(bytes.len() as u64);

        match self.publisher.try_send(ClientMessage::SendMessage { kind, payload: bytes }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!("[{}] [{}] outbound queue overflow", self.name, self.session_id);
                self.shutdown.notify_one();

                Err(MumbleError::PacketOverflow)
            }
            Err(TrySendError::Closed(_)) => Err(MumbleError::ForceDisconnect),
        }
    }

    /// Queues a voice packet. Voice is lossy by design: when the queue is
    /// full the frame is dropped and counted, the client stays.
    pub fn queue_voice(&self, packet: crate::voice::VoicePacket<crate::voice::Clientbound>) {
        match self.publisher.try_send(ClientMessage::SendVoicePacket(packet)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                crate::metrics::VOICE_DROPS_TOTAL.with_label_values(&["queue_full"]).inc();
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub fn disconnect(&self) {
        let _ = self.publisher.try_send(ClientMessage::Disconnect);
        self.shutdown.notify_one();
    }

    pub async fn send_crypt_setup(&self, reset: bool) -> Result<(), MumbleError> {
        if reset {
            self.crypt_state.write_err().await?.reset();
        }

        let crypt_setup = { self.crypt_state.read_err().await?.get_crypt_setup() };

        self.queue_message(MessageKind::CryptSetup, &crypt_setup)
    }

    /// The identity ACL decisions are evaluated for.
    pub fn subject(&self) -> AclSubject {
        AclSubject {
            session: self.session_id,
            user_id: self.user_id,
            super_user: self.super_user,
            channel_id: self.channel_id,
            cert_hash: self.cert_hash.clone(),
        }
    }

    /// Sender-side gate of the voice router.
    pub fn is_silenced(&self) -> bool {
        self.mute || self.self_mute || self.suppress
    }

    /// Recipient-side gate of the voice router.
    pub fn is_deafened(&self) -> bool {
        self.deaf || self.self_deaf
    }

    pub fn apply_preconnect(&mut self, state: &PreConnectState) {
        if let Some(self_mute) = state.self_mute {
            self.self_mute = self_mute;
        }
        if let Some(self_deaf) = state.self_deaf {
            self.self_deaf = self_deaf;
            if self_deaf {
                self.self_mute = true;
            }
        }
        if state.plugin_context.is_some() {
            self.plugin_context = state.plugin_context.clone();
        }
        if state.plugin_identity.is_some() {
            self.plugin_identity = state.plugin_identity.clone();
        }
        if state.comment.is_some() {
            self.comment = state.comment.clone();
        }
    }

    /// Moves the client, returning the channel it left.
    pub fn join_channel(&mut self, mut channel_id: u32) -> Option<u32> {
        if channel_id == self.channel_id {
            return None;
        }

        std::mem::swap(&mut self.channel_id, &mut channel_id);

        Some(channel_id)
    }

    pub fn get_user_state(&self) -> UserState {
        UserState {
            session: Some(self.session_id),
            name: Some(self.name.clone()),
            user_id: if self.user_id > 0 { Some(self.user_id) } else { None },
            channel_id: Some(self.channel_id),
            mute: Some(self.mute),
            deaf: Some(self.deaf),
            suppress: Some(self.suppress),
            self_mute: Some(self.self_mute),
            self_deaf: Some(self.self_deaf),
            priority_speaker: Some(self.priority_speaker),
            recording: Some(self.recording),
            comment_hash: self.comment_hash.clone(),
            texture_hash: self.texture_hash.clone(),
            hash: self.cert_hash.clone(),
            ..Default::default()
        }
    }

    /// The directory record the hub mirrors to every other edge.
    pub fn to_remote_info(&self, edge_id: u32) -> RemoteSessionInfo {
        RemoteSessionInfo {
            session: self.session_id,
            edge_id,
            channel_id: self.channel_id,
            user_id: self.user_id,
            name: self.name.clone(),
            mute: self.mute,
            deaf: self.deaf,
            suppress: self.suppress,
            self_mute: self.self_mute,
            self_deaf: self.self_deaf,
            priority_speaker: self.priority_speaker,
            recording: self.recording,
            listening: self.listening_channels.iter().copied().collect(),
        }
    }
}
