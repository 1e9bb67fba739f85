//! Hub↔Edge control-plane RPC: length-prefixed MessagePack frames over one
//! TLS stream, typed per method.

use crate::ban::Ban;
use crate::channel::Channel;
use crate::error::RpcError;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames above this size indicate a corrupt stream.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default timeout for a single request.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Keepalive ping cadence.
pub const PING_INTERVAL_SECS: u64 = 30;
/// A peer silent for this long is treated as gone.
pub const ACTIVITY_TIMEOUT_SECS: u64 = 90;

pub mod error_code {
    pub const INTERNAL: i32 = 1000;
    pub const PERMISSION: i32 = 1001;
    pub const UNKNOWN_METHOD: i32 = 1002;
    pub const AUTH_UNAVAILABLE: i32 = 1003;
    pub const NOT_FOUND: i32 = 1004;
    pub const CAPACITY: i32 = 1005;
    pub const TREE: i32 = 1006;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Request {
        id: u64,
        call: RequestBody,
    },
    Response {
        id: u64,
        result: Option<ResponseBody>,
        error: Option<RpcFault>,
    },
    Notification {
        event: NotificationBody,
    },
    Ping {
        id: u64,
    },
    Pong {
        id: u64,
    },
}

/// Error payload carried inside a response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcFault {
    pub code: i32,
    pub message: String,
    /// Mumble PermissionDenied.DenyType, when the failure maps to one.
    pub deny_type: Option<i32>,
}

impl RpcFault {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            deny_type: None,
        }
    }

    pub fn with_deny(mut self, deny_type: i32) -> Self {
        self.deny_type = Some(deny_type);
        self
    }
}

impl From<RpcFault> for RpcError {
    fn from(fault: RpcFault) -> Self {
        RpcError::Remote {
            code: fault.code,
            message: fault.message,
            deny_type: fault.deny_type,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum RequestBody {
    #[serde(rename = "edge.register")]
    Register(RegisterParams),
    #[serde(rename = "edge.heartbeat")]
    Heartbeat(HeartbeatParams),
    #[serde(rename = "edge.join")]
    Join(JoinParams),
    #[serde(rename = "edge.joinComplete")]
    JoinComplete(JoinCompleteParams),
    #[serde(rename = "edge.allocateSessionId")]
    AllocateSessionId(AllocateSessionIdParams),
    #[serde(rename = "edge.reportSession")]
    ReportSession(ReportSessionParams),
    #[serde(rename = "edge.updateSession")]
    UpdateSession(UpdateSessionParams),
    #[serde(rename = "edge.endSession")]
    EndSession(EndSessionParams),
    #[serde(rename = "edge.authenticateUser")]
    AuthenticateUser(AuthenticateUserParams),
    #[serde(rename = "edge.handleACL")]
    HandleAcl(HandleAclParams),
    #[serde(rename = "edge.fullSync")]
    FullSync(FullSyncParams),
    #[serde(rename = "edge.reportPeerDisconnect")]
    ReportPeerDisconnect(ReportPeerDisconnectParams),
    #[serde(rename = "edge.createChannel")]
    CreateChannel(CreateChannelParams),
    #[serde(rename = "edge.updateChannel")]
    UpdateChannel(UpdateChannelParams),
    #[serde(rename = "edge.removeChannel")]
    RemoveChannel(RemoveChannelParams),
    #[serde(rename = "edge.updateBans")]
    UpdateBans(UpdateBansParams),
    #[serde(rename = "edge.kickSession")]
    KickSession(KickSessionParams),
    #[serde(rename = "edge.getBlob")]
    GetBlob(GetBlobParams),
    #[serde(rename = "edge.putBlob")]
    PutBlob(PutBlobParams),
    #[serde(rename = "edge.listUsers")]
    ListUsers(ListUsersParams),
}

impl RequestBody {
    pub fn method(&self) -> &'static str {
        match self {
            RequestBody::Register(_) => "edge.register",
            RequestBody::Heartbeat(_) => "edge.heartbeat",
            RequestBody::Join(_) => "edge.join",
            RequestBody::JoinComplete(_) => "edge.joinComplete",
            RequestBody::AllocateSessionId(_) => "edge.allocateSessionId",
            RequestBody::ReportSession(_) => "edge.reportSession",
            RequestBody::UpdateSession(_) => "edge.updateSession",
            RequestBody::EndSession(_) => "edge.endSession",
            RequestBody::AuthenticateUser(_) => "edge.authenticateUser",
            RequestBody::HandleAcl(_) => "edge.handleACL",
            RequestBody::FullSync(_) => "edge.fullSync",
            RequestBody::ReportPeerDisconnect(_) => "edge.reportPeerDisconnect",
            RequestBody::CreateChannel(_) => "edge.createChannel",
            RequestBody::UpdateChannel(_) => "edge.updateChannel",
            RequestBody::RemoveChannel(_) => "edge.removeChannel",
            RequestBody::UpdateBans(_) => "edge.updateBans",
            RequestBody::KickSession(_) => "edge.kickSession",
            RequestBody::GetBlob(_) => "edge.getBlob",
            RequestBody::PutBlob(_) => "edge.putBlob",
            RequestBody::ListUsers(_) => "edge.listUsers",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "data")]
pub enum ResponseBody {
    #[serde(rename = "edge.register")]
    Register(RegisterResult),
    #[serde(rename = "edge.heartbeat")]
    Heartbeat(HeartbeatResult),
    #[serde(rename = "edge.join")]
    Join(JoinResult),
    #[serde(rename = "edge.allocateSessionId")]
    AllocateSessionId(AllocateSessionIdResult),
    #[serde(rename = "edge.authenticateUser")]
    AuthenticateUser(AuthResult),
    #[serde(rename = "edge.handleACL")]
    HandleAcl(HandleAclResult),
    #[serde(rename = "edge.fullSync")]
    FullSync(Box<FullSyncResult>),
    #[serde(rename = "edge.reportPeerDisconnect")]
    ReportPeerDisconnect(ReportPeerDisconnectResult),
    #[serde(rename = "edge.createChannel")]
    CreateChannel(CreateChannelResult),
    #[serde(rename = "edge.getBlob")]
    GetBlob(GetBlobResult),
    #[serde(rename = "edge.putBlob")]
    PutBlob(PutBlobResult),
    #[serde(rename = "edge.listUsers")]
    ListUsers(ListUsersResult),
    #[serde(rename = "ack")]
    Ack(Ack),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum NotificationBody {
    #[serde(rename = "edge.peerJoined")]
    PeerJoined { peer: PeerInfo },
    #[serde(rename = "edge.peerLeft")]
    PeerLeft { edge_id: u32 },
    #[serde(rename = "edge.forceDisconnect")]
    ForceDisconnect { reason: String },
    #[serde(rename = "edge.aclUpdated")]
    AclUpdated { channel_id: u32, channel: Box<Channel> },
    #[serde(rename = "edge.bansUpdated")]
    BansUpdated { bans: Vec<Ban> },
    #[serde(rename = "channel.created")]
    ChannelCreated { channel: Box<Channel> },
    #[serde(rename = "channel.updated")]
    ChannelUpdated { channel: Box<Channel> },
    #[serde(rename = "channel.removed")]
    ChannelRemoved { channel_ids: Vec<u32> },
    #[serde(rename = "user.remoteUserJoined")]
    RemoteUserJoined { user: RemoteSessionInfo },
    #[serde(rename = "user.remoteUserLeft")]
    RemoteUserLeft { session: u32 },
    #[serde(rename = "user.remoteUserStateChanged")]
    RemoteUserStateChanged { user: RemoteSessionInfo },
    #[serde(rename = "user.kickSession")]
    KickSession { session: u32, reason: String, ban: bool },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

/// The acting client identity attached to hub-authorized operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub session: u32,
    pub user_id: u32,
    pub username: String,
    pub super_user: bool,
    pub channel_id: u32,
    pub cert_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: u32,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub voice_port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeStats {
    pub clients: u32,
    pub uptime_secs: u64,
    pub voice_frames_routed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterParams {
    pub server_id: Option<u32>,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub region: Option<String>,
    pub capacity: u32,
    pub certificate: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResult {
    pub success: bool,
    pub hub_server_id: u32,
    pub edge_list: Vec<PeerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatParams {
    pub server_id: u32,
    pub stats: EdgeStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResult {
    pub success: bool,
    pub updated_edges: Option<Vec<PeerInfo>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinParams {
    pub server_id: u32,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub voice_port: u16,
    pub capacity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResult {
    pub success: bool,
    pub token: String,
    pub peers: Vec<PeerInfo>,
    pub timeout_secs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinCompleteParams {
    pub server_id: u32,
    pub token: String,
    pub connected_peers: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateSessionIdParams {
    pub edge_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateSessionIdResult {
    pub session_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub ip: String,
    pub ip_version: u8,
    pub release: String,
    pub version: u32,
    pub os: String,
    pub os_version: String,
    pub cert_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateUserParams {
    pub session_id: u32,
    pub server_id: u32,
    pub username: String,
    pub password: Option<String>,
    pub tokens: Vec<String>,
    pub client_info: ClientInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthResult {
    pub success: bool,
    pub user_id: u32,
    pub username: String,
    pub display_name: Option<String>,
    pub groups: Vec<String>,
    pub super_user: bool,
    /// Mumble Reject.RejectType when `success` is false.
    pub reject_type: Option<i32>,
    pub reason: Option<String>,
    /// Where a registered user was last seen, for channel restore.
    pub last_channel: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSessionParams {
    pub session: RemoteSessionInfo,
    pub start_time: u64,
    pub ip_address: String,
    pub groups: Vec<String>,
    pub cert_hash: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSessionParams {
    pub session: u32,
    pub channel_id: Option<u32>,
    pub listening_add: Vec<u32>,
    pub listening_remove: Vec<u32>,
    pub mute: Option<bool>,
    pub deaf: Option<bool>,
    pub suppress: Option<bool>,
    pub self_mute: Option<bool>,
    pub self_deaf: Option<bool>,
    pub priority_speaker: Option<bool>,
    pub recording: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndSessionParams {
    pub session: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleAclParams {
    pub edge_id: u32,
    pub actor: Actor,
    pub channel_id: u32,
    pub query: bool,
    /// The client-serialized ACL message body, passed through opaquely.
    pub raw_data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleAclResult {
    pub success: bool,
    pub raw_data: Option<Vec<u8>>,
    pub permission_denied: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FullSyncParams {}

/// Hub-owned limits and presentation settings every edge applies locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncedConfig {
    pub listeners_per_channel: u32,
    pub listeners_per_user: u32,
    pub message_length: u32,
    pub max_users: u32,
    pub max_bandwidth: u32,
    pub welcome_text: String,
    pub allow_html: bool,
    /// Client version the operator recommends (SuggestConfig), if any.
    pub suggest_version: Option<u32>,
}

impl Default for SyncedConfig {
    fn default() -> Self {
        Self {
            listeners_per_channel: 0,
            listeners_per_user: 0,
            message_length: 512,
            max_users: 0,
            max_bandwidth: 144000,
            welcome_text: String::new(),
            allow_html: false,
            suggest_version: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullSyncResult {
    pub channels: Vec<Channel>,
    pub bans: Vec<Ban>,
    pub sessions: Vec<RemoteSessionInfo>,
    pub configs: SyncedConfig,
    pub timestamp: u64,
    pub sequence: u64,
    pub edges: Vec<PeerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportPeerDisconnectParams {
    pub local_edge_id: u32,
    pub remote_edge_id: u32,
    pub local_client_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerDisconnectAction {
    Wait,
    Disconnect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportPeerDisconnectResult {
    pub action: PeerDisconnectAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChannelParams {
    pub actor: Actor,
    pub parent: u32,
    pub name: String,
    pub temporary: bool,
    pub position: i32,
    pub max_users: u32,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChannelResult {
    pub channel_id: u32,
    /// Full snapshot so the requesting edge can apply the channel before the
    /// broadcast notification lands.
    pub channel: Box<Channel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateChannelParams {
    pub actor: Actor,
    pub channel_id: u32,
    pub name: Option<String>,
    pub description: Option<String>,
    pub position: Option<i32>,
    pub max_users: Option<u32>,
    pub parent: Option<u32>,
    pub links_add: Vec<u32>,
    pub links_remove: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveChannelParams {
    pub actor: Actor,
    pub channel_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateBansParams {
    pub actor: Actor,
    pub bans: Vec<Ban>,
    /// true replaces the whole list (BanList edit), false appends (kick+ban).
    pub replace: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KickSessionParams {
    pub actor: Actor,
    pub session: u32,
    pub reason: String,
    pub ban: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBlobParams {
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBlobResult {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutBlobParams {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutBlobResult {
    pub hash: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListUsersParams {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredUserSummary {
    pub user_id: u32,
    pub name: String,
    pub last_seen: Option<u64>,
    pub last_channel: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListUsersResult {
    pub users: Vec<RegisteredUserSummary>,
}

/// The edge-side mirror of a live session anywhere in the cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteSessionInfo {
    pub session: u32,
    pub edge_id: u32,
    pub channel_id: u32,
    pub user_id: u32,
    pub name: String,
    pub mute: bool,
    pub deaf: bool,
    pub suppress: bool,
    pub self_mute: bool,
    pub self_deaf: bool,
    pub priority_speaker: bool,
    pub recording: bool,
    pub listening: Vec<u32>,
}

pub async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, frame: &Frame) -> Result<(), RpcError> {
    let body = rmp_serde::to_vec_named(frame)?;

    if body.len() > MAX_FRAME_SIZE {
        return Err(RpcError::FrameTooLarge(body.len()));
    }

    stream.write_u32(body.len() as u32).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;

    Ok(())
}

pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Frame, RpcError> {
    let len = stream.read_u32().await? as usize;

    if len > MAX_FRAME_SIZE {
        return Err(RpcError::FrameTooLarge(len));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;

    Ok(rmp_serde::from_slice(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;

    fn roundtrip(frame: &Frame) -> Frame {
        let bytes = rmp_serde::to_vec_named(frame).unwrap();
        rmp_serde::from_slice(&bytes).unwrap()
    }

    #[test]
    fn request_frame_roundtrip() {
        let frame = Frame::Request {
            id: 7,
            call: RequestBody::Register(RegisterParams {
                server_id: None,
                name: "edge-1".to_string(),
                host: "10.0.0.2".to_string(),
                port: 64738,
                region: Some("eu".to_string()),
                capacity: 500,
                certificate: None,
            }),
        };

        match roundtrip(&frame) {
            Frame::Request { id, call } => {
                assert_eq!(id, 7);
                assert_eq!(call.method(), "edge.register");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn response_frame_with_error() {
        let frame = Frame::Response {
            id: 3,
            result: None,
            error: Some(RpcFault::new(error_code::PERMISSION, "no Write on channel 4").with_deny(1)),
        };

        match roundtrip(&frame) {
            Frame::Response { id, result, error } => {
                assert_eq!(id, 3);
                assert!(result.is_none());
                let fault = error.unwrap();
                assert_eq!(fault.code, error_code::PERMISSION);
                assert_eq!(fault.deny_type, Some(1));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn notification_with_channel_payload() {
        let mut channel = Channel::new(5, Some(0), "ops".to_string(), false);
        channel.acl.push(crate::acl::AclEntry {
            user_id: None,
            group: Some("all".to_string()),
            apply_here: true,
            apply_subs: false,
            allow: 0,
            deny: crate::acl::perm::SPEAK,
        });

        let frame = Frame::Notification {
            event: NotificationBody::ChannelUpdated { channel: Box::new(channel) },
        };

        match roundtrip(&frame) {
            Frame::Notification {
                event: NotificationBody::ChannelUpdated { channel },
            } => {
                assert_eq!(channel.id, 5);
                assert_eq!(channel.acl.len(), 1);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn ping_pong_roundtrip() {
        assert!(matches!(roundtrip(&Frame::Ping { id: 1 }), Frame::Ping { id: 1 }));
        assert!(matches!(roundtrip(&Frame::Pong { id: 2 }), Frame::Pong { id: 2 }));
    }

    #[actix_rt::test]
    async fn stream_framing_roundtrip() {
        let frame = Frame::Request {
            id: 1,
            call: RequestBody::FullSync(FullSyncParams {}),
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();

        // length prefix covers exactly the body
        let len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        assert_eq!(len, buf.len() - 4);

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_frame(&mut cursor).await.unwrap();
        assert!(matches!(decoded, Frame::Request { id: 1, .. }));
    }
}
