//! The Mumble control-channel message set (proto2 wire format).
//!
//! Hand-maintained prost structs; tags and optionality follow the protocol
//! definition, so these encode byte-identically to the reference servers.

use prost::Message;

#[derive(Clone, PartialEq, Message)]
pub struct Version {
    #[prost(uint32, optional, tag = "1")]
    pub version: Option<u32>,
    #[prost(string, optional, tag = "2")]
    pub release: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub os: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub os_version: Option<String>,
}

/// Voice frames tunneled over the control channel; the payload is not
/// protobuf and is parsed by [`crate::voice`].
#[derive(Clone, PartialEq, Message)]
pub struct UdpTunnel {
    #[prost(bytes = "vec", required, tag = "1")]
    pub packet: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Authenticate {
    #[prost(string, optional, tag = "1")]
    pub username: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub password: Option<String>,
    #[prost(string, repeated, tag = "3")]
    pub tokens: Vec<String>,
    #[prost(int32, repeated, packed = "false", tag = "4")]
    pub celt_versions: Vec<i32>,
    #[prost(bool, optional, tag = "5")]
    pub opus: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Ping {
    #[prost(uint64, optional, tag = "1")]
    pub timestamp: Option<u64>,
    #[prost(uint32, optional, tag = "2")]
    pub good: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub late: Option<u32>,
    #[prost(uint32, optional, tag = "4")]
    pub lost: Option<u32>,
    #[prost(uint32, optional, tag = "5")]
    pub resync: Option<u32>,
    #[prost(uint32, optional, tag = "6")]
    pub udp_packets: Option<u32>,
    #[prost(uint32, optional, tag = "7")]
    pub tcp_packets: Option<u32>,
    #[prost(float, optional, tag = "8")]
    pub udp_ping_avg: Option<f32>,
    #[prost(float, optional, tag = "9")]
    pub udp_ping_var: Option<f32>,
    #[prost(float, optional, tag = "10")]
    pub tcp_ping_avg: Option<f32>,
    #[prost(float, optional, tag = "11")]
    pub tcp_ping_var: Option<f32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Reject {
    #[prost(enumeration = "reject::RejectType", optional, tag = "1")]
    pub r#type: Option<i32>,
    #[prost(string, optional, tag = "2")]
    pub reason: Option<String>,
}

pub mod reject {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum RejectType {
        None = 0,
        WrongVersion = 1,
        InvalidUsername = 2,
        WrongUserPw = 3,
        WrongServerPw = 4,
        UsernameInUse = 5,
        ServerFull = 6,
        NoCertificate = 7,
        AuthenticatorFail = 8,
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ServerSync {
    #[prost(uint32, optional, tag = "1")]
    pub session: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub max_bandwidth: Option<u32>,
    #[prost(string, optional, tag = "3")]
    pub welcome_text: Option<String>,
    #[prost(uint64, optional, tag = "4")]
    pub permissions: Option<u64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ChannelRemove {
    #[prost(uint32, required, tag = "1")]
    pub channel_id: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ChannelState {
    #[prost(uint32, optional, tag = "1")]
    pub channel_id: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub parent: Option<u32>,
    #[prost(string, optional, tag = "3")]
    pub name: Option<String>,
    #[prost(uint32, repeated, packed = "false", tag = "4")]
    pub links: Vec<u32>,
    #[prost(string, optional, tag = "5")]
    pub description: Option<String>,
    #[prost(uint32, repeated, packed = "false", tag = "6")]
    pub links_add: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "7")]
    pub links_remove: Vec<u32>,
    #[prost(bool, optional, tag = "8")]
    pub temporary: Option<bool>,
    #[prost(int32, optional, tag = "9")]
    pub position: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "10")]
    pub description_hash: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "11")]
    pub max_users: Option<u32>,
    #[prost(bool, optional, tag = "12")]
    pub is_enter_restricted: Option<bool>,
    #[prost(bool, optional, tag = "13")]
    pub can_enter: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct UserRemove {
    #[prost(uint32, required, tag = "1")]
    pub session: u32,
    #[prost(uint32, optional, tag = "2")]
    pub actor: Option<u32>,
    #[prost(string, optional, tag = "3")]
    pub reason: Option<String>,
    #[prost(bool, optional, tag = "4")]
    pub ban: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct UserState {
    #[prost(uint32, optional, tag = "1")]
    pub session: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub actor: Option<u32>,
    #[prost(string, optional, tag = "3")]
    pub name: Option<String>,
    #[prost(uint32, optional, tag = "4")]
    pub user_id: Option<u32>,
    #[prost(uint32, optional, tag = "5")]
    pub channel_id: Option<u32>,
    #[prost(bool, optional, tag = "6")]
    pub mute: Option<bool>,
    #[prost(bool, optional, tag = "7")]
    pub deaf: Option<bool>,
    #[prost(bool, optional, tag = "8")]
    pub suppress: Option<bool>,
    #[prost(bool, optional, tag = "9")]
    pub self_mute: Option<bool>,
    #[prost(bool, optional, tag = "10")]
    pub self_deaf: Option<bool>,
    #[prost(bytes = "vec", optional, tag = "11")]
    pub texture: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "12")]
    pub plugin_context: Option<Vec<u8>>,
    #[prost(string, optional, tag = "13")]
    pub plugin_identity: Option<String>,
    #[prost(string, optional, tag = "14")]
    pub comment: Option<String>,
    #[prost(string, optional, tag = "15")]
    pub hash: Option<String>,
    #[prost(bytes = "vec", optional, tag = "16")]
    pub comment_hash: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "17")]
    pub texture_hash: Option<Vec<u8>>,
    #[prost(bool, optional, tag = "18")]
    pub priority_speaker: Option<bool>,
    #[prost(bool, optional, tag = "19")]
    pub recording: Option<bool>,
    #[prost(string, repeated, tag = "20")]
    pub temporary_access_tokens: Vec<String>,
    #[prost(uint32, repeated, packed = "false", tag = "21")]
    pub listening_channel_add: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "22")]
    pub listening_channel_remove: Vec<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct BanList {
    #[prost(message, repeated, tag = "1")]
    pub bans: Vec<ban_list::BanEntry>,
    #[prost(bool, optional, tag = "2")]
    pub query: Option<bool>,
}

pub mod ban_list {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct BanEntry {
        #[prost(bytes = "vec", required, tag = "1")]
        pub address: Vec<u8>,
        #[prost(uint32, required, tag = "2")]
        pub mask: u32,
        #[prost(string, optional, tag = "3")]
        pub name: Option<String>,
        #[prost(string, optional, tag = "4")]
        pub hash: Option<String>,
        #[prost(string, optional, tag = "5")]
        pub reason: Option<String>,
        #[prost(string, optional, tag = "6")]
        pub start: Option<String>,
        #[prost(uint32, optional, tag = "7")]
        pub duration: Option<u32>,
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct TextMessage {
    #[prost(uint32, optional, tag = "1")]
    pub actor: Option<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "2")]
    pub session: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "3")]
    pub channel_id: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "4")]
    pub tree_id: Vec<u32>,
    #[prost(string, required, tag = "5")]
    pub message: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct PermissionDenied {
    #[prost(uint32, optional, tag = "1")]
    pub permission: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub channel_id: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub session: Option<u32>,
    #[prost(string, optional, tag = "4")]
    pub reason: Option<String>,
    #[prost(enumeration = "permission_denied::DenyType", optional, tag = "5")]
    pub r#type: Option<i32>,
    #[prost(string, optional, tag = "6")]
    pub name: Option<String>,
}

pub mod permission_denied {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum DenyType {
        Text = 0,
        Permission = 1,
        SuperUser = 2,
        ChannelName = 3,
        TextTooLong = 4,
        H9K = 5,
        TemporaryChannel = 6,
        MissingCertificate = 7,
        UserName = 8,
        ChannelFull = 9,
        NestingLimit = 10,
        ChannelCountLimit = 11,
        ChannelListenerLimit = 12,
        UserListenerLimit = 13,
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Acl {
    #[prost(uint32, required, tag = "1")]
    pub channel_id: u32,
    #[prost(bool, optional, tag = "2")]
    pub inherit_acls: Option<bool>,
    #[prost(message, repeated, tag = "3")]
    pub groups: Vec<acl::ChanGroup>,
    #[prost(message, repeated, tag = "4")]
    pub acls: Vec<acl::ChanAcl>,
    #[prost(bool, optional, tag = "5")]
    pub query: Option<bool>,
}

pub mod acl {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ChanGroup {
        #[prost(string, required, tag = "1")]
        pub name: String,
        #[prost(bool, optional, tag = "2")]
        pub inherited: Option<bool>,
        #[prost(bool, optional, tag = "3")]
        pub inherit: Option<bool>,
        #[prost(bool, optional, tag = "4")]
        pub inheritable: Option<bool>,
        #[prost(uint32, repeated, packed = "false", tag = "5")]
        pub add: Vec<u32>,
        #[prost(uint32, repeated, packed = "false", tag = "6")]
        pub remove: Vec<u32>,
        #[prost(uint32, repeated, packed = "false", tag = "7")]
        pub inherited_members: Vec<u32>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ChanAcl {
        #[prost(bool, optional, tag = "1", default = "true")]
        pub apply_here: Option<bool>,
        #[prost(bool, optional, tag = "2", default = "true")]
        pub apply_subs: Option<bool>,
        #[prost(bool, optional, tag = "3")]
        pub inherited: Option<bool>,
        #[prost(uint32, optional, tag = "4")]
        pub user_id: Option<u32>,
        #[prost(string, optional, tag = "5")]
        pub group: Option<String>,
        #[prost(uint32, optional, tag = "6")]
        pub grant: Option<u32>,
        #[prost(uint32, optional, tag = "7")]
        pub deny: Option<u32>,
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct QueryUsers {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub ids: Vec<u32>,
    #[prost(string, repeated, tag = "2")]
    pub names: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CryptSetup {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub client_nonce: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub server_nonce: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ContextActionModify {
    #[prost(string, required, tag = "1")]
    pub action: String,
    #[prost(string, optional, tag = "2")]
    pub text: Option<String>,
    #[prost(uint32, optional, tag = "3")]
    pub context: Option<u32>,
    #[prost(enumeration = "context_action_modify::Operation", optional, tag = "4")]
    pub operation: Option<i32>,
}

pub mod context_action_modify {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum Operation {
        Add = 0,
        Remove = 1,
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ContextAction {
    #[prost(uint32, optional, tag = "1")]
    pub session: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub channel_id: Option<u32>,
    #[prost(string, required, tag = "3")]
    pub action: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct UserList {
    #[prost(message, repeated, tag = "1")]
    pub users: Vec<user_list::User>,
}

pub mod user_list {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct User {
        #[prost(uint32, required, tag = "1")]
        pub user_id: u32,
        #[prost(string, optional, tag = "2")]
        pub name: Option<String>,
        #[prost(string, optional, tag = "3")]
        pub last_seen: Option<String>,
        #[prost(uint32, optional, tag = "4")]
        pub last_channel: Option<u32>,
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct VoiceTarget {
    #[prost(uint32, optional, tag = "1")]
    pub id: Option<u32>,
    #[prost(message, repeated, tag = "2")]
    pub targets: Vec<voice_target::Target>,
}

pub mod voice_target {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Target {
        #[prost(uint32, repeated, packed = "false", tag = "1")]
        pub session: Vec<u32>,
        #[prost(uint32, optional, tag = "2")]
        pub channel_id: Option<u32>,
        #[prost(string, optional, tag = "3")]
        pub group: Option<String>,
        #[prost(bool, optional, tag = "4")]
        pub links: Option<bool>,
        #[prost(bool, optional, tag = "5")]
        pub children: Option<bool>,
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct PermissionQuery {
    #[prost(uint32, optional, tag = "1")]
    pub channel_id: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub permissions: Option<u32>,
    #[prost(bool, optional, tag = "3")]
    pub flush: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CodecVersion {
    #[prost(int32, required, tag = "1")]
    pub alpha: i32,
    #[prost(int32, required, tag = "2")]
    pub beta: i32,
    #[prost(bool, required, tag = "3")]
    pub prefer_alpha: bool,
    #[prost(bool, optional, tag = "4")]
    pub opus: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct UserStats {
    #[prost(uint32, optional, tag = "1")]
    pub session: Option<u32>,
    #[prost(bool, optional, tag = "2")]
    pub stats_only: Option<bool>,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub certificates: Vec<Vec<u8>>,
    #[prost(message, optional, tag = "4")]
    pub from_client: Option<user_stats::Stats>,
    #[prost(message, optional, tag = "5")]
    pub from_server: Option<user_stats::Stats>,
    #[prost(uint32, optional, tag = "6")]
    pub udp_packets: Option<u32>,
    #[prost(uint32, optional, tag = "7")]
    pub tcp_packets: Option<u32>,
    #[prost(float, optional, tag = "8")]
    pub udp_ping_avg: Option<f32>,
    #[prost(float, optional, tag = "9")]
    pub udp_ping_var: Option<f32>,
    #[prost(bytes = "vec", optional, tag = "10")]
    pub address: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "11")]
    pub bandwidth: Option<u32>,
    #[prost(uint32, optional, tag = "12")]
    pub onlinesecs: Option<u32>,
    #[prost(uint32, optional, tag = "13")]
    pub idlesecs: Option<u32>,
    #[prost(bool, optional, tag = "14")]
    pub strong_certificate: Option<bool>,
    #[prost(bool, optional, tag = "15")]
    pub opus: Option<bool>,
}

pub mod user_stats {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Stats {
        #[prost(uint32, optional, tag = "1")]
        pub good: Option<u32>,
        #[prost(uint32, optional, tag = "2")]
        pub late: Option<u32>,
        #[prost(uint32, optional, tag = "3")]
        pub lost: Option<u32>,
        #[prost(uint32, optional, tag = "4")]
        pub resync: Option<u32>,
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct RequestBlob {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub session_texture: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "2")]
    pub session_comment: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "3")]
    pub channel_description: Vec<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ServerConfig {
    #[prost(uint32, optional, tag = "1")]
    pub max_bandwidth: Option<u32>,
    #[prost(string, optional, tag = "2")]
    pub welcome_text: Option<String>,
    #[prost(bool, optional, tag = "3")]
    pub allow_html: Option<bool>,
    #[prost(uint32, optional, tag = "4")]
    pub message_length: Option<u32>,
    #[prost(uint32, optional, tag = "5")]
    pub image_message_length: Option<u32>,
    #[prost(uint32, optional, tag = "6")]
    pub max_users: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SuggestConfig {
    #[prost(uint32, optional, tag = "1")]
    pub version: Option<u32>,
    #[prost(bool, optional, tag = "2")]
    pub positional: Option<bool>,
    #[prost(bool, optional, tag = "3")]
    pub push_to_talk: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PluginDataTransmission {
    #[prost(uint32, optional, tag = "1")]
    pub sender_session: Option<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "2")]
    pub receiver_sessions: Vec<u32>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub data: Option<Vec<u8>>,
    #[prost(string, optional, tag = "4")]
    pub data_id: Option<String>,
}
