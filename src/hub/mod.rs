//! The hub node: authoritative owner of channels, ACLs, bans, registered
//! users and the global session directory, serving the edge control plane.

pub mod auth;
pub mod autoban;
pub mod server;
pub mod store;

use crate::acl::{self, perm, AclCache, AclSubject};
use crate::ban::{unix_now, Ban};
use crate::blob::BlobStore;
use crate::channel::{ChannelTree, TreeError, ROOT_CHANNEL_ID};
use crate::config::HubConfig;
use crate::error::MumbleError;
use crate::proto::mumble::{acl as proto_acl, permission_denied::DenyType, Acl};
use crate::rpc::{
    error_code, Ack, Actor, AllocateSessionIdResult, AuthResult, AuthenticateUserParams, CreateChannelParams,
    CreateChannelResult, Frame, FullSyncResult, GetBlobResult, HandleAclParams, HandleAclResult, HeartbeatParams,
    HeartbeatResult, JoinCompleteParams, JoinParams, JoinResult, KickSessionParams, NotificationBody, PeerDisconnectAction,
    PeerInfo, PutBlobResult, RegisterParams, RegisterResult, RemoveChannelParams, ReportPeerDisconnectParams,
    ReportPeerDisconnectResult, ReportSessionParams, RequestBody, ResponseBody, RpcFault, SyncedConfig, UpdateBansParams,
    UpdateChannelParams, UpdateSessionParams,
};
use crate::sync::RwLock;
use auth::{AuthError, Authenticator};
use autoban::AutoBan;
use prost::Message;
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use store::Store;
use tokio::sync::mpsc;

/// Edges silent for this long are evicted from the registry.
const EDGE_DEADLINE: Duration = Duration::from_secs(90);
const JOIN_TIMEOUT_SECS: u32 = 30;

pub struct EdgeEntry {
    pub info: PeerInfo,
    pub capacity: u32,
    pub region: Option<String>,
    pub current_load: u32,
    pub last_heartbeat: Instant,
    pub joined: bool,
    pub join_token: Option<String>,
    pub tx: mpsc::Sender<Frame>,
}

pub struct DirectoryEntry {
    pub info: crate::rpc::RemoteSessionInfo,
    pub start_time: u64,
    pub ip: String,
    pub cert_hash: Option<String>,
    pub groups: Vec<String>,
}

pub struct HubState {
    pub tree: ChannelTree,
    pub bans: Vec<Ban>,
    pub sessions: HashMap<u32, DirectoryEntry>,
    pub edges: HashMap<u32, EdgeEntry>,
    pub next_edge_id: u32,
    pub next_session_id: u32,
    pub sync_sequence: u64,
    pub acl_cache: AclCache,
    pub autoban: AutoBan,
}

pub struct Hub {
    pub config: HubConfig,
    pub state: Arc<RwLock<HubState>>,
    pub store: Arc<Store>,
    pub blobs: Arc<BlobStore>,
    pub auth: Authenticator,
}

/// Per-connection dispatch context: which edge this control stream belongs
/// to (bound at register time) and its writer queue.
pub struct ConnContext {
    pub edge_id: Option<u32>,
    pub tx: mpsc::Sender<Frame>,
}

fn fault_internal(e: impl std::fmt::Display) -> RpcFault {
    RpcFault::new(error_code::INTERNAL, e.to_string())
}

fn fault_permission(message: &str) -> RpcFault {
    RpcFault::new(error_code::PERMISSION, message).with_deny(DenyType::Permission as i32)
}

fn fault_tree(e: TreeError) -> RpcFault {
    let deny = match e {
        TreeError::NestingLimit => DenyType::NestingLimit,
        TreeError::CountLimit => DenyType::ChannelCountLimit,
        TreeError::BadName | TreeError::DuplicateName => DenyType::ChannelName,
        _ => DenyType::Permission,
    };

    RpcFault::new(error_code::TREE, e.to_string()).with_deny(deny as i32)
}

fn subject_of(actor: &Actor) -> AclSubject {
    AclSubject {
        session: actor.session,
        user_id: actor.user_id,
        super_user: actor.super_user,
        channel_id: actor.channel_id,
        cert_hash: actor.cert_hash.clone(),
    }
}

fn random_token() -> String {
    let mut raw = [0u8; 16];

    if SystemRandom::new().fill(&mut raw).is_err() {
        // never reached with a functioning system RNG
        return "0".repeat(32);
    }

    crate::blob::bytes_to_hex(&raw)
}

impl Hub {
    pub fn new(config: HubConfig, store: Store, blobs: BlobStore) -> anyhow::Result<Self> {
        let tree = store.load_tree(config.channel_nesting_limit, config.channel_count_limit)?;

        // a fresh store gets its root row so foreign keys line up
        if let Some(root) = tree.get(ROOT_CHANNEL_ID) {
            store.save_channel(root)?;
        }

        let bans = store.load_bans()?;
        let auth = Authenticator::new(config.auth.clone());

        let state = HubState {
            tree,
            bans,
            sessions: HashMap::new(),
            edges: HashMap::new(),
            next_edge_id: 1,
            next_session_id: 1,
            sync_sequence: 1,
            acl_cache: AclCache::default(),
            autoban: AutoBan::new(config.autoban.clone()),
        };

        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            store: Arc::new(store),
            blobs: Arc::new(blobs),
            auth,
            config,
        })
    }

    pub fn synced_config(&self) -> SyncedConfig {
        SyncedConfig {
            listeners_per_channel: self.config.listeners_per_channel,
            listeners_per_user: self.config.listeners_per_user,
            message_length: self.config.message_length,
            max_users: self.config.max_users,
            max_bandwidth: self.config.max_bandwidth,
            welcome_text: self.config.welcome_text.clone(),
            allow_html: self.config.allow_html,
            suggest_version: self.config.suggest_client_version,
        }
    }

    /// Sends a notification to every joined edge (minus `except`). Slow
    /// edges lose notifications rather than stalling the hub; they recover
    /// through the next full sync.
    pub async fn notify_all(&self, except: Option<u32>, event: NotificationBody) -> Result<(), MumbleError> {
        let state_read = self.state.read_err().await?;

        for (edge_id, entry) in &state_read.edges {
            if Some(*edge_id) == except || !entry.joined {
                continue;
            }

            if let Err(e) = entry.tx.try_send(Frame::Notification { event: event.clone() }) {
                tracing::warn!("edge {} notification dropped: {}", edge_id, e);
            }
        }

        Ok(())
    }

    async fn notify_edge(&self, edge_id: u32, event: NotificationBody) -> Result<(), MumbleError> {
        let state_read = self.state.read_err().await?;

        if let Some(entry) = state_read.edges.get(&edge_id) {
            if let Err(e) = entry.tx.try_send(Frame::Notification { event }) {
                tracing::warn!("edge {} notification dropped: {}", edge_id, e);
            }
        }

        Ok(())
    }

    async fn check_permission(&self, actor: &Actor, channel_id: u32, wanted: u32) -> Result<(), RpcFault> {
        let state_read = self.state.read_err().await.map_err(fault_internal)?;

        if !state_read.tree.contains(channel_id) {
            return Err(RpcFault::new(error_code::NOT_FOUND, format!("channel {channel_id} does not exist")));
        }

        let subject = subject_of(actor);

        if state_read.acl_cache.has_permission(&state_read.tree, &subject, channel_id, wanted) {
            Ok(())
        } else {
            Err(fault_permission(&format!(
                "{} lacks permission {:#x} on channel {}",
                actor.username, wanted, channel_id
            )))
        }
    }

    pub async fn dispatch(&self, conn: &mut ConnContext, body: RequestBody) -> Result<ResponseBody, RpcFault> {
        match body {
            RequestBody::Register(params) => self.register(conn, params).await,
            RequestBody::Heartbeat(params) => self.heartbeat(params).await,
            RequestBody::Join(params) => self.join(params).await,
            RequestBody::JoinComplete(params) => self.join_complete(params).await,
            RequestBody::AllocateSessionId(_) => self.allocate_session_id().await,
            RequestBody::ReportSession(params) => self.report_session(conn, params).await,
            RequestBody::UpdateSession(params) => self.update_session(params).await,
            RequestBody::EndSession(params) => self.end_session(params.session).await,
            RequestBody::AuthenticateUser(params) => self.authenticate_user(params).await,
            RequestBody::HandleAcl(params) => self.handle_acl(params).await,
            RequestBody::FullSync(_) => self.full_sync().await,
            RequestBody::ReportPeerDisconnect(params) => self.report_peer_disconnect(params).await,
            RequestBody::CreateChannel(params) => self.create_channel(conn, params).await,
            RequestBody::UpdateChannel(params) => self.update_channel(params).await,
            RequestBody::RemoveChannel(params) => self.remove_channel(params).await,
            RequestBody::UpdateBans(params) => self.update_bans(params).await,
            RequestBody::KickSession(params) => self.kick_session(params).await,
            RequestBody::GetBlob(params) => match self.blobs.get(&params.hash) {
                Ok(Some(data)) => Ok(ResponseBody::GetBlob(GetBlobResult { data })),
                Ok(None) => Err(RpcFault::new(error_code::NOT_FOUND, format!("blob {} not found", params.hash))),
                Err(e) => Err(fault_internal(e)),
            },
            RequestBody::PutBlob(params) => match self.blobs.put(&params.data) {
                Ok(hash) => Ok(ResponseBody::PutBlob(PutBlobResult { hash })),
                Err(e) => Err(fault_internal(e)),
            },
            RequestBody::ListUsers(_) => match self.store.list_users() {
                Ok(users) => Ok(ResponseBody::ListUsers(crate::rpc::ListUsersResult { users })),
                Err(e) => Err(fault_internal(e)),
            },
        }
    }

    async fn register(&self, conn: &mut ConnContext, params: RegisterParams) -> Result<ResponseBody, RpcFault> {
        let mut state_write = self.state.write_err().await.map_err(fault_internal)?;

        let edge_id = match params.server_id {
            Some(id) if id > 0 => id,
            _ => {
                let id = state_write.next_edge_id;
                state_write.next_edge_id += 1;
                id
            }
        };

        state_write.next_edge_id = state_write.next_edge_id.max(edge_id + 1);

        let entry = EdgeEntry {
            info: PeerInfo {
                id: edge_id,
                name: params.name.clone(),
                host: params.host.clone(),
                port: params.port,
                voice_port: 0,
            },
            capacity: params.capacity,
            region: params.region.clone(),
            current_load: 0,
            last_heartbeat: Instant::now(),
            joined: false,
            join_token: None,
            tx: conn.tx.clone(),
        };

        state_write.edges.insert(edge_id, entry);
        conn.edge_id = Some(edge_id);

        let edge_list = state_write
            .edges
            .values()
            .filter(|entry| entry.joined && entry.info.id != edge_id)
            .map(|entry| entry.info.clone())
            .collect();

        tracing::info!("edge {} ({}) registered from {}", edge_id, params.name, params.host);

        Ok(ResponseBody::Register(RegisterResult {
            success: true,
            hub_server_id: edge_id,
            edge_list,
        }))
    }

    async fn heartbeat(&self, params: HeartbeatParams) -> Result<ResponseBody, RpcFault> {
        let mut state_write = self.state.write_err().await.map_err(fault_internal)?;

        let updated_edges = {
            let entry = state_write
                .edges
                .get_mut(&params.server_id)
                .ok_or_else(|| RpcFault::new(error_code::NOT_FOUND, "unknown edge"))?;

            entry.last_heartbeat = Instant::now();
            entry.current_load = params.stats.clients;

            state_write
                .edges
                .values()
                .filter(|entry| entry.joined && entry.info.id != params.server_id)
                .map(|entry| entry.info.clone())
                .collect()
        };

        Ok(ResponseBody::Heartbeat(HeartbeatResult {
            success: true,
            updated_edges: Some(updated_edges),
        }))
    }

    async fn join(&self, params: JoinParams) -> Result<ResponseBody, RpcFault> {
        let mut state_write = self.state.write_err().await.map_err(fault_internal)?;

        let token = random_token();

        let peers = state_write
            .edges
            .values()
            .filter(|entry| entry.joined && entry.info.id != params.server_id)
            .map(|entry| entry.info.clone())
            .collect();

        let entry = state_write
            .edges
            .get_mut(&params.server_id)
            .ok_or_else(|| RpcFault::new(error_code::NOT_FOUND, "register before join"))?;

        entry.info.host = params.host;
        entry.info.port = params.port;
        entry.info.voice_port = params.voice_port;
        entry.capacity = params.capacity;
        entry.join_token = Some(token.clone());

        Ok(ResponseBody::Join(JoinResult {
            success: true,
            token,
            peers,
            timeout_secs: JOIN_TIMEOUT_SECS,
        }))
    }

    async fn join_complete(&self, params: JoinCompleteParams) -> Result<ResponseBody, RpcFault> {
        let info = {
            let mut state_write = self.state.write_err().await.map_err(fault_internal)?;

            let entry = state_write
                .edges
                .get_mut(&params.server_id)
                .ok_or_else(|| RpcFault::new(error_code::NOT_FOUND, "register before joinComplete"))?;

            if entry.join_token.as_deref() != Some(params.token.as_str()) {
                return Err(RpcFault::new(error_code::PERMISSION, "stale join token"));
            }

            entry.joined = true;
            entry.join_token = None;
            entry.info.clone()
        };

        tracing::info!(
            "edge {} joined the voice mesh ({} peers reported connected)",
            params.server_id,
            params.connected_peers.len()
        );

        self.notify_all(Some(params.server_id), NotificationBody::PeerJoined { peer: info })
            .await
            .map_err(fault_internal)?;

        Ok(ResponseBody::Ack(Ack::ok()))
    }

    async fn allocate_session_id(&self) -> Result<ResponseBody, RpcFault> {
        let mut state_write = self.state.write_err().await.map_err(fault_internal)?;

        let session_id = state_write.next_session_id;
        state_write.next_session_id += 1;

        Ok(ResponseBody::AllocateSessionId(AllocateSessionIdResult { session_id }))
    }

    async fn report_session(&self, conn: &ConnContext, params: ReportSessionParams) -> Result<ResponseBody, RpcFault> {
        let mut info = params.session;

        if let Some(edge_id) = conn.edge_id {
            info.edge_id = edge_id;
        }

        let owner = info.edge_id;
        let session = info.session;

        if let Err(e) = self
            .store
            .touch_user(info.user_id, &info.name, params.cert_hash.as_deref(), None)
        {
            tracing::warn!("user bookkeeping failed: {}", e);
        }

        {
            let mut state_write = self.state.write_err().await.map_err(fault_internal)?;

            state_write.sessions.insert(
                session,
                DirectoryEntry {
                    info: info.clone(),
                    start_time: params.start_time,
                    ip: params.ip_address,
                    cert_hash: params.cert_hash,
                    groups: params.groups,
                },
            );
        }

        self.notify_all(Some(owner), NotificationBody::RemoteUserJoined { user: info })
            .await
            .map_err(fault_internal)?;

        Ok(ResponseBody::Ack(Ack::ok()))
    }

    async fn update_session(&self, params: UpdateSessionParams) -> Result<ResponseBody, RpcFault> {
        let (info, owner, left_channel) = {
            let mut state_write = self.state.write_err().await.map_err(fault_internal)?;

            let entry = state_write
                .sessions
                .get_mut(&params.session)
                .ok_or_else(|| RpcFault::new(error_code::NOT_FOUND, "unknown session"))?;

            let mut left_channel = None;

            if let Some(channel_id) = params.channel_id {
                if channel_id != entry.info.channel_id {
                    left_channel = Some(entry.info.channel_id);
                    entry.info.channel_id = channel_id;
                }
            }

            for added in &params.listening_add {
                if !entry.info.listening.contains(added) {
                    entry.info.listening.push(*added);
                }
            }

            entry.info.listening.retain(|channel| !params.listening_remove.contains(channel));

            if let Some(mute) = params.mute {
                entry.info.mute = mute;
            }
            if let Some(deaf) = params.deaf {
                entry.info.deaf = deaf;
            }
            if let Some(suppress) = params.suppress {
                entry.info.suppress = suppress;
            }
            if let Some(self_mute) = params.self_mute {
                entry.info.self_mute = self_mute;
            }
            if let Some(self_deaf) = params.self_deaf {
                entry.info.self_deaf = self_deaf;
            }
            if let Some(priority_speaker) = params.priority_speaker {
                entry.info.priority_speaker = priority_speaker;
            }
            if let Some(recording) = params.recording {
                entry.info.recording = recording;
            }

            (entry.info.clone(), entry.info.edge_id, left_channel)
        };

        self.notify_all(Some(owner), NotificationBody::RemoteUserStateChanged { user: info })
            .await
            .map_err(fault_internal)?;

        if let Some(left_channel) = left_channel {
            self.reap_if_empty_temp(left_channel).await.map_err(fault_internal)?;
        }

        Ok(ResponseBody::Ack(Ack::ok()))
    }

    async fn end_session(&self, session: u32) -> Result<ResponseBody, RpcFault> {
        let removed = {
            let mut state_write = self.state.write_err().await.map_err(fault_internal)?;
            state_write.sessions.remove(&session)
        };

        let entry = match removed {
            Some(entry) => entry,
            None => return Ok(ResponseBody::Ack(Ack::ok())),
        };

        if let Err(e) = self.store.touch_user(
            entry.info.user_id,
            &entry.info.name,
            entry.cert_hash.as_deref(),
            Some(entry.info.channel_id),
        ) {
            tracing::warn!("user bookkeeping failed: {}", e);
        }

        self.notify_all(Some(entry.info.edge_id), NotificationBody::RemoteUserLeft { session })
            .await
            .map_err(fault_internal)?;

        self.reap_if_empty_temp(entry.info.channel_id).await.map_err(fault_internal)?;

        Ok(ResponseBody::Ack(Ack::ok()))
    }

    /// Removes a temporary channel once its whole subtree is empty.
    async fn reap_if_empty_temp(&self, channel_id: u32) -> Result<(), MumbleError> {
        let removed = {
            let mut state_write = self.state.write_err().await?;

            let is_temp = state_write
                .tree
                .get(channel_id)
                .map(|channel| channel.temporary)
                .unwrap_or(false);

            if !is_temp {
                return Ok(());
            }

            let subtree = state_write.tree.subtree(channel_id);
            let occupied = state_write
                .sessions
                .values()
                .any(|entry| subtree.contains(&entry.info.channel_id));

            if occupied {
                return Ok(());
            }

            let removed = state_write.tree.remove_channel(channel_id).unwrap_or_default();
            state_write.acl_cache.clear();
            state_write.sync_sequence += 1;
            removed
        };

        if !removed.is_empty() {
            tracing::info!("reaped empty temporary channel {} ({} nodes)", channel_id, removed.len());

            self.notify_all(None, NotificationBody::ChannelRemoved { channel_ids: removed }).await?;
        }

        Ok(())
    }

    async fn authenticate_user(&self, params: AuthenticateUserParams) -> Result<ResponseBody, RpcFault> {
        let ip: Option<IpAddr> = params.client_info.ip.parse().ok();

        // bans win over everything else
        {
            let state_read = self.state.read_err().await.map_err(fault_internal)?;

            if let Some(ip) = &ip {
                if crate::ban::find_match(&state_read.bans, ip, params.client_info.cert_hash.as_deref()).is_some() {
                    return Ok(ResponseBody::AuthenticateUser(AuthResult {
                        success: false,
                        reject_type: Some(crate::proto::mumble::reject::RejectType::None as i32),
                        reason: Some("you are banned from this server".to_string()),
                        ..Default::default()
                    }));
                }
            }
        }

        // cluster-wide capacity
        {
            let state_read = self.state.read_err().await.map_err(fault_internal)?;

            if self.config.max_users > 0 && state_read.sessions.len() as u32 >= self.config.max_users {
                return Ok(ResponseBody::AuthenticateUser(AuthResult {
                    success: false,
                    reject_type: Some(crate::proto::mumble::reject::RejectType::ServerFull as i32),
                    reason: Some("server is full".to_string()),
                    ..Default::default()
                }));
            }
        }

        let result = self
            .auth
            .authenticate(
                &params.username,
                params.password.as_deref(),
                &params.tokens,
                &params.client_info,
            )
            .await;

        let mut result = match result {
            Ok(result) => result,
            Err(AuthError::Unavailable(reason)) => {
                return Err(RpcFault::new(error_code::AUTH_UNAVAILABLE, reason));
            }
        };

        // registered users resume where they were last seen
        if result.success && result.user_id > 0 {
            match self.store.last_channel_of(result.user_id) {
                Ok(last_channel) => result.last_channel = last_channel,
                Err(e) => tracing::warn!("last channel lookup failed: {}", e),
            }
        }

        if let Some(ip) = ip {
            if result.success {
                let mut state_write = self.state.write_err().await.map_err(fault_internal)?;
                state_write.autoban.record_success(ip);
            } else if let Some(duration_s) = {
                let mut state_write = self.state.write_err().await.map_err(fault_internal)?;
                state_write.autoban.record_failure(ip)
            } {
                tracing::warn!("auto-banning {} for {}s after repeated failures", ip, duration_s);
                self.append_ban(Ban {
                    id: 0,
                    address: Some(ip),
                    mask: 128,
                    name: Some(params.username.clone()),
                    hash: None,
                    reason: "too many failed connection attempts".to_string(),
                    start: unix_now(),
                    duration_s,
                    created_by: Some("auto-ban".to_string()),
                })
                .await
                .map_err(fault_internal)?;
            }
        }

        Ok(ResponseBody::AuthenticateUser(result))
    }

    async fn append_ban(&self, mut ban: Ban) -> Result<(), MumbleError> {
        let bans = {
            let mut state_write = self.state.write_err().await?;

            ban.id = state_write.bans.iter().map(|existing| existing.id).max().unwrap_or(0) + 1;
            state_write.bans.push(ban);
            state_write.bans.clone()
        };

        if let Err(e) = self.store.save_bans(&bans) {
            tracing::error!("ban persistence failed: {}", e);
        }

        self.notify_all(None, NotificationBody::BansUpdated { bans }).await
    }

    async fn handle_acl(&self, params: HandleAclParams) -> Result<ResponseBody, RpcFault> {
        if let Err(fault) = self.check_permission(&params.actor, params.channel_id, perm::WRITE).await {
            return Ok(ResponseBody::HandleAcl(HandleAclResult {
                success: false,
                raw_data: None,
                permission_denied: true,
                error: Some(fault.message),
            }));
        }

        if params.query {
            let state_read = self.state.read_err().await.map_err(fault_internal)?;
            let message = build_acl_message(&state_read.tree, params.channel_id);

            return Ok(ResponseBody::HandleAcl(HandleAclResult {
                success: true,
                raw_data: Some(message.encode_to_vec()),
                permission_denied: false,
                error: None,
            }));
        }

        let message = Acl::decode(params.raw_data.as_slice())
            .map_err(|e| RpcFault::new(error_code::INTERNAL, format!("undecodable ACL payload: {e}")))?;

        let snapshot = {
            let mut state_write = self.state.write_err().await.map_err(fault_internal)?;

            let channel = state_write
                .tree
                .get_mut(params.channel_id)
                .ok_or_else(|| RpcFault::new(error_code::NOT_FOUND, "channel vanished"))?;

            channel.inherit_acl = message.inherit_acls.unwrap_or(true);
            channel.acl = message
                .acls
                .iter()
                .filter(|entry| !entry.inherited.unwrap_or(false))
                .map(|entry| crate::acl::AclEntry {
                    user_id: entry.user_id,
                    group: entry.group.clone(),
                    apply_here: entry.apply_here.unwrap_or(true),
                    apply_subs: entry.apply_subs.unwrap_or(true),
                    allow: entry.grant.unwrap_or(0),
                    deny: entry.deny.unwrap_or(0),
                })
                .collect();

            channel.groups = message
                .groups
                .iter()
                .filter(|group| !group.inherited.unwrap_or(false) || !group.add.is_empty() || !group.remove.is_empty())
                .map(|group| {
                    (
                        group.name.clone(),
                        crate::acl::Group {
                            name: group.name.clone(),
                            inherit: group.inherit.unwrap_or(true),
                            inheritable: group.inheritable.unwrap_or(true),
                            add: group.add.iter().copied().collect(),
                            remove: group.remove.iter().copied().collect(),
                        },
                    )
                })
                .collect();

            let snapshot = channel.clone();
            state_write.acl_cache.clear();
            state_write.sync_sequence += 1;
            snapshot
        };

        if let Err(e) = self.store.save_channel(&snapshot) {
            tracing::error!("ACL persistence failed: {}", e);
        }

        tracing::info!("ACL of channel {} updated by {}", params.channel_id, params.actor.username);

        self.notify_all(
            None,
            NotificationBody::AclUpdated {
                channel_id: params.channel_id,
                channel: Box::new(snapshot),
            },
        )
        .await
        .map_err(fault_internal)?;

        Ok(ResponseBody::HandleAcl(HandleAclResult {
            success: true,
            raw_data: None,
            permission_denied: false,
            error: None,
        }))
    }

    async fn full_sync(&self) -> Result<ResponseBody, RpcFault> {
        let state_read = self.state.read_err().await.map_err(fault_internal)?;

        let result = FullSyncResult {
            channels: state_read.tree.channels().cloned().collect(),
            bans: state_read.bans.clone(),
            sessions: state_read.sessions.values().map(|entry| entry.info.clone()).collect(),
            configs: self.synced_config(),
            timestamp: unix_now(),
            sequence: state_read.sync_sequence,
            edges: state_read
                .edges
                .values()
                .filter(|entry| entry.joined)
                .map(|entry| entry.info.clone())
                .collect(),
        };

        Ok(ResponseBody::FullSync(Box::new(result)))
    }

    async fn report_peer_disconnect(&self, params: ReportPeerDisconnectParams) -> Result<ResponseBody, RpcFault> {
        let state_read = self.state.read_err().await.map_err(fault_internal)?;

        let peer_alive = state_read
            .edges
            .get(&params.remote_edge_id)
            .map(|entry| entry.joined && entry.last_heartbeat.elapsed() < EDGE_DEADLINE)
            .unwrap_or(false);

        let action = if peer_alive {
            PeerDisconnectAction::Wait
        } else {
            PeerDisconnectAction::Disconnect
        };

        Ok(ResponseBody::ReportPeerDisconnect(ReportPeerDisconnectResult { action }))
    }

    async fn create_channel(&self, conn: &ConnContext, params: CreateChannelParams) -> Result<ResponseBody, RpcFault> {
        let wanted = if params.temporary { perm::MAKE_TEMP_CHANNEL } else { perm::MAKE_CHANNEL };
        self.check_permission(&params.actor, params.parent, wanted).await?;

        let snapshot = {
            let mut state_write = self.state.write_err().await.map_err(fault_internal)?;

            let channel_id = state_write
                .tree
                .add_channel(params.parent, &params.name, params.temporary)
                .map_err(fault_tree)?;

            let channel = state_write
                .tree
                .get_mut(channel_id)
                .ok_or_else(|| RpcFault::new(error_code::INTERNAL, "created channel vanished"))?;

            channel.position = params.position;
            channel.max_users = params.max_users;
            channel.description = params.description.clone();

            let snapshot = channel.clone();
            state_write.acl_cache.clear();
            state_write.sync_sequence += 1;
            snapshot
        };

        if let Err(e) = self.store.save_channel(&snapshot) {
            tracing::error!("channel persistence failed: {}", e);
        }

        tracing::info!(
            "channel {} ({}) created under {} by {}",
            snapshot.id,
            snapshot.name,
            params.parent,
            params.actor.username
        );

        self.notify_all(conn.edge_id, NotificationBody::ChannelCreated {
            channel: Box::new(snapshot.clone()),
        })
        .await
        .map_err(fault_internal)?;

        Ok(ResponseBody::CreateChannel(CreateChannelResult {
            channel_id: snapshot.id,
            channel: Box::new(snapshot),
        }))
    }

    async fn update_channel(&self, params: UpdateChannelParams) -> Result<ResponseBody, RpcFault> {
        self.check_permission(&params.actor, params.channel_id, perm::WRITE).await?;

        if let Some(parent) = params.parent {
            self.check_permission(&params.actor, parent, perm::MAKE_CHANNEL).await?;
        }

        for linked in params.links_add.iter().chain(params.links_remove.iter()) {
            self.check_permission(&params.actor, *linked, perm::LINK_CHANNEL).await?;
        }

        let mut affected = vec![params.channel_id];

        {
            let mut state_write = self.state.write_err().await.map_err(fault_internal)?;

            if let Some(parent) = params.parent {
                state_write.tree.move_channel(params.channel_id, parent).map_err(fault_tree)?;
            }

            {
                let channel = state_write
                    .tree
                    .get_mut(params.channel_id)
                    .ok_or_else(|| RpcFault::new(error_code::NOT_FOUND, "channel vanished"))?;

                if let Some(name) = &params.name {
                    channel.name = name.clone();
                }
                if let Some(description) = &params.description {
                    channel.description = description.clone();
                }
                if let Some(position) = params.position {
                    channel.position = position;
                }
                if let Some(max_users) = params.max_users {
                    channel.max_users = max_users;
                }
            }

            for linked in &params.links_add {
                state_write.tree.link_channels(params.channel_id, *linked).map_err(fault_tree)?;
                affected.push(*linked);
            }

            for linked in &params.links_remove {
                state_write.tree.unlink_channels(params.channel_id, *linked);
                affected.push(*linked);
            }

            state_write.acl_cache.clear();
            state_write.sync_sequence += 1;
        }

        affected.sort_unstable();
        affected.dedup();

        for channel_id in affected {
            let snapshot = {
                let state_read = self.state.read_err().await.map_err(fault_internal)?;
                state_read.tree.get(channel_id).cloned()
            };

            if let Some(snapshot) = snapshot {
                if let Err(e) = self.store.save_channel(&snapshot) {
                    tracing::error!("channel persistence failed: {}", e);
                }

                self.notify_all(None, NotificationBody::ChannelUpdated {
                    channel: Box::new(snapshot),
                })
                .await
                .map_err(fault_internal)?;
            }
        }

        Ok(ResponseBody::Ack(Ack::ok()))
    }

    async fn remove_channel(&self, params: RemoveChannelParams) -> Result<ResponseBody, RpcFault> {
        self.check_permission(&params.actor, params.channel_id, perm::WRITE).await?;

        let (removed, moved_sessions) = {
            let mut state_write = self.state.write_err().await.map_err(fault_internal)?;

            let removed = state_write.tree.remove_channel(params.channel_id).map_err(fault_tree)?;

            let mut moved = Vec::new();

            for entry in state_write.sessions.values_mut() {
                if removed.contains(&entry.info.channel_id) {
                    entry.info.channel_id = ROOT_CHANNEL_ID;
                    moved.push(entry.info.clone());
                }
            }

            state_write.acl_cache.clear();
            state_write.sync_sequence += 1;

            (removed, moved)
        };

        if let Err(e) = self.store.delete_channels(&removed) {
            tracing::error!("channel delete persistence failed: {}", e);
        }

        tracing::info!(
            "channel {} removed by {} ({} nodes)",
            params.channel_id,
            params.actor.username,
            removed.len()
        );

        self.notify_all(None, NotificationBody::ChannelRemoved { channel_ids: removed })
            .await
            .map_err(fault_internal)?;

        for info in moved_sessions {
            self.notify_all(None, NotificationBody::RemoteUserStateChanged { user: info })
                .await
                .map_err(fault_internal)?;
        }

        Ok(ResponseBody::Ack(Ack::ok()))
    }

    async fn update_bans(&self, params: UpdateBansParams) -> Result<ResponseBody, RpcFault> {
        self.check_permission(&params.actor, ROOT_CHANNEL_ID, perm::BAN).await?;

        let bans = {
            let mut state_write = self.state.write_err().await.map_err(fault_internal)?;

            if params.replace {
                let mut bans = params.bans;

                for (index, ban) in bans.iter_mut().enumerate() {
                    ban.id = index as u32 + 1;
                }

                state_write.bans = bans;
            } else {
                let mut next_id = state_write.bans.iter().map(|ban| ban.id).max().unwrap_or(0) + 1;

                for mut ban in params.bans {
                    ban.id = next_id;
                    next_id += 1;
                    state_write.bans.push(ban);
                }
            }

            state_write.bans.clone()
        };

        if let Err(e) = self.store.save_bans(&bans) {
            tracing::error!("ban persistence failed: {}", e);
        }

        self.notify_all(None, NotificationBody::BansUpdated { bans })
            .await
            .map_err(fault_internal)?;

        Ok(ResponseBody::Ack(Ack::ok()))
    }

    async fn kick_session(&self, params: KickSessionParams) -> Result<ResponseBody, RpcFault> {
        let wanted = if params.ban { perm::BAN } else { perm::KICK };
        self.check_permission(&params.actor, ROOT_CHANNEL_ID, wanted).await?;

        let (owner, ip, cert_hash, name) = {
            let state_read = self.state.read_err().await.map_err(fault_internal)?;

            let entry = state_read
                .sessions
                .get(&params.session)
                .ok_or_else(|| RpcFault::new(error_code::NOT_FOUND, "unknown session"))?;

            (
                entry.info.edge_id,
                entry.ip.parse::<IpAddr>().ok(),
                entry.cert_hash.clone(),
                entry.info.name.clone(),
            )
        };

        if params.ban {
            self.append_ban(Ban {
                id: 0,
                address: ip,
                mask: 128,
                name: Some(name),
                hash: cert_hash,
                reason: params.reason.clone(),
                start: unix_now(),
                duration_s: 0,
                created_by: Some(params.actor.username.clone()),
            })
            .await
            .map_err(fault_internal)?;
        }

        self.notify_edge(
            owner,
            NotificationBody::KickSession {
                session: params.session,
                reason: params.reason,
                ban: params.ban,
            },
        )
        .await
        .map_err(fault_internal)?;

        Ok(ResponseBody::Ack(Ack::ok()))
    }

    /// Tears down everything the hub knows about one edge, after its control
    /// stream died or its heartbeats stopped.
    pub async fn edge_disconnected(&self, edge_id: u32) -> Result<(), MumbleError> {
        let (removed_edge, orphaned) = {
            let mut state_write = self.state.write_err().await?;

            let removed_edge = state_write.edges.remove(&edge_id);

            let orphaned: Vec<u32> = state_write
                .sessions
                .values()
                .filter(|entry| entry.info.edge_id == edge_id)
                .map(|entry| entry.info.session)
                .collect();

            let mut channels = Vec::new();

            for session in &orphaned {
                if let Some(entry) = state_write.sessions.remove(session) {
                    channels.push(entry.info.channel_id);
                }
            }

            (removed_edge.map(|entry| (entry.info, channels)), orphaned)
        };

        let (info, channels) = match removed_edge {
            Some(parts) => parts,
            None => return Ok(()),
        };

        tracing::warn!("edge {} ({}) left the cluster, {} sessions evicted", edge_id, info.name, orphaned.len());

        self.notify_all(None, NotificationBody::PeerLeft { edge_id }).await?;

        for session in orphaned {
            self.notify_all(None, NotificationBody::RemoteUserLeft { session }).await?;
        }

        for channel_id in channels {
            self.reap_if_empty_temp(channel_id).await?;
        }

        Ok(())
    }

    /// Evicts edges whose heartbeats stopped without a clean disconnect.
    pub async fn run_deadline_watcher(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(15));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let expired: Vec<u32> = match self.state.read_err().await {
                Ok(state_read) => state_read
                    .edges
                    .iter()
                    .filter(|(_, entry)| entry.last_heartbeat.elapsed() > EDGE_DEADLINE)
                    .map(|(edge_id, _)| *edge_id)
                    .collect(),
                Err(_) => continue,
            };

            for edge_id in expired {
                tracing::warn!("edge {} missed its heartbeat deadline", edge_id);

                if let Err(e) = self.edge_disconnected(edge_id).await {
                    tracing::error!("edge eviction failed: {:?}", e);
                }
            }

            if let Ok(mut state_write) = self.state.write_err().await {
                state_write.autoban.sweep();
            }
        }
    }

    /// Scheduled online backups of the store.
    pub async fn run_backup_scheduler(self: Arc<Self>) {
        let path = match &self.config.backup_path {
            Some(path) => path.clone(),
            None => return,
        };

        let mut interval = tokio::time::interval(Duration::from_secs(self.config.backup_interval_secs.max(60)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // the first tick fires immediately; skip it
        interval.tick().await;

        loop {
            interval.tick().await;

            match self.store.backup_to(&path) {
                Ok(()) => tracing::info!("store backed up to {}", path),
                Err(e) => tracing::error!("store backup failed: {}", e),
            }
        }
    }
}

/// Builds the ACL query reply: the channel's own entries plus every
/// inherited entry along the chain, and its groups with resolved inherited
/// membership.
fn build_acl_message(tree: &ChannelTree, channel_id: u32) -> Acl {
    let mut message = Acl {
        channel_id,
        inherit_acls: tree.get(channel_id).map(|channel| channel.inherit_acl),
        groups: Vec::new(),
        acls: Vec::new(),
        query: None,
    };

    let chain = tree.chain(channel_id);

    for chain_id in &chain {
        let channel = match tree.get(*chain_id) {
            Some(channel) => channel,
            None => continue,
        };

        let inherited = *chain_id != channel_id;

        for entry in &channel.acl {
            if inherited && !entry.apply_subs {
                continue;
            }

            message.acls.push(proto_acl::ChanAcl {
                apply_here: Some(entry.apply_here),
                apply_subs: Some(entry.apply_subs),
                inherited: Some(inherited),
                user_id: entry.user_id,
                group: entry.group.clone(),
                grant: Some(entry.allow),
                deny: Some(entry.deny),
            });
        }
    }

    if let Some(channel) = tree.get(channel_id) {
        for group in channel.groups.values() {
            let inherited_members = match channel.parent_id {
                Some(parent) if group.inherit => acl::effective_members(tree, parent, &group.name),
                _ => Default::default(),
            };

            message.groups.push(proto_acl::ChanGroup {
                name: group.name.clone(),
                inherited: Some(false),
                inherit: Some(group.inherit),
                inheritable: Some(group.inheritable),
                add: group.add.iter().copied().collect(),
                remove: group.remove.iter().copied().collect(),
                inherited_members: inherited_members.iter().copied().collect(),
            });
        }
    }

    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_hub() -> Hub {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let blobs = BlobStore::open(dir.path().join("blobs")).unwrap();

        Hub::new(HubConfig::default(), store, blobs).unwrap()
    }

    fn conn() -> (ConnContext, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(64);

        (ConnContext { edge_id: None, tx }, rx)
    }

    fn admin() -> Actor {
        Actor {
            session: 1,
            user_id: 1,
            username: "admin".to_string(),
            super_user: true,
            channel_id: 0,
            cert_hash: None,
        }
    }

    fn guest() -> Actor {
        Actor {
            session: 2,
            user_id: 0,
            username: "guest".to_string(),
            super_user: false,
            channel_id: 0,
            cert_hash: None,
        }
    }

    #[actix_rt::test]
    async fn register_join_complete_flow() {
        let hub = test_hub();
        let (mut ctx, _rx) = conn();

        let registered = match hub
            .dispatch(
                &mut ctx,
                RequestBody::Register(RegisterParams {
                    server_id: None,
                    name: "edge-1".to_string(),
                    host: "10.0.0.2".to_string(),
                    port: 64738,
                    region: None,
                    capacity: 100,
                    certificate: None,
                }),
            )
            .await
            .unwrap()
        {
            ResponseBody::Register(result) => result,
            other => panic!("unexpected response: {other:?}"),
        };

        assert!(registered.success);
        assert_eq!(ctx.edge_id, Some(registered.hub_server_id));

        let joined = match hub
            .dispatch(
                &mut ctx,
                RequestBody::Join(JoinParams {
                    server_id: registered.hub_server_id,
                    name: "edge-1".to_string(),
                    host: "10.0.0.2".to_string(),
                    port: 64738,
                    voice_port: 64739,
                    capacity: 100,
                }),
            )
            .await
            .unwrap()
        {
            ResponseBody::Join(result) => result,
            other => panic!("unexpected response: {other:?}"),
        };

        assert!(!joined.token.is_empty());

        // a wrong token is refused
        let stale = hub
            .dispatch(
                &mut ctx,
                RequestBody::JoinComplete(JoinCompleteParams {
                    server_id: registered.hub_server_id,
                    token: "bogus".to_string(),
                    connected_peers: vec![],
                }),
            )
            .await;
        assert!(stale.is_err());

        let done = hub
            .dispatch(
                &mut ctx,
                RequestBody::JoinComplete(JoinCompleteParams {
                    server_id: registered.hub_server_id,
                    token: joined.token,
                    connected_peers: vec![],
                }),
            )
            .await;
        assert!(done.is_ok());
    }

    #[actix_rt::test]
    async fn session_ids_are_monotonic() {
        let hub = test_hub();
        let (mut ctx, _rx) = conn();

        let mut last = 0;

        for _ in 0..5 {
            let allocated = match hub
                .dispatch(&mut ctx, RequestBody::AllocateSessionId(crate::rpc::AllocateSessionIdParams { edge_id: 1 }))
                .await
                .unwrap()
            {
                ResponseBody::AllocateSessionId(result) => result.session_id,
                other => panic!("unexpected response: {other:?}"),
            };

            assert!(allocated > last);
            last = allocated;
        }
    }

    #[actix_rt::test]
    async fn channel_creation_requires_permission() {
        let hub = test_hub();
        let (mut ctx, _rx) = conn();

        let denied = hub
            .dispatch(
                &mut ctx,
                RequestBody::CreateChannel(CreateChannelParams {
                    actor: guest(),
                    parent: 0,
                    name: "lounge".to_string(),
                    temporary: false,
                    position: 0,
                    max_users: 0,
                    description: String::new(),
                }),
            )
            .await;

        match denied {
            Err(fault) => assert_eq!(fault.code, error_code::PERMISSION),
            Ok(other) => panic!("guest created a channel: {other:?}"),
        }

        let created = hub
            .dispatch(
                &mut ctx,
                RequestBody::CreateChannel(CreateChannelParams {
                    actor: admin(),
                    parent: 0,
                    name: "lounge".to_string(),
                    temporary: false,
                    position: 1,
                    max_users: 10,
                    description: "the lounge".to_string(),
                }),
            )
            .await
            .unwrap();

        match created {
            ResponseBody::CreateChannel(result) => {
                assert!(result.channel_id > 0);
                assert_eq!(result.channel.name, "lounge");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[actix_rt::test]
    async fn acl_update_persists_and_notifies() {
        let hub = test_hub();
        let (mut ctx, mut rx) = conn();

        // a registered + joined edge receives the fan-out
        hub.dispatch(
            &mut ctx,
            RequestBody::Register(RegisterParams {
                server_id: None,
                name: "edge-1".to_string(),
                host: "h".to_string(),
                port: 1,
                region: None,
                capacity: 10,
                certificate: None,
            }),
        )
        .await
        .unwrap();

        let edge_id = ctx.edge_id.unwrap();
        let token = match hub
            .dispatch(
                &mut ctx,
                RequestBody::Join(JoinParams {
                    server_id: edge_id,
                    name: "edge-1".to_string(),
                    host: "h".to_string(),
                    port: 1,
                    voice_port: 2,
                    capacity: 10,
                }),
            )
            .await
            .unwrap()
        {
            ResponseBody::Join(result) => result.token,
            other => panic!("unexpected response: {other:?}"),
        };

        hub.dispatch(
            &mut ctx,
            RequestBody::JoinComplete(JoinCompleteParams {
                server_id: edge_id,
                token,
                connected_peers: vec![],
            }),
        )
        .await
        .unwrap();

        let update = Acl {
            channel_id: 0,
            inherit_acls: Some(true),
            groups: vec![],
            acls: vec![proto_acl::ChanAcl {
                apply_here: Some(true),
                apply_subs: Some(true),
                inherited: None,
                user_id: None,
                group: Some("all".to_string()),
                grant: Some(0),
                deny: Some(perm::SPEAK),
            }],
            query: Some(false),
        };

        let result = hub
            .dispatch(
                &mut ctx,
                RequestBody::HandleAcl(HandleAclParams {
                    edge_id,
                    actor: admin(),
                    channel_id: 0,
                    query: false,
                    raw_data: update.encode_to_vec(),
                }),
            )
            .await
            .unwrap();

        match result {
            ResponseBody::HandleAcl(result) => assert!(result.success),
            other => panic!("unexpected response: {other:?}"),
        }

        // persisted
        let tree = hub.store.load_tree(10, 100).unwrap();
        assert_eq!(tree.get(0).unwrap().acl.len(), 1);

        // broadcast to the joined edge
        let mut saw_acl_update = false;

        while let Ok(frame) = rx.try_recv() {
            if let Frame::Notification {
                event: NotificationBody::AclUpdated { channel_id, .. },
            } = frame
            {
                assert_eq!(channel_id, 0);
                saw_acl_update = true;
            }
        }

        assert!(saw_acl_update);
    }

    #[actix_rt::test]
    async fn guest_cannot_write_acls() {
        let hub = test_hub();
        let (mut ctx, _rx) = conn();

        let result = hub
            .dispatch(
                &mut ctx,
                RequestBody::HandleAcl(HandleAclParams {
                    edge_id: 1,
                    actor: guest(),
                    channel_id: 0,
                    query: false,
                    raw_data: Acl::default().encode_to_vec(),
                }),
            )
            .await
            .unwrap();

        match result {
            ResponseBody::HandleAcl(result) => {
                assert!(!result.success);
                assert!(result.permission_denied);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[actix_rt::test]
    async fn temp_channel_is_reaped_when_empty() {
        let hub = test_hub();
        let (mut ctx, _rx) = conn();
        ctx.edge_id = Some(1);

        let created = match hub
            .dispatch(
                &mut ctx,
                RequestBody::CreateChannel(CreateChannelParams {
                    actor: admin(),
                    parent: 0,
                    name: "temp".to_string(),
                    temporary: true,
                    position: 0,
                    max_users: 0,
                    description: String::new(),
                }),
            )
            .await
            .unwrap()
        {
            ResponseBody::CreateChannel(result) => result.channel_id,
            other => panic!("unexpected response: {other:?}"),
        };

        // one session joins the temp channel, then moves out
        hub.dispatch(
            &mut ctx,
            RequestBody::ReportSession(ReportSessionParams {
                session: crate::rpc::RemoteSessionInfo {
                    session: 7,
                    edge_id: 1,
                    channel_id: created,
                    name: "alice".to_string(),
                    ..Default::default()
                },
                start_time: 0,
                ip_address: "127.0.0.1".to_string(),
                groups: vec![],
                cert_hash: None,
            }),
        )
        .await
        .unwrap();

        assert!(hub.state.read().await.tree.contains(created));

        hub.dispatch(
            &mut ctx,
            RequestBody::UpdateSession(UpdateSessionParams {
                session: 7,
                channel_id: Some(0),
                ..Default::default()
            }),
        )
        .await
        .unwrap();

        assert!(!hub.state.read().await.tree.contains(created));
    }

    #[actix_rt::test]
    async fn acl_query_includes_inherited_entries() {
        let hub = test_hub();

        {
            let mut state = hub.state.write().await;
            let child = state.tree.add_channel(0, "child", false).unwrap();
            state.tree.get_mut(0).unwrap().acl.push(crate::acl::AclEntry {
                user_id: None,
                group: Some("all".to_string()),
                apply_here: false,
                apply_subs: true,
                allow: perm::MUTE_DEAFEN,
                deny: 0,
            });
            state.tree.get_mut(child).unwrap().acl.push(crate::acl::AclEntry {
                user_id: Some(9),
                group: None,
                apply_here: true,
                apply_subs: false,
                allow: perm::SPEAK,
                deny: 0,
            });

            let message = build_acl_message(&state.tree, child);
            assert_eq!(message.acls.len(), 2);
            assert_eq!(message.acls[0].inherited, Some(true));
            assert_eq!(message.acls[1].inherited, Some(false));
        }
    }
}
