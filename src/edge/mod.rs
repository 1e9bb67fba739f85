//! The edge node: client termination, hub link supervision and application
//! of hub-published state.

pub mod hub_link;
pub mod peers;
pub mod remote;

use crate::acl::perm;
use crate::channel::{Channel, ROOT_CHANNEL_ID};
use crate::client::Client;
use crate::config::EdgeConfig;
use crate::error::MumbleError;
use crate::proto::mumble::{ChannelRemove, UserRemove, UserState};
use crate::proto::MessageKind;
use crate::rpc::{
    Actor, EdgeStats, HeartbeatParams, JoinCompleteParams, JoinParams, NotificationBody, PeerDisconnectAction, PeerInfo,
    RegisterParams, RemoteSessionInfo, ReportPeerDisconnectParams, ReportSessionParams, UpdateSessionParams,
};
use crate::state::ServerState;
use crate::sync::RwLock;
use hub_link::{HubLink, LinkEvent};
use peers::PeerTransport;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Attempts inside the reconnect window: every 2 s, up to 10 s.
const RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
/// Grace period before a lost voice peer is reported to the hub.
const PEER_GRACE: Duration = Duration::from_secs(3);

/// One edge node's cooperating parts, shared by every handler and server
/// task.
pub struct Edge {
    pub config: EdgeConfig,
    pub state: Arc<RwLock<ServerState>>,
    pub hub: Arc<HubLink>,
    pub peers: Arc<PeerTransport>,
    /// Lets internal tasks inject lifecycle events (forced rejoin).
    pub events_tx: mpsc::UnboundedSender<LinkEvent>,
    pub started_at: Instant,
}

pub fn actor_of(client: &Client) -> Actor {
    Actor {
        session: client.session_id,
        user_id: client.user_id,
        username: client.name.clone(),
        super_user: client.super_user,
        channel_id: client.channel_id,
        cert_hash: client.cert_hash.clone(),
    }
}

/// The UserState local clients see for a session hosted elsewhere.
pub fn remote_user_state(info: &RemoteSessionInfo) -> UserState {
    UserState {
        session: Some(info.session),
        name: Some(info.name.clone()),
        user_id: if info.user_id > 0 { Some(info.user_id) } else { None },
        channel_id: Some(info.channel_id),
        mute: Some(info.mute),
        deaf: Some(info.deaf),
        suppress: Some(info.suppress),
        self_mute: Some(info.self_mute),
        self_deaf: Some(info.self_deaf),
        priority_speaker: Some(info.priority_speaker),
        recording: Some(info.recording),
        ..Default::default()
    }
}

/// Installs a hub-published channel snapshot into the local tree and tells
/// local clients about it. Local listener sets survive the replacement.
pub async fn apply_channel_snapshot(edge: &Edge, mut channel: Channel) -> Result<(), MumbleError> {
    let channel_state = channel.get_channel_state();

    {
        let mut state_write = edge.state.write_err().await?;

        let old_parent = state_write.tree.get(channel.id).and_then(|old| old.parent_id);

        if let Some(old) = state_write.tree.get_mut(channel.id) {
            channel.listeners = std::mem::take(&mut old.listeners);
        }

        if let (Some(old_parent), Some(new_parent)) = (old_parent, channel.parent_id) {
            if old_parent != new_parent {
                if let Some(parent) = state_write.tree.get_mut(old_parent) {
                    parent.children.remove(&channel.id);
                }
            }
        }

        state_write.tree.insert_synced(channel);
        state_write.acl_cache.clear();
    }

    {
        let state_read = edge.state.read_err().await?;
        state_read.broadcast_message(MessageKind::ChannelState, &channel_state).await?;
    }

    Ok(())
}

/// Removes hub-deleted channels locally, parking any of our members in the
/// root channel first.
async fn remove_channels(edge: &Edge, channel_ids: &[u32]) -> Result<(), MumbleError> {
    for channel_id in channel_ids {
        let orphans: Vec<u32> = {
            let state_read = edge.state.read_err().await?;
            state_read.local_sessions_in(*channel_id).copied().collect()
        };

        for session in orphans {
            let client = { edge.state.read_err().await?.clients.get(&session).cloned() };

            if let Some(client) = client {
                {
                    client.write_err().await?.join_channel(ROOT_CHANNEL_ID);
                }

                {
                    let mut state_write = edge.state.write_err().await?;
                    state_write.move_session_index(session, *channel_id, ROOT_CHANNEL_ID);
                }

                let moved = UserState {
                    session: Some(session),
                    channel_id: Some(ROOT_CHANNEL_ID),
                    ..Default::default()
                };

                {
                    let state_read = edge.state.read_err().await?;
                    state_read.broadcast_message(MessageKind::UserState, &moved).await?;
                }
            }
        }

        {
            let mut state_write = edge.state.write_err().await?;
            let _ = state_write.tree.remove_channel(*channel_id);
            state_write.acl_cache.clear();
        }

        {
            let state_read = edge.state.read_err().await?;
            state_read
                .broadcast_message(MessageKind::ChannelRemove, &ChannelRemove { channel_id: *channel_id })
                .await?;
        }
    }

    Ok(())
}

/// After an ACL change on `channel_id`: recompute `suppress` for every
/// local session in the channel and publish the deltas (spec'd refresh on
/// ACL change).
pub async fn suppress_refresh(edge: &Edge, channel_id: u32) -> Result<(), MumbleError> {
    let members: Vec<u32> = {
        let state_read = edge.state.read_err().await?;
        state_read.local_sessions_in(channel_id).copied().collect()
    };

    for session in members {
        let client = { edge.state.read_err().await?.clients.get(&session).cloned() };

        let client = match client {
            Some(client) => client,
            None => continue,
        };

        let (subject, self_mute, current) = {
            let client_read = client.read_err().await?;
            (client_read.subject(), client_read.self_mute, client_read.suppress)
        };

        let suppress = {
            let state_read = edge.state.read_err().await?;
            !state_read.acl_cache.has_permission(&state_read.tree, &subject, channel_id, perm::SPEAK) && !self_mute
        };

        if suppress == current {
            continue;
        }

        {
            client.write_err().await?.suppress = suppress;
        }

        let delta = UserState {
            session: Some(session),
            suppress: Some(suppress),
            ..Default::default()
        };

        {
            let state_read = edge.state.read_err().await?;
            state_read.broadcast_message(MessageKind::UserState, &delta).await?;
        }

        let update = UpdateSessionParams {
            session,
            suppress: Some(suppress),
            ..Default::default()
        };

        if let Err(e) = edge.hub.update_session(update).await {
            tracing::warn!("suppress change not reported to hub: {}", e);
        }
    }

    Ok(())
}

/// Applies one hub notification. Returns true when the edge must perform a
/// full disconnect and rejoin.
pub async fn handle_notification(edge: &Arc<Edge>, event: NotificationBody) -> Result<bool, MumbleError> {
    match event {
        NotificationBody::ForceDisconnect { reason } => {
            tracing::warn!("hub forced disconnect: {}", reason);

            return Ok(true);
        }
        NotificationBody::PeerJoined { peer } => {
            let own_id = { edge.state.read_err().await?.edge_id };

            if peer.id != own_id {
                edge.peers.set_peer(peer.id, &peer.host, peer.voice_port).await?;
            }
        }
        NotificationBody::PeerLeft { edge_id } => {
            edge.peers.remove_peer(edge_id).await?;
            spawn_peer_disconnect_check(edge.clone(), edge_id);
        }
        NotificationBody::AclUpdated { channel_id, channel } => {
            apply_channel_snapshot(edge, *channel).await?;
            suppress_refresh(edge, channel_id).await?;
        }
        NotificationBody::BansUpdated { bans } => {
            edge.state.write_err().await?.bans = bans;
        }
        NotificationBody::ChannelCreated { channel } | NotificationBody::ChannelUpdated { channel } => {
            apply_channel_snapshot(edge, *channel).await?;
        }
        NotificationBody::ChannelRemoved { channel_ids } => {
            remove_channels(edge, &channel_ids).await?;
        }
        NotificationBody::RemoteUserJoined { user } => {
            let own_id = { edge.state.read_err().await?.edge_id };

            if user.edge_id != own_id {
                let state = remote_user_state(&user);

                {
                    let mut state_write = edge.state.write_err().await?;
                    state_write.remote.upsert(user);
                }

                let state_read = edge.state.read_err().await?;
                state_read.broadcast_message(MessageKind::UserState, &state).await?;
            }
        }
        NotificationBody::RemoteUserStateChanged { user } => {
            let own_id = { edge.state.read_err().await?.edge_id };

            if user.edge_id != own_id {
                let state = remote_user_state(&user);

                {
                    let mut state_write = edge.state.write_err().await?;
                    state_write.remote.upsert(user);
                }

                let state_read = edge.state.read_err().await?;
                state_read.broadcast_message(MessageKind::UserState, &state).await?;
            }
        }
        NotificationBody::RemoteUserLeft { session } => {
            let removed = {
                let mut state_write = edge.state.write_err().await?;
                state_write.remote.remove(session)
            };

            if removed.is_some() {
                let remove = UserRemove {
                    session,
                    actor: None,
                    reason: None,
                    ban: None,
                };

                let state_read = edge.state.read_err().await?;
                state_read.broadcast_message(MessageKind::UserRemove, &remove).await?;
            }
        }
        NotificationBody::KickSession { session, reason, ban } => {
            let client = { edge.state.read_err().await?.clients.get(&session).cloned() };

            if let Some(client) = client {
                let remove = UserRemove {
                    session,
                    actor: None,
                    reason: Some(reason),
                    ban: Some(ban),
                };

                {
                    let state_read = edge.state.read_err().await?;
                    state_read.broadcast_message(MessageKind::UserRemove, &remove).await?;
                }

                client.read_err().await?.disconnect();
            }
        }
    }

    Ok(false)
}

/// A peer endpoint vanished: give it a short grace period, then ask the hub
/// whether to wait it out or tear down.
fn spawn_peer_disconnect_check(edge: Arc<Edge>, remote_edge_id: u32) {
    actix_rt::spawn(async move {
        tokio::time::sleep(PEER_GRACE).await;

        let still_gone = match edge.peers.peer_ids().await {
            Ok(ids) => !ids.contains(&remote_edge_id),
            Err(_) => return,
        };

        if !still_gone {
            return;
        }

        let (local_edge_id, local_client_count) = match edge.state.read_err().await {
            Ok(state_read) => (state_read.edge_id, state_read.clients.len() as u32),
            Err(_) => return,
        };

        let verdict = edge
            .hub
            .report_peer_disconnect(ReportPeerDisconnectParams {
                local_edge_id,
                remote_edge_id,
                local_client_count,
            })
            .await;

        match verdict {
            Ok(result) if result.action == PeerDisconnectAction::Disconnect => {
                tracing::warn!("hub directed disconnect after losing peer {}", remote_edge_id);

                let _ = edge.events_tx.send(LinkEvent::Notification(NotificationBody::ForceDisconnect {
                    reason: format!("peer edge {remote_edge_id} lost"),
                }));
            }
            Ok(_) => {
                tracing::info!("hub directed wait after losing peer {}", remote_edge_id);
            }
            Err(e) => {
                tracing::debug!("peer disconnect report failed: {}", e);
            }
        }
    });
}

/// Connect → register → join → peer endpoints → joinComplete → fullSync.
/// Also the resume path: re-running it refreshes every piece of synced
/// state while local client sessions stay up.
pub async fn startup(edge: &Arc<Edge>) -> Result<(), MumbleError> {
    edge.hub.clone().connect().await?;

    let previous_id = { edge.state.read_err().await?.edge_id };

    let register = edge
        .hub
        .register(RegisterParams {
            server_id: if previous_id > 0 { Some(previous_id) } else { None },
            name: edge.config.name.clone(),
            host: edge.config.public_host().to_string(),
            port: edge.config.port,
            region: edge.config.region.clone(),
            capacity: edge.config.capacity,
            certificate: None,
        })
        .await?;

    let edge_id = register.hub_server_id;

    {
        edge.state.write_err().await?.edge_id = edge_id;
    }

    let join = edge
        .hub
        .join(JoinParams {
            server_id: edge_id,
            name: edge.config.name.clone(),
            host: edge.config.public_host().to_string(),
            port: edge.config.port,
            voice_port: edge.config.voice_port(),
            capacity: edge.config.capacity,
        })
        .await?;

    edge.peers.clear().await?;

    let mut connected_peers = Vec::new();

    for peer in &join.peers {
        if peer.id == edge_id {
            continue;
        }

        match edge.peers.set_peer(peer.id, &peer.host, peer.voice_port).await {
            Ok(()) => connected_peers.push(peer.id),
            Err(e) => tracing::warn!("cannot register voice peer {}: {}", peer.id, e),
        }
    }

    edge.hub
        .join_complete(JoinCompleteParams {
            server_id: edge_id,
            token: join.token,
            connected_peers,
        })
        .await?;

    let sync = edge.hub.full_sync().await?;

    {
        let mut state_write = edge.state.write_err().await?;
        state_write.apply_full_sync(sync, edge_id);
    }

    // resume path: make sure the hub directory covers our live sessions
    let clients: Vec<_> = {
        let state_read = edge.state.read_err().await?;
        state_read.clients.values().cloned().collect()
    };

    for client in clients {
        let (info, ip, start_time, cert_hash) = {
            let client_read = client.read_err().await?;
            (
                client_read.to_remote_info(edge_id),
                client_read.ip.to_string(),
                client_read.start_time,
                client_read.cert_hash.clone(),
            )
        };

        if let Err(e) = edge
            .hub
            .report_session(ReportSessionParams {
                session: info,
                start_time,
                ip_address: ip,
                groups: Vec::new(),
                cert_hash,
            })
            .await
        {
            tracing::warn!("session re-report failed: {}", e);
        }
    }

    tracing::info!("edge {} joined the cluster ({} peers)", edge_id, join.peers.len().saturating_sub(1));

    Ok(())
}

async fn heartbeat_loop(edge: Arc<Edge>) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let (edge_id, clients) = match edge.state.read_err().await {
            Ok(state_read) => (state_read.edge_id, state_read.clients.len() as u32),
            Err(_) => continue,
        };

        let params = HeartbeatParams {
            server_id: edge_id,
            stats: EdgeStats {
                clients,
                uptime_secs: edge.started_at.elapsed().as_secs(),
                voice_frames_routed: crate::metrics::VOICE_FORWARDS_TOTAL.with_label_values(&["output"]).get(),
            },
        };

        match edge.hub.heartbeat(params).await {
            Ok(result) => {
                if let Some(updated) = result.updated_edges {
                    apply_peer_list(&edge, edge_id, &updated).await;
                }
            }
            Err(e) => {
                tracing::debug!("heartbeat failed: {}", e);
            }
        }
    }
}

async fn apply_peer_list(edge: &Arc<Edge>, own_id: u32, peers: &[PeerInfo]) {
    for peer in peers {
        if peer.id == own_id {
            continue;
        }

        if let Err(e) = edge.peers.set_peer(peer.id, &peer.host, peer.voice_port).await {
            tracing::warn!("cannot update voice peer {}: {}", peer.id, e);
        }
    }
}

/// Close peer endpoints, drop every local client with a transient reason and
/// clear all synced state, ahead of a clean rejoin.
pub async fn full_disconnect(edge: &Arc<Edge>) {
    tracing::warn!("performing full disconnect");

    if let Err(e) = edge.peers.clear().await {
        tracing::warn!("peer clear failed: {:?}", e);
    }

    let clients: Vec<_> = match edge.state.read_err().await {
        Ok(state_read) => state_read.clients.values().cloned().collect(),
        Err(_) => Vec::new(),
    };

    for client in clients {
        if let Ok(client_read) = client.read_err().await {
            tracing::info!("[{}] disconnected: cluster membership lost", client_read.name);
            client_read.disconnect();
        }
    }

    if let Ok(mut state_write) = edge.state.write_err().await {
        state_write.clear_for_rejoin();
    }
}

/// The cluster lifecycle: join, serve notifications and heartbeats, ride out
/// hub loss through the reconnect window, otherwise full disconnect, wait
/// and rejoin.
pub async fn run_lifecycle(edge: Arc<Edge>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
    loop {
        let mut connected = false;

        for attempt in 1..=RECONNECT_ATTEMPTS {
            match startup(&edge).await {
                Ok(()) => {
                    connected = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!("hub connection attempt {}/{} failed: {:?}", attempt, RECONNECT_ATTEMPTS, e);
                    tokio::time::sleep(RECONNECT_INTERVAL).await;
                }
            }
        }

        if !connected {
            full_disconnect(&edge).await;
            tokio::time::sleep(Duration::from_secs(edge.config.rejoin_delay_secs)).await;
            continue;
        }

        let heartbeat = actix_rt::spawn(heartbeat_loop(edge.clone()));
        let force = run_events(&edge, &mut events).await;
        heartbeat.abort();

        if force {
            full_disconnect(&edge).await;
            tokio::time::sleep(Duration::from_secs(edge.config.rejoin_delay_secs)).await;
        }

        // link down: the loop re-enters the reconnect window
    }
}

/// Serves link events until the link dies (false) or a forced rejoin is
/// required (true).
async fn run_events(edge: &Arc<Edge>, events: &mut mpsc::UnboundedReceiver<LinkEvent>) -> bool {
    let current_generation = edge.hub.generation();

    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Down { generation } => {
                if generation >= current_generation {
                    tracing::warn!("hub control link lost");

                    return false;
                }
            }
            LinkEvent::Notification(notification) => match handle_notification(edge, notification).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => tracing::error!("notification handling failed: {:?}", e),
            },
        }
    }

    false
}
