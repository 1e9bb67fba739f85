//! The voice fan-out engine: resolves a talker's target to the local
//! recipient set and the minimal set of peer edges, then delivers.

use crate::acl::{self, perm, AclSubject};
use crate::client::Client;
use crate::edge::peers::{EdgeVoiceHeader, PeerTransport, EDGE_VOICE_VERSION};
use crate::error::MumbleError;
use crate::state::ServerState;
use crate::sync::RwLock;
use crate::target::VoiceTarget;
use crate::voice::{encode_voice_packet, Serverbound, VoicePacket};
use bytes::BytesMut;
use std::sync::Arc;

/// Slot value meaning "talk into my current channel".
pub const TARGET_NORMAL: u8 = 0;
/// Slot value meaning "echo back to me only".
pub const TARGET_LOOPBACK: u8 = 31;

#[derive(Default, Debug, PartialEq, Eq)]
pub struct RouteDecision {
    pub loopback: bool,
    /// Local recipient sessions (deafened recipients filtered at delivery).
    pub local: Vec<u32>,
    /// `(edge_id, header target channel)` pairs, deduplicated.
    pub remote: Vec<(u32, u32)>,
}

/// Everything of the sender the resolver needs, snapshotted so no client
/// lock is held while the routing decision is computed.
pub struct SenderContext {
    pub session: u32,
    pub channel_id: u32,
    pub silenced: bool,
    pub subject: AclSubject,
    pub slot: Option<VoiceTarget>,
}

pub async fn snapshot_sender(client: &Arc<RwLock<Client>>, target: u8) -> Result<SenderContext, MumbleError> {
    let client_read = client.read_err().await?;

    let slot = match target {
        1..=30 => match client_read.get_target((target - 1) as usize) {
            Some(slot) => Some(slot.read_err().await?.clone()),
            None => None,
        },
        _ => None,
    };

    Ok(SenderContext {
        session: client_read.session_id,
        channel_id: client_read.channel_id,
        silenced: client_read.is_silenced(),
        subject: client_read.subject(),
        slot,
    })
}

/// Computes who hears a frame with the given target byte. Pure with respect
/// to delivery: nothing is sent.
pub async fn resolve(state: &ServerState, sender: &SenderContext, target: u8) -> Result<RouteDecision, MumbleError> {
    let mut decision = RouteDecision::default();

    if sender.silenced {
        crate::metrics::VOICE_DROPS_TOTAL.with_label_values(&["sender_muted"]).inc();

        return Ok(decision);
    }

    match target {
        TARGET_LOOPBACK => {
            decision.loopback = true;
        }
        TARGET_NORMAL => {
            if !state.acl_cache.has_permission(&state.tree, &sender.subject, sender.channel_id, perm::SPEAK) {
                crate::metrics::VOICE_DROPS_TOTAL.with_label_values(&["speak_denied"]).inc();

                return Ok(decision);
            }

            let mut channels = vec![sender.channel_id];

            if let Some(channel) = state.tree.get(sender.channel_id) {
                for linked in &channel.links {
                    if state.acl_cache.has_permission(&state.tree, &sender.subject, *linked, perm::SPEAK) {
                        channels.push(*linked);
                    }
                }
            }

            for channel_id in channels {
                collect_channel(state, sender, channel_id, None, &mut decision).await?;
            }
        }
        1..=30 => {
            let slot = match &sender.slot {
                Some(slot) => slot,
                None => return Ok(decision),
            };

            for session in &slot.sessions {
                if *session == sender.session {
                    continue;
                }

                if state.clients.contains_key(session) {
                    decision.local.push(*session);
                } else if let Some(info) = state.remote.get(*session) {
                    if !info.deaf && !info.self_deaf {
                        decision.remote.push((info.edge_id, info.channel_id));
                    }
                }
            }

            for channel_target in &slot.channels {
                if !state
                    .acl_cache
                    .has_permission(&state.tree, &sender.subject, channel_target.channel_id, perm::WHISPER)
                {
                    crate::metrics::VOICE_DROPS_TOTAL.with_label_values(&["whisper_denied"]).inc();
                    continue;
                }

                let mut channels = vec![channel_target.channel_id];

                if channel_target.links {
                    if let Some(channel) = state.tree.get(channel_target.channel_id) {
                        channels.extend(channel.links.iter().copied());
                    }
                }

                if channel_target.children {
                    channels.extend(
                        state
                            .tree
                            .subtree(channel_target.channel_id)
                            .into_iter()
                            .filter(|id| *id != channel_target.channel_id),
                    );
                }

                for channel_id in channels {
                    collect_channel(state, sender, channel_id, channel_target.group.as_deref(), &mut decision).await?;
                }
            }
        }
        _ => {
            tracing::error!("invalid voice target: {}", target);
        }
    }

    decision.local.sort_unstable();
    decision.local.dedup();
    decision.local.retain(|session| *session != sender.session);
    decision.remote.sort_unstable();
    decision.remote.dedup();

    Ok(decision)
}

/// Adds the local and remote audience of one channel, optionally narrowed
/// to members of `group` (evaluated at that channel).
async fn collect_channel(
    state: &ServerState,
    sender: &SenderContext,
    channel_id: u32,
    group: Option<&str>,
    decision: &mut RouteDecision,
) -> Result<(), MumbleError> {
    let mut sessions: Vec<u32> = state.local_sessions_in(channel_id).copied().collect();

    if let Some(channel) = state.tree.get(channel_id) {
        sessions.extend(channel.listeners.iter().copied());
    }

    for session in sessions {
        if session == sender.session {
            continue;
        }

        if let Some(group) = group {
            match state.clients.get(&session) {
                Some(client) => {
                    let subject = { client.read_err().await?.subject() };

                    if !acl::is_member(&state.tree, channel_id, group, &subject) {
                        continue;
                    }
                }
                None => continue,
            }
        }

        decision.local.push(session);
    }

    for info in state.remote.recipients_in(channel_id) {
        if info.deaf || info.self_deaf {
            continue;
        }

        if let Some(group) = group {
            let subject = AclSubject {
                session: info.session,
                user_id: info.user_id,
                super_user: false,
                channel_id: info.channel_id,
                cert_hash: None,
            };

            if !acl::is_member(&state.tree, channel_id, group, &subject) {
                continue;
            }
        }

        decision.remote.push((info.edge_id, channel_id));
    }

    Ok(())
}

/// Resolves and delivers one serverbound voice frame from a local sender:
/// local recipients through their writer queues, each destination edge
/// through one datagram per `(edge, channel)` pair.
pub async fn route_voice(
    state: &Arc<RwLock<ServerState>>,
    peers: Option<&Arc<PeerTransport>>,
    sender: &Arc<RwLock<Client>>,
    packet: VoicePacket<Serverbound>,
) -> Result<(), MumbleError> {
    let target = match &packet {
        VoicePacket::Audio { target, .. } => *target,
        VoicePacket::Ping { .. } => return Ok(()),
    };

    let context = snapshot_sender(sender, target).await?;
    let clientbound = packet.clone().into_client_bound(context.session);

    let decision = {
        let state_read = state.read_err().await?;
        resolve(&state_read, &context, target).await?
    };

    if decision.loopback {
        sender.read_err().await?.queue_voice(clientbound);

        return Ok(());
    }

    {
        let state_read = state.read_err().await?;

        for session in &decision.local {
            if let Some(client) = state_read.clients.get(session) {
                let client_read = client.read_err().await?;

                if !client_read.is_deafened() {
                    client_read.queue_voice(clientbound.clone());
                }
            }
        }
    }

    if decision.remote.is_empty() {
        return Ok(());
    }

    let peers = match peers {
        Some(peers) => peers,
        None => return Ok(()),
    };

    let (sequence, codec) = match &clientbound {
        VoicePacket::Audio { seq_num, payload, .. } => (*seq_num as u32, payload.codec_id()),
        VoicePacket::Ping { .. } => (0, 0),
    };

    let mut inner = BytesMut::new();
    encode_voice_packet(&packet, &mut inner);

    for (edge_id, channel_id) in &decision.remote {
        let header = EdgeVoiceHeader {
            version: EDGE_VOICE_VERSION,
            sender_id: context.session,
            target_id: *channel_id,
            sequence,
            codec,
        };

        peers.forward(*edge_id, header, &inner).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{AclEntry, Group};
    use crate::client::Client;
    use crate::crypt::CryptState;
    use crate::message::ClientMessage;
    use crate::proto::mumble::Version;
    use crate::rpc::{AuthResult, RemoteSessionInfo};
    use crate::target::ChannelTarget;
    use std::collections::BTreeSet;
    use tokio::net::UdpSocket;
    use tokio::sync::mpsc::Receiver;
    use tokio::sync::Notify;

    async fn test_state() -> Arc<RwLock<ServerState>> {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let mut state = ServerState::new(socket);
        state.edge_id = 1;
        state.tree.insert_for_test(2, Some(0), "two");
        state.tree.insert_for_test(3, Some(0), "three");
        state.tree.insert_for_test(7, Some(0), "seven");
        state.tree.insert_for_test(9, Some(0), "nine");

        Arc::new(RwLock::new(state))
    }

    async fn add_client(
        state: &Arc<RwLock<ServerState>>,
        session: u32,
        channel: u32,
        name: &str,
    ) -> (Arc<RwLock<Client>>, Receiver<ClientMessage>) {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let auth = AuthResult {
            success: true,
            username: name.to_string(),
            ..Default::default()
        };
        let mut client = Client::new(
            Version::default(),
            &auth,
            session,
            Vec::new(),
            true,
            Vec::new(),
            "127.0.0.1".parse().unwrap(),
            None,
            CryptState::default(),
            tx,
            Arc::new(Notify::new()),
        );
        client.channel_id = channel;

        let client = { state.write().await.add_client(client) };

        (client, rx)
    }

    fn opus_frame(target: u8) -> VoicePacket<Serverbound> {
        VoicePacket::Audio {
            _dst: std::marker::PhantomData,
            target,
            session_id: (),
            seq_num: 1,
            payload: crate::voice::VoicePacketPayload::Opus(bytes::Bytes::from_static(b"pcm"), false),
            position_info: None,
        }
    }

    fn voice_count(rx: &mut Receiver<ClientMessage>) -> usize {
        let mut count = 0;
        while let Ok(message) = rx.try_recv() {
            if matches!(message, ClientMessage::SendVoicePacket(_)) {
                count += 1;
            }
        }
        count
    }

    #[actix_rt::test]
    async fn normal_target_reaches_channel_and_listeners_only() {
        let state = test_state().await;
        let (talker, mut talker_rx) = add_client(&state, 1, 2, "talker").await;
        let (_, mut same_rx) = add_client(&state, 2, 2, "same-channel").await;
        let (_, mut other_rx) = add_client(&state, 3, 3, "other-channel").await;
        let (_, mut listener_rx) = add_client(&state, 4, 9, "listener").await;

        {
            let mut state_write = state.write().await;
            state_write.tree.get_mut(2).unwrap().listeners.insert(4);
        }

        route_voice(&state, None, &talker, opus_frame(TARGET_NORMAL)).await.unwrap();

        assert_eq!(voice_count(&mut same_rx), 1);
        assert_eq!(voice_count(&mut listener_rx), 1);
        assert_eq!(voice_count(&mut other_rx), 0);
        assert_eq!(voice_count(&mut talker_rx), 0);
    }

    #[actix_rt::test]
    async fn linked_channels_hear_normal_voice() {
        let state = test_state().await;
        let (talker, _talker_rx) = add_client(&state, 1, 2, "talker").await;
        let (_, mut linked_rx) = add_client(&state, 2, 3, "linked").await;

        {
            let mut state_write = state.write().await;
            state_write.tree.link_channels(2, 3).unwrap();
        }

        route_voice(&state, None, &talker, opus_frame(TARGET_NORMAL)).await.unwrap();
        assert_eq!(voice_count(&mut linked_rx), 1);
    }

    #[actix_rt::test]
    async fn muted_sender_is_dropped_at_the_router() {
        let state = test_state().await;
        let (talker, _) = add_client(&state, 1, 2, "talker").await;
        let (_, mut same_rx) = add_client(&state, 2, 2, "same").await;

        {
            talker.write().await.suppress = true;
        }

        route_voice(&state, None, &talker, opus_frame(TARGET_NORMAL)).await.unwrap();
        assert_eq!(voice_count(&mut same_rx), 0);
    }

    #[actix_rt::test]
    async fn deafened_recipient_is_skipped() {
        let state = test_state().await;
        let (talker, _) = add_client(&state, 1, 2, "talker").await;
        let (deaf, mut deaf_rx) = add_client(&state, 2, 2, "deaf").await;

        {
            deaf.write().await.self_deaf = true;
        }

        route_voice(&state, None, &talker, opus_frame(TARGET_NORMAL)).await.unwrap();
        assert_eq!(voice_count(&mut deaf_rx), 0);
    }

    #[actix_rt::test]
    async fn speak_deny_acl_drops_frame() {
        let state = test_state().await;
        let (talker, _) = add_client(&state, 1, 7, "talker").await;
        let (_, mut same_rx) = add_client(&state, 2, 7, "same").await;

        {
            let mut state_write = state.write().await;
            state_write.tree.get_mut(7).unwrap().acl.push(AclEntry {
                user_id: None,
                group: Some("all".to_string()),
                apply_here: true,
                apply_subs: false,
                allow: 0,
                deny: perm::SPEAK,
            });
        }

        route_voice(&state, None, &talker, opus_frame(TARGET_NORMAL)).await.unwrap();
        assert_eq!(voice_count(&mut same_rx), 0);
    }

    #[actix_rt::test]
    async fn loopback_echoes_to_sender_only() {
        let state = test_state().await;
        let (talker, mut talker_rx) = add_client(&state, 1, 2, "talker").await;
        let (_, mut same_rx) = add_client(&state, 2, 2, "same").await;

        route_voice(&state, None, &talker, opus_frame(TARGET_LOOPBACK)).await.unwrap();

        assert_eq!(voice_count(&mut talker_rx), 1);
        assert_eq!(voice_count(&mut same_rx), 0);
    }

    #[actix_rt::test]
    async fn whisper_slot_resolves_remote_channel_to_one_edge_pair() {
        let state = test_state().await;
        let (talker, _) = add_client(&state, 1, 2, "talker").await;

        {
            let mut state_write = state.write().await;
            state_write.remote.upsert(RemoteSessionInfo {
                session: 50,
                edge_id: 2,
                channel_id: 3,
                name: "remote-b".to_string(),
                ..Default::default()
            });
        }

        {
            let talker_read = talker.read().await;
            let slot = talker_read.get_target(4).unwrap();
            slot.write().await.channels.push(ChannelTarget {
                channel_id: 3,
                group: None,
                links: false,
                children: false,
            });
        }

        let context = snapshot_sender(&talker, 5).await.unwrap();
        let state_read = state.read().await;
        let decision = resolve(&state_read, &context, 5).await.unwrap();

        assert_eq!(decision.remote, vec![(2, 3)]);
        assert!(decision.local.is_empty());
    }

    #[actix_rt::test]
    async fn whisper_group_filter_narrows_recipients() {
        let state = test_state().await;
        let (talker, _) = add_client(&state, 1, 2, "talker").await;
        let (staff, mut staff_rx) = add_client(&state, 2, 3, "staff-user").await;
        let (_, mut outsider_rx) = add_client(&state, 3, 3, "outsider").await;

        {
            staff.write().await.user_id = 10;
        }

        {
            let mut state_write = state.write().await;
            state_write.tree.get_mut(3).unwrap().groups.insert(
                "staff".to_string(),
                Group {
                    name: "staff".to_string(),
                    inherit: false,
                    inheritable: true,
                    add: BTreeSet::from([10]),
                    remove: BTreeSet::new(),
                },
            );
        }

        {
            let talker_read = talker.read().await;
            let slot = talker_read.get_target(0).unwrap();
            slot.write().await.channels.push(ChannelTarget {
                channel_id: 3,
                group: Some("staff".to_string()),
                links: false,
                children: false,
            });
        }

        route_voice(&state, None, &talker, opus_frame(1)).await.unwrap();

        assert_eq!(voice_count(&mut staff_rx), 1);
        assert_eq!(voice_count(&mut outsider_rx), 0);
    }

    #[actix_rt::test]
    async fn destination_edges_are_deduplicated() {
        let state = test_state().await;
        let (talker, _) = add_client(&state, 1, 2, "talker").await;

        {
            let mut state_write = state.write().await;

            for session in [60, 61] {
                state_write.remote.upsert(RemoteSessionInfo {
                    session,
                    edge_id: 4,
                    channel_id: 2,
                    name: format!("remote-{session}"),
                    ..Default::default()
                });
            }
        }

        let context = snapshot_sender(&talker, TARGET_NORMAL).await.unwrap();
        let state_read = state.read().await;
        let decision = resolve(&state_read, &context, TARGET_NORMAL).await.unwrap();

        // two remote listeners on the same edge and channel: one datagram
        assert_eq!(decision.remote, vec![(4, 2)]);
    }
}
