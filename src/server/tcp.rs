use crate::ban;
use crate::client::{Client, PreConnectState};
use crate::crypt::CryptState;
use crate::edge::Edge;
use crate::error::MumbleError;
use crate::handler::MessageHandler;
use crate::message::ClientMessage;
use crate::proto::mumble::{reject::RejectType, Authenticate, Ping, Reject, ServerConfig, ServerSync, UserState, Version};
use crate::proto::{read_frame, send_message, MessageKind};
use crate::rpc::{AuthenticateUserParams, ClientInfo, ReportSessionParams};
use crate::sync::RwLock;
use crate::tls::peer_cert_hash;
use crate::voice::{encode_voice_packet, Clientbound, VoicePacket};
use actix_server::Server;
use actix_service::fn_service;
use anyhow::Context;
use bytes::{BufMut, BytesMut};
use prost::Message;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{self, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc::{self, Receiver};
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_rustls::{server::TlsStream, TlsAcceptor};

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_QUEUE: usize = 512;

/// An authenticated client bundled with the read half its reader loop owns;
/// the write half already belongs to the writer task.
struct ClientWithRead {
    client: Arc<RwLock<Client>>,
    read: ReadHalf<TlsStream<TcpStream>>,
}

pub fn create_tcp_server(tcp_listener: TcpListener, acceptor: TlsAcceptor, server_version: Version, edge: Arc<Edge>) -> Server {
    Server::build()
        .listen(
            "mumble-tcp",
            tcp_listener.into_std().expect("cannot create tcp listener"),
            move || {
                let acceptor = acceptor.clone();
                let server_version = server_version.clone();
                let edge = edge.clone();

                fn_service(move |stream: TcpStream| {
                    let acceptor = acceptor.clone();
                    let server_version = server_version.clone();
                    let edge = edge.clone();

                    async move {
                        match handle_new_client(acceptor, server_version, edge, stream).await {
                            Ok(_) => (),
                            Err(e) => tracing::error!("handle client error: {:?}", e),
                        }

                        Ok::<(), anyhow::Error>(())
                    }
                })
            },
        )
        .expect("cannot create tcp server")
        .run()
}

fn valid_username(name: &str) -> bool {
    if name.is_empty() || name.len() > 64 {
        return false;
    }

    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }

    name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

async fn send_reject(stream: &mut TlsStream<TcpStream>, kind: RejectType, reason: &str) -> Result<(), MumbleError> {
    let reject = Reject {
        r#type: Some(kind as i32),
        reason: Some(reason.to_string()),
    };

    send_message(MessageKind::Reject, &reject, stream).await
}

/// What the pre-authentication phase collects.
struct InitData {
    version: Version,
    authenticate: Authenticate,
    preconnect: PreConnectState,
}

/// Connecting → WaitVersion → WaitAuthenticate. Pings are answered and
/// UserStates buffered as PreConnect state; anything else is dropped.
async fn client_init(stream: &mut TlsStream<TcpStream>, server_version: &Version, deadline: Duration) -> Result<InitData, MumbleError> {
    let version = loop {
        let (kind, buf) = timeout(deadline, read_frame(stream))
            .await
            .map_err(|_| MumbleError::Protocol("handshake timeout waiting for Version".to_string()))??;

        if kind == MessageKind::Version {
            break Version::decode(buf.as_slice())?;
        }
    };

    send_message(MessageKind::Version, server_version, stream).await?;

    let mut preconnect = PreConnectState::default();

    let authenticate = loop {
        let (kind, buf) = timeout(deadline, read_frame(stream))
            .await
            .map_err(|_| MumbleError::Protocol("handshake timeout waiting for Authenticate".to_string()))??;

        match kind {
            MessageKind::Authenticate => break Authenticate::decode(buf.as_slice())?,
            MessageKind::Ping => {
                let ping = Ping::decode(buf.as_slice())?;
                let pong = Ping {
                    timestamp: ping.timestamp,
                    ..Default::default()
                };
                send_message(MessageKind::Ping, &pong, stream).await?;
            }
            MessageKind::UserState => {
                preconnect.merge(&UserState::decode(buf.as_slice())?);
            }
            _ => {}
        }
    };

    Ok(InitData {
        version,
        authenticate,
        preconnect,
    })
}

async fn handle_new_client(
    acceptor: TlsAcceptor,
    server_version: Version,
    edge: Arc<Edge>,
    stream: TcpStream,
) -> Result<(), anyhow::Error> {
    stream.set_nodelay(true).context("set stream no delay")?;

    let peer_ip = stream.peer_addr().context("peer address")?.ip();

    // address bans are enforced before any TLS work is spent
    {
        let state_read = edge.state.read_err().await.context("read state for ban check")?;

        if let Some(hit) = ban::find_match(&state_read.bans, &peer_ip, None) {
            tracing::info!("rejected banned address {}: {}", peer_ip, hit.reason);

            return Ok(());
        }
    }

    let mut stream = timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream))
        .await
        .context("tls handshake timeout")?
        .context("accept tls")?;

    let cert_hash = peer_cert_hash(&stream);

    let deadline = Duration::from_secs(edge.config.client_timeout_secs);
    let init = client_init(&mut stream, &server_version, deadline).await.context("init client")?;

    let bundle = match authenticate_client(stream, &edge, init, peer_ip, cert_hash).await? {
        Some(bundle) => bundle,
        None => return Ok(()),
    };

    let client = bundle.client.clone();
    let username = { client.read_err().await.context("read client")?.name.clone() };

    crate::metrics::CLIENTS_TOTAL.inc();
    tracing::info!("new client {} connected", username);

    match client_run(&edge, bundle).await {
        Ok(_) => (),
        Err(e) => tracing::error!("client {} error: {:?}", username, e),
    }

    tracing::info!("client {} disconnected", username);
    crate::metrics::CLIENTS_TOTAL.dec();

    let (session_id, _channel_id) = {
        edge.state
            .write_err()
            .await
            .context("state for disconnect")?
            .disconnect(client)
            .await
            .context("disconnect client")?
    };

    if let Err(e) = edge.hub.end_session(session_id).await {
        tracing::debug!("session end not reported to hub: {}", e);
    }

    Ok(())
}

/// WaitAuthenticate → CryptoSetup → Ready: validates identity, asks the hub
/// to authenticate and allocate the session, then plays the synchronization
/// sequence in protocol order.
async fn authenticate_client(
    mut stream: TlsStream<TcpStream>,
    edge: &Arc<Edge>,
    init: InitData,
    peer_ip: IpAddr,
    cert_hash: Option<String>,
) -> Result<Option<ClientWithRead>, anyhow::Error> {
    let username = init.authenticate.username.clone().unwrap_or_default();

    if !valid_username(&username) {
        send_reject(&mut stream, RejectType::InvalidUsername, "invalid username").await?;

        return Ok(None);
    }

    {
        let state_read = edge.state.read_err().await.context("read state")?;

        let in_use = state_read.get_client_by_name(&username).await?.is_some()
            || state_read.remote.sessions().any(|info| info.name == username);

        if in_use {
            send_reject(&mut stream, RejectType::UsernameInUse, "username already connected").await?;

            return Ok(None);
        }

        if state_read.clients.len() as u32 >= edge.config.capacity {
            send_reject(&mut stream, RejectType::ServerFull, "server is full").await?;

            return Ok(None);
        }

        let global_max = state_read.config.max_users;

        if global_max > 0 && (state_read.clients.len() + state_read.remote.sessions().count()) as u32 >= global_max {
            send_reject(&mut stream, RejectType::ServerFull, "cluster is full").await?;

            return Ok(None);
        }

        if ban::find_match(&state_read.bans, &peer_ip, cert_hash.as_deref()).is_some() {
            send_reject(&mut stream, RejectType::None, "you are banned from this server").await?;

            return Ok(None);
        }
    }

    let edge_id = { edge.state.read_err().await.context("read state")?.edge_id };

    let session_id = match edge.hub.allocate_session_id(edge_id).await {
        Ok(session_id) => session_id,
        Err(e) => {
            tracing::warn!("session allocation failed: {}", e);
            send_reject(&mut stream, RejectType::AuthenticatorFail, "Authentication service unavailable").await?;

            return Ok(None);
        }
    };

    let auth_params = AuthenticateUserParams {
        session_id,
        server_id: edge_id,
        username: username.clone(),
        password: init.authenticate.password.clone(),
        tokens: init.authenticate.tokens.clone(),
        client_info: ClientInfo {
            ip: peer_ip.to_string(),
            ip_version: if peer_ip.is_ipv4() { 4 } else { 6 },
            release: init.version.release.clone().unwrap_or_default(),
            version: init.version.version.unwrap_or_default(),
            os: init.version.os.clone().unwrap_or_default(),
            os_version: init.version.os_version.clone().unwrap_or_default(),
            cert_hash: cert_hash.clone(),
        },
    };

    let auth = match edge.hub.authenticate_user(auth_params).await {
        Ok(auth) => auth,
        Err(e) => {
            tracing::warn!("authentication transport failure: {}", e);
            send_reject(&mut stream, RejectType::AuthenticatorFail, "Authentication service unavailable").await?;

            return Ok(None);
        }
    };

    if !auth.success {
        let reject = Reject {
            r#type: auth.reject_type.or(Some(RejectType::WrongUserPw as i32)),
            reason: auth.reason.clone().or_else(|| Some("authentication failed".to_string())),
        };
        send_message(MessageKind::Reject, &reject, &mut stream).await?;

        return Ok(None);
    }

    // CryptoSetup: crypt parameters go out first; everything after rides
    // the writer queue in protocol order
    let crypt_state = CryptState::default();
    send_message(MessageKind::CryptSetup, &crypt_state.get_crypt_setup(), &mut stream).await?;

    let (publisher, consumer) = mpsc::channel(OUTBOUND_QUEUE);
    let shutdown = Arc::new(Notify::new());

    let mut client = Client::new(
        init.version,
        &auth,
        session_id,
        init.authenticate.tokens.clone(),
        init.authenticate.opus.unwrap_or(false),
        init.authenticate.celt_versions.clone(),
        peer_ip,
        cert_hash.clone(),
        crypt_state,
        publisher,
        shutdown.clone(),
    );
    client.apply_preconnect(&init.preconnect);

    // registered users resume in their last channel when it still exists
    // and still lets them in
    if let Some(last_channel) = auth.last_channel {
        let state_read = edge.state.read_err().await.context("read state")?;

        if state_read.tree.contains(last_channel)
            && state_read
                .acl_cache
                .has_permission(&state_read.tree, &client.subject(), last_channel, crate::acl::perm::ENTER)
        {
            client.channel_id = last_channel;
        }
    }

    let client = { edge.state.write_err().await.context("add client")?.add_client(client) };

    // the connection's single writer task owns the write half from here on
    let (read, write) = io::split(stream);
    let udp_socket = { edge.state.read_err().await.context("read state")?.socket.clone() };

    actix_rt::spawn(client_writer(write, consumer, client.clone(), udp_socket, shutdown));

    sync_client(edge, &client).await.context("sync client")?;

    // announce to everyone else, then to the cluster
    let user_state = { client.read_err().await.context("read client")?.get_user_state() };

    {
        let state_read = edge.state.read_err().await.context("read state")?;
        state_read
            .broadcast_message_except(MessageKind::UserState, &user_state, session_id)
            .await?;
    }

    let report = {
        let client_read = client.read_err().await.context("read client")?;

        ReportSessionParams {
            session: client_read.to_remote_info(edge_id),
            start_time: client_read.start_time,
            ip_address: peer_ip.to_string(),
            groups: auth.groups.clone(),
            cert_hash,
        }
    };

    if let Err(e) = edge.hub.report_session(report).await {
        tracing::warn!("session not reported to hub: {}", e);
    }

    Ok(Some(ClientWithRead { client, read }))
}

/// The post-authentication synchronization sequence, in the order clients
/// rely on: CodecVersion, the channel tree, every known user, own state,
/// ServerSync, ServerConfig.
async fn sync_client(edge: &Arc<Edge>, client: &Arc<RwLock<Client>>) -> Result<(), MumbleError> {
    // lock order is state before client, everywhere
    let state_read = edge.state.read_err().await?;
    let client_read = client.read_err().await?;

    if let Some(codec_version) = state_read.check_codec().await? {
        client_read.queue_message(MessageKind::CodecVersion, &codec_version)?;
    }

    for channel in state_read.tree.iter_broadcast_order() {
        client_read.queue_message(MessageKind::ChannelState, &channel.get_channel_state())?;
    }

    for (session, other) in &state_read.clients {
        if *session == client_read.session_id {
            continue;
        }

        let other_state = { other.read_err().await?.get_user_state() };
        client_read.queue_message(MessageKind::UserState, &other_state)?;
    }

    for info in state_read.remote.sessions() {
        client_read.queue_message(MessageKind::UserState, &crate::edge::remote_user_state(info))?;
    }

    client_read.queue_message(MessageKind::UserState, &client_read.get_user_state())?;

    let subject = client_read.subject();
    let root_permissions = state_read
        .acl_cache
        .get_or_compute(&state_read.tree, &subject, state_read.tree.root_id());

    let server_sync = ServerSync {
        session: Some(client_read.session_id),
        max_bandwidth: Some(state_read.config.max_bandwidth),
        welcome_text: Some(state_read.config.welcome_text.clone()),
        permissions: Some(u64::from(root_permissions)),
    };
    client_read.queue_message(MessageKind::ServerSync, &server_sync)?;

    let server_config = ServerConfig {
        max_bandwidth: Some(state_read.config.max_bandwidth),
        welcome_text: None,
        allow_html: Some(state_read.config.allow_html),
        message_length: Some(state_read.config.message_length),
        image_message_length: Some(0),
        max_users: Some(state_read.config.max_users),
    };
    client_read.queue_message(MessageKind::ServerConfig, &server_config)?;

    if let Some(version) = state_read.config.suggest_version {
        let suggest = crate::proto::mumble::SuggestConfig {
            version: Some(version),
            positional: None,
            push_to_talk: None,
        };
        client_read.queue_message(MessageKind::SuggestConfig, &suggest)?;
    }

    Ok(())
}

/// Drains the outbound queue: control frames to TLS, voice to UDP when the
/// client has a mapped address, tunneled otherwise. Encrypt buffers are
/// reused across packets.
async fn client_writer(
    mut write: WriteHalf<TlsStream<TcpStream>>,
    mut consumer: Receiver<ClientMessage>,
    client: Arc<RwLock<Client>>,
    udp_socket: Arc<UdpSocket>,
    shutdown: Arc<Notify>,
) {
    let mut plain = BytesMut::with_capacity(1024);
    let mut sealed = BytesMut::with_capacity(1024);

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            message = consumer.recv() => {
                match message {
                    None | Some(ClientMessage::Disconnect) => break,
                    Some(ClientMessage::SendMessage { payload, .. }) => {
                        if let Err(e) = write.write_all(payload.as_ref()).await {
                            tracing::debug!("client write failed: {}", e);
                            break;
                        }

                        if let Err(e) = write.flush().await {
                            tracing::debug!("client flush failed: {}", e);
                            break;
                        }
                    }
                    Some(ClientMessage::SendVoicePacket(packet)) => {
                        if let Err(e) = send_voice(&mut write, &client, &udp_socket, &mut plain, &mut sealed, packet).await {
                            tracing::debug!("voice send failed: {:?}", e);
                        }
                    }
                }
            }
        }
    }

    let _ = write.shutdown().await;
}

async fn send_voice(
    write: &mut WriteHalf<TlsStream<TcpStream>>,
    client: &Arc<RwLock<Client>>,
    udp_socket: &Arc<UdpSocket>,
    plain: &mut BytesMut,
    sealed: &mut BytesMut,
    packet: VoicePacket<Clientbound>,
) -> Result<(), MumbleError> {
    plain.clear();
    encode_voice_packet(&packet, plain);

    let (udp_addr, crypt_state) = {
        let client_read = client.read_err().await?;
        (client_read.udp_socket_addr, client_read.crypt_state.clone())
    };

    match udp_addr {
        Some(addr) => {
            sealed.clear();

            {
                crypt_state.write_err().await?.encrypt(plain, sealed);
            }

            udp_socket.send_to(sealed.as_ref(), addr).await?;

            crate::metrics::MESSAGES_TOTAL.with_label_values(&["udp", "output", "VoicePacket"]).inc();
            crate::metrics::MESSAGES_BYTES
                .with_label_values(&["udp", "output", "VoicePacket"])
                .inc_by(sealed.len() as u64);
        }
        None => {
            // voice rides the control channel for clients without a UDP path
            let mut framed = BytesMut::with_capacity(6 + plain.len());
            framed.put_u16(MessageKind::UDPTunnel as u16);
            framed.put_u32(plain.len() as u32);
            framed.extend_from_slice(plain);

            write.write_all(framed.as_ref()).await?;
            write.flush().await?;

            crate::metrics::MESSAGES_TOTAL.with_label_values(&["tcp", "output", "VoicePacket"]).inc();
            crate::metrics::MESSAGES_BYTES
                .with_label_values(&["tcp", "output", "VoicePacket"])
                .inc_by(framed.len() as u64);
        }
    }

    Ok(())
}

/// Ready state: read and dispatch until the connection dies or a shutdown
/// is requested.
async fn client_run(edge: &Arc<Edge>, bundle: ClientWithRead) -> Result<(), anyhow::Error> {
    let ClientWithRead { client, mut read } = bundle;
    let shutdown = { client.read_err().await?.shutdown.clone() };

    loop {
        tokio::select! {
            _ = shutdown.notified() => return Ok(()),
            handled = MessageHandler::handle(&mut read, edge, client.clone()) => {
                match handled {
                    Ok(()) => {}
                    Err(MumbleError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                    Err(MumbleError::ForceDisconnect) => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}
