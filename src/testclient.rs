//! Headless Mumble client behind `client connect`: authenticates, mirrors
//! server events to stdout and keeps a voice path alive. Used to poke at a
//! running cluster without a desktop client.

use crate::crypt::CryptState;
use crate::error::MumbleError;
use crate::proto::mumble::{Authenticate, ChannelState, CryptSetup, Ping, Reject, ServerSync, TextMessage, UserRemove, UserState, Version};
use crate::proto::{read_frame, send_message, MessageKind};
use crate::sync::RwLock;
use crate::voice::{decode_voice_packet, encode_voice_packet, Clientbound, Serverbound, VoicePacket};
use bytes::BytesMut;
use prost::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::rustls::ServerName;
use tokio_rustls::TlsConnector;

pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub tokens: Vec<String>,
    pub force_tcp_voice: bool,
}

const CLIENT_VERSION: u32 = 1 << 16 | 4 << 8;

pub async fn run_client(options: ClientOptions) -> Result<(), anyhow::Error> {
    let connector = TlsConnector::from(Arc::new(crate::tls::insecure_client_config()));

    let tcp = TcpStream::connect((options.host.as_str(), options.port)).await?;
    tcp.set_nodelay(true)?;

    let server_name =
        ServerName::try_from(options.host.as_str()).or_else(|_| ServerName::try_from("mumble.invalid"))?;

    let mut stream = connector.connect(server_name, tcp).await?;

    let version = Version {
        version: Some(CLIENT_VERSION),
        release: Some(format!("murmux-client {}", env!("CARGO_PKG_VERSION"))),
        os: Some(std::env::consts::OS.to_string()),
        os_version: Some(std::env::consts::FAMILY.to_string()),
    };
    send_message(MessageKind::Version, &version, &mut stream).await?;

    let authenticate = Authenticate {
        username: Some(options.username.clone()),
        password: options.password.clone(),
        tokens: options.tokens.clone(),
        celt_versions: Vec::new(),
        opus: Some(true),
    };
    send_message(MessageKind::Authenticate, &authenticate, &mut stream).await?;

    let crypt: Arc<RwLock<Option<CryptState>>> = Arc::new(RwLock::new(None));
    let udp_socket = if options.force_tcp_voice {
        None
    } else {
        Some(Arc::new(UdpSocket::bind("0.0.0.0:0").await?))
    };

    if let Some(socket) = &udp_socket {
        socket.connect((options.host.as_str(), options.port)).await?;
        actix_rt::spawn(udp_voice_loop(socket.clone(), crypt.clone()));
    }

    let mut ping_timer = tokio::time::interval(Duration::from_secs(15));
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut session_id = 0u32;

    loop {
        tokio::select! {
            _ = ping_timer.tick() => {
                let ping = Ping {
                    timestamp: Some(crate::ban::unix_now()),
                    ..Default::default()
                };
                send_message(MessageKind::Ping, &ping, &mut stream).await?;
            }
            frame = read_frame(&mut stream) => {
                let (kind, buf) = frame?;

                match kind {
                    MessageKind::Reject => {
                        let reject = Reject::decode(buf.as_slice())?;
                        println!(
                            "rejected ({}): {}",
                            reject.r#type.unwrap_or_default(),
                            reject.reason.as_deref().unwrap_or("no reason")
                        );

                        return Err(anyhow::anyhow!("server rejected the connection"));
                    }
                    MessageKind::CryptSetup => {
                        let setup = CryptSetup::decode(buf.as_slice())?;
                        install_crypt(&crypt, &setup).await?;
                    }
                    MessageKind::ServerSync => {
                        let sync = ServerSync::decode(buf.as_slice())?;
                        session_id = sync.session.unwrap_or_default();
                        println!(
                            "connected: session {} / {}",
                            session_id,
                            sync.welcome_text.as_deref().unwrap_or("")
                        );
                    }
                    MessageKind::ChannelState => {
                        let state = ChannelState::decode(buf.as_slice())?;
                        println!(
                            "channel {}: {} (parent {:?})",
                            state.channel_id.unwrap_or_default(),
                            state.name.as_deref().unwrap_or("?"),
                            state.parent
                        );
                    }
                    MessageKind::UserState => {
                        let state = UserState::decode(buf.as_slice())?;
                        println!(
                            "user {} ({}) in channel {}",
                            state.session.unwrap_or_default(),
                            state.name.as_deref().unwrap_or("?"),
                            state.channel_id.unwrap_or_default()
                        );
                    }
                    MessageKind::UserRemove => {
                        let removed = UserRemove::decode(buf.as_slice())?;
                        println!("user {} left: {}", removed.session, removed.reason.as_deref().unwrap_or(""));
                    }
                    MessageKind::TextMessage => {
                        let text = TextMessage::decode(buf.as_slice())?;
                        println!("text from {}: {}", text.actor.unwrap_or_default(), text.message);
                    }
                    MessageKind::UDPTunnel => {
                        let mut bytes = BytesMut::from(buf.as_slice());

                        if let Ok(VoicePacket::Audio { session_id, seq_num, .. }) = decode_voice_packet::<Clientbound>(&mut bytes) {
                            println!("voice (tcp) from {} seq {}", session_id, seq_num);
                        }
                    }
                    MessageKind::Ping => {}
                    other => {
                        tracing::debug!("ignored {other}");
                    }
                }
            }
        }
    }
}

async fn install_crypt(crypt: &Arc<RwLock<Option<CryptState>>>, setup: &CryptSetup) -> Result<(), MumbleError> {
    let (key, client_nonce, server_nonce) = match (&setup.key, &setup.client_nonce, &setup.server_nonce) {
        (Some(key), Some(client_nonce), Some(server_nonce)) => (key, client_nonce, server_nonce),
        _ => return Ok(()),
    };

    let key: [u8; crate::crypt::KEY_SIZE] = key
        .as_slice()
        .try_into()
        .map_err(|_| MumbleError::Protocol("bad crypt key size".to_string()))?;

    // our encrypt side is the server's decrypt side
    match CryptState::new_from_setup(key, client_nonce, server_nonce) {
        Some(state) => {
            *crypt.write_err().await? = Some(state);
            println!("crypt parameters installed");

            Ok(())
        }
        None => Err(MumbleError::Protocol("bad crypt nonce size".to_string())),
    }
}

/// Keeps the UDP path warm with voice pings and reports incoming audio.
async fn udp_voice_loop(socket: Arc<UdpSocket>, crypt: Arc<RwLock<Option<CryptState>>>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut buffer = BytesMut::zeroed(1024);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let ping = VoicePacket::<Serverbound>::Ping { timestamp: crate::ban::unix_now() };
                let mut plain = BytesMut::new();
                encode_voice_packet(&ping, &mut plain);

                let sealed = {
                    match crypt.write().await.as_mut() {
                        Some(crypt_state) => {
                            let mut sealed = BytesMut::new();
                            crypt_state.encrypt(&plain, &mut sealed);
                            Some(sealed)
                        }
                        None => None,
                    }
                };

                if let Some(sealed) = sealed {
                    if let Err(e) = socket.send(&sealed).await {
                        tracing::debug!("udp ping failed: {}", e);
                    }
                }
            }
            received = socket.recv(&mut buffer) => {
                let size = match received {
                    Ok(size) => size,
                    Err(e) => {
                        tracing::debug!("udp receive failed: {}", e);
                        continue;
                    }
                };

                let mut datagram = BytesMut::from(&buffer[..size]);

                let decrypted = {
                    match crypt.write().await.as_mut() {
                        Some(crypt_state) => crypt_state.decrypt(&mut datagram).is_ok(),
                        None => false,
                    }
                };

                if decrypted {
                    match decode_voice_packet::<Clientbound>(&mut datagram) {
                        Ok(VoicePacket::Audio { session_id, seq_num, .. }) => {
                            println!("voice (udp) from {} seq {}", session_id, seq_num);
                        }
                        Ok(VoicePacket::Ping { .. }) => {}
                        Err(e) => tracing::debug!("bad voice packet: {}", e),
                    }
                }

                buffer.resize(1024, 0);
            }
        }
    }
}
