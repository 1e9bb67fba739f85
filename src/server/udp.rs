use crate::edge::Edge;
use crate::error::DecryptError;
use crate::router;
use crate::voice::{decode_voice_packet, Serverbound, VoicePacket};
use byteorder::{ReadBytesExt, WriteBytesExt};
use bytes::BytesMut;
use std::collections::HashMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;

pub async fn create_udp_server(protocol_version: u32, socket: Arc<UdpSocket>, edge: Arc<Edge>) {
    let mut dead_clients = HashMap::new();

    loop {
        match udp_server_run(protocol_version, &socket, &edge, &mut dead_clients).await {
            Ok(_) => (),
            Err(e) => tracing::error!("udp server error: {:?}", e),
        }
    }
}

async fn udp_server_run(
    protocol_version: u32,
    socket: &Arc<UdpSocket>,
    edge: &Arc<Edge>,
    dead_clients: &mut HashMap<SocketAddr, Instant>,
) -> Result<(), anyhow::Error> {
    let mut buffer = BytesMut::zeroed(1024);
    let (size, addr) = socket.recv_from(&mut buffer).await?;
    buffer.truncate(size);

    // connectionless server probe: 4 zero bytes and a timestamp
    if size == 12 {
        let mut cursor = Cursor::new(&buffer[..size]);
        let kind = cursor.read_u32::<byteorder::BigEndian>()?;

        if kind == 0 {
            let timestamp = cursor.read_u64::<byteorder::LittleEndian>()?;

            let (users, max_users, max_bandwidth) = {
                let state_read = edge.state.read_err().await?;
                let max_users = if state_read.config.max_users > 0 {
                    state_read.config.max_users
                } else {
                    edge.config.capacity
                };

                (state_read.clients.len() as u32, max_users, state_read.config.max_bandwidth)
            };

            let mut send = Cursor::new(vec![0u8; 24]);
            send.write_u32::<byteorder::BigEndian>(protocol_version)?;
            send.write_u64::<byteorder::LittleEndian>(timestamp)?;
            send.write_u32::<byteorder::BigEndian>(users)?;
            send.write_u32::<byteorder::BigEndian>(max_users)?;
            send.write_u32::<byteorder::BigEndian>(max_bandwidth)?;

            socket.send_to(send.get_ref().as_slice(), addr).await?;

            crate::metrics::MESSAGES_TOTAL
                .with_label_values(&["udp", "input", "PingAnonymous"])
                .inc();
            crate::metrics::MESSAGES_BYTES
                .with_label_values(&["udp", "input", "PingAnonymous"])
                .inc_by(size as u64);

            return Ok(());
        }
    }

    // addresses that recently failed identification stay muted for a while
    dead_clients.retain(|_, seen| seen.elapsed().as_secs() < 20);

    if dead_clients.contains_key(&addr) {
        return Ok(());
    }

    let client_opt = { edge.state.read_err().await?.get_client_by_socket(&addr) };

    let (client, plaintext) = match client_opt {
        Some(client) => {
            let crypt_state = { client.read_err().await?.crypt_state.clone() };
            let mut try_buf = buffer.clone();
            let decrypt_result = { crypt_state.write_err().await?.decrypt(&mut try_buf) };

            match decrypt_result {
                Ok(()) => (client, try_buf),
                Err(err) => {
                    let username = { client.read_err().await?.name.clone() };
                    tracing::warn!("client {} decrypt error: {}", username, err);

                    crate::metrics::MESSAGES_TOTAL
                        .with_label_values(&["udp", "input", "VoicePacket"])
                        .inc();
                    crate::metrics::MESSAGES_BYTES
                        .with_label_values(&["udp", "input", "VoicePacket"])
                        .inc_by(size as u64);

                    let restart_crypt = match err {
                        DecryptError::Late => {
                            let late = { crypt_state.read_err().await?.late };

                            late > 100
                        }
                        DecryptError::Repeat => false,
                        _ => true,
                    };

                    if restart_crypt {
                        tracing::error!("client {} udp decrypt error: {}, reset crypt setup", username, err);

                        let send_crypt_setup = { client.read_err().await?.send_crypt_setup(true).await };

                        if let Err(e) = send_crypt_setup {
                            tracing::error!("failed to send crypt setup: {:?}", e);
                        }

                        let client_address = { client.read_err().await?.udp_socket_addr };

                        if let Some(address) = client_address {
                            {
                                edge.state.write_err().await?.remove_client_by_socket(&address);
                            }

                            {
                                client.write_err().await?.udp_socket_addr = None;
                            }
                        }
                    }

                    return Ok(());
                }
            }
        }
        None => {
            let (found, address_to_remove) = { edge.state.read_err().await?.find_client_for_packet(&buffer).await? };

            for address in address_to_remove {
                edge.state.write_err().await?.remove_client_by_socket(&address);
            }

            match found {
                Some((client, plaintext)) => {
                    {
                        tracing::info!("udp connected client {} on {}", client.read_err().await?.name, addr);
                    }

                    {
                        edge.state.write_err().await?.set_client_socket(client.clone(), addr).await?;
                    }

                    (client, plaintext)
                }
                None => {
                    tracing::error!("unknown client from address {}", addr);
                    dead_clients.insert(addr, Instant::now());

                    crate::metrics::MESSAGES_TOTAL
                        .with_label_values(&["udp", "input", "VoicePacket"])
                        .inc();
                    crate::metrics::MESSAGES_BYTES
                        .with_label_values(&["udp", "input", "VoicePacket"])
                        .inc_by(size as u64);

                    return Ok(());
                }
            }
        }
    };

    dead_clients.remove(&addr);

    let mut plaintext = plaintext;
    let packet = decode_voice_packet::<Serverbound>(&mut plaintext)?;

    if matches!(packet, VoicePacket::Ping { .. }) {
        crate::metrics::MESSAGES_TOTAL.with_label_values(&["udp", "input", "VoicePing"]).inc();
        crate::metrics::MESSAGES_BYTES
            .with_label_values(&["udp", "input", "VoicePing"])
            .inc_by(size as u64);

        // echo, re-encrypted for the sender
        let session_id = { client.read_err().await?.session_id };
        client.read_err().await?.queue_voice(packet.into_client_bound(session_id));
    } else {
        crate::metrics::MESSAGES_TOTAL
            .with_label_values(&["udp", "input", "VoicePacket"])
            .inc();
        crate::metrics::MESSAGES_BYTES
            .with_label_values(&["udp", "input", "VoicePacket"])
            .inc_by(size as u64);

        router::route_voice(&edge.state, Some(&edge.peers), &client, packet).await?;
    }

    Ok(())
}
