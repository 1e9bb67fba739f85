//! Edge↔edge voice: a UDP channel one port above the client port, carrying
//! a fixed 14-byte header plus the original Mumble voice packet, optionally
//! wrapped in an AES-128-CBC envelope (`IV:16 || ciphertext`).

use crate::error::MumbleError;
use crate::state::ServerState;
use crate::sync::RwLock;
use crate::voice::{decode_voice_packet, Serverbound};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use bytes::{Buf, BufMut, BytesMut};
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{lookup_host, UdpSocket};

pub const EDGE_VOICE_VERSION: u8 = 1;
/// `target_id` value meaning "every session on the receiving edge".
pub const BROADCAST_TARGET: u32 = 0xffff_ffff;
pub const HEADER_LEN: usize = 14;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeVoiceHeader {
    pub version: u8,
    pub sender_id: u32,
    pub target_id: u32,
    pub sequence: u32,
    pub codec: u8,
}

impl EdgeVoiceHeader {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN);
        dst.put_u8(self.version);
        dst.put_u32(self.sender_id);
        dst.put_u32(self.target_id);
        dst.put_u32(self.sequence);
        dst.put_u8(self.codec);
    }

    pub fn decode(buf: &mut BytesMut) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }

        Some(Self {
            version: buf.get_u8(),
            sender_id: buf.get_u32(),
            target_id: buf.get_u32(),
            sequence: buf.get_u32(),
            codec: buf.get_u8(),
        })
    }
}

/// Symmetric envelope for voice in untrusted transit between edges.
pub struct PeerCipher {
    key: [u8; 16],
}

impl PeerCipher {
    /// The key is the first 16 bytes of SHA-256 over the cluster secret, so
    /// every edge derives the same key from configuration alone.
    pub fn from_secret(secret: &str) -> Self {
        let digest = ring::digest::digest(&ring::digest::SHA256, secret.as_bytes());
        let mut key = [0u8; 16];
        key.copy_from_slice(&digest.as_ref()[..16]);

        Self { key }
    }

    pub fn seal(&self, plain: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; 16];
        if SystemRandom::new().fill(&mut iv).is_err() {
            // never reached with a functioning system RNG
            iv = [0u8; 16];
        }

        let ciphertext = Aes128CbcEnc::new(&self.key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plain);

        let mut out = Vec::with_capacity(16 + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        out
    }

    pub fn open(&self, data: &[u8]) -> Option<Vec<u8>> {
        if data.len() < 16 {
            return None;
        }

        let (iv, ciphertext) = data.split_at(16);
        let iv: [u8; 16] = iv.try_into().ok()?;

        Aes128CbcDec::new(&self.key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .ok()
    }
}

/// Endpoint registry plus the socket voice is exchanged on.
pub struct PeerTransport {
    socket: Arc<UdpSocket>,
    peers: RwLock<HashMap<u32, SocketAddr>>,
    cipher: Option<PeerCipher>,
}

impl PeerTransport {
    pub async fn bind(listen: &str, cipher: Option<PeerCipher>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(listen).await?;

        Ok(Self {
            socket: Arc::new(socket),
            peers: RwLock::new(HashMap::new()),
            cipher,
        })
    }

    pub async fn set_peer(&self, edge_id: u32, host: &str, voice_port: u16) -> Result<(), MumbleError> {
        let addr = lookup_host((host, voice_port))
            .await?
            .next()
            .ok_or_else(|| MumbleError::Protocol(format!("cannot resolve peer {host}:{voice_port}")))?;

        self.peers.write_err().await?.insert(edge_id, addr);
        tracing::info!("voice peer {} at {}", edge_id, addr);

        Ok(())
    }

    pub async fn remove_peer(&self, edge_id: u32) -> Result<(), MumbleError> {
        self.peers.write_err().await?.remove(&edge_id);

        Ok(())
    }

    pub async fn clear(&self) -> Result<(), MumbleError> {
        self.peers.write_err().await?.clear();

        Ok(())
    }

    pub async fn peer_ids(&self) -> Result<Vec<u32>, MumbleError> {
        Ok(self.peers.read_err().await?.keys().copied().collect())
    }

    /// Sends one voice datagram to a peer edge. Lossy: resolution or socket
    /// failures drop the frame and are counted, never retried.
    pub async fn forward(
        &self,
        edge_id: u32,
        header: EdgeVoiceHeader,
        inner: &[u8],
    ) -> Result<(), MumbleError> {
        let addr = match self.peers.read_err().await?.get(&edge_id) {
            Some(addr) => *addr,
            None => {
                crate::metrics::VOICE_DROPS_TOTAL.with_label_values(&["unknown_peer"]).inc();

                return Ok(());
            }
        };

        let mut frame = BytesMut::with_capacity(HEADER_LEN + inner.len());
        header.encode(&mut frame);
        frame.extend_from_slice(inner);

        let datagram = match &self.cipher {
            Some(cipher) => cipher.seal(&frame),
            None => frame.to_vec(),
        };

        match self.socket.send_to(&datagram, addr).await {
            Ok(_) => {
                crate::metrics::VOICE_FORWARDS_TOTAL.with_label_values(&["output"]).inc();
            }
            Err(e) => {
                crate::metrics::VOICE_DROPS_TOTAL.with_label_values(&["peer_send"]).inc();
                tracing::debug!("voice forward to edge {} failed: {}", edge_id, e);
            }
        }

        Ok(())
    }

    /// Receive loop: decodes each datagram and re-dispatches the inner
    /// packet to local recipients of the header's target.
    pub async fn run_receiver(self: Arc<Self>, state: Arc<RwLock<ServerState>>) {
        let mut buffer = BytesMut::zeroed(2048);

        loop {
            buffer.resize(2048, 0);

            let (size, addr) = match self.socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::error!("peer voice socket error: {}", e);
                    continue;
                }
            };

            buffer.truncate(size);

            let mut frame = match &self.cipher {
                Some(cipher) => match cipher.open(&buffer) {
                    Some(plain) => BytesMut::from(plain.as_slice()),
                    None => {
                        crate::metrics::VOICE_DROPS_TOTAL.with_label_values(&["peer_decrypt"]).inc();
                        tracing::debug!("undecryptable peer datagram from {}", addr);
                        continue;
                    }
                },
                None => buffer.clone(),
            };

            let header = match EdgeVoiceHeader::decode(&mut frame) {
                Some(header) if header.version == EDGE_VOICE_VERSION => header,
                Some(header) => {
                    tracing::debug!("peer datagram with unknown version {} from {}", header.version, addr);
                    continue;
                }
                None => continue,
            };

            crate::metrics::VOICE_FORWARDS_TOTAL.with_label_values(&["input"]).inc();

            if let Err(e) = deliver_remote_voice(&state, header, frame).await {
                tracing::debug!("remote voice delivery failed: {:?}", e);
            }
        }
    }
}

/// Delivers a peer-forwarded voice packet to the local recipients of the
/// header target: every session when broadcast, otherwise the members and
/// listeners of the target channel.
pub async fn deliver_remote_voice(
    state: &Arc<RwLock<ServerState>>,
    header: EdgeVoiceHeader,
    mut inner: BytesMut,
) -> Result<(), MumbleError> {
    let packet = decode_voice_packet::<Serverbound>(&mut inner)?;
    let packet = packet.into_client_bound(header.sender_id);

    let state_read = state.read_err().await?;

    let recipients: Vec<u32> = if header.target_id == BROADCAST_TARGET {
        state_read.clients.keys().copied().collect()
    } else {
        let mut sessions: Vec<u32> = state_read.local_sessions_in(header.target_id).copied().collect();

        if let Some(channel) = state_read.tree.get(header.target_id) {
            sessions.extend(channel.listeners.iter().copied());
        }

        sessions.sort_unstable();
        sessions.dedup();
        sessions
    };

    for session in recipients {
        if session == header.sender_id {
            continue;
        }

        if let Some(client) = state_read.clients.get(&session) {
            let client_read = client.read_err().await?;

            if !client_read.is_deafened() {
                client_read.queue_voice(packet.clone());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = EdgeVoiceHeader {
            version: EDGE_VOICE_VERSION,
            sender_id: 77,
            target_id: 3,
            sequence: 123456,
            codec: 4,
        };

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);

        let decoded = EdgeVoiceHeader::decode(&mut buf).unwrap();
        assert_eq!(decoded, header);
        assert!(buf.is_empty());
    }

    #[test]
    fn header_rejects_short_input() {
        let mut buf = BytesMut::from(&[1u8, 2, 3][..]);
        assert!(EdgeVoiceHeader::decode(&mut buf).is_none());
    }

    #[test]
    fn cipher_seal_open_roundtrip() {
        let cipher = PeerCipher::from_secret("cluster-secret");
        let sealed = cipher.seal(b"voice payload");

        assert_ne!(&sealed[16..], b"voice payload".as_slice());
        assert_eq!(cipher.open(&sealed).unwrap(), b"voice payload");
    }

    #[test]
    fn cipher_rejects_wrong_key_and_garbage() {
        let cipher = PeerCipher::from_secret("secret-a");
        let other = PeerCipher::from_secret("secret-b");

        let sealed = cipher.seal(b"payload");
        assert_ne!(other.open(&sealed).as_deref(), Some(b"payload".as_slice()));
        assert!(cipher.open(b"short").is_none());
    }

    #[test]
    fn same_secret_derives_same_key() {
        let a = PeerCipher::from_secret("shared");
        let b = PeerCipher::from_secret("shared");

        let sealed = a.seal(b"x");
        assert_eq!(b.open(&sealed).unwrap(), b"x");
    }
}
