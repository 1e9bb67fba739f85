//! Voice channel packets and codecs

use crate::error::DecryptError;
use byteorder::ReadBytesExt;
use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use std::fmt::Debug;
use std::io;
use std::io::{Cursor, Read};
use std::marker::PhantomData;

use super::varint::BufMutExt;
use super::varint::ReadExt;

/// A packet transmitted via Mumble's voice channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VoicePacket<Dst: VoicePacketDst> {
    /// Ping packets contain opaque timestamp-like values which are simply
    /// echoed back.
    Ping { timestamp: u64 },
    /// Packet containing audio data.
    Audio {
        /// Destination. Required due to encoding differences depending on packet flow direction.
        _dst: PhantomData<Dst>,
        /// The target slot, 0-31 (5 bits on the wire).
        target: u8,
        /// Session ID. Absent when packet is [Serverbound].
        session_id: Dst::SessionId,
        /// Sequence number of the first audio frame in this packet.
        ///
        /// Packets may contain multiple frames, so this may increase by more than one per packet.
        seq_num: u64,
        /// The actual audio data, opaque to routing.
        payload: VoicePacketPayload,
        /// Positional audio information, passed through untouched.
        position_info: Option<Bytes>,
    },
}

/// Audio data payload of [VoicePacket]s.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum VoicePacketPayload {
    /// CELT Alpha (0.7.0) encoded audio frames.
    CeltAlpha(Vec<Bytes>),
    /// CELT Beta (0.11.0) encoded audio frames.
    CeltBeta(Vec<Bytes>),
    /// Speex encoded audio frames.
    Speex(Vec<Bytes>),
    /// Opus encoded audio frame with end-of-transmission bit.
    Opus(Bytes, bool),
}

impl VoicePacketPayload {
    /// The 3-bit codec identifier of the packet header.
    pub fn codec_id(&self) -> u8 {
        match self {
            VoicePacketPayload::CeltAlpha(_) => 0,
            VoicePacketPayload::Speex(_) => 2,
            VoicePacketPayload::CeltBeta(_) => 3,
            VoicePacketPayload::Opus(_, _) => 4,
        }
    }
}

/// Zero-sized struct indicating server-bound packet direction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Serverbound;
/// Zero-sized struct indicating client-bound packet direction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Clientbound;

/// Sealed trait for indicating voice packet direction.
///
/// The only two implementations are [Serverbound] and [Clientbound].
pub trait VoicePacketDst: Default + PartialEq {
    /// Type of [VoicePacket::Audio::session_id](enum.VoicePacket.html#variant.Audio.field.session_id).
    type SessionId: Debug + Clone + PartialEq;
    /// Reads session id of packets traveling in this direction.
    fn read_session_id<T: Read + Sized>(buf: &mut T) -> Result<Self::SessionId, io::Error>;
    /// Writes session id to packets traveling in this direction.
    fn write_session_id(buf: &mut BytesMut, session_id: &Self::SessionId);
}

impl VoicePacketDst for Serverbound {
    type SessionId = ();

    fn read_session_id<T: Read + Sized>(_buf: &mut T) -> Result<Self::SessionId, io::Error> {
        Ok(())
    }

    fn write_session_id(_buf: &mut BytesMut, _session_id: &Self::SessionId) {}
}

impl VoicePacketDst for Clientbound {
    type SessionId = u32;

    fn read_session_id<T: Read + Sized>(buf: &mut T) -> Result<Self::SessionId, io::Error> {
        Ok(buf.read_varint()? as u32)
    }

    fn write_session_id(buf: &mut BytesMut, session_id: &Self::SessionId) {
        buf.put_varint(u64::from(*session_id))
    }
}

impl VoicePacket<Serverbound> {
    pub fn into_client_bound(self, session_id: u32) -> VoicePacket<Clientbound> {
        match self {
            VoicePacket::Ping { timestamp } => VoicePacket::Ping { timestamp },
            VoicePacket::Audio {
                target,
                seq_num,
                payload,
                position_info,
                ..
            } => VoicePacket::Audio {
                _dst: PhantomData,
                target,
                session_id,
                seq_num,
                payload,
                position_info,
            },
        }
    }
}

pub fn decode_voice_packet<DecodeDst: VoicePacketDst>(buf_mut: &mut BytesMut) -> Result<VoicePacket<DecodeDst>, DecryptError> {
    let mut buf = Cursor::new(&buf_mut);
    let header = buf.read_u8()?;
    let kind = header >> 5;
    let target = header & 0b11111;
    let result = if kind == 1 {
        let timestamp = buf.read_varint()?;
        buf_mut.advance(buf_mut.len());
        VoicePacket::Ping { timestamp }
    } else {
        let session_id = DecodeDst::read_session_id(&mut buf)?;
        let seq_num = buf.read_varint()?;
        let payload = match kind {
            0 | 2 | 3 => {
                let mut frames = Vec::new();
                let position = buf.position();
                buf_mut.advance(position as usize);
                loop {
                    if buf_mut.is_empty() {
                        return Err(DecryptError::Eof);
                    }
                    let header = buf_mut[0];
                    buf_mut.advance(1);

                    let len = (header & !0x80) as usize;
                    if buf_mut.len() < len {
                        return Err(DecryptError::Eof);
                    }
                    frames.push(buf_mut.split_to(len).freeze());
                    if header & 0x80 != 0x80 {
                        break;
                    }
                }
                match kind {
                    0 => VoicePacketPayload::CeltAlpha(frames),
                    2 => VoicePacketPayload::Speex(frames),
                    3 => VoicePacketPayload::CeltBeta(frames),
                    _ => unreachable!(),
                }
            }
            4 => {
                let header = buf.read_varint()?;
                let position = buf.position();
                buf_mut.advance(position as usize);
                let termination_bit = header & 0x2000 == 0x2000;
                let len = (header & !0x2000) as usize;
                if buf_mut.len() < len {
                    return Err(DecryptError::Eof);
                }
                let frame = buf_mut.split_to(len).freeze();
                VoicePacketPayload::Opus(frame, termination_bit)
            }
            _ => {
                return Err(DecryptError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unknown voice packet type",
                )));
            }
        };
        let position_info = if buf_mut.is_empty() { None } else { Some(buf_mut.split().freeze()) };
        VoicePacket::Audio {
            _dst: PhantomData,
            target,
            session_id,
            seq_num,
            payload,
            position_info,
        }
    };
    Ok(result)
}

pub fn encode_voice_packet<EncodeDst: VoicePacketDst>(item: &VoicePacket<EncodeDst>, dst: &mut BytesMut) {
    match item {
        VoicePacket::Ping { timestamp } => {
            dst.reserve(11);
            dst.put_u8(0x20);
            dst.put_varint(*timestamp);
        }
        VoicePacket::Audio {
            _dst,
            target,
            session_id,
            seq_num,
            payload,
            position_info,
        } => {
            dst.reserve(1 /*header*/ + 10 /*session_id*/ + 10 /*seq_num*/);
            dst.put_u8(payload.codec_id() << 5 | target & 0b11111);
            EncodeDst::write_session_id(dst, session_id);
            dst.put_varint(*seq_num);
            match payload {
                VoicePacketPayload::CeltAlpha(frames) | VoicePacketPayload::Speex(frames) | VoicePacketPayload::CeltBeta(frames) => {
                    dst.reserve(frames.iter().map(|frame| 1 + frame.len()).sum());
                    let mut iter = frames.iter().peekable();
                    while let Some(frame) = iter.next() {
                        let continuation = iter.peek().map(|_| 0x80).unwrap_or(0);
                        dst.put_u8(continuation | (frame.len() as u8));
                        dst.put(frame.as_ref());
                    }
                }
                VoicePacketPayload::Opus(frame, termination_bit) => {
                    dst.reserve(10 + frame.len());
                    let term_bit = if *termination_bit { 0x2000 } else { 0 };
                    dst.put_varint(term_bit | (frame.len() as u64));
                    dst.put(frame.as_ref());
                }
            };
            if let Some(bytes) = position_info {
                dst.extend_from_slice(bytes);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opus_packet(target: u8, seq_num: u64) -> VoicePacket<Clientbound> {
        VoicePacket::Audio {
            _dst: PhantomData,
            target,
            session_id: 42,
            seq_num,
            payload: VoicePacketPayload::Opus(Bytes::from_static(b"opus-data"), false),
            position_info: None,
        }
    }

    #[test]
    fn header_byte_packs_codec_and_target() {
        let mut buf = BytesMut::new();
        encode_voice_packet(&opus_packet(5, 1), &mut buf);
        assert_eq!(buf[0], 4 << 5 | 5);
    }

    #[test]
    fn clientbound_roundtrip() {
        let packet = opus_packet(0, 77);
        let mut buf = BytesMut::new();
        encode_voice_packet(&packet, &mut buf);
        let decoded = decode_voice_packet::<Clientbound>(&mut buf).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn serverbound_opus_with_position_info() {
        let packet = VoicePacket::Audio {
            _dst: PhantomData::<Serverbound>,
            target: 3,
            session_id: (),
            seq_num: 9,
            payload: VoicePacketPayload::Opus(Bytes::from_static(b"x"), true),
            position_info: Some(Bytes::from_static(&[0, 1, 2, 3])),
        };
        let mut buf = BytesMut::new();
        encode_voice_packet(&packet, &mut buf);
        let decoded = decode_voice_packet::<Serverbound>(&mut buf).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn celt_frame_list_roundtrip() {
        let packet = VoicePacket::Audio {
            _dst: PhantomData::<Serverbound>,
            target: 0,
            session_id: (),
            seq_num: 2,
            payload: VoicePacketPayload::CeltAlpha(vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]),
            position_info: None,
        };
        let mut buf = BytesMut::new();
        encode_voice_packet(&packet, &mut buf);
        let decoded = decode_voice_packet::<Serverbound>(&mut buf).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn ping_roundtrip() {
        let packet = VoicePacket::<Serverbound>::Ping { timestamp: 123456 };
        let mut buf = BytesMut::new();
        encode_voice_packet(&packet, &mut buf);
        let decoded = decode_voice_packet::<Serverbound>(&mut buf).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn truncated_audio_is_rejected() {
        let mut buf = BytesMut::new();
        encode_voice_packet(&opus_packet(0, 1), &mut buf);
        let mut cut = buf.split_to(buf.len() - 4);
        assert!(decode_voice_packet::<Clientbound>(&mut cut).is_err());
    }

    #[test]
    fn into_client_bound_keeps_fields() {
        let packet = VoicePacket::Audio {
            _dst: PhantomData::<Serverbound>,
            target: 7,
            session_id: (),
            seq_num: 5,
            payload: VoicePacketPayload::Opus(Bytes::from_static(b"p"), false),
            position_info: None,
        };
        match packet.into_client_bound(99) {
            VoicePacket::Audio { session_id, target, seq_num, .. } => {
                assert_eq!(session_id, 99);
                assert_eq!(target, 7);
                assert_eq!(seq_num, 5);
            }
            _ => panic!("expected audio"),
        }
    }
}
