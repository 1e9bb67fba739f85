use crate::error::MumbleError;
use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub mod mumble;

/// Control messages above this size indicate a corrupt or hostile stream.
pub const MAX_CONTROL_MESSAGE_SIZE: u32 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Version = 0,
    UDPTunnel = 1,
    Authenticate = 2,
    Ping = 3,
    Reject = 4,
    ServerSync = 5,
    ChannelRemove = 6,
    ChannelState = 7,
    UserRemove = 8,
    UserState = 9,
    BanList = 10,
    TextMessage = 11,
    PermissionDenied = 12,
    ACL = 13,
    QueryUsers = 14,
    CryptSetup = 15,
    ContextActionModify = 16,
    ContextAction = 17,
    UserList = 18,
    VoiceTarget = 19,
    PermissionQuery = 20,
    CodecVersion = 21,
    UserStats = 22,
    RequestBlob = 23,
    ServerConfig = 24,
    SuggestConfig = 25,
    PluginDataTransmission = 26,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Version => "Version",
            MessageKind::UDPTunnel => "UDPTunnel",
            MessageKind::Authenticate => "Authenticate",
            MessageKind::Ping => "Ping",
            MessageKind::Reject => "Reject",
            MessageKind::ServerSync => "ServerSync",
            MessageKind::ChannelRemove => "ChannelRemove",
            MessageKind::ChannelState => "ChannelState",
            MessageKind::UserRemove => "UserRemove",
            MessageKind::UserState => "UserState",
            MessageKind::BanList => "BanList",
            MessageKind::TextMessage => "TextMessage",
            MessageKind::PermissionDenied => "PermissionDenied",
            MessageKind::ACL => "ACL",
            MessageKind::QueryUsers => "QueryUsers",
            MessageKind::CryptSetup => "CryptSetup",
            MessageKind::ContextActionModify => "ContextActionModify",
            MessageKind::ContextAction => "ContextAction",
            MessageKind::UserList => "UserList",
            MessageKind::VoiceTarget => "VoiceTarget",
            MessageKind::PermissionQuery => "PermissionQuery",
            MessageKind::CodecVersion => "CodecVersion",
            MessageKind::UserStats => "UserStats",
            MessageKind::RequestBlob => "RequestBlob",
            MessageKind::ServerConfig => "ServerConfig",
            MessageKind::SuggestConfig => "SuggestConfig",
            MessageKind::PluginDataTransmission => "PluginDataTransmission",
        };

        f.write_str(name)
    }
}

impl TryFrom<u16> for MessageKind {
    type Error = MumbleError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageKind::Version),
            1 => Ok(MessageKind::UDPTunnel),
            2 => Ok(MessageKind::Authenticate),
            3 => Ok(MessageKind::Ping),
            4 => Ok(MessageKind::Reject),
            5 => Ok(MessageKind::ServerSync),
            6 => Ok(MessageKind::ChannelRemove),
            7 => Ok(MessageKind::ChannelState),
            8 => Ok(MessageKind::UserRemove),
            9 => Ok(MessageKind::UserState),
            10 => Ok(MessageKind::BanList),
            11 => Ok(MessageKind::TextMessage),
            12 => Ok(MessageKind::PermissionDenied),
            13 => Ok(MessageKind::ACL),
            14 => Ok(MessageKind::QueryUsers),
            15 => Ok(MessageKind::CryptSetup),
            16 => Ok(MessageKind::ContextActionModify),
            17 => Ok(MessageKind::ContextAction),
            18 => Ok(MessageKind::UserList),
            19 => Ok(MessageKind::VoiceTarget),
            20 => Ok(MessageKind::PermissionQuery),
            21 => Ok(MessageKind::CodecVersion),
            22 => Ok(MessageKind::UserStats),
            23 => Ok(MessageKind::RequestBlob),
            24 => Ok(MessageKind::ServerConfig),
            25 => Ok(MessageKind::SuggestConfig),
            26 => Ok(MessageKind::PluginDataTransmission),
            _ => Err(MumbleError::UnexpectedMessageKind(value)),
        }
    }
}

/// Serializes a message with its 6-byte `(type, length)` frame header.
pub fn message_to_bytes<T: Message>(kind: MessageKind, message: &T) -> Result<Bytes, MumbleError> {
    let len = message.encoded_len();
    let mut buffer = BytesMut::with_capacity(6 + len);
    buffer.put_u16(kind as u16);
    buffer.put_u32(len as u32);
    message
        .encode(&mut buffer)
        .map_err(|e| MumbleError::Protocol(format!("encode {kind}: {e}")))?;

    Ok(buffer.freeze())
}

pub async fn send_message<T: Message, S: AsyncWrite + Unpin>(kind: MessageKind, message: &T, stream: &mut S) -> Result<(), MumbleError> {
    tracing::trace!("send message: {:?}, {:?}", std::any::type_name::<T>(), message);

    let bytes = message_to_bytes(kind, message)?;
    stream.write_all(bytes.as_ref()).await?;
    stream.flush().await?;

    Ok(())
}

/// Reads one frame header and payload, without interpreting the payload.
pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(MessageKind, Vec<u8>), MumbleError> {
    let kind = stream.read_u16().await?;
    let size = stream.read_u32().await?;

    if size > MAX_CONTROL_MESSAGE_SIZE {
        return Err(MumbleError::Protocol(format!("control frame of {size} bytes exceeds limit")));
    }

    let mut data = vec![0; size as usize];
    stream.read_exact(&mut data).await?;

    Ok((MessageKind::try_from(kind)?, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::mumble::{Authenticate, ChannelState, UserState, Version};

    #[test]
    fn frame_header_is_type_then_length() {
        let version = Version {
            version: Some(0x10400),
            release: Some("1.4.0".to_string()),
            os: Some("linux".to_string()),
            os_version: Some("6.1".to_string()),
        };

        let bytes = message_to_bytes(MessageKind::Version, &version).unwrap();
        assert_eq!(&bytes[0..2], &[0, 0]);
        let len = u32::from_be_bytes(bytes[2..6].try_into().unwrap());
        assert_eq!(len as usize, bytes.len() - 6);

        let decoded = Version::decode(&bytes[6..]).unwrap();
        assert_eq!(decoded, version);
    }

    #[test]
    fn message_kind_roundtrip() {
        for value in 0u16..=26 {
            let kind = MessageKind::try_from(value).unwrap();
            assert_eq!(kind as u16, value);
        }
        assert!(MessageKind::try_from(27).is_err());
    }

    #[test]
    fn encode_decode_identity() {
        let state = UserState {
            session: Some(7),
            name: Some("alice".to_string()),
            channel_id: Some(3),
            self_mute: Some(true),
            listening_channel_add: vec![2, 4],
            ..Default::default()
        };
        let bytes = message_to_bytes(MessageKind::UserState, &state).unwrap();
        assert_eq!(UserState::decode(&bytes[6..]).unwrap(), state);

        let auth = Authenticate {
            username: Some("alice".to_string()),
            password: Some("p".to_string()),
            tokens: vec!["tok".to_string()],
            celt_versions: vec![-2147483637, -2147483632],
            opus: Some(true),
        };
        let bytes = message_to_bytes(MessageKind::Authenticate, &auth).unwrap();
        assert_eq!(Authenticate::decode(&bytes[6..]).unwrap(), auth);

        let chan = ChannelState {
            channel_id: Some(0),
            name: Some("Root".to_string()),
            links: vec![1, 2],
            position: Some(-1),
            ..Default::default()
        };
        let bytes = message_to_bytes(MessageKind::ChannelState, &chan).unwrap();
        assert_eq!(ChannelState::decode(&bytes[6..]).unwrap(), chan);
    }
}
