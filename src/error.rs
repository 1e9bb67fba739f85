use crate::message::ClientMessage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MumbleError {
    #[error("unexpected message kind: {0}")]
    UnexpectedMessageKind(u16),
    #[error("io error: {0}")]
    Io(#[from] tokio::io::Error),
    #[error("message decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("voice decrypt error: {0}")]
    Decrypt(#[from] DecryptError),
    #[error("force disconnecting client")]
    ForceDisconnect,
    #[error("client outbound queue overflow")]
    PacketOverflow,
    #[error("lock error: {0}")]
    Lock(#[from] crate::sync::Error),
    #[error("send message error: {0}")]
    Send(#[from] tokio::sync::mpsc::error::SendError<ClientMessage>),
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("{0}")]
    Protocol(String),
}

#[derive(Error, Debug)]
pub enum DecryptError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected eof")]
    Eof,
    #[error("repeated packet")]
    Repeat,
    #[error("packet outside replay window")]
    Late,
    #[error("tag mismatch")]
    Mac,
}

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("rpc transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("rpc encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("rpc decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("rpc frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("rpc request timed out")]
    Timeout,
    #[error("hub link is down")]
    Unavailable,
    #[error("remote error {code}: {message}")]
    Remote {
        code: i32,
        message: String,
        deny_type: Option<i32>,
    },
    #[error("response body does not match the request method")]
    UnexpectedResponse,
}

impl RpcError {
    /// Remote errors that encode a permission problem become a
    /// PermissionDenied at the client boundary, everything else a generic
    /// rejection.
    pub fn is_permission(&self) -> bool {
        matches!(self, RpcError::Remote { code, .. } if *code == crate::rpc::error_code::PERMISSION)
    }

    /// The Mumble PermissionDenied.DenyType carried by a remote fault.
    pub fn deny_type(&self) -> Option<i32> {
        match self {
            RpcError::Remote { deny_type, .. } => *deny_type,
            _ => None,
        }
    }
}
