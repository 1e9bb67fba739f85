use crate::proto::MessageKind;
use crate::voice::{Clientbound, VoicePacket};
use bytes::Bytes;

/// Work items for a client's writer task. The queue is bounded; a client
/// that cannot drain it is disconnected rather than allowed to stall the
/// server.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    SendVoicePacket(VoicePacket<Clientbound>),
    SendMessage { kind: MessageKind, payload: Bytes },
    Disconnect,
}
