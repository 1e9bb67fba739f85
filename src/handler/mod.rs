mod acl_message;
mod authenticate;
mod ban_list;
mod channel_remove;
mod channel_state;
mod crypt_setup;
mod permission_query;
mod ping;
mod plugin_data;
mod query_users;
mod request_blob;
mod text_message;
mod user_list;
mod user_remove;
mod user_state;
mod user_stats;
mod version;
mod voice_target;

use crate::client::Client;
use crate::edge::Edge;
use crate::error::MumbleError;
use crate::proto::mumble::{permission_denied::DenyType, PermissionDenied};
use crate::proto::{mumble, read_frame, MessageKind};
use crate::router;
use crate::sync::RwLock;
use crate::voice::{decode_voice_packet, Serverbound};
use async_trait::async_trait;
use bytes::BytesMut;
use prost::Message;
use std::sync::Arc;
use tokio::io::AsyncRead;

#[async_trait]
pub trait Handler {
    async fn handle(&self, edge: &Edge, client: Arc<RwLock<Client>>) -> Result<(), MumbleError>;
}

/// Queues a PermissionDenied of the given type, optionally naming the
/// channel and denied permission bit.
pub async fn send_permission_denied(
    client: &Arc<RwLock<Client>>,
    deny: DenyType,
    channel_id: Option<u32>,
    permission: Option<u32>,
    reason: &str,
) -> Result<(), MumbleError> {
    let denied = PermissionDenied {
        permission,
        channel_id,
        session: None,
        reason: Some(reason.to_string()),
        r#type: Some(deny as i32),
        name: None,
    };

    client.read_err().await?.queue_message(MessageKind::PermissionDenied, &denied)
}

pub struct MessageHandler;

impl MessageHandler {
    async fn try_handle<T: Message + Handler + Default>(
        buf: &[u8],
        edge: &Edge,
        client: Arc<RwLock<Client>>,
    ) -> Result<(), MumbleError> {
        let message = T::decode(buf)?;

        let (username, session_id) = {
            let client_read = client.read_err().await?;
            (client_read.name.clone(), client_read.session_id)
        };

        tracing::trace!(
            "[{}] [{}] handle message: {:?}, {:?}",
            username,
            session_id,
            std::any::type_name::<T>(),
            message
        );

        message.handle(edge, client).await
    }

    /// Reads one control frame from an authenticated client and dispatches
    /// it. Writing happens elsewhere, on the client's writer task.
    pub async fn handle<S: AsyncRead + Unpin>(stream: &mut S, edge: &Edge, client: Arc<RwLock<Client>>) -> Result<(), MumbleError> {
        let (kind, buf) = read_frame(stream).await?;

        crate::metrics::MESSAGES_TOTAL
            .with_label_values(&["tcp", "input", kind.to_string().as_str()])
            .inc();
        crate::metrics::MESSAGES_BYTES
            .with_label_values(&["tcp", "input", kind.to_string().as_str()])
            .inc_by(buf.len() as u64);

        match kind {
            MessageKind::Version => Self::try_handle::<mumble::Version>(&buf, edge, client).await,
            MessageKind::UDPTunnel => {
                let mut bytes = BytesMut::from(buf.as_slice());

                let voice_packet = match decode_voice_packet::<Serverbound>(&mut bytes) {
                    Ok(voice_packet) => voice_packet,
                    Err(e) => {
                        tracing::error!("error decoding tunneled voice packet: {}", e);

                        return Ok(());
                    }
                };

                router::route_voice(&edge.state, Some(&edge.peers), &client, voice_packet).await
            }
            MessageKind::Authenticate => Self::try_handle::<mumble::Authenticate>(&buf, edge, client).await,
            MessageKind::Ping => Self::try_handle::<mumble::Ping>(&buf, edge, client).await,
            MessageKind::ChannelRemove => Self::try_handle::<mumble::ChannelRemove>(&buf, edge, client).await,
            MessageKind::ChannelState => Self::try_handle::<mumble::ChannelState>(&buf, edge, client).await,
            MessageKind::UserRemove => Self::try_handle::<mumble::UserRemove>(&buf, edge, client).await,
            MessageKind::UserState => Self::try_handle::<mumble::UserState>(&buf, edge, client).await,
            MessageKind::BanList => Self::try_handle::<mumble::BanList>(&buf, edge, client).await,
            MessageKind::TextMessage => Self::try_handle::<mumble::TextMessage>(&buf, edge, client).await,
            MessageKind::ACL => Self::try_handle::<mumble::Acl>(&buf, edge, client).await,
            MessageKind::QueryUsers => Self::try_handle::<mumble::QueryUsers>(&buf, edge, client).await,
            MessageKind::CryptSetup => Self::try_handle::<mumble::CryptSetup>(&buf, edge, client).await,
            MessageKind::UserList => Self::try_handle::<mumble::UserList>(&buf, edge, client).await,
            MessageKind::VoiceTarget => Self::try_handle::<mumble::VoiceTarget>(&buf, edge, client).await,
            MessageKind::PermissionQuery => Self::try_handle::<mumble::PermissionQuery>(&buf, edge, client).await,
            MessageKind::UserStats => Self::try_handle::<mumble::UserStats>(&buf, edge, client).await,
            MessageKind::RequestBlob => Self::try_handle::<mumble::RequestBlob>(&buf, edge, client).await,
            MessageKind::PluginDataTransmission => Self::try_handle::<mumble::PluginDataTransmission>(&buf, edge, client).await,
            _ => {
                tracing::warn!("unsupported message kind: {:?}", kind);

                Ok(())
            }
        }
    }
}
