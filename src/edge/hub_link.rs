//! The edge's single control connection to the hub: one TLS stream, one
//! reader, one writer queue, and a pending-request table keyed by frame id.

use crate::config::EdgeConfig;
use crate::error::RpcError;
use crate::rpc::{
    self, Ack, AllocateSessionIdParams, AuthResult, AuthenticateUserParams, CreateChannelParams, CreateChannelResult, Frame,
    FullSyncParams, FullSyncResult, GetBlobParams, HandleAclParams, HandleAclResult, HeartbeatParams, HeartbeatResult,
    JoinCompleteParams, JoinParams, JoinResult, KickSessionParams, ListUsersParams, NotificationBody, PutBlobParams,
    RegisterParams, RegisterResult, RegisteredUserSummary, RemoveChannelParams, ReportPeerDisconnectParams,
    ReportPeerDisconnectResult, ReportSessionParams, RequestBody, ResponseBody, UpdateBansParams, UpdateChannelParams,
    UpdateSessionParams,
};
use crate::sync::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls;
use tokio_rustls::TlsConnector;

const WRITER_QUEUE: usize = 256;

#[derive(Debug)]
pub enum LinkEvent {
    Notification(NotificationBody),
    Down { generation: u64 },
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<ResponseBody, RpcError>>>>>;

pub struct HubLink {
    config: EdgeConfig,
    writer: RwLock<Option<mpsc::Sender<Frame>>>,
    pending: PendingMap,
    next_id: AtomicU64,
    generation: AtomicU64,
    events: mpsc::UnboundedSender<LinkEvent>,
    request_timeout: Duration,
}

fn client_tls_config(config: &EdgeConfig) -> Result<rustls::ClientConfig, RpcError> {
    if !config.hub_tls_verify {
        return Ok(crate::tls::insecure_client_config());
    }

    let builder = rustls::ClientConfig::builder().with_safe_defaults();

    // the cluster trust anchor is the configured hub_ca, not the web PKI
    let mut roots = rustls::RootCertStore::empty();

    if let Some(ca_path) = &config.hub_ca {
        let file = std::fs::File::open(ca_path)?;
        let mut reader = std::io::BufReader::new(file);

        for cert in rustls_pemfile::certs(&mut reader)? {
            if let Err(e) = roots.add(&rustls::Certificate(cert)) {
                tracing::warn!("skipping unparsable CA certificate in {}: {}", ca_path, e);
            }
        }
    }

    Ok(builder.with_root_certificates(roots).with_no_client_auth())
}

impl HubLink {
    pub fn new(config: EdgeConfig, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            config,
            writer: RwLock::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            events,
            request_timeout: Duration::from_secs(rpc::REQUEST_TIMEOUT_SECS),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Establishes (or replaces) the TLS control stream and spawns the
    /// reader/writer tasks for it.
    pub async fn connect(self: Arc<Self>) -> Result<(), RpcError> {
        self.teardown("reconnecting").await;

        let tls_config = client_tls_config(&self.config)?;
        let connector = TlsConnector::from(Arc::new(tls_config));

        let tcp = TcpStream::connect((self.config.hub_host.as_str(), self.config.hub_port)).await?;
        tcp.set_nodelay(true)?;

        let server_name = rustls::ServerName::try_from(self.config.hub_host.as_str())
            .or_else(|_| rustls::ServerName::try_from("hub.cluster.invalid"))
            .map_err(|_| RpcError::Unavailable)?;

        let stream = connector.connect(server_name, tcp).await?;
        let (read, write) = tokio::io::split(stream);

        let (writer_tx, writer_rx) = mpsc::channel(WRITER_QUEUE);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        {
            *self.writer.write().await = Some(writer_tx.clone());
        }

        let link = self.clone();
        actix_rt::spawn(async move {
            link.read_loop(read, writer_tx, generation).await;
        });

        let link = self.clone();
        actix_rt::spawn(async move {
            Self::write_loop(write, writer_rx).await;
            link.mark_down(generation).await;
        });

        let link = self.clone();
        actix_rt::spawn(async move {
            link.keepalive_loop(generation).await;
        });

        tracing::info!("hub control link established (generation {})", generation);

        Ok(())
    }

    async fn read_loop(self: Arc<Self>, mut read: ReadHalf<TlsStream<TcpStream>>, writer: mpsc::Sender<Frame>, generation: u64) {
        let deadline = Duration::from_secs(rpc::ACTIVITY_TIMEOUT_SECS);

        loop {
            let frame = match tokio::time::timeout(deadline, rpc::read_frame(&mut read)).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(e)) => {
                    tracing::warn!("hub link read error: {}", e);
                    break;
                }
                Err(_) => {
                    tracing::warn!("hub link silent for {}s, treating hub as gone", deadline.as_secs());
                    break;
                }
            };

            match frame {
                Frame::Response { id, result, error } => self.complete(id, result, error),
                Frame::Notification { event } => {
                    let _ = self.events.send(LinkEvent::Notification(event));
                }
                Frame::Ping { id } => {
                    let _ = writer.send(Frame::Pong { id }).await;
                }
                Frame::Pong { .. } => {}
                Frame::Request { id, .. } => {
                    tracing::warn!("unexpected request frame {} from hub", id);
                }
            }
        }

        self.mark_down(generation).await;
    }

    async fn write_loop(mut write: WriteHalf<TlsStream<TcpStream>>, mut rx: mpsc::Receiver<Frame>) {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = rpc::write_frame(&mut write, &frame).await {
                tracing::warn!("hub link write error: {}", e);
                break;
            }
        }
    }

    async fn keepalive_loop(self: Arc<Self>, generation: u64) {
        let mut interval = tokio::time::interval(Duration::from_secs(rpc::PING_INTERVAL_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }

            let writer = { self.writer.read().await.clone() };

            match writer {
                Some(writer) => {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);

                    if writer.send(Frame::Ping { id }).await.is_err() {
                        return;
                    }
                }
                None => return,
            }
        }
    }

    fn complete(&self, id: u64, result: Option<ResponseBody>, error: Option<rpc::RpcFault>) {
        let sender = {
            match self.pending.lock() {
                Ok(mut pending) => pending.remove(&id),
                Err(_) => None,
            }
        };

        if let Some(sender) = sender {
            let outcome = match (result, error) {
                (_, Some(fault)) => Err(fault.into()),
                (Some(result), None) => Ok(result),
                (None, None) => Err(RpcError::UnexpectedResponse),
            };

            let _ = sender.send(outcome);
        }
    }

    async fn teardown(&self, why: &str) {
        let had_writer = {
            let mut writer = self.writer.write().await;
            writer.take().is_some()
        };

        if had_writer {
            tracing::debug!("hub link torn down: {}", why);
        }

        self.fail_pending();
    }

    fn fail_pending(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            for (_, sender) in pending.drain() {
                let _ = sender.send(Err(RpcError::Unavailable));
            }
        }
    }

    async fn mark_down(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            // a newer connection already replaced this one
            return;
        }

        {
            let mut writer = self.writer.write().await;
            *writer = None;
        }

        self.fail_pending();

        let _ = self.events.send(LinkEvent::Down { generation });
    }

    /// Sends one request and awaits its response, bounded by the request
    /// timeout.
    pub async fn call(&self, body: RequestBody) -> Result<ResponseBody, RpcError> {
        let method = body.method();

        let writer = {
            self.writer
                .read_err()
                .await
                .map_err(|_| RpcError::Unavailable)?
                .clone()
                .ok_or(RpcError::Unavailable)?
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }

        if writer.send(Frame::Request { id, call: body }).await.is_err() {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&id);
            }

            crate::metrics::RPC_REQUESTS_TOTAL.with_label_values(&[method, "unavailable"]).inc();

            return Err(RpcError::Unavailable);
        }

        let outcome = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::Unavailable),
            Err(_) => {
                if let Ok(mut pending) = self.pending.lock() {
                    pending.remove(&id);
                }

                Err(RpcError::Timeout)
            }
        };

        let label = if outcome.is_ok() { "ok" } else { "error" };
        crate::metrics::RPC_REQUESTS_TOTAL.with_label_values(&[method, label]).inc();

        outcome
    }

    async fn expect_ack(&self, body: RequestBody) -> Result<Ack, RpcError> {
        match self.call(body).await? {
            ResponseBody::Ack(ack) => Ok(ack),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    pub async fn register(&self, params: RegisterParams) -> Result<RegisterResult, RpcError> {
        match self.call(RequestBody::Register(params)).await? {
            ResponseBody::Register(result) => Ok(result),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    pub async fn join(&self, params: JoinParams) -> Result<JoinResult, RpcError> {
        match self.call(RequestBody::Join(params)).await? {
            ResponseBody::Join(result) => Ok(result),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    pub async fn join_complete(&self, params: JoinCompleteParams) -> Result<(), RpcError> {
        self.expect_ack(RequestBody::JoinComplete(params)).await.map(|_| ())
    }

    pub async fn heartbeat(&self, params: HeartbeatParams) -> Result<HeartbeatResult, RpcError> {
        match self.call(RequestBody::Heartbeat(params)).await? {
            ResponseBody::Heartbeat(result) => Ok(result),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    pub async fn full_sync(&self) -> Result<FullSyncResult, RpcError> {
        match self.call(RequestBody::FullSync(FullSyncParams {})).await? {
            ResponseBody::FullSync(result) => Ok(*result),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    pub async fn allocate_session_id(&self, edge_id: u32) -> Result<u32, RpcError> {
        match self.call(RequestBody::AllocateSessionId(AllocateSessionIdParams { edge_id })).await? {
            ResponseBody::AllocateSessionId(result) => Ok(result.session_id),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    pub async fn authenticate_user(&self, params: AuthenticateUserParams) -> Result<AuthResult, RpcError> {
        match self.call(RequestBody::AuthenticateUser(params)).await? {
            ResponseBody::AuthenticateUser(result) => Ok(result),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    pub async fn report_session(&self, params: ReportSessionParams) -> Result<(), RpcError> {
        self.expect_ack(RequestBody::ReportSession(params)).await.map(|_| ())
    }

    pub async fn update_session(&self, params: UpdateSessionParams) -> Result<(), RpcError> {
        self.expect_ack(RequestBody::UpdateSession(params)).await.map(|_| ())
    }

    pub async fn end_session(&self, session: u32) -> Result<(), RpcError> {
        self.expect_ack(RequestBody::EndSession(rpc::EndSessionParams { session }))
            .await
            .map(|_| ())
    }

    pub async fn handle_acl(&self, params: HandleAclParams) -> Result<HandleAclResult, RpcError> {
        match self.call(RequestBody::HandleAcl(params)).await? {
            ResponseBody::HandleAcl(result) => Ok(result),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    pub async fn create_channel(&self, params: CreateChannelParams) -> Result<CreateChannelResult, RpcError> {
        match self.call(RequestBody::CreateChannel(params)).await? {
            ResponseBody::CreateChannel(result) => Ok(result),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    pub async fn update_channel(&self, params: UpdateChannelParams) -> Result<(), RpcError> {
        self.expect_ack(RequestBody::UpdateChannel(params)).await.map(|_| ())
    }

    pub async fn remove_channel(&self, params: RemoveChannelParams) -> Result<(), RpcError> {
        self.expect_ack(RequestBody::RemoveChannel(params)).await.map(|_| ())
    }

    pub async fn update_bans(&self, params: UpdateBansParams) -> Result<(), RpcError> {
        self.expect_ack(RequestBody::UpdateBans(params)).await.map(|_| ())
    }

    pub async fn kick_session(&self, params: KickSessionParams) -> Result<(), RpcError> {
        self.expect_ack(RequestBody::KickSession(params)).await.map(|_| ())
    }

    pub async fn report_peer_disconnect(&self, params: ReportPeerDisconnectParams) -> Result<ReportPeerDisconnectResult, RpcError> {
        match self.call(RequestBody::ReportPeerDisconnect(params)).await? {
            ResponseBody::ReportPeerDisconnect(result) => Ok(result),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    pub async fn get_blob(&self, hash: String) -> Result<Vec<u8>, RpcError> {
        match self.call(RequestBody::GetBlob(GetBlobParams { hash })).await? {
            ResponseBody::GetBlob(result) => Ok(result.data),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    pub async fn put_blob(&self, data: Vec<u8>) -> Result<String, RpcError> {
        match self.call(RequestBody::PutBlob(PutBlobParams { data })).await? {
            ResponseBody::PutBlob(result) => Ok(result.hash),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    pub async fn list_users(&self) -> Result<Vec<RegisteredUserSummary>, RpcError> {
        match self.call(RequestBody::ListUsers(ListUsersParams {})).await? {
            ResponseBody::ListUsers(result) => Ok(result.users),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }
}
