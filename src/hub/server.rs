//! The hub's control listener: one TLS stream per edge, frames dispatched
//! in arrival order so notifications published during a request always
//! precede its response on the wire.

use crate::hub::{ConnContext, Hub};
use crate::rpc::{self, Frame};
use actix_server::Server;
use actix_service::fn_service;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{self, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::{server::TlsStream, TlsAcceptor};

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const WRITER_QUEUE: usize = 256;

pub fn create_hub_server(listener: TcpListener, acceptor: TlsAcceptor, hub: Arc<Hub>) -> Server {
    Server::build()
        .listen(
            "hub-control",
            listener.into_std().expect("cannot create hub listener"),
            move || {
                let acceptor = acceptor.clone();
                let hub = hub.clone();

                fn_service(move |stream: TcpStream| {
                    let acceptor = acceptor.clone();
                    let hub = hub.clone();

                    async move {
                        match handle_edge_connection(acceptor, hub, stream).await {
                            Ok(_) => (),
                            Err(e) => tracing::error!("edge connection error: {:?}", e),
                        }

                        Ok::<(), anyhow::Error>(())
                    }
                })
            },
        )
        .expect("cannot create hub server")
        .run()
}

async fn write_loop(mut write: WriteHalf<TlsStream<TcpStream>>, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = rpc::write_frame(&mut write, &frame).await {
            tracing::warn!("edge link write error: {}", e);
            break;
        }
    }
}

async fn handle_edge_connection(acceptor: TlsAcceptor, hub: Arc<Hub>, stream: TcpStream) -> Result<(), anyhow::Error> {
    stream.set_nodelay(true).context("set stream no delay")?;

    let peer = stream.peer_addr().context("peer address")?;

    let stream = timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream))
        .await
        .context("tls handshake timeout")?
        .context("accept tls")?;

    tracing::info!("edge control connection from {}", peer);

    let (mut read, write) = io::split(stream);
    let (tx, rx) = mpsc::channel(WRITER_QUEUE);

    actix_rt::spawn(write_loop(write, rx));

    let mut ctx = ConnContext { edge_id: None, tx: tx.clone() };
    let deadline = Duration::from_secs(rpc::ACTIVITY_TIMEOUT_SECS);

    loop {
        let frame = match timeout(deadline, rpc::read_frame(&mut read)).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                tracing::info!("edge control stream from {} closed: {}", peer, e);
                break;
            }
            Err(_) => {
                tracing::warn!("edge control stream from {} silent for {}s", peer, deadline.as_secs());
                break;
            }
        };

        match frame {
            Frame::Request { id, call } => {
                let method = call.method();

                let response = match hub.dispatch(&mut ctx, call).await {
                    Ok(body) => {
                        crate::metrics::RPC_REQUESTS_TOTAL.with_label_values(&[method, "ok"]).inc();

                        Frame::Response {
                            id,
                            result: Some(body),
                            error: None,
                        }
                    }
                    Err(fault) => {
                        crate::metrics::RPC_REQUESTS_TOTAL.with_label_values(&[method, "error"]).inc();
                        tracing::debug!("{} failed: {} ({})", method, fault.message, fault.code);

                        Frame::Response {
                            id,
                            result: None,
                            error: Some(fault),
                        }
                    }
                };

                if tx.send(response).await.is_err() {
                    break;
                }
            }
            Frame::Ping { id } => {
                if tx.send(Frame::Pong { id }).await.is_err() {
                    break;
                }
            }
            Frame::Pong { .. } => {}
            Frame::Response { id, .. } => {
                tracing::warn!("unexpected response frame {} from {}", id, peer);
            }
            Frame::Notification { .. } => {
                tracing::warn!("unexpected notification frame from {}", peer);
            }
        }
    }

    if let Some(edge_id) = ctx.edge_id {
        // only evict if the registry still points at THIS stream; a stale
        // connection closing after its edge re-registered must not tear the
        // fresh registration down
        let owns_registration = match hub.state.read_err().await {
            Ok(state_read) => state_read
                .edges
                .get(&edge_id)
                .map(|entry| entry.tx.same_channel(&ctx.tx))
                .unwrap_or(false),
            Err(_) => false,
        };

        if owns_registration {
            if let Err(e) = hub.edge_disconnected(edge_id).await {
                tracing::error!("edge {} cleanup failed: {:?}", edge_id, e);
            }
        }
    }

    Ok(())
}
