#[macro_use]
extern crate lazy_static;

mod acl;
mod ban;
mod blob;
mod channel;
mod clean;
mod client;
mod config;
mod crypt;
mod edge;
mod error;
mod handler;
mod hub;
mod message;
mod metrics;
mod proto;
mod router;
mod rpc;
mod server;
mod state;
mod sync;
mod target;
mod testclient;
mod tls;
mod varint;
mod voice;

use crate::blob::BlobStore;
use crate::clean::clean_loop;
use crate::config::{EdgeConfig, HubConfig};
use crate::edge::hub_link::HubLink;
use crate::edge::peers::{PeerCipher, PeerTransport};
use crate::edge::Edge;
use crate::hub::server::create_hub_server;
use crate::hub::store::Store;
use crate::hub::Hub;
use crate::proto::mumble::Version;
use crate::server::{create_tcp_server, create_udp_server};
use crate::state::ServerState;
use crate::sync::RwLock;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, UdpSocket};
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::EnvFilter;

/// Murmux, a distributed Mumble-compatible voice cluster
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the hub: the authoritative node of the cluster
    Hub {
        #[clap(subcommand)]
        command: HubCommand,
    },
    /// Run an edge: terminates clients and routes voice
    Edge {
        #[clap(subcommand)]
        command: EdgeCommand,
    },
    /// Headless test client
    Client {
        #[clap(subcommand)]
        command: ClientCommand,
    },
}

#[derive(Subcommand, Debug)]
enum HubCommand {
    Start {
        /// Path to the hub configuration file (JSON)
        #[clap(long, value_parser)]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum EdgeCommand {
    Start {
        /// Path to the edge configuration file (JSON)
        #[clap(long, value_parser)]
        config: Option<PathBuf>,
        /// Listen address for client TCP and UDP
        #[clap(long, value_parser)]
        host: Option<String>,
        /// Listen port for client TCP and UDP (voice peers use port + 1)
        #[clap(long, value_parser)]
        port: Option<u16>,
        /// Hub control host
        #[clap(long, value_parser)]
        hub_host: Option<String>,
        /// Hub control port
        #[clap(long, value_parser)]
        hub_port: Option<u16>,
    },
    /// Parse and validate the configuration, then exit
    ValidateConfig {
        #[clap(long, value_parser)]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum ClientCommand {
    Connect {
        #[clap(long, value_parser)]
        host: String,
        #[clap(long, value_parser, default_value_t = 64738)]
        port: u16,
        #[clap(long, value_parser)]
        username: String,
        #[clap(long, value_parser)]
        password: Option<String>,
        #[clap(long, value_parser)]
        tokens: Vec<String>,
        /// Never open a UDP voice path; tunnel voice over the control stream
        #[clap(long)]
        force_tcp_voice: bool,
    },
}

const EXIT_FATAL: i32 = 1;
const EXIT_CONFIG: i32 = 2;

fn init_tracing() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn make_acceptor(cert: &str, key: &str) -> Result<TlsAcceptor, String> {
    let certs = tls::load_certs(cert).map_err(|e| format!("cannot load certificate at path {cert}: {e}"))?;
    let mut keys = tls::load_keys(key).map_err(|e| format!("cannot load key at path {key}: {e}"))?;

    if keys.is_empty() {
        return Err(format!("no usable private key in {key}"));
    }

    let config = tls::server_config(certs, keys.remove(0)).map_err(|e| format!("cannot create tls config: {e}"))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn server_version() -> Version {
    // announce a 1.4-series protocol
    let version = 1 << 16 | 4 << 8;

    Version {
        version: Some(version),
        release: Some(env!("CARGO_PKG_VERSION").to_string()),
        os: Some(std::env::consts::FAMILY.to_string()),
        os_version: Some(std::env::consts::OS.to_string()),
    }
}

async fn run_hub(config_path: Option<PathBuf>) -> i32 {
    let config: HubConfig = match config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e}");
            return EXIT_CONFIG;
        }
    };

    let store = match Store::open(&config.database_path) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("cannot open store at {}: {}", config.database_path, e);
            return EXIT_FATAL;
        }
    };

    let blobs = match BlobStore::open(&config.blob_root) {
        Ok(blobs) => blobs,
        Err(e) => {
            tracing::error!("cannot open blob store at {}: {}", config.blob_root, e);
            return EXIT_FATAL;
        }
    };

    let acceptor = match make_acceptor(&config.cert, &config.key) {
        Ok(acceptor) => acceptor,
        Err(e) => {
            tracing::error!("{e}");
            return EXIT_FATAL;
        }
    };

    let listen = format!("{}:{}", config.listen_host, config.control_port);

    let listener = match TcpListener::bind(&listen).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("cannot bind hub control listener on {}: {}", listen, e);
            return EXIT_FATAL;
        }
    };

    let hub = match Hub::new(config, store, blobs) {
        Ok(hub) => Arc::new(hub),
        Err(e) => {
            tracing::error!("cannot initialize hub: {:?}", e);
            return EXIT_FATAL;
        }
    };

    tracing::info!("hub control listening on {}", listen);

    actix_rt::spawn(hub.clone().run_deadline_watcher());
    actix_rt::spawn(hub.clone().run_backup_scheduler());

    let server = create_hub_server(listener, acceptor, hub);

    match server.await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("hub server error: {}", e);
            EXIT_FATAL
        }
    }
}

async fn run_edge(config: EdgeConfig) -> i32 {
    let problems = config.validate();

    if !problems.is_empty() {
        for problem in &problems {
            tracing::error!("invalid configuration: {}", problem);
        }

        return EXIT_CONFIG;
    }

    let acceptor = match make_acceptor(&config.cert, &config.key) {
        Ok(acceptor) => acceptor,
        Err(e) => {
            tracing::error!("{e}");
            return EXIT_FATAL;
        }
    };

    let listen = format!("{}:{}", config.host, config.port);
    let voice_listen = format!("{}:{}", config.host, config.voice_port());

    let udp_socket = match UdpSocket::bind(&listen).await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            tracing::error!("cannot bind client voice socket on {}: {}", listen, e);
            return EXIT_FATAL;
        }
    };

    let cipher = config.cluster_secret.as_deref().map(PeerCipher::from_secret);

    let peers = match PeerTransport::bind(&voice_listen, cipher).await {
        Ok(peers) => Arc::new(peers),
        Err(e) => {
            tracing::error!("cannot bind peer voice socket on {}: {}", voice_listen, e);
            return EXIT_FATAL;
        }
    };

    let tcp_listener = match TcpListener::bind(&listen).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("cannot bind client listener on {}: {}", listen, e);
            return EXIT_FATAL;
        }
    };

    tracing::info!("edge listening on {} (peer voice on {})", listen, voice_listen);

    let state = Arc::new(RwLock::new(ServerState::new(udp_socket.clone())));

    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
    let hub_link = Arc::new(HubLink::new(config.clone(), events_tx.clone()));

    let edge = Arc::new(Edge {
        config: config.clone(),
        state: state.clone(),
        hub: hub_link,
        peers: peers.clone(),
        events_tx,
        started_at: Instant::now(),
    });

    actix_rt::spawn(edge::run_lifecycle(edge.clone(), events_rx));
    actix_rt::spawn(peers.run_receiver(state.clone()));

    let version = server_version();
    let protocol_version = version.version.unwrap_or_default();

    let udp_edge = edge.clone();
    actix_rt::spawn(async move {
        create_udp_server(protocol_version, udp_socket, udp_edge).await;
    });

    let clean_state = state.clone();
    let client_timeout = Duration::from_secs(config.client_timeout_secs);
    actix_rt::spawn(async move {
        clean_loop(clean_state, client_timeout).await;
    });

    let server = create_tcp_server(tcp_listener, acceptor, version, edge);

    match server.await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("edge server error: {}", e);
            EXIT_FATAL
        }
    }
}

fn validate_edge_config(config_path: Option<PathBuf>) -> i32 {
    let config: Result<EdgeConfig, String> = config::load(config_path.as_deref());

    match config {
        Ok(config) => {
            let problems = config.validate();

            if problems.is_empty() {
                println!("configuration ok");
                0
            } else {
                for problem in problems {
                    println!("invalid: {problem}");
                }

                EXIT_CONFIG
            }
        }
        Err(e) => {
            println!("invalid: {e}");
            EXIT_CONFIG
        }
    }
}

#[actix_rt::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();

    let code = match cli.command {
        Command::Hub {
            command: HubCommand::Start { config },
        } => run_hub(config).await,
        Command::Edge {
            command:
                EdgeCommand::Start {
                    config,
                    host,
                    port,
                    hub_host,
                    hub_port,
                },
        } => {
            let config: Result<EdgeConfig, String> = config::load(config.as_deref());

            match config {
                Ok(mut config) => {
                    if let Some(host) = host {
                        config.host = host;
                    }
                    if let Some(port) = port {
                        config.port = port;
                    }
                    if let Some(hub_host) = hub_host {
                        config.hub_host = hub_host;
                    }
                    if let Some(hub_port) = hub_port {
                        config.hub_port = hub_port;
                    }

                    run_edge(config).await
                }
                Err(e) => {
                    tracing::error!("{e}");
                    EXIT_CONFIG
                }
            }
        }
        Command::Edge {
            command: EdgeCommand::ValidateConfig { config },
        } => validate_edge_config(config),
        Command::Client {
            command:
                ClientCommand::Connect {
                    host,
                    port,
                    username,
                    password,
                    tokens,
                    force_tcp_voice,
                },
        } => {
            let options = testclient::ClientOptions {
                host,
                port,
                username,
                password,
                tokens,
                force_tcp_voice,
            };

            match testclient::run_client(options).await {
                Ok(()) => 0,
                Err(e) => {
                    tracing::error!("client error: {:?}", e);
                    EXIT_FATAL
                }
            }
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
}
