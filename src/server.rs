use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, AtomicUsize},
        Arc,
    },
};

use hashbrown::HashMap;
use tokio::{
    io::{AsyncRead, AsyncWrite, BufStream},
    net::{TcpListener, TcpStream},
};
use tracing::{error, info};

use crate::{
    api,
    config::{Config, SERVER_ID},
    listener, puller,
    request::{self, RequestKind},
    response,
    source::{self, Source},
};

pub trait Socket: Send + Sync + AsyncRead + AsyncWrite + Unpin {}
impl Socket for BufStream<TcpStream> {}
impl Socket for BufStream<tokio_native_tls::TlsStream<TcpStream>> {}
pub type Stream = Box<dyn Socket>;

/// Process-wide counters, icecast-flavored
pub struct Stats {
    /// Listener connections since startup (accumulating counter)
    pub listener_connections: AtomicU64,
    /// Push feeder connections since startup (accumulating counter)
    pub feeder_connections: AtomicU64,
    /// Upstream pull connections since startup (accumulating counter)
    pub puller_connections: AtomicU64,
    /// Currently connected listeners across all sources (gauge)
    pub listeners_count: AtomicUsize,
}

impl Stats {
    pub fn new() -> Self {
        Stats {
            listener_connections: AtomicU64::new(0),
            feeder_connections: AtomicU64::new(0),
            puller_connections: AtomicU64::new(0),
            listeners_count: AtomicUsize::new(0),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// Struct holding all info related to the server
pub struct Server {
    pub config: Config,
    /// Source catalog keyed by mount path, fixed at boot
    pub sources: HashMap<String, Arc<Source>>,
    pub stats: Stats,
    pub server_id: String,
    pub host: String,
}

/// A client session
pub struct ClientSession {
    /// Server info
    pub server: Arc<Server>,
    /// Socket of this client session
    pub stream: Stream,
    /// Address of our peer
    pub addr: SocketAddr,
}

async fn handle_connection(mut session: ClientSession) {
    let parsed = request::read_request(&mut session).await;
    let (info, kind) = match parsed {
        Ok(v) => v,
        Err(e) => {
            let sid = session.server.server_id.clone();
            response::method_not_allowed(&mut session.stream, &sid).await.ok();
            info!("request coming from {} couldn't be handled: {}", session.addr, e);
            return;
        }
    };

    match kind {
        RequestKind::Stats => api::handle_stats(session).await,
        RequestKind::AdminMetadata => api::handle_admin_metadata(session, info).await,
        RequestKind::Feed { mountpoint } => source::handle_feed(session, info, mountpoint).await,
        RequestKind::Listen { mountpoint } => listener::handle(session, info, mountpoint).await,
    }
    .ok();
}

async fn accept_connections(serv: Arc<Server>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let serv = serv.clone();
                tokio::spawn(async move {
                    handle_connection(ClientSession {
                        server: serv,
                        // Buffered socket to reduce syscalls on the byte path
                        stream: Box::new(BufStream::new(stream)),
                        addr,
                    })
                    .await;
                });
            }
            Err(e) => {
                error!("failed to accept connection: {}", e);
            }
        }
    }
}

async fn bind(addr: &str) -> TcpListener {
    // A bare ":8000" means every interface
    let addr = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };

    match TcpListener::bind(&addr).await {
        Ok(v) => {
            info!("listening on {}", addr);
            v
        }
        Err(e) => {
            error!("binding to {} failed: {}", addr, e);
            std::process::exit(1);
        }
    }
}

/// Boots the catalog and serves until SIGINT
pub async fn run(config: Config) {
    let sources = config
        .sources
        .iter()
        .map(|(path, scfg)| (path.clone(), Arc::new(Source::new(scfg.clone()))))
        .collect();

    let serv = Arc::new(Server {
        host: config.host(),
        sources,
        stats: Stats::new(),
        server_id: SERVER_ID.to_string(),
        config,
    });

    puller::spawn_pullers(&serv);

    let listener = bind(&serv.config.bind).await;
    info!("server is starting");

    tokio::select! {
        _ = accept_connections(serv, listener) => {
            error!("accept loop abruptly exited, shutting down server");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }
}
