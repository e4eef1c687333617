//! Listener serving: one task per connected client, reading the source ring
//! from a private cursor, interleaving ICY metadata at the negotiated
//! cadence and migrating between a source and its fallback as their
//! activity changes.

use std::{
    net::SocketAddr,
    sync::{atomic::Ordering, Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};
use url::Url;

use crate::{
    config::BroadcastAuthType,
    http,
    icy::MetaFrame,
    mpeg,
    request::RequestInfo,
    response,
    ring::RingReader,
    server::{ClientSession, Server, Stats},
    source::Source,
    utils,
};

pub const LISTENER_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_META_INTERVAL: usize = 16000;
/// How long a caught-up reader naps before polling the ring again
const CATCHUP_SLEEP: Duration = Duration::from_millis(30);

pub struct Listener {
    /// `<remote_addr>:<requested path>`, stable across fallback migration
    pub key: String,
    pub source_path: String,
    pub remote_addr: SocketAddr,
    pub joined: DateTime<Utc>,
    /// Frame this listener last emitted, compared by Arc identity against
    /// the serving source's current frame
    pub current_meta_frame: Mutex<Arc<MetaFrame>>,
}

impl Listener {
    pub fn new(remote_addr: SocketAddr, source_path: String) -> Self {
        Listener {
            key: format!("{}:{}", remote_addr, source_path),
            source_path,
            remote_addr,
            joined: Utc::now(),
            current_meta_frame: Mutex::new(Arc::new(vec![0])),
        }
    }
}

/// Insertion-ordered set of the listeners currently served from a source.
/// Membership changes keep the global listener gauge in step, under the
/// same lock so the count can never drift negative.
pub struct ListenerSet {
    inner: Mutex<Vec<Arc<Listener>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        ListenerSet {
            inner: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, lr: &Arc<Listener>, stats: &Stats) {
        let mut listeners = self.inner.lock().expect("listener set lock poisoned");
        stats.listeners_count.fetch_add(1, Ordering::Relaxed);
        listeners.push(lr.clone());
    }

    /// Idempotent: removing a listener that is not in the set is a no-op
    pub fn remove(&self, lr: &Arc<Listener>, stats: &Stats) -> bool {
        let mut listeners = self.inner.lock().expect("listener set lock poisoned");
        match listeners.iter().position(|other| Arc::ptr_eq(other, lr)) {
            Some(i) => {
                listeners.remove(i);
                stats.listeners_count.fetch_sub(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<Listener>> {
        self.inner.lock().expect("listener set lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("listener set lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ListenerSet {
    fn default() -> Self {
        Self::new()
    }
}

fn extract_token(info: &RequestInfo) -> Option<String> {
    if let Some(token) = utils::query_val("token", &info.queries) {
        return Some(token.to_string());
    }
    if let Some(token) = utils::get_header("X-Flamecast-Token", &info.headers) {
        return std::str::from_utf8(token).ok().map(str::to_string);
    }
    let auth = utils::get_header("Authorization", &info.headers)?;
    let auth = std::str::from_utf8(auth).ok()?;
    auth.strip_prefix("Token ").map(|token| token.trim().to_string())
}

async fn check_token(token: &str, lr: &Listener, check_url: &Url) -> bool {
    debug!("checking token \"{}\" for listener {}", token, lr.key);
    let body = serde_json::json!({
        "token": token,
        "listener": {
            "remote_addr": lr.remote_addr.to_string(),
            "key": lr.key,
        },
        "source": {
            "path": lr.source_path,
        },
    });
    let body = match serde_json::to_vec(&body) {
        Ok(body) => body,
        Err(_) => return false,
    };

    match http::post_json(check_url, &body).await {
        Ok((200, headers)) => {
            let user = utils::get_header("flamecast-auth-user", &headers)
                .or_else(|| utils::get_header("icecast-auth-user", &headers));
            user == Some(&b"1"[..])
        }
        Ok(_) => false,
        Err(e) => {
            error!("error getting response for token check: {}", e);
            false
        }
    }
}

/// Fires an enter/leave webhook on a detached task; failures are logged and
/// never affect the listener
fn listener_notify(url: Option<&Url>, source_path: &str, key: &str, kind: &'static str) {
    let Some(url) = url else { return };
    let mut url = url.clone();
    url.query_pairs_mut()
        .append_pair("source", source_path)
        .append_pair("listener", key);
    let key = key.to_string();

    tokio::spawn(async move {
        match http::get(&url, "").await {
            Ok(mut stream) => {
                let code = http::ResponseReader::new(&mut stream, http::RESPONSE_MAX_LEN)
                    .read_headers()
                    .await
                    .ok()
                    .and_then(|head| http::parse_response_head(&head).ok())
                    .map(|(code, _)| code);
                debug!("listener {} {} notify, status_code = {:?}", key, kind, code);
            }
            Err(e) => error!("error requesting listener notify url: {}", e),
        }
    });
}

pub async fn handle(
    mut session: ClientSession,
    info: RequestInfo,
    mountpoint: String,
) -> Result<()> {
    let server = session.server.clone();
    let sid = &server.server_id;

    let source = match server.sources.get(&mountpoint) {
        Some(source) => source.clone(),
        None => {
            response::not_found(&mut session.stream, sid).await?;
            return Ok(());
        }
    };
    let fallback = source
        .config
        .fallback_path
        .as_deref()
        .and_then(|path| server.sources.get(path))
        .cloned();

    let lr = Arc::new(Listener::new(session.addr, mountpoint.clone()));

    if source.config.broadcast_auth == BroadcastAuthType::Token {
        let accepted = match (extract_token(&info), source.config.token_check_url.as_ref()) {
            (Some(token), Some(check_url)) => check_token(&token, &lr, check_url).await,
            (None, _) => {
                error!("listener {} at source {} has no token, rejecting", lr.key, mountpoint);
                false
            }
            _ => false,
        };
        if !accepted {
            response::authentication_needed(&mut session.stream, sid).await?;
            return Ok(());
        }
    }

    server
        .stats
        .listener_connections
        .fetch_add(1, Ordering::Relaxed);
    info!("SOURCE \"{}\": listener {} has joined", mountpoint, lr.key);
    listener_notify(source.config.notify_enter_url.as_ref(), &mountpoint, &lr.key, "enter");

    let (current, is_alt) = if source.is_active() {
        (source.clone(), false)
    } else {
        match &fallback {
            Some(alt) if alt.is_active() => {
                info!(
                    "SOURCE \"{}\": listener {} started with fallback stream",
                    mountpoint, lr.key
                );
                (alt.clone(), true)
            }
            _ => {
                response::not_found(&mut session.stream, sid).await?;
                error!(
                    "SOURCE \"{}\": listener {} dropped as source is not active and there's no alternative",
                    mountpoint, lr.key
                );
                return Ok(());
            }
        }
    };

    let reader = current.buffer.reader(current.buffer.mid_point());
    current.listeners.add(&lr, &server.stats);

    let metaint = match utils::get_header("Icy-MetaData", &info.headers) {
        Some(b"1") => DEFAULT_META_INTERVAL,
        _ => 0,
    };

    let served = serve(&mut session, &server, &source, fallback.as_ref(), &lr, reader, is_alt, metaint).await;
    if served.is_err() {
        info!("SOURCE \"{}\": listener {} has gone", mountpoint, lr.key);
    }

    // The listener may sit in either set after migrations; clear both
    source.listeners.remove(&lr, &server.stats);
    if let Some(alt) = &fallback {
        alt.listeners.remove(&lr, &server.stats);
    }
    listener_notify(source.config.notify_leave_url.as_ref(), &mountpoint, &lr.key, "leave");

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn serve(
    session: &mut ClientSession,
    server: &Server,
    source: &Arc<Source>,
    fallback: Option<&Arc<Source>>,
    lr: &Arc<Listener>,
    mut reader: RingReader,
    mut is_alt: bool,
    metaint: usize,
) -> Result<()> {
    let desc = source.stream_desc();
    let content_type = source.content_type();
    response::ok_200_stream(
        &mut session.stream,
        &server.server_id,
        &desc,
        &content_type,
        (metaint > 0).then_some(metaint),
    )
    .await?;

    let zero_frame: Arc<MetaFrame> = Arc::new(vec![0]);
    let mut buf = [0u8; LISTENER_BUFFER_SIZE];
    let mut synced = false;
    let mut meta_ptr = 0usize;

    loop {
        if is_alt {
            let alt = match fallback {
                Some(alt) => alt,
                None => break,
            };
            if source.is_active() {
                info!(
                    "SOURCE \"{}\": source got active, moving listener {} back from fallback",
                    lr.source_path, lr.key
                );
                reader = source.buffer.reader(source.buffer.mid_point());
                synced = false;
                is_alt = false;
                alt.listeners.remove(lr, &server.stats);
                source.listeners.add(lr, &server.stats);
            } else if !alt.is_active() {
                error!(
                    "SOURCE \"{}\": no more active sources for listener {}, giving up",
                    lr.source_path, lr.key
                );
                break;
            }
        } else if !source.is_active() {
            match fallback {
                Some(alt) if alt.is_active() => {
                    info!(
                        "SOURCE \"{}\": source has stopped, moving listener {} to fallback",
                        lr.source_path, lr.key
                    );
                    source.listeners.remove(lr, &server.stats);
                    alt.listeners.add(lr, &server.stats);
                    reader = alt.buffer.reader(alt.buffer.mid_point());
                    synced = false;
                    is_alt = true;
                }
                _ => {
                    info!(
                        "SOURCE \"{}\": source has stopped, no alternative, giving up with listener {}",
                        lr.source_path, lr.key
                    );
                    break;
                }
            }
        }

        let n = match reader.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                error!(
                    "SOURCE \"{}\": error reading source buffer: {}",
                    lr.source_path, e
                );
                break;
            }
        };

        if n == 0 {
            session.stream.flush().await?;
            tokio::time::sleep(CATCHUP_SLEEP).await;
            continue;
        }

        let mut chunk = &buf[..n];
        if !synced {
            match mpeg::frame_sync(chunk) {
                Some(offset) => {
                    chunk = &chunk[offset..];
                    synced = true;
                }
                None => {
                    error!(
                        "SOURCE \"{}\": no frame to sync to for listener {}",
                        lr.source_path, lr.key
                    );
                    break;
                }
            }
        }

        if metaint > 0 {
            let remaining = metaint - meta_ptr;
            if chunk.len() <= remaining {
                session.stream.write_all(chunk).await?;
                meta_ptr += chunk.len();
            } else {
                let current = if is_alt {
                    fallback.unwrap_or(source)
                } else {
                    source
                };
                let frame = next_meta_frame(current, lr, &zero_frame);

                session.stream.write_all(&chunk[..remaining]).await?;
                session.stream.write_all(&frame).await?;
                session.stream.write_all(&chunk[remaining..]).await?;
                meta_ptr = chunk.len() - remaining;
            }
        } else {
            session.stream.write_all(chunk).await?;
        }
    }

    Ok(())
}

/// Picks the frame for the next interleave point: the serving source's
/// frame once after each installation, the one-byte zero frame otherwise
fn next_meta_frame(
    current: &Source,
    lr: &Listener,
    zero_frame: &Arc<MetaFrame>,
) -> Arc<MetaFrame> {
    let source_frame = current.current_meta_frame();
    let mut emitted = lr
        .current_meta_frame
        .lock()
        .expect("listener metadata frame lock poisoned");
    if Arc::ptr_eq(&source_frame, &emitted) {
        zero_frame.clone()
    } else {
        *emitted = source_frame.clone();
        source_frame
    }
}
