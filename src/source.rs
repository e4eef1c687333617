use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tracing::{error, info};

use crate::{
    config::{SourceConfig, StreamDescription},
    icy::{self, MetaData, MetaFrame},
    listener::ListenerSet,
    request::RequestInfo,
    response,
    ring::RingBuffer,
    server::ClientSession,
    utils,
};

/// Ingest read block size
pub const DATA_BUFFER_SIZE: usize = 4096;
/// Ring writes before a source is considered live
pub const BLOCKS_UNTIL_ACTIVE: u32 = 4;
/// Ring capacity per source
pub const SOURCE_BUFFER_SIZE: usize = 512 * 1024;
/// Max time in millis we wait for a feeder to produce the next block
pub const SOURCE_TIMEOUT_MS: u64 = 10000;

pub const DEFAULT_CONTENT_TYPE: &str = "audio/mpeg";

/// Runtime state of one mount point. Created at boot from its config entry
/// and alive for the process lifetime; the ingest driver is the only writer
/// to the ring, the activity flag and the metadata frame.
pub struct Source {
    pub config: Arc<SourceConfig>,
    /// Stream descriptors, overwritten by ingest from `Ice-*`/`icy-*` headers
    pub stream: RwLock<StreamDescription>,
    pub content_type: Mutex<String>,
    pub buffer: RingBuffer,
    pub current_meta: Mutex<MetaData>,
    /// Wire-ready metadata frame; listeners detect changes by comparing Arc
    /// identity against the frame they last emitted, so every installation
    /// allocates afresh
    pub current_meta_frame: Mutex<Arc<MetaFrame>>,
    pub listeners: ListenerSet,
    active: AtomicBool,
    started: AtomicI64,
}

impl Source {
    pub fn new(config: Arc<SourceConfig>) -> Self {
        Source {
            stream: RwLock::new(config.stream.clone()),
            content_type: Mutex::new(DEFAULT_CONTENT_TYPE.to_string()),
            buffer: RingBuffer::new(SOURCE_BUFFER_SIZE),
            current_meta: Mutex::new(MetaData::new()),
            current_meta_frame: Mutex::new(Arc::new(icy::render(&MetaData::new()))),
            listeners: ListenerSet::new(),
            active: AtomicBool::new(false),
            started: AtomicI64::new(0),
            config,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn activate(&self) {
        self.started.store(Utc::now().timestamp(), Ordering::Relaxed);
        self.active.store(true, Ordering::Relaxed);
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        if !self.is_active() {
            return None;
        }
        DateTime::from_timestamp(self.started.load(Ordering::Relaxed), 0)
    }

    pub fn stream_desc(&self) -> StreamDescription {
        self.stream.read().expect("stream descriptor lock poisoned").clone()
    }

    pub fn content_type(&self) -> String {
        self.content_type.lock().expect("content type lock poisoned").clone()
    }

    pub fn current_meta_frame(&self) -> Arc<MetaFrame> {
        self.current_meta_frame
            .lock()
            .expect("metadata frame lock poisoned")
            .clone()
    }
}

/// Renders and installs new metadata. The fresh allocation is what makes
/// listeners emit the frame exactly once each.
pub fn set_source_metadata(source: &Source, meta: MetaData) {
    let frame = icy::render(&meta);
    *source.current_meta.lock().expect("metadata lock poisoned") = meta;
    *source
        .current_meta_frame
        .lock()
        .expect("metadata frame lock poisoned") = Arc::new(frame);
}

/// Overwrites stream descriptors from feeder request or upstream response
/// headers. Alias header names per the Icecast lineage.
pub fn populate_stream_desc(desc: &mut StreamDescription, headers: &[(String, Vec<u8>)]) {
    for (name, value) in headers {
        let value = match std::str::from_utf8(value) {
            Ok(v) => v,
            Err(_) => continue,
        };
        match name.to_lowercase().as_str() {
            "ice-name" | "icy-name" => desc.name = value.to_string(),
            "ice-description" | "icy-description" => desc.description = value.to_string(),
            "ice-genre" | "icy-genre" => desc.genre = value.to_string(),
            "ice-url" | "icy-url" => desc.site = value.to_string(),
            "ice-public" | "icy-pub" => desc.public = parse_public(value),
            "ice-bitrate" | "icy-br" => {
                if let Ok(bitrate) = value.parse::<u32>() {
                    desc.bitrate = bitrate;
                    desc.audio_info = format!("br={}", bitrate);
                }
            }
            _ => (),
        }
    }
}

fn parse_public(value: &str) -> bool {
    !value.is_empty() && !matches!(value.to_lowercase().as_str(), "0" | "false" | "no")
}

/// Push ingest: a feeder holds the connection open and streams raw audio
/// which we block-copy into the source ring.
pub async fn handle_feed(
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
            info!("feeder {} tried unknown mount {}", session.addr, mountpoint);
            return Ok(());
        }
    };

    if source.is_active() {
        response::conflict(&mut session.stream, sid, "Mountpoint in use").await?;
        info!("feeder {} rejected, {} already active", session.addr, mountpoint);
        return Ok(());
    }

    match utils::basic_auth_token(&info.headers) {
        Some(token) if token == source.config.auth_token => {}
        _ => {
            response::authentication_needed(&mut session.stream, sid).await?;
            info!("feeder {} for {} with wrong authentication", session.addr, mountpoint);
            return Ok(());
        }
    }

    {
        let mut desc = source.stream.write().expect("stream descriptor lock poisoned");
        populate_stream_desc(&mut desc, &info.headers);
    }
    if let Some(content_type) = utils::get_header("Content-Type", &info.headers) {
        if let Ok(content_type) = std::str::from_utf8(content_type) {
            *source.content_type.lock().expect("content type lock poisoned") =
                content_type.to_string();
        }
    }

    server
        .stats
        .feeder_connections
        .fetch_add(1, Ordering::Relaxed);

    response::feed_start(&mut session.stream).await?;
    info!("SOURCE \"{}\": feeder {} connected", mountpoint, session.addr);

    let timeout = Duration::from_millis(SOURCE_TIMEOUT_MS);
    let mut buf = [0u8; DATA_BUFFER_SIZE];
    let mut blocks = 0u32;
    loop {
        let read = tokio::time::timeout(timeout, session.stream.read(&mut buf)).await;
        match read {
            Ok(Ok(n)) if n > 0 => {
                source.buffer.write(&buf[..n]);
                if !source.is_active() {
                    blocks += 1;
                    if blocks >= BLOCKS_UNTIL_ACTIVE {
                        source.activate();
                        info!("SOURCE \"{}\": went active", mountpoint);
                    }
                }
            }
            Ok(Ok(_)) => {
                info!("SOURCE \"{}\": feeder {} disconnected", mountpoint, session.addr);
                break;
            }
            Ok(Err(e)) => {
                error!("SOURCE \"{}\": feeder read failed: {}", mountpoint, e);
                break;
            }
            Err(_) => {
                error!("SOURCE \"{}\": feeder timed out", mountpoint);
                break;
            }
        }
    }

    source.deactivate();
    Ok(())
}
