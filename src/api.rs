//! Stats snapshot and the Icecast-compatible out-of-band metadata update.

use std::sync::atomic::Ordering;

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::{
    icy::MetaData,
    request::RequestInfo,
    response,
    server::ClientSession,
    source::{self, Source},
    utils,
};

#[derive(Serialize)]
struct ListenerDesc {
    key: String,
    joined_at: String,
    remote_addr: String,
}

#[derive(Serialize)]
struct SourceDesc {
    active: bool,
    path: String,
    name: String,
    public: bool,
    site: String,
    genre: String,
    description: String,
    bitrate: u32,
    audio_info: String,
    #[serde(rename = "type")]
    kind: &'static str,
    started: String,
    content_type: String,
    current_meta: MetaData,
    listeners: Vec<ListenerDesc>,
}

/// Server stats close to what the icecast stats handler provides
#[derive(Serialize)]
struct StatsData {
    admin: String,
    host: String,
    listener_connections: u64,
    feeder_connections: u64,
    puller_connections: u64,
    listeners_count: usize,
    server_id: String,
    sources_count: usize,
    sources: Vec<SourceDesc>,
}

fn describe_source(path: &str, source: &Source) -> SourceDesc {
    let desc = source.stream_desc();
    let listeners = source
        .listeners
        .snapshot()
        .iter()
        .map(|lr| ListenerDesc {
            key: lr.key.clone(),
            joined_at: lr.joined.to_rfc3339(),
            remote_addr: lr.remote_addr.to_string(),
        })
        .collect();

    SourceDesc {
        active: source.is_active(),
        path: path.to_string(),
        name: desc.name,
        public: desc.public,
        site: desc.site,
        genre: desc.genre,
        description: desc.description,
        bitrate: desc.bitrate,
        audio_info: desc.audio_info,
        kind: source.config.kind.as_str(),
        started: match source.started_at() {
            Some(started) => started.to_rfc3339(),
            None => String::new(),
        },
        content_type: source.content_type(),
        current_meta: source.current_meta.lock().expect("metadata lock poisoned").clone(),
        listeners,
    }
}

pub async fn handle_stats(mut session: ClientSession) -> Result<()> {
    let server = session.server.clone();
    let sid = &server.server_id;

    let mut sources: Vec<SourceDesc> = server
        .sources
        .iter()
        .map(|(path, source)| describe_source(path, source))
        .collect();
    sources.sort_by(|a, b| a.path.cmp(&b.path));

    let stats = StatsData {
        admin: server.config.admin.clone(),
        host: server.host.clone(),
        listener_connections: server.stats.listener_connections.load(Ordering::Relaxed),
        feeder_connections: server.stats.feeder_connections.load(Ordering::Relaxed),
        puller_connections: server.stats.puller_connections.load(Ordering::Relaxed),
        listeners_count: server.stats.listeners_count.load(Ordering::Relaxed),
        server_id: server.server_id.clone(),
        sources_count: server.sources.len(),
        sources,
    };

    match serde_json::to_vec(&stats) {
        Ok(body) => response::ok_200_json_body(&mut session.stream, sid, &body).await,
        Err(_) => response::internal_error(&mut session.stream, sid).await,
    }
}

/// `GET /admin/metadata?mount=<path>&mode=updinfo&song=<title>` guarded by
/// the source's feeder credentials
pub async fn handle_admin_metadata(mut session: ClientSession, info: RequestInfo) -> Result<()> {
    let server = session.server.clone();
    let sid = &server.server_id;

    let mount = match utils::query_val("mount", &info.queries) {
        Some(mount) => mount,
        None => {
            response::bad_request(&mut session.stream, sid, "mount param is missing").await?;
            return Ok(());
        }
    };
    let source = match server.sources.get(mount) {
        Some(source) => source.clone(),
        None => {
            response::not_found(&mut session.stream, sid).await?;
            return Ok(());
        }
    };

    match utils::basic_auth_token(&info.headers) {
        Some(token) if token == source.config.auth_token => {}
        _ => {
            response::authentication_needed(&mut session.stream, sid).await?;
            return Ok(());
        }
    }

    match utils::query_val("mode", &info.queries) {
        Some("updinfo") => {}
        Some(_) => {
            response::bad_request(&mut session.stream, sid, "mode param is invalid").await?;
            return Ok(());
        }
        None => {
            response::bad_request(&mut session.stream, sid, "mode param is missing").await?;
            return Ok(());
        }
    }
    let song = match utils::query_val("song", &info.queries) {
        Some(song) => song,
        None => {
            response::bad_request(&mut session.stream, sid, "song param is missing").await?;
            return Ok(());
        }
    };

    let mut meta = MetaData::new();
    meta.insert("StreamTitle".to_string(), song.to_string());
    source::set_source_metadata(&source, meta);

    response::ok_200_body(&mut session.stream, sid, "metadata changed").await?;
    info!("updated mountpoint metadata for {}", mount);

    Ok(())
}
