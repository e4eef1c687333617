//! Pull ingest: for every PULL-type source a background task opens a
//! long-lived GET against the upstream Icecast-compatible server, splits
//! inline metadata off the byte stream and keeps the source ring fed.

use std::sync::{atomic::Ordering, Arc};

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use url::Url;

use crate::{
    config::SourceType,
    http,
    icy::{self, IcyReader},
    server::Server,
    source::{self, Source, BLOCKS_UNTIL_ACTIVE, DATA_BUFFER_SIZE},
};

/// Connection attempts before a pull source gives up for good
pub const PULL_RETRIES_MAX: u32 = 5;
/// Pause between attempts so a restarting upstream gets a chance to come back
const PULL_RETRY_DELAY_MS: u64 = 1000;

pub fn spawn_pullers(server: &Arc<Server>) {
    for source in server.sources.values() {
        if source.config.kind == SourceType::Pull {
            info!("starting puller task for source {}", source.config.path);
            tokio::spawn(pull_source(server.clone(), source.clone()));
        }
    }
}

async fn pull_source(server: Arc<Server>, source: Arc<Source>) {
    let path = source.config.path.clone();
    let url = match source.config.pull_url.clone() {
        Some(url) => url,
        None => {
            // The config loader guarantees a URL for PULL sources
            error!("no pull url for source {}", path);
            return;
        }
    };

    let mut retries_left = PULL_RETRIES_MAX;
    while retries_left > 0 {
        if let Err(e) = pull_once(&server, &source, &url).await {
            error!("error pulling source {}: {}", path, e);
            source.deactivate();
            retries_left -= 1;
            tokio::time::sleep(std::time::Duration::from_millis(PULL_RETRY_DELAY_MS)).await;
        }
    }

    source.deactivate();
    error!("source puller for {} exhausted its retries, giving up", path);
}

/// One upstream connection, streaming until the upstream fails
async fn pull_once(server: &Arc<Server>, source: &Arc<Source>, url: &Url) -> Result<()> {
    let mut stream = http::get(url, "Icy-MetaData: 1\r\n").await?;
    let head = http::ResponseReader::new(&mut stream, http::RESPONSE_MAX_LEN)
        .read_headers()
        .await?;
    let (code, headers) = http::parse_response_head(&head)?;
    if code != 200 {
        return Err(anyhow::Error::msg(format!(
            "upstream answered with status {}",
            code
        )));
    }

    server
        .stats
        .puller_connections
        .fetch_add(1, Ordering::Relaxed);
    info!("source puller for {} connected", source.config.path);

    let meta_interval = http::header_usize("icy-metaint", &headers).unwrap_or(0);
    {
        let mut desc = source.stream.write().expect("stream descriptor lock poisoned");
        source::populate_stream_desc(&mut desc, &headers);
    }
    if let Some(content_type) = crate::utils::get_header("Content-Type", &headers) {
        if let Ok(content_type) = std::str::from_utf8(content_type) {
            *source.content_type.lock().expect("content type lock poisoned") =
                content_type.to_string();
        }
    }

    let (frame_tx, mut frame_rx) = mpsc::channel(1);
    let mut reader = IcyReader::new(stream, meta_interval, frame_tx);

    let mut buf = [0u8; DATA_BUFFER_SIZE];
    let mut blocks = 0u32;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(anyhow::Error::msg("reached end of upstream stream"));
        }
        source.buffer.write(&buf[..n]);

        if !source.is_active() {
            blocks += 1;
            if blocks >= BLOCKS_UNTIL_ACTIVE {
                source.activate();
                info!("SOURCE \"{}\": went active", source.config.path);
            }
        }

        if let Ok(frame) = frame_rx.try_recv() {
            match icy::parse(&frame) {
                Ok(meta) => source::set_source_metadata(source, meta),
                Err(e) => warn!(
                    "SOURCE \"{}\": dropping unparseable metadata frame: {}",
                    source.config.path, e
                ),
            }
        }
    }
}
