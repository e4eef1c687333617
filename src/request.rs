use std::time::Duration;

use anyhow::Result;
use httparse::Status;
use tokio::io::AsyncReadExt;

use crate::{
    server::{ClientSession, Stream},
    utils::{self, Query},
};

/// Max http request size in bytes sent by a client that we are willing to accept
pub const HTTP_MAX_LEN: usize = 8192;
/// Max time in millis we wait for a client to send its header
pub const HEADER_TIMEOUT_MS: u64 = 15000;
const MAX_HEADERS: usize = 64;

/// A fully parsed inbound request with owned header copies
pub struct RequestInfo {
    pub method: String,
    /// Request path with the query string stripped; catalog lookups are
    /// path-only
    pub path: String,
    pub queries: Vec<Query>,
    pub headers: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RequestKind {
    /// Push feeder mounting a stream
    Feed { mountpoint: String },
    /// Listener subscribing to a stream
    Listen { mountpoint: String },
    Stats,
    AdminMetadata,
}

async fn read_request_header(stream: &mut Stream, buf: &mut Vec<u8>, max_len: usize) -> Result<()> {
    let mut byte = [0; 1];
    while buf.windows(4).last() != Some(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(read) => {
                if read > 0 {
                    buf.push(byte[0]);
                    if buf.len() > max_len {
                        // Stop any potential attack
                        return Err(anyhow::Error::msg("header is too big"));
                    }
                } else {
                    break;
                }
            }
            Err(e) => return Err(anyhow::Error::from(e)),
        }
    }

    Ok(())
}

pub fn parse_request(headers_buf: &[u8]) -> Result<RequestInfo> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    if req.parse(headers_buf)? == Status::Partial {
        return Err(anyhow::Error::msg("received an incomplete request"));
    }

    let method = match req.method {
        Some(v) => v.to_string(),
        None => return Err(anyhow::Error::msg("request header has no method")),
    };
    let raw_path = match req.path {
        Some(v) => v,
        None => return Err(anyhow::Error::msg("request header has no path")),
    };

    let queries = utils::get_queries(raw_path);
    let path = utils::path_only(raw_path).to_string();
    let headers = req
        .headers
        .iter()
        .take_while(|header| !header.name.is_empty())
        .map(|header| (header.name.to_string(), header.value.to_vec()))
        .collect();

    Ok(RequestInfo {
        method,
        path,
        queries,
        headers,
    })
}

pub fn classify(info: &RequestInfo) -> Result<RequestKind> {
    match info.method.as_str() {
        // ICECAST protocol info: https://gist.github.com/ePirat/adc3b8ba00d85b7e3870
        "SOURCE" | "PUT" => Ok(RequestKind::Feed {
            mountpoint: info.path.clone(),
        }),
        "GET" => match info.path.as_str() {
            "/api/v1/stats" => Ok(RequestKind::Stats),
            "/admin/metadata" => Ok(RequestKind::AdminMetadata),
            _ => Ok(RequestKind::Listen {
                mountpoint: info.path.clone(),
            }),
        },
        _ => Err(anyhow::Error::msg("unknown method sent by client")),
    }
}

pub async fn read_request(session: &mut ClientSession) -> Result<(RequestInfo, RequestKind)> {
    let mut headers_buf = Vec::new();
    tokio::time::timeout(
        Duration::from_millis(HEADER_TIMEOUT_MS),
        read_request_header(&mut session.stream, &mut headers_buf, HTTP_MAX_LEN),
    )
    .await??;

    if headers_buf.is_empty() {
        return Err(anyhow::Error::msg("connection closed before any request"));
    }

    let info = parse_request(&headers_buf)?;
    let kind = classify(&info)?;
    Ok((info, kind))
}
