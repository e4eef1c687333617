//! Outbound HTTP plumbing for pull ingest, token checks and notify webhooks.
//! Requests are written by hand over a raw (optionally TLS) socket and the
//! response head is parsed with httparse, like everything else here.

use anyhow::Result;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufStream},
    net::TcpStream,
};
use tokio_native_tls::native_tls::TlsConnector;
use url::Url;

use crate::{config::SERVER_ID, server::Stream, utils::get_header};

/// Max http response head size we accept from a remote server
pub const RESPONSE_MAX_LEN: usize = 16384;

pub async fn connect(url: &Url) -> Result<Stream> {
    let host = match url.host_str() {
        Some(host) => host.to_string(),
        None => return Err(anyhow::Error::msg(format!("url {} missing hostname", url))),
    };
    let port = match url.port_or_known_default() {
        Some(port) => port,
        None => return Err(anyhow::Error::msg(format!("url {} has no port", url))),
    };

    let stream = TcpStream::connect(format!("{}:{}", host, port)).await?;
    let stream = if url.scheme().eq("https") {
        let cx = tokio_native_tls::TlsConnector::from(TlsConnector::builder().build()?);
        Box::new(BufStream::new(cx.connect(&host, stream).await?))
    } else {
        Box::new(BufStream::new(stream)) as Stream
    };

    Ok(stream)
}

fn path_and_query(url: &Url) -> String {
    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }
    path
}

pub async fn get(url: &Url, extra_headers: &str) -> Result<Stream> {
    let mut stream = connect(url).await?;
    stream
        .write_all(
            format!(
                "GET {} HTTP/1.1\r\n\
Host: {}\r\n\
User-Agent: {}\r\n{}\
Connection: close\r\n\r\n",
                path_and_query(url),
                url.host_str().unwrap_or_default(),
                SERVER_ID,
                extra_headers
            )
            .as_bytes(),
        )
        .await?;
    stream.flush().await?;

    Ok(stream)
}

/// POSTs a JSON body and returns the response status with owned headers
pub async fn post_json(url: &Url, body: &[u8]) -> Result<(u16, Vec<(String, Vec<u8>)>)> {
    let mut stream = connect(url).await?;
    stream
        .write_all(
            format!(
                "POST {} HTTP/1.1\r\n\
Host: {}\r\n\
User-Agent: {}\r\n\
Content-Type: application/json\r\n\
Content-Length: {}\r\n\
Connection: close\r\n\r\n",
                path_and_query(url),
                url.host_str().unwrap_or_default(),
                SERVER_ID,
                body.len()
            )
            .as_bytes(),
        )
        .await?;
    stream.write_all(body).await?;
    stream.flush().await?;

    let head = ResponseReader::new(&mut stream, RESPONSE_MAX_LEN)
        .read_headers()
        .await?;
    parse_response_head(&head)
}

pub struct ResponseReader<'a> {
    stream: &'a mut Stream,
    http_max_len: usize,
}

impl<'a> ResponseReader<'a> {
    pub fn new(stream: &'a mut Stream, http_max_len: usize) -> Self {
        Self { stream, http_max_len }
    }

    /// Read the response head only and return its buffer
    pub async fn read_headers(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut byte = [0; 1];
        loop {
            match self.stream.read(&mut byte).await {
                Ok(0) => return Err(anyhow::Error::msg("connection closed before response head")),
                Ok(_) => {
                    buf.extend_from_slice(&byte);
                    if buf.len() >= 4 && buf[buf.len() - 4..].eq(b"\r\n\r\n") {
                        break;
                    } else if buf.len() > self.http_max_len {
                        // Stop any potential attack
                        return Err(anyhow::Error::msg("long header"));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(buf)
    }
}

pub fn parse_response_head(head: &[u8]) -> Result<(u16, Vec<(String, Vec<u8>)>)> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut resp = httparse::Response::new(&mut headers);

    match resp.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(anyhow::Error::msg("incomplete response")),
        Err(e) => return Err(e.into()),
    };

    let code = match resp.code {
        Some(code) => code,
        None => return Err(anyhow::Error::msg("response has no status code")),
    };

    let headers = resp
        .headers
        .iter()
        .take_while(|header| !header.name.is_empty())
        .map(|header| (header.name.to_string(), header.value.to_vec()))
        .collect();

    Ok((code, headers))
}

/// Numeric header convenience for icy response headers
pub fn header_usize(key: &str, headers: &[(String, Vec<u8>)]) -> Option<usize> {
    let value = get_header(key, headers)?;
    std::str::from_utf8(value).ok()?.parse().ok()
}
