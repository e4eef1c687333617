use std::time::SystemTime;

use anyhow::Result;
use httpdate::fmt_http_date;
use tokio::io::AsyncWriteExt;

use crate::{config::StreamDescription, server::Stream};

async fn server_info(stream: &mut Stream, server_id: &str) -> Result<()> {
    stream
        .write_all(
            format!(
                "Server: {}\r\n\
Date: {}\r\n\
Cache-Control: no-cache, no-store\r\n\
Expires: Mon, 26 Jul 1997 05:00:00 GMT\r\n\
Pragma: no-cache\r\n\
Access-Control-Allow-Origin: *\r\n\r\n",
                server_id,
                fmt_http_date(SystemTime::now())
            )
            .as_bytes(),
        )
        .await?;

    stream.flush().await?;
    Ok(())
}

pub async fn method_not_allowed(stream: &mut Stream, server_id: &str) -> Result<()> {
    stream
        .write_all(
            b"HTTP/1.1 405 Method Not Allowed\r\n\
Connection: close\r\n",
        )
        .await?;

    server_info(stream, server_id).await?;
    Ok(())
}

pub async fn not_found(stream: &mut Stream, server_id: &str) -> Result<()> {
    stream
        .write_all(
            b"HTTP/1.1 404 Not Found\r\n\
Connection: close\r\n",
        )
        .await?;

    server_info(stream, server_id).await?;
    Ok(())
}

pub async fn authentication_needed(stream: &mut Stream, server_id: &str) -> Result<()> {
    stream
        .write_all(
            b"HTTP/1.1 401 Authorization Required\r\n\
WWW-Authenticate: Basic realm=\"Flamecast Server\"\r\n\
Connection: close\r\n",
        )
        .await?;

    server_info(stream, server_id).await?;
    Ok(())
}

pub async fn conflict(stream: &mut Stream, server_id: &str, message: &str) -> Result<()> {
    stream
        .write_all(
            format!(
                "HTTP/1.1 409 Conflict\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Length: {}\r\n\
Connection: close\r\n",
                message.len()
            )
            .as_bytes(),
        )
        .await?;

    server_info(stream, server_id).await?;
    stream.write_all(message.as_bytes()).await?;
    stream.flush().await?;

    Ok(())
}

pub async fn bad_request(stream: &mut Stream, server_id: &str, message: &str) -> Result<()> {
    stream
        .write_all(
            format!(
                "HTTP/1.1 400 Bad Request\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Length: {}\r\n\
Connection: close\r\n",
                message.len()
            )
            .as_bytes(),
        )
        .await?;

    server_info(stream, server_id).await?;
    stream.write_all(message.as_bytes()).await?;
    stream.flush().await?;

    Ok(())
}

pub async fn internal_error(stream: &mut Stream, server_id: &str) -> Result<()> {
    stream
        .write_all(
            b"HTTP/1.1 500 Internal Server Error\r\n\
Connection: close\r\n",
        )
        .await?;

    server_info(stream, server_id).await?;
    Ok(())
}

pub async fn ok_200_body(stream: &mut Stream, server_id: &str, body: &str) -> Result<()> {
    stream
        .write_all(
            format!(
                "HTTP/1.1 200 OK\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Length: {}\r\n\
Connection: close\r\n",
                body.len()
            )
            .as_bytes(),
        )
        .await?;

    server_info(stream, server_id).await?;
    stream.write_all(body.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn ok_200_json_body(stream: &mut Stream, server_id: &str, body: &[u8]) -> Result<()> {
    stream
        .write_all(
            format!(
                "HTTP/1.1 200 OK\r\n\
Connection: close\r\n\
Content-Length: {}\r\n\
Content-Type: application/json; charset=utf-8\r\n",
                body.len()
            )
            .as_bytes(),
        )
        .await?;

    server_info(stream, server_id).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

/// Minimal ack a feeder expects before it starts streaming
pub async fn feed_start(stream: &mut Stream) -> Result<()> {
    stream.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await?;
    stream.flush().await?;
    Ok(())
}

/// Listener response head carrying the icy stream descriptors. `metaint` is
/// only announced when the client asked for inline metadata.
pub async fn ok_200_stream(
    stream: &mut Stream,
    server_id: &str,
    desc: &StreamDescription,
    content_type: &str,
    metaint: Option<usize>,
) -> Result<()> {
    stream
        .write_all(
            format!(
                "HTTP/1.1 200 OK\r\n\
Connection: close\r\n\
Content-Type: {}\r\n\
icy-br: {}\r\n\
ice-audio-info: {}\r\n\
icy-description: {}\r\n\
icy-name: {}\r\n\
icy-genre: {}\r\n\
icy-pub: {}\r\n\
icy-url: {}\r\n",
                content_type,
                desc.bitrate,
                desc.audio_info,
                desc.description,
                desc.name,
                desc.genre,
                desc.public as usize,
                desc.site,
            )
            .as_bytes(),
        )
        .await?;

    if let Some(metaint) = metaint {
        stream
            .write_all(format!("icy-metaint: {}\r\n", metaint).as_bytes())
            .await?;
    }

    server_info(stream, server_id).await?;
    Ok(())
}
