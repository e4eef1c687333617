#![allow(dead_code)]

use std::time::Duration;

use flamecast::config::Config;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

/// Size of the fixture frames (MPEG1 Layer III, 128 kbit/s, 44100 Hz)
pub const FRAME_SIZE: usize = 417;

pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Generates `count` valid MP3 frames. The filler byte is distinguishable
/// from both frame-header bytes and the empty metadata frame.
pub fn mp3_frames(count: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(count * FRAME_SIZE);
    for _ in 0..count {
        data.extend_from_slice(&[0xFF, 0xFB, 0x90, 0x00]);
        data.extend_from_slice(&[0xAA; FRAME_SIZE - 4]);
    }
    data
}

/// Boots the server on the current runtime and waits for it to bind
pub async fn start_server(conf: &str) {
    let config = Config::parse(conf).expect("test config must parse");
    tokio::spawn(flamecast::server::run(config));
    tokio::time::sleep(ms(300)).await;
}

pub async fn connect(addr: &str) -> TcpStream {
    TcpStream::connect(addr).await.expect("server must accept")
}

/// Reads a response head up to and including the blank line
pub async fn read_head(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await.expect("read response head");
        assert!(n > 0, "connection closed while reading response head");
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
        assert!(buf.len() < 65536, "response head never terminated");
    }
    String::from_utf8_lossy(&buf).to_string()
}

pub fn status_of(head: &str) -> u16 {
    head.split_whitespace()
        .nth(1)
        .expect("status line")
        .parse()
        .expect("numeric status")
}

pub fn content_length(head: &str) -> Option<usize> {
    head.lines().find_map(|line| {
        let (key, val) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case("content-length") {
            val.trim().parse().ok()
        } else {
            None
        }
    })
}

/// One-shot GET returning the response head and (content-length) body
pub async fn http_get(addr: &str, path_and_query: &str, extra_headers: &str) -> (String, Vec<u8>) {
    let mut stream = connect(addr).await;
    let req = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\n{}\r\n",
        path_and_query, addr, extra_headers
    );
    stream.write_all(req.as_bytes()).await.unwrap();

    let head = read_head(&mut stream).await;
    let len = content_length(&head).unwrap_or(0);
    let mut body = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut body).await.expect("response body");
    }
    (head, body)
}

pub async fn stats(addr: &str) -> serde_json::Value {
    let (head, body) = http_get(addr, "/api/v1/stats", "").await;
    assert_eq!(status_of(&head), 200);
    serde_json::from_slice(&body).expect("stats must be json")
}

/// Opens a feeder connection, checks the ack and streams `data` into it.
/// The returned socket must be kept alive for the source to stay mounted.
pub async fn feed(addr: &str, mount: &str, auth_token: &str, data: &[u8]) -> TcpStream {
    let mut stream = connect(addr).await;
    let req = format!(
        "SOURCE {} HTTP/1.1\r\nHost: {}\r\nAuthorization: Basic {}\r\nContent-Type: audio/mpeg\r\n\r\n",
        mount, addr, auth_token
    );
    stream.write_all(req.as_bytes()).await.unwrap();

    let head = read_head(&mut stream).await;
    assert_eq!(status_of(&head), 200, "feeder not accepted: {}", head);

    stream.write_all(data).await.unwrap();
    stream.flush().await.unwrap();
    stream
}

/// Subscribes as a listener and returns the open socket plus response head
pub async fn listen(addr: &str, mount_and_query: &str, icy_meta: bool) -> (TcpStream, String) {
    let mut stream = connect(addr).await;
    let extra = if icy_meta { "Icy-MetaData: 1\r\n" } else { "" };
    let req = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\n{}\r\n",
        mount_and_query, addr, extra
    );
    stream.write_all(req.as_bytes()).await.unwrap();
    let head = read_head(&mut stream).await;
    (stream, head)
}

/// Keeps draining a listener socket so server-side writes never stall on
/// socket backpressure
pub fn drain(mut stream: TcpStream) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => (),
            }
        }
    })
}
