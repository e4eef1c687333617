mod common;

use common::*;
use flamecast::utils::basic_auth;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

/// Upstream icecast stand-in: serves one ICY stream with `icy-metaint: 8192`
/// carrying a StreamTitle frame, then holds the connection open
async fn spawn_upstream(addr: &'static str) {
    let listener = TcpListener::bind(addr).await.expect("upstream bind");
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                // Consume the request head first
                let mut buf = Vec::new();
                let mut byte = [0u8; 1];
                while !buf.ends_with(b"\r\n\r\n") {
                    match stream.read(&mut byte).await {
                        Ok(n) if n > 0 => buf.push(byte[0]),
                        _ => return,
                    }
                }
                let request = String::from_utf8_lossy(&buf).to_string();
                assert!(request.to_lowercase().contains("icy-metadata: 1"));

                let head = "HTTP/1.0 200 OK\r\n\
Content-Type: audio/mpeg\r\n\
icy-metaint: 8192\r\n\
icy-name: Upstream FM\r\n\
icy-br: 192\r\n\r\n";
                if stream.write_all(head.as_bytes()).await.is_err() {
                    return;
                }

                let audio = mp3_frames(100);
                let mut meta = flamecast::icy::MetaData::new();
                meta.insert("StreamTitle".to_string(), "X".to_string());
                let frame = flamecast::icy::render(&meta);

                let mut payload = Vec::new();
                payload.extend_from_slice(&audio[..8192]);
                payload.extend_from_slice(&frame);
                payload.extend_from_slice(&audio[8192..16384]);
                payload.push(0);
                payload.extend_from_slice(&audio[16384..24576]);

                if stream.write_all(&payload).await.is_err() {
                    return;
                }
                stream.flush().await.ok();
                // Keep the stream mounted for the rest of the test
                tokio::time::sleep(ms(600_000)).await;
            });
        }
    });
}

#[tokio::test]
async fn pull_source_mounts_and_installs_upstream_metadata() {
    const ADDR: &str = "127.0.0.1:19301";
    spawn_upstream("127.0.0.1:19302").await;
    start_server(
        "
main.bind = 127.0.0.1:19301
sources.pulled.source.type = pull
sources.pulled.source.url = http://127.0.0.1:19302/stream
",
    )
    .await;
    tokio::time::sleep(ms(700)).await;

    let snapshot = stats(ADDR).await;
    let source = &snapshot["sources"][0];
    assert_eq!(source["path"], "/pulled");
    assert_eq!(source["type"], "pull");
    assert_eq!(source["active"], true);
    assert_eq!(source["name"], "Upstream FM");
    assert_eq!(source["bitrate"], 192);
    assert_eq!(source["current_meta"]["StreamTitle"], "X");
    assert_eq!(snapshot["puller_connections"], 1);

    // The relayed bytes a listener sees are pure audio, metadata stripped
    let (mut stream, head) = listen(ADDR, "/pulled", false).await;
    assert_eq!(status_of(&head), 200);
    let mut audio = vec![0u8; 8192];
    stream.read_exact(&mut audio).await.unwrap();
    assert_eq!(&audio[..4], &[0xFF, 0xFB, 0x90, 0x00]);
    for pos in (0..8192 - 4).step_by(FRAME_SIZE) {
        assert_eq!(&audio[pos..pos + 4], &[0xFF, 0xFB, 0x90, 0x00]);
    }
}

#[tokio::test]
async fn listener_migrates_to_fallback_and_back() {
    const ADDR: &str = "127.0.0.1:19311";
    start_server(
        "
main.bind = 127.0.0.1:19311
sources.a.source.type = push
sources.a.source.auth.password = hackme
sources.a.source.fallback = b
sources.b.source.type = push
sources.b.source.auth.password = hackme
",
    )
    .await;

    let auth = basic_auth("source", "hackme");
    let feeder_b = feed(ADDR, "/b", &auth, &mp3_frames(600)).await;
    let feeder_a = feed(ADDR, "/a", &auth, &mp3_frames(600)).await;
    tokio::time::sleep(ms(300)).await;

    let (stream, head) = listen(ADDR, "/a", false).await;
    assert_eq!(status_of(&head), 200);
    let _drain = drain(stream);
    tokio::time::sleep(ms(300)).await;

    let snapshot = stats(ADDR).await;
    assert_eq!(snapshot["sources"][0]["path"], "/a");
    assert_eq!(snapshot["sources"][0]["listeners"].as_array().unwrap().len(), 1);

    // Primary feeder goes away: the listener moves to the fallback set,
    // keeping its original key
    drop(feeder_a);
    tokio::time::sleep(ms(500)).await;

    let snapshot = stats(ADDR).await;
    assert_eq!(snapshot["sources"][0]["active"], false);
    assert!(snapshot["sources"][0]["listeners"].as_array().unwrap().is_empty());
    let moved = snapshot["sources"][1]["listeners"].as_array().unwrap();
    assert_eq!(moved.len(), 1);
    assert!(moved[0]["key"].as_str().unwrap().ends_with(":/a"));
    assert_eq!(snapshot["listeners_count"], 1);

    // Primary comes back and reaches active again: the listener returns
    let _feeder_a = feed(ADDR, "/a", &auth, &mp3_frames(600)).await;
    tokio::time::sleep(ms(500)).await;

    let snapshot = stats(ADDR).await;
    assert_eq!(snapshot["sources"][0]["active"], true);
    assert_eq!(snapshot["sources"][0]["listeners"].as_array().unwrap().len(), 1);
    assert!(snapshot["sources"][1]["listeners"].as_array().unwrap().is_empty());
    assert_eq!(snapshot["listeners_count"], 1);

    drop(feeder_b);
}
