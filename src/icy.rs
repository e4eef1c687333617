//! ICY (Shoutcast) inline metadata.
//!
//! On the wire a metadata frame is one length byte `L` followed by `L * 16`
//! payload bytes; the payload is `KEY='VALUE';` pairs zero-padded up to the
//! 16-byte boundary. `L = 0` means "no change" and the frame is a single
//! zero byte. Format notes:
//! https://thecodeartist.blogspot.com/2013/02/shoutcast-internet-radio-protocol.html

use anyhow::Result;
use tokio::{io::AsyncReadExt, sync::mpsc};

pub type MetaData = hashbrown::HashMap<String, String>;
/// A wire-ready metadata frame including the leading length byte
pub type MetaFrame = Vec<u8>;

/// Renders `meta` into a wire frame. An empty map renders to the one-byte
/// zero frame.
pub fn render(meta: &MetaData) -> MetaFrame {
    if meta.is_empty() {
        return vec![0];
    }

    let mut body = String::new();
    for (key, value) in meta {
        body.push_str(key);
        body.push_str("='");
        body.push_str(value);
        body.push_str("';");
    }

    // The length byte counts 16-byte blocks, so 255 * 16 payload bytes is
    // the most a frame can carry
    let blocks = body.len().div_ceil(16).min(255);
    let take = body.len().min(blocks * 16);

    let mut frame = vec![0u8; 1 + blocks * 16];
    frame[0] = blocks as u8;
    frame[1..1 + take].copy_from_slice(&body.as_bytes()[..take]);
    frame
}

enum ParseState {
    ReadKey,
    ReadValue,
    ReadQuotedValue,
    WaitSemicolon,
}

/// Parses a wire frame (length byte included) back into a map.
///
/// An interior `'` inside a quoted value terminates the value, so values
/// holding apostrophes do not survive a round trip. That is a property of
/// the format as deployed, not of this parser.
pub fn parse(frame: &[u8]) -> Result<MetaData> {
    if frame.is_empty() {
        return Err(anyhow::Error::msg("empty metadata frame"));
    }

    let mut end = frame.len();
    while end > 1 && frame[end - 1] == 0 {
        end -= 1;
    }
    let data = &frame[1..end];

    let mut result = MetaData::new();
    let mut key = String::new();
    let mut value = String::new();
    let mut state = ParseState::ReadKey;
    let mut i = 0;

    loop {
        if i >= data.len() {
            match state {
                ParseState::ReadKey => break,
                _ => return Err(anyhow::Error::msg("unexpected end of metadata")),
            }
        }
        match state {
            ParseState::ReadKey => {
                if data[i] == b'=' {
                    i += 1;
                    if i >= data.len() {
                        return Err(anyhow::Error::msg("unexpected end of metadata"));
                    }
                    if data[i] == b'\'' {
                        state = ParseState::ReadQuotedValue;
                        i += 1;
                    } else {
                        state = ParseState::ReadValue;
                    }
                } else {
                    key.push(data[i] as char);
                    i += 1;
                }
            }
            ParseState::ReadValue => {
                if data[i] == b';' {
                    result.insert(std::mem::take(&mut key), std::mem::take(&mut value));
                    state = ParseState::ReadKey;
                } else {
                    value.push(data[i] as char);
                }
                i += 1;
            }
            ParseState::ReadQuotedValue => {
                if data[i] == b'\'' {
                    result.insert(std::mem::take(&mut key), std::mem::take(&mut value));
                    state = ParseState::WaitSemicolon;
                } else {
                    value.push(data[i] as char);
                }
                i += 1;
            }
            ParseState::WaitSemicolon => {
                if data[i] != b';' {
                    return Err(anyhow::Error::msg("semicolon expected"));
                }
                state = ParseState::ReadKey;
                i += 1;
            }
        }
    }

    Ok(result)
}

/// Wraps a raw upstream byte stream declared with `icy-metaint`, forwarding
/// the audio bytes and side-channeling the interleaved metadata frames.
///
/// Frames are handed off with a non-blocking send; when the driver has not
/// consumed the previous frame yet, the new one is dropped.
pub struct IcyReader<S> {
    source: S,
    meta_interval: usize,
    meta_pointer: usize,
    frames: mpsc::Sender<MetaFrame>,
}

impl<S: tokio::io::AsyncRead + Unpin> IcyReader<S> {
    pub fn new(source: S, meta_interval: usize, frames: mpsc::Sender<MetaFrame>) -> Self {
        IcyReader {
            source,
            meta_interval,
            meta_pointer: 0,
            frames,
        }
    }

    /// Reads audio bytes into `buf`. Any metadata frame falling inside the
    /// requested span is consumed off the stream and side-channeled, never
    /// copied into `buf`.
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.meta_interval == 0 || self.meta_pointer + buf.len() <= self.meta_interval {
            let n = self.source.read(buf).await?;
            self.meta_pointer += n;
            return Ok(n);
        }

        let head = self.meta_interval - self.meta_pointer;
        self.source.read_exact(&mut buf[..head]).await?;

        let mut len_byte = [0u8; 1];
        self.source.read_exact(&mut len_byte).await?;
        let payload_len = len_byte[0] as usize * 16;
        if payload_len > 0 {
            let mut frame = vec![0u8; payload_len + 1];
            frame[0] = len_byte[0];
            self.source.read_exact(&mut frame[1..]).await?;
            _ = self.frames.try_send(frame);
        }

        self.source.read_exact(&mut buf[head..]).await?;
        self.meta_pointer = buf.len() - head;
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> MetaData {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn render_empty_is_single_zero_byte() {
        let frame = render(&MetaData::new());
        assert_eq!(frame, vec![0]);
    }

    #[test]
    fn render_pads_to_sixteen_byte_blocks() {
        let frame = render(&meta(&[("StreamTitle", "Some test string")]));
        // "StreamTitle='Some test string';" is 31 bytes, so two blocks
        assert_eq!(frame[0], 2);
        assert_eq!(frame.len(), 33);
        assert_eq!(frame.len() % 16, 1);
        assert!(frame.ends_with(&[0, 0]));
    }

    #[test]
    fn parse_inverts_render() {
        let original = meta(&[
            ("StreamTitle", "Artist - Song"),
            ("StreamUrl", "http://example.org/"),
        ]);
        assert_eq!(parse(&render(&original)).unwrap(), original);
    }

    #[test]
    fn parse_empty_frame_is_empty_map() {
        assert!(parse(&[0]).unwrap().is_empty());
    }

    #[test]
    fn parse_unquoted_value() {
        let mut frame = vec![1u8];
        frame.extend_from_slice(b"k=v;");
        frame.resize(17, 0);
        assert_eq!(parse(&frame).unwrap(), meta(&[("k", "v")]));
    }

    #[test]
    fn parse_truncated_value_errors() {
        let mut frame = vec![3u8];
        frame.extend_from_slice(b"StreamTitle='Test string which ends unexpecte");
        frame.resize(49, 0);
        let err = parse(&frame).unwrap_err();
        assert_eq!(err.to_string(), "unexpected end of metadata");
    }

    #[test]
    fn parse_zero_length_input_errors() {
        assert!(parse(&[]).is_err());
    }

    #[test]
    fn interior_apostrophe_terminates_value() {
        let mut frame = vec![2u8];
        frame.extend_from_slice(b"StreamTitle='It's';");
        frame.resize(33, 0);
        let err = parse(&frame).unwrap_err();
        assert_eq!(err.to_string(), "semicolon expected");
    }

    #[tokio::test]
    async fn reader_passes_audio_through_without_metadata() {
        let (tx, mut rx) = mpsc::channel(1);
        let data = b"0123456789".to_vec();
        let mut reader = IcyReader::new(&data[..], 0, tx);

        let mut buf = [0u8; 10];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 10);
        assert_eq!(&buf, b"0123456789");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reader_splits_frame_at_interval() {
        let mut data = Vec::new();
        data.extend_from_slice(&[b'a'; 10]);
        data.extend_from_slice(&render(&meta(&[("StreamTitle", "X")])));
        data.extend_from_slice(&[b'b'; 10]);

        let (tx, mut rx) = mpsc::channel(1);
        let mut reader = IcyReader::new(&data[..], 10, tx);

        let mut buf = [0u8; 20];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 20);
        assert_eq!(&buf[..10], &[b'a'; 10]);
        assert_eq!(&buf[10..], &[b'b'; 10]);

        let frame = rx.try_recv().unwrap();
        assert_eq!(parse(&frame).unwrap(), meta(&[("StreamTitle", "X")]));
    }

    #[tokio::test]
    async fn reader_swallows_zero_frames() {
        let mut data = Vec::new();
        data.extend_from_slice(&[b'a'; 8]);
        data.push(0);
        data.extend_from_slice(&[b'b'; 4]);

        let (tx, mut rx) = mpsc::channel(1);
        let mut reader = IcyReader::new(&data[..], 8, tx);

        let mut buf = [0u8; 12];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 12);
        assert_eq!(&buf[..8], &[b'a'; 8]);
        assert_eq!(&buf[8..], &[b'b'; 4]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reader_tracks_pointer_across_reads() {
        let mut data = Vec::new();
        data.extend_from_slice(&[b'a'; 6]);
        data.push(0);
        data.extend_from_slice(&[b'b'; 6]);

        let (tx, _rx) = mpsc::channel(1);
        let mut reader = IcyReader::new(&data[..], 6, tx);

        // First read stays inside the interval, second one crosses it
        let mut small = [0u8; 4];
        assert_eq!(reader.read(&mut small).await.unwrap(), 4);
        let mut rest = [0u8; 8];
        assert_eq!(reader.read(&mut rest).await.unwrap(), 8);
        assert_eq!(&rest[..2], &[b'a'; 2]);
        assert_eq!(&rest[2..], &[b'b'; 6]);
    }
}
