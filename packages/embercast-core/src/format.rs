//! Format adapter seam between the core and per-codec framing.
//!
//! Codecs decide frame boundaries, stamp sync points, and emit per-client
//! response heads; the core only moves the resulting blocks. The bundled
//! [`GenericFormat`] is the adapter every mount falls back to when no codec
//! plugin claims the content type: it chunks the inbound byte stream and
//! marks every chunk as a safe start point.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::client::Client;
use crate::config::MountConfig;
use crate::queue::{BlockFlags, RefBlock};

/// Writes from `client.refbuf` at `client.pos` to the socket, advancing the
/// cursor. Shared by adapters without their own write path.
pub fn write_refbuf_to_client(client: &mut Client) -> i32 {
    let rb = match &client.refbuf {
        Some(rb) => Arc::clone(rb),
        None => return 0,
    };
    if client.pos >= rb.len() {
        return 0;
    }
    let n = client.connection.send(&rb.data()[client.pos..]);
    if n > 0 {
        client.pos += n as usize;
    }
    n
}

/// Immutable stream facts an adapter needs to build a response head.
pub struct StreamDetails<'a> {
    pub mount: &'a str,
    pub stream_name: Option<&'a str>,
    pub stream_genre: Option<&'a str>,
    pub stream_url: Option<&'a str>,
    pub stream_description: Option<&'a str>,
    pub audio_info: &'a BTreeMap<String, String>,
}

/// Per-codec framing and client I/O, owned by a source.
pub trait FormatAdapter: Send {
    /// MIME type advertised to listeners.
    fn contenttype(&self) -> &str;

    /// Total bytes pulled off the producer socket.
    fn read_bytes(&self) -> u64;

    /// Pulls the next codec-aligned block from the producer.
    ///
    /// `None` means no complete block is available yet; the caller checks
    /// the connection error flag to tell "wait" from "gone".
    fn get_buffer(&mut self, producer: &mut Client) -> Option<Arc<RefBlock>>;

    /// Builds the HTTP response head into `client.refbuf`.
    ///
    /// Adapters may chain seeded intro blocks through `next` and set
    /// [`crate::client::ClientFlags::HAS_INTRO_CONTENT`]. Returns 0 on
    /// success, -1 to drop the client.
    fn create_client_data(&mut self, details: &StreamDetails<'_>, client: &mut Client) -> i32;

    /// Writes from `client.refbuf` at `client.pos` to the socket.
    ///
    /// Returns bytes written (>= 0) or -1 on a hard error; advances `pos`
    /// and the connection byte counter.
    fn write_buf_to_client(&mut self, client: &mut Client) -> i32 {
        write_refbuf_to_client(client)
    }

    /// Appends a queued block to the dump file.
    fn write_buf_to_file(&mut self, file: &mut File, block: &RefBlock) -> io::Result<()> {
        file.write_all(block.data())
    }

    /// Mount options changed while streaming.
    fn apply_settings(&mut self, _mount: &MountConfig) {}

    /// Producer hijack handoff; adapters with parser state reset it here.
    fn swap_client(&mut self) {}
}

/// Raw pass-through adapter.
///
/// Chunks the inbound stream into blocks of at most `frame_size` bytes.
/// Without codec knowledge every chunk is a sync point, which matches how
/// raw MP3-style streams tolerate joining mid-stream.
pub struct GenericFormat {
    contenttype: String,
    frame_size: usize,
    read_bytes: u64,
}

impl GenericFormat {
    /// Default pull chunk size.
    pub const FRAME_SIZE: usize = 4096;

    pub fn new(contenttype: &str) -> Self {
        Self {
            contenttype: contenttype.to_string(),
            frame_size: Self::FRAME_SIZE,
            read_bytes: 0,
        }
    }

    pub fn with_frame_size(contenttype: &str, frame_size: usize) -> Self {
        Self {
            contenttype: contenttype.to_string(),
            frame_size: frame_size.max(1),
            read_bytes: 0,
        }
    }
}

impl FormatAdapter for GenericFormat {
    fn contenttype(&self) -> &str {
        &self.contenttype
    }

    fn read_bytes(&self) -> u64 {
        self.read_bytes
    }

    fn get_buffer(&mut self, producer: &mut Client) -> Option<Arc<RefBlock>> {
        let mut buf = BytesMut::zeroed(self.frame_size);
        let n = producer.connection.read(&mut buf);
        if n == 0 {
            return None;
        }
        buf.truncate(n);
        self.read_bytes += n as u64;
        Some(RefBlock::with_flags(buf.freeze(), BlockFlags::SYNC))
    }

    fn create_client_data(&mut self, details: &StreamDetails<'_>, client: &mut Client) -> i32 {
        let mut head = String::with_capacity(256);
        head.push_str("HTTP/1.0 200 OK\r\n");
        head.push_str("Server: Embercast\r\n");
        head.push_str(&format!("Content-Type: {}\r\n", self.contenttype));
        head.push_str("Cache-Control: no-cache\r\n");
        head.push_str("Connection: close\r\n");
        head.push_str("Pragma: no-cache\r\n");
        if let Some(name) = details.stream_name {
            head.push_str(&format!("icy-name: {name}\r\n"));
        }
        if let Some(genre) = details.stream_genre {
            head.push_str(&format!("icy-genre: {genre}\r\n"));
        }
        if let Some(url) = details.stream_url {
            head.push_str(&format!("icy-url: {url}\r\n"));
        }
        if let Some(desc) = details.stream_description {
            head.push_str(&format!("icy-description: {desc}\r\n"));
        }
        if let Some(br) = details.audio_info.get("bitrate") {
            head.push_str(&format!("icy-br: {br}\r\n"));
        }
        head.push_str("\r\n");

        client.drop_refbuf();
        client.refbuf = Some(RefBlock::new(Bytes::from(head)));
        client.pos = 0;
        0
    }
}

/// Content types the generic adapter accepts.
const GENERIC_TYPES: &[&str] = &[
    "audio/mpeg",
    "audio/aac",
    "audio/aacp",
    "audio/ogg",
    "application/ogg",
];

/// Chooses an adapter for a producer's declared content type.
///
/// Returns `None` when nothing claims the type; the caller answers 403.
pub fn format_for_content_type(content_type: &str) -> Option<Box<dyn FormatAdapter>> {
    let base = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase();
    if GENERIC_TYPES.contains(&base.as_str()) {
        return Some(Box::new(GenericFormat::new(&base)));
    }
    log::debug!("[Format] No adapter for content type {content_type}");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{unspecified_ip, Connection, RequestHead};
    use crate::net::testing::MockSocket;

    fn client_with_incoming(bytes: &[u8]) -> Client {
        let mut sock = MockSocket::new();
        sock.push_incoming(bytes);
        Client::new(
            Connection::new(1, unspecified_ip(), Box::new(sock)),
            RequestHead::default(),
        )
    }

    #[test]
    fn generic_blocks_are_sync_tagged() {
        let mut fmt = GenericFormat::with_frame_size("audio/mpeg", 8);
        let mut producer = client_with_incoming(b"0123456789abcdef");
        let b1 = fmt.get_buffer(&mut producer).unwrap();
        assert_eq!(b1.len(), 8);
        assert!(b1.has_flag(BlockFlags::SYNC));
        let b2 = fmt.get_buffer(&mut producer).unwrap();
        assert_eq!(b2.len(), 8);
        assert_eq!(fmt.read_bytes(), 16);
        assert!(fmt.get_buffer(&mut producer).is_none());
    }

    #[test]
    fn response_head_carries_stream_metadata() {
        let mut fmt = GenericFormat::new("audio/mpeg");
        let mut listener = client_with_incoming(b"");
        let mut info = BTreeMap::new();
        info.insert("bitrate".to_string(), "128".to_string());
        let details = StreamDetails {
            mount: "/live",
            stream_name: Some("Night Shift"),
            stream_genre: None,
            stream_url: None,
            stream_description: None,
            audio_info: &info,
        };
        assert_eq!(fmt.create_client_data(&details, &mut listener), 0);
        let head = listener.refbuf.as_ref().unwrap();
        let text = std::str::from_utf8(head.data()).unwrap();
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(text.contains("Content-Type: audio/mpeg\r\n"));
        assert!(text.contains("icy-name: Night Shift\r\n"));
        assert!(text.contains("icy-br: 128\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn unknown_content_type_has_no_adapter() {
        assert!(format_for_content_type("video/mp4").is_none());
        assert!(format_for_content_type("audio/mpeg; charset=utf-8").is_some());
    }
}
