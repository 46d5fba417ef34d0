//! HTTP transports: single JPEG snapshots and multipart MJPEG streams.
//!
//! Snapshot handles issue one GET per frame. Stream handles keep one response
//! body open and carve JPEG images out of it by scanning for SOI/EOI markers,
//! which works regardless of how (or whether) the server labels its
//! multipart boundaries.

use image::RgbImage;
use std::io::{self, Read};
use url::Url;

use super::{Capture, CaptureError, ConnectStrategy};
use crate::config::CaptureSettings;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const STREAM_CHUNK_BYTES: usize = 8192;
const MINIMAL_CHUNK_BYTES: usize = 1024;
const USER_AGENT: &str = concat!("dualcam-tracker/", env!("CARGO_PKG_VERSION"));

/// Open `url` with the given strategy.
pub fn open(
    url: &str,
    strategy: ConnectStrategy,
    settings: &CaptureSettings,
) -> Result<Box<dyn Capture>, CaptureError> {
    let parsed = Url::parse(url)
        .map_err(|e| CaptureError::Unavailable(format!("invalid url {}: {}", url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(CaptureError::Unavailable(format!(
            "unsupported scheme '{}'; expected http(s)",
            parsed.scheme()
        )));
    }

    let agent = build_agent(settings);
    match strategy {
        ConnectStrategy::Snapshot => Ok(Box::new(SnapshotCapture::new(agent, url))),
        ConnectStrategy::PreferredStream => {
            let response = get(&agent, url)?;
            let content_type = content_type(&response);
            if !is_multipart(&content_type) {
                return Err(CaptureError::Unavailable(format!(
                    "{} is not a multipart stream (content-type '{}')",
                    url, content_type
                )));
            }
            Ok(Box::new(MjpegCapture::new(
                response.into_reader(),
                STREAM_CHUNK_BYTES,
                MAX_JPEG_BYTES * 2,
            )))
        }
        ConnectStrategy::AutoStream => {
            let response = get(&agent, url)?;
            if is_multipart(&content_type(&response)) {
                Ok(Box::new(MjpegCapture::new(
                    response.into_reader(),
                    STREAM_CHUNK_BYTES,
                    MAX_JPEG_BYTES * 2,
                )))
            } else {
                let body = read_body(response)?;
                Ok(Box::new(SnapshotCapture::primed(agent, url, body)))
            }
        }
        ConnectStrategy::MinimalBufferStream => {
            let response = get(&agent, url)?;
            Ok(Box::new(MjpegCapture::new(
                response.into_reader(),
                MINIMAL_CHUNK_BYTES,
                MAX_JPEG_BYTES,
            )))
        }
    }
}

fn build_agent(settings: &CaptureSettings) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(settings.connect_timeout)
        .timeout_read(settings.request_timeout)
        .user_agent(USER_AGENT)
        .build()
}

fn get(agent: &ureq::Agent, url: &str) -> Result<ureq::Response, CaptureError> {
    agent.get(url).call().map_err(request_error)
}

fn content_type(response: &ureq::Response) -> String {
    response
        .header("Content-Type")
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn is_multipart(content_type: &str) -> bool {
    content_type.contains("multipart")
}

fn request_error(err: ureq::Error) -> CaptureError {
    match err {
        ureq::Error::Status(code, _) => CaptureError::Transport(format!("http status {}", code)),
        ureq::Error::Transport(transport) => {
            let message = transport.to_string();
            if message.contains("timed out") {
                CaptureError::Timeout
            } else if transport.kind() == ureq::ErrorKind::ConnectionFailed
                || transport.kind() == ureq::ErrorKind::Dns
            {
                CaptureError::Unavailable(message)
            } else {
                CaptureError::Transport(message)
            }
        }
    }
}

fn io_error(err: io::Error) -> CaptureError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => CaptureError::Timeout,
        io::ErrorKind::UnexpectedEof => CaptureError::Closed,
        _ => CaptureError::Transport(err.to_string()),
    }
}

fn read_body(response: ureq::Response) -> Result<Vec<u8>, CaptureError> {
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64 + 1)
        .read_to_end(&mut bytes)
        .map_err(io_error)?;
    if bytes.is_empty() {
        return Err(CaptureError::Decode("empty jpeg snapshot".into()));
    }
    if bytes.len() > MAX_JPEG_BYTES {
        return Err(CaptureError::Decode(format!(
            "snapshot exceeds {} bytes",
            MAX_JPEG_BYTES
        )));
    }
    Ok(bytes)
}

pub(crate) fn decode_jpeg(bytes: &[u8]) -> Result<RgbImage, CaptureError> {
    image::load_from_memory(bytes)
        .map(|image| image.into_rgb8())
        .map_err(|e| CaptureError::Decode(e.to_string()))
}

// ----------------------------------------------------------------------------
// Snapshot
// ----------------------------------------------------------------------------

/// One GET per frame against a single-image endpoint.
pub struct SnapshotCapture {
    agent: ureq::Agent,
    url: String,
    primed: Option<Vec<u8>>,
}

impl SnapshotCapture {
    fn new(agent: ureq::Agent, url: &str) -> Self {
        Self {
            agent,
            url: url.to_string(),
            primed: None,
        }
    }

    /// Start with a body already fetched during connection negotiation.
    fn primed(agent: ureq::Agent, url: &str, body: Vec<u8>) -> Self {
        Self {
            primed: Some(body),
            ..Self::new(agent, url)
        }
    }
}

impl Capture for SnapshotCapture {
    fn read(&mut self) -> Result<RgbImage, CaptureError> {
        let bytes = match self.primed.take() {
            Some(bytes) => bytes,
            None => read_body(get(&self.agent, &self.url)?)?,
        };
        decode_jpeg(&bytes)
    }
}

// ----------------------------------------------------------------------------
// MJPEG
// ----------------------------------------------------------------------------

/// Continuous multipart MJPEG body.
pub struct MjpegCapture {
    stream: MjpegStream,
}

impl MjpegCapture {
    pub fn new(reader: Box<dyn Read + Send>, chunk_bytes: usize, max_buffer: usize) -> Self {
        Self {
            stream: MjpegStream::new(reader, chunk_bytes, max_buffer),
        }
    }
}

impl Capture for MjpegCapture {
    fn read(&mut self) -> Result<RgbImage, CaptureError> {
        let jpeg = self.stream.read_next_jpeg()?;
        // A JPEG carved out between markers that does not decode means the
        // boundaries are wrong, not that the origin sent a bad image.
        decode_jpeg(&jpeg).map_err(|e| match e {
            CaptureError::Decode(msg) => CaptureError::Framing(msg),
            other => other,
        })
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
    chunk: Vec<u8>,
    max_buffer: usize,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send>, chunk_bytes: usize, max_buffer: usize) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
            chunk: vec![0u8; chunk_bytes.max(1)],
            max_buffer,
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>, CaptureError> {
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut self.chunk).map_err(io_error)?;
            if read == 0 {
                return Err(CaptureError::Closed);
            }
            self.buffer.extend_from_slice(&self.chunk[..read]);

            if self.buffer.len() > self.max_buffer {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
                return Err(CaptureError::Framing(format!(
                    "no complete jpeg within {} bytes",
                    self.max_buffer
                )));
            }
        }
    }
}

/// Byte range `[start, end)` of the first complete JPEG (SOI..EOI) in `buffer`.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
