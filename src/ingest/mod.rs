//! Capture transports.
//!
//! This module provides the transports a `FrameSource` can read from:
//! - Network snapshot endpoints and multipart MJPEG streams over HTTP
//! - Local V4L2 devices (feature: ingest-v4l2)
//! - Synthetic scenes (`stub://` addresses, tests and dry runs)
//!
//! A transport hands back decoded RGB images. Resizing, retry policy and the
//! latest-frame slot belong to `crate::source`.

pub mod address;
pub mod http;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use image::RgbImage;
use thiserror::Error;

use crate::config::CaptureSettings;

pub use address::NetworkEndpoints;
pub use synthetic::{SyntheticBackend, SyntheticCapture};

/// Error produced by a single capture attempt.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("origin unavailable: {0}")]
    Unavailable(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("image decode failed: {0}")]
    Decode(String),
    #[error("stream framing error: {0}")]
    Framing(String),
    #[error("stream closed by origin")]
    Closed,
}

/// How the acquisition loop should treat a failed read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry on the same handle.
    Transient,
    /// The stream protocol is misbehaving; a snapshot fallback may help.
    Degraded,
}

impl CaptureError {
    pub fn class(&self) -> FailureClass {
        match self {
            CaptureError::Framing(_) => FailureClass::Degraded,
            _ => FailureClass::Transient,
        }
    }
}

/// Network connection strategies, tried in declaration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectStrategy {
    /// Single-image endpoint, one request per frame.
    Snapshot,
    /// Streaming endpoint through the multipart MJPEG parser.
    PreferredStream,
    /// Streaming endpoint, transport chosen from the response content type.
    AutoStream,
    /// Streaming endpoint forced through the MJPEG parser with a small read chunk.
    MinimalBufferStream,
}

impl ConnectStrategy {
    pub const ORDER: [ConnectStrategy; 4] = [
        ConnectStrategy::Snapshot,
        ConnectStrategy::PreferredStream,
        ConnectStrategy::AutoStream,
        ConnectStrategy::MinimalBufferStream,
    ];

    pub fn is_stream(&self) -> bool {
        !matches!(self, ConnectStrategy::Snapshot)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConnectStrategy::Snapshot => "snapshot",
            ConnectStrategy::PreferredStream => "mjpeg",
            ConnectStrategy::AutoStream => "auto",
            ConnectStrategy::MinimalBufferStream => "mjpeg-minimal",
        }
    }
}

/// An open capture handle.
pub trait Capture: Send {
    /// Block until the next image is available.
    fn read(&mut self) -> Result<RgbImage, CaptureError>;
}

/// Factory for capture handles.
///
/// `FrameSource` holds one as `Arc<dyn CaptureBackend>` so tests can inject
/// scripted transports.
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open a local device by index.
    fn open_device(
        &self,
        index: u32,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn Capture>, CaptureError>;

    /// Open a network address with one strategy.
    fn open_url(
        &self,
        url: &str,
        strategy: ConnectStrategy,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn Capture>, CaptureError>;
}

/// Production backend: HTTP for network addresses, V4L2 for devices,
/// synthetic scenes for `stub://` addresses.
#[derive(Clone, Debug, Default)]
pub struct SystemBackend;

impl CaptureBackend for SystemBackend {
    fn name(&self) -> &'static str {
        "system"
    }

    fn open_device(
        &self,
        index: u32,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn Capture>, CaptureError> {
        #[cfg(feature = "ingest-v4l2")]
        {
            let capture = v4l2::DeviceCapture::open(index, settings)?;
            Ok(Box::new(capture))
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            let _ = settings;
            Err(CaptureError::Unavailable(format!(
                "device {} requested but local capture requires the ingest-v4l2 feature",
                index
            )))
        }
    }

    fn open_url(
        &self,
        url: &str,
        strategy: ConnectStrategy,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn Capture>, CaptureError> {
        if synthetic::is_synthetic(url) {
            return SyntheticBackend::default().open_url(url, strategy, settings);
        }
        http::open(url, strategy, settings)
    }
}
