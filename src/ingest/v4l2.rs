//! V4L2 device capture.
//!
//! Opens `/dev/video<index>`, asks for RGB3 at the configured resolution and
//! falls back to whatever the driver negotiates (YUYV and MJPG are converted).

use image::RgbImage;
use ouroboros::self_referencing;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{Capture, CaptureError};
use crate::config::CaptureSettings;

const BUFFER_COUNT: u32 = 4;

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

/// An open V4L2 capture stream.
pub struct DeviceCapture {
    path: String,
    state: DeviceState,
    format: PixelFormat,
    width: u32,
    height: u32,
}

impl DeviceCapture {
    pub fn open(index: u32, settings: &CaptureSettings) -> Result<Self, CaptureError> {
        use v4l::buffer::Type;
        use v4l::video::Capture as _;

        let path = format!("/dev/video{}", index);
        let mut device = v4l::Device::with_path(&path)
            .map_err(|e| CaptureError::Unavailable(format!("open {}: {}", path, e)))?;
        let mut requested = device
            .format()
            .map_err(|e| CaptureError::Unavailable(format!("read format of {}: {}", path, e)))?;
        requested.width = settings.width;
        requested.height = settings.height;
        requested.fourcc = v4l::FourCC::new(b"RGB3");

        let negotiated = match device.set_format(&requested) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("DeviceCapture: failed to set format on {}: {}", path, err);
                device.format().map_err(|e| {
                    CaptureError::Unavailable(format!("read format of {}: {}", path, e))
                })?
            }
        };
        let format = PixelFormat::from_fourcc(&negotiated.fourcc.repr).ok_or_else(|| {
            CaptureError::Unavailable(format!(
                "{} negotiated unsupported pixel format {}",
                path, negotiated.fourcc
            ))
        })?;

        if settings.fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(settings.fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("DeviceCapture: failed to set fps on {}: {}", path, err);
            }
        }

        let state = DeviceStateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT)
            },
        }
        .try_build()
        .map_err(|e| CaptureError::Unavailable(format!("create stream on {}: {}", path, e)))?;

        log::info!(
            "DeviceCapture: connected to {} ({}x{} {:?})",
            path,
            negotiated.width,
            negotiated.height,
            format
        );
        Ok(Self {
            path,
            state,
            format,
            width: negotiated.width,
            height: negotiated.height,
        })
    }
}

impl Capture for DeviceCapture {
    fn read(&mut self) -> Result<RgbImage, CaptureError> {
        use v4l::io::traits::CaptureStream;

        let raw = self
            .state
            .with_stream_mut(|stream| stream.next().map(|(buf, _meta)| buf.to_vec()))
            .map_err(|e| CaptureError::Transport(format!("{}: {}", self.path, e)))?;
        // MJPG frames carry their own dimensions.
        if self.format == PixelFormat::Mjpeg {
            return super::http::decode_jpeg(&raw);
        }
        let rgb = normalize_to_rgb(&raw, self.width, self.height, self.format)?;
        RgbImage::from_raw(self.width, self.height, rgb)
            .ok_or_else(|| CaptureError::Decode(format!("{}: short frame buffer", self.path)))
    }
}
