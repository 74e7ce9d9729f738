//! External collaborator contracts (§1 "out of scope" list): screen capture,
//! hardware encoder, hardware decoder, and display presentation. This crate
//! only needs their interfaces — concrete implementations are platform glue
//! that lives outside this workspace. A mock of each is provided so the
//! pipelines can be driven and tested without real hardware.

use crate::error::Result;
use crate::session::StreamConfig;
use swrp_wire::EncodedFrame;

/// One raw pixel buffer from the screen-capture producer, with its
/// presentation timestamp.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub pts_us: u64,
    pub capture_ts_us: u64,
    pub pixels: Vec<u8>,
}

/// A frame the decoder has produced, ready for [`Display::present`].
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub frame_number: u64,
    pub pts_us: u64,
    pub pixels: Vec<u8>,
}

/// Yields raw pixel buffers from whatever the platform's virtual display
/// manager is. Owned by exactly one task (§5): the capture-encode-send task.
#[allow(async_fn_in_trait)]
pub trait Capture: Send {
    async fn capture(&mut self) -> Result<CapturedFrame>;
}

/// Accepts pixel buffers, yields Annex-B encoded frames. `frame_number` and
/// `capture_ts_us` are stamped by the caller, not the encoder, since
/// allocation is a pipeline concern (§3: `frame_number` is unique-per-session
/// and assigned before encoding).
#[allow(async_fn_in_trait)]
pub trait Encoder: Send {
    fn configure(&mut self, config: StreamConfig) -> Result<()>;

    /// Encodes one captured frame. May return `None` if the encoder buffers
    /// internally and has not produced an output frame yet.
    async fn encode(
        &mut self,
        frame_number: u64,
        captured: CapturedFrame,
    ) -> Result<Option<EncodedFrame>>;

    /// Flushes any buffered frames, e.g. on `stop_streaming`.
    async fn flush(&mut self) -> Result<Vec<EncodedFrame>>;
}

/// Accepts reassembled encoded frames, yields decoded pixel buffers.
#[allow(async_fn_in_trait)]
pub trait Decoder: Send {
    async fn decode(&mut self, frame: EncodedFrame) -> Result<DecodedFrame>;
}

/// Presents a decoded frame. Owned by exactly one task on the sink.
#[allow(async_fn_in_trait)]
pub trait Display: Send {
    async fn present(&mut self, frame: DecodedFrame) -> Result<()>;
}

/// A pass-through encoder for tests: wraps the captured pixel bytes directly
/// as the "encoded" payload and marks every frame a keyframe. Good enough to
/// exercise segmentation, flow control, and the ack/credit loop without a
/// real H.264 encoder.
#[derive(Debug, Default)]
pub struct PassthroughEncoder;

impl Encoder for PassthroughEncoder {
    fn configure(&mut self, _config: StreamConfig) -> Result<()> {
        Ok(())
    }

    async fn encode(
        &mut self,
        frame_number: u64,
        captured: CapturedFrame,
    ) -> Result<Option<EncodedFrame>> {
        Ok(Some(EncodedFrame {
            frame_number,
            pts_us: captured.pts_us,
            capture_ts_us: captured.capture_ts_us,
            is_keyframe: true,
            data: captured.pixels,
        }))
    }

    async fn flush(&mut self) -> Result<Vec<EncodedFrame>> {
        Ok(Vec::new())
    }
}

/// A decoder for tests that echoes the encoded bytes back as "pixels".
#[derive(Debug, Default)]
pub struct PassthroughDecoder;

impl Decoder for PassthroughDecoder {
    async fn decode(&mut self, frame: EncodedFrame) -> Result<DecodedFrame> {
        Ok(DecodedFrame {
            frame_number: frame.frame_number,
            pts_us: frame.pts_us,
            pixels: frame.data,
        })
    }
}

/// A display for tests that discards every frame.
#[derive(Debug, Default)]
pub struct NullDisplay;

impl Display for NullDisplay {
    async fn present(&mut self, _frame: DecodedFrame) -> Result<()> {
        Ok(())
    }
}
