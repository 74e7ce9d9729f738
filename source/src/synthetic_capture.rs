//! A stand-in for the out-of-scope screen-capture producer (§1): yields a
//! solid-color pixel buffer at a fixed cadence so the pipeline has something
//! to encode and send without real virtual-display hardware.

use swrp_engine::error::Result;
use swrp_engine::media::{Capture, CapturedFrame};
use tokio::time::{interval, Duration, Interval};

const TARGET_FPS: u64 = 30;

pub struct SyntheticCapture {
    width: u32,
    height: u32,
    now_us: fn() -> u64,
    ticker: Interval,
}

impl SyntheticCapture {
    pub fn new(width: u32, height: u32, now_us: fn() -> u64) -> Self {
        Self {
            width,
            height,
            now_us,
            ticker: interval(Duration::from_millis(1000 / TARGET_FPS)),
        }
    }
}

impl Capture for SyntheticCapture {
    async fn capture(&mut self) -> Result<CapturedFrame> {
        self.ticker.tick().await;
        let capture_ts_us = (self.now_us)();
        Ok(CapturedFrame {
            pts_us: capture_ts_us,
            capture_ts_us,
            pixels: vec![0u8; (self.width * self.height * 4) as usize],
        })
    }
}
