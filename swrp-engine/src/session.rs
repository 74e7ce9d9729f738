//! Session data: negotiated stream parameters and the running counters a
//! pipeline publishes to its stats observer (§3 `Session`, `SessionStats`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Current wall-clock time in microseconds since the Unix epoch, used to
/// stamp PING/PONG round trips and to compute latency against a frame's
/// `capture_ts_us` anchor.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Parameters the source wishes to stream at; negotiated down to the
/// intersection of source wish and peer capability during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_bps: u32,
    pub hidpi: bool,
}

impl StreamConfig {
    pub const fn new(width: u32, height: u32, fps: u32, bitrate_bps: u32) -> Self {
        Self {
            width,
            height,
            fps,
            bitrate_bps,
            hidpi: false,
        }
    }

    pub const fn with_hidpi(mut self, hidpi: bool) -> Self {
        self.hidpi = hidpi;
        self
    }
}

/// Running counters for a single session, reset at every `START`.
///
/// Counters that are only ever incremented use atomics so each can have a
/// single designated writer (§5: capture task for `frames_captured`, send
/// task for `frames_sent`/`bytes_sent`, receive task for latency) while the
/// stats task reads them all once a second without taking a lock.
#[derive(Debug)]
pub struct SessionStats {
    pub frames_captured: AtomicU64,
    pub frames_encoded: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub bytes_sent: AtomicU64,
    current_fps_millis: AtomicU64,
    current_bitrate_bps: AtomicU64,
    latency_us: AtomicU64,
    start_time: Instant,
}

/// A point-in-time snapshot of [`SessionStats`], handed to observers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub frames_encoded: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub bytes_sent: u64,
    pub current_fps: f64,
    pub current_bitrate_bps: u64,
    pub latency_us: u64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            frames_captured: AtomicU64::new(0),
            frames_encoded: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            current_fps_millis: AtomicU64::new(0),
            current_bitrate_bps: AtomicU64::new(0),
            latency_us: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_latency_us(&self, latency_us: u64) {
        self.latency_us.store(latency_us, Ordering::Relaxed);
    }

    /// Recomputes `current_fps`/`current_bitrate_bps` from the elapsed time
    /// since the session started. Called once per second by the stats task.
    pub fn tick(&self) {
        let elapsed = self.start_time.elapsed().as_secs_f64().max(1e-6);
        let fps = self.frames_captured.load(Ordering::Relaxed) as f64 / elapsed;
        let bitrate = 8.0 * self.bytes_sent.load(Ordering::Relaxed) as f64 / elapsed;
        self.current_fps_millis
            .store((fps * 1000.0) as u64, Ordering::Relaxed);
        self.current_bitrate_bps
            .store(bitrate as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            current_fps: self.current_fps_millis.load(Ordering::Relaxed) as f64 / 1000.0,
            current_bitrate_bps: self.current_bitrate_bps.load(Ordering::Relaxed),
            latency_us: self.latency_us.load(Ordering::Relaxed),
        }
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocates strictly increasing `frame_number`s for one session, resetting
/// to zero on every new `START` (§3: "resets on every new session").
#[derive(Debug, Default)]
pub struct FrameNumberAllocator {
    next: AtomicU64,
}

impl FrameNumberAllocator {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    /// Returns the next `frame_number` and advances the counter.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Resets the counter to zero for a new session.
    pub fn reset(&self) {
        self.next.store(0, Ordering::Relaxed);
    }
}
