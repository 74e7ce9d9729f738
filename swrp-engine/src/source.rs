//! Source pipeline (C7): capture -> encode -> segment -> send, with ACK and
//! PING handling and periodic stats, all driven over an abstract transport.

use crate::error::{Error, Result};
use crate::flow::FlowController;
use crate::link::{self, Link};
use crate::media::{Capture, Encoder};
use crate::observer::{ErrorObserver, ObserverRegistry, PreviewObserver, StatsObserver};
use crate::session::{now_us, FrameNumberAllocator, SessionStats, StatsSnapshot, StreamConfig};
use crate::state::{PipelineState, StateMachine, StateObserver};
use crate::transport::Transport;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use swrp_wire::{
    FrameAckPayload, FrameHeaderPayload, HelloPayload, Packet, PacketType, PingPayload,
    PongPayload, Segmenter, StartAckPayload, StartPayload,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const STATS_INTERVAL: Duration = Duration::from_secs(1);
/// Best-effort wait for STOP_ACK before tearing tasks down (§4.7 "Stop").
const STOP_ACK_GRACE: Duration = Duration::from_millis(300);

/// Bounded `frame_number -> capture_ts_us` anchor, sized to the credit
/// window so latency can be computed from the right capture timestamp (§9
/// open question) without growing unbounded if acks stop arriving.
struct LatencyAnchors {
    capacity: usize,
    entries: VecDeque<(u64, u64)>,
}

impl LatencyAnchors {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    fn record(&mut self, frame_number: u64, capture_ts_us: u64) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((frame_number, capture_ts_us));
    }

    fn take(&mut self, frame_number: u64) -> Option<u64> {
        let pos = self.entries.iter().position(|(n, _)| *n == frame_number)?;
        let (_, ts) = self.entries.remove(pos).unwrap();
        Some(ts)
    }
}

/// The source endpoint: captures, encodes, segments, and sends a video
/// stream, negotiating with a sink over an abstract [`Transport`].
pub struct Source {
    state: Arc<StateMachine>,
    flow: Arc<FlowController>,
    stats: Arc<SessionStats>,
    frame_numbers: Arc<FrameNumberAllocator>,
    observers: Arc<Mutex<ObserverRegistry>>,
    link: Arc<Link>,
    send_seq: Arc<AtomicU32>,
    shutdown_tx: watch::Sender<bool>,
    stop_ack_seen: Arc<AtomicBool>,
    reader: Option<link::PacketReader>,
    capture_task: Option<JoinHandle<()>>,
    stats_task: Option<JoinHandle<()>>,
    receive_task: Option<JoinHandle<()>>,
}

fn next_seq(counter: &AtomicU32) -> u32 {
    counter.fetch_add(1, Ordering::Relaxed)
}

impl Source {
    /// Connects to a sink over `transport` and runs the HELLO/HELLO_ACK
    /// phase. On success the pipeline is left in `Ready`, able to accept
    /// [`Self::start_streaming`].
    pub async fn connect<T: Transport + 'static>(transport: T, hello: HelloPayload) -> Result<Self> {
        let state = Arc::new(StateMachine::new());
        state.transition(PipelineState::Connecting)?;

        let (link, mut reader) = link::spawn(transport);
        let link = Arc::new(link);
        state.transition(PipelineState::Connected)?;
        state.transition(PipelineState::Handshaking)?;

        let send_seq = Arc::new(AtomicU32::new(0));
        let seq = next_seq(&send_seq);
        if let Err(e) = link.send(Packet::new(PacketType::Hello, seq, hello.to_bytes())).await {
            let _ = state.transition(PipelineState::Error);
            return Err(e);
        }

        let ack = match timeout(HANDSHAKE_TIMEOUT, reader.next_packet()).await {
            Ok(Ok(packet)) => packet,
            Ok(Err(e)) => {
                let _ = state.transition(PipelineState::Error);
                return Err(e);
            }
            Err(_) => {
                let _ = state.transition(PipelineState::Error);
                return Err(Error::Timeout);
            }
        };
        if ack.header.packet_type != PacketType::HelloAck {
            let _ = state.transition(PipelineState::Error);
            return Err(Error::UnexpectedPacketType {
                expected: PacketType::HelloAck,
                actual: ack.header.packet_type,
            });
        }
        HelloPayload::from_bytes(&ack.payload).map_err(|e| {
            let _ = state.transition(PipelineState::Error);
            Error::from(e)
        })?;

        state.transition(PipelineState::Ready)?;

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            state,
            flow: Arc::new(FlowController::new()),
            stats: Arc::new(SessionStats::new()),
            frame_numbers: Arc::new(FrameNumberAllocator::new()),
            observers: Arc::new(Mutex::new(ObserverRegistry::new())),
            link,
            send_seq,
            shutdown_tx,
            stop_ack_seen: Arc::new(AtomicBool::new(false)),
            reader: Some(reader),
            capture_task: None,
            stats_task: None,
            receive_task: None,
        })
    }

    pub fn observe_state(&self, observer: StateObserver) {
        self.state.observe(observer);
    }

    pub fn observe_stats(&self, observer: StatsObserver) {
        self.observers.lock().unwrap().on_stats(observer);
    }

    pub fn observe_preview(&self, observer: PreviewObserver) {
        self.observers.lock().unwrap().on_preview(observer);
    }

    pub fn observe_errors(&self, observer: ErrorObserver) {
        self.observers.lock().unwrap().on_error(observer);
    }

    pub fn state(&self) -> PipelineState {
        self.state.current()
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Negotiates `config` with the peer (START/START_ACK) and, on success,
    /// spawns the capture-encode-send, receive, and stats tasks.
    pub async fn start_streaming<C, E>(&mut self, config: StreamConfig, mut encoder: E, capture: C) -> Result<()>
    where
        C: Capture + 'static,
        E: Encoder + 'static,
    {
        self.state.transition(PipelineState::Starting)?;
        encoder.configure(config).map_err(|e| self.fail(e))?;

        let start_payload = StartPayload {
            width: config.width,
            height: config.height,
            fps_fixed: config.fps << 16,
            bitrate_bps: config.bitrate_bps,
            pixel_format: 0,
            audio_enabled: false,
            audio_sample_rate: 0,
            audio_channels: 0,
            audio_bits: 0,
        };
        let seq = next_seq(&self.send_seq);
        self.link
            .send(Packet::new(PacketType::Start, seq, start_payload.to_bytes()))
            .await
            .map_err(|e| self.fail(e))?;

        let reader = self.reader.as_mut().ok_or(Error::NotReady)?;
        let ack = match timeout(HANDSHAKE_TIMEOUT, reader.next_packet()).await {
            Ok(Ok(packet)) => packet,
            Ok(Err(e)) => return Err(self.fail(e)),
            Err(_) => return Err(self.fail(Error::Timeout)),
        };
        if ack.header.packet_type != PacketType::StartAck {
            return Err(self.fail(Error::UnexpectedPacketType {
                expected: PacketType::StartAck,
                actual: ack.header.packet_type,
            }));
        }
        let start_ack = StartAckPayload::from_bytes(&ack.payload).map_err(|e| self.fail(Error::from(e)))?;
        if !start_ack.is_ok() {
            return Err(self.fail(Error::HandshakeFailed {
                reason: "peer rejected START",
            }));
        }

        self.flow.set_initial(start_ack.initial_credits);
        self.frame_numbers.reset();
        self.stop_ack_seen.store(false, Ordering::Relaxed);
        self.state.transition(PipelineState::Streaming)?;

        let latency = Arc::new(Mutex::new(LatencyAnchors::new(
            start_ack.initial_credits.max(1) as usize,
        )));

        let reader = self.reader.take().ok_or(Error::NotReady)?;
        self.receive_task = Some(tokio::spawn(run_receive_task(
            reader,
            self.flow.clone(),
            self.stats.clone(),
            self.link.clone(),
            self.send_seq.clone(),
            latency.clone(),
            self.stop_ack_seen.clone(),
            self.state.clone(),
            self.observers.clone(),
            self.shutdown_tx.subscribe(),
        )));

        self.capture_task = Some(tokio::spawn(run_capture_task(
            capture,
            encoder,
            self.frame_numbers.clone(),
            self.flow.clone(),
            self.stats.clone(),
            self.link.clone(),
            self.send_seq.clone(),
            latency,
            self.state.clone(),
            self.observers.clone(),
            self.shutdown_tx.subscribe(),
        )));

        self.stats_task = Some(tokio::spawn(run_stats_task(
            self.stats.clone(),
            self.observers.clone(),
            self.shutdown_tx.subscribe(),
        )));

        Ok(())
    }

    /// Stops streaming: cancels the three tasks, sends STOP, and waits
    /// briefly (best-effort) for STOP_ACK before returning to `Ready`.
    pub async fn stop_streaming(&mut self) -> Result<()> {
        self.state.transition(PipelineState::Stopping)?;

        let seq = next_seq(&self.send_seq);
        let _ = self.link.send(Packet::new(PacketType::Stop, seq, Vec::new())).await;

        let deadline = Instant::now() + STOP_ACK_GRACE;
        while !self.stop_ack_seen.load(Ordering::Acquire) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let _ = self.shutdown_tx.send(true);
        self.flow.reset();

        if let Some(h) = self.capture_task.take() {
            let _ = h.await;
        }
        if let Some(h) = self.stats_task.take() {
            let _ = h.await;
        }
        if let Some(h) = self.receive_task.take() {
            let _ = h.await;
        }

        self.state.transition(PipelineState::Ready)
    }

    pub fn disconnect(&mut self) -> Result<()> {
        self.link.shutdown();
        self.state.transition(PipelineState::Disconnected)
    }

    /// Transitions to `Error` and surfaces `e` to the error observer (§7:
    /// every error kind that reaches the user is reported this way).
    fn fail(&self, e: Error) -> Error {
        let _ = self.state.transition(PipelineState::Error);
        self.observers.lock().unwrap().notify_error(&e);
        e
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_capture_task<C: Capture, E: Encoder>(
    mut capture: C,
    mut encoder: E,
    frame_numbers: Arc<FrameNumberAllocator>,
    flow: Arc<FlowController>,
    stats: Arc<SessionStats>,
    link: Arc<Link>,
    send_seq: Arc<AtomicU32>,
    latency: Arc<Mutex<LatencyAnchors>>,
    state: Arc<StateMachine>,
    observers: Arc<Mutex<ObserverRegistry>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if let Ok(trailing) = encoder.flush().await {
                    for frame in trailing {
                        if !send_encoded_frame(&frame, &flow, &stats, &link, &send_seq, false).await {
                            stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                break;
            }
            captured = capture.capture() => {
                let captured = match captured {
                    Ok(c) => c,
                    Err(e) => {
                        log::warn!("capture failed: {e}");
                        stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };
                stats.frames_captured.fetch_add(1, Ordering::Relaxed);
                observers.lock().unwrap().notify_preview(&captured.pixels);

                let frame_number = frame_numbers.next();
                let capture_ts_us = captured.capture_ts_us;
                let encoded = match encoder.encode(frame_number, captured).await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => continue,
                    Err(e) => {
                        // Encoder/decoder errors are fatal to the current
                        // session (§7), unlike a dropped capture.
                        stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        let _ = state.transition(PipelineState::Error);
                        observers.lock().unwrap().notify_error(&e);
                        return;
                    }
                };
                stats.frames_encoded.fetch_add(1, Ordering::Relaxed);
                latency.lock().unwrap().record(frame_number, capture_ts_us);

                if !send_encoded_frame(&encoded, &flow, &stats, &link, &send_seq, true).await {
                    return;
                }
            }
        }
    }
}

/// Segments `frame` and sends every segment, acquiring flow credit first
/// when `blocking` (the live capture path); a flush at shutdown instead uses
/// `try_consume` only and gives up on the frame once credit runs out.
/// Returns `false` if the transport is gone and the caller should stop.
async fn send_encoded_frame(
    frame: &swrp_wire::EncodedFrame,
    flow: &Arc<FlowController>,
    stats: &Arc<SessionStats>,
    link: &Arc<Link>,
    send_seq: &Arc<AtomicU32>,
    blocking: bool,
) -> bool {
    let segments = match Segmenter::new().split(frame) {
        Ok(segments) => segments,
        Err(_) => {
            stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return true;
        }
    };

    for segment in segments {
        if blocking {
            if !flow.acquire().await {
                return false;
            }
            flow.try_consume();
        } else if !flow.try_consume() {
            return true; // best-effort flush: no credit left, drop the rest
        }

        let header = FrameHeaderPayload {
            frame_number: segment.frame_number,
            pts_us: segment.pts_us,
            capture_ts_us: segment.capture_ts_us,
            frame_size: segment.frame_size,
            segment_index: segment.segment_index,
            segment_count: segment.segment_count,
        };
        let seq = next_seq(send_seq);
        let bytes_len = segment.data.len() as u64;
        let packet = Packet::new(PacketType::Frame, seq, header.to_bytes(&segment.data));
        if link.send(packet).await.is_err() {
            return false;
        }
        stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        stats.bytes_sent.fetch_add(bytes_len, Ordering::Relaxed);
    }
    true
}

/// Consecutive recovered framing errors before a receive loop escalates to
/// `Error` rather than continuing to drop packets (§7).
const MAX_CONSECUTIVE_FRAMING_ERRORS: u32 = 3;

#[allow(clippy::too_many_arguments)]
async fn run_receive_task(
    mut reader: link::PacketReader,
    flow: Arc<FlowController>,
    stats: Arc<SessionStats>,
    link: Arc<Link>,
    send_seq: Arc<AtomicU32>,
    latency: Arc<Mutex<LatencyAnchors>>,
    stop_ack_seen: Arc<AtomicBool>,
    state: Arc<StateMachine>,
    observers: Arc<Mutex<ObserverRegistry>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut consecutive_framing_errors = 0u32;
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            result = reader.next_packet() => {
                match result {
                    Ok(packet) => {
                        consecutive_framing_errors = 0;
                        match packet.header.packet_type {
                        PacketType::FrameAck => {
                            if let Ok(ack) = FrameAckPayload::from_bytes(&packet.payload) {
                                flow.return_credits(ack.credits_returned);
                                if let Some(capture_ts_us) = latency.lock().unwrap().take(ack.frame_number) {
                                    stats.record_latency_us(now_us().saturating_sub(capture_ts_us));
                                }
                            }
                        }
                        PacketType::Ping => {
                            if let Ok(ping) = PingPayload::from_bytes(&packet.payload) {
                                let pong = PongPayload {
                                    ping_timestamp_us: ping.timestamp_us,
                                    pong_timestamp_us: now_us(),
                                };
                                let seq = next_seq(&send_seq);
                                let _ = link.send(Packet::new(PacketType::Pong, seq, pong.to_bytes())).await;
                            }
                        }
                        PacketType::StopAck => {
                            stop_ack_seen.store(true, Ordering::Release);
                        }
                        other => {
                            log::debug!("ignoring unexpected packet type {other:?} during streaming");
                        }
                        }
                    }
                    Err(Error::Disconnected) => {
                        // Unplanned: a requested teardown tears tasks down via
                        // `shutdown_rx`, not by the transport reporting gone.
                        let _ = state.transition(PipelineState::Error);
                        observers.lock().unwrap().notify_error(&Error::Disconnected);
                        break;
                    }
                    Err(e) => {
                        log::debug!("dropping malformed packet: {e}");
                        consecutive_framing_errors += 1;
                        if consecutive_framing_errors >= MAX_CONSECUTIVE_FRAMING_ERRORS {
                            let _ = state.transition(PipelineState::Error);
                            observers.lock().unwrap().notify_error(&e);
                            break;
                        }
                    }
                }
            }
        }
    }
}

async fn run_stats_task(
    stats: Arc<SessionStats>,
    observers: Arc<Mutex<ObserverRegistry>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = interval.tick() => {
                stats.tick();
                observers.lock().unwrap().notify_stats(stats.snapshot());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{CapturedFrame, PassthroughEncoder};
    use crate::transport::MockTransport;
    use swrp_wire::Capabilities;

    struct OneShotCapture {
        frames: std::collections::VecDeque<CapturedFrame>,
    }

    impl Capture for OneShotCapture {
        async fn capture(&mut self) -> Result<CapturedFrame> {
            match self.frames.pop_front() {
                Some(frame) => Ok(frame),
                None => std::future::pending().await,
            }
        }
    }

    fn hello() -> HelloPayload {
        HelloPayload {
            software_version: 1,
            min_proto: 1,
            max_proto: 1,
            max_width: 3840,
            max_height: 2160,
            max_fps_fixed: 120 << 16,
            capabilities: Capabilities::HIDPI,
        }
    }

    #[tokio::test]
    async fn connect_times_out_without_a_peer() {
        let (transport, _silent_peer) = MockTransport::pair();
        let result = timeout(
            Duration::from_millis(50),
            Source::connect(transport, hello()),
        )
        .await;
        // The real handshake timeout is 5s; we only assert the call doesn't
        // succeed within this short window while no peer answers.
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn connect_succeeds_against_a_cooperative_peer() {
        let (transport, mut peer) = MockTransport::pair();
        let connecting = tokio::spawn(Source::connect(transport, hello()));

        let bytes = peer.receive().await.unwrap();
        let (packet, _) = Packet::parse(&bytes).unwrap();
        assert_eq!(packet.header.packet_type, PacketType::Hello);

        let ack = Packet::new(PacketType::HelloAck, 0, hello().to_bytes());
        peer.send(ack.serialize()).await.unwrap();

        let source = connecting.await.unwrap().unwrap();
        assert_eq!(source.state(), PipelineState::Ready);
    }

    #[tokio::test]
    async fn e1_handshake_then_start_reaches_streaming_with_initial_credits() {
        let (transport, mut peer) = MockTransport::pair();
        let connecting = tokio::spawn(Source::connect(transport, hello()));

        let hello_bytes = peer.receive().await.unwrap();
        Packet::parse(&hello_bytes).unwrap();
        peer.send(Packet::new(PacketType::HelloAck, 0, hello().to_bytes()).serialize())
            .await
            .unwrap();
        let mut source = connecting.await.unwrap().unwrap();

        let config = StreamConfig::new(1920, 1080, 60, 20_000_000);
        let capture = OneShotCapture {
            frames: std::collections::VecDeque::new(),
        };
        let starting = tokio::spawn(async move {
            source
                .start_streaming(config, PassthroughEncoder, capture)
                .await?;
            Ok::<PipelineState, Error>(source.state())
        });

        let start_bytes = peer.receive().await.unwrap();
        let (start_packet, _) = Packet::parse(&start_bytes).unwrap();
        assert_eq!(start_packet.header.packet_type, PacketType::Start);

        let ack = StartAckPayload {
            status: StartAckPayload::STATUS_OK,
            initial_credits: 8,
        };
        peer.send(Packet::new(PacketType::StartAck, 1, ack.to_bytes()).serialize())
            .await
            .unwrap();

        assert_eq!(starting.await.unwrap().unwrap(), PipelineState::Streaming);
    }

    async fn established_source(peer: &mut MockTransport, transport: MockTransport) -> Source {
        let connecting = tokio::spawn(Source::connect(transport, hello()));
        let hello_bytes = peer.receive().await.unwrap();
        Packet::parse(&hello_bytes).unwrap();
        peer.send(Packet::new(PacketType::HelloAck, 0, hello().to_bytes()).serialize())
            .await
            .unwrap();
        connecting.await.unwrap().unwrap()
    }

    async fn streaming_source<C: Capture + 'static, E: Encoder + 'static>(
        peer: &mut MockTransport,
        mut source: Source,
        config: StreamConfig,
        encoder: E,
        capture: C,
    ) -> Source {
        let starting = tokio::spawn(async move {
            source
                .start_streaming(config, encoder, capture)
                .await
                .unwrap();
            source
        });
        let start_bytes = peer.receive().await.unwrap();
        Packet::parse(&start_bytes).unwrap();
        let ack = StartAckPayload {
            status: StartAckPayload::STATUS_OK,
            initial_credits: 8,
        };
        peer.send(Packet::new(PacketType::StartAck, 1, ack.to_bytes()).serialize())
            .await
            .unwrap();
        starting.await.unwrap()
    }

    #[tokio::test]
    async fn persistent_framing_errors_escalate_to_error_state() {
        let (transport, mut peer) = MockTransport::pair();
        let source = established_source(&mut peer, transport).await;
        let config = StreamConfig::new(1920, 1080, 60, 20_000_000);
        let capture = OneShotCapture {
            frames: std::collections::VecDeque::new(),
        };
        let source = streaming_source(&mut peer, source, config, PassthroughEncoder, capture).await;
        assert_eq!(source.state(), PipelineState::Streaming);

        for _ in 0..3 {
            peer.send(vec![0xFFu8; 20]).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.state(), PipelineState::Error);
    }

    struct FailingEncoder;

    impl Encoder for FailingEncoder {
        fn configure(&mut self, _config: crate::session::StreamConfig) -> Result<()> {
            Ok(())
        }

        async fn encode(
            &mut self,
            _frame_number: u64,
            _captured: crate::media::CapturedFrame,
        ) -> Result<Option<swrp_wire::EncodedFrame>> {
            Err(Error::EncodingFailed)
        }

        async fn flush(&mut self) -> Result<Vec<swrp_wire::EncodedFrame>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn encoder_failure_is_fatal_and_transitions_to_error() {
        use crate::media::CapturedFrame;

        let (transport, mut peer) = MockTransport::pair();
        let source = established_source(&mut peer, transport).await;
        let config = StreamConfig::new(1920, 1080, 60, 20_000_000);
        let capture = OneShotCapture {
            frames: std::collections::VecDeque::from([CapturedFrame {
                pts_us: 1,
                capture_ts_us: 1,
                pixels: vec![1, 2, 3],
            }]),
        };
        let source = streaming_source(&mut peer, source, config, FailingEncoder, capture).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.state(), PipelineState::Error);
    }
}
