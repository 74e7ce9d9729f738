//! Sink pipeline (C8): receive -> reassemble -> decode -> present, issuing
//! credits back to the source and answering control-plane packets.

use crate::error::{Error, Result};
use crate::link::{self, Link};
use crate::media::{Decoder, Display};
use crate::observer::{ErrorObserver, ObserverRegistry, PreviewObserver, StatsObserver};
use crate::session::{now_us, SessionStats, StatsSnapshot};
use crate::state::{PipelineState, StateMachine, StateObserver};
use crate::transport::Transport;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use swrp_wire::{
    FrameAckPayload, FrameHeaderPayload, FrameSegment, HelloPayload, Packet, PacketType,
    PingPayload, PongPayload, Reassembler, StartAckPayload, StartPayload,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const PING_INTERVAL: Duration = Duration::from_secs(1);

/// The sink endpoint: receives, reassembles, decodes, and displays a video
/// stream, answering the source's handshake over an abstract [`Transport`].
pub struct Sink {
    state: Arc<StateMachine>,
    stats: Arc<SessionStats>,
    observers: Arc<Mutex<ObserverRegistry>>,
    link: Arc<Link>,
    send_seq: Arc<AtomicU32>,
    shutdown_tx: watch::Sender<bool>,
    reader: Option<link::PacketReader>,
    receive_task: Option<JoinHandle<()>>,
    ping_task: Option<JoinHandle<()>>,
}

fn next_seq(counter: &AtomicU32) -> u32 {
    counter.fetch_add(1, Ordering::Relaxed)
}

impl Sink {
    /// Accepts a connection over `transport`: waits for HELLO and answers
    /// HELLO_ACK with `hello` (this endpoint's own capabilities). On success
    /// the pipeline is left in `Ready`, able to accept [`Self::start_display`].
    pub async fn wait_for_connection<T: Transport + 'static>(
        transport: T,
        hello: HelloPayload,
    ) -> Result<Self> {
        let state = Arc::new(StateMachine::new());
        state.transition(PipelineState::Connecting)?;

        let (link, mut reader) = link::spawn(transport);
        let link = Arc::new(link);
        state.transition(PipelineState::Connected)?;
        state.transition(PipelineState::Handshaking)?;

        let send_seq = Arc::new(AtomicU32::new(0));

        let hello_packet = match timeout(HANDSHAKE_TIMEOUT, reader.next_packet()).await {
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
        if hello_packet.header.packet_type != PacketType::Hello {
            let _ = state.transition(PipelineState::Error);
            return Err(Error::UnexpectedPacketType {
                expected: PacketType::Hello,
                actual: hello_packet.header.packet_type,
            });
        }
        HelloPayload::from_bytes(&hello_packet.payload).map_err(|e| {
            let _ = state.transition(PipelineState::Error);
            Error::from(e)
        })?;

        let seq = next_seq(&send_seq);
        link.send(Packet::new(PacketType::HelloAck, seq, hello.to_bytes()))
            .await
            .map_err(|e| {
                let _ = state.transition(PipelineState::Error);
                e
            })?;

        state.transition(PipelineState::Ready)?;

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            state,
            stats: Arc::new(SessionStats::new()),
            observers: Arc::new(Mutex::new(ObserverRegistry::new())),
            link,
            send_seq,
            shutdown_tx,
            reader: Some(reader),
            receive_task: None,
            ping_task: None,
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

    /// Waits for the peer's START, answers START_ACK with `initial_credits`
    /// and `status = OK`, and spawns the receive and (optional) ping tasks.
    pub async fn start_display<D, P>(&mut self, decoder: D, display: P, initial_credits: u16) -> Result<()>
    where
        D: Decoder + 'static,
        P: Display + 'static,
    {
        self.state.transition(PipelineState::Starting)?;

        let reader = self.reader.as_mut().ok_or(Error::NotReady)?;
        let start_packet = match timeout(HANDSHAKE_TIMEOUT, reader.next_packet()).await {
            Ok(Ok(packet)) => packet,
            Ok(Err(e)) => return Err(self.fail(e)),
            Err(_) => return Err(self.fail(Error::Timeout)),
        };
        if start_packet.header.packet_type != PacketType::Start {
            return Err(self.fail(Error::UnexpectedPacketType {
                expected: PacketType::Start,
                actual: start_packet.header.packet_type,
            }));
        }
        let start = StartPayload::from_bytes(&start_packet.payload).map_err(|e| self.fail(Error::from(e)))?;
        log::info!(
            "negotiated stream: {}x{} @ {} fps, {} bps",
            start.width,
            start.height,
            start.fps(),
            start.bitrate_bps
        );

        let ack = StartAckPayload {
            status: StartAckPayload::STATUS_OK,
            initial_credits,
        };
        let seq = next_seq(&self.send_seq);
        self.link
            .send(Packet::new(PacketType::StartAck, seq, ack.to_bytes()))
            .await
            .map_err(|e| self.fail(e))?;

        self.state.transition(PipelineState::Streaming)?;

        let reader = self.reader.take().ok_or(Error::NotReady)?;
        self.receive_task = Some(tokio::spawn(run_receive_task(
            reader,
            decoder,
            display,
            self.stats.clone(),
            self.link.clone(),
            self.send_seq.clone(),
            self.observers.clone(),
            self.state.clone(),
            self.shutdown_tx.clone(),
            self.shutdown_tx.subscribe(),
        )));

        self.ping_task = Some(tokio::spawn(run_ping_task(
            self.link.clone(),
            self.send_seq.clone(),
            self.shutdown_tx.subscribe(),
        )));

        Ok(())
    }

    /// Tears the receive/ping tasks down. If still `Streaming`, transitions
    /// through `Stopping` back to `Ready`; if the peer already drove that
    /// transition by sending STOP, this just joins the tasks.
    pub async fn stop_display(&mut self) -> Result<()> {
        let was_streaming = self.state.current() == PipelineState::Streaming;
        if was_streaming {
            self.state.transition(PipelineState::Stopping)?;
        }

        let _ = self.shutdown_tx.send(true);
        if let Some(h) = self.receive_task.take() {
            let _ = h.await;
        }
        if let Some(h) = self.ping_task.take() {
            let _ = h.await;
        }

        if was_streaming && self.state.current() == PipelineState::Stopping {
            self.state.transition(PipelineState::Ready)?;
        }
        Ok(())
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

/// Consecutive recovered framing errors before a receive loop escalates to
/// `Error` rather than continuing to drop packets (§7).
const MAX_CONSECUTIVE_FRAMING_ERRORS: u32 = 3;

#[allow(clippy::too_many_arguments)]
async fn run_receive_task<D: Decoder, P: Display>(
    mut reader: link::PacketReader,
    mut decoder: D,
    mut display: P,
    stats: Arc<SessionStats>,
    link: Arc<Link>,
    send_seq: Arc<AtomicU32>,
    observers: Arc<Mutex<ObserverRegistry>>,
    state: Arc<StateMachine>,
    shutdown_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut reassembler = Reassembler::new();
    let mut consecutive_framing_errors = 0u32;
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            result = reader.next_packet() => {
                match result {
                    Ok(packet) => {
                        consecutive_framing_errors = 0;
                        match packet.header.packet_type {
                        PacketType::Frame => {
                            let fatal = handle_frame_packet(
                                &packet,
                                &mut reassembler,
                                &mut decoder,
                                &mut display,
                                &stats,
                                &link,
                                &send_seq,
                                &observers,
                            )
                            .await;
                            if fatal {
                                let _ = state.transition(PipelineState::Error);
                                break;
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
                        PacketType::Pong => {
                            if let Ok(pong) = PongPayload::from_bytes(&packet.payload) {
                                stats.record_latency_us(now_us().saturating_sub(pong.ping_timestamp_us));
                            }
                        }
                        PacketType::Stop => {
                            let seq = next_seq(&send_seq);
                            let _ = link.send(Packet::new(PacketType::StopAck, seq, Vec::new())).await;
                            let _ = state.transition(PipelineState::Stopping);
                            let _ = state.transition(PipelineState::Ready);
                            let _ = shutdown_tx.send(true);
                            break;
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

/// Handles one FRAME packet. Returns `true` if the decoder failed, which is
/// fatal to the current session (§7) and should stop the receive loop.
#[allow(clippy::too_many_arguments)]
async fn handle_frame_packet<D: Decoder, P: Display>(
    packet: &Packet,
    reassembler: &mut Reassembler,
    decoder: &mut D,
    display: &mut P,
    stats: &Arc<SessionStats>,
    link: &Arc<Link>,
    send_seq: &Arc<AtomicU32>,
    observers: &Arc<Mutex<ObserverRegistry>>,
) -> bool {
    let (header, data) = match FrameHeaderPayload::from_bytes(&packet.payload) {
        Ok(parsed) => parsed,
        Err(e) => {
            log::debug!("malformed FRAME header: {e}");
            return false;
        }
    };

    // A new frame_number arriving before the previously pending frame
    // completed counts that predecessor as dropped (§4.8).
    if let Some(pending) = reassembler.pending_frame_number() {
        if pending != header.frame_number {
            stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
    stats.bytes_sent.fetch_add(data.len() as u64, Ordering::Relaxed);

    let segment_count = header.segment_count;
    let segment = FrameSegment {
        frame_number: header.frame_number,
        pts_us: header.pts_us,
        capture_ts_us: header.capture_ts_us,
        frame_size: header.frame_size,
        segment_index: header.segment_index,
        segment_count: header.segment_count,
        data: data.to_vec(),
    };

    let Some(frame) = reassembler.push(segment) else {
        return false;
    };
    stats.frames_captured.fetch_add(1, Ordering::Relaxed);

    let frame_number = frame.frame_number;
    let decode_started = Instant::now();
    let decoded = match decoder.decode(frame).await {
        Ok(decoded) => decoded,
        Err(e) => {
            // Decoder errors are fatal to the current session (§7).
            stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            observers.lock().unwrap().notify_error(&e);
            return true;
        }
    };
    stats.frames_encoded.fetch_add(1, Ordering::Relaxed);
    observers.lock().unwrap().notify_preview(&decoded.pixels);
    let _ = display.present(decoded).await;
    let decode_time_us = decode_started.elapsed().as_micros().min(u128::from(u32::MAX)) as u32;

    let ack = FrameAckPayload {
        frame_number,
        decode_time_us,
        credits_returned: segment_count,
    };
    let seq = next_seq(send_seq);
    if link
        .send(Packet::new(PacketType::FrameAck, seq, ack.to_bytes()))
        .await
        .is_ok()
    {
        stats.frames_sent.fetch_add(1, Ordering::Relaxed);
    }
    false
}

async fn run_ping_task(link: Arc<Link>, send_seq: Arc<AtomicU32>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(PING_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = interval.tick() => {
                let ping = PingPayload { timestamp_us: now_us() };
                let seq = next_seq(&send_seq);
                let _ = link.send(Packet::new(PacketType::Ping, seq, ping.to_bytes())).await;
            }
        }
    }
}
