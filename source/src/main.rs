mod synthetic_capture;

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use swrp_engine::{PipelineState, Source, StreamConfig, TcpTransport};
use swrp_wire::{Capabilities, HelloPayload};
use synthetic_capture::SyntheticCapture;
use tokio::net::TcpStream;

/// Where this source endpoint dials out to. Only `Tcp` is wired up today —
/// the real USB-bulk realization is out of scope for this crate — but this
/// mirrors the target-selection enum the binary would grow a `Usb` variant
/// on, the same way the teacher's `ClientTarget` carries Unix/Vsock variants
/// alongside the one actually exercised in `main`.
#[allow(dead_code)]
enum SourceTarget {
    Tcp(SocketAddr),
}

impl SourceTarget {
    async fn connect(&self) -> TcpTransport {
        match self {
            SourceTarget::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .await
                    .expect("failed to connect to sink");
                TcpTransport::new(stream)
            }
        }
    }
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

fn hello() -> HelloPayload {
    HelloPayload {
        software_version: 1,
        min_proto: 1,
        max_proto: 1,
        max_width: 3840,
        max_height: 2160,
        max_fps_fixed: 60 << 16,
        capabilities: Capabilities::NONE,
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:4242".to_string())
        .parse()
        .expect("expected HOST:PORT");
    let target = SourceTarget::Tcp(addr);
    log::info!("connecting to sink at {addr}");
    let transport = target.connect().await;

    let mut source = Source::connect(transport, hello())
        .await
        .expect("handshake with sink failed");

    source.observe_state(Box::new(|from, to| {
        log::info!("state: {from:?} -> {to:?}");
    }));
    source.observe_stats(Box::new(|snap| {
        log::info!(
            "fps={:.1} bitrate={}bps dropped={} latency={}us",
            snap.current_fps,
            snap.current_bitrate_bps,
            snap.frames_dropped,
            snap.latency_us
        );
    }));

    let config = StreamConfig::new(1920, 1080, 30, 8_000_000);
    let encoder = swrp_engine::media::PassthroughEncoder;
    let capture = SyntheticCapture::new(config.width, config.height, now_us);

    source
        .start_streaming(config, encoder, capture)
        .await
        .expect("peer rejected START");
    log::info!("streaming, state={:?}", source.state());

    tokio::signal::ctrl_c().await.ok();
    log::info!("shutting down");
    source.stop_streaming().await.ok();
    source.disconnect().ok();
    assert_eq!(source.state(), PipelineState::Disconnected);
}
