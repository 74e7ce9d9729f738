use std::net::SocketAddr;
use swrp_engine::media::{NullDisplay, PassthroughDecoder};
use swrp_engine::{PipelineState, Sink, TcpTransport};
use swrp_wire::{Capabilities, HelloPayload};
use tokio::net::TcpListener;

const DEFAULT_CREDITS: u16 = 8;

/// Where this sink endpoint listens on. Only `Tcp` is wired up today — see
/// `SourceTarget` in the `source` binary for why.
#[allow(dead_code)]
enum SinkTarget {
    Tcp(SocketAddr),
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
    let _target = SinkTarget::Tcp(addr);
    let listener = TcpListener::bind(addr).await.expect("failed to bind");
    log::info!("listening for a source on {addr}");

    let (stream, peer) = listener.accept().await.expect("accept failed");
    log::info!("accepted connection from {peer}");
    let transport = TcpTransport::new(stream);

    let mut sink = Sink::wait_for_connection(transport, hello())
        .await
        .expect("handshake with source failed");

    sink.observe_state(Box::new(|from, to| {
        log::info!("state: {from:?} -> {to:?}");
    }));
    sink.observe_stats(Box::new(|snap| {
        log::info!(
            "frames_received={} dropped={} latency={}us",
            snap.frames_captured,
            snap.frames_dropped,
            snap.latency_us
        );
    }));

    sink.start_display(PassthroughDecoder, NullDisplay, DEFAULT_CREDITS)
        .await
        .expect("source did not START");
    log::info!("streaming, state={:?}", sink.state());

    tokio::signal::ctrl_c().await.ok();
    log::info!("shutting down");
    sink.stop_display().await.ok();
    sink.disconnect().ok();
    assert_eq!(sink.state(), PipelineState::Disconnected);
}
