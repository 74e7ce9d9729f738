//! Async engine on top of `swrp-wire`: the source and sink pipelines, their
//! credit-based flow control, their shared lifecycle state machine, and the
//! transport/media collaborator contracts they run against.
//!
//! Each pipeline is a small fixed set of cooperating `tokio` tasks wired
//! together by bounded channels and a shared flow-control object (§5): no
//! suspension happens inside packet parsing, CRC verification, segmentation,
//! or a state-machine transition — only inside `capture()`, `encode()`,
//! `decode()`, `present()`, and the transport's own `send`/`receive`.

pub mod error;
pub mod flow;
pub mod link;
pub mod media;
pub mod observer;
pub mod session;
pub mod sink;
pub mod source;
pub mod state;
pub mod transport;

pub use error::{Error, Result};
pub use media::{Capture, CapturedFrame, DecodedFrame, Decoder, Display, Encoder};
pub use observer::{ErrorObserver, PreviewObserver, StatsObserver};
pub use session::{SessionStats, StatsSnapshot, StreamConfig};
pub use sink::Sink;
pub use source::Source;
pub use state::{PipelineState, StateObserver};
pub use transport::{MockTransport, TcpTransport, Transport};
