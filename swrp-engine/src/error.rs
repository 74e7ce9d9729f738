//! Engine-level error taxonomy (§7): wraps the wire protocol's framing
//! errors and adds the handshake, transport, and encoder/decoder kinds that
//! only make sense once a pipeline is driving the wire layer.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the source/sink pipelines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A framing error while parsing or serializing a packet. Recovered
    /// automatically by the receive loop unless it recurs.
    Wire(swrp_wire::Error),

    /// A packet of an unexpected type arrived during a handshake phase.
    UnexpectedPacketType {
        expected: swrp_wire::PacketType,
        actual: swrp_wire::PacketType,
    },

    /// The peer rejected a handshake step (non-zero `START_ACK.status`, or
    /// an explicit protocol-level refusal).
    HandshakeFailed { reason: &'static str },

    /// A handshake phase did not complete within its deadline.
    Timeout,

    /// The transport reported the peer is gone.
    Disconnected,

    /// The transport's send/receive half errored or the mock channel closed.
    ChannelClosed,

    /// The external capture/encoder/decoder collaborator isn't ready yet.
    NotReady,

    /// The external encoder failed to encode a captured frame.
    EncodingFailed,

    /// The external encoder failed to flush pending frames on stop.
    FlushFailed,

    /// Setting a property on the external encoder/decoder failed.
    PropertySetFailed,

    /// The external decoder rejected a reassembled frame's bytes.
    InvalidInput,

    /// The pipeline state machine was asked to make a transition that is
    /// not in the table of §4.6.
    IllegalTransition {
        from: crate::state::PipelineState,
        to: crate::state::PipelineState,
    },
}

impl From<swrp_wire::Error> for Error {
    fn from(e: swrp_wire::Error) -> Self {
        Error::Wire(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Wire(e) => write!(f, "wire protocol error: {e}"),
            Error::UnexpectedPacketType { expected, actual } => write!(
                f,
                "unexpected packet type: expected {expected:?}, got {actual:?}"
            ),
            Error::HandshakeFailed { reason } => write!(f, "handshake failed: {reason}"),
            Error::Timeout => f.write_str("operation timed out"),
            Error::Disconnected => f.write_str("peer disconnected"),
            Error::ChannelClosed => f.write_str("transport channel closed"),
            Error::NotReady => f.write_str("codec not ready"),
            Error::EncodingFailed => f.write_str("encoding failed"),
            Error::FlushFailed => f.write_str("encoder flush failed"),
            Error::PropertySetFailed => f.write_str("property set failed"),
            Error::InvalidInput => f.write_str("invalid input to decoder"),
            Error::IllegalTransition { from, to } => {
                write!(f, "illegal pipeline transition: {from:?} -> {to:?}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Wire(e) => Some(e),
            _ => None,
        }
    }
}
