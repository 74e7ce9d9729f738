//! Error types for the SWRP wire protocol.
//!
//! These are the protocol framing errors of the taxonomy: the kinds a
//! receiver can hit while parsing a single packet. Handshake, transport, and
//! encoder/decoder errors live one layer up, in `swrp-engine`.

use core::fmt;

/// Result type alias for SWRP wire operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors that can occur while parsing or serializing SWRP packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Fewer bytes are available than the packet declares it needs.
    BufferTooShort {
        /// Bytes required to make progress.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// The four magic bytes did not match `SWRP`.
    InvalidMagic,

    /// `protocol_version` is not a version this crate understands.
    UnsupportedVersion,

    /// `packet_type` is outside the closed set.
    UnknownPacketType,

    /// The trailing CRC32C did not match the computed checksum.
    ChecksumMismatch {
        /// Checksum carried on the wire.
        expected: u32,
        /// Checksum computed over header + payload.
        actual: u32,
    },

    /// A typed payload's `payload_length` doesn't match its fixed size.
    InvalidPayloadLength,

    /// A FRAME header failed reassembly-time validation
    /// (`segment_count == 0` or `segment_index >= segment_count`).
    FrameReassemblyError,

    /// A frame would require more than 65535 segments to transmit.
    TooManySegments,
}

impl Error {
    /// Returns a human-readable, stable description of the error.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Error::BufferTooShort { .. } => "buffer too short",
            Error::InvalidMagic => "invalid magic",
            Error::UnsupportedVersion => "unsupported protocol version",
            Error::UnknownPacketType => "unknown packet type",
            Error::ChecksumMismatch { .. } => "checksum mismatch",
            Error::InvalidPayloadLength => "invalid payload length",
            Error::FrameReassemblyError => "frame reassembly error",
            Error::TooManySegments => "frame requires too many segments",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BufferTooShort { needed, available } => write!(
                f,
                "buffer too short: needed {needed}, available {available}"
            ),
            Error::ChecksumMismatch { expected, actual } => write!(
                f,
                "checksum mismatch: expected {expected:#010x}, actual {actual:#010x}"
            ),
            other => f.write_str(other.as_str()),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
