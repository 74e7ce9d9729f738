//! SWRP — the wire protocol at the core of SerialWarp's screen-streaming
//! link. This crate owns the bit-exact framing (magic, header, CRC32C),
//! the closed set of packet types and their typed payloads, and the
//! segmenter/reassembler that maps a variable-size encoded video frame onto
//! fixed-bounded transport units. It is deliberately dumb about scheduling,
//! flow control, and I/O — those live one layer up in `swrp-engine`.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod codec;
pub mod crc32c;
pub mod error;
pub mod packet;
pub mod segment;

pub use crc32c::crc32c;
pub use error::{Error, Result};
pub use packet::{
    Capabilities, FrameAckPayload, FrameHeaderPayload, HelloPayload, Packet, PacketHeader,
    PacketType, PingPayload, PongPayload, StartAckPayload, StartPayload, CRC_SIZE, HEADER_SIZE,
    MAGIC, VERSION,
};
pub use segment::{EncodedFrame, FrameSegment, Reassembler, Segmenter, SEGMENT_SIZE};
