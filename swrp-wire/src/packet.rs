//! SWRP packet layer (C3): header, typed payloads, CRC framing.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     magic ("SWRP", LE)                      |
//! +---------------+---------------+-------------------------------+
//! |    version    |  packet_type  |             flags             |
//! +---------------+---------------+-------------------------------+
//! |                           sequence                           |
//! +---------------------------------------------------------------+
//! |                        payload_length                        |
//! +---------------------------------------------------------------+
//! |                        payload (variable)                     |
//! +---------------------------------------------------------------+
//! |                           crc32c                              |
//! +---------------------------------------------------------------+
//! ```
//!
//! The CRC covers the 16-byte header and the payload; it does not cover
//! itself. All integers are little-endian.

use crate::codec::{Reader, Writer};
use crate::crc32c::crc32c_slices;
use crate::error::{Error, Result};
use alloc::vec::Vec;

/// The four magic bytes `'S','W','R','P'`, read as a little-endian `u32`
/// (so the first byte on the wire is `0x53`).
pub const MAGIC: u32 = 0x5052_5753;

/// The only protocol version this crate understands.
pub const VERSION: u8 = 1;

/// Fixed header size in bytes: magic(4) | version(1) | packet_type(1) |
/// flags(2) | sequence(4) | payload_length(4).
pub const HEADER_SIZE: usize = 16;

/// Trailing CRC32C size in bytes.
pub const CRC_SIZE: usize = 4;

/// The closed set of packet types that can appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Hello = 0x01,
    HelloAck = 0x02,
    Start = 0x03,
    StartAck = 0x04,
    Frame = 0x10,
    FrameAck = 0x11,
    Stop = 0x30,
    StopAck = 0x31,
    Ping = 0x40,
    Pong = 0x41,
}

impl PacketType {
    /// Converts a raw byte to a `PacketType`, or `None` if it falls outside
    /// the closed set.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::HelloAck),
            0x03 => Some(Self::Start),
            0x04 => Some(Self::StartAck),
            0x10 => Some(Self::Frame),
            0x11 => Some(Self::FrameAck),
            0x30 => Some(Self::Stop),
            0x31 => Some(Self::StopAck),
            0x40 => Some(Self::Ping),
            0x41 => Some(Self::Pong),
            _ => None,
        }
    }

    /// Returns the response type for a request type, or `None` if this type
    /// has no response (it *is* a response, or is one-way).
    pub const fn response(self) -> Option<Self> {
        match self {
            Self::Hello => Some(Self::HelloAck),
            Self::Start => Some(Self::StartAck),
            Self::Frame => Some(Self::FrameAck),
            Self::Stop => Some(Self::StopAck),
            Self::Ping => Some(Self::Pong),
            _ => None,
        }
    }
}

/// Capability bits carried in HELLO/HELLO_ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(pub u32);

impl Capabilities {
    pub const NONE: Self = Self(0);
    pub const HIDPI: Self = Self(0x01);
    pub const AUDIO: Self = Self(0x02);

    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// The fixed 16-byte packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub flags: u16,
    pub sequence: u32,
    pub payload_length: u32,
}

/// A parsed or to-be-serialized SWRP packet: header plus opaque payload
/// bytes. Payload interpretation is determined by `header.packet_type`; use
/// the typed payload structs below to encode/decode it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Builds a packet from a type, sequence number, and raw payload bytes.
    pub fn new(packet_type: PacketType, sequence: u32, payload: Vec<u8>) -> Self {
        Self {
            header: PacketHeader {
                packet_type,
                flags: 0,
                sequence,
                payload_length: payload.len() as u32,
            },
            payload,
        }
    }

    /// Serializes the packet to wire bytes: header | payload | crc32c.
    /// The checksum is always computed last, over the header and payload.
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(HEADER_SIZE + self.payload.len() + CRC_SIZE);
        w.write_u32_le(MAGIC);
        w.write_u8(VERSION);
        w.write_u8(self.header.packet_type as u8);
        w.write_u16_le(self.header.flags);
        w.write_u32_le(self.header.sequence);
        w.write_u32_le(self.payload.len() as u32);
        w.write_bytes(&self.payload);

        let checksum = crc32c_slices(&[&w.as_slice()[..HEADER_SIZE], &self.payload]);
        w.write_u32_le(checksum);
        w.into_vec()
    }

    /// Parses exactly one packet from the front of `buf`, returning the
    /// packet and the number of bytes consumed. Trailing bytes (the start of
    /// the next packet) are left untouched.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::BufferTooShort {
                needed: HEADER_SIZE,
                available: buf.len(),
            });
        }

        let mut r = Reader::new(buf);
        let magic = r.read_u32_le()?;
        if magic != MAGIC {
            return Err(Error::InvalidMagic);
        }

        let version = r.read_u8()?;
        if version != VERSION {
            return Err(Error::UnsupportedVersion);
        }

        let raw_type = r.read_u8()?;
        let packet_type = PacketType::from_u8(raw_type).ok_or(Error::UnknownPacketType)?;
        let flags = r.read_u16_le()?;
        let sequence = r.read_u32_le()?;
        let payload_length = r.read_u32_le()?;

        let total_len = HEADER_SIZE + payload_length as usize + CRC_SIZE;
        if buf.len() < total_len {
            return Err(Error::BufferTooShort {
                needed: total_len,
                available: buf.len(),
            });
        }

        let payload = r.read_slice(payload_length as usize)?;
        let stored_crc = u32::from_le_bytes(
            buf[HEADER_SIZE + payload.len()..total_len]
                .try_into()
                .unwrap(),
        );

        let computed_crc = crc32c_slices(&[&buf[..HEADER_SIZE], payload]);
        if stored_crc != computed_crc {
            return Err(Error::ChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        if packet_type == PacketType::Frame {
            validate_frame_header(payload)?;
        }

        Ok((
            Packet {
                header: PacketHeader {
                    packet_type,
                    flags,
                    sequence,
                    payload_length,
                },
                payload: payload.to_vec(),
            },
            total_len,
        ))
    }
}

fn validate_frame_header(payload: &[u8]) -> Result<()> {
    FrameHeaderPayload::from_bytes(payload)?;
    Ok(())
}

/// HELLO / HELLO_ACK payload (28 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloPayload {
    pub software_version: u16,
    pub min_proto: u16,
    pub max_proto: u16,
    pub max_width: u32,
    pub max_height: u32,
    /// 16.16 fixed-point fps: `fps << 16`.
    pub max_fps_fixed: u32,
    pub capabilities: Capabilities,
}

impl HelloPayload {
    pub const WIRE_SIZE: usize = 28;

    pub fn to_bytes(self) -> Vec<u8> {
        let mut w = Writer::with_capacity(Self::WIRE_SIZE);
        w.write_u16_le(self.software_version);
        w.write_u16_le(self.min_proto);
        w.write_u16_le(self.max_proto);
        w.write_u16_le(0); // reserved
        w.write_u32_le(self.max_width);
        w.write_u32_le(self.max_height);
        w.write_u32_le(self.max_fps_fixed);
        w.write_u32_le(self.capabilities.0);
        w.write_u32_le(0); // reserved
        w.into_vec()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::WIRE_SIZE {
            return Err(Error::InvalidPayloadLength);
        }
        let mut r = Reader::new(buf);
        let software_version = r.read_u16_le()?;
        let min_proto = r.read_u16_le()?;
        let max_proto = r.read_u16_le()?;
        r.skip(2)?; // reserved
        let max_width = r.read_u32_le()?;
        let max_height = r.read_u32_le()?;
        let max_fps_fixed = r.read_u32_le()?;
        let capabilities = Capabilities(r.read_u32_le()?);
        r.skip(4)?; // reserved
        Ok(Self {
            software_version,
            min_proto,
            max_proto,
            max_width,
            max_height,
            max_fps_fixed,
            capabilities,
        })
    }
}

/// START payload (24 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartPayload {
    pub width: u32,
    pub height: u32,
    /// 16.16 fixed-point fps: `fps << 16`.
    pub fps_fixed: u32,
    pub bitrate_bps: u32,
    pub pixel_format: u8,
    pub audio_enabled: bool,
    pub audio_sample_rate: u16,
    pub audio_channels: u8,
    pub audio_bits: u8,
}

impl StartPayload {
    pub const WIRE_SIZE: usize = 24;

    pub fn to_bytes(self) -> Vec<u8> {
        let mut w = Writer::with_capacity(Self::WIRE_SIZE);
        w.write_u32_le(self.width);
        w.write_u32_le(self.height);
        w.write_u32_le(self.fps_fixed);
        w.write_u32_le(self.bitrate_bps);
        w.write_u8(self.pixel_format);
        w.write_u8(self.audio_enabled as u8);
        w.write_u16_le(self.audio_sample_rate);
        w.write_u8(self.audio_channels);
        w.write_u8(self.audio_bits);
        w.write_u16_le(0); // reserved
        w.into_vec()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::WIRE_SIZE {
            return Err(Error::InvalidPayloadLength);
        }
        let mut r = Reader::new(buf);
        let width = r.read_u32_le()?;
        let height = r.read_u32_le()?;
        if width == 0 || height == 0 {
            return Err(Error::InvalidPayloadLength);
        }
        let fps_fixed = r.read_u32_le()?;
        let bitrate_bps = r.read_u32_le()?;
        let pixel_format = r.read_u8()?;
        let audio_enabled = r.read_u8()? != 0;
        let audio_sample_rate = r.read_u16_le()?;
        let audio_channels = r.read_u8()?;
        let audio_bits = r.read_u8()?;
        r.skip(2)?; // reserved
        Ok(Self {
            width,
            height,
            fps_fixed,
            bitrate_bps,
            pixel_format,
            audio_enabled,
            audio_sample_rate,
            audio_channels,
            audio_bits,
        })
    }

    /// Whole frames per second, discarding the 16.16 fractional bits.
    pub const fn fps(&self) -> u32 {
        self.fps_fixed >> 16
    }
}

/// Status code carried in START_ACK. `0` means OK; anything else is a
/// rejection reason private to the negotiating endpoints.
pub type StartAckStatus = u8;

/// START_ACK payload (4 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartAckPayload {
    pub status: StartAckStatus,
    pub initial_credits: u16,
}

impl StartAckPayload {
    pub const WIRE_SIZE: usize = 4;
    pub const STATUS_OK: StartAckStatus = 0;

    pub fn to_bytes(self) -> Vec<u8> {
        let mut w = Writer::with_capacity(Self::WIRE_SIZE);
        w.write_u8(self.status);
        w.write_u8(0); // reserved
        w.write_u16_le(self.initial_credits);
        w.into_vec()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::WIRE_SIZE {
            return Err(Error::InvalidPayloadLength);
        }
        let mut r = Reader::new(buf);
        let status = r.read_u8()?;
        r.skip(1)?; // reserved
        let initial_credits = r.read_u16_le()?;
        Ok(Self {
            status,
            initial_credits,
        })
    }

    pub const fn is_ok(&self) -> bool {
        self.status == Self::STATUS_OK
    }
}

/// FRAME payload header (32 bytes, followed by the segment's data bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeaderPayload {
    pub frame_number: u64,
    pub pts_us: u64,
    pub capture_ts_us: u64,
    pub frame_size: u32,
    pub segment_index: u16,
    pub segment_count: u16,
}

impl FrameHeaderPayload {
    pub const WIRE_SIZE: usize = 32;

    /// Serializes the 32-byte header followed by `data` into one payload.
    pub fn to_bytes(self, data: &[u8]) -> Vec<u8> {
        let mut w = Writer::with_capacity(Self::WIRE_SIZE + data.len());
        w.write_u64_le(self.frame_number);
        w.write_u64_le(self.pts_us);
        w.write_u64_le(self.capture_ts_us);
        w.write_u32_le(self.frame_size);
        w.write_u16_le(self.segment_index);
        w.write_u16_le(self.segment_count);
        w.write_bytes(data);
        w.into_vec()
    }

    /// Parses the header and returns it along with the trailing segment
    /// data slice. `segment_count > 0` and `segment_index < segment_count`
    /// are validated already by [`Packet::parse`]; this function re-checks
    /// them so it is also safe to call standalone.
    pub fn from_bytes(buf: &[u8]) -> Result<(Self, &[u8])> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(Error::InvalidPayloadLength);
        }
        let mut r = Reader::new(buf);
        let frame_number = r.read_u64_le()?;
        let pts_us = r.read_u64_le()?;
        let capture_ts_us = r.read_u64_le()?;
        let frame_size = r.read_u32_le()?;
        let segment_index = r.read_u16_le()?;
        let segment_count = r.read_u16_le()?;
        if segment_count == 0 || segment_index >= segment_count {
            return Err(Error::FrameReassemblyError);
        }
        let data = r.read_slice(buf.len() - Self::WIRE_SIZE)?;
        Ok((
            Self {
                frame_number,
                pts_us,
                capture_ts_us,
                frame_size,
                segment_index,
                segment_count,
            },
            data,
        ))
    }
}

/// FRAME_ACK payload (16 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAckPayload {
    pub frame_number: u64,
    pub decode_time_us: u32,
    pub credits_returned: u16,
}

impl FrameAckPayload {
    pub const WIRE_SIZE: usize = 16;

    pub fn to_bytes(self) -> Vec<u8> {
        let mut w = Writer::with_capacity(Self::WIRE_SIZE);
        w.write_u64_le(self.frame_number);
        w.write_u32_le(self.decode_time_us);
        w.write_u16_le(self.credits_returned);
        w.write_u16_le(0); // reserved
        w.into_vec()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::WIRE_SIZE {
            return Err(Error::InvalidPayloadLength);
        }
        let mut r = Reader::new(buf);
        let frame_number = r.read_u64_le()?;
        let decode_time_us = r.read_u32_le()?;
        let credits_returned = r.read_u16_le()?;
        r.skip(2)?; // reserved
        Ok(Self {
            frame_number,
            decode_time_us,
            credits_returned,
        })
    }
}

/// PING payload (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPayload {
    pub timestamp_us: u64,
}

impl PingPayload {
    pub const WIRE_SIZE: usize = 8;

    pub fn to_bytes(self) -> Vec<u8> {
        let mut w = Writer::with_capacity(Self::WIRE_SIZE);
        w.write_u64_le(self.timestamp_us);
        w.into_vec()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::WIRE_SIZE {
            return Err(Error::InvalidPayloadLength);
        }
        let mut r = Reader::new(buf);
        Ok(Self {
            timestamp_us: r.read_u64_le()?,
        })
    }
}

/// PONG payload (16 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PongPayload {
    pub ping_timestamp_us: u64,
    pub pong_timestamp_us: u64,
}

impl PongPayload {
    pub const WIRE_SIZE: usize = 16;

    pub fn to_bytes(self) -> Vec<u8> {
        let mut w = Writer::with_capacity(Self::WIRE_SIZE);
        w.write_u64_le(self.ping_timestamp_us);
        w.write_u64_le(self.pong_timestamp_us);
        w.into_vec()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::WIRE_SIZE {
            return Err(Error::InvalidPayloadLength);
        }
        let mut r = Reader::new(buf);
        Ok(Self {
            ping_timestamp_us: r.read_u64_le()?,
            pong_timestamp_us: r.read_u64_le()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(p: Packet) {
        let bytes = p.serialize();
        let (decoded, consumed) = Packet::parse(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, p);
    }

    #[test]
    fn hello_roundtrips() {
        let payload = HelloPayload {
            software_version: 7,
            min_proto: 1,
            max_proto: 1,
            max_width: 3840,
            max_height: 2160,
            max_fps_fixed: 120 << 16,
            capabilities: Capabilities::HIDPI,
        }
        .to_bytes();
        roundtrip(Packet::new(PacketType::Hello, 1, payload));
    }

    #[test]
    fn start_roundtrips() {
        let payload = StartPayload {
            width: 1920,
            height: 1080,
            fps_fixed: 60 << 16,
            bitrate_bps: 20_000_000,
            pixel_format: 0,
            audio_enabled: false,
            audio_sample_rate: 0,
            audio_channels: 0,
            audio_bits: 0,
        }
        .to_bytes();
        roundtrip(Packet::new(PacketType::Start, 2, payload));
    }

    #[test]
    fn start_ack_roundtrips() {
        let payload = StartAckPayload {
            status: 0,
            initial_credits: 8,
        }
        .to_bytes();
        roundtrip(Packet::new(PacketType::StartAck, 3, payload));
    }

    #[test]
    fn frame_roundtrips_with_segment_data() {
        let payload = FrameHeaderPayload {
            frame_number: 1,
            pts_us: 1000,
            capture_ts_us: 2000,
            frame_size: 4,
            segment_index: 0,
            segment_count: 1,
        }
        .to_bytes(&[0x01, 0x02, 0x03, 0x04]);
        roundtrip(Packet::new(PacketType::Frame, 4, payload));
    }

    #[test]
    fn frame_ack_roundtrips() {
        let payload = FrameAckPayload {
            frame_number: 1,
            decode_time_us: 1500,
            credits_returned: 1,
        }
        .to_bytes();
        roundtrip(Packet::new(PacketType::FrameAck, 5, payload));
    }

    #[test]
    fn stop_and_stop_ack_have_empty_payloads() {
        roundtrip(Packet::new(PacketType::Stop, 6, Vec::new()));
        roundtrip(Packet::new(PacketType::StopAck, 7, Vec::new()));
    }

    #[test]
    fn ping_pong_roundtrip() {
        let ping = PingPayload { timestamp_us: 42 }.to_bytes();
        roundtrip(Packet::new(PacketType::Ping, 8, ping));

        let pong = PongPayload {
            ping_timestamp_us: 42,
            pong_timestamp_us: 99,
        }
        .to_bytes();
        roundtrip(Packet::new(PacketType::Pong, 9, pong));
    }

    #[test]
    fn rejects_short_buffer() {
        let bytes = [0u8; 10];
        assert_eq!(
            Packet::parse(&bytes).unwrap_err(),
            Error::BufferTooShort {
                needed: HEADER_SIZE,
                available: 10
            }
        );
    }

    #[test]
    fn rejects_bad_magic() {
        let payload = PingPayload { timestamp_us: 1 }.to_bytes();
        let mut bytes = Packet::new(PacketType::Ping, 1, payload).serialize();
        bytes[0] ^= 0xFF;
        assert_eq!(Packet::parse(&bytes).unwrap_err(), Error::InvalidMagic);
    }

    #[test]
    fn rejects_unsupported_version() {
        let payload = PingPayload { timestamp_us: 1 }.to_bytes();
        let mut bytes = Packet::new(PacketType::Ping, 1, payload).serialize();
        bytes[4] = 2;
        assert_eq!(
            Packet::parse(&bytes).unwrap_err(),
            Error::UnsupportedVersion
        );
    }

    #[test]
    fn rejects_unknown_packet_type() {
        let payload = PingPayload { timestamp_us: 1 }.to_bytes();
        let mut bytes = Packet::new(PacketType::Ping, 1, payload).serialize();
        bytes[5] = 0xEE;
        assert_eq!(
            Packet::parse(&bytes).unwrap_err(),
            Error::UnknownPacketType
        );
    }

    #[test]
    fn single_bit_flip_in_payload_trips_checksum() {
        let payload = FrameHeaderPayload {
            frame_number: 1,
            pts_us: 1000,
            capture_ts_us: 2000,
            frame_size: 4,
            segment_index: 0,
            segment_count: 1,
        }
        .to_bytes(&[0x01, 0x02, 0x03, 0x04]);
        let mut bytes = Packet::new(PacketType::Frame, 1, payload).serialize();
        let payload_start = HEADER_SIZE;
        bytes[payload_start] ^= 0x01;
        assert!(matches!(
            Packet::parse(&bytes),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn frame_header_rejects_zero_segment_count() {
        let payload = FrameHeaderPayload {
            frame_number: 1,
            pts_us: 0,
            capture_ts_us: 0,
            frame_size: 0,
            segment_index: 0,
            segment_count: 0,
        }
        .to_bytes(&[]);
        let bytes = Packet::new(PacketType::Frame, 1, payload).serialize();
        assert_eq!(
            Packet::parse(&bytes).unwrap_err(),
            Error::FrameReassemblyError
        );
    }

    #[test]
    fn start_rejects_zero_width_or_height() {
        let payload = StartPayload {
            width: 0,
            height: 1080,
            fps_fixed: 60 << 16,
            bitrate_bps: 1,
            pixel_format: 0,
            audio_enabled: false,
            audio_sample_rate: 0,
            audio_channels: 0,
            audio_bits: 0,
        }
        .to_bytes();
        assert_eq!(
            StartPayload::from_bytes(&payload).unwrap_err(),
            Error::InvalidPayloadLength
        );
    }

    #[test]
    fn response_type_mapping() {
        assert_eq!(PacketType::Hello.response(), Some(PacketType::HelloAck));
        assert_eq!(PacketType::HelloAck.response(), None);
        assert_eq!(PacketType::Frame.response(), Some(PacketType::FrameAck));
    }
}
