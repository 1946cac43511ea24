use crate::error::{BspError, Result};
use crate::port::Port;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// maximum number of content bytes in a single PUP
pub const MAX_CONTENTS_LEN: usize = 532;

/// fixed header: length (u16), control (u8), type (u8), id (u32), two ports (6 bytes each)
pub const HEADER_LEN: usize = 20;

pub const CHECKSUM_LEN: usize = 2;

/// The PUP type byte. Only the types relevant to the BSP engine are modeled; anything else
///  fails decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Error = 4,
    ConnectionRequest = 8,
    Abort = 9,
    End = 10,
    EndReply = 11,
    Data = 16,
    AckRequestingData = 17,
    Ack = 18,
    Mark = 19,
    Interrupt = 20,
    InterruptReply = 21,
    AckRequestingMark = 22,
}

impl PacketType {
    /// true for the types whose contents are stream bytes and whose id is a stream position
    pub fn is_data(&self) -> bool {
        matches!(self, PacketType::Data | PacketType::AckRequestingData | PacketType::Mark | PacketType::AckRequestingMark)
    }

    /// true for the two single-byte out-of-band mark types
    pub fn is_mark(&self) -> bool {
        matches!(self, PacketType::Mark | PacketType::AckRequestingMark)
    }

    pub fn requests_ack(&self) -> bool {
        matches!(self, PacketType::AckRequestingData | PacketType::AckRequestingMark)
    }
}

/// A single PUP. For data-bearing types the id is the cumulative byte-stream position of the
///  first content byte, not a packet sequence number; for control types it carries
///  connection-establishment or positional metadata.
///
/// Packets are immutable once constructed; the checksum is computed during `encode` and
///  verified during `decode`, it is never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub id: u32,
    pub destination: Port,
    pub source: Port,
    pub contents: Vec<u8>,
}

impl Packet {
    pub fn new(packet_type: PacketType, id: u32, destination: Port, source: Port, contents: Vec<u8>) -> Packet {
        Packet { packet_type, id, destination, source, contents }
    }

    /// Serialize to the wire format. Contents are padded to a 16-bit word boundary (the
    ///  checksum covers the pad byte); the length field records the unpadded length.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.contents.len() > MAX_CONTENTS_LEN {
            return Err(BspError::MalformedPacket(format!("contents length {} exceeds the maximum of {}", self.contents.len(), MAX_CONTENTS_LEN)));
        }

        let declared_len = HEADER_LEN + self.contents.len() + CHECKSUM_LEN;

        let mut buf = BytesMut::with_capacity(declared_len + 1);
        buf.put_u16(declared_len as u16);
        buf.put_u8(0); // control byte, reserved
        buf.put_u8(self.packet_type.into());
        buf.put_u32(self.id);
        self.destination.ser(&mut buf);
        self.source.ser(&mut buf);
        buf.put_slice(&self.contents);
        if self.contents.len() % 2 == 1 {
            buf.put_u8(0);
        }
        let checksum = fold_checksum(&buf);
        buf.put_u16(checksum);

        Ok(buf.to_vec())
    }

    /// Parse and validate a received buffer. Any length or checksum mismatch is
    ///  `MalformedPacket` - such packets are dropped by the caller, never surfaced.
    pub fn decode(buf: &[u8]) -> Result<Packet> {
        if buf.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err(BspError::MalformedPacket(format!("buffer of {} bytes is shorter than the minimal packet", buf.len())));
        }

        let declared_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if declared_len < HEADER_LEN + CHECKSUM_LEN
            || declared_len > HEADER_LEN + MAX_CONTENTS_LEN + CHECKSUM_LEN
        {
            return Err(BspError::MalformedPacket(format!("declared length {} is outside the valid range", declared_len)));
        }
        // on the wire the contents are padded to a word boundary, the checksum word follows the pad
        if buf.len() != declared_len + (declared_len % 2) {
            return Err(BspError::MalformedPacket(format!("declared length {} does not match buffer length {}", declared_len, buf.len())));
        }

        let actual_checksum = u16::from_be_bytes([buf[buf.len() - 2], buf[buf.len() - 1]]);
        let expected_checksum = fold_checksum(&buf[..buf.len() - CHECKSUM_LEN]);
        if actual_checksum != expected_checksum {
            return Err(BspError::MalformedPacket(format!("checksum mismatch: expected {:#06x}, got {:#06x}", expected_checksum, actual_checksum)));
        }

        let mut parse_buf = &buf[2..];
        let _control = parse_buf.try_get_u8()
            .map_err(|_| BspError::MalformedPacket("truncated header".to_string()))?;
        let raw_type = parse_buf.try_get_u8()
            .map_err(|_| BspError::MalformedPacket("truncated header".to_string()))?;
        let packet_type = PacketType::try_from(raw_type)
            .map_err(|_| BspError::MalformedPacket(format!("unknown packet type {}", raw_type)))?;
        let id = parse_buf.try_get_u32()
            .map_err(|_| BspError::MalformedPacket("truncated header".to_string()))?;
        let destination = Port::deser(&mut parse_buf)?;
        let source = Port::deser(&mut parse_buf)?;

        let contents = buf[HEADER_LEN..declared_len - CHECKSUM_LEN].to_vec();

        Ok(Packet { packet_type, id, destination, source, contents })
    }
}

/// The PUP software checksum: the buffer is processed as big-endian 16-bit words with a 32-bit
///  accumulator; each word is added, the carry is folded back into the low 16 bits, the
///  accumulator is rotated left by one bit (shift plus another carry-fold), and a final
///  all-ones result is normalized to zero. This must stay bit-for-bit compatible with legacy
///  peers.
pub fn fold_checksum(buf: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for word in buf.chunks_exact(2) {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
        sum = (sum >> 16) + (sum & 0xffff);
        sum <<= 1;
        sum = (sum >> 16) + (sum & 0xffff);
    }
    while sum > 0xffff {
        sum = (sum >> 16) + (sum & 0xffff);
    }

    if sum == 0xffff {
        0
    }
    else {
        sum as u16
    }
}
