use crate::error::{BspError, Result};
use crate::port::Port;
use crate::wire_string;
use bytes::{Buf, BufMut, BytesMut};

/// Body of an Ack packet: the receiver's advertised capacity. The packet's id (not part of
///  this body) carries the receiver's current stream position, which the sender compares
///  against its own send position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessageAck {
    /// receive buffer space in bytes
    pub max_bytes: u16,
    /// maximum number of outstanding unacknowledged packets the receiver accepts - this is
    ///  what bounds the peer's send window
    pub max_pups: u16,
    /// bytes the acknowledging side has itself sent beyond the acked position (informational)
    pub bytes_sent: u16,
}

impl ControlMessageAck {
    pub const SERIALIZED_LEN: usize = 6;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(self.max_bytes);
        buf.put_u16(self.max_pups);
        buf.put_u16(self.bytes_sent);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<ControlMessageAck> {
        let max_bytes = buf.try_get_u16()
            .map_err(|_| BspError::MalformedPacket("truncated ack body".to_string()))?;
        let max_pups = buf.try_get_u16()
            .map_err(|_| BspError::MalformedPacket("truncated ack body".to_string()))?;
        let bytes_sent = buf.try_get_u16()
            .map_err(|_| BspError::MalformedPacket("truncated ack body".to_string()))?;
        Ok(ControlMessageAck { max_bytes, max_pups, bytes_sent })
    }
}

/// Body of a connection-request packet (both the client's request and the server's confirm):
///  the port the sending side wants the connection to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessageRendezvous {
    pub connection_port: Port,
}

impl ControlMessageRendezvous {
    pub fn ser(&self, buf: &mut BytesMut) {
        self.connection_port.ser(buf);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<ControlMessageRendezvous> {
        Ok(ControlMessageRendezvous {
            connection_port: Port::deser(buf)?,
        })
    }
}

/// Body of an Abort packet: a human-readable reason. Lenient on decode - aborts are
///  best-effort notifications and a garbled reason must not mask the abort itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessageAbort {
    pub reason: String,
}

impl ControlMessageAbort {
    pub fn to_bytes(&self) -> Vec<u8> {
        let truncated: String = self.reason.chars()
            .take(wire_string::MAX_LEN)
            .map(|ch| if u32::from(ch) > 0xff { '?' } else { ch })
            .collect();
        wire_string::encode(&truncated)
            .expect("truncated 8-bit reason is always encodable")
    }

    pub fn from_bytes(buf: &[u8]) -> ControlMessageAbort {
        let reason = wire_string::decode(buf)
            .unwrap_or_else(|_| "<unparseable abort reason>".to_string());
        ControlMessageAbort { reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(ControlMessageAck { max_bytes: 0, max_pups: 0, bytes_sent: 0 }, vec![0, 0, 0, 0, 0, 0])]
    #[case::typical(ControlMessageAck { max_bytes: 4256, max_pups: 8, bytes_sent: 532 }, vec![0x10, 0xa0, 0, 8, 0x02, 0x14])]
    fn test_ack_ser_deser(#[case] msg: ControlMessageAck, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let mut b: &[u8] = &buf;
        assert_eq!(ControlMessageAck::deser(&mut b).unwrap(), msg);
        assert!(b.is_empty());
    }

    #[test]
    fn test_ack_deser_truncated() {
        let mut b: &[u8] = &[0, 0, 0];
        assert!(matches!(ControlMessageAck::deser(&mut b), Err(BspError::MalformedPacket(_))));
    }

    #[test]
    fn test_rendezvous_round_trip() {
        let msg = ControlMessageRendezvous { connection_port: Port::new(1, 20, 0x3000) };
        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        assert_eq!(buf.as_ref(), &[1, 20, 0, 0, 0x30, 0]);

        let mut b: &[u8] = &buf;
        assert_eq!(ControlMessageRendezvous::deser(&mut b).unwrap(), msg);
    }

    #[rstest]
    #[case::simple("read timed out")]
    #[case::empty("")]
    fn test_abort_round_trip(#[case] reason: &str) {
        let msg = ControlMessageAbort { reason: reason.to_string() };
        assert_eq!(ControlMessageAbort::from_bytes(&msg.to_bytes()), msg);
    }

    #[test]
    fn test_abort_truncates_long_reason() {
        let msg = ControlMessageAbort { reason: "x".repeat(1000) };
        let decoded = ControlMessageAbort::from_bytes(&msg.to_bytes());
        assert_eq!(decoded.reason, "x".repeat(wire_string::MAX_LEN));
    }

    #[test]
    fn test_abort_lenient_decode() {
        let decoded = ControlMessageAbort::from_bytes(&[200, 1, 2]);
        assert_eq!(decoded.reason, "<unparseable abort reason>");
    }
}
