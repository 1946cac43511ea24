use crate::error::{BspError, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt::{Display, Formatter};

/// A PUP endpoint: network and host are single octets, the socket is a 32-bit well-known or
///  ephemeral number. Two ports (source, destination) appear in every packet, and the
///  destination socket keys the manager's channel registry.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Port {
    pub network: u8,
    pub host: u8,
    pub socket: u32,
}

impl Port {
    pub const SERIALIZED_LEN: usize = 6;

    pub fn new(network: u8, host: u8, socket: u32) -> Port {
        Port { network, host, socket }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.network);
        buf.put_u8(self.host);
        buf.put_u32(self.socket);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<Port> {
        let network = buf.try_get_u8()
            .map_err(|_| BspError::MalformedPacket("port is truncated".to_string()))?;
        let host = buf.try_get_u8()
            .map_err(|_| BspError::MalformedPacket("port is truncated".to_string()))?;
        let socket = buf.try_get_u32()
            .map_err(|_| BspError::MalformedPacket("port is truncated".to_string()))?;
        Ok(Port { network, host, socket })
    }
}

impl Display for Port {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}#{:x}", self.network, self.host, self.socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(Port::new(0, 0, 0), vec![0, 0, 0, 0, 0, 0])]
    #[case::well_known(Port::new(1, 2, 5), vec![1, 2, 0, 0, 0, 5])]
    #[case::ephemeral(Port::new(0xaa, 0xbb, 0x1234_5678), vec![0xaa, 0xbb, 0x12, 0x34, 0x56, 0x78])]
    fn test_ser_deser(#[case] port: Port, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        port.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let mut b: &[u8] = &buf;
        let deser = Port::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, port);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::one(vec![1])]
    #[case::five(vec![1, 2, 3, 4, 5])]
    fn test_deser_truncated(#[case] buf: Vec<u8>) {
        let mut b: &[u8] = &buf;
        assert!(matches!(Port::deser(&mut b), Err(BspError::MalformedPacket(_))));
    }
}
