//! A reliable byte-stream protocol engine on top of an unreliable datagram substrate,
//!  modeled on the classic PUP internetwork's Byte Stream Protocol.
//!
//! ## Design goals
//!
//! * The unit on the wire is a *PUP*: a self-describing, checksummed datagram of at most 532
//!   content bytes. PUPs can be carried by anything that moves small binary blobs (this crate
//!   ships a UDP encapsulation, see [`transport::UdpPacketSink`])
//! * On top of PUPs, the *BSP* layer provides connections with a reliable, in-order byte
//!   stream in each direction
//!   * the stream position (not a packet counter) is the sequence number: each data packet's
//!     id is the cumulative position of its first byte
//!   * go-back-N retransmission driven by cumulative, positional acknowledgments; the
//!     receiver silently drops anything out of sequence
//!   * the send window is bounded by what the peer advertises in its acks
//! * Out-of-band *marks* travel in-line with the stream, giving applications record
//!   boundaries that interrupt a blocking read at a well-defined position
//! * Connections rendezvous through well-known *sockets*: a connection request to a service
//!   socket is answered from a freshly allocated ephemeral port, leaving the service socket
//!   free for the next client
//! * A graceful three-way End handshake with a dally period, so the closing handshake is
//!   itself robust against packet loss; everything non-graceful goes through Abort
//!
//! ## Wire format
//!
//! All numbers in network byte order (BE):
//! ```ascii
//!  0: length (u16) - header + contents + checksum, without the pad byte
//!  2: transport control (u8) - zero, reserved for hop-by-hop use
//!  3: packet type (u8)
//!  4: id (u32) - stream position for data types, metadata for control types
//!  8: destination port (network u8, host u8, socket u32)
//! 14: source port (network u8, host u8, socket u32)
//! 20: contents (up to 532 bytes, padded to a 16-bit word boundary)
//!     checksum (u16) - add-and-left-rotate over every preceding word
//! ```
//!
//! ## Packet types
//!
//! | type | meaning             |
//! |------|---------------------|
//! | 4    | Error               |
//! | 8    | ConnectionRequest   |
//! | 9    | Abort               |
//! | 10   | End                 |
//! | 11   | EndReply            |
//! | 16   | Data                |
//! | 17   | AckRequestingData   |
//! | 18   | Ack                 |
//! | 19   | Mark                |
//! | 20   | Interrupt           |
//! | 21   | InterruptReply      |
//! | 22   | AckRequestingMark   |
//!
//! ## Structure
//!
//! [`manager::BspManager`] is the per-node entry point: the transport adapter feeds raw
//!  datagrams into it, and it dispatches them to [`channel::Channel`]s. Application code
//!  implements [`worker::WorkerFactory`] and registers it on a service socket; each accepted
//!  connection hands a channel to a fresh worker, which reads and writes the byte stream and
//!  never sees packets.

pub mod channel;
pub mod config;
mod control_messages;
pub mod error;
pub mod manager;
mod output_consumer;
pub mod packet;
pub mod port;
mod send_window;
pub mod socket_id;
pub mod transport;
pub mod wire_string;
pub mod worker;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
