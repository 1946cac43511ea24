use thiserror::Error;

/// Error taxonomy of the BSP engine.
///
/// The recoverable variants (`MalformedPacket`, `OutOfSequence`) are handled locally by
///  dropping the offending packet - they are expected under a lossy datagram substrate and
///  never surface to application code. The fatal variants abort the connection.
#[derive(Debug, Error)]
pub enum BspError {
    /// checksum or length mismatch on decode - the packet is discarded
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// incoming data id does not equal the expected receive position - dropped silently,
    ///  recovery is peer-driven retransmission
    #[error("packet out of sequence: expected position {expected}, got {actual}")]
    OutOfSequence { expected: u32, actual: u32 },

    /// the peer acknowledged a position that cannot be matched inside the retained send
    ///  window - the data has aged out and cannot be replayed
    #[error("send window out of sync: peer acknowledged position {acked} which is not in the retained window")]
    WindowDesync { acked: u32 },

    /// ack or data wait timed out after exhausting retries
    #[error("peer unresponsive: {0}")]
    PeerUnresponsive(String),

    /// the peer violated the protocol, e.g. a mark packet with more than one content byte
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// rendezvous attempted while the worker pool is full - the connection request is refused
    #[error("worker pool is at capacity, refusing rendezvous")]
    CapacityExceeded,

    /// the channel was destroyed while an operation was blocked on it
    #[error("channel is destroyed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, BspError>;
