use crate::packet::MAX_CONTENTS_LEN;
use anyhow::bail;
use std::time::Duration;

/// Tunable constants of the BSP engine, injected at construction - there is no config file
///  or CLI surface at this level.
pub struct BspConfig {
    /// the network number of the node this engine runs on; clients that leave the network
    ///  byte of their requested connection port at zero get this value filled in
    pub local_network: u8,
    pub local_host: u8,

    /// upper bound for concurrently live application workers; rendezvous attempts beyond
    ///  this are refused (the request is dropped, the client retransmits into a hopefully
    ///  less busy server)
    pub max_workers: usize,

    /// how long a blocking read waits for data before the connection is considered dead
    pub read_timeout: Duration,

    /// how long the output consumer waits for an acknowledgment before retransmitting
    pub ack_timeout: Duration,

    /// number of ack waits before the connection is aborted as unresponsive
    pub ack_retries: u32,

    /// how long a channel lingers after answering an End, so a retransmitted End still gets
    ///  its EndReply. The legacy specification only describes this qualitatively; the
    ///  default is a deliberate, configurable choice.
    pub dally_timeout: Duration,

    /// the maxPups value advertised in outgoing acks: how many unacknowledged packets this
    ///  side is willing to buffer
    pub recv_window_pups: u16,

    /// the maxBytes value advertised in outgoing acks
    pub recv_window_bytes: u16,
}

impl BspConfig {
    pub fn for_host(local_network: u8, local_host: u8) -> BspConfig {
        BspConfig {
            local_network,
            local_host,
            max_workers: 32,
            read_timeout: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(1),
            ack_retries: 5,
            dally_timeout: Duration::from_secs(10),
            recv_window_pups: 8,
            recv_window_bytes: 8 * MAX_CONTENTS_LEN as u16,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_workers == 0 {
            bail!("max_workers must allow at least one worker");
        }
        if self.ack_retries == 0 {
            bail!("ack_retries must allow at least one attempt");
        }
        if self.recv_window_pups == 0 || self.recv_window_pups == u16::MAX {
            bail!("recv_window_pups must be a real window size (the all-ones value is the 'unknown' sentinel)");
        }
        Ok(())
    }
}
