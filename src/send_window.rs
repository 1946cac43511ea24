use crate::control_messages::ControlMessageAck;
use crate::error::{BspError, Result};
use crate::packet::PacketType;
use std::collections::VecDeque;
use tokio::sync::{Notify, RwLock};
use tracing::trace;

/// `max_pups` value meaning "not negotiated yet" - the window is established lazily by an
///  ack-requesting probe on first send
pub(crate) const UNKNOWN_WINDOW: u16 = 0xffff;

/// one pending outbound unit: a slice of stream bytes or a single-byte mark
struct WindowEntry {
    mark: bool,
    /// explicitly ack-requesting regardless of window position (e.g. `send_mark(_, true)`)
    force_ack: bool,
    contents: Vec<u8>,
    /// stream position, assigned at first transmission; retransmissions reuse it
    id: Option<u32>,
    /// whether this entry was transmitted as an ack-requesting type - sticky, so a
    ///  retransmission goes out bit-identical to the original
    requested_ack: bool,
}

/// what the output consumer actually puts on the wire for one window entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TransmitPacket {
    pub packet_type: PacketType,
    pub id: u32,
    pub contents: Vec<u8>,
    pub request_ack: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AckOutcome {
    /// everything transmitted so far is acknowledged - the window is free again
    Complete,
    /// the peer is behind but the divergence point is retained: the acked prefix was
    ///  dropped and the cursor rewound, transmission resumes at the divergent entry
    Rewind,
    /// the acked position matches nothing in the retained window - unrecoverable
    Desync { acked: u32 },
    /// no (new) ack stored - e.g. a duplicate wakeup
    Stale,
}

struct WindowInner {
    entries: VecDeque<WindowEntry>,
    /// number of transmitted-but-unacknowledged entries at the front of `entries`
    cursor: usize,
    /// stream position after the last byte handed to the wire
    send_pos: u32,
    max_pups: u16,
    max_bytes: u16,
    last_peer_recv_pos: u32,
    pending_ack: Option<(u32, ControlMessageAck)>,
    closed: bool,
}

impl WindowInner {
    /// window capacity in packets; at least 1 so a peer briefly advertising zero does not
    ///  wedge the consumer
    fn capacity(&self) -> usize {
        if self.max_pups == UNKNOWN_WINDOW {
            usize::MAX
        }
        else {
            (self.max_pups as usize).max(1)
        }
    }
}

/// The bounded send window of one channel: producers append entries (blocking when the
///  window is full), the output consumer task drains them in order and handles
///  acknowledgments. Go-back-N with cumulative positional acks - see `AckOutcome`.
pub(crate) struct SendWindow {
    inner: RwLock<WindowInner>,
    /// signaled when a producer appends an entry
    pub(crate) pending: Notify,
    /// signaled when acknowledged entries are dropped, freeing producer space
    pub(crate) space: Notify,
    /// signaled when an ack arrives
    pub(crate) ack: Notify,
    /// signaled when the window becomes empty
    pub(crate) drained: Notify,
}

impl SendWindow {
    pub(crate) fn new(start_pos: u32) -> SendWindow {
        SendWindow {
            inner: RwLock::new(WindowInner {
                entries: VecDeque::new(),
                cursor: 0,
                send_pos: start_pos,
                max_pups: UNKNOWN_WINDOW,
                max_bytes: 0,
                last_peer_recv_pos: start_pos,
                pending_ack: None,
                closed: false,
            }),
            pending: Notify::new(),
            space: Notify::new(),
            ack: Notify::new(),
            drained: Notify::new(),
        }
    }

    /// Append an outbound entry, blocking while the window is at the peer's advertised
    ///  capacity. Fails once the channel is destroyed.
    pub(crate) async fn push(&self, mark: bool, force_ack: bool, contents: Vec<u8>) -> Result<()> {
        loop {
            {
                let mut inner = self.inner.write().await;
                if inner.closed {
                    return Err(BspError::ChannelClosed);
                }
                if inner.entries.len() < inner.capacity() {
                    inner.entries.push_back(WindowEntry {
                        mark,
                        force_ack,
                        contents,
                        id: None,
                        requested_ack: false,
                    });
                    drop(inner);
                    self.pending.notify_one();
                    return Ok(());
                }
            }
            self.space.notified().await;
        }
    }

    /// Hand the next transmittable entry to the consumer, assigning its stream position on
    ///  first transmission. Returns `None` when there is nothing (more) to transmit right
    ///  now - either the queue is drained up to the cursor or the window is full.
    pub(crate) async fn take_next(&self) -> Option<TransmitPacket> {
        let mut inner = self.inner.write().await;
        if inner.closed || inner.cursor >= inner.entries.len() || inner.cursor >= inner.capacity() {
            return None;
        }

        let capacity = inner.capacity();
        let num_entries = inner.entries.len();
        let cursor = inner.cursor;
        let mut send_pos = inner.send_pos;

        let entry = &mut inner.entries[cursor];
        let id = match entry.id {
            Some(id) => id,
            None => {
                entry.id = Some(send_pos);
                let id = send_pos;
                send_pos = send_pos.wrapping_add(entry.contents.len() as u32);
                id
            }
        };

        // the last packet of a full window - and the last currently pending one - asks for
        //  an acknowledgment, so the consumer always ends a batch with an ack round-trip
        if entry.force_ack || cursor + 1 == capacity || cursor + 1 == num_entries {
            entry.requested_ack = true;
        }

        let packet = TransmitPacket {
            packet_type: match (entry.mark, entry.requested_ack) {
                (false, false) => PacketType::Data,
                (false, true) => PacketType::AckRequestingData,
                (true, false) => PacketType::Mark,
                (true, true) => PacketType::AckRequestingMark,
            },
            id,
            contents: entry.contents.clone(),
            request_ack: entry.requested_ack,
        };

        inner.send_pos = send_pos;
        inner.cursor += 1;
        Some(packet)
    }

    /// the zero-length ack-requesting probe used to establish (or re-probe) the window
    pub(crate) async fn make_probe(&self) -> TransmitPacket {
        let inner = self.inner.read().await;
        TransmitPacket {
            packet_type: PacketType::AckRequestingData,
            id: inner.send_pos,
            contents: Vec::new(),
            request_ack: true,
        }
    }

    /// Called from the receive path when an Ack packet arrives: records the peer's position
    ///  and limits and wakes the consumer. Application of the positional information is the
    ///  consumer's job (`apply_ack`).
    pub(crate) async fn on_ack(&self, acked_pos: u32, msg: ControlMessageAck) {
        {
            let mut inner = self.inner.write().await;
            trace!("ack for position {} with limits {:?}", acked_pos, msg);
            inner.max_pups = msg.max_pups;
            inner.max_bytes = msg.max_bytes;
            inner.last_peer_recv_pos = acked_pos;
            inner.pending_ack = Some((acked_pos, msg));
        }
        self.ack.notify_one();
    }

    /// Compare the most recent ack against the retained window and adjust it. Cumulative
    ///  positional semantics: everything below the acked position is done with.
    pub(crate) async fn apply_ack(&self) -> AckOutcome {
        let mut inner = self.inner.write().await;

        let Some((acked_pos, _)) = inner.pending_ack.take() else {
            return AckOutcome::Stale;
        };

        if acked_pos == inner.send_pos {
            // the whole transmitted prefix was received
            let cursor = inner.cursor;
            inner.entries.drain(..cursor);
            inner.cursor = 0;
            let empty = inner.entries.is_empty();
            drop(inner);
            self.space.notify_one();
            if empty {
                self.drained.notify_one();
            }
            return AckOutcome::Complete;
        }

        let divergence = inner.entries.iter()
            .take(inner.cursor)
            .position(|entry| entry.id == Some(acked_pos));

        match divergence {
            Some(idx) => {
                // the peer lost exactly the packets from the divergence point forward:
                //  everything before it is acknowledged, transmission resumes at it
                inner.entries.drain(..idx);
                inner.cursor = 0;
                drop(inner);
                self.space.notify_one();
                AckOutcome::Rewind
            }
            None => AckOutcome::Desync { acked: acked_pos },
        }
    }

    /// Rewind the cursor to the window base so every retained entry is transmitted again,
    ///  keeping assigned ids and types. This is the timeout half of go-back-N: when the ack
    ///  wait times out, the receiver may have dropped any suffix of the window (it never
    ///  acknowledges out-of-sequence data), so only a resend starting at the base is
    ///  guaranteed to carry something it can accept. Returns false when nothing was
    ///  transmitted yet, e.g. while the establishment probe is outstanding.
    pub(crate) async fn rewind_for_resend(&self) -> bool {
        let mut inner = self.inner.write().await;
        if inner.cursor == 0 {
            return false;
        }
        inner.cursor = 0;
        true
    }

    pub(crate) async fn is_unestablished(&self) -> bool {
        self.inner.read().await.max_pups == UNKNOWN_WINDOW
    }

    pub(crate) async fn peer_max_pups(&self) -> u16 {
        self.inner.read().await.max_pups
    }

    pub(crate) async fn send_pos(&self) -> u32 {
        self.inner.read().await.send_pos
    }

    /// Wait until every pending entry has been transmitted and acknowledged. Used by the
    ///  graceful End handshake, which may only start once the stream is fully delivered.
    pub(crate) async fn wait_drained(&self) -> Result<()> {
        loop {
            {
                let inner = self.inner.read().await;
                if inner.closed {
                    return Err(BspError::ChannelClosed);
                }
                if inner.entries.is_empty() {
                    return Ok(());
                }
            }
            self.drained.notified().await;
        }
    }

    /// part of channel destruction: fail current and future producers and wake every waiter
    pub(crate) async fn close(&self) {
        {
            let mut inner = self.inner.write().await;
            inner.closed = true;
        }
        self.space.notify_waiters();
        self.space.notify_one();
        self.pending.notify_one();
        self.ack.notify_one();
        self.drained.notify_waiters();
        self.drained.notify_one();
    }
}
