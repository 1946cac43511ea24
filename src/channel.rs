use crate::config::BspConfig;
use crate::control_messages::{ControlMessageAbort, ControlMessageAck, ControlMessageRendezvous};
use crate::error::{BspError, Result};
use crate::packet::{Packet, PacketType, MAX_CONTENTS_LEN};
use crate::port::Port;
use crate::send_window::{SendWindow, TransmitPacket};
use crate::transport::PacketSink;
use bytes::BytesMut;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// rendezvous'd but the confirming connection request has not gone out yet
    Establishing,
    /// the regular data exchange state
    Active,
    /// an End handshake is in progress (initiated by either side)
    Ending,
    /// terminal; every blocked operation fails with `ChannelClosed`
    Destroyed,
}

/// One element of the inbound stream. Marks travel in-line with the data so a reader observes
///  them at exactly the stream position the peer sent them, not racing ahead of buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamUnit {
    Byte(u8),
    Mark(u8),
}

/// lifecycle notifications from a channel to the manager's reaper
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ChannelEvent {
    Destroyed(u32),
}

struct ChannelInner {
    state: ChannelState,
    /// the stream position expected in the next in-sequence data packet
    recv_pos: u32,
    receive_queue: VecDeque<StreamUnit>,
    last_mark: Option<u8>,
    /// outbound bytes not yet handed to the send window
    send_buffer: Vec<u8>,
    end_reply_seen: bool,
}

/// One established BSP connection: the reliable byte stream between a local ephemeral port
///  and the peer's connection port.
///
/// The receive path is driven by the manager (`on_*` packet handlers), the send path by the
///  per-channel output consumer task draining the send window. Application workers use the
///  public read/send API and never see packets.
pub struct Channel {
    pub(crate) config: Arc<BspConfig>,
    local_port: Port,
    peer_port: Port,
    /// the initial stream position both sides agreed on during rendezvous
    pub(crate) start_pos: u32,
    sink: Arc<dyn PacketSink>,
    inner: RwLock<ChannelInner>,
    pub(crate) window: Arc<SendWindow>,
    recv_notify: Notify,
    end_notify: Notify,
    shutdown: watch::Sender<bool>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl Channel {
    pub(crate) fn new(
        config: Arc<BspConfig>,
        local_port: Port,
        peer_port: Port,
        start_pos: u32,
        sink: Arc<dyn PacketSink>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Arc<Channel> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Channel {
            config,
            local_port,
            peer_port,
            start_pos,
            sink,
            inner: RwLock::new(ChannelInner {
                state: ChannelState::Establishing,
                recv_pos: start_pos,
                receive_queue: VecDeque::new(),
                last_mark: None,
                send_buffer: Vec::new(),
                end_reply_seen: false,
            }),
            window: Arc::new(SendWindow::new(start_pos)),
            recv_notify: Notify::new(),
            end_notify: Notify::new(),
            shutdown,
            events,
        })
    }

    pub fn local_port(&self) -> Port {
        self.local_port
    }

    pub fn peer_port(&self) -> Port {
        self.peer_port
    }

    pub async fn state(&self) -> ChannelState {
        self.inner.read().await.state
    }

    /// a receiver that flips to `true` once when the channel is destroyed; every task tied to
    ///  the channel selects on this at its suspension points
    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Read stream bytes into `buf`, blocking until the buffer is full, a mark interrupts
    ///  the read, or the connection goes away. A mark ends the read short of the full buffer;
    ///  its value is available through `last_mark`.
    ///
    /// An unresponsive peer (nothing received for the configured read timeout) aborts the
    ///  connection.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        loop {
            {
                let mut inner = self.inner.write().await;
                while filled < buf.len() {
                    match inner.receive_queue.pop_front() {
                        Some(StreamUnit::Byte(b)) => {
                            buf[filled] = b;
                            filled += 1;
                        }
                        Some(StreamUnit::Mark(m)) => {
                            inner.last_mark = Some(m);
                            return Ok(filled);
                        }
                        None => break,
                    }
                }
                if filled == buf.len() {
                    return Ok(filled);
                }
                if let ChannelState::Ending | ChannelState::Destroyed = inner.state {
                    // the stream will not grow any more
                    return if filled == 0 { Err(BspError::ChannelClosed) } else { Ok(filled) };
                }
            }
            if timeout(self.config.read_timeout, self.recv_notify.notified()).await.is_err() {
                self.send_abort("read timed out waiting for data").await;
                return Err(BspError::PeerUnresponsive("read timed out waiting for data".to_string()));
            }
        }
    }

    /// Read exactly one byte. A mark in this position is a protocol violation: callers use
    ///  this for fixed-layout structures that the peer must not interrupt.
    pub async fn read_byte(&self) -> Result<u8> {
        let mut buf = [0u8];
        if self.read(&mut buf).await? == 1 {
            Ok(buf[0])
        }
        else {
            Err(BspError::ProtocolViolation("mark interrupted a fixed-size read".to_string()))
        }
    }

    /// big-endian u16, same fixed-layout semantics as `read_byte`
    pub async fn read_u16(&self) -> Result<u16> {
        let mut buf = [0u8; 2];
        if self.read(&mut buf).await? == 2 {
            Ok(u16::from_be_bytes(buf))
        }
        else {
            Err(BspError::ProtocolViolation("mark interrupted a fixed-size read".to_string()))
        }
    }

    /// a length-prefixed string of 8-bit chars, the standard string representation of the
    ///  upper-layer protocols
    pub async fn read_string(&self) -> Result<String> {
        let len = self.read_byte().await? as usize;
        let mut buf = vec![0u8; len];
        if self.read(&mut buf).await? != len {
            return Err(BspError::ProtocolViolation("mark interrupted a fixed-size read".to_string()));
        }
        Ok(buf.into_iter().map(char::from).collect())
    }

    /// Discard stream bytes until a mark arrives and return its value. This is how a reader
    ///  skips to the next record boundary after an application-level error.
    pub async fn wait_for_mark(&self) -> Result<u8> {
        loop {
            {
                let mut inner = self.inner.write().await;
                while let Some(unit) = inner.receive_queue.pop_front() {
                    if let StreamUnit::Mark(m) = unit {
                        inner.last_mark = Some(m);
                        return Ok(m);
                    }
                }
                if let ChannelState::Ending | ChannelState::Destroyed = inner.state {
                    return Err(BspError::ChannelClosed);
                }
            }
            if timeout(self.config.read_timeout, self.recv_notify.notified()).await.is_err() {
                self.send_abort("read timed out waiting for a mark").await;
                return Err(BspError::PeerUnresponsive("read timed out waiting for a mark".to_string()));
            }
        }
    }

    /// the value of the most recent mark a read operation consumed
    pub async fn last_mark(&self) -> Option<u8> {
        self.inner.read().await.last_mark
    }

    /// Append bytes to the outbound stream. Data is buffered until a full packet's worth has
    ///  accumulated or the caller flushes; handing data to the send window blocks while the
    ///  peer's advertised window is full.
    pub async fn send(&self, data: &[u8], flush: bool) -> Result<()> {
        let to_push = {
            let mut inner = self.inner.write().await;
            if inner.state == ChannelState::Destroyed {
                return Err(BspError::ChannelClosed);
            }
            inner.send_buffer.extend_from_slice(data);
            if !flush && inner.send_buffer.len() < MAX_CONTENTS_LEN {
                return Ok(());
            }

            let buffered = std::mem::take(&mut inner.send_buffer);
            // without a flush, an incomplete trailing packet stays buffered
            let keep = if flush { 0 } else { buffered.len() % MAX_CONTENTS_LEN };
            let split = buffered.len() - keep;
            inner.send_buffer = buffered[split..].to_vec();
            buffered[..split].to_vec()
        };

        for chunk in to_push.chunks(MAX_CONTENTS_LEN) {
            self.window.push(false, false, chunk.to_vec()).await?;
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        self.send(&[], true).await
    }

    /// Send an out-of-band mark at the current stream position. `request_ack` forces an
    ///  immediate ack round-trip, which callers use as an explicit synchronization point.
    pub async fn send_mark(&self, value: u8, request_ack: bool) -> Result<()> {
        self.flush().await?;
        self.window.push(true, request_ack, vec![value]).await
    }

    /// Gracefully close the connection: flush and deliver everything pending, then run the
    ///  three-way End handshake. The channel is destroyed afterwards either way.
    pub async fn end(&self) -> Result<()> {
        self.flush().await?;
        self.window.wait_drained().await?;

        {
            let mut inner = self.inner.write().await;
            inner.state = ChannelState::Ending;
        }

        let end_pos = self.window.send_pos().await;
        for _ in 0..self.config.ack_retries {
            if self.inner.read().await.state == ChannelState::Destroyed {
                return Err(BspError::ChannelClosed);
            }
            self.send_raw(PacketType::End, end_pos, Vec::new()).await;
            if timeout(self.config.ack_timeout, self.end_notify.notified()).await.is_err() {
                // destruction wakes the wait, so a timeout means the channel is still alive
                continue;
            }
            let (destroyed, end_reply_seen) = {
                let inner = self.inner.read().await;
                (inner.state == ChannelState::Destroyed, inner.end_reply_seen)
            };
            if destroyed {
                // torn down underneath us, e.g. by a peer abort
                return Err(BspError::ChannelClosed);
            }
            if end_reply_seen {
                // third leg of the handshake, releasing the peer from its dally wait
                self.send_raw(PacketType::EndReply, end_pos, Vec::new()).await;
                self.destroy().await;
                return Ok(());
            }
        }

        if self.inner.read().await.state == ChannelState::Destroyed {
            return Err(BspError::ChannelClosed);
        }
        self.send_abort("no reply to End").await;
        Err(BspError::PeerUnresponsive("no reply to End".to_string()))
    }

    /// Best-effort Abort notification to the peer, then local teardown. Used for every fatal
    ///  condition; the packet may be lost, the peer's own timeouts cover that.
    pub(crate) async fn send_abort(&self, reason: &str) {
        warn!("aborting channel {}: {}", self.local_port, reason);
        let body = ControlMessageAbort { reason: reason.to_string() }.to_bytes();
        let id = self.window.send_pos().await;
        self.send_raw(PacketType::Abort, id, body).await;
        self.destroy().await;
    }

    /// Idempotent teardown: marks the channel destroyed, wakes everything blocked on it and
    ///  notifies the manager's reaper.
    pub(crate) async fn destroy(&self) {
        {
            let mut inner = self.inner.write().await;
            if inner.state == ChannelState::Destroyed {
                return;
            }
            inner.state = ChannelState::Destroyed;
        }
        debug!("destroying channel {}", self.local_port);

        let _ = self.shutdown.send(true);
        self.window.close().await;
        self.recv_notify.notify_one();
        self.end_notify.notify_one();
        let _ = self.events.send(ChannelEvent::Destroyed(self.local_port.socket));
    }

    //
    //  --- receive path, called by the manager's dispatch ---
    //

    pub(crate) async fn on_data(&self, packet: &Packet) {
        if packet.packet_type.is_mark() && packet.contents.len() != 1 {
            self.send_abort("mark packet must carry exactly one byte").await;
            return;
        }

        let (ack_pos, queued) = {
            let mut inner = self.inner.write().await;
            if inner.state != ChannelState::Active {
                debug!("dropping data packet in state {:?}", inner.state);
                return;
            }
            if packet.id != inner.recv_pos {
                // out of sequence. Not acknowledged: the sender's ack timeout triggers the
                //  go-back-N retransmission that fills the gap.
                debug!("dropping packet: {}", BspError::OutOfSequence { expected: inner.recv_pos, actual: packet.id });
                return;
            }

            if packet.packet_type.is_mark() {
                inner.receive_queue.push_back(StreamUnit::Mark(packet.contents[0]));
            }
            else {
                inner.receive_queue.extend(packet.contents.iter().map(|&b| StreamUnit::Byte(b)));
            }
            inner.recv_pos = inner.recv_pos.wrapping_add(packet.contents.len() as u32);
            (inner.recv_pos, inner.receive_queue.len())
        };

        self.recv_notify.notify_one();
        if packet.packet_type.requests_ack() {
            self.send_ack(ack_pos, queued).await;
        }
    }

    pub(crate) async fn on_ack(&self, packet: &Packet) {
        let mut buf: &[u8] = &packet.contents;
        match ControlMessageAck::deser(&mut buf) {
            Ok(msg) => self.window.on_ack(packet.id, msg).await,
            Err(e) => debug!("dropping ack with malformed body: {}", e),
        }
    }

    pub(crate) async fn on_end(self: &Arc<Self>, packet: &Packet) {
        let start_dally = {
            let mut inner = self.inner.write().await;
            if inner.state == ChannelState::Active {
                inner.state = ChannelState::Ending;
                true
            }
            else {
                false
            }
        };

        self.send_raw(PacketType::EndReply, packet.id, Vec::new()).await;

        if start_dally {
            // Dally: linger so a retransmitted End still finds this channel and gets its
            //  EndReply. The peer's closing EndReply (or the timeout) finishes teardown.
            let this = self.clone();
            let mut shutdown = self.shutdown_rx();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = this.end_notify.notified() => {}
                    _ = sleep(this.config.dally_timeout) => {}
                }
                this.destroy().await;
            });
        }
    }

    pub(crate) async fn on_end_reply(&self, _packet: &Packet) {
        self.inner.write().await.end_reply_seen = true;
        self.end_notify.notify_one();
    }

    pub(crate) async fn on_abort(&self, packet: &Packet) {
        let msg = ControlMessageAbort::from_bytes(&packet.contents);
        warn!("peer aborted channel {}: {}", self.local_port, msg.reason);
        self.destroy().await;
    }

    pub(crate) async fn on_interrupt(&self, packet: &Packet) {
        trace!("echoing interrupt on channel {}", self.local_port);
        self.send_raw(PacketType::InterruptReply, packet.id, packet.contents.clone()).await;
    }

    pub(crate) async fn on_interrupt_reply(&self, _packet: &Packet) {
        trace!("interrupt reply on channel {}", self.local_port);
    }

    pub(crate) async fn on_error(&self, packet: &Packet) {
        warn!("received error packet on channel {}: {:?}", self.local_port, packet.contents);
    }

    //
    //  --- outbound plumbing ---
    //

    /// Confirm a rendezvous by echoing a connection request that names this channel's
    ///  (freshly allocated) port. Activates the channel.
    pub(crate) async fn send_rendezvous_confirm(&self, rfc_id: u32) {
        self.inner.write().await.state = ChannelState::Active;

        let mut buf = BytesMut::new();
        ControlMessageRendezvous { connection_port: self.local_port }.ser(&mut buf);
        self.send_raw(PacketType::ConnectionRequest, rfc_id, buf.to_vec()).await;
    }

    /// The advertised limits are the capacity actually left: configured buffer space minus
    ///  what a stalled reader has let pile up, so the peer's window shrinks when this side
    ///  stops consuming. At least one packet is always granted to keep the stream alive.
    async fn send_ack(&self, pos: u32, queued: usize) {
        let free_bytes = (self.config.recv_window_bytes as usize).saturating_sub(queued);
        let free_pups = (free_bytes / MAX_CONTENTS_LEN)
            .clamp(1, self.config.recv_window_pups as usize);
        let msg = ControlMessageAck {
            max_bytes: free_bytes as u16,
            max_pups: free_pups as u16,
            bytes_sent: 0,
        };
        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        self.send_raw(PacketType::Ack, pos, buf.to_vec()).await;
    }

    /// used by the output consumer to put a window entry on the wire
    pub(crate) async fn transmit(&self, packet: &TransmitPacket) {
        self.send_raw(packet.packet_type, packet.id, packet.contents.clone()).await;
    }

    async fn send_raw(&self, packet_type: PacketType, id: u32, contents: Vec<u8>) {
        let packet = Packet::new(packet_type, id, self.peer_port, self.local_port, contents);
        match packet.encode() {
            Ok(buf) => self.sink.send_packet(&buf).await,
            Err(e) => error!("failed to encode outgoing packet: {}", e),
        }
    }
}
