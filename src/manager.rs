use crate::channel::{Channel, ChannelEvent};
use crate::config::BspConfig;
use crate::control_messages::ControlMessageRendezvous;
use crate::error::{BspError, Result};
use crate::output_consumer::spawn_output_consumer;
use crate::packet::{Packet, PacketType};
use crate::port::Port;
use crate::socket_id::SocketIdAllocator;
use crate::transport::PacketSink;
use crate::worker::{WorkerFactory, WorkerHandle};
use rustc_hash::FxHashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info};

struct ManagerInner {
    /// live channels, keyed by the local (ephemeral) socket that inbound packets address
    channels: FxHashMap<u32, Arc<Channel>>,
    workers: FxHashMap<u32, Box<dyn WorkerHandle>>,
    /// registered services, keyed by their well-known socket
    services: FxHashMap<u32, Arc<dyn WorkerFactory>>,
}

/// The per-node entry point of the BSP engine: owns the channel registry, performs the
///  rendezvous for incoming connection requests and dispatches every received packet to its
///  channel.
///
/// The transport adapter feeds raw datagrams into `on_raw_packet`; everything else happens
///  on channels handed to application workers.
pub struct BspManager {
    config: Arc<BspConfig>,
    allocator: SocketIdAllocator,
    sink: Arc<dyn PacketSink>,
    inner: RwLock<ManagerInner>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl BspManager {
    pub fn new(config: BspConfig, sink: Arc<dyn PacketSink>) -> anyhow::Result<Arc<BspManager>> {
        config.validate()?;

        let (events, events_recv) = mpsc::unbounded_channel();
        let manager = Arc::new(BspManager {
            config: Arc::new(config),
            allocator: SocketIdAllocator::new(),
            sink,
            inner: RwLock::new(ManagerInner {
                channels: FxHashMap::default(),
                workers: FxHashMap::default(),
                services: FxHashMap::default(),
            }),
            events,
        });

        tokio::spawn(reap_loop(Arc::downgrade(&manager), events_recv));
        Ok(manager)
    }

    /// Register an application service on a well-known socket. Connection requests addressed
    ///  to that socket rendezvous into a fresh channel and a worker built by `factory`.
    pub async fn register_service(&self, socket: u32, factory: Arc<dyn WorkerFactory>) {
        info!("registering service on socket {:#x}", socket);
        self.inner.write().await.services.insert(socket, factory);
    }

    /// Entry point for the transport adapter: decode and dispatch one received datagram.
    ///  Malformed packets are dropped, indistinguishable from transit loss.
    pub async fn on_raw_packet(self: &Arc<Self>, buf: &[u8]) {
        match Packet::decode(buf) {
            Ok(packet) => self.dispatch(packet).await,
            Err(e) => debug!("dropping received packet: {}", e),
        }
    }

    pub async fn channel_count(&self) -> usize {
        self.inner.read().await.channels.len()
    }

    /// forcibly tear down a channel, e.g. from administrative tooling
    pub async fn destroy_channel(&self, channel: &Channel) {
        channel.destroy().await;
    }

    async fn dispatch(self: &Arc<Self>, packet: Packet) {
        let socket = packet.destination.socket;

        if packet.packet_type == PacketType::ConnectionRequest {
            // a retransmission of a request that already rendezvous'd means the peer missed
            //  the confirmation: confirm again instead of opening a second channel
            if let Ok(peer) = self.peer_port_from_rfc(&packet) {
                let established = {
                    let inner = self.inner.read().await;
                    inner.channels.values()
                        .find(|ch| ch.peer_port() == peer && ch.start_pos == packet.id)
                        .cloned()
                };
                if let Some(channel) = established {
                    debug!("re-confirming channel {} after a retransmitted connection request", channel.local_port());
                    channel.send_rendezvous_confirm(packet.id).await;
                    return;
                }
            }

            let factory = self.inner.read().await.services.get(&socket).cloned();
            match factory {
                Some(factory) => {
                    if let Err(e) = self.establish_rendezvous(&packet, factory).await {
                        debug!("refusing connection request to socket {:#x}: {}", socket, e);
                    }
                }
                None => debug!("dropping connection request to unknown socket {:#x}", socket),
            }
            return;
        }

        let channel = self.inner.read().await.channels.get(&socket).cloned();
        let Some(channel) = channel else {
            debug!("dropping {:?} packet for unknown socket {:#x}", packet.packet_type, socket);
            return;
        };

        match packet.packet_type {
            PacketType::Data
            | PacketType::AckRequestingData
            | PacketType::Mark
            | PacketType::AckRequestingMark => channel.on_data(&packet).await,
            PacketType::Ack => channel.on_ack(&packet).await,
            PacketType::End => channel.on_end(&packet).await,
            PacketType::EndReply => channel.on_end_reply(&packet).await,
            PacketType::Abort => channel.on_abort(&packet).await,
            PacketType::Interrupt => channel.on_interrupt(&packet).await,
            PacketType::InterruptReply => channel.on_interrupt_reply(&packet).await,
            PacketType::Error => channel.on_error(&packet).await,
            PacketType::ConnectionRequest => {} // handled above
        }
    }

    /// Rendezvous: allocate an ephemeral port, create the channel, confirm to the peer and
    ///  start the service's worker on it.
    async fn establish_rendezvous(self: &Arc<Self>, packet: &Packet, factory: Arc<dyn WorkerFactory>) -> Result<Arc<Channel>> {
        let peer_port = self.peer_port_from_rfc(packet)?;

        let channel = {
            let mut inner = self.inner.write().await;
            if inner.workers.len() >= self.config.max_workers {
                // refused by silently dropping the request: the client retransmits, and by
                //  then a worker slot may have freed up
                return Err(BspError::CapacityExceeded);
            }

            let local_port = Port::new(self.config.local_network, self.config.local_host, self.allocator.next());
            let channel = Channel::new(
                self.config.clone(),
                local_port,
                peer_port,
                packet.id,
                self.sink.clone(),
                self.events.clone(),
            );
            inner.channels.insert(local_port.socket, channel.clone());
            channel
        };

        channel.send_rendezvous_confirm(packet.id).await;
        spawn_output_consumer(channel.clone());

        match factory.start_worker(channel.clone()).await {
            Ok(handle) => {
                self.inner.write().await.workers.insert(channel.local_port().socket, handle);
                info!("established channel {} for peer {}", channel.local_port(), peer_port);
                Ok(channel)
            }
            Err(e) => {
                error!("worker startup failed for channel {}: {:#}", channel.local_port(), e);
                channel.send_abort("service failed to start").await;
                Err(BspError::ChannelClosed)
            }
        }
    }

    /// The port a connection request asks to be connected to, from the request's body. A
    ///  zero network byte means "this network".
    fn peer_port_from_rfc(&self, packet: &Packet) -> Result<Port> {
        let mut buf: &[u8] = &packet.contents;
        let msg = ControlMessageRendezvous::deser(&mut buf)
            .map_err(|_| BspError::ProtocolViolation("connection request must carry the requested connection port".to_string()))?;
        if !buf.is_empty() {
            return Err(BspError::ProtocolViolation("trailing bytes in connection request".to_string()));
        }

        let mut port = msg.connection_port;
        if port.network == 0 {
            port.network = self.config.local_network;
        }
        Ok(port)
    }
}

/// Removes destroyed channels (and stops their workers) based on the events the channels
///  emit during teardown. Holding the manager weakly lets the manager itself be dropped.
async fn reap_loop(manager: Weak<BspManager>, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
    while let Some(event) = events.recv().await {
        let Some(manager) = manager.upgrade() else {
            return;
        };
        match event {
            ChannelEvent::Destroyed(socket) => {
                let (channel, worker) = {
                    let mut inner = manager.inner.write().await;
                    (inner.channels.remove(&socket), inner.workers.remove(&socket))
                };
                if channel.is_some() {
                    debug!("reaped channel on socket {:#x}", socket);
                }
                if let Some(worker) = worker {
                    worker.stop().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelState;
    use crate::transport::test_sink::RecordingSink;
    use crate::worker::MockWorkerHandle;
    use async_trait::async_trait;
    use bytes::BytesMut;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::sleep;

    const SERVICE_SOCKET: u32 = 5;

    fn client_port() -> Port {
        Port::new(1, 3, 0x2000)
    }

    fn service_port() -> Port {
        Port::new(1, 2, SERVICE_SOCKET)
    }

    /// a worker factory that hands the channel to the test instead of running a protocol
    struct CapturingFactory {
        channel: Mutex<Option<Arc<Channel>>>,
        fail: bool,
    }

    impl CapturingFactory {
        fn new() -> Arc<CapturingFactory> {
            Arc::new(CapturingFactory { channel: Mutex::new(None), fail: false })
        }

        fn failing() -> Arc<CapturingFactory> {
            Arc::new(CapturingFactory { channel: Mutex::new(None), fail: true })
        }

        fn captured(&self) -> Option<Arc<Channel>> {
            self.channel.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WorkerFactory for CapturingFactory {
        async fn start_worker(&self, channel: Arc<Channel>) -> anyhow::Result<Box<dyn WorkerHandle>> {
            if self.fail {
                anyhow::bail!("startup refused");
            }
            *self.channel.lock().unwrap() = Some(channel);
            let mut handle = MockWorkerHandle::new();
            handle.expect_stop().return_const(());
            Ok(Box::new(handle))
        }
    }

    async fn manager_under_test() -> (Arc<BspManager>, Arc<RecordingSink>, Arc<CapturingFactory>) {
        let sink = RecordingSink::new();
        let manager = BspManager::new(BspConfig::for_host(1, 2), sink.clone()).unwrap();
        let factory = CapturingFactory::new();
        manager.register_service(SERVICE_SOCKET, factory.clone()).await;
        (manager, sink, factory)
    }

    fn rfc(id: u32, requested_port: Port) -> Vec<u8> {
        let mut buf = BytesMut::new();
        ControlMessageRendezvous { connection_port: requested_port }.ser(&mut buf);
        Packet::new(PacketType::ConnectionRequest, id, service_port(), client_port(), buf.to_vec())
            .encode().unwrap()
    }

    fn to_server(packet_type: PacketType, id: u32, server_socket: u32, contents: Vec<u8>) -> Vec<u8> {
        Packet::new(packet_type, id, Port::new(1, 2, server_socket), client_port(), contents)
            .encode().unwrap()
    }

    #[tokio::test]
    async fn test_rendezvous_establishes_a_channel() {
        let (manager, sink, factory) = manager_under_test().await;

        manager.on_raw_packet(&rfc(1000, client_port())).await;

        let sent = sink.decoded();
        assert_eq!(sent.len(), 1);
        let confirm = &sent[0];
        assert_eq!(confirm.packet_type, PacketType::ConnectionRequest);
        assert_eq!(confirm.id, 1000);
        assert_eq!(confirm.destination, client_port());
        assert!(confirm.source.socket >= crate::socket_id::FIRST_EPHEMERAL_SOCKET);

        // the confirmation body names the server-side connection port
        let mut buf: &[u8] = &confirm.contents;
        let msg = ControlMessageRendezvous::deser(&mut buf).unwrap();
        assert_eq!(msg.connection_port, confirm.source);

        let channel = factory.captured().expect("worker should have been started");
        assert_eq!(channel.peer_port(), client_port());
        assert_eq!(channel.state().await, ChannelState::Active);
        assert_eq!(manager.channel_count().await, 1);
    }

    #[tokio::test]
    async fn test_rendezvous_fills_in_local_network() {
        let (manager, _sink, factory) = manager_under_test().await;

        manager.on_raw_packet(&rfc(1000, Port::new(0, 3, 0x2000))).await;

        let channel = factory.captured().unwrap();
        assert_eq!(channel.peer_port(), Port::new(1, 3, 0x2000));
    }

    #[tokio::test]
    async fn test_malformed_rendezvous_is_refused() {
        let (manager, sink, factory) = manager_under_test().await;

        let buf = Packet::new(PacketType::ConnectionRequest, 1000, service_port(), client_port(), vec![1, 2])
            .encode().unwrap();
        manager.on_raw_packet(&buf).await;

        assert_eq!(sink.packet_count(), 0);
        assert!(factory.captured().is_none());
        assert_eq!(manager.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_rendezvous_beyond_capacity_is_dropped() {
        let sink = RecordingSink::new();
        let mut config = BspConfig::for_host(1, 2);
        config.max_workers = 1;
        let manager = BspManager::new(config, sink.clone()).unwrap();
        let factory = CapturingFactory::new();
        manager.register_service(SERVICE_SOCKET, factory.clone()).await;

        manager.on_raw_packet(&rfc(1000, client_port())).await;
        assert_eq!(sink.packet_count(), 1);

        let other_client = Port::new(1, 4, 0x3000);
        let buf = {
            let mut b = BytesMut::new();
            ControlMessageRendezvous { connection_port: other_client }.ser(&mut b);
            Packet::new(PacketType::ConnectionRequest, 7000, service_port(), other_client, b.to_vec())
                .encode().unwrap()
        };
        manager.on_raw_packet(&buf).await;

        // no refusal on the wire, the request is just dropped
        assert_eq!(sink.packet_count(), 1);
        assert_eq!(manager.channel_count().await, 1);
    }

    #[tokio::test]
    async fn test_retransmitted_rendezvous_confirms_again() {
        let (manager, sink, factory) = manager_under_test().await;

        manager.on_raw_packet(&rfc(1000, client_port())).await;
        let server_socket = sink.decoded()[0].source.socket;

        // the client missed the confirmation and retransmits the identical request
        manager.on_raw_packet(&rfc(1000, client_port())).await;

        let sent = sink.decoded();
        assert_eq!(sent.len(), 2, "the confirmation is resent, no second channel is opened");
        assert_eq!(sent[1].packet_type, PacketType::ConnectionRequest);
        assert_eq!(sent[1].source.socket, server_socket);
        assert_eq!(manager.channel_count().await, 1);
        assert!(factory.captured().is_some());
    }

    #[tokio::test]
    async fn test_worker_startup_failure_aborts_the_channel() {
        let sink = RecordingSink::new();
        let manager = BspManager::new(BspConfig::for_host(1, 2), sink.clone()).unwrap();
        let factory = CapturingFactory::failing();
        manager.register_service(SERVICE_SOCKET, factory.clone()).await;

        manager.on_raw_packet(&rfc(1000, client_port())).await;
        sleep(Duration::from_millis(10)).await;

        let sent = sink.decoded();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].packet_type, PacketType::ConnectionRequest);
        assert_eq!(sent[1].packet_type, PacketType::Abort);
        assert_eq!(manager.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_packets_for_unknown_sockets_are_dropped() {
        let (manager, sink, _factory) = manager_under_test().await;

        manager.on_raw_packet(&to_server(PacketType::Data, 1000, 0x9999, b"X".to_vec())).await;
        manager.on_raw_packet(&to_server(PacketType::End, 1000, 0x9999, Vec::new())).await;

        assert_eq!(sink.packet_count(), 0);
    }

    #[tokio::test]
    async fn test_garbage_datagrams_are_dropped() {
        let (manager, sink, _factory) = manager_under_test().await;

        manager.on_raw_packet(&[1, 2, 3]).await;
        manager.on_raw_packet(&[0xff; 600]).await;

        assert_eq!(sink.packet_count(), 0);
    }

    #[tokio::test]
    async fn test_destroyed_channels_are_reaped() {
        let (manager, _sink, factory) = manager_under_test().await;

        manager.on_raw_packet(&rfc(1000, client_port())).await;
        let channel = factory.captured().unwrap();
        assert_eq!(manager.channel_count().await, 1);

        manager.destroy_channel(&channel).await;
        sleep(Duration::from_millis(10)).await;

        assert_eq!(manager.channel_count().await, 0);
        assert!(manager.inner.read().await.workers.is_empty());
    }

    /// the whole server-side lifecycle of one connection, datagram in, datagram out
    #[tokio::test(start_paused = true)]
    async fn test_connection_lifecycle_end_to_end() {
        let (manager, sink, factory) = manager_under_test().await;

        manager.on_raw_packet(&rfc(1000, client_port())).await;
        let confirm = &sink.decoded()[0];
        assert_eq!(confirm.packet_type, PacketType::ConnectionRequest);
        let server_socket = confirm.source.socket;

        manager.on_raw_packet(&to_server(PacketType::AckRequestingData, 1000, server_socket, b"HELLO".to_vec())).await;

        let sent = sink.decoded();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].packet_type, PacketType::Ack);
        assert_eq!(sent[1].id, 1005);

        let channel = factory.captured().unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(channel.read(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf, b"HELLO");

        manager.on_raw_packet(&to_server(PacketType::End, 500, server_socket, Vec::new())).await;

        let sent = sink.decoded();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2].packet_type, PacketType::EndReply);
        assert_eq!(sent[2].id, 500);

        // the dally period keeps the channel around for End retransmissions, then it goes
        sleep(Duration::from_secs(11)).await;
        assert_eq!(channel.state().await, ChannelState::Destroyed);
        assert_eq!(manager.channel_count().await, 0);
    }
}
