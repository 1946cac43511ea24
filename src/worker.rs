use crate::channel::Channel;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::sync::Arc;

/// Constructs and starts the application-protocol handler for a freshly rendezvous'd
///  channel. One factory is registered per well-known service socket; the manager calls it
///  at the end of a successful rendezvous.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkerFactory: Send + Sync + 'static {
    async fn start_worker(&self, channel: Arc<Channel>) -> anyhow::Result<Box<dyn WorkerHandle>>;
}

/// Termination hook for a running worker. The manager invokes it when the bound channel is
///  destroyed so upper-layer state is not left dangling; a worker that already stopped on
///  its own treats this as a no-op.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkerHandle: Send + Sync + 'static {
    async fn stop(&self);
}
