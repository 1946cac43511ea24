use crate::channel::Channel;
use crate::error::{BspError, Result};
use crate::send_window::{AckOutcome, TransmitPacket};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

/// Start the per-channel output consumer: the single task that drains the channel's send
///  window onto the wire, drives window establishment and handles the ack/retransmission
///  machinery. It runs until the channel is destroyed.
pub(crate) fn spawn_output_consumer(channel: Arc<Channel>) {
    tokio::spawn(async move {
        match drive(&channel).await {
            Ok(()) | Err(BspError::ChannelClosed) => {
                debug!("output consumer for channel {} shutting down", channel.local_port());
            }
            Err(e) => {
                warn!("output consumer for channel {} failed: {}", channel.local_port(), e);
                channel.send_abort(&e.to_string()).await;
            }
        }
    });
}

async fn drive(channel: &Arc<Channel>) -> Result<()> {
    let mut shutdown = channel.shutdown_rx();
    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            _ = channel.window.pending.notified() => {}
        }

        // the window size is negotiated lazily, triggered by the first actual send
        if channel.window.is_unestablished().await {
            establish(channel, &mut shutdown).await?;
        }

        while let Some(packet) = channel.window.take_next().await {
            trace!("transmitting {:?} at position {}", packet.packet_type, packet.id);
            channel.transmit(&packet).await;
            if packet.request_ack {
                wait_and_apply_ack(channel, &mut shutdown, &packet).await?;
            }
        }
    }
}

/// probe the peer with a zero-length ack-requesting packet to learn its window size
async fn establish(channel: &Arc<Channel>, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
    let probe = channel.window.make_probe().await;
    debug!("establishing send window for channel {} at position {}", channel.local_port(), probe.id);
    channel.transmit(&probe).await;
    wait_and_apply_ack(channel, shutdown, &probe).await?;

    if channel.window.peer_max_pups().await == 0 {
        return Err(BspError::ProtocolViolation("peer advertised a zero-packet window".to_string()));
    }
    Ok(())
}

/// Block until the peer acknowledges the current transmission front, resending on every
///  timeout. Exhausted retries and unmatchable acks are fatal for the connection.
async fn wait_and_apply_ack(
    channel: &Arc<Channel>,
    shutdown: &mut watch::Receiver<bool>,
    packet: &TransmitPacket,
) -> Result<()> {
    let mut attempts = 0u32;
    loop {
        tokio::select! {
            _ = shutdown.changed() => return Err(BspError::ChannelClosed),
            _ = channel.window.ack.notified() => {
                match channel.window.apply_ack().await {
                    AckOutcome::Complete | AckOutcome::Rewind => return Ok(()),
                    AckOutcome::Stale => {}
                    AckOutcome::Desync { acked } => return Err(BspError::WindowDesync { acked }),
                }
            }
            _ = sleep(channel.config.ack_timeout) => {
                attempts += 1;
                if attempts >= channel.config.ack_retries {
                    return Err(BspError::PeerUnresponsive(
                        format!("no ack for position {} after {} attempts", packet.id, attempts)));
                }
                resend(channel, packet).await;
            }
        }
    }
}

/// The timeout resend. The receiver never acknowledges out-of-sequence data, so a lost
///  packet anywhere in the window makes it deaf to everything after it; only a resend of the
///  whole retained window (go-back-N) is guaranteed to reach it in sequence. The
///  establishment probe is not a window entry and is resent as-is.
async fn resend(channel: &Arc<Channel>, packet: &TransmitPacket) {
    if channel.window.rewind_for_resend().await {
        trace!("ack timeout, resending the window");
        while let Some(p) = channel.window.take_next().await {
            channel.transmit(&p).await;
        }
    }
    else {
        trace!("no ack for position {}, retransmitting", packet.id);
        channel.transmit(packet).await;
    }
}
