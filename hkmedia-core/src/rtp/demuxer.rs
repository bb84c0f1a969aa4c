//! RTP/RTCP demultiplexer.
//!
//! The session layer multiplexes RTP and RTCP on a single port (RFC 5761),
//! which FFmpeg's RTP input cannot read. [`RtpDemuxer`] receives on that one
//! port and forwards each datagram, unmodified, to the separate RTP and RTCP
//! ports FFmpeg listens on.
//!
//! FFmpeg also abandons an RTP input that has been silent for about five
//! seconds. While the far end sends only RTCP, the last RTCP packet is
//! replayed to the RTP port on a fixed interval. RTP receivers ignore it, but
//! it keeps the input alive.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use super::IpFamily;
use crate::config::RtpConfig;

/// Errors from setting up a demultiplexer
#[derive(Debug, Error)]
pub enum RtpError {
    /// The input port could not be bound
    #[error("Failed to bind RTP input port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Socket error after binding
    #[error("RTP socket error: {0}")]
    Io(#[from] io::Error),
}

/// Datagram class, decided by the payload type in byte 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Rtp,
    Rtcp,
}

impl PacketKind {
    /// Classifies the second byte of a datagram.
    ///
    /// Payload type 0 or above 90 is RTP. RTCP packet types 200-204 land in
    /// 72-76 once the marker bit is masked off, and the dynamic payload types
    /// negotiated for HomeKit streams are all above 90.
    pub fn from_payload_type(byte: u8) -> Self {
        let payload_type = byte & 0x7F;
        if payload_type > 90 || payload_type == 0 {
            PacketKind::Rtp
        } else {
            PacketKind::Rtcp
        }
    }

    /// Classifies a datagram; `None` if it is too short to carry a payload type.
    pub fn classify(datagram: &[u8]) -> Option<Self> {
        datagram.get(1).copied().map(Self::from_payload_type)
    }
}

/// Ports supplied by the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemuxPorts {
    /// Multiplexed input; 0 lets the OS pick
    pub input: u16,
    /// FFmpeg's RTCP port on loopback
    pub rtcp: u16,
    /// FFmpeg's RTP port on loopback
    pub rtp: u16,
}

/// Forwarding counters, published on every change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxActivity {
    pub rtp_packets: u64,
    pub rtcp_packets: u64,
    pub heartbeats: u64,
    pub running: bool,
}

#[derive(Debug, Clone, Copy)]
struct Targets {
    rtp: SocketAddr,
    rtcp: SocketAddr,
}

/// Single-port RTP/RTCP splitter with RTCP heartbeat replay.
#[derive(Debug)]
pub struct RtpDemuxer {
    local_addr: SocketAddr,
    activity: watch::Receiver<DemuxActivity>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RtpDemuxer {
    /// Binds the input port on the family's wildcard address and starts
    /// forwarding to the RTP and RTCP ports on loopback.
    ///
    /// # Errors
    ///
    /// - `RtpError::Bind` - The input port is taken or not permitted
    /// - `RtpError::Io` - The bound socket's address could not be read
    pub async fn bind(
        family: IpFamily,
        ports: DemuxPorts,
        config: &RtpConfig,
    ) -> Result<Self, RtpError> {
        let bind_addr = SocketAddr::new(family.unspecified(), ports.input);
        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(source) => {
                error!(%family, port = ports.input, error = %source, "RTP demultiplexer could not bind");
                return Err(RtpError::Bind {
                    port: ports.input,
                    source,
                });
            }
        };
        let local_addr = socket.local_addr()?;

        let targets = Targets {
            rtp: SocketAddr::new(family.loopback(), ports.rtp),
            rtcp: SocketAddr::new(family.loopback(), ports.rtcp),
        };

        let (activity_tx, activity_rx) = watch::channel(DemuxActivity {
            running: true,
            ..Default::default()
        });
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        info!(
            input = %local_addr,
            rtp = %targets.rtp,
            rtcp = %targets.rtcp,
            "RTP demultiplexer listening"
        );

        let task = tokio::spawn(forward_datagrams(
            socket,
            targets,
            config.clone(),
            activity_tx,
            shutdown_rx,
        ));

        Ok(Self {
            local_addr,
            activity: activity_rx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Address the input socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn activity(&self) -> DemuxActivity {
        *self.activity.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.activity.borrow().running
    }

    /// Waits until the first RTP packet has been forwarded or the
    /// demultiplexer closes. Returns whether RTP was seen.
    pub async fn wait_for_rtp(&self) -> bool {
        let mut activity = self.activity.clone();
        let seen = match activity
            .wait_for(|activity| activity.rtp_packets > 0 || !activity.running)
            .await
        {
            Ok(activity) => Some(activity.rtp_packets > 0),
            Err(_) => None,
        };
        seen.unwrap_or_else(|| activity.borrow().rtp_packets > 0)
    }

    /// Stops forwarding, cancels the heartbeat and closes the socket.
    ///
    /// Publishes a final activity update with `running == false`. Safe to
    /// call more than once.
    pub async fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            debug!(error = %e, "RTP demultiplexer task ended abnormally");
        }
    }
}

impl Drop for RtpDemuxer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn forward_datagrams(
    socket: UdpSocket,
    targets: Targets,
    config: RtpConfig,
    activity: watch::Sender<DemuxActivity>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let interval = config.heartbeat_interval;
    let mut buffer = vec![0u8; config.max_datagram_size.max(2)];
    let mut heartbeat_payload: Option<Bytes> = None;

    let heartbeat = tokio::time::sleep(interval);
    tokio::pin!(heartbeat);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,

            received = socket.recv_from(&mut buffer) => {
                let (len, peer) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        debug!(error = %e, "RTP receive failed");
                        continue;
                    }
                };
                let datagram = &buffer[..len];

                match PacketKind::classify(datagram) {
                    Some(PacketKind::Rtcp) => {
                        heartbeat_payload = Some(Bytes::copy_from_slice(datagram));
                        heartbeat.as_mut().reset(Instant::now() + interval);
                        forward(&socket, datagram, targets.rtcp).await;
                        activity.send_modify(|activity| activity.rtcp_packets += 1);
                    }
                    Some(PacketKind::Rtp) => {
                        forward(&socket, datagram, targets.rtp).await;
                        activity.send_modify(|activity| activity.rtp_packets += 1);
                    }
                    None => trace!(%peer, len, "Dropping runt datagram"),
                }
            }

            () = &mut heartbeat, if heartbeat_payload.is_some() => {
                if let Some(payload) = &heartbeat_payload {
                    trace!(len = payload.len(), "Replaying RTCP heartbeat");
                    forward(&socket, payload, targets.rtp).await;
                    activity.send_modify(|activity| activity.heartbeats += 1);
                }
                heartbeat.as_mut().reset(Instant::now() + interval);
            }
        }
    }

    drop(socket);
    activity.send_modify(|activity| activity.running = false);
    debug!("RTP demultiplexer closed");
}

async fn forward(socket: &UdpSocket, datagram: &[u8], target: SocketAddr) {
    if let Err(e) = socket.send_to(datagram, target).await {
        debug!(%target, error = %e, "RTP forward failed");
    }
}
