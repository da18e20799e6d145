//! UDP broadcast link adapter.
//!
//! Stands in for the raw-frame device (pcap on Linux, the simulator shim in
//! NS-3): frames keep their Ethernet-style header but ride UDP broadcast
//! datagrams on a fixed port. Each configured device is a destination
//! socket address; with no devices configured, frames go to the local
//! broadcast address.

use super::{
    build_frame, frame_channel, node_mac, outbound_channel, parse_frame, FrameRx, LinkError,
    OutboundTx,
};
use crate::types::NodeId;
use crate::wire::MAX_FRAME_SIZE;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

/// UDP port shared by all nodes on the broadcast segment.
pub const GCN_UDP_PORT: u16 = 0x88B5;

/// Ingress channel depth before backpressure drops frames.
const INGRESS_BUFFER: usize = 64;

/// A running UDP link adapter.
///
/// Owns the socket plus the reader and writer tasks bridging it to the
/// service's frame channels.
pub struct UdpLink {
    local_addr: SocketAddr,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl UdpLink {
    /// Bind the shared port and spawn the bridge tasks.
    ///
    /// Returns the adapter, the egress sender for the service, and the
    /// ingress receiver of link-header-stripped OTA payloads.
    pub async fn spawn(
        devices: &[String],
        node_id: NodeId,
        mcast_header: bool,
    ) -> Result<(Self, OutboundTx, FrameRx), LinkError> {
        let destinations = parse_devices(devices)?;

        let socket = UdpSocket::bind(("0.0.0.0", GCN_UDP_PORT)).await?;
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let (ingress_tx, ingress_rx) = frame_channel(INGRESS_BUFFER);
        let (outbound_tx, mut outbound_rx) = outbound_channel();

        let reader = {
            let socket = socket.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_FRAME_SIZE];
                loop {
                    let (len, from) = match socket.recv_from(&mut buf).await {
                        Ok(recv) => recv,
                        Err(e) => {
                            error!(error = %e, "link receive failed");
                            continue;
                        }
                    };
                    let Some((_, payload)) = parse_frame(&buf[..len]) else {
                        debug!(from = %from, len, "dropping non-GCN frame");
                        continue;
                    };
                    if ingress_tx.send(payload.to_vec()).await.is_err() {
                        break; // service gone
                    }
                }
            })
        };

        let writer = {
            let socket = socket.clone();
            let src_mac = node_mac(node_id);
            tokio::spawn(async move {
                while let Some(out) = outbound_rx.recv().await {
                    let frame = build_frame(out.class, out.gid, mcast_header, src_mac, &out.bytes);
                    for dest in &destinations {
                        if let Err(e) = socket.send_to(&frame, dest).await {
                            error!(dest = %dest, error = %e, "link send failed");
                        }
                    }
                }
            })
        };

        info!(local = %local_addr, "UDP link adapter started");

        Ok((
            Self {
                local_addr,
                tasks: vec![reader, writer],
            },
            outbound_tx,
            ingress_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for UdpLink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn parse_devices(devices: &[String]) -> Result<Vec<SocketAddr>, LinkError> {
    if devices.is_empty() {
        warn!("no link devices configured, using local broadcast");
        return Ok(vec![SocketAddr::from(([255, 255, 255, 255], GCN_UDP_PORT))]);
    }
    devices
        .iter()
        .map(|device| {
            // "host" or "host:port"
            let with_port;
            let spec = if device.contains(':') {
                device.as_str()
            } else {
                with_port = format!("{}:{}", device, GCN_UDP_PORT);
                with_port.as_str()
            };
            spec.parse().map_err(|e| LinkError::InvalidDevice {
                device: device.clone(),
                reason: format!("{}", e),
            })
        })
        .collect()
}
