//! UDP stand-in for the radio link.
//!
//! Every datagram is `kind (1) | source link address (6) | body`. Data units
//! are acknowledged by the receiving link as soon as they arrive, which gives
//! the sender its per-frame completion callback. The link only sends to
//! registered peers and never sends more than the configured MTU of body.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use telecrypt_core::{
    AckHandle, DeliveryHandle, LinkAddr, SendStatus, Transport, TransportRejected,
};
use tokio::net::UdpSocket;

use crate::config::PeerConfig;

const KIND_DATA: u8 = 0x01;
const KIND_ACK: u8 = 0x02;
const PREFIX_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Data,
    Ack,
}

fn encode(kind: Kind, source: LinkAddr, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PREFIX_LEN + body.len());
    out.push(match kind {
        Kind::Data => KIND_DATA,
        Kind::Ack => KIND_ACK,
    });
    out.extend_from_slice(&source.0);
    out.extend_from_slice(body);
    out
}

fn decode(datagram: &[u8]) -> Option<(Kind, LinkAddr, &[u8])> {
    if datagram.len() < PREFIX_LEN {
        return None;
    }
    let kind = match datagram[0] {
        KIND_DATA => Kind::Data,
        KIND_ACK => Kind::Ack,
        _ => return None,
    };
    let mut addr = [0u8; 6];
    addr.copy_from_slice(&datagram[1..PREFIX_LEN]);
    Some((kind, LinkAddr(addr), &datagram[PREFIX_LEN..]))
}

/// Where link events go. A sending node sets `acks`, a receiving node `deliveries`.
#[derive(Debug, Clone, Default)]
pub struct LinkEvents {
    pub acks: Option<AckHandle>,
    pub deliveries: Option<DeliveryHandle>,
}

#[derive(Debug, Clone)]
pub struct UdpLink {
    socket: Arc<UdpSocket>,
    local: LinkAddr,
    peers: Arc<HashMap<LinkAddr, SocketAddr>>,
    mtu: usize,
}

impl UdpLink {
    pub async fn bind(
        bind: SocketAddr,
        local: LinkAddr,
        peers: &[PeerConfig],
        mtu: usize,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(bind).await?;
        let peers = peers.iter().map(|p| (p.address, p.socket)).collect();
        Ok(Self {
            socket: Arc::new(socket),
            local,
            peers: Arc::new(peers),
            mtu,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn address(&self) -> LinkAddr {
        self.local
    }

    /// Receive datagrams forever, acknowledging data units and routing events.
    pub async fn run(self, events: LinkEvents) -> io::Result<()> {
        let mut buf = vec![0u8; 65536];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            let Some((kind, source, body)) = decode(&buf[..n]) else {
                tracing::warn!(%from, len = n, "ignoring malformed datagram");
                continue;
            };
            match kind {
                Kind::Data => {
                    let ack = encode(Kind::Ack, self.local, &[]);
                    if let Err(e) = self.socket.send_to(&ack, from).await {
                        tracing::warn!(%from, error = %e, "failed to acknowledge unit");
                    }
                    match &events.deliveries {
                        Some(d) => {
                            if let Err(e) = d.deliver(source, body) {
                                tracing::warn!(%source, error = %e, "unit dropped");
                            }
                        }
                        None => tracing::debug!(%source, "no receiver; unit discarded"),
                    }
                }
                Kind::Ack => match &events.acks {
                    Some(a) => a.report(source, SendStatus::Ok),
                    None => tracing::debug!(%source, "unexpected acknowledgement"),
                },
            }
        }
    }
}

impl Transport for UdpLink {
    fn send(&self, dest: &LinkAddr, unit: &[u8]) -> Result<(), TransportRejected> {
        let socket_addr = self
            .peers
            .get(dest)
            .ok_or(TransportRejected::UnknownPeer(*dest))?;
        if unit.len() > self.mtu {
            return Err(TransportRejected::TooLarge {
                len: unit.len(),
                mtu: self.mtu,
            });
        }
        let datagram = encode(Kind::Data, self.local, unit);
        match self.socket.try_send_to(&datagram, *socket_addr) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(TransportRejected::Busy),
            Err(e) => Err(TransportRejected::Link(e.to_string())),
        }
    }
}
