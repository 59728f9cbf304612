//! Link-layer interface. The link itself (radio init, peer registration, MAC
//! acknowledgements) lives with the host; the core only needs a synchronous
//! send primitive plus two callback endpoints:
//!
//! - [`AckHandle`]: per-frame send completion, posted into the sender's tracker.
//! - [`DeliveryHandle`]: per-unit receive delivery, posted into the receiver's loop.
//!
//! Both callbacks only enqueue; they never touch session state directly.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// 6-byte link-layer (MAC) address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkAddr(pub [u8; 6]);

impl LinkAddr {
    pub const BROADCAST: LinkAddr = LinkAddr([0xFF; 6]);
}

impl fmt::Display for LinkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for LinkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LinkAddr({self})")
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid link address {0:?}: expected six colon-separated hex octets")]
pub struct LinkAddrParseError(pub String);

impl FromStr for LinkAddr {
    type Err = LinkAddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || LinkAddrParseError(s.to_string());
        let mut out = [0u8; 6];
        let mut parts = s.trim().split(':');
        for byte in out.iter_mut() {
            let part = parts.next().ok_or_else(err)?;
            if part.len() != 2 {
                return Err(err());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| err())?;
        }
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(LinkAddr(out))
    }
}

impl<'de> Deserialize<'de> for LinkAddr {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Synchronous send primitive. Acceptance only means the link queued the unit;
/// delivery is reported later through the [`AckHandle`] the link was given.
pub trait Transport: Send + Sync {
    fn send(&self, dest: &LinkAddr, unit: &[u8]) -> Result<(), TransportRejected>;
}

/// Synchronous refusal from [`Transport::send`].
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportRejected {
    #[error("peer {0} is not registered")]
    UnknownPeer(LinkAddr),
    #[error("unit of {len} bytes exceeds link mtu {mtu}")]
    TooLarge { len: usize, mtu: usize },
    #[error("link queue full")]
    Busy,
    #[error("link error: {0}")]
    Link(String),
}

/// Outcome the link reports for one transmitted unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Ok,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckReport {
    pub peer: LinkAddr,
    pub status: SendStatus,
}

/// Send-completion callback endpoint. Cheap to clone; safe to call from any task or thread.
#[derive(Debug, Clone)]
pub struct AckHandle {
    tx: mpsc::UnboundedSender<AckReport>,
}

impl AckHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<AckReport>) -> Self {
        Self { tx }
    }

    /// Post a completion report. Never blocks.
    pub fn report(&self, peer: LinkAddr, status: SendStatus) {
        if self.tx.send(AckReport { peer, status }).is_err() {
            tracing::trace!(%peer, "ack dropped: tracker gone");
        }
    }
}

/// One unit handed up by the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub from: LinkAddr,
    pub unit: Vec<u8>,
    /// When the link handed the unit over, not when the receiver got to it.
    pub at: Instant,
}

/// Receive-delivery callback endpoint.
#[derive(Debug, Clone)]
pub struct DeliveryHandle {
    tx: mpsc::Sender<Delivery>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DeliveryDropped {
    #[error("receiver queue full")]
    Full,
    #[error("receiver stopped")]
    Closed,
}

impl DeliveryHandle {
    /// Queue a unit for the receiver, stamped with the current time. Never
    /// blocks; a full queue drops the unit.
    pub fn deliver(&self, from: LinkAddr, unit: &[u8]) -> Result<(), DeliveryDropped> {
        self.tx
            .try_send(Delivery {
                from,
                unit: unit.to_vec(),
                at: Instant::now(),
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DeliveryDropped::Full,
                mpsc::error::TrySendError::Closed(_) => DeliveryDropped::Closed,
            })
    }
}

/// Default depth of the delivery queue between link and receiver.
pub const DEFAULT_DELIVERY_QUEUE: usize = 64;

/// Create the link → receiver delivery queue.
pub fn delivery_channel(capacity: usize) -> (DeliveryHandle, mpsc::Receiver<Delivery>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (DeliveryHandle { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_addr_display_and_parse() {
        let addr: LinkAddr = "84:F3:EB:05:50:B7".parse().unwrap();
        assert_eq!(addr, LinkAddr([0x84, 0xF3, 0xEB, 0x05, 0x50, 0xB7]));
        assert_eq!(addr.to_string(), "84:F3:EB:05:50:B7");
        assert_eq!("84:f3:eb:05:50:b7".parse::<LinkAddr>().unwrap(), addr);
    }

    #[test]
    fn link_addr_rejects_malformed() {
        for s in ["", "84:F3:EB:05:50", "84:F3:EB:05:50:B7:00", "84-F3-EB-05-50-B7", "8:F3:EB:05:50:B7", "zz:F3:EB:05:50:B7"] {
            assert!(s.parse::<LinkAddr>().is_err(), "{s} should not parse");
        }
    }

    #[tokio::test]
    async fn delivery_queue_reports_full_and_closed() {
        let (handle, mut rx) = delivery_channel(1);
        let from = LinkAddr::BROADCAST;
        handle.deliver(from, b"a").unwrap();
        assert_eq!(handle.deliver(from, b"b"), Err(DeliveryDropped::Full));
        let first = rx.recv().await.unwrap();
        assert_eq!(first.unit, b"a".to_vec());
        assert!(first.at <= Instant::now());
        drop(rx);
        assert_eq!(handle.deliver(from, b"c"), Err(DeliveryDropped::Closed));
    }

    #[test]
    fn ack_after_tracker_gone_is_silent() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = AckHandle::new(tx);
        drop(rx);
        handle.report(LinkAddr::BROADCAST, SendStatus::Ok);
    }
}
