//! Message send path: pad, encrypt, frame, submit each unit, then wait for
//! the link to acknowledge every frame.
//!
//! One message is in flight at a time. A second `send_message` while the first
//! is still waiting fails fast with [`SendError::Busy`].

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::chunk::{self, FramingMode};
use crate::cipher::{CipherEngine, CipherError, BLOCK_SIZE};
use crate::config::LinkConfig;
use crate::delivery::{DeliveryState, DeliveryTracker, FailureReason};
use crate::padding;
use crate::transport::{AckHandle, LinkAddr, Transport, TransportRejected};
use crate::wire::FrameEncodeError;

/// What a successful send did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub frames: u16,
    pub plaintext_len: usize,
    pub ciphertext_len: usize,
    pub encrypt_elapsed: Duration,
    /// The plaintext was block-aligned and went out without pad bytes.
    pub ambiguous_padding: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("a message is already in flight")]
    Busy,
    #[error("refusing to send an empty message")]
    EmptyMessage,
    #[error("message of {len} bytes exceeds limit of {max}")]
    MessageTooLarge { len: usize, max: usize },
    #[error("cipher: {0}")]
    Cipher(#[from] CipherError),
    #[error("framing: {0}")]
    Framing(#[from] FrameEncodeError),
    #[error("link refused frame {sequence} of {total}: {source}")]
    TransportRejected {
        sequence: u16,
        total: u16,
        #[source]
        source: TransportRejected,
    },
    #[error("delivery timed out with {acked} of {total} frames acknowledged")]
    DeliveryTimeout { acked: u16, total: u16 },
    #[error("link to {peer} reported a failed frame after {acked} of {total} acknowledgements")]
    DeliveryFailed {
        peer: LinkAddr,
        acked: u16,
        total: u16,
    },
}

pub struct Sender<T> {
    engine: Box<dyn CipherEngine>,
    transport: T,
    peer: LinkAddr,
    framing: FramingMode,
    mtu: usize,
    inter_frame_delay: Duration,
    max_message_len: usize,
    acks: AckHandle,
    tracker: Mutex<DeliveryTracker>,
}

impl<T: Transport> Sender<T> {
    pub fn new(config: &LinkConfig, transport: T, peer: LinkAddr) -> Self {
        let tracker = DeliveryTracker::new(config.ack_timeout());
        Self {
            engine: config.engine(),
            transport,
            peer,
            framing: config.framing,
            mtu: config.mtu,
            inter_frame_delay: config.inter_frame_delay(),
            max_message_len: config.max_message_len,
            acks: tracker.ack_handle(),
            tracker: Mutex::new(tracker),
        }
    }

    /// Endpoint the link must call once per transmitted unit.
    pub fn ack_handle(&self) -> AckHandle {
        self.acks.clone()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn peer(&self) -> LinkAddr {
        self.peer
    }

    /// Pad and encrypt without sending. Returns the ciphertext and the time spent encrypting.
    pub fn seal(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Duration), SendError> {
        if plaintext.is_empty() {
            return Err(SendError::EmptyMessage);
        }
        if plaintext.len() > self.max_message_len {
            return Err(SendError::MessageTooLarge {
                len: plaintext.len(),
                max: self.max_message_len,
            });
        }
        let mut buf = padding::pad(plaintext, BLOCK_SIZE);
        let start = Instant::now();
        self.engine.encrypt(&mut buf)?;
        Ok((buf, start.elapsed()))
    }

    /// Send one message and wait for the link to acknowledge every frame.
    pub async fn send_message(&self, plaintext: &[u8]) -> Result<SendReport, SendError> {
        let mut tracker = self.tracker.try_lock().map_err(|_| SendError::Busy)?;

        let ambiguous_padding = padding::is_ambiguous(plaintext.len(), BLOCK_SIZE);
        if ambiguous_padding && !plaintext.is_empty() {
            tracing::warn!(
                len = plaintext.len(),
                "block-aligned message sent without padding; trailing bytes may be stripped on receive"
            );
        }
        let (ciphertext, encrypt_elapsed) = self.seal(plaintext)?;
        let units = chunk::split_units(&ciphertext, self.mtu, self.framing)?;
        let total = u16::try_from(units.len())
            .map_err(|_| FrameEncodeError::TooManyFrames { frames: units.len() })?;
        tracing::debug!(
            peer = %self.peer,
            plaintext_len = plaintext.len(),
            ciphertext_len = ciphertext.len(),
            frames = total,
            ?encrypt_elapsed,
            "message sealed"
        );

        tracker.begin(total);
        for (i, unit) in units.iter().enumerate() {
            let sequence = i as u16;
            if i > 0 {
                if !self.inter_frame_delay.is_zero() {
                    tokio::time::sleep(self.inter_frame_delay).await;
                }
                // Stop early once the link has already reported a failure.
                if tracker.poll().is_terminal() {
                    break;
                }
            }
            if let Err(source) = self.transport.send(&self.peer, unit) {
                tracker.abort(FailureReason::Rejected { sequence });
                tracing::warn!(sequence, total, error = %source, "link refused frame");
                return Err(SendError::TransportRejected {
                    sequence,
                    total,
                    source,
                });
            }
            tracing::trace!(sequence, len = unit.len(), "frame submitted");
        }

        match tracker.wait().await {
            DeliveryState::Completed { .. } => {
                let report = SendReport {
                    frames: total,
                    plaintext_len: plaintext.len(),
                    ciphertext_len: ciphertext.len(),
                    encrypt_elapsed,
                    ambiguous_padding,
                };
                tracing::info!(peer = %self.peer, frames = total, "message delivered");
                Ok(report)
            }
            DeliveryState::Failed {
                reason: FailureReason::Nacked { peer },
                acked,
                total,
            } => Err(SendError::DeliveryFailed { peer, acked, total }),
            DeliveryState::Failed { acked, total, .. }
            | DeliveryState::Sending { acked, total } => {
                Err(SendError::DeliveryTimeout { acked, total })
            }
            DeliveryState::Idle => Err(SendError::DeliveryTimeout { acked: 0, total }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SendStatus;
    use std::sync::{Arc, Mutex as StdMutex};

    const PEER: LinkAddr = LinkAddr([0x84, 0xF3, 0xEB, 0x05, 0x50, 0xB7]);

    #[derive(Clone, Copy, PartialEq)]
    enum Behaviour {
        AckAll,
        Silent,
        FailAt(usize),
        RejectAt(usize),
    }

    /// Records units; acknowledges through a handle installed after construction.
    #[derive(Clone)]
    struct ScriptedLink {
        behaviour: Behaviour,
        sent: Arc<StdMutex<Vec<Vec<u8>>>>,
        acks: Arc<StdMutex<Option<AckHandle>>>,
    }

    impl ScriptedLink {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                behaviour,
                sent: Arc::default(),
                acks: Arc::default(),
            }
        }

        fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Transport for ScriptedLink {
        fn send(&self, dest: &LinkAddr, unit: &[u8]) -> Result<(), TransportRejected> {
            let mut sent = self.sent.lock().unwrap();
            let index = sent.len();
            if self.behaviour == Behaviour::RejectAt(index) {
                return Err(TransportRejected::Busy);
            }
            sent.push(unit.to_vec());
            let acks = self.acks.lock().unwrap();
            let handle = acks.as_ref().unwrap();
            match self.behaviour {
                Behaviour::Silent => {}
                Behaviour::FailAt(i) if i == index => handle.report(*dest, SendStatus::Fail),
                _ => handle.report(*dest, SendStatus::Ok),
            }
            Ok(())
        }
    }

    fn sender(behaviour: Behaviour, config: &LinkConfig) -> (Sender<ScriptedLink>, ScriptedLink) {
        let link = ScriptedLink::new(behaviour);
        let sender = Sender::new(config, link.clone(), PEER);
        *link.acks.lock().unwrap() = Some(sender.ack_handle());
        (sender, link)
    }

    #[tokio::test(start_paused = true)]
    async fn short_message_is_one_frame() {
        let (sender, link) = sender(Behaviour::AckAll, &LinkConfig::default());
        let report = sender.send_message(b"30.80,73.80").await.unwrap();
        assert_eq!(report.frames, 1);
        assert_eq!(report.ciphertext_len, 16);
        assert!(!report.ambiguous_padding);
        let sent = link.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), 6 + 16);
    }

    #[tokio::test(start_paused = true)]
    async fn large_message_is_split_and_paced() {
        let (sender, link) = sender(Behaviour::AckAll, &LinkConfig::default());
        let start = tokio::time::Instant::now();
        let report = sender.send_message(&[7u8; 1000]).await.unwrap();
        assert_eq!(report.ciphertext_len, 1008);
        assert_eq!(report.frames, 5);
        assert!(link.sent().iter().all(|u| u.len() <= 250));
        assert_eq!(start.elapsed(), Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_link_times_out() {
        let (sender, link) = sender(Behaviour::Silent, &LinkConfig::default());
        let start = tokio::time::Instant::now();
        let err = sender.send_message(b"HELLO").await.unwrap_err();
        assert!(matches!(err, SendError::DeliveryTimeout { acked: 0, total: 1 }));
        assert_eq!(start.elapsed(), Duration::from_millis(100));
        assert_eq!(link.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_frame_fails_message_and_stops_sending() {
        let (sender, link) = sender(Behaviour::FailAt(1), &LinkConfig::default());
        let err = sender.send_message(&[1u8; 1000]).await.unwrap_err();
        assert!(matches!(
            err,
            SendError::DeliveryFailed {
                peer: PEER,
                acked: 1,
                total: 5
            }
        ));
        assert_eq!(link.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_frame_aborts_immediately() {
        let (sender, link) = sender(Behaviour::RejectAt(2), &LinkConfig::default());
        let err = sender.send_message(&[1u8; 1000]).await.unwrap_err();
        assert!(matches!(
            err,
            SendError::TransportRejected {
                sequence: 2,
                total: 5,
                source: TransportRejected::Busy
            }
        ));
        assert_eq!(link.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_and_oversized_are_refused() {
        let config = LinkConfig {
            max_message_len: 64,
            ..LinkConfig::default()
        };
        let (sender, link) = sender(Behaviour::AckAll, &config);
        assert!(matches!(
            sender.send_message(b"").await,
            Err(SendError::EmptyMessage)
        ));
        assert!(matches!(
            sender.send_message(&[0u8; 65]).await,
            Err(SendError::MessageTooLarge { len: 65, max: 64 })
        ));
        assert!(link.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_send_is_busy() {
        let (sender, _link) = sender(Behaviour::Silent, &LinkConfig::default());
        let sender = Arc::new(sender);
        let first = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.send_message(b"first").await })
        };
        tokio::task::yield_now().await;
        assert!(matches!(
            sender.send_message(b"second").await,
            Err(SendError::Busy)
        ));
        assert!(matches!(
            first.await.unwrap(),
            Err(SendError::DeliveryTimeout { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn aligned_message_is_flagged() {
        let (sender, _link) = sender(Behaviour::AckAll, &LinkConfig::default());
        let report = sender.send_message(&[0x41u8; 32]).await.unwrap();
        assert!(report.ambiguous_padding);
        assert_eq!(report.ciphertext_len, 32);
    }

    #[test]
    fn seal_matches_engine() {
        let config = LinkConfig::default();
        let (sender, _link) = sender(Behaviour::AckAll, &config);
        let (ciphertext, _) = sender.seal(b"HELLO").unwrap();
        let mut expected = padding::pad(b"HELLO", BLOCK_SIZE);
        config.engine().encrypt(&mut expected).unwrap();
        assert_eq!(ciphertext, expected);
    }
}
