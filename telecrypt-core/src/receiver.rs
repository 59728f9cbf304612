//! Receive path: deframe arriving units, accumulate, and flush a message to
//! storage when it is complete (headered) or the link goes quiet.
//!
//! Flush order: block-multiple check, decrypt, unpad, persist, reset.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::chunk::{self, FramingMode};
use crate::cipher::{CipherEngine, CipherError, BLOCK_SIZE};
use crate::config::LinkConfig;
use crate::padding;
use crate::reassembly::{AppendOutcome, ReassemblyBuffer, ReassemblyError};
use crate::storage::{Storage, StorageError};
use crate::transport::{Delivery, LinkAddr};
use crate::wire::FrameDecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// Every headered frame arrived.
    Complete,
    /// No unit arrived for the inactivity timeout.
    Inactivity,
    /// The delivery queue closed with data still buffered.
    Shutdown,
}

/// What a successful flush did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub message_id: u64,
    pub trigger: FlushTrigger,
    pub units: usize,
    pub ciphertext_len: usize,
    pub plaintext_len: usize,
    pub decrypt_elapsed: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("bad frame: {0}")]
    Frame(#[from] FrameDecodeError),
    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),
    #[error("cipher: {0}")]
    Cipher(#[from] CipherError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

impl ReceiveError {
    /// The receiver cannot continue; the host should exit and be restarted.
    pub fn is_fatal(&self) -> bool {
        match self {
            ReceiveError::Reassembly(e) => e.is_fatal(),
            _ => false,
        }
    }
}

pub struct Receiver<S> {
    engine: Box<dyn CipherEngine>,
    storage: S,
    framing: FramingMode,
    inactivity: Duration,
    buffer: ReassemblyBuffer,
}

impl<S: Storage> Receiver<S> {
    pub fn new(config: &LinkConfig, storage: S) -> Self {
        Self {
            engine: config.engine(),
            storage,
            framing: config.framing,
            inactivity: config.inactivity_timeout(),
            buffer: ReassemblyBuffer::new(config.max_ciphertext_len(), config.on_alloc_failure),
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// When the current partial message will be flushed for inactivity.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.buffer.deadline(self.inactivity)
    }

    /// Accept one unit that arrived at `now`. A unit that fails to deframe is
    /// dropped on its own; the buffer is untouched.
    ///
    /// If the buffered message went idle before `now`, it is flushed first so
    /// the unit starts a new message. That flush is logged and persisted; the
    /// returned report only covers a flush caused by this unit.
    pub fn on_delivery(
        &mut self,
        from: LinkAddr,
        unit: &[u8],
        now: Instant,
    ) -> Result<Option<FlushReport>, ReceiveError> {
        let arrival = chunk::deframe(self.framing, unit)?;
        tracing::trace!(%from, len = unit.len(), "unit received");
        if self.buffer.is_idle(now, self.inactivity) {
            record(self.flush(FlushTrigger::Inactivity).map(Some))?;
        }
        match self.buffer.append(arrival, now)? {
            AppendOutcome::Complete => self.flush(FlushTrigger::Complete).map(Some),
            AppendOutcome::Accumulating | AppendOutcome::Duplicate => Ok(None),
        }
    }

    /// Flush if the inactivity timeout has passed since the last unit.
    pub fn poll(&mut self, now: Instant) -> Result<Option<FlushReport>, ReceiveError> {
        if self.buffer.is_idle(now, self.inactivity) {
            self.flush(FlushTrigger::Inactivity).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Flush whatever is buffered regardless of timing.
    pub fn flush_pending(&mut self) -> Result<Option<FlushReport>, ReceiveError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        self.flush(FlushTrigger::Shutdown).map(Some)
    }

    fn flush(&mut self, trigger: FlushTrigger) -> Result<FlushReport, ReceiveError> {
        let units = self.buffer.units();
        let mut message = self.buffer.take_message()?;
        let start = std::time::Instant::now();
        self.engine.decrypt(&mut message)?;
        let decrypt_elapsed = start.elapsed();
        let plaintext = padding::unpad(&message, BLOCK_SIZE);
        let message_id = self.storage.persist(plaintext)?;
        Ok(FlushReport {
            message_id,
            trigger,
            units,
            ciphertext_len: message.len(),
            plaintext_len: plaintext.len(),
            decrypt_elapsed,
        })
    }

    /// Drive the receiver from the link's delivery queue until the queue closes
    /// or a fatal error occurs. Non-fatal errors are logged and the loop continues.
    pub async fn run(&mut self, deliveries: &mut mpsc::Receiver<Delivery>) -> Result<(), ReceiveError> {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                delivery = deliveries.recv() => match delivery {
                    Some(Delivery { from, unit, at }) => {
                        record(self.on_delivery(from, &unit, at))?;
                    }
                    None => {
                        record(self.flush_pending())?;
                        tracing::debug!("delivery queue closed");
                        return Ok(());
                    }
                },
                _ = sleep_until(deadline) => {
                    record(self.poll(Instant::now()))?;
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

fn record(result: Result<Option<FlushReport>, ReceiveError>) -> Result<(), ReceiveError> {
    match result {
        Ok(Some(report)) => {
            tracing::info!(
                message_id = report.message_id,
                trigger = ?report.trigger,
                units = report.units,
                plaintext_len = report.plaintext_len,
                decrypt_us = report.decrypt_elapsed.as_micros() as u64,
                "message stored"
            );
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(e) if e.is_fatal() => {
            tracing::error!(error = %e, "receiver cannot continue");
            Err(e)
        }
        Err(e) => {
            tracing::warn!(error = %e, "message dropped");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reassembly::AllocPolicy;
    use crate::storage::MemoryStorage;
    use crate::transport::delivery_channel;

    const PEER: LinkAddr = LinkAddr([0x84, 0xF3, 0xEB, 0x05, 0x50, 0xB7]);

    fn seal(config: &LinkConfig, plaintext: &[u8]) -> Vec<Vec<u8>> {
        let mut buf = padding::pad(plaintext, BLOCK_SIZE);
        config.engine().encrypt(&mut buf).unwrap();
        chunk::split_units(&buf, config.mtu, config.framing).unwrap()
    }

    #[test]
    fn headered_message_flushes_on_last_frame() {
        let config = LinkConfig::default();
        let mut rx = Receiver::new(&config, MemoryStorage::new());
        let units = seal(&config, &[b'x'; 600]);
        assert_eq!(units.len(), 3);
        let now = Instant::now();
        assert!(rx.on_delivery(PEER, &units[0], now).unwrap().is_none());
        assert!(rx.on_delivery(PEER, &units[1], now).unwrap().is_none());
        let report = rx.on_delivery(PEER, &units[2], now).unwrap().unwrap();
        assert_eq!(report.trigger, FlushTrigger::Complete);
        assert_eq!(report.plaintext_len, 600);
        assert_eq!(rx.storage().get(0), Some(&[b'x'; 600][..]));
        assert_eq!(rx.buffered_len(), 0);
    }

    #[test]
    fn raw_message_flushes_on_inactivity() {
        let config = LinkConfig {
            framing: FramingMode::Raw,
            ..LinkConfig::default()
        };
        let mut rx = Receiver::new(&config, MemoryStorage::new());
        let start = Instant::now();
        for unit in seal(&config, b"30.80,73.80") {
            assert!(rx.on_delivery(PEER, &unit, start).unwrap().is_none());
        }
        assert!(rx.poll(start + Duration::from_millis(50)).unwrap().is_none());
        let report = rx.poll(start + Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(report.trigger, FlushTrigger::Inactivity);
        assert_eq!(rx.storage().get(report.message_id), Some(&b"30.80,73.80"[..]));
        assert!(rx.poll(start + Duration::from_millis(500)).unwrap().is_none());
    }

    #[test]
    fn late_unit_closes_idle_message_first() {
        let config = LinkConfig {
            framing: FramingMode::Raw,
            ..LinkConfig::default()
        };
        let mut rx = Receiver::new(&config, MemoryStorage::new());
        let start = Instant::now();
        for unit in seal(&config, b"first") {
            assert!(rx.on_delivery(PEER, &unit, start).unwrap().is_none());
        }
        let later = start + Duration::from_millis(500);
        for unit in seal(&config, b"second") {
            assert!(rx.on_delivery(PEER, &unit, later).unwrap().is_none());
        }
        assert_eq!(rx.storage().len(), 1);
        assert_eq!(rx.storage().get(0), Some(&b"first"[..]));

        let report = rx.poll(later + Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(report.trigger, FlushTrigger::Inactivity);
        let stored: Vec<&[u8]> = rx.storage().messages().collect();
        assert_eq!(stored, vec![&b"first"[..], &b"second"[..]]);
    }

    #[test]
    fn idle_incomplete_message_does_not_swallow_next_frame() {
        let config = LinkConfig::default();
        let mut rx = Receiver::new(&config, MemoryStorage::new());
        let start = Instant::now();
        let stale = seal(&config, &[1u8; 600]);
        rx.on_delivery(PEER, &stale[0], start).unwrap();

        let later = start + Duration::from_millis(300);
        let fresh = seal(&config, b"30.80,73.80");
        assert_eq!(fresh.len(), 1);
        let report = rx.on_delivery(PEER, &fresh[0], later).unwrap().unwrap();
        assert_eq!(report.trigger, FlushTrigger::Complete);
        assert_eq!(rx.storage().len(), 1);
        assert_eq!(rx.storage().get(report.message_id), Some(&b"30.80,73.80"[..]));
    }

    #[test]
    fn partial_block_is_discarded_and_receiver_recovers() {
        let config = LinkConfig {
            framing: FramingMode::Raw,
            ..LinkConfig::default()
        };
        let mut rx = Receiver::new(&config, MemoryStorage::new());
        let start = Instant::now();
        rx.on_delivery(PEER, &[0u8; 20], start).unwrap();
        let err = rx.poll(start + Duration::from_millis(100)).unwrap_err();
        assert!(matches!(
            err,
            ReceiveError::Reassembly(ReassemblyError::Malformed { len: 20 })
        ));
        assert!(!err.is_fatal());
        assert!(rx.storage().is_empty());

        let later = start + Duration::from_secs(1);
        for unit in seal(&config, b"ok") {
            rx.on_delivery(PEER, &unit, later).unwrap();
        }
        rx.poll(later + Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(rx.storage().get(0), Some(&b"ok"[..]));
    }

    #[test]
    fn incomplete_headered_message_dropped_at_inactivity() {
        let config = LinkConfig::default();
        let mut rx = Receiver::new(&config, MemoryStorage::new());
        let units = seal(&config, &[1u8; 600]);
        let start = Instant::now();
        rx.on_delivery(PEER, &units[0], start).unwrap();
        rx.on_delivery(PEER, &units[2], start).unwrap();
        let err = rx.poll(start + Duration::from_millis(100)).unwrap_err();
        assert!(matches!(
            err,
            ReceiveError::Reassembly(ReassemblyError::Incomplete {
                received: 2,
                total: 3
            })
        ));
        assert_eq!(rx.buffered_len(), 0);
    }

    #[test]
    fn bad_unit_leaves_buffer_alone() {
        let config = LinkConfig::default();
        let mut rx = Receiver::new(&config, MemoryStorage::new());
        let units = seal(&config, &[1u8; 300]);
        let now = Instant::now();
        rx.on_delivery(PEER, &units[0], now).unwrap();
        assert!(matches!(
            rx.on_delivery(PEER, &[0, 1], now),
            Err(ReceiveError::Frame(FrameDecodeError::Truncated { len: 2 }))
        ));
        let report = rx.on_delivery(PEER, &units[1], now).unwrap().unwrap();
        assert_eq!(report.plaintext_len, 300);
    }

    #[test]
    fn oversized_message_is_fatal_under_restart() {
        let config = LinkConfig {
            framing: FramingMode::Raw,
            max_message_len: 32,
            ..LinkConfig::default()
        };
        let mut rx = Receiver::new(&config, MemoryStorage::new());
        let now = Instant::now();
        rx.on_delivery(PEER, &[0u8; 32], now).unwrap();
        let err = rx.on_delivery(PEER, &[0u8; 16], now).unwrap_err();
        assert!(err.is_fatal());

        let config = LinkConfig {
            on_alloc_failure: AllocPolicy::Discard,
            ..config
        };
        let mut rx = Receiver::new(&config, MemoryStorage::new());
        rx.on_delivery(PEER, &[0u8; 32], now).unwrap();
        assert!(!rx.on_delivery(PEER, &[0u8; 16], now).unwrap_err().is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn run_flushes_each_burst_and_stops_on_close() {
        let config = LinkConfig {
            framing: FramingMode::Raw,
            ..LinkConfig::default()
        };
        let (link, mut deliveries) = delivery_channel(16);
        let mut rx = Receiver::new(&config, MemoryStorage::new());
        let bursts = [b"first reading".to_vec(), vec![b'y'; 400]];
        let feeder = {
            let bursts = bursts.clone();
            let config = config.clone();
            tokio::spawn(async move {
                for burst in bursts {
                    for unit in seal(&config, &burst) {
                        link.deliver(PEER, &unit).unwrap();
                        time::sleep(Duration::from_millis(10)).await;
                    }
                    time::sleep(Duration::from_millis(300)).await;
                }
            })
        };
        rx.run(&mut deliveries).await.unwrap();
        feeder.await.unwrap();
        let stored: Vec<&[u8]> = rx.storage().messages().collect();
        assert_eq!(stored, vec![&bursts[0][..], &bursts[1][..]]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_uses_arrival_time_for_queued_units() {
        let config = LinkConfig {
            framing: FramingMode::Raw,
            ..LinkConfig::default()
        };
        let (link, mut deliveries) = delivery_channel(16);
        let mut rx = Receiver::new(&config, MemoryStorage::new());
        // Both messages are queued before the loop runs, separated by a gap
        // longer than the inactivity timeout.
        for unit in seal(&config, b"first") {
            link.deliver(PEER, &unit).unwrap();
        }
        time::advance(Duration::from_millis(250)).await;
        for unit in seal(&config, b"second") {
            link.deliver(PEER, &unit).unwrap();
        }
        drop(link);

        rx.run(&mut deliveries).await.unwrap();
        let stored: Vec<&[u8]> = rx.storage().messages().collect();
        assert_eq!(stored, vec![&b"first"[..], &b"second"[..]]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_fatal_error() {
        let config = LinkConfig {
            framing: FramingMode::Raw,
            max_message_len: 16,
            ..LinkConfig::default()
        };
        let (link, mut deliveries) = delivery_channel(4);
        let mut rx = Receiver::new(&config, MemoryStorage::new());
        link.deliver(PEER, &[0u8; 32]).unwrap();
        let err = rx.run(&mut deliveries).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
