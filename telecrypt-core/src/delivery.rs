//! Sender-side delivery tracking: `Idle -> Sending -> {Completed, Failed}`.
//!
//! Link callbacks post [`AckReport`]s through an [`AckHandle`]; only the tracker
//! reads them, so the ack count has a single writer. [`DeliveryTracker::wait`]
//! consumes reports until every frame is acknowledged, a failure is reported,
//! or the deadline passes.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::transport::{AckHandle, AckReport, LinkAddr, SendStatus};

/// Default bound on the wait for acknowledgements.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Idle,
    Sending { total: u16, acked: u16 },
    Completed { total: u16 },
    Failed {
        total: u16,
        acked: u16,
        reason: FailureReason,
    },
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryState::Completed { .. } | DeliveryState::Failed { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The transport refused frame `sequence` synchronously; later frames were never sent.
    Rejected { sequence: u16 },
    /// The link reported a failed transmission.
    Nacked { peer: LinkAddr },
    /// Not every frame was acknowledged before the deadline.
    Timeout,
}

pub struct DeliveryTracker {
    state: DeliveryState,
    timeout: Duration,
    acks: mpsc::UnboundedReceiver<AckReport>,
    handle: AckHandle,
}

impl DeliveryTracker {
    pub fn new(timeout: Duration) -> Self {
        let (tx, acks) = mpsc::unbounded_channel();
        Self {
            state: DeliveryState::Idle,
            timeout,
            acks,
            handle: AckHandle::new(tx),
        }
    }

    /// Endpoint to register as the link's send-completion callback.
    pub fn ack_handle(&self) -> AckHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start tracking a message of `total` frames. Reports still queued from an
    /// earlier message are discarded.
    pub fn begin(&mut self, total: u16) {
        let mut stale = 0usize;
        while self.acks.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            tracing::debug!(stale, "discarded acknowledgements from previous message");
        }
        self.state = if total == 0 {
            DeliveryState::Completed { total }
        } else {
            DeliveryState::Sending { total, acked: 0 }
        };
    }

    /// Fail the current message without waiting.
    pub fn abort(&mut self, reason: FailureReason) -> DeliveryState {
        if let DeliveryState::Sending { total, acked } = self.state {
            self.state = DeliveryState::Failed {
                total,
                acked,
                reason,
            };
        }
        self.state
    }

    fn apply(&mut self, report: AckReport) {
        let DeliveryState::Sending { total, acked } = self.state else {
            return;
        };
        self.state = match report.status {
            SendStatus::Ok if acked + 1 >= total => DeliveryState::Completed { total },
            SendStatus::Ok => DeliveryState::Sending {
                total,
                acked: acked + 1,
            },
            SendStatus::Fail => DeliveryState::Failed {
                total,
                acked,
                reason: FailureReason::Nacked { peer: report.peer },
            },
        };
        tracing::trace!(peer = %report.peer, state = ?self.state, "ack applied");
    }

    /// Apply every report queued so far, without waiting.
    pub fn poll(&mut self) -> DeliveryState {
        while !self.state.is_terminal() {
            match self.acks.try_recv() {
                Ok(report) => self.apply(report),
                Err(_) => break,
            }
        }
        self.state
    }

    /// Wait at most the configured timeout for the message to reach a terminal state.
    /// Returns immediately when idle or already terminal.
    pub async fn wait(&mut self) -> DeliveryState {
        let deadline = Instant::now() + self.timeout;
        loop {
            if !matches!(self.state, DeliveryState::Sending { .. }) {
                return self.state;
            }
            match time::timeout_at(deadline, self.acks.recv()).await {
                Ok(Some(report)) => self.apply(report),
                // The tracker owns a sender, so the queue cannot close while waiting.
                Ok(None) | Err(_) => {
                    if let DeliveryState::Sending { total, acked } = self.state {
                        tracing::warn!(acked, total, "delivery timed out");
                        self.state = DeliveryState::Failed {
                            total,
                            acked,
                            reason: FailureReason::Timeout,
                        };
                    }
                }
            }
        }
    }
}
