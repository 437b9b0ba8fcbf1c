//! Transmit-side state for segmented ISO-TP transfers.

use core::time::Duration;

/// Progress indicator for the non-blocking APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Transfer is ongoing.
    InFlight,
    /// Waiting for a flow control frame.
    WaitingForFlowControl,
    /// Transfer finished.
    Completed,
    /// Pacing or backend would block; retry later.
    WouldBlock,
}

/// Bookkeeping for an in-flight segmented transfer.
pub struct TxSession {
    /// Expected full payload length.
    pub payload_len: usize,
    /// Current offset into the payload.
    pub offset: usize,
    /// Next sequence number nibble.
    pub next_sn: u8,
    /// Block size negotiated.
    pub block_size: u8,
    /// Frames remaining before the next FC.
    pub block_remaining: u8,
    /// Separation time between CFs.
    pub st_min: Duration,
    /// Count of WAIT responses seen.
    pub wait_count: u8,
}

impl TxSession {
    /// Build a new session with the provided limits.
    pub fn new(payload_len: usize, block_size: u8, st_min: Duration) -> Self {
        Self {
            payload_len,
            offset: 0,
            next_sn: 1,
            block_size,
            block_remaining: block_size,
            st_min,
            wait_count: 0,
        }
    }
}

/// Transmit state carried between poll steps.
pub enum TxState<CInstant> {
    /// No active transfer.
    Idle,
    /// Sent a First Frame; waiting for FC until the deadline.
    WaitingForFc {
        session: TxSession,
        deadline: CInstant,
    },
    /// Sending consecutive frames; may be pacing by STmin.
    Sending {
        session: TxSession,
        st_min_deadline: Option<CInstant>,
    },
}
