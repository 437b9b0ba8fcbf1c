//! Receive-side reassembly and flow-control decisions.

use core::cmp::min;

use crate::config::IsoTpConfig;
use crate::errors::IsoTpError;
use crate::pdu::{FlowStatus, Pdu, duration_to_st_min};

/// Storage for reassembling an incoming payload.
pub enum RxStorage<'a> {
    /// Caller-provided slice.
    Borrowed(&'a mut [u8]),
    /// Owned buffer.
    Owned(Vec<u8>),
}

impl<'a> RxStorage<'a> {
    /// Total writable capacity.
    pub fn capacity(&self) -> usize {
        match self {
            RxStorage::Borrowed(buf) => buf.len(),
            RxStorage::Owned(buf) => buf.len(),
        }
    }
}

impl<'a> AsRef<[u8]> for RxStorage<'a> {
    fn as_ref(&self) -> &[u8] {
        match self {
            RxStorage::Borrowed(buf) => buf,
            RxStorage::Owned(buf) => buf.as_slice(),
        }
    }
}

impl<'a> AsMut<[u8]> for RxStorage<'a> {
    fn as_mut(&mut self) -> &mut [u8] {
        match self {
            RxStorage::Borrowed(buf) => buf,
            RxStorage::Owned(buf) => buf.as_mut_slice(),
        }
    }
}

/// High-level receive state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// No transfer active.
    Idle,
    /// In-progress segmented transfer.
    Receiving,
}

/// Outcome after processing a PDU.
pub enum RxOutcome {
    /// Nothing to send back yet.
    None,
    /// Emit a flow control frame.
    SendFlowControl {
        /// Flow status to transmit back to the sender.
        status: FlowStatus,
        /// Block size for the sender (0 = unlimited).
        block_size: u8,
        /// Encoded STmin byte to send.
        st_min: u8,
    },
    /// Payload complete with length.
    Completed(usize),
}

/// Receive state machine.
pub struct RxMachine<'a> {
    /// Current receive state (idle vs receiving).
    pub state: RxState,
    buffer: RxStorage<'a>,
    written: usize,
    expected_len: usize,
    next_sn: u8,
    block_size: u8,
    block_remaining: u8,
}

impl<'a> RxMachine<'a> {
    /// Create a new machine with the provided buffer.
    pub fn new(buffer: RxStorage<'a>) -> Self {
        Self {
            state: RxState::Idle,
            buffer,
            written: 0,
            expected_len: 0,
            next_sn: 0,
            block_size: 0,
            block_remaining: 0,
        }
    }

    /// Machine with an owned buffer sized for the config's payload limit.
    pub fn with_capacity(capacity: usize) -> RxMachine<'static> {
        RxMachine::new(RxStorage::Owned(vec![0u8; capacity]))
    }

    /// Clear state back to idle.
    pub fn reset(&mut self) {
        self.state = RxState::Idle;
        self.written = 0;
        self.expected_len = 0;
        self.next_sn = 0;
        self.block_remaining = 0;
    }

    /// Handle an incoming PDU and return the action to take.
    ///
    /// The caller is responsible for feeding PDUs of one channel in order and
    /// for transmitting flow-control frames when requested.
    pub fn on_pdu(&mut self, cfg: &IsoTpConfig, pdu: Pdu<'_>) -> Result<RxOutcome, IsoTpError<()>> {
        match pdu {
            Pdu::SingleFrame { len, data } => self.handle_single(cfg, len, data),
            Pdu::FirstFrame { len, data } => self.handle_first(cfg, len, data),
            Pdu::ConsecutiveFrame { sn, data } => self.handle_consecutive(cfg, sn, data),
            Pdu::FlowControl { .. } => Err(IsoTpError::UnexpectedPdu),
        }
    }

    fn handle_single(
        &mut self,
        cfg: &IsoTpConfig,
        len: u8,
        data: &[u8],
    ) -> Result<RxOutcome, IsoTpError<()>> {
        // A new SF while receiving aborts the stale transfer and resyncs.
        if self.state != RxState::Idle {
            self.reset();
        }
        let len = len as usize;
        if len > cfg.max_payload_len || len > data.len() || len > self.buffer.capacity() {
            return Err(IsoTpError::Overflow);
        }
        self.buffer.as_mut()[..len].copy_from_slice(&data[..len]);
        self.written = len;
        Ok(RxOutcome::Completed(len))
    }

    fn handle_first(
        &mut self,
        cfg: &IsoTpConfig,
        len: u16,
        data: &[u8],
    ) -> Result<RxOutcome, IsoTpError<()>> {
        if self.state != RxState::Idle {
            self.reset();
        }
        let len = len as usize;
        if len > cfg.max_payload_len || len > self.buffer.capacity() {
            return Err(IsoTpError::Overflow);
        }
        let copy_len = min(data.len(), len);
        self.buffer.as_mut()[..copy_len].copy_from_slice(&data[..copy_len]);
        self.written = copy_len;
        self.expected_len = len;
        self.next_sn = 1;
        self.block_size = cfg.block_size;
        self.block_remaining = cfg.block_size;
        self.state = RxState::Receiving;
        Ok(RxOutcome::SendFlowControl {
            status: FlowStatus::ClearToSend,
            block_size: cfg.block_size,
            st_min: duration_to_st_min(cfg.st_min),
        })
    }

    fn handle_consecutive(
        &mut self,
        cfg: &IsoTpConfig,
        sn: u8,
        data: &[u8],
    ) -> Result<RxOutcome, IsoTpError<()>> {
        if self.state != RxState::Receiving {
            return Err(IsoTpError::UnexpectedPdu);
        }
        if sn != self.next_sn {
            self.reset();
            return Err(IsoTpError::BadSequence);
        }
        if self.written >= self.expected_len {
            return Err(IsoTpError::Overflow);
        }
        let remaining = self.expected_len - self.written;
        let chunk = min(data.len(), remaining);
        let end = self.written + chunk;
        if end > self.buffer.capacity() {
            return Err(IsoTpError::Overflow);
        }
        self.buffer.as_mut()[self.written..end].copy_from_slice(&data[..chunk]);
        self.written = end;
        self.next_sn = (self.next_sn + 1) & 0x0F;

        if self.written >= self.expected_len {
            self.state = RxState::Idle;
            return Ok(RxOutcome::Completed(self.written));
        }

        if self.block_size > 0 {
            self.block_remaining = self.block_remaining.saturating_sub(1);
            if self.block_remaining == 0 {
                self.block_remaining = self.block_size;
                return Ok(RxOutcome::SendFlowControl {
                    status: FlowStatus::ClearToSend,
                    block_size: self.block_size,
                    st_min: duration_to_st_min(cfg.st_min),
                });
            }
        }

        Ok(RxOutcome::None)
    }

    /// View the completed message bytes.
    ///
    /// The slice stays valid until the next receive operation mutates the
    /// machine state.
    pub fn take_completed(&self) -> &[u8] {
        &self.buffer.as_ref()[..self.written]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg_with_limits(max_payload_len: usize) -> IsoTpConfig {
        IsoTpConfig {
            max_payload_len,
            ..IsoTpConfig::default()
        }
    }

    #[test]
    fn single_frame_completes_immediately() {
        let cfg = cfg_with_limits(64);
        let mut buf = [0u8; 8];
        let mut rx = RxMachine::new(RxStorage::Borrowed(&mut buf));

        let out = rx
            .on_pdu(
                &cfg,
                Pdu::SingleFrame {
                    len: 2,
                    data: &[0xAA, 0xBB],
                },
            )
            .unwrap();
        assert!(matches!(out, RxOutcome::Completed(2)));
        assert_eq!(rx.take_completed(), &[0xAA, 0xBB]);
    }

    #[test]
    fn segmented_transfer_requests_flow_control_and_completes() {
        let mut cfg = cfg_with_limits(64);
        cfg.block_size = 0;
        let mut rx = RxMachine::<'static>::with_capacity(64);

        let out = rx
            .on_pdu(
                &cfg,
                Pdu::FirstFrame {
                    len: 10,
                    data: &[1, 2, 3, 4, 5, 6],
                },
            )
            .unwrap();
        assert!(matches!(out, RxOutcome::SendFlowControl { .. }));

        let out = rx
            .on_pdu(
                &cfg,
                Pdu::ConsecutiveFrame {
                    sn: 1,
                    data: &[7, 8, 9, 10],
                },
            )
            .unwrap();
        assert!(matches!(out, RxOutcome::Completed(10)));
        assert_eq!(rx.take_completed(), &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn new_single_frame_resyncs_a_stale_transfer() {
        let cfg = cfg_with_limits(64);
        let mut rx = RxMachine::<'static>::with_capacity(64);

        rx.on_pdu(
            &cfg,
            Pdu::FirstFrame {
                len: 20,
                data: &[0xAA; 6],
            },
        )
        .unwrap();
        assert_eq!(rx.state, RxState::Receiving);

        let out = rx
            .on_pdu(
                &cfg,
                Pdu::SingleFrame {
                    len: 1,
                    data: &[0x3E],
                },
            )
            .unwrap();
        assert!(matches!(out, RxOutcome::Completed(1)));
        assert_eq!(rx.state, RxState::Idle);
    }

    #[test]
    fn bad_sequence_resets_the_machine() {
        let cfg = cfg_with_limits(64);
        let mut rx = RxMachine::<'static>::with_capacity(64);

        rx.on_pdu(
            &cfg,
            Pdu::FirstFrame {
                len: 20,
                data: &[0xAA; 6],
            },
        )
        .unwrap();
        assert!(matches!(
            rx.on_pdu(
                &cfg,
                Pdu::ConsecutiveFrame {
                    sn: 2,
                    data: &[0x00; 7]
                }
            ),
            Err(IsoTpError::BadSequence)
        ));
        assert_eq!(rx.state, RxState::Idle);
    }

    #[test]
    fn announced_length_beyond_limit_overflows() {
        let cfg = cfg_with_limits(16);
        let mut rx = RxMachine::<'static>::with_capacity(16);
        assert!(matches!(
            rx.on_pdu(
                &cfg,
                Pdu::FirstFrame {
                    len: 100,
                    data: &[0u8; 6]
                }
            ),
            Err(IsoTpError::Overflow)
        ));
    }

    #[test]
    fn flow_control_emitted_at_block_boundaries() {
        let mut cfg = cfg_with_limits(64);
        cfg.block_size = 2;
        let mut rx = RxMachine::<'static>::with_capacity(64);

        rx.on_pdu(
            &cfg,
            Pdu::FirstFrame {
                len: 30,
                data: &[0xAA; 6],
            },
        )
        .unwrap();
        assert!(matches!(
            rx.on_pdu(
                &cfg,
                Pdu::ConsecutiveFrame {
                    sn: 1,
                    data: &[0xBB; 7]
                }
            )
            .unwrap(),
            RxOutcome::None
        ));
        assert!(matches!(
            rx.on_pdu(
                &cfg,
                Pdu::ConsecutiveFrame {
                    sn: 2,
                    data: &[0xCC; 7]
                }
            )
            .unwrap(),
            RxOutcome::SendFlowControl { block_size: 2, .. }
        ));
    }
}
