//! `embedded-can-mock`: an in-memory CAN bus for deterministic tests.
//!
//! [`MockBus::pair`] returns two connected interfaces: everything sent on one
//! appears in the other's receive queue. Send failures can be injected to
//! exercise transport-error paths without a real bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::sync::Arc;
use std::time::Duration;

use embedded_can::{Frame as EmbeddedFrame, Id};
use embedded_can_interface::{RxFrameIo, SplitTxRx, TxFrameIo};

const MAX_DLC: usize = 8;

/// A classic CAN 2.0 frame (dlc ≤ 8).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MockFrame {
    id: Id,
    data: [u8; MAX_DLC],
    dlc: u8,
    remote: bool,
}

impl EmbeddedFrame for MockFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        if data.len() > MAX_DLC {
            return None;
        }
        let mut buf = [0u8; MAX_DLC];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id: id.into(),
            data: buf,
            dlc: data.len() as u8,
            remote: false,
        })
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        if dlc > MAX_DLC {
            return None;
        }
        Some(Self {
            id: id.into(),
            data: [0u8; MAX_DLC],
            dlc: dlc as u8,
            remote: true,
        })
    }

    fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    fn is_remote_frame(&self) -> bool {
        self.remote
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        self.dlc as usize
    }

    fn data(&self) -> &[u8] {
        if self.remote {
            &[]
        } else {
            &self.data[..self.dlc as usize]
        }
    }
}

/// Errors produced by the mock interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockError {
    /// No frame queued (non-blocking receive).
    WouldBlock,
    /// The peer end was dropped.
    Disconnected,
    /// Receive deadline expired.
    Timeout,
    /// A send failure injected via [`MockCan::fail_sends`].
    InjectedFailure,
}

/// One endpoint of a mock bus pair.
pub struct MockCan {
    tx: Sender<MockFrame>,
    rx: Receiver<MockFrame>,
    fail_sends: Arc<AtomicBool>,
}

/// Control handle for fault injection, usable from any thread.
#[derive(Clone)]
pub struct FaultInjector {
    fail_sends: Arc<AtomicBool>,
}

impl FaultInjector {
    /// Make every subsequent send on the paired endpoint fail.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

/// Factory for connected interface pairs.
pub struct MockBus;

impl MockBus {
    /// Create two connected endpoints.
    pub fn pair() -> (MockCan, MockCan) {
        let (a_tx, b_rx) = channel();
        let (b_tx, a_rx) = channel();
        (
            MockCan {
                tx: a_tx,
                rx: a_rx,
                fail_sends: Arc::new(AtomicBool::new(false)),
            },
            MockCan {
                tx: b_tx,
                rx: b_rx,
                fail_sends: Arc::new(AtomicBool::new(false)),
            },
        )
    }
}

impl MockCan {
    /// Handle that injects send failures into this endpoint.
    pub fn fault_injector(&self) -> FaultInjector {
        FaultInjector {
            fail_sends: self.fail_sends.clone(),
        }
    }

    fn check_send(&self) -> Result<(), MockError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            Err(MockError::InjectedFailure)
        } else {
            Ok(())
        }
    }
}

impl TxFrameIo for MockCan {
    type Frame = MockFrame;
    type Error = MockError;

    fn send(&mut self, frame: &Self::Frame) -> Result<(), Self::Error> {
        self.check_send()?;
        self.tx.send(*frame).map_err(|_| MockError::Disconnected)
    }

    fn try_send(&mut self, frame: &Self::Frame) -> Result<(), Self::Error> {
        self.send(frame)
    }

    fn send_timeout(&mut self, frame: &Self::Frame, _timeout: Duration) -> Result<(), Self::Error> {
        self.send(frame)
    }
}

impl RxFrameIo for MockCan {
    type Frame = MockFrame;
    type Error = MockError;

    fn recv(&mut self) -> Result<Self::Frame, Self::Error> {
        self.rx.recv().map_err(|_| MockError::Disconnected)
    }

    fn try_recv(&mut self) -> Result<Self::Frame, Self::Error> {
        self.rx.try_recv().map_err(|err| match err {
            TryRecvError::Empty => MockError::WouldBlock,
            TryRecvError::Disconnected => MockError::Disconnected,
        })
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Self::Frame, Self::Error> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            std::sync::mpsc::RecvTimeoutError::Timeout => MockError::Timeout,
            std::sync::mpsc::RecvTimeoutError::Disconnected => MockError::Disconnected,
        })
    }
}

/// Tx/Rx halves of one mock endpoint.
pub struct MockTx {
    tx: Sender<MockFrame>,
    fail_sends: Arc<AtomicBool>,
}

/// Receive half of one mock endpoint.
pub struct MockRx {
    rx: Receiver<MockFrame>,
}

impl SplitTxRx for MockCan {
    type Tx = MockTx;
    type Rx = MockRx;

    fn split(self) -> (MockTx, MockRx) {
        (
            MockTx {
                tx: self.tx,
                fail_sends: self.fail_sends,
            },
            MockRx { rx: self.rx },
        )
    }
}

impl TxFrameIo for MockTx {
    type Frame = MockFrame;
    type Error = MockError;

    fn send(&mut self, frame: &Self::Frame) -> Result<(), Self::Error> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(MockError::InjectedFailure);
        }
        self.tx.send(*frame).map_err(|_| MockError::Disconnected)
    }

    fn try_send(&mut self, frame: &Self::Frame) -> Result<(), Self::Error> {
        self.send(frame)
    }

    fn send_timeout(&mut self, frame: &Self::Frame, _timeout: Duration) -> Result<(), Self::Error> {
        self.send(frame)
    }
}

impl RxFrameIo for MockRx {
    type Frame = MockFrame;
    type Error = MockError;

    fn recv(&mut self) -> Result<Self::Frame, Self::Error> {
        self.rx.recv().map_err(|_| MockError::Disconnected)
    }

    fn try_recv(&mut self) -> Result<Self::Frame, Self::Error> {
        self.rx.try_recv().map_err(|err| match err {
            TryRecvError::Empty => MockError::WouldBlock,
            TryRecvError::Disconnected => MockError::Disconnected,
        })
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Self::Frame, Self::Error> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            std::sync::mpsc::RecvTimeoutError::Timeout => MockError::Timeout,
            std::sync::mpsc::RecvTimeoutError::Disconnected => MockError::Disconnected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_can::StandardId;

    fn frame(id: u16, data: &[u8]) -> MockFrame {
        MockFrame::new(Id::Standard(StandardId::new(id).unwrap()), data).unwrap()
    }

    #[test]
    fn frames_cross_the_pair() {
        let (mut a, mut b) = MockBus::pair();
        a.send(&frame(0x7E0, &[0x02, 0x10, 0x03])).unwrap();
        let got = b.try_recv().unwrap();
        assert_eq!(got.data(), &[0x02, 0x10, 0x03]);
    }

    #[test]
    fn try_recv_on_empty_queue_would_block() {
        let (_a, mut b) = MockBus::pair();
        assert_eq!(b.try_recv(), Err(MockError::WouldBlock));
    }

    #[test]
    fn injected_send_failures_surface() {
        let (mut a, _b) = MockBus::pair();
        let fault = a.fault_injector();
        fault.set_fail_sends(true);
        assert_eq!(
            a.send(&frame(0x123, &[0])),
            Err(MockError::InjectedFailure)
        );
        fault.set_fail_sends(false);
        assert!(a.send(&frame(0x123, &[0])).is_ok());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        assert!(MockFrame::new(Id::Standard(StandardId::new(1).unwrap()), &[0u8; 9]).is_none());
    }
}
