//! `embedded-can-interface`: blocking CAN frame I/O traits.
//!
//! `embedded-can` defines frame and identifier types plus nb-style HAL traits.
//! This crate adds the trait surface that host-side protocol layers (ISO-TP,
//! UDS) actually consume:
//! - [`TxFrameIo`] / [`RxFrameIo`]: blocking, non-blocking and deadline-bound
//!   frame transfer,
//! - [`FilterConfig`]: acceptance filters expressed as id/mask pairs,
//! - [`SplitTxRx`]: splitting a driver into independently owned halves, with
//!   [`shared_split`] as the mutex-based fallback for drivers that cannot be
//!   split natively.
//!
//! Drivers (simulated buses, SocketCAN adapters, …) implement these traits;
//! everything above them stays driver-agnostic.

use std::sync::{Arc, Mutex};
use std::time::Duration;

pub use embedded_can::{ExtendedId, Frame, Id, StandardId};

/// Acceptance mask matching the width of the paired identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdMask {
    /// Mask over an 11-bit identifier.
    Standard(u16),
    /// Mask over a 29-bit identifier.
    Extended(u32),
}

/// A single id/mask acceptance filter.
///
/// A frame passes when `frame_id & mask == filter_id & mask` and the
/// identifier widths agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMaskFilter {
    /// Reference identifier.
    pub id: Id,
    /// Bits of the identifier that must match.
    pub mask: IdMask,
}

impl IdMaskFilter {
    /// Filter that matches exactly one 11-bit identifier.
    pub fn exact_standard(id: StandardId) -> Self {
        Self {
            id: Id::Standard(id),
            mask: IdMask::Standard(0x7FF),
        }
    }

    /// Check a frame identifier against this filter.
    pub fn matches(&self, id: Id) -> bool {
        match (self.id, self.mask, id) {
            (Id::Standard(want), IdMask::Standard(mask), Id::Standard(got)) => {
                got.as_raw() & mask == want.as_raw() & mask
            }
            (Id::Extended(want), IdMask::Extended(mask), Id::Extended(got)) => {
                got.as_raw() & mask == want.as_raw() & mask
            }
            _ => false,
        }
    }
}

/// Transmit half of a CAN interface.
pub trait TxFrameIo {
    /// Frame type accepted by this interface.
    type Frame: Frame;
    /// Driver error type.
    type Error;

    /// Send a frame, blocking until it is queued.
    fn send(&mut self, frame: &Self::Frame) -> Result<(), Self::Error>;

    /// Send a frame without blocking; the driver decides whether "would
    /// block" is surfaced as an error or absorbed by an internal queue.
    fn try_send(&mut self, frame: &Self::Frame) -> Result<(), Self::Error>;

    /// Send a frame, giving up after `timeout`.
    fn send_timeout(&mut self, frame: &Self::Frame, timeout: Duration) -> Result<(), Self::Error>;
}

/// Receive half of a CAN interface.
pub trait RxFrameIo {
    /// Frame type produced by this interface.
    type Frame: Frame;
    /// Driver error type.
    type Error;

    /// Receive the next frame, blocking until one arrives.
    fn recv(&mut self) -> Result<Self::Frame, Self::Error>;

    /// Receive a frame if one is already queued.
    fn try_recv(&mut self) -> Result<Self::Frame, Self::Error>;

    /// Receive the next frame, giving up after `timeout`.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Self::Frame, Self::Error>;
}

/// Interfaces that support hardware or driver-side acceptance filtering.
pub trait FilterConfig {
    /// Driver error type.
    type Error;

    /// Replace the active filter set. An empty slice accepts every frame.
    fn set_filters(&mut self, filters: &[IdMaskFilter]) -> Result<(), Self::Error>;
}

/// Interfaces that can be split into independently owned Tx/Rx halves.
pub trait SplitTxRx {
    /// Transmit half.
    type Tx: TxFrameIo;
    /// Receive half.
    type Rx: RxFrameIo;

    /// Consume the interface and return both halves.
    fn split(self) -> (Self::Tx, Self::Rx);
}

/// Shared transmit half produced by [`shared_split`].
#[derive(Debug)]
pub struct SharedTx<T> {
    inner: Arc<Mutex<T>>,
}

/// Shared receive half produced by [`shared_split`].
#[derive(Debug)]
pub struct SharedRx<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> Clone for SharedTx<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Clone for SharedRx<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Split a whole interface into mutex-guarded halves.
///
/// For drivers whose Tx and Rx paths go through one handle. The halves may be
/// moved to different threads when `T: Send`.
pub fn shared_split<T>(iface: T) -> (SharedTx<T>, SharedRx<T>) {
    let inner = Arc::new(Mutex::new(iface));
    (
        SharedTx {
            inner: inner.clone(),
        },
        SharedRx { inner },
    )
}

impl<T: TxFrameIo> TxFrameIo for SharedTx<T> {
    type Frame = T::Frame;
    type Error = T::Error;

    fn send(&mut self, frame: &Self::Frame) -> Result<(), Self::Error> {
        self.inner.lock().unwrap().send(frame)
    }

    fn try_send(&mut self, frame: &Self::Frame) -> Result<(), Self::Error> {
        self.inner.lock().unwrap().try_send(frame)
    }

    fn send_timeout(&mut self, frame: &Self::Frame, timeout: Duration) -> Result<(), Self::Error> {
        self.inner.lock().unwrap().send_timeout(frame, timeout)
    }
}

impl<T: RxFrameIo> RxFrameIo for SharedRx<T> {
    type Frame = T::Frame;
    type Error = T::Error;

    fn recv(&mut self) -> Result<Self::Frame, Self::Error> {
        self.inner.lock().unwrap().recv()
    }

    fn try_recv(&mut self) -> Result<Self::Frame, Self::Error> {
        self.inner.lock().unwrap().try_recv()
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Self::Frame, Self::Error> {
        self.inner.lock().unwrap().recv_timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_filter_matches_masked_bits() {
        let filter = IdMaskFilter {
            id: Id::Standard(StandardId::new(0x7E8).unwrap()),
            mask: IdMask::Standard(0x7F8),
        };
        assert!(filter.matches(Id::Standard(StandardId::new(0x7E8).unwrap())));
        assert!(filter.matches(Id::Standard(StandardId::new(0x7EF).unwrap())));
        assert!(!filter.matches(Id::Standard(StandardId::new(0x7E0).unwrap())));
    }

    #[test]
    fn filter_rejects_mismatched_id_width() {
        let filter = IdMaskFilter::exact_standard(StandardId::new(0x123).unwrap());
        assert!(!filter.matches(Id::Extended(ExtendedId::new(0x123).unwrap())));
    }

    #[test]
    fn exact_standard_matches_only_that_id() {
        let filter = IdMaskFilter::exact_standard(StandardId::new(0x7E0).unwrap());
        assert!(filter.matches(Id::Standard(StandardId::new(0x7E0).unwrap())));
        assert!(!filter.matches(Id::Standard(StandardId::new(0x7E1).unwrap())));
    }
}
