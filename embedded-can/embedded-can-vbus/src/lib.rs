//! `embedded-can-vbus`: a Unix-domain-socket CAN bus simulator.
//!
//! One [`BusServer`] hosts a simulated classic-CAN bus; any number of
//! [`VbusCan`] clients connect over a Unix socket and implement the
//! `embedded-can-interface` traits, so protocol layers run unchanged against
//! the simulator or a real interface.
//!
//! Bus semantics:
//! - a frame sent by one client is delivered to every *other* client whose
//!   acceptance filters match (no self-reception, as on a physical bus),
//! - sends are fire-and-forget; the server applies filtering,
//! - filter updates are acknowledged so they order correctly with in-flight
//!   traffic.
//!
//! ```no_run
//! use embedded_can::{Frame as _, Id, StandardId};
//! use embedded_can_interface::{RxFrameIo, TxFrameIo};
//! use embedded_can_vbus::{BusServer, VbusCan, VbusFrame};
//! use std::time::Duration;
//!
//! let path = std::env::temp_dir().join("vbus-example.sock");
//! let mut server = BusServer::start(&path).unwrap();
//! let mut a = VbusCan::connect(&path).unwrap();
//! let mut b = VbusCan::connect(&path).unwrap();
//!
//! let frame = VbusFrame::new(Id::Standard(StandardId::new(0x123).unwrap()), &[1, 2]).unwrap();
//! a.send(&frame).unwrap();
//! assert_eq!(b.recv_timeout(Duration::from_millis(100)).unwrap(), frame);
//! server.shutdown().unwrap();
//! ```

mod client;
mod frame;
mod server;
mod wire;

pub use crate::client::{VbusCan, VbusError};
pub use crate::frame::VbusFrame;
pub use crate::server::BusServer;
