//! `candiag-isotp`: an ISO-TP (ISO 15765-2) transport layer for diagnostic
//! links over classic CAN.
//!
//! ISO-TP carries payloads larger than one CAN frame by segmenting them into
//! a **Single Frame** (small payloads) or a **First Frame** plus
//! **Consecutive Frames**, paced by **Flow Control** frames from the
//! receiver.
//!
//! This crate provides:
//! - the PDU codec ([`pdu`]),
//! - the receive reassembly machine ([`rx`]) and transmit session state
//!   ([`tx`]),
//! - the two diagnostic link bindings ([`ClientLink`], [`ServerLink`]) that
//!   pair a physical request/response channel with a functional broadcast
//!   channel under normal 11-bit addressing.
//!
//! The links are polling state machines: callers tick `poll()` from their
//! own loop and never block. See [`link`] for the contract, including the
//! rule that functional frames are dropped while a physical segmented
//! receive is in progress.

pub mod config;
pub mod errors;
pub mod link;
pub mod pdu;
pub mod rx;
pub mod timer;
pub mod tx;

pub use config::{IsoTpConfig, MAX_ISOTP_PAYLOAD};
pub use errors::{IsoTpError, TimeoutKind};
pub use link::{ClientLink, DiagAddress, LinkStatus, ServerLink};
pub use rx::RxStorage;
pub use timer::{Clock, StdClock};
pub use tx::Progress;
