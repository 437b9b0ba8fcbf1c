//! The transport binding contract between the UDS engines and ISO-TP.
//!
//! Both engines talk to the wire through [`Transport`]: a send entry point, a
//! `poll` that advances segmentation timers and reports a status bitset, and
//! a pull interface for completed reassembled payloads. The ISO-TP links
//! implement it in [`isotp`]; [`mock`] provides a scripted in-memory binding
//! for unit tests.

pub use candiag_isotp::LinkStatus;

/// A completed, reassembled application payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// UDS PDU bytes.
    pub data: Vec<u8>,
    /// True when the payload arrived on the functional (broadcast) channel.
    pub functional: bool,
}

/// Synchronous transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The CAN write path failed.
    #[error("CAN write failed")]
    Write,
    /// The payload exceeds what the transport can carry.
    #[error("payload exceeds transport capacity")]
    Overflow,
    /// A transfer is already in progress.
    #[error("transport busy")]
    Busy,
    /// Functional addressing was requested but not configured.
    #[error("no functional channel configured")]
    NoFunctional,
}

/// Object-safe transport binding.
pub trait Transport {
    /// Queue an application payload for transmission.
    fn send(&mut self, payload: &[u8], functional: bool) -> Result<(), TransportError>;

    /// Advance segmentation/reassembly; returns the link status bitset.
    fn poll(&mut self) -> LinkStatus;

    /// Take the next completed inbound payload, if any.
    fn take_payload(&mut self) -> Option<Payload>;

    /// Largest application payload this transport can carry.
    fn mtu(&self) -> usize;
}

pub mod isotp {
    //! [`Transport`] implementations over the `candiag-isotp` links.

    use candiag_isotp::errors::IsoTpError;
    use candiag_isotp::timer::Clock;
    use candiag_isotp::{ClientLink, LinkStatus, ServerLink};
    use embedded_can_interface::{RxFrameIo, TxFrameIo};

    use super::{Payload, Transport, TransportError};

    fn map_err<E>(err: IsoTpError<E>) -> TransportError {
        match err {
            IsoTpError::Overflow | IsoTpError::RxOverflow => TransportError::Overflow,
            IsoTpError::NotIdle => TransportError::Busy,
            IsoTpError::InvalidConfig => TransportError::NoFunctional,
            _ => TransportError::Write,
        }
    }

    /// Tester-side binding that owns a [`ClientLink`].
    pub struct ClientBinding<Tx, Rx, C>
    where
        Tx: TxFrameIo,
        Rx: RxFrameIo<Frame = Tx::Frame, Error = Tx::Error>,
        C: Clock,
    {
        link: ClientLink<Tx, Rx, C>,
    }

    impl<Tx, Rx, C> ClientBinding<Tx, Rx, C>
    where
        Tx: TxFrameIo,
        Rx: RxFrameIo<Frame = Tx::Frame, Error = Tx::Error>,
        C: Clock,
    {
        /// Wrap a client link.
        pub fn new(link: ClientLink<Tx, Rx, C>) -> Self {
            Self { link }
        }
    }

    impl<Tx, Rx, C> Transport for ClientBinding<Tx, Rx, C>
    where
        Tx: TxFrameIo,
        Rx: RxFrameIo<Frame = Tx::Frame, Error = Tx::Error>,
        C: Clock,
    {
        fn send(&mut self, payload: &[u8], functional: bool) -> Result<(), TransportError> {
            self.link.send(payload, functional).map_err(map_err)
        }

        fn poll(&mut self) -> LinkStatus {
            self.link.poll()
        }

        fn take_payload(&mut self) -> Option<Payload> {
            self.link.take_response().map(|data| Payload {
                data,
                functional: false,
            })
        }

        fn mtu(&self) -> usize {
            self.link.max_payload_len()
        }
    }

    /// ECU-side binding that owns a [`ServerLink`].
    ///
    /// The consumer thread routes frames in through [`ServerBinding::handle_frame`].
    pub struct ServerBinding<Tx, C>
    where
        Tx: TxFrameIo,
        C: Clock,
    {
        link: ServerLink<Tx, C>,
    }

    impl<Tx, C> ServerBinding<Tx, C>
    where
        Tx: TxFrameIo,
        C: Clock,
    {
        /// Wrap a server link.
        pub fn new(link: ServerLink<Tx, C>) -> Self {
            Self { link }
        }

        /// Route one received CAN frame into the link.
        pub fn handle_frame(&mut self, frame: &Tx::Frame) {
            self.link.handle_frame(frame);
        }
    }

    impl<Tx, C> Transport for ServerBinding<Tx, C>
    where
        Tx: TxFrameIo,
        C: Clock,
    {
        fn send(&mut self, payload: &[u8], _functional: bool) -> Result<(), TransportError> {
            // Responses always go out on the physical channel.
            self.link.send(payload).map_err(map_err)
        }

        fn poll(&mut self) -> LinkStatus {
            self.link.poll()
        }

        fn take_payload(&mut self) -> Option<Payload> {
            self.link
                .take_request()
                .map(|(data, functional)| Payload { data, functional })
        }

        fn mtu(&self) -> usize {
            self.link.max_payload_len()
        }
    }
}

pub mod mock {
    //! Scripted transport for unit tests: pair each expected request prefix
    //! with a canned response, inject transport errors, inspect what was
    //! sent.

    use std::collections::VecDeque;

    use super::{LinkStatus, Payload, Transport, TransportError};

    /// In-memory [`Transport`] with a request → response script.
    #[derive(Default)]
    pub struct MockTransport {
        script: Vec<(Vec<u8>, Vec<u8>)>,
        inbox: VecDeque<Payload>,
        sent: Vec<(Vec<u8>, bool)>,
        fail_sends: bool,
        tport_err_pending: bool,
        mtu: usize,
    }

    impl MockTransport {
        /// Empty transport with the default 4095-byte MTU.
        pub fn new() -> Self {
            Self {
                mtu: candiag_isotp::MAX_ISOTP_PAYLOAD,
                ..Self::default()
            }
        }

        /// Answer any sent payload starting with `request` with `response`.
        pub fn script(mut self, request: &[u8], response: &[u8]) -> Self {
            self.script.push((request.to_vec(), response.to_vec()));
            self
        }

        /// Queue a payload as if it had arrived from the peer.
        pub fn push_payload(&mut self, data: &[u8], functional: bool) {
            self.inbox.push_back(Payload {
                data: data.to_vec(),
                functional,
            });
        }

        /// Everything sent so far, with the functional flag.
        pub fn sent(&self) -> &[(Vec<u8>, bool)] {
            &self.sent
        }

        /// Most recently sent payload.
        pub fn last_sent(&self) -> Option<&(Vec<u8>, bool)> {
            self.sent.last()
        }

        /// Make every subsequent send fail synchronously.
        pub fn set_fail_sends(&mut self, fail: bool) {
            self.fail_sends = fail;
        }

        /// Report `TPORT_ERR` from the next `poll`.
        pub fn raise_tport_err(&mut self) {
            self.tport_err_pending = true;
        }
    }

    impl Transport for MockTransport {
        fn send(&mut self, payload: &[u8], functional: bool) -> Result<(), TransportError> {
            if self.fail_sends {
                return Err(TransportError::Write);
            }
            self.sent.push((payload.to_vec(), functional));
            if let Some((_, response)) = self
                .script
                .iter()
                .find(|(request, _)| payload.starts_with(request))
            {
                if !response.is_empty() {
                    self.inbox.push_back(Payload {
                        data: response.clone(),
                        functional: false,
                    });
                }
            }
            Ok(())
        }

        fn poll(&mut self) -> LinkStatus {
            let mut status = LinkStatus::default();
            if std::mem::take(&mut self.tport_err_pending) {
                status.set_tport_err();
            }
            status
        }

        fn take_payload(&mut self) -> Option<Payload> {
            self.inbox.pop_front()
        }

        fn mtu(&self) -> usize {
            self.mtu
        }
    }
}
