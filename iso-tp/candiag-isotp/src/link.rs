//! Diagnostic link bindings: one physical request/response channel paired
//! with a functional (broadcast) channel, as used by UDS over CAN.
//!
//! Two shapes exist because the two peers drive their CAN interfaces
//! differently:
//! - [`ClientLink`] owns both interface halves and pumps reception itself
//!   from `poll`.
//! - [`ServerLink`] owns only the Tx half; a consumer thread pushes received
//!   frames in via [`ServerLink::handle_frame`] (frames typically arrive
//!   through a bounded queue fed by the driver callback).
//!
//! Both report a [`LinkStatus`] bitset from `poll`: `SEND_IN_PROGRESS` while
//! a segmented transmit is active (callers shorten their sleep to keep the
//! bus full) and `TPORT_ERR` when the underlying interface failed.

use core::mem;

use embedded_can::{Frame, Id, StandardId};
use embedded_can_interface::{RxFrameIo, TxFrameIo};
use tracing::{debug, warn};

use crate::config::IsoTpConfig;
use crate::errors::{IsoTpError, TimeoutKind};
use crate::pdu::{
    self, FlowStatus, MAX_CF_PAYLOAD, MAX_FF_PAYLOAD, MAX_SF_PAYLOAD, Pdu, duration_to_st_min,
    st_min_to_duration,
};
use crate::rx::{RxMachine, RxOutcome, RxState};
use crate::timer::Clock;
use crate::tx::{Progress, TxSession, TxState};

/// Status bits returned by link `poll`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStatus {
    bits: u8,
}

impl LinkStatus {
    const SEND_IN_PROGRESS: u8 = 1 << 0;
    const TPORT_ERR: u8 = 1 << 1;

    /// A segmented transmission is still in flight.
    pub fn send_in_progress(self) -> bool {
        self.bits & Self::SEND_IN_PROGRESS != 0
    }

    /// The underlying CAN interface reported an error since the last poll.
    pub fn tport_err(self) -> bool {
        self.bits & Self::TPORT_ERR != 0
    }

    /// Mark a transmission as in flight.
    pub fn set_send_in_progress(&mut self) {
        self.bits |= Self::SEND_IN_PROGRESS;
    }

    /// Mark a transport error.
    pub fn set_tport_err(&mut self) {
        self.bits |= Self::TPORT_ERR;
    }
}

/// The 11-bit identifier triple of one diagnostic connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagAddress {
    /// Tester → ECU request identifier (e.g. 0x7E0).
    pub request_id: StandardId,
    /// ECU → tester response identifier (e.g. 0x7E8).
    pub response_id: StandardId,
    /// Functional broadcast identifier (e.g. 0x7DF).
    pub functional_id: Option<StandardId>,
}

impl DiagAddress {
    /// Build an address set from raw identifier values.
    pub fn from_raw(request: u16, response: u16, functional: Option<u16>) -> Option<Self> {
        Some(Self {
            request_id: StandardId::new(request)?,
            response_id: StandardId::new(response)?,
            functional_id: match functional {
                Some(id) => Some(StandardId::new(id)?),
                None => None,
            },
        })
    }
}

#[derive(Clone, Copy)]
struct PendingFc {
    status: FlowStatus,
    block_size: u8,
    st_min: u8,
}

/// Transmit driver: owns the outbound payload so `poll` can continue a
/// segmented send without the caller re-supplying it.
struct TxDriver<I> {
    state: TxState<I>,
    payload: Vec<u8>,
    pending_fc: Option<PendingFc>,
}

impl<I: Copy + PartialOrd> TxDriver<I> {
    fn new() -> Self {
        Self {
            state: TxState::Idle,
            payload: Vec::new(),
            pending_fc: None,
        }
    }

    fn is_idle(&self) -> bool {
        matches!(self.state, TxState::Idle)
    }

    fn abort(&mut self) {
        self.state = TxState::Idle;
        self.payload.clear();
        self.pending_fc = None;
    }

    fn on_flow_control(&mut self, status: FlowStatus, block_size: u8, st_min: u8) {
        self.pending_fc = Some(PendingFc {
            status,
            block_size,
            st_min,
        });
    }

    fn start<Tx, C>(
        &mut self,
        tx: &mut Tx,
        id: Id,
        cfg: &IsoTpConfig,
        clock: &C,
        payload: &[u8],
        now: I,
    ) -> Result<Progress, IsoTpError<Tx::Error>>
    where
        Tx: TxFrameIo,
        C: Clock<Instant = I>,
    {
        if !self.is_idle() {
            return Err(IsoTpError::NotIdle);
        }
        if payload.is_empty() || payload.len() > cfg.max_payload_len {
            return Err(IsoTpError::Overflow);
        }

        if payload.len() <= MAX_SF_PAYLOAD {
            let frame = pdu::encode(
                id,
                &Pdu::SingleFrame {
                    len: payload.len() as u8,
                    data: payload,
                },
                cfg.padding,
            )
            .map_err(|_| IsoTpError::InvalidFrame)?;
            tx.try_send(&frame).map_err(IsoTpError::LinkError)?;
            return Ok(Progress::Completed);
        }

        let mut session = TxSession::new(payload.len(), cfg.block_size, cfg.st_min);
        let chunk = payload.len().min(MAX_FF_PAYLOAD);
        let frame = pdu::encode(
            id,
            &Pdu::FirstFrame {
                len: payload.len() as u16,
                data: &payload[..chunk],
            },
            cfg.padding,
        )
        .map_err(|_| IsoTpError::InvalidFrame)?;
        tx.try_send(&frame).map_err(IsoTpError::LinkError)?;
        session.offset = chunk;

        self.payload.clear();
        self.payload.extend_from_slice(payload);
        self.pending_fc = None;
        self.state = TxState::WaitingForFc {
            session,
            deadline: clock.add(now, cfg.n_bs),
        };
        Ok(Progress::WaitingForFlowControl)
    }

    fn advance<Tx, C>(
        &mut self,
        tx: &mut Tx,
        id: Id,
        cfg: &IsoTpConfig,
        clock: &C,
        now: I,
    ) -> Result<Progress, IsoTpError<Tx::Error>>
    where
        Tx: TxFrameIo,
        C: Clock<Instant = I>,
    {
        let state = mem::replace(&mut self.state, TxState::Idle);
        match state {
            TxState::Idle => Ok(Progress::Completed),
            TxState::WaitingForFc { session, deadline } => {
                self.continue_wait_for_fc(tx, id, cfg, clock, session, deadline, now)
            }
            TxState::Sending {
                session,
                st_min_deadline,
            } => self.continue_send(tx, id, cfg, clock, session, st_min_deadline, now),
        }
    }

    fn continue_wait_for_fc<Tx, C>(
        &mut self,
        tx: &mut Tx,
        id: Id,
        cfg: &IsoTpConfig,
        clock: &C,
        mut session: TxSession,
        deadline: I,
        now: I,
    ) -> Result<Progress, IsoTpError<Tx::Error>>
    where
        Tx: TxFrameIo,
        C: Clock<Instant = I>,
    {
        if now >= deadline {
            self.abort();
            return Err(IsoTpError::Timeout(TimeoutKind::NBs));
        }

        let fc = match self.pending_fc.take() {
            Some(fc) => fc,
            None => {
                self.state = TxState::WaitingForFc { session, deadline };
                return Ok(Progress::WaitingForFlowControl);
            }
        };

        match fc.status {
            FlowStatus::ClearToSend => {
                session.wait_count = 0;
                let bs = if fc.block_size == 0 {
                    cfg.block_size
                } else {
                    fc.block_size
                };
                session.block_size = bs;
                session.block_remaining = bs;
                session.st_min = st_min_to_duration(fc.st_min).unwrap_or(cfg.st_min);
                self.continue_send(tx, id, cfg, clock, session, None, now)
            }
            FlowStatus::Wait => {
                session.wait_count = session.wait_count.saturating_add(1);
                if session.wait_count > cfg.wft_max {
                    self.abort();
                    return Err(IsoTpError::Timeout(TimeoutKind::NBs));
                }
                self.state = TxState::WaitingForFc {
                    session,
                    deadline: clock.add(now, cfg.n_bs),
                };
                Ok(Progress::WaitingForFlowControl)
            }
            FlowStatus::Overflow => {
                self.abort();
                Err(IsoTpError::Overflow)
            }
        }
    }

    fn continue_send<Tx, C>(
        &mut self,
        tx: &mut Tx,
        id: Id,
        cfg: &IsoTpConfig,
        clock: &C,
        mut session: TxSession,
        st_min_deadline: Option<I>,
        now: I,
    ) -> Result<Progress, IsoTpError<Tx::Error>>
    where
        Tx: TxFrameIo,
        C: Clock<Instant = I>,
    {
        if let Some(deadline) = st_min_deadline
            && now < deadline
        {
            self.state = TxState::Sending {
                session,
                st_min_deadline: Some(deadline),
            };
            return Ok(Progress::WouldBlock);
        }

        if session.offset >= session.payload_len {
            self.abort();
            return Ok(Progress::Completed);
        }

        let remaining = session.payload_len - session.offset;
        let chunk = remaining.min(MAX_CF_PAYLOAD);
        let frame = pdu::encode(
            id,
            &Pdu::ConsecutiveFrame {
                sn: session.next_sn & 0x0F,
                data: &self.payload[session.offset..session.offset + chunk],
            },
            cfg.padding,
        )
        .map_err(|_| IsoTpError::InvalidFrame)?;
        tx.try_send(&frame).map_err(IsoTpError::LinkError)?;

        session.offset += chunk;
        session.next_sn = (session.next_sn + 1) & 0x0F;

        if session.offset >= session.payload_len {
            self.abort();
            return Ok(Progress::Completed);
        }

        if session.block_size > 0 {
            session.block_remaining = session.block_remaining.saturating_sub(1);
            if session.block_remaining == 0 {
                session.block_remaining = session.block_size;
                self.state = TxState::WaitingForFc {
                    session,
                    deadline: clock.add(now, cfg.n_bs),
                };
                return Ok(Progress::WaitingForFlowControl);
            }
        }

        let next_deadline = if session.st_min > core::time::Duration::from_millis(0) {
            Some(clock.add(now, session.st_min))
        } else {
            None
        };
        self.state = TxState::Sending {
            session,
            st_min_deadline: next_deadline,
        };
        Ok(Progress::InFlight)
    }
}

fn send_flow_control<Tx: TxFrameIo>(
    tx: &mut Tx,
    id: Id,
    cfg: &IsoTpConfig,
    status: FlowStatus,
    block_size: u8,
    st_min: u8,
) -> Result<(), IsoTpError<Tx::Error>> {
    let frame = pdu::encode(
        id,
        &Pdu::FlowControl {
            status,
            block_size,
            st_min,
        },
        cfg.padding,
    )
    .map_err(|_| IsoTpError::InvalidFrame)?;
    tx.try_send(&frame).map_err(IsoTpError::LinkError)
}

/// Tester-side diagnostic link.
pub struct ClientLink<Tx, Rx, C>
where
    Tx: TxFrameIo,
    Rx: RxFrameIo<Frame = Tx::Frame, Error = Tx::Error>,
    C: Clock,
{
    tx: Tx,
    rx: Rx,
    addr: DiagAddress,
    cfg: IsoTpConfig,
    clock: C,
    driver: TxDriver<C::Instant>,
    rx_machine: RxMachine<'static>,
    response: Option<Vec<u8>>,
    err_latch: bool,
}

impl<Tx, Rx, C> ClientLink<Tx, Rx, C>
where
    Tx: TxFrameIo,
    Rx: RxFrameIo<Frame = Tx::Frame, Error = Tx::Error>,
    C: Clock,
{
    /// Build a client link over split interface halves.
    pub fn new(
        tx: Tx,
        rx: Rx,
        addr: DiagAddress,
        cfg: IsoTpConfig,
        clock: C,
    ) -> Result<Self, IsoTpError<()>> {
        cfg.validate().map_err(|_| IsoTpError::InvalidConfig)?;
        let rx_machine = RxMachine::with_capacity(cfg.max_payload_len);
        Ok(Self {
            tx,
            rx,
            addr,
            cfg,
            clock,
            driver: TxDriver::new(),
            rx_machine,
            response: None,
            err_latch: false,
        })
    }

    /// The address set this link is bound to.
    pub fn address(&self) -> DiagAddress {
        self.addr
    }

    /// Largest application payload this link accepts.
    pub fn max_payload_len(&self) -> usize {
        self.cfg.max_payload_len
    }

    /// Queue a request for transmission.
    ///
    /// Functional requests must fit a Single Frame and go out immediately on
    /// the broadcast identifier; physical requests may be segmented and are
    /// driven to completion by subsequent `poll` calls.
    pub fn send(&mut self, payload: &[u8], functional: bool) -> Result<(), IsoTpError<Tx::Error>> {
        if functional {
            let func = self
                .addr
                .functional_id
                .ok_or(IsoTpError::InvalidConfig)?;
            if payload.is_empty() || payload.len() > MAX_SF_PAYLOAD {
                return Err(IsoTpError::Overflow);
            }
            let frame = pdu::encode(
                Id::Standard(func),
                &Pdu::SingleFrame {
                    len: payload.len() as u8,
                    data: payload,
                },
                self.cfg.padding,
            )
            .map_err(|_| IsoTpError::InvalidFrame)?;
            return self.tx.try_send(&frame).map_err(IsoTpError::LinkError);
        }

        let now = self.clock.now();
        self.driver
            .start(
                &mut self.tx,
                Id::Standard(self.addr.request_id),
                &self.cfg,
                &self.clock,
                payload,
                now,
            )
            .map(|_| ())
    }

    /// Advance transmission and reception once.
    pub fn poll(&mut self) -> LinkStatus {
        let mut status = LinkStatus::default();
        if mem::take(&mut self.err_latch) {
            status.set_tport_err();
        }

        self.ingest(&mut status);
        self.pump_tx(&mut status);

        if !self.driver.is_idle() {
            status.set_send_in_progress();
        }
        status
    }

    /// Take a completed, reassembled response payload if one is ready.
    pub fn take_response(&mut self) -> Option<Vec<u8>> {
        self.response.take()
    }

    fn ingest(&mut self, status: &mut LinkStatus) {
        loop {
            let frame = match self.rx.try_recv() {
                Ok(frame) => frame,
                Err(_) => break,
            };
            if frame.id() != Id::Standard(self.addr.response_id) {
                continue;
            }
            let pdu = match pdu::decode(frame.data()) {
                Ok(pdu) => pdu,
                Err(_) => {
                    debug!("dropping malformed ISO-TP frame");
                    continue;
                }
            };
            if let Pdu::FlowControl {
                status: fs,
                block_size,
                st_min,
            } = pdu
            {
                self.driver.on_flow_control(fs, block_size, st_min);
                continue;
            }
            match self.rx_machine.on_pdu(&self.cfg, pdu) {
                Ok(RxOutcome::None) => {}
                Ok(RxOutcome::SendFlowControl {
                    status: fs,
                    block_size,
                    st_min,
                }) => {
                    if send_flow_control(
                        &mut self.tx,
                        Id::Standard(self.addr.request_id),
                        &self.cfg,
                        fs,
                        block_size,
                        st_min,
                    )
                    .is_err()
                    {
                        warn!("flow control transmit failed");
                        status.set_tport_err();
                    }
                }
                Ok(RxOutcome::Completed(len)) => {
                    debug!(len, "response reassembled");
                    self.response = Some(self.rx_machine.take_completed().to_vec());
                }
                Err(IsoTpError::Overflow) | Err(IsoTpError::RxOverflow) => {
                    let _ = send_flow_control(
                        &mut self.tx,
                        Id::Standard(self.addr.request_id),
                        &self.cfg,
                        FlowStatus::Overflow,
                        0,
                        duration_to_st_min(self.cfg.st_min),
                    );
                    self.rx_machine.reset();
                    status.set_tport_err();
                }
                Err(_) => {
                    self.rx_machine.reset();
                }
            }
        }
    }

    fn pump_tx(&mut self, status: &mut LinkStatus) {
        let now = self.clock.now();
        while !self.driver.is_idle() {
            match self.driver.advance(
                &mut self.tx,
                Id::Standard(self.addr.request_id),
                &self.cfg,
                &self.clock,
                now,
            ) {
                Ok(Progress::InFlight) => continue,
                Ok(_) => break,
                Err(err) => {
                    warn!(error = ?classify(&err), "segmented transmit failed");
                    self.driver.abort();
                    status.set_tport_err();
                    break;
                }
            }
        }
    }
}

/// ECU-side diagnostic link; frames are pushed in by the consumer thread.
pub struct ServerLink<Tx, C>
where
    Tx: TxFrameIo,
    C: Clock,
{
    tx: Tx,
    addr: DiagAddress,
    cfg: IsoTpConfig,
    clock: C,
    driver: TxDriver<C::Instant>,
    rx_machine: RxMachine<'static>,
    request: Option<(Vec<u8>, bool)>,
    err_latch: bool,
}

impl<Tx, C> ServerLink<Tx, C>
where
    Tx: TxFrameIo,
    C: Clock,
{
    /// Build a server link over the Tx half of an interface.
    pub fn new(tx: Tx, addr: DiagAddress, cfg: IsoTpConfig, clock: C) -> Result<Self, IsoTpError<()>> {
        cfg.validate().map_err(|_| IsoTpError::InvalidConfig)?;
        let rx_machine = RxMachine::with_capacity(cfg.max_payload_len);
        Ok(Self {
            tx,
            addr,
            cfg,
            clock,
            driver: TxDriver::new(),
            rx_machine,
            request: None,
            err_latch: false,
        })
    }

    /// The address set this link is bound to.
    pub fn address(&self) -> DiagAddress {
        self.addr
    }

    /// Largest application payload this link accepts.
    pub fn max_payload_len(&self) -> usize {
        self.cfg.max_payload_len
    }

    /// Route one received CAN frame into the physical or functional channel.
    pub fn handle_frame(&mut self, frame: &Tx::Frame) {
        let id = frame.id();
        if id == Id::Standard(self.addr.request_id) {
            self.handle_physical(frame.data());
        } else if let Some(func) = self.addr.functional_id
            && id == Id::Standard(func)
        {
            self.handle_functional(frame.data());
        } else {
            debug!("ignoring unrelated CAN id");
        }
    }

    fn handle_physical(&mut self, data: &[u8]) {
        let pdu = match pdu::decode(data) {
            Ok(pdu) => pdu,
            Err(_) => {
                debug!("dropping malformed ISO-TP frame");
                return;
            }
        };
        if let Pdu::FlowControl {
            status,
            block_size,
            st_min,
        } = pdu
        {
            self.driver.on_flow_control(status, block_size, st_min);
            return;
        }
        match self.rx_machine.on_pdu(&self.cfg, pdu) {
            Ok(RxOutcome::None) => {}
            Ok(RxOutcome::SendFlowControl {
                status,
                block_size,
                st_min,
            }) => {
                if send_flow_control(
                    &mut self.tx,
                    Id::Standard(self.addr.response_id),
                    &self.cfg,
                    status,
                    block_size,
                    st_min,
                )
                .is_err()
                {
                    warn!("flow control transmit failed");
                    self.err_latch = true;
                }
            }
            Ok(RxOutcome::Completed(len)) => {
                debug!(len, "request reassembled");
                self.request = Some((self.rx_machine.take_completed().to_vec(), false));
            }
            Err(IsoTpError::Overflow) | Err(IsoTpError::RxOverflow) => {
                let _ = send_flow_control(
                    &mut self.tx,
                    Id::Standard(self.addr.response_id),
                    &self.cfg,
                    FlowStatus::Overflow,
                    0,
                    duration_to_st_min(self.cfg.st_min),
                );
                self.rx_machine.reset();
                self.err_latch = true;
            }
            Err(_) => {
                self.rx_machine.reset();
            }
        }
    }

    fn handle_functional(&mut self, data: &[u8]) {
        // ISO 15765-2: functional requests are ignored while a physical
        // segmented receive is in progress.
        if self.rx_machine.state == RxState::Receiving {
            warn!("dropped functional frame: physical channel busy");
            return;
        }
        match pdu::decode(data) {
            Ok(Pdu::SingleFrame { data, .. }) => {
                if self.request.is_none() {
                    self.request = Some((data.to_vec(), true));
                } else {
                    warn!("dropped functional frame: request pending");
                }
            }
            Ok(_) => debug!("functional channel accepts Single Frames only"),
            Err(_) => debug!("dropping malformed functional frame"),
        }
    }

    /// Queue a response for transmission on the physical channel.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), IsoTpError<Tx::Error>> {
        let now = self.clock.now();
        self.driver
            .start(
                &mut self.tx,
                Id::Standard(self.addr.response_id),
                &self.cfg,
                &self.clock,
                payload,
                now,
            )
            .map(|_| ())
    }

    /// Advance the transmit machine once.
    pub fn poll(&mut self) -> LinkStatus {
        let mut status = LinkStatus::default();
        if mem::take(&mut self.err_latch) {
            status.set_tport_err();
        }

        let now = self.clock.now();
        while !self.driver.is_idle() {
            match self.driver.advance(
                &mut self.tx,
                Id::Standard(self.addr.response_id),
                &self.cfg,
                &self.clock,
                now,
            ) {
                Ok(Progress::InFlight) => continue,
                Ok(_) => break,
                Err(err) => {
                    warn!(error = ?classify(&err), "segmented transmit failed");
                    self.driver.abort();
                    status.set_tport_err();
                    break;
                }
            }
        }

        if !self.driver.is_idle() {
            status.set_send_in_progress();
        }
        status
    }

    /// Take a completed request payload, with its functional flag.
    pub fn take_request(&mut self) -> Option<(Vec<u8>, bool)> {
        self.request.take()
    }
}

/// Reduce a backend-typed error to a loggable shape without `E: Debug`.
fn classify<E>(err: &IsoTpError<E>) -> &'static str {
    match err {
        IsoTpError::Timeout(TimeoutKind::NAs) => "timeout(N_As)",
        IsoTpError::Timeout(TimeoutKind::NAr) => "timeout(N_Ar)",
        IsoTpError::Timeout(TimeoutKind::NBs) => "timeout(N_Bs)",
        IsoTpError::Timeout(TimeoutKind::NBr) => "timeout(N_Br)",
        IsoTpError::Timeout(TimeoutKind::NCs) => "timeout(N_Cs)",
        IsoTpError::UnexpectedPdu => "unexpected pdu",
        IsoTpError::BadSequence => "bad sequence",
        IsoTpError::Overflow => "overflow",
        IsoTpError::InvalidFrame => "invalid frame",
        IsoTpError::InvalidConfig => "invalid config",
        IsoTpError::RxOverflow => "rx overflow",
        IsoTpError::NotIdle => "not idle",
        IsoTpError::LinkError(_) => "link error",
    }
}
