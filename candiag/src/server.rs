//! The ECU-side UDS engine.
//!
//! [`UdsServer`] owns the diagnostic state (session, security level, timing,
//! communication control) and the event dispatch table. It decodes requests
//! pulled from the transport binding, runs the matching handler chain and
//! encodes the positive or negative response. Service families plug in via
//! [`crate::services`].

pub mod dispatch;

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::SessionType;
use crate::nrc::Nrc;
use crate::sid;
use crate::transport::Transport;
use dispatch::{
    Args, CommControlArgs, DispatchResult, EcuResetArgs, Event, EventTable, FileTransferArgs,
    IoControlArgs, ReadDataArgs, RequestSeedArgs, RoutineControlArgs, ServiceNode,
    SessionControlArgs, TransferDataArgs, TransferExitArgs, ValidateKeyArgs, WriteDataArgs,
};

/// Communication-control state of one message group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommState {
    /// Both directions enabled (power-on default).
    EnableRxTx,
    /// Reception enabled, transmission disabled.
    EnableRxDisableTx,
    /// Reception disabled, transmission enabled.
    DisableRxEnableTx,
    /// Silent.
    DisableRxTx,
}

impl CommState {
    /// Decode a control-type byte (0x00–0x03).
    pub fn from_ctrl(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::EnableRxTx),
            0x01 => Some(Self::EnableRxDisableTx),
            0x02 => Some(Self::DisableRxEnableTx),
            0x03 => Some(Self::DisableRxTx),
            _ => None,
        }
    }

    /// Transmission allowed in this state.
    pub fn tx_enabled(self) -> bool {
        matches!(self, Self::EnableRxTx | Self::DisableRxEnableTx)
    }

    /// Reception allowed in this state.
    pub fn rx_enabled(self) -> bool {
        matches!(self, Self::EnableRxTx | Self::EnableRxDisableTx)
    }
}

/// Communication-control scope byte values.
pub mod comm_scope {
    /// Normal (application) messages.
    pub const NORMAL: u8 = 0x01;
    /// Network-management messages.
    pub const NM: u8 = 0x02;
    /// Both groups.
    pub const BOTH: u8 = 0x03;
}

/// Mutable server state shared with every handler.
pub struct ServerState {
    /// Active diagnostic session.
    pub session: SessionType,
    /// Unlocked security level (0 = locked).
    pub security_level: u8,
    /// Negotiated P2 (first-response) timing in milliseconds.
    pub p2_ms: u16,
    /// Negotiated P2* (post-0x78) timing in milliseconds.
    pub p2_star_ms: u16,
    /// Communication state of normal (application) messages.
    pub comm_normal: CommState,
    /// Communication state of network-management messages.
    pub comm_nm: CommState,
}

impl ServerState {
    /// Power-on defaults.
    pub fn new() -> Self {
        Self {
            session: SessionType::Default,
            security_level: 0,
            p2_ms: 50,
            p2_star_ms: 2000,
            comm_normal: CommState::EnableRxTx,
            comm_nm: CommState::EnableRxTx,
        }
    }

    /// Revert to the default-session state (used on timeout and reset).
    pub fn reset_to_default(&mut self) {
        self.session = SessionType::Default;
        self.security_level = 0;
        self.p2_ms = 50;
        self.p2_star_ms = 2000;
        self.comm_normal = CommState::EnableRxTx;
        self.comm_nm = CommState::EnableRxTx;
    }

    /// Application-payload transmission allowed under communication control.
    pub fn app_tx_enabled(&self) -> bool {
        self.comm_normal.tx_enabled()
    }

    /// Application-payload reception allowed under communication control.
    pub fn app_rx_enabled(&self) -> bool {
        self.comm_normal.rx_enabled()
    }

    /// NM transmission allowed under communication control.
    pub fn nm_tx_enabled(&self) -> bool {
        self.comm_nm.tx_enabled()
    }

    /// NM reception allowed under communication control.
    pub fn nm_rx_enabled(&self) -> bool {
        self.comm_nm.rx_enabled()
    }

    /// Apply a communication state to the groups selected by `scope`.
    pub fn set_comm_state(&mut self, comm_state: CommState, scope: u8) {
        match scope & 0x03 {
            comm_scope::NORMAL => self.comm_normal = comm_state,
            comm_scope::NM => self.comm_nm = comm_state,
            comm_scope::BOTH => {
                self.comm_normal = comm_state;
                self.comm_nm = comm_state;
            }
            _ => {}
        }
        info!(normal = ?self.comm_normal, nm = ?self.comm_nm, "communication state updated");
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Static server parameters.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// S3: session drops to default after this long without a request.
    pub s3_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            s3_timeout: Duration::from_millis(5000),
        }
    }
}

struct PendingRequest {
    payload: Vec<u8>,
    functional: bool,
}

/// The UDS server engine.
pub struct UdsServer {
    state: ServerState,
    table: EventTable,
    cfg: ServerConfig,
    s3_deadline: Instant,
    scheduled_reset: Option<(Instant, u8)>,
    pending: Option<PendingRequest>,
}

impl UdsServer {
    /// Server with default configuration.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Server with explicit configuration.
    pub fn with_config(cfg: ServerConfig) -> Self {
        let s3_deadline = Instant::now() + cfg.s3_timeout;
        Self {
            state: ServerState::new(),
            table: EventTable::new(),
            cfg,
            s3_deadline,
            scheduled_reset: None,
            pending: None,
        }
    }

    /// Register a service node.
    pub fn register(&mut self, node: ServiceNode) {
        self.table.register(node);
    }

    /// Read-only view of the diagnostic state.
    pub fn state(&self) -> &ServerState {
        &self.state
    }

    /// Mutable access to the diagnostic state (test hooks, resets).
    pub fn state_mut(&mut self) -> &mut ServerState {
        &mut self.state
    }

    /// Registered handler names for an event, in execution order.
    pub fn handler_names(&self, event: Event) -> Vec<&'static str> {
        self.table.handler_names(event)
    }

    /// Advance the engine: consume requests, drive the response-pending and
    /// scheduled-reset machinery, and police the S3 session timer.
    pub fn poll(&mut self, tp: &mut dyn Transport) {
        let status = tp.poll();
        if status.tport_err() {
            // Transport problems on the server side are logged; recovery is
            // the client's job via its retransmit/heartbeat machinery.
            warn!("transport error on server link");
        }

        if let Some((at, reset_type)) = self.scheduled_reset
            && Instant::now() >= at
        {
            self.scheduled_reset = None;
            info!(reset_type, "executing scheduled ECU reset");
            let Self { state, table, .. } = self;
            let mut args = Args::DoScheduledReset { reset_type };
            let _ = table.dispatch(state, Event::DoScheduledReset, &mut args);
        }

        if let Some(pending) = self.pending.take() {
            let payload = pending.payload;
            self.handle_request(tp, &payload, pending.functional, true);
        }

        if let Some(payload) = tp.take_payload() {
            self.handle_request(tp, &payload.data, payload.functional, false);
        }

        if self.state.session != SessionType::Default && Instant::now() >= self.s3_deadline {
            self.session_timeout();
        }
    }

    fn session_timeout(&mut self) {
        warn!("S3 expired, session falls back to default");
        let Self { state, table, .. } = self;
        let mut args = Args::SessionTimeout;
        let _ = table.dispatch(state, Event::SessionTimeout, &mut args);
        state.reset_to_default();
    }

    fn send_payload(tp: &mut dyn Transport, payload: &[u8]) {
        if let Err(err) = tp.send(payload, false) {
            warn!(%err, "response transmit failed");
        }
    }

    fn send_negative(tp: &mut dyn Transport, request_sid: u8, nrc: Nrc, functional: bool) {
        // Functional requests never get "not supported" style replies.
        if functional
            && matches!(
                nrc,
                Nrc::ServiceNotSupported | Nrc::SubFunctionNotSupported | Nrc::RequestOutOfRange
            )
        {
            debug!(sid = request_sid, %nrc, "negative response suppressed (functional)");
            return;
        }
        Self::send_payload(tp, &[sid::NEGATIVE_RESPONSE, request_sid, u8::from(nrc)]);
    }

    fn park_pending(
        &mut self,
        tp: &mut dyn Transport,
        payload: &[u8],
        functional: bool,
        already_announced: bool,
    ) {
        if !already_announced {
            Self::send_payload(
                tp,
                &[sid::NEGATIVE_RESPONSE, payload[0], u8::from(Nrc::ResponsePending)],
            );
        }
        self.pending = Some(PendingRequest {
            payload: payload.to_vec(),
            functional,
        });
    }

    fn handle_request(
        &mut self,
        tp: &mut dyn Transport,
        payload: &[u8],
        functional: bool,
        retry: bool,
    ) {
        let Some(&request_sid) = payload.first() else {
            return;
        };
        // Any request keeps the session alive.
        self.s3_deadline = Instant::now() + self.cfg.s3_timeout;

        debug!(
            sid = format_args!("0x{request_sid:02X}"),
            len = payload.len(),
            functional,
            "request received"
        );

        match request_sid {
            sid::DIAGNOSTIC_SESSION_CONTROL => {
                self.handle_session_control(tp, payload, functional, retry)
            }
            sid::ECU_RESET => self.handle_ecu_reset(tp, payload, functional, retry),
            sid::READ_DATA_BY_IDENTIFIER => self.handle_rdbi(tp, payload, functional, retry),
            sid::WRITE_DATA_BY_IDENTIFIER => self.handle_wdbi(tp, payload, functional, retry),
            sid::SECURITY_ACCESS => self.handle_security_access(tp, payload, functional, retry),
            sid::COMMUNICATION_CONTROL => self.handle_comm_control(tp, payload, functional, retry),
            sid::IO_CONTROL_BY_IDENTIFIER => self.handle_io_control(tp, payload, functional, retry),
            sid::ROUTINE_CONTROL => self.handle_routine_control(tp, payload, functional, retry),
            sid::REQUEST_FILE_TRANSFER => self.handle_file_transfer(tp, payload, functional, retry),
            sid::TRANSFER_DATA => self.handle_transfer_data(tp, payload, functional, retry),
            sid::REQUEST_TRANSFER_EXIT => self.handle_transfer_exit(tp, payload, functional, retry),
            sid::TESTER_PRESENT => self.handle_tester_present(tp, payload, functional),
            _ => Self::send_negative(tp, request_sid, Nrc::ServiceNotSupported, functional),
        }
    }

    fn handle_session_control(
        &mut self,
        tp: &mut dyn Transport,
        payload: &[u8],
        functional: bool,
        retry: bool,
    ) {
        if payload.len() != 2 {
            return Self::send_negative(
                tp,
                payload[0],
                Nrc::IncorrectMessageLengthOrInvalidFormat,
                functional,
            );
        }
        let suppress = payload[1] & sid::SUPPRESS_POS_RESP != 0;
        let requested = payload[1] & !sid::SUPPRESS_POS_RESP;

        let mut args = Args::SessionControl(SessionControlArgs {
            requested,
            p2_ms: self.state.p2_ms,
            p2_star_ms: self.state.p2_star_ms,
        });
        let Self { state, table, .. } = self;
        match table.dispatch(state, Event::SessionControl, &mut args) {
            DispatchResult::Positive => {
                let Args::SessionControl(args) = args else {
                    unreachable!()
                };
                state.session = SessionType::from(requested);
                state.p2_ms = args.p2_ms;
                state.p2_star_ms = args.p2_star_ms;
                info!(session = ?state.session, p2_ms = state.p2_ms, p2_star_ms = state.p2_star_ms, "session switched");
                if !suppress {
                    let mut resp = vec![sid::positive(sid::DIAGNOSTIC_SESSION_CONTROL), requested];
                    resp.extend_from_slice(&args.p2_ms.to_be_bytes());
                    resp.extend_from_slice(&args.p2_star_ms.to_be_bytes());
                    Self::send_payload(tp, &resp);
                }
            }
            DispatchResult::Pending => self.park_pending(tp, payload, functional, retry),
            DispatchResult::Negative(nrc) => Self::send_negative(tp, payload[0], nrc, functional),
        }
    }

    fn handle_ecu_reset(
        &mut self,
        tp: &mut dyn Transport,
        payload: &[u8],
        functional: bool,
        retry: bool,
    ) {
        if payload.len() != 2 {
            return Self::send_negative(
                tp,
                payload[0],
                Nrc::IncorrectMessageLengthOrInvalidFormat,
                functional,
            );
        }
        let suppress = payload[1] & sid::SUPPRESS_POS_RESP != 0;
        let reset_type = payload[1] & !sid::SUPPRESS_POS_RESP;

        let mut args = Args::EcuReset(EcuResetArgs {
            reset_type,
            power_down_ms: None,
        });
        let Self { state, table, .. } = self;
        match table.dispatch(state, Event::EcuReset, &mut args) {
            DispatchResult::Positive => {
                let Args::EcuReset(args) = args else {
                    unreachable!()
                };
                if !suppress {
                    Self::send_payload(tp, &[sid::positive(sid::ECU_RESET), reset_type]);
                }
                if let Some(delay_ms) = args.power_down_ms {
                    info!(reset_type, delay_ms, "reset scheduled");
                    self.scheduled_reset = Some((
                        Instant::now() + Duration::from_millis(delay_ms as u64),
                        reset_type,
                    ));
                }
            }
            DispatchResult::Pending => self.park_pending(tp, payload, functional, retry),
            DispatchResult::Negative(nrc) => Self::send_negative(tp, payload[0], nrc, functional),
        }
    }

    fn handle_rdbi(
        &mut self,
        tp: &mut dyn Transport,
        payload: &[u8],
        functional: bool,
        retry: bool,
    ) {
        if payload.len() < 3 || (payload.len() - 1) % 2 != 0 {
            return Self::send_negative(
                tp,
                payload[0],
                Nrc::IncorrectMessageLengthOrInvalidFormat,
                functional,
            );
        }

        let mut resp = vec![sid::positive(sid::READ_DATA_BY_IDENTIFIER)];
        for did_bytes in payload[1..].chunks_exact(2) {
            let did = u16::from_be_bytes([did_bytes[0], did_bytes[1]]);
            let mut args = Args::ReadDataByIdent(ReadDataArgs {
                did,
                data: Vec::new(),
            });
            let Self { state, table, .. } = self;
            match table.dispatch(state, Event::ReadDataByIdent, &mut args) {
                DispatchResult::Positive => {
                    let Args::ReadDataByIdent(args) = args else {
                        unreachable!()
                    };
                    resp.extend_from_slice(&did.to_be_bytes());
                    resp.extend_from_slice(&args.data);
                }
                DispatchResult::Pending => {
                    return self.park_pending(tp, payload, functional, retry);
                }
                DispatchResult::Negative(nrc) => {
                    return Self::send_negative(tp, payload[0], nrc, functional);
                }
            }
        }
        Self::send_payload(tp, &resp);
    }

    fn handle_wdbi(
        &mut self,
        tp: &mut dyn Transport,
        payload: &[u8],
        functional: bool,
        retry: bool,
    ) {
        if payload.len() < 4 {
            return Self::send_negative(
                tp,
                payload[0],
                Nrc::IncorrectMessageLengthOrInvalidFormat,
                functional,
            );
        }
        let did = u16::from_be_bytes([payload[1], payload[2]]);
        let mut args = Args::WriteDataByIdent(WriteDataArgs {
            did,
            data: &payload[3..],
        });
        let Self { state, table, .. } = self;
        match table.dispatch(state, Event::WriteDataByIdent, &mut args) {
            DispatchResult::Positive => {
                let mut resp = vec![sid::positive(sid::WRITE_DATA_BY_IDENTIFIER)];
                resp.extend_from_slice(&did.to_be_bytes());
                Self::send_payload(tp, &resp);
            }
            DispatchResult::Pending => self.park_pending(tp, payload, functional, retry),
            DispatchResult::Negative(nrc) => Self::send_negative(tp, payload[0], nrc, functional),
        }
    }

    fn handle_security_access(
        &mut self,
        tp: &mut dyn Transport,
        payload: &[u8],
        functional: bool,
        retry: bool,
    ) {
        if payload.len() < 2 {
            return Self::send_negative(
                tp,
                payload[0],
                Nrc::IncorrectMessageLengthOrInvalidFormat,
                functional,
            );
        }
        let sub = payload[1] & !sid::SUPPRESS_POS_RESP;
        if sub == 0 {
            return Self::send_negative(tp, payload[0], Nrc::SubFunctionNotSupported, functional);
        }

        if sub % 2 == 1 {
            // Odd: requestSeed.
            let mut args = Args::SecurityRequestSeed(RequestSeedArgs {
                level: sub,
                seed: Vec::new(),
            });
            let Self { state, table, .. } = self;
            match table.dispatch(state, Event::SecurityRequestSeed, &mut args) {
                DispatchResult::Positive => {
                    let Args::SecurityRequestSeed(args) = args else {
                        unreachable!()
                    };
                    let mut resp = vec![sid::positive(sid::SECURITY_ACCESS), sub];
                    resp.extend_from_slice(&args.seed);
                    Self::send_payload(tp, &resp);
                }
                DispatchResult::Pending => self.park_pending(tp, payload, functional, retry),
                DispatchResult::Negative(nrc) => {
                    Self::send_negative(tp, payload[0], nrc, functional)
                }
            }
        } else {
            // Even: sendKey for the paired odd level.
            let level = sub - 1;
            let mut args = Args::SecurityValidateKey(ValidateKeyArgs {
                level,
                key: &payload[2..],
            });
            let Self { state, table, .. } = self;
            match table.dispatch(state, Event::SecurityValidateKey, &mut args) {
                DispatchResult::Positive => {
                    state.security_level = level;
                    info!(level, "security access granted");
                    Self::send_payload(tp, &[sid::positive(sid::SECURITY_ACCESS), sub]);
                }
                DispatchResult::Pending => self.park_pending(tp, payload, functional, retry),
                DispatchResult::Negative(nrc) => {
                    Self::send_negative(tp, payload[0], nrc, functional)
                }
            }
        }
    }

    fn handle_comm_control(
        &mut self,
        tp: &mut dyn Transport,
        payload: &[u8],
        functional: bool,
        retry: bool,
    ) {
        if payload.len() < 3 {
            return Self::send_negative(
                tp,
                payload[0],
                Nrc::IncorrectMessageLengthOrInvalidFormat,
                functional,
            );
        }
        let suppress = payload[1] & sid::SUPPRESS_POS_RESP != 0;
        let ctrl = payload[1] & !sid::SUPPRESS_POS_RESP;
        let comm = payload[2];
        let node_id = if matches!(ctrl, 0x04 | 0x05) {
            if payload.len() < 5 {
                return Self::send_negative(
                    tp,
                    payload[0],
                    Nrc::IncorrectMessageLengthOrInvalidFormat,
                    functional,
                );
            }
            Some(u16::from_be_bytes([payload[3], payload[4]]))
        } else {
            None
        };

        let mut args = Args::CommControl(CommControlArgs {
            ctrl,
            comm,
            node_id,
        });
        let Self { state, table, .. } = self;
        match table.dispatch(state, Event::CommControl, &mut args) {
            DispatchResult::Positive => {
                // Global sub-functions are applied by the core; node-scoped
                // variants were already mapped by the handler.
                if let Some(comm_state) = CommState::from_ctrl(ctrl) {
                    state.set_comm_state(comm_state, comm);
                }
                if !suppress {
                    Self::send_payload(tp, &[sid::positive(sid::COMMUNICATION_CONTROL), ctrl]);
                }
            }
            DispatchResult::Pending => self.park_pending(tp, payload, functional, retry),
            DispatchResult::Negative(nrc) => Self::send_negative(tp, payload[0], nrc, functional),
        }
    }

    fn handle_io_control(
        &mut self,
        tp: &mut dyn Transport,
        payload: &[u8],
        functional: bool,
        retry: bool,
    ) {
        if payload.len() < 4 {
            return Self::send_negative(
                tp,
                payload[0],
                Nrc::IncorrectMessageLengthOrInvalidFormat,
                functional,
            );
        }
        let did = u16::from_be_bytes([payload[1], payload[2]]);
        let param = payload[3];

        let mut args = Args::IoControl(IoControlArgs {
            did,
            param,
            state: &payload[4..],
            response: Vec::new(),
        });
        let Self { state, table, .. } = self;
        match table.dispatch(state, Event::IoControl, &mut args) {
            DispatchResult::Positive => {
                let Args::IoControl(args) = args else {
                    unreachable!()
                };
                let mut resp = vec![sid::positive(sid::IO_CONTROL_BY_IDENTIFIER)];
                resp.extend_from_slice(&did.to_be_bytes());
                resp.push(param);
                resp.extend_from_slice(&args.response);
                Self::send_payload(tp, &resp);
            }
            DispatchResult::Pending => self.park_pending(tp, payload, functional, retry),
            DispatchResult::Negative(nrc) => Self::send_negative(tp, payload[0], nrc, functional),
        }
    }

    fn handle_routine_control(
        &mut self,
        tp: &mut dyn Transport,
        payload: &[u8],
        functional: bool,
        retry: bool,
    ) {
        if payload.len() < 4 {
            return Self::send_negative(
                tp,
                payload[0],
                Nrc::IncorrectMessageLengthOrInvalidFormat,
                functional,
            );
        }
        let suppress = payload[1] & sid::SUPPRESS_POS_RESP != 0;
        let sub_function = payload[1] & !sid::SUPPRESS_POS_RESP;
        let rid = u16::from_be_bytes([payload[2], payload[3]]);

        let mut args = Args::RoutineControl(RoutineControlArgs {
            sub_function,
            rid,
            option: &payload[4..],
            record: Vec::new(),
        });
        let Self { state, table, .. } = self;
        match table.dispatch(state, Event::RoutineControl, &mut args) {
            DispatchResult::Positive => {
                let Args::RoutineControl(args) = args else {
                    unreachable!()
                };
                if !suppress {
                    let mut resp = vec![sid::positive(sid::ROUTINE_CONTROL), sub_function];
                    resp.extend_from_slice(&rid.to_be_bytes());
                    resp.extend_from_slice(&args.record);
                    Self::send_payload(tp, &resp);
                }
            }
            DispatchResult::Pending => self.park_pending(tp, payload, functional, retry),
            DispatchResult::Negative(nrc) => Self::send_negative(tp, payload[0], nrc, functional),
        }
    }

    fn handle_file_transfer(
        &mut self,
        tp: &mut dyn Transport,
        payload: &[u8],
        functional: bool,
        retry: bool,
    ) {
        let malformed = |tp: &mut dyn Transport| {
            Self::send_negative(
                tp,
                sid::REQUEST_FILE_TRANSFER,
                Nrc::IncorrectMessageLengthOrInvalidFormat,
                functional,
            )
        };
        if payload.len() < 5 {
            return malformed(tp);
        }
        let mode = payload[1];
        let path_len = u16::from_be_bytes([payload[2], payload[3]]) as usize;
        let Some(dfi_at) = 4usize.checked_add(path_len).filter(|&at| at < payload.len()) else {
            return malformed(tp);
        };
        let path = &payload[4..dfi_at];
        let data_format = payload[dfi_at];
        let rest = &payload[dfi_at + 1..];

        let file_size = match mode {
            crate::file_mode::ADD_FILE | crate::file_mode::REPLACE_FILE => {
                let Some((&size_len, size_bytes)) = rest.split_first() else {
                    return malformed(tp);
                };
                let size_len = size_len as usize;
                if size_len == 0 || size_len > 4 || size_bytes.len() != size_len * 2 {
                    return malformed(tp);
                }
                let mut size: u32 = 0;
                for &b in &size_bytes[..size_len] {
                    size = (size << 8) | b as u32;
                }
                size
            }
            _ => 0,
        };

        // The protocol ceiling for one TransferData block is the transport
        // MTU minus the SID and sequence bytes.
        let proto_limit = tp.mtu().saturating_sub(2).min(u16::MAX as usize) as u16;

        let mut args = Args::RequestFileTransfer(FileTransferArgs {
            mode,
            path,
            data_format,
            file_size,
            max_block_len: proto_limit,
            read_size: None,
        });
        let Self { state, table, .. } = self;
        match table.dispatch(state, Event::RequestFileTransfer, &mut args) {
            DispatchResult::Positive => {
                let Args::RequestFileTransfer(args) = args else {
                    unreachable!()
                };
                let mut resp = vec![sid::positive(sid::REQUEST_FILE_TRANSFER), mode, 0x02];
                resp.extend_from_slice(&args.max_block_len.to_be_bytes());
                resp.push(data_format);
                if let Some(read_size) = args.read_size {
                    resp.push(0x04);
                    resp.extend_from_slice(&read_size.to_be_bytes());
                    resp.extend_from_slice(&read_size.to_be_bytes());
                }
                Self::send_payload(tp, &resp);
            }
            DispatchResult::Pending => self.park_pending(tp, payload, functional, retry),
            DispatchResult::Negative(nrc) => Self::send_negative(tp, payload[0], nrc, functional),
        }
    }

    fn handle_transfer_data(
        &mut self,
        tp: &mut dyn Transport,
        payload: &[u8],
        functional: bool,
        retry: bool,
    ) {
        if payload.len() < 2 {
            return Self::send_negative(
                tp,
                payload[0],
                Nrc::IncorrectMessageLengthOrInvalidFormat,
                functional,
            );
        }
        let sequence = payload[1];
        let max_resp_len = tp.mtu().saturating_sub(2).min(u16::MAX as usize) as u16;

        let mut args = Args::TransferData(TransferDataArgs {
            sequence,
            data: &payload[2..],
            max_resp_len,
            response: Vec::new(),
        });
        let Self { state, table, .. } = self;
        match table.dispatch(state, Event::TransferData, &mut args) {
            DispatchResult::Positive => {
                let Args::TransferData(args) = args else {
                    unreachable!()
                };
                let mut resp = vec![sid::positive(sid::TRANSFER_DATA), sequence];
                resp.extend_from_slice(&args.response);
                Self::send_payload(tp, &resp);
            }
            DispatchResult::Pending => self.park_pending(tp, payload, functional, retry),
            DispatchResult::Negative(nrc) => Self::send_negative(tp, payload[0], nrc, functional),
        }
    }

    fn handle_transfer_exit(
        &mut self,
        tp: &mut dyn Transport,
        payload: &[u8],
        functional: bool,
        retry: bool,
    ) {
        let mut args = Args::RequestTransferExit(TransferExitArgs {
            data: &payload[1..],
            response: Vec::new(),
        });
        let Self { state, table, .. } = self;
        match table.dispatch(state, Event::RequestTransferExit, &mut args) {
            DispatchResult::Positive => {
                let Args::RequestTransferExit(args) = args else {
                    unreachable!()
                };
                let mut resp = vec![sid::positive(sid::REQUEST_TRANSFER_EXIT)];
                resp.extend_from_slice(&args.response);
                Self::send_payload(tp, &resp);
            }
            DispatchResult::Pending => self.park_pending(tp, payload, functional, retry),
            DispatchResult::Negative(nrc) => Self::send_negative(tp, payload[0], nrc, functional),
        }
    }

    /// TesterPresent is core-handled: it already re-armed S3 on entry.
    fn handle_tester_present(&mut self, tp: &mut dyn Transport, payload: &[u8], functional: bool) {
        if payload.len() != 2 {
            return Self::send_negative(
                tp,
                payload[0],
                Nrc::IncorrectMessageLengthOrInvalidFormat,
                functional,
            );
        }
        let suppress = payload[1] & sid::SUPPRESS_POS_RESP != 0;
        if payload[1] & !sid::SUPPRESS_POS_RESP != 0 {
            return Self::send_negative(tp, payload[0], Nrc::SubFunctionNotSupported, functional);
        }
        if !suppress {
            Self::send_payload(tp, &[sid::positive(sid::TESTER_PRESENT), 0x00]);
        }
    }
}

impl Default for UdsServer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::dispatch::{Outcome, priority};
    use super::*;
    use crate::transport::mock::MockTransport;

    fn poll_with(server: &mut UdsServer, tp: &mut MockTransport, request: &[u8]) {
        tp.push_payload(request, false);
        server.poll(tp);
    }

    #[test]
    fn tester_present_answers_unless_suppressed() {
        let mut server = UdsServer::new();
        let mut tp = MockTransport::new();

        poll_with(&mut server, &mut tp, &[0x3E, 0x00]);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x7E, 0x00]);

        let sent_before = tp.sent().len();
        poll_with(&mut server, &mut tp, &[0x3E, 0x80]);
        assert_eq!(tp.sent().len(), sent_before);
    }

    #[test]
    fn unknown_sid_yields_service_not_supported() {
        let mut server = UdsServer::new();
        let mut tp = MockTransport::new();

        poll_with(&mut server, &mut tp, &[0x19, 0x02, 0xFF]);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x7F, 0x19, 0x11]);
    }

    #[test]
    fn negative_frames_are_exactly_three_bytes() {
        let mut server = UdsServer::new();
        let mut tp = MockTransport::new();

        poll_with(&mut server, &mut tp, &[0x22, 0x00]);
        let (frame, _) = tp.last_sent().unwrap();
        assert_eq!(frame.len(), 3);
        assert_eq!(frame[0], 0x7F);
    }

    #[test]
    fn functional_requests_never_get_unsupported_replies() {
        let mut server = UdsServer::new();
        let mut tp = MockTransport::new();

        tp.push_payload(&[0x19, 0x02], true);
        server.poll(&mut tp);
        assert!(tp.sent().is_empty());
    }

    #[test]
    fn session_control_updates_timing_and_state() {
        let mut server = UdsServer::new();
        server.register(ServiceNode::new(
            "session",
            Event::SessionControl,
            priority::NORMAL,
            |_, args| {
                let Args::SessionControl(args) = args else {
                    return Outcome::NotMine;
                };
                match args.requested {
                    0x01 => {
                        args.p2_ms = 50;
                        args.p2_star_ms = 2000;
                        Outcome::Handled
                    }
                    0x02 | 0x03 => {
                        args.p2_ms = 5000;
                        args.p2_star_ms = 5000;
                        Outcome::Handled
                    }
                    _ => Outcome::NotMine,
                }
            },
        ));
        let mut tp = MockTransport::new();

        poll_with(&mut server, &mut tp, &[0x10, 0x03]);
        assert_eq!(
            tp.last_sent().unwrap().0,
            vec![0x50, 0x03, 0x13, 0x88, 0x13, 0x88]
        );
        assert_eq!(server.state().session, SessionType::Extended);
        assert_eq!(server.state().p2_ms, 5000);
    }

    #[test]
    fn response_pending_announces_then_completes() {
        use std::cell::Cell;
        use std::rc::Rc;

        let calls = Rc::new(Cell::new(0u32));
        let handler_calls = calls.clone();

        let mut server = UdsServer::new();
        server.register(ServiceNode::new(
            "slow-routine",
            Event::RoutineControl,
            priority::NORMAL,
            move |_, args| {
                let Args::RoutineControl(args) = args else {
                    return Outcome::NotMine;
                };
                handler_calls.set(handler_calls.get() + 1);
                if handler_calls.get() < 3 {
                    Outcome::Pending
                } else {
                    args.record.push(0xA5);
                    Outcome::Handled
                }
            },
        ));
        let mut tp = MockTransport::new();

        poll_with(&mut server, &mut tp, &[0x31, 0x01, 0xF0, 0x00]);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x7F, 0x31, 0x78]);

        // Re-dispatch happens on subsequent polls without a new request.
        server.poll(&mut tp);
        server.poll(&mut tp);
        assert_eq!(
            tp.last_sent().unwrap().0,
            vec![0x71, 0x01, 0xF0, 0x00, 0xA5]
        );
        // Only one 0x78 was emitted for the whole episode.
        let pending_count = tp
            .sent()
            .iter()
            .filter(|(frame, _)| frame.as_slice() == [0x7F, 0x31, 0x78])
            .count();
        assert_eq!(pending_count, 1);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn session_timeout_reverts_to_default_and_notifies_observers() {
        use std::cell::Cell;
        use std::rc::Rc;

        let observed = Rc::new(Cell::new(false));
        let flag = observed.clone();

        let mut server = UdsServer::with_config(ServerConfig {
            s3_timeout: Duration::from_millis(20),
        });
        server.register(ServiceNode::new(
            "session",
            Event::SessionControl,
            priority::NORMAL,
            |_, _| Outcome::Handled,
        ));
        server.register(ServiceNode::new(
            "timeout-observer",
            Event::SessionTimeout,
            priority::HIGH,
            move |_, _| {
                flag.set(true);
                Outcome::Continue
            },
        ));
        let mut tp = MockTransport::new();

        poll_with(&mut server, &mut tp, &[0x10, 0x03]);
        assert_eq!(server.state().session, SessionType::Extended);
        server.state_mut().security_level = 0x01;

        std::thread::sleep(Duration::from_millis(40));
        server.poll(&mut tp);

        assert!(observed.get());
        assert_eq!(server.state().session, SessionType::Default);
        assert_eq!(server.state().security_level, 0);
    }

    #[test]
    fn scheduled_reset_fires_after_the_delay() {
        use std::cell::Cell;
        use std::rc::Rc;

        let reset_fired = Rc::new(Cell::new(false));
        let flag = reset_fired.clone();

        let mut server = UdsServer::new();
        server.register(ServiceNode::new(
            "reset-req",
            Event::EcuReset,
            priority::NORMAL,
            |_, args| {
                let Args::EcuReset(args) = args else {
                    return Outcome::NotMine;
                };
                args.power_down_ms = Some(10);
                Outcome::Handled
            },
        ));
        server.register(ServiceNode::new(
            "reset-exec",
            Event::DoScheduledReset,
            priority::NORMAL,
            move |_, _| {
                flag.set(true);
                Outcome::Handled
            },
        ));
        let mut tp = MockTransport::new();

        poll_with(&mut server, &mut tp, &[0x11, 0x01]);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x51, 0x01]);
        assert!(!reset_fired.get());

        std::thread::sleep(Duration::from_millis(20));
        server.poll(&mut tp);
        assert!(reset_fired.get());
    }

    #[test]
    fn rdbi_concatenates_multiple_dids() {
        let mut server = UdsServer::new();
        server.register(ServiceNode::new(
            "params",
            Event::ReadDataByIdent,
            priority::NORMAL,
            |_, args| {
                let Args::ReadDataByIdent(args) = args else {
                    return Outcome::NotMine;
                };
                match args.did {
                    0x0001 => {
                        args.data.extend_from_slice(&[0xAA]);
                        Outcome::Handled
                    }
                    0x0002 => {
                        args.data.extend_from_slice(&[0xBB, 0xCC]);
                        Outcome::Handled
                    }
                    _ => Outcome::NotMine,
                }
            },
        ));
        let mut tp = MockTransport::new();

        poll_with(&mut server, &mut tp, &[0x22, 0x00, 0x01, 0x00, 0x02]);
        assert_eq!(
            tp.last_sent().unwrap().0,
            vec![0x62, 0x00, 0x01, 0xAA, 0x00, 0x02, 0xBB, 0xCC]
        );
    }
}
