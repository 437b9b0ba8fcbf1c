//! The tester-side UDS engine.
//!
//! [`UdsClient`] owns one transport binding and allows exactly one
//! outstanding transaction. Every transaction funnels through
//! [`UdsClient::wait_transaction`]: prepare, send, poll until the response
//! arrives (or a `0x78` response-pending frame extends the window), then
//! classify the outcome.

pub mod heartbeat;
pub mod response;

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{UdsError, UdsResult};
use crate::nrc::Nrc;
use crate::sid;
use crate::transport::Transport;
use heartbeat::{HeartbeatOutcome, Monitor};
use response::ResponseRegistry;

/// Default transaction timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Sentinel NRC value for errors that carry no NRC (transport faults).
pub const NON_NRC_ERROR: u8 = 0xFF;

/// Request option: set the suppress-positive-response bit on sub-function
/// services.
pub const OPT_SUPPRESS_POS_RESP: u8 = 0x01;

/// Client protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No transaction outstanding.
    Idle,
    /// Request queued on the transport.
    Sending,
    /// Waiting for the segmented send to finish.
    AwaitSendComplete,
    /// Request on the wire; waiting for the response.
    AwaitResponse,
}

/// Spinner/progress collaborator used while waiting for a response.
///
/// The engine never assumes a terminal is attached; the default observer
/// does nothing.
pub trait WaitObserver {
    /// A labelled wait started.
    fn begin(&mut self, label: &str);
    /// One poll iteration elapsed.
    fn tick(&mut self);
    /// The wait ended; `ok` is false on timeout.
    fn finish(&mut self, label: &str, ok: bool);
}

struct NullObserver;

impl WaitObserver for NullObserver {
    fn begin(&mut self, _label: &str) {}
    fn tick(&mut self) {}
    fn finish(&mut self, _label: &str, _ok: bool) {}
}

/// The UDS tester engine.
pub struct UdsClient {
    tp: Box<dyn Transport>,
    state: ClientState,
    options: u8,
    recv_buf: Vec<u8>,
    response_received: bool,
    last_nrc: u8,
    last_sid: u8,
    expect_response: bool,
    rcrrp: Option<Instant>,
    p2_star: Duration,
    registry: ResponseRegistry,
    heartbeat: Monitor,
    observer: Box<dyn WaitObserver>,
}

impl UdsClient {
    /// Build a client over a transport binding.
    pub fn new(tp: Box<dyn Transport>) -> Self {
        Self {
            tp,
            state: ClientState::Idle,
            options: 0,
            recv_buf: Vec::new(),
            response_received: false,
            last_nrc: 0,
            last_sid: 0,
            expect_response: true,
            rcrrp: None,
            p2_star: Duration::from_millis(5000),
            registry: ResponseRegistry::new(),
            heartbeat: Monitor::default(),
            observer: Box::new(NullObserver),
        }
    }

    /// Replace the wait observer (spinner renderer).
    pub fn set_wait_observer(&mut self, observer: Box<dyn WaitObserver>) {
        self.observer = observer;
    }

    /// Current protocol state.
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// True when no transaction is outstanding.
    pub fn is_idle(&self) -> bool {
        self.state == ClientState::Idle
    }

    /// The last fully received response payload.
    pub fn response(&self) -> &[u8] {
        &self.recv_buf
    }

    /// NRC of the last completed transaction (0 = positive,
    /// [`NON_NRC_ERROR`] = transport-level failure).
    pub fn last_nrc(&self) -> u8 {
        self.last_nrc
    }

    /// Set or clear the suppress-positive-response request option.
    pub fn set_suppress_positive_response(&mut self, on: bool) {
        if on {
            self.options |= OPT_SUPPRESS_POS_RESP;
        } else {
            self.options &= !OPT_SUPPRESS_POS_RESP;
        }
    }

    /// Subscribe a handler for a response SID (first payload byte).
    ///
    /// Registration is append-only; a duplicate SID overwrites the previous
    /// handler.
    pub fn register_response(&mut self, sid: u8, handler: impl FnMut(&[u8]) + 'static) {
        self.registry.register(sid, handler);
    }

    /// The heartbeat liveness monitor.
    pub fn heartbeat(&self) -> &Monitor {
        &self.heartbeat
    }

    /// Mutable access to the heartbeat monitor (interval, threshold, hook).
    pub fn heartbeat_mut(&mut self) -> &mut Monitor {
        &mut self.heartbeat
    }

    /// Clear transaction flags before a new request.
    pub fn prepare(&mut self) {
        self.response_received = false;
        self.last_nrc = 0;
        self.rcrrp = None;
    }

    /// Advance the protocol engine one step. Never blocks.
    pub fn poll(&mut self) {
        let status = self.tp.poll();
        if status.tport_err() {
            warn!("transport error during poll");
            self.heartbeat.note_failure();
            if self.state != ClientState::Idle && self.expect_response {
                // Fail the outstanding transaction with a non-NRC error.
                self.last_nrc = NON_NRC_ERROR;
                self.response_received = true;
                self.state = ClientState::Idle;
            }
        }

        if self.state == ClientState::Sending {
            self.state = ClientState::AwaitSendComplete;
        }
        if self.state == ClientState::AwaitSendComplete && !status.send_in_progress() {
            debug!("send complete");
            self.state = if self.expect_response {
                ClientState::AwaitResponse
            } else {
                ClientState::Idle
            };
        }

        if let Some(payload) = self.tp.take_payload() {
            if !payload.functional {
                self.on_response(payload.data);
            }
        }
    }

    fn on_response(&mut self, data: Vec<u8>) {
        if data.len() == 3
            && data[0] == sid::NEGATIVE_RESPONSE
            && data[2] == u8::from(Nrc::ResponsePending)
        {
            debug!("response pending (0x78), extending wait window");
            self.rcrrp = Some(Instant::now());
            return;
        }

        self.recv_buf = data;
        self.last_nrc = if self.recv_buf.first() == Some(&sid::NEGATIVE_RESPONSE) {
            self.recv_buf.get(2).copied().unwrap_or(NON_NRC_ERROR)
        } else {
            0
        };
        self.response_received = true;
        self.state = ClientState::Idle;
        // Any received response proves the link is alive.
        self.heartbeat.note_link_ok();

        let Self {
            registry, recv_buf, ..
        } = self;
        registry.dispatch(recv_buf);
    }

    /// The single funnel for all transactions: poll until the response
    /// arrives or the window (extended by P2* on every 0x78) expires, then
    /// classify the result.
    pub fn wait_transaction(
        &mut self,
        send_res: UdsResult<()>,
        label: Option<&str>,
        timeout: Duration,
    ) -> UdsResult<()> {
        send_res.inspect_err(|err| warn!(%err, "send failed"))?;

        if !self.expect_response {
            // Suppressed positive response: just drive the send to completion.
            let deadline = Instant::now() + timeout;
            while self.state != ClientState::Idle {
                self.poll();
                if Instant::now() > deadline {
                    return Err(UdsError::Timeout);
                }
                thread::sleep(Duration::from_millis(1));
            }
            return Ok(());
        }

        if let Some(label) = label {
            self.observer.begin(label);
        }

        let mut deadline = Instant::now() + timeout;
        while !self.response_received {
            self.poll();
            if let Some(at) = self.rcrrp.take() {
                deadline = at + self.p2_star;
            }
            if Instant::now() > deadline {
                if let Some(label) = label {
                    self.observer.finish(label, false);
                }
                warn!(sid = format_args!("0x{:02X}", self.last_sid), "transaction timed out");
                return Err(UdsError::Timeout);
            }
            self.observer.tick();
            thread::sleep(Duration::from_millis(1));
        }

        if let Some(label) = label {
            self.observer.finish(label, true);
        }

        match self.last_nrc {
            0 => Ok(()),
            NON_NRC_ERROR => Err(UdsError::Transport(
                crate::transport::TransportError::Write,
            )),
            nrc => Err(UdsError::Negative {
                sid: self.last_sid,
                nrc: Nrc::from(nrc),
            }),
        }
    }

    /// prepare → send → wait, with the default 1 s timeout.
    pub fn transaction<F>(&mut self, label: &str, send: F) -> UdsResult<()>
    where
        F: FnOnce(&mut Self) -> UdsResult<()>,
    {
        self.transaction_with_timeout(label, DEFAULT_TIMEOUT, send)
    }

    /// prepare → send → wait, with a caller-supplied timeout.
    pub fn transaction_with_timeout<F>(
        &mut self,
        label: &str,
        timeout: Duration,
        send: F,
    ) -> UdsResult<()>
    where
        F: FnOnce(&mut Self) -> UdsResult<()>,
    {
        self.prepare();
        let res = send(self);
        self.wait_transaction(res, Some(label), timeout)
    }

    // --- Heartbeat -------------------------------------------------------

    /// Run the heartbeat policy for this tick.
    ///
    /// Skips (without re-arming the timer) while a transaction is in flight;
    /// otherwise sends a suppressed TesterPresent and re-arms. Synchronous
    /// send failures bump the failure counter.
    pub fn service_heartbeat(&mut self) {
        let now = Instant::now();
        if !self.heartbeat.due(now) {
            return;
        }
        match self.send_heartbeat_safe() {
            HeartbeatOutcome::Busy => {}
            HeartbeatOutcome::Sent | HeartbeatOutcome::SendFailed => {
                self.heartbeat.rearm(now);
            }
        }
    }

    /// Send one TesterPresent heartbeat if the client is idle.
    pub fn send_heartbeat_safe(&mut self) -> HeartbeatOutcome {
        if self.state != ClientState::Idle {
            return HeartbeatOutcome::Busy;
        }
        let prev = self.options;
        self.options |= OPT_SUPPRESS_POS_RESP;
        let res = self.send_tester_present();
        self.options = prev;
        match res {
            Ok(()) => HeartbeatOutcome::Sent,
            Err(err) => {
                warn!(%err, "heartbeat send failed");
                self.heartbeat.note_failure();
                HeartbeatOutcome::SendFailed
            }
        }
    }

    // --- Request encoders ------------------------------------------------

    fn start_request(&mut self, buf: Vec<u8>, expect_response: bool) -> UdsResult<()> {
        if self.state != ClientState::Idle {
            return Err(UdsError::Busy);
        }
        self.last_sid = buf[0];
        self.tp.send(&buf, false)?;
        self.state = ClientState::Sending;
        self.expect_response = expect_response;
        Ok(())
    }

    fn sub_function(&self, value: u8) -> (u8, bool) {
        if self.options & OPT_SUPPRESS_POS_RESP != 0 {
            (value | sid::SUPPRESS_POS_RESP, false)
        } else {
            (value, true)
        }
    }

    /// 0x10 DiagnosticSessionControl.
    pub fn send_session_control(&mut self, session: u8) -> UdsResult<()> {
        let (sub, expect) = self.sub_function(session);
        self.start_request(vec![sid::DIAGNOSTIC_SESSION_CONTROL, sub], expect)
    }

    /// 0x11 ECUReset.
    pub fn send_ecu_reset(&mut self, reset_type: u8) -> UdsResult<()> {
        let (sub, expect) = self.sub_function(reset_type);
        self.start_request(vec![sid::ECU_RESET, sub], expect)
    }

    /// 0x22 ReadDataByIdentifier.
    pub fn send_rdbi(&mut self, dids: &[u16]) -> UdsResult<()> {
        let mut buf = Vec::with_capacity(1 + dids.len() * 2);
        buf.push(sid::READ_DATA_BY_IDENTIFIER);
        for did in dids {
            buf.extend_from_slice(&did.to_be_bytes());
        }
        self.start_request(buf, true)
    }

    /// 0x2E WriteDataByIdentifier.
    pub fn send_wdbi(&mut self, did: u16, data: &[u8]) -> UdsResult<()> {
        let mut buf = Vec::with_capacity(3 + data.len());
        buf.push(sid::WRITE_DATA_BY_IDENTIFIER);
        buf.extend_from_slice(&did.to_be_bytes());
        buf.extend_from_slice(data);
        self.start_request(buf, true)
    }

    /// 0x27 SecurityAccess: odd level requests a seed, even level sends a key.
    pub fn send_security_access(&mut self, level: u8, key: &[u8]) -> UdsResult<()> {
        let mut buf = Vec::with_capacity(2 + key.len());
        buf.push(sid::SECURITY_ACCESS);
        buf.push(level);
        buf.extend_from_slice(key);
        self.start_request(buf, true)
    }

    /// 0x28 CommunicationControl; sub-functions 0x04/0x05 require a node id.
    pub fn send_comm_control(
        &mut self,
        ctrl: u8,
        comm: u8,
        node_id: Option<u16>,
    ) -> UdsResult<()> {
        let (sub, expect) = self.sub_function(ctrl);
        let mut buf = vec![sid::COMMUNICATION_CONTROL, sub, comm];
        if let Some(node) = node_id {
            buf.extend_from_slice(&node.to_be_bytes());
        }
        self.start_request(buf, expect)
    }

    /// 0x2F InputOutputControlByIdentifier.
    pub fn send_io_control(&mut self, did: u16, param: u8, data: &[u8]) -> UdsResult<()> {
        let mut buf = Vec::with_capacity(4 + data.len());
        buf.push(sid::IO_CONTROL_BY_IDENTIFIER);
        buf.extend_from_slice(&did.to_be_bytes());
        buf.push(param);
        buf.extend_from_slice(data);
        self.start_request(buf, true)
    }

    /// 0x31 RoutineControl.
    pub fn send_routine_control(&mut self, sub: u8, rid: u16, option: &[u8]) -> UdsResult<()> {
        let mut buf = Vec::with_capacity(4 + option.len());
        buf.push(sid::ROUTINE_CONTROL);
        buf.push(sub);
        buf.extend_from_slice(&rid.to_be_bytes());
        buf.extend_from_slice(option);
        self.start_request(buf, true)
    }

    /// 0x38 RequestFileTransfer. `size` is required for uploads and omitted
    /// for reads.
    pub fn send_request_file_transfer(
        &mut self,
        mode: u8,
        path: &str,
        data_format: u8,
        size: Option<u32>,
    ) -> UdsResult<()> {
        let path = path.as_bytes();
        let mut buf = Vec::with_capacity(6 + path.len() + 9);
        buf.push(sid::REQUEST_FILE_TRANSFER);
        buf.push(mode);
        buf.extend_from_slice(&(path.len() as u16).to_be_bytes());
        buf.extend_from_slice(path);
        buf.push(data_format);
        if let Some(size) = size {
            buf.push(4);
            buf.extend_from_slice(&size.to_be_bytes());
            buf.extend_from_slice(&size.to_be_bytes());
        }
        self.start_request(buf, true)
    }

    /// 0x36 TransferData. An empty `data` requests the next download block.
    pub fn send_transfer_data(&mut self, sequence: u8, data: &[u8]) -> UdsResult<()> {
        let mut buf = Vec::with_capacity(2 + data.len());
        buf.push(sid::TRANSFER_DATA);
        buf.push(sequence);
        buf.extend_from_slice(data);
        self.start_request(buf, true)
    }

    /// 0x37 RequestTransferExit.
    pub fn send_transfer_exit(&mut self, data: &[u8]) -> UdsResult<()> {
        let mut buf = Vec::with_capacity(1 + data.len());
        buf.push(sid::REQUEST_TRANSFER_EXIT);
        buf.extend_from_slice(data);
        self.start_request(buf, true)
    }

    /// 0x3E TesterPresent; honours the suppress-positive-response option.
    pub fn send_tester_present(&mut self) -> UdsResult<()> {
        let (sub, expect) = self.sub_function(0x00);
        self.start_request(vec![sid::TESTER_PRESENT, sub], expect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn client_with(tp: MockTransport) -> UdsClient {
        UdsClient::new(Box::new(tp))
    }

    #[test]
    fn positive_response_completes_transaction() {
        let tp = MockTransport::new().script(&[0x10, 0x03], &[0x50, 0x03, 0x00, 0x32, 0x07, 0xD0]);
        let mut client = client_with(tp);

        client
            .transaction("session", |c| c.send_session_control(0x03))
            .unwrap();
        assert_eq!(client.response()[0], 0x50);
        assert_eq!(client.last_nrc(), 0);
        assert!(client.is_idle());
    }

    #[test]
    fn negative_response_surfaces_the_nrc() {
        let tp = MockTransport::new().script(&[0x27], &[0x7F, 0x27, 0x35]);
        let mut client = client_with(tp);

        let err = client
            .transaction("auth", |c| c.send_security_access(0x02, &[0, 0, 0, 0]))
            .unwrap_err();
        match err {
            UdsError::Negative { sid, nrc } => {
                assert_eq!(sid, 0x27);
                assert_eq!(nrc, Nrc::InvalidKey);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(client.last_nrc(), 0x35);
    }

    #[test]
    fn response_pending_extends_the_wait_window() {
        // Scripted transport answers with 0x78 first; then we inject the
        // final response from the test body.
        let tp = MockTransport::new().script(&[0x31], &[0x7F, 0x31, 0x78]);
        let mut client = client_with(tp);

        client.prepare();
        client.send_routine_control(0x01, 0xF000, b"free").unwrap();
        for _ in 0..5 {
            client.poll();
        }

        // The 0x78 frame must neither complete nor fail the transaction.
        assert_eq!(client.state(), ClientState::AwaitResponse);
        assert_eq!(client.last_nrc(), 0);
    }

    #[test]
    fn timeout_is_reported() {
        let tp = MockTransport::new();
        let mut client = client_with(tp);

        let err = client
            .transaction_with_timeout("read", Duration::from_millis(20), |c| {
                c.send_rdbi(&[0x0001])
            })
            .unwrap_err();
        assert!(matches!(err, UdsError::Timeout));
    }

    #[test]
    fn second_request_while_busy_is_rejected() {
        let tp = MockTransport::new();
        let mut client = client_with(tp);

        client.prepare();
        client.send_rdbi(&[0x0001]).unwrap();
        assert!(matches!(client.send_rdbi(&[0x0002]), Err(UdsError::Busy)));
    }

    #[test]
    fn suppressed_tester_present_expects_no_response() {
        let tp = MockTransport::new();
        let mut client = client_with(tp);

        client.set_suppress_positive_response(true);
        client.prepare();
        client.send_tester_present().unwrap();
        client.poll();
        assert!(client.is_idle());
    }

    #[test]
    fn response_registry_receives_full_payload() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let seen: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let seen_in_handler = seen.clone();

        let tp = MockTransport::new().script(&[0x22], &[0x62, 0x00, 0x01, 0xAB]);
        let mut client = client_with(tp);
        client.register_response(0x62, move |payload| {
            *seen_in_handler.borrow_mut() = payload.to_vec();
        });

        client.transaction("read", |c| c.send_rdbi(&[0x0001])).unwrap();
        assert_eq!(&*seen.borrow(), &[0x62, 0x00, 0x01, 0xAB]);
    }

    #[test]
    fn heartbeat_counts_send_failures_and_fires_once() {
        use std::cell::Cell;
        use std::rc::Rc;

        let fired = Rc::new(Cell::new(0u32));
        let fired_hook = fired.clone();

        let mut tp = MockTransport::new();
        tp.set_fail_sends(true);
        let mut client = client_with(tp);
        client
            .heartbeat_mut()
            .set_disconnect_hook(move || fired_hook.set(fired_hook.get() + 1));

        for _ in 0..5 {
            client.send_heartbeat_safe();
        }
        assert_eq!(fired.get(), 1);
        assert!(client.heartbeat().disconnected());
    }

    #[test]
    fn heartbeat_counter_clears_on_any_response() {
        let tp = MockTransport::new().script(&[0x3E, 0x00], &[0x7E, 0x00]);
        let mut client = client_with(tp);

        client.heartbeat_mut().note_failure();
        client.heartbeat_mut().note_failure();
        assert_eq!(client.heartbeat().fail_count(), 2);

        client
            .transaction("ping", |c| c.send_tester_present())
            .unwrap();
        assert_eq!(client.heartbeat().fail_count(), 0);
    }

    #[test]
    fn heartbeat_skips_while_transaction_in_flight() {
        let tp = MockTransport::new();
        let mut client = client_with(tp);

        client.prepare();
        client.send_rdbi(&[0x0001]).unwrap();
        assert_eq!(client.send_heartbeat_safe(), HeartbeatOutcome::Busy);
        assert_eq!(client.heartbeat().fail_count(), 0);
    }

    #[test]
    fn transport_error_during_poll_bumps_heartbeat() {
        let mut tp = MockTransport::new();
        tp.raise_tport_err();
        let mut client = client_with(tp);

        client.poll();
        assert_eq!(client.heartbeat().fail_count(), 1);
    }
}
