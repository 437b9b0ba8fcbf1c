//! Service 0x31 (RoutineControl): the remote console.
//!
//! The routine payload is a command line. While it executes, the process
//! console sink is swapped for an in-memory capture buffer (a guard restores
//! the previous sink on every exit path); the captured output becomes the
//! routine status record.

use std::cell::RefCell;
use std::io::Write as _;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::UdsServer;
use crate::nrc::Nrc;
use crate::server::dispatch::{Args, Event, Outcome, ServiceNode, priority};

/// Routine identifier of the remote console.
pub const RID_REMOTE_CONSOLE: u16 = 0xF000;
/// RoutineControl sub-function: startRoutine.
pub const START_ROUTINE: u8 = 0x01;

/// Byte sink standing in for the process console.
pub trait ConsoleSink {
    /// Write bytes to the sink.
    fn write(&mut self, bytes: &[u8]);
}

/// Sink that forwards to stdout.
pub struct StdoutSink;

impl ConsoleSink for StdoutSink {
    fn write(&mut self, bytes: &[u8]) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(bytes);
        let _ = out.flush();
    }
}

/// A swappable console slot shared between the application and the console
/// service.
#[derive(Clone)]
pub struct SharedConsole {
    inner: Rc<RefCell<Box<dyn ConsoleSink>>>,
}

impl SharedConsole {
    /// Console backed by the given sink.
    pub fn new(sink: Box<dyn ConsoleSink>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(sink)),
        }
    }

    /// Console backed by stdout.
    pub fn stdout() -> Self {
        Self::new(Box::new(StdoutSink))
    }

    /// Write bytes through the active sink.
    pub fn write(&self, bytes: &[u8]) {
        self.inner.borrow_mut().write(bytes);
    }

    /// Write a string through the active sink.
    pub fn print(&self, text: &str) {
        self.write(text.as_bytes());
    }

    fn swap(&self, sink: Box<dyn ConsoleSink>) -> Box<dyn ConsoleSink> {
        std::mem::replace(&mut *self.inner.borrow_mut(), sink)
    }
}

/// Guard that restores the previous sink when dropped.
pub struct RedirectGuard<'a> {
    console: &'a SharedConsole,
    prev: Option<Box<dyn ConsoleSink>>,
}

impl Drop for RedirectGuard<'_> {
    fn drop(&mut self) {
        if let Some(prev) = self.prev.take() {
            let _ = self.console.swap(prev);
        }
    }
}

/// Swap `sink` into the console; restored when the guard drops.
pub fn redirect(console: &SharedConsole, sink: Box<dyn ConsoleSink>) -> RedirectGuard<'_> {
    let prev = console.swap(sink);
    RedirectGuard {
        console,
        prev: Some(prev),
    }
}

/// Capture buffer size.
pub const CAPTURE_LEN: usize = 4000;
const TRUNCATION_MARK: &[u8] = b"\n[TRUNCATED]\n";

struct Capture {
    buf: Vec<u8>,
    limit: usize,
    overflow: bool,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit),
            limit,
            overflow: false,
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        if self.overflow {
            return;
        }
        let available = self.limit - self.buf.len();
        if bytes.len() <= available {
            self.buf.extend_from_slice(bytes);
            return;
        }

        // Not everything fits: keep what we can, then stamp the truncation
        // marker at the very end of the buffer.
        if available > TRUNCATION_MARK.len() {
            self.buf
                .extend_from_slice(&bytes[..available - TRUNCATION_MARK.len()]);
        } else if available < TRUNCATION_MARK.len() {
            let backtrack = TRUNCATION_MARK.len() - available;
            let keep = self.buf.len().saturating_sub(backtrack);
            self.buf.truncate(keep);
        }
        self.buf.extend_from_slice(TRUNCATION_MARK);
        self.overflow = true;
    }
}

struct CaptureSink(Rc<RefCell<Capture>>);

impl ConsoleSink for CaptureSink {
    fn write(&mut self, bytes: &[u8]) {
        self.0.borrow_mut().write(bytes);
    }
}

/// Command executor collaborator; writes its output through the console.
pub type ShellExec = Box<dyn FnMut(&str, &SharedConsole)>;

/// Access requirements and limits for the remote console.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleConfig {
    /// Routine identifier this console answers to.
    pub rid: u16,
    /// Require an extended or programming session.
    pub require_privileged_session: bool,
    /// Minimum unlocked security level (0 = none required).
    pub min_security_level: u8,
    /// Longest accepted command line.
    pub max_cmd_len: usize,
    /// Capture buffer size.
    pub capture_len: usize,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            rid: RID_REMOTE_CONSOLE,
            require_privileged_session: true,
            min_security_level: 0x01,
            max_cmd_len: 128,
            capture_len: CAPTURE_LEN,
        }
    }
}

/// The remote console service.
pub struct RemoteConsole {
    console: SharedConsole,
    exec: Rc<RefCell<ShellExec>>,
    cfg: ConsoleConfig,
}

impl RemoteConsole {
    /// Console service over a shared sink and an executor.
    pub fn new(console: SharedConsole, exec: impl FnMut(&str, &SharedConsole) + 'static) -> Self {
        Self {
            console,
            exec: Rc::new(RefCell::new(Box::new(exec))),
            cfg: ConsoleConfig::default(),
        }
    }

    /// Override access requirements and limits.
    pub fn with_config(mut self, cfg: ConsoleConfig) -> Self {
        self.cfg = cfg;
        self
    }

    /// Register the 0x31 handler.
    pub fn mount(self, server: &mut UdsServer) {
        let Self { console, exec, cfg } = self;
        server.register(ServiceNode::new(
            "console_exec",
            Event::RoutineControl,
            priority::NORMAL,
            move |state, args| {
                let Args::RoutineControl(args) = args else {
                    return Outcome::NotMine;
                };
                if args.rid != cfg.rid {
                    return Outcome::NotMine;
                }
                if cfg.require_privileged_session && !state.session.is_privileged() {
                    return Outcome::Deny(Nrc::ServiceNotSupportedInActiveSession);
                }
                if state.security_level < cfg.min_security_level {
                    return Outcome::Deny(Nrc::SecurityAccessDenied);
                }
                if args.sub_function != START_ROUTINE {
                    return Outcome::Deny(Nrc::SubFunctionNotSupported);
                }
                if args.option.is_empty() || args.option.len() > cfg.max_cmd_len {
                    return Outcome::Deny(Nrc::IncorrectMessageLengthOrInvalidFormat);
                }
                let Ok(cmd) = std::str::from_utf8(args.option) else {
                    return Outcome::Deny(Nrc::IncorrectMessageLengthOrInvalidFormat);
                };

                debug!(cmd, "remote exec");
                let capture = Rc::new(RefCell::new(Capture::new(cfg.capture_len)));
                {
                    let _guard = redirect(&console, Box::new(CaptureSink(capture.clone())));
                    // Echo the command for context, like a local shell would.
                    console.print(&format!("> {cmd}\n"));
                    (exec.borrow_mut())(cmd, &console);
                }

                let capture = capture.borrow();
                if capture.overflow {
                    warn!(cmd, "console output truncated");
                }
                args.record = capture.buf.clone();
                Outcome::Handled
            },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionType;
    use crate::transport::mock::MockTransport;

    fn console_server(min_security: u8) -> UdsServer {
        let mut server = UdsServer::new();
        let console = SharedConsole::new(Box::new(NullSink));
        RemoteConsole::new(console, |cmd, out| {
            out.print(&format!("ran: {cmd}\n"));
        })
        .with_config(ConsoleConfig {
            min_security_level: min_security,
            ..ConsoleConfig::default()
        })
        .mount(&mut server);
        server
    }

    struct NullSink;
    impl ConsoleSink for NullSink {
        fn write(&mut self, _bytes: &[u8]) {}
    }

    #[test]
    fn command_output_is_captured_into_the_response() {
        let mut server = console_server(0);
        server.state_mut().session = SessionType::Extended;
        let mut tp = MockTransport::new();

        let mut req = vec![0x31, 0x01, 0xF0, 0x00];
        req.extend_from_slice(b"free");
        tp.push_payload(&req, false);
        server.poll(&mut tp);

        let (resp, _) = tp.last_sent().unwrap();
        assert_eq!(&resp[..4], &[0x71, 0x01, 0xF0, 0x00]);
        assert_eq!(&resp[4..], b"> free\nran: free\n");
    }

    #[test]
    fn default_session_is_rejected() {
        let mut server = console_server(0);
        let mut tp = MockTransport::new();

        let mut req = vec![0x31, 0x01, 0xF0, 0x00];
        req.extend_from_slice(b"ls");
        tp.push_payload(&req, false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x7F, 0x31, 0x7F]);
    }

    #[test]
    fn locked_server_requires_security_access() {
        let mut server = console_server(0x01);
        server.state_mut().session = SessionType::Extended;
        let mut tp = MockTransport::new();

        let mut req = vec![0x31, 0x01, 0xF0, 0x00];
        req.extend_from_slice(b"ls");
        tp.push_payload(&req, false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x7F, 0x31, 0x33]);
    }

    #[test]
    fn other_routine_ids_fall_through() {
        let mut server = console_server(0);
        server.state_mut().session = SessionType::Extended;
        let mut tp = MockTransport::new();

        tp.push_payload(&[0x31, 0x01, 0x12, 0x34, 0x00], false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x7F, 0x31, 0x11]);
    }

    #[test]
    fn stop_routine_subfunction_is_rejected() {
        let mut server = console_server(0);
        server.state_mut().session = SessionType::Extended;
        let mut tp = MockTransport::new();

        tp.push_payload(&[0x31, 0x02, 0xF0, 0x00, 0x61], false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x7F, 0x31, 0x12]);
    }

    #[test]
    fn capture_truncates_with_a_marker_once_full() {
        let mut capture = Capture::new(64);
        capture.write(&[b'a'; 40]);
        assert!(!capture.overflow);
        capture.write(&[b'b'; 40]);
        assert!(capture.overflow);
        assert!(capture.buf.len() <= 64);
        assert!(capture.buf.ends_with(TRUNCATION_MARK));

        // Further writes are dropped.
        let len = capture.buf.len();
        capture.write(b"more");
        assert_eq!(capture.buf.len(), len);
    }

    #[test]
    fn tiny_remainder_backtracks_for_the_marker() {
        let mut capture = Capture::new(20);
        capture.write(&[b'x'; 18]);
        capture.write(&[b'y'; 10]);
        assert!(capture.overflow);
        assert!(capture.buf.len() <= 20);
        assert!(capture.buf.ends_with(TRUNCATION_MARK));
    }

    #[test]
    fn guard_restores_the_previous_sink() {
        use std::cell::RefCell;
        use std::rc::Rc;

        struct RecordingSink(Rc<RefCell<Vec<u8>>>);
        impl ConsoleSink for RecordingSink {
            fn write(&mut self, bytes: &[u8]) {
                self.0.borrow_mut().extend_from_slice(bytes);
            }
        }

        let outer: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let console = SharedConsole::new(Box::new(RecordingSink(outer.clone())));

        let inner: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        {
            let _guard = redirect(&console, Box::new(RecordingSink(inner.clone())));
            console.print("captured");
        }
        console.print("direct");

        assert_eq!(&*inner.borrow(), b"captured");
        assert_eq!(&*outer.borrow(), b"direct");
    }
}
