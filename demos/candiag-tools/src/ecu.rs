//! The demo ECU: service assembly and the two-thread runtime.
//!
//! A receive thread moves CAN frames from the interface into a bounded
//! queue (dropping with a warning when full); the consumer thread owns the
//! whole UDS server, routes frames into the ISO-TP link and polls the
//! engine with a dynamic timeout: zero while a segmented transmit is in
//! flight, ten milliseconds otherwise.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{RecvTimeoutError, TrySendError, sync_channel};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use candiag::server::dispatch::{Event, Outcome, ServiceNode, priority};
use candiag::services::comm::CommControl;
use candiag::services::console::{RemoteConsole, SharedConsole};
use candiag::services::file::FileService;
use candiag::services::io::IoService;
use candiag::services::param::{MemoryStore, ParamService};
use candiag::services::reset::EcuReset;
use candiag::services::security::SecurityAccess;
use candiag::services::session::SessionControl;
use candiag::transport::isotp::ServerBinding;
use candiag::{IoAction, UdsServer};
use candiag_isotp::{DiagAddress, IsoTpConfig, ServerLink, StdClock};
use embedded_can_interface::{
    FilterConfig, IdMaskFilter, RxFrameIo, SharedTx, StandardId, shared_split,
};
use embedded_can_vbus::VbusCan;
use tracing::{info, warn};

/// Everything needed to bring up one demo ECU.
#[derive(Debug, Clone)]
pub struct EcuOptions {
    /// Socket path of the vbus server.
    pub bus: PathBuf,
    /// Tester → ECU request identifier.
    pub request_id: u16,
    /// ECU → tester response identifier.
    pub response_id: u16,
    /// Functional broadcast identifier.
    pub functional_id: u16,
    /// Node id answered by communication control 0x04/0x05.
    pub node_id: u16,
    /// Security level served by the demo instance (odd).
    pub security_level: u8,
    /// Shared secret for the demo key derivation.
    pub security_key: u32,
    /// Root directory for file transfers and the remote console.
    pub file_root: PathBuf,
    /// Depth of the frame queue between the two threads.
    pub queue_depth: usize,
}

impl EcuOptions {
    /// Demo defaults on the classic OBD identifier pair.
    pub fn new(bus: impl Into<PathBuf>, file_root: impl Into<PathBuf>) -> Self {
        Self {
            bus: bus.into(),
            request_id: 0x7E0,
            response_id: 0x7E8,
            functional_id: 0x7DF,
            node_id: 0x0042,
            security_level: 0x01,
            security_key: 0xA5A5_A5A5,
            file_root: file_root.into(),
            // Sized for a full segmented ISO-TP transfer arriving in one
            // burst; the simulated bus has no wire-rate pacing.
            queue_depth: 512,
        }
    }
}

/// Assemble the full demo service set onto a fresh server.
pub fn build_server(opts: &EcuOptions) -> UdsServer {
    let mut server = UdsServer::new();

    // Log session drops before any service reacts to them.
    server.register(ServiceNode::new(
        "sys_log_timeout",
        Event::SessionTimeout,
        priority::HIGHEST,
        |_, _| {
            warn!("session timeout, resetting to default session");
            Outcome::Continue
        },
    ));

    SessionControl::default().mount(&mut server);
    EcuReset::default().mount(&mut server);
    CommControl::new(opts.node_id).mount(&mut server);
    SecurityAccess::new(opts.security_level, opts.security_key).mount(&mut server);

    let extended = Rc::new(RefCell::new(MemoryStore::with_entries([
        (0x0200, vec![0x12, 0x34]),
        (0xF195, b"candiag 0.1.0".to_vec()),
    ])));
    let general = Rc::new(RefCell::new(MemoryStore::with_entries([
        (0x0001, vec![0x00]),
        (0xF190, b"CANDIAG0000000001".to_vec()),
    ])));
    ParamService::new(extended, general).mount(&mut server);

    let io = IoService::new();
    let led: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(vec![0x00]));
    io.add_node(0x0100, move |_, action, input, response| {
        match action {
            IoAction::ShortTermAdjustment => {
                *led.borrow_mut() = input.to_vec();
                info!(
                    on = input.first().copied().unwrap_or(0) != 0,
                    "led override"
                );
            }
            IoAction::ReturnControl | IoAction::ResetToDefault => {
                *led.borrow_mut() = vec![0x00];
                info!("led returned to application control");
            }
            IoAction::FreezeCurrent => info!("led frozen"),
        }
        response.extend_from_slice(&led.borrow());
        Ok(())
    });
    io.mount(&mut server);

    let console = SharedConsole::stdout();
    let cwd = Rc::new(RefCell::new(PathBuf::from("/")));
    let root = opts.file_root.clone();
    RemoteConsole::new(console, move |cmd, out| {
        run_console_command(&root, &cwd, cmd, out)
    })
    .mount(&mut server);

    FileService::new(opts.file_root.clone()).mount(&mut server);

    server
}

/// The tiny command table behind the remote console.
fn run_console_command(
    root: &std::path::Path,
    cwd: &Rc<RefCell<PathBuf>>,
    line: &str,
    out: &SharedConsole,
) {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        return;
    };
    match cmd {
        "help" => {
            out.print("ls            list files in the current directory\n");
            out.print("cd            change the current directory\n");
            out.print("echo          print its arguments\n");
            out.print("free          show memory usage\n");
            out.print("uname         show system information\n");
            out.print("help          show this list\n");
        }
        "ls" => {
            let rel = cwd.borrow().clone();
            let dir = root.join(rel.strip_prefix("/").unwrap_or(&rel));
            out.print(&format!("Directory {}:\n", cwd.borrow().display()));
            match std::fs::read_dir(&dir) {
                Ok(entries) => {
                    for entry in entries.flatten() {
                        let name = entry.file_name().to_string_lossy().into_owned();
                        match entry.metadata() {
                            Ok(meta) if meta.is_dir() => {
                                out.print(&format!("{name:<24} <DIR>\n"));
                            }
                            Ok(meta) => out.print(&format!("{name:<24} {}\n", meta.len())),
                            Err(_) => out.print(&format!("{name:<24} ?\n")),
                        }
                    }
                }
                Err(err) => out.print(&format!("ls: {err}\n")),
            }
        }
        "cd" => {
            let target = parts.next().unwrap_or("/");
            let mut path = cwd.borrow().clone();
            if target == "/" {
                path = PathBuf::from("/");
            } else if target == ".." {
                path.pop();
                if path.as_os_str().is_empty() {
                    path = PathBuf::from("/");
                }
            } else if target.starts_with('/') {
                path = PathBuf::from(target);
            } else {
                path.push(target);
            }
            let resolved = root.join(path.strip_prefix("/").unwrap_or(&path));
            if resolved.is_dir() {
                *cwd.borrow_mut() = path;
            } else {
                out.print(&format!("cd: no such directory: {target}\n"));
            }
        }
        "echo" => {
            let rest: Vec<&str> = parts.collect();
            out.print(&rest.join(" "));
            out.print("\n");
        }
        "free" => {
            out.print("total    used    free\n");
            out.print("65536    12288   53248\n");
        }
        "uname" => out.print("candiag demo ecu\n"),
        other => out.print(&format!("{other}: command not found\n")),
    }
}

/// Handle to a running demo ECU.
pub struct EcuRuntime {
    stop: Arc<AtomicBool>,
    rx_thread: Option<thread::JoinHandle<()>>,
    consumer_thread: Option<thread::JoinHandle<()>>,
}

impl EcuRuntime {
    /// Connect to the bus and start the receive and consumer threads.
    pub fn spawn(opts: EcuOptions) -> Result<Self> {
        let mut can = VbusCan::connect(&opts.bus)
            .with_context(|| format!("connect to bus at {}", opts.bus.display()))?;
        can.set_filters(&[
            IdMaskFilter::exact_standard(
                StandardId::new(opts.request_id).ok_or_else(|| anyhow!("bad request id"))?,
            ),
            IdMaskFilter::exact_standard(
                StandardId::new(opts.functional_id).ok_or_else(|| anyhow!("bad functional id"))?,
            ),
        ])
        .map_err(|err| anyhow!("set acceptance filters: {err}"))?;

        let (tx, mut rx) = shared_split(can);
        let addr = DiagAddress::from_raw(opts.request_id, opts.response_id, Some(opts.functional_id))
            .ok_or_else(|| anyhow!("identifiers must be 11-bit"))?;

        std::fs::create_dir_all(&opts.file_root)
            .with_context(|| format!("create {}", opts.file_root.display()))?;

        let stop = Arc::new(AtomicBool::new(false));
        let (frame_tx, frame_rx) = sync_channel::<embedded_can_vbus::VbusFrame>(opts.queue_depth);

        // Receive producer: non-blocking hand-off into the bounded queue.
        let rx_stop = stop.clone();
        let rx_thread = thread::spawn(move || {
            while !rx_stop.load(Ordering::Relaxed) {
                match rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(frame) => {
                        if let Err(TrySendError::Full(_)) = frame_tx.try_send(frame) {
                            warn!("rx queue full, dropping CAN frame");
                        }
                    }
                    Err(embedded_can_vbus::VbusError::Timeout) => {}
                    Err(err) => {
                        warn!(%err, "bus receive failed, stopping rx thread");
                        break;
                    }
                }
            }
        });

        // Consumer: owns the link, the server and all service state.
        let consumer_stop = stop.clone();
        let consumer_thread = thread::spawn(move || {
            consumer_loop(opts, tx, addr, frame_rx, consumer_stop);
        });

        Ok(Self {
            stop,
            rx_thread: Some(rx_thread),
            consumer_thread: Some(consumer_thread),
        })
    }

    /// Stop both threads and wait for them.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.rx_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.consumer_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EcuRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn consumer_loop(
    opts: EcuOptions,
    tx: SharedTx<VbusCan>,
    addr: DiagAddress,
    frame_rx: std::sync::mpsc::Receiver<embedded_can_vbus::VbusFrame>,
    stop: Arc<AtomicBool>,
) {
    // Service state lives on this thread only; build everything here.
    let link = match ServerLink::new(tx, addr, IsoTpConfig::default(), StdClock) {
        Ok(link) => link,
        Err(_) => {
            warn!("invalid ISO-TP configuration");
            return;
        }
    };
    let mut binding = ServerBinding::new(link);
    let mut server = build_server(&opts);
    info!(
        request = format_args!("0x{:03X}", opts.request_id),
        response = format_args!("0x{:03X}", opts.response_id),
        functional = format_args!("0x{:03X}", opts.functional_id),
        "demo ECU ready"
    );

    while !stop.load(Ordering::Relaxed) {
        // Keep the bus saturated while a segmented response is in flight;
        // otherwise sleep on the queue to yield the CPU.
        let status = candiag::transport::Transport::poll(&mut binding);
        let timeout = if status.send_in_progress() {
            Duration::ZERO
        } else {
            Duration::from_millis(10)
        };

        match frame_rx.recv_timeout(timeout) {
            Ok(frame) => {
                binding.handle_frame(&frame);
                // Drain whatever else arrived; segmented transfers burst.
                while let Ok(frame) = frame_rx.try_recv() {
                    binding.handle_frame(&frame);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        server.poll(&mut binding);

        if timeout.is_zero() {
            thread::yield_now();
        }
    }
}
