//! Tester-side composition: transport + client construction, the shell
//! command implementations and the response handlers feeding the remote
//! caches.

use std::cell::{Cell, RefCell};
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use candiag::client::WaitObserver;
use candiag::services::console::RID_REMOTE_CONSOLE;
use candiag::services::file::crc_digest;
use candiag::transport::isotp::ClientBinding;
use candiag::{UdsClient, file_mode};
use candiag_isotp::{ClientLink, DiagAddress, IsoTpConfig, StdClock};
use embedded_can_interface::{FilterConfig, IdMaskFilter, StandardId, shared_split};
use embedded_can_vbus::VbusCan;
use tracing::{info, warn};

/// Demo key mask; must match the ECU's secret.
const SECRET_KEY_MASK: u32 = 0xA5A5_A5A5;

/// Connection parameters of the tester.
#[derive(Debug, Clone)]
pub struct TesterConfig {
    /// Socket path of the vbus server.
    pub bus: PathBuf,
    /// Tester source identifier (requests go out on this id).
    pub source: u16,
    /// ECU target identifier (responses come back on this id).
    pub target: u16,
    /// Functional broadcast identifier.
    pub functional: u16,
}

impl TesterConfig {
    /// Defaults on the classic OBD identifier pair.
    pub fn new(bus: impl Into<PathBuf>) -> Self {
        Self {
            bus: bus.into(),
            source: 0x7E0,
            target: 0x7E8,
            functional: 0x7DF,
        }
    }
}

/// State discovered from the remote peer, shared with the line editor for
/// completion and the prompt.
#[derive(Debug, Default)]
pub struct RemoteCaches {
    /// Remote command names parsed from `help` output.
    pub commands: Vec<String>,
    /// Remote file names parsed from `ls` output (directories end in `/`).
    pub files: Vec<String>,
    /// Remote working directory shown in the prompt.
    pub path: String,
}

/// Terminal spinner rendered while waiting for a response.
struct Spinner {
    frame: usize,
    ticks: usize,
}

impl Spinner {
    const FRAMES: [char; 4] = ['|', '/', '-', '\\'];

    fn new() -> Self {
        Self { frame: 0, ticks: 0 }
    }
}

impl WaitObserver for Spinner {
    fn begin(&mut self, label: &str) {
        self.frame = 0;
        self.ticks = 0;
        print!("{label}...");
        let _ = std::io::stdout().flush();
    }

    fn tick(&mut self) {
        self.ticks += 1;
        if self.ticks % 100 == 0 {
            print!("\r[{}] ...", Self::FRAMES[self.frame]);
            let _ = std::io::stdout().flush();
            self.frame = (self.frame + 1) % Self::FRAMES.len();
        }
    }

    fn finish(&mut self, label: &str, ok: bool) {
        if ok {
            print!("\r[+] {label} done.   \r\n");
        } else {
            println!();
        }
        let _ = std::io::stdout().flush();
    }
}

/// Build the transport stack and the UDS client for a tester config.
pub fn build_client(cfg: &TesterConfig) -> Result<UdsClient> {
    let mut can = VbusCan::connect(&cfg.bus)
        .with_context(|| format!("connect to bus at {}", cfg.bus.display()))?;
    can.set_filters(&[IdMaskFilter::exact_standard(
        StandardId::new(cfg.target).ok_or_else(|| anyhow!("target id must be 11-bit"))?,
    )])
    .map_err(|err| anyhow!("set acceptance filter: {err}"))?;

    let (tx, rx) = shared_split(can);
    let addr = DiagAddress::from_raw(cfg.source, cfg.target, Some(cfg.functional))
        .ok_or_else(|| anyhow!("identifiers must be 11-bit"))?;
    let link = ClientLink::new(tx, rx, addr, IsoTpConfig::default(), StdClock)
        .map_err(|_| anyhow!("invalid ISO-TP configuration"))?;

    let mut client = UdsClient::new(Box::new(ClientBinding::new(link)));
    client.set_wait_observer(Box::new(Spinner::new()));
    Ok(client)
}

/// The tester: one UDS client plus the shell-facing state around it.
pub struct Tester {
    /// The protocol engine.
    pub uds: UdsClient,
    caches: Arc<Mutex<RemoteCaches>>,
    silent: Rc<Cell<bool>>,
    last_remote_cmd: Rc<RefCell<String>>,
}

impl Tester {
    /// Connect to the bus and wire up the response handlers.
    pub fn connect(cfg: &TesterConfig) -> Result<Self> {
        let mut uds = build_client(cfg)?;
        let caches = Arc::new(Mutex::new(RemoteCaches {
            path: "/".to_string(),
            ..RemoteCaches::default()
        }));
        let silent = Rc::new(Cell::new(false));
        let last_remote_cmd = Rc::new(RefCell::new(String::new()));

        uds.register_response(0x62, print_rdbi_response);
        uds.register_response(0x6F, print_io_response);

        let console_caches = caches.clone();
        let console_silent = silent.clone();
        let console_last = last_remote_cmd.clone();
        uds.register_response(0x71, move |payload| {
            handle_console_response(payload, &console_caches, &console_silent, &console_last);
        });

        Ok(Self {
            uds,
            caches,
            silent,
            last_remote_cmd,
        })
    }

    /// The caches shared with the line editor.
    pub fn caches(&self) -> Arc<Mutex<RemoteCaches>> {
        self.caches.clone()
    }

    // --- Session / security ----------------------------------------------

    /// `session <hex>`: request a diagnostic session.
    pub fn cmd_session(&mut self, args: &[&str]) -> Result<()> {
        let Some(raw) = args.first() else {
            println!("Usage: session <type_hex>");
            println!("  01 : Default session");
            println!("  02 : Programming session");
            println!("  03 : Extended diagnostic session");
            return Ok(());
        };
        let session = u8::from_str_radix(raw, 16).context("invalid session type")?;
        if session == 0 || session > 0x7F {
            println!("[!] invalid session type 0x{session:02X}, valid range 0x01-0x7F");
            return Ok(());
        }
        self.request_session(session)
    }

    /// Request a session switch and wait for the positive response.
    pub fn request_session(&mut self, session: u8) -> Result<()> {
        self.uds
            .transaction("Switching session", |c| c.send_session_control(session))?;
        info!(session = format_args!("0x{session:02X}"), "session switched");
        Ok(())
    }

    /// `auth <odd level>`: seed & key unlock.
    pub fn cmd_auth(&mut self, args: &[&str]) -> Result<()> {
        let Some(raw) = args.first() else {
            println!("Usage: auth <level_hex>");
            println!("  01 : request level 1 (standard)");
            println!("Note: request the SEED level (odd number).");
            return Ok(());
        };
        let level = u8::from_str_radix(raw, 16).context("invalid security level")?;
        self.perform_security(level)
    }

    /// Run the two-transaction security handshake for an odd level.
    pub fn perform_security(&mut self, level: u8) -> Result<()> {
        if level % 2 == 0 {
            bail!("security level 0x{level:02X} must be odd (request-seed level)");
        }

        info!(level, "starting security access");
        self.uds.prepare();
        let res = self.uds.send_security_access(level, &[]);
        self.uds
            .wait_transaction(res, Some("Requesting seed"), Duration::from_millis(2000))?;

        let resp = self.uds.response().to_vec();
        if resp.first() != Some(&0x67) || resp.get(1) != Some(&level) {
            bail!("unexpected seed response");
        }
        // Some servers answer "already unlocked" with a bare [SID, level];
        // others send a full-length zero seed. Accept both.
        let seed = match resp.get(2..6) {
            Some(seed) if seed.iter().any(|&b| b != 0) => {
                u32::from_be_bytes([seed[0], seed[1], seed[2], seed[3]])
            }
            _ => {
                info!("already unlocked");
                return Ok(());
            }
        };

        let key = seed ^ SECRET_KEY_MASK;
        info!(
            seed = format_args!("0x{seed:08X}"),
            key = format_args!("0x{key:08X}"),
            "key derived"
        );

        self.uds.prepare();
        let res = self.uds.send_security_access(level + 1, &key.to_be_bytes());
        self.uds
            .wait_transaction(res, Some("Verifying key"), Duration::from_millis(1000))?;
        info!("security access granted");
        Ok(())
    }

    // --- Simple services -------------------------------------------------

    /// `er <type>`: ECU reset.
    pub fn cmd_er(&mut self, args: &[&str]) -> Result<()> {
        let Some(raw) = args.first() else {
            println!("Usage: er <type_hex>  (01=hard, 02=key-off-on, 03=soft)");
            return Ok(());
        };
        let reset_type = u8::from_str_radix(raw, 16).context("invalid reset type")?;
        self.uds
            .transaction("Resetting", |c| c.send_ecu_reset(reset_type))?;
        info!(reset_type, "reset accepted");
        Ok(())
    }

    /// `rdbi <did>`: read one data identifier.
    pub fn cmd_rdbi(&mut self, args: &[&str]) -> Result<()> {
        let Some(raw) = args.first() else {
            println!("Usage: rdbi <did_hex>");
            return Ok(());
        };
        let did = u16::from_str_radix(raw, 16).context("invalid DID")?;
        self.uds.transaction("Reading", |c| c.send_rdbi(&[did]))
            .map_err(Into::into)
    }

    /// `wdbi <did> <b0> [b1…]`: write a data identifier.
    pub fn cmd_wdbi(&mut self, args: &[&str]) -> Result<()> {
        if args.len() < 2 {
            println!("Usage: wdbi <did_hex> <data_hex...>");
            return Ok(());
        }
        let did = u16::from_str_radix(args[0], 16).context("invalid DID")?;
        let data = parse_hex_bytes(&args[1..])?;
        info!(did = format_args!("0x{did:04X}"), len = data.len(), "writing");
        self.uds
            .transaction("Writing", |c| c.send_wdbi(did, &data))
            .map_err(Into::into)
    }

    /// `io <did> <param> [data…]`: input/output control.
    pub fn cmd_io(&mut self, args: &[&str]) -> Result<()> {
        if args.len() < 2 {
            println!("Usage: io <did_hex> <param_hex> [data...]");
            println!("  params: 00=return, 01=reset, 02=freeze, 03=short-term");
            return Ok(());
        }
        let did = u16::from_str_radix(args[0], 16).context("invalid DID")?;
        let param = u8::from_str_radix(args[1], 16).context("invalid control parameter")?;
        let data = parse_hex_bytes(&args[2..])?;
        self.uds
            .transaction("Controlling IO", |c| c.send_io_control(did, param, &data))
            .map_err(Into::into)
    }

    /// `cc <ctrl> [comm] [node]`: communication control.
    pub fn cmd_cc(&mut self, args: &[&str]) -> Result<()> {
        let Some(raw) = args.first() else {
            println!("Usage: cc <ctrl> [comm] [node_id]");
            println!("  <ctrl>: 00=enable, 01=dis-tx, 03=silent, 04/05=node-scoped");
            println!("  [comm]: 01=normal, 02=nm, 03=both (default)");
            return Ok(());
        };
        let ctrl = u8::from_str_radix(raw, 16).context("invalid control type")?;
        let comm = match args.get(1) {
            Some(raw) => u8::from_str_radix(raw, 16).context("invalid communication type")?,
            None => 0x03,
        };
        let node_id = match args.get(2) {
            Some(raw) => Some(u16::from_str_radix(raw, 16).context("invalid node id")?),
            None => None,
        };
        if matches!(ctrl, 0x04 | 0x05) && node_id.is_none() {
            bail!("control type 0x{ctrl:02X} requires a node id argument");
        }
        self.uds
            .transaction("Requesting", |c| c.send_comm_control(ctrl, comm, node_id))?;
        info!("communication control accepted");
        Ok(())
    }

    // --- Remote console --------------------------------------------------

    /// `rexec <cmd…>`: explicit remote execution.
    pub fn cmd_rexec(&mut self, args: &[&str]) -> Result<()> {
        if args.is_empty() {
            return Ok(());
        }
        self.send_console_command(&args.join(" "))
    }

    /// `cd <path>`: change the remote directory, optimistically updating the
    /// prompt before the reply (resynced by the next `ls`).
    pub fn cmd_cd(&mut self, args: &[&str]) -> Result<()> {
        let target = args.first().copied().unwrap_or("/");
        let guess = {
            let caches = self.caches.lock().unwrap();
            resolve_remote_path(&caches.path, target)
        };
        self.caches.lock().unwrap().path = guess;
        self.send_console_command(&format!("cd {target}"))
    }

    /// Send one command line through the remote console routine.
    pub fn send_console_command(&mut self, cmd: &str) -> Result<()> {
        // Let any in-flight transaction (e.g. a heartbeat) drain first.
        let mut retries = 10;
        while !self.uds.is_idle() && retries > 0 {
            self.uds.poll();
            thread::sleep(Duration::from_millis(10));
            retries -= 1;
        }
        if !self.uds.is_idle() {
            bail!("client busy, cannot send '{cmd}'");
        }
        if cmd.is_empty() {
            return Ok(());
        }

        if !self.silent.get() {
            info!(cmd, "remote exec");
        }
        *self.last_remote_cmd.borrow_mut() = cmd.to_string();

        // Silent syncs suppress the spinner animation.
        let label = if self.silent.get() {
            None
        } else {
            Some("Remote exec")
        };
        self.uds.prepare();
        let res = self
            .uds
            .send_routine_control(0x01, RID_REMOTE_CONSOLE, cmd.as_bytes());
        self.uds
            .wait_transaction(res, label, Duration::from_millis(8000))?;
        Ok(())
    }

    /// Populate the remote-command cache with a silent `help` round trip.
    pub fn sync_remote_commands(&mut self) -> Result<()> {
        self.silent.set(true);
        let result = self.send_console_command("help");
        self.silent.set(false);
        result
    }

    // --- Local filesystem ------------------------------------------------

    /// `lls`: list the local working directory.
    pub fn cmd_lls(&mut self, _args: &[&str]) -> Result<()> {
        println!();
        println!("{:<25} | {:>10} | modified", "Name", "Size");
        println!("{}", "-".repeat(60));
        for entry in fs::read_dir(".")?.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            match entry.metadata() {
                Ok(meta) if meta.is_dir() => println!("{name:<25} | {:>10} |", "<DIR>"),
                Ok(meta) => println!("{name:<25} | {:>10} |", meta.len()),
                Err(_) => println!("{name:<25} | {:>10} |", "?"),
            }
        }
        println!();
        Ok(())
    }

    // --- File transfer ---------------------------------------------------

    /// `sy <local>`: upload a local file.
    pub fn cmd_sy(&mut self, args: &[&str]) -> Result<()> {
        let Some(local) = args.first() else {
            println!("Usage: sy <local_file>");
            return Ok(());
        };
        self.upload(local)
    }

    /// `ry <remote>`: download a remote file.
    pub fn cmd_ry(&mut self, args: &[&str]) -> Result<()> {
        let Some(remote) = args.first() else {
            println!("Usage: ry <remote_file>");
            return Ok(());
        };
        self.download(remote)
    }

    /// Block-wise upload: 0x38 AddFile → 0x36 loop → 0x37 with CRC-32.
    pub fn upload(&mut self, local: &str) -> Result<()> {
        let bytes = fs::read(local).with_context(|| format!("read {local}"))?;
        let remote = file_name_of(local)?;
        info!(file = local, size = bytes.len(), "uploading");

        self.uds.transaction("Initializing", |c| {
            c.send_request_file_transfer(
                file_mode::ADD_FILE,
                &remote,
                0x00,
                Some(bytes.len() as u32),
            )
        })?;
        let block_len = parse_max_block_len(self.uds.response())?;
        // One block carries the payload minus SID and sequence byte.
        let chunk = block_len - 2;

        let mut digest = crc_digest();
        let mut sequence = 1u8;
        let mut sent = 0usize;
        for block in bytes.chunks(chunk) {
            digest.update(block);
            self.uds.prepare();
            let res = self.uds.send_transfer_data(sequence, block);
            self.uds
                .wait_transaction(res, None, Duration::from_millis(2000))
                .with_context(|| format!("block {sequence} failed"))?;
            sent += block.len();
            sequence = sequence.wrapping_add(1);
            render_progress(sent, bytes.len(), "Uploading");
        }
        println!();

        let crc = digest.finalize();
        self.uds
            .transaction("Finalizing", |c| c.send_transfer_exit(&crc.to_be_bytes()))?;
        info!(crc = format_args!("0x{crc:08X}"), "upload complete");
        Ok(())
    }

    /// Block-wise download: 0x38 ReadFile → empty 0x36 requests → 0x37.
    pub fn download(&mut self, remote: &str) -> Result<()> {
        let local = file_name_of(remote)?;
        let mut file = fs::File::create(&local).with_context(|| format!("create {local}"))?;

        if let Err(err) = self.uds.transaction("Initializing", |c| {
            c.send_request_file_transfer(file_mode::READ_FILE, remote, 0x00, None)
        }) {
            let _ = fs::remove_file(&local);
            return Err(err.into());
        }

        let resp = self.uds.response();
        let total = match resp.get(7..11) {
            Some(size) => u32::from_be_bytes([size[0], size[1], size[2], size[3]]) as usize,
            None => 0,
        };
        info!(remote, size = total, "downloading");

        let mut digest = crc_digest();
        let mut sequence = 1u8;
        let mut received = 0usize;
        loop {
            self.uds.prepare();
            let res = self.uds.send_transfer_data(sequence, &[]);
            if let Err(err) =
                self.uds
                    .wait_transaction(res, None, Duration::from_millis(3000))
            {
                println!();
                let _ = fs::remove_file(&local);
                return Err(err).context("transfer aborted");
            }

            let resp = self.uds.response();
            if resp.len() <= 2 {
                // SID + sequence only: end of file.
                break;
            }
            let data = &resp[2..];
            if let Err(err) = file.write_all(data) {
                println!();
                drop(file);
                let _ = fs::remove_file(&local);
                return Err(err).context("local write failed, partial file removed");
            }
            digest.update(data);
            received += data.len();
            render_progress(received, total, "Downloading");
            sequence = sequence.wrapping_add(1);
        }
        println!();

        self.uds
            .transaction("Finalizing", |c| c.send_transfer_exit(&[]))?;
        let local_crc = digest.finalize();
        let resp = self.uds.response();
        if let Some(crc) = resp.get(1..5) {
            let remote_crc = u32::from_be_bytes([crc[0], crc[1], crc[2], crc[3]]);
            if remote_crc != local_crc {
                let _ = fs::remove_file(&local);
                bail!(
                    "CRC mismatch: remote 0x{remote_crc:08X}, local 0x{local_crc:08X}; partial file removed"
                );
            }
        }
        info!(crc = format_args!("0x{local_crc:08X}"), "download complete");
        Ok(())
    }
}

// --- Helpers -------------------------------------------------------------

fn parse_hex_bytes(args: &[&str]) -> Result<Vec<u8>> {
    args.iter()
        .map(|raw| u8::from_str_radix(raw, 16).with_context(|| format!("invalid hex byte '{raw}'")))
        .collect()
}

fn file_name_of(path: &str) -> Result<String> {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("'{path}' has no file name"))
}

fn parse_max_block_len(resp: &[u8]) -> Result<usize> {
    if resp.len() < 5 || resp[0] != 0x78 {
        bail!("unexpected RequestFileTransfer response");
    }
    let announced = u16::from_be_bytes([resp[3], resp[4]]) as usize;
    // Guard against degenerate announcements.
    Ok(if announced < 3 { 4095 } else { announced })
}

/// Text progress bar that rewrites its line.
pub fn render_progress(current: usize, total: usize, label: &str) {
    if total == 0 {
        print!("\r[{label}] {current} bytes");
    } else {
        const WIDTH: usize = 24;
        let percent = (current * 100 / total).min(100);
        let filled = (current * WIDTH / total).min(WIDTH);
        let mut bar = String::with_capacity(WIDTH);
        for i in 0..WIDTH {
            bar.push(if i < filled {
                '='
            } else if i == filled {
                '>'
            } else {
                ' '
            });
        }
        print!("\r[{label}] [{bar}] {percent:>3}% ({current}/{total})");
    }
    let _ = std::io::stdout().flush();
}

fn print_rdbi_response(payload: &[u8]) {
    if payload.len() < 3 {
        return;
    }
    let did = u16::from_be_bytes([payload[1], payload[2]]);
    let data = &payload[3..];
    print!("\r[param  ] DID 0x{did:04X}: ");
    if data.is_empty() {
        println!("(no data)");
    } else {
        for byte in data {
            print!("{byte:02X} ");
        }
        print!("| ");
        for &byte in data {
            let ch = if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '.'
            };
            print!("{ch}");
        }
        println!();
    }
    let _ = std::io::stdout().flush();
}

fn print_io_response(payload: &[u8]) {
    if payload.len() < 4 {
        return;
    }
    let did = u16::from_be_bytes([payload[1], payload[2]]);
    let param = payload[3];
    print!("\r[io     ] DID 0x{did:04X} param 0x{param:02X} state: ");
    if payload.len() > 4 {
        for byte in &payload[4..] {
            print!("{byte:02X} ");
        }
        println!();
    } else {
        println!("(no state)");
    }
    let _ = std::io::stdout().flush();
}

fn handle_console_response(
    payload: &[u8],
    caches: &Arc<Mutex<RemoteCaches>>,
    silent: &Rc<Cell<bool>>,
    last_cmd: &Rc<RefCell<String>>,
) {
    if payload.len() <= 4 {
        return;
    }
    let rid = u16::from_be_bytes([payload[2], payload[3]]);
    if rid != RID_REMOTE_CONSOLE {
        return;
    }
    let text = &payload[4..];

    if !silent.get() {
        let mut out = std::io::stdout().lock();
        for &byte in text {
            // Raw-mode terminals need explicit carriage returns.
            if byte == b'\n' {
                let _ = out.write_all(b"\r\n");
            } else {
                let _ = out.write_all(&[byte]);
            }
        }
        let _ = out.flush();
    }

    let cmd = last_cmd.borrow().clone();
    let text = String::from_utf8_lossy(text);
    if cmd.starts_with("help") {
        let commands = parse_help_output(&text);
        caches.lock().unwrap().commands = commands;
    } else if cmd.starts_with("ls") {
        let (files, path) = parse_ls_output(&text);
        let mut caches = caches.lock().unwrap();
        caches.files = files;
        if let Some(path) = path {
            caches.path = path;
        }
    }
}

/// Extract command names (first word per line) from `help` output.
fn parse_help_output(text: &str) -> Vec<String> {
    let mut commands = Vec::new();
    for line in text.lines() {
        let line = line.trim_start();
        // Skip the echoed command and shell banners.
        if line.is_empty() || line.starts_with('>') || line.starts_with("msh") {
            continue;
        }
        if let Some(word) = line.split_whitespace().next()
            && !commands.iter().any(|c| c == word)
        {
            commands.push(word.to_string());
        }
    }
    commands
}

/// Extract file names and the current directory from `ls` output.
fn parse_ls_output(text: &str) -> (Vec<String>, Option<String>) {
    let mut files = Vec::new();
    let mut path = None;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('>') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("Directory ") {
            let dir = rest.trim_end().trim_end_matches(':');
            if dir.starts_with('/') {
                path = Some(dir.to_string());
            }
            continue;
        }
        let Some(name) = line.split_whitespace().next() else {
            continue;
        };
        let entry = if line.contains("<DIR>") {
            format!("{name}/")
        } else {
            name.to_string()
        };
        if !files.contains(&entry) {
            files.push(entry);
        }
    }
    (files, path)
}

/// Resolve a `cd` argument against the current remote path.
fn resolve_remote_path(base: &str, target: &str) -> String {
    if target.starts_with('/') {
        target.to_string()
    } else if target == ".." {
        match base.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(at) => base[..at].to_string(),
        }
    } else {
        let mut path = base.trim_end_matches('/').to_string();
        path.push('/');
        path.push_str(target);
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn help_output_parses_into_command_names() {
        let text = "> help\nls            list files\ncd            change dir\nfree          memory\n";
        assert_eq!(parse_help_output(text), vec!["ls", "cd", "free"]);
    }

    #[test]
    fn ls_output_parses_names_and_path() {
        let text = "> ls\nDirectory /logs:\nboot.bin                 1024\narchive                  <DIR>\n";
        let (files, path) = parse_ls_output(text);
        assert_eq!(files, vec!["boot.bin", "archive/"]);
        assert_eq!(path.as_deref(), Some("/logs"));
    }

    #[test]
    fn remote_paths_resolve_like_a_shell() {
        assert_eq!(resolve_remote_path("/", "logs"), "/logs");
        assert_eq!(resolve_remote_path("/logs", ".."), "/");
        assert_eq!(resolve_remote_path("/a/b", ".."), "/a");
        assert_eq!(resolve_remote_path("/a", "/etc"), "/etc");
    }

    #[test]
    fn degenerate_block_length_falls_back() {
        assert_eq!(
            parse_max_block_len(&[0x78, 0x01, 0x02, 0x00, 0x01, 0x00]).unwrap(),
            4095
        );
        assert_eq!(
            parse_max_block_len(&[0x78, 0x01, 0x02, 0x04, 0x00, 0x00]).unwrap(),
            1024
        );
        assert!(parse_max_block_len(&[0x7F, 0x38, 0x13]).is_err());
    }
}
