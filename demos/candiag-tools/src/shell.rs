//! The interactive shell: command registry, line editor and the cooperative
//! protocol loop.
//!
//! The rustyline editor runs on its own thread and owns the terminal; it
//! talks to the protocol loop exclusively through channels (lines in, resume
//! signals out). The protocol loop ticks every 20 ms, servicing input,
//! `UdsClient::poll` and the heartbeat; the protocol engine itself never
//! leaves the main thread.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use rustyline::Editor;
use rustyline::completion::Completer;
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::FileHistory;
use rustyline::validate::Validator;
use rustyline::{Context, Helper};

use crate::tester::{RemoteCaches, Tester};

/// Command history file in the working directory.
pub const HISTORY_FILE: &str = ".uds_history";

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Why the shell loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellExit {
    /// User typed `exit` or closed stdin.
    User,
    /// The heartbeat monitor declared the link dead.
    Timeout,
}

/// One local shell command.
pub struct Command {
    /// Keyword typed by the user.
    pub name: &'static str,
    /// Argument hint shown while typing.
    pub hint: &'static str,
    /// One-line description for `help`.
    pub help: &'static str,
    /// Implementation.
    pub handler: fn(&mut Tester, &[&str]) -> Result<()>,
}

/// The local command registry (distinct from the protocol response
/// registry). `help` and `exit` are loop built-ins.
pub fn command_table() -> &'static [Command] {
    &[
        Command {
            name: "session",
            hint: " <hex_type>",
            help: "Diagnostic session control (0x10)",
            handler: Tester::cmd_session,
        },
        Command {
            name: "auth",
            hint: " <level>",
            help: "Security access (0x27) - unlock ECU",
            handler: Tester::cmd_auth,
        },
        Command {
            name: "er",
            hint: " <type>",
            help: "ECU reset (0x11)",
            handler: Tester::cmd_er,
        },
        Command {
            name: "rdbi",
            hint: " <did>",
            help: "Read data by identifier (0x22)",
            handler: Tester::cmd_rdbi,
        },
        Command {
            name: "wdbi",
            hint: " <did> <data...>",
            help: "Write data by identifier (0x2E)",
            handler: Tester::cmd_wdbi,
        },
        Command {
            name: "io",
            hint: " <did> <pm> [data]",
            help: "IO control (0x2F)",
            handler: Tester::cmd_io,
        },
        Command {
            name: "cc",
            hint: " <ctrl> [cm] [id]",
            help: "Communication control (0x28)",
            handler: Tester::cmd_cc,
        },
        Command {
            name: "rexec",
            hint: " <cmd>",
            help: "Explicit remote exec (0x31)",
            handler: Tester::cmd_rexec,
        },
        Command {
            name: "cd",
            hint: " <path>",
            help: "Change remote directory",
            handler: Tester::cmd_cd,
        },
        Command {
            name: "lls",
            hint: "",
            help: "List local files",
            handler: Tester::cmd_lls,
        },
        Command {
            name: "sy",
            hint: " <local_file>",
            help: "Upload file (0x38/0x36/0x37)",
            handler: Tester::cmd_sy,
        },
        Command {
            name: "ry",
            hint: " <remote_file>",
            help: "Download file (0x38/0x36/0x37)",
            handler: Tester::cmd_ry,
        },
    ]
}

fn print_local_help() {
    println!();
    println!("[Local Commands]");
    for cmd in command_table() {
        println!("  {:<10} {:<20} - {}", cmd.name, cmd.hint, cmd.help);
    }
    println!("  {:<10} {:<20} - {}", "help", "", "Show local & remote help");
    println!("  {:<10} {:<20} - {}", "exit", "", "Leave the shell");
    println!();
}

enum InputEvent {
    Line(String),
    Eof,
}

/// Run the interactive shell until the user quits or the link dies.
pub fn run_shell(tester: &mut Tester) -> ShellExit {
    let disconnected = Rc::new(Cell::new(false));
    let flag = disconnected.clone();
    tester.uds.heartbeat_mut().reset();
    tester.uds.heartbeat_mut().set_disconnect_hook(move || {
        flag.set(true);
    });

    let caches = tester.caches();
    let (lines_tx, lines_rx) = channel();
    let (resume_tx, resume_rx) = channel();
    thread::spawn(move || input_loop(caches, lines_tx, resume_rx));

    println!("[shell] interactive mode started, type 'help' or 'exit'");

    loop {
        if disconnected.get() {
            println!("\r\n[fatal] connection lost (heartbeat threshold crossed)");
            return ShellExit::Timeout;
        }

        match lines_rx.recv_timeout(POLL_INTERVAL) {
            Ok(InputEvent::Line(line)) => {
                if execute_line(tester, &line) {
                    return ShellExit::User;
                }
                // User activity counts as liveness for the heartbeat timer.
                tester.uds.heartbeat_mut().rearm(Instant::now());
                if resume_tx.send(()).is_err() {
                    return ShellExit::User;
                }
            }
            Ok(InputEvent::Eof) => {
                println!("\nquit");
                return ShellExit::User;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return ShellExit::User,
        }

        tester.uds.poll();
        tester.uds.service_heartbeat();
    }
}

/// Returns true when the shell should quit.
fn execute_line(tester: &mut Tester, line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return false;
    }
    if line == "exit" {
        return true;
    }

    let mut parts = line.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    if name == "help" {
        print_local_help();
        println!("[Remote Commands]");
        if let Err(err) = tester.send_console_command("help") {
            eprintln!("\r[err] {err:#}");
        }
        return false;
    }

    if let Some(cmd) = command_table().iter().find(|cmd| cmd.name == name) {
        if let Err(err) = (cmd.handler)(tester, &args) {
            eprintln!("\r[err] {err:#}");
        }
    } else if let Err(err) = tester.send_console_command(line) {
        // Unknown keywords go to the remote console verbatim.
        eprintln!("\r[err] {err:#}");
    }
    false
}

struct ShellHelper {
    caches: Arc<Mutex<RemoteCaches>>,
}

impl Completer for ShellHelper {
    type Candidate = String;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<String>)> {
        let head = &line[..pos];
        match head.rfind(' ') {
            // First word: local commands plus cached remote commands.
            None => {
                let mut out: Vec<String> = command_table()
                    .iter()
                    .map(|cmd| cmd.name.to_string())
                    .filter(|name| name.starts_with(head))
                    .collect();
                if let Ok(caches) = self.caches.lock() {
                    out.extend(
                        caches
                            .commands
                            .iter()
                            .filter(|name| name.starts_with(head))
                            .cloned(),
                    );
                }
                Ok((0, out))
            }
            // Arguments: cached remote file names.
            Some(at) => {
                let word = &head[at + 1..];
                let files = match self.caches.lock() {
                    Ok(caches) => caches
                        .files
                        .iter()
                        .filter(|name| name.starts_with(word))
                        .cloned()
                        .collect(),
                    Err(_) => Vec::new(),
                };
                Ok((at + 1, files))
            }
        }
    }
}

impl Hinter for ShellHelper {
    type Hint = String;

    fn hint(&self, line: &str, pos: usize, _ctx: &Context<'_>) -> Option<String> {
        if pos != line.len() {
            return None;
        }
        command_table()
            .iter()
            .find(|cmd| cmd.name == line)
            .map(|cmd| cmd.hint.to_string())
    }
}

impl Highlighter for ShellHelper {}
impl Validator for ShellHelper {}
impl Helper for ShellHelper {}

fn input_loop(
    caches: Arc<Mutex<RemoteCaches>>,
    lines_tx: Sender<InputEvent>,
    resume_rx: Receiver<()>,
) {
    let Ok(mut editor) = Editor::<ShellHelper, FileHistory>::new() else {
        let _ = lines_tx.send(InputEvent::Eof);
        return;
    };
    editor.set_helper(Some(ShellHelper {
        caches: caches.clone(),
    }));
    let _ = editor.load_history(HISTORY_FILE);

    loop {
        let prompt = match caches.lock() {
            Ok(caches) => format!("msh {}> ", caches.path),
            Err(_) => "msh> ".to_string(),
        };
        match editor.readline(&prompt) {
            Ok(line) => {
                if !line.trim().is_empty() {
                    let _ = editor.add_history_entry(line.as_str());
                    let _ = editor.save_history(HISTORY_FILE);
                }
                if lines_tx.send(InputEvent::Line(line)).is_err() {
                    break;
                }
                // Wait until the command finished so output stays ordered.
                if resume_rx.recv().is_err() {
                    break;
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                let _ = lines_tx.send(InputEvent::Eof);
                break;
            }
            Err(_) => {
                let _ = lines_tx.send(InputEvent::Eof);
                break;
            }
        }
    }
}
