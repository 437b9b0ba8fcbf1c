//! Interactive UDS tester shell over the vbus simulator.

use std::io::Write as _;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use candiag_tools::shell::{ShellExit, run_shell};
use candiag_tools::tester::{Tester, TesterConfig};
use clap::Parser;
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about = "Interactive UDS tester shell")]
struct Args {
    /// Bus interface: socket path of the vbus server.
    #[arg(short, long, default_value = "/tmp/candiag-vbus.sock")]
    iface: PathBuf,

    /// Client source CAN id (hex), requests go out on this id.
    #[arg(short, long, default_value = "7E0", value_parser = parse_hex_id)]
    source: u16,

    /// Server target CAN id (hex), responses come back on this id.
    #[arg(short, long, default_value = "7E8", value_parser = parse_hex_id)]
    target: u16,

    /// Functional broadcast CAN id (hex).
    #[arg(short, long, default_value = "7DF", value_parser = parse_hex_id)]
    functional: u16,
}

fn parse_hex_id(raw: &str) -> Result<u16, String> {
    let value =
        u16::from_str_radix(raw.trim_start_matches("0x"), 16).map_err(|_| "invalid hex id")?;
    if value > 0x7FF {
        return Err("identifier must fit in 11 bits".to_string());
    }
    Ok(value)
}

fn ask_to_reconnect() -> bool {
    print!("\r\nConnection lost or failed. Reconnect? (y/n): ");
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y")
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let cfg = TesterConfig {
        bus: args.iface,
        source: args.source,
        target: args.target,
        functional: args.functional,
    };

    println!("========================================");
    println!("   candiag UDS tester");
    println!("========================================");
    println!(
        "[config] bus: {} | src: 0x{:03X} | tgt: 0x{:03X} | func: 0x{:03X}",
        cfg.bus.display(),
        cfg.source,
        cfg.target,
        cfg.functional
    );

    loop {
        let mut tester = match Tester::connect(&cfg) {
            Ok(tester) => tester,
            Err(err) => {
                eprintln!("[err] {err:#}");
                if ask_to_reconnect() {
                    continue;
                }
                return Ok(());
            }
        };

        // Connection sequence: extended session as a ping, then best-effort
        // unlock and remote command discovery.
        info!(target_id = format_args!("0x{:03X}", cfg.target), "auto-connecting");
        let mut connected = false;
        for attempt in (0..3).rev() {
            if tester.request_session(0x03).is_ok() {
                connected = true;
                break;
            }
            warn!(retries_left = attempt, "connection attempt failed");
            thread::sleep(Duration::from_millis(500));
        }

        if connected {
            if tester.perform_security(0x01).is_ok() {
                info!("security unlocked");
            }
            if let Err(err) = tester.sync_remote_commands() {
                warn!(%err, "remote command sync failed");
            }
        } else {
            warn!("entering offline mode (local commands only)");
        }

        match run_shell(&mut tester) {
            ShellExit::User => break,
            ShellExit::Timeout => {
                // The stale prompt still owns the terminal until the user
                // presses Enter; the reconnect question follows.
                if !ask_to_reconnect() {
                    break;
                }
            }
        }
    }

    info!("exiting");
    Ok(())
}
