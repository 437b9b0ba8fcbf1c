//! Demo ECU over the vbus simulator.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use candiag_tools::ecu::{EcuOptions, EcuRuntime};
use clap::Parser;

#[derive(Parser)]
#[command(author, version, about = "Demo UDS ECU")]
struct Args {
    /// Bus interface: socket path of the vbus server.
    #[arg(short, long, default_value = "/tmp/candiag-vbus.sock")]
    iface: PathBuf,

    /// Request CAN id (hex), the ECU listens on this id.
    #[arg(short, long, default_value = "7E0", value_parser = parse_hex_id)]
    source: u16,

    /// Response CAN id (hex), the ECU answers on this id.
    #[arg(short, long, default_value = "7E8", value_parser = parse_hex_id)]
    target: u16,

    /// Functional broadcast CAN id (hex).
    #[arg(short, long, default_value = "7DF", value_parser = parse_hex_id)]
    functional: u16,

    /// Root directory served by the file-transfer and console services.
    #[arg(long, default_value = "./ecu-root")]
    root: PathBuf,
}

fn parse_hex_id(raw: &str) -> Result<u16, String> {
    let value =
        u16::from_str_radix(raw.trim_start_matches("0x"), 16).map_err(|_| "invalid hex id")?;
    if value > 0x7FF {
        return Err("identifier must fit in 11 bits".to_string());
    }
    Ok(value)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut opts = EcuOptions::new(args.iface, args.root);
    opts.request_id = args.source;
    opts.response_id = args.target;
    opts.functional_id = args.functional;

    let _runtime = EcuRuntime::spawn(opts)?;
    println!("demo ECU running, press Ctrl+C to stop");
    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
