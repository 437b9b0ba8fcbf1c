//! Host for the simulated CAN bus.

use std::path::PathBuf;
use std::thread;

use anyhow::Result;
use clap::Parser;
use embedded_can_vbus::BusServer;

#[derive(Parser)]
#[command(author, version, about = "Simulated CAN bus server")]
struct Args {
    /// Socket path to bind.
    #[arg(long, default_value = "/tmp/candiag-vbus.sock")]
    socket: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _server = BusServer::start(&args.socket)?;

    println!("CAN bus simulator listening on {}", args.socket.display());
    println!("press Ctrl+C to stop");
    loop {
        thread::park();
    }
}
