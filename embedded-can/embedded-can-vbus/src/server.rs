use crate::frame::{MAX_DLC, VbusFrame};
use crate::wire::{
    ACK_LEN, ACK_OK, ACK_SERVER_ERR, FRAME_HDR_LEN, MSG_FILTERS_ACK, MSG_FRAME, MSG_HELLO,
    MSG_SEND_FRAME, MSG_SET_FILTERS, decode_filters, decode_frame, encode_ack_into,
    encode_frame_into, read_msg_into, write_msg,
};
use embedded_can::Frame as _;
use embedded_can_interface::IdMaskFilter;
use std::collections::HashMap;
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::warn;

/// A Unix-domain CAN bus server hosting a shared simulated bus.
pub struct BusServer {
    path: PathBuf,
    cmd_tx: Sender<BusCommand>,
    shutdown_tx: Sender<()>,
    accept_thread: Option<thread::JoinHandle<()>>,
    bus_thread: Option<thread::JoinHandle<()>>,
}

impl BusServer {
    /// Start a new bus server bound to the provided socket path.
    pub fn start(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;

        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel();

        let bus_thread = thread::spawn(move || bus_loop(cmd_rx));
        let accept_cmd = cmd_tx.clone();
        let accept_thread = thread::spawn(move || accept_loop(listener, accept_cmd, shutdown_rx));

        Ok(Self {
            path,
            cmd_tx,
            shutdown_tx,
            accept_thread: Some(accept_thread),
            bus_thread: Some(bus_thread),
        })
    }

    /// Shut down the server and remove the socket path.
    pub fn shutdown(&mut self) -> io::Result<()> {
        let _ = self.shutdown_tx.send(());
        let _ = self.cmd_tx.send(BusCommand::Shutdown);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.bus_thread.take() {
            let _ = handle.join();
        }
        let _ = std::fs::remove_file(&self.path);
        Ok(())
    }
}

impl Drop for BusServer {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

type ClientId = u64;

enum BusCommand {
    AddClient { id: ClientId, tx: Sender<ServerMsg> },
    RemoveClient { id: ClientId },
    Frame { id: ClientId, frame: VbusFrame },
    SetFilters { id: ClientId, seq: u64, filters: Option<Vec<IdMaskFilter>> },
    Shutdown,
}

enum ServerMsg {
    Frame(VbusFrame),
    Hello,
    FiltersAck { seq: u64, status: u8 },
}

struct ClientState {
    tx: Sender<ServerMsg>,
    filters: Vec<IdMaskFilter>,
}

fn accept_loop(listener: UnixListener, cmd_tx: Sender<BusCommand>, shutdown_rx: Receiver<()>) {
    let next_id = Arc::new(AtomicU64::new(1));
    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }
        match listener.accept() {
            Ok((stream, _addr)) => {
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = handle_client(stream, id, &cmd_tx) {
                    warn!(error = %err, "vbus: client setup failed");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(5));
            }
            Err(err) => {
                warn!(error = %err, "vbus: listener error");
                break;
            }
        }
    }
}

fn handle_client(stream: UnixStream, id: ClientId, cmd_tx: &Sender<BusCommand>) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    let read_stream = stream.try_clone()?;
    let (client_tx, client_rx) = mpsc::channel();
    cmd_tx.send(BusCommand::AddClient { id, tx: client_tx }).ok();

    let cmd_tx_reader = cmd_tx.clone();
    thread::spawn(move || client_reader_loop(read_stream, id, cmd_tx_reader));

    let cmd_tx_writer = cmd_tx.clone();
    thread::spawn(move || client_writer_loop(stream, id, client_rx, cmd_tx_writer));

    Ok(())
}

fn client_reader_loop(mut stream: UnixStream, id: ClientId, cmd_tx: Sender<BusCommand>) {
    let mut payload = Vec::new();
    loop {
        let msg_type = match read_msg_into(&mut stream, &mut payload) {
            Ok(msg_type) => msg_type,
            Err(_) => {
                let _ = cmd_tx.send(BusCommand::RemoveClient { id });
                break;
            }
        };

        match msg_type {
            MSG_SEND_FRAME => match decode_frame(&payload) {
                Ok(frame) => {
                    let _ = cmd_tx.send(BusCommand::Frame { id, frame });
                }
                Err(_) => {
                    let _ = cmd_tx.send(BusCommand::RemoveClient { id });
                    break;
                }
            },
            MSG_SET_FILTERS => {
                let cmd = match decode_filters(&payload) {
                    Ok((seq, filters)) => BusCommand::SetFilters {
                        id,
                        seq,
                        filters: Some(filters),
                    },
                    Err(_) => BusCommand::SetFilters {
                        id,
                        seq: 0,
                        filters: None,
                    },
                };
                let _ = cmd_tx.send(cmd);
            }
            _ => {}
        }
    }
}

fn client_writer_loop(
    mut stream: UnixStream,
    id: ClientId,
    rx: Receiver<ServerMsg>,
    cmd_tx: Sender<BusCommand>,
) {
    let mut frame_buf = [0u8; FRAME_HDR_LEN + MAX_DLC];
    let mut ack_buf = [0u8; ACK_LEN];
    while let Ok(msg) = rx.recv() {
        let result = match msg {
            ServerMsg::Frame(frame) => {
                let len = encode_frame_into(&mut frame_buf, &frame);
                write_msg(&mut stream, MSG_FRAME, &frame_buf[..len])
            }
            ServerMsg::Hello => write_msg(&mut stream, MSG_HELLO, &[]),
            ServerMsg::FiltersAck { seq, status } => {
                encode_ack_into(&mut ack_buf, seq, status);
                write_msg(&mut stream, MSG_FILTERS_ACK, &ack_buf)
            }
        };
        if result.is_err() {
            let _ = cmd_tx.send(BusCommand::RemoveClient { id });
            break;
        }
    }
}

fn bus_loop(cmd_rx: Receiver<BusCommand>) {
    let mut clients: HashMap<ClientId, ClientState> = HashMap::new();

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            BusCommand::AddClient { id, tx } => {
                let _ = tx.send(ServerMsg::Hello);
                clients.insert(
                    id,
                    ClientState {
                        tx,
                        filters: Vec::new(),
                    },
                );
            }
            BusCommand::RemoveClient { id } => {
                clients.remove(&id);
            }
            BusCommand::Frame { id, frame } => {
                broadcast_frame(&clients, id, &frame);
            }
            BusCommand::SetFilters { id, seq, filters } => {
                if let Some(client) = clients.get_mut(&id) {
                    let status = match filters {
                        Some(filters) => {
                            client.filters = filters;
                            ACK_OK
                        }
                        None => ACK_SERVER_ERR,
                    };
                    let _ = client.tx.send(ServerMsg::FiltersAck { seq, status });
                }
            }
            BusCommand::Shutdown => break,
        }
    }
}

/// Deliver to every client except the sender; an empty filter set accepts all.
fn broadcast_frame(clients: &HashMap<ClientId, ClientState>, from: ClientId, frame: &VbusFrame) {
    for (id, client) in clients {
        if *id == from {
            continue;
        }
        if client.filters.is_empty() || client.filters.iter().any(|f| f.matches(frame.id())) {
            let _ = client.tx.send(ServerMsg::Frame(*frame));
        }
    }
}
