use crate::frame::{MAX_DLC, VbusFrame};
use crate::wire::{
    ACK_OK, FRAME_HDR_LEN, MSG_FILTERS_ACK, MSG_FRAME, MSG_HELLO, MSG_SEND_FRAME, MSG_SET_FILTERS,
    decode_ack, decode_frame, encode_filters, encode_frame_into,
};
use embedded_can::ErrorKind;
use embedded_can_interface::{FilterConfig, IdMaskFilter, RxFrameIo, TxFrameIo};
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};

/// Errors produced by the simulated-bus client.
#[derive(Debug)]
pub enum VbusError {
    /// I/O error from the underlying Unix socket.
    Io(io::Error),
    /// Malformed or unexpected protocol message.
    Protocol(&'static str),
    /// Operation timed out.
    Timeout,
    /// Operation would block in nonblocking mode.
    WouldBlock,
    /// Server disconnected.
    Disconnected,
}

impl fmt::Display for VbusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VbusError::Io(err) => write!(f, "io error: {err}"),
            VbusError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            VbusError::Timeout => write!(f, "timeout"),
            VbusError::WouldBlock => write!(f, "would block"),
            VbusError::Disconnected => write!(f, "disconnected"),
        }
    }
}

impl std::error::Error for VbusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VbusError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl embedded_can::Error for VbusError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

impl From<io::Error> for VbusError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => VbusError::WouldBlock,
            io::ErrorKind::TimedOut => VbusError::Timeout,
            _ => VbusError::Io(err),
        }
    }
}

/// Client-side CAN interface connected to a [`crate::BusServer`].
pub struct VbusCan {
    stream: UnixStream,
    rx_queue: VecDeque<VbusFrame>,
    rx_bytes: Vec<u8>,
    rx_off: usize,
    next_seq: u64,
    filters: Vec<IdMaskFilter>,
}

enum DecodedMsg {
    Frame(VbusFrame),
    FiltersAck { seq: u64, status: u8 },
    Hello,
    Unknown,
}

impl VbusCan {
    /// Connect to a running bus server at the provided socket path.
    pub fn connect(path: impl AsRef<Path>) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        stream.set_nonblocking(true)?;
        let mut iface = Self {
            stream,
            rx_queue: VecDeque::new(),
            rx_bytes: Vec::new(),
            rx_off: 0,
            next_seq: 1,
            filters: Vec::new(),
        };
        iface.wait_for_hello().map_err(|err| match err {
            VbusError::Io(err) => err,
            other => io::Error::other(format!("handshake failed: {other}")),
        })?;
        Ok(iface)
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    fn remaining_ms(deadline: Option<Instant>) -> Result<i32, VbusError> {
        match deadline {
            None => Ok(-1),
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return Err(VbusError::Timeout);
                }
                let ms = d.duration_since(now).as_millis();
                Ok(ms.min(i32::MAX as u128) as i32)
            }
        }
    }

    fn wait_for(&self, events: i16, deadline: Option<Instant>) -> Result<(), VbusError> {
        let mut fds = libc::pollfd {
            fd: self.stream.as_raw_fd(),
            events,
            revents: 0,
        };
        loop {
            let timeout_ms = Self::remaining_ms(deadline)?;
            let res = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
            if res > 0 {
                return Ok(());
            }
            if res == 0 {
                return Err(VbusError::Timeout);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(VbusError::Io(err));
            }
        }
    }

    fn read_more_once(&mut self) -> Result<bool, VbusError> {
        let mut buf = [0u8; 4096];
        match self.stream.read(&mut buf) {
            Ok(0) => Err(VbusError::Disconnected),
            Ok(n) => {
                self.rx_bytes.extend_from_slice(&buf[..n]);
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(VbusError::from(err)),
        }
    }

    fn next_decoded_msg(&mut self) -> Result<Option<DecodedMsg>, VbusError> {
        let avail = self.rx_bytes.len().saturating_sub(self.rx_off);
        if avail < 5 {
            return Ok(None);
        }
        let base = self.rx_off;
        let msg_type = self.rx_bytes[base];
        let len = u32::from_le_bytes(self.rx_bytes[base + 1..base + 5].try_into().unwrap()) as usize;
        if len > crate::wire::MAX_PAYLOAD_LEN {
            return Err(VbusError::Protocol("payload exceeds limit"));
        }
        let total = 5 + len;
        if avail < total {
            return Ok(None);
        }

        let payload = &self.rx_bytes[base + 5..base + total];
        let msg = match msg_type {
            MSG_FRAME => DecodedMsg::Frame(decode_frame(payload).map_err(VbusError::Protocol)?),
            MSG_FILTERS_ACK => {
                let (seq, status) = decode_ack(payload).map_err(VbusError::Protocol)?;
                DecodedMsg::FiltersAck { seq, status }
            }
            MSG_HELLO => DecodedMsg::Hello,
            _ => DecodedMsg::Unknown,
        };

        self.rx_off += total;
        if self.rx_off >= 4096 && self.rx_off >= self.rx_bytes.len() / 2 {
            self.rx_bytes.drain(..self.rx_off);
            self.rx_off = 0;
        }
        Ok(Some(msg))
    }

    fn recv_decoded_msg_blocking(
        &mut self,
        deadline: Option<Instant>,
    ) -> Result<DecodedMsg, VbusError> {
        loop {
            if let Some(msg) = self.next_decoded_msg()? {
                return Ok(msg);
            }
            if !self.read_more_once()? {
                self.wait_for(libc::POLLIN, deadline)?;
            }
        }
    }

    fn write_all_deadline(
        &mut self,
        mut bytes: &[u8],
        deadline: Option<Instant>,
    ) -> Result<(), VbusError> {
        while !bytes.is_empty() {
            match self.stream.write(bytes) {
                Ok(0) => return Err(VbusError::Disconnected),
                Ok(n) => bytes = &bytes[n..],
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_for(libc::POLLOUT, deadline)?
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(VbusError::from(err)),
            }
        }
        Ok(())
    }

    fn write_frame(&mut self, frame: &VbusFrame, deadline: Option<Instant>) -> Result<(), VbusError> {
        let mut buf = [0u8; 5 + FRAME_HDR_LEN + MAX_DLC];
        let mut body = [0u8; FRAME_HDR_LEN + MAX_DLC];
        let body_len = encode_frame_into(&mut body, frame);
        buf[0] = MSG_SEND_FRAME;
        buf[1..5].copy_from_slice(&(body_len as u32).to_le_bytes());
        buf[5..5 + body_len].copy_from_slice(&body[..body_len]);
        let total = 5 + body_len;
        let msg = buf;
        self.write_all_deadline(&msg[..total], deadline)
    }

    fn wait_for_hello(&mut self) -> Result<(), VbusError> {
        loop {
            match self.recv_decoded_msg_blocking(None)? {
                DecodedMsg::Hello => return Ok(()),
                DecodedMsg::Frame(frame) => self.rx_queue.push_back(frame),
                DecodedMsg::FiltersAck { .. } | DecodedMsg::Unknown => {}
            }
        }
    }

    fn wait_for_filters_ack(&mut self, seq: u64) -> Result<(), VbusError> {
        loop {
            match self.recv_decoded_msg_blocking(None)? {
                DecodedMsg::FiltersAck { seq: got, status } if got == seq => {
                    return if status == ACK_OK {
                        Ok(())
                    } else {
                        Err(VbusError::Protocol("filter update rejected"))
                    };
                }
                DecodedMsg::Frame(frame) => self.rx_queue.push_back(frame),
                DecodedMsg::Hello | DecodedMsg::FiltersAck { .. } | DecodedMsg::Unknown => {}
            }
        }
    }
}

impl TxFrameIo for VbusCan {
    type Frame = VbusFrame;
    type Error = VbusError;

    fn send(&mut self, frame: &Self::Frame) -> Result<(), Self::Error> {
        self.write_frame(frame, None)
    }

    fn try_send(&mut self, frame: &Self::Frame) -> Result<(), Self::Error> {
        // Small frames rarely block on a local socket; block briefly rather
        // than surface WouldBlock to layers that do not retry.
        self.write_frame(frame, None)
    }

    fn send_timeout(&mut self, frame: &Self::Frame, timeout: Duration) -> Result<(), Self::Error> {
        self.write_frame(frame, Some(Instant::now() + timeout))
    }
}

impl RxFrameIo for VbusCan {
    type Frame = VbusFrame;
    type Error = VbusError;

    fn recv(&mut self) -> Result<Self::Frame, Self::Error> {
        if let Some(frame) = self.rx_queue.pop_front() {
            return Ok(frame);
        }
        loop {
            match self.recv_decoded_msg_blocking(None)? {
                DecodedMsg::Frame(frame) => return Ok(frame),
                _ => continue,
            }
        }
    }

    fn try_recv(&mut self) -> Result<Self::Frame, Self::Error> {
        if let Some(frame) = self.rx_queue.pop_front() {
            return Ok(frame);
        }
        let _ = self.read_more_once()?;
        while let Some(msg) = self.next_decoded_msg()? {
            if let DecodedMsg::Frame(frame) = msg {
                return Ok(frame);
            }
        }
        Err(VbusError::WouldBlock)
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Self::Frame, Self::Error> {
        if let Some(frame) = self.rx_queue.pop_front() {
            return Ok(frame);
        }
        let deadline = Some(Instant::now() + timeout);
        loop {
            match self.recv_decoded_msg_blocking(deadline)? {
                DecodedMsg::Frame(frame) => return Ok(frame),
                _ => continue,
            }
        }
    }
}

impl FilterConfig for VbusCan {
    type Error = VbusError;

    fn set_filters(&mut self, filters: &[IdMaskFilter]) -> Result<(), Self::Error> {
        self.filters.clear();
        self.filters.extend_from_slice(filters);
        let seq = self.next_seq();
        let payload = encode_filters(seq, &self.filters);
        write_msg_nonblocking(self, MSG_SET_FILTERS, &payload)?;
        self.wait_for_filters_ack(seq)
    }
}

fn write_msg_nonblocking(can: &mut VbusCan, msg_type: u8, payload: &[u8]) -> Result<(), VbusError> {
    let mut header = [0u8; 5];
    header[0] = msg_type;
    header[1..5].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    can.write_all_deadline(&header, None)?;
    can.write_all_deadline(payload, None)
}
