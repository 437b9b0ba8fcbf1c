//! Services 0x38 / 0x36 / 0x37: block-wise file transfer.
//!
//! One transfer session at a time. A running CRC-32 covers exactly the
//! payload bytes written to (upload) or read from (download) the file; on
//! upload exit the client's expected CRC is verified and a mismatch removes
//! the partial file.

use std::cell::RefCell;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;

use crc::{CRC_32_ISO_HDLC, Crc, Digest};
use tracing::{debug, info, warn};

use crate::UdsServer;
use crate::file_mode;
use crate::nrc::Nrc;
use crate::server::dispatch::{Args, Event, Outcome, ServiceNode, priority};

/// CRC-32 (poly 0xEDB88320 reflected, pre/post inverted; empty input ⇒ 0).
pub static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Start a running CRC digest.
pub fn crc_digest() -> Digest<'static, u32> {
    CRC32.digest()
}

/// Longest accepted file path in a 0x38 request.
pub const MAX_PATH_LEN: usize = 255;
/// Default server-side chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileMode {
    Idle,
    /// Upload in progress (client → server).
    Writing,
    /// Download in progress (server → client).
    Reading,
}

struct FileSession {
    file: Option<File>,
    mode: FileMode,
    total_size: u64,
    current_pos: u64,
    current_path: PathBuf,
    digest: Option<Digest<'static, u32>>,
}

impl FileSession {
    fn new() -> Self {
        Self {
            file: None,
            mode: FileMode::Idle,
            total_size: 0,
            current_pos: 0,
            current_path: PathBuf::new(),
            digest: None,
        }
    }

    fn close(&mut self) {
        self.file = None;
        self.mode = FileMode::Idle;
        self.digest = None;
    }
}

/// The file-transfer service, rooted in a server-side directory.
pub struct FileService {
    root: PathBuf,
    chunk_size: usize,
    session: Rc<RefCell<FileSession>>,
}

impl FileService {
    /// Service serving files under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            session: Rc::new(RefCell::new(FileSession::new())),
        }
    }

    /// Override the server-side chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    fn resolve(root: &Path, raw: &[u8]) -> Result<PathBuf, Nrc> {
        if raw.is_empty() || raw.len() > MAX_PATH_LEN {
            return Err(Nrc::RequestOutOfRange);
        }
        let text = std::str::from_utf8(raw).map_err(|_| Nrc::RequestOutOfRange)?;
        let relative = Path::new(text.trim_start_matches('/'));
        // Confine transfers to the configured root.
        if relative
            .components()
            .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(Nrc::RequestOutOfRange);
        }
        Ok(root.join(relative))
    }

    /// Register the request, data, exit and timeout nodes.
    pub fn mount(self, server: &mut UdsServer) {
        let root = self.root.clone();
        let chunk_size = self.chunk_size;
        let session = self.session.clone();
        server.register(ServiceNode::new(
            "file_req",
            Event::RequestFileTransfer,
            priority::NORMAL,
            move |_, args| {
                let Args::RequestFileTransfer(args) = args else {
                    return Outcome::NotMine;
                };
                let mut st = session.borrow_mut();

                // A new request tears down whatever was active.
                if st.file.is_some() {
                    warn!("discarding stale file session");
                    st.close();
                }

                let path = match Self::resolve(&root, args.path) {
                    Ok(path) => path,
                    Err(nrc) => return Outcome::Deny(nrc),
                };

                // Negotiated block length: protocol ceiling vs local chunk.
                args.max_block_len = args.max_block_len.min(chunk_size as u16);
                st.digest = Some(crc_digest());

                match args.mode {
                    file_mode::ADD_FILE | file_mode::REPLACE_FILE => {
                        let file = match File::create(&path) {
                            Ok(file) => file,
                            Err(err) => {
                                warn!(path = %path.display(), %err, "create failed");
                                return Outcome::Deny(Nrc::ConditionsNotCorrect);
                            }
                        };
                        info!(path = %path.display(), size = args.file_size, "upload started");
                        st.file = Some(file);
                        st.total_size = args.file_size as u64;
                        st.current_pos = 0;
                        st.current_path = path;
                        st.mode = FileMode::Writing;
                        Outcome::Handled
                    }
                    file_mode::READ_FILE => {
                        let file = match File::open(&path) {
                            Ok(file) => file,
                            Err(_) => return Outcome::Deny(Nrc::RequestOutOfRange),
                        };
                        let size = match file.metadata() {
                            Ok(meta) => meta.len(),
                            Err(err) => {
                                warn!(path = %path.display(), %err, "stat failed");
                                st.close();
                                return Outcome::Deny(Nrc::ConditionsNotCorrect);
                            }
                        };
                        info!(path = %path.display(), size, "download started");
                        st.file = Some(file);
                        st.total_size = size;
                        st.current_pos = 0;
                        st.current_path = path;
                        st.mode = FileMode::Reading;
                        args.read_size = Some(size.min(u32::MAX as u64) as u32);
                        Outcome::Handled
                    }
                    _ => Outcome::Deny(Nrc::SubFunctionNotSupported),
                }
            },
        ));

        let session = self.session.clone();
        let chunk = self.chunk_size;
        server.register(ServiceNode::new(
            "file_data",
            Event::TransferData,
            priority::NORMAL,
            move |_, args| {
                let Args::TransferData(args) = args else {
                    return Outcome::NotMine;
                };
                let mut st = session.borrow_mut();
                match st.mode {
                    FileMode::Writing => {
                        let Some(file) = st.file.as_mut() else {
                            return Outcome::Deny(Nrc::ConditionsNotCorrect);
                        };
                        if let Err(err) = file.write_all(args.data) {
                            warn!(%err, "write failed");
                            return Outcome::Deny(Nrc::GeneralProgrammingFailure);
                        }
                        st.current_pos += args.data.len() as u64;
                        if let Some(digest) = st.digest.as_mut() {
                            digest.update(args.data);
                        }
                        debug!(seq = args.sequence, pos = st.current_pos, "block written");
                        Outcome::Handled
                    }
                    FileMode::Reading => {
                        let want = chunk.min(args.max_resp_len as usize);
                        let mut buf = vec![0u8; want];
                        let Some(file) = st.file.as_mut() else {
                            return Outcome::Deny(Nrc::ConditionsNotCorrect);
                        };
                        let got = match file.read(&mut buf) {
                            Ok(got) => got,
                            Err(err) => {
                                warn!(%err, "read failed");
                                return Outcome::Deny(Nrc::GeneralProgrammingFailure);
                            }
                        };
                        if got > 0 {
                            st.current_pos += got as u64;
                            if let Some(digest) = st.digest.as_mut() {
                                digest.update(&buf[..got]);
                            }
                            args.response.extend_from_slice(&buf[..got]);
                        }
                        // An empty response body signals EOF to the client.
                        debug!(seq = args.sequence, got, "block read");
                        Outcome::Handled
                    }
                    FileMode::Idle => Outcome::Deny(Nrc::ConditionsNotCorrect),
                }
            },
        ));

        let session = self.session.clone();
        server.register(ServiceNode::new(
            "file_exit",
            Event::RequestTransferExit,
            priority::NORMAL,
            move |_, args| {
                let Args::RequestTransferExit(args) = args else {
                    return Outcome::NotMine;
                };
                let mut st = session.borrow_mut();
                if st.file.is_none() {
                    return Outcome::Deny(Nrc::RequestSequenceError);
                }

                match st.mode {
                    FileMode::Writing => {
                        if args.data.len() >= 4 {
                            let expected =
                                u32::from_be_bytes([args.data[0], args.data[1], args.data[2], args.data[3]]);
                            let actual = st.digest.take().map(|d| d.finalize()).unwrap_or(0);
                            if expected != actual {
                                warn!(
                                    expected = format_args!("0x{expected:08X}"),
                                    actual = format_args!("0x{actual:08X}"),
                                    "upload CRC mismatch, removing partial file"
                                );
                                let path = st.current_path.clone();
                                st.close();
                                let _ = fs::remove_file(path);
                                return Outcome::Deny(Nrc::GeneralProgrammingFailure);
                            }
                        }
                        info!(path = %st.current_path.display(), bytes = st.current_pos, "upload complete");
                        st.close();
                        Outcome::Handled
                    }
                    FileMode::Reading => {
                        let crc = st.digest.take().map(|d| d.finalize()).unwrap_or(0);
                        args.response.extend_from_slice(&crc.to_be_bytes());
                        info!(path = %st.current_path.display(), bytes = st.current_pos, "download complete");
                        st.close();
                        Outcome::Handled
                    }
                    FileMode::Idle => Outcome::Deny(Nrc::RequestSequenceError),
                }
            },
        ));

        let session = self.session;
        server.register(ServiceNode::new(
            "file_timeout",
            Event::SessionTimeout,
            priority::HIGHEST,
            move |_, args| {
                let Args::SessionTimeout = args else {
                    return Outcome::NotMine;
                };
                let mut st = session.borrow_mut();
                if st.file.is_some() {
                    warn!(path = %st.current_path.display(), "session timeout, closing file");
                    st.close();
                }
                Outcome::Continue
            },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn file_server(root: &Path) -> UdsServer {
        let mut server = UdsServer::new();
        FileService::new(root).with_chunk_size(64).mount(&mut server);
        server
    }

    fn rft_request(mode: u8, name: &str, size: Option<u32>) -> Vec<u8> {
        let mut req = vec![0x38, mode];
        req.extend_from_slice(&(name.len() as u16).to_be_bytes());
        req.extend_from_slice(name.as_bytes());
        req.push(0x00);
        if let Some(size) = size {
            req.push(4);
            req.extend_from_slice(&size.to_be_bytes());
            req.extend_from_slice(&size.to_be_bytes());
        }
        req
    }

    fn upload(server: &mut UdsServer, tp: &mut MockTransport, name: &str, content: &[u8]) -> Vec<u8> {
        tp.push_payload(&rft_request(file_mode::ADD_FILE, name, Some(content.len() as u32)), false);
        server.poll(tp);
        assert_eq!(tp.last_sent().unwrap().0[0], 0x78);

        let mut digest = crc_digest();
        let mut seq = 1u8;
        for block in content.chunks(62).filter(|b| !b.is_empty()) {
            digest.update(block);
            let mut req = vec![0x36, seq];
            req.extend_from_slice(block);
            tp.push_payload(&req, false);
            server.poll(tp);
            assert_eq!(tp.last_sent().unwrap().0, vec![0x76, seq]);
            seq = seq.wrapping_add(1);
        }

        let crc = digest.finalize();
        let mut exit = vec![0x37];
        exit.extend_from_slice(&crc.to_be_bytes());
        tp.push_payload(&exit, false);
        server.poll(tp);
        tp.last_sent().unwrap().0.clone()
    }

    #[test]
    fn upload_then_download_round_trips_with_matching_crc() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = file_server(dir.path());
        let mut tp = MockTransport::new();

        let content: Vec<u8> = (0..200u8).collect();
        let exit_resp = upload(&mut server, &mut tp, "blob.bin", &content);
        assert_eq!(exit_resp, vec![0x77]);
        assert_eq!(fs::read(dir.path().join("blob.bin")).unwrap(), content);

        // Download it back.
        tp.push_payload(&rft_request(file_mode::READ_FILE, "blob.bin", None), false);
        server.poll(&mut tp);
        let rft = tp.last_sent().unwrap().0.clone();
        assert_eq!(rft[0], 0x78);
        let announced = u32::from_be_bytes([rft[7], rft[8], rft[9], rft[10]]);
        assert_eq!(announced as usize, content.len());

        let mut collected = Vec::new();
        let mut seq = 1u8;
        loop {
            tp.push_payload(&[0x36, seq], false);
            server.poll(&mut tp);
            let resp = tp.last_sent().unwrap().0.clone();
            assert_eq!(&resp[..2], &[0x76, seq]);
            if resp.len() == 2 {
                break;
            }
            collected.extend_from_slice(&resp[2..]);
            seq = seq.wrapping_add(1);
        }
        assert_eq!(collected, content);

        tp.push_payload(&[0x37], false);
        server.poll(&mut tp);
        let exit = tp.last_sent().unwrap().0.clone();
        assert_eq!(exit[0], 0x77);
        let crc = u32::from_be_bytes([exit[1], exit[2], exit[3], exit[4]]);
        assert_eq!(crc, CRC32.checksum(&content));
    }

    #[test]
    fn zero_byte_upload_completes_with_crc_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = file_server(dir.path());
        let mut tp = MockTransport::new();

        tp.push_payload(&rft_request(file_mode::ADD_FILE, "empty", Some(0)), false);
        server.poll(&mut tp);

        // CRC32 of empty input is 0; the client sends it on exit.
        let mut exit = vec![0x37];
        exit.extend_from_slice(&0u32.to_be_bytes());
        tp.push_payload(&exit, false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x77]);
        assert_eq!(fs::read(dir.path().join("empty")).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn crc_mismatch_removes_the_partial_upload() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = file_server(dir.path());
        let mut tp = MockTransport::new();

        tp.push_payload(&rft_request(file_mode::ADD_FILE, "bad.bin", Some(4)), false);
        server.poll(&mut tp);
        tp.push_payload(&[0x36, 0x01, 0xDE, 0xAD, 0xBE, 0xEF], false);
        server.poll(&mut tp);

        let mut exit = vec![0x37];
        exit.extend_from_slice(&0x1234_5678u32.to_be_bytes());
        tp.push_payload(&exit, false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x7F, 0x37, 0x72]);
        assert!(!dir.path().join("bad.bin").exists());
    }

    #[test]
    fn missing_remote_file_is_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = file_server(dir.path());
        let mut tp = MockTransport::new();

        tp.push_payload(&rft_request(file_mode::READ_FILE, "absent", None), false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x7F, 0x38, 0x31]);
    }

    #[test]
    fn transfer_without_session_is_conditions_not_correct() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = file_server(dir.path());
        let mut tp = MockTransport::new();

        tp.push_payload(&[0x36, 0x01, 0x00], false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x7F, 0x36, 0x22]);
    }

    #[test]
    fn exit_without_session_is_a_sequence_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = file_server(dir.path());
        let mut tp = MockTransport::new();

        tp.push_payload(&[0x37], false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x7F, 0x37, 0x24]);
    }

    #[test]
    fn parent_dir_components_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = file_server(dir.path());
        let mut tp = MockTransport::new();

        tp.push_payload(
            &rft_request(file_mode::ADD_FILE, "../escape", Some(1)),
            false,
        );
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x7F, 0x38, 0x31]);
    }

    #[test]
    fn new_request_supersedes_a_stale_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = file_server(dir.path());
        let mut tp = MockTransport::new();

        tp.push_payload(&rft_request(file_mode::ADD_FILE, "one", Some(10)), false);
        server.poll(&mut tp);
        // Second request without finishing the first.
        tp.push_payload(&rft_request(file_mode::ADD_FILE, "two", Some(10)), false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0[0], 0x78);

        tp.push_payload(&[0x36, 0x01, 0xAB], false);
        server.poll(&mut tp);
        let mut exit = vec![0x37];
        exit.extend_from_slice(&CRC32.checksum(&[0xAB]).to_be_bytes());
        tp.push_payload(&exit, false);
        server.poll(&mut tp);
        assert_eq!(fs::read(dir.path().join("two")).unwrap(), vec![0xAB]);
    }
}
