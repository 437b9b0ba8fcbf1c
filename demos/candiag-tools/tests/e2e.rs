//! End-to-end scenarios: tester ↔ demo ECU over the simulated CAN bus,
//! full ISO-TP segmentation included.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use candiag::services::file::CRC32;
use candiag::{Nrc, UdsError, file_mode};
use candiag_tools::ecu::{EcuOptions, EcuRuntime};
use candiag_tools::tester::{Tester, TesterConfig, build_client};
use embedded_can_vbus::BusServer;

struct Rig {
    bus: Option<BusServer>,
    ecu: Option<EcuRuntime>,
    cfg: TesterConfig,
    root: tempfile::TempDir,
}

impl Rig {
    fn new(name: &str) -> Self {
        let sock: PathBuf = std::env::temp_dir().join(format!(
            "candiag-e2e-{name}-{}.sock",
            std::process::id()
        ));
        let bus = BusServer::start(&sock).unwrap();
        let root = tempfile::tempdir().unwrap();
        let ecu = EcuRuntime::spawn(EcuOptions::new(&sock, root.path())).unwrap();
        // Give the ECU a beat to install its filters.
        thread::sleep(Duration::from_millis(50));
        Self {
            bus: Some(bus),
            ecu: Some(ecu),
            cfg: TesterConfig::new(sock),
            root,
        }
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        if let Some(ecu) = self.ecu.take() {
            ecu.stop();
        }
        if let Some(mut bus) = self.bus.take() {
            let _ = bus.shutdown();
        }
    }
}

#[test]
fn session_control_negotiates_relaxed_timing() {
    let rig = Rig::new("session");
    let mut client = build_client(&rig.cfg).unwrap();

    client
        .transaction("session", |c| c.send_session_control(0x03))
        .unwrap();
    assert_eq!(
        client.response(),
        &[0x50, 0x03, 0x13, 0x88, 0x13, 0x88],
        "extended session must negotiate 5000/5000 ms timing"
    );
}

#[test]
fn security_handshake_then_zero_seed_on_reauth() {
    let rig = Rig::new("security");
    let mut tester = Tester::connect(&rig.cfg).unwrap();

    tester.request_session(0x03).unwrap();
    tester.perform_security(0x01).unwrap();

    // Re-requesting the unlocked level must answer with a zero seed.
    tester.uds.prepare();
    let res = tester.uds.send_security_access(0x01, &[]);
    tester
        .uds
        .wait_transaction(res, None, Duration::from_millis(1000))
        .unwrap();
    assert_eq!(tester.uds.response(), &[0x67, 0x01, 0x00, 0x00, 0x00, 0x00]);
}

#[test]
fn wdbi_is_idempotent_and_reads_back() {
    let rig = Rig::new("param");
    let mut client = build_client(&rig.cfg).unwrap();

    for _ in 0..2 {
        client
            .transaction("write", |c| c.send_wdbi(0x0001, &[0x01]))
            .unwrap();
        assert_eq!(client.response(), &[0x6E, 0x00, 0x01]);
    }

    client
        .transaction("read", |c| c.send_rdbi(&[0x0001]))
        .unwrap();
    assert_eq!(client.response(), &[0x62, 0x00, 0x01, 0x01]);
}

#[test]
fn io_control_seizes_and_releases_the_signal() {
    let rig = Rig::new("io");
    let mut client = build_client(&rig.cfg).unwrap();

    client
        .transaction("adjust", |c| c.send_io_control(0x0100, 0x03, &[0x01, 0x00, 0x00]))
        .unwrap();
    assert_eq!(
        client.response(),
        &[0x6F, 0x01, 0x00, 0x03, 0x01, 0x00, 0x00]
    );

    client
        .transaction("release", |c| c.send_io_control(0x0100, 0x00, &[]))
        .unwrap();
    assert_eq!(client.response(), &[0x6F, 0x01, 0x00, 0x00, 0x00]);
}

#[test]
fn suppressed_tester_present_stays_silent() {
    let rig = Rig::new("tp");
    let mut client = build_client(&rig.cfg).unwrap();

    client.set_suppress_positive_response(true);
    client.prepare();
    client.send_tester_present().unwrap();
    client.set_suppress_positive_response(false);

    // Drain long enough for any (erroneous) response to arrive.
    for _ in 0..20 {
        client.poll();
        thread::sleep(Duration::from_millis(5));
    }
    assert!(client.is_idle());
    assert!(client.response().is_empty());

    // Without suppression there is exactly one [0x7E, 0x00].
    client
        .transaction("ping", |c| c.send_tester_present())
        .unwrap();
    assert_eq!(client.response(), &[0x7E, 0x00]);
}

#[test]
fn file_upload_download_round_trip() {
    let rig = Rig::new("file");
    let mut client = build_client(&rig.cfg).unwrap();
    client
        .transaction("session", |c| c.send_session_control(0x03))
        .unwrap();

    let content: Vec<u8> = (0..5000u32).map(|i| (i * 7 + 13) as u8).collect();
    let crc = CRC32.checksum(&content);

    // Upload.
    client
        .transaction_with_timeout("init", Duration::from_millis(2000), |c| {
            c.send_request_file_transfer(
                file_mode::ADD_FILE,
                "e2e.bin",
                0x00,
                Some(content.len() as u32),
            )
        })
        .unwrap();
    let resp = client.response().to_vec();
    assert_eq!(resp[0], 0x78);
    let block_len = u16::from_be_bytes([resp[3], resp[4]]) as usize;
    assert!(block_len >= 3);

    let mut sequence = 1u8;
    for block in content.chunks(block_len - 2) {
        client
            .transaction_with_timeout("block", Duration::from_millis(2000), |c| {
                c.send_transfer_data(sequence, block)
            })
            .unwrap();
        sequence = sequence.wrapping_add(1);
    }
    client
        .transaction_with_timeout("exit", Duration::from_millis(2000), |c| {
            c.send_transfer_exit(&crc.to_be_bytes())
        })
        .unwrap();
    assert_eq!(std::fs::read(rig.root.path().join("e2e.bin")).unwrap(), content);

    // Download it back.
    client
        .transaction_with_timeout("init", Duration::from_millis(2000), |c| {
            c.send_request_file_transfer(file_mode::READ_FILE, "e2e.bin", 0x00, None)
        })
        .unwrap();
    let resp = client.response().to_vec();
    let announced = u32::from_be_bytes([resp[7], resp[8], resp[9], resp[10]]) as usize;
    assert_eq!(announced, content.len());

    let mut collected = Vec::new();
    let mut sequence = 1u8;
    loop {
        client
            .transaction_with_timeout("block", Duration::from_millis(3000), |c| {
                c.send_transfer_data(sequence, &[])
            })
            .unwrap();
        let resp = client.response();
        if resp.len() <= 2 {
            break;
        }
        collected.extend_from_slice(&resp[2..]);
        sequence = sequence.wrapping_add(1);
    }
    assert_eq!(collected, content);

    client
        .transaction_with_timeout("exit", Duration::from_millis(2000), |c| {
            c.send_transfer_exit(&[])
        })
        .unwrap();
    let resp = client.response();
    assert_eq!(resp[0], 0x77);
    assert_eq!(
        u32::from_be_bytes([resp[1], resp[2], resp[3], resp[4]]),
        crc
    );
}

#[test]
fn remote_console_requires_session_and_security() {
    let rig = Rig::new("console");
    let mut tester = Tester::connect(&rig.cfg).unwrap();

    // Default session: rejected as not supported in the active session.
    let err = tester.send_console_command("echo hi").unwrap_err();
    let nrc = err
        .downcast_ref::<UdsError>()
        .and_then(UdsError::nrc)
        .expect("expected a negative response");
    assert_eq!(nrc, Nrc::ServiceNotSupportedInActiveSession);

    // Extended session but locked: security access denied.
    tester.request_session(0x03).unwrap();
    let err = tester.send_console_command("echo hi").unwrap_err();
    let nrc = err.downcast_ref::<UdsError>().and_then(UdsError::nrc).unwrap();
    assert_eq!(nrc, Nrc::SecurityAccessDenied);

    // Unlocked: the command runs and `help` fills the completion cache.
    tester.perform_security(0x01).unwrap();
    tester.send_console_command("echo hi").unwrap();
    tester.sync_remote_commands().unwrap();
    let caches = tester.caches();
    let commands = caches.lock().unwrap().commands.clone();
    assert!(commands.iter().any(|name| name == "ls"));
}

#[test]
fn crc_mismatch_on_upload_removes_the_remote_file() {
    let rig = Rig::new("crc");
    let mut client = build_client(&rig.cfg).unwrap();

    client
        .transaction("init", |c| {
            c.send_request_file_transfer(file_mode::ADD_FILE, "broken.bin", 0x00, Some(3))
        })
        .unwrap();
    client
        .transaction("block", |c| c.send_transfer_data(1, &[1, 2, 3]))
        .unwrap();

    let err = client
        .transaction("exit", |c| c.send_transfer_exit(&0xDEAD_BEEFu32.to_be_bytes()))
        .unwrap_err();
    assert_eq!(err.nrc(), Some(Nrc::GeneralProgrammingFailure));
    assert!(!rig.root.path().join("broken.bin").exists());
}
