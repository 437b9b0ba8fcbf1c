use embedded_can::{Frame as _, Id, StandardId};
use embedded_can_interface::{FilterConfig, IdMaskFilter, RxFrameIo, TxFrameIo};
use embedded_can_vbus::{BusServer, VbusCan, VbusFrame};
use std::time::Duration;

fn sock_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("vbus-test-{}-{}.sock", name, std::process::id()))
}

fn frame(id: u16, data: &[u8]) -> VbusFrame {
    VbusFrame::new(Id::Standard(StandardId::new(id).unwrap()), data).unwrap()
}

#[test]
fn frames_are_broadcast_to_other_clients() {
    let path = sock_path("broadcast");
    let mut server = BusServer::start(&path).unwrap();

    let mut a = VbusCan::connect(&path).unwrap();
    let mut b = VbusCan::connect(&path).unwrap();
    let mut c = VbusCan::connect(&path).unwrap();

    let f = frame(0x7E0, &[0x02, 0x3E, 0x00]);
    a.send(&f).unwrap();

    assert_eq!(b.recv_timeout(Duration::from_millis(500)).unwrap(), f);
    assert_eq!(c.recv_timeout(Duration::from_millis(500)).unwrap(), f);

    server.shutdown().unwrap();
}

#[test]
fn sender_does_not_hear_its_own_frames() {
    let path = sock_path("no-loopback");
    let mut server = BusServer::start(&path).unwrap();

    let mut a = VbusCan::connect(&path).unwrap();
    let mut b = VbusCan::connect(&path).unwrap();

    a.send(&frame(0x100, &[1])).unwrap();
    assert!(b.recv_timeout(Duration::from_millis(500)).is_ok());
    assert!(a.recv_timeout(Duration::from_millis(100)).is_err());

    server.shutdown().unwrap();
}

#[test]
fn acceptance_filters_drop_unwanted_ids() {
    let path = sock_path("filters");
    let mut server = BusServer::start(&path).unwrap();

    let mut tx = VbusCan::connect(&path).unwrap();
    let mut rx = VbusCan::connect(&path).unwrap();
    rx.set_filters(&[IdMaskFilter::exact_standard(
        StandardId::new(0x7E8).unwrap(),
    )])
    .unwrap();

    tx.send(&frame(0x123, &[0xAA])).unwrap();
    tx.send(&frame(0x7E8, &[0xBB])).unwrap();

    let got = rx.recv_timeout(Duration::from_millis(500)).unwrap();
    assert_eq!(got.data(), &[0xBB]);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    server.shutdown().unwrap();
}
