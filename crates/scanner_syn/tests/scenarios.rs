//! End-to-end driver scenarios, run against an in-memory fake network
//! instead of a real raw socket, so they need no privileges and no
//! wall-clock waiting.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::sync::Mutex;
use std::time::Duration;

use synprobe_common::ScanReporter;
use synprobe_syn::facade::{Frame, PacketSource, RawSocket};
use synprobe_syn::timestamp::MAX_PACKED_INTERVAL;
use synprobe_syn::{packet, ScanDriver, ScanResult};

const OUR_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
const TARGET_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const MAGIC_PORT: u16 = 4500;

#[derive(Default)]
struct FakeNetwork {
    sent: Vec<Vec<u8>>,
    open_ports: HashSet<u16>,
    rst_ports: HashSet<u16>,
    pending: VecDeque<Vec<u8>>,
}

impl FakeNetwork {
    fn handle_sent(&mut self, bytes: &[u8]) {
        self.sent.push(bytes.to_vec());
        if bytes.len() < 40 || bytes[0] >> 4 != 4 {
            return;
        }
        let tcp = &bytes[20..40];
        let dst_port = u16::from_be_bytes([tcp[2], tcp[3]]);
        let seq = u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]);

        if self.open_ports.contains(&dst_port) {
            let reply = packet::build_ipv4(
                TARGET_ADDR,
                OUR_ADDR,
                dst_port,
                MAGIC_PORT,
                1,
                seq.wrapping_add(1),
                packet::tcp_flags::SYN | packet::tcp_flags::ACK,
            );
            self.pending.push_back(reply);
        } else if self.rst_ports.contains(&dst_port) {
            let reply = packet::build_ipv4(
                TARGET_ADDR,
                OUR_ADDR,
                dst_port,
                MAGIC_PORT,
                1,
                seq.wrapping_add(1),
                packet::tcp_flags::RST,
            );
            self.pending.push_back(reply);
        }
    }
}

#[derive(Clone)]
struct FakeRaw(Rc<RefCell<FakeNetwork>>);

impl RawSocket for FakeRaw {
    fn send_to(&self, bytes: &[u8], _addr: IpAddr) -> ScanResult<()> {
        self.0.borrow_mut().handle_sent(bytes);
        Ok(())
    }
}

struct FakeSource(Rc<RefCell<FakeNetwork>>);

impl PacketSource for FakeSource {
    fn next(&mut self, _deadline: Duration) -> Option<Frame> {
        self.0.borrow_mut().pending.pop_front().map(|data| Frame { data })
    }
    fn datalink_header_len(&self) -> usize {
        0
    }
}

#[derive(Default)]
struct RecordingReporter {
    opened: Mutex<Vec<u16>>,
    scanned: Mutex<bool>,
    full_scan: Mutex<bool>,
}

impl ScanReporter for RecordingReporter {
    fn add_port(&self, port: u16, proto: &str) {
        assert_eq!(proto, "tcp");
        self.opened.lock().unwrap().push(port);
    }
    fn status(&self, _current: usize, _total: usize) {}
    fn mark_scanned(&self) {
        *self.scanned.lock().unwrap() = true;
    }
    fn mark_synscan(&self) {}
    fn mark_full_scan(&self) {
        *self.full_scan.lock().unwrap() = true;
    }
}

fn new_network(open: &[u16], rst: &[u16]) -> Rc<RefCell<FakeNetwork>> {
    Rc::new(RefCell::new(FakeNetwork {
        open_ports: open.iter().copied().collect(),
        rst_ports: rst.iter().copied().collect(),
        ..Default::default()
    }))
}

// Scenario 1: single open port replies SYN/ACK -> sink sees it, a RST
// tears down the half-open connection, and the probe table drains.
#[test]
fn open_port_is_reported_and_torn_down_with_rst() {
    let net = new_network(&[22], &[]);
    let raw = FakeRaw(net.clone());
    let source = FakeSource(net.clone());
    let reporter = RecordingReporter::default();

    let mut driver = ScanDriver::new(
        raw,
        source,
        IpAddr::V4(OUR_ADDR),
        IpAddr::V4(TARGET_ADDR),
        MAGIC_PORT,
        MAX_PACKED_INTERVAL,
        &reporter,
    );
    driver.run(&[22]).unwrap();

    assert_eq!(*reporter.opened.lock().unwrap(), vec![22]);

    let sent = net.borrow().sent.clone();
    let original_syn = sent
        .iter()
        .find(|pkt| pkt.len() >= 24 && u16::from_be_bytes([pkt[22], pkt[23]]) == 22)
        .expect("a SYN to port 22 was sent");
    let embedded_seq = u32::from_be_bytes([
        original_syn[24],
        original_syn[25],
        original_syn[26],
        original_syn[27],
    ]);

    let rst = sent
        .iter()
        .rev()
        .find(|pkt| {
            pkt.len() >= 34 && pkt[33] == packet::tcp_flags::RST && pkt[9] == 6
        })
        .expect("a RST was sent to tear down the half-open connection");
    let rst_seq = u32::from_be_bytes([rst[24], rst[25], rst[26], rst[27]]);
    assert_eq!(rst_seq, embedded_seq.wrapping_add(1));
}

// Scenario 2: both ports stay silent -> no open-port events, and every
// probe eventually gets dropped once it exhausts its retries. A tiny
// initial RTT collapses the 2*rtt aging window to effectively zero so
// the test doesn't need to sleep in wall-clock time.
#[test]
fn silent_ports_are_retried_then_dropped_without_being_reported() {
    let net = new_network(&[], &[]);
    let raw = FakeRaw(net.clone());
    let source = FakeSource(net.clone());
    let reporter = RecordingReporter::default();

    let mut driver = ScanDriver::new(
        raw,
        source,
        IpAddr::V4(OUR_ADDR),
        IpAddr::V4(TARGET_ADDR),
        MAGIC_PORT,
        1, // tiny RTT budget so aging is effectively instantaneous
        &reporter,
    );
    driver.run(&[22, 81]).unwrap();

    assert!(reporter.opened.lock().unwrap().is_empty());
}

// Scenario 3: peer answers with a bare RST -> no open-port event, but
// the probe is still retired (a non-SYN/ACK reply still concludes it).
#[test]
fn rst_reply_clears_the_probe_without_reporting_it_open() {
    let net = new_network(&[], &[22]);
    let raw = FakeRaw(net.clone());
    let source = FakeSource(net.clone());
    let reporter = RecordingReporter::default();

    let mut driver = ScanDriver::new(
        raw,
        source,
        IpAddr::V4(OUR_ADDR),
        IpAddr::V4(TARGET_ADDR),
        MAGIC_PORT,
        MAX_PACKED_INTERVAL,
        &reporter,
    );
    driver.run(&[22]).unwrap();

    assert!(reporter.opened.lock().unwrap().is_empty());
}

// Scenario 5: a full 0..65535 port sweep marks the host as fully scanned.
#[test]
fn full_port_range_marks_full_scan() {
    let net = new_network(&[], &[]);
    let raw = FakeRaw(net.clone());
    let source = FakeSource(net.clone());
    let reporter = RecordingReporter::default();

    let ports: Vec<u16> = (1..=65535u32).map(|p| p as u16).collect();

    let mut driver = ScanDriver::new(
        raw,
        source,
        IpAddr::V4(OUR_ADDR),
        IpAddr::V4(TARGET_ADDR),
        MAGIC_PORT,
        1,
        &reporter,
    );
    driver.run(&ports).unwrap();

    assert!(*reporter.full_scan.lock().unwrap());
    assert!(*reporter.scanned.lock().unwrap());
}
