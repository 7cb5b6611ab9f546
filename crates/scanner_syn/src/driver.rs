//! Scan driver: the send/sniff interleave, retry discipline, and RTT
//! bookkeeping that ties every other component together.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use synprobe_common::ScanReporter;

use crate::config::ScanConfig;
use crate::error::ScanResult;
use crate::facade::{AddressFamily, PacketSource, RawSocket};
use crate::packet;
use crate::probe::ProbeTable;
use crate::rtt;
use crate::timestamp::{self, MAX_PACKED_INTERVAL};

/// Marks that a scan ran to completion. Results themselves are
/// reported through the `ScanReporter` sink, not returned here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOutcome {
    pub ports_scanned: usize,
    pub skipped_loopback: bool,
}

/// Drives a single scan against one target. Generic over the
/// transport so tests can supply an in-memory fake; production code
/// uses [`crate::facade::LinuxRawSocket`]/[`crate::facade::LinuxPacketSource`].
pub struct ScanDriver<'a, R: RawSocket, P: PacketSource> {
    raw: R,
    source: P,
    src_addr: IpAddr,
    dst_addr: IpAddr,
    family: AddressFamily,
    magic_port: u16,
    reporter: &'a dyn ScanReporter,
    probes: ProbeTable,
    rtt: u32,
    open_count: usize,
}

impl<'a, R: RawSocket, P: PacketSource> ScanDriver<'a, R, P> {
    pub fn new(
        raw: R,
        source: P,
        src_addr: IpAddr,
        dst_addr: IpAddr,
        magic_port: u16,
        initial_rtt: u32,
        reporter: &'a dyn ScanReporter,
    ) -> Self {
        Self {
            raw,
            source,
            src_addr,
            dst_addr,
            family: AddressFamily::of(dst_addr),
            magic_port,
            reporter,
            probes: ProbeTable::new(),
            rtt: initial_rtt.min(MAX_PACKED_INTERVAL),
            open_count: 0,
        }
    }

    fn build_syn(&self, dst_port: u16, sent_at: u32) -> Vec<u8> {
        match (self.src_addr, self.dst_addr) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                packet::build_syn_v4(s, d, self.magic_port, dst_port, sent_at)
            }
            _ => packet::build_syn_v6(self.magic_port, dst_port, sent_at),
        }
    }

    fn build_rst(&self, dst_port: u16, seq: u32) -> Vec<u8> {
        match (self.src_addr, self.dst_addr) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                packet::build_rst_v4(s, d, self.magic_port, dst_port, seq)
            }
            _ => packet::build_rst_v6(self.magic_port, dst_port, seq),
        }
    }

    /// Sends a SYN to `port`, registering it in the probe table first.
    /// Port 0 is a "no candidate" sentinel (see the retry phase below)
    /// and is transmitted but never tracked, since tracking it would
    /// violate the table's `dport != 0` invariant for no benefit:
    /// nothing meaningful can reply to it.
    fn send_syn(&mut self, port: u16) -> ScanResult<()> {
        let sent_at = timestamp::now();
        if port != 0 {
            self.probes.insert_or_bump(port, sent_at);
        }
        let packet = self.build_syn(port, sent_at);
        self.raw.send_to(&packet, self.dst_addr)?;
        tracing::trace!(port, sent_at, "sent SYN");
        Ok(())
    }

    fn sniff_deadline(&self) -> Duration {
        let (secs, micros) = timestamp::decode(self.rtt);
        let total_micros = (secs as u64 * 1_000_000 + micros as u64) / 8;
        Duration::from_micros(total_micros).min(Duration::from_secs(1))
    }

    fn handle_frame(&mut self, data: &[u8]) -> ScanResult<()> {
        if packet::is_synack(data) {
            if let Some(port) = packet::source_port(data) {
                self.reporter.add_port(port, "tcp");
                self.open_count += 1;
            }
            if let Some(sent_at) = packet::ack(data) {
                let rst_seq = sent_at.wrapping_add(1);
                if let Some(port) = packet::source_port(data) {
                    let rst = self.build_rst(port, rst_seq);
                    self.raw.send_to(&rst, self.dst_addr)?;
                }
                self.rtt = timestamp::elapsed(sent_at).min(MAX_PACKED_INTERVAL);
                tracing::debug!(rtt = self.rtt, "rtt updated from SYN/ACK");
            }
        }
        if let Some(port) = packet::source_port(data) {
            self.probes.remove(port);
        }
        Ok(())
    }

    fn sniff(&mut self, budget: Duration) -> ScanResult<()> {
        let deadline = Instant::now() + budget;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.source.next(remaining) {
                Some(frame) => {
                    let header_len = self.source.datalink_header_len().min(frame.data.len());
                    self.handle_frame(&frame.data[header_len..])?;
                }
                None => break,
            }
        }
        // Drain anything else immediately available.
        loop {
            match self.source.next(Duration::ZERO) {
                Some(frame) => {
                    let header_len = self.source.datalink_header_len().min(frame.data.len());
                    self.handle_frame(&frame.data[header_len..])?;
                }
                None => break,
            }
        }
        Ok(())
    }

    fn retry_phase(&mut self) -> ScanResult<()> {
        if matches!(self.family, AddressFamily::V6) {
            // No retry phase for IPv6; unacknowledged probes just expire.
            return Ok(());
        }
        while !self.probes.is_empty() {
            let mut retry = self.probes.expire(self.rtt);
            for _ in 0..2 {
                match retry {
                    Some(port) => {
                        tracing::debug!(port, "retransmitting SYN");
                        self.send_syn(port)?;
                        retry = self.probes.expire(self.rtt);
                    }
                    None => break,
                }
            }
            // Always send and sniff once more here, even if the inner
            // loop already drove `retry` back to "none". Port 0 is
            // sent but never tracked (see `send_syn`).
            self.send_syn(retry.unwrap_or(0))?;
            self.sniff(self.sniff_deadline())?;
        }
        Ok(())
    }

    /// Runs the scan to completion against `ports`.
    pub fn run(&mut self, ports: &[u16]) -> ScanResult<ScanOutcome> {
        tracing::info!(
            dst = %self.dst_addr,
            family = ?self.family,
            port_count = ports.len(),
            "scan starting"
        );
        let start = Instant::now();

        let mut i = 0;
        while i < ports.len() {
            self.send_syn(ports[i])?;
            if i + 1 < ports.len() {
                self.send_syn(ports[i + 1])?;
                self.sniff(self.sniff_deadline())?;
            }
            let prev = i;
            i += 2;
            let scanned = i.min(ports.len());
            if scanned / 100 != prev / 100 {
                self.reporter.status(scanned, ports.len());
            }
        }

        self.retry_phase()?;

        self.reporter.mark_scanned();
        self.reporter.mark_synscan();
        if ports.len() >= 65535 {
            self.reporter.mark_full_scan();
        }

        tracing::info!(
            open = self.open_count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "scan finished"
        );

        Ok(ScanOutcome {
            ports_scanned: ports.len(),
            skipped_loopback: false,
        })
    }
}

/// Entry point for a caller that already has a concrete `RawSocket` +
/// `PacketSource` pair (tests, or a host embedding a non-Linux
/// façade). Loopback targets are rejected before either is touched;
/// callers building a Linux façade should check
/// [`synprobe_common::Target::is_loopback`] first and use
/// [`crate::run_scan`] instead, which does this for them.
pub fn run_with_transport<R: RawSocket, P: PacketSource>(
    raw: R,
    source: P,
    src_addr: IpAddr,
    dst_addr: IpAddr,
    ports: &[u16],
    config: &ScanConfig,
    reporter: &dyn ScanReporter,
) -> ScanResult<ScanOutcome> {
    let magic_port = config.pick_magic_port();
    let initial_rtt = if config.run_rtt_warmup() {
        let mut warmup_source = source;
        let estimated = rtt::estimate(&raw, &mut warmup_source, src_addr, dst_addr, magic_port);
        let mut driver = ScanDriver::new(
            raw,
            warmup_source,
            src_addr,
            dst_addr,
            magic_port,
            estimated,
            reporter,
        );
        return driver.run(ports);
    } else {
        rtt::default_rtt()
    };

    let mut driver = ScanDriver::new(raw, source, src_addr, dst_addr, magic_port, initial_rtt, reporter);
    driver.run(ports)
}

/// True if `dst` should be skipped without ever opening a socket.
/// Loopback targets are rejected before any raw socket or capture
/// handle is set up.
pub fn should_skip(dst: IpAddr) -> bool {
    dst.is_loopback()
}
