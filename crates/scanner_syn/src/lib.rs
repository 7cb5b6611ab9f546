//! SYN-scan TCP port probing core.
//!
//! This crate is a library, not a CLI: a host passes in a target, a
//! port list, and a [`ScanConfig`], and gets back a [`ScanOutcome`]
//! plus a stream of callbacks through a [`synprobe_common::ScanReporter`].
//! Everything below the driver is pure and unit-testable on its own;
//! the driver itself is tested against a fake transport (see
//! `driver::tests` and the scenario tests under `tests/`).

pub mod checksum;
pub mod config;
pub mod driver;
pub mod error;
pub mod facade;
pub mod packet;
pub mod probe;
pub mod rtt;
pub mod timestamp;

pub use config::ScanConfig;
pub use driver::{run_with_transport, should_skip, ScanDriver, ScanOutcome};
pub use error::{ScanError, ScanResult};
pub use facade::{AddressFamily, Frame, PacketSource, RawSocket};
pub use probe::{Probe, ProbeTable, NUM_RETRIES};

#[cfg(target_os = "linux")]
mod linux_entry {
    use std::net::IpAddr;

    use synprobe_common::ScanReporter;

    use crate::config::ScanConfig;
    use crate::driver::{self, ScanDriver, ScanOutcome};
    use crate::error::{ScanError, ScanResult};
    use crate::facade::{discover_source_addr, LinuxPacketSource, LinuxRawSocket};
    use crate::rtt;

    /// Runs a full SYN scan against `dst` over `ports`, using the Linux
    /// raw-socket/AF_PACKET façade. Returns immediately, without
    /// opening any socket, for a loopback destination.
    pub fn run_scan(
        dst: IpAddr,
        ports: &[u16],
        config: &ScanConfig,
        reporter: &dyn ScanReporter,
    ) -> ScanResult<ScanOutcome> {
        if driver::should_skip(dst) {
            tracing::debug!(%dst, "loopback target, skipping scan");
            return Ok(ScanOutcome {
                ports_scanned: 0,
                skipped_loopback: true,
            });
        }

        let src = discover_source_addr(dst).map_err(ScanError::RawSocketSetup)?;
        let magic_port = config.pick_magic_port();
        let family = crate::facade::AddressFamily::of(dst);

        let raw = LinuxRawSocket::open(family)?;
        let mut source = LinuxPacketSource::open(dst, magic_port)?;

        let initial_rtt = if config.run_rtt_warmup() {
            rtt::estimate(&raw, &mut source, src, dst, magic_port)
        } else {
            rtt::default_rtt()
        };

        let mut d = ScanDriver::new(raw, source, src, dst, magic_port, initial_rtt, reporter);
        d.run(ports)
    }
}

#[cfg(target_os = "linux")]
pub use linux_entry::run_scan;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reexports_are_reachable() {
        let _ = NUM_RETRIES;
        let cfg = ScanConfig::new();
        let _ = cfg.run_rtt_warmup();
    }
}
