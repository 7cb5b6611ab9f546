//! The sink interface the host implements to receive scan results.
//!
//! The scan driver never writes to stdout or a database itself. It
//! only calls through a `&dyn ScanReporter` supplied by the host, the
//! same seam the wider scanner ecosystem uses for `Storage`/`Scanner`
//! backends.

/// Callback surface for a running scan. All methods take `&self` so a
/// single reporter can be shared (e.g. behind an `Arc`) without the
/// driver needing to know how the host synchronizes it.
pub trait ScanReporter: Send + Sync {
    /// An open port was discovered. `proto` is always `"tcp"` for this
    /// scanner but is passed through explicitly so the sink's wire
    /// format doesn't need to hardcode it.
    fn add_port(&self, port: u16, proto: &str);

    /// Periodic progress update, emitted roughly once per 100 ports.
    fn status(&self, current: usize, total: usize);

    /// The scan ran to completion (as opposed to failing in setup).
    fn mark_scanned(&self);

    /// This host was probed by the SYN scanner specifically (as
    /// opposed to, say, a TCP-connect scanner).
    fn mark_synscan(&self);

    /// The entire 0..65535 port space was covered.
    fn mark_full_scan(&self);
}

/// A `ScanReporter` that discards everything. Useful as a default when
/// a caller only cares about the return value of the scan, and as a
/// base to wrap with partial overrides in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl ScanReporter for NullReporter {
    fn add_port(&self, _port: u16, _proto: &str) {}
    fn status(&self, _current: usize, _total: usize) {}
    fn mark_scanned(&self) {}
    fn mark_synscan(&self) {}
    fn mark_full_scan(&self) {}
}
