//! Synprobe Common - shared target and reporting types
//!
//! This crate holds the small set of types that sit at the boundary
//! between the SYN-scan core and whatever host embeds it: the thing
//! being probed (`Target`) and the sink results are reported through
//! (`ScanReporter`). It deliberately carries none of the scan
//! algorithm itself; that lives in `synprobe_syn`.

pub mod report;
pub mod target;

pub use report::{NullReporter, ScanReporter};
pub use target::Target;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
