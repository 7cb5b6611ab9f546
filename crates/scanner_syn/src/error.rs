//! Error taxonomy for the SYN-scan core.
//!
//! Only the conditions that are fatal to a scan get a variant here.
//! Malformed replies, aged-out probes, and a silent RTT warm-up are
//! not errors. They're handled locally and never propagate (see the
//! driver and the probe table).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("raw sockets not permitted (need root/CAP_NET_RAW)")]
    NotPermitted,

    #[error("failed to open raw socket: {0}")]
    RawSocketSetup(#[source] std::io::Error),

    #[error("failed to open packet capture: {0}")]
    CaptureSetup(#[source] std::io::Error),

    #[error("send failed for {addr}: {source}")]
    Send {
        addr: std::net::IpAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("address family not supported by this facade: {0}")]
    UnsupportedFamily(&'static str),
}

pub type ScanResult<T> = Result<T, ScanError>;
