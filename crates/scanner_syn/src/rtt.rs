//! RTT warm-up estimator.
//!
//! Bypassed by default (`ScanConfig::run_rtt_warmup == false`), so most
//! scans just start at the conservative default RTT. Kept as a
//! selectable mode for hosts that want a tighter sniff window.

use std::net::IpAddr;
use std::time::Duration;

use crate::facade::{Frame, PacketSource, RawSocket};
use crate::packet;
use crate::timestamp::{self, MAX_PACKED_INTERVAL};

/// Ports probed during warm-up, in order.
pub const WELL_KNOWN_PORTS: [u16; 20] = [
    21, 22, 34, 25, 53, 79, 80, 110, 113, 135, 139, 143, 264, 389, 443, 993, 1454, 1723, 3389,
    8080,
];

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(1);
const SAMPLE_ROUNDS: usize = 10;
const MAX_MISSES: u32 = 10;

/// Default RTT used whenever warm-up is skipped or gives up: one
/// second in the packed encoding.
pub fn default_rtt() -> u32 {
    MAX_PACKED_INTERVAL
}

fn send_probe<R: RawSocket>(
    raw: &R,
    src: IpAddr,
    dst: IpAddr,
    magic_port: u16,
    dport: u16,
) -> Option<u32> {
    let sent_at = timestamp::now();
    let packet = match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => packet::build_syn_v4(s, d, magic_port, dport, sent_at),
        (IpAddr::V6(_), IpAddr::V6(_)) => packet::build_syn_v6(magic_port, dport, sent_at),
        _ => return None,
    };
    raw.send_to(&packet, dst).ok()?;
    Some(sent_at)
}

fn strip(source: &impl PacketSource, frame: &Frame) -> Vec<u8> {
    let offset = source.datalink_header_len().min(frame.data.len());
    frame.data[offset..].to_vec()
}

/// Runs the warm-up routine and returns the resulting RTT estimate,
/// clamped to `1<<28`.
pub fn estimate<R: RawSocket, P: PacketSource>(
    raw: &R,
    source: &mut P,
    src: IpAddr,
    dst: IpAddr,
    magic_port: u16,
) -> u32 {
    let mut responders = Vec::with_capacity(3);
    for &port in WELL_KNOWN_PORTS.iter() {
        if send_probe(raw, src, dst, magic_port, port).is_none() {
            continue;
        }
        if let Some(frame) = source.next(DISCOVERY_TIMEOUT) {
            let stripped = strip(source, &frame);
            if packet::ack(&stripped).is_some() {
                if let Some(replying_port) = packet::source_port(&stripped) {
                    responders.push(replying_port);
                }
            }
        }
        if responders.len() >= 3 {
            break;
        }
    }

    if responders.is_empty() {
        tracing::debug!("rtt warm-up: no responders, falling back to default");
        return default_rtt();
    }

    let mut max: u32 = 0;
    let mut max_max: u32 = 0;
    let mut misses: u32 = 0;

    for round in 0..SAMPLE_ROUNDS {
        let port = responders[round % responders.len()];
        if send_probe(raw, src, dst, magic_port, port).is_none() {
            misses += 1;
            continue;
        }

        match source.next(DISCOVERY_TIMEOUT) {
            Some(frame) => {
                let stripped = strip(source, &frame);
                let Some(raw_ack) = packet::ack(&stripped) else {
                    misses += 1;
                    continue;
                };
                let sample = timestamp::elapsed(raw_ack);
                if max_max != 0 && sample > max_max.saturating_mul(2) {
                    max = max_max;
                } else {
                    max = max_max;
                    max_max = sample;
                }
            }
            None => {
                misses += 1;
                if misses >= MAX_MISSES {
                    tracing::debug!("rtt warm-up: too many missed replies, falling back");
                    return default_rtt();
                }
            }
        }
    }

    if max == 0 {
        default_rtt()
    } else {
        max.min(MAX_PACKED_INTERVAL)
    }
}
