//! Packet builder and parser.
//!
//! The builder assembles IPv4+TCP and IPv6+TCP byte buffers for a SYN
//! or an RST; the parser pulls the three fields the driver actually
//! needs back out of a captured frame (source port, ACK, SYN+ACK
//! flags) without trusting the frame's length.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::checksum;

/// TCP flag bits.
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
}

const IPV4_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;
const IPV4_WINDOW: u16 = 4096;
const IPV6_WINDOW: u16 = 5760;

/// Builds a 40-byte IPv4 + TCP segment (20-byte IP header, 20-byte TCP
/// header, no options, no payload).
#[allow(clippy::too_many_arguments)]
pub fn build_ipv4(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
) -> Vec<u8> {
    let mut buf = vec![0u8; IPV4_HEADER_LEN + TCP_HEADER_LEN];

    buf[0] = 0x45; // version 4, IHL 5
    buf[1] = 0x00; // TOS
    let total_len = buf.len() as u16;
    buf[2..4].copy_from_slice(&total_len.to_be_bytes());
    buf[4..6].copy_from_slice(&rand::random::<u16>().to_be_bytes()); // ID
    buf[6..8].copy_from_slice(&0u16.to_be_bytes()); // flags/frag-offset
    buf[8] = 64; // TTL
    buf[9] = 6; // protocol: TCP
    buf[10..12].copy_from_slice(&[0, 0]); // checksum placeholder
    buf[12..16].copy_from_slice(&src.octets());
    buf[16..20].copy_from_slice(&dst.octets());

    let ip_checksum = checksum::ip4_header_checksum(&buf[0..IPV4_HEADER_LEN]);
    buf[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    write_tcp_header(
        &mut buf[IPV4_HEADER_LEN..],
        src_port,
        dst_port,
        seq,
        ack,
        flags,
        IPV4_WINDOW,
    );

    let pseudo = checksum::ipv4_pseudo_header(&src, &dst, TCP_HEADER_LEN as u16);
    let mut pseudo_and_segment = Vec::with_capacity(pseudo.len() + TCP_HEADER_LEN);
    pseudo_and_segment.extend_from_slice(&pseudo);
    pseudo_and_segment.extend_from_slice(&buf[IPV4_HEADER_LEN..]);
    let tcp_sum = checksum::tcp_checksum(&pseudo_and_segment);
    buf[IPV4_HEADER_LEN + 16..IPV4_HEADER_LEN + 18].copy_from_slice(&tcp_sum.to_be_bytes());

    buf
}

/// Builds a 20-byte TCP header with no IP header; the kernel prepends
/// the IPv6 header and fills the checksum via the socket's
/// checksum-offset option.
pub fn build_ipv6(src_port: u16, dst_port: u16, seq: u32, ack: u32, flags: u8) -> Vec<u8> {
    let mut buf = vec![0u8; TCP_HEADER_LEN];
    write_tcp_header(&mut buf, src_port, dst_port, seq, ack, flags, IPV6_WINDOW);
    buf
}

fn write_tcp_header(
    buf: &mut [u8],
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
) {
    buf[0..2].copy_from_slice(&src_port.to_be_bytes());
    buf[2..4].copy_from_slice(&dst_port.to_be_bytes());
    buf[4..8].copy_from_slice(&seq.to_be_bytes());
    buf[8..12].copy_from_slice(&ack.to_be_bytes());
    buf[12] = 0x50; // data offset 5, no options
    buf[13] = flags;
    buf[14..16].copy_from_slice(&window.to_be_bytes());
    buf[16..18].copy_from_slice(&[0, 0]); // checksum placeholder
    buf[18..20].copy_from_slice(&[0, 0]); // urgent pointer
}

/// SYN, IPv4. `ack` is always 0 for a SYN on this side.
pub fn build_syn_v4(src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16, sent_at: u32) -> Vec<u8> {
    build_ipv4(src, dst, src_port, dst_port, sent_at, 0, tcp_flags::SYN)
}

/// RST, IPv4, used to tear down the half-open connection after a SYN/ACK.
pub fn build_rst_v4(src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16, seq: u32) -> Vec<u8> {
    build_ipv4(src, dst, src_port, dst_port, seq, 0, tcp_flags::RST)
}

/// SYN, IPv6. The ACK field is a fresh random value; the kernel
/// computes the checksum itself via the socket's checksum offset.
pub fn build_syn_v6(src_port: u16, dst_port: u16, sent_at: u32) -> Vec<u8> {
    build_ipv6(src_port, dst_port, sent_at, rand::random(), tcp_flags::SYN)
}

/// RST, IPv6.
pub fn build_rst_v6(src_port: u16, dst_port: u16, seq: u32) -> Vec<u8> {
    build_ipv6(src_port, dst_port, seq, 0, tcp_flags::RST)
}

/// Locates the TCP header inside an already-datalink-stripped frame,
/// rejecting anything too short to hold a full header at the claimed
/// offset. Returns `None` for anything that isn't IPv4 or IPv6 TCP.
fn locate_tcp(frame: &[u8]) -> Option<&[u8]> {
    if frame.is_empty() {
        return None;
    }
    match frame[0] >> 4 {
        4 => {
            if frame.len() < IPV4_HEADER_LEN {
                return None;
            }
            let ihl = (frame[0] & 0x0F) as usize * 4;
            if ihl < IPV4_HEADER_LEN || frame.len() < ihl + TCP_HEADER_LEN {
                return None;
            }
            if frame[9] != 6 {
                return None;
            }
            Some(&frame[ihl..])
        }
        6 => {
            const IPV6_HEADER_LEN: usize = 40;
            if frame.len() < IPV6_HEADER_LEN + TCP_HEADER_LEN {
                return None;
            }
            if frame[6] != 6 {
                return None;
            }
            Some(&frame[IPV6_HEADER_LEN..])
        }
        _ => None,
    }
}

/// Source port of a captured segment.
pub fn source_port(frame: &[u8]) -> Option<u16> {
    let tcp = locate_tcp(frame)?;
    Some(u16::from_be_bytes([tcp[0], tcp[1]]))
}

/// Destination port of a captured segment, used by the capture façade
/// to match the scan's magic source port.
pub fn dest_port(frame: &[u8]) -> Option<u16> {
    let tcp = locate_tcp(frame)?;
    Some(u16::from_be_bytes([tcp[2], tcp[3]]))
}

/// Source address of a captured segment, used by the capture façade's
/// software filter.
pub fn source_ip(frame: &[u8]) -> Option<IpAddr> {
    if frame.is_empty() {
        return None;
    }
    match frame[0] >> 4 {
        4 if frame.len() >= 16 => Some(IpAddr::V4(Ipv4Addr::new(
            frame[12], frame[13], frame[14], frame[15],
        ))),
        6 if frame.len() >= 24 => Some(IpAddr::V6(Ipv6Addr::from([
            frame[8], frame[9], frame[10], frame[11], frame[12], frame[13], frame[14], frame[15],
            frame[16], frame[17], frame[18], frame[19], frame[20], frame[21], frame[22], frame[23],
        ]))),
        _ => None,
    }
}

/// `ACK - 1`, recovering the `sent_at` the original SYN embedded in
/// its sequence number.
pub fn ack(frame: &[u8]) -> Option<u32> {
    let tcp = locate_tcp(frame)?;
    let raw_ack = u32::from_be_bytes([tcp[8], tcp[9], tcp[10], tcp[11]]);
    Some(raw_ack.wrapping_sub(1))
}

/// True iff the TCP flags byte is exactly `SYN|ACK`. No other
/// combination (e.g. with ECE or CWR set) counts, to keep the match
/// conservative.
pub fn is_synack(frame: &[u8]) -> bool {
    match locate_tcp(frame) {
        Some(tcp) if tcp.len() >= 14 => tcp[13] == tcp_flags::SYN | tcp_flags::ACK,
        _ => false,
    }
}
