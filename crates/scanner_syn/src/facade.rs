//! Raw-socket and packet-capture façade.
//!
//! The driver in [`crate::driver`] only ever talks to a `RawSocket` and
//! a `PacketSource`. That keeps the retry/RTT state machine testable
//! against an in-memory fake (see the driver's own test module) while
//! a real scan is driven by [`LinuxRawSocket`]/[`LinuxPacketSource`],
//! built on the same libc raw-socket pattern the rest of this
//! workspace's scanners use, generalized to `IP_HDRINCL` for IPv4 and
//! the kernel checksum offset for IPv6.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::Duration;

use crate::error::{ScanError, ScanResult};

/// Address family a raw socket / capture handle was opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }
}

/// A captured frame, datalink header included. The caller strips
/// [`PacketSource::datalink_header_len`] bytes before handing the rest
/// to the parser in [`crate::packet`].
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
}

/// Transmits already-built segments. Implementations own the
/// `IP_HDRINCL`/`IPV6_CHECKSUM` setup; the driver only calls `send_to`.
pub trait RawSocket {
    fn send_to(&self, bytes: &[u8], addr: IpAddr) -> ScanResult<()>;
}

/// Yields frames matching the scan's BPF filter (`tcp and src host
/// <dst> and dst port <magic_port>`), bounded by a per-call deadline.
pub trait PacketSource {
    /// Waits up to `deadline` for the next matching frame.
    fn next(&mut self, deadline: Duration) -> Option<Frame>;

    /// Link-layer header length to strip before IP parsing.
    fn datalink_header_len(&self) -> usize;
}

/// Mirrors the out-of-scope routing lookup well enough to pick a
/// plausible local source address for a destination: connect a UDP
/// socket and read back the address the kernel would have routed
/// through. No packets are sent (UDP `connect` only consults the
/// routing table).
pub fn discover_source_addr(dst: IpAddr) -> io::Result<IpAddr> {
    let bind_addr: SocketAddr = match dst {
        IpAddr::V4(_) => "0.0.0.0:0".parse().unwrap(),
        IpAddr::V6(_) => "[::]:0".parse().unwrap(),
    };
    let socket = UdpSocket::bind(bind_addr)?;
    socket.connect((dst, 9))?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::mem::{size_of, zeroed};
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::os::unix::io::RawFd;

    const IPV6_CHECKSUM: libc::c_int = 7;
    // Byte offset of the TCP checksum field within the TCP header:
    // source port (2) + dest port (2) + sequence (4) + ack (4) +
    // data-offset/flags (2) + window (2) = 16.
    const CHECKSUM_OFFSET_IN_TCP_HEADER: libc::c_int = 16;

    fn last_os_error() -> io::Error {
        io::Error::last_os_error()
    }

    /// Linux raw-socket transmitter: `IP_HDRINCL` for IPv4 (we supply
    /// the whole IP header ourselves), the checksum-offset socket
    /// option for IPv6 (the kernel fills in the TCP checksum).
    pub struct LinuxRawSocket {
        fd: RawFd,
        family: AddressFamily,
    }

    impl LinuxRawSocket {
        pub fn open(family: AddressFamily) -> ScanResult<Self> {
            let (domain, fd) = unsafe {
                let domain = match family {
                    AddressFamily::V4 => libc::AF_INET,
                    AddressFamily::V6 => libc::AF_INET6,
                };
                let fd = libc::socket(domain, libc::SOCK_RAW, libc::IPPROTO_TCP);
                (domain, fd)
            };
            if fd < 0 {
                let err = last_os_error();
                return Err(if err.raw_os_error() == Some(libc::EPERM) {
                    ScanError::NotPermitted
                } else {
                    ScanError::RawSocketSetup(err)
                });
            }

            let ok = unsafe {
                match family {
                    AddressFamily::V4 => {
                        let on: libc::c_int = 1;
                        libc::setsockopt(
                            fd,
                            libc::IPPROTO_IP,
                            libc::IP_HDRINCL,
                            &on as *const _ as *const libc::c_void,
                            size_of::<libc::c_int>() as libc::socklen_t,
                        )
                    }
                    AddressFamily::V6 => libc::setsockopt(
                        fd,
                        libc::IPPROTO_IPV6,
                        IPV6_CHECKSUM,
                        &CHECKSUM_OFFSET_IN_TCP_HEADER as *const _ as *const libc::c_void,
                        size_of::<libc::c_int>() as libc::socklen_t,
                    ),
                }
            };
            if ok < 0 {
                let err = last_os_error();
                unsafe { libc::close(fd) };
                return Err(ScanError::RawSocketSetup(err));
            }

            let _ = domain;
            Ok(Self { fd, family })
        }
    }

    impl Drop for LinuxRawSocket {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }

    impl RawSocket for LinuxRawSocket {
        fn send_to(&self, bytes: &[u8], addr: IpAddr) -> ScanResult<()> {
            let sent = match (self.family, addr) {
                (AddressFamily::V4, IpAddr::V4(dst)) => unsafe { send_v4(self.fd, bytes, dst) },
                (AddressFamily::V6, IpAddr::V6(dst)) => unsafe { send_v6(self.fd, bytes, dst) },
                _ => return Err(ScanError::UnsupportedFamily("address family mismatch")),
            };
            if sent < 0 {
                return Err(ScanError::Send {
                    addr,
                    source: last_os_error(),
                });
            }
            Ok(())
        }
    }

    unsafe fn send_v4(fd: RawFd, bytes: &[u8], dst: Ipv4Addr) -> isize {
        let mut sockaddr: libc::sockaddr_in = zeroed();
        sockaddr.sin_family = libc::AF_INET as libc::sa_family_t;
        sockaddr.sin_addr.s_addr = u32::from_ne_bytes(dst.octets());
        libc::sendto(
            fd,
            bytes.as_ptr() as *const libc::c_void,
            bytes.len(),
            0,
            &sockaddr as *const _ as *const libc::sockaddr,
            size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    }

    unsafe fn send_v6(fd: RawFd, bytes: &[u8], dst: Ipv6Addr) -> isize {
        let mut sockaddr: libc::sockaddr_in6 = zeroed();
        sockaddr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        sockaddr.sin6_addr.s6_addr = dst.octets();
        libc::sendto(
            fd,
            bytes.as_ptr() as *const libc::c_void,
            bytes.len(),
            0,
            &sockaddr as *const _ as *const libc::sockaddr,
            size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        )
    }

    /// Linux `AF_PACKET` capture handle, software-filtered to the
    /// scan's destination address and magic source port. No BPF
    /// bytecode is compiled; the filter predicate is applied per-frame
    /// in [`PacketSource::next`] instead, which is equivalent to a
    /// pre-filtered BPF stream for this scanner's purposes.
    pub struct LinuxPacketSource {
        fd: RawFd,
        dst: IpAddr,
        magic_port: u16,
        datalink_header_len: usize,
    }

    impl LinuxPacketSource {
        pub fn open(dst: IpAddr, magic_port: u16) -> ScanResult<Self> {
            let fd = unsafe {
                libc::socket(
                    libc::AF_PACKET,
                    libc::SOCK_RAW,
                    (libc::ETH_P_ALL as u16).to_be() as libc::c_int,
                )
            };
            if fd < 0 {
                return Err(ScanError::CaptureSetup(last_os_error()));
            }
            set_nonblocking(fd)?;
            Ok(Self {
                fd,
                dst,
                magic_port,
                datalink_header_len: 14, // Ethernet
            })
        }

        fn matches(&self, frame: &[u8]) -> bool {
            let ip = match frame.get(self.datalink_header_len..) {
                Some(ip) if !ip.is_empty() => ip,
                _ => return false,
            };
            let Some(src) = crate::packet::source_ip(ip) else {
                return false;
            };
            if src != self.dst {
                return false;
            }
            crate::packet::dest_port(ip) == Some(self.magic_port)
        }
    }

    impl Drop for LinuxPacketSource {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }

    fn set_nonblocking(fd: RawFd) -> ScanResult<()> {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(ScanError::CaptureSetup(last_os_error()));
            }
        }
        Ok(())
    }

    impl PacketSource for LinuxPacketSource {
        fn next(&mut self, deadline: Duration) -> Option<Frame> {
            let start = std::time::Instant::now();
            let mut buf = vec![0u8; 65535];
            loop {
                let n = unsafe {
                    libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
                };
                if n > 0 {
                    let frame = Frame {
                        data: buf[..n as usize].to_vec(),
                    };
                    if self.matches(&frame.data) {
                        return Some(frame);
                    }
                    // Non-matching traffic; keep polling within the deadline.
                } else if start.elapsed() >= deadline {
                    return None;
                } else {
                    std::thread::sleep(Duration::from_micros(200).min(deadline));
                }
                if start.elapsed() >= deadline {
                    return None;
                }
            }
        }

        fn datalink_header_len(&self) -> usize {
            self.datalink_header_len
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::{LinuxPacketSource, LinuxRawSocket};
