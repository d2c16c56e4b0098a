// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! UDP sockets with local-address (PKTINFO) support.
//!
//! A server socket bound to a wildcard address must reply from the
//! exact address each query was sent to, or clients behind strict
//! filters will drop the response. The sockets here request the
//! destination address of every received datagram via the PKTINFO
//! control messages and pin the source address of replies to it. The
//! interface index in outgoing control data is cleared so the kernel
//! still consults its routing tables.
//!
//! In production the enclosing process passes in already-bound file
//! descriptors (one per worker with `SO_REUSEPORT`); [`UdpSocket::bind`]
//! exists for tests and simple deployments.

use std::io::{self, Error, ErrorKind, IoSlice, IoSliceMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use std::time::Duration;

use cfg_if::cfg_if;
use libc::{in6_addr, in6_pktinfo, in_addr};
use nix::cmsg_space;
use nix::sys::socket::{
    bind, recvmsg, sendmsg, setsockopt, socket, sockopt, AddressFamily, CmsgIterator,
    ControlMessage, ControlMessageOwned, MsgFlags, RecvMsg, SockFlag, SockProtocol, SockType,
    SockaddrStorage,
};
use nix::sys::time::{TimeVal, TimeValLike};
use nix::unistd::close;

#[cfg(target_os = "linux")]
use libc::in_pktinfo;

/// A UDP socket that reports the local destination address of received
/// datagrams and selects the source address of sent ones.
pub struct UdpSocket {
    fd: RawFd,
    ipv6: bool,
    cmsg_buf: Vec<u8>,
}

impl UdpSocket {
    /// Creates a socket from an already-bound file descriptor handed in
    /// by the enclosing process. The address family is read back from
    /// the descriptor, and the PKTINFO option is enabled here, so
    /// callers need not have done either.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        let raw = fd.into_raw_fd();
        let result = (|| -> io::Result<bool> {
            let addr: SockaddrStorage = nix::sys::socket::getsockname(raw)?;
            let ipv6 = addr.as_sockaddr_in6().is_some();
            enable_pktinfo(raw, ipv6)?;
            Ok(ipv6)
        })();
        match result {
            Ok(ipv6) => Ok(Self {
                fd: raw,
                ipv6,
                cmsg_buf: make_cmsg_buf(ipv6),
            }),
            Err(e) => {
                let _ = close(raw);
                Err(e)
            }
        }
    }

    /// Creates and binds a new socket.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let family = if addr.is_ipv6() {
            AddressFamily::Inet6
        } else {
            AddressFamily::Inet
        };
        let fd = socket(
            family,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::Udp,
        )?
        .into_raw_fd();
        let sock_addr = SockaddrStorage::from(addr);
        if let Err(e) = bind(fd, &sock_addr) {
            let _ = close(fd);
            return Err(e.into());
        }
        if let Err(e) = enable_pktinfo(fd, addr.is_ipv6()) {
            let _ = close(fd);
            return Err(e.into());
        }
        Ok(Self {
            fd,
            ipv6: addr.is_ipv6(),
            cmsg_buf: make_cmsg_buf(addr.is_ipv6()),
        })
    }

    /// Sets the receive timeout.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        let timeval = match timeout {
            Some(t) if t.is_zero() => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "cannot set a 0 duration timeout",
                ));
            }
            Some(t) => TimeVal::microseconds(t.as_micros().try_into().unwrap_or(i64::MAX)),
            None => TimeVal::zero(),
        };
        let borrowed = unsafe { BorrowedFd::borrow_raw(self.fd) };
        setsockopt(&borrowed, sockopt::ReceiveTimeout, &timeval).map_err(Into::into)
    }

    /// Returns the local address the socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let addr: SockaddrStorage = nix::sys::socket::getsockname(self.fd)?;
        sockaddr_to_std(self.ipv6, Some(&addr))
    }

    /// Receives one datagram, returning its length, the sender, and
    /// the local destination address it was sent to.
    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, IpAddr)> {
        let mut iov = [IoSliceMut::new(buf)];
        let msg: RecvMsg<SockaddrStorage> = recvmsg(
            self.fd,
            &mut iov,
            Some(&mut self.cmsg_buf),
            MsgFlags::empty(),
        )?;
        let dest = extract_dest_addr(self.ipv6, msg.cmsgs())?;
        let src = sockaddr_to_std(self.ipv6, msg.address.as_ref())?;
        Ok((msg.bytes, src, dest))
    }

    /// Sends one datagram to `dest`, with the source address pinned to
    /// `src` (the destination of the query being answered). The
    /// interface index is left zero so routing is not bypassed.
    pub fn send(&mut self, buf: &[u8], dest: SocketAddr, src: IpAddr) -> io::Result<usize> {
        let iov = [IoSlice::new(buf)];
        let dest_sockaddr = SockaddrStorage::from(dest);
        if self.ipv6 {
            let info = make_in6_pktinfo(src)?;
            let cmsgs = [ControlMessage::Ipv6PacketInfo(&info)];
            sendmsg(
                self.fd,
                &iov,
                &cmsgs,
                MsgFlags::empty(),
                Some(&dest_sockaddr),
            )
            .map_err(Into::into)
        } else {
            cfg_if! {
                if #[cfg(target_os = "linux")] {
                    let info = make_in_pktinfo(src)?;
                    let cmsgs = [ControlMessage::Ipv4PacketInfo(&info)];
                } else {
                    let src_in_addr = make_in_addr(src)?;
                    let cmsgs = [ControlMessage::Ipv4SendSrcAddr(&src_in_addr)];
                }
            }
            sendmsg(
                self.fd,
                &iov,
                &cmsgs,
                MsgFlags::empty(),
                Some(&dest_sockaddr),
            )
            .map_err(Into::into)
        }
    }
}

impl AsRawFd for UdpSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        let _ = close(self.fd);
    }
}

////////////////////////////////////////////////////////////////////////
// HELPERS                                                            //
////////////////////////////////////////////////////////////////////////

fn enable_pktinfo(fd: RawFd, ipv6: bool) -> nix::Result<()> {
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    if ipv6 {
        setsockopt(&fd, sockopt::Ipv6RecvPacketInfo, &true)
    } else {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                setsockopt(&fd, sockopt::Ipv4PacketInfo, &true)
            } else {
                setsockopt(&fd, sockopt::Ipv4RecvDstAddr, &true)
            }
        }
    }
}

/// Pre-allocates the control-message buffer for `recvmsg`.
fn make_cmsg_buf(ipv6: bool) -> Vec<u8> {
    if ipv6 {
        cmsg_space!(in6_pktinfo)
    } else {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                cmsg_space!(in_pktinfo)
            } else {
                cmsg_space!(in_addr)
            }
        }
    }
}

fn sockaddr_to_std(ipv6: bool, raw_opt: Option<&SockaddrStorage>) -> io::Result<SocketAddr> {
    let raw = raw_opt
        .ok_or_else(|| Error::new(ErrorKind::Other, "recvmsg did not return an address"))?;
    if ipv6 {
        let raw6 = raw.as_sockaddr_in6().ok_or_else(|| {
            Error::new(ErrorKind::Other, "recvmsg did not return an IPv6 address")
        })?;
        Ok(SocketAddr::V6(SocketAddrV6::from(*raw6)))
    } else {
        let raw4 = raw.as_sockaddr_in().ok_or_else(|| {
            Error::new(ErrorKind::Other, "recvmsg did not return an IPv4 address")
        })?;
        Ok(SocketAddr::V4(SocketAddrV4::from(*raw4)))
    }
}

/// Finds the control message carrying the local destination address.
fn extract_dest_addr(ipv6: bool, cmsgs: CmsgIterator) -> io::Result<IpAddr> {
    for cmsg in cmsgs {
        if ipv6 {
            if let ControlMessageOwned::Ipv6PacketInfo(info) = cmsg {
                return Ok(IpAddr::V6(Ipv6Addr::from(info.ipi6_addr.s6_addr)));
            }
        } else {
            #[cfg(target_os = "linux")]
            if let ControlMessageOwned::Ipv4PacketInfo(info) = cmsg {
                return Ok(IpAddr::V4(Ipv4Addr::from(u32::from_be(
                    info.ipi_addr.s_addr,
                ))));
            }
            #[cfg(not(target_os = "linux"))]
            if let ControlMessageOwned::Ipv4RecvDstAddr(addr) = cmsg {
                return Ok(IpAddr::V4(Ipv4Addr::from(u32::from_be(addr.s_addr))));
            }
        }
    }
    Err(Error::new(
        ErrorKind::Other,
        "recvmsg did not return the local destination address",
    ))
}

fn make_in6_pktinfo(src: IpAddr) -> io::Result<in6_pktinfo> {
    match src {
        IpAddr::V6(src) => Ok(in6_pktinfo {
            ipi6_addr: in6_addr {
                s6_addr: src.octets(),
            },
            ipi6_ifindex: 0,
        }),
        IpAddr::V4(_) => Err(Error::new(
            ErrorKind::InvalidInput,
            "passed an IPv4 source address to an IPv6 socket",
        )),
    }
}

#[cfg(target_os = "linux")]
fn make_in_pktinfo(src: IpAddr) -> io::Result<in_pktinfo> {
    match src {
        IpAddr::V4(src) => Ok(in_pktinfo {
            ipi_ifindex: 0,
            ipi_spec_dst: in_addr {
                s_addr: u32::from(src).to_be(),
            },
            ipi_addr: in_addr { s_addr: 0 },
        }),
        IpAddr::V6(_) => Err(Error::new(
            ErrorKind::InvalidInput,
            "passed an IPv6 source address to an IPv4 socket",
        )),
    }
}

#[cfg(not(target_os = "linux"))]
fn make_in_addr(src: IpAddr) -> io::Result<in_addr> {
    match src {
        IpAddr::V4(src) => Ok(in_addr {
            s_addr: u32::from(src).to_be(),
        }),
        IpAddr::V6(_) => Err(Error::new(
            ErrorKind::InvalidInput,
            "passed an IPv6 source address to an IPv4 socket",
        )),
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockets_round_trip_datagrams_with_pktinfo() {
        let mut server = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut client = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let server_addr = server.local_addr().unwrap();
        let client_addr = client.local_addr().unwrap();

        client
            .send(b"ping", server_addr, "127.0.0.1".parse().unwrap())
            .unwrap();

        let mut buf = [0u8; 64];
        let (len, src, dest) = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(src, client_addr);
        assert_eq!(dest, "127.0.0.1".parse::<IpAddr>().unwrap());

        // Reply from the address the query was received on.
        server.send(b"pong", src, dest).unwrap();
        let (len, from, _) = client.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"pong");
        assert_eq!(from, server_addr);
    }
}
