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

//! The batched receive/send ring used by the datagram pipeline.
//!
//! A [`MmsgRing`] owns, for one batch, the receive and transmit
//! buffers, the address and control-message storage, and the
//! `mmsghdr` arrays describing them. On Linux a whole batch is pulled
//! in with one `recvmmsg` call and flushed with one `sendmmsg` call;
//! elsewhere the same interface is backed by `recvmsg`/`sendmsg`
//! loops.
//!
//! Every buffer is allocated from the worker's bump arena, so the ring
//! must be dropped before the arena is rewound at the batch boundary;
//! the borrow checker enforces exactly that. The arena retains its
//! chunks across rewinds, so steady-state batches allocate nothing
//! from the system.
//!
//! Replies carry the PKTINFO control data of the datagram they answer,
//! with the interface index cleared (so the kernel honors its routing
//! tables) and the source address pinned to the received destination.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;
use std::ptr;

use bumpalo::Bump;

/// The maximum size of a received or sent datagram.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Room for one PKTINFO control message (IPv4 or IPv6 flavor), with
/// `cmsghdr` alignment. 64 octets comfortably covers
/// `CMSG_SPACE(sizeof(struct in6_pktinfo))` on the supported targets.
const CMSG_BUF_SIZE: usize = 64;

#[repr(C, align(8))]
#[derive(Clone, Copy)]
struct CmsgBuf([u8; CMSG_BUF_SIZE]);

/// One batch worth of datagram I/O state.
pub struct MmsgRing<'a> {
    batch: usize,
    received: usize,
    rx_msgs: &'a mut [libc::mmsghdr],
    tx_msgs: &'a mut [libc::mmsghdr],
    rx_iovs: &'a mut [libc::iovec],
    tx_iovs: &'a mut [libc::iovec],
    addrs: &'a mut [libc::sockaddr_storage],
    cmsgs: &'a mut [CmsgBuf],
    rx_bufs: &'a mut [u8],
    tx_bufs: &'a mut [u8],
}

impl<'a> MmsgRing<'a> {
    /// Builds a ring for up to `batch` datagrams, with all storage
    /// taken from `arena`.
    pub fn new_in(arena: &'a Bump, batch: usize) -> Self {
        assert!(batch > 0);
        // SAFETY: all of these are plain-old-data C structs for which
        // the all-zeroes bit pattern is valid.
        let rx_msgs = arena
            .alloc_slice_fill_with(batch, |_| unsafe { mem::zeroed::<libc::mmsghdr>() });
        let tx_msgs = arena
            .alloc_slice_fill_with(batch, |_| unsafe { mem::zeroed::<libc::mmsghdr>() });
        let rx_iovs =
            arena.alloc_slice_fill_with(batch, |_| unsafe { mem::zeroed::<libc::iovec>() });
        let tx_iovs =
            arena.alloc_slice_fill_with(batch, |_| unsafe { mem::zeroed::<libc::iovec>() });
        let addrs = arena.alloc_slice_fill_with(batch, |_| unsafe {
            mem::zeroed::<libc::sockaddr_storage>()
        });
        let cmsgs = arena.alloc_slice_fill_with(batch, |_| CmsgBuf([0; CMSG_BUF_SIZE]));
        let rx_bufs = arena.alloc_slice_fill_copy(batch * MAX_DATAGRAM_SIZE, 0u8);
        let tx_bufs = arena.alloc_slice_fill_copy(batch * MAX_DATAGRAM_SIZE, 0u8);

        let mut ring = Self {
            batch,
            received: 0,
            rx_msgs,
            tx_msgs,
            rx_iovs,
            tx_iovs,
            addrs,
            cmsgs,
            rx_bufs,
            tx_bufs,
        };
        for i in 0..batch {
            ring.rx_iovs[i] = libc::iovec {
                iov_base: ring.rx_bufs[i * MAX_DATAGRAM_SIZE..].as_mut_ptr().cast(),
                iov_len: MAX_DATAGRAM_SIZE,
            };
            ring.tx_iovs[i] = libc::iovec {
                iov_base: ring.tx_bufs[i * MAX_DATAGRAM_SIZE..].as_mut_ptr().cast(),
                iov_len: 0,
            };
            let addr_ptr: *mut libc::sockaddr_storage = &mut ring.addrs[i];
            let hdr = &mut ring.rx_msgs[i].msg_hdr;
            hdr.msg_name = addr_ptr.cast();
            hdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            hdr.msg_iov = &mut ring.rx_iovs[i];
            hdr.msg_iovlen = 1;
            hdr.msg_control = ring.cmsgs[i].0.as_mut_ptr().cast();
            hdr.msg_controllen = CMSG_BUF_SIZE as _;
            let hdr = &mut ring.tx_msgs[i].msg_hdr;
            hdr.msg_name = addr_ptr.cast();
            hdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            hdr.msg_iov = &mut ring.tx_iovs[i];
            hdr.msg_iovlen = 1;
        }
        ring
    }

    /// Receives up to one batch of datagrams from `fd` without
    /// blocking. Returns the number received; zero means the socket
    /// had nothing ready.
    pub fn recv(&mut self, fd: RawFd) -> io::Result<usize> {
        for i in 0..self.batch {
            self.rx_iovs[i].iov_len = MAX_DATAGRAM_SIZE;
            self.rx_msgs[i].msg_hdr.msg_namelen =
                mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            self.rx_msgs[i].msg_hdr.msg_controllen = CMSG_BUF_SIZE as _;
            self.tx_iovs[i].iov_len = 0;
        }
        self.received = 0;

        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                // SAFETY: the mmsghdr array and everything it points to
                // live in this ring and stay valid for the call.
                let n = unsafe {
                    libc::recvmmsg(
                        fd,
                        self.rx_msgs.as_mut_ptr(),
                        self.batch as libc::c_uint,
                        libc::MSG_DONTWAIT,
                        ptr::null_mut(),
                    )
                };
                if n < 0 {
                    let err = io::Error::last_os_error();
                    return match err.kind() {
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(0),
                        _ => Err(err),
                    };
                }
                self.received = n as usize;
            } else {
                while self.received < self.batch {
                    let i = self.received;
                    // SAFETY: as above; one message at a time.
                    let n = unsafe {
                        libc::recvmsg(fd, &mut self.rx_msgs[i].msg_hdr, libc::MSG_DONTWAIT)
                    };
                    if n < 0 {
                        let err = io::Error::last_os_error();
                        match err.kind() {
                            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => break,
                            _ => return Err(err),
                        }
                    }
                    self.rx_msgs[i].msg_len = n as libc::c_uint;
                    self.received += 1;
                }
            }
        }
        Ok(self.received)
    }

    /// Returns the number of datagrams received by the last
    /// [`MmsgRing::recv`].
    pub fn received(&self) -> usize {
        self.received
    }

    /// Returns the `i`th received datagram and its source address.
    pub fn datagram(&self, i: usize) -> io::Result<(&[u8], SocketAddr)> {
        assert!(i < self.received);
        let len = self.rx_msgs[i].msg_len as usize;
        let start = i * MAX_DATAGRAM_SIZE;
        let source = storage_to_addr(&self.addrs[i])?;
        Ok((&self.rx_bufs[start..start + len], source))
    }

    /// Returns the `i`th transmit buffer for a reply to be written
    /// into.
    pub fn reply_buf(&mut self, i: usize) -> &mut [u8] {
        assert!(i < self.received);
        let start = i * MAX_DATAGRAM_SIZE;
        &mut self.tx_bufs[start..start + MAX_DATAGRAM_SIZE]
    }

    /// Returns the `i`th received datagram (its first `wire_len`
    /// octets) together with its transmit buffer, so a handler can
    /// parse and reply without copying.
    pub fn exchange(&mut self, i: usize, wire_len: usize) -> (&[u8], &mut [u8]) {
        assert!(i < self.received);
        debug_assert_eq!(wire_len, self.rx_msgs[i].msg_len as usize);
        let start = i * MAX_DATAGRAM_SIZE;
        let rx = &self.rx_bufs[start..start + wire_len];
        let tx = &mut self.tx_bufs[start..start + MAX_DATAGRAM_SIZE];
        (rx, tx)
    }

    /// Records that the reply to datagram `i` occupies `len` octets of
    /// its transmit buffer (zero means no reply), and attaches the
    /// received control data — interface index cleared, source pinned
    /// to the received destination — to the outgoing message.
    pub fn set_reply_len(&mut self, i: usize, len: usize) {
        assert!(i < self.received);
        assert!(len <= MAX_DATAGRAM_SIZE);
        self.tx_iovs[i].iov_len = len;
        if len == 0 {
            return;
        }
        let rx_controllen = self.rx_msgs[i].msg_hdr.msg_controllen;
        let tx = &mut self.tx_msgs[i].msg_hdr;
        tx.msg_namelen = self.rx_msgs[i].msg_hdr.msg_namelen;
        if rx_controllen as usize > 0 {
            tx.msg_control = self.cmsgs[i].0.as_mut_ptr().cast();
            tx.msg_controllen = rx_controllen;
            // SAFETY: msg_control points into this ring's cmsg buffer,
            // which recvmsg filled with a valid control message.
            unsafe { clear_pktinfo_ifindex(tx) };
        } else {
            tx.msg_control = ptr::null_mut();
            tx.msg_controllen = 0;
        }
    }

    /// Sends every non-empty reply with as few syscalls as the target
    /// allows. Sends may block under backpressure.
    pub fn send(&mut self, fd: RawFd) -> io::Result<()> {
        // Compact the non-empty replies to the front of the transmit
        // array. The copied mmsghdrs keep pointing at their own iovecs
        // and buffers.
        let mut pending = 0;
        for i in 0..self.received {
            if self.tx_iovs[i].iov_len > 0 {
                self.tx_msgs[pending] = self.tx_msgs[i];
                pending += 1;
            }
        }

        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                let mut sent = 0;
                while sent < pending {
                    // SAFETY: the compacted prefix of tx_msgs is fully
                    // initialized and owned by this ring.
                    let n = unsafe {
                        libc::sendmmsg(
                            fd,
                            self.tx_msgs[sent..].as_mut_ptr(),
                            (pending - sent) as libc::c_uint,
                            0,
                        )
                    };
                    if n < 0 {
                        let err = io::Error::last_os_error();
                        if err.kind() == io::ErrorKind::Interrupted {
                            continue;
                        }
                        return Err(err);
                    }
                    sent += n as usize;
                }
            } else {
                for i in 0..pending {
                    loop {
                        // SAFETY: as above.
                        let n = unsafe { libc::sendmsg(fd, &self.tx_msgs[i].msg_hdr, 0) };
                        if n >= 0 {
                            break;
                        }
                        let err = io::Error::last_os_error();
                        if err.kind() != io::ErrorKind::Interrupted {
                            return Err(err);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////
// CONTROL AND ADDRESS HELPERS                                        //
////////////////////////////////////////////////////////////////////////

/// Rewrites the PKTINFO control message in `msg` for transmission:
/// the source address becomes the address the query arrived on, and
/// the interface index is zeroed so the kernel still routes normally.
///
/// # Safety
///
/// `msg.msg_control` must point to a valid control buffer of
/// `msg.msg_controllen` octets.
unsafe fn clear_pktinfo_ifindex(msg: &mut libc::msghdr) {
    let cmsg = libc::CMSG_FIRSTHDR(msg);
    if cmsg.is_null() {
        return;
    }
    if (*cmsg).cmsg_level == libc::IPPROTO_IP && (*cmsg).cmsg_type == libc::IP_PKTINFO {
        #[cfg(target_os = "linux")]
        {
            let info = libc::CMSG_DATA(cmsg) as *mut libc::in_pktinfo;
            (*info).ipi_spec_dst = (*info).ipi_addr;
            (*info).ipi_ifindex = 0;
        }
    } else if (*cmsg).cmsg_level == libc::IPPROTO_IPV6
        && (*cmsg).cmsg_type == libc::IPV6_PKTINFO
    {
        let info = libc::CMSG_DATA(cmsg) as *mut libc::in6_pktinfo;
        (*info).ipi6_ifindex = 0;
    }
}

/// Converts a raw `sockaddr_storage` into a [`SocketAddr`].
fn storage_to_addr(ss: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match ss.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: the family says this storage holds a sockaddr_in.
            let sin = unsafe { &*(ss as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            // SAFETY: the family says this storage holds a sockaddr_in6.
            let sin6 =
                unsafe { &*(ss as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::Other,
            format!("unexpected address family {}", family),
        )),
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use super::super::socket::UdpSocket;
    use super::*;

    #[test]
    fn ring_receives_and_echoes_a_batch() {
        let server = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut client = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let server_addr = server.local_addr().unwrap();
        let client_addr = client.local_addr().unwrap();
        let local: std::net::IpAddr = "127.0.0.1".parse().unwrap();

        for i in 0..3u8 {
            client.send(&[b'm', i], server_addr, local).unwrap();
        }
        // Give the datagrams a moment to land in the receive queue.
        std::thread::sleep(std::time::Duration::from_millis(50));

        let arena = Bump::new();
        let mut ring = MmsgRing::new_in(&arena, 8);
        let n = ring.recv(server.as_raw_fd()).unwrap();
        assert_eq!(n, 3);

        for i in 0..n {
            let (payload, source) = ring.datagram(i).unwrap();
            assert_eq!(source, client_addr);
            let reply = [payload[0], payload[1], b'!'];
            ring.reply_buf(i)[..3].copy_from_slice(&reply);
            ring.set_reply_len(i, 3);
        }
        ring.send(server.as_raw_fd()).unwrap();

        let mut buf = [0u8; 16];
        for i in 0..3u8 {
            let (len, from, _) = client.recv(&mut buf).unwrap();
            assert_eq!(from, server_addr);
            assert_eq!(&buf[..len], &[b'm', i, b'!']);
        }
    }

    #[test]
    fn empty_replies_are_not_sent() {
        let server = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut client = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let server_addr = server.local_addr().unwrap();
        let local: std::net::IpAddr = "127.0.0.1".parse().unwrap();

        client.send(b"drop-me", server_addr, local).unwrap();
        client.send(b"answer-me", server_addr, local).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));

        let arena = Bump::new();
        let mut ring = MmsgRing::new_in(&arena, 8);
        let n = ring.recv(server.as_raw_fd()).unwrap();
        assert_eq!(n, 2);
        for i in 0..n {
            let (payload, _) = ring.datagram(i).unwrap();
            if payload == b"answer-me" {
                ring.reply_buf(i)[..2].copy_from_slice(b"ok");
                ring.set_reply_len(i, 2);
            } else {
                ring.set_reply_len(i, 0);
            }
        }
        ring.send(server.as_raw_fd()).unwrap();

        client
            .set_read_timeout(Some(std::time::Duration::from_millis(500)))
            .unwrap();
        let mut buf = [0u8; 16];
        let (len, _, _) = client.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ok");
        assert!(client.recv(&mut buf).is_err());
    }
}
