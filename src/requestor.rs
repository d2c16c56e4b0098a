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

//! The outbound request engine.
//!
//! A [`Requestor`] drives a client-side [`Layer`] against a remote
//! peer: `begin`, then `produce → send → receive → consume` until the
//! layer terminates. Each attempt gets the configured timeout, and
//! [`Requestor::try_remote`] walks a remote's addresses in order,
//! stopping at the first successful exchange. NOTIFY is the one layer
//! the core ships (see [`notify`](crate::notify)); the engine itself
//! is layer-agnostic.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use log::debug;

use crate::config::RequestorConfig;
use crate::layer::{Layer, OutPacket, State};
use crate::message::MAX_MESSAGE_SIZE;
use crate::name::Name;

////////////////////////////////////////////////////////////////////////
// REMOTES AND KEYS                                                   //
////////////////////////////////////////////////////////////////////////

/// A TSIG key associated with a remote. The core carries the key with
/// the request; computing and checking signatures belongs to the
/// message-security layer of the enclosing system.
#[derive(Clone, Debug)]
pub struct TsigKey {
    pub name: Name,
    pub algorithm: Name,
    pub secret: Vec<u8>,
}

/// One configured remote peer: its addresses (tried in order), an
/// optional local source address, an optional TSIG key, and transport
/// flags.
#[derive(Clone, Debug, Default)]
pub struct Remote {
    pub addresses: Vec<SocketAddr>,
    pub source: Option<SocketAddr>,
    pub key: Option<TsigKey>,

    /// Exchange over TCP rather than UDP.
    pub use_tcp: bool,

    /// Attempt TCP fast open where the platform supports it.
    pub tcp_fast_open: bool,
}

////////////////////////////////////////////////////////////////////////
// THE REQUESTOR                                                      //
////////////////////////////////////////////////////////////////////////

/// Drives client-side layers against remote peers.
pub struct Requestor {
    config: RequestorConfig,
    next_id: AtomicU16,
}

impl Requestor {
    pub fn new(config: RequestorConfig) -> Self {
        Self {
            config,
            // Message IDs need only be unlikely to collide between
            // outstanding exchanges of one process.
            next_id: AtomicU16::new(std::process::id() as u16),
        }
    }

    /// Returns a message ID for a new exchange.
    pub fn next_message_id(&self) -> u16 {
        self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_mul(49297)
    }

    /// Runs the layer against each address of `remote` in order,
    /// returning on the first address whose exchange completes.
    pub fn try_remote<L: Layer>(&self, layer: &mut L, remote: &Remote) -> Result<(), Error> {
        let mut last_error = Error::NoAddresses;
        for &address in &remote.addresses {
            match self.execute(layer, address, remote) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("request to {} failed: {}", address, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Runs one complete exchange with `dest` under the per-attempt
    /// timeout.
    pub fn execute<L: Layer>(
        &self,
        layer: &mut L,
        dest: SocketAddr,
        remote: &Remote,
    ) -> Result<(), Error> {
        let deadline = Instant::now() + self.config.attempt_timeout();
        let mut transport = if remote.use_tcp {
            Transport::connect_tcp(dest, remote, deadline, &self.config)?
        } else {
            Transport::connect_udp(dest, remote)?
        };

        let mut out_buf = vec![0u8; MAX_MESSAGE_SIZE];
        let mut in_buf = vec![0u8; MAX_MESSAGE_SIZE];
        let mut state = layer.begin();
        let result = loop {
            match state {
                State::Produce | State::Reset => {
                    let mut out = OutPacket::new(&mut out_buf);
                    state = layer.produce(&mut out);
                    if !out.is_empty() {
                        if let Err(e) = transport.send(out.as_slice(), deadline) {
                            break Err(Error::Io(e));
                        }
                    }
                }
                State::Consume => {
                    let received = match transport.recv(&mut in_buf, deadline) {
                        Ok(received) => received,
                        Err(e) => break Err(Error::Io(e)),
                    };
                    state = layer.consume(&in_buf[..received]);
                }
                State::Done => break Ok(()),
                State::Fail => break Err(Error::LayerFailed),
            }
        };
        layer.finish();
        result
    }
}

////////////////////////////////////////////////////////////////////////
// TRANSPORTS                                                         //
////////////////////////////////////////////////////////////////////////

enum Transport {
    Udp(UdpSocket),
    Tcp(TcpStream),
}

impl Transport {
    fn connect_udp(dest: SocketAddr, remote: &Remote) -> Result<Self, Error> {
        let bind_addr = remote.source.unwrap_or_else(|| any_addr(dest));
        let socket = UdpSocket::bind(bind_addr).map_err(Error::Io)?;
        socket.connect(dest).map_err(Error::Io)?;
        Ok(Self::Udp(socket))
    }

    fn connect_tcp(
        dest: SocketAddr,
        remote: &Remote,
        deadline: Instant,
        config: &RequestorConfig,
    ) -> Result<Self, Error> {
        if remote.tcp_fast_open || config.tcp_fast_open {
            #[cfg(target_os = "linux")]
            {
                match connect_tcp_fast_open(dest, remote.source) {
                    Ok(stream) => return Ok(Self::Tcp(stream)),
                    Err(e) => debug!("TCP fast open to {} unavailable: {}", dest, e),
                }
            }
        }
        let timeout = remaining(deadline).ok_or(Error::Timeout)?;
        let stream = TcpStream::connect_timeout(&dest, timeout).map_err(Error::Io)?;
        Ok(Self::Tcp(stream))
    }

    fn send(&mut self, message: &[u8], deadline: Instant) -> io::Result<()> {
        match self {
            Self::Udp(socket) => {
                socket.send(message)?;
                Ok(())
            }
            Self::Tcp(stream) => {
                stream.set_write_timeout(remaining_or_timeout(deadline)?)?;
                stream.write_all(&(message.len() as u16).to_be_bytes())?;
                stream.write_all(message)
            }
        }
    }

    fn recv(&mut self, buf: &mut [u8], deadline: Instant) -> io::Result<usize> {
        match self {
            Self::Udp(socket) => loop {
                socket.set_read_timeout(remaining_or_timeout(deadline)?)?;
                match socket.recv(buf) {
                    Ok(received) => return Ok(received),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            },
            Self::Tcp(stream) => {
                let mut length_prefix = [0u8; 2];
                read_all_by(stream, &mut length_prefix, deadline)?;
                let length = u16::from_be_bytes(length_prefix) as usize;
                read_all_by(stream, &mut buf[..length], deadline)?;
                Ok(length)
            }
        }
    }
}

/// Reads exactly `buf.len()` octets before the deadline.
fn read_all_by(stream: &mut TcpStream, buf: &mut [u8], deadline: Instant) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        stream.set_read_timeout(remaining_or_timeout(deadline)?)?;
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed mid-message",
                ))
            }
            Ok(read) => filled += read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Connects with `TCP_FASTOPEN_CONNECT`, so the request rides in the
/// SYN when the peer cooperates.
#[cfg(target_os = "linux")]
fn connect_tcp_fast_open(dest: SocketAddr, source: Option<SocketAddr>) -> io::Result<TcpStream> {
    use std::os::fd::{FromRawFd, IntoRawFd};

    use nix::sys::socket::{
        bind, connect, setsockopt, socket, sockopt, AddressFamily, SockFlag, SockProtocol,
        SockType, SockaddrStorage,
    };

    let family = if dest.is_ipv6() {
        AddressFamily::Inet6
    } else {
        AddressFamily::Inet
    };
    let fd = socket(
        family,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::Tcp,
    )?
    .into_raw_fd();
    let result = (|| -> nix::Result<()> {
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        setsockopt(&borrowed, sockopt::TcpFastOpenConnect, &true)?;
        if let Some(source) = source {
            bind(fd, &SockaddrStorage::from(source))?;
        }
        connect(fd, &SockaddrStorage::from(dest))
    })();
    match result {
        // SAFETY: the descriptor was just created and is owned here.
        Ok(()) => Ok(unsafe { TcpStream::from_raw_fd(fd) }),
        Err(e) => {
            let _ = nix::unistd::close(fd);
            Err(e.into())
        }
    }
}

fn any_addr(dest: SocketAddr) -> SocketAddr {
    if dest.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    }
}

fn remaining(deadline: Instant) -> Option<Duration> {
    deadline.checked_duration_since(Instant::now())
}

fn remaining_or_timeout(deadline: Instant) -> io::Result<Option<Duration>> {
    match remaining(deadline) {
        Some(timeout) if !timeout.is_zero() => Ok(Some(timeout)),
        _ => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "request attempt timed out",
        )),
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error from an outbound exchange. The caller (the retry harness
/// or the event that scheduled the request) decides what to do next.
#[derive(Debug)]
pub enum Error {
    /// The remote has no addresses configured.
    NoAddresses,

    /// A socket operation failed.
    Io(io::Error),

    /// The attempt deadline passed.
    Timeout,

    /// The layer reached its failure state.
    LayerFailed,

    /// The exchange completed but the peer answered with an error.
    Refused,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NoAddresses => f.write_str("remote has no addresses"),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Timeout => f.write_str("attempt timed out"),
            Self::LayerFailed => f.write_str("layer signaled failure"),
            Self::Refused => f.write_str("peer answered with an error"),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::net::UdpSocket as StdUdpSocket;
    use std::thread;

    use super::*;
    use crate::message::{Opcode, Rcode, Reader};
    use crate::notify::NotifyLayer;

    /// A secondary that answers every NOTIFY with NOERROR.
    fn spawn_fake_secondary() -> SocketAddr {
        let socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        thread::spawn(move || {
            let mut buf = [0u8; 512];
            let (len, from) = socket.recv_from(&mut buf).unwrap();
            let received = Reader::try_from(&buf[..len]).unwrap();
            assert_eq!(received.opcode(), Opcode::NOTIFY);
            let mut reply = [0u8; 12];
            reply[0..2].copy_from_slice(&received.id().to_be_bytes());
            reply[2] = 0x80 | (u8::from(Opcode::NOTIFY) << 3);
            socket.send_to(&reply, from).unwrap();
        });
        addr
    }

    #[test]
    fn a_notify_exchange_completes_over_udp() {
        let secondary = spawn_fake_secondary();
        let requestor = Requestor::new(RequestorConfig::default());
        let zone: Name = "example.".parse().unwrap();
        let mut layer = NotifyLayer::new(&zone, None, requestor.next_message_id());
        let remote = Remote {
            addresses: vec![secondary],
            ..Default::default()
        };
        requestor.try_remote(&mut layer, &remote).unwrap();
        assert!(layer.succeeded());
    }

    #[test]
    fn later_addresses_are_tried_after_a_failure() {
        // First address: a socket nobody answers on (timeout).
        // Second address: a live secondary.
        let dead = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let dead_addr = dead.local_addr().unwrap();
        let live_addr = spawn_fake_secondary();

        let requestor = Requestor::new(RequestorConfig {
            attempt_timeout_ms: 200,
            ..Default::default()
        });
        let zone: Name = "example.".parse().unwrap();
        let mut layer = NotifyLayer::new(&zone, None, requestor.next_message_id());
        let remote = Remote {
            addresses: vec![dead_addr, live_addr],
            ..Default::default()
        };
        requestor.try_remote(&mut layer, &remote).unwrap();
        assert!(layer.succeeded());
    }

    #[test]
    fn an_empty_remote_reports_no_addresses() {
        let requestor = Requestor::new(RequestorConfig::default());
        let zone: Name = "example.".parse().unwrap();
        let mut layer = NotifyLayer::new(&zone, None, 1);
        let remote = Remote::default();
        assert!(matches!(
            requestor.try_remote(&mut layer, &remote),
            Err(Error::NoAddresses),
        ));
    }
}
