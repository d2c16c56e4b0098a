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

//! The per-worker datagram serving loop.
//!
//! Each worker thread owns its listening descriptors, its bump arena,
//! and its handler state; nothing here is shared between workers
//! except the zone database's snapshot pointer. One loop iteration is
//! one batch: poll the descriptors (bounded timeout, so cancellation
//! is observed promptly), pull a batch of datagrams, handle each one,
//! flush the replies with one batched send, rewind the arena, and run
//! the handler's sweep hook.
//!
//! The same loop serves plain UDP and QUIC; the difference is the
//! [`DatagramHandler`] plugged into it.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bumpalo::Bump;
use log::{debug, error};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::config::PipelineConfig;
use crate::layer::{serve_one, OutPacket, State};
use crate::server::{QueryFlags, QueryProcessor, ReceivedInfo, Transport};
use crate::thread::WorkerGroup;
use crate::zone::db::ZoneDb;

use super::batch::MmsgRing;
use super::socket::UdpSocket;

////////////////////////////////////////////////////////////////////////
// DATAGRAM HANDLERS                                                  //
////////////////////////////////////////////////////////////////////////

/// Per-worker handling of received datagrams.
///
/// The pipeline owns transport mechanics (batching, addressing,
/// arenas); a handler turns one received datagram into at most one
/// reply datagram. The plain-UDP handler resolves queries directly;
/// the QUIC handler demultiplexes into its connection table first.
pub trait DatagramHandler {
    /// Handles one datagram, writing any reply into `reply` and
    /// returning its length (zero for no reply).
    fn handle(&mut self, wire: &[u8], source: SocketAddr, reply: &mut [u8]) -> usize;

    /// Runs between batches; transports with long-lived state (QUIC)
    /// expire it here.
    fn sweep(&mut self) {}
}

/// The classic UDP handler: every datagram is one DNS query.
pub struct UdpHandler {
    db: Arc<ZoneDb>,
}

impl UdpHandler {
    pub fn new(db: Arc<ZoneDb>) -> Self {
        Self { db }
    }
}

impl DatagramHandler for UdpHandler {
    fn handle(&mut self, wire: &[u8], source: SocketAddr, reply: &mut [u8]) -> usize {
        // The lease is taken only now that the datagram is in hand,
        // and dropped before the batch is flushed to the socket; it is
        // never held across a syscall.
        let lease = self.db.lease();
        let info = ReceivedInfo::new(source, Transport::Udp);
        let flags = QueryFlags::NO_AXFR
            .union(QueryFlags::NO_IXFR)
            .union(QueryFlags::LIMIT_SIZE);
        let mut processor = QueryProcessor::new(&lease, info, flags);
        let mut out = OutPacket::new(reply);
        let state = serve_one(&mut processor, wire, &mut out);
        if state == State::Done {
            out.len()
        } else {
            0
        }
    }
}

////////////////////////////////////////////////////////////////////////
// THE WORKER LOOP                                                    //
////////////////////////////////////////////////////////////////////////

/// Runs one worker's receive→handle→send loop until `cancel` is set.
///
/// Transport errors never abort the loop: a failed receive or send on
/// one descriptor is logged and the worker moves on, since the error
/// is almost always per-datagram (the fd set only shrinks if the
/// enclosing process closes a socket).
pub fn run_worker<H: DatagramHandler>(
    sockets: &[UdpSocket],
    config: &PipelineConfig,
    cancel: &AtomicBool,
    handler: &mut H,
) -> io::Result<()> {
    if sockets.is_empty() {
        return Ok(());
    }
    let mut arena = Bump::new();
    let poll_timeout_ms = config.poll_timeout().as_millis() as libc::c_int;
    let poll_timeout = PollTimeout::try_from(poll_timeout_ms as i128).unwrap();

    loop {
        if cancel.load(Ordering::Relaxed) {
            return Ok(());
        }

        let mut pollfds: Vec<PollFd> = sockets
            .iter()
            .map(|socket| {
                PollFd::new(
                    unsafe { BorrowedFd::borrow_raw(socket.as_raw_fd()) },
                    PollFlags::POLLIN,
                )
            })
            .collect();
        match poll(&mut pollfds, poll_timeout) {
            Ok(0) => {
                handler.sweep();
                continue;
            }
            Ok(_) => (),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
        let ready: Vec<usize> = pollfds
            .iter()
            .enumerate()
            .filter(|(_, pollfd)| {
                pollfd
                    .revents()
                    .map_or(false, |revents| revents.contains(PollFlags::POLLIN))
            })
            .map(|(index, _)| index)
            .collect();
        drop(pollfds);

        for index in ready {
            let fd = sockets[index].as_raw_fd();
            let mut ring = MmsgRing::new_in(&arena, config.batch_size);
            match ring.recv(fd) {
                Ok(0) => continue,
                Ok(n) => {
                    for i in 0..n {
                        let reply_len = match ring.datagram(i) {
                            Ok((wire, source)) => {
                                let wire_len = wire.len();
                                let (rx, tx) = ring.exchange(i, wire_len);
                                handler.handle(rx, source, tx)
                            }
                            Err(e) => {
                                debug!("dropping datagram with bad address: {}", e);
                                0
                            }
                        };
                        ring.set_reply_len(i, reply_len);
                    }
                    if let Err(e) = ring.send(fd) {
                        error!("batched send failed: {}", e);
                    }
                }
                Err(e) => error!("batched receive failed: {}", e),
            }
        }

        arena.reset();
        handler.sweep();
    }
}

////////////////////////////////////////////////////////////////////////
// WORKER SPAWNING                                                    //
////////////////////////////////////////////////////////////////////////

/// Starts one UDP worker thread per descriptor set.
///
/// `worker_fds` holds, for each worker, the already-bound descriptors
/// that worker owns (typically one per interface, bound with
/// `SO_REUSEPORT` by the enclosing process).
pub fn start_udp_workers(
    group: &WorkerGroup,
    db: &Arc<ZoneDb>,
    config: &PipelineConfig,
    worker_fds: Vec<Vec<OwnedFd>>,
) -> io::Result<()> {
    for (worker_id, fds) in worker_fds.into_iter().enumerate() {
        let mut sockets = Vec::with_capacity(fds.len());
        for fd in fds {
            sockets.push(UdpSocket::from_fd(fd)?);
        }
        let db = db.clone();
        let config = config.clone();
        group.spawn(format!("udp worker {}", worker_id), move |cancel| {
            let mut handler = UdpHandler::new(db);
            run_worker(&sockets, &config, cancel, &mut handler)
        })?;
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::time::Duration;

    use super::*;
    use crate::class::Class;
    use crate::message::{Question, Reader, Writer};
    use crate::name::Name;
    use crate::rr::{Rdata, Ttl, Type};
    use crate::zone::set::ZoneSet;
    use crate::zone::Zone;

    fn test_db() -> Arc<ZoneDb> {
        let apex: Name = "example.".parse().unwrap();
        let mut zone = Zone::new(apex.clone(), Class::IN);
        let mut soa = Vec::new();
        soa.extend_from_slice(b"\x03ns1\x07example\x00");
        soa.extend_from_slice(b"\x05admin\x07example\x00");
        soa.extend_from_slice(&[0; 20]);
        zone.add(
            &apex,
            Type::SOA,
            Ttl::from(3600),
            <&Rdata>::try_from(soa.as_slice()).unwrap(),
        )
        .unwrap();
        zone.add(
            &"a.example.".parse().unwrap(),
            Type::A,
            Ttl::from(300),
            <&Rdata>::try_from(&[192, 0, 2, 1][..]).unwrap(),
        )
        .unwrap();
        let mut set = ZoneSet::new();
        set.insert(zone).unwrap();
        Arc::new(ZoneDb::new(set))
    }

    #[test]
    fn a_worker_serves_queries_end_to_end() {
        let db = test_db();
        let server = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let server_addr = server.local_addr().unwrap();

        let group = WorkerGroup::new();
        let config = PipelineConfig {
            poll_timeout_ms: 50,
            ..Default::default()
        };
        group
            .spawn("test udp worker".to_owned(), move |cancel| {
                let mut handler = UdpHandler::new(db);
                run_worker(&[server], &config, cancel, &mut handler)
            })
            .unwrap();

        // Ask for a.example. A over the loopback.
        let mut query = vec![0u8; 512];
        let mut writer = Writer::new(&mut query, 512).unwrap();
        writer.set_id(0x7777);
        writer
            .add_question(&Question {
                qname: "a.example.".parse().unwrap(),
                qtype: Type::A.into(),
                qclass: Class::IN.into(),
            })
            .unwrap();
        let query_len = writer.finish();

        let mut client = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let local: IpAddr = "127.0.0.1".parse().unwrap();
        client
            .send(&query[..query_len], server_addr, local)
            .unwrap();

        let mut response = [0u8; 512];
        let (len, from, _) = client.recv(&mut response).unwrap();
        assert_eq!(from, server_addr);
        let mut reader = Reader::try_from(&response[..len]).unwrap();
        assert_eq!(reader.id(), 0x7777);
        assert!(reader.qr());
        assert_eq!(reader.ancount(), 1);
        reader.read_question().unwrap();
        let rr = reader.read_rr().unwrap();
        assert_eq!(rr.rdata.octets(), &[192, 0, 2, 1]);

        group.shut_down();
    }
}
