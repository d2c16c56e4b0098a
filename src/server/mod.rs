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

//! The server-side query-processing layer.
//!
//! The [`QueryProcessor`] is the [`Layer`] implementation that turns a
//! received DNS query into an authoritative response. An I/O provider
//! (the datagram pipeline, the QUIC demultiplexer) constructs one per
//! received message — with the transport metadata, the policy flags,
//! and a view of the zone snapshot its lease pins — and drives it with
//! [`serve_one`](crate::layer::serve_one).

use std::net::SocketAddr;

use crate::layer::{Layer, OutPacket, State};
use crate::message::Reader;
use crate::message::{
    ExtendedRcode, Opcode, Qclass, Qtype, Question, Rcode, Writer, CLASSIC_UDP_LIMIT,
    MAX_MESSAGE_SIZE,
};
use crate::rr::Type;
use crate::zone::set::ZoneSet;

mod answer;

////////////////////////////////////////////////////////////////////////
// TRANSPORT METADATA AND POLICY FLAGS                                //
////////////////////////////////////////////////////////////////////////

/// Indicates the transport through which a DNS message was received.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Transport {
    Udp,
    Tcp,
    Quic,
}

impl Transport {
    /// Returns whether responses on this transport are subject to the
    /// datagram size ceiling and TC-bit truncation. Stream transports
    /// (TCP, and QUIC per [RFC 9250 § 4.3]) are not.
    ///
    /// [RFC 9250 § 4.3]: https://datatracker.ietf.org/doc/html/rfc9250#section-4.3
    fn is_size_limited(self) -> bool {
        matches!(self, Self::Udp)
    }
}

/// Network-related information about a received DNS message.
#[derive(Clone, Copy, Debug)]
pub struct ReceivedInfo {
    pub source: SocketAddr,
    pub transport: Transport,
}

impl ReceivedInfo {
    pub fn new(source: SocketAddr, transport: Transport) -> Self {
        Self { source, transport }
    }
}

/// Per-query policy flags set by the I/O provider.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct QueryFlags(u8);

impl QueryFlags {
    /// Refuse AXFR queries with NOTIMP.
    pub const NO_AXFR: Self = Self(1 << 0);

    /// Refuse IXFR queries with NOTIMP.
    pub const NO_IXFR: Self = Self(1 << 1);

    /// Enforce the datagram size ceiling (the negotiated EDNS payload
    /// size, or the classic 512-octet limit).
    pub const LIMIT_SIZE: Self = Self(1 << 2);

    /// Returns whether all flags in `other` are set in `self`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the union of two flag sets.
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

////////////////////////////////////////////////////////////////////////
// QUERY PROCESSOR                                                    //
////////////////////////////////////////////////////////////////////////

/// The server-side [`Layer`]: consumes one query, produces one
/// authoritative response.
pub struct QueryProcessor<'z> {
    zones: &'z ZoneSet,
    info: ReceivedInfo,
    flags: QueryFlags,

    // Per-query state recorded by consume for produce:
    id: u16,
    opcode: Opcode,
    rd: bool,
    question: Option<Question>,
    edns: Option<EdnsRequest>,
    plan: Plan,
}

/// What a received EDNS OPT record asked for.
#[derive(Clone, Copy, Debug)]
struct EdnsRequest {
    payload_size: u16,
    version: u8,
}

/// The disposition that `consume` decided on, executed by `produce`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Plan {
    /// Nothing was consumed yet, or the message is to be ignored.
    Ignore,

    /// Respond with a fixed RCODE and no answer data.
    Refuse(Rcode),

    /// Respond with BADVERS (the OPT asked for an EDNS version we do
    /// not implement).
    BadVersion,

    /// Resolve the question against the zone set.
    Answer,
}

impl<'z> QueryProcessor<'z> {
    /// Creates a `QueryProcessor` for one received message. `zones` is
    /// the view pinned by the caller's read-side lease.
    pub fn new(zones: &'z ZoneSet, info: ReceivedInfo, flags: QueryFlags) -> Self {
        Self {
            zones,
            info,
            flags,
            id: 0,
            opcode: Opcode::QUERY,
            rd: false,
            question: None,
            edns: None,
            plan: Plan::Ignore,
        }
    }

    /// Examines the received message and decides the response plan.
    fn classify(&mut self, wire: &[u8]) -> State {
        let mut received = match Reader::try_from(wire) {
            Ok(received) => received,
            // Without a full header there is nothing to respond to.
            Err(_) => return State::Done,
        };

        // Ignore messages that are responses.
        if received.qr() {
            return State::Done;
        }

        self.id = received.id();
        self.opcode = received.opcode();
        self.rd = received.rd();

        // Read the question, if any. Most implementations ignore
        // messages with QDCOUNT > 1, and so do we.
        match received.qdcount() {
            0 => (),
            1 => match received.read_question() {
                Ok(question) => self.question = Some(question),
                Err(_) => {
                    self.plan = Plan::Refuse(Rcode::FORMERR);
                    return State::Fail;
                }
            },
            _ => return State::Done,
        }

        // Scan the remaining records for pseudo-RRs without parsing
        // (or decompressing) the ones we do not care about. An OPT
        // outside the additional section is a FORMERR (RFC 6891
        // § 6.1.1), as is more than one OPT.
        let an_plus_ns = received.ancount() as usize + received.nscount() as usize;
        for _ in 0..an_plus_ns {
            match received.peek_rr() {
                Ok(peeked) if peeked.rr_type() == Type::OPT => {
                    self.plan = Plan::Refuse(Rcode::FORMERR);
                    return State::Fail;
                }
                Ok(peeked) => peeked.skip(),
                Err(_) => {
                    self.plan = Plan::Refuse(Rcode::FORMERR);
                    return State::Fail;
                }
            }
        }
        for _ in 0..received.arcount() as usize {
            let peeked = match received.peek_rr() {
                Ok(peeked) => peeked,
                Err(_) => {
                    self.plan = Plan::Refuse(Rcode::FORMERR);
                    return State::Fail;
                }
            };
            if peeked.rr_type() != Type::OPT {
                peeked.skip();
                continue;
            }
            if self.edns.is_some() {
                self.plan = Plan::Refuse(Rcode::FORMERR);
                return State::Fail;
            }
            let opt = match peeked.parse() {
                Ok(opt) => opt,
                Err(_) => {
                    // Once an OPT has been seen we answer with EDNS,
                    // even if the record is invalid (RFC 6891 § 7).
                    self.edns = Some(EdnsRequest {
                        payload_size: CLASSIC_UDP_LIMIT as u16,
                        version: 0,
                    });
                    self.plan = Plan::Refuse(Rcode::FORMERR);
                    return State::Fail;
                }
            };
            if !opt.owner.is_root() {
                self.edns = Some(EdnsRequest {
                    payload_size: CLASSIC_UDP_LIMIT as u16,
                    version: 0,
                });
                self.plan = Plan::Refuse(Rcode::FORMERR);
                return State::Fail;
            }
            self.edns = Some(EdnsRequest {
                payload_size: u16::from(opt.class),
                version: (opt.ttl_raw >> 16) as u8,
            });
        }

        if !received.at_eom() {
            self.plan = Plan::Refuse(Rcode::FORMERR);
            return State::Fail;
        }

        if let Some(ref edns) = self.edns {
            if edns.version != 0 {
                self.plan = Plan::BadVersion;
                return State::Fail;
            }
        }

        match self.opcode {
            Opcode::QUERY => self.classify_query(),
            _ => {
                self.plan = Plan::Refuse(Rcode::NOTIMP);
                State::Produce
            }
        }
    }

    /// Applies the policy checks specific to opcode QUERY.
    fn classify_query(&mut self) -> State {
        let question = match self.question {
            Some(ref question) => question,
            None => {
                self.plan = Plan::Refuse(Rcode::FORMERR);
                return State::Fail;
            }
        };

        let refused_transfer = (question.qtype == Qtype::AXFR
            && (self.flags.contains(QueryFlags::NO_AXFR)
                || self.info.transport.is_size_limited()))
            || (question.qtype == Qtype::IXFR && self.flags.contains(QueryFlags::NO_IXFR));
        // ANY is refused rather than answered (cf. RFC 8482); the
        // obsolete MAIL* QTYPEs were never implemented.
        if refused_transfer
            || matches!(
                question.qtype,
                Qtype::ANY | Qtype::MAILA | Qtype::MAILB
            )
            || question.qclass == Qclass::ANY
        {
            self.plan = Plan::Refuse(Rcode::NOTIMP);
            return State::Produce;
        }

        self.plan = Plan::Answer;
        State::Produce
    }

    /// The message size limit for the response.
    fn response_limit(&self, buf_len: usize) -> usize {
        if !self.info.transport.is_size_limited() {
            return MAX_MESSAGE_SIZE.min(buf_len);
        }
        let ceiling = if self.flags.contains(QueryFlags::LIMIT_SIZE) {
            match self.edns {
                Some(ref edns) => (edns.payload_size as usize).max(CLASSIC_UDP_LIMIT),
                None => CLASSIC_UDP_LIMIT,
            }
        } else {
            CLASSIC_UDP_LIMIT
        };
        ceiling.min(buf_len)
    }
}

impl Layer for QueryProcessor<'_> {
    fn begin(&mut self) -> State {
        State::Consume
    }

    fn consume(&mut self, wire: &[u8]) -> State {
        self.classify(wire)
    }

    fn produce(&mut self, out: &mut OutPacket<'_>) -> State {
        if self.plan == Plan::Ignore {
            return State::Done;
        }

        let limit = self.response_limit(out.buf().len());
        let mut response = match Writer::new(out.buf(), limit) {
            Ok(response) => response,
            Err(_) => return State::Done,
        };
        response.set_id(self.id);
        response.set_qr(true);
        response.set_opcode(self.opcode);
        if self.opcode == Opcode::QUERY {
            // RD is only defined for opcode QUERY; do not copy it
            // otherwise.
            response.set_rd(self.rd);
        }

        if let Some(ref question) = self.question {
            if response.add_question(question).is_err() {
                response.set_rcode(Rcode::SERVFAIL);
                let len = response.finish();
                out.set_len(len);
                return State::Done;
            }
        }

        // Once the request carried an OPT, the response does too,
        // advertising the size we negotiated.
        if let Some(ref edns) = self.edns {
            let negotiated = (edns.payload_size).max(CLASSIC_UDP_LIMIT as u16);
            if response.set_edns(negotiated).is_err() {
                response.set_rcode(Rcode::SERVFAIL);
                let len = response.finish();
                out.set_len(len);
                return State::Done;
            }
        }

        match self.plan {
            Plan::Ignore => unreachable!(),
            Plan::Refuse(rcode) => response.set_rcode(rcode),
            Plan::BadVersion => {
                // set_edns succeeded above, so this cannot fail.
                response
                    .set_extended_rcode(ExtendedRcode::BADVERS)
                    .expect("BADVERS requires EDNS");
            }
            Plan::Answer => {
                let question = self.question.as_ref().unwrap();
                match answer::answer(self.zones, question, &mut response) {
                    Ok(()) => (),
                    Err(answer::ProcessingError::ServFail) => {
                        response.set_aa(false);
                        response.set_rcode(Rcode::SERVFAIL);
                        response.clear_rrs();
                    }
                    Err(answer::ProcessingError::Truncation) => {
                        response.clear_rrs();
                        if self.info.transport.is_size_limited() {
                            response.set_tc(true);
                        } else {
                            // A stream response cannot be retried over
                            // a bigger transport.
                            response.set_aa(false);
                            response.set_rcode(Rcode::SERVFAIL);
                        }
                    }
                }
            }
        }

        let len = response.finish();
        out.set_len(len);
        State::Done
    }

    fn finish(&mut self) {
        self.question = None;
        self.edns = None;
        self.plan = Plan::Ignore;
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests;
