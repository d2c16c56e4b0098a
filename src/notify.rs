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

//! Outbound NOTIFY ([RFC 1996]).
//!
//! A primary tells its secondaries that zone data changed by sending a
//! message with opcode NOTIFY, the AA flag, and a question of (zone
//! apex, SOA, IN); the current SOA may ride along in the answer
//! section as an unsecured hint. [`NotifyLayer`] is the client-side
//! [`Layer`] that produces this message and consumes the reply; the
//! [`Requestor`](crate::requestor::Requestor) drives it against each
//! configured secondary.
//!
//! [RFC 1996]: https://datatracker.ietf.org/doc/html/rfc1996

use log::{info, warn};

use crate::class::Class;
use crate::layer::{Layer, OutPacket, State};
use crate::message::{ExtendedRcode, Opcode, Question, Reader, Writer};
use crate::name::Name;
use crate::requestor::{Remote, Requestor};
use crate::rr::{Rrset, Type};

/// The EDNS payload size advertised on outbound requests.
const REQUEST_PAYLOAD_SIZE: u16 = 1232;

////////////////////////////////////////////////////////////////////////
// THE NOTIFY LAYER                                                   //
////////////////////////////////////////////////////////////////////////

/// The client-side layer for one NOTIFY exchange.
pub struct NotifyLayer<'a> {
    zone: &'a Name,
    soa: Option<&'a Rrset>,
    msg_id: u16,
    response_rcode: Option<ExtendedRcode>,
}

impl<'a> NotifyLayer<'a> {
    /// Creates a layer that will announce `zone`, optionally carrying
    /// the current SOA RRset as a hint.
    pub fn new(zone: &'a Name, soa: Option<&'a Rrset>, msg_id: u16) -> Self {
        Self {
            zone,
            soa,
            msg_id,
            response_rcode: None,
        }
    }

    /// Returns the extended RCODE of the consumed response, if one
    /// arrived.
    pub fn response_rcode(&self) -> Option<ExtendedRcode> {
        self.response_rcode
    }

    /// Returns whether the exchange succeeded: the layer completed and
    /// the secondary did not signal an error.
    pub fn succeeded(&self) -> bool {
        self.response_rcode == Some(ExtendedRcode::NOERROR)
    }
}

impl Layer for NotifyLayer<'_> {
    fn begin(&mut self) -> State {
        self.response_rcode = None;
        State::Produce
    }

    fn produce(&mut self, out: &mut OutPacket<'_>) -> State {
        let buf_len = out.buf().len();
        let mut request = match Writer::new(out.buf(), buf_len) {
            Ok(request) => request,
            Err(_) => return State::Fail,
        };
        request.set_id(self.msg_id);
        request.set_opcode(Opcode::NOTIFY);
        request.set_aa(true);
        let question = Question {
            qname: self.zone.clone(),
            qtype: Type::SOA.into(),
            qclass: Class::IN.into(),
        };
        if request.add_question(&question).is_err() {
            return State::Fail;
        }
        if let Some(soa) = self.soa {
            if request.add_answer_rrset(self.zone, Class::IN, soa).is_err() {
                return State::Fail;
            }
        }
        if request.set_edns(REQUEST_PAYLOAD_SIZE).is_err() {
            return State::Fail;
        }
        let len = request.finish();
        out.set_len(len);
        State::Consume
    }

    fn consume(&mut self, wire: &[u8]) -> State {
        let received = match Reader::try_from(wire) {
            Ok(received) => received,
            Err(_) => return State::Fail,
        };
        if !received.qr() || received.id() != self.msg_id {
            return State::Fail;
        }
        // The upper RCODE bits would live in a response OPT; secondary
        // implementations answer NOTIFY without extended RCODEs, so
        // the header RCODE is the whole story here.
        self.response_rcode = Some(received.rcode().into());
        State::Done
    }

    fn finish(&mut self) {}
}

////////////////////////////////////////////////////////////////////////
// THE NOTIFY EVENT                                                   //
////////////////////////////////////////////////////////////////////////

/// The result of notifying one secondary.
#[derive(Debug)]
pub struct NotifyOutcome {
    /// The serial that was announced (from the SOA hint), if known.
    pub serial: Option<u32>,
}

/// Sends a NOTIFY for `zone` to one secondary, trying each of its
/// addresses in order and stopping at the first success.
pub fn send_notify(
    requestor: &Requestor,
    zone: &Name,
    soa: Option<&Rrset>,
    remote: &Remote,
) -> Result<NotifyOutcome, crate::requestor::Error> {
    let serial = soa
        .and_then(Rrset::first_rdata)
        .and_then(|rdata| rdata.soa_serial());
    let mut layer = NotifyLayer::new(zone, soa, requestor.next_message_id());
    requestor.try_remote(&mut layer, remote)?;
    if layer.succeeded() {
        match serial {
            Some(serial) => info!("notified {:?} of zone {} serial {}", remote, zone, serial),
            None => info!("notified {:?} of zone {}", remote, zone),
        }
        Ok(NotifyOutcome { serial })
    } else {
        warn!(
            "secondary {:?} answered NOTIFY for zone {} with {}",
            remote,
            zone,
            layer
                .response_rcode()
                .unwrap_or(ExtendedRcode::SERVFAIL),
        );
        Err(crate::requestor::Error::Refused)
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Rcode;
    use crate::rr::{Rdata, Ttl};

    fn soa_rrset() -> Rrset {
        let mut rdata = Vec::new();
        rdata.extend_from_slice(b"\x03ns1\x07example\x00");
        rdata.extend_from_slice(b"\x05admin\x07example\x00");
        rdata.extend_from_slice(&7u32.to_be_bytes());
        rdata.extend_from_slice(&[0; 16]);
        let mut rrset = Rrset::new(Type::SOA, Ttl::from(3600));
        rrset.push_rdata(<&Rdata>::try_from(rdata.as_slice()).unwrap());
        rrset
    }

    #[test]
    fn produce_builds_a_notify_request() {
        let zone: Name = "example.".parse().unwrap();
        let soa = soa_rrset();
        let mut layer = NotifyLayer::new(&zone, Some(&soa), 0x0bad);
        assert_eq!(layer.begin(), State::Produce);

        let mut buf = [0u8; 512];
        let mut out = OutPacket::new(&mut buf);
        assert_eq!(layer.produce(&mut out), State::Consume);

        let mut reader = Reader::try_from(out.as_slice()).unwrap();
        assert_eq!(reader.id(), 0x0bad);
        assert_eq!(reader.opcode(), Opcode::NOTIFY);
        assert!(reader.aa());
        assert!(!reader.qr());
        assert_eq!(reader.qdcount(), 1);
        assert_eq!(reader.ancount(), 1);
        let question = reader.read_question().unwrap();
        assert_eq!(question.qname, zone);
        assert_eq!(question.qtype, Type::SOA.into());
        let hint = reader.read_rr().unwrap();
        assert_eq!(hint.rr_type, Type::SOA);
        assert_eq!(hint.rdata.soa_serial(), Some(7));
        // The request is EDNS.
        assert_eq!(reader.arcount(), 1);
    }

    #[test]
    fn consume_accepts_a_matching_reply() {
        let zone: Name = "example.".parse().unwrap();
        let mut layer = NotifyLayer::new(&zone, None, 0x1111);
        layer.begin();
        let mut buf = [0u8; 512];
        let mut out = OutPacket::new(&mut buf);
        layer.produce(&mut out);

        // Fabricate a minimal matching reply.
        let mut reply = vec![0u8; 12];
        reply[0..2].copy_from_slice(&0x1111u16.to_be_bytes());
        reply[2] = 0x80 | (u8::from(Opcode::NOTIFY) << 3); // QR + opcode
        assert_eq!(layer.consume(&reply), State::Done);
        assert!(layer.succeeded());

        // A mismatched ID is a failure.
        layer.begin();
        layer.produce(&mut OutPacket::new(&mut buf));
        reply[0..2].copy_from_slice(&0x2222u16.to_be_bytes());
        assert_eq!(layer.consume(&reply), State::Fail);

        // An error RCODE completes the layer but is not success.
        layer.begin();
        layer.produce(&mut OutPacket::new(&mut buf));
        reply[0..2].copy_from_slice(&0x1111u16.to_be_bytes());
        reply[3] = u8::from(Rcode::REFUSED);
        assert_eq!(layer.consume(&reply), State::Done);
        assert!(!layer.succeeded());
    }
}
