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

//! End-to-end tests for the query processor: hand-built wire queries
//! in, decoded wire responses out.

use super::*;
use crate::class::Class;
use crate::layer::{serve_one, OutPacket};
use crate::name::Name;
use crate::rr::{Rdata, Ttl};
use crate::zone::set::ZoneSet;
use crate::zone::Zone;

////////////////////////////////////////////////////////////////////////
// FIXTURES                                                           //
////////////////////////////////////////////////////////////////////////

const SOA_TTL: u32 = 3600;
const SOA_MINIMUM: u32 = 300;

fn soa_rdata() -> Vec<u8> {
    let mut rdata = Vec::new();
    rdata.extend_from_slice(b"\x03ns1\x07example\x00");
    rdata.extend_from_slice(b"\x05admin\x07example\x00");
    rdata.extend_from_slice(&1u32.to_be_bytes());
    rdata.extend_from_slice(&3600u32.to_be_bytes());
    rdata.extend_from_slice(&900u32.to_be_bytes());
    rdata.extend_from_slice(&1209600u32.to_be_bytes());
    rdata.extend_from_slice(&SOA_MINIMUM.to_be_bytes());
    rdata
}

fn add(zone: &mut Zone, owner: &str, rr_type: Type, ttl: u32, rdata: &[u8]) {
    let owner: Name = owner.parse().unwrap();
    zone.add(
        &owner,
        rr_type,
        Ttl::from(ttl),
        <&Rdata>::try_from(rdata).unwrap(),
    )
    .unwrap();
}

fn name_rdata(name: &str) -> Vec<u8> {
    name.parse::<Name>().unwrap().wire_repr().to_vec()
}

/// The zone shared by the serving scenarios: an A record, a wildcard
/// TXT, and a delegation.
fn example_zones() -> ZoneSet {
    let apex: Name = "example.".parse().unwrap();
    let mut zone = Zone::new(apex.clone(), Class::IN);
    let soa = soa_rdata();
    add(&mut zone, "example.", Type::SOA, SOA_TTL, &soa);
    add(&mut zone, "a.example.", Type::A, 300, &[192, 0, 2, 1]);
    add(&mut zone, "*.w.example.", Type::TXT, 300, b"\x03hit");
    add(
        &mut zone,
        "sub.example.",
        Type::NS,
        300,
        &name_rdata("ns1.elsewhere."),
    );
    add(
        &mut zone,
        "alias.example.",
        Type::CNAME,
        300,
        &name_rdata("a.example."),
    );
    let mut set = ZoneSet::new();
    set.insert(zone).unwrap();
    set
}

fn received_udp() -> ReceivedInfo {
    ReceivedInfo::new("198.51.100.7:4242".parse().unwrap(), Transport::Udp)
}

fn udp_flags() -> QueryFlags {
    QueryFlags::NO_AXFR
        .union(QueryFlags::NO_IXFR)
        .union(QueryFlags::LIMIT_SIZE)
}

/// Builds a plain query message.
fn build_query(id: u16, qname: &str, qtype: Qtype) -> Vec<u8> {
    let mut buf = vec![0u8; 512];
    let mut writer = Writer::new(&mut buf, 512).unwrap();
    writer.set_id(id);
    writer.set_rd(true);
    writer
        .add_question(&Question {
            qname: qname.parse().unwrap(),
            qtype,
            qclass: Class::IN.into(),
        })
        .unwrap();
    let len = writer.finish();
    buf.truncate(len);
    buf
}

/// Runs one query through the processor and returns the raw response.
fn serve(zones: &ZoneSet, query: &[u8], info: ReceivedInfo, flags: QueryFlags) -> Option<Vec<u8>> {
    let mut processor = QueryProcessor::new(zones, info, flags);
    let mut buf = vec![0u8; 65535];
    let mut out = OutPacket::new(&mut buf);
    let state = serve_one(&mut processor, query, &mut out);
    if state == State::Done && !out.is_empty() {
        Some(out.as_slice().to_vec())
    } else {
        None
    }
}

/// Decodes a response into (reader-checked) parts for assertions.
struct Parts {
    id: u16,
    rcode: Rcode,
    aa: bool,
    tc: bool,
    qdcount: u16,
    answers: Vec<(Name, Type, u32, Vec<u8>)>,
    authority: Vec<(Name, Type, u32, Vec<u8>)>,
    additional: Vec<(Name, Type, u32, Vec<u8>)>,
}

fn decode(response: &[u8]) -> Parts {
    let mut reader = Reader::try_from(response).unwrap();
    assert!(reader.qr());
    let mut parts = Parts {
        id: reader.id(),
        rcode: reader.rcode(),
        aa: reader.aa(),
        tc: reader.tc(),
        qdcount: reader.qdcount(),
        answers: Vec::new(),
        authority: Vec::new(),
        additional: Vec::new(),
    };
    for _ in 0..parts.qdcount {
        reader.read_question().unwrap();
    }
    for _ in 0..reader.ancount() {
        let rr = reader.read_rr().unwrap();
        parts
            .answers
            .push((rr.owner, rr.rr_type, rr.ttl_raw, rr.rdata.octets().to_vec()));
    }
    for _ in 0..reader.nscount() {
        let rr = reader.read_rr().unwrap();
        parts
            .authority
            .push((rr.owner, rr.rr_type, rr.ttl_raw, rr.rdata.octets().to_vec()));
    }
    for _ in 0..reader.arcount() {
        let rr = reader.read_rr().unwrap();
        parts
            .additional
            .push((rr.owner, rr.rr_type, rr.ttl_raw, rr.rdata.octets().to_vec()));
    }
    assert!(reader.at_eom());
    parts
}

////////////////////////////////////////////////////////////////////////
// SERVING SCENARIOS                                                  //
////////////////////////////////////////////////////////////////////////

#[test]
fn positive_answer_carries_the_record_and_aa() {
    let zones = example_zones();
    let query = build_query(1, "a.example.", Type::A.into());
    let response = serve(&zones, &query, received_udp(), udp_flags()).unwrap();
    let parts = decode(&response);
    assert_eq!(parts.rcode, Rcode::NOERROR);
    assert!(parts.aa);
    assert_eq!(parts.answers.len(), 1);
    let (owner, rr_type, _, rdata) = &parts.answers[0];
    assert_eq!(owner, &"a.example.".parse().unwrap());
    assert_eq!(*rr_type, Type::A);
    assert_eq!(rdata, &[192, 0, 2, 1]);
}

#[test]
fn missing_name_yields_nxdomain_with_negative_soa() {
    let zones = example_zones();
    let query = build_query(2, "missing.example.", Type::A.into());
    let response = serve(&zones, &query, received_udp(), udp_flags()).unwrap();
    let parts = decode(&response);
    assert_eq!(parts.rcode, Rcode::NXDOMAIN);
    assert!(parts.aa);
    assert!(parts.answers.is_empty());
    assert_eq!(parts.authority.len(), 1);
    let (owner, rr_type, ttl, _) = &parts.authority[0];
    assert_eq!(owner, &"example.".parse().unwrap());
    assert_eq!(*rr_type, Type::SOA);
    // The negative TTL is min(SOA TTL, SOA MINIMUM).
    assert_eq!(*ttl, SOA_TTL.min(SOA_MINIMUM));
}

#[test]
fn wildcard_answer_is_owned_by_the_query_name() {
    let zones = example_zones();
    let query = build_query(3, "x.w.example.", Type::TXT.into());
    let response = serve(&zones, &query, received_udp(), udp_flags()).unwrap();
    let parts = decode(&response);
    assert_eq!(parts.rcode, Rcode::NOERROR);
    assert!(parts.aa);
    assert_eq!(parts.answers.len(), 1);
    let (owner, rr_type, _, rdata) = &parts.answers[0];
    assert_eq!(owner, &"x.w.example.".parse().unwrap());
    assert_eq!(*rr_type, Type::TXT);
    assert_eq!(rdata, b"\x03hit");
}

#[test]
fn names_below_a_cut_get_a_referral() {
    let zones = example_zones();
    let query = build_query(4, "deep.sub.example.", Type::A.into());
    let response = serve(&zones, &query, received_udp(), udp_flags()).unwrap();
    let parts = decode(&response);
    assert_eq!(parts.rcode, Rcode::NOERROR);
    assert!(!parts.aa);
    assert!(parts.answers.is_empty());
    assert_eq!(parts.authority.len(), 1);
    let (owner, rr_type, _, rdata) = &parts.authority[0];
    assert_eq!(owner, &"sub.example.".parse().unwrap());
    assert_eq!(*rr_type, Type::NS);
    assert_eq!(rdata, &name_rdata("ns1.elsewhere."));
}

#[test]
fn axfr_over_udp_is_notimp() {
    let zones = example_zones();
    let query = build_query(5, "example.", Qtype::AXFR);
    let response = serve(&zones, &query, received_udp(), udp_flags()).unwrap();
    let parts = decode(&response);
    assert_eq!(parts.rcode, Rcode::NOTIMP);
    assert!(parts.answers.is_empty());
}

#[test]
fn truncated_question_yields_formerr_with_the_received_id() {
    let zones = example_zones();
    // A valid header with id 0x1234 claiming one question, then a
    // question cut off mid-name.
    let mut query = vec![0x12, 0x34, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
    query.extend_from_slice(b"\x07exam");
    let response = serve(&zones, &query, received_udp(), udp_flags()).unwrap();
    let parts = decode(&response);
    assert_eq!(parts.id, 0x1234);
    assert_eq!(parts.rcode, Rcode::FORMERR);
    assert_eq!(parts.qdcount, 0);
}

////////////////////////////////////////////////////////////////////////
// GATING AND POLICY                                                  //
////////////////////////////////////////////////////////////////////////

#[test]
fn out_of_zone_names_are_refused() {
    let zones = example_zones();
    let query = build_query(6, "example.org.", Type::A.into());
    let response = serve(&zones, &query, received_udp(), udp_flags()).unwrap();
    assert_eq!(decode(&response).rcode, Rcode::REFUSED);
}

#[test]
fn responses_and_multi_question_messages_are_ignored() {
    let zones = example_zones();

    let mut response_message = build_query(7, "a.example.", Type::A.into());
    response_message[2] |= 0x80; // QR
    assert!(serve(&zones, &response_message, received_udp(), udp_flags()).is_none());

    let mut two_questions = build_query(8, "a.example.", Type::A.into());
    two_questions[5] = 2; // QDCOUNT
    assert!(serve(&zones, &two_questions, received_udp(), udp_flags()).is_none());

    // Messages without a full header are dropped silently.
    assert!(serve(&zones, &[0x12, 0x34], received_udp(), udp_flags()).is_none());
}

#[test]
fn unknown_opcodes_are_notimp() {
    let zones = example_zones();
    let mut query = build_query(9, "a.example.", Type::A.into());
    query[2] |= (u8::from(Opcode::UPDATE)) << 3;
    let response = serve(&zones, &query, received_udp(), udp_flags()).unwrap();
    assert_eq!(decode(&response).rcode, Rcode::NOTIMP);
}

#[test]
fn no_data_names_get_noerror_with_soa() {
    let zones = example_zones();
    let query = build_query(10, "a.example.", Type::TXT.into());
    let response = serve(&zones, &query, received_udp(), udp_flags()).unwrap();
    let parts = decode(&response);
    assert_eq!(parts.rcode, Rcode::NOERROR);
    assert!(parts.aa);
    assert!(parts.answers.is_empty());
    assert_eq!(parts.authority.len(), 1);
    assert_eq!(parts.authority[0].1, Type::SOA);
}

#[test]
fn cname_chains_are_chased_within_the_zone() {
    let zones = example_zones();
    let query = build_query(11, "alias.example.", Type::A.into());
    let response = serve(&zones, &query, received_udp(), udp_flags()).unwrap();
    let parts = decode(&response);
    assert_eq!(parts.rcode, Rcode::NOERROR);
    assert_eq!(parts.answers.len(), 2);
    assert_eq!(parts.answers[0].1, Type::CNAME);
    assert_eq!(parts.answers[1].1, Type::A);
    assert_eq!(parts.answers[1].0, "a.example.".parse().unwrap());
}

#[test]
fn cname_loops_servfail() {
    let apex: Name = "example.".parse().unwrap();
    let mut zone = Zone::new(apex, Class::IN);
    let soa = soa_rdata();
    add(&mut zone, "example.", Type::SOA, SOA_TTL, &soa);
    add(
        &mut zone,
        "a.example.",
        Type::CNAME,
        300,
        &name_rdata("b.example."),
    );
    add(
        &mut zone,
        "b.example.",
        Type::CNAME,
        300,
        &name_rdata("a.example."),
    );
    let mut zones = ZoneSet::new();
    zones.insert(zone).unwrap();

    let query = build_query(12, "a.example.", Type::TXT.into());
    let response = serve(&zones, &query, received_udp(), udp_flags()).unwrap();
    let parts = decode(&response);
    assert_eq!(parts.rcode, Rcode::SERVFAIL);
    assert!(parts.answers.is_empty());
}

////////////////////////////////////////////////////////////////////////
// EDNS AND SIZE HANDLING                                             //
////////////////////////////////////////////////////////////////////////

/// Builds a query with an EDNS OPT advertising `payload_size` and
/// `version`.
fn build_edns_query(id: u16, qname: &str, qtype: Qtype, payload_size: u16, version: u8) -> Vec<u8> {
    let mut query = build_query(id, qname, qtype);
    query[11] = 1; // ARCOUNT
    query.push(0); // root owner
    query.extend_from_slice(&u16::from(Type::OPT).to_be_bytes());
    query.extend_from_slice(&payload_size.to_be_bytes());
    query.extend_from_slice(&[0, version, 0, 0]); // TTL field
    query.extend_from_slice(&0u16.to_be_bytes()); // RDLENGTH
    query
}

#[test]
fn edns_responses_mirror_the_negotiated_size() {
    let zones = example_zones();
    let query = build_edns_query(13, "a.example.", Type::A.into(), 1232, 0);
    let response = serve(&zones, &query, received_udp(), udp_flags()).unwrap();

    let mut reader = Reader::try_from(response.as_slice()).unwrap();
    assert_eq!(reader.arcount(), 1);
    reader.read_question().unwrap();
    reader.read_rr().unwrap(); // the answer
    let opt = reader.read_rr().unwrap();
    assert_eq!(opt.rr_type, Type::OPT);
    assert_eq!(u16::from(opt.class), 1232);
    // Version 0, no extended RCODE bits.
    assert_eq!(opt.ttl_raw, 0);
}

#[test]
fn unsupported_edns_versions_get_badvers() {
    let zones = example_zones();
    let query = build_edns_query(14, "a.example.", Type::A.into(), 1232, 1);
    let response = serve(&zones, &query, received_udp(), udp_flags()).unwrap();

    let mut reader = Reader::try_from(response.as_slice()).unwrap();
    reader.read_question().unwrap();
    let opt = reader.read_rr().unwrap();
    assert_eq!(opt.rr_type, Type::OPT);
    // BADVERS = 16: upper eight bits 1, header RCODE 0.
    assert_eq!(opt.ttl_raw >> 24, 1);
    assert_eq!(reader.rcode(), Rcode::NOERROR);
    assert!(reader.ancount() == 0);
}

#[test]
fn two_opt_records_are_formerr() {
    let zones = example_zones();
    let mut query = build_edns_query(15, "a.example.", Type::A.into(), 1232, 0);
    query[11] = 2; // ARCOUNT
    query.push(0);
    query.extend_from_slice(&u16::from(Type::OPT).to_be_bytes());
    query.extend_from_slice(&1232u16.to_be_bytes());
    query.extend_from_slice(&[0, 0, 0, 0]);
    query.extend_from_slice(&0u16.to_be_bytes());
    let response = serve(&zones, &query, received_udp(), udp_flags()).unwrap();
    assert_eq!(decode(&response).rcode, Rcode::FORMERR);
}

#[test]
fn oversized_udp_responses_are_truncated_to_the_question() {
    // A zone with enough TXT data at one name to overflow 512 octets.
    let apex: Name = "example.".parse().unwrap();
    let mut zone = Zone::new(apex, Class::IN);
    let soa = soa_rdata();
    add(&mut zone, "example.", Type::SOA, SOA_TTL, &soa);
    for i in 0..4u8 {
        let mut txt = vec![255u8];
        txt.extend_from_slice(&[b'a' + i; 255]);
        add(&mut zone, "big.example.", Type::TXT, 300, &txt);
    }
    let mut zones = ZoneSet::new();
    zones.insert(zone).unwrap();

    let query = build_query(16, "big.example.", Type::TXT.into());
    let response = serve(&zones, &query, received_udp(), udp_flags()).unwrap();
    assert!(response.len() <= 512);
    let parts = decode(&response);
    assert!(parts.tc);
    assert_eq!(parts.qdcount, 1);
    assert!(parts.answers.is_empty());
    assert!(parts.authority.is_empty());
    assert!(parts.additional.is_empty());

    // The same response over a stream transport carries the data.
    let info = ReceivedInfo::new("198.51.100.7:4242".parse().unwrap(), Transport::Tcp);
    let response = serve(&zones, &query, info, QueryFlags::default()).unwrap();
    let parts = decode(&response);
    assert!(!parts.tc);
    assert_eq!(parts.answers.len(), 4);
}

#[test]
fn referrals_include_in_zone_glue() {
    let apex: Name = "example.".parse().unwrap();
    let mut zone = Zone::new(apex, Class::IN);
    let soa = soa_rdata();
    add(&mut zone, "example.", Type::SOA, SOA_TTL, &soa);
    add(
        &mut zone,
        "sub.example.",
        Type::NS,
        300,
        &name_rdata("ns1.sub.example."),
    );
    add(&mut zone, "ns1.sub.example.", Type::A, 300, &[192, 0, 2, 53]);
    add(
        &mut zone,
        "ns1.sub.example.",
        Type::AAAA,
        300,
        &[0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x35],
    );
    let mut zones = ZoneSet::new();
    zones.insert(zone).unwrap();

    let query = build_query(17, "deep.sub.example.", Type::A.into());
    let response = serve(&zones, &query, received_udp(), udp_flags()).unwrap();
    let parts = decode(&response);
    assert_eq!(parts.rcode, Rcode::NOERROR);
    assert!(!parts.aa);
    assert_eq!(parts.authority.len(), 1);
    assert_eq!(parts.additional.len(), 2);
    let glue_owner: Name = "ns1.sub.example.".parse().unwrap();
    assert!(parts
        .additional
        .iter()
        .any(|(owner, rr_type, _, _)| owner == &glue_owner && *rr_type == Type::A));
    assert!(parts
        .additional
        .iter()
        .any(|(owner, rr_type, _, _)| owner == &glue_owner && *rr_type == Type::AAAA));
}
