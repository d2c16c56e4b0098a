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

//! Synthesis of answers to DNS QUERY messages.

use arrayvec::ArrayVec;

use crate::class::Class;
use crate::message::{writer, Question, Rcode, Writer};
use crate::name::Name;
use crate::rr::{Rrset, Ttl, Type};
use crate::zone::set::ZoneSet;
use crate::zone::{LookupResult, Referral, Zone};

/// The maximum number of links in a CNAME chain that will be followed
/// before giving up and returning SERVFAIL. Loops are detected
/// separately (and also produce SERVFAIL).
const MAX_CNAME_CHAIN_LEN: usize = 16;

/// The owners already visited while following a CNAME chain. The
/// original QNAME is tracked separately, so the capacity is one less
/// than the chain limit.
type PreviousOwners = ArrayVec<Name, { MAX_CNAME_CHAIN_LEN - 1 }>;

/// An error internal to answer synthesis.
#[derive(Debug, Eq, PartialEq)]
pub(super) enum ProcessingError {
    ServFail,
    Truncation,
}

impl From<writer::Error> for ProcessingError {
    fn from(writer_error: writer::Error) -> Self {
        match writer_error {
            writer::Error::Truncation => Self::Truncation,
            _ => Self::ServFail,
        }
    }
}

pub(super) type ProcessingResult<T> = Result<T, ProcessingError>;

////////////////////////////////////////////////////////////////////////
// TOP-LEVEL ANSWERING LOGIC                                          //
////////////////////////////////////////////////////////////////////////

/// Answers `question` against `zones`, writing the response sections
/// and flags into `response`.
pub(super) fn answer(
    zones: &ZoneSet,
    question: &Question,
    response: &mut Writer,
) -> ProcessingResult<()> {
    let class = Class::from(question.qclass);
    let zone = match zones.find(&question.qname, class) {
        Some(zone) => zone,
        None => {
            // No zone of ours contains the name.
            response.set_rcode(Rcode::REFUSED);
            return Ok(());
        }
    };

    let qname = &question.qname;
    let rr_type = Type::from(question.qtype);
    match zone.lookup(qname, rr_type) {
        LookupResult::Found(found) => {
            // A wildcard-synthesized answer is owned by the query
            // name, not the wildcard; writing `qname` as the owner
            // makes that hold for both match kinds.
            response.set_aa(true);
            response.add_answer_rrset(qname, zone.class(), found.rrset)?;
            additional_section_processing(zone, found.rrset, response)
        }
        LookupResult::Cname(found) => {
            // RFC 6604 § 2.1: the AA bit is set based on the first
            // owner name in the answer section.
            response.set_aa(true);
            follow_cname(zone, qname, found.rrset, rr_type, response, ArrayVec::new())
        }
        LookupResult::Referral(referral) => do_referral(zone, &referral, response),
        LookupResult::NoRecords { .. } => {
            response.set_aa(true);
            add_negative_caching_soa(zone, response)
        }
        LookupResult::NxDomain => {
            response.set_rcode(Rcode::NXDOMAIN);
            response.set_aa(true);
            add_negative_caching_soa(zone, response)
        }
        LookupResult::OutOfZone => {
            // The zone came from a nearest-ancestor search on the same
            // name, so this cannot happen.
            Err(ProcessingError::ServFail)
        }
    }
}

////////////////////////////////////////////////////////////////////////
// CNAME HANDLING                                                     //
////////////////////////////////////////////////////////////////////////

/// Follows a CNAME chain: writes the CNAME record owned by the current
/// name, then re-runs the query with the target as the new QNAME.
///
/// The restart stays within the original zone; even when we are also
/// authoritative for the target's zone, resolvers have no reason to
/// trust records from it in this response.
fn follow_cname(
    zone: &Zone,
    qname: &Name,
    cname_rrset: &Rrset,
    rr_type: Type,
    response: &mut Writer,
    mut owners_seen: PreviousOwners,
) -> ProcessingResult<()> {
    let target = cname_rrset
        .first_rdata()
        .and_then(|rdata| rdata.name_at(0))
        .ok_or(ProcessingError::ServFail)?;
    if &target == qname || owners_seen.contains(&target) {
        // The chain loops.
        return Err(ProcessingError::ServFail);
    }

    let owner = owners_seen.last().unwrap_or(qname);
    response.add_answer_rrset(owner, zone.class(), cname_rrset)?;

    match zone.lookup(&target, rr_type) {
        LookupResult::Found(found) => {
            response.add_answer_rrset(&target, zone.class(), found.rrset)?;
            additional_section_processing(zone, found.rrset, response)
        }
        LookupResult::Cname(found) => {
            if owners_seen.try_push(target).is_ok() {
                follow_cname(zone, qname, found.rrset, rr_type, response, owners_seen)
            } else {
                // The chain is longer than we are willing to follow.
                Err(ProcessingError::ServFail)
            }
        }
        LookupResult::Referral(referral) => do_referral(zone, &referral, response),
        // RFC 6604 § 3: the RCODE is set by the last query cycle.
        LookupResult::NoRecords { .. } => add_negative_caching_soa(zone, response),
        LookupResult::NxDomain => {
            response.set_rcode(Rcode::NXDOMAIN);
            add_negative_caching_soa(zone, response)
        }
        // The chain left the zone; the resolver takes it from here.
        LookupResult::OutOfZone => Ok(()),
    }
}

////////////////////////////////////////////////////////////////////////
// REFERRAL HANDLING                                                  //
////////////////////////////////////////////////////////////////////////

/// Creates a referral response per [RFC 1034 § 4.3.2]: the NS RRset of
/// the cut in the authority section, addresses for the named servers
/// in the additional section, AA clear.
///
/// Glue for in-domain name servers (those at or below the cut) is
/// mandatory: without it the delegation cannot be followed, so running
/// out of room is reported (and becomes a truncated response).
/// Addresses for other in-zone servers are best-effort and silently
/// dropped if they do not fit.
///
/// [RFC 1034 § 4.3.2]: https://datatracker.ietf.org/doc/html/rfc1034#section-4.3.2
fn do_referral(
    zone: &Zone,
    referral: &Referral,
    response: &mut Writer,
) -> ProcessingResult<()> {
    response.set_aa(false);
    response.add_authority_rrset(referral.cut, zone.class(), referral.ns_rrset)?;

    for rdata in referral.ns_rrset.rdatas() {
        let nsdname = rdata.name_at(0).ok_or(ProcessingError::ServFail)?;
        if nsdname.eq_or_subdomain_of(referral.cut) {
            add_additional_addresses(zone, &nsdname, response)?;
        } else {
            allow_truncation(add_additional_addresses(zone, &nsdname, response))?;
        }
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////
// ADDITIONAL SECTION PROCESSING                                      //
////////////////////////////////////////////////////////////////////////

/// Adds available addresses for domain names embedded in the RDATA of
/// `rrset` (NS, MX, SRV) to the additional section. These are extra
/// information ([RFC 2181 § 9]) and are dropped if they do not fit.
///
/// [RFC 2181 § 9]: https://datatracker.ietf.org/doc/html/rfc2181#section-9
fn additional_section_processing(
    zone: &Zone,
    rrset: &Rrset,
    response: &mut Writer,
) -> ProcessingResult<()> {
    let offset = match rrset.rr_type.embedded_name_offset() {
        Some(offset) => offset,
        None => return Ok(()),
    };
    for rdata in rrset.rdatas() {
        let name = rdata.name_at(offset).ok_or(ProcessingError::ServFail)?;
        allow_truncation(add_additional_addresses(zone, &name, response))?;
    }
    Ok(())
}

/// Looks up `owner` in `zone` (descending below cuts, since glue lives
/// there) and adds any A and AAAA RRsets found to the additional
/// section. On error, some addresses may already have been written.
fn add_additional_addresses(
    zone: &Zone,
    owner: &Name,
    response: &mut Writer,
) -> ProcessingResult<()> {
    let (a_rrset, aaaa_rrset) = zone.lookup_addrs(owner);
    if let Some(a_rrset) = a_rrset {
        response.add_additional_rrset(owner, zone.class(), a_rrset)?;
    }
    if let Some(aaaa_rrset) = aaaa_rrset {
        response.add_additional_rrset(owner, zone.class(), aaaa_rrset)?;
    }
    Ok(())
}

/// Executes a fallible write, swallowing truncation (the caller treats
/// the write as optional).
fn allow_truncation(result: ProcessingResult<()>) -> ProcessingResult<()> {
    match result {
        Err(ProcessingError::Truncation) => Ok(()),
        other => other,
    }
}

////////////////////////////////////////////////////////////////////////
// NEGATIVE CACHING SOA (RFC 2308 § 3)                                //
////////////////////////////////////////////////////////////////////////

/// Adds the zone's SOA record to the authority section for negative
/// caching. Per [RFC 2308 § 3] (and its capped form in § 5), the TTL
/// used is the smaller of the SOA record's own TTL and its MINIMUM
/// field.
///
/// [RFC 2308 § 3]: https://datatracker.ietf.org/doc/html/rfc2308#section-3
fn add_negative_caching_soa(zone: &Zone, response: &mut Writer) -> ProcessingResult<()> {
    let soa_rrset = zone.soa().ok_or(ProcessingError::ServFail)?;
    let soa_rdata = soa_rrset.first_rdata().ok_or(ProcessingError::ServFail)?;
    let minimum = soa_rdata.soa_minimum().ok_or(ProcessingError::ServFail)?;
    let ttl = soa_rrset.ttl.min(Ttl::from(minimum));
    response
        .add_authority_rr(zone.apex(), Type::SOA, zone.class(), ttl, soa_rdata)
        .map_err(Into::into)
}
