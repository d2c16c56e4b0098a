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

//! The zone lookup algorithm of [RFC 1034 § 4.3.2], step 3, as
//! clarified by [RFC 4592].
//!
//! Step 2 of the algorithm — finding the zone to search — is the
//! [`ZoneSet`](super::set::ZoneSet)'s job. This module searches within
//! one zone: it walks from the apex toward the query name watching for
//! delegation cuts, resolves the exact node or an appropriate wildcard,
//! and reports the outcome as a [`LookupResult`].
//!
//! [RFC 1034 § 4.3.2]: https://datatracker.ietf.org/doc/html/rfc1034#section-4.3.2
//! [RFC 4592]: https://datatracker.ietf.org/doc/html/rfc4592

use crate::name::Name;
use crate::rr::{Rrset, Type};

use super::Zone;

/// The result of looking up records of one type at one name.
#[derive(Debug)]
pub enum LookupResult<'a> {
    /// The desired records were found.
    Found(Found<'a>),

    /// The name exists (or a wildcard matched) and carries a CNAME
    /// instead of the desired type.
    Cname(Found<'a>),

    /// The lookup crossed a delegation cut and would leave
    /// authoritative data.
    Referral(Referral<'a>),

    /// The name exists, but has no records of the desired type.
    NoRecords {
        /// The source of synthesis, if a wildcard produced this
        /// no-data answer.
        source_of_synthesis: Option<&'a Name>,
    },

    /// No node with the given name exists, and no wildcard applies.
    NxDomain,

    /// The provided name is not within the zone's hierarchy.
    OutOfZone,
}

/// Data returned when a lookup finds records.
#[derive(Debug)]
pub struct Found<'a> {
    /// The RRset that was found.
    pub rrset: &'a Rrset,

    /// If the answer was synthesized from a wildcard, the wildcard
    /// name it came from. The answer's owner is still the query name.
    pub source_of_synthesis: Option<&'a Name>,
}

/// Data returned when a lookup runs into a delegation.
#[derive(Debug)]
pub struct Referral<'a> {
    /// The name of the delegated child zone (the owner of the NS
    /// RRset at the cut).
    pub cut: &'a Name,

    /// The NS RRset at the cut.
    pub ns_rrset: &'a Rrset,
}

impl Zone {
    /// Looks up records of type `rr_type` at `qname`.
    pub fn lookup<'a>(&'a self, qname: &Name, rr_type: Type) -> LookupResult<'a> {
        if !qname.eq_or_subdomain_of(&self.apex) {
            return LookupResult::OutOfZone;
        }

        // Watch for delegation cuts on the path from the apex down to
        // (and including) the query name. The highest cut wins.
        if let Some(referral) = self.find_cut(qname) {
            return LookupResult::Referral(referral);
        }

        if let Some(node) = self.nodes.get(qname) {
            return match node.rrset(rr_type) {
                Some(rrset) => LookupResult::Found(Found {
                    rrset,
                    source_of_synthesis: None,
                }),
                None => match node.rrset(Type::CNAME) {
                    Some(rrset) if rr_type != Type::CNAME => LookupResult::Cname(Found {
                        rrset,
                        source_of_synthesis: None,
                    }),
                    _ => LookupResult::NoRecords {
                        source_of_synthesis: None,
                    },
                },
            };
        }

        self.lookup_wildcard(qname, rr_type)
    }

    /// Returns the highest delegation cut at or below the apex on the
    /// path to `qname`, excluding the apex itself (whose NS RRset is
    /// authoritative data, not a delegation).
    fn find_cut<'a>(&'a self, qname: &Name) -> Option<Referral<'a>> {
        for ancestor in ancestors_top_down(qname, &self.apex) {
            if let Some((cut, node)) = self.nodes.get_key_value(&ancestor) {
                if let Some(ns_rrset) = node.rrset(Type::NS) {
                    return Some(Referral { cut, ns_rrset });
                }
            }
        }
        None
    }

    /// Resolves `qname` against a wildcard, per [RFC 4592]: the
    /// closest encloser is the longest existing ancestor of `qname`;
    /// the source of synthesis is the name `*` prepended to it. Since
    /// interior nodes are materialized when zones are built, the first
    /// existing ancestor found walking upward *is* the closest
    /// encloser.
    ///
    /// [RFC 4592]: https://datatracker.ietf.org/doc/html/rfc4592
    fn lookup_wildcard<'a>(&'a self, qname: &Name, rr_type: Type) -> LookupResult<'a> {
        let mut encloser = qname.parent();
        while let Some(candidate) = encloser {
            if self.nodes.contains_key(&candidate) {
                let wildcard = match candidate.to_wildcard() {
                    Ok(wildcard) => wildcard,
                    Err(_) => return LookupResult::NxDomain,
                };
                return match self.nodes.get_key_value(&wildcard) {
                    Some((source, node)) => match node.rrset(rr_type) {
                        Some(rrset) => LookupResult::Found(Found {
                            rrset,
                            source_of_synthesis: Some(source),
                        }),
                        None => match node.rrset(Type::CNAME) {
                            Some(rrset) if rr_type != Type::CNAME => {
                                LookupResult::Cname(Found {
                                    rrset,
                                    source_of_synthesis: Some(source),
                                })
                            }
                            _ => LookupResult::NoRecords {
                                source_of_synthesis: Some(source),
                            },
                        },
                    },
                    None => LookupResult::NxDomain,
                };
            }
            encloser = candidate.parent();
        }
        // The apex node always exists, so the walk cannot pass it.
        LookupResult::NxDomain
    }

    /// Looks up the address (A and AAAA) RRsets at `name` for glue and
    /// additional-section processing. Unlike [`Zone::lookup`], this
    /// descends below delegation cuts, because glue lives there.
    pub fn lookup_addrs(&self, name: &Name) -> (Option<&Rrset>, Option<&Rrset>) {
        match self.nodes.get(name) {
            Some(node) => (node.rrset(Type::A), node.rrset(Type::AAAA)),
            None => (None, None),
        }
    }
}

/// Iterates over the names on the path from just below `apex` down to
/// `qname`, inclusive. `qname` must be at or below `apex`.
fn ancestors_top_down(qname: &Name, apex: &Name) -> impl Iterator<Item = Name> {
    let mut chain = Vec::new();
    let mut name = qname.clone();
    while &name != apex {
        chain.push(name.clone());
        match name.parent() {
            Some(parent) => name = parent,
            None => break,
        }
    }
    chain.into_iter().rev()
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::super::tests::example_zone;
    use super::*;
    use crate::rr::{Rdata, Ttl};

    fn add(zone: &mut Zone, owner: &str, rr_type: Type, rdata: &[u8]) {
        let owner: Name = owner.parse().unwrap();
        zone.add(
            &owner,
            rr_type,
            Ttl::from(300),
            <&Rdata>::try_from(rdata).unwrap(),
        )
        .unwrap();
    }

    fn name_rdata(name: &str) -> Vec<u8> {
        name.parse::<Name>().unwrap().wire_repr().to_vec()
    }

    #[test]
    fn exact_match_finds_records() {
        let mut zone = example_zone();
        add(&mut zone, "a.example.", Type::A, &[192, 0, 2, 1]);
        match zone.lookup(&"a.example.".parse().unwrap(), Type::A) {
            LookupResult::Found(found) => {
                assert_eq!(found.rrset.rr_type, Type::A);
                assert!(found.source_of_synthesis.is_none());
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn missing_name_is_nxdomain() {
        let zone = example_zone();
        assert!(matches!(
            zone.lookup(&"missing.example.".parse().unwrap(), Type::A),
            LookupResult::NxDomain,
        ));
    }

    #[test]
    fn existing_name_without_type_is_no_records() {
        let mut zone = example_zone();
        add(&mut zone, "a.example.", Type::A, &[192, 0, 2, 1]);
        assert!(matches!(
            zone.lookup(&"a.example.".parse().unwrap(), Type::TXT),
            LookupResult::NoRecords {
                source_of_synthesis: None,
            },
        ));
    }

    #[test]
    fn empty_non_terminals_are_no_records_not_nxdomain() {
        let mut zone = example_zone();
        add(&mut zone, "a.b.example.", Type::A, &[192, 0, 2, 1]);
        assert!(matches!(
            zone.lookup(&"b.example.".parse().unwrap(), Type::A),
            LookupResult::NoRecords { .. },
        ));
    }

    #[test]
    fn wildcard_synthesis_reports_its_source() {
        let mut zone = example_zone();
        add(&mut zone, "*.w.example.", Type::TXT, b"\x03hit");
        match zone.lookup(&"x.w.example.".parse().unwrap(), Type::TXT) {
            LookupResult::Found(found) => {
                let source = found.source_of_synthesis.unwrap();
                assert_eq!(source, &"*.w.example.".parse().unwrap());
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn wildcard_does_not_apply_to_existing_names() {
        // RFC 4592: a name that exists (even as an empty non-terminal)
        // is never matched by a wildcard.
        let mut zone = example_zone();
        add(&mut zone, "*.w.example.", Type::TXT, b"\x03hit");
        add(&mut zone, "a.real.w.example.", Type::A, &[192, 0, 2, 1]);
        assert!(matches!(
            zone.lookup(&"real.w.example.".parse().unwrap(), Type::TXT),
            LookupResult::NoRecords {
                source_of_synthesis: None,
            },
        ));
    }

    #[test]
    fn wildcard_no_data_keeps_the_source() {
        let mut zone = example_zone();
        add(&mut zone, "*.w.example.", Type::TXT, b"\x03hit");
        match zone.lookup(&"x.w.example.".parse().unwrap(), Type::A) {
            LookupResult::NoRecords {
                source_of_synthesis: Some(source),
            } => assert_eq!(source, &"*.w.example.".parse().unwrap()),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn delegations_produce_referrals() {
        let mut zone = example_zone();
        add(
            &mut zone,
            "sub.example.",
            Type::NS,
            &name_rdata("ns1.elsewhere."),
        );
        match zone.lookup(&"deep.sub.example.".parse().unwrap(), Type::A) {
            LookupResult::Referral(referral) => {
                assert_eq!(referral.cut, &"sub.example.".parse().unwrap());
                assert_eq!(referral.ns_rrset.rr_type, Type::NS);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        // Queries at the cut itself are also referrals.
        assert!(matches!(
            zone.lookup(&"sub.example.".parse().unwrap(), Type::A),
            LookupResult::Referral(_),
        ));
    }

    #[test]
    fn apex_ns_is_not_a_delegation() {
        let mut zone = example_zone();
        add(&mut zone, "example.", Type::NS, &name_rdata("ns1.example."));
        assert!(matches!(
            zone.lookup(&"example.".parse().unwrap(), Type::NS),
            LookupResult::Found(_),
        ));
    }

    #[test]
    fn out_of_zone_names_are_rejected() {
        let zone = example_zone();
        assert!(matches!(
            zone.lookup(&"example.org.".parse().unwrap(), Type::A),
            LookupResult::OutOfZone,
        ));
    }

    #[test]
    fn glue_lookup_descends_below_cuts() {
        let mut zone = example_zone();
        add(
            &mut zone,
            "sub.example.",
            Type::NS,
            &name_rdata("ns1.sub.example."),
        );
        add(&mut zone, "ns1.sub.example.", Type::A, &[192, 0, 2, 53]);
        let (a, aaaa) = zone.lookup_addrs(&"ns1.sub.example.".parse().unwrap());
        assert!(a.is_some());
        assert!(aaaa.is_none());
    }

    #[test]
    fn cname_is_reported_for_other_types() {
        let mut zone = example_zone();
        add(
            &mut zone,
            "alias.example.",
            Type::CNAME,
            &name_rdata("target.example."),
        );
        assert!(matches!(
            zone.lookup(&"alias.example.".parse().unwrap(), Type::A),
            LookupResult::Cname(_),
        ));
        // A query *for* the CNAME type finds it directly.
        assert!(matches!(
            zone.lookup(&"alias.example.".parse().unwrap(), Type::CNAME),
            LookupResult::Found(_),
        ));
    }
}
