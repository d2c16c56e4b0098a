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

//! In-memory storage of authoritative zone data.
//!
//! A [`Zone`] maps the domain names at or below its apex to [`Node`]s,
//! each of which holds the RRsets present at that name. The map is a
//! [`BTreeMap`] keyed by [`Name`], whose ordering is the DNSSEC
//! canonical ordering; this gives O(log n) lookups, canonical-order
//! iteration, and the predecessor queries that NSEC synthesis will
//! eventually need.
//!
//! Zones are built by the loader (which is outside this crate), then
//! frozen into a [`ZoneSet`](set::ZoneSet) and published through the
//! [`ZoneDb`](db::ZoneDb). Nothing mutates a zone after publication.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;

use crate::class::Class;
use crate::name::Name;
use crate::rr::{Rdata, Rrset, Ttl, Type};

mod lookup;
pub mod db;
pub mod set;

pub use lookup::{Found, LookupResult, Referral};

////////////////////////////////////////////////////////////////////////
// ZONE NODES                                                         //
////////////////////////////////////////////////////////////////////////

/// The RRsets present at a single domain name within a zone.
///
/// A `Node` belongs to exactly one zone and never owns it; the zone
/// reaches its nodes through the name map, and answer synthesis reaches
/// back to the apex through the zone itself.
#[derive(Debug, Default)]
pub struct Node {
    rrsets: Vec<Rrset>,
}

impl Node {
    /// Returns the RRset of the given type at this node, if present.
    pub fn rrset(&self, rr_type: Type) -> Option<&Rrset> {
        self.rrsets.iter().find(|rrset| rrset.rr_type == rr_type)
    }

    /// Returns whether the node carries any RRsets. Empty nodes exist:
    /// they are the "empty non-terminals" materialized for interior
    /// names.
    pub fn is_empty(&self) -> bool {
        self.rrsets.is_empty()
    }

    /// Returns an iterator over the node's RRsets.
    pub fn rrsets(&self) -> impl Iterator<Item = &Rrset> {
        self.rrsets.iter()
    }

    fn rrset_mut(&mut self, rr_type: Type, ttl: Ttl) -> &mut Rrset {
        if let Some(index) = self
            .rrsets
            .iter()
            .position(|rrset| rrset.rr_type == rr_type)
        {
            &mut self.rrsets[index]
        } else {
            self.rrsets.push(Rrset::new(rr_type, ttl));
            self.rrsets.last_mut().unwrap()
        }
    }
}

////////////////////////////////////////////////////////////////////////
// ZONES                                                              //
////////////////////////////////////////////////////////////////////////

/// The authoritative data for one zone.
pub struct Zone {
    apex: Name,
    class: Class,
    nodes: BTreeMap<Name, Node>,
}

impl Zone {
    /// Creates a new, empty `Zone` rooted at `apex`. The apex node is
    /// materialized immediately.
    pub fn new(apex: Name, class: Class) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(apex.clone(), Node::default());
        Self { apex, class, nodes }
    }

    /// Returns the name of the zone (the domain name of its apex).
    pub fn apex(&self) -> &Name {
        &self.apex
    }

    /// Returns the DNS class of the zone.
    pub fn class(&self) -> Class {
        self.class
    }

    /// Adds a record to the zone.
    ///
    /// The owner must be at or below the apex. Any interior names
    /// between the owner and the apex that do not yet have nodes are
    /// materialized as empty non-terminals, so that every name used by
    /// an RRset (and every name on the path to one) resolves to a
    /// node.
    pub fn add(
        &mut self,
        owner: &Name,
        rr_type: Type,
        ttl: Ttl,
        rdata: &Rdata,
    ) -> Result<(), Error> {
        if !owner.eq_or_subdomain_of(&self.apex) {
            return Err(Error::OutOfZone);
        }
        let mut name = owner.clone();
        while !self.nodes.contains_key(&name) {
            self.nodes.insert(name.clone(), Node::default());
            // The apex node always exists, so this terminates.
            name = name.parent().expect("ran past the root materializing nodes");
        }
        self.nodes
            .get_mut(owner)
            .unwrap()
            .rrset_mut(rr_type, ttl)
            .push_rdata(rdata);
        Ok(())
    }

    /// Checks the startup-time invariants of the zone: there must be
    /// exactly one SOA record, at the apex.
    pub fn validate(&self) -> Result<(), Error> {
        let apex_node = self.nodes.get(&self.apex).unwrap();
        match apex_node.rrset(Type::SOA) {
            None => return Err(Error::MissingSoa),
            Some(soa) if soa.len() != 1 => return Err(Error::ApexSoaNotSingleton),
            Some(_) => (),
        }
        for (name, node) in &self.nodes {
            if name != &self.apex && node.rrset(Type::SOA).is_some() {
                return Err(Error::SoaBelowApex);
            }
        }
        Ok(())
    }

    /// Returns the SOA RRset at the zone's apex, if present.
    pub fn soa(&self) -> Option<&Rrset> {
        self.nodes.get(&self.apex)?.rrset(Type::SOA)
    }

    /// Returns the node at `name`, searching without regard to
    /// delegation cuts. This is the raw access used for glue lookups.
    pub fn node(&self, name: &Name) -> Option<&Node> {
        self.nodes.get(name)
    }

    /// Returns the greatest name in the zone canonically ordered
    /// strictly before `name`, along with its node.
    ///
    /// This is the predecessor query that NSEC synthesis requires; the
    /// serving paths do not use it yet, but the store contract exposes
    /// it.
    pub fn predecessor(&self, name: &Name) -> Option<(&Name, &Node)> {
        self.nodes
            .range::<Name, _>((Bound::Unbounded, Bound::Excluded(name)))
            .next_back()
    }

    /// Returns an iterator over the zone's names and nodes in
    /// canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (&Name, &Node)> {
        self.nodes.iter()
    }
}

impl fmt::Debug for Zone {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Zone({} {}, {} nodes)",
            self.apex,
            self.class,
            self.nodes.len(),
        )
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error produced while building or validating a zone.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// A record's owner is not at or below the zone apex.
    OutOfZone,

    /// The zone has no SOA record at its apex.
    MissingSoa,

    /// The apex SOA RRset does not contain exactly one record.
    ApexSoaNotSingleton,

    /// An SOA record appears below the apex.
    SoaBelowApex,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::OutOfZone => f.write_str("record owner is outside the zone"),
            Self::MissingSoa => f.write_str("no SOA record at the zone apex"),
            Self::ApexSoaNotSingleton => f.write_str("apex SOA RRset is not a singleton"),
            Self::SoaBelowApex => f.write_str("SOA record below the zone apex"),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn soa_rdata() -> Vec<u8> {
        let mut rdata = Vec::new();
        rdata.extend_from_slice(b"\x03ns1\x07example\x00");
        rdata.extend_from_slice(b"\x05admin\x07example\x00");
        rdata.extend_from_slice(&1u32.to_be_bytes());
        rdata.extend_from_slice(&3600u32.to_be_bytes());
        rdata.extend_from_slice(&900u32.to_be_bytes());
        rdata.extend_from_slice(&1209600u32.to_be_bytes());
        rdata.extend_from_slice(&300u32.to_be_bytes());
        rdata
    }

    pub(crate) fn example_zone() -> Zone {
        let apex: Name = "example.".parse().unwrap();
        let mut zone = Zone::new(apex.clone(), Class::IN);
        let soa = soa_rdata();
        zone.add(
            &apex,
            Type::SOA,
            Ttl::from(3600),
            <&Rdata>::try_from(soa.as_slice()).unwrap(),
        )
        .unwrap();
        zone
    }

    #[test]
    fn add_materializes_interior_nodes() {
        let mut zone = example_zone();
        let owner: Name = "a.b.c.example.".parse().unwrap();
        zone.add(
            &owner,
            Type::A,
            Ttl::from(300),
            <&Rdata>::try_from(&[192, 0, 2, 1][..]).unwrap(),
        )
        .unwrap();
        assert!(zone.node(&"b.c.example.".parse().unwrap()).is_some());
        assert!(zone.node(&"c.example.".parse().unwrap()).is_some());
        assert!(zone
            .node(&"b.c.example.".parse().unwrap())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn add_rejects_out_of_zone_owners() {
        let mut zone = example_zone();
        let owner: Name = "example.org.".parse().unwrap();
        let result = zone.add(
            &owner,
            Type::A,
            Ttl::from(300),
            <&Rdata>::try_from(&[192, 0, 2, 1][..]).unwrap(),
        );
        assert_eq!(result, Err(Error::OutOfZone));
    }

    #[test]
    fn validation_requires_exactly_one_apex_soa() {
        let apex: Name = "example.".parse().unwrap();
        let zone = Zone::new(apex, Class::IN);
        assert_eq!(zone.validate(), Err(Error::MissingSoa));

        let zone = example_zone();
        assert_eq!(zone.validate(), Ok(()));
    }

    #[test]
    fn iteration_is_in_canonical_order() {
        let mut zone = example_zone();
        for owner in ["z.example.", "a.example.", "b.a.example."] {
            let owner: Name = owner.parse().unwrap();
            zone.add(
                &owner,
                Type::A,
                Ttl::from(300),
                <&Rdata>::try_from(&[192, 0, 2, 1][..]).unwrap(),
            )
            .unwrap();
        }
        let names: Vec<String> = zone.iter().map(|(name, _)| name.to_string()).collect();
        assert_eq!(
            names,
            vec!["example.", "a.example.", "b.a.example.", "z.example."],
        );
    }

    #[test]
    fn predecessor_follows_canonical_order() {
        let mut zone = example_zone();
        for owner in ["a.example.", "z.example.", "m.example."] {
            let owner: Name = owner.parse().unwrap();
            zone.add(
                &owner,
                Type::A,
                Ttl::from(300),
                <&Rdata>::try_from(&[192, 0, 2, 1][..]).unwrap(),
            )
            .unwrap();
        }
        let (name, _) = zone.predecessor(&"m.example.".parse().unwrap()).unwrap();
        assert_eq!(name, &"a.example.".parse().unwrap());
        let (name, _) = zone.predecessor(&"aa.example.".parse().unwrap()).unwrap();
        assert_eq!(name, &"a.example.".parse().unwrap());
        // The apex is canonically first, so it has no predecessor.
        assert!(zone.predecessor(&"example.".parse().unwrap()).is_none());
    }
}
