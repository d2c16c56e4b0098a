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

//! The [`ZoneSet`]: all zones served at one instant.
//!
//! A `ZoneSet` is the unit of publication: the loader assembles one,
//! validates its zones, and hands it to the
//! [`ZoneDb`](super::db::ZoneDb), after which it is immutable.

use std::collections::BTreeMap;

use crate::class::Class;
use crate::name::Name;

use super::{Error, Zone};

/// The set of zones served by the server, supporting nearest-ancestor
/// lookup from a query name to the zone that should answer it (step 2
/// of the [RFC 1034 § 4.3.2] algorithm).
///
/// [RFC 1034 § 4.3.2]: https://datatracker.ietf.org/doc/html/rfc1034#section-4.3.2
#[derive(Debug, Default)]
pub struct ZoneSet {
    zones: BTreeMap<Name, Zone>,
}

impl ZoneSet {
    /// Creates a new, empty `ZoneSet`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `zone` to the set after validating it, replacing any
    /// preexisting zone with the same apex.
    pub fn insert(&mut self, zone: Zone) -> Result<(), Error> {
        zone.validate()?;
        self.zones.insert(zone.apex().clone(), zone);
        Ok(())
    }

    /// Looks up the zone in the set that is the nearest ancestor of
    /// `name` in the given class.
    pub fn find(&self, name: &Name, class: Class) -> Option<&Zone> {
        let mut candidate = Some(name.clone());
        while let Some(ancestor) = candidate {
            if let Some(zone) = self.zones.get(&ancestor) {
                if zone.class() == class {
                    return Some(zone);
                }
            }
            candidate = ancestor.parent();
        }
        None
    }

    /// Returns the zone whose apex is exactly `apex`, if present.
    pub fn get(&self, apex: &Name, class: Class) -> Option<&Zone> {
        self.zones
            .get(apex)
            .filter(|zone| zone.class() == class)
    }

    /// Returns the number of zones in the set.
    pub fn len(&self) -> usize {
        self.zones.len()
    }

    /// Returns whether the set contains no zones.
    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Returns an iterator over the zones in canonical apex order.
    pub fn iter(&self) -> impl Iterator<Item = &Zone> {
        self.zones.values()
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::super::tests::soa_rdata;
    use super::*;
    use crate::rr::{Rdata, Ttl, Type};

    fn zone(apex: &str) -> Zone {
        let apex: Name = apex.parse().unwrap();
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
    fn find_selects_the_nearest_ancestor() {
        let mut set = ZoneSet::new();
        set.insert(zone("example.")).unwrap();
        set.insert(zone("sub.example.")).unwrap();

        let found = set
            .find(&"a.sub.example.".parse().unwrap(), Class::IN)
            .unwrap();
        assert_eq!(found.apex(), &"sub.example.".parse().unwrap());

        let found = set
            .find(&"other.example.".parse().unwrap(), Class::IN)
            .unwrap();
        assert_eq!(found.apex(), &"example.".parse().unwrap());

        assert!(set.find(&"example.org.".parse().unwrap(), Class::IN).is_none());
    }

    #[test]
    fn insert_validates_the_zone() {
        let mut set = ZoneSet::new();
        let invalid = Zone::new("example.".parse().unwrap(), Class::IN);
        assert_eq!(set.insert(invalid), Err(Error::MissingSoa));
    }

    #[test]
    fn find_respects_class() {
        let mut set = ZoneSet::new();
        set.insert(zone("example.")).unwrap();
        assert!(set.find(&"a.example.".parse().unwrap(), Class::CH).is_none());
    }
}
