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

//! Implementation of RRset-related data structures.

use crate::rr::{Rdata, Ttl, Type};

////////////////////////////////////////////////////////////////////////
// RRSETS                                                             //
////////////////////////////////////////////////////////////////////////

/// A data structure for resource record sets.
///
/// [RFC 2181 § 5] defines an RRset as the group of records sharing an
/// owner name, class, and type, and stipulates that all records in an
/// RRset carry the same TTL. Records are therefore stored grouped: an
/// `Rrset` holds the common [`Type`] and [`Ttl`] plus one [`Rdata`] per
/// record. The owner name and class are tracked by the structure that
/// owns the `Rrset` (the zone node and the zone, respectively).
///
/// The RDATAs are packed into a single buffer with native-endian
/// 16-bit length prefixes, so a whole set is one allocation and
/// iteration touches contiguous memory.
///
/// [RFC 2181 § 5]: https://datatracker.ietf.org/doc/html/rfc2181#section-5
#[derive(Debug)]
pub struct Rrset {
    pub rr_type: Type,
    pub ttl: Ttl,
    rdatas: Vec<u8>,
    n_rdatas: usize,
}

impl Rrset {
    /// Creates a new `Rrset` with the given RR type and TTL. It
    /// initially contains no record data.
    pub fn new(rr_type: Type, ttl: Ttl) -> Self {
        Self {
            rr_type,
            ttl,
            rdatas: Vec::new(),
            n_rdatas: 0,
        }
    }

    /// Adds an [`Rdata`] to this `Rrset`. Following the behavior of
    /// other nameservers, RDATA already present in the set is silently
    /// discarded.
    pub fn push_rdata(&mut self, rdata: &Rdata) {
        for existing in self.rdatas() {
            if existing == rdata {
                return;
            }
        }
        self.rdatas.reserve(2 + rdata.len());
        self.rdatas
            .extend_from_slice(&(rdata.len() as u16).to_ne_bytes());
        self.rdatas.extend_from_slice(rdata.octets());
        self.n_rdatas += 1;
    }

    /// Returns the number of records in the set.
    pub fn len(&self) -> usize {
        self.n_rdatas
    }

    /// Returns whether the set contains no records.
    pub fn is_empty(&self) -> bool {
        self.n_rdatas == 0
    }

    /// Returns an iterator over the [`Rdata`] of this `Rrset`.
    pub fn rdatas(&self) -> RdataIterator {
        RdataIterator {
            cursor: &self.rdatas,
        }
    }

    /// Returns the first [`Rdata`] of this `Rrset`, if any.
    pub fn first_rdata(&self) -> Option<&Rdata> {
        self.rdatas().next()
    }
}

/// An iterator over the [`Rdata`] of an [`Rrset`].
pub struct RdataIterator<'a> {
    cursor: &'a [u8],
}

impl<'a> Iterator for RdataIterator<'a> {
    type Item = &'a Rdata;

    fn next(&mut self) -> Option<Self::Item> {
        let len_octets: &[u8; 2] = self.cursor.get(0..2)?.try_into().ok()?;
        let len = u16::from_ne_bytes(*len_octets) as usize;
        let rdata = self.cursor.get(2..len + 2)?;
        self.cursor = &self.cursor[len + 2..];
        Some(Rdata::from_unchecked(rdata))
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_iterate() {
        let mut rrset = Rrset::new(Type::A, Ttl::from(3600));
        rrset.push_rdata(<&Rdata>::try_from(&[192, 0, 2, 1][..]).unwrap());
        rrset.push_rdata(<&Rdata>::try_from(&[192, 0, 2, 2][..]).unwrap());
        let rdatas: Vec<&[u8]> = rrset.rdatas().map(Rdata::octets).collect();
        assert_eq!(rdatas, vec![&[192, 0, 2, 1][..], &[192, 0, 2, 2][..]]);
        assert_eq!(rrset.len(), 2);
    }

    #[test]
    fn duplicate_rdata_is_discarded() {
        let mut rrset = Rrset::new(Type::A, Ttl::from(3600));
        rrset.push_rdata(<&Rdata>::try_from(&[192, 0, 2, 1][..]).unwrap());
        rrset.push_rdata(<&Rdata>::try_from(&[192, 0, 2, 1][..]).unwrap());
        assert_eq!(rrset.len(), 1);
    }
}
