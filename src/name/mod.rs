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

//! Implementation of data structures related to domain names.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use arrayvec::ArrayVec;

mod error;
mod wire;

pub use error::Error;

/// The maximum number of labels in a domain name. A name of maximum
/// length consists of 127 one-octet labels plus the null label.
pub(crate) const MAX_N_LABELS: usize = 128;

/// The maximum length of the uncompressed on-the-wire representation of
/// a domain name.
pub(crate) const MAX_WIRE_LEN: usize = 255;

/// The maximum length of a label in a domain name (not including the
/// octet that provides the length).
pub(crate) const MAX_LABEL_LEN: usize = 63;

////////////////////////////////////////////////////////////////////////
// NAME STRUCTURE                                                     //
////////////////////////////////////////////////////////////////////////

/// A structure to represent a domain name.
///
/// A `Name` owns the uncompressed on-the-wire representation of a
/// domain name as defined in [RFC 1035 § 3.1]: a sequence of
/// length-prefixed labels terminated by the null (zero-length) label.
/// The representation is validated on construction, so all accessors
/// can assume well-formed label framing.
///
/// Comparisons are ASCII-case-insensitive ([RFC 1035 § 2.3.3]) but the
/// original case is preserved in storage. The [`Ord`] implementation is
/// the DNSSEC canonical ordering of [RFC 4034 § 6.1]: names are
/// compared label by label starting from the *rightmost* (most
/// significant) label, with labels compared as lowercased octet
/// strings. This is the ordering that zone data structures require for
/// ordered walks and predecessor queries.
///
/// [RFC 1035 § 2.3.3]: https://datatracker.ietf.org/doc/html/rfc1035#section-2.3.3
/// [RFC 1035 § 3.1]: https://datatracker.ietf.org/doc/html/rfc1035#section-3.1
/// [RFC 4034 § 6.1]: https://datatracker.ietf.org/doc/html/rfc4034#section-6.1
#[derive(Clone)]
pub struct Name {
    wire: Box<[u8]>,
}

impl Name {
    /// Returns the root name.
    pub fn root() -> Self {
        Self {
            wire: Box::new([0]),
        }
    }

    /// Returns the on-the-wire representation of the `Name`.
    pub fn wire_repr(&self) -> &[u8] {
        &self.wire
    }

    /// Returns the length of the on-the-wire representation.
    pub fn wire_len(&self) -> usize {
        self.wire.len()
    }

    /// Returns whether this is the root name.
    pub fn is_root(&self) -> bool {
        self.wire.len() == 1
    }

    /// Returns the number of labels in the `Name`, including the null
    /// label.
    pub fn n_labels(&self) -> usize {
        self.label_offsets().len()
    }

    /// Returns an iterator over the labels of the `Name`, not including
    /// the null label. Each item is the label's octets without the
    /// length prefix.
    pub fn labels(&self) -> impl Iterator<Item = &[u8]> {
        LabelIterator { wire: &self.wire }
    }

    /// Computes the offset of each label (including the null label) in
    /// the wire representation.
    pub(crate) fn label_offsets(&self) -> ArrayVec<u8, MAX_N_LABELS> {
        let mut offsets = ArrayVec::new();
        let mut cursor = 0;
        loop {
            offsets.push(cursor as u8);
            let len = self.wire[cursor] as usize;
            if len == 0 {
                return offsets;
            }
            cursor += 1 + len;
        }
    }

    /// Returns the `Name` formed by removing the leftmost label of this
    /// `Name`, or [`None`] if this is the root name.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            let first_len = self.wire[0] as usize;
            Some(Self {
                wire: self.wire[1 + first_len..].into(),
            })
        }
    }

    /// Returns whether `self` equals `other` or is a subdomain of
    /// `other`.
    pub fn eq_or_subdomain_of(&self, other: &Name) -> bool {
        let n_self = self.n_labels();
        let n_other = other.n_labels();
        if n_self < n_other {
            return false;
        }
        let offsets = self.label_offsets();
        let suffix_start = offsets[n_self - n_other] as usize;
        eq_ignoring_case(&self.wire[suffix_start..], &other.wire)
    }

    /// Returns the `Name` formed by prepending a single label to this
    /// `Name`. Fails if the result would be too long.
    pub fn prepend_label(&self, label: &[u8]) -> Result<Self, Error> {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(Error::LabelTooLong);
        }
        if self.wire.len() + 1 + label.len() > MAX_WIRE_LEN {
            return Err(Error::NameTooLong);
        }
        let mut wire = Vec::with_capacity(self.wire.len() + 1 + label.len());
        wire.push(label.len() as u8);
        wire.extend_from_slice(label);
        wire.extend_from_slice(&self.wire);
        Ok(Self { wire: wire.into() })
    }

    /// Returns the `Name` formed by prepending the wildcard label `*`
    /// to this `Name`.
    pub fn to_wildcard(&self) -> Result<Self, Error> {
        self.prepend_label(b"*")
    }

    /// Returns whether the leftmost label of the `Name` is the wildcard
    /// label `*`.
    pub fn is_wildcard(&self) -> bool {
        self.wire.len() >= 2 && self.wire[0] == 1 && self.wire[1] == b'*'
    }
}

/// A crate-private constructor used by the `wire` submodule once a
/// buffer has been validated.
impl Name {
    pub(crate) fn from_validated_wire(wire: Box<[u8]>) -> Self {
        Self { wire }
    }
}

struct LabelIterator<'a> {
    wire: &'a [u8],
}

impl<'a> Iterator for LabelIterator<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let len = self.wire[0] as usize;
        if len == 0 {
            None
        } else {
            let label = &self.wire[1..1 + len];
            self.wire = &self.wire[1 + len..];
            Some(label)
        }
    }
}

////////////////////////////////////////////////////////////////////////
// EQUALITY, ORDERING, AND HASHING                                    //
////////////////////////////////////////////////////////////////////////

fn eq_ignoring_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| x.eq_ignore_ascii_case(y))
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        eq_ignoring_case(&self.wire, &other.wire)
    }
}

impl Eq for Name {}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for octet in self.wire.iter() {
            state.write_u8(octet.to_ascii_lowercase());
        }
    }
}

impl Ord for Name {
    /// Compares two `Name`s in DNSSEC canonical order.
    fn cmp(&self, other: &Self) -> Ordering {
        let self_offsets = self.label_offsets();
        let other_offsets = other.label_offsets();

        // Compare labels right to left, skipping the null label (which
        // every name shares).
        let mut self_iter = self_offsets.iter().rev().skip(1);
        let mut other_iter = other_offsets.iter().rev().skip(1);
        loop {
            match (self_iter.next(), other_iter.next()) {
                (Some(&self_off), Some(&other_off)) => {
                    let self_label = label_at(&self.wire, self_off as usize);
                    let other_label = label_at(&other.wire, other_off as usize);
                    match cmp_labels(self_label, other_label) {
                        Ordering::Equal => continue,
                        unequal => return unequal,
                    }
                }
                (Some(_), None) => return Ordering::Greater,
                (None, Some(_)) => return Ordering::Less,
                (None, None) => return Ordering::Equal,
            }
        }
    }
}

impl PartialOrd for Name {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn label_at(wire: &[u8], offset: usize) -> &[u8] {
    let len = wire[offset] as usize;
    &wire[offset + 1..offset + 1 + len]
}

fn cmp_labels(a: &[u8], b: &[u8]) -> Ordering {
    let a_iter = a.iter().map(u8::to_ascii_lowercase);
    let b_iter = b.iter().map(u8::to_ascii_lowercase);
    a_iter.cmp(b_iter)
}

////////////////////////////////////////////////////////////////////////
// CONVERSION TO AND FROM TEXT                                        //
////////////////////////////////////////////////////////////////////////

impl FromStr for Name {
    type Err = Error;

    /// Parses a domain name from its textual representation. The name
    /// must be fully qualified (ending with a dot). Escape sequences
    /// are not supported; this is a convenience for configuration and
    /// tests, not a zone-file parser.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if text == "." {
            return Ok(Self::root());
        }
        let without_final_dot = text.strip_suffix('.').ok_or(Error::NotFullyQualified)?;
        let mut wire = Vec::with_capacity(text.len() + 1);
        for label in without_final_dot.split('.') {
            if label.is_empty() {
                return Err(Error::EmptyLabel);
            } else if label.len() > MAX_LABEL_LEN {
                return Err(Error::LabelTooLong);
            }
            wire.push(label.len() as u8);
            wire.extend_from_slice(label.as_bytes());
        }
        wire.push(0);
        if wire.len() > MAX_WIRE_LEN {
            Err(Error::NameTooLong)
        } else {
            Ok(Self { wire: wire.into() })
        }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_root() {
            return f.write_str(".");
        }
        for label in self.labels() {
            for &octet in label {
                if octet.is_ascii_graphic() && octet != b'.' && octet != b'\\' {
                    write!(f, "{}", octet as char)?;
                } else {
                    write!(f, "\\{:03}", octet)?;
                }
            }
            f.write_str(".")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
