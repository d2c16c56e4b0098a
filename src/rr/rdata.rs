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

//! Provides the [`Rdata`] type for DNS record data.

use std::fmt;

use crate::name::Name;

/// The RDATA of a DNS resource record.
///
/// This is an unsized newtype over `[u8]`, used through `&Rdata`. The
/// only validation it performs is the wire-format length limit of
/// 65,535 octets; the octets themselves are opaque to the core, which
/// stores and serves record data without interpreting it (apart from
/// the few well-known offsets used for glue processing and SOA
/// fields).
#[derive(Eq, PartialEq)]
#[repr(transparent)]
pub struct Rdata([u8]);

impl Rdata {
    /// Converts a byte slice into an `&Rdata` without checking the
    /// length limit.
    pub(crate) fn from_unchecked(octets: &[u8]) -> &Self {
        // SAFETY: Rdata is a transparent wrapper around [u8].
        unsafe { &*(octets as *const [u8] as *const Self) }
    }

    /// Returns the underlying octets.
    pub fn octets(&self) -> &[u8] {
        &self.0
    }

    /// Returns the length of the RDATA in octets.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns whether the RDATA is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reads the domain name serialized (uncompressed) at `start`,
    /// running to at most the end of the RDATA.
    pub fn name_at(&self, start: usize) -> Option<Name> {
        let octets = self.0.get(start..)?;
        Name::try_from_uncompressed(octets)
            .ok()
            .map(|(name, _)| name)
    }
}

impl<'a> TryFrom<&'a [u8]> for &'a Rdata {
    type Error = RdataTooLongError;

    fn try_from(octets: &'a [u8]) -> Result<Self, Self::Error> {
        if octets.len() > u16::MAX as usize {
            Err(RdataTooLongError)
        } else {
            Ok(Rdata::from_unchecked(octets))
        }
    }
}

impl fmt::Debug for Rdata {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Rdata({} octets)", self.0.len())
    }
}

/// An error signaling that a byte slice is too long to be the RDATA of
/// a single record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RdataTooLongError;

impl fmt::Display for RdataTooLongError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("RDATA exceeds 65,535 octets")
    }
}

impl std::error::Error for RdataTooLongError {}

////////////////////////////////////////////////////////////////////////
// SOA FIELD ACCESS                                                   //
////////////////////////////////////////////////////////////////////////

/// Accessors for the fields of SOA RDATA that the serving core needs.
/// These walk the two leading domain names rather than assuming fixed
/// offsets.
impl Rdata {
    /// Returns the SERIAL field of SOA RDATA.
    pub fn soa_serial(&self) -> Option<u32> {
        self.soa_integer_field(0)
    }

    /// Returns the MINIMUM field of SOA RDATA.
    pub fn soa_minimum(&self) -> Option<u32> {
        self.soa_integer_field(16)
    }

    /// Reads the 32-bit integer at `offset` octets past the end of the
    /// SOA MNAME and RNAME fields.
    fn soa_integer_field(&self, offset: usize) -> Option<u32> {
        let mname_len = Name::validate_uncompressed(&self.0).ok()?;
        let rname_len = Name::validate_uncompressed(self.0.get(mname_len..)?).ok()?;
        let octets = self.0.get(mname_len + rname_len + offset..)?.get(..4)?;
        Some(u32::from_be_bytes(octets.try_into().unwrap()))
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn soa_rdata() -> Vec<u8> {
        let mut rdata = Vec::new();
        rdata.extend_from_slice(b"\x03ns1\x07example\x00");
        rdata.extend_from_slice(b"\x05admin\x07example\x00");
        rdata.extend_from_slice(&2023070100u32.to_be_bytes()); // SERIAL
        rdata.extend_from_slice(&3600u32.to_be_bytes()); // REFRESH
        rdata.extend_from_slice(&900u32.to_be_bytes()); // RETRY
        rdata.extend_from_slice(&1209600u32.to_be_bytes()); // EXPIRE
        rdata.extend_from_slice(&300u32.to_be_bytes()); // MINIMUM
        rdata
    }

    #[test]
    fn soa_fields_are_read_past_the_names() {
        let rdata_buf = soa_rdata();
        let rdata = <&Rdata>::try_from(rdata_buf.as_slice()).unwrap();
        assert_eq!(rdata.soa_serial(), Some(2023070100));
        assert_eq!(rdata.soa_minimum(), Some(300));
    }

    #[test]
    fn truncated_soa_rdata_yields_none() {
        let rdata_buf = soa_rdata();
        let rdata = <&Rdata>::try_from(&rdata_buf[..rdata_buf.len() - 1]).unwrap();
        assert_eq!(rdata.soa_minimum(), None);
    }
}
