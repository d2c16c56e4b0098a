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

//! Implementation of the [`Writer`] type to write on-the-wire DNS
//! messages.

use std::fmt;

use arrayvec::ArrayVec;

use super::constants::*;
use super::{ExtendedRcode, Opcode, Question, Rcode};
use crate::class::Class;
use crate::name::Name;
use crate::rr::{Rdata, Rrset, Ttl, Type};

/// The number of previously written names remembered for compression.
/// Once the table is full, further names are written uncompressed,
/// which is always wire-legal.
const MAX_PRIOR_NAMES: usize = 24;

/// The encoded size of an OPT record with empty RDATA, reserved when
/// EDNS is enabled: root owner (1) + TYPE (2) + CLASS (2) + TTL (4) +
/// RDLENGTH (2).
const OPT_RR_SIZE: usize = 11;

////////////////////////////////////////////////////////////////////////
// WRITER                                                             //
////////////////////////////////////////////////////////////////////////

/// A "frame" around a buffer that serializes a DNS message into it.
///
/// A `Writer` is constructed with [`Writer::new`], which takes the
/// underlying buffer and a message size limit (the smaller of the
/// buffer length and the transport's limit). The buffer must
/// accommodate at least a full 12-octet header; the header is zeroed
/// on construction.
///
/// Header fields are at fixed positions and may be set at any time.
/// Questions and resource records are serialized sequentially, so the
/// section methods must be used in order (question, answer, authority,
/// additional); out-of-order use fails with [`Error::OutOfOrder`].
/// Running out of room fails with [`Error::Truncation`], leaving the
/// message exactly as it was before the failing call, so the caller
/// can decide between dropping optional records and setting TC.
///
/// Owner names are compressed by suffix-matching against names already
/// written ([RFC 1035 § 4.1.4]); names embedded in RDATA are always
/// written verbatim, which is legal for every RR type. For EDNS
/// messages, [`Writer::set_edns`] reserves room for an OPT record,
/// which [`Writer::finish`] appends along with the final section
/// counts.
///
/// [RFC 1035 § 4.1.4]: https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.4
pub struct Writer<'a> {
    octets: &'a mut [u8],
    cursor: usize,
    limit: usize,
    reserved: usize,
    rr_start: usize,
    section: Section,
    qdcount: u16,
    ancount: u16,
    nscount: u16,
    arcount: u16,
    prior_names: ArrayVec<PriorName, MAX_PRIOR_NAMES>,
    edns: Option<Edns>,
}

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
enum Section {
    Question,
    Answer,
    Authority,
    Additional,
}

struct PriorName {
    offset: u16,
    name: Name,
}

#[derive(Clone, Copy)]
struct Edns {
    payload_size: u16,
    extended_rcode_upper_bits: u8,
}

impl<'a> Writer<'a> {
    /// Creates a new `Writer` serializing into `buf`, producing a
    /// message no longer than `limit` octets. The effective limit is
    /// the smaller of `limit` and the buffer length, and must be at
    /// least [`HEADER_SIZE`].
    pub fn new(buf: &'a mut [u8], limit: usize) -> Result<Self> {
        let limit = limit.min(buf.len());
        if limit < HEADER_SIZE {
            return Err(Error::BufferTooShort);
        }
        buf[..HEADER_SIZE].fill(0);
        Ok(Self {
            octets: buf,
            cursor: HEADER_SIZE,
            limit,
            reserved: 0,
            rr_start: HEADER_SIZE,
            section: Section::Question,
            qdcount: 0,
            ancount: 0,
            nscount: 0,
            arcount: 0,
            prior_names: ArrayVec::new(),
            edns: None,
        })
    }

    /// Sets the 16-bit ID of the message.
    pub fn set_id(&mut self, id: u16) {
        self.octets[ID_START..ID_END].copy_from_slice(&id.to_be_bytes());
    }

    /// Sets or clears the QR (query response) bit.
    pub fn set_qr(&mut self, qr: bool) {
        self.set_flag(QR_BYTE, QR_MASK, qr);
    }

    /// Sets the message's opcode.
    pub fn set_opcode(&mut self, opcode: Opcode) {
        self.octets[OPCODE_BYTE] &= !OPCODE_MASK;
        self.octets[OPCODE_BYTE] |= u8::from(opcode) << OPCODE_SHIFT;
    }

    /// Sets or clears the AA (authoritative answer) bit.
    pub fn set_aa(&mut self, aa: bool) {
        self.set_flag(AA_BYTE, AA_MASK, aa);
    }

    /// Sets or clears the TC (truncation) bit.
    pub fn set_tc(&mut self, tc: bool) {
        self.set_flag(TC_BYTE, TC_MASK, tc);
    }

    /// Sets or clears the RD (recursion desired) bit.
    pub fn set_rd(&mut self, rd: bool) {
        self.set_flag(RD_BYTE, RD_MASK, rd);
    }

    /// Sets or clears the RA (recursion available) bit.
    pub fn set_ra(&mut self, ra: bool) {
        self.set_flag(RA_BYTE, RA_MASK, ra);
    }

    fn set_flag(&mut self, byte: usize, mask: u8, value: bool) {
        if value {
            self.octets[byte] |= mask;
        } else {
            self.octets[byte] &= !mask;
        }
    }

    /// Returns the message's current RCODE.
    pub fn rcode(&self) -> Rcode {
        (self.octets[RCODE_BYTE] & RCODE_MASK).try_into().unwrap()
    }

    /// Sets the message's RCODE. In an EDNS message, this clears the
    /// eight-bit extension of the RCODE carried in the OPT TTL field.
    pub fn set_rcode(&mut self, rcode: Rcode) {
        self.octets[RCODE_BYTE] &= !RCODE_MASK;
        self.octets[RCODE_BYTE] |= u8::from(rcode);
        if let Some(ref mut edns) = self.edns {
            edns.extended_rcode_upper_bits = 0;
        }
    }

    /// Sets the message's extended RCODE. Values above 15 require EDNS;
    /// setting one without EDNS enabled fails with [`Error::NotEdns`].
    pub fn set_extended_rcode(&mut self, rcode: ExtendedRcode) -> Result<()> {
        match self.edns {
            Some(ref mut edns) => {
                edns.extended_rcode_upper_bits = rcode.upper_bits();
                self.octets[RCODE_BYTE] &= !RCODE_MASK;
                self.octets[RCODE_BYTE] |= u8::from(rcode.header_rcode());
                Ok(())
            }
            None if u16::from(rcode) < 16 => {
                self.set_rcode(rcode.header_rcode());
                Ok(())
            }
            None => Err(Error::NotEdns),
        }
    }

    /// Enables EDNS on the message. Room for an OPT record advertising
    /// `payload_size` is reserved; the record itself is appended by
    /// [`Writer::finish`].
    pub fn set_edns(&mut self, payload_size: u16) -> Result<()> {
        if self.edns.is_none() {
            if self.cursor + self.reserved + OPT_RR_SIZE > self.limit {
                return Err(Error::Truncation);
            }
            self.reserved += OPT_RR_SIZE;
        }
        let upper_bits = self
            .edns
            .map(|e| e.extended_rcode_upper_bits)
            .unwrap_or(0);
        self.edns = Some(Edns {
            payload_size,
            extended_rcode_upper_bits: upper_bits,
        });
        Ok(())
    }

    /// Returns whether EDNS is enabled on the message.
    pub fn is_edns(&self) -> bool {
        self.edns.is_some()
    }

    /// Returns the current number of answer RRs in the message.
    pub fn ancount(&self) -> u16 {
        self.ancount
    }

    /// Adds a question to the message. Questions must precede all
    /// resource records.
    pub fn add_question(&mut self, question: &Question) -> Result<()> {
        if self.section != Section::Question {
            return Err(Error::OutOfOrder);
        }
        self.with_rollback(|this| {
            this.write_name(&question.qname, true)?;
            this.write_u16(question.qtype.into())?;
            this.write_u16(question.qclass.into())
        })?;
        self.qdcount += 1;
        self.rr_start = self.cursor;
        Ok(())
    }

    /// Adds a single resource record to the answer section.
    pub fn add_answer_rr(
        &mut self,
        owner: &Name,
        rr_type: Type,
        class: Class,
        ttl: Ttl,
        rdata: &Rdata,
    ) -> Result<()> {
        self.enter_section(Section::Answer)?;
        self.write_rr(owner, rr_type, class, ttl, rdata)?;
        self.ancount += 1;
        Ok(())
    }

    /// Adds all records of `rrset`, owned by `owner`, to the answer
    /// section. On failure nothing is added.
    pub fn add_answer_rrset(
        &mut self,
        owner: &Name,
        class: Class,
        rrset: &Rrset,
    ) -> Result<()> {
        self.enter_section(Section::Answer)?;
        let n = self.write_rrset(owner, class, rrset)?;
        self.ancount += n;
        Ok(())
    }

    /// Adds a single resource record to the authority section.
    pub fn add_authority_rr(
        &mut self,
        owner: &Name,
        rr_type: Type,
        class: Class,
        ttl: Ttl,
        rdata: &Rdata,
    ) -> Result<()> {
        self.enter_section(Section::Authority)?;
        self.write_rr(owner, rr_type, class, ttl, rdata)?;
        self.nscount += 1;
        Ok(())
    }

    /// Adds all records of `rrset`, owned by `owner`, to the authority
    /// section. On failure nothing is added.
    pub fn add_authority_rrset(
        &mut self,
        owner: &Name,
        class: Class,
        rrset: &Rrset,
    ) -> Result<()> {
        self.enter_section(Section::Authority)?;
        let n = self.write_rrset(owner, class, rrset)?;
        self.nscount += n;
        Ok(())
    }

    /// Adds all records of `rrset`, owned by `owner`, to the additional
    /// section. On failure nothing is added.
    pub fn add_additional_rrset(
        &mut self,
        owner: &Name,
        class: Class,
        rrset: &Rrset,
    ) -> Result<()> {
        self.enter_section(Section::Additional)?;
        let n = self.write_rrset(owner, class, rrset)?;
        self.arcount += n;
        Ok(())
    }

    /// Removes all resource records from the message, leaving the
    /// header and question intact. This is the rewrite step for
    /// truncated UDP responses and SERVFAIL conversions.
    pub fn clear_rrs(&mut self) {
        self.cursor = self.rr_start;
        self.section = if self.qdcount > 0 {
            Section::Answer
        } else {
            Section::Question
        };
        self.ancount = 0;
        self.nscount = 0;
        self.arcount = 0;
        // Names at or past the cursor are gone; forget them.
        self.prior_names
            .retain(|prior| (prior.offset as usize) < self.rr_start);
        // Keep the truncated-message invariant simple: after a clear,
        // the writer is back in the state right after the question was
        // added, except that header flags and EDNS state persist.
    }

    /// Finalizes the message: appends the OPT record if EDNS is
    /// enabled, writes the section counts into the header, and returns
    /// the total message length.
    pub fn finish(mut self) -> usize {
        if let Some(edns) = self.edns {
            // The reservation guarantees this fits.
            self.octets[self.cursor] = 0; // root owner
            let type_start = self.cursor + 1;
            self.octets[type_start..type_start + 2]
                .copy_from_slice(&u16::from(Type::OPT).to_be_bytes());
            self.octets[type_start + 2..type_start + 4]
                .copy_from_slice(&edns.payload_size.to_be_bytes());
            // TTL field: extended RCODE upper bits, version 0, no
            // flags.
            let ttl_field = [edns.extended_rcode_upper_bits, 0, 0, 0];
            self.octets[type_start + 4..type_start + 8].copy_from_slice(&ttl_field);
            self.octets[type_start + 8..type_start + 10].copy_from_slice(&0u16.to_be_bytes());
            self.cursor += OPT_RR_SIZE;
            self.arcount += 1;
        }
        self.octets[QDCOUNT_START..QDCOUNT_END].copy_from_slice(&self.qdcount.to_be_bytes());
        self.octets[ANCOUNT_START..ANCOUNT_END].copy_from_slice(&self.ancount.to_be_bytes());
        self.octets[NSCOUNT_START..NSCOUNT_END].copy_from_slice(&self.nscount.to_be_bytes());
        self.octets[ARCOUNT_START..ARCOUNT_END].copy_from_slice(&self.arcount.to_be_bytes());
        self.cursor
    }

    ////////////////////////////////////////////////////////////////////
    // SERIALIZATION INTERNALS                                        //
    ////////////////////////////////////////////////////////////////////

    fn enter_section(&mut self, section: Section) -> Result<()> {
        if self.section > section {
            Err(Error::OutOfOrder)
        } else {
            self.section = section;
            Ok(())
        }
    }

    fn write_rrset(&mut self, owner: &Name, class: Class, rrset: &Rrset) -> Result<u16> {
        let mut n = 0;
        self.with_rollback(|this| {
            for rdata in rrset.rdatas() {
                this.write_rr_impl(owner, rrset.rr_type, class, rrset.ttl, rdata)?;
                n += 1;
            }
            Ok(())
        })?;
        Ok(n)
    }

    fn write_rr(
        &mut self,
        owner: &Name,
        rr_type: Type,
        class: Class,
        ttl: Ttl,
        rdata: &Rdata,
    ) -> Result<()> {
        self.with_rollback(|this| this.write_rr_impl(owner, rr_type, class, ttl, rdata))
    }

    fn write_rr_impl(
        &mut self,
        owner: &Name,
        rr_type: Type,
        class: Class,
        ttl: Ttl,
        rdata: &Rdata,
    ) -> Result<()> {
        self.write_name(owner, true)?;
        self.write_u16(rr_type.into())?;
        self.write_u16(class.into())?;
        self.write_u32(u32::from(ttl))?;
        self.write_u16(rdata.len() as u16)?;
        self.write_octets(rdata.octets())
    }

    /// Writes a domain name, compressing by suffix match against
    /// previously written names when `compress` is set.
    fn write_name(&mut self, name: &Name, compress: bool) -> Result<()> {
        let start = self.cursor;
        if compress {
            // Try each suffix of the name, longest first. A whole-name
            // match produces a bare pointer; a partial match produces
            // the leading labels followed by a pointer.
            let mut suffix = Some(name.clone());
            let mut skipped = 0;
            while let Some(candidate) = suffix {
                if let Some(target) = self.find_prior(&candidate) {
                    let offsets = name.label_offsets();
                    let lead_end = offsets[skipped] as usize;
                    self.write_octets(&name.wire_repr()[..lead_end])?;
                    self.write_u16(0xc000 | target)?;
                    self.record_prior(name, start);
                    return Ok(());
                }
                suffix = candidate.parent();
                skipped += 1;
            }
        }
        self.write_octets(name.wire_repr())?;
        self.record_prior(name, start);
        Ok(())
    }

    fn find_prior(&self, name: &Name) -> Option<u16> {
        if name.is_root() {
            // A pointer to the root name never saves space.
            return None;
        }
        self.prior_names
            .iter()
            .find(|prior| &prior.name == name)
            .map(|prior| prior.offset)
    }

    fn record_prior(&mut self, name: &Name, offset: usize) {
        if offset <= POINTER_MAX && !self.prior_names.is_full() {
            self.prior_names.push(PriorName {
                offset: offset as u16,
                name: name.clone(),
            });
        }
    }

    fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_octets(&value.to_be_bytes())
    }

    fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_octets(&value.to_be_bytes())
    }

    fn write_octets(&mut self, octets: &[u8]) -> Result<()> {
        if self.cursor + octets.len() + self.reserved > self.limit {
            Err(Error::Truncation)
        } else {
            self.octets[self.cursor..self.cursor + octets.len()].copy_from_slice(octets);
            self.cursor += octets.len();
            Ok(())
        }
    }

    /// Executes `f`; if it fails, the cursor and compression table are
    /// restored so the message is unchanged.
    fn with_rollback(&mut self, f: impl FnOnce(&mut Self) -> Result<()>) -> Result<()> {
        let saved_cursor = self.cursor;
        let saved_priors = self.prior_names.len();
        match f(self) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.cursor = saved_cursor;
                self.prior_names.truncate(saved_priors);
                Err(e)
            }
        }
    }
}

impl fmt::Debug for Writer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Writer")
            .field("cursor", &self.cursor)
            .field("limit", &self.limit)
            .field("section", &self.section)
            .field("qdcount", &self.qdcount)
            .field("ancount", &self.ancount)
            .field("nscount", &self.nscount)
            .field("arcount", &self.arcount)
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error signaling that part of a DNS message could not be written.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Error {
    /// The buffer cannot hold a DNS message header.
    BufferTooShort,

    /// The data does not fit within the message size limit.
    Truncation,

    /// Sections were written out of order.
    OutOfOrder,

    /// The operation requires EDNS, which is not enabled.
    NotEdns,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::BufferTooShort => f.write_str("buffer cannot hold a DNS header"),
            Self::Truncation => f.write_str("message size limit exceeded"),
            Self::OutOfOrder => f.write_str("sections written out of order"),
            Self::NotEdns => f.write_str("EDNS is not enabled"),
        }
    }
}

impl std::error::Error for Error {}

/// The type returned by fallible [`Writer`] methods.
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
