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

//! Implementation of the [`Reader`] type to read on-the-wire DNS
//! messages.

use std::fmt;

use super::constants::*;
use super::{Opcode, Question, Rcode};
use crate::class::Class;
use crate::name::{self, Name};
use crate::rr::{Rdata, Ttl, Type};

////////////////////////////////////////////////////////////////////////
// READER                                                             //
////////////////////////////////////////////////////////////////////////

/// A "frame" around a buffer containing a DNS message that enables
/// reading the message data.
///
/// A `Reader` is constructed with its [`TryFrom`] implementation, which
/// requires the buffer to contain at least a full 12-octet DNS header.
///
/// Header fields are at fixed positions and can be read at any time.
/// Questions and resource records are read sequentially through a
/// cursor, initially positioned just past the header. The cursor
/// position is exposed as [`Reader::parsed_bytes`] and is valid even
/// after a read has failed: a caller that got at least the header can
/// still produce a FORMERR response carrying the received ID, locating
/// the failure at the cursor's byte offset.
#[derive(Eq, PartialEq)]
pub struct Reader<'a> {
    octets: &'a [u8],
    cursor: usize,
    mark: usize,
}

impl<'a> Reader<'a> {
    /// Returns the 16-bit ID of the message.
    pub fn id(&self) -> u16 {
        u16::from_be_bytes(self.octets[ID_START..ID_END].try_into().unwrap())
    }

    /// Returns whether the QR (query response) bit is set.
    pub fn qr(&self) -> bool {
        (self.octets[QR_BYTE] & QR_MASK) != 0
    }

    /// Returns the message's opcode.
    pub fn opcode(&self) -> Opcode {
        let raw = (self.octets[OPCODE_BYTE] & OPCODE_MASK) >> OPCODE_SHIFT;
        raw.try_into().unwrap()
    }

    /// Returns whether the AA (authoritative answer) bit is set.
    pub fn aa(&self) -> bool {
        (self.octets[AA_BYTE] & AA_MASK) != 0
    }

    /// Returns whether the TC (truncation) bit is set.
    pub fn tc(&self) -> bool {
        (self.octets[TC_BYTE] & TC_MASK) != 0
    }

    /// Returns whether the RD (recursion desired) bit is set.
    pub fn rd(&self) -> bool {
        (self.octets[RD_BYTE] & RD_MASK) != 0
    }

    /// Returns whether the RA (recursion available) bit is set.
    pub fn ra(&self) -> bool {
        (self.octets[RA_BYTE] & RA_MASK) != 0
    }

    /// Returns the RCODE of the message.
    pub fn rcode(&self) -> Rcode {
        let raw = self.octets[RCODE_BYTE] & RCODE_MASK;
        raw.try_into().unwrap()
    }

    /// Returns the number of questions in the message.
    pub fn qdcount(&self) -> u16 {
        u16::from_be_bytes(self.octets[QDCOUNT_START..QDCOUNT_END].try_into().unwrap())
    }

    /// Returns the number of answers in the message.
    pub fn ancount(&self) -> u16 {
        u16::from_be_bytes(self.octets[ANCOUNT_START..ANCOUNT_END].try_into().unwrap())
    }

    /// Returns the number of authority records in the message.
    pub fn nscount(&self) -> u16 {
        u16::from_be_bytes(self.octets[NSCOUNT_START..NSCOUNT_END].try_into().unwrap())
    }

    /// Returns the number of additional records in the message.
    pub fn arcount(&self) -> u16 {
        u16::from_be_bytes(self.octets[ARCOUNT_START..ARCOUNT_END].try_into().unwrap())
    }

    /// Returns the number of octets successfully consumed so far,
    /// including the header. This remains meaningful after a failed
    /// read.
    pub fn parsed_bytes(&self) -> usize {
        self.cursor
    }

    /// Records the current cursor position; a later [`Reader::rewind`]
    /// restores it.
    pub fn mark(&mut self) {
        self.mark = self.cursor;
    }

    /// Restores the cursor to the last marked position.
    pub fn rewind(&mut self) {
        self.cursor = self.mark;
    }

    /// Reads a [`Question`] starting at the current cursor.
    ///
    /// This method is atomic: the cursor is not changed on failure.
    pub fn read_question(&mut self) -> Result<Question> {
        let (qname, qname_len) = Name::try_from_compressed(self.octets, self.cursor)
            .map_err(|e| self.locate(ErrorKind::InvalidName(e)))?;
        let qname_end = self.cursor + qname_len;
        let qtype = self.read_u16_at(qname_end)?.into();
        let qclass = self.read_u16_at(qname_end + 2)?.into();
        self.cursor = qname_end + 4;
        Ok(Question {
            qname,
            qtype,
            qclass,
        })
    }

    /// Reads a resource record at the current cursor.
    ///
    /// This method is atomic: the cursor is not changed on failure.
    pub fn read_rr(&mut self) -> Result<ReadRr<'a>> {
        let (owner, owner_len) = Name::try_from_compressed(self.octets, self.cursor)
            .map_err(|e| self.locate(ErrorKind::InvalidName(e)))?;
        let owner_end = self.cursor + owner_len;
        let rr_type = Type::from(self.read_u16_at(owner_end)?);
        let class = Class::from(self.read_u16_at(owner_end + 2)?);
        let ttl_raw = self.read_u32_at(owner_end + 4)?;
        let rdlength = self.read_u16_at(owner_end + 8)? as usize;
        let rdata_start = owner_end + 10;
        let rdata_octets = self
            .octets
            .get(rdata_start..rdata_start + rdlength)
            .ok_or_else(|| self.locate(ErrorKind::UnexpectedEom))?;
        self.cursor = rdata_start + rdlength;
        Ok(ReadRr {
            owner,
            rr_type,
            class,
            ttl: Ttl::from(ttl_raw),
            ttl_raw,
            rdata: Rdata::from_unchecked(rdata_octets),
        })
    }

    /// Examines the resource record at the current cursor just enough
    /// to learn its type and total encoded length, without validating
    /// or decompressing it. The cursor does not move; use
    /// [`PeekRr::skip`] to move past the record.
    ///
    /// This is how superfluous records in received requests are stepped
    /// over while scanning for the pseudo-RRs (OPT) that matter, so an
    /// attacker cannot make the server spend time decompressing junk.
    pub fn peek_rr(&mut self) -> Result<PeekRr<'a, '_>> {
        // Walk the owner name without building it: ordinary labels
        // until a null label or the first compression pointer.
        let mut pos = self.cursor;
        let owner_end;
        loop {
            let len_octet = *self
                .octets
                .get(pos)
                .ok_or_else(|| self.locate(ErrorKind::UnexpectedEom))?;
            if len_octet == 0 {
                owner_end = pos + 1;
                break;
            } else if len_octet & 0xc0 == 0xc0 {
                owner_end = pos + 2;
                break;
            } else if len_octet > 63 {
                return Err(self.locate(ErrorKind::InvalidName(name::Error::BadLabelType)));
            } else {
                pos += 1 + len_octet as usize;
            }
        }
        let rr_type = Type::from(self.read_u16_at(owner_end)?);
        let rdlength = self.read_u16_at(owner_end + 8)? as usize;
        let end = owner_end + 10 + rdlength;
        if end > self.octets.len() {
            return Err(self.locate(ErrorKind::UnexpectedEom));
        }
        Ok(PeekRr {
            reader: self,
            rr_type,
            end,
        })
    }

    /// Returns whether the `Reader`'s cursor has reached the end of the
    /// message.
    pub fn at_eom(&self) -> bool {
        self.cursor >= self.octets.len()
    }

    fn read_u16_at(&self, pos: usize) -> Result<u16> {
        let array = self
            .octets
            .get(pos..pos + 2)
            .ok_or_else(|| self.locate(ErrorKind::UnexpectedEom))?;
        Ok(u16::from_be_bytes(array.try_into().unwrap()))
    }

    fn read_u32_at(&self, pos: usize) -> Result<u32> {
        let array = self
            .octets
            .get(pos..pos + 4)
            .ok_or_else(|| self.locate(ErrorKind::UnexpectedEom))?;
        Ok(u32::from_be_bytes(array.try_into().unwrap()))
    }

    fn locate(&self, kind: ErrorKind) -> Error {
        Error {
            kind,
            offset: self.cursor,
        }
    }
}

impl<'a> TryFrom<&'a [u8]> for Reader<'a> {
    type Error = Error;

    fn try_from(octets: &'a [u8]) -> Result<Self> {
        if octets.len() >= HEADER_SIZE {
            Ok(Self {
                octets,
                cursor: HEADER_SIZE,
                mark: HEADER_SIZE,
            })
        } else {
            Err(Error {
                kind: ErrorKind::HeaderTooShort,
                offset: octets.len(),
            })
        }
    }
}

impl fmt::Debug for Reader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Reader")
            .field("id", &self.id())
            .field("opcode", &self.opcode())
            .field("rcode", &self.rcode())
            .field("qdcount", &self.qdcount())
            .field("ancount", &self.ancount())
            .field("nscount", &self.nscount())
            .field("arcount", &self.arcount())
            .field("cursor", &self.cursor)
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////
// READ AND PEEKED RR STRUCTURES                                      //
////////////////////////////////////////////////////////////////////////

/// A fully parsed resource record as returned by [`Reader::read_rr`].
#[derive(Debug)]
pub struct ReadRr<'a> {
    pub owner: Name,
    pub rr_type: Type,
    pub class: Class,
    pub ttl: Ttl,

    /// The TTL field before [RFC 2181 § 8] clamping. Pseudo-RRs (OPT)
    /// overload this field with non-TTL data.
    pub ttl_raw: u32,

    pub rdata: &'a Rdata,
}

/// A minimally examined resource record as returned by
/// [`Reader::peek_rr`].
pub struct PeekRr<'a, 'r> {
    reader: &'r mut Reader<'a>,
    rr_type: Type,
    end: usize,
}

impl<'a> PeekRr<'a, '_> {
    /// Returns the record's type.
    pub fn rr_type(&self) -> Type {
        self.rr_type
    }

    /// Advances the cursor past the record without parsing it.
    pub fn skip(self) {
        self.reader.cursor = self.end;
    }

    /// Fully parses the record, advancing the cursor past it.
    pub fn parse(self) -> Result<ReadRr<'a>> {
        self.reader.read_rr()
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error signaling that part of a DNS message could not be read,
/// located at a byte offset within (or just past) the parsed data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Error {
    pub kind: ErrorKind,
    pub offset: usize,
}

/// The kinds of [`Error`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    HeaderTooShort,
    UnexpectedEom,
    InvalidName(name::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            ErrorKind::HeaderTooShort => write!(f, "header too short ({} octets)", self.offset),
            ErrorKind::UnexpectedEom => {
                write!(f, "unexpected end of message at offset {}", self.offset)
            }
            ErrorKind::InvalidName(err) => {
                write!(f, "invalid name at offset {}: {}", self.offset, err)
            }
        }
    }
}

impl std::error::Error for Error {}

/// The type returned by fallible [`Reader`] methods.
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::super::{Qclass, Qtype};
    use super::*;

    /// A response to a query for example.com. IN NS, including an OPT
    /// record, as captured from a recursive server.
    const EXAMPLE_COM_NS_MESSAGE: &[u8] =
        b"\xe2\xd7\x81\x80\x00\x01\x00\x02\x00\x00\x00\x01\x07\x65\x78\x61\
          \x6d\x70\x6c\x65\x03\x63\x6f\x6d\x00\x00\x02\x00\x01\xc0\x0c\x00\
          \x02\x00\x01\x00\x01\x50\xa2\x00\x14\x01\x61\x0c\x69\x61\x6e\x61\
          \x2d\x73\x65\x72\x76\x65\x72\x73\x03\x6e\x65\x74\x00\xc0\x0c\x00\
          \x02\x00\x01\x00\x01\x50\xa2\x00\x04\x01\x62\xc0\x2b\x00\x00\x29\
          \x10\x00\x00\x00\x00\x00\x00\x00";

    #[test]
    fn reader_works() {
        let mut reader = Reader::try_from(EXAMPLE_COM_NS_MESSAGE).unwrap();
        let expected_qname: Name = "example.com.".parse().unwrap();

        assert_eq!(reader.id(), 0xe2d7);
        assert!(reader.qr());
        assert_eq!(reader.opcode(), Opcode::QUERY);
        assert_eq!(reader.rcode(), Rcode::NOERROR);
        assert_eq!(reader.qdcount(), 1);
        assert_eq!(reader.ancount(), 2);
        assert_eq!(reader.arcount(), 1);

        let question = reader.read_question().unwrap();
        assert_eq!(question.qname, expected_qname);
        assert_eq!(question.qtype, Qtype::from(Type::NS));
        assert_eq!(question.qclass, Qclass::from(Class::IN));

        let answer_1 = reader.read_rr().unwrap();
        assert_eq!(answer_1.owner, expected_qname);
        assert_eq!(answer_1.rr_type, Type::NS);
        assert_eq!(answer_1.ttl, Ttl::from(86178));
        let expected_ns_a: Name = "a.iana-servers.net.".parse().unwrap();
        assert_eq!(answer_1.rdata.octets(), expected_ns_a.wire_repr());

        let answer_2 = reader.read_rr().unwrap();
        let expected_ns_b: Name = "b.iana-servers.net.".parse().unwrap();
        assert_eq!(answer_2.rdata.octets(), expected_ns_b.wire_repr());

        let opt = reader.read_rr().unwrap();
        assert!(opt.owner.is_root());
        assert_eq!(opt.rr_type, Type::OPT);
        assert_eq!(opt.class, Class::from(4096));
        assert!(opt.rdata.is_empty());

        assert!(reader.at_eom());
    }

    #[test]
    fn reader_constructor_rejects_short_message() {
        for size in 0..HEADER_SIZE {
            let buf = vec![0; size];
            let err = Reader::try_from(buf.as_slice()).unwrap_err();
            assert_eq!(err.kind, ErrorKind::HeaderTooShort);
        }
    }

    #[test]
    fn parsed_bytes_survives_failed_reads() {
        // A header claiming one question, followed by a truncated
        // question.
        let mut message = vec![0x12, 0x34, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        message.extend_from_slice(b"\x07exam");
        let mut reader = Reader::try_from(message.as_slice()).unwrap();
        let err = reader.read_question().unwrap_err();
        assert_eq!(reader.id(), 0x1234);
        assert_eq!(reader.parsed_bytes(), HEADER_SIZE);
        assert!(err.offset <= message.len());
    }

    #[test]
    fn peek_rr_skips_without_decompressing() {
        // An RR whose owner is a pointer into the question and whose
        // RDATA is junk; peek/skip must step over it without complaint.
        let mut message = vec![0, 0, 0, 0, 0, 1, 0, 1, 0, 0, 0, 0];
        message.extend_from_slice(b"\x07example\x00\x00\x01\x00\x01");
        message.extend_from_slice(b"\xc0\x0c\x00\x10\x00\x01\x00\x00\x00\x00\x00\x03junk-extra");
        let mut reader = Reader::try_from(message.as_slice()).unwrap();
        reader.read_question().unwrap();
        let peeked = reader.peek_rr().unwrap();
        assert_eq!(peeked.rr_type(), Type::TXT);
        peeked.skip();
        // Owner pointer (2) + fixed RR fields (10) + RDLENGTH 3.
        assert_eq!(reader.parsed_bytes(), 25 + 15);
    }
}
