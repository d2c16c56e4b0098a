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

//! Decoding of domain names from their on-the-wire representations.

use super::{Error, Name, MAX_LABEL_LEN, MAX_WIRE_LEN};

/// The maximum number of compression pointers that will be followed
/// while decoding a single name. A legitimate name cannot require more
/// than one pointer per label; this bound additionally stops
/// maliciously constructed pointer chains.
const MAX_POINTER_DEREFS: usize = 127;

/// The two most significant bits of a label length octet that begins a
/// compression pointer ([RFC 1035 § 4.1.4]).
///
/// [RFC 1035 § 4.1.4]: https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.4
const POINTER_MASK: u8 = 0xc0;

impl Name {
    /// Decodes a name in uncompressed wire format starting at the
    /// beginning of `octets`. On success, returns the `Name` and the
    /// number of octets it occupied. Trailing data is permitted.
    pub fn try_from_uncompressed(octets: &[u8]) -> Result<(Self, usize), Error> {
        let len = Self::validate_uncompressed(octets)?;
        Ok((
            Self::from_validated_wire(octets[..len].into()),
            len,
        ))
    }

    /// Decodes a name in uncompressed wire format that must occupy the
    /// *entirety* of `octets`.
    pub fn try_from_uncompressed_all(octets: &[u8]) -> Result<Self, Error> {
        let len = Self::validate_uncompressed(octets)?;
        if len == octets.len() {
            Ok(Self::from_validated_wire(octets.into()))
        } else {
            Err(Error::UnexpectedEnd)
        }
    }

    /// Validates a name in uncompressed wire format at the beginning of
    /// `octets`, returning its length.
    pub fn validate_uncompressed(octets: &[u8]) -> Result<usize, Error> {
        let mut cursor = 0;
        loop {
            let len = *octets.get(cursor).ok_or(Error::UnexpectedEnd)? as usize;
            if len == 0 {
                let total = cursor + 1;
                if total > MAX_WIRE_LEN {
                    return Err(Error::NameTooLong);
                }
                return Ok(total);
            } else if len > MAX_LABEL_LEN {
                return Err(if octets[cursor] & POINTER_MASK == POINTER_MASK {
                    Error::UnexpectedPointer
                } else {
                    Error::BadLabelType
                });
            }
            cursor += 1 + len;
            if cursor > MAX_WIRE_LEN {
                return Err(Error::NameTooLong);
            }
        }
    }

    /// Decodes a possibly compressed name within the DNS message
    /// `message`, starting at `start`. On success, returns the `Name`
    /// (with all pointers resolved) and the number of octets the name
    /// occupied at `start` (up to and including the terminating null
    /// label or the first compression pointer).
    ///
    /// Compression pointers must point strictly backward, and at most
    /// 127 of them will be followed; violations are decoding errors.
    pub fn try_from_compressed(message: &[u8], start: usize) -> Result<(Self, usize), Error> {
        let mut wire = Vec::with_capacity(32);
        let mut cursor = start;
        let mut consumed = None;
        let mut derefs = 0;

        loop {
            let len_octet = *message.get(cursor).ok_or(Error::UnexpectedEnd)?;
            if len_octet == 0 {
                wire.push(0);
                let consumed = consumed.unwrap_or(cursor + 1 - start);
                if wire.len() > MAX_WIRE_LEN {
                    return Err(Error::NameTooLong);
                }
                return Ok((Self::from_validated_wire(wire.into()), consumed));
            } else if len_octet & POINTER_MASK == POINTER_MASK {
                let second = *message.get(cursor + 1).ok_or(Error::UnexpectedEnd)?;
                let target = ((len_octet & !POINTER_MASK) as usize) << 8 | second as usize;
                if target >= cursor {
                    return Err(Error::ForwardPointer);
                }
                derefs += 1;
                if derefs > MAX_POINTER_DEREFS {
                    return Err(Error::TooManyPointers);
                }
                consumed.get_or_insert(cursor + 2 - start);
                cursor = target;
            } else if len_octet as usize > MAX_LABEL_LEN {
                return Err(Error::BadLabelType);
            } else {
                let len = len_octet as usize;
                let label = message
                    .get(cursor..cursor + 1 + len)
                    .ok_or(Error::UnexpectedEnd)?;
                wire.extend_from_slice(label);
                if wire.len() + 1 > MAX_WIRE_LEN {
                    return Err(Error::NameTooLong);
                }
                cursor += 1 + len;
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::super::Name;
    use super::*;

    #[test]
    fn uncompressed_decoding_works() {
        let buf = b"\x03www\x07example\x03com\x00trailing";
        let (name, len) = Name::try_from_uncompressed(buf).unwrap();
        assert_eq!(len, 17);
        assert_eq!(name, "www.example.com.".parse().unwrap());
    }

    #[test]
    fn uncompressed_all_rejects_trailing_data() {
        let buf = b"\x03www\x00x";
        assert_eq!(
            Name::try_from_uncompressed_all(buf),
            Err(Error::UnexpectedEnd),
        );
    }

    #[test]
    fn compressed_decoding_resolves_pointers() {
        // "example.com." at offset 0; "www" + pointer to 0 at offset 13.
        let mut message = Vec::new();
        message.extend_from_slice(b"\x07example\x03com\x00");
        message.extend_from_slice(b"\x03www\xc0\x00");
        let (name, consumed) = Name::try_from_compressed(&message, 13).unwrap();
        assert_eq!(consumed, 6);
        assert_eq!(name, "www.example.com.".parse().unwrap());
    }

    #[test]
    fn compressed_decoding_rejects_forward_pointers() {
        let message = b"\x03www\xc0\x08\x00\x00\x03foo\x00";
        assert_eq!(
            Name::try_from_compressed(message, 0),
            Err(Error::ForwardPointer),
        );
    }

    #[test]
    fn compressed_decoding_rejects_self_pointers() {
        let message = b"\xc0\x00";
        assert_eq!(
            Name::try_from_compressed(message, 0),
            Err(Error::ForwardPointer),
        );
    }

    #[test]
    fn compressed_decoding_limits_pointer_chains() {
        // A chain of pointers, each pointing at the one before it, with
        // a real name at the start. Every hop is strictly backward, so
        // only the dereference limit stops the decode.
        let mut message: Vec<u8> = b"\x01a\x00".to_vec();
        let mut prev: u16 = 0;
        for _ in 0..200 {
            let here = message.len() as u16;
            message.extend_from_slice(&(0xc000u16 | prev).to_be_bytes());
            prev = here;
        }
        assert_eq!(
            Name::try_from_compressed(&message, prev as usize),
            Err(Error::TooManyPointers),
        );
    }

    #[test]
    fn decoding_enforces_total_length() {
        // 128 one-octet labels (256 octets with the null label) is one
        // label too many.
        let mut buf = Vec::new();
        for _ in 0..128 {
            buf.extend_from_slice(b"\x01x");
        }
        buf.push(0);
        assert_eq!(
            Name::try_from_uncompressed(&buf).unwrap_err(),
            Error::NameTooLong,
        );
    }
}
