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

//! The error type for domain-name operations.

use std::fmt;

/// An error encountered while parsing or constructing a domain name.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Error {
    /// A label exceeds 63 octets.
    LabelTooLong,

    /// The name's wire representation exceeds 255 octets.
    NameTooLong,

    /// The textual representation contains an empty label.
    EmptyLabel,

    /// The textual representation does not end with a dot.
    NotFullyQualified,

    /// The wire data ended in the middle of a name.
    UnexpectedEnd,

    /// A label's type bits (the two most significant bits of the
    /// length octet) are neither 00 (ordinary label) nor 11
    /// (compression pointer).
    BadLabelType,

    /// A compression pointer points at or forward of its own position.
    ForwardPointer,

    /// More than the permitted number of compression pointers were
    /// followed while decoding a single name.
    TooManyPointers,

    /// A compression pointer was found where they are not permitted
    /// (e.g. in an uncompressed context).
    UnexpectedPointer,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::LabelTooLong => f.write_str("label exceeds 63 octets"),
            Self::NameTooLong => f.write_str("name exceeds 255 octets"),
            Self::EmptyLabel => f.write_str("empty label"),
            Self::NotFullyQualified => f.write_str("name is not fully qualified"),
            Self::UnexpectedEnd => f.write_str("data ended in the middle of a name"),
            Self::BadLabelType => f.write_str("unknown label type"),
            Self::ForwardPointer => f.write_str("compression pointer does not point backward"),
            Self::TooManyPointers => f.write_str("too many compression pointers"),
            Self::UnexpectedPointer => f.write_str("unexpected compression pointer"),
        }
    }
}

impl std::error::Error for Error {}
