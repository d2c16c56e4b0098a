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

//! The query-processing layer abstraction.
//!
//! All query handling in this crate — serving a received question,
//! producing an outbound NOTIFY — is expressed as a [`Layer`]: a state
//! machine driven through `begin`, `consume`, and `produce` until it
//! reaches a terminal state, then released with `finish`. The server's
//! [`QueryProcessor`](crate::server::QueryProcessor) is one
//! implementation; the [`NotifyLayer`](crate::notify::NotifyLayer)
//! driven by the [`Requestor`](crate::requestor::Requestor) is
//! another. Transports share one driving convention instead of each
//! owning a bespoke handler interface.
//!
//! Per-query parameters (the received datagram's metadata, the zone
//! lease, the NOTIFY content) are supplied when the concrete layer
//! value is constructed; the trait itself only moves packets.

/// The state of a [`Layer`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    /// The layer has an outgoing packet to emit; call
    /// [`Layer::produce`].
    Produce,

    /// The layer is waiting for an incoming packet; call
    /// [`Layer::consume`].
    Consume,

    /// The layer finished successfully. If the last `produce` wrote a
    /// packet, it should be shipped.
    Done,

    /// The layer failed terminally, but may still produce a final
    /// (error) packet; keep calling [`Layer::produce`].
    Fail,

    /// The layer wants to restart its output (used by multi-message
    /// exchanges to begin a fresh packet).
    Reset,
}

impl State {
    /// Returns whether the layer still has output to produce.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Produce | Self::Fail)
    }
}

/// An outgoing packet buffer handed to [`Layer::produce`].
///
/// The buffer's contents up to [`OutPacket::len`] are the packet to
/// send. The arena-owning caller supplies the buffer; layers only
/// write into it.
pub struct OutPacket<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> OutPacket<'a> {
    /// Wraps `buf` as an empty outgoing packet.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    /// Returns the whole writable buffer.
    pub fn buf(&mut self) -> &mut [u8] {
        self.buf
    }

    /// Records that `len` octets of the buffer now hold the packet.
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.buf.len());
        self.len = len;
    }

    /// Returns the length of the packet written so far.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns whether any packet has been written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the written packet.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// A query-processing layer.
///
/// The driving convention is:
///
/// 1. `begin` — returns the initial state: [`State::Consume`] for
///    server-side layers, [`State::Produce`] for client-side layers.
/// 2. `consume` — feed an incoming packet; the layer may move to
///    [`State::Produce`] (it has a response), [`State::Done`], or
///    [`State::Fail`].
/// 3. `produce` — while the state [is active](State::is_active), let
///    the layer write output. A layer in [`State::Fail`] gets the
///    chance to emit a final error packet.
/// 4. `finish` — always called last; releases layer-local state. The
///    per-query arena remains the caller's to flush.
///
/// The packet written by the final `produce` is shipped only if the
/// terminal state is [`State::Done`].
pub trait Layer {
    /// Starts processing, returning the initial state.
    fn begin(&mut self) -> State;

    /// Feeds an incoming packet to the layer.
    fn consume(&mut self, wire: &[u8]) -> State;

    /// Lets the layer write an outgoing packet.
    fn produce(&mut self, out: &mut OutPacket<'_>) -> State;

    /// Releases per-query layer state.
    fn finish(&mut self);
}

/// Drives a server-side layer over a single received packet, the way
/// the datagram pipeline uses it: begin, consume the input, produce
/// while active, finish. Returns the terminal state; the caller ships
/// `out` only if it is [`State::Done`] and `out` is non-empty.
pub fn serve_one<L: Layer>(layer: &mut L, wire: &[u8], out: &mut OutPacket<'_>) -> State {
    let mut state = layer.begin();
    if state == State::Consume {
        state = layer.consume(wire);
    }
    while state.is_active() {
        state = layer.produce(out);
    }
    layer.finish();
    state
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
