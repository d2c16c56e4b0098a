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

//! Per-connection QUIC state: the TLS session, packet protection, and
//! DNS message streams.
//!
//! The handshake is driven exactly the way the layer above expects:
//! received CRYPTO frame bytes are fed into the `rustls` session, and
//! whatever handshake bytes the session emits are drained back out
//! into CRYPTO frames, packetized in the appropriate packet space.
//! Once the handshake completes, bidirectional streams carry DNS
//! messages with a 2-byte length prefix ([RFC 9250 § 4.2]); each
//! complete message is handed up for resolution and the response is
//! written back to the same stream.
//!
//! [RFC 9250 § 4.2]: https://datatracker.ietf.org/doc/html/rfc9250#section-4.2

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use log::debug;
use rustls::quic::{KeyChange, Keys, ServerConnection, Version};
use rustls::{ServerConfig, Side};

use super::packet::{
    put_ack_frame, put_crypto_frame, put_handshake_done_frame, put_stream_frame, put_varint,
    ConnectionId, Frame, FrameIter, Packet, Space, QUIC_VERSION,
};

/// The AEAD tag length for every cipher suite QUIC v1 uses.
const TAG_LEN: usize = 16;

/// The packet number length this server encodes (two octets is plenty
/// for short-lived serving connections).
const PN_LEN: usize = 2;

/// Largest DNS message accepted over one stream.
const MAX_STREAM_MESSAGE: usize = 65535 + 2;

////////////////////////////////////////////////////////////////////////
// PER-SPACE STATE                                                    //
////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct SpaceState {
    keys: Option<Keys>,
    next_send_pn: u64,
    largest_recv_pn: Option<u64>,
    crypto_rx_offset: u64,
    crypto_tx_offset: u64,
}

fn space_index(space: Space) -> usize {
    match space {
        Space::Initial => 0,
        Space::Handshake => 1,
        Space::OneRtt => 2,
    }
}

////////////////////////////////////////////////////////////////////////
// STREAM REASSEMBLY                                                  //
////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct StreamAssembly {
    buf: Vec<u8>,
    fin: bool,
    answered: bool,
}

impl StreamAssembly {
    /// Returns the complete DNS message once the 2-byte length prefix
    /// is satisfied and FIN has arrived.
    fn take_message(&mut self) -> Option<Vec<u8>> {
        if self.answered || !self.fin || self.buf.len() < 2 {
            return None;
        }
        let expected = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < 2 + expected {
            return None;
        }
        self.answered = true;
        Some(self.buf[2..2 + expected].to_vec())
    }
}

////////////////////////////////////////////////////////////////////////
// CONNECTIONS                                                        //
////////////////////////////////////////////////////////////////////////

/// One QUIC connection owned by one worker's demultiplexer.
pub struct Connection {
    /// The connection ID this server issued; incoming packets carry it
    /// as their DCID, and the table keys on it.
    dcid: ConnectionId,

    /// The client's source connection ID; outgoing packets carry it as
    /// their DCID.
    peer_cid: ConnectionId,

    /// The most recent peer address; updated on every datagram so the
    /// connection follows NAT rebinding.
    peer: SocketAddr,

    created: Instant,
    last_activity: Instant,
    session: Option<ServerConnection>,
    spaces: [SpaceState; 3],
    streams: HashMap<u64, StreamAssembly>,

    /// Complete DNS messages awaiting resolution, by stream.
    ready: Vec<(u64, Vec<u8>)>,

    /// Handshake flights drained from the session, not yet packetized.
    flights: Vec<(Space, Vec<u8>)>,

    /// Application frames queued for the next 1-RTT packet.
    pending_app_frames: Vec<u8>,

    /// Read keys for client early data, once the session has accepted
    /// a 0-RTT handshake.
    early_keys: Option<rustls::quic::DirectionalKeys>,

    handshake_done_sent: bool,
    closed: bool,

    /// Intrusive chain link, owned by the connection table.
    pub(super) next: Option<usize>,
}

impl Connection {
    /// Accepts a connection from a validated INITIAL packet.
    ///
    /// `packet_dcid` is the DCID the INITIAL arrived with; the initial
    /// packet-protection keys derive from it. When the client came
    /// back through a retry, `original_dcid` is the DCID recovered
    /// from the token (the one the very first INITIAL carried), which
    /// the transport parameters must echo along with the retry CID.
    pub fn accept(
        our_cid: ConnectionId,
        client_scid: ConnectionId,
        peer: SocketAddr,
        tls_config: Arc<ServerConfig>,
        packet_dcid: &ConnectionId,
        original_dcid: Option<ConnectionId>,
    ) -> Result<Self, rustls::Error> {
        let retry_scid = original_dcid.is_some().then_some(packet_dcid);
        let original = original_dcid.as_ref().unwrap_or(packet_dcid);
        let params = transport_parameters(original, retry_scid, &our_cid);
        let session = ServerConnection::new(tls_config, Version::V1, params)?;
        let mut conn = Self::empty(our_cid, client_scid, peer);
        conn.session = Some(session);
        conn.spaces[space_index(Space::Initial)].keys = Some(Keys::initial(
            Version::V1,
            packet_dcid.as_slice(),
            Side::Server,
        ));
        Ok(conn)
    }

    fn empty(dcid: ConnectionId, peer_cid: ConnectionId, peer: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            dcid,
            peer_cid,
            peer,
            created: now,
            last_activity: now,
            session: None,
            spaces: Default::default(),
            streams: HashMap::new(),
            ready: Vec::new(),
            flights: Vec::new(),
            pending_app_frames: Vec::new(),
            early_keys: None,
            handshake_done_sent: false,
            closed: false,
            next: None,
        }
    }

    /// Returns the table key (the server-issued connection ID).
    pub fn dcid(&self) -> &ConnectionId {
        &self.dcid
    }

    /// Returns the most recent peer address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Returns when the connection last made progress.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Returns when the connection was accepted.
    pub fn created(&self) -> Instant {
        self.created
    }

    /// Returns whether the connection has been closed (by the peer or
    /// by a fatal TLS alert).
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns whether the TLS handshake has completed.
    pub fn is_established(&self) -> bool {
        self.session
            .as_ref()
            .map_or(false, |session| !session.is_handshaking())
    }

    /// Processes one received packet in `space`, updating the peer
    /// association. Undecryptable packets are dropped without touching
    /// connection state.
    pub fn recv_packet(&mut self, space: Space, packet: &Packet<'_>, peer: SocketAddr) {
        let plaintext = match self.decrypt_packet(space, packet) {
            Some(plaintext) => plaintext,
            None => return,
        };
        self.process_payload(space, plaintext, peer);
    }

    /// Processes a 0-RTT packet carrying early data. Early data shares
    /// the application packet number space and is readable as soon as
    /// the session accepts the 0-RTT handshake; queries received this
    /// way are answered once the 1-RTT keys exist.
    pub fn recv_zero_rtt_packet(&mut self, packet: &Packet<'_>, peer: SocketAddr) {
        let plaintext = match self.decrypt_early_packet(packet) {
            Some(plaintext) => plaintext,
            None => return,
        };
        self.process_payload(Space::OneRtt, plaintext, peer);
    }

    fn process_payload(&mut self, space: Space, plaintext: Vec<u8>, peer: SocketAddr) {
        self.peer = peer;
        self.last_activity = Instant::now();

        for frame in FrameIter::new(&plaintext) {
            match frame {
                Frame::Padding | Frame::Ping | Frame::Ack => (),
                Frame::Crypto { offset, data } => self.recv_crypto(space, offset, data),
                Frame::Stream {
                    id,
                    offset,
                    data,
                    fin,
                } => self.recv_stream(space, id, offset, data, fin),
                Frame::ConnectionClose => {
                    self.closed = true;
                    return;
                }
                Frame::HandshakeDone => (),
            }
        }
        self.drain_session();
    }

    /// Feeds received CRYPTO bytes into the TLS session. Reordered
    /// crypto data is not buffered: the client retransmits, and the
    /// in-order prefix always makes progress.
    fn recv_crypto(&mut self, space: Space, offset: u64, data: &[u8]) {
        let state = &mut self.spaces[space_index(space)];
        let expected = state.crypto_rx_offset;
        if offset + data.len() as u64 <= expected {
            return; // pure retransmission
        }
        if offset > expected {
            debug!("dropping out-of-order crypto data in {:?}", space);
            return;
        }
        let fresh = &data[(expected - offset) as usize..];
        state.crypto_rx_offset += fresh.len() as u64;
        let mut failed = false;
        if let Some(ref mut session) = self.session {
            if let Err(e) = session.read_hs(fresh) {
                debug!("TLS error: {}", e);
                failed = true;
            }
        }
        if failed {
            // Emit any alert flight before closing.
            self.drain_session();
            self.closed = true;
        }
    }

    /// Collects emitted handshake bytes from the session, installing
    /// new packet-space keys as the session yields them.
    fn drain_session(&mut self) {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => return,
        };
        // Bytes emitted before a key change belong to the space whose
        // keys are currently newest.
        let mut send_space = if self.spaces[space_index(Space::Handshake)].keys.is_some() {
            Space::Handshake
        } else {
            Space::Initial
        };
        loop {
            let mut buf = Vec::new();
            let key_change = session.write_hs(&mut buf);
            if !buf.is_empty() {
                self.flights.push((send_space, buf));
            }
            match key_change {
                Some(KeyChange::Handshake { keys }) => {
                    self.spaces[space_index(Space::Handshake)].keys = Some(keys);
                    send_space = Space::Handshake;
                }
                Some(KeyChange::OneRtt { keys, .. }) => {
                    // Key updates are not initiated by this server, so
                    // the follow-on secrets are not retained.
                    self.spaces[space_index(Space::OneRtt)].keys = Some(keys);
                    send_space = Space::OneRtt;
                }
                None => break,
            }
        }
        if self.early_keys.is_none() {
            self.early_keys = session.zero_rtt_keys();
        }
        self.session = Some(session);
    }

    /// Handles received STREAM data. Only client-initiated
    /// bidirectional streams (ID low bits 0b00) may carry queries.
    fn recv_stream(&mut self, space: Space, id: u64, offset: u64, data: &[u8], fin: bool) {
        if space != Space::OneRtt || id & 0x03 != 0 {
            return;
        }
        let assembly = self.streams.entry(id).or_default();
        let offset = offset as usize;
        if offset + data.len() > MAX_STREAM_MESSAGE || assembly.answered {
            return;
        }
        if assembly.buf.len() < offset + data.len() {
            assembly.buf.resize(offset + data.len(), 0);
        }
        assembly.buf[offset..offset + data.len()].copy_from_slice(data);
        assembly.fin |= fin;
        if let Some(message) = assembly.take_message() {
            self.ready.push((id, message));
        }
    }

    /// Takes the DNS messages that have completely arrived, for
    /// resolution by the endpoint.
    pub fn take_ready_messages(&mut self) -> Vec<(u64, Vec<u8>)> {
        std::mem::take(&mut self.ready)
    }

    /// Queues a DNS response onto `stream`, with the 2-byte length
    /// prefix, finishing the stream.
    pub fn queue_response(&mut self, stream: u64, response: &[u8]) {
        let mut data = Vec::with_capacity(2 + response.len());
        data.extend_from_slice(&(response.len() as u16).to_be_bytes());
        data.extend_from_slice(response);
        put_stream_frame(&mut self.pending_app_frames, stream, 0, &data, true);
    }

    /// Builds the reply datagram: pending handshake flights and
    /// application frames, packetized and coalesced. Returns an empty
    /// vector if there is nothing to send.
    pub fn build_reply(&mut self) -> Vec<u8> {
        let mut datagram = Vec::new();

        let flights = std::mem::take(&mut self.flights);
        for (space, bytes) in flights {
            let mut frames = Vec::new();
            if let Some(largest) = self.spaces[space_index(space)].largest_recv_pn {
                put_ack_frame(&mut frames, largest);
            }
            let offset = self.spaces[space_index(space)].crypto_tx_offset;
            put_crypto_frame(&mut frames, offset, &bytes);
            self.spaces[space_index(space)].crypto_tx_offset += bytes.len() as u64;
            self.encrypt_packet(space, &frames, &mut datagram);
        }

        if self.spaces[space_index(Space::OneRtt)].keys.is_some() {
            let mut frames = std::mem::take(&mut self.pending_app_frames);
            if self.is_established() && !self.handshake_done_sent {
                put_handshake_done_frame(&mut frames);
                self.handshake_done_sent = true;
            }
            if !frames.is_empty() {
                if let Some(largest) = self.spaces[space_index(Space::OneRtt)].largest_recv_pn {
                    let mut with_ack = Vec::new();
                    put_ack_frame(&mut with_ack, largest);
                    with_ack.extend_from_slice(&frames);
                    frames = with_ack;
                }
                self.encrypt_packet(Space::OneRtt, &frames, &mut datagram);
            }
        }

        datagram
    }

    ////////////////////////////////////////////////////////////////////
    // PACKET PROTECTION                                              //
    ////////////////////////////////////////////////////////////////////

    /// Removes header and packet protection from `packet`, returning
    /// the decrypted payload.
    fn decrypt_packet(&mut self, space: Space, packet: &Packet<'_>) -> Option<Vec<u8>> {
        let state = &mut self.spaces[space_index(space)];
        let keys = state.keys.as_ref()?;
        let pn_offset = packet.pn_offset;
        let mut bytes = packet.bytes.to_vec();
        if bytes.len() < pn_offset + 4 + TAG_LEN {
            return None;
        }

        let sample: [u8; 16] = bytes
            .get(pn_offset + 4..pn_offset + 20)?
            .try_into()
            .unwrap();
        let (front, back) = bytes.split_at_mut(pn_offset);
        let (first, _) = front.split_first_mut()?;
        keys.remote
            .header
            .decrypt_in_place(&sample, first, &mut back[..4])
            .ok()?;

        let pn_len = (bytes[0] & 0x03) as usize + 1;
        let mut truncated_pn = 0u64;
        for &octet in &bytes[pn_offset..pn_offset + pn_len] {
            truncated_pn = truncated_pn << 8 | octet as u64;
        }
        let pn = decode_packet_number(truncated_pn, pn_len, state.largest_recv_pn);

        let (header, payload) = bytes.split_at_mut(pn_offset + pn_len);
        let plaintext_len = keys
            .remote
            .packet
            .decrypt_in_place(pn, header, payload)
            .ok()?
            .len();

        if state.largest_recv_pn.map_or(true, |largest| pn > largest) {
            state.largest_recv_pn = Some(pn);
        }
        let payload_start = pn_offset + pn_len;
        bytes.truncate(payload_start + plaintext_len);
        bytes.drain(..payload_start);
        Some(bytes)
    }

    /// Removes protection from a 0-RTT packet using the early-data
    /// read keys. Shares the application packet number space with
    /// 1-RTT packets.
    fn decrypt_early_packet(&mut self, packet: &Packet<'_>) -> Option<Vec<u8>> {
        let keys = self.early_keys.as_ref()?;
        let state = &mut self.spaces[space_index(Space::OneRtt)];
        let pn_offset = packet.pn_offset;
        let mut bytes = packet.bytes.to_vec();
        if bytes.len() < pn_offset + 4 + TAG_LEN {
            return None;
        }

        let sample: [u8; 16] = bytes
            .get(pn_offset + 4..pn_offset + 20)?
            .try_into()
            .unwrap();
        let (front, back) = bytes.split_at_mut(pn_offset);
        let (first, _) = front.split_first_mut()?;
        keys.header
            .decrypt_in_place(&sample, first, &mut back[..4])
            .ok()?;

        let pn_len = (bytes[0] & 0x03) as usize + 1;
        let mut truncated_pn = 0u64;
        for &octet in &bytes[pn_offset..pn_offset + pn_len] {
            truncated_pn = truncated_pn << 8 | octet as u64;
        }
        let pn = decode_packet_number(truncated_pn, pn_len, state.largest_recv_pn);

        let (header, payload) = bytes.split_at_mut(pn_offset + pn_len);
        let plaintext_len = keys.packet.decrypt_in_place(pn, header, payload).ok()?.len();

        if state.largest_recv_pn.map_or(true, |largest| pn > largest) {
            state.largest_recv_pn = Some(pn);
        }
        let payload_start = pn_offset + pn_len;
        bytes.truncate(payload_start + plaintext_len);
        bytes.drain(..payload_start);
        Some(bytes)
    }

    /// Appends one protected packet carrying `frames` to `datagram`.
    fn encrypt_packet(&mut self, space: Space, frames: &[u8], datagram: &mut Vec<u8>) {
        let state = &mut self.spaces[space_index(space)];
        let keys = match state.keys {
            Some(ref keys) => keys,
            None => return,
        };
        let pn = state.next_send_pn;
        state.next_send_pn += 1;

        // The header-protection sample needs at least four octets of
        // ciphertext before the tag.
        let mut frames = frames.to_vec();
        while frames.len() < 4 {
            frames.push(0); // PADDING
        }

        let packet_start = datagram.len();
        match space {
            Space::Initial | Space::Handshake => {
                let ty: u8 = if space == Space::Initial { 0 } else { 2 };
                datagram.push(0xc0 | (ty << 4) | (PN_LEN as u8 - 1));
                datagram.extend_from_slice(&QUIC_VERSION.to_be_bytes());
                datagram.push(self.peer_cid.len() as u8);
                datagram.extend_from_slice(self.peer_cid.as_slice());
                datagram.push(self.dcid.len() as u8);
                datagram.extend_from_slice(self.dcid.as_slice());
                if space == Space::Initial {
                    put_varint(datagram, 0); // empty token
                }
                put_varint(datagram, (PN_LEN + frames.len() + TAG_LEN) as u64);
            }
            Space::OneRtt => {
                datagram.push(0x40 | (PN_LEN as u8 - 1));
                datagram.extend_from_slice(self.peer_cid.as_slice());
            }
        }
        let pn_offset = datagram.len();
        datagram.extend_from_slice(&(pn as u16).to_be_bytes());
        let header_end = datagram.len();
        datagram.extend_from_slice(&frames);

        let (header, payload) = datagram.split_at_mut(header_end);
        let tag = match keys
            .local
            .packet
            .encrypt_in_place(pn, &header[packet_start..], payload)
        {
            Ok(tag) => tag,
            Err(e) => {
                debug!("packet encryption failed: {}", e);
                datagram.truncate(packet_start);
                return;
            }
        };
        datagram.extend_from_slice(tag.as_ref());

        let sample: [u8; 16] = datagram[pn_offset + 4..pn_offset + 20].try_into().unwrap();
        let (front, back) = datagram.split_at_mut(pn_offset);
        let first = &mut front[packet_start];
        if keys
            .local
            .header
            .encrypt_in_place(&sample, first, &mut back[..PN_LEN])
            .is_err()
        {
            datagram.truncate(packet_start);
        }
    }
}

/// Recovers a full packet number from its truncated encoding
/// ([RFC 9000 § A.3]).
///
/// [RFC 9000 § A.3]: https://datatracker.ietf.org/doc/html/rfc9000#section-a.3
fn decode_packet_number(truncated: u64, pn_len: usize, largest: Option<u64>) -> u64 {
    let expected = largest.map_or(0, |largest| largest + 1);
    let win = 1u64 << (pn_len * 8);
    let hwin = win / 2;
    let mask = win - 1;
    let candidate = (expected & !mask) | truncated;
    if candidate + hwin <= expected && candidate + win < (1 << 62) {
        candidate + win
    } else if candidate > expected + hwin && candidate >= win {
        candidate - win
    } else {
        candidate
    }
}

/// Encodes the QUIC transport parameters ([RFC 9000 § 18]) the server
/// advertises: the original destination CID (mandatory), the retry
/// source CID when a retry round-trip happened, our source CID, and
/// modest stream and data limits suitable for one-query-per-stream
/// DNS service.
///
/// [RFC 9000 § 18]: https://datatracker.ietf.org/doc/html/rfc9000#section-18
fn transport_parameters(
    original_dcid: &ConnectionId,
    retry_scid: Option<&ConnectionId>,
    our_cid: &ConnectionId,
) -> Vec<u8> {
    let mut params = Vec::new();

    fn put_bytes_param(params: &mut Vec<u8>, id: u64, value: &[u8]) {
        put_varint(params, id);
        put_varint(params, value.len() as u64);
        params.extend_from_slice(value);
    }
    fn put_int_param(params: &mut Vec<u8>, id: u64, value: u64) {
        let mut encoded = Vec::new();
        put_varint(&mut encoded, value);
        put_varint(params, id);
        put_varint(params, encoded.len() as u64);
        params.extend_from_slice(&encoded);
    }

    put_bytes_param(&mut params, 0x00, original_dcid.as_slice());
    put_int_param(&mut params, 0x01, 30_000); // max_idle_timeout (ms)
    put_int_param(&mut params, 0x03, 65527); // max_udp_payload_size
    put_int_param(&mut params, 0x04, 1 << 20); // initial_max_data
    put_int_param(&mut params, 0x06, 1 << 16); // initial_max_stream_data_bidi_remote
    put_int_param(&mut params, 0x08, 64); // initial_max_streams_bidi
    put_bytes_param(&mut params, 0x0f, our_cid.as_slice());
    if let Some(retry_scid) = retry_scid {
        put_bytes_param(&mut params, 0x10, retry_scid.as_slice());
    }
    params
}

////////////////////////////////////////////////////////////////////////
// TEST SUPPORT                                                       //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
impl Connection {
    /// Builds a bare connection (no TLS session) for table tests.
    pub(super) fn for_tests(dcid: ConnectionId) -> Self {
        Self::empty(
            dcid,
            ConnectionId::from_slice(b"peer").unwrap(),
            "192.0.2.1:443".parse().unwrap(),
        )
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_numbers_decode_around_the_window() {
        // Examples in the spirit of RFC 9000 § A.3.
        assert_eq!(decode_packet_number(0x9b32, 2, Some(0xa82f30ea)), 0xa82f9b32);
        assert_eq!(decode_packet_number(0, 1, None), 0);
        assert_eq!(decode_packet_number(0xff, 1, Some(0xfe)), 0xff);
        // Wraparound upward.
        assert_eq!(decode_packet_number(0x02, 1, Some(0xff)), 0x102);
    }

    #[test]
    fn stream_reassembly_waits_for_prefix_and_fin() {
        let mut assembly = StreamAssembly::default();
        assembly.buf.extend_from_slice(&[0x00]);
        assert!(assembly.take_message().is_none());
        assembly.buf.extend_from_slice(&[0x03, b'a', b'b']);
        assembly.fin = true;
        // Three octets promised, only two present.
        assert!(assembly.take_message().is_none());
        assembly.buf.push(b'c');
        assert_eq!(assembly.take_message().unwrap(), b"abc");
        // A stream yields one message only.
        assert!(assembly.take_message().is_none());
    }

    #[test]
    fn transport_parameters_carry_the_original_dcid() {
        let original = ConnectionId::from_slice(b"original-dcid").unwrap();
        let ours = ConnectionId::from_slice(&[7; 18]).unwrap();
        let params = transport_parameters(&original, None, &ours);
        // First parameter is original_destination_connection_id.
        let mut pos = 0;
        assert_eq!(super::super::packet::get_varint(&params, &mut pos), Some(0));
        let len = super::super::packet::get_varint(&params, &mut pos).unwrap() as usize;
        assert_eq!(&params[pos..pos + len], original.as_slice());
    }
}
