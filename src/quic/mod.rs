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

//! DNS over QUIC ([RFC 9250]): the per-worker datagram demultiplexer.
//!
//! Every incoming datagram is classified by header form, version, and
//! destination connection ID. Unsupported versions are answered with a
//! version negotiation packet. The DCID indexes the worker's
//! [`ConnectionTable`]; a miss is dropped unless the packet is a
//! long-header INITIAL, in which case the sender's address is
//! validated (retry token) and a connection is created. Established
//! connections carry DNS messages on bidirectional streams, which are
//! resolved with the same query processor the UDP path uses.
//!
//! Each worker thread owns its endpoint outright — table, TLS
//! configuration handle, token key — so the demultiplexer involves no
//! locking. Idle connections are expired by the pipeline's sweep hook.
//!
//! [RFC 9250]: https://datatracker.ietf.org/doc/html/rfc9250

use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{aead, hmac};
use rustls::{Certificate, PrivateKey, ServerConfig};

use crate::config::QuicConfig;
use crate::layer::{serve_one, OutPacket, State};
use crate::net::DatagramHandler;
use crate::server::{QueryFlags, QueryProcessor, ReceivedInfo, Transport};
use crate::zone::db::ZoneDb;

pub mod conn;
pub mod packet;
pub mod table;

use conn::Connection;
use packet::{build_version_negotiation, classify, Classified, ConnectionId, Space, LOCAL_CID_LEN};
use table::ConnectionTable;

/// The ALPN protocol identifier for DNS over QUIC.
const ALPN_DOQ: &[u8] = b"doq";

/// The fixed key and nonce for the retry integrity tag
/// ([RFC 9001 § 5.8]).
///
/// [RFC 9001 § 5.8]: https://datatracker.ietf.org/doc/html/rfc9001#section-5.8
const RETRY_INTEGRITY_KEY: [u8; 16] = [
    0xbe, 0x0c, 0x69, 0x0b, 0x9f, 0x66, 0x57, 0x5a, 0x1d, 0x76, 0x6b, 0x54, 0xe3, 0x68, 0xc8,
    0x4e,
];
const RETRY_INTEGRITY_NONCE: [u8; 12] = [
    0x46, 0x15, 0x99, 0xd3, 0x5d, 0x63, 0x2b, 0xf2, 0x23, 0x98, 0x25, 0xbb,
];

////////////////////////////////////////////////////////////////////////
// THE QUIC ENDPOINT                                                  //
////////////////////////////////////////////////////////////////////////

/// One worker's QUIC serving state.
pub struct QuicEndpoint {
    db: Arc<ZoneDb>,
    tls_config: Arc<ServerConfig>,
    table: ConnectionTable,
    token_key: hmac::Key,
    rng: SystemRandom,
    idle_timeout: Duration,
}

impl QuicEndpoint {
    /// Creates an endpoint from the QUIC configuration, loading the
    /// TLS certificate and key.
    pub fn new(db: Arc<ZoneDb>, config: &QuicConfig) -> io::Result<Self> {
        let tls_config = Arc::new(build_tls_config(config)?);
        let rng = SystemRandom::new();
        // The token key is per-worker: with per-worker sockets a
        // retried client lands back on the worker that minted its
        // token, because the kernel hashes on the same four-tuple.
        let token_key = hmac::Key::generate(hmac::HMAC_SHA256, &rng)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "cannot generate token key"))?;
        Ok(Self {
            db,
            tls_config,
            table: ConnectionTable::new(config.table_capacity),
            token_key,
            rng,
            idle_timeout: config.idle_timeout(),
        })
    }

    /// Returns the number of live connections (for tests and
    /// observability).
    pub fn connection_count(&self) -> usize {
        self.table.len()
    }

    fn random_cid(&self) -> ConnectionId {
        let mut bytes = [0u8; LOCAL_CID_LEN];
        // SystemRandom only fails on catastrophic platform errors; an
        // all-zero CID is still a functional fallback.
        let _ = self.rng.fill(&mut bytes);
        ConnectionId::from_slice(&bytes).unwrap()
    }

    /// Classifies and dispatches one datagram, writing at most one
    /// reply datagram.
    fn demux(&mut self, wire: &[u8], source: SocketAddr, reply: &mut [u8]) -> usize {
        let classified = match classify(wire) {
            Some(classified) => classified,
            None => return 0,
        };

        let response = match classified {
            Classified::UnsupportedVersion { dcid, scid } => {
                build_version_negotiation(&scid, &dcid)
            }
            Classified::Initial {
                dcid,
                scid,
                token,
                packet,
            } => {
                let serve_key;
                if let Some(conn) = self.table.find_mut(&dcid) {
                    conn.recv_packet(Space::Initial, &packet, source);
                    serve_key = dcid;
                } else if token.is_empty() {
                    // Address not yet validated: make the client come
                    // back with a token.
                    return self.write_retry(&dcid, &scid, source, reply);
                } else {
                    let original_dcid = match self.verify_token(token, source) {
                        Some(original_dcid) => original_dcid,
                        None => {
                            debug!("dropping INITIAL with invalid token from {}", source);
                            return 0;
                        }
                    };
                    let our_cid = self.random_cid();
                    let conn = match Connection::accept(
                        our_cid,
                        scid,
                        source,
                        self.tls_config.clone(),
                        &dcid,
                        Some(original_dcid),
                    ) {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("cannot accept QUIC connection: {}", e);
                            return 0;
                        }
                    };
                    // The connection is keyed by the CID we issued;
                    // the client switches to it as soon as it sees our
                    // first reply.
                    let conn = self.table.insert(conn);
                    conn.recv_packet(Space::Initial, &packet, source);
                    serve_key = our_cid;
                }
                self.serve_connection(&serve_key)
            }
            Classified::Handshake { dcid, packet } => {
                match self.table.find_mut(&dcid) {
                    Some(conn) => conn.recv_packet(Space::Handshake, &packet, source),
                    None => return 0,
                }
                self.serve_connection(&dcid)
            }
            Classified::ZeroRtt { dcid, packet } => {
                match self.table.find_mut(&dcid) {
                    Some(conn) => conn.recv_zero_rtt_packet(&packet, source),
                    None => return 0,
                }
                self.serve_connection(&dcid)
            }
            Classified::Short { dcid, packet } => {
                match self.table.find_mut(&dcid) {
                    Some(conn) => conn.recv_packet(Space::OneRtt, &packet, source),
                    None => return 0,
                }
                self.serve_connection(&dcid)
            }
        };

        let len = response.len().min(reply.len());
        reply[..len].copy_from_slice(&response[..len]);
        len
    }

    /// Resolves any DNS messages that completed on the connection's
    /// streams and builds its reply datagram.
    fn serve_connection(&mut self, dcid: &ConnectionId) -> Vec<u8> {
        // Resolve first, without holding a borrow of the table entry
        // across the lookups.
        let messages = match self.table.find_mut(dcid) {
            Some(conn) => conn.take_ready_messages(),
            None => return Vec::new(),
        };
        let mut responses = Vec::with_capacity(messages.len());
        for (stream, message) in messages {
            let lease = self.db.lease();
            let peer = match self.table.find_mut(dcid) {
                Some(conn) => conn.peer(),
                None => return Vec::new(),
            };
            let info = ReceivedInfo::new(peer, Transport::Quic);
            let mut processor =
                QueryProcessor::new(&lease, info, QueryFlags::NO_AXFR.union(QueryFlags::NO_IXFR));
            let mut buf = vec![0u8; 65535];
            let mut out = OutPacket::new(&mut buf);
            let state = serve_one(&mut processor, &message, &mut out);
            if state == State::Done && !out.is_empty() {
                responses.push((stream, out.as_slice().to_vec()));
            }
        }

        match self.table.find_mut(dcid) {
            Some(conn) => {
                for (stream, response) in responses {
                    conn.queue_response(stream, &response);
                }
                let reply = conn.build_reply();
                if conn.is_closed() {
                    let dcid = *conn.dcid();
                    self.table.remove(&dcid);
                }
                reply
            }
            None => Vec::new(),
        }
    }

    ////////////////////////////////////////////////////////////////////
    // ADDRESS VALIDATION                                             //
    ////////////////////////////////////////////////////////////////////

    /// Builds a retry packet carrying a fresh token, so the next
    /// INITIAL proves the client owns its source address.
    fn write_retry(
        &mut self,
        client_dcid: &ConnectionId,
        client_scid: &ConnectionId,
        source: SocketAddr,
        reply: &mut [u8],
    ) -> usize {
        let retry_scid = self.random_cid();
        let token = self.make_token(client_dcid, source);

        let mut packet = Vec::with_capacity(64 + token.len());
        packet.push(0xf0);
        packet.extend_from_slice(&packet::QUIC_VERSION.to_be_bytes());
        packet.push(client_scid.len() as u8);
        packet.extend_from_slice(client_scid.as_slice());
        packet.push(retry_scid.len() as u8);
        packet.extend_from_slice(retry_scid.as_slice());
        packet.extend_from_slice(&token);

        let tag = match retry_integrity_tag(client_dcid, &packet) {
            Some(tag) => tag,
            None => return 0,
        };
        packet.extend_from_slice(tag.as_ref());

        let len = packet.len().min(reply.len());
        reply[..len].copy_from_slice(&packet[..len]);
        len
    }

    /// Token layout: original DCID length, original DCID, HMAC over
    /// (client IP, original DCID).
    fn make_token(&self, original_dcid: &ConnectionId, source: SocketAddr) -> Vec<u8> {
        let mut token = Vec::with_capacity(1 + original_dcid.len() + 32);
        token.push(original_dcid.len() as u8);
        token.extend_from_slice(original_dcid.as_slice());
        let tag = hmac::sign(&self.token_key, &token_material(original_dcid, source));
        token.extend_from_slice(tag.as_ref());
        token
    }

    /// Verifies a token from an INITIAL packet, recovering the
    /// original DCID it was minted for.
    fn verify_token(&self, token: &[u8], source: SocketAddr) -> Option<ConnectionId> {
        let odcid_len = *token.first()? as usize;
        let odcid = ConnectionId::from_slice(token.get(1..1 + odcid_len)?)?;
        let tag = token.get(1 + odcid_len..)?;
        hmac::verify(&self.token_key, &token_material(&odcid, source), tag).ok()?;
        Some(odcid)
    }
}

impl DatagramHandler for QuicEndpoint {
    fn handle(&mut self, wire: &[u8], source: SocketAddr, reply: &mut [u8]) -> usize {
        self.demux(wire, source, reply)
    }

    fn sweep(&mut self) {
        let removed = self.table.sweep(Instant::now(), self.idle_timeout);
        if removed > 0 {
            debug!("expired {} idle QUIC connections", removed);
        }
    }
}

/// Starts one QUIC worker thread per descriptor set, mirroring
/// [`start_udp_workers`](crate::net::start_udp_workers); the same
/// pipeline loop runs with a [`QuicEndpoint`] as the handler.
pub fn start_quic_workers(
    group: &crate::thread::WorkerGroup,
    db: &Arc<ZoneDb>,
    config: &crate::config::PipelineConfig,
    quic_config: &QuicConfig,
    worker_fds: Vec<Vec<std::os::fd::OwnedFd>>,
) -> io::Result<()> {
    for (worker_id, fds) in worker_fds.into_iter().enumerate() {
        let mut sockets = Vec::with_capacity(fds.len());
        for fd in fds {
            sockets.push(crate::net::UdpSocket::from_fd(fd)?);
        }
        let db = db.clone();
        let config = config.clone();
        let quic_config = quic_config.clone();
        group.spawn(format!("quic worker {}", worker_id), move |cancel| {
            let mut endpoint = QuicEndpoint::new(db, &quic_config)?;
            crate::net::run_worker(&sockets, &config, cancel, &mut endpoint)
        })?;
    }
    Ok(())
}

/// The material the address-validation token authenticates.
fn token_material(original_dcid: &ConnectionId, source: SocketAddr) -> Vec<u8> {
    let mut material = Vec::with_capacity(16 + original_dcid.len());
    match source.ip() {
        std::net::IpAddr::V4(ip) => material.extend_from_slice(&ip.octets()),
        std::net::IpAddr::V6(ip) => material.extend_from_slice(&ip.octets()),
    }
    material.extend_from_slice(original_dcid.as_slice());
    material
}

/// Computes the retry integrity tag ([RFC 9001 § 5.8]): AES-128-GCM
/// over the retry pseudo-packet with the fixed key and nonce.
fn retry_integrity_tag(original_dcid: &ConnectionId, retry_packet: &[u8]) -> Option<aead::Tag> {
    let mut pseudo = Vec::with_capacity(1 + original_dcid.len() + retry_packet.len());
    pseudo.push(original_dcid.len() as u8);
    pseudo.extend_from_slice(original_dcid.as_slice());
    pseudo.extend_from_slice(retry_packet);

    let key = aead::LessSafeKey::new(
        aead::UnboundKey::new(&aead::AES_128_GCM, &RETRY_INTEGRITY_KEY).ok()?,
    );
    let nonce = aead::Nonce::assume_unique_for_key(RETRY_INTEGRITY_NONCE);
    key.seal_in_place_separate_tag(nonce, aead::Aad::from(pseudo), &mut [])
        .ok()
}

/// Builds the TLS configuration for DNS-over-QUIC sessions: the
/// configured certificate chain and key, ALPN `doq`, and early data
/// enabled so 0-RTT queries work.
fn build_tls_config(config: &QuicConfig) -> io::Result<ServerConfig> {
    let (cert_file, key_file) = match (&config.cert_file, &config.key_file) {
        (Some(cert_file), Some(key_file)) => (cert_file, key_file),
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "QUIC service requires a certificate and key",
            ));
        }
    };
    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;
    let mut tls_config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    tls_config.alpn_protocols = vec![ALPN_DOQ.to_vec()];
    tls_config.max_early_data_size = u32::MAX;
    Ok(tls_config)
}

fn load_certs(path: &Path) -> io::Result<Vec<Certificate>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)?;
    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no certificates found",
        ));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &Path) -> io::Result<PrivateKey> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)?;
    if keys.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no PKCS#8 private key found",
        ));
    }
    Ok(PrivateKey(keys.remove(0)))
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::set::ZoneSet;

    fn test_endpoint() -> QuicEndpoint {
        // Certificate resolution is only exercised at handshake time,
        // so an empty SNI resolver is enough for endpoint tests.
        let mut tls_config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(rustls::server::ResolvesServerCertUsingSni::new()));
        tls_config.alpn_protocols = vec![ALPN_DOQ.to_vec()];
        let rng = SystemRandom::new();
        QuicEndpoint {
            db: Arc::new(ZoneDb::new(ZoneSet::new())),
            tls_config: Arc::new(tls_config),
            table: ConnectionTable::new(16),
            token_key: hmac::Key::generate(hmac::HMAC_SHA256, &rng).unwrap(),
            rng,
            idle_timeout: Duration::from_secs(30),
        }
    }

    fn source() -> SocketAddr {
        "198.51.100.9:8853".parse().unwrap()
    }

    #[test]
    fn tokens_verify_only_for_the_minting_address() {
        let endpoint = test_endpoint();
        let odcid = ConnectionId::from_slice(b"original").unwrap();
        let token = endpoint.make_token(&odcid, source());

        let recovered = endpoint.verify_token(&token, source()).unwrap();
        assert_eq!(recovered, odcid);

        let other: SocketAddr = "203.0.113.4:8853".parse().unwrap();
        assert!(endpoint.verify_token(&token, other).is_none());

        let mut tampered = token.clone();
        *tampered.last_mut().unwrap() ^= 1;
        assert!(endpoint.verify_token(&tampered, source()).is_none());
    }

    #[test]
    fn unsupported_versions_get_version_negotiation() {
        let mut endpoint = test_endpoint();
        let mut datagram = vec![0xc0];
        datagram.extend_from_slice(&0x1a2a3a4au32.to_be_bytes());
        datagram.push(4);
        datagram.extend_from_slice(b"dcid");
        datagram.push(4);
        datagram.extend_from_slice(b"scid");

        let mut reply = [0u8; 1500];
        let len = endpoint.handle(&datagram, source(), &mut reply);
        assert!(len > 0);
        // Version 0 marks a version negotiation packet, and it offers
        // QUIC v1.
        assert_eq!(&reply[1..5], &[0, 0, 0, 0]);
        assert_eq!(
            &reply[len - 4..len],
            &packet::QUIC_VERSION.to_be_bytes(),
        );
    }

    #[test]
    fn tokenless_initials_get_a_retry() {
        let mut endpoint = test_endpoint();
        // A minimal INITIAL shell: long header, v1, DCID, SCID, empty
        // token, empty payload length.
        let mut datagram = vec![0xc0];
        datagram.extend_from_slice(&packet::QUIC_VERSION.to_be_bytes());
        datagram.push(8);
        datagram.extend_from_slice(b"DCIDDCID");
        datagram.push(4);
        datagram.extend_from_slice(b"scid");
        datagram.push(0); // token length
        datagram.push(0); // payload length
        datagram.resize(1200, 0);

        let mut reply = [0u8; 1500];
        let len = endpoint.handle(&datagram, source(), &mut reply);
        assert!(len > 0);
        // Long header, type retry (0b11).
        assert_eq!(reply[0] & 0xf0, 0xf0);
        // No connection state was created.
        assert_eq!(endpoint.connection_count(), 0);

        // The retry token embedded in the packet verifies for this
        // source and recovers the original DCID.
        let mut pos = 5;
        let dcid_len = reply[pos] as usize;
        pos += 1 + dcid_len;
        let scid_len = reply[pos] as usize;
        pos += 1 + scid_len;
        let token = &reply[pos..len - 16];
        let odcid = endpoint.verify_token(token, source()).unwrap();
        assert_eq!(odcid.as_slice(), b"DCIDDCID");
    }

    #[test]
    fn short_header_misses_are_dropped() {
        let mut endpoint = test_endpoint();
        let mut datagram = vec![0x40];
        datagram.extend_from_slice(&[9; LOCAL_CID_LEN]);
        datagram.extend_from_slice(&[0; 32]);
        let mut reply = [0u8; 1500];
        assert_eq!(endpoint.handle(&datagram, source(), &mut reply), 0);
    }

    #[test]
    fn successive_datagrams_with_one_dcid_reach_one_connection() {
        let mut endpoint = test_endpoint();
        let dcid = ConnectionId::from_slice(&[3; LOCAL_CID_LEN]).unwrap();
        endpoint.table.insert(Connection::for_tests(dcid));
        assert_eq!(endpoint.connection_count(), 1);

        // Two short-header datagrams with the same DCID reach the same
        // connection state in order; with no 1-RTT keys they are
        // dropped at decryption, but the connection is looked up (and
        // no second connection appears).
        let mut datagram = vec![0x40];
        datagram.extend_from_slice(&[3; LOCAL_CID_LEN]);
        datagram.extend_from_slice(&[0; 32]);
        let mut reply = [0u8; 1500];
        endpoint.handle(&datagram, source(), &mut reply);
        endpoint.handle(&datagram, source(), &mut reply);
        assert_eq!(endpoint.connection_count(), 1);
    }
}
