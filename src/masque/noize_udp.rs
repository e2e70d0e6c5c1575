//! Module D — the MASQUE noize UDP wrapper.
//!
//! Decorates a UDP socket with fragmentation, padding, protocol mimicry,
//! and junk injection during the QUIC handshake, then becomes a pure
//! passthrough once [`NoizeUdpSocket::disable_obfuscation`] is called
//! (spec §4.D, §9 — "off after setup").

use crate::config::MasqueParams;
use crate::telemetry::{MASQUE_FRAGMENTS, MASQUE_JUNK_PACKETS};
use rand::{Rng, RngCore};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;

const KNOWN_PEERS_CAP: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuicPacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
    ShortHeader,
}

/// Detects the QUIC packet type from the first byte of a datagram (long
/// vs. short header, and the 2-bit type field for long headers), per spec
/// §4.D step 1.
pub fn detect_quic_packet_type(buf: &[u8]) -> QuicPacketType {
    let Some(&first) = buf.first() else {
        return QuicPacketType::ShortHeader;
    };
    if first & 0x80 == 0 {
        return QuicPacketType::ShortHeader;
    }
    match (first & 0x30) >> 4 {
        0x0 => QuicPacketType::Initial,
        0x1 => QuicPacketType::ZeroRtt,
        0x2 => QuicPacketType::Handshake,
        _ => QuicPacketType::Retry,
    }
}

fn gen_random(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    if rand::rngs::OsRng.try_fill_bytes(&mut buf).is_err() {
        rand::thread_rng().fill_bytes(&mut buf);
    }
    buf
}

fn uniform_junk_size(jmin: i64, jmax: i64) -> usize {
    let jmin = jmin.max(0) as usize;
    let jmax = jmax.max(jmin as i64) as usize;
    if jmin == 0 && jmax == 0 {
        1
    } else if jmin == jmax {
        jmin
    } else {
        rand::thread_rng().gen_range(jmin..=jmax)
    }
}

fn wrap_mimicry(payload: Vec<u8>, protocol: &str) -> Vec<u8> {
    match protocol {
        "dns" => {
            // 12-byte DNS header: random ID, standard query flags, zero counts
            let mut out = Vec::with_capacity(12 + payload.len());
            out.extend_from_slice(&gen_random(2));
            out.extend_from_slice(&[0x01, 0x00]); // flags: standard query, recursion desired
            out.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
            out.extend_from_slice(&payload);
            out
        }
        "https" | "h3" => {
            // 5-byte TLS record header: application_data, TLS 1.2, length
            let mut out = Vec::with_capacity(5 + payload.len());
            out.push(0x17); // application_data
            out.extend_from_slice(&[0x03, 0x03]); // TLS 1.2 record version
            out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            out.extend_from_slice(&payload);
            out
        }
        "stun" => {
            // 20-byte STUN header: Binding Request, magic cookie, random tx id
            let mut out = Vec::with_capacity(20 + payload.len());
            out.extend_from_slice(&[0x00, 0x01]); // Binding Request
            out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            out.extend_from_slice(&[0x21, 0x12, 0xA4, 0x42]); // magic cookie
            out.extend_from_slice(&gen_random(12));
            out.extend_from_slice(&payload);
            out
        }
        "dtls" => {
            // 13-byte DTLS record header: application_data, 1.2, epoch/seq, length
            let mut out = Vec::with_capacity(13 + payload.len());
            out.push(0x17);
            out.extend_from_slice(&[0xFE, 0xFD]); // DTLS 1.2
            out.extend_from_slice(&[0x00, 0x00]); // epoch
            out.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // sequence number
            out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            out.extend_from_slice(&payload);
            out
        }
        _ => payload,
    }
}

fn looks_like_client_hello(buf: &[u8]) -> bool {
    buf.len() > 5 && buf[0] == 0x16
}

/// Best-effort SNI fragmentation: if `buf` looks like a TLS ClientHello,
/// split it into two datagrams at `offset`. This is a heuristic, not a
/// full TLS parser — ClientHellos that don't place the split point inside
/// the SNI extension are still split at the same byte offset, which is
/// enough to break a single-datagram SNI match without reconstructing the
/// handshake.
fn fragment_sni(buf: &[u8], offset: usize) -> Vec<Vec<u8>> {
    if !looks_like_client_hello(buf) || offset == 0 || offset >= buf.len() {
        return vec![buf.to_vec()];
    }
    vec![buf[..offset].to_vec(), buf[offset..].to_vec()]
}

struct HandshakeGate {
    fired: AtomicBool,
}

impl HandshakeGate {
    fn new() -> Self {
        HandshakeGate {
            fired: AtomicBool::new(false),
        }
    }
    fn fire_once(&self) -> bool {
        !self.fired.swap(true, Ordering::SeqCst)
    }
}

/// Decorates a `tokio::net::UdpSocket` with MASQUE noize obfuscation.
pub struct NoizeUdpSocket {
    socket: Arc<UdpSocket>,
    params: MasqueParams,
    enabled: AtomicBool,
    first_initial: HandshakeGate,
    first_handshake: HandshakeGate,
    last_peer: Mutex<Option<SocketAddr>>,
    known_peers: Mutex<VecDeque<SocketAddr>>,
}

impl NoizeUdpSocket {
    pub fn new(socket: UdpSocket, params: MasqueParams) -> Self {
        NoizeUdpSocket {
            socket: Arc::new(socket),
            params,
            enabled: AtomicBool::new(true),
            first_initial: HandshakeGate::new(),
            first_handshake: HandshakeGate::new(),
            last_peer: Mutex::new(None),
            known_peers: Mutex::new(VecDeque::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Idempotent, thread-safe: only the transition from enabled to
    /// disabled fires the `jc_after_hs` junk burst (spec §4.D step 5, §9).
    pub fn disable_obfuscation(&self) {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        let remaining = self.params.jc_after_hs;
        if remaining <= 0 {
            return;
        }
        let Some(endpoint) = *self.last_peer.lock().expect("noize_udp lock poisoned") else {
            return;
        };
        let socket = Arc::clone(&self.socket);
        let (jmin, jmax, interval) = (self.params.jmin, self.params.jmax, self.params.junk_interval);
        tokio::spawn(async move {
            for _ in 0..remaining {
                let junk = gen_random(uniform_junk_size(jmin, jmax));
                if let Err(e) = socket.send_to(&junk, endpoint).await {
                    log::debug!("masque post-handshake junk send failed: {e}");
                }
                MASQUE_JUNK_PACKETS.inc();
                tokio::time::sleep(interval).await;
            }
        });
    }

    async fn send_junk_burst(&self, count: i64, endpoint: SocketAddr) {
        if count <= 0 {
            return;
        }
        let mut sizes: Vec<usize> = (0..count)
            .map(|_| uniform_junk_size(self.params.jmin, self.params.jmax))
            .collect();
        if self.params.reversed_order {
            sizes.reverse();
        }
        for size in sizes {
            if self.params.fake_loss > 0.0 && rand::thread_rng().gen_bool(self.params.fake_loss) {
                continue; // simulated loss of a junk packet, never of real payload
            }
            let junk = gen_random(size);
            let copies = if self.params.duplicate_packets { 2 } else { 1 };
            for _ in 0..copies {
                if let Err(e) = self.socket.send_to(&junk, endpoint).await {
                    log::debug!("masque junk send failed: {e}");
                }
                MASQUE_JUNK_PACKETS.inc();
            }
            let delay = if self.params.junk_random && self.params.delay_max > self.params.delay_min
            {
                let lo = self.params.delay_min.as_millis() as u64;
                let hi = self.params.delay_max.as_millis() as u64;
                std::time::Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
            } else {
                self.params.junk_interval
            };
            tokio::time::sleep(delay).await;
        }
    }

    /// Sends `buf` to `endpoint`, applying obfuscation while enabled.
    /// After [`NoizeUdpSocket::disable_obfuscation`], this is an exact
    /// passthrough: one write in, one datagram out, unchanged.
    pub async fn send_to(&self, buf: &[u8], endpoint: SocketAddr) -> std::io::Result<()> {
        *self.last_peer.lock().expect("noize_udp lock poisoned") = Some(endpoint);

        if !self.is_enabled() {
            self.socket.send_to(buf, endpoint).await?;
            return Ok(());
        }

        let pkt_type = detect_quic_packet_type(buf);
        let heavy = matches!(pkt_type, QuicPacketType::Initial | QuicPacketType::Handshake);

        let mut payload = buf.to_vec();
        if heavy {
            if self.params.padding_max > 0 {
                let pad_len =
                    uniform_junk_size(self.params.padding_min, self.params.padding_max);
                payload.extend(gen_random(pad_len));
            }
            if !self.params.mimic_protocol.is_empty() {
                payload = wrap_mimicry(payload, &self.params.mimic_protocol);
            }
        }

        let is_first_initial = matches!(pkt_type, QuicPacketType::Initial) && self.first_initial.fire_once();
        if is_first_initial {
            self.send_junk_burst(self.params.jc_before_hs, endpoint).await;
        }

        let fragments = if heavy && self.params.fragment_initial
            && payload.len() > self.params.fragment_size.max(0) as usize
        {
            let frag_size = self.params.fragment_size.max(1) as usize;
            payload.chunks(frag_size).map(|c| c.to_vec()).collect::<Vec<_>>()
        } else if self.params.sni_fragmentation {
            fragment_sni(&payload, self.params.sni_fragment.max(0) as usize)
        } else {
            vec![payload]
        };

        let fragmented = fragments.len() > 1;
        for (i, frag) in fragments.iter().enumerate() {
            self.socket.send_to(frag, endpoint).await?;
            if fragmented {
                MASQUE_FRAGMENTS.inc();
                if i + 1 < fragments.len() {
                    tokio::time::sleep(self.params.fragment_delay).await;
                }
            }
        }

        if is_first_initial {
            self.send_junk_burst(self.params.jc_after_i1, endpoint).await;
        } else if matches!(pkt_type, QuicPacketType::Handshake) && self.first_handshake.fire_once() {
            self.send_junk_burst(self.params.jc_during_hs, endpoint).await;
        }

        Ok(())
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        let (n, peer) = self.socket.recv_from(buf).await?;
        let mut known = self.known_peers.lock().expect("noize_udp lock poisoned");
        if !known.contains(&peer) {
            if known.len() == KNOWN_PEERS_CAP {
                known.pop_front();
            }
            known.push_back(peer);
        }
        Ok((n, peer))
    }

    pub fn known_peers(&self) -> Vec<SocketAddr> {
        self.known_peers.lock().expect("noize_udp lock poisoned").iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_long_header_types() {
        assert_eq!(detect_quic_packet_type(&[0xC0]), QuicPacketType::Initial);
        assert_eq!(detect_quic_packet_type(&[0xD0]), QuicPacketType::ZeroRtt);
        assert_eq!(detect_quic_packet_type(&[0xE0]), QuicPacketType::Handshake);
        assert_eq!(detect_quic_packet_type(&[0xF0]), QuicPacketType::Retry);
    }

    #[test]
    fn detects_short_header() {
        assert_eq!(detect_quic_packet_type(&[0x40]), QuicPacketType::ShortHeader);
        assert_eq!(detect_quic_packet_type(&[]), QuicPacketType::ShortHeader);
    }

    #[tokio::test]
    async fn passthrough_after_disable_is_exact() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let noize = NoizeUdpSocket::new(client, crate::config::masque_preset_defaults("minimal"));
        noize.disable_obfuscation();

        let payload = vec![0x40, 1, 2, 3, 4];
        noize.send_to(&payload, server_addr).await.unwrap();

        let mut buf = [0u8; 1500];
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], payload.as_slice());
    }

    #[test]
    fn sni_fragmentation_splits_client_hello_like_buffers() {
        let buf = vec![0x16, 0x03, 0x03, 0x00, 0x10, 0xAA, 0xBB, 0xCC];
        let frags = fragment_sni(&buf, 3);
        assert_eq!(frags.len(), 2);
        assert_eq!(frags[0], buf[..3]);
        assert_eq!(frags[1], buf[3..]);
    }

    #[test]
    fn sni_fragmentation_skips_non_tls_buffers() {
        let buf = vec![0x01, 0x02, 0x03];
        assert_eq!(fragment_sni(&buf, 1), vec![buf]);
    }
}
