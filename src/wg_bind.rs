//! The WireGuard bind contract (spec §6.4) and the IKEv2 envelope builder
//! consumed by the preflight bind (module C).
//!
//! `Bind` mirrors wireguard-go's `conn.Bind` interface: a userspace WG
//! device owns one, and the preflight decorator (module C) wraps an inner
//! `Bind` without needing to know whether it is a real kernel-bypassing
//! socket or, in tests, [`MockBind`].

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// A WireGuard endpoint: destination address plus whatever the bind needs
/// to reply (here, just the socket address — no NAT-traversal metadata is
/// in scope).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(pub SocketAddr);

impl Endpoint {
    pub fn dst_ip(&self) -> std::net::IpAddr {
        self.0.ip()
    }

    pub fn dst_port(&self) -> u16 {
        self.0.port()
    }
}

/// One receive function per bound queue, matching wireguard-go's
/// multi-queue `recv_fns` slice.
pub type RecvFn = Box<dyn FnMut(&mut [u8]) -> io::Result<(usize, Endpoint)> + Send>;

/// The bind contract external WireGuard implementations satisfy (spec
/// §6.4). The preflight decorator (module C) composes over any `Bind`.
/// Every operation takes `&self` — real binds hold their socket behind
/// their own interior mutability, the way `tokio::net::UdpSocket` does,
/// so the decorator can hold its inner bind behind a plain `Arc` and still
/// spawn the post-handshake junk burst without a lock.
pub trait Bind: Send + Sync {
    fn open(&self, port: u16) -> io::Result<(Vec<RecvFn>, u16)>;
    fn close(&self) -> io::Result<()>;
    fn set_mark(&self, mark: u32) -> io::Result<()>;
    fn parse_endpoint(&self, s: &str) -> io::Result<Endpoint>;
    fn batch_size(&self) -> usize;
    fn send(&self, bufs: &[&[u8]], endpoint: Endpoint) -> io::Result<()>;
}

/// An in-memory `Bind` used by tests to observe exactly which datagrams
/// the preflight decorator sent, in order, without a real socket.
#[derive(Clone, Default)]
pub struct MockBind {
    sent: Arc<Mutex<VecDeque<(Endpoint, Vec<u8>)>>>,
    mark: Arc<Mutex<u32>>,
    open: Arc<Mutex<bool>>,
}

impl MockBind {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains and returns every datagram sent so far, in send order.
    pub fn take_sent(&self) -> Vec<(Endpoint, Vec<u8>)> {
        self.sent.lock().expect("mockbind lock poisoned").drain(..).collect()
    }

    pub fn mark(&self) -> u32 {
        *self.mark.lock().expect("mockbind lock poisoned")
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock().expect("mockbind lock poisoned")
    }
}

impl Bind for MockBind {
    fn open(&self, port: u16) -> io::Result<(Vec<RecvFn>, u16)> {
        *self.open.lock().expect("mockbind lock poisoned") = true;
        Ok((Vec::new(), port))
    }

    fn close(&self) -> io::Result<()> {
        *self.open.lock().expect("mockbind lock poisoned") = false;
        Ok(())
    }

    fn set_mark(&self, mark: u32) -> io::Result<()> {
        *self.mark.lock().expect("mockbind lock poisoned") = mark;
        Ok(())
    }

    fn parse_endpoint(&self, s: &str) -> io::Result<Endpoint> {
        s.parse::<SocketAddr>()
            .map(Endpoint)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }

    fn batch_size(&self) -> usize {
        1
    }

    fn send(&self, bufs: &[&[u8]], endpoint: Endpoint) -> io::Result<()> {
        let mut sent = self.sent.lock().expect("mockbind lock poisoned");
        for buf in bufs {
            sent.push_back((endpoint, buf.to_vec()));
        }
        Ok(())
    }
}

const IKE_HEADER_LEN: usize = 28;
const IKE_SA_PAYLOAD_LEN: usize = 24;
pub const IKEV2_ENVELOPE_LEN: usize = IKE_HEADER_LEN + IKE_SA_PAYLOAD_LEN;

/// Prepends a 52-byte IKE_SA_INIT-shaped envelope to `payload` (spec
/// §4.C, §6.2). Applied only to `I1` when non-empty; purely cosmetic to a
/// DPI box watching for plausible IKE negotiation traffic, it carries no
/// real IKE semantics.
pub fn wrap_ikev2(payload: &[u8]) -> Vec<u8> {
    let total_len = (IKEV2_ENVELOPE_LEN + payload.len()) as u32;

    let mut initiator_spi = [0u8; 8];
    if payload.len() >= 8 {
        initiator_spi.copy_from_slice(&payload[0..8]);
    } else {
        rand::Rng::fill(&mut rand::thread_rng(), &mut initiator_spi);
    }
    let mut responder_spi = [0u8; 8];
    rand::Rng::fill(&mut rand::thread_rng(), &mut responder_spi);

    let mut out = Vec::with_capacity(IKEV2_ENVELOPE_LEN + payload.len());
    out.extend_from_slice(&initiator_spi);
    out.extend_from_slice(&responder_spi);
    out.push(0x21); // next payload: Security Association
    out.push(0x20); // version: major 2, minor 0
    out.push(0x22); // exchange type: IKE_SA_INIT
    out.push(0x08); // flags: initiator
    out.extend_from_slice(&[0, 0, 0, 0]); // message ID
    out.extend_from_slice(&total_len.to_be_bytes());
    debug_assert_eq!(out.len(), IKE_HEADER_LEN);

    // Minimal SA payload: one proposal, one transform advertising AES-CBC
    // with a 256-bit key-length attribute.
    out.extend_from_slice(&[0x00, 0x00, 0x00, 0x18]); // SA payload header, length 24
    out.extend_from_slice(&[0x00, 0x00, 0x00, 0x14, 0x01, 0x01, 0x00, 0x01]); // proposal
    out.extend_from_slice(&[0x00, 0x00, 0x00, 0x0C, 0x01, 0x00, 0x00, 0x0C]); // transform: ENCR_AES_CBC
    out.extend_from_slice(&[0x80, 0x0E, 0x01, 0x00]); // attribute: key length 256
    debug_assert_eq!(out.len(), IKEV2_ENVELOPE_LEN);

    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_length_is_payload_plus_52() {
        let payload = vec![0xAB; 16];
        let wrapped = wrap_ikev2(&payload);
        assert_eq!(wrapped.len(), payload.len() + 52);
    }

    #[test]
    fn envelope_fixed_bytes_match_spec() {
        let payload = (0..20u8).collect::<Vec<_>>();
        let wrapped = wrap_ikev2(&payload);
        assert_eq!(&wrapped[0..8], &payload[0..8]);
        assert_eq!(wrapped[17], 0x20);
        assert_eq!(wrapped[18], 0x22);
        assert_eq!(wrapped[19], 0x08);
        let total_len = u32::from_be_bytes(wrapped[24..28].try_into().unwrap());
        assert_eq!(total_len as usize, wrapped.len());
    }

    #[test]
    fn short_payload_gets_random_initiator_spi() {
        let payload = vec![0x01, 0x02, 0x03];
        let wrapped = wrap_ikev2(&payload);
        assert_eq!(wrapped.len(), payload.len() + 52);
    }

    #[test]
    fn mock_bind_records_sends_in_order() {
        let bind = MockBind::new();
        let ep = Endpoint("10.0.0.1:2408".parse().unwrap());
        bind.send(&[&[1, 2, 3]], ep).unwrap();
        bind.send(&[&[4, 5]], ep).unwrap();
        let sent = bind.take_sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1, vec![1, 2, 3]);
        assert_eq!(sent[1].1, vec![4, 5]);
    }
}
