//! The MASQUE transport leg: QUIC varints, RFC 9297 capsules, the noize
//! UDP wrapper (module D), and the Connect-IP client itself (module E).

pub mod capsule;
pub mod connect_ip;
pub mod noize_udp;
pub mod varint;
