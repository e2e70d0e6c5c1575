//! Capsule framing (RFC 9297), the unit the Connect-IP client reads and
//! writes on its CONNECT stream (spec §3, §4.E, §6.2).

use super::varint::{self, VarintError};
use thiserror::Error;

/// `Type=0x00`: a raw IP packet. Every other type (address-assign/request,
/// route-advertise) is parsed and ignored by the caller.
pub const CAPSULE_TYPE_DATAGRAM: u64 = 0x00;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CapsuleError {
    #[error("varint error: {0}")]
    Varint(#[from] VarintError),
    #[error("capsule declares length {declared} but only {available} bytes are available")]
    Truncated { declared: u64, available: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capsule {
    pub capsule_type: u64,
    pub payload: Vec<u8>,
}

impl Capsule {
    pub fn datagram(payload: Vec<u8>) -> Self {
        Capsule {
            capsule_type: CAPSULE_TYPE_DATAGRAM,
            payload,
        }
    }

    pub fn is_datagram(&self) -> bool {
        self.capsule_type == CAPSULE_TYPE_DATAGRAM
    }

    /// Encodes this capsule as `varint(type) || varint(length) || payload`.
    pub fn encode(&self) -> Result<Vec<u8>, CapsuleError> {
        encode(self.capsule_type, &self.payload)
    }
}

/// Encodes a single capsule without allocating a [`Capsule`] first.
pub fn encode(capsule_type: u64, payload: &[u8]) -> Result<Vec<u8>, CapsuleError> {
    let mut out = varint::encode(capsule_type)?;
    out.extend(varint::encode(payload.len() as u64)?);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decodes one capsule from the start of `buf`, returning it along with the
/// number of bytes consumed.
pub fn decode(buf: &[u8]) -> Result<(Capsule, usize), CapsuleError> {
    let (capsule_type, type_len) = varint::decode(buf)?;
    let (length, len_len) = varint::decode(&buf[type_len..])?;
    let header_len = type_len + len_len;
    let available = buf.len().saturating_sub(header_len);
    if (length as usize) > available {
        return Err(CapsuleError::Truncated {
            declared: length,
            available,
        });
    }
    let payload = buf[header_len..header_len + length as usize].to_vec();
    Ok((
        Capsule {
            capsule_type,
            payload,
        },
        header_len + length as usize,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_capsule_round_trips() {
        let mut payload = vec![0x45, 0x00];
        payload.extend(std::iter::repeat(0xAB).take(90));
        assert_eq!(payload.len(), 92);

        let encoded = encode(CAPSULE_TYPE_DATAGRAM, &payload).unwrap();
        let mut expected = vec![0x00]; // type 0x00 fits in 1-byte varint
        expected.extend(varint::encode(92).unwrap());
        expected.extend_from_slice(&payload);
        assert_eq!(encoded, expected);

        let (decoded, consumed) = decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.capsule_type, 0x00);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn round_trip_for_arbitrary_type_and_value() {
        for &t in &[0u64, 1, 0x3f, 0x40, 0x3fff, 0x4000, (1u64 << 62) - 1] {
            let value = vec![1, 2, 3, 4, 5];
            let encoded = encode(t, &value).unwrap();
            let (decoded, consumed) = decode(&encoded).unwrap();
            assert_eq!(consumed, encoded.len());
            assert_eq!(decoded.capsule_type, t);
            assert_eq!(decoded.payload, value);
        }
    }

    #[test]
    fn non_datagram_types_are_still_decodable() {
        let cap = Capsule {
            capsule_type: 0x01, // address-assign, e.g.
            payload: vec![9, 9, 9],
        };
        assert!(!cap.is_datagram());
        let encoded = cap.encode().unwrap();
        let (decoded, _) = decode(&encoded).unwrap();
        assert_eq!(decoded, cap);
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut buf = varint::encode(0x00).unwrap();
        buf.extend(varint::encode(10).unwrap()); // claims 10 bytes
        buf.extend_from_slice(&[1, 2, 3]); // only 3 present
        assert!(matches!(decode(&buf), Err(CapsuleError::Truncated { .. })));
    }
}
