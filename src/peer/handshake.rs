//! The fixed 68-byte greeting exchanged at the start of every peer
//! connection, before any length-prefixed message is valid on the wire.

use crate::error::PeerError;

pub const PROTOCOL: &str = "BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Handshake {
        Handshake { reserved: [0; 8], info_hash, peer_id }
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut bytes = [0u8; HANDSHAKE_LEN];
        bytes[0] = PROTOCOL.len() as u8;
        bytes[1..20].copy_from_slice(PROTOCOL.as_bytes());
        bytes[20..28].copy_from_slice(&self.reserved);
        bytes[28..48].copy_from_slice(&self.info_hash);
        bytes[48..68].copy_from_slice(&self.peer_id);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Handshake, PeerError> {
        if bytes.len() != HANDSHAKE_LEN {
            return Err(PeerError::HandshakeMismatch(format!(
                "expected {HANDSHAKE_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let pstrlen = bytes[0] as usize;
        if pstrlen != PROTOCOL.len() {
            return Err(PeerError::HandshakeMismatch(format!(
                "unexpected pstrlen {pstrlen}"
            )));
        }
        let pstr = std::str::from_utf8(&bytes[1..20])
            .map_err(|_| PeerError::HandshakeMismatch("protocol string is not utf-8".into()))?;
        if pstr != PROTOCOL {
            return Err(PeerError::HandshakeMismatch(format!("unexpected protocol string {pstr:?}")));
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&bytes[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&bytes[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&bytes[48..68]);
        Ok(Handshake { reserved, info_hash, peer_id })
    }

    pub fn matches_infohash(&self, expected: &[u8; 20]) -> bool {
        &self.info_hash == expected
    }

    pub fn matches_peer_id(&self, expected: &[u8; 20]) -> bool {
        &self.peer_id == expected
    }
}

/// Standalone predicate used by the handshake testable property: true iff
/// `bytes` is a well-formed handshake whose infohash and peer id both equal
/// the expected values.
pub fn validate(bytes: &[u8], expected_info_hash: &[u8; 20], expected_peer_id: &[u8; 20]) -> bool {
    match Handshake::from_bytes(bytes) {
        Ok(h) => h.matches_infohash(expected_info_hash) && h.matches_peer_id(expected_peer_id),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ([u8; 20], [u8; 20]) {
        ([7u8; 20], [9u8; 20])
    }

    #[test]
    fn round_trips_through_bytes() {
        let (info_hash, peer_id) = sample();
        let handshake = Handshake::new(info_hash, peer_id);
        let bytes = handshake.to_bytes();
        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        assert_eq!(bytes[0], 19);
        let decoded = Handshake::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn validate_agrees_with_infohash_and_peer_id_match() {
        let (info_hash, peer_id) = sample();
        let bytes = Handshake::new(info_hash, peer_id).to_bytes();
        assert!(validate(&bytes, &info_hash, &peer_id));
        assert!(!validate(&bytes, &[0u8; 20], &peer_id));
        assert!(!validate(&bytes, &info_hash, &[0u8; 20]));
    }

    #[test]
    fn rejects_wrong_pstrlen() {
        let mut bytes = Handshake::new([1; 20], [2; 20]).to_bytes();
        bytes[0] = 20;
        assert!(Handshake::from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_wrong_protocol_string() {
        let mut bytes = Handshake::new([1; 20], [2; 20]).to_bytes();
        bytes[1] = b'X';
        assert!(Handshake::from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_short_input() {
        assert!(Handshake::from_bytes(&[0u8; 67]).is_err());
    }
}
