//! Length-prefixed wire messages exchanged after the handshake.
//!
//! This implementation adopts interpretation (a) from the design notes:
//! `request` carries only a piece index (no offset/length) and `piece`
//! replies are chunked by the sender into [`BLOCK_SIZE`] blocks, each
//! carrying a last-chunk flag instead of a byte offset. It interoperates
//! only with peers running this same implementation.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// Size of one chunk of a `piece` message, per the design notes' §4.3
/// chunking scheme (distinct from the canonical protocol's 16 KiB block).
pub const BLOCK_SIZE: usize = 4 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(u32),
    Piece { index: u32, is_last: bool, data: Vec<u8> },
    /// Any message id not in the table above; carried verbatim and ignored
    /// by callers, per spec's "other | reserved | ignored".
    Unknown(u8, Vec<u8>),
}

impl Message {
    fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request(_) => Some(6),
            Message::Piece { .. } => Some(7),
            Message::Unknown(id, _) => Some(*id),
        }
    }

    /// Serializes the full wire form, including the 4-byte length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let Some(id) = self.id() else {
            return vec![0, 0, 0, 0];
        };
        let mut body = Vec::new();
        body.write_u8(id).expect("writing to a Vec never fails");
        match self {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {}
            Message::Have(index) => body.write_u32::<BigEndian>(*index).unwrap(),
            Message::Bitfield(bits) => body.extend_from_slice(bits),
            Message::Request(index) => body.write_u32::<BigEndian>(*index).unwrap(),
            Message::Piece { index, is_last, data } => {
                body.write_u32::<BigEndian>(*index).unwrap();
                body.write_u8(*is_last as u8).unwrap();
                body.extend_from_slice(data);
            }
            Message::Unknown(_, payload) => body.extend_from_slice(payload),
            Message::KeepAlive => unreachable!(),
        }
        let mut out = Vec::with_capacity(4 + body.len());
        out.write_u32::<BigEndian>(body.len() as u32).unwrap();
        out.extend_from_slice(&body);
        out
    }

    /// Decodes a message body (everything after the length prefix). `id`
    /// is the first byte of that body; `rest` is everything after it.
    /// Callers must have already handled `length == 0` as `KeepAlive`.
    pub fn decode(id: u8, rest: &[u8]) -> Result<Message, String> {
        match id {
            0 => Ok(Message::Choke),
            1 => Ok(Message::Unchoke),
            2 => Ok(Message::Interested),
            3 => Ok(Message::NotInterested),
            4 => {
                if rest.len() != 4 {
                    return Err(format!("have message carries {} bytes, want 4", rest.len()));
                }
                Ok(Message::Have((&rest[..]).read_u32::<BigEndian>().unwrap()))
            }
            5 => Ok(Message::Bitfield(rest.to_vec())),
            6 => {
                if rest.len() != 4 {
                    return Err(format!("request message carries {} bytes, want 4", rest.len()));
                }
                Ok(Message::Request((&rest[..]).read_u32::<BigEndian>().unwrap()))
            }
            7 => {
                if rest.len() < 5 {
                    return Err(format!("piece message carries {} bytes, want at least 5", rest.len()));
                }
                let mut cursor = &rest[..4];
                let index = cursor.read_u32::<BigEndian>().unwrap();
                let is_last = rest[4] != 0;
                Ok(Message::Piece { index, is_last, data: rest[5..].to_vec() })
            }
            other => Ok(Message::Unknown(other, rest.to_vec())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) {
        let bytes = msg.encode();
        let len = u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
        assert_eq!(bytes.len(), 4 + len);
        if len == 0 {
            assert_eq!(msg, Message::KeepAlive);
            return;
        }
        let decoded = Message::decode(bytes[4], &bytes[5..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn keep_alive_is_a_bare_zero_length() {
        assert_eq!(Message::KeepAlive.encode(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn round_trips_fixed_messages() {
        round_trip(Message::Choke);
        round_trip(Message::Unchoke);
        round_trip(Message::Interested);
        round_trip(Message::NotInterested);
        round_trip(Message::Have(42));
        round_trip(Message::Bitfield(vec![0b1010_0000, 0b1111_0000]));
        round_trip(Message::Request(7));
    }

    #[test]
    fn round_trips_chunked_piece() {
        round_trip(Message::Piece { index: 3, is_last: false, data: vec![1, 2, 3, 4] });
        round_trip(Message::Piece { index: 3, is_last: true, data: vec![] });
    }

    #[test]
    fn unknown_ids_are_preserved_not_rejected() {
        let decoded = Message::decode(200, &[1, 2, 3]).unwrap();
        assert_eq!(decoded, Message::Unknown(200, vec![1, 2, 3]));
    }

    #[test]
    fn rejects_malformed_have() {
        assert!(Message::decode(4, &[0, 0]).is_err());
    }
}
