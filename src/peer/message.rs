//! Peer-wire protocol messages: length-prefixed, typed payloads.

use std::io::{Error, ErrorKind};

#[derive(Debug, PartialEq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(u32, u32, u32),
    Piece(u32, u32, Vec<u8>),
    Cancel(u32, u32, u32),
    Port(u16),
}

impl Message {
    pub fn serialize(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(4 + self.len());
        msg.extend_from_slice(&(self.len() as u32).to_be_bytes());
        match self {
            Message::KeepAlive => {}
            Message::Choke => msg.push(0),
            Message::Unchoke => msg.push(1),
            Message::Interested => msg.push(2),
            Message::NotInterested => msg.push(3),
            Message::Have(index) => {
                msg.push(4);
                msg.extend_from_slice(&index.to_be_bytes());
            }
            Message::Bitfield(bitfield) => {
                msg.push(5);
                msg.extend_from_slice(bitfield);
            }
            Message::Request(index, begin, length) => {
                msg.push(6);
                msg.extend_from_slice(&index.to_be_bytes());
                msg.extend_from_slice(&begin.to_be_bytes());
                msg.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece(index, begin, block) => {
                msg.push(7);
                msg.extend_from_slice(&index.to_be_bytes());
                msg.extend_from_slice(&begin.to_be_bytes());
                msg.extend_from_slice(block);
            }
            Message::Cancel(index, begin, length) => {
                msg.push(8);
                msg.extend_from_slice(&index.to_be_bytes());
                msg.extend_from_slice(&begin.to_be_bytes());
                msg.extend_from_slice(&length.to_be_bytes());
            }
            Message::Port(port) => {
                msg.push(9);
                msg.extend_from_slice(&port.to_be_bytes());
            }
        }
        msg
    }

    /// Parses a single message body (no length prefix). `data` is empty
    /// for a keep-alive.
    pub fn deserialize(data: &[u8]) -> Result<Message, Error> {
        if data.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let id = data[0];
        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                if data.len() != 5 {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "have message should be 5 bytes long",
                    ));
                }
                let mut index = [0; 4];
                index.copy_from_slice(&data[1..5]);
                Message::Have(u32::from_be_bytes(index))
            }
            5 => {
                if data.len() < 2 {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "bitfield message should be at least 2 bytes long",
                    ));
                }
                Message::Bitfield(data[1..].to_vec())
            }
            6 => {
                if data.len() != 13 {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "request message should be 13 bytes long",
                    ));
                }
                let mut index = [0; 4];
                index.copy_from_slice(&data[1..5]);
                let mut begin = [0; 4];
                begin.copy_from_slice(&data[5..9]);
                let mut length = [0; 4];
                length.copy_from_slice(&data[9..13]);
                Message::Request(
                    u32::from_be_bytes(index),
                    u32::from_be_bytes(begin),
                    u32::from_be_bytes(length),
                )
            }
            7 => {
                if data.len() < 9 {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "piece message should be at least 9 bytes long",
                    ));
                }
                let mut index = [0; 4];
                index.copy_from_slice(&data[1..5]);
                let mut begin = [0; 4];
                begin.copy_from_slice(&data[5..9]);
                Message::Piece(
                    u32::from_be_bytes(index),
                    u32::from_be_bytes(begin),
                    data[9..].to_vec(),
                )
            }
            8 => {
                if data.len() != 13 {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "cancel message should be 13 bytes long",
                    ));
                }
                let mut index = [0; 4];
                index.copy_from_slice(&data[1..5]);
                let mut begin = [0; 4];
                begin.copy_from_slice(&data[5..9]);
                let mut length = [0; 4];
                length.copy_from_slice(&data[9..13]);
                Message::Cancel(
                    u32::from_be_bytes(index),
                    u32::from_be_bytes(begin),
                    u32::from_be_bytes(length),
                )
            }
            9 => {
                if data.len() != 3 {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "port message should be 3 bytes long",
                    ));
                }
                let mut port = [0; 2];
                port.copy_from_slice(&data[1..3]);
                Message::Port(u16::from_be_bytes(port))
            }
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("unknown message id {id}"),
                ))
            }
        };
        Ok(msg)
    }

    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request(_, _, _) => Some(6),
            Message::Piece(_, _, _) => Some(7),
            Message::Cancel(_, _, _) => Some(8),
            Message::Port(_) => Some(9),
        }
    }

    /// Length of the body that follows the 4-byte length prefix.
    pub fn len(&self) -> usize {
        match self {
            Message::KeepAlive => 0,
            Message::Choke => 1,
            Message::Unchoke => 1,
            Message::Interested => 1,
            Message::NotInterested => 1,
            Message::Have(_) => 5,
            Message::Bitfield(bitfield) => 1 + bitfield.len(),
            Message::Request(_, _, _) => 13,
            Message::Piece(_, _, block) => 9 + block.len(),
            Message::Cancel(_, _, _) => 13,
            Message::Port(_) => 3,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_round_trips() {
        let msg = Message::KeepAlive;
        let bytes = msg.serialize();
        assert_eq!(bytes, vec![0, 0, 0, 0]);
    }

    #[test]
    fn choke_round_trips() {
        let msg = Message::Choke;
        let bytes = msg.serialize();
        assert_eq!(bytes, vec![0, 0, 0, 1, 0]);
        let decoded = Message::deserialize(&bytes[4..]).unwrap();
        assert_eq!(decoded, Message::Choke);
    }

    #[test]
    fn piece_length_prefix_survives_block_over_255_bytes() {
        let block = vec![7u8; 16 * 1024];
        let msg = Message::Piece(1, 0, block.clone());
        let bytes = msg.serialize();
        let len = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!(len as usize, 9 + block.len());
        let decoded = Message::deserialize(&bytes[4..]).unwrap();
        assert_eq!(decoded, Message::Piece(1, 0, block));
    }

    #[test]
    fn bitfield_length_prefix_survives_large_payload() {
        let bitfield = vec![0xFFu8; 300];
        let msg = Message::Bitfield(bitfield.clone());
        let bytes = msg.serialize();
        let len = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!(len as usize, 1 + bitfield.len());
    }

    #[test]
    fn request_round_trips() {
        let msg = Message::Request(3, 16384, 16384);
        let bytes = msg.serialize();
        let decoded = Message::deserialize(&bytes[4..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn unknown_id_is_rejected() {
        assert!(Message::deserialize(&[42]).is_err());
    }
}
