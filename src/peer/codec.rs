//! The wire-level encoding of the BitTorrent peer protocol (spec.md §4.5):
//! the fixed 68-byte handshake and the length-prefixed message stream that
//! follows it.

use crate::{error::Error, BlockInfo, PeerId, Result, Sha1Hash, BLOCK_LEN, MAX_REQUEST_LEN};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// The protocol string that prefixes every handshake, as mandated by the
/// standard.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The handshake is always exactly this many bytes: 1 (prot len) + 19 (prot)
/// + 8 (reserved) + 20 (info hash) + 20 (peer id).
const HANDSHAKE_LEN: usize = 68;

/// The BitTorrent handshake, exchanged once at the start of a connection,
/// before any other messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

/// Frames the 68-byte handshake. Used only for the very first exchange on a
/// connection; afterwards the socket is switched over to [`PeerCodec`].
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<()> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(prot.len() as u8);
        buf.put(&prot[..]);
        buf.put(&reserved[..]);
        buf.put(&info_hash[..]);
        buf.put(&peer_id[..]);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(Error::Protocol(format!(
                "invalid protocol string length: {prot_len}"
            )));
        }

        if buf.len() < 1 + prot_len + 8 + 20 + 20 {
            return Ok(None);
        }

        buf.advance(1);
        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::Protocol("invalid protocol string".into()));
        }

        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);

        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);

        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// Message ids as they appear on the wire (spec.md §4.5's message table).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
}

impl MessageId {
    fn from_u8(id: u8) -> Result<Self> {
        Ok(match id {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Block,
            8 => Self::Cancel,
            _ => return Err(Error::Protocol(format!("invalid message id: {id}"))),
        })
    }
}

/// A post-handshake peer protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: usize },
    Bitfield(crate::Bitfield),
    Request(BlockInfo),
    Block { piece_index: usize, offset: u32, data: Vec<u8> },
    Cancel(BlockInfo),
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

/// Frames the length-prefixed message stream exchanged after the handshake.
pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                buf.reserve(4);
                buf.put_u32(0);
            }
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {
                buf.reserve(5);
                buf.put_u32(1);
                buf.put_u8(msg.id().expect("fixed message has id") as u8);
            }
            Message::Have { piece_index } => {
                buf.reserve(9);
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.to_wire_bytes();
                buf.reserve(5 + bytes.len());
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put(&bytes[..]);
            }
            Message::Request(block) => {
                buf.reserve(17);
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.reserve(13 + data.len());
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put(&data[..]);
            }
            Message::Cancel(block) => {
                buf.reserve(17);
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut len_buf = [0; 4];
        len_buf.copy_from_slice(&buf[0..4]);
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if buf.len() < 4 + len {
            // not enough data for the full message yet; reserve the rest so
            // the next read doesn't have to grow the buffer incrementally
            buf.reserve(4 + len - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let id = MessageId::from_u8(buf[0])?;
        buf.advance(1);
        let payload_len = len - 1;

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                if payload_len != 4 {
                    return Err(Error::Protocol("invalid have payload length".into()));
                }
                let piece_index = buf.get_u32() as usize;
                Message::Have { piece_index }
            }
            MessageId::Bitfield => {
                let bytes = buf.split_to(payload_len);
                // the codec has no torrent context to know the real piece
                // count yet; the session truncates (and checks pad bits)
                // once it has matched this connection to a torrent.
                let bitfield = crate::Bitfield::from_wire_bytes(&bytes[..]);
                Message::Bitfield(bitfield)
            }
            MessageId::Request => {
                if payload_len != 12 {
                    return Err(Error::Protocol("invalid request payload length".into()));
                }
                let piece_index = buf.get_u32() as usize;
                let offset = buf.get_u32();
                let length = buf.get_u32();
                if length > MAX_REQUEST_LEN {
                    return Err(Error::Protocol(format!(
                        "request length {length} exceeds max {MAX_REQUEST_LEN}"
                    )));
                }
                Message::Request(BlockInfo {
                    piece_index,
                    offset,
                    len: length,
                })
            }
            MessageId::Block => {
                if payload_len < 8 {
                    return Err(Error::Protocol("invalid piece payload length".into()));
                }
                let piece_index = buf.get_u32() as usize;
                let offset = buf.get_u32();
                let data = buf.split_to(payload_len - 8).to_vec();
                Message::Block {
                    piece_index,
                    offset,
                    data,
                }
            }
            MessageId::Cancel => {
                if payload_len != 12 {
                    return Err(Error::Protocol("invalid cancel payload length".into()));
                }
                let piece_index = buf.get_u32() as usize;
                let offset = buf.get_u32();
                let length = buf.get_u32();
                Message::Cancel(BlockInfo {
                    piece_index,
                    offset,
                    len: length,
                })
            }
        };

        Ok(Some(msg))
    }
}

/// Sanity bound used by callers to size request pipelines; not itself a wire
/// concept.
#[allow(dead_code)]
pub(crate) const DEFAULT_BLOCK_LEN: u32 = BLOCK_LEN;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let handshake = Handshake::new([3; 20], [7; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);
        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn handshake_rejects_wrong_protocol_string() {
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.put(&b"Not BitTorrent prot"[..]);
        buf.put(&[0u8; 8][..]);
        buf.put(&[1u8; 20][..]);
        buf.put(&[2u8; 20][..]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn keep_alive_round_trips() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::KeepAlive);
    }

    #[test]
    fn request_round_trips() {
        let block = BlockInfo {
            piece_index: 5,
            offset: 0x4000,
            len: 0x4000,
        };
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Request(block), &mut buf).unwrap();
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::Request(block));
    }

    #[test]
    fn request_over_max_len_is_protocol_violation() {
        let mut buf = BytesMut::new();
        buf.put_u32(13);
        buf.put_u8(MessageId::Request as u8);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(MAX_REQUEST_LEN + 1);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn block_round_trips() {
        let data = vec![9u8; 100];
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(
                Message::Block {
                    piece_index: 1,
                    offset: 0,
                    data: data.clone(),
                },
                &mut buf,
            )
            .unwrap();
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            msg,
            Message::Block {
                piece_index: 1,
                offset: 0,
                data
            }
        );
    }

    #[test]
    fn incomplete_message_returns_none() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(MessageId::Have as u8);
        // missing the u32 piece index
        assert!(PeerCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn bitfield_round_trips() {
        let mut bf = crate::Bitfield::allocate(10);
        bf.set(0).unwrap();
        bf.set(9).unwrap();
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(Message::Bitfield(bf.clone()), &mut buf)
            .unwrap();
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        match msg {
            Message::Bitfield(decoded) => {
                assert!(decoded.test(0));
                assert!(decoded.test(9));
                assert!(!decoded.test(1));
            }
            _ => panic!("expected bitfield message"),
        }
    }
}
