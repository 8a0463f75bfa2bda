//! Eth sub-protocol messages and per-version capability tables.
//!
//! Every message is framed as a single RLP list whose first item is the message code, followed by
//! the message fields flattened into the same list.

use std::fmt;

use primitive_types::{H256, U256};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use crate::{
    crypto::keccak256,
    error::{Error, Result},
};

/// A block as exchanged by the sync protocol.
///
/// Only the fields the synchroniser needs are structured: the rest of the header, the
/// transactions and the uncles travel opaquely in `body`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub parent_hash: H256,
    pub number: u64,
    pub difficulty: U256,
    pub body: Vec<u8>,
}

impl Block {
    /// The Keccak-256 hash of the block's RLP encoding.
    pub fn hash(&self) -> H256 {
        H256::from(keccak256(&rlp::encode(self)))
    }
}

impl Encodable for Block {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        s.append(&self.parent_hash);
        s.append(&self.number);
        s.append(&self.difficulty);
        s.append(&self.body);
    }
}

impl Decodable for Block {
    fn decode(rlp: &Rlp) -> std::result::Result<Self, DecoderError> {
        if rlp.item_count()? != 4 {
            return Err(DecoderError::RlpIncorrectListLen);
        }

        Ok(Self {
            parent_hash: rlp.val_at(0)?,
            number: rlp.val_at(1)?,
            difficulty: rlp.val_at(2)?,
            body: rlp.val_at(3)?,
        })
    }
}

/// The handshake message, sent first by both sides of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub protocol_version: u8,
    pub network_id: u64,
    pub total_difficulty: U256,
    pub best_hash: H256,
    pub genesis_hash: H256,
}

/// Eth sub-protocol message variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EthMessage {
    Status(Status),
    /// Announces new block hashes, newest first.
    NewBlockHashes(Vec<H256>),
    /// Requests up to `max_blocks` ancestor hashes of `hash`, child to parent.
    GetBlockHashes { hash: H256, max_blocks: u64 },
    BlockHashes(Vec<H256>),
    GetBlocks(Vec<H256>),
    Blocks(Vec<Block>),
    /// Propagates a freshly mined block with the total difficulty of its chain.
    NewBlock {
        block: Block,
        total_difficulty: U256,
    },
    /// Requests up to `max_blocks` hashes of the blocks from `number` onwards (eth/61).
    GetBlockHashesByNumber { number: u64, max_blocks: u64 },
}

impl EthMessage {
    pub fn variant_as_str(&self) -> &str {
        match self {
            EthMessage::Status(_) => "status",
            EthMessage::NewBlockHashes(_) => "new_block_hashes",
            EthMessage::GetBlockHashes { .. } => "get_block_hashes",
            EthMessage::BlockHashes(_) => "block_hashes",
            EthMessage::GetBlocks(_) => "get_blocks",
            EthMessage::Blocks(_) => "blocks",
            EthMessage::NewBlock { .. } => "new_block",
            EthMessage::GetBlockHashesByNumber { .. } => "get_block_hashes_by_number",
        }
    }

    /// The message code.
    pub fn code(&self) -> u8 {
        match self {
            EthMessage::Status(_) => 0x00,
            EthMessage::NewBlockHashes(_) => 0x01,
            EthMessage::GetBlockHashes { .. } => 0x03,
            EthMessage::BlockHashes(_) => 0x04,
            EthMessage::GetBlocks(_) => 0x05,
            EthMessage::Blocks(_) => 0x06,
            EthMessage::NewBlock { .. } => 0x07,
            EthMessage::GetBlockHashesByNumber { .. } => 0x08,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(self, EthMessage::BlockHashes(_) | EthMessage::Blocks(_))
    }

    /// Encodes the message into its RLP frame, without checking it against a capability.
    pub fn encode(&self) -> Vec<u8> {
        let mut s = RlpStream::new();

        match self {
            EthMessage::Status(status) => {
                s.begin_list(6);
                s.append(&self.code());
                s.append(&status.protocol_version);
                s.append(&status.network_id);
                s.append(&status.total_difficulty);
                s.append(&status.best_hash);
                s.append(&status.genesis_hash);
            }
            EthMessage::NewBlockHashes(hashes)
            | EthMessage::BlockHashes(hashes)
            | EthMessage::GetBlocks(hashes) => {
                s.begin_list(1 + hashes.len());
                s.append(&self.code());
                for hash in hashes {
                    s.append(hash);
                }
            }
            EthMessage::GetBlockHashes { hash, max_blocks } => {
                s.begin_list(3);
                s.append(&self.code());
                s.append(hash);
                s.append(max_blocks);
            }
            EthMessage::Blocks(blocks) => {
                s.begin_list(1 + blocks.len());
                s.append(&self.code());
                for block in blocks {
                    s.append(block);
                }
            }
            EthMessage::NewBlock {
                block,
                total_difficulty,
            } => {
                s.begin_list(3);
                s.append(&self.code());
                s.append(block);
                s.append(total_difficulty);
            }
            EthMessage::GetBlockHashesByNumber { number, max_blocks } => {
                s.begin_list(3);
                s.append(&self.code());
                s.append(number);
                s.append(max_blocks);
            }
        }

        s.out().to_vec()
    }
}

impl fmt::Display for EthMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EthMessage::NewBlockHashes(hashes)
            | EthMessage::BlockHashes(hashes)
            | EthMessage::GetBlocks(hashes) => {
                write!(f, "{} ({} hashes)", self.variant_as_str(), hashes.len())
            }
            EthMessage::Blocks(blocks) => {
                write!(f, "{} ({} blocks)", self.variant_as_str(), blocks.len())
            }
            EthMessage::GetBlockHashes { hash, max_blocks } => {
                write!(f, "{} ({:?}, max {})", self.variant_as_str(), hash, max_blocks)
            }
            _ => f.write_str(self.variant_as_str()),
        }
    }
}

type DecodeFn = fn(&Rlp) -> std::result::Result<EthMessage, DecoderError>;

fn decode_status(rlp: &Rlp) -> std::result::Result<EthMessage, DecoderError> {
    Ok(EthMessage::Status(Status {
        protocol_version: rlp.val_at(1)?,
        network_id: rlp.val_at(2)?,
        total_difficulty: rlp.val_at(3)?,
        best_hash: rlp.val_at(4)?,
        genesis_hash: rlp.val_at(5)?,
    }))
}

// The items following the code.
fn tail<T: Decodable>(rlp: &Rlp) -> std::result::Result<Vec<T>, DecoderError> {
    (1..rlp.item_count()?).map(|i| rlp.val_at(i)).collect()
}

fn decode_new_block_hashes(rlp: &Rlp) -> std::result::Result<EthMessage, DecoderError> {
    Ok(EthMessage::NewBlockHashes(tail(rlp)?))
}

fn decode_get_block_hashes(rlp: &Rlp) -> std::result::Result<EthMessage, DecoderError> {
    Ok(EthMessage::GetBlockHashes {
        hash: rlp.val_at(1)?,
        max_blocks: rlp.val_at(2)?,
    })
}

fn decode_block_hashes(rlp: &Rlp) -> std::result::Result<EthMessage, DecoderError> {
    Ok(EthMessage::BlockHashes(tail(rlp)?))
}

fn decode_get_blocks(rlp: &Rlp) -> std::result::Result<EthMessage, DecoderError> {
    Ok(EthMessage::GetBlocks(tail(rlp)?))
}

fn decode_blocks(rlp: &Rlp) -> std::result::Result<EthMessage, DecoderError> {
    Ok(EthMessage::Blocks(tail(rlp)?))
}

fn decode_new_block(rlp: &Rlp) -> std::result::Result<EthMessage, DecoderError> {
    Ok(EthMessage::NewBlock {
        block: rlp.val_at(1)?,
        total_difficulty: rlp.val_at(2)?,
    })
}

fn decode_get_block_hashes_by_number(rlp: &Rlp) -> std::result::Result<EthMessage, DecoderError> {
    Ok(EthMessage::GetBlockHashesByNumber {
        number: rlp.val_at(1)?,
        max_blocks: rlp.val_at(2)?,
    })
}

const ETH60_DECODERS: &[(u8, DecodeFn)] = &[
    (0x00, decode_status),
    (0x01, decode_new_block_hashes),
    (0x03, decode_get_block_hashes),
    (0x04, decode_block_hashes),
    (0x05, decode_get_blocks),
    (0x06, decode_blocks),
    (0x07, decode_new_block),
];

const ETH61_DECODERS: &[(u8, DecodeFn)] = &[
    (0x00, decode_status),
    (0x01, decode_new_block_hashes),
    (0x03, decode_get_block_hashes),
    (0x04, decode_block_hashes),
    (0x05, decode_get_blocks),
    (0x06, decode_blocks),
    (0x07, decode_new_block),
    (0x08, decode_get_block_hashes_by_number),
];

/// The message set of a protocol version, selected when a session is negotiated.
#[derive(Clone, Copy)]
pub struct Capability {
    version: u8,
    decoders: &'static [(u8, DecodeFn)],
}

impl Capability {
    pub const ETH60: Capability = Capability {
        version: 60,
        decoders: ETH60_DECODERS,
    };

    pub const ETH61: Capability = Capability {
        version: 61,
        decoders: ETH61_DECODERS,
    };

    /// Returns the capability of a protocol version.
    pub fn for_version(version: u8) -> Result<Self> {
        match version {
            60 => Ok(Self::ETH60),
            61 => Ok(Self::ETH61),
            other => Err(Error::UnsupportedVersion(other)),
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns `true` if the message code is part of this version.
    pub fn supports(&self, code: u8) -> bool {
        self.decoders.iter().any(|(c, _)| *c == code)
    }

    /// Decodes a frame, rejecting codes this version doesn't define.
    pub fn decode(&self, bytes: &[u8]) -> Result<EthMessage> {
        let rlp = Rlp::new(bytes);
        let code: u8 = rlp.val_at(0)?;

        let decode = self
            .decoders
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, decode)| *decode)
            .ok_or(Error::Unsupported {
                version: self.version,
                code,
            })?;

        Ok(decode(&rlp)?)
    }

    /// Encodes a message, rejecting messages this version doesn't define.
    pub fn encode(&self, message: &EthMessage) -> Result<Vec<u8>> {
        let code = message.code();
        if !self.supports(code) {
            return Err(Error::Unsupported {
                version: self.version,
                code,
            });
        }

        Ok(message.encode())
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "eth/{}", self.version)
    }
}

impl PartialEq for Capability {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
    }
}

impl Eq for Capability {}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64) -> Block {
        Block {
            parent_hash: H256::repeat_byte(number as u8),
            number,
            difficulty: U256::from(1000 + number),
            body: vec![0xde, 0xad],
        }
    }

    #[test]
    fn frame_layout() {
        let message = EthMessage::GetBlockHashes {
            hash: H256::repeat_byte(1),
            max_blocks: 5,
        };
        let bytes = message.encode();

        let rlp = Rlp::new(&bytes);
        assert!(rlp.is_list());
        assert_eq!(rlp.item_count().unwrap(), 3);
        assert_eq!(rlp.val_at::<u8>(0).unwrap(), 0x03);
        assert_eq!(rlp.val_at::<u64>(2).unwrap(), 5);
    }

    #[test]
    fn decode_every_message() {
        let messages = vec![
            EthMessage::Status(Status {
                protocol_version: 61,
                network_id: 1,
                total_difficulty: U256::from(131072),
                best_hash: H256::repeat_byte(2),
                genesis_hash: H256::repeat_byte(3),
            }),
            EthMessage::NewBlockHashes(vec![H256::repeat_byte(4)]),
            EthMessage::GetBlockHashes {
                hash: H256::repeat_byte(5),
                max_blocks: 256,
            },
            EthMessage::BlockHashes(vec![]),
            EthMessage::GetBlocks(vec![H256::repeat_byte(6), H256::repeat_byte(7)]),
            EthMessage::Blocks(vec![block(1), block(2)]),
            EthMessage::NewBlock {
                block: block(3),
                total_difficulty: U256::from(9),
            },
            EthMessage::GetBlockHashesByNumber {
                number: 10,
                max_blocks: 20,
            },
        ];

        for message in messages {
            let bytes = Capability::ETH61.encode(&message).unwrap();
            assert_eq!(Capability::ETH61.decode(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn version_gates_codes() {
        let message = EthMessage::GetBlockHashesByNumber {
            number: 0,
            max_blocks: 1,
        };

        assert!(matches!(
            Capability::ETH60.encode(&message),
            Err(Error::Unsupported {
                version: 60,
                code: 0x08
            })
        ));
        assert!(matches!(
            Capability::ETH60.decode(&message.encode()),
            Err(Error::Unsupported {
                version: 60,
                code: 0x08
            })
        ));
        assert!(Capability::ETH60.supports(0x07));
        assert!(!Capability::ETH60.supports(0x02));
    }

    #[test]
    fn unsupported_version() {
        assert!(matches!(
            Capability::for_version(62),
            Err(Error::UnsupportedVersion(62))
        ));
        assert_eq!(Capability::for_version(60).unwrap(), Capability::ETH60);
    }

    #[test]
    fn malformed_frame() {
        assert!(matches!(
            Capability::ETH60.decode(&[0xc5, 0x01]),
            Err(Error::Rlp(_))
        ));
        assert!(Capability::ETH60.decode(&[]).is_err());
    }

    #[test]
    fn block_hash_covers_contents() {
        let a = block(1);
        let mut b = a.clone();
        b.body.push(0);

        assert_eq!(a.hash(), block(1).hash());
        assert_ne!(a.hash(), b.hash());
    }
}
