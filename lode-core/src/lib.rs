//! Data model and wire format for the lode chain: headers, transactions,
//! blocks, the block-hash index, and the hash commitments they rely on.

use std::collections::HashMap;

use bytes::Buf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// 32-byte SHA-256 digest.
pub type Hash = [u8; 32];
/// Account identifier, derived externally from a verifying key.
pub type Address = Hash;
/// Header nonce: a 256-bit big-endian unsigned integer.
pub type Nonce = [u8; 32];

pub const HASH_SIZE: usize = 32;

/// Current header version.
pub const VERSION: u8 = 2;

/// 1 version + 32 previous hash + 32 merkle root + 4 timestamp + 32 nonce.
pub const HEADER_SIZE: usize = 101;

/// Sentinel sender address marking reward transactions.
pub const REWARD_SENDER: Address = [0u8; 32];

pub fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

pub fn sha256d(data: &[u8]) -> Hash {
    sha256(&sha256(data))
}

pub fn nonce_from_u64(value: u64) -> Nonce {
    let mut nonce = [0u8; HASH_SIZE];
    nonce[HASH_SIZE - 8..].copy_from_slice(&value.to_be_bytes());
    nonce
}

/// Adds one to a big-endian nonce, wrapping at 2^256.
pub fn nonce_succ(nonce: &Nonce) -> Nonce {
    let mut next = *nonce;
    for byte in next.iter_mut().rev() {
        let (sum, carry) = byte.overflowing_add(1);
        *byte = sum;
        if !carry {
            break;
        }
    }
    next
}

/// Message a transfer signature commits to: reference hash then receiver.
pub fn transfer_message(reference_hash: &Hash, receiver: &Address) -> [u8; 2 * HASH_SIZE] {
    let mut message = [0u8; 2 * HASH_SIZE];
    message[..HASH_SIZE].copy_from_slice(reference_hash);
    message[HASH_SIZE..].copy_from_slice(receiver);
    message
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("header must be 101 bytes, got {0}")]
    HeaderSize(usize),
    #[error("block declares {declared} bytes but carries {actual}")]
    BlockSizeMismatch { declared: usize, actual: usize },
    #[error("block size {0} too small for a header")]
    BlockTooSmall(usize),
    #[error("block size {size} exceeds the {remaining} bytes left in the stream")]
    BlockOverrun { size: usize, remaining: usize },
    #[error("{0} bytes left over after decoding")]
    TrailingBytes(usize),
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, CodecError> {
    if !buf.has_remaining() {
        return Err(CodecError::UnexpectedEnd);
    }
    Ok(buf.get_u8())
}

fn take_hash(buf: &mut &[u8]) -> Result<Hash, CodecError> {
    if buf.remaining() < HASH_SIZE {
        return Err(CodecError::UnexpectedEnd);
    }
    let mut hash = [0u8; HASH_SIZE];
    buf.copy_to_slice(&mut hash);
    Ok(hash)
}

/// Block header. All integers are big-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: u8,
    pub previous_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub nonce: Nonce,
}

impl Header {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE);
        out.push(self.version);
        out.extend_from_slice(&self.previous_hash);
        out.extend_from_slice(&self.merkle_root);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.nonce);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() != HEADER_SIZE {
            return Err(CodecError::HeaderSize(bytes.len()));
        }
        let mut buf = bytes;
        let version = buf.get_u8();
        let mut previous_hash = [0u8; HASH_SIZE];
        buf.copy_to_slice(&mut previous_hash);
        let mut merkle_root = [0u8; HASH_SIZE];
        buf.copy_to_slice(&mut merkle_root);
        let timestamp = buf.get_u32();
        let mut nonce = [0u8; HASH_SIZE];
        buf.copy_to_slice(&mut nonce);
        Ok(Self {
            version,
            previous_hash,
            merkle_root,
            timestamp,
            nonce,
        })
    }

    /// Block hash: double SHA-256 of the encoded header.
    pub fn hash(&self) -> Hash {
        sha256d(&self.encode())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    Reward,
    Transfer,
}

/// A single-input, single-output transaction. Rewards carry the sentinel
/// sender and mint an output without consuming one; transfers consume the
/// sender's `reference_hash` and are signature-protected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub reference_hash: Hash,
    pub sender: Address,
    pub receiver: Address,
    pub signature: Vec<u8>,
}

impl Transaction {
    pub fn kind(&self) -> TxKind {
        if self.sender == REWARD_SENDER {
            TxKind::Reward
        } else {
            TxKind::Transfer
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        assert!(
            self.signature.len() <= u8::MAX as usize,
            "signature length {} exceeds the u8 wire prefix",
            self.signature.len()
        );
        let mut out = Vec::with_capacity(3 * HASH_SIZE + 1 + self.signature.len());
        out.extend_from_slice(&self.reference_hash);
        out.extend_from_slice(&self.sender);
        out.extend_from_slice(&self.receiver);
        out.push(self.signature.len() as u8);
        out.extend_from_slice(&self.signature);
        out
    }

    fn decode_from(buf: &mut &[u8]) -> Result<Self, CodecError> {
        let reference_hash = take_hash(buf)?;
        let sender = take_hash(buf)?;
        let receiver = take_hash(buf)?;
        let signature_len = take_u8(buf)? as usize;
        if buf.remaining() < signature_len {
            return Err(CodecError::UnexpectedEnd);
        }
        let mut signature = vec![0u8; signature_len];
        buf.copy_to_slice(&mut signature);
        Ok(Self {
            reference_hash,
            sender,
            receiver,
            signature,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut buf = bytes;
        let transaction = Self::decode_from(&mut buf)?;
        if buf.has_remaining() {
            return Err(CodecError::TrailingBytes(buf.remaining()));
        }
        Ok(transaction)
    }

    /// Output reference: a single SHA-256 of the encoded transaction. Blocks
    /// are hashed twice, transaction outputs once.
    pub fn reference(&self) -> Hash {
        sha256(&self.encode())
    }
}

/// Splits a concatenated stream of exactly `count` encoded transactions.
pub fn decode_transactions(count: usize, bytes: &[u8]) -> Result<Vec<Transaction>, CodecError> {
    let mut buf = bytes;
    let mut transactions = Vec::with_capacity(count);
    for _ in 0..count {
        transactions.push(Transaction::decode_from(&mut buf)?);
    }
    if buf.has_remaining() {
        return Err(CodecError::TrailingBytes(buf.remaining()));
    }
    Ok(transactions)
}

/// Builds the reward paying `receiver`. The reference hash follows the
/// protocol's reward convention: a single SHA-256 of the receiver address,
/// so rewards to the same receiver are byte-identical.
pub fn init_reward(receiver: Address) -> Transaction {
    Transaction {
        reference_hash: sha256(&receiver),
        sender: REWARD_SENDER,
        receiver,
        signature: Vec::new(),
    }
}

/// Structural check that a transaction matches the reward convention.
pub fn validate_reward(transaction: &Transaction) -> bool {
    transaction.sender == REWARD_SENDER
        && transaction.reference_hash == sha256(&transaction.receiver)
        && transaction.signature.is_empty()
}

/// Root of the pairwise double-SHA-256 tree over ordered leaf hashes. An odd
/// level duplicates its last element. The empty list has no root.
pub fn merkle_root(hashes: &[Hash]) -> Option<Hash> {
    if hashes.is_empty() {
        return None;
    }
    let mut level = hashes.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let mut joined = [0u8; 2 * HASH_SIZE];
            joined[..HASH_SIZE].copy_from_slice(&pair[0]);
            joined[HASH_SIZE..].copy_from_slice(if pair.len() == 2 { &pair[1] } else { &pair[0] });
            next.push(sha256d(&joined));
        }
        level = next;
    }
    Some(level[0])
}

/// A block: header plus the ordered transactions the header's merkle root
/// commits to. The first transaction of a mined block is its reward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Wire layout: u16 block size (counting itself), header, u8 transaction
    /// count, concatenated transactions.
    pub fn encode(&self) -> Vec<u8> {
        assert!(
            self.transactions.len() <= u8::MAX as usize,
            "transaction count {} exceeds the u8 wire prefix",
            self.transactions.len()
        );
        let mut payload = Vec::new();
        for transaction in &self.transactions {
            payload.extend_from_slice(&transaction.encode());
        }
        let block_size = 2 + HEADER_SIZE + 1 + payload.len();
        assert!(
            block_size <= u16::MAX as usize,
            "block size {block_size} exceeds the u16 wire prefix"
        );
        let mut out = Vec::with_capacity(block_size);
        out.extend_from_slice(&(block_size as u16).to_be_bytes());
        out.extend_from_slice(&self.header.encode());
        out.push(self.transactions.len() as u8);
        out.extend_from_slice(&payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut buf = bytes;
        if buf.remaining() < 2 {
            return Err(CodecError::UnexpectedEnd);
        }
        let declared = buf.get_u16() as usize;
        if declared != bytes.len() {
            return Err(CodecError::BlockSizeMismatch {
                declared,
                actual: bytes.len(),
            });
        }
        if buf.remaining() < HEADER_SIZE + 1 {
            return Err(CodecError::BlockTooSmall(declared));
        }
        let header = Header::decode(&buf[..HEADER_SIZE])?;
        buf.advance(HEADER_SIZE);
        let count = take_u8(&mut buf)? as usize;
        let transactions = decode_transactions(count, buf)?;
        Ok(Self {
            header,
            transactions,
        })
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }
}

/// Block hashes in height order plus a by-hash index of the blocks
/// themselves. The list gives O(1) height access and linear replay, the map
/// O(1) lookup; both are kept deliberately.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blockchain {
    pub chain: Vec<Hash>,
    pub blocks: HashMap<Hash, Block>,
}

impl Blockchain {
    pub fn new(genesis: Block) -> Self {
        let mut blockchain = Self::default();
        blockchain.push(genesis);
        blockchain
    }

    /// Appends a block and indexes it under its header hash.
    pub fn push(&mut self, block: Block) -> Hash {
        let block_hash = block.hash();
        self.chain.push(block_hash);
        self.blocks.insert(block_hash, block);
        block_hash
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn tip(&self) -> Option<&Hash> {
        self.chain.last()
    }

    pub fn block(&self, hash: &Hash) -> Option<&Block> {
        self.blocks.get(hash)
    }

    /// A one-block chain holding only this chain's genesis.
    pub fn genesis_only(&self) -> Option<Blockchain> {
        let genesis_hash = *self.chain.first()?;
        let genesis = self.blocks.get(&genesis_hash)?.clone();
        Some(Blockchain {
            chain: vec![genesis_hash],
            blocks: HashMap::from([(genesis_hash, genesis)]),
        })
    }

    /// Concatenation of every block's encoding, in height order.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for block_hash in &self.chain {
            let block = self.blocks.get(block_hash).expect("chain hash indexed");
            out.extend_from_slice(&block.encode());
        }
        out
    }

    /// Reads length-prefixed blocks until the buffer is consumed, rebuilding
    /// the height-ordered hash list along the way.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut blockchain = Blockchain::default();
        let mut rest = bytes;
        while rest.has_remaining() {
            if rest.remaining() < 2 {
                return Err(CodecError::UnexpectedEnd);
            }
            let size = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            if size < 2 + HEADER_SIZE + 1 {
                return Err(CodecError::BlockTooSmall(size));
            }
            if size > rest.remaining() {
                return Err(CodecError::BlockOverrun {
                    size,
                    remaining: rest.remaining(),
                });
            }
            let block = Block::decode(&rest[..size])?;
            blockchain.push(block);
            rest.advance(size);
        }
        Ok(blockchain)
    }
}
