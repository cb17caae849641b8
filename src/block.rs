//! Blocks and the per-peer-pair chain they append to.
//!
//! Every message relayed between two peers travels as a [`Block`]: an opaque
//! payload chained by index and previous-hash inside a private, per-pair
//! ledger.  A genesis block (`index == 0`) announces a new peer and is
//! accepted unconditionally; every later block must extend the chain it
//! belongs to and satisfy the proof-of-work difficulty the sender declared.
//!
//! Blocks serialize to CBOR for the wire.  The envelope signature is carried
//! separately by the packager and attached after parsing, so it never enters
//! the block's serialized form or its hash.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const HASH_SIZE: usize = 32;

/// Difficulty used for relay-internal chains (leading zero bits of the
/// block hash).  Low on purpose: the chain guards ordering, not consensus.
pub const DEFAULT_DIFFICULTY: u32 = 8;

#[derive(Debug)]
pub enum BlockError {
    Encode(ciborium::ser::Error<std::io::Error>),
    Decode(ciborium::de::Error<std::io::Error>),
    BadIndex { expected: u64, actual: u64 },
    BadPreviousHash { index: u64 },
    DifficultyNotMet { index: u64, difficulty: u32 },
    EmptyChain,
}

impl std::fmt::Display for BlockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockError::Encode(e) => write!(f, "block encode error: {e}"),
            BlockError::Decode(e) => write!(f, "block decode error: {e}"),
            BlockError::BadIndex { expected, actual } => {
                write!(f, "bad block index: expected {expected}, got {actual}")
            }
            BlockError::BadPreviousHash { index } => {
                write!(f, "block {index} does not reference the previous hash")
            }
            BlockError::DifficultyNotMet { index, difficulty } => {
                write!(f, "block {index} does not meet difficulty {difficulty}")
            }
            BlockError::EmptyChain => write!(f, "operation requires a non-empty chain"),
        }
    }
}

impl std::error::Error for BlockError {}

impl From<ciborium::ser::Error<std::io::Error>> for BlockError {
    fn from(error: ciborium::ser::Error<std::io::Error>) -> Self {
        BlockError::Encode(error)
    }
}

impl From<ciborium::de::Error<std::io::Error>> for BlockError {
    fn from(error: ciborium::de::Error<std::io::Error>) -> Self {
        BlockError::Decode(error)
    }
}

/// One unit of a per-pair ledger.  `signature` is attached from the wire
/// envelope after parsing and is excluded from serialization and hashing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Block {
    pub index: u64,
    #[serde(with = "serde_bytes")]
    pub previous_hash: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub difficulty: u32,
    pub nonce: u64,
    pub timestamp: u64,
    #[serde(skip)]
    pub signature: Option<Vec<u8>>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Block {
    /// Build an unmined genesis block carrying `data`.
    pub fn genesis(data: Vec<u8>, difficulty: u32) -> Self {
        Block {
            index: 0,
            previous_hash: vec![0u8; HASH_SIZE],
            data,
            difficulty,
            nonce: 0,
            timestamp: now_secs(),
            signature: None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BlockError> {
        let mut out = Vec::new();
        ciborium::into_writer(self, &mut out)?;
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlockError> {
        Ok(ciborium::from_reader(bytes)?)
    }

    /// SHA-256 over the serialized block (signature excluded by `skip`).
    pub fn hash(&self) -> Result<Vec<u8>, BlockError> {
        let bytes = self.to_bytes()?;
        Ok(Sha256::digest(&bytes).to_vec())
    }

    /// Whether `hash` starts with at least `difficulty` zero bits.
    pub fn hash_meets_difficulty(hash: &[u8], difficulty: u32) -> bool {
        let mut remaining = difficulty;
        for byte in hash {
            if remaining == 0 {
                return true;
            }
            if remaining >= 8 {
                if *byte != 0 {
                    return false;
                }
                remaining -= 8;
            } else {
                return byte.leading_zeros() >= remaining;
            }
        }
        remaining == 0
    }

    /// Search a nonce that satisfies this block's declared difficulty.
    pub fn mine(&mut self) -> Result<(), BlockError> {
        loop {
            let hash = self.hash()?;
            if Self::hash_meets_difficulty(&hash, self.difficulty) {
                return Ok(());
            }
            self.nonce = self.nonce.wrapping_add(1);
        }
    }
}

/// Append-only ledger for one peer pair.
///
/// The chain's `difficulty` is adopted from the sender's declared block
/// difficulty by the relay before insertion; genesis blocks reset it.
#[derive(Debug, Clone)]
pub struct Chain {
    blocks: Vec<Block>,
    pub difficulty: u32,
    pub version: u32,
}

pub const CHAIN_VERSION: u32 = 1;

impl Chain {
    pub fn new() -> Self {
        Chain {
            blocks: Vec::new(),
            difficulty: DEFAULT_DIFFICULTY,
            version: CHAIN_VERSION,
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn last(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn genesis_block(&self) -> Option<&Block> {
        self.blocks.first()
    }

    /// Template the next block of this chain, unmined.
    pub fn template_next_block(&self, difficulty: u32, data: Vec<u8>) -> Result<Block, BlockError> {
        let last = self.blocks.last().ok_or(BlockError::EmptyChain)?;
        Ok(Block {
            index: last.index + 1,
            previous_hash: last.hash()?,
            data,
            difficulty,
            nonce: 0,
            timestamp: now_secs(),
            signature: None,
        })
    }

    /// Adopt a first observed block without validation, joining a peer
    /// pair's ledger mid-stream.  Later blocks chain off it normally.
    pub fn seed(&mut self, block: Block) {
        self.difficulty = block.difficulty;
        self.blocks.clear();
        self.blocks.push(block);
    }

    /// Insert a block, enforcing the chain rules.
    ///
    /// A genesis block is accepted unconditionally as a new-peer
    /// announcement and resets the chain.  Every later block must carry the
    /// next index, reference the previous block's hash, and meet the chain's
    /// current difficulty.
    pub fn insert(&mut self, block: Block) -> Result<(), BlockError> {
        if block.index == 0 {
            self.difficulty = block.difficulty;
            self.blocks.clear();
            self.blocks.push(block);
            return Ok(());
        }

        let last = self.blocks.last().ok_or(BlockError::EmptyChain)?;
        let expected = last.index + 1;
        if block.index != expected {
            return Err(BlockError::BadIndex {
                expected,
                actual: block.index,
            });
        }
        if block.previous_hash != last.hash()? {
            return Err(BlockError::BadPreviousHash { index: block.index });
        }
        let hash = block.hash()?;
        if !Block::hash_meets_difficulty(&hash, self.difficulty) {
            return Err(BlockError::DifficultyNotMet {
                index: block.index,
                difficulty: self.difficulty,
            });
        }
        self.blocks.push(block);
        Ok(())
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}
