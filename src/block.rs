//! Block record codec for the per-user metadata chain
//!
//! Blocks are produced and stored by the blockchain collaborator, but their
//! encoding is defined here because block bytes participate in gossip and
//! search hashing. Header is 115 bytes; the signature covers everything
//! after itself, and the signer is recovered rather than stored.
//!
//! ```text
//! Offset  Size  Field
//! 0       65    Recoverable signature
//! 65      32    Previous block hash
//! 97      8     Blockchain version
//! 105     4     Block number
//! 109     4     Block size
//! 113     2     Record count
//! 115     ?     Records: type u8, length u32, data
//! ```

use crate::crypto::{self, CryptoError, Identity, SIGNATURE_SIZE};
use crate::types::Hash;
use secp256k1::PublicKey;
use thiserror::Error;

/// Fixed header size.
pub const BLOCK_HEADER_SIZE: usize = SIGNATURE_SIZE + 32 + 8 + 4 + 4 + 2;

const RECORD_TYPE_USERNAME: u8 = 0;
const RECORD_TYPE_DIRECTORY: u8 = 1;
const RECORD_TYPE_FILE: u8 = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("block truncated")]
    TooShort,
    #[error("bad length field")]
    BadLengthField,
    #[error("invalid utf-8")]
    BadUtf8,
    #[error("bad signature")]
    BadSignature,
}

impl From<CryptoError> for BlockError {
    fn from(_: CryptoError) -> Self {
        BlockError::BadSignature
    }
}

/// File metadata published in a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub content_hash: Hash,
    pub file_type: u8,
    pub format: u16,
    pub size: u64,
    pub directory_id: u16,
    pub name: String,
}

/// One record of a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockRecord {
    Username(String),
    Directory { id: u16, name: String },
    File(FileRecord),
    /// Unknown type carried through untouched for forward compatibility.
    Unknown { record_type: u8, data: Vec<u8> },
}

/// A block ready for encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub prev_hash: Hash,
    pub version: u64,
    pub number: u32,
    pub records: Vec<BlockRecord>,
}

/// A decoded block with its recovered signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBlock {
    pub signer: PublicKey,
    pub prev_hash: Hash,
    pub version: u64,
    pub number: u32,
    pub records: Vec<BlockRecord>,
}

fn encode_record(record: &BlockRecord, out: &mut Vec<u8>) {
    let (record_type, data) = match record {
        BlockRecord::Username(name) => (RECORD_TYPE_USERNAME, name.as_bytes().to_vec()),
        BlockRecord::Directory { id, name } => {
            let mut data = id.to_le_bytes().to_vec();
            data.extend_from_slice(name.as_bytes());
            (RECORD_TYPE_DIRECTORY, data)
        }
        BlockRecord::File(file) => {
            let name = file.name.as_bytes();
            let mut data = Vec::with_capacity(49 + name.len());
            data.extend_from_slice(&file.content_hash);
            data.push(file.file_type);
            data.extend_from_slice(&file.format.to_le_bytes());
            data.extend_from_slice(&file.size.to_le_bytes());
            data.extend_from_slice(&file.directory_id.to_le_bytes());
            data.extend_from_slice(&(name.len() as u16).to_le_bytes());
            // Reserved tag count; no tags are defined yet.
            data.extend_from_slice(&0u16.to_le_bytes());
            data.extend_from_slice(name);
            (RECORD_TYPE_FILE, data)
        }
        BlockRecord::Unknown { record_type, data } => (*record_type, data.clone()),
    };
    out.push(record_type);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&data);
}

fn decode_record(record_type: u8, data: &[u8]) -> Result<BlockRecord, BlockError> {
    let utf8 = |bytes: &[u8]| -> Result<String, BlockError> {
        std::str::from_utf8(bytes)
            .map(|s| s.to_string())
            .map_err(|_| BlockError::BadUtf8)
    };
    Ok(match record_type {
        RECORD_TYPE_USERNAME => BlockRecord::Username(utf8(data)?),
        RECORD_TYPE_DIRECTORY => {
            if data.len() < 2 {
                return Err(BlockError::TooShort);
            }
            BlockRecord::Directory {
                id: u16::from_le_bytes([data[0], data[1]]),
                name: utf8(&data[2..])?,
            }
        }
        RECORD_TYPE_FILE => {
            if data.len() < 49 {
                return Err(BlockError::TooShort);
            }
            let mut content_hash = [0u8; 32];
            content_hash.copy_from_slice(&data[..32]);
            let file_type = data[32];
            let format = u16::from_le_bytes([data[33], data[34]]);
            let size = u64::from_le_bytes([
                data[35], data[36], data[37], data[38], data[39], data[40], data[41], data[42],
            ]);
            let directory_id = u16::from_le_bytes([data[43], data[44]]);
            let name_len = u16::from_le_bytes([data[45], data[46]]) as usize;
            // Skip the reserved tag count at 47..49.
            if data.len() < 49 + name_len {
                return Err(BlockError::BadLengthField);
            }
            BlockRecord::File(FileRecord {
                content_hash,
                file_type,
                format,
                size,
                directory_id,
                name: utf8(&data[49..49 + name_len])?,
            })
        }
        other => BlockRecord::Unknown { record_type: other, data: data.to_vec() },
    })
}

impl Block {
    /// Serialize and sign the block.
    pub fn encode(&self, signer: &Identity) -> Vec<u8> {
        let mut records = Vec::new();
        for record in &self.records {
            encode_record(record, &mut records);
        }

        let block_size = (BLOCK_HEADER_SIZE + records.len()) as u32;
        let mut signed_span = Vec::with_capacity(block_size as usize - SIGNATURE_SIZE);
        signed_span.extend_from_slice(&self.prev_hash);
        signed_span.extend_from_slice(&self.version.to_le_bytes());
        signed_span.extend_from_slice(&self.number.to_le_bytes());
        signed_span.extend_from_slice(&block_size.to_le_bytes());
        signed_span.extend_from_slice(&(self.records.len() as u16).to_le_bytes());
        signed_span.extend_from_slice(&records);

        let signature = signer.sign_recoverable(&crypto::hash(&signed_span));
        let mut out = Vec::with_capacity(block_size as usize);
        out.extend_from_slice(&signature);
        out.extend_from_slice(&signed_span);
        out
    }
}

impl DecodedBlock {
    pub fn decode(bytes: &[u8]) -> Result<Self, BlockError> {
        if bytes.len() < BLOCK_HEADER_SIZE {
            return Err(BlockError::TooShort);
        }
        let signed_span = &bytes[SIGNATURE_SIZE..];
        let signer = crypto::verify_recover(&crypto::hash(signed_span), &bytes[..SIGNATURE_SIZE])?;

        let mut prev_hash = [0u8; 32];
        prev_hash.copy_from_slice(&signed_span[..32]);
        let version = u64::from_le_bytes([
            signed_span[32], signed_span[33], signed_span[34], signed_span[35],
            signed_span[36], signed_span[37], signed_span[38], signed_span[39],
        ]);
        let number = u32::from_le_bytes([
            signed_span[40], signed_span[41], signed_span[42], signed_span[43],
        ]);
        let block_size = u32::from_le_bytes([
            signed_span[44], signed_span[45], signed_span[46], signed_span[47],
        ]) as usize;
        let record_count = u16::from_le_bytes([signed_span[48], signed_span[49]]) as usize;

        if block_size != bytes.len() {
            return Err(BlockError::BadLengthField);
        }

        let mut records = Vec::with_capacity(record_count);
        let mut rest = &signed_span[50..];
        for _ in 0..record_count {
            if rest.len() < 5 {
                return Err(BlockError::TooShort);
            }
            let record_type = rest[0];
            let len = u32::from_le_bytes([rest[1], rest[2], rest[3], rest[4]]) as usize;
            if rest.len() < 5 + len {
                return Err(BlockError::BadLengthField);
            }
            records.push(decode_record(record_type, &rest[5..5 + len])?);
            rest = &rest[5 + len..];
        }

        Ok(Self { signer, prev_hash, version, number, records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        Block {
            prev_hash: crypto::hash(b"genesis"),
            version: 1,
            number: 4,
            records: vec![
                BlockRecord::Username("mallory".into()),
                BlockRecord::Directory { id: 1, name: "music".into() },
                BlockRecord::File(FileRecord {
                    content_hash: crypto::hash(b"song bytes"),
                    file_type: 2,
                    format: 14,
                    size: 3_400_221,
                    directory_id: 1,
                    name: "song.flac".into(),
                }),
            ],
        }
    }

    #[test]
    fn round_trip_recovers_signer_and_records() {
        let id = Identity::generate();
        let block = sample_block();
        let wire = block.encode(&id);

        let decoded = DecodedBlock::decode(&wire).unwrap();
        assert_eq!(decoded.signer, *id.public_key());
        assert_eq!(decoded.records, block.records);
        assert_eq!(decoded.number, 4);
        assert_eq!(decoded.prev_hash, block.prev_hash);
    }

    #[test]
    fn tampering_breaks_the_signature() {
        let id = Identity::generate();
        let mut wire = sample_block().encode(&id);
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        match DecodedBlock::decode(&wire) {
            Err(BlockError::BadSignature) => {}
            Ok(decoded) => assert_ne!(decoded.signer, *id.public_key()),
            Err(e) => panic!("unexpected: {e}"),
        }
    }

    #[test]
    fn truncated_block_rejected() {
        let id = Identity::generate();
        let wire = sample_block().encode(&id);
        assert_eq!(
            DecodedBlock::decode(&wire[..BLOCK_HEADER_SIZE - 1]).unwrap_err(),
            BlockError::TooShort
        );
        // Cutting records off invalidates the stated block size.
        assert!(DecodedBlock::decode(&wire[..wire.len() - 3]).is_err());
    }

    #[test]
    fn unknown_record_types_survive() {
        let id = Identity::generate();
        let block = Block {
            prev_hash: [0u8; 32],
            version: 1,
            number: 0,
            records: vec![BlockRecord::Unknown { record_type: 77, data: vec![1, 2, 3] }],
        };
        let decoded = DecodedBlock::decode(&block.encode(&id)).unwrap();
        assert_eq!(decoded.records, block.records);
    }

    #[test]
    fn empty_block_is_valid() {
        let id = Identity::generate();
        let block = Block { prev_hash: [0u8; 32], version: 1, number: 0, records: vec![] };
        let decoded = DecodedBlock::decode(&block.encode(&id)).unwrap();
        assert!(decoded.records.is_empty());
    }
}
