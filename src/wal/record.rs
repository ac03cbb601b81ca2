//! Shared catalog WAL records
//!
//! Each committed transaction occupies one frame:
//!
//! ```text
//! [header_len u32 LE][body_len u32 LE][crc32 u32 LE][header JSON][body]
//! ```
//!
//! The checksum covers header and body. The body is the transaction's
//! isolated WAL: one JSON-encoded `Mutation` per line.

use std::io::{self, Read, Write};

use chrono::{DateTime, Utc};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::Mutation;

/// Fixed prefix: header length, body length, checksum
pub const FRAME_PREFIX_SIZE: usize = 12;

/// Leading record of every transaction in the shared WAL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionHeader {
    pub transaction_id: Uuid,
    pub catalog_version: u64,
    pub catalog_schema_version: u64,
    /// Number of mutations in the body
    pub mutation_count: u64,
    /// Size of the body in bytes
    pub wal_size_bytes: u64,
    pub commit_timestamp: DateTime<Utc>,
}

/// One transaction read back from the shared WAL
#[derive(Debug, Clone, PartialEq)]
pub struct WalTransaction {
    pub header: TransactionHeader,
    pub body: Vec<u8>,
}

impl WalTransaction {
    /// Decode the body into its mutations.
    ///
    /// The number of decoded mutations must equal the header's mutation count.
    pub fn mutations(&self) -> io::Result<Vec<Mutation>> {
        let mutations = decode_mutations(&self.body)?;
        if mutations.len() as u64 != self.header.mutation_count {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Transaction {} declares {} mutations, body holds {}",
                    self.header.catalog_version,
                    self.header.mutation_count,
                    mutations.len()
                ),
            ));
        }
        Ok(mutations)
    }

    /// Size of this transaction's frame on disk
    pub fn frame_size(&self) -> u64 {
        frame_size(&self.header, &self.body)
    }
}

/// Decode newline-delimited JSON mutations.
pub fn decode_mutations(body: &[u8]) -> io::Result<Vec<Mutation>> {
    body.split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_slice::<Mutation>(line).map_err(io::Error::from))
        .collect()
}

fn checksum(header: &[u8], body: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(header);
    hasher.update(body);
    hasher.finalize()
}

fn frame_size(header: &TransactionHeader, body: &[u8]) -> u64 {
    let header_len = serde_json::to_vec(header).map(|h| h.len()).unwrap_or(0);
    (FRAME_PREFIX_SIZE + header_len + body.len()) as u64
}

/// Encode one transaction frame.
pub fn encode_frame(header: &TransactionHeader, body: &[u8]) -> io::Result<Vec<u8>> {
    let header_bytes = serde_json::to_vec(header)?;
    let header_len = u32::try_from(header_bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Header too large"))?;
    let body_len = u32::try_from(body.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Transaction body too large"))?;

    let mut frame = Vec::with_capacity(FRAME_PREFIX_SIZE + header_bytes.len() + body.len());
    frame.extend_from_slice(&header_len.to_le_bytes());
    frame.extend_from_slice(&body_len.to_le_bytes());
    frame.extend_from_slice(&checksum(&header_bytes, body).to_le_bytes());
    frame.extend_from_slice(&header_bytes);
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Write one frame and return its size.
pub fn write_frame<W: Write>(
    writer: &mut W,
    header: &TransactionHeader,
    body: &[u8],
) -> io::Result<u64> {
    let frame = encode_frame(header, body)?;
    writer.write_all(&frame)?;
    Ok(frame.len() as u64)
}

fn read_section<R: Read>(reader: &mut R, len: usize) -> io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    reader.by_ref().take(len as u64).read_to_end(&mut bytes)?;
    if bytes.len() != len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Truncated frame: {} of {} bytes", bytes.len(), len),
        ));
    }
    Ok(bytes)
}

/// Read the next frame.
///
/// Returns `Ok(None)` at a clean end of stream. A stream ending inside a
/// frame, a checksum mismatch or an undecodable header is `InvalidData`.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<(WalTransaction, u64)>> {
    let mut prefix = [0u8; FRAME_PREFIX_SIZE];
    let mut filled = 0;
    while filled < FRAME_PREFIX_SIZE {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Truncated frame prefix: {} of {} bytes", filled, FRAME_PREFIX_SIZE),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let header_len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    let body_len = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]) as usize;
    let expected = u32::from_le_bytes([prefix[8], prefix[9], prefix[10], prefix[11]]);

    if header_len == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "Empty transaction header"));
    }

    // Lengths come from disk; read through `take` instead of preallocating.
    let header_bytes = read_section(reader, header_len)?;
    let body = read_section(reader, body_len)?;

    let actual = checksum(&header_bytes, &body);
    if actual != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Checksum mismatch: expected {:08x}, computed {:08x}", expected, actual),
        ));
    }

    let header: TransactionHeader = serde_json::from_slice(&header_bytes).map_err(|e| {
        io::Error::new(io::ErrorKind::InvalidData, format!("Invalid header: {}", e))
    })?;

    if header.wal_size_bytes != body_len as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Header declares {} body bytes, frame holds {}",
                header.wal_size_bytes, body_len
            ),
        ));
    }

    let size = (FRAME_PREFIX_SIZE + header_len + body_len) as u64;
    Ok(Some((WalTransaction { header, body }, size)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::AttributeChange;
    use std::io::Cursor;

    fn body_of(mutations: &[Mutation]) -> Vec<u8> {
        let mut body = Vec::new();
        for mutation in mutations {
            serde_json::to_writer(&mut body, mutation).unwrap();
            body.push(b'\n');
        }
        body
    }

    fn header_for(version: u64, body: &[u8], mutation_count: u64) -> TransactionHeader {
        TransactionHeader {
            transaction_id: Uuid::new_v4(),
            catalog_version: version,
            catalog_schema_version: 1,
            mutation_count,
            wal_size_bytes: body.len() as u64,
            commit_timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_frame_reads_back() {
        let mutations = vec![
            Mutation::create_collection("product"),
            Mutation::upsert("product", "1", vec![AttributeChange::set("name", "chair")]),
        ];
        let body = body_of(&mutations);
        let header = header_for(7, &body, 2);

        let mut buffer = Vec::new();
        let written = write_frame(&mut buffer, &header, &body).unwrap();
        assert_eq!(written, buffer.len() as u64);

        let (txn, size) = read_frame(&mut Cursor::new(&buffer)).unwrap().unwrap();
        assert_eq!(size, written);
        assert_eq!(txn.header, header);
        assert_eq!(txn.frame_size(), written);
        assert_eq!(txn.mutations().unwrap(), mutations);
    }

    #[test]
    fn test_clean_end_of_stream() {
        let mut empty = Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut empty).unwrap().is_none());
    }

    #[test]
    fn test_consecutive_frames() {
        let mut buffer = Vec::new();
        for version in 1..=3 {
            let body = body_of(&[Mutation::remove("product", version.to_string())]);
            write_frame(&mut buffer, &header_for(version, &body, 1), &body).unwrap();
        }

        let mut cursor = Cursor::new(&buffer);
        let mut versions = Vec::new();
        while let Some((txn, _)) = read_frame(&mut cursor).unwrap() {
            versions.push(txn.header.catalog_version);
        }
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[test]
    fn test_flipped_byte_is_detected() {
        let body = body_of(&[Mutation::create_collection("brand")]);
        let mut buffer = encode_frame(&header_for(1, &body, 1), &body).unwrap();
        let last = buffer.len() - 2;
        buffer[last] ^= 0xFF;

        let err = read_frame(&mut Cursor::new(&buffer)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("Checksum mismatch"));
    }

    #[test]
    fn test_truncated_frame_is_detected() {
        let body = body_of(&[Mutation::create_collection("brand")]);
        let buffer = encode_frame(&header_for(1, &body, 1), &body).unwrap();

        let err = read_frame(&mut Cursor::new(&buffer[..buffer.len() - 3])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let err = read_frame(&mut Cursor::new(&buffer[..5])).unwrap_err();
        assert!(err.to_string().contains("Truncated frame prefix"));
    }

    #[test]
    fn test_mutation_count_must_match_body() {
        let body = body_of(&[Mutation::create_collection("brand")]);
        let txn = WalTransaction {
            header: header_for(1, &body, 3),
            body,
        };
        assert!(txn.mutations().is_err());
    }
}
