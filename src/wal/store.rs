//! Shared catalog WAL contract and the in-memory implementation

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use super::errors::{WalError, WalResult};
use super::record::{TransactionHeader, WalTransaction};

/// The shared, append-only WAL of one catalog.
///
/// Transactions are stored in catalog version order. `append` accepts only
/// the version directly following the last written one; an empty WAL accepts
/// any version.
pub trait CatalogWal: Send + Sync {
    /// Durably append one transaction and return the bytes written.
    ///
    /// # Errors
    ///
    /// - `AERO_WAL_VERSION_MISMATCH` if the header does not follow the last
    ///   written transaction; the error carries the actual last version
    /// - `AERO_WAL_APPEND_FAILED` / `AERO_WAL_FSYNC_FAILED` on IO failure
    fn append(&self, header: &TransactionHeader, body: &[u8]) -> WalResult<u64>;

    /// Read the transaction written at `version`, if present.
    fn read_transaction(&self, version: u64) -> WalResult<Option<WalTransaction>>;

    /// Oldest version still held
    fn first_written_version(&self) -> Option<u64>;

    /// Newest version held
    fn last_written_version(&self) -> Option<u64>;
}

/// Reject an append that does not directly follow `last_written`.
pub(crate) fn check_follows(last_written: Option<u64>, header: &TransactionHeader) -> WalResult<()> {
    match last_written {
        Some(last) if header.catalog_version != last + 1 => {
            Err(WalError::version_mismatch(header.catalog_version, last))
        }
        _ => Ok(()),
    }
}

/// WAL kept in memory; contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryCatalogWal {
    transactions: Mutex<BTreeMap<u64, WalTransaction>>,
}

impl MemoryCatalogWal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transactions held
    pub fn len(&self) -> usize {
        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CatalogWal for MemoryCatalogWal {
    fn append(&self, header: &TransactionHeader, body: &[u8]) -> WalResult<u64> {
        let mut transactions = self
            .transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        check_follows(transactions.keys().next_back().copied(), header)?;

        let transaction = WalTransaction {
            header: header.clone(),
            body: body.to_vec(),
        };
        let size = transaction.frame_size();
        transactions.insert(header.catalog_version, transaction);
        Ok(size)
    }

    fn read_transaction(&self, version: u64) -> WalResult<Option<WalTransaction>> {
        Ok(self
            .transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&version)
            .cloned())
    }

    fn first_written_version(&self) -> Option<u64> {
        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .next()
            .copied()
    }

    fn last_written_version(&self) -> Option<u64> {
        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .next_back()
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::errors::WalErrorCode;
    use chrono::Utc;
    use uuid::Uuid;

    fn header(version: u64) -> TransactionHeader {
        TransactionHeader {
            transaction_id: Uuid::new_v4(),
            catalog_version: version,
            catalog_schema_version: 0,
            mutation_count: 0,
            wal_size_bytes: 0,
            commit_timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_empty_wal_accepts_any_version() {
        let wal = MemoryCatalogWal::new();
        assert_eq!(wal.last_written_version(), None);

        wal.append(&header(42), b"").unwrap();
        assert_eq!(wal.first_written_version(), Some(42));
        assert_eq!(wal.last_written_version(), Some(42));
    }

    #[test]
    fn test_append_must_follow_last_written() {
        let wal = MemoryCatalogWal::new();
        wal.append(&header(1), b"").unwrap();
        wal.append(&header(2), b"").unwrap();

        let gap = wal.append(&header(4), b"").unwrap_err();
        assert_eq!(gap.code(), WalErrorCode::AeroWalVersionMismatch);
        assert_eq!(gap.mismatch_version(), Some(2));

        let replay = wal.append(&header(2), b"").unwrap_err();
        assert_eq!(replay.mismatch_version(), Some(2));
        assert_eq!(wal.len(), 2);
    }

    #[test]
    fn test_read_transaction() {
        let wal = MemoryCatalogWal::new();
        let first = header(1);
        let size = wal.append(&first, b"payload").unwrap();
        assert!(size > 7);

        let read = wal.read_transaction(1).unwrap().unwrap();
        assert_eq!(read.header, first);
        assert_eq!(read.body, b"payload");
        assert!(wal.read_transaction(2).unwrap().is_none());
    }
}
