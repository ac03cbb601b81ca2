//! Write-ahead logging for catalog transactions
//!
//! Two layers:
//!
//! - `IsolatedWal`: the pending mutations of one open transaction
//! - `CatalogWal`: the shared, append-only log every committed transaction
//!   is copied into, in catalog version order
//!
//! # Invariants
//!
//! - A transaction is acknowledged as persisted only after fsync
//! - Versions in the shared WAL are contiguous; an append that does not
//!   follow the last written version is refused
//! - Every frame carries a CRC32 checksum; any damage halts the open

mod errors;
mod file;
mod isolated;
mod record;
mod store;

pub use errors::{Severity, WalError, WalErrorCode, WalResult};
pub use file::{list_wal_files, wal_file_name, FileCatalogWal};
pub use isolated::IsolatedWal;
pub use record::{
    decode_mutations, encode_frame, read_frame, write_frame, TransactionHeader, WalTransaction,
    FRAME_PREFIX_SIZE,
};
pub use store::{CatalogWal, MemoryCatalogWal};
