//! File-backed shared catalog WAL
//!
//! - Append-only files `wal_NNNNNN.log` in one directory
//! - fsync after every append; acknowledgment before fsync is forbidden
//! - A new file is started when an append would push the current file past
//!   the configured maximum size (a single oversized transaction still gets
//!   a file of its own)
//! - The version index is rebuilt by scanning every file on open
//! - Any corruption found while scanning halts the open; no repair attempts
//! - A failed fsync is FATAL: the unsynced frame is cut off and every later
//!   append is refused until the WAL is reopened

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::errors::{WalError, WalResult};
use super::record::{encode_frame, read_frame, TransactionHeader, WalTransaction};
use super::store::{check_follows, CatalogWal};
use crate::observability::{log_event_with_fields, Event};

const FILE_PREFIX: &str = "wal_";
const FILE_SUFFIX: &str = ".log";

/// Where a transaction frame lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameLocation {
    file_index: u32,
    offset: u64,
    size: u64,
}

#[derive(Debug)]
struct AppendState {
    file: File,
    file_index: u32,
    file_size: u64,
    index: BTreeMap<u64, FrameLocation>,
    /// Set by a failed fsync; the on-disk state past the index is unknown
    failed: Option<String>,
}

/// Shared catalog WAL stored in a directory of segment files
#[derive(Debug)]
pub struct FileCatalogWal {
    dir: PathBuf,
    max_file_size: u64,
    state: Mutex<AppendState>,
    sync: fn(&File) -> io::Result<()>,
}

/// Name of the segment file with the given index.
pub fn wal_file_name(index: u32) -> String {
    format!("{}{:06}{}", FILE_PREFIX, index, FILE_SUFFIX)
}

fn parse_file_index(name: &str) -> Option<u32> {
    name.strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?
        .parse()
        .ok()
}

/// Segment files of a WAL directory, ordered by index.
pub fn list_wal_files(dir: &Path) -> WalResult<Vec<(u32, PathBuf)>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        WalError::corruption(format!("Failed to list WAL directory {}: {}", dir.display(), e))
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            WalError::corruption(format!("Failed to list WAL directory {}: {}", dir.display(), e))
        })?;
        let name = entry.file_name();
        if let Some(index) = name.to_str().and_then(parse_file_index) {
            files.push((index, entry.path()));
        }
    }
    files.sort_by_key(|(index, _)| *index);
    Ok(files)
}

fn fsync_dir(dir: &Path) -> WalResult<()> {
    let handle = File::open(dir).map_err(|e| {
        WalError::append_failed(
            format!("Failed to open WAL directory for fsync: {}", dir.display()),
            e,
        )
    })?;
    handle.sync_all().map_err(|e| {
        WalError::fsync_failed(format!("Failed to fsync WAL directory: {}", dir.display()), e)
    })
}

impl FileCatalogWal {
    /// Open the WAL in `dir`, creating the directory when missing.
    ///
    /// # Errors
    ///
    /// `AERO_WAL_CORRUPTION` if any segment holds a damaged frame or the
    /// versions are not contiguous across segments.
    pub fn open(dir: impl AsRef<Path>, max_file_size: u64) -> WalResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            WalError::append_failed(
                format!("Failed to create WAL directory: {}", dir.display()),
                e,
            )
        })?;

        let files = list_wal_files(&dir)?;
        let mut index = BTreeMap::new();
        let mut last_version: Option<u64> = None;
        let mut tail_size = 0;

        for (file_index, path) in &files {
            tail_size = Self::scan_file(*file_index, path, &mut index, &mut last_version)?;
        }

        let file_index = files.last().map(|(i, _)| *i).unwrap_or(1);
        let path = dir.join(wal_file_name(file_index));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                WalError::append_failed(format!("Failed to open WAL file: {}", path.display()), e)
            })?;
        if files.is_empty() {
            fsync_dir(&dir)?;
        }

        Ok(Self {
            dir,
            max_file_size,
            state: Mutex::new(AppendState {
                file,
                file_index,
                file_size: tail_size,
                index,
                failed: None,
            }),
            sync: File::sync_all,
        })
    }

    /// Index every frame of one segment; returns the segment's size.
    fn scan_file(
        file_index: u32,
        path: &Path,
        index: &mut BTreeMap<u64, FrameLocation>,
        last_version: &mut Option<u64>,
    ) -> WalResult<u64> {
        let file = File::open(path).map_err(|e| {
            WalError::corruption(format!("Failed to open WAL file {}: {}", path.display(), e))
        })?;
        let mut reader = BufReader::new(file);
        let mut offset = 0u64;

        loop {
            let frame = read_frame(&mut reader).map_err(|e| {
                WalError::corruption_at_offset(path.display(), offset, e.to_string())
            })?;
            let Some((transaction, size)) = frame else {
                break;
            };

            let version = transaction.header.catalog_version;
            if let Some(last) = *last_version {
                if version != last + 1 {
                    return Err(WalError::corruption_at_version(
                        version,
                        format!("Non-sequential catalog version: expected {}", last + 1),
                    ));
                }
            }

            index.insert(
                version,
                FrameLocation {
                    file_index,
                    offset,
                    size,
                },
            );
            *last_version = Some(version);
            offset += size;
        }

        Ok(offset)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Segment files currently on disk, ordered by index.
    pub fn files(&self) -> WalResult<Vec<PathBuf>> {
        Ok(list_wal_files(&self.dir)?
            .into_iter()
            .map(|(_, path)| path)
            .collect())
    }

    /// Record a failed fsync; every later append reports it.
    fn fail(state: &mut AppendState, message: String, source: io::Error) -> WalError {
        state.failed = Some(format!("{}: {}", message, source));
        WalError::fsync_failed(message, source)
    }

    fn rotate(&self, state: &mut AppendState) -> WalResult<()> {
        if let Err(e) = (self.sync)(&state.file) {
            return Err(Self::fail(state, "fsync failed before WAL rotation".to_string(), e));
        }

        let next_index = state.file_index + 1;
        let path = self.dir.join(wal_file_name(next_index));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                WalError::append_failed(format!("Failed to create WAL file: {}", path.display()), e)
            })?;
        fsync_dir(&self.dir)?;

        let previous = state.file_index.to_string();
        let next = next_index.to_string();
        log_event_with_fields(
            Event::WalRotated,
            &[("from_file", &previous), ("to_file", &next)],
        );

        state.file = file;
        state.file_index = next_index;
        state.file_size = 0;
        Ok(())
    }
}

impl CatalogWal for FileCatalogWal {
    fn append(&self, header: &TransactionHeader, body: &[u8]) -> WalResult<u64> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(reason) = &state.failed {
            return Err(WalError::fsync_failed(
                format!("WAL refuses appends after a failed fsync ({})", reason),
                io::Error::new(io::ErrorKind::Other, "WAL must be reopened"),
            ));
        }
        check_follows(state.index.keys().next_back().copied(), header)?;

        let version = header.catalog_version;
        let frame = encode_frame(header, body).map_err(|e| {
            WalError::append_failed(format!("Failed to encode transaction {}", version), e)
        })?;
        let size = frame.len() as u64;

        if state.file_size > 0 && state.file_size + size > self.max_file_size {
            self.rotate(&mut state)?;
        }

        let offset = state.file_size;
        if let Err(e) = state.file.write_all(&frame) {
            // Cut off a partial frame so the next scan stays clean.
            let _ = state.file.set_len(offset);
            return Err(WalError::append_failed(
                format!("Failed to write WAL transaction {}", version),
                e,
            ));
        }

        if let Err(e) = (self.sync)(&state.file) {
            // The frame was never acknowledged; keep it out of the next scan.
            let _ = state.file.set_len(offset);
            return Err(Self::fail(
                &mut state,
                format!("fsync failed after WAL append of {}", version),
                e,
            ));
        }

        let file_index = state.file_index;
        state.index.insert(
            version,
            FrameLocation {
                file_index,
                offset,
                size,
            },
        );
        state.file_size += size;
        Ok(size)
    }

    fn read_transaction(&self, version: u64) -> WalResult<Option<WalTransaction>> {
        let location = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match state.index.get(&version) {
                Some(location) => *location,
                None => return Ok(None),
            }
        };

        let path = self.dir.join(wal_file_name(location.file_index));
        let read = || -> io::Result<Option<(WalTransaction, u64)>> {
            let mut file = File::open(&path)?;
            file.seek(SeekFrom::Start(location.offset))?;
            read_frame(&mut BufReader::new(file.take(location.size)))
        };

        match read() {
            Ok(Some((transaction, _))) if transaction.header.catalog_version == version => {
                Ok(Some(transaction))
            }
            Ok(_) => Err(WalError::corruption_at_version(
                version,
                "Indexed frame does not hold the expected transaction",
            )),
            Err(e) => Err(WalError::corruption_at_offset(
                path.display(),
                location.offset,
                e.to_string(),
            )),
        }
    }

    fn first_written_version(&self) -> Option<u64> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.index.keys().next().copied()
    }

    fn last_written_version(&self) -> Option<u64> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.index.keys().next_back().copied()
    }
}
