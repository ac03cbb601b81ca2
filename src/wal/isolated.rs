//! Per-transaction pending WAL
//!
//! A transaction records its mutations here while it is open. On commit the
//! buffer travels with the transaction through conflict resolution and is
//! consumed when the WAL appending stage copies it into the shared WAL.

use std::io;

use crate::catalog::Mutation;

/// Pending mutations of one transaction, newline-delimited JSON
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IsolatedWal {
    buffer: Vec<u8>,
    mutation_count: u64,
    schema_delta: u64,
}

impl IsolatedWal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a buffer holding the given mutations in order.
    pub fn from_mutations<'a>(mutations: impl IntoIterator<Item = &'a Mutation>) -> io::Result<Self> {
        let mut wal = Self::new();
        for mutation in mutations {
            wal.record(mutation)?;
        }
        Ok(wal)
    }

    /// Append one mutation.
    pub fn record(&mut self, mutation: &Mutation) -> io::Result<()> {
        serde_json::to_writer(&mut self.buffer, mutation)?;
        self.buffer.push(b'\n');
        self.mutation_count += 1;
        if mutation.is_schema_mutation() {
            self.schema_delta += 1;
        }
        Ok(())
    }

    pub fn mutation_count(&self) -> u64 {
        self.mutation_count
    }

    pub fn size_bytes(&self) -> u64 {
        self.buffer.len() as u64
    }

    /// Number of schema mutations recorded
    pub fn schema_delta(&self) -> u64 {
        self.schema_delta
    }

    pub fn is_empty(&self) -> bool {
        self.mutation_count == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}
