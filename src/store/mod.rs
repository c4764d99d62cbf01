//! Record store collaborators
//!
//! The Distributor owns exactly one store and walks it with a single
//! cursor. A failed read still advances the cursor, so a corrupt record
//! is skipped rather than retried forever.

pub mod directory;
pub mod lines;
pub mod memory;

pub use directory::DirectoryRecordStore;
pub use lines::LineRecordStore;
pub use memory::MemoryRecordStore;

use crate::error::RecordStoreError;

/// One key/value record
pub type Record = (String, Vec<u8>);

/// Sequential access to a keyed record collection
pub trait RecordStore: Send {
    /// Total number of records in the store
    fn count(&self) -> u64;

    /// Read the next record and advance the cursor
    ///
    /// Returns `RecordStoreError::NotFound` at the end of the sequence.
    fn sequence(&mut self) -> Result<Record, RecordStoreError>;

    /// Read only the next key and advance the cursor
    fn sequence_key(&mut self) -> Result<String, RecordStoreError>;

    /// Position the cursor so the next read returns `key`
    fn set_cursor_at_key(&mut self, key: &str) -> Result<(), RecordStoreError>;

    /// Human-readable name for logs
    fn description(&self) -> String;

    /// Seed of a shuffled record order, recorded in checkpoints
    fn random_seed(&self) -> Option<u64> {
        None
    }
}

impl<S: RecordStore + ?Sized> RecordStore for Box<S> {
    fn count(&self) -> u64 {
        (**self).count()
    }

    fn sequence(&mut self) -> Result<Record, RecordStoreError> {
        (**self).sequence()
    }

    fn sequence_key(&mut self) -> Result<String, RecordStoreError> {
        (**self).sequence_key()
    }

    fn set_cursor_at_key(&mut self, key: &str) -> Result<(), RecordStoreError> {
        (**self).set_cursor_at_key(key)
    }

    fn description(&self) -> String {
        (**self).description()
    }

    fn random_seed(&self) -> Option<u64> {
        (**self).random_seed()
    }
}
