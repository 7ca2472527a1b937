//! Persistence backends for packets, trace seeds and the usage log
//!
//! The cache core only needs the narrow contract in [`Backend`]. Two
//! implementations ship with the crate:
//!
//! - [`MemoryBackend`]: process-local maps, for tests and throwaway runs
//! - [`FlatFileBackend`]: JSON files under a cache directory
//!
//! ```text
//! <root>/
//!   packets/<fingerprint>/<sequence_index>.json
//!   seeds/<trace_hash>.json
//!   usage/records/<fingerprint>.json
//!   usage/seeds/<trace_hash>.json
//! ```

mod flatfile;
mod memory;

pub use flatfile::FlatFileBackend;
pub use memory::MemoryBackend;

use crate::Result;
use crate::counter::TraceSeed;
use crate::fingerprint::{Fingerprint, TraceHash};
use crate::record::Packet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kinds of entries tracked by the usage log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    /// A call record, keyed by fingerprint
    Record,
    /// A trace seed, keyed by trace hash
    Seed,
}

impl UsageKind {
    /// Directory name used by file-based backends
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Record => "records",
            Self::Seed => "seeds",
        }
    }
}

/// Storage contract required by the record store, counter and lifecycle manager
///
/// Operations are synchronous and either complete or fail; no retries happen
/// at this layer.
pub trait Backend {
    /// All packets stored for a fingerprint, in any order
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read
    fn select_packets(&self, fingerprint: &Fingerprint) -> Result<Vec<Packet>>;

    /// Store one packet
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written
    fn insert_packet(&self, packet: &Packet) -> Result<()>;

    /// Remove every packet of a fingerprint; no-op if none exist
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written
    fn delete_packets(&self, fingerprint: &Fingerprint) -> Result<()>;

    /// Fingerprints with at least one stored packet
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read
    fn fingerprints(&self) -> Result<Vec<Fingerprint>>;

    /// Stored seed for a trace, if any
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read
    fn select_seed(&self, trace_hash: &TraceHash) -> Result<Option<TraceSeed>>;

    /// Store a seed unless one already exists for its trace
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written
    fn insert_seed(&self, seed: &TraceSeed) -> Result<()>;

    /// Remove a trace seed; no-op if absent
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written
    fn delete_seed(&self, trace_hash: &TraceHash) -> Result<()>;

    /// Trace hashes with a stored seed
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read
    fn seed_hashes(&self) -> Result<Vec<TraceHash>>;

    /// Record that an entry was referenced at `at`
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written
    fn touch(&self, kind: UsageKind, key: &str, at: DateTime<Utc>) -> Result<()>;

    /// When an entry was last referenced, if ever
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read
    fn last_referenced(&self, kind: UsageKind, key: &str) -> Result<Option<DateTime<Utc>>>;

    /// Drop an entry from the usage log
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written
    fn forget(&self, kind: UsageKind, key: &str) -> Result<()>;

    /// Remove all packets, seeds and usage entries
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written
    fn clear(&self) -> Result<()>;
}

impl<B: Backend + ?Sized> Backend for &B {
    fn select_packets(&self, fingerprint: &Fingerprint) -> Result<Vec<Packet>> {
        (**self).select_packets(fingerprint)
    }

    fn insert_packet(&self, packet: &Packet) -> Result<()> {
        (**self).insert_packet(packet)
    }

    fn delete_packets(&self, fingerprint: &Fingerprint) -> Result<()> {
        (**self).delete_packets(fingerprint)
    }

    fn fingerprints(&self) -> Result<Vec<Fingerprint>> {
        (**self).fingerprints()
    }

    fn select_seed(&self, trace_hash: &TraceHash) -> Result<Option<TraceSeed>> {
        (**self).select_seed(trace_hash)
    }

    fn insert_seed(&self, seed: &TraceSeed) -> Result<()> {
        (**self).insert_seed(seed)
    }

    fn delete_seed(&self, trace_hash: &TraceHash) -> Result<()> {
        (**self).delete_seed(trace_hash)
    }

    fn seed_hashes(&self) -> Result<Vec<TraceHash>> {
        (**self).seed_hashes()
    }

    fn touch(&self, kind: UsageKind, key: &str, at: DateTime<Utc>) -> Result<()> {
        (**self).touch(kind, key, at)
    }

    fn last_referenced(&self, kind: UsageKind, key: &str) -> Result<Option<DateTime<Utc>>> {
        (**self).last_referenced(kind, key)
    }

    fn forget(&self, kind: UsageKind, key: &str) -> Result<()> {
        (**self).forget(kind, key)
    }

    fn clear(&self) -> Result<()> {
        (**self).clear()
    }
}
