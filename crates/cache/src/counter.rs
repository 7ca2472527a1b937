//! Per-call-site sequence numbers
//!
//! Two identical calls made from the same call site in one run must not share
//! a fingerprint, otherwise the second would replay the first's result. The
//! [`CounterTable`] hands out strictly increasing sequence numbers per call
//! site. The first use of a call site loads its persisted [`TraceSeed`], or
//! mints one from the current time plus a growing offset.
//!
//! A minted seed is `ticks * MINT_OFFSET_SPAN + offset`, where `ticks` counts
//! 100 µs intervals and the offset stays below [`MINT_OFFSET_SPAN`]. A seed
//! minted later in wall-clock time is therefore always greater, however many
//! seeds the minting process handed out before.
//!
//! Uniqueness across processes is best-effort: concurrently started processes
//! only differ by their seed timestamps.

use crate::Result;
use crate::backend::{Backend, UsageKind};
use crate::fingerprint::TraceHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Offset added to the first seed minted by a process
pub const INITIAL_MINT_OFFSET: u64 = 100;

/// Seeds minted within one timestamp tick differ only below this bound
pub const MINT_OFFSET_SPAN: u64 = 1_000;

/// Persisted starting point of a call site's sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSeed {
    /// Hash of the call-site identifier
    pub trace_hash: TraceHash,
    /// First sequence number handed out for this call site
    pub seed_sequence: u64,
    /// When the seed was minted
    pub created_at: DateTime<Utc>,
}

impl TraceSeed {
    /// Create a seed minted now
    #[must_use]
    pub fn new(trace_hash: TraceHash, seed_sequence: u64) -> Self {
        Self {
            trace_hash,
            seed_sequence,
            created_at: Utc::now(),
        }
    }
}

/// Process-local table of next sequence numbers
#[derive(Debug)]
pub struct CounterTable {
    counters: HashMap<TraceHash, u64>,
    offset: u64,
}

impl Default for CounterTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self {
            counters: HashMap::new(),
            offset: INITIAL_MINT_OFFSET,
        }
    }

    /// Number of call sites seen by this process
    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether no call site has been seen yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Sequence number the next call at `trace` would receive, if loaded
    #[must_use]
    pub fn peek(&self, trace: &str) -> Option<u64> {
        self.counters.get(&TraceHash::of(trace)).copied()
    }

    /// Forget all in-process counters
    ///
    /// Seeds stay in the backend, so the next call per site reloads them.
    pub fn reset(&mut self) {
        self.counters.clear();
    }

    /// Return the next sequence number for a call site
    ///
    /// # Errors
    ///
    /// Returns an error if the seed cannot be read from or written to the backend
    pub fn next_sequence<B: Backend + ?Sized>(
        &mut self,
        backend: &B,
        trace: &str,
    ) -> Result<u64> {
        let trace_hash = TraceHash::of(trace);

        let current = match self.counters.get(&trace_hash) {
            Some(&value) => value,
            None => {
                let seed = match backend.select_seed(&trace_hash)? {
                    Some(seed) => {
                        tracing::debug!(
                            trace_hash = %trace_hash,
                            seed = seed.seed_sequence,
                            "Loaded trace seed"
                        );
                        seed
                    }
                    None => self.mint(backend, &trace_hash)?,
                };
                backend.touch(UsageKind::Seed, trace_hash.as_hex(), Utc::now())?;
                seed.seed_sequence
            }
        };

        self.counters.insert(trace_hash, current.saturating_add(1));
        Ok(current)
    }

    fn mint<B: Backend + ?Sized>(
        &mut self,
        backend: &B,
        trace_hash: &TraceHash,
    ) -> Result<TraceSeed> {
        let ticks = u64::try_from(Utc::now().timestamp_micros() / 100).unwrap_or_default();
        let sequence = ticks
            .saturating_mul(MINT_OFFSET_SPAN)
            .saturating_add(self.offset);
        let seed = TraceSeed::new(trace_hash.clone(), sequence);
        self.offset = (self.offset * 3 / 2) % MINT_OFFSET_SPAN;

        backend.insert_seed(&seed)?;
        // Another process may have stored its seed first; use whichever won
        let stored = backend.select_seed(trace_hash)?.unwrap_or(seed);
        tracing::debug!(
            trace_hash = %trace_hash,
            seed = stored.seed_sequence,
            "Minted trace seed"
        );
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[test]
    fn test_sequence_is_strictly_increasing() {
        let backend = MemoryBackend::new();
        let mut table = CounterTable::new();
        let first = table.next_sequence(&backend, "siteX").unwrap();
        let second = table.next_sequence(&backend, "siteX").unwrap();
        let third = table.next_sequence(&backend, "siteX").unwrap();
        assert!(first < second && second < third);
        assert_eq!(table.peek("siteX"), Some(third + 1));
    }

    #[test]
    fn test_call_sites_are_independent() {
        let backend = MemoryBackend::new();
        let mut table = CounterTable::new();
        table.next_sequence(&backend, "a").unwrap();
        table.next_sequence(&backend, "b").unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(backend.seed_hashes().unwrap().len(), 2);
    }

    #[test]
    fn test_stored_seed_is_reused_after_restart() {
        let backend = MemoryBackend::new();
        let first = CounterTable::new().next_sequence(&backend, "siteX").unwrap();
        let mut restarted = CounterTable::new();
        assert_eq!(restarted.next_sequence(&backend, "siteX").unwrap(), first);
    }

    #[test]
    fn test_existing_seed_is_loaded() {
        let backend = MemoryBackend::new();
        backend
            .insert_seed(&TraceSeed::new(TraceHash::of("siteX"), 42))
            .unwrap();
        let mut table = CounterTable::new();
        assert_eq!(table.next_sequence(&backend, "siteX").unwrap(), 42);
        assert_eq!(table.next_sequence(&backend, "siteX").unwrap(), 43);
    }

    #[test]
    fn test_fresh_seed_after_restart_is_greater() {
        let backend = MemoryBackend::new();
        let mut table = CounterTable::new();
        let old = table.next_sequence(&backend, "siteX").unwrap();

        backend.delete_seed(&TraceHash::of("siteX")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));

        let mut restarted = CounterTable::new();
        let fresh = restarted.next_sequence(&backend, "siteX").unwrap();
        assert!(fresh > old);
    }

    #[test]
    fn test_fresh_seed_is_greater_after_many_mints() {
        let backend = MemoryBackend::new();
        let mut table = CounterTable::new();
        let mut old = 0;
        for i in 0..30 {
            old = table.next_sequence(&backend, &format!("site{i}")).unwrap();
        }

        backend.delete_seed(&TraceHash::of("site29")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));

        let mut restarted = CounterTable::new();
        let fresh = restarted.next_sequence(&backend, "site29").unwrap();
        assert!(fresh > old, "fresh {fresh} <= old {old}");
    }

    #[test]
    fn test_mint_offset_grows() {
        let backend = MemoryBackend::new();
        let mut table = CounterTable::new();
        table.next_sequence(&backend, "a").unwrap();
        assert_eq!(table.offset, 150);
        table.next_sequence(&backend, "b").unwrap();
        assert_eq!(table.offset, 225);
    }

    #[test]
    fn test_mint_offset_stays_below_span() {
        let backend = MemoryBackend::new();
        let mut table = CounterTable::new();
        for i in 0..100 {
            table.next_sequence(&backend, &format!("site{i}")).unwrap();
            assert!(table.offset < MINT_OFFSET_SPAN);
        }
    }

    #[test]
    fn test_seed_usage_is_touched() {
        let backend = MemoryBackend::new();
        let mut table = CounterTable::new();
        table.next_sequence(&backend, "siteX").unwrap();
        let hash = TraceHash::of("siteX");
        assert!(
            backend
                .last_referenced(UsageKind::Seed, hash.as_hex())
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_reset_reloads_from_seed() {
        let backend = MemoryBackend::new();
        let mut table = CounterTable::new();
        let first = table.next_sequence(&backend, "s").unwrap();
        table.next_sequence(&backend, "s").unwrap();
        table.reset();
        assert!(table.is_empty());
        assert_eq!(table.next_sequence(&backend, "s").unwrap(), first);
    }
}
