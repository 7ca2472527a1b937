//! In-process backend

use super::{Backend, UsageKind};
use crate::Result;
use crate::counter::TraceSeed;
use crate::fingerprint::{Fingerprint, TraceHash};
use crate::record::Packet;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
struct State {
    packets: BTreeMap<Fingerprint, BTreeMap<u32, Packet>>,
    seeds: BTreeMap<TraceHash, TraceSeed>,
    usage: HashMap<(UsageKind, String), DateTime<Utc>>,
}

/// Backend keeping everything in memory for the lifetime of the value
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: RwLock<State>,
}

impl MemoryBackend {
    /// Create an empty backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn select_packets(&self, fingerprint: &Fingerprint) -> Result<Vec<Packet>> {
        Ok(self
            .state
            .read()
            .packets
            .get(fingerprint)
            .map(|packets| packets.values().cloned().collect())
            .unwrap_or_default())
    }

    fn insert_packet(&self, packet: &Packet) -> Result<()> {
        self.state
            .write()
            .packets
            .entry(packet.fingerprint.clone())
            .or_default()
            .insert(packet.sequence_index, packet.clone());
        Ok(())
    }

    fn delete_packets(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.state.write().packets.remove(fingerprint);
        Ok(())
    }

    fn fingerprints(&self) -> Result<Vec<Fingerprint>> {
        Ok(self.state.read().packets.keys().cloned().collect())
    }

    fn select_seed(&self, trace_hash: &TraceHash) -> Result<Option<TraceSeed>> {
        Ok(self.state.read().seeds.get(trace_hash).cloned())
    }

    fn insert_seed(&self, seed: &TraceSeed) -> Result<()> {
        self.state
            .write()
            .seeds
            .entry(seed.trace_hash.clone())
            .or_insert_with(|| seed.clone());
        Ok(())
    }

    fn delete_seed(&self, trace_hash: &TraceHash) -> Result<()> {
        self.state.write().seeds.remove(trace_hash);
        Ok(())
    }

    fn seed_hashes(&self) -> Result<Vec<TraceHash>> {
        Ok(self.state.read().seeds.keys().cloned().collect())
    }

    fn touch(&self, kind: UsageKind, key: &str, at: DateTime<Utc>) -> Result<()> {
        self.state.write().usage.insert((kind, key.to_string()), at);
        Ok(())
    }

    fn last_referenced(&self, kind: UsageKind, key: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .state
            .read()
            .usage
            .get(&(kind, key.to_string()))
            .copied())
    }

    fn forget(&self, kind: UsageKind, key: &str) -> Result<()> {
        self.state.write().usage.remove(&(kind, key.to_string()));
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.state.write() = State::default();
        Ok(())
    }
}
