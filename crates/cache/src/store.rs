//! Packetized record store over a [`Backend`]

use crate::backend::Backend;
use crate::fingerprint::Fingerprint;
use crate::record::{
    CallRecord, DEFAULT_PACKET_CAPACITY, EncodedStreams, MIN_PACKET_CAPACITY, packetize,
    reassemble,
};
use crate::snapshot::Snapshot;
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;

/// Deepest `[`/`{` nesting accepted when decoding a stored stream
///
/// Snapshots bounded by [`crate::snapshot::MAX_DEPTH_LIMIT`] encode well
/// below this; anything deeper is treated as corrupt rather than parsed.
pub const MAX_STREAM_NESTING: usize = 512;

/// The args stream: call site, positional and keyword arguments together
#[derive(Debug, Serialize, Deserialize)]
struct ArgsEnvelope {
    #[serde(default)]
    call_site: String,
    args: Vec<Snapshot>,
    #[serde(default)]
    kwargs: BTreeMap<String, Snapshot>,
}

fn encode(record: &CallRecord) -> Result<EncodedStreams> {
    let envelope = ArgsEnvelope {
        call_site: record.call_site.clone(),
        args: record.args.clone(),
        kwargs: record.kwargs.clone(),
    };
    Ok(EncodedStreams {
        method_name: record.method_name.clone(),
        args: serde_json::to_string(&envelope)
            .map_err(|e| Error::serialization(format!("args of {}: {e}", record.fingerprint)))?,
        returnval: serde_json::to_string(&record.returnval).map_err(|e| {
            Error::serialization(format!("return value of {}: {e}", record.fingerprint))
        })?,
    })
}

/// Deepest bracket nesting of a JSON text, ignoring brackets inside strings
fn nesting_depth(json: &str) -> usize {
    let (mut depth, mut deepest) = (0usize, 0usize);
    let (mut in_string, mut escaped) = (false, false);
    for byte in json.bytes() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'[' | b'{' => {
                depth += 1;
                deepest = deepest.max(depth);
            }
            b']' | b'}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    deepest
}

/// Parse one stream without serde_json's fixed recursion limit
///
/// Each snapshot level takes two or three JSON levels, so the default limit of
/// 128 is reached well inside the snapshot depth bound.
fn from_json<T: DeserializeOwned>(json: &str, what: impl Display) -> Result<T> {
    let depth = nesting_depth(json);
    if depth > MAX_STREAM_NESTING {
        return Err(Error::serialization(format!(
            "{what}: nesting depth {depth} exceeds {MAX_STREAM_NESTING}"
        )));
    }
    let mut de = serde_json::Deserializer::from_str(json);
    de.disable_recursion_limit();
    let value = T::deserialize(&mut de)
        .and_then(|value| de.end().map(|()| value))
        .map_err(|e| Error::serialization(format!("{what}: {e}")))?;
    Ok(value)
}

fn decode(fingerprint: &Fingerprint, streams: EncodedStreams) -> Result<CallRecord> {
    let envelope: ArgsEnvelope = from_json(&streams.args, format_args!("args of {fingerprint}"))?;
    let returnval: Snapshot = from_json(
        &streams.returnval,
        format_args!("return value of {fingerprint}"),
    )?;
    Ok(CallRecord {
        fingerprint: fingerprint.clone(),
        method_name: streams.method_name,
        call_site: envelope.call_site,
        args: envelope.args,
        kwargs: envelope.kwargs,
        returnval,
    })
}

/// Saves, fetches and deletes call records as packet sets
#[derive(Debug)]
pub struct RecordStore<B> {
    backend: B,
    capacity: usize,
}

impl<B: Backend> RecordStore<B> {
    /// Create a store cutting packets at `capacity` bytes
    ///
    /// Capacities below [`MIN_PACKET_CAPACITY`] are raised to it.
    #[must_use]
    pub fn new(backend: B, capacity: usize) -> Self {
        Self {
            backend,
            capacity: capacity.max(MIN_PACKET_CAPACITY),
        }
    }

    /// Create a store with the default packet capacity
    #[must_use]
    pub fn with_default_capacity(backend: B) -> Self {
        Self::new(backend, DEFAULT_PACKET_CAPACITY)
    }

    /// The underlying backend
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Packet capacity in bytes
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store a record, replacing any packets already stored for its fingerprint
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded or written
    pub fn save<'r>(&self, record: &'r CallRecord) -> Result<&'r CallRecord> {
        let streams = encode(record)?;
        let packets = packetize(&record.fingerprint, &streams, self.capacity);

        self.backend.delete_packets(&record.fingerprint)?;
        for packet in &packets {
            self.backend.insert_packet(packet)?;
        }

        tracing::debug!(
            fingerprint = %record.fingerprint,
            method = %record.method_name,
            packets = packets.len(),
            "Saved call record"
        );
        Ok(record)
    }

    /// Load a record; `None` if absent or torn
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the reassembled record cannot be decoded
    pub fn fetch(&self, fingerprint: &Fingerprint) -> Result<Option<CallRecord>> {
        let packets = self.backend.select_packets(fingerprint)?;
        if packets.is_empty() {
            return Ok(None);
        }
        let Some(streams) = reassemble(&packets) else {
            tracing::warn!(
                fingerprint = %fingerprint,
                packets = packets.len(),
                "Call record is incomplete, treating as absent"
            );
            return Ok(None);
        };
        decode(fingerprint, streams).map(Some)
    }

    /// Remove a record; no-op if absent
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written
    pub fn delete(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.backend.delete_packets(fingerprint)?;
        tracing::debug!(fingerprint = %fingerprint, "Deleted call record");
        Ok(())
    }

    /// Fingerprints of all stored records
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read
    pub fn fingerprints(&self) -> Result<Vec<Fingerprint>> {
        self.backend.fingerprints()
    }

    /// Number of packets stored for a fingerprint
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read
    pub fn packet_count(&self, fingerprint: &Fingerprint) -> Result<usize> {
        Ok(self.backend.select_packets(fingerprint)?.len())
    }
}
