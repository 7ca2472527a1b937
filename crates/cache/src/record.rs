//! Call records and their packetized storage form
//!
//! A record is persisted as three independently encoded streams (method name,
//! argument envelope, return value). The streams are concatenated in that
//! order and cut into packets of at most `capacity` bytes, never inside a
//! character; a packet may straddle a field boundary, so each packet carries
//! one chunk per field.
//! Reassembly concatenates each field's chunks in packet order and checks the
//! result against the declared field lengths.

use crate::fingerprint::Fingerprint;
use crate::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default packet capacity in bytes
pub const DEFAULT_PACKET_CAPACITY: usize = 1024;

/// Smallest usable packet capacity: the longest UTF-8 encoded character
pub const MIN_PACKET_CAPACITY: usize = 4;

/// The unit of cached knowledge: one completed call
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    /// Primary key
    pub fingerprint: Fingerprint,
    /// Name of the invoked operation
    pub method_name: String,
    /// Call-site identifier the call was recorded at (empty when saved directly)
    pub call_site: String,
    /// Positional arguments as passed
    pub args: Vec<Snapshot>,
    /// Keyword arguments as passed
    pub kwargs: BTreeMap<String, Snapshot>,
    /// Return value
    pub returnval: Snapshot,
}

impl CallRecord {
    /// Create a record with no call-site information
    #[must_use]
    pub fn new(
        fingerprint: Fingerprint,
        method_name: impl Into<String>,
        args: Vec<Snapshot>,
        returnval: Snapshot,
    ) -> Self {
        Self {
            fingerprint,
            method_name: method_name.into(),
            call_site: String::new(),
            args,
            kwargs: BTreeMap::new(),
            returnval,
        }
    }
}

/// A record's three encoded streams
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncodedStreams {
    /// Method name stream
    pub method_name: String,
    /// Argument envelope stream
    pub args: String,
    /// Return value stream
    pub returnval: String,
}

impl EncodedStreams {
    /// Encoded length of each stream, in bytes
    #[must_use]
    pub fn lengths(&self) -> FieldLengths {
        FieldLengths {
            method_name: self.method_name.len(),
            args: self.args.len(),
            returnval: self.returnval.len(),
        }
    }
}

/// Full encoded length of each field, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldLengths {
    /// Method name length
    pub method_name: usize,
    /// Argument envelope length
    pub args: usize,
    /// Return value length
    pub returnval: usize,
}

impl FieldLengths {
    /// Combined length of all fields
    #[must_use]
    pub const fn total(&self) -> usize {
        self.method_name + self.args + self.returnval
    }
}

/// Physical storage unit of a call record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Record this packet belongs to
    pub fingerprint: Fingerprint,
    /// 0-based position of the packet
    pub sequence_index: u32,
    /// Declared lengths of the record's fields
    pub lengths: FieldLengths,
    /// Slice of the method name stream
    pub method_name_chunk: String,
    /// Slice of the argument envelope stream
    pub args_chunk: String,
    /// Slice of the return value stream
    pub returnval_chunk: String,
}

impl Packet {
    fn empty(fingerprint: &Fingerprint, sequence_index: u32, lengths: FieldLengths) -> Self {
        Self {
            fingerprint: fingerprint.clone(),
            sequence_index,
            lengths,
            method_name_chunk: String::new(),
            args_chunk: String::new(),
            returnval_chunk: String::new(),
        }
    }

    /// Number of bytes carried by this packet
    #[must_use]
    pub fn len(&self) -> usize {
        self.method_name_chunk.len() + self.args_chunk.len() + self.returnval_chunk.len()
    }

    /// Whether the packet carries no data
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.method_name_chunk.is_empty()
            && self.args_chunk.is_empty()
            && self.returnval_chunk.is_empty()
    }

    fn chunk_mut(&mut self, field: Field) -> &mut String {
        match field {
            Field::MethodName => &mut self.method_name_chunk,
            Field::Args => &mut self.args_chunk,
            Field::Returnval => &mut self.returnval_chunk,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Field {
    MethodName,
    Args,
    Returnval,
}

/// Cut encoded streams into packets of at most `capacity` bytes
///
/// A packet is closed before a character that would overflow it, so chunks
/// stay valid UTF-8. Capacities below [`MIN_PACKET_CAPACITY`] are raised to it.
/// Always emits at least one packet so that an all-empty record still exists.
#[must_use]
pub fn packetize(
    fingerprint: &Fingerprint,
    streams: &EncodedStreams,
    capacity: usize,
) -> Vec<Packet> {
    let capacity = capacity.max(MIN_PACKET_CAPACITY);
    let lengths = streams.lengths();
    let tagged = streams
        .method_name
        .chars()
        .map(|c| (Field::MethodName, c))
        .chain(streams.args.chars().map(|c| (Field::Args, c)))
        .chain(streams.returnval.chars().map(|c| (Field::Returnval, c)));

    let mut packets = Vec::with_capacity(lengths.total() / capacity + 1);
    let mut current = Packet::empty(fingerprint, 0, lengths);
    let mut filled = 0usize;

    for (field, c) in tagged {
        let width = c.len_utf8();
        if filled + width > capacity {
            let next_index = current.sequence_index + 1;
            packets.push(std::mem::replace(
                &mut current,
                Packet::empty(fingerprint, next_index, lengths),
            ));
            filled = 0;
        }
        current.chunk_mut(field).push(c);
        filled += width;
    }
    if filled > 0 || packets.is_empty() {
        packets.push(current);
    }
    packets
}

/// Reassemble packets into the original streams
///
/// Returns `None` when the packet set is incomplete or inconsistent, e.g. a
/// record torn by a concurrent writer.
#[must_use]
pub fn reassemble(packets: &[Packet]) -> Option<EncodedStreams> {
    let mut ordered: Vec<&Packet> = packets.iter().collect();
    ordered.sort_by_key(|p| p.sequence_index);

    let lengths = ordered.first()?.lengths;
    let mut streams = EncodedStreams::default();
    for (expected, packet) in ordered.iter().enumerate() {
        if usize::try_from(packet.sequence_index).ok()? != expected || packet.lengths != lengths {
            return None;
        }
        streams.method_name.push_str(&packet.method_name_chunk);
        streams.args.push_str(&packet.args_chunk);
        streams.returnval.push_str(&packet.returnval_chunk);
    }

    (streams.lengths() == lengths).then_some(streams)
}
