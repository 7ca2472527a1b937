//! Record/replay call cache for calltape
//!
//! This crate records the results of calls to slow or non-deterministic
//! collaborators and replays them on later runs:
//! - Canonical, ordering-invariant fingerprints of call arguments
//! - Per-call-site sequence numbers so repeated identical calls stay distinct
//! - Packetized persistence of call records over pluggable backends
//! - Selective invalidation (recache) and usage-based purging
//!
//! # Overview
//!
//! ```no_run
//! use calltape_cache::{CacheConfig, Value};
//! use std::collections::BTreeMap;
//!
//! let mut cache = CacheConfig::from_env()?.open()?;
//! let total = cache.fetch_or_execute(
//!     "billing::tests::totals",
//!     "sum3",
//!     &[Value::Int(1), Value::Int(2), Value::Int(3)],
//!     &BTreeMap::new(),
//!     |_, _| Ok::<_, calltape_cache::Error>(Value::Int(6)),
//! )?;
//! assert_eq!(total, Value::Int(6));
//! # Ok::<(), calltape_cache::Error>(())
//! ```
//!
//! # Fingerprints
//!
//! A call's fingerprint is computed from:
//! - The canonical form of its positional and keyword arguments
//! - The call site's current sequence number
//! - The call-site identifier itself

pub mod backend;
pub mod canonical;
pub mod config;
pub mod counter;
mod error;
pub mod fingerprint;
pub mod lifecycle;
pub mod record;
pub mod router;
pub mod snapshot;
pub mod store;
pub mod value;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use backend::{Backend, FlatFileBackend, MemoryBackend, UsageKind};
pub use canonical::canonicalize;
pub use config::CacheConfig;
pub use counter::{CounterTable, TraceSeed};
pub use fingerprint::{Fingerprint, TraceHash};
pub use lifecycle::{CallCache, PurgeReport, RecacheFilter};
pub use record::{CallRecord, Packet};
pub use router::{CallRouter, PassThrough, Router, router_from_config};
pub use snapshot::{Snapshot, Snapshotter};
pub use store::RecordStore;
pub use value::Value;
