//! Cache lifecycle: fetch-or-execute, invalidation and purging
//!
//! [`CallCache`] ties together the record store, the call-site counter and the
//! deep snapshotter. Per fingerprint a record is either absent or present:
//!
//! ```text
//! absent --save (miss)--> present --delete | recache | purge--> absent
//! ```

use crate::backend::{Backend, UsageKind};
use crate::config::CacheConfig;
use crate::counter::CounterTable;
use crate::fingerprint::Fingerprint;
use crate::record::CallRecord;
use crate::snapshot::Snapshotter;
use crate::store::RecordStore;
use crate::value::Value;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Selects records for [`CallCache::recache`]
///
/// With no filter set every record matches and recaching resets the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecacheFilter {
    /// Exact method name to match
    pub method_name: Option<String>,
    /// Substring of the recorded call site to match
    pub source: Option<String>,
}

impl RecacheFilter {
    /// Filter matching every record
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to one method name
    #[must_use]
    pub fn method(mut self, name: impl Into<String>) -> Self {
        self.method_name = Some(name.into());
        self
    }

    /// Restrict to call sites containing `source`
    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Whether no restriction is set
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.method_name.is_none() && self.source.is_none()
    }

    /// Whether a record is selected by this filter
    #[must_use]
    pub fn matches(&self, record: &CallRecord) -> bool {
        self.method_name
            .as_deref()
            .is_none_or(|name| record.method_name == name)
            && self
                .source
                .as_deref()
                .is_none_or(|source| record.call_site.contains(source))
    }
}

/// Outcome of [`CallCache::purge`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// Call records removed
    pub records_removed: usize,
    /// Trace seeds removed
    pub seeds_removed: usize,
}

/// Record/replay cache for calls
#[derive(Debug)]
pub struct CallCache<B> {
    store: RecordStore<B>,
    counters: CounterTable,
    snapshotter: Snapshotter,
    last_cached: Option<Fingerprint>,
}

impl<B: Backend> CallCache<B> {
    /// Create a cache with default packet capacity and depth bound
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, &CacheConfig::default())
    }

    /// Create a cache using the limits from `config`
    #[must_use]
    pub fn with_config(backend: B, config: &CacheConfig) -> Self {
        Self {
            store: RecordStore::new(backend, config.packet_capacity),
            counters: CounterTable::new(),
            snapshotter: Snapshotter::new(config.max_depth),
            last_cached: None,
        }
    }

    /// The record store
    #[must_use]
    pub const fn store(&self) -> &RecordStore<B> {
        &self.store
    }

    /// The call-site counters of this process
    #[must_use]
    pub const fn counters(&self) -> &CounterTable {
        &self.counters
    }

    /// Return the recorded result of a call, or run it and record the result
    ///
    /// `thunk` receives the arguments and performs the real call. Its error is
    /// returned unchanged and nothing is recorded for the call.
    ///
    /// # Errors
    ///
    /// Returns the thunk's error, or a cache [`Error`] converted into `E` if the
    /// backend fails or the arguments or result cannot be encoded
    pub fn fetch_or_execute<F, E>(
        &mut self,
        call_site: &str,
        method_name: &str,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
        thunk: F,
    ) -> std::result::Result<Value, E>
    where
        F: FnOnce(&[Value], &BTreeMap<String, Value>) -> std::result::Result<Value, E>,
        E: From<Error>,
    {
        let sequence = self.counters.next_sequence(self.store.backend(), call_site)?;
        let fingerprint = Fingerprint::for_call(call_site, sequence, args, kwargs);

        if let Some(record) = self.store.fetch(&fingerprint)? {
            self.touch(&fingerprint)?;
            tracing::debug!(fingerprint = %fingerprint, method = %method_name, "Cache hit");
            return Ok(record.returnval.into());
        }
        tracing::debug!(fingerprint = %fingerprint, method = %method_name, "Cache miss");

        // The call may mutate shared arguments, so capture them first
        let args_snapshot = self.snapshotter.snapshot_all(args);
        let kwargs_snapshot = self.snapshotter.snapshot_entries(kwargs);

        let value = thunk(args, kwargs)?;

        let record = CallRecord {
            fingerprint,
            method_name: method_name.to_string(),
            call_site: call_site.to_string(),
            args: args_snapshot?,
            kwargs: kwargs_snapshot?,
            returnval: self.snapshotter.snapshot(&value)?,
        };
        self.save(&record)?;
        Ok(value)
    }

    /// Load a record by fingerprint, marking it as referenced
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the record cannot be decoded
    pub fn fetch(&self, fingerprint: &Fingerprint) -> Result<Option<CallRecord>> {
        let record = self.store.fetch(fingerprint)?;
        if record.is_some() {
            self.touch(fingerprint)?;
        }
        Ok(record)
    }

    /// Store a record and remember it as the most recently cached one
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded or written
    pub fn save<'r>(&mut self, record: &'r CallRecord) -> Result<&'r CallRecord> {
        self.store.save(record)?;
        self.touch(&record.fingerprint)?;
        self.last_cached = Some(record.fingerprint.clone());
        Ok(record)
    }

    /// Remove a record and its usage entry
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written
    pub fn delete(&mut self, fingerprint: &Fingerprint) -> Result<()> {
        self.store.delete(fingerprint)?;
        self.store
            .backend()
            .forget(UsageKind::Record, fingerprint.as_hex())?;
        if self.last_cached.as_ref() == Some(fingerprint) {
            self.last_cached = None;
        }
        Ok(())
    }

    /// Fingerprint of the most recently saved record, if any
    #[must_use]
    pub const fn last_cached(&self) -> Option<&Fingerprint> {
        self.last_cached.as_ref()
    }

    /// Roll back the most recently saved record
    ///
    /// Returns the fingerprint that was removed, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written
    pub fn delete_last_cached(&mut self) -> Result<Option<Fingerprint>> {
        let Some(fingerprint) = self.last_cached.take() else {
            return Ok(None);
        };
        self.delete(&fingerprint)?;
        tracing::debug!(fingerprint = %fingerprint, "Rolled back last cached record");
        Ok(Some(fingerprint))
    }

    /// Delete every record selected by `filter`
    ///
    /// An empty filter clears records, seeds and usage entries and restarts
    /// the in-process counters. Returns the number of records removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or a record cannot be decoded
    pub fn recache(&mut self, filter: &RecacheFilter) -> Result<usize> {
        if filter.is_empty() {
            let removed = self.store.fingerprints()?.len();
            self.store.backend().clear()?;
            self.counters.reset();
            self.last_cached = None;
            tracing::info!(removed, "Reset call cache");
            return Ok(removed);
        }

        let mut removed = 0;
        for fingerprint in self.store.fingerprints()? {
            let Some(record) = self.store.fetch(&fingerprint)? else {
                continue;
            };
            if filter.matches(&record) {
                self.delete(&fingerprint)?;
                removed += 1;
            }
        }
        tracing::info!(
            removed,
            method = ?filter.method_name,
            source = ?filter.source,
            "Recached call records"
        );
        Ok(removed)
    }

    /// Drop records and seeds not referenced since `watermark`
    ///
    /// Entries never referenced in the usage log are dropped as well.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read or written
    pub fn purge(&mut self, watermark: DateTime<Utc>) -> Result<PurgeReport> {
        let backend = self.store.backend();
        let is_stale = |kind: UsageKind, key: &str| -> Result<bool> {
            Ok(backend
                .last_referenced(kind, key)?
                .is_none_or(|at| at < watermark))
        };

        let mut report = PurgeReport::default();
        for fingerprint in self.store.fingerprints()? {
            if is_stale(UsageKind::Record, fingerprint.as_hex())? {
                self.store.delete(&fingerprint)?;
                backend.forget(UsageKind::Record, fingerprint.as_hex())?;
                if self.last_cached.as_ref() == Some(&fingerprint) {
                    self.last_cached = None;
                }
                report.records_removed += 1;
            }
        }
        for trace_hash in backend.seed_hashes()? {
            if is_stale(UsageKind::Seed, trace_hash.as_hex())? {
                backend.delete_seed(&trace_hash)?;
                backend.forget(UsageKind::Seed, trace_hash.as_hex())?;
                report.seeds_removed += 1;
            }
        }

        tracing::info!(
            watermark = %watermark,
            records = report.records_removed,
            seeds = report.seeds_removed,
            "Purged call cache"
        );
        Ok(report)
    }

    fn touch(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.store
            .backend()
            .touch(UsageKind::Record, fingerprint.as_hex(), Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::snapshot::Snapshot;
    use std::cell::Cell;

    fn no_kwargs() -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    fn sum(args: &[Value], _: &BTreeMap<String, Value>) -> Result<Value> {
        let total = args
            .iter()
            .map(|v| match v {
                Value::Int(i) => *i,
                _ => 0,
            })
            .sum::<i64>();
        Ok(Value::Int(total))
    }

    #[test]
    fn test_repeated_call_gets_distinct_fingerprints() {
        let mut cache = CallCache::new(MemoryBackend::new());
        let args = [Value::Int(1), Value::Int(2), Value::Int(3)];
        let calls = Cell::new(0);
        let run = |a: &[Value], k: &BTreeMap<String, Value>| {
            calls.set(calls.get() + 1);
            sum(a, k)
        };

        assert_eq!(
            cache
                .fetch_or_execute("S", "sum3", &args, &no_kwargs(), run)
                .unwrap(),
            Value::Int(6)
        );
        let first = cache.last_cached().cloned().unwrap();
        assert_eq!(
            cache
                .fetch_or_execute("S", "sum3", &args, &no_kwargs(), run)
                .unwrap(),
            Value::Int(6)
        );
        let second = cache.last_cached().cloned().unwrap();

        assert_ne!(first, second);
        assert_eq!(calls.get(), 2);
        assert_eq!(cache.store().fingerprints().unwrap().len(), 2);
    }

    #[test]
    fn test_thunk_error_is_not_cached() {
        let mut cache = CallCache::new(MemoryBackend::new());
        let result: std::result::Result<Value, Error> =
            cache.fetch_or_execute("S", "fails", &[], &no_kwargs(), |_, _| {
                Err(Error::validation("boom"))
            });
        assert!(matches!(result, Err(Error::Validation { .. })));
        assert!(cache.store().fingerprints().unwrap().is_empty());
        assert!(cache.last_cached().is_none());
    }

    #[test]
    fn test_resource_result_fails_at_save() {
        let mut cache = CallCache::new(MemoryBackend::new());
        let result = cache.fetch_or_execute("S", "open", &[], &no_kwargs(), |_, _| {
            Ok::<_, Error>(Value::Resource("socket".into()))
        });
        assert!(matches!(result, Err(Error::Encoding { .. })));
        assert!(cache.store().fingerprints().unwrap().is_empty());
    }

    #[test]
    fn test_record_keeps_call_details() {
        let mut cache = CallCache::new(MemoryBackend::new());
        let kwargs = BTreeMap::from([("scale".to_string(), Value::Int(2))]);
        cache
            .fetch_or_execute("tests/site.rs:12", "sum3", &[Value::Int(4)], &kwargs, sum)
            .unwrap();
        let fp = cache.last_cached().cloned().unwrap();
        let record = cache.fetch(&fp).unwrap().unwrap();
        assert_eq!(record.method_name, "sum3");
        assert_eq!(record.call_site, "tests/site.rs:12");
        assert_eq!(record.args, vec![Snapshot::Int(4)]);
        assert_eq!(record.kwargs.get("scale"), Some(&Snapshot::Int(2)));
        assert_eq!(record.returnval, Snapshot::Int(4));
    }

    #[test]
    fn test_delete_last_cached() {
        let mut cache = CallCache::new(MemoryBackend::new());
        cache.fetch_or_execute("S", "a", &[], &no_kwargs(), sum).unwrap();
        cache.fetch_or_execute("S", "b", &[], &no_kwargs(), sum).unwrap();
        let removed = cache.delete_last_cached().unwrap().unwrap();
        assert!(cache.store().fetch(&removed).unwrap().is_none());
        assert_eq!(cache.store().fingerprints().unwrap().len(), 1);
        assert!(cache.delete_last_cached().unwrap().is_none());
    }

    #[test]
    fn test_recache_by_method_and_source() {
        let mut cache = CallCache::new(MemoryBackend::new());
        cache.fetch_or_execute("src/a.rs:1", "m1", &[], &no_kwargs(), sum).unwrap();
        cache.fetch_or_execute("src/b.rs:1", "m1", &[], &no_kwargs(), sum).unwrap();
        cache.fetch_or_execute("src/a.rs:2", "m2", &[], &no_kwargs(), sum).unwrap();

        let removed = cache
            .recache(&RecacheFilter::all().method("m1").source("a.rs"))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cache.store().fingerprints().unwrap().len(), 2);

        assert_eq!(cache.recache(&RecacheFilter::all().method("m1")).unwrap(), 1);
        let remaining = cache.store().fingerprints().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(cache.fetch(&remaining[0]).unwrap().unwrap().method_name, "m2");
    }

    #[test]
    fn test_recache_without_filter_resets() {
        let mut cache = CallCache::new(MemoryBackend::new());
        cache.fetch_or_execute("S", "m1", &[], &no_kwargs(), sum).unwrap();
        cache.fetch_or_execute("T", "m2", &[], &no_kwargs(), sum).unwrap();
        assert_eq!(cache.recache(&RecacheFilter::all()).unwrap(), 2);
        assert!(cache.store().fingerprints().unwrap().is_empty());
        assert!(cache.store().backend().seed_hashes().unwrap().is_empty());
        assert!(cache.counters().is_empty());
        assert!(cache.last_cached().is_none());
    }

    #[test]
    fn test_purge_keeps_recent_entries() {
        let backend = MemoryBackend::new();
        let mut cache = CallCache::new(&backend);
        cache.fetch_or_execute("old", "m", &[], &no_kwargs(), sum).unwrap();
        let old = cache.last_cached().cloned().unwrap();
        cache.fetch_or_execute("new", "m", &[], &no_kwargs(), sum).unwrap();
        let new = cache.last_cached().cloned().unwrap();

        let long_ago = Utc::now() - chrono::TimeDelta::days(30);
        backend.touch(UsageKind::Record, old.as_hex(), long_ago).unwrap();
        let old_seed = crate::fingerprint::TraceHash::of("old");
        backend.touch(UsageKind::Seed, old_seed.as_hex(), long_ago).unwrap();

        let report = cache.purge(Utc::now() - chrono::TimeDelta::days(1)).unwrap();
        assert_eq!(report, PurgeReport { records_removed: 1, seeds_removed: 1 });
        assert!(cache.store().fetch(&old).unwrap().is_none());
        assert!(cache.store().fetch(&new).unwrap().is_some());
        assert!(backend.last_referenced(UsageKind::Record, old.as_hex()).unwrap().is_none());
    }

    #[test]
    fn test_purge_drops_unreferenced_records() {
        let backend = MemoryBackend::new();
        let mut cache = CallCache::new(&backend);
        let record =
            CallRecord::new(Fingerprint::from_data(b"direct"), "m", vec![], Snapshot::None);
        cache.store().save(&record).unwrap();
        let report = cache.purge(Utc::now()).unwrap();
        assert_eq!(report.records_removed, 1);
    }

    #[test]
    fn test_filter_matching() {
        let mut record =
            CallRecord::new(Fingerprint::from_data(b"f"), "m1", vec![], Snapshot::None);
        record.call_site = "tests/test_api.rs:40".into();
        assert!(RecacheFilter::all().matches(&record));
        assert!(RecacheFilter::all().method("m1").matches(&record));
        assert!(!RecacheFilter::all().method("m").matches(&record));
        assert!(RecacheFilter::all().source("test_api").matches(&record));
        assert!(!RecacheFilter::all().method("m1").source("other").matches(&record));
    }
}
