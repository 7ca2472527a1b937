//! JSON-file backend rooted at a cache directory
//!
//! Every entry is one small JSON document written to a temporary file and
//! renamed into place, so readers never see a partially written file. Seeds are
//! hard-linked into place instead, which never replaces an existing seed. A record
//! whose packets are replaced while another process reads it can still appear
//! torn; the record store detects that from the declared field lengths.

use super::{Backend, UsageKind};
use crate::counter::TraceSeed;
use crate::fingerprint::{Fingerprint, TraceHash};
use crate::record::Packet;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const PACKETS_DIR: &str = "packets";
const SEEDS_DIR: &str = "seeds";
const USAGE_DIR: &str = "usage";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Serialize, Deserialize)]
struct UsageEntry {
    last_referenced: DateTime<Utc>,
}

/// Backend storing packets, seeds and usage as JSON files
#[derive(Debug, Clone)]
pub struct FlatFileBackend {
    root: PathBuf,
}

impl FlatFileBackend {
    /// Open (and create if needed) a backend rooted at `root`
    ///
    /// # Errors
    ///
    /// Returns an error if the directory layout cannot be created
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let backend = Self { root: root.into() };
        for dir in [
            backend.root.join(PACKETS_DIR),
            backend.root.join(SEEDS_DIR),
            backend.usage_dir(UsageKind::Record),
            backend.usage_dir(UsageKind::Seed),
        ] {
            fs::create_dir_all(&dir).map_err(|e| Error::io(e, &dir, "create_dir"))?;
        }
        tracing::debug!(root = %backend.root.display(), "Opened flat-file cache backend");
        Ok(backend)
    }

    /// Root directory of this backend
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn packet_dir(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(PACKETS_DIR).join(fingerprint.as_hex())
    }

    fn seed_path(&self, trace_hash: &TraceHash) -> PathBuf {
        self.root
            .join(SEEDS_DIR)
            .join(format!("{}.json", trace_hash.as_hex()))
    }

    fn usage_dir(&self, kind: UsageKind) -> PathBuf {
        self.root.join(USAGE_DIR).join(kind.dir_name())
    }

    fn usage_path(&self, kind: UsageKind, key: &str) -> Result<PathBuf> {
        // Keys are digests; anything else could escape the usage directory
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::validation(format!("Invalid usage key: {key:?}")));
        }
        Ok(self.usage_dir(kind).join(format!("{key}.json")))
    }

    /// Entries of a directory, treating a missing directory as empty
    fn read_dir_entries(dir: &Path) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(e, dir, "read_dir")),
        };
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(e, dir, "read_dir"))?;
            paths.push(entry.path());
        }
        paths.sort();
        Ok(paths)
    }

    fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(e, path, "read")),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping corrupt cache file");
                Ok(None)
            }
        }
    }

    fn temp_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        path.with_file_name(format!(".{name}.{}.{n}.tmp", std::process::id()))
    }

    /// Write JSON to a fresh temporary file next to `path` and return its path
    fn write_temp<T: Serialize>(path: &Path, value: &T) -> Result<PathBuf> {
        let bytes = serde_json::to_vec(value).map_err(|e| Error::serialization(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir"))?;
        }

        let tmp_path = Self::temp_path(path);
        let mut file =
            fs::File::create(&tmp_path).map_err(|e| Error::io(e, &tmp_path, "create"))?;
        file.write_all(&bytes)
            .map_err(|e| Error::io(e, &tmp_path, "write"))?;
        file.sync_all()
            .map_err(|e| Error::io(e, &tmp_path, "sync"))?;
        Ok(tmp_path)
    }

    /// Write JSON to a temporary file and rename it over `path`
    fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let tmp_path = Self::write_temp(path, value)?;
        fs::rename(&tmp_path, path).map_err(|e| Error::io(e, path, "rename"))
    }

    /// Write JSON to a temporary file and link it to `path` unless `path` exists
    ///
    /// Returns `false` if `path` already existed; it is left untouched.
    fn write_json_no_clobber<T: Serialize>(path: &Path, value: &T) -> Result<bool> {
        let tmp_path = Self::write_temp(path, value)?;
        let linked = fs::hard_link(&tmp_path, path);
        Self::remove_file_if_exists(&tmp_path)?;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Error::io(e, path, "link")),
        }
    }

    fn remove_file_if_exists(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(e, path, "remove")),
        }
    }

    fn remove_dir_if_exists(path: &Path) -> Result<()> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(e, path, "remove_dir")),
        }
    }

    /// Stems of `*.json` files in a directory, skipping temporaries
    fn json_stems(dir: &Path) -> Result<Vec<String>> {
        Ok(Self::read_dir_entries(dir)?
            .into_iter()
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|p| {
                p.file_stem()
                    .and_then(|s| s.to_str())
                    .filter(|s| !s.starts_with('.'))
                    .map(str::to_string)
            })
            .collect())
    }
}

impl Backend for FlatFileBackend {
    fn select_packets(&self, fingerprint: &Fingerprint) -> Result<Vec<Packet>> {
        let dir = self.packet_dir(fingerprint);
        let mut packets = Vec::new();
        for stem in Self::json_stems(&dir)? {
            let path = dir.join(format!("{stem}.json"));
            if let Some(packet) = Self::read_json::<Packet>(&path)? {
                if packet.fingerprint == *fingerprint {
                    packets.push(packet);
                } else {
                    tracing::warn!(path = %path.display(), "Packet stored under wrong fingerprint");
                }
            }
        }
        Ok(packets)
    }

    fn insert_packet(&self, packet: &Packet) -> Result<()> {
        let path = self
            .packet_dir(&packet.fingerprint)
            .join(format!("{}.json", packet.sequence_index));
        Self::write_json_atomic(&path, packet)
    }

    fn delete_packets(&self, fingerprint: &Fingerprint) -> Result<()> {
        Self::remove_dir_if_exists(&self.packet_dir(fingerprint))
    }

    fn fingerprints(&self) -> Result<Vec<Fingerprint>> {
        let dir = self.root.join(PACKETS_DIR);
        let mut fingerprints = Vec::new();
        for path in Self::read_dir_entries(&dir)? {
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match Fingerprint::from_hex(name) {
                Ok(fp) => {
                    if !Self::json_stems(&path)?.is_empty() {
                        fingerprints.push(fp);
                    }
                }
                Err(_) => {
                    tracing::warn!(
                        path = %path.display(),
                        "Ignoring unexpected entry in packet directory"
                    );
                }
            }
        }
        Ok(fingerprints)
    }

    fn select_seed(&self, trace_hash: &TraceHash) -> Result<Option<TraceSeed>> {
        Self::read_json(&self.seed_path(trace_hash))
    }

    fn insert_seed(&self, seed: &TraceSeed) -> Result<()> {
        let path = self.seed_path(&seed.trace_hash);
        if Self::write_json_no_clobber(&path, seed)? {
            return Ok(());
        }
        // The first complete seed wins; an unreadable one is replaced
        if Self::read_json::<TraceSeed>(&path)?.is_none() {
            tracing::warn!(path = %path.display(), "Replacing unreadable trace seed");
            Self::write_json_atomic(&path, seed)?;
        }
        Ok(())
    }

    fn delete_seed(&self, trace_hash: &TraceHash) -> Result<()> {
        Self::remove_file_if_exists(&self.seed_path(trace_hash))
    }

    fn seed_hashes(&self) -> Result<Vec<TraceHash>> {
        Ok(Self::json_stems(&self.root.join(SEEDS_DIR))?
            .into_iter()
            .filter_map(|stem| TraceHash::from_hex(stem).ok())
            .collect())
    }

    fn touch(&self, kind: UsageKind, key: &str, at: DateTime<Utc>) -> Result<()> {
        let path = self.usage_path(kind, key)?;
        Self::write_json_atomic(&path, &UsageEntry { last_referenced: at })
    }

    fn last_referenced(&self, kind: UsageKind, key: &str) -> Result<Option<DateTime<Utc>>> {
        let path = self.usage_path(kind, key)?;
        Ok(Self::read_json::<UsageEntry>(&path)?.map(|entry| entry.last_referenced))
    }

    fn forget(&self, kind: UsageKind, key: &str) -> Result<()> {
        Self::remove_file_if_exists(&self.usage_path(kind, key)?)
    }

    fn clear(&self) -> Result<()> {
        for dir in [PACKETS_DIR, SEEDS_DIR, USAGE_DIR] {
            let path = self.root.join(dir);
            Self::remove_dir_if_exists(&path)?;
        }
        for dir in [
            self.root.join(PACKETS_DIR),
            self.root.join(SEEDS_DIR),
            self.usage_dir(UsageKind::Record),
            self.usage_dir(UsageKind::Seed),
        ] {
            fs::create_dir_all(&dir).map_err(|e| Error::io(e, &dir, "create_dir"))?;
        }
        tracing::info!(root = %self.root.display(), "Cleared cache backend");
        Ok(())
    }
}
