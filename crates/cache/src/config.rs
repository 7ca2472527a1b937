//! Cache configuration and cache directory resolution

use crate::backend::FlatFileBackend;
use crate::lifecycle::CallCache;
use crate::record::{DEFAULT_PACKET_CAPACITY, MIN_PACKET_CAPACITY};
use crate::snapshot::{DEFAULT_MAX_DEPTH, MAX_DEPTH_LIMIT};
use crate::{Error, Result};
use dirs::{cache_dir, home_dir};
use std::path::PathBuf;

/// Environment variable switching recording on or off
pub const ENV_ENABLED: &str = "CALLTAPE_ENABLED";
/// Environment variable overriding the cache directory
pub const ENV_CACHE_DIR: &str = "CALLTAPE_CACHE_DIR";
/// Environment variable overriding the packet capacity
pub const ENV_PACKET_CAPACITY: &str = "CALLTAPE_PACKET_CAPACITY";
/// Environment variable overriding the snapshot depth bound
pub const ENV_MAX_DEPTH: &str = "CALLTAPE_MAX_DEPTH";

/// Settings for opening a call cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Whether calls are recorded and replayed at all
    pub enabled: bool,
    /// Explicit cache directory; resolved automatically when `None`
    pub root: Option<PathBuf>,
    /// Packet capacity in bytes
    pub packet_capacity: usize,
    /// Nesting bound for deep snapshots
    pub max_depth: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: None,
            packet_capacity: DEFAULT_PACKET_CAPACITY,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl CacheConfig {
    /// Read configuration from `CALLTAPE_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if a variable holds an invalid value
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary variable lookup
    ///
    /// # Errors
    ///
    /// Returns an error if a variable holds an invalid value
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|s| !s.trim().is_empty());
        let mut config = Self::default();

        if let Some(raw) = get(ENV_ENABLED) {
            config.enabled = parse_bool(ENV_ENABLED, &raw)?;
        }
        config.root = get(ENV_CACHE_DIR).map(PathBuf::from);
        if let Some(raw) = get(ENV_PACKET_CAPACITY) {
            config.packet_capacity =
                parse_at_least(ENV_PACKET_CAPACITY, &raw, MIN_PACKET_CAPACITY)?;
        }
        if let Some(raw) = get(ENV_MAX_DEPTH) {
            config.max_depth = parse_depth(&raw)?;
        }
        Ok(config)
    }

    /// Override the cache directory
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Directory the cache lives in
    ///
    /// # Errors
    ///
    /// Returns an error if no writable directory can be found
    pub fn resolve_root(&self) -> Result<PathBuf> {
        cache_root_from_inputs(CacheInputs {
            override_dir: self.root.clone(),
            xdg_cache_home: std::env::var("XDG_CACHE_HOME")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            os_cache_dir: cache_dir(),
            home_dir: home_dir(),
            temp_dir: std::env::temp_dir(),
        })
    }

    /// Open a flat-file call cache with these settings
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be resolved or created
    pub fn open(&self) -> Result<CallCache<FlatFileBackend>> {
        let backend = FlatFileBackend::open(self.resolve_root()?)?;
        Ok(CallCache::with_config(backend, self))
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::configuration(format!(
            "{key} must be a boolean, got {raw:?}"
        ))),
    }
}

fn parse_at_least(key: &str, raw: &str, min: usize) -> Result<usize> {
    match raw.trim().parse::<usize>() {
        Ok(n) if n >= min => Ok(n),
        _ => Err(Error::configuration(format!(
            "{key} must be a number of at least {min}, got {raw:?}"
        ))),
    }
}

fn parse_depth(raw: &str) -> Result<usize> {
    match raw.trim().parse::<usize>() {
        Ok(n) if n <= MAX_DEPTH_LIMIT => Ok(n),
        _ => Err(Error::configuration(format!(
            "{ENV_MAX_DEPTH} must be a number up to {MAX_DEPTH_LIMIT}, got {raw:?}"
        ))),
    }
}

/// Inputs for determining the cache directory
#[derive(Debug, Clone)]
struct CacheInputs {
    override_dir: Option<PathBuf>,
    xdg_cache_home: Option<PathBuf>,
    os_cache_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    temp_dir: PathBuf,
}

fn cache_root_from_inputs(inputs: CacheInputs) -> Result<PathBuf> {
    // Resolution order (first writable wins):
    // 1) explicit override (config or CALLTAPE_CACHE_DIR)
    // 2) XDG_CACHE_HOME/calltape
    // 3) OS cache dir/calltape
    // 4) ~/.calltape/cache
    // 5) TMPDIR/calltape/cache
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Some(dir) = inputs.override_dir.filter(|p| !p.as_os_str().is_empty()) {
        candidates.push(dir);
    }
    if let Some(xdg) = inputs.xdg_cache_home {
        candidates.push(xdg.join("calltape"));
    }
    if let Some(os_cache) = inputs.os_cache_dir {
        candidates.push(os_cache.join("calltape"));
    }
    if let Some(home) = inputs.home_dir {
        candidates.push(home.join(".calltape/cache"));
    }
    candidates.push(inputs.temp_dir.join("calltape/cache"));

    for path in candidates {
        if path.starts_with("/homeless-shelter") {
            continue;
        }
        // Existing directories may still be read-only
        if path.exists() {
            let probe = path.join(".write_probe");
            if std::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&probe)
                .is_ok()
            {
                let _ = std::fs::remove_file(&probe);
                return Ok(path);
            }
            tracing::debug!(path = %path.display(), "Cache directory not writable, trying next");
            continue;
        }
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        }
    }
    Err(Error::configuration(
        "Failed to determine a writable cache directory",
    ))
}
