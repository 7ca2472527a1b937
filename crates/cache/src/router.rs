//! Call routing for interception layers
//!
//! An interception layer hands every call to a [`CallRouter`]. Whether calls
//! are recorded is decided once when the router is built.

use crate::backend::{Backend, FlatFileBackend};
use crate::config::CacheConfig;
use crate::lifecycle::CallCache;
use crate::value::Value;
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Routes an intercepted call either straight through or via the cache
pub trait CallRouter {
    /// Perform a call identified by `call_site`
    ///
    /// # Errors
    ///
    /// Returns the thunk's error, or a cache error converted into `E`
    fn invoke<F, E>(
        &mut self,
        call_site: &str,
        method_name: &str,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
        thunk: F,
    ) -> std::result::Result<Value, E>
    where
        F: FnOnce(&[Value], &BTreeMap<String, Value>) -> std::result::Result<Value, E>,
        E: From<Error>;
}

/// Router that always runs the real call
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl CallRouter for PassThrough {
    fn invoke<F, E>(
        &mut self,
        _call_site: &str,
        _method_name: &str,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
        thunk: F,
    ) -> std::result::Result<Value, E>
    where
        F: FnOnce(&[Value], &BTreeMap<String, Value>) -> std::result::Result<Value, E>,
        E: From<Error>,
    {
        thunk(args, kwargs)
    }
}

impl<B: Backend> CallRouter for CallCache<B> {
    fn invoke<F, E>(
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
        self.fetch_or_execute(call_site, method_name, args, kwargs, thunk)
    }
}

/// A router chosen at runtime
#[derive(Debug)]
pub enum Router<B> {
    /// Recording disabled
    PassThrough(PassThrough),
    /// Calls are recorded and replayed
    Recording(CallCache<B>),
}

impl<B: Backend> Router<B> {
    /// Whether calls go through the cache
    #[must_use]
    pub const fn is_recording(&self) -> bool {
        matches!(self, Self::Recording(_))
    }

    /// The cache, when recording
    #[must_use]
    pub const fn cache(&self) -> Option<&CallCache<B>> {
        match self {
            Self::Recording(cache) => Some(cache),
            Self::PassThrough(_) => None,
        }
    }

    /// Mutable access to the cache, when recording
    pub const fn cache_mut(&mut self) -> Option<&mut CallCache<B>> {
        match self {
            Self::Recording(cache) => Some(cache),
            Self::PassThrough(_) => None,
        }
    }
}

impl<B: Backend> CallRouter for Router<B> {
    fn invoke<F, E>(
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
        match self {
            Self::PassThrough(router) => router.invoke(call_site, method_name, args, kwargs, thunk),
            Self::Recording(cache) => cache.invoke(call_site, method_name, args, kwargs, thunk),
        }
    }
}

/// Build a router from configuration
///
/// A disabled configuration never touches the cache directory.
///
/// # Errors
///
/// Returns an error if recording is enabled and the cache cannot be opened
pub fn router_from_config(config: &CacheConfig) -> Result<Router<FlatFileBackend>> {
    if !config.enabled {
        tracing::debug!("Call recording disabled");
        return Ok(Router::PassThrough(PassThrough));
    }
    Ok(Router::Recording(config.open()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use std::cell::Cell;
    use tempfile::TempDir;

    fn double(args: &[Value], _: &BTreeMap<String, Value>) -> Result<Value> {
        match args.first() {
            Some(Value::Int(i)) => Ok(Value::Int(i * 2)),
            _ => Err(Error::validation("expected an integer")),
        }
    }

    #[test]
    fn test_pass_through_always_runs() {
        let calls = Cell::new(0);
        let mut router = PassThrough;
        for _ in 0..2 {
            let out = router
                .invoke("S", "double", &[Value::Int(3)], &BTreeMap::new(), |a, k| {
                    calls.set(calls.get() + 1);
                    double(a, k)
                })
                .unwrap();
            assert_eq!(out, Value::Int(6));
        }
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_recording_router_saves() {
        let mut router = Router::Recording(CallCache::new(MemoryBackend::new()));
        assert!(router.is_recording());
        router
            .invoke("S", "double", &[Value::Int(3)], &BTreeMap::new(), double)
            .unwrap();
        let cache = router.cache().unwrap();
        assert_eq!(cache.store().fingerprints().unwrap().len(), 1);
    }

    #[test]
    fn test_disabled_config_passes_through() {
        let tmp = TempDir::new().unwrap();
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default().with_root(tmp.path().join("unused"))
        };
        let router = router_from_config(&config).unwrap();
        assert!(!router.is_recording());
        assert!(!tmp.path().join("unused").exists());
    }

    #[test]
    fn test_enabled_config_records() {
        let tmp = TempDir::new().unwrap();
        let config = CacheConfig::default().with_root(tmp.path());
        let mut router = router_from_config(&config).unwrap();
        router
            .invoke("S", "double", &[Value::Int(1)], &BTreeMap::new(), double)
            .unwrap();
        assert!(router.cache_mut().unwrap().delete_last_cached().unwrap().is_some());
    }
}
