//! Fixed-length digests identifying calls and call sites

use crate::canonical::{canonicalize_entries, canonicalize_positional};
use crate::value::Value;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Digest length in bytes (160 bits)
pub const DIGEST_LEN: usize = 20;

fn digest_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(&digest[..DIGEST_LEN])
}

fn validate_hex(s: &str, what: &str) -> Result<()> {
    if s.len() != DIGEST_LEN * 2 {
        return Err(Error::validation(format!(
            "{what} must be {} hex characters, got {}",
            DIGEST_LEN * 2,
            s.len()
        )));
    }
    if !s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
        return Err(Error::validation(format!(
            "{what} must contain only lowercase hex digits"
        )));
    }
    Ok(())
}

/// Primary key of a call record
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Digest arbitrary bytes into a fingerprint
    #[must_use]
    pub fn from_data(data: &[u8]) -> Self {
        Self(digest_hex(data))
    }

    /// Fingerprint one disambiguated invocation
    ///
    /// `sequence` comes from the call-site counter so that repeated identical
    /// calls at the same site receive distinct fingerprints.
    ///
    /// Positional arguments keep their order: `f(1, 2)` and `f(2, 1)` hash
    /// differently. Only containers nested inside an argument and the keyword
    /// arguments are order-invariant.
    #[must_use]
    pub fn for_call(
        call_site: &str,
        sequence: u64,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
    ) -> Self {
        let to_hash = format!(
            "{}\n{}\n{}\n{}\n",
            canonicalize_positional(args),
            sequence,
            canonicalize_entries(kwargs),
            call_site
        );
        Self::from_data(to_hash.as_bytes())
    }

    /// Parse a fingerprint from its hex form
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not 40 lowercase hex characters
    pub fn from_hex(hex: impl Into<String>) -> Result<Self> {
        let s = hex.into();
        validate_hex(&s, "Fingerprint")?;
        Ok(Self(s))
    }

    /// Hex representation
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::from_hex(value)
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

/// Digest of a call-site identifier, keying trace seeds and counters
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TraceHash(String);

impl TraceHash {
    /// Hash a call-site identifier
    #[must_use]
    pub fn of(trace: &str) -> Self {
        Self(digest_hex(trace.as_bytes()))
    }

    /// Parse a trace hash from its hex form
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not 40 lowercase hex characters
    pub fn from_hex(hex: impl Into<String>) -> Result<Self> {
        let s = hex.into();
        validate_hex(&s, "TraceHash")?;
        Ok(Self(s))
    }

    /// Hex representation
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TraceHash {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::from_hex(value)
    }
}

impl From<TraceHash> for String {
    fn from(value: TraceHash) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kwargs(entries: &[(&str, i64)]) -> BTreeMap<String, Value> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), Value::Int(*v)))
            .collect()
    }

    #[test]
    fn test_fingerprint_is_160_bits() {
        let fp = Fingerprint::from_data(b"adsf");
        assert_eq!(fp.as_hex().len(), 40);
        assert!(Fingerprint::from_hex(fp.as_hex()).is_ok());
    }

    #[test]
    fn test_for_call_is_deterministic() {
        let args = vec![Value::Int(1), Value::Int(2), Value::Int(3)];
        let a = Fingerprint::for_call("S", 7, &args, &BTreeMap::new());
        let b = Fingerprint::for_call("S", 7, &args, &BTreeMap::new());
        assert_eq!(a, b);
    }

    #[test]
    fn test_sequence_changes_fingerprint() {
        let args = vec![Value::Int(1), Value::Int(2), Value::Int(3)];
        let first = Fingerprint::for_call("S", 7, &args, &BTreeMap::new());
        let second = Fingerprint::for_call("S", 8, &args, &BTreeMap::new());
        assert_ne!(first, second);
    }

    #[test]
    fn test_call_site_changes_fingerprint() {
        let args = vec![Value::Int(1)];
        let a = Fingerprint::for_call("site-a", 1, &args, &BTreeMap::new());
        let b = Fingerprint::for_call("site-b", 1, &args, &BTreeMap::new());
        assert_ne!(a, b);
    }

    #[test]
    fn test_positional_order_matters() {
        let (one, two) = (Value::Int(1), Value::Int(2));
        let forward = Fingerprint::for_call("S", 1, &[one.clone(), two.clone()], &kwargs(&[]));
        let swapped = Fingerprint::for_call("S", 1, &[two, one], &kwargs(&[]));
        assert_ne!(forward, swapped);
    }

    #[test]
    fn test_kwargs_order_irrelevant_but_values_matter() {
        let a = Fingerprint::for_call("S", 1, &[], &kwargs(&[("x", 1), ("y", 2)]));
        let b = Fingerprint::for_call("S", 1, &[], &kwargs(&[("y", 2), ("x", 1)]));
        let c = Fingerprint::for_call("S", 1, &[], &kwargs(&[("x", 1), ("y", 3)]));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(Fingerprint::from_hex("abc").is_err());
        assert!(Fingerprint::from_hex("z".repeat(40)).is_err());
        assert!(Fingerprint::from_hex("A".repeat(40)).is_err());
        assert!(TraceHash::from_hex("0".repeat(41)).is_err());
    }

    #[test]
    fn test_serde_validates() {
        let fp = Fingerprint::from_data(b"x");
        let json = serde_json::to_string(&fp).unwrap();
        let parsed: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, fp);
        assert!(serde_json::from_str::<Fingerprint>("\"nothex\"").is_err());
    }

    #[test]
    fn test_trace_hash_stable() {
        assert_eq!(TraceHash::of("siteX"), TraceHash::of("siteX"));
        assert_ne!(TraceHash::of("siteX"), TraceHash::of("siteY"));
    }
}
