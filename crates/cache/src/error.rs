//! Error types for the call cache

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for call cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error against the persistence backend
    #[error("I/O {operation} failed: {}", path.display())]
    #[diagnostic(
        code(calltape::cache::io),
        help("Check that the cache directory exists and is writable")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error
        path: Box<Path>,
        /// Operation that failed (e.g., "read", "write", "rename")
        operation: String,
    },

    /// Configuration error
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(calltape::cache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Malformed identifier or input
    #[error("Validation error: {message}")]
    #[diagnostic(code(calltape::cache::validation))]
    Validation {
        /// Error message describing what failed validation
        message: String,
    },

    /// A value could not be deep-serialized
    #[error("Cannot encode value: {message}")]
    #[diagnostic(
        code(calltape::cache::encoding),
        help("Sockets, file handles and other native resources cannot be recorded")
    )]
    Encoding {
        /// Description of the value that failed to encode
        message: String,
    },

    /// Stored data could not be (de)serialized
    #[error("Serialization error: {message}")]
    #[diagnostic(code(calltape::cache::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// Record not found
    #[error("Call record not found: {fingerprint}")]
    #[diagnostic(
        code(calltape::cache::not_found),
        help("The record may have been recached, purged or never recorded")
    )]
    NotFound {
        /// The fingerprint that was not found
        fingerprint: String,
    },
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a validation error
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an encoding error
    #[must_use]
    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: path.as_ref().into(),
            operation: operation.into(),
        }
    }

    /// Create a not found error
    #[must_use]
    pub fn not_found(fingerprint: impl Into<String>) -> Self {
        Self::NotFound {
            fingerprint: fingerprint.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }
}

/// Result type for call cache operations
pub type Result<T> = std::result::Result<T, Error>;
