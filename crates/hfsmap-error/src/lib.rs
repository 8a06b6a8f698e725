#![forbid(unsafe_code)]
//! Error types for hfsmap.
//!
//! Two-layer model: `ParseError` (in `hfsmap-types`) covers byte-level
//! format violations detected while decoding on-disk structures; `HpsError`
//! (this crate) is the runtime taxonomy surfaced to the scan engine.
//! This crate is intentionally independent of `hfsmap-types` so the
//! dependency graph stays acyclic; the `ParseError → HpsError` conversion
//! happens at the crate boundaries that see both.
//!
//! Failure severity is positional, not encoded in the type:
//!
//! | Condition | Variant | Effect |
//! |-----------|---------|--------|
//! | node size out of range, `(0,0)` extent before required coverage, cycle guards | `Structure` | fatal to the volume decode |
//! | positioned read shorter than computed | `ShortRead` | fatal to the volume decode |
//! | malformed bytes inside one structure | `Parse` | fatal where raised; catalog record handling recovers per record |
//! | exact-match B-tree lookup miss | `NotFound` | fatal to the lookup |
//!
//! The catalog walk catches any of these per record, and the driver catches
//! any of them per volume, so none of them ever aborts the surrounding scan.

use thiserror::Error;

/// Unified runtime error for all hfsmap operations.
#[derive(Debug, Error)]
pub enum HpsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A positioned read returned fewer bytes than the structure requires.
    ///
    /// Indicates a truncated image or an extent pointing past the end of
    /// the device.
    #[error("short read at offset {offset}: need {needed} bytes, got {actual}")]
    ShortRead {
        offset: u64,
        needed: usize,
        actual: usize,
    },

    /// The volume violates an HFS+ structural invariant.
    ///
    /// Raised for node sizes outside the legal range, terminator extents
    /// reached before a required byte offset is covered with no overflow
    /// source left to consult, and traversal cycle guards.
    #[error("structural violation: {0}")]
    Structure(String),

    /// Parse-layer error surfaced to the caller.
    ///
    /// Carries the string form of a `ParseError` from `hfsmap-types`.
    #[error("parse error: {0}")]
    Parse(String),

    /// An exact-match B-tree lookup found no record for the key.
    #[error("record not found: {0}")]
    NotFound(String),
}

/// Result alias using `HpsError`.
pub type Result<T> = std::result::Result<T, HpsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let short = HpsError::ShortRead {
            offset: 0x400,
            needed: 106,
            actual: 20,
        };
        assert_eq!(
            short.to_string(),
            "short read at offset 1024: need 106 bytes, got 20"
        );

        let structure = HpsError::Structure("node size 17 outside 512..=32768".into());
        assert!(structure.to_string().starts_with("structural violation:"));

        let missing = HpsError::NotFound("extents record 5/data/16".into());
        assert_eq!(missing.to_string(), "record not found: extents record 5/data/16");
    }

    #[test]
    fn io_errors_convert() {
        let err: HpsError = std::io::Error::other("boom").into();
        assert!(matches!(err, HpsError::Io(_)));
    }
}
