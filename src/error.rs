//! # Error Taxonomy
//!
//! All fallible operations in this crate return `eyre::Result` with context
//! attached at each layer. The typed kernel below classifies the failures a
//! caller must be able to discriminate programmatically; everything else is
//! plain context on the report chain.
//!
//! The one contract that depends on typing is recovery: `open()` on an
//! unclean store fails with [`StoreError::InvalidData`], and the caller is
//! expected to run `recovery()` before retrying. Use
//! [`StoreError::classify`] to test a report for that case.

use thiserror::Error;

/// Typed failure kernel carried inside `eyre::Report` chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Operation issued against a closed or never-opened component.
    #[error("store is closed or was never opened")]
    InvalidState,

    /// Metadata magic or parameter mismatch on open; the store needs
    /// recovery before it can be used.
    #[error("metadata record is invalid or does not match the configured parameters")]
    InvalidData,

    /// A block failed node deserialization. Recoverable locally: scans mark
    /// the block free and continue.
    #[error("block does not hold a valid serialized node")]
    InvalidNode,

    /// Underlying file operation failed after retable context was attached.
    #[error("file operation failed")]
    Io,
}

impl StoreError {
    /// Extract the typed kernel from a report, if one is present anywhere
    /// in its context chain.
    pub fn classify(report: &eyre::Report) -> Option<StoreError> {
        report.downcast_ref::<StoreError>().copied()
    }
}
