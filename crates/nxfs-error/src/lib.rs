#![forbid(unsafe_code)]
//! Error types for NXFS.
//!
//! # Error Taxonomy
//!
//! NXFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `nxfs-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `NxError` | `nxfs-error` (this crate) | User-facing errors for CLI and API consumers |
//!
//! ## Mapping Policy: ParseError → NxError
//!
//! `nxfs-error` is intentionally independent of `nxfs-types` and
//! `nxfs-ondisk` to avoid cyclic dependencies. The conversion from
//! `ParseError` to `NxError` happens at the crate boundaries that know the
//! physical context:
//!
//! | Situation | NxError variant | Rationale |
//! |-----------|-----------------|-----------|
//! | Parse failure while reading live metadata | `Corruption { block, detail }` | The block address enables diagnostics |
//! | Wrong magic during container probe | `Format` | Wrong filesystem type, not corruption |
//! | Recognized-but-unsupported incompat bit | `IncompatibleFeature` | "Not supported" is distinct from "broken" |
//! | Block size / geometry out of range | `InvalidGeometry` | Structurally invalid mount parameters |
//!
//! ## Outcome classes
//!
//! - **Corruption** (checksum mismatch, malformed node layout) is always
//!   fatal to the traversal that hit it and is never silently patched.
//! - **NotFound** is a normal outcome: resolution APIs return `Option` for
//!   the expected-miss cases (tombstones, sparse volume slots) and use the
//!   `NotFound` variant only where the caller named something that must
//!   exist.
//! - **Stale checkpoint candidates** are recovered inside the locator by
//!   falling back to an older generation; only ring exhaustion surfaces,
//!   as `NoValidCheckpoint`.
//! - No component retries a failed checksum against the same bytes.

use thiserror::Error;

/// Unified error type for all NXFS operations.
///
/// Internal crate-specific errors (e.g., `ParseError` from `nxfs-types`)
/// are converted into `NxError` at crate boundaries.
#[derive(Debug, Error)]
pub enum NxError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption detected at a known block.
    ///
    /// Used when a checksum fails or a parsed structure is internally
    /// inconsistent. The `block` field carries the failing physical
    /// address for diagnostics.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Invalid on-disk format (wrong magic, not a container image).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without a block address.
    ///
    /// Prefer `Corruption` when the physical location is known.
    #[error("parse error: {0}")]
    Parse(String),

    /// The container or volume uses a feature this build does not support.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Recognized incompatible-feature bits that this engine cannot honor.
    ///
    /// Reported at mount time, before any tree traversal is attempted.
    #[error("incompatible feature set: {0}")]
    IncompatibleFeature(String),

    /// On-disk geometry is invalid or out of the supported range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// A named object that must exist was absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Every checkpoint candidate in the descriptor ring failed validation.
    #[error("no valid checkpoint in descriptor ring ({candidates} candidates examined)")]
    NoValidCheckpoint { candidates: usize },
}

/// Result alias using `NxError`.
pub type Result<T> = std::result::Result<T, NxError>;

impl NxError {
    /// Whether this error represents a normal miss rather than damage.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether this error indicates on-disk damage (vs. a usage or
    /// support problem).
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}
