//! CLI Exit Code Registry
//!
//! This is the single source of truth for all CLI exit codes.
//! Exit codes are part of the shell contract; scripts rely on them.
//!
//! # Exit Code Ranges
//!
//! | Range   | Domain           | Description                              |
//! |---------|------------------|------------------------------------------|
//! | 0       | Universal        | Success                                  |
//! | 1       | Universal        | General error (unspecified)              |
//! | 2       | Universal        | CLI usage error (bad args, missing file) |
//! | 3-9     | recon            | Reconciliation-specific codes            |
//!
//! # Adding New Exit Codes
//!
//! 1. Add the constant in the appropriate range
//! 2. Document what triggers it
//! 3. Update the table above
//! 4. Map it in `recon_exit_code` if a `ReconError` can produce it

use reconmatch::ReconError;

// =============================================================================
// Universal (0-2)
// =============================================================================

/// Success - command completed without errors.
pub const EXIT_SUCCESS: u8 = 0;

/// General error - unspecified failure.
/// Avoid using this; prefer a specific error code.
pub const EXIT_ERROR: u8 = 1;

/// Usage error - bad arguments, missing required options.
pub const EXIT_USAGE: u8 = 2;

// =============================================================================
// Recon (3-9)
// =============================================================================

/// Config failed to parse or validate (weights, thresholds, comparators).
pub const EXIT_RECON_INVALID_CONFIG: u8 = 3;

/// Input data unreadable: missing CSV column, bad date or amount, IO error.
pub const EXIT_RECON_INPUT: u8 = 4;

/// Unknown item, source or match.
pub const EXIT_RECON_NOT_FOUND: u8 = 5;

/// Match rejected: already linked, ineligible item, owner or sum mismatch.
pub const EXIT_RECON_CONFLICT: u8 = 6;

/// Bulk run finished but some items failed.
pub const EXIT_RECON_PARTIAL: u8 = 7;

/// Storage or other runtime failure.
pub const EXIT_RECON_RUNTIME: u8 = 9;

/// Map a ReconError to its exit code.
pub fn recon_exit_code(err: &ReconError) -> u8 {
    match err {
        ReconError::ConfigParse(_) | ReconError::Configuration(_) => EXIT_RECON_INVALID_CONFIG,
        ReconError::MissingColumn { .. }
        | ReconError::DateParse { .. }
        | ReconError::AmountParse { .. }
        | ReconError::LengthExceeded { .. }
        | ReconError::Io(_) => EXIT_RECON_INPUT,
        ReconError::NotFound { .. } => EXIT_RECON_NOT_FOUND,
        ReconError::AlreadyLinked { .. }
        | ReconError::AlreadyDeleted { .. }
        | ReconError::CardinalityMismatch { .. }
        | ReconError::InvalidGroup(_)
        | ReconError::OwnerMismatch { .. }
        | ReconError::IneligibleItem { .. }
        | ReconError::StatusConflict { .. } => EXIT_RECON_CONFLICT,
        ReconError::Storage(_) => EXIT_RECON_RUNTIME,
    }
}
