//! The closed error surface of spec.md §7: `verify()` is the only
//! operation that returns a diagnostic `Result` at all.

use thiserror::Error;

/// The first invariant violation `verify()` found, if any.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error(
        "list out of order: split_key {after:#010x} did not strictly exceed preceding {before:#010x}"
    )]
    OutOfOrder { before: u32, after: u32 },

    #[error("real entry with hash_code {hash_code:#010x} appeared before any bucket dummy")]
    RealEntryBeforeAnyBucket { hash_code: u32 },

    #[error(
        "real entry with hash_code {hash_code:#010x} found under bucket {found_under}, expected bucket {expected}"
    )]
    BucketMismatch {
        hash_code: u32,
        expected: u32,
        found_under: u32,
    },

    #[error("bucket dummy for index {index} was not registered at its directory cell")]
    DummyMissingFromDirectory { index: u32 },
}
