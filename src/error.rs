//! Result codes used at the core boundary (spec §7).
//!
//! Internal plumbing (arena corruption, io during snapshot load/store)
//! still uses `anyhow::Error` the way the teacher's `chunk_store.rs` does;
//! `ChunkError` is reserved for outcomes callers are expected to match on.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("referenced chunk id not in the registry")]
    NoChunk,
    #[error("version mismatch; replica is stale")]
    WrongVersion,
    #[error("server returned a different chunk id than asked")]
    WrongChunkId,
    #[error("no source of truth for this chunk exists in the current inventory")]
    ChunkLost,
    #[error("operation already in progress")]
    ChunkBusy,
    #[error("chunk is write-locked or replication-locked")]
    Locked,
    #[error("transient condition, retry later")]
    EAgain,
    #[error("no chunk servers connected at all")]
    NoChunkServers,
    #[error("needed chunk server not currently connected")]
    CsNotPresent,
    #[error("every candidate chunk server refused for space")]
    NoSpace,
    #[error("operation did not complete within the lock timeout")]
    ETimedOut,
    #[error("operation was never attempted")]
    NotDone,
    #[error("invariant violation observed; treat as fatal for this chunk")]
    Mismatch,
}

pub type ChunkResult<T> = Result<T, ChunkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_text_is_stable() {
        assert_eq!(
            ChunkError::NoSpace.to_string(),
            "every candidate chunk server refused for space"
        );
    }
}
