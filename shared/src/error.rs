use std::io;

use thiserror::Error;

use crate::fabric::Threading;

/// Problems with the requested run parameters. Raised before any
/// communication is set up.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("thread count must be at least 1")]
    ZeroThreads,

    #[error("window size must be at least 1")]
    ZeroWindow,

    #[error("message size must be at least 1 byte")]
    ZeroMessageSize,

    #[error(
        "{requested} messages cannot fill one window of {window_size} for each of {threads} threads"
    )]
    TooFewMessages {
        requested: usize,
        threads: usize,
        window_size: usize,
    },

    #[error("a region of {threads} slots of {message_size} bytes does not fit in memory")]
    RegionTooLarge { message_size: usize, threads: usize },
}

/// Every failure the benchmark can hit. None of them is retried: a partial
/// run produces no meaningful numbers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BenchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("run with exactly two processes, got {0}")]
    WorldSize(usize),

    #[error("rank {rank} is outside a world of {size} processes")]
    InvalidRank { rank: usize, size: usize },

    #[error("concurrent transfers need multi-threaded support from the transport, got {0:?}")]
    ThreadSupport(Threading),

    #[error("failed to allocate {len} bytes aligned to {align}")]
    Alloc { len: usize, align: usize },

    #[error("mapped memory at {addr:#x} is not aligned to {align}")]
    Misaligned { addr: usize, align: usize },

    #[error("lane {lane} is out of range for a handle with {lanes} lanes")]
    InvalidLane { lane: usize, lanes: usize },

    #[error("put of {len} bytes at offset {offset} leaves the slot of lane {lane}")]
    OutsideLaneSlot {
        lane: usize,
        offset: usize,
        len: usize,
    },

    #[error("put of {len} bytes at offset {offset} overruns a remote region of {region_len} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        region_len: usize,
    },

    #[error("remote region holds {actual} bytes, expected at least {expected}")]
    RegionTooSmall { expected: usize, actual: usize },

    #[error("this handle does not target a remote region")]
    NoRemoteRegion,

    #[error("region is still targeted by {0} peer handle(s)")]
    RegionInUse(usize),

    #[error("no shared access epoch is open on this handle")]
    NoAccessEpoch,

    #[error("a shared access epoch is already open on this handle")]
    AccessEpochOpen,

    #[error("timing slot {0} was written twice")]
    TimingSlotReused(usize),

    #[error("timing slot {0} was never written")]
    MissingTiming(usize),

    #[error("a sibling thread failed and aborted the run")]
    Aborted,

    #[error("a peer process aborted the run")]
    PeerAborted,

    #[error("session {0} is already in use")]
    SessionInUse(String),

    #[error("timed out waiting to join session {0}")]
    ConnectTimeout(String),

    #[error("shared memory: {0}")]
    Shmem(#[from] shared_memory::ShmemError),

    #[cfg(feature = "verbs")]
    #[error(transparent)]
    Rdma(#[from] crate::rdma_controller::RdmaError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BenchError {
    /// Whether this error only reports that some other failure stopped the
    /// run. Such errors are never the root cause.
    pub fn is_secondary(&self) -> bool {
        matches!(self, BenchError::Aborted | BenchError::PeerAborted)
    }
}

pub type Result<T> = std::result::Result<T, BenchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_errors_are_secondary() {
        assert!(BenchError::Aborted.is_secondary());
        assert!(BenchError::PeerAborted.is_secondary());
        assert!(!BenchError::WorldSize(3).is_secondary());
    }

    #[test]
    fn config_error_converts() {
        let err: BenchError = ConfigError::ZeroThreads.into();
        assert_eq!(err.to_string(), "thread count must be at least 1");
    }
}
