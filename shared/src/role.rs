use std::fmt::Display;

/// What a process does in the benchmark, fixed by its rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Issues puts into the peer's region.
    Source,
    /// Exposes a region and stays passive.
    Sink,
}

impl Role {
    pub fn from_rank(rank: usize) -> Self {
        if rank % 2 == 0 {
            Role::Source
        } else {
            Role::Sink
        }
    }

    pub fn exposes_region(self) -> bool {
        self == Role::Sink
    }
}

/// Ranks are paired as (0, 1), (2, 3), ...
pub fn peer_rank(rank: usize) -> usize {
    rank ^ 1
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Source => write!(f, "source"),
            Role::Sink => write!(f, "sink"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_ranks_are_sources() {
        assert_eq!(Role::from_rank(0), Role::Source);
        assert_eq!(Role::from_rank(1), Role::Sink);
        assert_eq!(Role::from_rank(4), Role::Source);
        assert_eq!(Role::from_rank(7), Role::Sink);
    }

    #[test]
    fn only_sinks_expose_memory() {
        assert!(!Role::Source.exposes_region());
        assert!(Role::Sink.exposes_region());
    }

    #[test]
    fn peers_are_paired() {
        assert_eq!(peer_rank(0), 1);
        assert_eq!(peer_rank(1), 0);
        assert_eq!(peer_rank(2), 3);
    }
}
