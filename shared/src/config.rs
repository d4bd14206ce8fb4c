use std::ops::Range;

use crate::error::ConfigError;

pub const DEFAULT_THREADS: usize = 1;
pub const DEFAULT_WINDOW_SIZE: usize = 64;
pub const DEFAULT_MESSAGE_SIZE: usize = 8;
pub const DEFAULT_NUM_MESSAGES: usize = 640_000;
pub const LARGE_MESSAGE_THRESHOLD: usize = 16_384;
pub const DEFAULT_LARGE_NUM_MESSAGES: usize = 64_000;

/// Run parameters as the user gave them, before validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchParams {
    pub threads: usize,
    pub window_size: usize,
    /// `None` when the message count was not given explicitly.
    pub num_messages: Option<usize>,
    pub message_size: usize,
}

impl Default for BenchParams {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            window_size: DEFAULT_WINDOW_SIZE,
            num_messages: None,
            message_size: DEFAULT_MESSAGE_SIZE,
        }
    }
}

impl BenchParams {
    /// Total message count before window rounding. Large messages get a
    /// smaller default; an explicit count always wins.
    pub fn requested_messages(&self) -> usize {
        match self.num_messages {
            Some(count) => count,
            None if self.message_size > LARGE_MESSAGE_THRESHOLD => DEFAULT_LARGE_NUM_MESSAGES,
            None => DEFAULT_NUM_MESSAGES,
        }
    }
}

/// Immutable, validated run configuration shared by every thread of a
/// process.
///
/// `num_messages` is the per-thread count, normalised to
/// `window_size * floor(requested / threads / window_size)` so every thread
/// runs whole windows only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    num_threads: usize,
    window_size: usize,
    message_size: usize,
    requested_messages: usize,
    num_messages: usize,
    region_len: usize,
}

impl RunConfig {
    pub fn new(params: BenchParams) -> Result<Self, ConfigError> {
        if params.threads == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        if params.window_size == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if params.message_size == 0 {
            return Err(ConfigError::ZeroMessageSize);
        }

        let requested_messages = params.requested_messages();
        let num_messages =
            params.window_size * (requested_messages / params.threads / params.window_size);

        if num_messages == 0 {
            return Err(ConfigError::TooFewMessages {
                requested: requested_messages,
                threads: params.threads,
                window_size: params.window_size,
            });
        }

        let region_len = params.message_size.checked_mul(params.threads).ok_or(
            ConfigError::RegionTooLarge {
                message_size: params.message_size,
                threads: params.threads,
            },
        )?;

        Ok(Self {
            num_threads: params.threads,
            window_size: params.window_size,
            message_size: params.message_size,
            requested_messages,
            num_messages,
            region_len,
        })
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn message_size(&self) -> usize {
        self.message_size
    }

    /// Messages each thread puts per phase.
    pub fn num_messages(&self) -> usize {
        self.num_messages
    }

    pub fn requested_messages(&self) -> usize {
        self.requested_messages
    }

    /// Windows each thread runs per phase.
    pub fn windows(&self) -> usize {
        self.num_messages / self.window_size
    }

    /// Bytes the sink exposes: one slot per source thread.
    pub fn region_len(&self) -> usize {
        self.region_len
    }

    pub fn target_offset(&self, lane: usize) -> usize {
        lane * self.message_size
    }

    /// Byte range of the sink region that belongs to `lane`.
    pub fn slot(&self, lane: usize) -> Range<usize> {
        let start = self.target_offset(lane);
        start..start + self.message_size
    }

    /// Whether rounding to whole windows dropped messages, which skews the
    /// reported numbers.
    pub fn is_truncated(&self) -> bool {
        self.num_messages * self.num_threads != self.requested_messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(threads: usize, num_messages: Option<usize>, message_size: usize) -> BenchParams {
        BenchParams {
            threads,
            num_messages,
            message_size,
            ..BenchParams::default()
        }
    }

    #[test]
    fn rounds_down_to_whole_windows() {
        let config = RunConfig::new(params(1, Some(100), 8)).unwrap();
        assert_eq!(config.num_messages(), 64);
        assert_eq!(config.windows(), 1);
        assert!(config.is_truncated());
    }

    #[test]
    fn divides_across_threads() {
        let config = RunConfig::new(params(2, Some(128), 8)).unwrap();
        assert_eq!(config.num_messages(), 64);
        assert!(!config.is_truncated());

        let config = RunConfig::new(params(3, None, 8)).unwrap();
        assert_eq!(config.num_messages(), 64 * (640_000 / 3 / 64));
        assert_eq!(config.num_messages() % config.window_size(), 0);
    }

    #[test]
    fn rounding_law_holds_for_many_inputs() {
        for threads in 1..=8 {
            for window_size in [1, 7, 64, 100] {
                for requested in [window_size * threads, 1_000, 4_321, 640_000] {
                    let Ok(config) = RunConfig::new(BenchParams {
                        threads,
                        window_size,
                        num_messages: Some(requested),
                        message_size: 8,
                    }) else {
                        continue;
                    };
                    assert_eq!(
                        config.num_messages(),
                        window_size * (requested / threads / window_size)
                    );
                    assert_eq!(config.windows() * window_size, config.num_messages());
                }
            }
        }
    }

    #[test]
    fn large_messages_use_smaller_default() {
        assert_eq!(params(1, None, LARGE_MESSAGE_THRESHOLD).requested_messages(), 640_000);
        assert_eq!(params(1, None, LARGE_MESSAGE_THRESHOLD + 1).requested_messages(), 64_000);
    }

    #[test]
    fn explicit_count_wins_over_large_default() {
        assert_eq!(params(1, Some(1_280), 65_536).requested_messages(), 1_280);
        assert_eq!(
            params(1, Some(DEFAULT_NUM_MESSAGES), 65_536).requested_messages(),
            DEFAULT_NUM_MESSAGES
        );
    }

    #[test]
    fn slots_are_disjoint() {
        let config = RunConfig::new(params(16, None, 24)).unwrap();
        for a in 0..16 {
            assert_eq!(config.target_offset(a), a * 24);
            for b in (a + 1)..16 {
                let (sa, sb) = (config.slot(a), config.slot(b));
                assert!(sa.end <= sb.start || sb.end <= sa.start);
            }
        }
        assert_eq!(config.slot(15).end, config.region_len());
    }

    #[test]
    fn rejects_degenerate_parameters() {
        assert_eq!(RunConfig::new(params(0, None, 8)), Err(ConfigError::ZeroThreads));
        assert_eq!(RunConfig::new(params(1, None, 0)), Err(ConfigError::ZeroMessageSize));
        assert_eq!(
            RunConfig::new(BenchParams {
                window_size: 0,
                ..BenchParams::default()
            }),
            Err(ConfigError::ZeroWindow)
        );
        assert_eq!(
            RunConfig::new(params(2, Some(100), 8)),
            Err(ConfigError::TooFewMessages {
                requested: 100,
                threads: 2,
                window_size: 64
            })
        );
        assert!(matches!(
            RunConfig::new(params(2, None, usize::MAX)),
            Err(ConfigError::RegionTooLarge { .. })
        ));
    }
}
