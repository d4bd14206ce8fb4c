use std::{fmt::Display, time::Duration};

use crate::config::RunConfig;

const MIB: f64 = 1024.0 * 1024.0;

/// Rates of one thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaneRate {
    pub lane: usize,
    /// Millions of messages per second.
    pub msg_rate: f64,
    /// MiB per second.
    pub bandwidth: f64,
}

/// Per-thread and aggregate throughput of a run.
///
/// Each thread is an independent stream to its peer thread, so the totals
/// are sums, not means.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub message_size: usize,
    pub num_threads: usize,
    pub lanes: Vec<LaneRate>,
    pub total_msg_rate: f64,
    pub total_bandwidth: f64,
}

impl Report {
    pub fn new(config: &RunConfig, elapsed: &[Duration]) -> Self {
        let messages = config.num_messages() as f64;
        let bytes = config.message_size() as f64 * messages;

        let lanes: Vec<LaneRate> = elapsed
            .iter()
            .enumerate()
            .map(|(lane, elapsed)| {
                // Clamp so a degenerate timer reading cannot print inf.
                let secs = elapsed.max(&Duration::from_nanos(1)).as_secs_f64();
                LaneRate {
                    lane,
                    msg_rate: messages / secs / 1e6,
                    bandwidth: bytes / MIB / secs,
                }
            })
            .collect();

        Self {
            message_size: config.message_size(),
            num_threads: config.num_threads(),
            total_msg_rate: lanes.iter().map(|rate| rate.msg_rate).sum(),
            total_bandwidth: lanes.iter().map(|rate| rate.bandwidth).sum(),
            lanes,
        }
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:<10}\t{:<10}\t{:<10}", "Thread", "Mmsgs/s", "MB/s")?;
        for rate in &self.lanes {
            writeln!(
                f,
                "{:<10}\t{:<10.2}\t{:<10.2}",
                rate.lane, rate.msg_rate, rate.bandwidth
            )?;
        }

        writeln!(f)?;
        writeln!(
            f,
            "{:<10}\t{:<10}\t{:<10}\t{:<10}",
            "Size", "Threads", "Mmsgs/s", "MB/s"
        )?;
        writeln!(
            f,
            "{:<10}\t{:<10}\t{:.6}\t{:.6}",
            self.message_size, self.num_threads, self.total_msg_rate, self.total_bandwidth
        )
    }
}
