use clap::Args;

use crate::config::{
    BenchParams, DEFAULT_MESSAGE_SIZE, DEFAULT_THREADS, DEFAULT_WINDOW_SIZE,
};

/// Benchmark options shared by every launcher.
#[derive(Args, Debug, Clone)]
pub struct BenchArgs {
    /// Worker threads per process
    #[arg(short = 'T', long, default_value_t = DEFAULT_THREADS)]
    pub threads: usize,
    /// Puts issued between two flushes
    #[arg(short = 'W', long, default_value_t = DEFAULT_WINDOW_SIZE)]
    pub window_size: usize,
    /// Total messages across all threads [default: 640000, or 64000 above 16384 bytes]
    #[arg(short = 'M', long)]
    pub num_messages: Option<usize>,
    /// Bytes per put
    #[arg(short = 'S', long, default_value_t = DEFAULT_MESSAGE_SIZE)]
    pub message_size: usize,
}

impl From<BenchArgs> for BenchParams {
    fn from(args: BenchArgs) -> Self {
        Self {
            threads: args.threads,
            window_size: args.window_size,
            num_messages: args.num_messages,
            message_size: args.message_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::config::RunConfig;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        bench: BenchArgs,
    }

    fn parse(args: &[&str]) -> RunConfig {
        let cli = Cli::try_parse_from(std::iter::once("bench").chain(args.iter().copied())).unwrap();
        RunConfig::new(cli.bench.into()).unwrap()
    }

    #[test]
    fn defaults() {
        let config = parse(&[]);
        assert_eq!(config.num_threads(), 1);
        assert_eq!(config.window_size(), 64);
        assert_eq!(config.message_size(), 8);
        assert_eq!(config.num_messages(), 640_000);
    }

    #[test]
    fn short_flags() {
        let config = parse(&["-T", "4", "-W", "32", "-M", "1024", "-S", "64"]);
        assert_eq!(config.num_threads(), 4);
        assert_eq!(config.window_size(), 32);
        assert_eq!(config.message_size(), 64);
        assert_eq!(config.num_messages(), 256);
    }

    #[test]
    fn large_messages_lower_the_default_count() {
        let config = parse(&["-S", "65536"]);
        assert_eq!(config.num_messages(), 64_000);
    }

    #[test]
    fn explicit_count_wins_for_large_messages() {
        let config = parse(&["-S", "65536", "-M", "640"]);
        assert_eq!(config.num_messages(), 640);
    }

    #[test]
    fn rejects_malformed_numbers() {
        assert!(Cli::try_parse_from(["bench", "-T", "two"]).is_err());
        assert!(Cli::try_parse_from(["bench", "-S", "-1"]).is_err());
    }
}
