use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use rma_shared::{command_line::BenchArgs, fabric::shm::ShmConfig};

#[cfg(feature = "verbs")]
use std::net::IpAddr;

#[cfg(feature = "verbs")]
use rma_shared::rdma_controller::config::{VerbsConfig, DEFAULT_IB_PORT, DEFAULT_TCP_PORT};

/// Multi-threaded one-sided put message rate benchmark.
///
/// Start one process per rank: rank 0 is the source and prints the
/// results, rank 1 is the sink, e.g.
/// `rma_host -T 4 shm --rank 0 & rma_host -T 4 shm --rank 1`.
#[derive(Parser, Debug)]
#[command(version, about, long_about)]
pub struct GlobalArgs {
    #[command(flatten)]
    pub bench: BenchArgs,
    #[command(subcommand)]
    pub transport: Transport,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Transport {
    /// Processes on one host over POSIX shared memory
    Shm(ShmArgs),
    /// Two hosts over InfiniBand or RoCE
    #[cfg(feature = "verbs")]
    Verbs(VerbsArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ShmArgs {
    #[arg(short, long)]
    pub rank: usize,
    /// Name shared by all processes of one run
    #[arg(short, long, default_value = "rma-bench")]
    pub session: String,
    #[arg(short, long, default_value_t = 2)]
    pub world_size: usize,
    /// Seconds to wait for the other processes
    #[arg(short, long, default_value_t = 30)]
    pub connect_timeout: u64,
}

impl From<ShmArgs> for ShmConfig {
    fn from(args: ShmArgs) -> Self {
        Self {
            session: args.session,
            rank: args.rank,
            world_size: args.world_size,
            connect_timeout: Duration::from_secs(args.connect_timeout),
        }
    }
}

#[cfg(feature = "verbs")]
#[derive(Args, Debug, Clone)]
pub struct VerbsArgs {
    #[arg(short, long)]
    pub rank: usize,
    /// Device name; the first device found when unset
    #[arg(short, long)]
    pub dev: Option<String>,
    #[arg(short, long, default_value_t = DEFAULT_IB_PORT)]
    pub ib_port: u8,
    /// Required on RoCE
    #[arg(short, long)]
    pub gid_index: Option<i32>,
    /// Address of the sink, used by the source
    #[arg(long, default_value = "127.0.0.1")]
    pub peer: IpAddr,
    /// TCP port of the bootstrap connection
    #[arg(short, long, default_value_t = DEFAULT_TCP_PORT)]
    pub port: u16,
    /// Seconds to wait for the peer
    #[arg(short, long, default_value_t = 30)]
    pub connect_timeout: u64,
}

#[cfg(feature = "verbs")]
impl From<VerbsArgs> for VerbsConfig {
    fn from(args: VerbsArgs) -> Self {
        Self {
            rank: args.rank,
            dev_name: args.dev,
            ib_port: args.ib_port,
            gid_index: args.gid_index,
            peer: args.peer,
            tcp_port: args.port,
            connect_timeout: Duration::from_secs(args.connect_timeout),
        }
    }
}
