use std::{net::IpAddr, time::Duration};

pub const DEFAULT_IB_PORT: u8 = 1;
pub const DEFAULT_TCP_PORT: u16 = 18515;

#[derive(Debug, Clone)]
pub struct VerbsConfig {
    pub rank: usize,
    /// First device in the list when unset.
    pub dev_name: Option<String>,
    pub ib_port: u8,
    /// Needed on RoCE, where addressing goes through the GID table.
    pub gid_index: Option<i32>,
    /// Where the sink listens. Only the source uses it.
    pub peer: IpAddr,
    pub tcp_port: u16,
    pub connect_timeout: Duration,
}
