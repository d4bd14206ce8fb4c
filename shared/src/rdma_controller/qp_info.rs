use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// What the peer needs to connect its queue pair to one of ours.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct LaneInfo {
    pub qpn: u32,
    pub psn: u32,
    pub lid: u16,
    pub _reserved: u16,
    pub gid: [u8; 16],
}

impl LaneInfo {
    pub fn has_gid(&self) -> bool {
        self.gid.iter().any(|&byte| byte != 0)
    }
}

/// The sink's exposed region as the source addresses it.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct RegionInfo {
    pub addr: u64,
    pub len: u64,
    pub rkey: u32,
    pub _reserved: u32,
}
