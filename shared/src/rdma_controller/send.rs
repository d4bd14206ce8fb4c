use std::{io, mem::zeroed, ptr::null_mut};

use rdma_sys::*;

use super::queue_pair::QueuePair;

/// Local side of a write: registered bytes, or nothing for a zero-length
/// write.
#[derive(Debug, Clone, Copy)]
pub struct LocalSlice {
    pub addr: u64,
    pub len: u32,
    pub lkey: u32,
}

impl QueuePair {
    /// Posts one RDMA WRITE of `local` to `remote_addr`.
    ///
    /// # Safety
    ///
    /// `local` must lie in a registration that stays alive until the write
    /// completes, and `remote_addr..remote_addr + len` in a remote
    /// registration keyed by `rkey`.
    pub unsafe fn post_write(
        &self,
        wr_id: u64,
        local: Option<LocalSlice>,
        remote_addr: u64,
        rkey: u32,
        send_flags: u32,
    ) -> io::Result<()> {
        let mut bad_send_wr = null_mut();

        let mut list = local.map(|local| ibv_sge {
            addr: local.addr,
            length: local.len,
            lkey: local.lkey,
        });

        let (sg_list, num_sge) = match list.as_mut() {
            Some(sge) => (sge as *mut ibv_sge, 1),
            None => (null_mut(), 0),
        };

        let mut send_wr = ibv_send_wr {
            wr_id,
            sg_list,
            num_sge,
            opcode: ibv_wr_opcode::IBV_WR_RDMA_WRITE,
            send_flags,
            ..zeroed()
        };
        send_wr.wr.rdma.remote_addr = remote_addr;
        send_wr.wr.rdma.rkey = rkey;

        let errno = ibv_post_send(self.qp.as_ptr(), &mut send_wr, &mut bad_send_wr);

        if errno != 0 {
            return Err(io::Error::from_raw_os_error(errno));
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct SendFlagBuilder {
    flags: u32,
}

impl SendFlagBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signaled(mut self) -> Self {
        self.flags |= ibv_send_flags::IBV_SEND_SIGNALED.0;
        self
    }

    pub fn build(self) -> u32 {
        self.flags
    }
}
