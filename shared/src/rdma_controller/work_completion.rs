use std::{fmt::Debug, mem::MaybeUninit};

use rdma_sys::{ibv_poll_cq, ibv_wc, ibv_wc_status};

use super::{queue_pair::CompletionQueue, RdmaError};

const POLL_BATCH: usize = 16;

pub struct WorkCompletion(ibv_wc);

impl WorkCompletion {
    pub fn wr_id(&self) -> u64 {
        self.0.wr_id
    }

    pub fn is_success(&self) -> bool {
        self.0.status == ibv_wc_status::IBV_WC_SUCCESS
    }

    pub fn status(&self) -> u32 {
        self.0.status as u32
    }
}

impl Debug for WorkCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkCompletion")
            .field("wr_id", &self.0.wr_id)
            .field("status", &self.0.status)
            .field("opcode", &self.0.opcode)
            .field("byte_len", &self.0.byte_len)
            .finish()
    }
}

impl From<ibv_wc> for WorkCompletion {
    fn from(wc: ibv_wc) -> Self {
        WorkCompletion(wc)
    }
}

impl CompletionQueue {
    /// Drains up to a batch of completions without blocking.
    pub fn poll(&self) -> Result<Vec<WorkCompletion>, RdmaError> {
        unsafe {
            const WC_INIT: MaybeUninit<ibv_wc> = MaybeUninit::zeroed();

            let mut wc_buffer = [WC_INIT; POLL_BATCH];

            let num_polled = ibv_poll_cq(
                self.cq.as_ptr(),
                POLL_BATCH as i32,
                wc_buffer.as_mut_ptr().cast(),
            );

            if num_polled < 0 {
                return Err(RdmaError::PollCq(num_polled));
            }

            Ok(wc_buffer[..num_polled as usize]
                .iter()
                .map(|wc| WorkCompletion::from(wc.assume_init()))
                .collect())
        }
    }
}
