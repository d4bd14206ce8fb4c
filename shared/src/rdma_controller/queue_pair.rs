use std::{
    io,
    mem::zeroed,
    ptr::{null_mut, NonNull},
    sync::Arc,
};

use rdma_sys::*;
use tracing::debug;

use super::{qp_info::LaneInfo, Device, RdmaError};

pub struct CompletionQueue {
    pub(super) cq: NonNull<ibv_cq>,
    _device: Arc<Device>,
}

impl CompletionQueue {
    pub fn new(device: &Arc<Device>, depth: usize) -> Result<Self, RdmaError> {
        let cq = unsafe { ibv_create_cq(device.ctx(), depth as i32, null_mut(), null_mut(), 0) };
        let cq = NonNull::new(cq).ok_or_else(|| RdmaError::CreateCq(io::Error::last_os_error()))?;
        Ok(Self {
            cq,
            _device: device.clone(),
        })
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        unsafe {
            ibv_destroy_cq(self.cq.as_ptr());
        }
    }
}

/// A reliable-connected queue pair whose sends complete on `cq`. Must be
/// dropped before its completion queue.
pub struct QueuePair {
    pub(super) qp: NonNull<ibv_qp>,
    device: Arc<Device>,
}

impl QueuePair {
    pub fn new(
        device: &Arc<Device>,
        cq: &CompletionQueue,
        depth: usize,
    ) -> Result<Self, RdmaError> {
        let qp = unsafe {
            let mut qp_init_attr = ibv_qp_init_attr {
                qp_type: ibv_qp_type::IBV_QPT_RC,
                send_cq: cq.cq.as_ptr(),
                recv_cq: cq.cq.as_ptr(),
                cap: ibv_qp_cap {
                    max_send_wr: depth as u32,
                    max_recv_wr: 1,
                    max_send_sge: 1,
                    max_recv_sge: 1,
                    ..zeroed()
                },
                ..zeroed()
            };
            ibv_create_qp(device.pd(), &mut qp_init_attr)
        };
        let qp = NonNull::new(qp).ok_or_else(|| RdmaError::CreateQp(io::Error::last_os_error()))?;

        Ok(Self {
            qp,
            device: device.clone(),
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn local_info(&self) -> LaneInfo {
        LaneInfo {
            // SAFETY: valid until drop.
            qpn: unsafe { self.qp.as_ref().qp_num },
            psn: 0,
            lid: self.device.lid(),
            _reserved: 0,
            gid: self.device.gid(),
        }
    }

    /// Walks the queue pair through INIT, RTR and RTS towards `dest`.
    pub fn connect(&self, dest: &LaneInfo, gid_index: Option<i32>) -> Result<(), RdmaError> {
        unsafe {
            let mut qp_attr = ibv_qp_attr {
                qp_state: ibv_qp_state::IBV_QPS_INIT,
                pkey_index: 0,
                port_num: self.device.port(),
                qp_access_flags: (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                    | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE)
                    .0,
                ..zeroed()
            };

            self.modify(
                &mut qp_attr,
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                    | ibv_qp_attr_mask::IBV_QP_PORT
                    | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS,
                ("RESET", "INIT"),
            )?;

            let mut qp_attr = ibv_qp_attr {
                qp_state: ibv_qp_state::IBV_QPS_RTR,
                path_mtu: self.device.port_attr.active_mtu,
                dest_qp_num: dest.qpn,
                rq_psn: dest.psn,
                max_dest_rd_atomic: 1,
                min_rnr_timer: 12,
                ah_attr: ibv_ah_attr {
                    is_global: 0,
                    dlid: dest.lid,
                    sl: 0,
                    src_path_bits: 0,
                    port_num: self.device.port(),
                    ..zeroed()
                },
                ..zeroed()
            };

            if dest.has_gid() {
                qp_attr.ah_attr.is_global = 1;
                qp_attr.ah_attr.grh.dgid = ibv_gid { raw: dest.gid };
                qp_attr.ah_attr.grh.sgid_index = gid_index.unwrap_or(0) as u8;
                qp_attr.ah_attr.grh.hop_limit = 1;
                qp_attr.ah_attr.grh.traffic_class = 0;
            }

            self.modify(
                &mut qp_attr,
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_AV
                    | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                    | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                    | ibv_qp_attr_mask::IBV_QP_RQ_PSN
                    | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                    | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER,
                ("INIT", "RTR"),
            )?;

            qp_attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
            qp_attr.timeout = 14;
            qp_attr.retry_cnt = 7;
            qp_attr.rnr_retry = 7;
            qp_attr.sq_psn = 0;
            qp_attr.max_rd_atomic = 1;

            self.modify(
                &mut qp_attr,
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                    | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                    | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                    | ibv_qp_attr_mask::IBV_QP_SQ_PSN
                    | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC,
                ("RTR", "RTS"),
            )?;
        }

        debug!(dest_qpn = dest.qpn, dest_lid = dest.lid, "queue pair ready to send");
        Ok(())
    }

    unsafe fn modify(
        &self,
        attr: &mut ibv_qp_attr,
        mask: ibv_qp_attr_mask,
        (from, to): (&'static str, &'static str),
    ) -> Result<(), RdmaError> {
        let ret = ibv_modify_qp(self.qp.as_ptr(), attr, mask.0 as i32);
        if ret != 0 {
            return Err(RdmaError::ModifyQp {
                from,
                to,
                source: io::Error::from_raw_os_error(ret),
            });
        }
        Ok(())
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        unsafe {
            ibv_destroy_qp(self.qp.as_ptr());
        }
    }
}

// SAFETY: verbs objects may be used from any thread; each lane's queues are
// only driven by one thread at a time.
unsafe impl Send for CompletionQueue {}
unsafe impl Send for QueuePair {}
