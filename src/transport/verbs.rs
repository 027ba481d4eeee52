//! libibverbs transport built on `rdma-sys`

use super::{
    AccessFlags, CompletionStatus, Gid, MemoryKeys, Opcode, PathMtu, PortAttributes, RecvRequest,
    Resource, SendRequest, StateTransition, Transport, WorkCompletion,
};
use crate::error::{ProbeError, Result};
use rdma_sys::*;
use std::ffi::CStr;
use std::io;
use std::ptr::{self, NonNull};

fn with_code(ec: i32, context: &'static str) -> ProbeError {
    ProbeError::ResourceFailed {
        context,
        source: io::Error::from_raw_os_error(ec.abs()),
    }
}

/// One device context with its protection domain, completion queue, memory
/// region and RC queue pair.
pub struct VerbsTransport {
    context: Option<NonNull<ibv_context>>,
    pd: Option<NonNull<ibv_pd>>,
    cq: Option<NonNull<ibv_cq>>,
    mr: Option<NonNull<ibv_mr>>,
    qp: Option<NonNull<ibv_qp>>,
}

// SAFETY: verbs objects may be used from any thread; the transport is
// owned by a single endpoint and never shared.
unsafe impl Send for VerbsTransport {}

impl VerbsTransport {
    pub fn new() -> Self {
        Self {
            context: None,
            pd: None,
            cq: None,
            mr: None,
            qp: None,
        }
    }

    fn open_device(name: Option<&str>) -> Result<NonNull<ibv_context>> {
        let mut num_devices = 0;
        let list = unsafe { ibv_get_device_list(&mut num_devices) };
        if list.is_null() {
            return Err(ProbeError::resource("ibv_get_device_list"));
        }
        let devices = unsafe { std::slice::from_raw_parts(list, num_devices.max(0) as usize) };
        let found = devices.iter().copied().find(|&dev| match name {
            Some(name) => {
                let dev_name = unsafe { CStr::from_ptr(ibv_get_device_name(dev)) };
                dev_name.to_str() == Ok(name)
            }
            None => true,
        });
        let context = found.map(|dev| unsafe { ibv_open_device(dev) });
        unsafe { ibv_free_device_list(list) };

        match context {
            None => Err(ProbeError::DeviceNotFound(name.map(str::to_string))),
            Some(ctx) => NonNull::new(ctx).ok_or_else(|| ProbeError::resource("ibv_open_device")),
        }
    }

    fn qp(&self) -> Result<NonNull<ibv_qp>> {
        self.qp.ok_or_else(|| ProbeError::ResourceFailed {
            context: "ibv_qp",
            source: io::Error::new(io::ErrorKind::NotConnected, "queue pair not created"),
        })
    }
}

fn mtu(mtu: PathMtu) -> ibv_mtu::Type {
    match mtu {
        PathMtu::Mtu1024 => ibv_mtu::IBV_MTU_1024,
        PathMtu::Mtu2048 => ibv_mtu::IBV_MTU_2048,
        PathMtu::Mtu4096 => ibv_mtu::IBV_MTU_4096,
    }
}

impl Transport for VerbsTransport {
    fn open(&mut self, device: Option<&str>, port: u8) -> Result<PortAttributes> {
        let context = Self::open_device(device)?;
        self.context = Some(context);

        let mut port_attr: ibv_port_attr = unsafe { std::mem::zeroed() };
        let ec = unsafe { ibv_query_port(context.as_ptr(), port, &mut port_attr) };
        if ec != 0 {
            return Err(ProbeError::PortQueryFailed {
                port,
                source: io::Error::from_raw_os_error(ec.abs()),
            });
        }
        Ok(PortAttributes {
            lid: port_attr.lid,
            active: port_attr.state as u32 == ibv_port_state::IBV_PORT_ACTIVE as u32,
        })
    }

    fn query_gid(&self, port: u8, index: u8) -> Result<Gid> {
        let context = self.context.ok_or(ProbeError::DeviceNotFound(None))?;
        let mut gid: ibv_gid = unsafe { std::mem::zeroed() };
        let ec = unsafe { ibv_query_gid(context.as_ptr(), port, index as i32, &mut gid) };
        if ec != 0 {
            return Err(with_code(ec, "ibv_query_gid"));
        }
        Ok(Gid(unsafe { gid.raw }))
    }

    fn alloc_protection_domain(&mut self) -> Result<()> {
        let context = self.context.ok_or(ProbeError::DeviceNotFound(None))?;
        let pd = unsafe { ibv_alloc_pd(context.as_ptr()) };
        self.pd = Some(NonNull::new(pd).ok_or_else(|| ProbeError::resource("ibv_alloc_pd"))?);
        Ok(())
    }

    fn create_completion_queue(&mut self, depth: u32) -> Result<()> {
        let context = self.context.ok_or(ProbeError::DeviceNotFound(None))?;
        let cq = unsafe {
            ibv_create_cq(
                context.as_ptr(),
                depth as i32,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        };
        self.cq = Some(NonNull::new(cq).ok_or_else(|| ProbeError::resource("ibv_create_cq"))?);
        Ok(())
    }

    unsafe fn register_memory(
        &mut self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<MemoryKeys> {
        let pd = self.pd.ok_or_else(|| ProbeError::resource("ibv_reg_mr"))?;
        let mr = ibv_reg_mr(pd.as_ptr(), addr.cast(), len, access.bits() as i32);
        let mr = NonNull::new(mr).ok_or_else(|| ProbeError::RegistrationFailed {
            len,
            source: io::Error::last_os_error(),
        })?;
        self.mr = Some(mr);
        let mr = mr.as_ref();
        Ok(MemoryKeys {
            lkey: mr.lkey,
            rkey: mr.rkey,
        })
    }

    fn create_queue_pair(&mut self, depth: u32) -> Result<u32> {
        let pd = self.pd.ok_or_else(|| ProbeError::resource("ibv_create_qp"))?;
        let cq = self.cq.ok_or_else(|| ProbeError::resource("ibv_create_qp"))?;
        let mut init_attr: ibv_qp_init_attr = unsafe { std::mem::zeroed() };
        init_attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        init_attr.sq_sig_all = 0;
        init_attr.send_cq = cq.as_ptr();
        init_attr.recv_cq = cq.as_ptr();
        init_attr.cap.max_send_wr = depth;
        init_attr.cap.max_recv_wr = depth;
        init_attr.cap.max_send_sge = 1;
        init_attr.cap.max_recv_sge = 1;

        let qp = unsafe { ibv_create_qp(pd.as_ptr(), &mut init_attr) };
        let qp = NonNull::new(qp).ok_or_else(|| ProbeError::resource("ibv_create_qp"))?;
        self.qp = Some(qp);
        Ok(unsafe { qp.as_ref().qp_num })
    }

    fn modify_queue_pair(&mut self, transition: &StateTransition) -> Result<()> {
        let qp = self.qp()?;
        let mut attr: ibv_qp_attr = unsafe { std::mem::zeroed() };
        let mask = match *transition {
            StateTransition::Init {
                port_num,
                pkey_index,
                access,
            } => {
                attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
                attr.port_num = port_num;
                attr.pkey_index = pkey_index;
                attr.qp_access_flags = access.bits();
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                    | ibv_qp_attr_mask::IBV_QP_PORT
                    | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS
            }
            StateTransition::ReadyToReceive {
                port_num,
                path_mtu,
                dest_qp_num,
                dest_lid,
                rq_psn,
                max_dest_rd_atomic,
                min_rnr_timer,
                global_route,
            } => {
                attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
                attr.path_mtu = mtu(path_mtu);
                attr.dest_qp_num = dest_qp_num;
                attr.rq_psn = rq_psn;
                attr.max_dest_rd_atomic = max_dest_rd_atomic;
                attr.min_rnr_timer = min_rnr_timer;
                attr.ah_attr.dlid = dest_lid;
                attr.ah_attr.sl = 0;
                attr.ah_attr.src_path_bits = 0;
                attr.ah_attr.port_num = port_num;
                if let Some(route) = global_route {
                    attr.ah_attr.is_global = 1;
                    attr.ah_attr.grh.dgid.raw = route.dgid.0;
                    attr.ah_attr.grh.flow_label = route.flow_label;
                    attr.ah_attr.grh.hop_limit = route.hop_limit;
                    attr.ah_attr.grh.sgid_index = route.sgid_index;
                    attr.ah_attr.grh.traffic_class = route.traffic_class;
                }
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_AV
                    | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                    | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                    | ibv_qp_attr_mask::IBV_QP_RQ_PSN
                    | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                    | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER
            }
            StateTransition::ReadyToSend {
                timeout,
                retry_count,
                rnr_retry,
                sq_psn,
                max_rd_atomic,
            } => {
                attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
                attr.timeout = timeout;
                attr.retry_cnt = retry_count;
                attr.rnr_retry = rnr_retry;
                attr.sq_psn = sq_psn;
                attr.max_rd_atomic = max_rd_atomic;
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                    | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                    | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                    | ibv_qp_attr_mask::IBV_QP_SQ_PSN
                    | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC
            }
        };
        let ec = unsafe { ibv_modify_qp(qp.as_ptr(), &mut attr, mask.0 as i32) };
        if ec != 0 {
            return Err(ProbeError::StateTransitionFailed {
                target: transition.target(),
                reason: format!("ibv_modify_qp: {}", io::Error::from_raw_os_error(ec.abs())),
            });
        }
        Ok(())
    }

    fn post_send(&mut self, request: &SendRequest) -> Result<()> {
        let qp = self.qp()?;
        let mut sge = ibv_sge {
            addr: request.local_addr,
            length: request.length,
            lkey: request.lkey,
        };
        let mut wr: ibv_send_wr = unsafe { std::mem::zeroed() };
        wr.wr_id = request.wr_id;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        wr.opcode = match request.opcode {
            Opcode::Send => ibv_wr_opcode::IBV_WR_SEND,
            Opcode::RdmaRead => ibv_wr_opcode::IBV_WR_RDMA_READ,
            Opcode::RdmaWrite => ibv_wr_opcode::IBV_WR_RDMA_WRITE,
            Opcode::Recv => {
                return Err(ProbeError::PostFailed {
                    op: request.opcode,
                    reason: "receive is not a send-queue operation".to_string(),
                })
            }
        };
        if let Some(remote) = request.remote {
            wr.wr.rdma.remote_addr = remote.addr;
            wr.wr.rdma.rkey = remote.rkey;
        }
        let mut bad_wr = ptr::null_mut();
        let ec = unsafe { ibv_post_send(qp.as_ptr(), &mut wr, &mut bad_wr) };
        if ec != 0 {
            return Err(ProbeError::PostFailed {
                op: request.opcode,
                reason: io::Error::from_raw_os_error(ec.abs()).to_string(),
            });
        }
        Ok(())
    }

    fn post_recv(&mut self, request: &RecvRequest) -> Result<()> {
        let qp = self.qp()?;
        let mut sge = ibv_sge {
            addr: request.local_addr,
            length: request.length,
            lkey: request.lkey,
        };
        let mut wr: ibv_recv_wr = unsafe { std::mem::zeroed() };
        wr.wr_id = request.wr_id;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        let mut bad_wr = ptr::null_mut();
        let ec = unsafe { ibv_post_recv(qp.as_ptr(), &mut wr, &mut bad_wr) };
        if ec != 0 {
            return Err(ProbeError::PostFailed {
                op: Opcode::Recv,
                reason: io::Error::from_raw_os_error(ec.abs()).to_string(),
            });
        }
        Ok(())
    }

    fn poll_cq(&mut self) -> Result<Option<WorkCompletion>> {
        let cq = self.cq.ok_or_else(|| ProbeError::resource("ibv_poll_cq"))?;
        let mut wc: ibv_wc = unsafe { std::mem::zeroed() };
        let polled = unsafe { ibv_poll_cq(cq.as_ptr(), 1, &mut wc) };
        if polled < 0 {
            return Err(with_code(polled, "ibv_poll_cq"));
        }
        if polled == 0 {
            return Ok(None);
        }
        let opcode = match wc.opcode {
            ibv_wc_opcode::IBV_WC_RDMA_READ => Opcode::RdmaRead,
            ibv_wc_opcode::IBV_WC_RDMA_WRITE => Opcode::RdmaWrite,
            ibv_wc_opcode::IBV_WC_RECV => Opcode::Recv,
            _ => Opcode::Send,
        };
        Ok(Some(WorkCompletion {
            wr_id: wc.wr_id,
            opcode,
            status: CompletionStatus::from_raw(wc.status as u32),
            vendor_err: wc.vendor_err,
            byte_len: wc.byte_len,
        }))
    }

    fn release(&mut self, resource: Resource) -> Result<()> {
        let ec = unsafe {
            match resource {
                Resource::QueuePair => self.qp.take().map(|qp| ibv_destroy_qp(qp.as_ptr())),
                Resource::MemoryRegion => self.mr.take().map(|mr| ibv_dereg_mr(mr.as_ptr())),
                Resource::CompletionQueue => self.cq.take().map(|cq| ibv_destroy_cq(cq.as_ptr())),
                Resource::ProtectionDomain => self.pd.take().map(|pd| ibv_dealloc_pd(pd.as_ptr())),
                Resource::Device => self.context.take().map(|c| ibv_close_device(c.as_ptr())),
            }
        };
        match ec {
            Some(0) | None => Ok(()),
            Some(ec) => Err(with_code(ec, resource.name())),
        }
    }
}

impl Drop for VerbsTransport {
    fn drop(&mut self) {
        for resource in [
            Resource::QueuePair,
            Resource::MemoryRegion,
            Resource::CompletionQueue,
            Resource::ProtectionDomain,
            Resource::Device,
        ] {
            if let Err(e) = self.release(resource) {
                tracing::warn!("{}", e);
            }
        }
    }
}
