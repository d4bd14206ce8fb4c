//! InfiniBand / RoCE transport over libibverbs.
//!
//! Every lane owns a reliable-connected queue pair and its completion queue,
//! so worker threads never share verbs state. A TCP socket between the two
//! processes carries the queue pair and region descriptors, the barrier and
//! abort notifications.

use std::{
    ffi::CStr,
    io::{self, ErrorKind, Read, Write},
    mem::{size_of, zeroed},
    net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream},
    ptr::NonNull,
    slice,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use derivative::Derivative;
use rdma_sys::*;
use thiserror::Error;
use tracing::{debug, info};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::{
    config::RunConfig,
    error::{BenchError, Result},
    fabric::{Fabric, Threading},
    memory_region::{AlignedBuffer, RegionMemory},
    role::Role,
};

use self::{
    config::VerbsConfig,
    handle::Lane,
    memory_region::MemoryRegion,
    qp_info::{LaneInfo, RegionInfo},
    queue_pair::{CompletionQueue, QueuePair},
};

pub mod config;
mod handle;
mod memory_region;
mod qp_info;
mod queue_pair;
pub mod send;
pub mod work_completion;

pub use self::handle::VerbsHandle;

const TAG_BARRIER: u8 = 0x01;
const TAG_DESCRIPTORS: u8 = 0x02;
const TAG_ABORT: u8 = 0xFF;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RdmaError {
    #[error("no RDMA devices found")]
    NoDevices,

    #[error("RDMA device {0} not found")]
    UnknownDevice(String),

    #[error("failed to open RDMA device {name}")]
    OpenDevice { name: String, source: io::Error },

    #[error("failed to allocate protection domain")]
    AllocPd(#[source] io::Error),

    #[error("failed to query port {port}")]
    QueryPort { port: u8, source: io::Error },

    #[error("port {0} is not active")]
    PortNotActive(u8),

    #[error("failed to query device")]
    QueryDevice(#[source] io::Error),

    #[error("failed to query gid index {index}")]
    QueryGid { index: i32, source: io::Error },

    #[error("failed to create completion queue")]
    CreateCq(#[source] io::Error),

    #[error("failed to create queue pair")]
    CreateQp(#[source] io::Error),

    #[error("failed to modify QP from {from} to {to}")]
    ModifyQp {
        from: &'static str,
        to: &'static str,
        source: io::Error,
    },

    #[error("failed to register memory region of {len} bytes")]
    RegMr { len: usize, source: io::Error },

    #[error("failed to post a write on lane {lane}")]
    PostSend { lane: usize, source: io::Error },

    #[error("polling a completion queue returned {0}")]
    PollCq(i32),

    #[error("work request {wr_id} on lane {lane} completed with status {status}")]
    Completion { lane: usize, wr_id: u64, status: u32 },

    #[error("queue depth {requested} exceeds the device limit of {max}")]
    QueueDepth { requested: usize, max: usize },

    #[error("lane {0} has no registered origin buffer")]
    OriginNotAttached(usize),

    #[error("message of {0} bytes is too large for one work request")]
    MessageTooLarge(usize),

    #[error("unexpected bootstrap message {got:#04x}, expected {expected:#04x}")]
    Protocol { expected: u8, got: u8 },

    #[error("peer runs {peer} lanes, this process {local}")]
    LaneMismatch { local: usize, peer: usize },
}

/// An opened device with its protection domain.
pub struct Device {
    ctx: NonNull<ibv_context>,
    pd: NonNull<ibv_pd>,
    name: String,
    port: u8,
    port_attr: ibv_port_attr,
    max_qp_wr: usize,
    gid: [u8; 16],
}

// SAFETY: libibverbs contexts and protection domains are thread safe.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}

impl Device {
    pub fn open(config: &VerbsConfig) -> std::result::Result<Self, RdmaError> {
        let (ctx, name) = open_context(config.dev_name.as_deref())?;

        let pd = unsafe { ibv_alloc_pd(ctx.as_ptr()) };
        let Some(pd) = NonNull::new(pd) else {
            let source = io::Error::last_os_error();
            unsafe { ibv_close_device(ctx.as_ptr()) };
            return Err(RdmaError::AllocPd(source));
        };

        let mut device = Self {
            ctx,
            pd,
            name,
            port: config.ib_port,
            // SAFETY: plain C struct, overwritten by the query below.
            port_attr: unsafe { zeroed() },
            max_qp_wr: 0,
            gid: [0; 16],
        };

        unsafe {
            let ret = ibv_query_port(
                device.ctx(),
                device.port,
                (&mut device.port_attr as *mut ibv_port_attr).cast(),
            );
            if ret != 0 {
                return Err(RdmaError::QueryPort {
                    port: device.port,
                    source: io::Error::from_raw_os_error(ret),
                });
            }

            if device.port_attr.state != ibv_port_state::IBV_PORT_ACTIVE {
                return Err(RdmaError::PortNotActive(device.port));
            }

            let mut dev_attr: ibv_device_attr = zeroed();
            let ret = ibv_query_device(device.ctx(), &mut dev_attr);
            if ret != 0 {
                return Err(RdmaError::QueryDevice(io::Error::from_raw_os_error(ret)));
            }
            device.max_qp_wr = dev_attr.max_qp_wr.max(0) as usize;

            if let Some(index) = config.gid_index {
                let mut gid: ibv_gid = zeroed();
                let ret = ibv_query_gid(device.ctx(), device.port, index, &mut gid);
                if ret != 0 {
                    return Err(RdmaError::QueryGid {
                        index,
                        source: io::Error::last_os_error(),
                    });
                }
                device.gid = gid.raw;
            }
        }

        info!(
            device = %device.name,
            port = device.port,
            lid = device.lid(),
            max_qp_wr = device.max_qp_wr,
            "opened RDMA device"
        );

        Ok(device)
    }

    fn ctx(&self) -> *mut ibv_context {
        self.ctx.as_ptr()
    }

    fn pd(&self) -> *mut ibv_pd {
        self.pd.as_ptr()
    }

    fn port(&self) -> u8 {
        self.port
    }

    fn lid(&self) -> u16 {
        self.port_attr.lid
    }

    fn gid(&self) -> [u8; 16] {
        self.gid
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            ibv_dealloc_pd(self.pd.as_ptr());
            ibv_close_device(self.ctx.as_ptr());
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("port", &self.port)
            .field("lid", &self.lid())
            .finish()
    }
}

/// Opens `name`, or the first device when `None`.
fn open_context(
    name: Option<&str>,
) -> std::result::Result<(NonNull<ibv_context>, String), RdmaError> {
    unsafe {
        let mut num_devices = 0;
        let devices = ibv_get_device_list(&mut num_devices);
        if devices.is_null() {
            return Err(RdmaError::NoDevices);
        }

        let list = slice::from_raw_parts(devices, num_devices.max(0) as usize);
        let device_name =
            |device: *mut ibv_device| CStr::from_ptr(ibv_get_device_name(device)).to_string_lossy();

        let chosen = match name {
            None => list.first().copied().ok_or(RdmaError::NoDevices),
            Some(name) => list
                .iter()
                .copied()
                .find(|&device| device_name(device) == name)
                .ok_or_else(|| RdmaError::UnknownDevice(name.to_owned())),
        };

        let opened = chosen.and_then(|device| {
            let name = device_name(device).into_owned();
            NonNull::new(ibv_open_device(device))
                .map(|ctx| (ctx, name.clone()))
                .ok_or_else(|| RdmaError::OpenDevice {
                    name,
                    source: io::Error::last_os_error(),
                })
        });

        ibv_free_device_list(devices);
        opened
    }
}

/// One side of a two-process verbs run.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct VerbsFabric {
    config: VerbsConfig,
    device: Arc<Device>,
    #[derivative(Debug = "ignore")]
    stream: Mutex<TcpStream>,
    #[derivative(Debug = "ignore")]
    abort_stream: TcpStream,
    aborted: AtomicBool,
    handles_created: AtomicUsize,
}

impl VerbsFabric {
    /// Opens the device, connects the bootstrap socket and meets the peer.
    /// The sink listens, the source connects.
    pub fn connect(config: VerbsConfig) -> Result<Self> {
        if config.rank >= 2 {
            return Err(BenchError::InvalidRank {
                rank: config.rank,
                size: 2,
            });
        }

        let device = Arc::new(Device::open(&config)?);
        let stream = bootstrap(&config)?;
        stream.set_nodelay(true)?;
        let abort_stream = stream.try_clone()?;

        let fabric = Self {
            config,
            device,
            stream: Mutex::new(stream),
            abort_stream,
            aborted: AtomicBool::new(false),
            handles_created: AtomicUsize::new(0),
        };

        fabric.barrier()?;

        info!(rank = fabric.config.rank, "connected to verbs peer");

        Ok(fabric)
    }

    pub fn handles_created(&self) -> usize {
        self.handles_created.load(Ordering::Relaxed)
    }

    /// Sends our descriptors and returns the peer's, which must have the
    /// same lane count.
    fn exchange(&self, lanes: usize, local: &[u8]) -> Result<Vec<u8>> {
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);

        let send = |stream: &mut TcpStream| -> Result<()> {
            stream.write_all(&[TAG_DESCRIPTORS])?;
            stream.write_all(&(lanes as u32).to_ne_bytes())?;
            stream.write_all(local)?;
            Ok(())
        };

        let receive = |stream: &mut TcpStream| -> Result<Vec<u8>> {
            expect_tag(stream, TAG_DESCRIPTORS)?;
            let mut count = [0; 4];
            read_or_abort(stream, &mut count)?;
            let peer = u32::from_ne_bytes(count) as usize;
            if peer != lanes {
                return Err(RdmaError::LaneMismatch { local: lanes, peer }.into());
            }
            let mut remote = vec![0; local.len()];
            read_or_abort(stream, &mut remote)?;
            Ok(remote)
        };

        // Fixed order so large descriptor sets cannot fill both send buffers.
        if Role::from_rank(self.config.rank) == Role::Source {
            send(&mut stream)?;
            receive(&mut stream)
        } else {
            let remote = receive(&mut stream)?;
            send(&mut stream)?;
            Ok(remote)
        }
    }
}

fn bootstrap(config: &VerbsConfig) -> Result<TcpStream> {
    let deadline = Instant::now() + config.connect_timeout;
    let endpoint = SocketAddr::new(config.peer, config.tcp_port);

    if Role::from_rank(config.rank).exposes_region() {
        let any = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), config.tcp_port);
        let listener = TcpListener::bind(any)?;
        listener.set_nonblocking(true)?;
        debug!(port = config.tcp_port, "waiting for the source to connect");

        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    stream.set_nonblocking(false)?;
                    debug!(%addr, "source connected");
                    return Ok(stream);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock && Instant::now() < deadline => {
                    thread::sleep(CONNECT_RETRY_INTERVAL)
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return Err(BenchError::ConnectTimeout(endpoint.to_string()))
                }
                Err(err) => return Err(err.into()),
            }
        }
    } else {
        loop {
            match TcpStream::connect(endpoint) {
                Ok(stream) => {
                    debug!(%endpoint, "connected to the sink");
                    return Ok(stream);
                }
                Err(_) if Instant::now() < deadline => thread::sleep(CONNECT_RETRY_INTERVAL),
                Err(_) => return Err(BenchError::ConnectTimeout(endpoint.to_string())),
            }
        }
    }
}

/// A closed socket means the peer went away, which only happens when it
/// failed.
fn read_or_abort(stream: &mut TcpStream, buf: &mut [u8]) -> Result<()> {
    match stream.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => Err(BenchError::PeerAborted),
        Err(err) => Err(err.into()),
    }
}

fn expect_tag(stream: &mut TcpStream, expected: u8) -> Result<()> {
    let mut tag = [0];
    read_or_abort(stream, &mut tag)?;
    match tag[0] {
        got if got == expected => Ok(()),
        TAG_ABORT => Err(BenchError::PeerAborted),
        got => Err(RdmaError::Protocol { expected, got }.into()),
    }
}

impl Fabric for VerbsFabric {
    type Region = AlignedBuffer;
    type Handle = VerbsHandle;

    fn rank(&self) -> usize {
        self.config.rank
    }

    fn size(&self) -> usize {
        2
    }

    fn threading(&self) -> Threading {
        Threading::Multiple
    }

    fn barrier(&self) -> Result<()> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(BenchError::Aborted);
        }
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        stream.write_all(&[TAG_BARRIER])?;
        expect_tag(&mut stream, TAG_BARRIER)
    }

    fn abort(&self) {
        if self.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        // Best effort: the peer may already be gone.
        let _ = (&self.abort_stream).write_all(&[TAG_ABORT]);
    }

    fn allocate_region(&self, len: usize) -> Result<AlignedBuffer> {
        AlignedBuffer::new(len)
    }

    fn create_handle(
        &self,
        region: Option<AlignedBuffer>,
        config: &RunConfig,
    ) -> Result<VerbsHandle> {
        let lanes = config.num_threads();
        // A window of unsignaled writes plus the signaled flush.
        let depth = config.window_size() + 1;
        if depth > self.device.max_qp_wr {
            return Err(RdmaError::QueueDepth {
                requested: depth,
                max: self.device.max_qp_wr,
            }
            .into());
        }

        self.handles_created.fetch_add(1, Ordering::Relaxed);

        let mut queues = Vec::with_capacity(lanes);
        for _ in 0..lanes {
            let cq = CompletionQueue::new(&self.device, depth)?;
            let qp = QueuePair::new(&self.device, &cq, depth)?;
            queues.push((qp, cq));
        }

        let region_mr = match &region {
            // SAFETY: the registration is dropped before the region in
            // `VerbsHandle::release`.
            Some(region) => Some(unsafe {
                MemoryRegion::register(
                    &self.device,
                    region.base(),
                    region.len(),
                    ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                        | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE,
                )?
            }),
            None => None,
        };

        let local_region = region_mr
            .as_ref()
            .map(|mr| RegionInfo {
                addr: mr.addr(),
                len: mr.len() as u64,
                rkey: mr.rkey(),
                _reserved: 0,
            })
            .unwrap_or_else(RegionInfo::new_zeroed);

        let mut payload =
            Vec::with_capacity(lanes * size_of::<LaneInfo>() + size_of::<RegionInfo>());
        for (qp, _) in &queues {
            payload.extend_from_slice(qp.local_info().as_bytes());
        }
        payload.extend_from_slice(local_region.as_bytes());

        let remote = self.exchange(lanes, &payload)?;
        let (lane_bytes, region_bytes) = remote.split_at(lanes * size_of::<LaneInfo>());

        let peer_lanes = lane_bytes.chunks_exact(size_of::<LaneInfo>());
        for ((qp, _), info) in queues.iter().zip(peer_lanes) {
            let info = LaneInfo::read_from(info).ok_or(RdmaError::Protocol {
                expected: TAG_DESCRIPTORS,
                got: 0,
            })?;
            qp.connect(&info, self.config.gid_index)?;
        }

        let target = match region {
            Some(_) => None,
            None => {
                let info = RegionInfo::read_from(region_bytes).ok_or(RdmaError::Protocol {
                    expected: TAG_DESCRIPTORS,
                    got: 0,
                })?;
                if (info.len as usize) < config.region_len() {
                    return Err(BenchError::RegionTooSmall {
                        expected: config.region_len(),
                        actual: info.len as usize,
                    });
                }
                debug!(addr = info.addr, len = info.len, "targeting peer region");
                Some(info)
            }
        };

        self.barrier()?;

        info!(lanes, depth, "queue pairs connected");

        let lanes = queues
            .into_iter()
            .map(|(qp, cq)| Lane {
                qp,
                cq,
                origin: None,
            })
            .collect();

        Ok(VerbsHandle::new(lanes, target, region_mr, region, config))
    }
}
