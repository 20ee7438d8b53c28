//! The accelerator-thread collaborator.
//!
//! An [`Accelerator`] is a handle onto one vFPGA region together with its RDMA
//! connection to a single peer. The driver treats it as opaque: everything it
//! needs goes through the trait, and nothing about the transport leaks out
//! apart from completion counts.

mod loopback;
#[cfg(test)]
pub(crate) mod mock;

use std::fmt;

use thiserror::Error;

pub use self::loopback::*;
use crate::mem::{Buffer, OutOfBounds};

/// The default TCP port for the out-of-band RDMA handshake.
pub const DEF_PORT: u16 = 18488;

/// Operations understood by the accelerator.
///
/// Each operation kind has its own completion counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Oper {
    /// vFPGA reads from local memory.
    LocalRead,
    /// Local memory was written, either by the vFPGA or by an inbound RDMA write.
    LocalWrite,
    /// Local read followed by a local write.
    LocalTransfer,
    /// One-sided RDMA read from the peer's buffer.
    RemoteRdmaRead,
    /// One-sided RDMA write into the peer's buffer.
    RemoteRdmaWrite,
    /// Two-sided RDMA send.
    RemoteRdmaSend,
}

impl Oper {
    /// Number of distinct operation kinds.
    pub const COUNT: usize = 6;

    /// Index of this operation's completion counter.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Oper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Oper::LocalRead => "LOCAL_READ",
            Oper::LocalWrite => "LOCAL_WRITE",
            Oper::LocalTransfer => "LOCAL_TRANSFER",
            Oper::RemoteRdmaRead => "REMOTE_RDMA_READ",
            Oper::RemoteRdmaWrite => "REMOTE_RDMA_WRITE",
            Oper::RemoteRdmaSend => "REMOTE_RDMA_SEND",
        };
        f.write_str(s)
    }
}

/// Kind of memory to allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocType {
    /// Regular pages.
    Reg,
    /// Huge pages.
    Hpf,
    /// GPU device memory.
    Gpu,
}

/// Memory allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocSpec {
    pub alloc: AllocType,
    pub size: usize,
    /// Whether the memory should be registered for remote access.
    pub remote: bool,
    /// Device ordinal; only meaningful for [`AllocType::Gpu`].
    pub gpu_dev_id: u32,
}

impl AllocSpec {
    /// Request `size` bytes of host memory.
    pub fn host(size: usize) -> Self {
        Self {
            alloc: AllocType::Reg,
            size,
            remote: false,
            gpu_dev_id: 0,
        }
    }

    /// Request `size` bytes of memory on GPU `dev`.
    pub fn gpu(size: usize, dev: u32) -> Self {
        Self {
            alloc: AllocType::Gpu,
            size,
            remote: false,
            gpu_dev_id: dev,
        }
    }
}

/// Scatter-gather descriptor of one RDMA operation.
///
/// Offsets are relative to the start of the local and remote buffers
/// exchanged during connection setup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RdmaSg {
    pub local_offs: usize,
    pub remote_offs: usize,
    pub len: usize,
}

impl RdmaSg {
    /// A descriptor covering the first `len` bytes on both sides.
    pub fn new(len: usize) -> Self {
        Self {
            local_offs: 0,
            remote_offs: 0,
            len,
        }
    }
}

/// Accelerator error type.
#[derive(Debug, Error)]
pub enum AccelError {
    /// Memory could not be allocated.
    #[error("could not allocate {size} bytes of {alloc:?} memory")]
    AllocationFailed { alloc: AllocType, size: usize },

    /// `init_rdma` was not called, or called twice.
    #[error("RDMA connection {0}")]
    Connection(&'static str),

    /// The peer went away; pending syncs will never complete.
    #[error("peer disconnected")]
    PeerDisconnected,

    /// Register index outside the register file.
    #[error("register index {0} out of range")]
    BadRegister(u32),

    /// The operation cannot be invoked on this accelerator.
    #[error("unsupported operation {0}")]
    UnsupportedOper(Oper),

    /// An operation touched memory outside the registered buffers.
    #[error("operation out of bounds: {0}")]
    OutOfBounds(#[from] OutOfBounds),

    /// The buffer was not allocated by this accelerator.
    #[error("unknown buffer at {0:#x}")]
    UnknownBuffer(u64),

    /// The peer's side of the benchmark failed.
    #[error("peer failed: {0}")]
    Peer(String),
}

/// Handle onto the accelerator and its RDMA connection.
///
/// All methods take `&self`: the handle is a reference to a shared hardware
/// context, and implementations are expected to use interior mutability.
pub trait Accelerator {
    /// Allocate the local RDMA buffer of `buf_size` bytes, exchange queue pair
    /// and buffer information with the peer on `port`, and return the buffer.
    fn init_rdma(&self, buf_size: usize, port: u16) -> Result<Buffer, AccelError>;

    /// Block until the peer reaches the matching call.
    fn conn_sync(&self, is_client: bool) -> Result<(), AccelError>;

    /// Allocate memory.
    fn get_mem(&self, spec: AllocSpec) -> Result<Buffer, AccelError>;

    /// Release memory obtained from [`Accelerator::get_mem`].
    fn free_mem(&self, buf: &Buffer) -> Result<(), AccelError>;

    /// Write a 64-bit value to the control register at `idx`.
    fn set_csr(&self, val: u64, idx: u32) -> Result<(), AccelError>;

    /// Read the control register at `idx`.
    fn get_csr(&self, idx: u32) -> Result<u64, AccelError>;

    /// Reset all completion counters to zero.
    fn clear_completed(&self);

    /// Number of completed operations of the given kind since the last reset.
    fn check_completed(&self, oper: Oper) -> u32;

    /// Issue one operation.
    fn invoke(&self, oper: Oper, sg: &RdmaSg) -> Result<(), AccelError>;
}
