//! A recording accelerator for driver tests.

use std::cell::{Cell, RefCell};

use super::*;
use crate::mem::{AddressSpace, MemKind};

/// One observed call into [`MockAccel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    InitRdma(usize),
    Sync,
    Clear,
    /// `check_completed` and the count it returned.
    Check(Oper, u32),
    Invoke(Oper, usize),
    GetMem(AllocSpec),
    FreeMem(u64),
    SetCsr(u64, u32),
}

/// Accelerator whose peer delivers one local write per poll.
///
/// After a reset the counter climbs by one on every `check_completed` until it
/// reaches `peer_writes`; when it gets there the fake peer has "written" the
/// verification pattern into the RDMA buffer.
pub struct MockAccel {
    calls: RefCell<Vec<Call>>,
    completed: Cell<u32>,
    peer_writes: Cell<u32>,
    mem: RefCell<Option<Buffer>>,
    regs: RefCell<Vec<u64>>,
    space: AddressSpace,
}

impl MockAccel {
    pub const NUM_REGS: usize = 16;

    pub fn new() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            completed: Cell::new(0),
            peer_writes: Cell::new(0),
            mem: RefCell::new(None),
            regs: RefCell::new(vec![0; Self::NUM_REGS]),
            space: AddressSpace::new(0x7f00_0000_0000),
        }
    }

    pub fn set_peer_writes(&self, n: u32) {
        self.peer_writes.set(n);
    }

    /// Make all of this round's peer writes visible at once.
    pub fn deliver_all(&self) {
        self.completed.set(self.peer_writes.get());
        self.peer_landed();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn reg(&self, idx: u32) -> u64 {
        self.regs.borrow()[idx as usize]
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }

    fn peer_landed(&self) {
        if let Some(mem) = self.mem.borrow().as_ref() {
            let len = mem.len();
            mem.fill_pattern(len).expect("mock buffer covers itself");
        }
    }
}

impl Accelerator for MockAccel {
    fn init_rdma(&self, buf_size: usize, _port: u16) -> Result<Buffer, AccelError> {
        self.record(Call::InitRdma(buf_size));
        let buf = Buffer::new(self.space.reserve(buf_size), MemKind::Host, buf_size);
        *self.mem.borrow_mut() = Some(buf.clone());
        Ok(buf)
    }

    fn conn_sync(&self, _is_client: bool) -> Result<(), AccelError> {
        self.record(Call::Sync);
        Ok(())
    }

    fn get_mem(&self, spec: AllocSpec) -> Result<Buffer, AccelError> {
        self.record(Call::GetMem(spec));
        let kind = match spec.alloc {
            AllocType::Gpu => MemKind::Gpu(spec.gpu_dev_id),
            _ => MemKind::Host,
        };
        Ok(Buffer::new(self.space.reserve(spec.size), kind, spec.size))
    }

    fn free_mem(&self, buf: &Buffer) -> Result<(), AccelError> {
        self.record(Call::FreeMem(buf.vaddr()));
        Ok(())
    }

    fn set_csr(&self, val: u64, idx: u32) -> Result<(), AccelError> {
        self.record(Call::SetCsr(val, idx));
        let mut regs = self.regs.borrow_mut();
        let reg = regs
            .get_mut(idx as usize)
            .ok_or(AccelError::BadRegister(idx))?;
        *reg = val;
        Ok(())
    }

    fn get_csr(&self, idx: u32) -> Result<u64, AccelError> {
        self.regs
            .borrow()
            .get(idx as usize)
            .copied()
            .ok_or(AccelError::BadRegister(idx))
    }

    fn clear_completed(&self) {
        self.record(Call::Clear);
        self.completed.set(0);
    }

    fn check_completed(&self, oper: Oper) -> u32 {
        let n = self.completed.get();
        if n < self.peer_writes.get() {
            self.completed.set(n + 1);
            if n + 1 == self.peer_writes.get() {
                self.peer_landed();
            }
        }
        let n = self.completed.get();
        self.record(Call::Check(oper, n));
        n
    }

    fn invoke(&self, oper: Oper, sg: &RdmaSg) -> Result<(), AccelError> {
        self.record(Call::Invoke(oper, sg.len));
        Ok(())
    }
}
