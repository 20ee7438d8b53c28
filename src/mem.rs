use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemKind {
    /// Host memory, visible to the RDMA engine.
    Host,
    /// Device memory on the GPU with the given ordinal.
    Gpu(u32),
}

impl fmt::Display for MemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemKind::Host => write!(f, "host"),
            MemKind::Gpu(dev) => write!(f, "gpu{}", dev),
        }
    }
}

/// Out-of-bounds access on a [`Buffer`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("range {start}..{end} out of bounds for buffer of {len} bytes")]
pub struct OutOfBounds {
    pub start: usize,
    pub end: usize,
    pub len: usize,
}

/// The first word of a buffer that does not match the verification pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("pattern mismatch at byte offset {offset}: expected {expected}, found {found}")]
pub struct PatternMismatch {
    pub offset: usize,
    pub expected: u32,
    pub found: u32,
}

struct BufferInner {
    vaddr: u64,
    kind: MemKind,
    data: Mutex<Box<[u8]>>,
}

/// A memory region handed out by an accelerator.
///
/// `Buffer` is a reference to the underlying memory, like the RDMA resource
/// holders it stands in for: cloning it yields another handle to the same
/// bytes. The region is identified towards the hardware by its virtual address
/// [`Buffer::vaddr`], which is what gets programmed into registers.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("vaddr", &format_args!("{:#x}", self.inner.vaddr))
            .field("kind", &self.inner.kind)
            .field("len", &self.len())
            .finish()
    }
}

impl Buffer {
    /// Allocate a zeroed buffer of `len` bytes at the given address.
    pub fn new(vaddr: u64, kind: MemKind, len: usize) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                vaddr,
                kind,
                data: Mutex::new(vec![0u8; len].into_boxed_slice()),
            }),
        }
    }

    /// Lock the backing memory. A panic in another holder does not make the
    /// bytes any less valid, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.inner.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the virtual address of the buffer.
    #[inline]
    pub fn vaddr(&self) -> u64 {
        self.inner.vaddr
    }

    /// Get the memory kind of the buffer.
    #[inline]
    pub fn kind(&self) -> MemKind {
        self.inner.kind
    }

    /// Get the length of the buffer in bytes.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether two handles refer to the same memory.
    #[inline]
    pub fn same_as(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn check(&self, r: &Range<usize>, len: usize) -> Result<(), OutOfBounds> {
        if r.start <= r.end && r.end <= len {
            Ok(())
        } else {
            Err(OutOfBounds {
                start: r.start,
                end: r.end,
                len,
            })
        }
    }

    /// Run `f` with shared access to the given range.
    pub fn read<R>(&self, r: Range<usize>, f: impl FnOnce(&[u8]) -> R) -> Result<R, OutOfBounds> {
        let data = self.lock();
        self.check(&r, data.len())?;
        Ok(f(&data[r]))
    }

    /// Run `f` with exclusive access to the given range.
    pub fn write<R>(
        &self,
        r: Range<usize>,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, OutOfBounds> {
        let mut data = self.lock();
        self.check(&r, data.len())?;
        Ok(f(&mut data[r]))
    }

    /// Copy `src` into the buffer starting at `offset`.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<(), OutOfBounds> {
        self.write(offset..offset + src.len(), |dst| dst.copy_from_slice(src))
    }

    /// Copy `len` bytes starting at `offset` out of the buffer.
    pub fn to_vec(&self, offset: usize, len: usize) -> Result<Vec<u8>, OutOfBounds> {
        self.read(offset..offset + len, <[u8]>::to_vec)
    }

    /// Copy `len` bytes from `src[src_offset..]` to `self[dst_offset..]`.
    ///
    /// The two handles may refer to the same memory.
    pub fn copy_from(
        &self,
        dst_offset: usize,
        src: &Buffer,
        src_offset: usize,
        len: usize,
    ) -> Result<(), OutOfBounds> {
        if self.same_as(src) {
            let mut data = self.lock();
            let total = data.len();
            self.check(&(src_offset..src_offset + len), total)?;
            self.check(&(dst_offset..dst_offset + len), total)?;
            data.copy_within(src_offset..src_offset + len, dst_offset);
            return Ok(());
        }
        let bytes = src.to_vec(src_offset, len)?;
        self.write_at(dst_offset, &bytes)
    }

    /// Zero the first `len` bytes.
    pub fn zero(&self, len: usize) -> Result<(), OutOfBounds> {
        self.write(0..len, |data| data.fill(0))
    }

    /// Fill the first `len` bytes with the verification pattern.
    pub fn fill_pattern(&self, len: usize) -> Result<(), OutOfBounds> {
        self.write(0..len, fill_pattern)
    }

    /// Check the first `len` bytes against the verification pattern.
    pub fn verify_pattern(&self, len: usize) -> Result<Result<(), PatternMismatch>, OutOfBounds> {
        self.read(0..len, verify_pattern)
    }
}

/// Write the verification pattern: little-endian `u32` word `i` holds `i`.
/// Trailing bytes that do not form a whole word are left untouched.
pub fn fill_pattern(data: &mut [u8]) {
    for (i, word) in data.chunks_exact_mut(4).enumerate() {
        word.copy_from_slice(&(i as u32).to_le_bytes());
    }
}

/// Check that every whole `u32` word `i` of `data` holds `i`.
pub fn verify_pattern(data: &[u8]) -> Result<(), PatternMismatch> {
    for (i, word) in data.chunks_exact(4).enumerate() {
        let found = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        if found != i as u32 {
            return Err(PatternMismatch {
                offset: i * 4,
                expected: i as u32,
                found,
            });
        }
    }
    Ok(())
}

/// Hands out page-aligned virtual addresses for new buffers.
#[derive(Debug)]
pub struct AddressSpace {
    next: AtomicU64,
}

impl AddressSpace {
    pub const PAGE_SIZE: u64 = 4096;

    pub fn new(base: u64) -> Self {
        Self {
            next: AtomicU64::new(base),
        }
    }

    /// Reserve `len` bytes, rounded up to a whole page, and return the start.
    pub fn reserve(&self, len: usize) -> u64 {
        let len = (len as u64).max(1).div_ceil(Self::PAGE_SIZE) * Self::PAGE_SIZE;
        self.next.fetch_add(len, Ordering::Relaxed)
    }
}
