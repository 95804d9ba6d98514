//! Double-buffered scratch memory shared between the pump and its sink.
//!
//! The pump fills one buffer while the sink's asynchronous tail may still be
//! reading the other. Nothing synchronises the two by default: by the time
//! parity comes back around, one full capture interval has passed, and the
//! sink is expected to be done with the buffer. `HandoffPolicy::AwaitRelease`
//! turns that assumption into an explicit wait for callers who want it.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::convert::packed_len;
use crate::error::{PumpError, Result};
use crate::frame::FrameDesc;

/// Alignment of every scratch buffer, in bytes.
pub const SCRATCH_ALIGN: usize = 64;

/// Which of the two scratch buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parity {
    Even,
    Odd,
}

impl Parity {
    pub fn index(self) -> usize {
        match self {
            Self::Even => 0,
            Self::Odd => 1,
        }
    }

    pub fn flip(self) -> Self {
        match self {
            Self::Even => Self::Odd,
            Self::Odd => Self::Even,
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// How the stage treats a buffer that is still lent out when its parity
/// comes around again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandoffPolicy {
    /// Reuse the buffer regardless; count the overlap.
    #[default]
    Timed,
    /// Wait until the sink drops its lease, for at most `timeout`.
    AwaitRelease { timeout: Duration },
}

/// Aligned heap allocation plus an outstanding-lease counter.
struct ScratchAlloc {
    ptr: NonNull<u8>,
    layout: Layout,
    leases: AtomicUsize,
}

// The allocation is plain bytes; all cross-thread access goes through
// `LentFrame`, whose contract is documented there.
unsafe impl Send for ScratchAlloc {}
unsafe impl Sync for ScratchAlloc {}

impl ScratchAlloc {
    fn new(len: usize) -> Self {
        let layout = match Layout::from_size_align(len, SCRATCH_ALIGN) {
            Ok(l) => l,
            Err(_) => alloc::handle_alloc_error(Layout::new::<u8>()),
        };
        // SAFETY: `len` is non-zero (checked by `DoubleBufferedStage::allocate`).
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        Self {
            ptr,
            layout,
            leases: AtomicUsize::new(0),
        }
    }

    fn is_held(&self) -> bool {
        self.leases.load(Ordering::Acquire) > 0
    }
}

impl Drop for ScratchAlloc {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// One 64-byte aligned scratch buffer of `width * height * 2` bytes.
pub struct ScratchBuffer {
    slot: Arc<ScratchAlloc>,
    parity: Parity,
}

impl ScratchBuffer {
    fn allocate(len: usize, parity: Parity) -> Self {
        Self {
            slot: Arc::new(ScratchAlloc::new(len)),
            parity,
        }
    }

    pub fn len(&self) -> usize {
        self.slot.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn parity(&self) -> Parity {
        self.parity
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.slot.ptr.as_ptr()
    }

    /// Whether a sink still holds a lease on this buffer.
    pub fn is_held(&self) -> bool {
        self.slot.is_held()
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the allocation is `len` initialised bytes. A sink may still
        // be reading through an old `LentFrame`; that overlap is the accepted
        // timing assumption of the double buffer (see module docs).
        unsafe { std::slice::from_raw_parts_mut(self.slot.ptr.as_ptr(), self.len()) }
    }
}

impl fmt::Debug for ScratchBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchBuffer")
            .field("parity", &self.parity)
            .field("len", &self.len())
            .field("held", &self.is_held())
            .finish()
    }
}

/// A filled scratch buffer lent to a sink.
///
/// The sink may keep reading the bytes after `publish` returns, but only
/// until its *next* publish: dropping the `LentFrame` ends the lease, and
/// one frame interval later the pump refills the same memory.
pub struct LentFrame {
    slot: Arc<ScratchAlloc>,
    desc: FrameDesc,
    parity: Parity,
    len: usize,
}

impl LentFrame {
    pub fn desc(&self) -> &FrameDesc {
        &self.desc
    }

    pub fn parity(&self) -> Parity {
        self.parity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.slot.ptr.as_ptr()
    }

    /// View the lent bytes.
    ///
    /// # Safety
    ///
    /// The pump refills this memory once the opposite parity has been
    /// published. The returned slice must not be read after that point,
    /// which in practice means: read it before the next frame interval ends,
    /// or use `HandoffPolicy::AwaitRelease` and keep the `LentFrame` alive
    /// while reading.
    pub unsafe fn as_bytes(&self) -> &[u8] {
        std::slice::from_raw_parts(self.slot.ptr.as_ptr(), self.len)
    }
}

impl Drop for LentFrame {
    fn drop(&mut self) {
        self.slot.leases.fetch_sub(1, Ordering::Release);
    }
}

impl fmt::Debug for LentFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LentFrame")
            .field("parity", &self.parity)
            .field("len", &self.len)
            .field("sequence", &self.desc.sequence)
            .finish()
    }
}

/// Two scratch buffers handed out in alternation.
pub struct DoubleBufferedStage {
    buffers: [ScratchBuffer; 2],
    next: Parity,
    policy: HandoffPolicy,
    overlaps: u64,
}

impl DoubleBufferedStage {
    /// Allocate both buffers for a `width` x `height` packed 4:2:2 frame.
    pub fn allocate(width: u32, height: u32) -> Result<Self> {
        let len = packed_len(width, height);
        if len == 0 {
            return Err(PumpError::Config(format!(
                "cannot allocate scratch buffers for {width}x{height}"
            )));
        }
        debug!("allocating 2 x {len} byte scratch buffers ({width}x{height})");
        Ok(Self {
            buffers: [
                ScratchBuffer::allocate(len, Parity::Even),
                ScratchBuffer::allocate(len, Parity::Odd),
            ],
            next: Parity::Even,
            policy: HandoffPolicy::default(),
            overlaps: 0,
        })
    }

    pub fn with_policy(mut self, policy: HandoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Number of times a buffer was handed out while still lent.
    pub fn overlaps(&self) -> u64 {
        self.overlaps
    }

    pub fn buffer(&self, parity: Parity) -> &ScratchBuffer {
        &self.buffers[parity.index()]
    }

    /// Return the buffer not most recently returned, flipping parity.
    pub fn next_target(&mut self) -> (Parity, &mut [u8]) {
        let parity = self.next;
        self.next = parity.flip();

        if self.buffers[parity.index()].is_held() {
            let released = match self.policy {
                HandoffPolicy::Timed => false,
                HandoffPolicy::AwaitRelease { timeout } => {
                    wait_for_release(&self.buffers[parity.index()].slot, timeout)
                }
            };
            if !released {
                self.overlaps += 1;
                match self.policy {
                    HandoffPolicy::Timed => {
                        debug!("scratch buffer {parity} reused while still lent downstream")
                    }
                    HandoffPolicy::AwaitRelease { timeout } => warn!(
                        "scratch buffer {parity} still lent after {}ms, reusing",
                        timeout.as_millis()
                    ),
                }
            }
        }

        (parity, self.buffers[parity.index()].as_mut_slice())
    }

    /// Lend the buffer of `parity` to a sink, described by `desc`.
    pub fn lend(&self, parity: Parity, desc: FrameDesc) -> LentFrame {
        let buffer = &self.buffers[parity.index()];
        buffer.slot.leases.fetch_add(1, Ordering::AcqRel);
        LentFrame {
            slot: Arc::clone(&buffer.slot),
            len: desc.len().min(buffer.len()),
            desc,
            parity,
        }
    }
}

/// Spin, then yield, until the lease count drops to zero or `timeout` passes.
fn wait_for_release(slot: &ScratchAlloc, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut spins = 0u32;
    while slot.is_held() {
        if Instant::now() >= deadline {
            return false;
        }
        if spins < 64 {
            std::hint::spin_loop();
            spins += 1;
        } else {
            std::thread::yield_now();
        }
    }
    true
}
