//! Buffer allocators for tensor payloads.
//!
//! Every payload lives in a [`Buffer`] handed out by an [`Allocator`]. Buffers
//! are not `Clone`: moving one between queues and workers is the ownership
//! transfer, so exactly one component holds a given buffer at any time.
//!
//! Allocators differ in what [`Allocator::free`] does with the memory:
//! - [`FreeStrategy::Release`] drops it ([`HeapAllocator`]).
//! - [`FreeStrategy::Transfer`] hands it back to the caller of `free`, which
//!   passes it on to an external owner ([`TransferAllocator`]). This is how
//!   pipeline results leave the allocator's books without being copied.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::Result;
use crate::error::TensorError;

/// Identifier of a buffer within the allocator that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An owned region of payload memory.
#[derive(Debug, PartialEq, Eq)]
pub struct Buffer {
    id: Option<BufferId>,
    data: Vec<u8>,
}

impl Buffer {
    /// Wrap memory managed by an allocator under `id`.
    pub fn new(id: BufferId, data: Vec<u8>) -> Self {
        Self { id: Some(id), data }
    }

    /// Wrap memory no allocator keeps books on. Dropping it releases it.
    pub fn detached(data: Vec<u8>) -> Self {
        Self { id: None, data }
    }

    /// Allocator id, or `None` for detached memory.
    pub fn id(&self) -> Option<BufferId> {
        self.id
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Take the raw memory out of the buffer.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

/// What [`Allocator::free`] does with the memory it is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeStrategy {
    /// Memory is dropped on free.
    Release,
    /// Memory is returned to the caller on free.
    Transfer,
}

/// Allocates and frees tensor payload buffers.
///
/// Implementations must tolerate concurrent calls from every worker thread
/// and the caller thread.
pub trait Allocator: Send + Sync {
    /// Allocate a zeroed buffer of `size` bytes.
    fn alloc(&self, size: usize) -> Result<Buffer>;

    /// Release the bookkeeping for `buffer`.
    ///
    /// Returns the memory when [`Allocator::strategy`] is
    /// [`FreeStrategy::Transfer`], `None` otherwise.
    fn free(&self, buffer: Buffer) -> Option<Vec<u8>>;

    /// Strategy applied by [`Allocator::free`].
    fn strategy(&self) -> FreeStrategy;
}

fn zeroed(size: usize) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    data.try_reserve_exact(size)
        .map_err(|e| TensorError::allocation(size, e.to_string()))?;
    data.resize(size, 0);
    Ok(data)
}

/// Heap allocator that drops memory on free.
#[derive(Debug, Default)]
pub struct HeapAllocator {
    next_id: AtomicU64,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Allocator for HeapAllocator {
    fn alloc(&self, size: usize) -> Result<Buffer> {
        let id = BufferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        Ok(Buffer::new(id, zeroed(size)?))
    }

    fn free(&self, buffer: Buffer) -> Option<Vec<u8>> {
        drop(buffer);
        None
    }

    fn strategy(&self) -> FreeStrategy {
        FreeStrategy::Release
    }
}

/// Heap allocator whose `free` hands the memory back instead of dropping it.
///
/// Used for pipeline outputs: once a result is popped, the caller owns the
/// payload and releases it through ordinary `Vec` drop.
#[derive(Debug, Default)]
pub struct TransferAllocator {
    next_id: AtomicU64,
}

impl TransferAllocator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Allocator for TransferAllocator {
    fn alloc(&self, size: usize) -> Result<Buffer> {
        let id = BufferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        Ok(Buffer::new(id, zeroed(size)?))
    }

    fn free(&self, buffer: Buffer) -> Option<Vec<u8>> {
        Some(buffer.into_vec())
    }

    fn strategy(&self) -> FreeStrategy {
        FreeStrategy::Transfer
    }
}

/// Point-in-time counters of a [`TrackingAllocator`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationReport {
    pub allocations: u64,
    pub frees: u64,
    pub live_buffers: usize,
    pub live_bytes: usize,
    pub peak_live_buffers: usize,
    pub double_frees: u64,
    pub foreign_frees: u64,
    pub failed_allocations: u64,
}

#[derive(Default)]
struct Ledger {
    live: HashMap<BufferId, usize>,
    freed: HashSet<BufferId>,
    report: AllocationReport,
}

/// Wraps another allocator and keeps a ledger of every buffer it hands out.
///
/// Detects double frees and frees of buffers it never allocated, and can cap
/// the number of live bytes to provoke allocation failures.
pub struct TrackingAllocator<A = HeapAllocator> {
    inner: A,
    limit: Option<usize>,
    ledger: Mutex<Ledger>,
}

impl TrackingAllocator<HeapAllocator> {
    /// Track a fresh [`HeapAllocator`].
    pub fn new() -> Self {
        Self::wrap(HeapAllocator::new())
    }
}

impl Default for TrackingAllocator<HeapAllocator> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Allocator> TrackingAllocator<A> {
    /// Track an existing allocator.
    pub fn wrap(inner: A) -> Self {
        Self {
            inner,
            limit: None,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Fail allocations that would push live bytes above `bytes`.
    pub fn with_limit(mut self, bytes: usize) -> Self {
        self.limit = Some(bytes);
        self
    }

    /// Snapshot of the counters.
    pub fn report(&self) -> AllocationReport {
        self.lock().report.clone()
    }

    /// True when every buffer handed out has been freed exactly once.
    pub fn is_balanced(&self) -> bool {
        let ledger = self.lock();
        ledger.live.is_empty()
            && ledger.report.double_frees == 0
            && ledger.report.foreign_frees == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<A: Allocator> Allocator for TrackingAllocator<A> {
    fn alloc(&self, size: usize) -> Result<Buffer> {
        let mut ledger = self.lock();

        if let Some(limit) = self.limit {
            let total = ledger.report.live_bytes.checked_add(size);
            if total.is_none_or(|total| total > limit) {
                ledger.report.failed_allocations += 1;
                return Err(TensorError::allocation(
                    size,
                    format!("limit of {} live bytes exceeded", limit),
                ));
            }
        }

        let buffer = match self.inner.alloc(size) {
            Ok(buffer) => buffer,
            Err(e) => {
                ledger.report.failed_allocations += 1;
                return Err(e);
            }
        };

        if let Some(id) = buffer.id() {
            ledger.live.insert(id, size);
            ledger.freed.remove(&id);
        }
        ledger.report.allocations += 1;
        ledger.report.live_buffers = ledger.live.len();
        ledger.report.live_bytes += size;
        ledger.report.peak_live_buffers = ledger
            .report
            .peak_live_buffers
            .max(ledger.report.live_buffers);

        Ok(buffer)
    }

    fn free(&self, buffer: Buffer) -> Option<Vec<u8>> {
        {
            let mut ledger = self.lock();
            match buffer.id() {
                Some(id) => {
                    if let Some(size) = ledger.live.remove(&id) {
                        ledger.freed.insert(id);
                        ledger.report.frees += 1;
                        ledger.report.live_buffers = ledger.live.len();
                        ledger.report.live_bytes -= size;
                    } else if ledger.freed.contains(&id) {
                        warn!("Double free of buffer {}", id);
                        ledger.report.double_frees += 1;
                    } else {
                        warn!("Free of unknown buffer {}", id);
                        ledger.report.foreign_frees += 1;
                    }
                }
                None => ledger.report.foreign_frees += 1,
            }
        }

        self.inner.free(buffer)
    }

    fn strategy(&self) -> FreeStrategy {
        self.inner.strategy()
    }
}
