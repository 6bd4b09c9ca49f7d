//! Release of a caller-held host lock around blocking calls.
//!
//! Embedders that drive the runner from an interpreter with a global lock
//! register a [`HostLock`]. `push` and `pop` release it for as long as they
//! may block and take it back before returning.

/// A coarse lock held by the calling thread outside the pipeline.
pub trait HostLock: Send + Sync {
    /// Give up the lock held by the current thread.
    fn release(&self);

    /// Take the lock back on the current thread.
    fn reacquire(&self);
}

/// Scoped release: the lock is released on construction and reacquired on
/// drop, including on early return.
pub(crate) struct ReleasedHostLock<'a> {
    lock: Option<&'a dyn HostLock>,
}

impl<'a> ReleasedHostLock<'a> {
    pub(crate) fn new(lock: Option<&'a dyn HostLock>) -> Self {
        if let Some(lock) = lock {
            lock.release();
        }
        Self { lock }
    }
}

impl Drop for ReleasedHostLock<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock {
            lock.reacquire();
        }
    }
}
