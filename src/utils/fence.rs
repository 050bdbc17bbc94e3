//! Synchronization primitives for buffer and commit completion.
//!
//! Acquire fences gate reads of client buffers, release fences signal when a
//! previously scanned-out buffer may be reused, and the per-commit present
//! fence signals when a committed configuration became visible.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

/// State a [`Fence`] can be observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FenceState {
    /// The work guarded by the fence has not completed yet
    Pending,
    /// The fence fired, the guarded work completed successfully
    Signaled,
    /// The fence fired, but the guarded work failed.
    ///
    /// For an acquire fence this means the buffer never became ready.
    Error,
}

/// A fence that will be signaled in finite time
pub trait Fence: fmt::Debug + Send + Sync {
    /// Queries the state of the fence
    fn state(&self) -> FenceState;

    /// Blocks the current thread until the fence leaves [`FenceState::Pending`]
    fn wait(&self) -> FenceState;
}

/// A cloneable handle to a [`Fence`] that may also be empty.
///
/// An empty sync point behaves like an already signaled fence. This mirrors
/// the kernel convention of `-1` standing in for "no fence required".
#[derive(Debug, Clone, Default)]
pub struct SyncPoint {
    fence: Option<Arc<dyn Fence>>,
}

impl SyncPoint {
    /// Create an already signaled sync point
    pub fn signaled() -> Self {
        Self::default()
    }

    /// Queries the state of the sync point
    ///
    /// Always returns `true` in case the sync point does not contain a fence
    pub fn is_reached(&self) -> bool {
        self.fence
            .as_ref()
            .map(|f| f.state() != FenceState::Pending)
            .unwrap_or(true)
    }

    /// Whether the sync point fired with an error
    pub fn is_error(&self) -> bool {
        self.fence
            .as_ref()
            .map(|f| f.state() == FenceState::Error)
            .unwrap_or(false)
    }

    /// Blocks the current thread until the sync point is signaled
    ///
    /// If the sync point does not contain a fence this will never block.
    pub fn wait(&self) -> FenceState {
        match self.fence.as_ref() {
            Some(fence) => fence.wait(),
            None => FenceState::Signaled,
        }
    }
}

impl<T: Fence + 'static> From<T> for SyncPoint {
    fn from(value: T) -> Self {
        SyncPoint {
            fence: Some(Arc::new(value)),
        }
    }
}

impl From<Arc<dyn Fence>> for SyncPoint {
    fn from(fence: Arc<dyn Fence>) -> Self {
        SyncPoint { fence: Some(fence) }
    }
}

/// A software fence signaled from another thread of this process.
///
/// Used by the commit pipeline for release and present fences, where the
/// signal source is the observation of commit completion rather than
/// hardware.
#[derive(Debug, Clone)]
pub struct SwFence {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<FenceState>,
    cond: Condvar,
}

impl SwFence {
    /// Create a new fence in [`FenceState::Pending`]
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        SwFence {
            inner: Arc::new(Inner {
                state: Mutex::new(FenceState::Pending),
                cond: Condvar::new(),
            }),
        }
    }

    /// Signal successful completion. Signaling twice is a no-op.
    pub fn signal(&self) {
        self.fire(FenceState::Signaled);
    }

    /// Signal failed completion. Signaling twice is a no-op.
    pub fn signal_error(&self) {
        self.fire(FenceState::Error);
    }

    fn fire(&self, new: FenceState) {
        let mut state = self.inner.state.lock().unwrap();
        if *state == FenceState::Pending {
            *state = new;
            self.inner.cond.notify_all();
        }
    }
}

impl Fence for SwFence {
    fn state(&self) -> FenceState {
        *self.inner.state.lock().unwrap()
    }

    fn wait(&self) -> FenceState {
        let mut state = self.inner.state.lock().unwrap();
        while *state == FenceState::Pending {
            state = self.inner.cond.wait(state).unwrap();
        }
        *state
    }
}
