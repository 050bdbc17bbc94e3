//! The commit pipeline.
//!
//! Commits are pipelined: one commit may be in flight in the kernel while
//! at most one further frame waits in the queue. Queueing a frame while
//! another is already waiting replaces the waiting frame; a frame that is
//! replaced before submission never reaches the screen and its present
//! fence fires with an error.
//!
//! Blob and fence lifetime is owned here. Property blobs referenced by a
//! request are destroyed only after the kernel acknowledged the commit,
//! release fences of replaced buffers fire when the commit scanning out
//! the new buffers completes.

use tracing::{debug, trace};

use crate::atomic::{AtomicRequest, FrameState};
use crate::device::{BlobId, CommitFlags, DeviceBackend};
use crate::error::{CommitError, Error};
use crate::layer::LayerId;
use crate::utils::{FenceState, SwFence, SyncPoint};

/// How a commit is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Wait for the commit to complete before returning
    Blocking,
    /// Return immediately; completion is observed via the present fence
    Nonblocking,
}

/// A frame handed to the pipeline for submission
#[derive(Debug)]
pub struct FrameSubmission {
    /// The atomic request realizing the frame
    pub request: AtomicRequest,
    /// Frame state the request establishes once committed
    pub frame: FrameState,
    /// Acquire fences of the buffers the frame scans out
    pub acquires: Vec<(LayerId, SyncPoint)>,
    /// Release fences of the buffers this frame replaces on screen
    pub releases: Vec<SwFence>,
    /// Whether the request may change the mode
    pub allow_modeset: bool,
}

#[derive(Debug)]
struct InFlight {
    device_sync: SyncPoint,
    frame: FrameState,
    blobs: Vec<BlobId>,
    releases: Vec<SwFence>,
    present: SwFence,
}

#[derive(Debug)]
struct Queued {
    submission: FrameSubmission,
    present: SwFence,
}

/// Per-display commit pipeline.
///
/// Tracks the frame state currently on screen, the commit in flight and
/// the single queued frame.
#[derive(Debug, Default)]
pub struct CommitPipeline {
    current: FrameState,
    pending: Option<InFlight>,
    queued: Option<Queued>,
}

impl CommitPipeline {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Frame state the next request must be diffed against.
    ///
    /// This is the last state actually handed to the kernel: the
    /// in-flight commit if one exists, otherwise the state on screen. A
    /// queued frame is never the baseline; it may still be replaced
    /// before submission, and a request diffed against state that never
    /// reached the kernel would lose the detach triples of the frame it
    /// replaced. Diffing two consecutive requests against the same
    /// baseline only yields redundant triples, which are harmless.
    pub fn framebuffer_state(&self) -> &FrameState {
        if let Some(pending) = &self.pending {
            &pending.frame
        } else {
            &self.current
        }
    }

    /// Whether no commit is in flight or queued
    pub fn is_idle(&self) -> bool {
        self.pending.is_none() && self.queued.is_none()
    }

    /// Validate `request` against the kernel without any hardware effect.
    pub fn test<D: DeviceBackend>(
        &self,
        device: &D,
        request: &AtomicRequest,
        allow_modeset: bool,
    ) -> Result<(), Error> {
        let mut flags = CommitFlags::TEST_ONLY;
        if allow_modeset {
            flags |= CommitFlags::ALLOW_MODESET;
        }
        device
            .atomic_commit(flags, request.properties())
            .map_err(CommitError::classify)?;
        Ok(())
    }

    /// Submit a frame.
    ///
    /// Pending acquire fences are waited on first; an acquire fence that
    /// fired with an error fails the frame without touching the kernel.
    /// On success the returned sync point fires once the frame is on
    /// screen.
    pub fn commit<D: DeviceBackend>(
        &mut self,
        device: &D,
        mut submission: FrameSubmission,
        mode: CommitMode,
    ) -> Result<SyncPoint, Error> {
        for (layer, acquire) in &submission.acquires {
            if acquire.wait() == FenceState::Error {
                destroy_blobs(device, submission.request.take_blobs());
                return Err(Error::AcquireFenceFailed(*layer));
            }
        }

        let present = SwFence::new();

        if self.pending.is_some() && mode == CommitMode::Nonblocking {
            if let Some(replaced) = self.queued.take() {
                trace!("replacing queued frame before submission");
                discard_frame(device, replaced);
            }
            let sync = SyncPoint::from(present.clone());
            self.queued = Some(Queued {
                submission,
                present,
            });
            return Ok(sync);
        }

        self.submit(device, submission, present, mode)
    }

    /// Process completion of the in-flight commit and submit the queued
    /// frame, if any.
    ///
    /// Called from the vsync handler and after blocking operations. An
    /// error refers to the submission of the queued frame; the frame is
    /// dropped and its present fence fires with an error.
    pub fn process_completions<D: DeviceBackend>(&mut self, device: &D) -> Result<(), Error> {
        if let Some(pending) = self.pending.take() {
            if !pending.device_sync.is_reached() {
                self.pending = Some(pending);
                return Ok(());
            }
            self.retire(device, pending);
        }

        if self.pending.is_none() {
            if let Some(queued) = self.queued.take() {
                let Queued {
                    submission,
                    present,
                } = queued;
                // a transient rejection re-queues inside submit
                self.submit(device, submission, present, CommitMode::Nonblocking)?;
            }
        }
        Ok(())
    }

    /// Block until everything handed to the pipeline has landed.
    pub fn drain<D: DeviceBackend>(&mut self, device: &D) -> Result<(), Error> {
        while !self.is_idle() {
            if let Some(pending) = &self.pending {
                pending.device_sync.wait();
            }
            self.process_completions(device)?;
        }
        Ok(())
    }

    fn submit<D: DeviceBackend>(
        &mut self,
        device: &D,
        mut submission: FrameSubmission,
        present: SwFence,
        mode: CommitMode,
    ) -> Result<SyncPoint, Error> {
        let mut flags = match mode {
            CommitMode::Blocking => CommitFlags::empty(),
            CommitMode::Nonblocking => CommitFlags::NONBLOCK | CommitFlags::PAGE_FLIP_EVENT,
        };
        if submission.allow_modeset {
            flags |= CommitFlags::ALLOW_MODESET;
        }

        let device_sync = match device.atomic_commit(flags, submission.request.properties()) {
            Ok(sync) => sync,
            Err(err) => {
                let err = CommitError::classify(err);
                if err.is_transient() && mode == CommitMode::Nonblocking {
                    trace!("commit rejected as busy, requeueing frame");
                    let sync = SyncPoint::from(present.clone());
                    self.queued = Some(Queued {
                        submission,
                        present,
                    });
                    return Ok(sync);
                }
                destroy_blobs(device, submission.request.take_blobs());
                present.signal_error();
                return Err(err.into());
            }
        };

        let inflight = InFlight {
            device_sync,
            frame: submission.frame,
            blobs: submission.request.take_blobs(),
            releases: submission.releases,
            present,
        };
        let sync = SyncPoint::from(inflight.present.clone());

        if mode == CommitMode::Blocking {
            inflight.device_sync.wait();
            self.retire(device, inflight);
        } else {
            self.pending = Some(inflight);
        }
        Ok(sync)
    }

    /// Finalize a completed commit: release the blobs it kept alive,
    /// fire the release fences of the buffers it replaced and publish its
    /// frame state.
    fn retire<D: DeviceBackend>(&mut self, device: &D, inflight: InFlight) {
        destroy_blobs(device, inflight.blobs);
        for release in inflight.releases {
            release.signal();
        }
        inflight.present.signal();
        self.current = inflight.frame;
    }

}

/// Drop a frame that never reached the kernel.
fn discard_frame<D: DeviceBackend>(device: &D, mut queued: Queued) {
    destroy_blobs(device, queued.submission.request.take_blobs());
    queued.present.signal_error();
    // release fences are dropped unsignaled; the display only hands
    // them out after a successful present
}

fn destroy_blobs<D: DeviceBackend>(device: &D, blobs: Vec<BlobId>) {
    for blob in blobs {
        if let Err(err) = device.destroy_blob(blob) {
            debug!(?blob, "failed to destroy property blob: {err}");
        }
    }
}
