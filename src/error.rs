use std::io;

use crate::device::{ConnectorHandle, CrtcHandle, ObjectId, PlaneHandle};
use crate::display::{ConfigId, DisplayId, DisplayState};
use crate::layer::LayerId;

/// Errors reported by the compositor core
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The client passed a display handle that does not exist
    #[error("Unknown display handle {0:?}")]
    BadDisplay(DisplayId),
    /// The client passed a layer handle that does not exist on this display
    #[error("Unknown layer handle {0:?}")]
    BadLayer(LayerId),
    /// The client requested a display config that does not exist
    #[error("Unknown display config {0:?}")]
    BadConfig(ConfigId),
    /// Registry lookup of a CRTC that was never enumerated
    #[error("Crtc {0:?} is not part of the device resources")]
    UnknownCrtc(CrtcHandle),
    /// Registry lookup of a plane that was never enumerated
    #[error("Plane {0:?} is not part of the device resources")]
    UnknownPlane(PlaneHandle),
    /// Registry lookup of a connector that was never enumerated
    #[error("Connector {0:?} is not part of the device resources")]
    UnknownConnector(ConnectorHandle),
    /// A display was created on a connector without any modes
    #[error("Connector {0:?} reports no display modes")]
    NoModes(ConnectorHandle),
    /// A kernel object is missing a property the builder requires.
    ///
    /// This indicates the planner picked an incapable plane and is fatal.
    #[error("Object {object:?} is missing required property '{name}'")]
    UnknownProperty {
        /// Object whose property table was consulted
        object: ObjectId,
        /// Name of the missing property
        name: &'static str,
    },
    /// `present` was called without a prior, still valid `validate`
    #[error("Display has not been validated for the current layer configuration")]
    NotValidated,
    /// A call arrived in a display state that does not permit it
    #[error("Call `{call}` is not legal in display state {state:?}")]
    InvalidState {
        /// Client call that was rejected
        call: &'static str,
        /// State the display was in
        state: DisplayState,
    },
    /// The display is powered off
    #[error("Display {0:?} is powered off")]
    DisplayOff(DisplayId),
    /// An acquire fence signaled an error, the buffer never became ready
    #[error("Acquire fence of layer {0:?} signaled an error")]
    AcquireFenceFailed(LayerId),
    /// The client target's acquire fence signaled an error
    #[error("Acquire fence of the client target signaled an error")]
    ClientTargetFenceFailed,
    /// The device rejected or failed a request outside of the commit path
    #[error("Device access error: {errmsg}")]
    Access {
        /// Description of the failed access
        errmsg: &'static str,
        /// Underlying device error
        #[source]
        source: io::Error,
    },
    /// The atomic commit failed
    #[error(transparent)]
    Commit(#[from] CommitError),
}

/// Failures of the atomic commit itself, split by retry policy
#[derive(thiserror::Error, Debug)]
pub enum CommitError {
    /// Transient kernel rejection (EBUSY/EAGAIN); retry the same request
    /// after the pending commit completes or on the next vsync
    #[error("Atomic commit rejected as busy, retry after the pending commit completes")]
    Busy,
    /// Permanent kernel rejection (EINVAL); the plan is invalid and must be
    /// discarded, the offending layers fall back to client composition on
    /// the next validate
    #[error("Atomic commit rejected as invalid, the plan must be rebuilt")]
    InvalidRequest(#[source] io::Error),
    /// Any other device error
    #[error("Atomic commit failed")]
    Device(#[source] io::Error),
}

impl CommitError {
    /// Classify a kernel commit failure by its retry policy.
    pub(crate) fn classify(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => CommitError::Busy,
            io::ErrorKind::InvalidInput => CommitError::InvalidRequest(err),
            _ => match err.raw_os_error() {
                // EBUSY and EAGAIN are transient
                Some(16) | Some(11) => CommitError::Busy,
                Some(22) => CommitError::InvalidRequest(err),
                _ => CommitError::Device(err),
            },
        }
    }

    /// Whether retrying the identical request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, CommitError::Busy)
    }
}
