//! The kernel mode-setting boundary.
//!
//! Everything the core needs from the kernel is funneled through
//! [`DeviceBackend`]: property enumeration, property blob lifetime, value
//! readback and the atomic property-set commit itself. The production
//! implementation wraps the device node ioctls; tests provide a software
//! double. The request format is a flat list of (object, property, value)
//! triples and maps 1:1 onto the kernel atomic ioctl.

use std::fmt;
use std::io;

use crate::utils::SyncPoint;

/// Raw id of any kernel mode-setting object (plane, CRTC, connector)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

/// Id of a property exposed by a kernel object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyId(pub u32);

/// Id of a kernel property blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobId(pub u32);

/// Handle of a hardware plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaneHandle(pub u32);

/// Handle of a CRTC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CrtcHandle(pub u32);

/// Handle of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectorHandle(pub u32);

/// Id of an imported framebuffer object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferId(pub u32);

impl From<PlaneHandle> for ObjectId {
    fn from(handle: PlaneHandle) -> Self {
        ObjectId(handle.0)
    }
}

impl From<CrtcHandle> for ObjectId {
    fn from(handle: CrtcHandle) -> Self {
        ObjectId(handle.0)
    }
}

impl From<ConnectorHandle> for ObjectId {
    fn from(handle: ConnectorHandle) -> Self {
        ObjectId(handle.0)
    }
}

bitflags::bitflags! {
    /// Flags controlling how an atomic commit is executed
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommitFlags: u32 {
        /// Validate the request without any hardware effect
        const TEST_ONLY = 1 << 0;
        /// Return immediately, completion is delivered via the returned fence
        const NONBLOCK = 1 << 1;
        /// The request is allowed to change the mode
        const ALLOW_MODESET = 1 << 2;
        /// Request a page-flip completion event
        const PAGE_FLIP_EVENT = 1 << 3;
    }
}

/// One entry of a kernel object's property table
#[derive(Debug, Clone)]
pub struct PropertyInfo {
    /// Property id, stable for the lifetime of the device
    pub id: PropertyId,
    /// Kernel property name, e.g. `"FB_ID"`
    pub name: String,
}

/// A single (object, property, value) assignment within an atomic request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyTriple {
    /// Target object
    pub object: ObjectId,
    /// Property to set
    pub property: PropertyId,
    /// Raw 64-bit property value
    pub value: u64,
}

/// Access to a kernel mode-setting device.
///
/// Errors are reported as [`io::Error`] carrying the kernel errno; the
/// commit pipeline classifies them into transient and permanent failures.
pub trait DeviceBackend: fmt::Debug + Send + Sync {
    /// Fetch the property table of a kernel object.
    ///
    /// The result is cached by the caller, the kernel is only consulted once
    /// per object in steady state.
    fn object_properties(&self, object: ObjectId) -> io::Result<Vec<PropertyInfo>>;

    /// Read back the current value of a property.
    fn property_value(&self, object: ObjectId, property: PropertyId) -> io::Result<u64>;

    /// Create a property blob owned by the caller.
    fn create_blob(&self, data: &[u8]) -> io::Result<BlobId>;

    /// Destroy a previously created property blob.
    fn destroy_blob(&self, blob: BlobId) -> io::Result<()>;

    /// Submit an atomic property-set request.
    ///
    /// On success the returned [`SyncPoint`] signals once the new
    /// configuration is visible. For [`CommitFlags::TEST_ONLY`] and blocking
    /// commits the sync point is already signaled on return.
    fn atomic_commit(&self, flags: CommitFlags, props: &[PropertyTriple]) -> io::Result<SyncPoint>;
}
