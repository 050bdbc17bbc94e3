//! The resource registry.
//!
//! Holds the hardware objects enumerated from the kernel at device
//! initialization (planes, CRTCs, connectors) together with their
//! capabilities. The registry is read-mostly after startup; plane
//! hot-unplug is out of scope and lookups of unknown handles are treated
//! as fatal configuration errors by callers.

use std::time::Duration;

use drm_fourcc::{DrmFourcc, DrmModifier};

use crate::device::{ConnectorHandle, CrtcHandle, PlaneHandle};
use crate::error::Error;
use crate::layer::{ColorSpace, Transform};
use crate::utils::{Physical, Size};

/// Kind of a hardware plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneType {
    /// The main scanout surface of a CRTC; also the recipient of the
    /// client-composited fallback output
    Primary,
    /// An additional scanout surface blended by the display engine
    Overlay,
    /// A small surface dedicated to the cursor image
    Cursor,
}

/// One pixel format supported by a plane, together with the buffer
/// modifiers accepted for it. An empty modifier list means the plane only
/// takes buffers with implicit layout for this format.
#[derive(Debug, Clone)]
pub struct PlaneFormat {
    /// Fourcc code of the format
    pub code: DrmFourcc,
    /// Explicit modifiers accepted for this format
    pub modifiers: Vec<DrmModifier>,
}

/// Capabilities of one hardware plane.
///
/// Created once at device initialization, identity immutable thereafter.
/// Per-frame assignment bookkeeping lives in the planner, not here.
#[derive(Debug, Clone)]
pub struct PlaneInfo {
    /// Kernel handle of the plane
    pub handle: PlaneHandle,
    /// Plane kind
    pub type_: PlaneType,
    /// CRTCs this plane can be routed to
    pub possible_crtcs: Vec<CrtcHandle>,
    /// Supported formats
    pub formats: Vec<PlaneFormat>,
    /// Supported zpos values, `None` if the plane has a fixed position
    pub zpos_range: Option<(u64, u64)>,
    /// Transforms the plane can apply during scanout
    pub rotations: Transform,
    /// Color encodings the plane can convert from. A layer with an
    /// undefined color space is always accepted.
    pub color_encodings: Vec<ColorSpace>,
}

impl PlaneInfo {
    /// Whether this plane can scan out `format` with the given modifier.
    ///
    /// `None` asks for implicit buffer layout, which every format entry
    /// accepts.
    pub fn supports_format(&self, format: DrmFourcc, modifier: Option<DrmModifier>) -> bool {
        self.formats.iter().any(|entry| {
            entry.code == format
                && match modifier {
                    None => true,
                    Some(modifier) => entry.modifiers.contains(&modifier),
                }
        })
    }

    /// Whether this plane can apply `transform` during scanout
    pub fn supports_transform(&self, transform: Transform) -> bool {
        self.rotations.contains(transform)
    }

    /// Whether this plane can represent the given color space
    pub fn supports_color_space(&self, space: ColorSpace) -> bool {
        space == ColorSpace::Undefined || self.color_encodings.contains(&space)
    }

    /// Number of distinct (format, modifier) combinations this plane takes.
    ///
    /// Used as the capability-generality measure when ordering planes.
    fn generality(&self) -> usize {
        self.formats
            .iter()
            .map(|entry| 1 + entry.modifiers.len())
            .sum()
    }

    fn can_drive(&self, crtc: CrtcHandle) -> bool {
        self.possible_crtcs.contains(&crtc)
    }
}

/// A display timing the hardware can drive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mode {
    /// Active area
    pub size: Size<i32, Physical>,
    /// Time between two vertical blanking periods
    pub vsync_period: Duration,
    /// Whether the connector prefers this mode
    pub preferred: bool,
}

impl Mode {
    /// Serialized form used for the kernel mode property blob
    pub(crate) fn blob_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(16);
        data.extend_from_slice(&self.size.w.to_le_bytes());
        data.extend_from_slice(&self.size.h.to_le_bytes());
        data.extend_from_slice(&(self.vsync_period.as_nanos() as u64).to_le_bytes());
        data
    }
}

/// A CRTC enumerated from the device
#[derive(Debug, Clone)]
pub struct CrtcInfo {
    /// Kernel handle of the CRTC
    pub handle: CrtcHandle,
}

/// A connector enumerated from the device
#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    /// Kernel handle of the connector
    pub handle: ConnectorHandle,
    /// Modes reported by the connector, in kernel order
    pub modes: Vec<Mode>,
}

/// The enumerated hardware resources of one device
#[derive(Debug)]
pub struct Registry {
    planes: Vec<PlaneInfo>,
    crtcs: Vec<CrtcInfo>,
    connectors: Vec<ConnectorInfo>,
    cursor_size: Size<u32, Physical>,
}

impl Registry {
    /// Build the registry from enumerated resources.
    ///
    /// `cursor_size` is the device-wide maximum cursor plane size.
    pub fn new(
        planes: Vec<PlaneInfo>,
        crtcs: Vec<CrtcInfo>,
        connectors: Vec<ConnectorInfo>,
        cursor_size: Size<u32, Physical>,
    ) -> Self {
        Registry {
            planes,
            crtcs,
            connectors,
            cursor_size,
        }
    }

    /// Maximum size of the cursor plane
    pub fn cursor_size(&self) -> Size<u32, Physical> {
        self.cursor_size
    }

    /// All planes routable to `crtc`, in deterministic preference order:
    /// the primary plane first, then overlays by ascending capability
    /// generality, the cursor plane last. Ties break by ascending handle.
    pub fn planes_for_crtc(&self, crtc: CrtcHandle) -> Result<Vec<&PlaneInfo>, Error> {
        self.crtc(crtc)?;
        let mut planes: Vec<&PlaneInfo> = self
            .planes
            .iter()
            .filter(|plane| plane.can_drive(crtc))
            .collect();
        planes.sort_by_key(|plane| {
            let class = match plane.type_ {
                PlaneType::Primary => 0usize,
                PlaneType::Overlay => 1,
                PlaneType::Cursor => 2,
            };
            (class, plane.generality(), plane.handle)
        });
        Ok(planes)
    }

    /// Whether `plane` can scan out `format` with the given modifier
    pub fn plane_supports_format(
        &self,
        plane: PlaneHandle,
        format: DrmFourcc,
        modifier: Option<DrmModifier>,
    ) -> Result<bool, Error> {
        Ok(self.plane(plane)?.supports_format(format, modifier))
    }

    /// Look up a plane by handle
    pub fn plane(&self, handle: PlaneHandle) -> Result<&PlaneInfo, Error> {
        self.planes
            .iter()
            .find(|plane| plane.handle == handle)
            .ok_or(Error::UnknownPlane(handle))
    }

    /// Look up a CRTC by handle
    pub fn crtc(&self, handle: CrtcHandle) -> Result<&CrtcInfo, Error> {
        self.crtcs
            .iter()
            .find(|crtc| crtc.handle == handle)
            .ok_or(Error::UnknownCrtc(handle))
    }

    /// Look up a connector by handle
    pub fn connector(&self, handle: ConnectorHandle) -> Option<&ConnectorInfo> {
        self.connectors.iter().find(|conn| conn.handle == handle)
    }
}
