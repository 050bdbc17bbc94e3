//! Client-visible layers and their buffered property updates.
//!
//! Property writes are staged into a [`LayerProperties`] set and only take
//! effect atomically when the display is validated. Nothing is applied
//! layer-by-layer mid-frame, so a plan always sees a consistent layer
//! configuration.

use drm_fourcc::{DrmFourcc, DrmModifier};

use crate::utils::{Buffer, Physical, Rectangle, Size, SyncPoint};

/// Handle of a layer, unique per display.
///
/// Handles are allocated in creation order and never reused, so ordering
/// by handle is ordering by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub u64);

/// Opaque client buffer handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

bitflags::bitflags! {
    /// Transform applied to a layer during composition, composed of flips
    /// and a single 90 degree rotation
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Transform: u32 {
        /// Mirror horizontally
        const FLIP_H = 1 << 0;
        /// Mirror vertically
        const FLIP_V = 1 << 1;
        /// Rotate by 90 degrees clockwise
        const ROTATE_90 = 1 << 2;
    }
}

/// Blending applied between a layer and the content below it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    /// The client did not specify a blend mode
    #[default]
    Undefined,
    /// The layer is opaque
    None,
    /// Alpha-blended, color channels are premultiplied
    Premultiplied,
    /// Alpha-blended, alpha acts as coverage
    Coverage,
}

/// Color space of a layer's pixel data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ColorSpace {
    /// The client did not specify a color space
    #[default]
    Undefined,
    /// ITU-R BT.601
    Rec601,
    /// ITU-R BT.709
    Rec709,
    /// ITU-R BT.2020
    Rec2020,
}

/// Quantization range of a layer's pixel data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SampleRange {
    /// The client did not specify a range
    #[default]
    Undefined,
    /// Full range
    Full,
    /// Limited (studio) range
    Limited,
}

/// How a layer is composited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CompositionType {
    /// Scanned out directly on a hardware plane
    Device,
    /// Rendered into the client target by the display server
    Client,
    /// Scanned out on the cursor plane
    Cursor,
    /// A solid fill without a backing buffer
    SolidColor,
    /// Not a valid composition type; forced to client composition
    Invalid,
}

/// A client buffer attached to a layer, together with the metadata the
/// planner needs to place it on a plane
#[derive(Debug, Clone)]
pub struct BufferSlot {
    /// Opaque buffer handle, resolved to a framebuffer by the importer
    pub handle: BufferHandle,
    /// Fence gating reads of the buffer contents
    pub acquire: SyncPoint,
    /// Pixel format of the buffer
    pub format: DrmFourcc,
    /// Buffer modifier, `None` for implicit layout
    pub modifier: Option<DrmModifier>,
    /// Buffer dimensions
    pub size: Size<i32, Buffer>,
}

/// Staged layer property updates.
///
/// Every field is optional; only present fields are merged on a set call.
#[derive(Debug, Clone, Default)]
pub struct LayerProperties {
    /// New buffer and acquire fence
    pub buffer: Option<BufferSlot>,
    /// Crop within the buffer that is sampled
    pub source_crop: Option<Rectangle<f64, Buffer>>,
    /// Destination rectangle on the display
    pub display_frame: Option<Rectangle<i32, Physical>>,
    /// Stacking position, higher is closer to the viewer
    pub z_order: Option<u32>,
    /// Global plane alpha in `0.0..=1.0`
    pub alpha: Option<f32>,
    /// Blend mode
    pub blend_mode: Option<BlendMode>,
    /// Transform applied during composition
    pub transform: Option<Transform>,
    /// Color space of the pixel data
    pub color_space: Option<ColorSpace>,
    /// Quantization range of the pixel data
    pub sample_range: Option<SampleRange>,
    /// Requested composition type
    pub composition_type: Option<CompositionType>,
    /// RGBA fill for solid-color layers
    pub solid_color: Option<[u8; 4]>,
}

impl LayerProperties {
    fn merge(&mut self, other: LayerProperties) {
        macro_rules! take {
            ($($field:ident),+) => {
                $(if let Some(value) = other.$field {
                    self.$field = Some(value);
                })+
            };
        }
        take!(
            buffer,
            source_crop,
            display_frame,
            z_order,
            alpha,
            blend_mode,
            transform,
            color_space,
            sample_range,
            composition_type,
            solid_color
        );
    }

    fn is_empty(&self) -> bool {
        self.buffer.is_none()
            && self.source_crop.is_none()
            && self.display_frame.is_none()
            && self.z_order.is_none()
            && self.alpha.is_none()
            && self.blend_mode.is_none()
            && self.transform.is_none()
            && self.color_space.is_none()
            && self.sample_range.is_none()
            && self.composition_type.is_none()
            && self.solid_color.is_none()
    }
}

/// A compositable surface owned by a display
#[derive(Debug)]
pub struct Layer {
    id: LayerId,
    buffer: Option<BufferSlot>,
    source_crop: Rectangle<f64, Buffer>,
    display_frame: Rectangle<i32, Physical>,
    z_order: u32,
    alpha: f32,
    blend_mode: BlendMode,
    transform: Transform,
    color_space: ColorSpace,
    sample_range: SampleRange,
    composition_hint: CompositionType,
    solid_color: [u8; 4],
    staged: LayerProperties,
}

impl Layer {
    pub(crate) fn new(id: LayerId) -> Self {
        Layer {
            id,
            buffer: None,
            source_crop: Rectangle::zero(),
            display_frame: Rectangle::zero(),
            z_order: 0,
            alpha: 1.0,
            blend_mode: BlendMode::Undefined,
            transform: Transform::empty(),
            color_space: ColorSpace::Undefined,
            sample_range: SampleRange::Undefined,
            composition_hint: CompositionType::Device,
            solid_color: [0; 4],
            staged: LayerProperties::default(),
        }
    }

    /// Handle of this layer
    pub fn id(&self) -> LayerId {
        self.id
    }

    /// Stage a property update. Takes effect on the next validate.
    pub(crate) fn stage(&mut self, props: LayerProperties) {
        self.staged.merge(props);
    }

    /// Whether any staged update is waiting for the next validate
    pub(crate) fn has_staged(&self) -> bool {
        !self.staged.is_empty()
    }

    /// Apply all staged updates. Called once per validate.
    pub(crate) fn apply_staged(&mut self) {
        let staged = std::mem::take(&mut self.staged);
        if let Some(buffer) = staged.buffer {
            self.buffer = Some(buffer);
        }
        if let Some(crop) = staged.source_crop {
            self.source_crop = crop;
        }
        if let Some(frame) = staged.display_frame {
            self.display_frame = frame;
        }
        if let Some(z) = staged.z_order {
            self.z_order = z;
        }
        if let Some(alpha) = staged.alpha {
            self.alpha = alpha.clamp(0.0, 1.0);
        }
        if let Some(blend) = staged.blend_mode {
            self.blend_mode = blend;
        }
        if let Some(transform) = staged.transform {
            self.transform = transform;
        }
        if let Some(space) = staged.color_space {
            self.color_space = space;
        }
        if let Some(range) = staged.sample_range {
            self.sample_range = range;
        }
        if let Some(type_) = staged.composition_type {
            self.composition_hint = type_;
        }
        if let Some(color) = staged.solid_color {
            self.solid_color = color;
        }
    }

    /// Currently attached buffer
    pub fn buffer(&self) -> Option<&BufferSlot> {
        self.buffer.as_ref()
    }

    /// Sampled region of the buffer
    pub fn source_crop(&self) -> Rectangle<f64, Buffer> {
        self.source_crop
    }

    /// Destination rectangle on the display
    pub fn display_frame(&self) -> Rectangle<i32, Physical> {
        self.display_frame
    }

    /// Stacking position
    pub fn z_order(&self) -> u32 {
        self.z_order
    }

    /// Plane alpha
    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Blend mode
    pub fn blend_mode(&self) -> BlendMode {
        self.blend_mode
    }

    /// Composition transform
    pub fn transform(&self) -> Transform {
        self.transform
    }

    /// Color space of the pixel data
    pub fn color_space(&self) -> ColorSpace {
        self.color_space
    }

    /// Quantization range of the pixel data
    pub fn sample_range(&self) -> SampleRange {
        self.sample_range
    }

    /// Composition type last requested by the client
    pub fn composition_hint(&self) -> CompositionType {
        self.composition_hint
    }

    /// Fill color for solid-color layers
    pub fn solid_color(&self) -> [u8; 4] {
        self.solid_color
    }

    pub(crate) fn set_composition_hint(&mut self, type_: CompositionType) {
        self.composition_hint = type_;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_writes_only_apply_on_validate() {
        let mut layer = Layer::new(LayerId(1));
        layer.stage(LayerProperties {
            z_order: Some(3),
            alpha: Some(0.5),
            ..Default::default()
        });

        assert_eq!(layer.z_order(), 0);
        assert_eq!(layer.alpha(), 1.0);
        assert!(layer.has_staged());

        layer.apply_staged();
        assert_eq!(layer.z_order(), 3);
        assert_eq!(layer.alpha(), 0.5);
        assert!(!layer.has_staged());
    }

    #[test]
    fn later_stage_wins_per_field() {
        let mut layer = Layer::new(LayerId(1));
        layer.stage(LayerProperties {
            z_order: Some(3),
            blend_mode: Some(BlendMode::Coverage),
            ..Default::default()
        });
        layer.stage(LayerProperties {
            z_order: Some(7),
            ..Default::default()
        });

        layer.apply_staged();
        assert_eq!(layer.z_order(), 7);
        assert_eq!(layer.blend_mode(), BlendMode::Coverage);
    }

    #[test]
    fn alpha_is_clamped() {
        let mut layer = Layer::new(LayerId(1));
        layer.stage(LayerProperties {
            alpha: Some(7.5),
            ..Default::default()
        });
        layer.apply_staged();
        assert_eq!(layer.alpha(), 1.0);
    }
}
