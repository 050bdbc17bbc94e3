//! Translation of a [`CompositionPlan`] into an atomic property-set request.
//!
//! Property tables are fetched once per kernel object and cached; the
//! registry is static for the process lifetime, so the cache is only ever
//! invalidated explicitly. A missing required property at build time means
//! the planner picked an incapable plane, which is a fatal configuration
//! error rather than a per-frame condition.

use indexmap::IndexMap;
use tracing::trace;

use crate::device::{
    BlobId, ConnectorHandle, CrtcHandle, DeviceBackend, FramebufferId, ObjectId, PlaneHandle,
    PropertyId, PropertyTriple,
};
use crate::display::ClientTarget;
use crate::error::Error;
use crate::layer::{BlendMode, BufferSlot, ColorSpace, CompositionType, Layer, LayerId, SampleRange, Transform};
use crate::planner::CompositionPlan;
use crate::registry::Mode;
use crate::utils::{Physical, Rectangle, Size};

/// Resolves client buffer handles to kernel framebuffer objects.
///
/// Buffer import is an external concern; implementations are expected to
/// cache per-buffer results across frames.
pub trait FramebufferImporter: std::fmt::Debug + Send {
    /// Import `buffer` and return the framebuffer id to scan out
    fn import(&mut self, buffer: &BufferSlot) -> Result<FramebufferId, Error>;
}

/// Cache of kernel object property tables.
///
/// Each object's table is fetched once and then served from memory.
#[derive(Debug, Default)]
pub struct PropertyCache {
    objects: IndexMap<ObjectId, IndexMap<String, PropertyId>>,
}

impl PropertyCache {
    /// Resolve a property the request cannot be built without
    pub fn prop<D: DeviceBackend>(
        &mut self,
        device: &D,
        object: impl Into<ObjectId>,
        name: &'static str,
    ) -> Result<PropertyId, Error> {
        let object = object.into();
        self.try_prop(device, object, name)?
            .ok_or(Error::UnknownProperty { object, name })
    }

    /// Resolve a property that may legitimately be absent
    pub fn try_prop<D: DeviceBackend>(
        &mut self,
        device: &D,
        object: impl Into<ObjectId>,
        name: &'static str,
    ) -> Result<Option<PropertyId>, Error> {
        let object = object.into();
        if !self.objects.contains_key(&object) {
            let table = device
                .object_properties(object)
                .map_err(|source| Error::Access {
                    errmsg: "Error loading object properties",
                    source,
                })?;
            self.objects.insert(
                object,
                table.into_iter().map(|info| (info.name, info.id)).collect(),
            );
        }
        Ok(self.objects.get(&object).and_then(|table| table.get(name)).copied())
    }

    /// Drop the cached table of `object`.
    ///
    /// Only needed if an object's capability set changed, which is not
    /// expected in steady state.
    pub fn invalidate(&mut self, object: impl Into<ObjectId>) {
        self.objects.shift_remove(&object.into());
    }
}

/// A batched atomic property-set request.
///
/// Owns any property blobs allocated while building; they must outlive the
/// commit and are released only after the kernel acknowledged it.
#[derive(Debug, Default)]
pub struct AtomicRequest {
    props: Vec<PropertyTriple>,
    blobs: Vec<BlobId>,
}

impl AtomicRequest {
    pub(crate) fn add(&mut self, object: impl Into<ObjectId>, property: PropertyId, value: u64) {
        self.props.push(PropertyTriple {
            object: object.into(),
            property,
            value,
        });
    }

    /// The (object, property, value) triples of this request
    pub fn properties(&self) -> &[PropertyTriple] {
        &self.props
    }

    /// Blobs owned by this request
    pub fn blobs(&self) -> &[BlobId] {
        &self.blobs
    }

    /// Whether the request carries no property changes
    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    pub(crate) fn take_blobs(&mut self) -> Vec<BlobId> {
        std::mem::take(&mut self.blobs)
    }
}

/// Contents of one plane after a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneContent {
    /// Layer scanned out on the plane, `None` for the client target
    pub layer: Option<LayerId>,
    /// Framebuffer bound to the plane
    pub fb: FramebufferId,
}

/// The plane-to-content bindings established by a commit.
///
/// The previous frame state is diffed against the next plan to emit
/// detach triples for planes losing their assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameState {
    planes: IndexMap<PlaneHandle, PlaneContent>,
    crtc_active: bool,
}

impl FrameState {
    /// Content of `plane`, if the frame assigned it
    pub fn content(&self, plane: PlaneHandle) -> Option<&PlaneContent> {
        self.planes.get(&plane)
    }

    /// Framebuffer bound to `plane`, if any
    pub fn fb_of(&self, plane: PlaneHandle) -> Option<FramebufferId> {
        self.planes.get(&plane).map(|content| content.fb)
    }

    /// Planes assigned by this frame
    pub fn assigned_planes(&self) -> impl Iterator<Item = PlaneHandle> + '_ {
        self.planes.keys().copied()
    }

    /// Layers scanned out by this frame
    pub fn layers(&self) -> impl Iterator<Item = LayerId> + '_ {
        self.planes.values().filter_map(|content| content.layer)
    }

    /// Whether the CRTC is active after this frame
    pub fn crtc_active(&self) -> bool {
        self.crtc_active
    }
}

/// Everything a request is built from
#[derive(Debug)]
pub struct RequestArgs<'a> {
    /// The plan produced by the last validate
    pub plan: &'a CompositionPlan,
    /// The display's layers
    pub layers: &'a IndexMap<LayerId, Layer>,
    /// CRTC driving the display
    pub crtc: CrtcHandle,
    /// Connector the CRTC scans out to
    pub connector: ConnectorHandle,
    /// Active area of the current mode
    pub display_size: Size<i32, Physical>,
    /// Mode to switch to, if a config change is staged
    pub mode: Option<&'a Mode>,
    /// CRTC active state to apply, if it changed
    pub active: Option<bool>,
    /// Client-composited fallback output
    pub client_target: Option<&'a ClientTarget>,
    /// Frame state of the previous commit
    pub previous: &'a FrameState,
}

/// Build the atomic request realizing `args.plan`.
///
/// Returns the request and the frame state it will establish once
/// committed.
pub fn build_request<D, F>(
    device: &D,
    importer: &mut F,
    cache: &mut PropertyCache,
    args: &RequestArgs<'_>,
) -> Result<(AtomicRequest, FrameState), Error>
where
    D: DeviceBackend,
    F: FramebufferImporter,
{
    let mut req = AtomicRequest::default();
    let mut next = FrameState {
        planes: IndexMap::new(),
        crtc_active: args.previous.crtc_active,
    };

    // Mode changes allocate a blob owned by the request; released after
    // the kernel acknowledges the commit.
    if let Some(mode) = args.mode {
        let blob = device
            .create_blob(&mode.blob_data())
            .map_err(|source| Error::Access {
                errmsg: "Error creating mode blob",
                source,
            })?;
        req.blobs.push(blob);
        let mode_prop = cache.prop(device, args.crtc, "MODE_ID")?;
        req.add(args.crtc, mode_prop, blob.0 as u64);
        let conn_crtc = cache.prop(device, args.connector, "CRTC_ID")?;
        req.add(args.connector, conn_crtc, args.crtc.0 as u64);
    }

    let want_active = args.active.unwrap_or(next.crtc_active) || args.mode.is_some();
    // Setting the same active state twice fails the commit on some kernels
    if want_active != args.previous.crtc_active || (args.mode.is_some() && !args.previous.crtc_active) {
        let active_prop = cache.prop(device, args.crtc, "ACTIVE")?;
        req.add(args.crtc, active_prop, u64::from(want_active));
    }
    next.crtc_active = want_active;

    // zpos values follow the stacking order of everything that ends up on
    // a plane, client target included.
    let ranks = scanout_ranks(args);

    for entry in args.plan.entries() {
        let Some(plane) = entry.plane else {
            continue;
        };
        let layer = args
            .layers
            .get(&entry.layer)
            .ok_or(Error::BadLayer(entry.layer))?;
        let buffer = layer.buffer().ok_or(Error::BadLayer(entry.layer))?;
        let fb = importer.import(buffer)?;
        let zpos = ranks.get(&Surface::Layer(entry.layer)).copied().unwrap_or(0);
        push_plane_state(
            device,
            cache,
            &mut req,
            plane,
            args.crtc,
            fb,
            layer.source_crop(),
            clipped_frame(layer.display_frame(), args.display_size),
            zpos,
            layer.alpha(),
            layer.blend_mode(),
            layer.transform(),
            layer.color_space(),
            layer.sample_range(),
        )?;
        next.planes.insert(
            plane,
            PlaneContent {
                layer: Some(entry.layer),
                fb,
            },
        );
    }

    // The client-composited output covers the full display on the plane
    // the plan reserved for it.
    if let Some(plane) = args.plan.client_target_plane() {
        if let Some(target) = args.client_target {
            let fb = importer.import(&target.buffer)?;
            let zpos = ranks.get(&Surface::ClientTarget).copied().unwrap_or(0);
            push_plane_state(
                device,
                cache,
                &mut req,
                plane,
                args.crtc,
                fb,
                Rectangle::from_loc_and_size((0.0, 0.0), target.buffer.size.to_f64()),
                Rectangle::from_loc_and_size((0, 0), args.display_size),
                zpos,
                1.0,
                BlendMode::Premultiplied,
                Transform::empty(),
                target.color_space,
                target.sample_range,
            )?;
            next.planes.insert(plane, PlaneContent { layer: None, fb });
        } else {
            trace!(?plane, "client composition required but no client target set");
        }
    }

    // Planes losing their assignment are detached so the kernel stops
    // scanning out stale framebuffers.
    for plane in args.previous.assigned_planes() {
        if next.planes.contains_key(&plane) {
            continue;
        }
        let fb_prop = cache.prop(device, plane, "FB_ID")?;
        let crtc_prop = cache.prop(device, plane, "CRTC_ID")?;
        req.add(plane, fb_prop, 0);
        req.add(plane, crtc_prop, 0);
    }

    Ok((req, next))
}

/// Re-derive plane-to-framebuffer bindings from a kernel readback.
///
/// Used to verify that a committed request took effect as planned.
pub fn read_back_frame<D: DeviceBackend>(
    device: &D,
    cache: &mut PropertyCache,
    planes: &[PlaneHandle],
) -> Result<FrameState, Error> {
    let mut state = FrameState::default();
    for &plane in planes {
        let fb_prop = cache.prop(device, plane, "FB_ID")?;
        let value = device
            .property_value(plane.into(), fb_prop)
            .map_err(|source| Error::Access {
                errmsg: "Error reading back plane state",
                source,
            })?;
        if value != 0 {
            state.planes.insert(
                plane,
                PlaneContent {
                    layer: None,
                    fb: FramebufferId(value as u32),
                },
            );
        }
    }
    Ok(state)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Surface {
    Layer(LayerId),
    ClientTarget,
}

/// Stacking rank of every surface that ends up on a plane, bottom is 0.
/// The client target sits at the z of the topmost client-composited layer.
fn scanout_ranks(args: &RequestArgs<'_>) -> IndexMap<Surface, u64> {
    let mut surfaces: Vec<(Surface, u32, LayerId)> = Vec::new();
    let mut client_top: Option<(u32, LayerId)> = None;
    for entry in args.plan.entries() {
        let Some(layer) = args.layers.get(&entry.layer) else {
            continue;
        };
        if entry.plane.is_some() {
            surfaces.push((Surface::Layer(entry.layer), layer.z_order(), entry.layer));
        } else if entry.composition == CompositionType::Client {
            let candidate = (layer.z_order(), entry.layer);
            if client_top.map(|top| candidate > top).unwrap_or(true) {
                client_top = Some(candidate);
            }
        }
    }
    if args.plan.client_target_plane().is_some() {
        if let Some((z, id)) = client_top {
            surfaces.push((Surface::ClientTarget, z, id));
        }
    }
    surfaces.sort_by_key(|&(_, z, id)| (z, id));
    surfaces
        .into_iter()
        .enumerate()
        .map(|(rank, (surface, _, _))| (surface, rank as u64))
        .collect()
}

fn clipped_frame(
    frame: Rectangle<i32, Physical>,
    display_size: Size<i32, Physical>,
) -> Rectangle<i32, Physical> {
    frame
        .intersection(Rectangle::from_loc_and_size((0, 0), display_size))
        .unwrap_or_else(Rectangle::zero)
}

#[allow(clippy::too_many_arguments)]
fn push_plane_state<D: DeviceBackend>(
    device: &D,
    cache: &mut PropertyCache,
    req: &mut AtomicRequest,
    plane: PlaneHandle,
    crtc: CrtcHandle,
    fb: FramebufferId,
    src: Rectangle<f64, crate::utils::Buffer>,
    dst: Rectangle<i32, Physical>,
    zpos: u64,
    alpha: f32,
    blend: BlendMode,
    transform: Transform,
    color_space: ColorSpace,
    sample_range: SampleRange,
) -> Result<(), Error> {
    let object: ObjectId = plane.into();

    let crtc_prop = cache.prop(device, plane, "CRTC_ID")?;
    req.add(plane, crtc_prop, crtc.0 as u64);
    let fb_prop = cache.prop(device, plane, "FB_ID")?;
    req.add(plane, fb_prop, fb.0 as u64);

    // source rectangles are 16.16 fixed point
    let src_props = [
        ("SRC_X", src.loc.x),
        ("SRC_Y", src.loc.y),
        ("SRC_W", src.size.w),
        ("SRC_H", src.size.h),
    ];
    for (name, value) in src_props {
        let prop = cache.prop(device, plane, name)?;
        req.add(plane, prop, to_fixed(value));
    }

    let dst_props = [
        ("CRTC_X", dst.loc.x as i64),
        ("CRTC_Y", dst.loc.y as i64),
        ("CRTC_W", dst.size.w as i64),
        ("CRTC_H", dst.size.h as i64),
    ];
    for (name, value) in dst_props {
        let prop = cache.prop(device, plane, name)?;
        req.add(plane, prop, value as u64);
    }

    if let Some(prop) = cache.try_prop(device, plane, "zpos")? {
        req.add(plane, prop, zpos);
    }

    if let Some(prop) = cache.try_prop(device, plane, "alpha")? {
        req.add(plane, prop, (alpha * u16::MAX as f32).round() as u64);
    } else if alpha != 1.0 {
        // without the property we can not honor translucency
        return Err(Error::UnknownProperty {
            object,
            name: "alpha",
        });
    }

    if let Some(prop) = cache.try_prop(device, plane, "rotation")? {
        req.add(plane, prop, rotation_value(transform));
    } else if transform != Transform::empty() {
        return Err(Error::UnknownProperty {
            object,
            name: "rotation",
        });
    }

    if let Some(prop) = cache.try_prop(device, plane, "pixel blend mode")? {
        req.add(plane, prop, blend_value(blend));
    } else if blend == BlendMode::Coverage {
        // only coverage blending has no sane fallback
        return Err(Error::UnknownProperty {
            object,
            name: "pixel blend mode",
        });
    }

    if color_space != ColorSpace::Undefined {
        let prop = cache
            .try_prop(device, plane, "COLOR_ENCODING")?
            .ok_or(Error::UnknownProperty {
                object,
                name: "COLOR_ENCODING",
            })?;
        req.add(plane, prop, color_encoding_value(color_space));
    }

    if sample_range != SampleRange::Undefined {
        let prop = cache
            .try_prop(device, plane, "COLOR_RANGE")?
            .ok_or(Error::UnknownProperty {
                object,
                name: "COLOR_RANGE",
            })?;
        req.add(plane, prop, color_range_value(sample_range));
    }

    Ok(())
}

fn to_fixed(value: f64) -> u64 {
    // a negative coordinate would wrap in the cast; clamp to the buffer
    // origin instead
    (value.max(0.0) * 65536.0).round() as u64
}

fn rotation_value(transform: Transform) -> u64 {
    // kernel rotation bitmask: rotate-0/90 and the two reflections
    let mut value = if transform.contains(Transform::ROTATE_90) {
        1 << 1
    } else {
        1 << 0
    };
    if transform.contains(Transform::FLIP_H) {
        value |= 1 << 4;
    }
    if transform.contains(Transform::FLIP_V) {
        value |= 1 << 5;
    }
    value
}

fn blend_value(blend: BlendMode) -> u64 {
    match blend {
        // undefined blending behaves like premultiplied
        BlendMode::Premultiplied | BlendMode::Undefined => 0,
        BlendMode::None => 1,
        BlendMode::Coverage => 2,
    }
}

fn color_encoding_value(space: ColorSpace) -> u64 {
    match space {
        ColorSpace::Undefined | ColorSpace::Rec601 => 0,
        ColorSpace::Rec709 => 1,
        ColorSpace::Rec2020 => 2,
    }
}

fn color_range_value(range: SampleRange) -> u64 {
    match range {
        SampleRange::Undefined | SampleRange::Limited => 0,
        SampleRange::Full => 1,
    }
}

#[cfg(test)]
pub(crate) mod test {
    use drm_fourcc::DrmFourcc;

    use super::*;
    use crate::device::test::MockDevice;
    use crate::device::PlaneHandle;
    use crate::layer::{BufferHandle, LayerProperties};
    use crate::planner::{plan, PlanConstraints};
    use crate::registry::test::{simple_registry, CONNECTOR, CRTC, CURSOR, OVERLAY_1, OVERLAY_2, PRIMARY};
    use crate::utils::SyncPoint;

    pub(crate) const PLANE_PROPS: &[&str] = &[
        "type", "FB_ID", "CRTC_ID", "SRC_X", "SRC_Y", "SRC_W", "SRC_H", "CRTC_X", "CRTC_Y",
        "CRTC_W", "CRTC_H", "zpos", "alpha", "rotation", "pixel blend mode", "COLOR_ENCODING",
        "COLOR_RANGE",
    ];

    /// Importer deriving framebuffer ids from the buffer handle.
    #[derive(Debug, Default)]
    pub(crate) struct MapImporter;

    impl FramebufferImporter for MapImporter {
        fn import(&mut self, buffer: &BufferSlot) -> Result<FramebufferId, Error> {
            Ok(FramebufferId(buffer.handle.0 as u32 + 1000))
        }
    }

    pub(crate) fn mock_device() -> MockDevice {
        let device = MockDevice::new();
        for plane in [PRIMARY, OVERLAY_1, OVERLAY_2, CURSOR] {
            device.add_object(plane, PLANE_PROPS);
        }
        device.add_object(CRTC, &["ACTIVE", "MODE_ID"]);
        device.add_object(CONNECTOR, &["CRTC_ID"]);
        device
    }

    fn layer(id: u64, z: u32) -> Layer {
        let mut layer = Layer::new(LayerId(id));
        layer.stage(LayerProperties {
            buffer: Some(BufferSlot {
                handle: BufferHandle(id),
                acquire: SyncPoint::signaled(),
                format: DrmFourcc::Xrgb8888,
                modifier: None,
                size: Size::from((256, 256)),
            }),
            source_crop: Some(Rectangle::from_loc_and_size((0.0, 0.0), (256.0, 256.0))),
            display_frame: Some(Rectangle::from_loc_and_size((0, 0), (256, 256))),
            z_order: Some(z),
            ..Default::default()
        });
        layer.apply_staged();
        layer
    }

    fn build_simple(
        device: &MockDevice,
        layers: Vec<Layer>,
        previous: &FrameState,
    ) -> Result<(AtomicRequest, FrameState), Error> {
        let registry = simple_registry();
        let planes = registry.planes_for_crtc(CRTC).unwrap();
        let refs: Vec<&Layer> = layers.iter().collect();
        let constraints = PlanConstraints {
            bounds: Rectangle::from_loc_and_size((0, 0), (1920, 1080)),
            cursor_size: Size::from((64u32, 64u32)),
            forced_client: &[],
        };
        let plan = plan(&refs, &planes, &constraints);
        let map: IndexMap<LayerId, Layer> = layers.into_iter().map(|l| (l.id(), l)).collect();
        let mut cache = PropertyCache::default();
        let args = RequestArgs {
            plan: &plan,
            layers: &map,
            crtc: CRTC,
            connector: CONNECTOR,
            display_size: Size::from((1920, 1080)),
            mode: None,
            active: Some(true),
            client_target: None,
            previous,
        };
        build_request(device, &mut MapImporter, &mut cache, &args)
    }

    fn prop_value(device: &MockDevice, req: &AtomicRequest, plane: PlaneHandle, name: &str) -> Option<u64> {
        let table = device.object_properties(plane.into()).unwrap();
        let id = table.iter().find(|info| info.name == name)?.id;
        req.properties()
            .iter()
            .rev()
            .find(|triple| triple.object == plane.into() && triple.property == id)
            .map(|triple| triple.value)
    }

    #[test]
    fn request_carries_full_plane_state() {
        let device = mock_device();
        let (req, frame) = build_simple(&device, vec![layer(1, 0)], &FrameState::default()).unwrap();

        // a lone layer takes the most general overlay, leaving the
        // primary plane free for a client target
        assert_eq!(prop_value(&device, &req, OVERLAY_2, "FB_ID"), Some(1001));
        assert_eq!(prop_value(&device, &req, OVERLAY_2, "CRTC_ID"), Some(CRTC.0 as u64));
        // 256.0 in 16.16 fixed point
        assert_eq!(prop_value(&device, &req, OVERLAY_2, "SRC_W"), Some(256 << 16));
        assert_eq!(prop_value(&device, &req, OVERLAY_2, "CRTC_W"), Some(256));
        assert_eq!(prop_value(&device, &req, OVERLAY_2, "alpha"), Some(u16::MAX as u64));
        assert_eq!(frame.fb_of(OVERLAY_2), Some(FramebufferId(1001)));
        assert!(frame.crtc_active());
    }

    #[test]
    fn lost_assignment_emits_detach_triples() {
        let device = mock_device();
        let (_, first) = build_simple(
            &device,
            vec![layer(1, 0), layer(2, 1)],
            &FrameState::default(),
        )
        .unwrap();
        assert!(first.content(OVERLAY_1).is_some());

        // second frame drops the top layer; its overlay must be detached
        let (req, second) = build_simple(&device, vec![layer(1, 0)], &first).unwrap();
        assert!(second.content(OVERLAY_1).is_none());
        assert_eq!(prop_value(&device, &req, OVERLAY_1, "FB_ID"), Some(0));
        assert_eq!(prop_value(&device, &req, OVERLAY_1, "CRTC_ID"), Some(0));
    }

    #[test]
    fn negative_source_crop_clamps_to_the_buffer_origin() {
        let device = mock_device();
        let mut offscreen = layer(1, 0);
        offscreen.stage(LayerProperties {
            source_crop: Some(Rectangle::from_loc_and_size((-8.0, -4.5), (256.0, 256.0))),
            ..Default::default()
        });
        offscreen.apply_staged();

        let (req, _) = build_simple(&device, vec![offscreen], &FrameState::default()).unwrap();
        assert_eq!(prop_value(&device, &req, OVERLAY_2, "SRC_X"), Some(0));
        assert_eq!(prop_value(&device, &req, OVERLAY_2, "SRC_Y"), Some(0));
        assert_eq!(prop_value(&device, &req, OVERLAY_2, "SRC_W"), Some(256 << 16));
    }

    #[test]
    fn missing_required_property_is_fatal() {
        let device = MockDevice::new();
        // the lone layer's plane lacks SRC_X
        device.add_object(PRIMARY, PLANE_PROPS);
        device.add_object(OVERLAY_1, PLANE_PROPS);
        device.add_object(OVERLAY_2, &["FB_ID", "CRTC_ID"]);
        device.add_object(CURSOR, PLANE_PROPS);
        device.add_object(CRTC, &["ACTIVE", "MODE_ID"]);
        device.add_object(CONNECTOR, &["CRTC_ID"]);

        let err = build_simple(&device, vec![layer(1, 0)], &FrameState::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownProperty { name: "SRC_X", .. }
        ));
    }

    #[test]
    fn missing_rotation_only_matters_for_rotated_layers() {
        let device = MockDevice::new();
        let without_rotation: Vec<&str> = PLANE_PROPS
            .iter()
            .copied()
            .filter(|name| *name != "rotation")
            .collect();
        for plane in [PRIMARY, OVERLAY_1, OVERLAY_2, CURSOR] {
            device.add_object(plane, &without_rotation);
        }
        device.add_object(CRTC, &["ACTIVE", "MODE_ID"]);
        device.add_object(CONNECTOR, &["CRTC_ID"]);

        assert!(build_simple(&device, vec![layer(1, 0)], &FrameState::default()).is_ok());

        let mut rotated = layer(1, 0);
        rotated.stage(LayerProperties {
            transform: Some(Transform::ROTATE_90),
            ..Default::default()
        });
        rotated.apply_staged();
        let err = build_simple(&device, vec![rotated], &FrameState::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownProperty { name: "rotation", .. }
        ));
    }

    #[test]
    fn mode_change_allocates_a_blob() {
        let device = mock_device();
        let registry = simple_registry();
        let planes = registry.planes_for_crtc(CRTC).unwrap();
        let layers = vec![layer(1, 0)];
        let refs: Vec<&Layer> = layers.iter().collect();
        let constraints = PlanConstraints {
            bounds: Rectangle::from_loc_and_size((0, 0), (1920, 1080)),
            cursor_size: Size::from((64u32, 64u32)),
            forced_client: &[],
        };
        let plan = plan(&refs, &planes, &constraints);
        let map: IndexMap<LayerId, Layer> = layers.into_iter().map(|l| (l.id(), l)).collect();
        let mode = crate::registry::test::default_mode();
        let mut cache = PropertyCache::default();
        let args = RequestArgs {
            plan: &plan,
            layers: &map,
            crtc: CRTC,
            connector: CONNECTOR,
            display_size: Size::from((1920, 1080)),
            mode: Some(&mode),
            active: Some(true),
            client_target: None,
            previous: &FrameState::default(),
        };
        let (req, _) = build_request(&device, &mut MapImporter, &mut cache, &args).unwrap();
        assert_eq!(req.blobs().len(), 1);
        assert_eq!(device.blob_count(), 1);
        // MODE_ID lands on the crtc object
        let crtc_props = device.object_properties(CRTC.into()).unwrap();
        let mode_prop = crtc_props.iter().find(|p| p.name == "MODE_ID").unwrap().id;
        assert!(req
            .properties()
            .iter()
            .any(|t| t.object == CRTC.into() && t.property == mode_prop));
    }

    #[test]
    fn client_target_binds_to_the_reserved_plane() {
        let device = mock_device();
        let registry = simple_registry();
        let planes = registry.planes_for_crtc(CRTC).unwrap();

        let mut client_layer = Layer::new(LayerId(1));
        client_layer.stage(LayerProperties {
            composition_type: Some(crate::layer::CompositionType::Client),
            display_frame: Some(Rectangle::from_loc_and_size((0, 0), (256, 256))),
            ..Default::default()
        });
        client_layer.apply_staged();

        let refs = vec![&client_layer];
        let constraints = PlanConstraints {
            bounds: Rectangle::from_loc_and_size((0, 0), (1920, 1080)),
            cursor_size: Size::from((64u32, 64u32)),
            forced_client: &[],
        };
        let plan = plan(&refs, &planes, &constraints);
        assert_eq!(plan.client_target_plane(), Some(PRIMARY));

        let map: IndexMap<LayerId, Layer> =
            [(client_layer.id(), client_layer)].into_iter().collect();
        let target = crate::display::ClientTarget {
            buffer: BufferSlot {
                handle: BufferHandle(9),
                acquire: SyncPoint::signaled(),
                format: DrmFourcc::Xrgb8888,
                modifier: None,
                size: Size::from((1920, 1080)),
            },
            color_space: crate::layer::ColorSpace::Undefined,
            sample_range: crate::layer::SampleRange::Undefined,
        };
        let mut cache = PropertyCache::default();
        let args = RequestArgs {
            plan: &plan,
            layers: &map,
            crtc: CRTC,
            connector: CONNECTOR,
            display_size: Size::from((1920, 1080)),
            mode: None,
            active: Some(true),
            client_target: Some(&target),
            previous: &FrameState::default(),
        };
        let (req, frame) =
            build_request(&device, &mut MapImporter, &mut cache, &args).unwrap();

        assert_eq!(prop_value(&device, &req, PRIMARY, "FB_ID"), Some(1009));
        // full-display destination
        assert_eq!(prop_value(&device, &req, PRIMARY, "CRTC_W"), Some(1920));
        assert_eq!(prop_value(&device, &req, PRIMARY, "CRTC_H"), Some(1080));
        assert_eq!(
            frame.content(PRIMARY),
            Some(&PlaneContent {
                layer: None,
                fb: FramebufferId(1009)
            })
        );
    }

    #[test]
    fn committed_state_reads_back() {
        let device = mock_device();
        let (req, frame) = build_simple(
            &device,
            vec![layer(1, 0), layer(2, 1)],
            &FrameState::default(),
        )
        .unwrap();
        device
            .atomic_commit(crate::device::CommitFlags::empty(), req.properties())
            .unwrap();

        let mut cache = PropertyCache::default();
        let state = read_back_frame(
            &device,
            &mut cache,
            &[PRIMARY, OVERLAY_1, OVERLAY_2, CURSOR],
        )
        .unwrap();
        assert_eq!(state.fb_of(PRIMARY), frame.fb_of(PRIMARY));
        assert_eq!(state.fb_of(OVERLAY_1), frame.fb_of(OVERLAY_1));
        assert_eq!(state.fb_of(CURSOR), None);
    }

    #[test]
    fn property_tables_are_fetched_once() {
        let device = mock_device();
        let mut cache = PropertyCache::default();
        let first = cache.prop(&device, PRIMARY, "FB_ID").unwrap();
        let second = cache.prop(&device, PRIMARY, "FB_ID").unwrap();
        assert_eq!(first, second);

        cache.invalidate(PRIMARY);
        let third = cache.prop(&device, PRIMARY, "FB_ID").unwrap();
        assert_eq!(first, third);
    }
}
