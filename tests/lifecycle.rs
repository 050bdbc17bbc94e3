//! End-to-end lifecycle against a software device.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use drm_fourcc::DrmFourcc;
use scanout::atomic::FramebufferImporter;
use scanout::device::{
    BlobId, CommitFlags, ConnectorHandle, CrtcHandle, DeviceBackend, FramebufferId, ObjectId,
    PlaneHandle, PropertyId, PropertyInfo, PropertyTriple,
};
use scanout::layer::{BufferHandle, BufferSlot};
use scanout::registry::{ConnectorInfo, CrtcInfo, Mode, PlaneFormat, PlaneInfo, PlaneType, Registry};
use scanout::utils::{Rectangle, Size, SwFence, SyncPoint};
use scanout::{Compositor, DisplayState, Error, LayerProperties, PowerMode};

const CRTC: CrtcHandle = CrtcHandle(1);
const CONNECTOR: ConnectorHandle = ConnectorHandle(30);
const PRIMARY: PlaneHandle = PlaneHandle(10);
const OVERLAY: PlaneHandle = PlaneHandle(11);

const PLANE_PROPS: &[&str] = &[
    "FB_ID", "CRTC_ID", "SRC_X", "SRC_Y", "SRC_W", "SRC_H", "CRTC_X", "CRTC_Y", "CRTC_W",
    "CRTC_H", "zpos", "alpha", "rotation", "pixel blend mode", "COLOR_ENCODING", "COLOR_RANGE",
];

fn init_logging() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Software device applying commits to a shadow property store.
#[derive(Debug, Default)]
struct TestDevice {
    state: Mutex<TestState>,
}

#[derive(Debug, Default)]
struct TestState {
    properties: HashMap<ObjectId, Vec<PropertyInfo>>,
    values: HashMap<(ObjectId, PropertyId), u64>,
    next_prop: u32,
    next_blob: u32,
    blobs: HashMap<u32, Vec<u8>>,
    inflight: Vec<SwFence>,
}

impl TestDevice {
    fn add_object(&self, object: impl Into<ObjectId>, props: &[&str]) {
        let mut state = self.state.lock().unwrap();
        let mut table = Vec::new();
        for name in props {
            state.next_prop += 1;
            table.push(PropertyInfo {
                id: PropertyId(state.next_prop),
                name: (*name).to_owned(),
            });
        }
        state.properties.insert(object.into(), table);
    }

    fn value(&self, object: impl Into<ObjectId>, name: &str) -> Option<u64> {
        let object = object.into();
        let state = self.state.lock().unwrap();
        let prop = state
            .properties
            .get(&object)?
            .iter()
            .find(|info| info.name == name)?
            .id;
        state.values.get(&(object, prop)).copied()
    }

    fn complete_flip(&self) {
        let fence = {
            let mut state = self.state.lock().unwrap();
            if state.inflight.is_empty() {
                None
            } else {
                Some(state.inflight.remove(0))
            }
        };
        if let Some(fence) = fence {
            fence.signal();
        }
    }
}

impl DeviceBackend for TestDevice {
    fn object_properties(&self, object: ObjectId) -> io::Result<Vec<PropertyInfo>> {
        self.state
            .lock()
            .unwrap()
            .properties
            .get(&object)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such object"))
    }

    fn property_value(&self, object: ObjectId, property: PropertyId) -> io::Result<u64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .values
            .get(&(object, property))
            .copied()
            .unwrap_or(0))
    }

    fn create_blob(&self, data: &[u8]) -> io::Result<BlobId> {
        let mut state = self.state.lock().unwrap();
        state.next_blob += 1;
        let id = state.next_blob;
        state.blobs.insert(id, data.to_vec());
        Ok(BlobId(id))
    }

    fn destroy_blob(&self, blob: BlobId) -> io::Result<()> {
        self.state
            .lock()
            .unwrap()
            .blobs
            .remove(&blob.0)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such blob"))
    }

    fn atomic_commit(&self, flags: CommitFlags, props: &[PropertyTriple]) -> io::Result<SyncPoint> {
        let mut state = self.state.lock().unwrap();
        if flags.contains(CommitFlags::TEST_ONLY) {
            return Ok(SyncPoint::signaled());
        }
        for triple in props {
            state
                .values
                .insert((triple.object, triple.property), triple.value);
        }
        if flags.contains(CommitFlags::NONBLOCK) {
            let fence = SwFence::new();
            state.inflight.push(fence.clone());
            Ok(SyncPoint::from(fence))
        } else {
            Ok(SyncPoint::signaled())
        }
    }
}

/// Cloneable device handle so tests can inspect the shadow store the
/// compositor commits into.
#[derive(Debug, Clone)]
struct SharedDevice(Arc<TestDevice>);

impl DeviceBackend for SharedDevice {
    fn object_properties(&self, object: ObjectId) -> io::Result<Vec<PropertyInfo>> {
        self.0.object_properties(object)
    }

    fn property_value(&self, object: ObjectId, property: PropertyId) -> io::Result<u64> {
        self.0.property_value(object, property)
    }

    fn create_blob(&self, data: &[u8]) -> io::Result<BlobId> {
        self.0.create_blob(data)
    }

    fn destroy_blob(&self, blob: BlobId) -> io::Result<()> {
        self.0.destroy_blob(blob)
    }

    fn atomic_commit(&self, flags: CommitFlags, props: &[PropertyTriple]) -> io::Result<SyncPoint> {
        self.0.atomic_commit(flags, props)
    }
}

#[derive(Debug, Default)]
struct TestImporter;

impl FramebufferImporter for TestImporter {
    fn import(&mut self, buffer: &BufferSlot) -> Result<FramebufferId, Error> {
        Ok(FramebufferId(buffer.handle.0 as u32 + 100))
    }
}

fn test_device() -> TestDevice {
    let device = TestDevice::default();
    device.add_object(PRIMARY, PLANE_PROPS);
    device.add_object(OVERLAY, PLANE_PROPS);
    device.add_object(CRTC, &["ACTIVE", "MODE_ID"]);
    device.add_object(CONNECTOR, &["CRTC_ID"]);
    device
}

fn test_registry() -> Registry {
    let xrgb = PlaneFormat {
        code: DrmFourcc::Xrgb8888,
        modifiers: Vec::new(),
    };
    let plane = |handle, type_| PlaneInfo {
        handle,
        type_,
        possible_crtcs: vec![CRTC],
        formats: vec![xrgb.clone()],
        zpos_range: Some((0, 1)),
        rotations: Default::default(),
        color_encodings: Vec::new(),
    };
    Registry::new(
        vec![
            plane(PRIMARY, PlaneType::Primary),
            plane(OVERLAY, PlaneType::Overlay),
        ],
        vec![CrtcInfo { handle: CRTC }],
        vec![ConnectorInfo {
            handle: CONNECTOR,
            modes: vec![Mode {
                size: Size::from((1280, 720)),
                vsync_period: Duration::from_nanos(16_666_667),
                preferred: true,
            }],
        }],
        Size::from((64u32, 64u32)),
    )
}

fn buffer_props(handle: u64, z: u32) -> LayerProperties {
    LayerProperties {
        buffer: Some(BufferSlot {
            handle: BufferHandle(handle),
            acquire: SyncPoint::signaled(),
            format: DrmFourcc::Xrgb8888,
            modifier: None,
            size: Size::from((640, 360)),
        }),
        source_crop: Some(Rectangle::from_loc_and_size((0.0, 0.0), (640.0, 360.0))),
        display_frame: Some(Rectangle::from_loc_and_size((0, 0), (640, 360))),
        z_order: Some(z),
        ..Default::default()
    }
}

#[test]
fn full_compositor_lifecycle() {
    init_logging();
    let device = Arc::new(test_device());
    let compositor = Compositor::new(SharedDevice(device.clone()), test_registry());
    let id = compositor
        .create_display(TestImporter, CRTC, CONNECTOR)
        .unwrap();

    compositor
        .with_display(id, |display| {
            display.set_power_mode(PowerMode::On)?;
            let bottom = display.create_layer()?;
            let top = display.create_layer()?;
            display.set_layer_properties(bottom, buffer_props(1, 0))?;
            display.set_layer_properties(top, buffer_props(2, 1))?;

            let changes = display.validate()?;
            assert_eq!(changes, 0);
            assert_eq!(display.state(), DisplayState::PresentPending);

            let present = display.present()?;
            assert_eq!(display.state(), DisplayState::PresentComplete);
            assert!(!present.is_reached());
            assert_eq!(display.get_release_fences()?.len(), 2);
            Ok(())
        })
        .unwrap();

    // let the flip finish so teardown does not wait on it
    device.complete_flip();
    compositor
        .with_display(id, |display| display.process_completions())
        .unwrap();
    compositor.destroy_display(id).unwrap();
}

#[test]
fn presented_frames_land_on_the_planes() {
    init_logging();
    let device = Arc::new(test_device());
    let compositor = Compositor::new(SharedDevice(device.clone()), test_registry());
    let id = compositor
        .create_display(TestImporter, CRTC, CONNECTOR)
        .unwrap();

    let present = compositor
        .with_display(id, |display| {
            display.set_power_mode(PowerMode::On)?;
            let bottom = display.create_layer()?;
            let top = display.create_layer()?;
            display.set_layer_properties(bottom, buffer_props(1, 0))?;
            display.set_layer_properties(top, buffer_props(2, 1))?;
            display.validate()?;
            display.present()
        })
        .unwrap();

    assert_eq!(device.value(CRTC, "ACTIVE"), Some(1));
    assert_eq!(device.value(PRIMARY, "FB_ID"), Some(101));
    assert_eq!(device.value(OVERLAY, "FB_ID"), Some(102));
    assert_eq!(device.value(PRIMARY, "CRTC_ID"), Some(CRTC.0 as u64));

    device.complete_flip();
    compositor
        .with_display(id, |display| display.process_completions())
        .unwrap();
    assert!(present.is_reached());
    assert!(!present.is_error());

    compositor
        .with_display(id, |display| display.set_power_mode(PowerMode::Off))
        .unwrap();
    assert_eq!(device.value(CRTC, "ACTIVE"), Some(0));
    assert_eq!(device.value(PRIMARY, "FB_ID"), Some(0));
}
