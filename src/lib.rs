//! Scanout planning and atomic presentation for kernel mode-setting
//! displays.
//!
//! The crate sits between a display server and the kernel's atomic
//! mode-setting interface. Clients describe their output as a stack of
//! [`layer::Layer`]s per display; the [`planner`] assigns as many layers
//! as possible to hardware planes and degrades the rest to
//! client-side composition, the [`atomic`] builder turns the resulting
//! plan into a flat atomic property-set request, and the [`commit`]
//! pipeline submits it and tracks completion, blob lifetime and buffer
//! fences.
//!
//! The kernel itself is only reached through the [`device::DeviceBackend`]
//! trait, so everything above it can be driven against a software double.
//!
//! ```no_run
//! # use scanout::{Compositor, DisplayState, PowerMode};
//! # fn demo<D: scanout::device::DeviceBackend + 'static,
//! #          F: scanout::atomic::FramebufferImporter + 'static>(
//! #     device: D,
//! #     importer: F,
//! #     registry: scanout::registry::Registry,
//! #     crtc: scanout::device::CrtcHandle,
//! #     connector: scanout::device::ConnectorHandle,
//! # ) -> Result<(), scanout::Error> {
//! let compositor = Compositor::new(device, registry);
//! let display = compositor.create_display(importer, crtc, connector)?;
//! compositor.with_display(display, |display| {
//!     display.set_power_mode(PowerMode::On)?;
//!     let _layer = display.create_layer()?;
//!     // ... stage layer properties ...
//!     display.validate()?;
//!     let _present = display.present()?;
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs, missing_debug_implementations)]

pub mod atomic;
pub mod commit;
pub mod device;
pub mod display;
pub mod error;
pub mod layer;
pub mod planner;
pub mod registry;
pub mod utils;
pub mod vsync;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use tracing::info;

use crate::atomic::FramebufferImporter;
use crate::device::{ConnectorHandle, CrtcHandle, DeviceBackend};
pub use crate::display::{ClientTarget, ConfigId, Display, DisplayId, DisplayState, PowerMode};
pub use crate::error::{CommitError, Error};
pub use crate::layer::{CompositionType, LayerId, LayerProperties};
pub use crate::planner::CompositionPlan;
use crate::registry::Registry;

/// The compositor context of one device.
///
/// Owns the device handle, the resource registry and all displays. The
/// display table is guarded by a single lock; per-display calls take it
/// for the duration of the call, which keeps the validate/present
/// protocol of each display internally ordered.
#[derive(Debug)]
pub struct Compositor<D: DeviceBackend, F: FramebufferImporter> {
    device: Arc<D>,
    registry: Arc<Registry>,
    displays: Mutex<IndexMap<DisplayId, Display<D, F>>>,
    next_display: AtomicU64,
}

impl<D: DeviceBackend, F: FramebufferImporter> Compositor<D, F> {
    /// Create the compositor context for a device and its enumerated
    /// resources
    pub fn new(device: D, registry: Registry) -> Self {
        Compositor {
            device: Arc::new(device),
            registry: Arc::new(registry),
            displays: Mutex::new(IndexMap::new()),
            next_display: AtomicU64::new(0),
        }
    }

    /// The resource registry of the device
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Create a display on a CRTC/connector pair.
    ///
    /// The display starts powered off.
    pub fn create_display(
        &self,
        importer: F,
        crtc: CrtcHandle,
        connector: ConnectorHandle,
    ) -> Result<DisplayId, Error> {
        let id = DisplayId(self.next_display.fetch_add(1, Ordering::Relaxed));
        let display = Display::new(
            id,
            self.device.clone(),
            importer,
            self.registry.clone(),
            crtc,
            connector,
        )?;
        self.displays.lock().unwrap().insert(id, display);
        info!(?id, ?crtc, ?connector, "display registered");
        Ok(id)
    }

    /// Tear down a display.
    ///
    /// The display is powered off first so no planes keep scanning out
    /// its buffers.
    pub fn destroy_display(&self, id: DisplayId) -> Result<(), Error> {
        let mut displays = self.displays.lock().unwrap();
        let mut display = displays.shift_remove(&id).ok_or(Error::BadDisplay(id))?;
        display.set_power_mode(PowerMode::Off)?;
        Ok(())
    }

    /// Run a closure against a display.
    ///
    /// All client calls are funneled through here; the display table lock
    /// is held for the duration of the closure.
    pub fn with_display<R>(
        &self,
        id: DisplayId,
        f: impl FnOnce(&mut Display<D, F>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut displays = self.displays.lock().unwrap();
        let display = displays.get_mut(&id).ok_or(Error::BadDisplay(id))?;
        f(display)
    }

    /// Handles of all registered displays
    pub fn display_ids(&self) -> Vec<DisplayId> {
        self.displays.lock().unwrap().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::test::{mock_device, MapImporter};
    use crate::registry::test::{simple_registry, CONNECTOR, CRTC};

    #[test]
    fn displays_are_created_and_destroyed_through_the_context() {
        let compositor = Compositor::new(mock_device(), simple_registry());
        let id = compositor
            .create_display(MapImporter, CRTC, CONNECTOR)
            .unwrap();
        assert_eq!(compositor.display_ids(), vec![id]);

        compositor
            .with_display(id, |display| {
                assert_eq!(display.state(), DisplayState::Off);
                display.set_power_mode(PowerMode::On)
            })
            .unwrap();

        compositor.destroy_display(id).unwrap();
        assert!(compositor.display_ids().is_empty());
        assert!(matches!(
            compositor.with_display(id, |_| Ok(())),
            Err(Error::BadDisplay(_))
        ));
    }

    #[test]
    fn unknown_crtc_fails_display_creation() {
        let compositor = Compositor::new(mock_device(), simple_registry());
        assert!(matches!(
            compositor.create_display(MapImporter, crate::device::CrtcHandle(99), CONNECTOR),
            Err(Error::UnknownCrtc(_))
        ));
    }
}
