//! Per-display frontend state machine.
//!
//! A [`Display`] ties one CRTC/connector pair to the validate/present
//! protocol: clients stage layer changes, `validate` runs the planner over
//! the staged configuration, `present` turns the resulting plan into an
//! atomic commit. Any layer change after a validate invalidates the plan
//! and re-arms the validate requirement.
//!
//! ```text
//!            set_power_mode(on)
//!   Off ─────────────────────────► ValidatePending ◄───────────┐
//!    ▲                                    │                     │
//!    │ set_power_mode(off)                │ validate            │ layer
//!    │                                    ▼                     │ changes
//!    └───────────────────────────  PresentPending               │
//!                                         │ present             │
//!                                         ▼                     │
//!                                  PresentComplete ─────────────┘
//! ```

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info_span, trace};

use crate::atomic::{build_request, AtomicRequest, FramebufferImporter, PropertyCache, RequestArgs};
use crate::commit::{CommitMode, CommitPipeline, FrameSubmission};
use crate::device::{ConnectorHandle, CrtcHandle, DeviceBackend};
use crate::error::{CommitError, Error};
use crate::layer::{BufferSlot, ColorSpace, CompositionType, Layer, LayerId, SampleRange};
use crate::planner::{self, PlanConstraints};
use crate::registry::{Mode, Registry};
use crate::utils::{FenceState, SwFence, SyncPoint};
use crate::vsync::VsyncWorker;

/// Handle of a display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DisplayId(pub u64);

/// Handle of a display configuration (one mode of the connector)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfigId(pub u32);

/// Protocol state of a display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayState {
    /// The display is powered off, only power mode changes are accepted
    Off,
    /// Layer state changed since the last plan, a validate is required
    ValidatePending,
    /// A plan exists and awaits its present
    PresentPending,
    /// The last present completed; layer changes re-arm the validate
    PresentComplete,
}

/// Requested power mode of a display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    /// Panel and pipeline off
    Off,
    /// Panel and pipeline on
    On,
    /// Low-power always-on mode; driven like [`PowerMode::On`]
    Doze,
    /// Suspended; driven like [`PowerMode::Off`]
    Suspend,
}

impl PowerMode {
    fn is_on(self) -> bool {
        matches!(self, PowerMode::On | PowerMode::Doze)
    }
}

/// The client-composited fallback output for one frame
#[derive(Debug, Clone)]
pub struct ClientTarget {
    /// Buffer the display server rendered all client-composited layers to
    pub buffer: BufferSlot,
    /// Color space of the rendered output
    pub color_space: ColorSpace,
    /// Quantization range of the rendered output
    pub sample_range: SampleRange,
}

/// One display driven by a CRTC/connector pair.
#[derive(Debug)]
pub struct Display<D: DeviceBackend, F: FramebufferImporter> {
    id: DisplayId,
    device: Arc<D>,
    importer: F,
    registry: Arc<Registry>,
    crtc: CrtcHandle,
    connector: ConnectorHandle,
    configs: Vec<Mode>,
    active_config: ConfigId,
    pending_config: Option<ConfigId>,
    needs_modeset: bool,
    layers: IndexMap<LayerId, Layer>,
    next_layer: u64,
    state: DisplayState,
    power: PowerMode,
    plan: Option<planner::CompositionPlan>,
    client_target: Option<ClientTarget>,
    forced_client: Vec<LayerId>,
    pipeline: CommitPipeline,
    cache: PropertyCache,
    pending_releases: Vec<SwFence>,
    release_fences: Vec<(LayerId, SyncPoint)>,
    client_target_release: Option<SyncPoint>,
    vsync: VsyncWorker,
}

impl<D: DeviceBackend, F: FramebufferImporter> Display<D, F> {
    /// Create a display on the given CRTC/connector pair.
    ///
    /// The active config starts at the connector's preferred mode; the
    /// display starts powered off.
    pub fn new(
        id: DisplayId,
        device: Arc<D>,
        importer: F,
        registry: Arc<Registry>,
        crtc: CrtcHandle,
        connector: ConnectorHandle,
    ) -> Result<Self, Error> {
        registry.crtc(crtc)?;
        let info = registry
            .connector(connector)
            .ok_or(Error::UnknownConnector(connector))?;
        if info.modes.is_empty() {
            return Err(Error::NoModes(connector));
        }
        let configs = info.modes.clone();
        let active_config = ConfigId(
            configs
                .iter()
                .position(|mode| mode.preferred)
                .unwrap_or(0) as u32,
        );
        let vsync = VsyncWorker::new(configs[active_config.0 as usize].vsync_period);

        debug!(?id, ?crtc, ?connector, "created display");
        Ok(Display {
            id,
            device,
            importer,
            registry,
            crtc,
            connector,
            configs,
            active_config,
            pending_config: None,
            needs_modeset: true,
            layers: IndexMap::new(),
            next_layer: 0,
            state: DisplayState::Off,
            power: PowerMode::Off,
            plan: None,
            client_target: None,
            forced_client: Vec::new(),
            pipeline: CommitPipeline::new(),
            cache: PropertyCache::default(),
            pending_releases: Vec::new(),
            release_fences: Vec::new(),
            client_target_release: None,
            vsync,
        })
    }

    /// Handle of this display
    pub fn id(&self) -> DisplayId {
        self.id
    }

    /// Current protocol state
    pub fn state(&self) -> DisplayState {
        self.state
    }

    /// Current power mode
    pub fn power_mode(&self) -> PowerMode {
        self.power
    }

    /// Available display configurations
    pub fn configs(&self) -> impl Iterator<Item = (ConfigId, &Mode)> {
        self.configs
            .iter()
            .enumerate()
            .map(|(idx, mode)| (ConfigId(idx as u32), mode))
    }

    /// The active configuration
    pub fn active_config(&self) -> ConfigId {
        self.active_config
    }

    /// The vsync source of this display
    pub fn vsync(&self) -> &VsyncWorker {
        &self.vsync
    }

    /// Look up a layer of this display
    pub fn layer(&self, id: LayerId) -> Result<&Layer, Error> {
        self.layers.get(&id).ok_or(Error::BadLayer(id))
    }

    /// Stage a config switch; applied with the next present.
    pub fn set_active_config(&mut self, config: ConfigId) -> Result<(), Error> {
        if config.0 as usize >= self.configs.len() {
            return Err(Error::BadConfig(config));
        }
        if config != self.active_config || self.pending_config.is_some() {
            self.pending_config = Some(config);
            self.invalidate();
        }
        Ok(())
    }

    /// Create a new layer on this display
    pub fn create_layer(&mut self) -> Result<LayerId, Error> {
        self.check_powered()?;
        self.next_layer += 1;
        let id = LayerId(self.next_layer);
        self.layers.insert(id, Layer::new(id));
        self.invalidate();
        trace!(?id, "created layer");
        Ok(id)
    }

    /// Destroy a layer
    pub fn destroy_layer(&mut self, id: LayerId) -> Result<(), Error> {
        self.check_powered()?;
        self.layers.shift_remove(&id).ok_or(Error::BadLayer(id))?;
        self.forced_client.retain(|forced| *forced != id);
        self.invalidate();
        Ok(())
    }

    /// Stage property updates for a layer.
    ///
    /// Only legal while no plan awaits its present; staging always re-arms
    /// the validate requirement.
    pub fn set_layer_properties(
        &mut self,
        id: LayerId,
        props: crate::layer::LayerProperties,
    ) -> Result<(), Error> {
        self.check_powered()?;
        if self.state == DisplayState::PresentPending {
            return Err(Error::InvalidState {
                call: "set_layer_properties",
                state: self.state,
            });
        }
        let layer = self.layers.get_mut(&id).ok_or(Error::BadLayer(id))?;
        layer.stage(props);
        // changed state may resolve whatever the kernel objected to
        self.forced_client.retain(|forced| *forced != id);
        self.invalidate();
        Ok(())
    }

    /// Set the client-composited fallback buffer for the next present
    pub fn set_client_target(&mut self, target: ClientTarget) -> Result<(), Error> {
        self.check_powered()?;
        self.client_target = Some(target);
        Ok(())
    }

    /// Plan the composition of the current layer configuration.
    ///
    /// Applies all staged layer updates, runs the planner and returns the
    /// number of layers whose composition type changed from the client's
    /// request.
    pub fn validate(&mut self) -> Result<usize, Error> {
        self.check_powered()?;
        let span = info_span!("validate", display = ?self.id);
        let _guard = span.enter();

        self.pipeline.process_completions(&*self.device)?;

        for layer in self.layers.values_mut() {
            layer.apply_staged();
        }

        let mode = &self.configs[self.pending_config.unwrap_or(self.active_config).0 as usize];
        let constraints = PlanConstraints {
            bounds: crate::utils::Rectangle::from_loc_and_size((0, 0), mode.size),
            cursor_size: self.registry.cursor_size(),
            forced_client: &self.forced_client,
        };
        let plan = {
            let planes = self.registry.planes_for_crtc(self.crtc)?;
            let layer_refs: Vec<&Layer> = self.layers.values().collect();
            planner::plan(&layer_refs, &planes, &constraints)
        };
        let changes = plan.changed_composition_types().len();
        trace!(layers = self.layers.len(), changes, "validated display");
        self.plan = Some(plan);
        self.state = DisplayState::PresentPending;
        Ok(changes)
    }

    /// Composition type changes of the last validate
    pub fn get_changed_composition_types(
        &self,
    ) -> Result<&[(LayerId, CompositionType)], Error> {
        self.plan
            .as_ref()
            .map(|plan| plan.changed_composition_types())
            .ok_or(Error::NotValidated)
    }

    /// Adopt the planner's composition type changes as the new client
    /// requests
    pub fn accept_display_changes(&mut self) -> Result<(), Error> {
        let changed = self
            .plan
            .as_ref()
            .ok_or(Error::NotValidated)?
            .changed_composition_types()
            .to_vec();
        for (id, type_) in changed {
            if let Some(layer) = self.layers.get_mut(&id) {
                layer.set_composition_hint(type_);
            }
        }
        Ok(())
    }

    /// Commit the validated plan to the hardware.
    ///
    /// Returns the present fence; it fires once the frame is on screen.
    /// Release fences for the buffers of this frame become available via
    /// [`Display::get_release_fences`] and fire when a later frame
    /// replaces them.
    pub fn present(&mut self) -> Result<SyncPoint, Error> {
        self.check_powered()?;
        if self.state != DisplayState::PresentPending {
            return Err(Error::NotValidated);
        }
        let span = info_span!("present", display = ?self.id);
        let _guard = span.enter();

        self.pipeline.process_completions(&*self.device)?;

        let mode_change = self
            .pending_config
            .or_else(|| self.needs_modeset.then_some(self.active_config));
        let mode = mode_change.map(|config| &self.configs[config.0 as usize]);
        let display_size = self.configs[self.active_config.0 as usize].size;

        let plan = self.plan.as_ref().ok_or(Error::NotValidated)?;
        let device_layers: Vec<LayerId> = plan
            .entries()
            .iter()
            .filter(|entry| entry.plane.is_some())
            .map(|entry| entry.layer)
            .collect();

        let mut acquires = Vec::new();
        let mut new_releases = Vec::new();
        let mut release_map = Vec::new();
        for &id in &device_layers {
            let layer = self.layers.get(&id).ok_or(Error::BadLayer(id))?;
            if let Some(buffer) = layer.buffer() {
                acquires.push((id, buffer.acquire.clone()));
            }
            let fence = SwFence::new();
            release_map.push((id, SyncPoint::from(fence.clone())));
            new_releases.push(fence);
        }

        let mut client_release = None;
        if plan.client_target_plane().is_some() {
            if let Some(target) = &self.client_target {
                // client composition finished before present, this rarely
                // blocks
                if target.buffer.acquire.wait() == FenceState::Error {
                    return Err(Error::ClientTargetFenceFailed);
                }
                let fence = SwFence::new();
                client_release = Some(SyncPoint::from(fence.clone()));
                new_releases.push(fence);
            }
        }

        let previous = self.pipeline.framebuffer_state().clone();
        let args = RequestArgs {
            plan,
            layers: &self.layers,
            crtc: self.crtc,
            connector: self.connector,
            display_size: mode.map(|mode| mode.size).unwrap_or(display_size),
            mode,
            active: Some(true),
            client_target: self.client_target.as_ref(),
            previous: &previous,
        };
        let (request, frame) =
            build_request(&*self.device, &mut self.importer, &mut self.cache, &args)?;

        let submission = FrameSubmission {
            request,
            frame,
            acquires,
            // the previous frame's buffers leave the screen when this one
            // lands
            releases: self.pending_releases.clone(),
            allow_modeset: mode_change.is_some(),
        };

        match self
            .pipeline
            .commit(&*self.device, submission, CommitMode::Nonblocking)
        {
            Ok(present) => {
                self.pending_releases = new_releases;
                self.release_fences = release_map;
                self.client_target_release = client_release;
                if let Some(config) = self.pending_config.take() {
                    self.active_config = config;
                    self.vsync
                        .set_period(self.configs[config.0 as usize].vsync_period);
                }
                self.needs_modeset = false;
                self.state = DisplayState::PresentComplete;
                Ok(present)
            }
            Err(err) => {
                if matches!(err, Error::Commit(CommitError::InvalidRequest(_))) {
                    // the kernel vetoed the plan; keep the implicated
                    // layers off the planes until their state changes
                    debug!(?device_layers, "commit rejected, forcing client composition");
                    for id in device_layers {
                        if !self.forced_client.contains(&id) {
                            self.forced_client.push(id);
                        }
                    }
                }
                self.plan = None;
                self.state = DisplayState::ValidatePending;
                Err(err)
            }
        }
    }

    /// Release fences of the last presented frame, one per device-composited
    /// layer
    pub fn get_release_fences(&self) -> Result<&[(LayerId, SyncPoint)], Error> {
        if self.state != DisplayState::PresentComplete {
            return Err(Error::InvalidState {
                call: "get_release_fences",
                state: self.state,
            });
        }
        Ok(&self.release_fences)
    }

    /// Release fence of the last presented client target, if one was
    /// scanned out
    pub fn client_target_release(&self) -> Option<&SyncPoint> {
        self.client_target_release.as_ref()
    }

    /// Change the display power mode.
    ///
    /// Powering off drains the pipeline, detaches all planes and disables
    /// the CRTC; outstanding release fences fire in the process.
    pub fn set_power_mode(&mut self, mode: PowerMode) -> Result<(), Error> {
        if mode.is_on() {
            if !self.power.is_on() {
                debug!(display = ?self.id, ?mode, "powering on");
                self.needs_modeset = true;
                self.state = DisplayState::ValidatePending;
                self.plan = None;
            }
            self.power = mode;
            return Ok(());
        }

        if self.power.is_on() {
            debug!(display = ?self.id, ?mode, "powering off");
            self.pipeline.drain(&*self.device)?;

            let mut request = AtomicRequest::default();
            let active = self.cache.prop(&*self.device, self.crtc, "ACTIVE")?;
            request.add(self.crtc, active, 0);
            let previous = self.pipeline.framebuffer_state().clone();
            for plane in previous.assigned_planes() {
                let fb = self.cache.prop(&*self.device, plane, "FB_ID")?;
                let crtc = self.cache.prop(&*self.device, plane, "CRTC_ID")?;
                request.add(plane, fb, 0);
                request.add(plane, crtc, 0);
            }

            let submission = FrameSubmission {
                request,
                frame: Default::default(),
                acquires: Vec::new(),
                releases: std::mem::take(&mut self.pending_releases),
                allow_modeset: true,
            };
            self.pipeline
                .commit(&*self.device, submission, CommitMode::Blocking)?;
            self.vsync.set_enabled(false);
            self.release_fences.clear();
            self.client_target_release = None;
        }
        self.power = mode;
        self.plan = None;
        self.state = DisplayState::Off;
        Ok(())
    }

    /// Enable or disable vsync notifications
    pub fn set_vsync_enabled(&mut self, enabled: bool) -> Result<(), Error> {
        if enabled {
            self.check_powered()?;
        }
        self.vsync.set_enabled(enabled);
        Ok(())
    }

    /// Retire completed commits and submit the queued frame, if any.
    ///
    /// Intended to be called from the vsync handler.
    pub fn process_completions(&mut self) -> Result<(), Error> {
        self.pipeline.process_completions(&*self.device)
    }

    fn check_powered(&self) -> Result<(), Error> {
        if self.power.is_on() {
            Ok(())
        } else {
            Err(Error::DisplayOff(self.id))
        }
    }

    /// Any layer change throws away the current plan.
    fn invalidate(&mut self) {
        self.plan = None;
        if self.state != DisplayState::Off {
            self.state = DisplayState::ValidatePending;
        }
    }
}
