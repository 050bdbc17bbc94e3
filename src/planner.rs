//! The per-frame composition planner.
//!
//! Walks the layer stack from front to back and greedily binds each layer
//! to a hardware plane, degrading to client composition whenever the plane
//! topology or plane capabilities cannot satisfy a layer. Planning never
//! hard-fails: running out of planes is a valid outcome, not an error.
//!
//! Plane preference is derived from the registry order (primary first,
//! overlays by ascending capability generality, cursor last): candidates
//! are tried in reverse, so the topmost layer takes the most general
//! overlay, specialized overlays remain available for lower layers, and
//! the primary plane is tried last and usually ends up with the
//! bottom-most layer. The exact preference order is device policy; the
//! load-bearing invariants are determinism, no double-assignment and
//! graceful degradation.

use indexmap::IndexSet;
use tracing::trace;

use crate::device::PlaneHandle;
use crate::layer::{CompositionType, Layer, LayerId};
use crate::registry::{PlaneInfo, PlaneType};
use crate::utils::{Physical, Rectangle, Size};

/// Per-layer outcome of a planning pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanEntry {
    /// The layer this entry describes
    pub layer: LayerId,
    /// Final composition type chosen by the planner
    pub composition: CompositionType,
    /// Plane the layer was bound to, `None` for client composition
    pub plane: Option<PlaneHandle>,
}

/// Constraints a planning pass runs under
#[derive(Debug, Clone)]
pub struct PlanConstraints<'a> {
    /// Bounds of the display; fully offscreen layers degrade to client
    pub bounds: Rectangle<i32, Physical>,
    /// Maximum size the cursor plane can scan out
    pub cursor_size: Size<u32, Physical>,
    /// Layers a previous kernel rejection implicated; they must not be
    /// offered a plane again until their state changes
    pub forced_client: &'a [LayerId],
}

/// Result of one planning pass.
///
/// Ephemeral: valid until the next validate or property update.
#[derive(Debug, Clone, Default)]
pub struct CompositionPlan {
    entries: Vec<PlanEntry>,
    changed: Vec<(LayerId, CompositionType)>,
    client_target_plane: Option<PlaneHandle>,
}

impl CompositionPlan {
    /// Entries in plan order (descending z)
    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    /// Layers whose final composition type differs from the client's hint,
    /// in ascending layer id order
    pub fn changed_composition_types(&self) -> &[(LayerId, CompositionType)] {
        &self.changed
    }

    /// Plane receiving the client-composited output, if any layer needs it
    /// and a plane is left to carry it
    pub fn client_target_plane(&self) -> Option<PlaneHandle> {
        self.client_target_plane
    }

    /// Plane assigned to `layer`, if it is device-composited
    pub fn plane_of(&self, layer: LayerId) -> Option<PlaneHandle> {
        self.entries
            .iter()
            .find(|entry| entry.layer == layer)
            .and_then(|entry| entry.plane)
    }

    /// Final composition type of `layer`
    pub fn composition_of(&self, layer: LayerId) -> Option<CompositionType> {
        self.entries
            .iter()
            .find(|entry| entry.layer == layer)
            .map(|entry| entry.composition)
    }

    /// Whether any layer routes through client composition
    pub fn needs_client_composition(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.composition == CompositionType::Client)
    }

    /// Whether the plan contains no layers at all
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Run one planning pass over `layers` with the planes routable to the
/// display's CRTC.
///
/// `planes` must be in registry preference order as returned by
/// [`Registry::planes_for_crtc`](crate::registry::Registry::planes_for_crtc).
/// The result is deterministic: the same layers, planes and constraints
/// produce the same plan.
pub fn plan(layers: &[&Layer], planes: &[&PlaneInfo], constraints: &PlanConstraints<'_>) -> CompositionPlan {
    // Topmost first; creation order (ascending id) breaks z ties so that
    // repeated passes over unchanged input stay deterministic.
    let mut stack: Vec<&Layer> = layers.to_vec();
    stack.sort_by(|a, b| b.z_order().cmp(&a.z_order()).then(a.id().cmp(&b.id())));

    let cursor_plane = planes.iter().find(|plane| plane.type_ == PlaneType::Cursor);
    let primary_plane = planes.iter().find(|plane| plane.type_ == PlaneType::Primary);

    let mut claimed: IndexSet<PlaneHandle> = IndexSet::with_capacity(planes.len());
    let mut entries = Vec::with_capacity(stack.len());

    for layer in &stack {
        let hint = layer.composition_hint();
        let entry = assign_layer(layer, planes, cursor_plane.copied(), constraints, &mut claimed);
        trace!(
            layer = ?layer.id(),
            ?hint,
            composition = ?entry.composition,
            plane = ?entry.plane,
            "planned layer"
        );
        entries.push(entry);
    }

    let needs_client = entries
        .iter()
        .any(|entry| entry.composition == CompositionType::Client);
    // The primary plane doubles as the recipient of the client-composited
    // output. If a device layer already took it the client target is
    // dropped for this frame, which is the device-dependent degradation
    // the plan format allows.
    let client_target_plane = if needs_client {
        primary_plane
            .map(|plane| plane.handle)
            .filter(|handle| !claimed.contains(handle))
    } else {
        None
    };

    let mut changed: Vec<(LayerId, CompositionType)> = entries
        .iter()
        .zip(&stack)
        .filter(|(entry, layer)| entry.composition != layer.composition_hint())
        .map(|(entry, _)| (entry.layer, entry.composition))
        .collect();
    changed.sort_by_key(|(id, _)| *id);

    CompositionPlan {
        entries,
        changed,
        client_target_plane,
    }
}

fn assign_layer(
    layer: &Layer,
    planes: &[&PlaneInfo],
    cursor_plane: Option<&PlaneInfo>,
    constraints: &PlanConstraints<'_>,
    claimed: &mut IndexSet<PlaneHandle>,
) -> PlanEntry {
    let client = PlanEntry {
        layer: layer.id(),
        composition: CompositionType::Client,
        plane: None,
    };

    if constraints.forced_client.contains(&layer.id()) {
        return client;
    }

    // A destination fully outside the display can not be scanned out;
    // route it through client composition instead of tripping the kernel.
    if layer
        .display_frame()
        .intersection(constraints.bounds)
        .is_none()
    {
        return client;
    }

    match layer.composition_hint() {
        CompositionType::Client | CompositionType::SolidColor | CompositionType::Invalid => client,
        CompositionType::Cursor => {
            let frame = layer.display_frame();
            let fits = frame.size.w as u32 <= constraints.cursor_size.w
                && frame.size.h as u32 <= constraints.cursor_size.h;
            match cursor_plane {
                Some(plane) if fits && !claimed.contains(&plane.handle) && plane_accepts(plane, layer) => {
                    claimed.insert(plane.handle);
                    PlanEntry {
                        layer: layer.id(),
                        composition: CompositionType::Cursor,
                        plane: Some(plane.handle),
                    }
                }
                _ => client,
            }
        }
        CompositionType::Device => {
            // Reverse preference order: most general overlay first, the
            // primary plane strictly last, the cursor plane never.
            for plane in planes
                .iter()
                .rev()
                .filter(|plane| plane.type_ != PlaneType::Cursor)
            {
                if claimed.contains(&plane.handle) || !plane_accepts(plane, layer) {
                    continue;
                }
                claimed.insert(plane.handle);
                return PlanEntry {
                    layer: layer.id(),
                    composition: CompositionType::Device,
                    plane: Some(plane.handle),
                };
            }
            client
        }
    }
}

fn plane_accepts(plane: &PlaneInfo, layer: &Layer) -> bool {
    let Some(buffer) = layer.buffer() else {
        return false;
    };
    // Mismatched color metadata inside a plane that can not represent it
    // would silently mis-render; degrading to client composition is a
    // correctness requirement, not a heuristic.
    plane.supports_format(buffer.format, buffer.modifier)
        && plane.supports_transform(layer.transform())
        && plane.supports_color_space(layer.color_space())
}
