//! Shared geometry and synchronization helpers

mod fence;
mod geometry;

pub use self::fence::{Fence, FenceState, SwFence, SyncPoint};
pub use self::geometry::{Buffer, Coordinate, Physical, Point, Rectangle, Size};
