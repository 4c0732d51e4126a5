// ── Structure model ──
//
// Devices as described by the Miniserver's structure snapshot, plus the
// read-only index the pipeline resolves decoded records against.

pub mod device;
pub mod index;

pub use device::{Device, SubField};
pub use index::{Resolved, StructureIndex, StructureSource};
