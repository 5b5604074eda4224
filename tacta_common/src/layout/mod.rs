//! `#[repr(C)]` layouts of every structure placed in shared memory.
//!
//! Single source of truth: the engine crate and any external tooling
//! import these definitions rather than redeclaring them. Every block
//! begins, directly or transitively, with layout-identifying size fields
//! checked on attach.

pub mod data;
pub mod registry;
pub mod topology;

pub use data::{DataHeader, LockBlock, SemBlock};
pub use registry::{DriverRecord, ProducerRecord, RegistryHeader, RegistryLayout, NO_INDEX};
pub use topology::{ModuleRecord, PatchRecord, ProducerAttr, SensorRecord, TopologyHeader};
