//! # TACTA Common
//!
//! Shared constants, resource naming, tuning configuration and the
//! `#[repr(C)]` shared-memory layouts for the TACTA fabric. This crate is
//! the single source of truth for everything two unrelated processes must
//! agree on; the engine lives in `tacta_shared_memory`.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod consts;
pub mod layout;
pub mod naming;
pub mod sync;

pub use config::{ConfigError, TuningConfig};
pub use layout::{
    DataHeader, DriverRecord, LockBlock, ModuleRecord, PatchRecord, ProducerAttr, ProducerRecord,
    RegistryHeader, RegistryLayout, SemBlock, SensorRecord, TopologyHeader, NO_INDEX,
};
pub use naming::{registry_name, resource_name, resource_path, Role};
pub use sync::{SharedRwLock, SharedSemaphore};
