//! Deterministic shared-resource naming.
//!
//! Every shared object a producer owns derives its name from the producer's
//! chosen prefix plus a reserved 3-character role suffix. Consumers attach
//! with the identical prefix; suffixes are appended here and never
//! user-chosen. The function is pure - two processes given the same prefix
//! always agree on every derived name.

use crate::consts::{FILE_PREFIX, MAX_BUFFER_COUNT, MAX_NAME_LEN};

/// Role of a shared resource within one producer's object family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Buffer data block (`MEM`).
    Data,
    /// Sporadic request semaphore (`REQ`).
    Request,
    /// Sporadic response semaphore (`RES`).
    Response,
    /// Per-buffer read/write lock (`RW0`..`RW7`).
    BufferLock(usize),
    /// Driver topology block (`DS`).
    Topology,
}

impl Role {
    /// The reserved 3-character suffix for this role.
    pub fn suffix(&self) -> String {
        match self {
            Role::Data => "MEM".to_string(),
            Role::Request => "REQ".to_string(),
            Role::Response => "RES".to_string(),
            Role::BufferLock(i) => {
                debug_assert!(*i < MAX_BUFFER_COUNT);
                format!("RW{i}")
            }
            Role::Topology => "DS".to_string(),
        }
    }
}

/// Truncate a user-chosen prefix to [`MAX_NAME_LEN`] bytes.
///
/// Truncation is at a UTF-8 boundary so the result stays a valid string.
pub fn truncate_prefix(prefix: &str) -> &str {
    if prefix.len() <= MAX_NAME_LEN {
        return prefix;
    }
    let mut end = MAX_NAME_LEN;
    while !prefix.is_char_boundary(end) {
        end -= 1;
    }
    &prefix[..end]
}

/// Derive the shared-object name for `role` from a producer prefix.
///
/// The result is the `/dev/shm` filename stem, e.g. prefix `"palm"` with
/// [`Role::Data`] yields `"tacta_palmMEM"`.
pub fn resource_name(prefix: &str, role: Role) -> String {
    format!("{FILE_PREFIX}{}{}", truncate_prefix(prefix), role.suffix())
}

/// Derive the filesystem path of a shared object under `/dev/shm`.
pub fn resource_path(prefix: &str, role: Role) -> String {
    format!("/dev/shm/{}", resource_name(prefix, role))
}

/// Derive the registry block name for a registry chosen by `name`.
///
/// The registry is not part of any producer family and carries no role
/// suffix; its name is the truncated user name alone.
pub fn registry_name(name: &str) -> String {
    format!("{FILE_PREFIX}{}", truncate_prefix(name))
}
