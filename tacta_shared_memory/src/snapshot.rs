//! Registry snapshot diagnostics.
//!
//! A read-only, serializable dump of the producer and driver tables for
//! tooling: monitors, shell inspection, bug reports. Taken under the
//! read locks, so it is internally consistent at the instant of capture.

use std::sync::atomic::Ordering;

use serde::Serialize;

use crate::error::FabricResult;
use crate::registry::Registry;

/// Snapshot of one producer slot.
#[derive(Debug, Clone, Serialize)]
pub struct ProducerSnapshot {
    /// Slot index.
    pub slot: usize,
    /// Name prefix.
    pub name: String,
    /// Size of one buffer in bytes.
    pub buffer_size: u64,
    /// Number of buffers.
    pub buffer_count: u32,
    /// Writer period in microseconds (0 = sporadic).
    pub period_us: u64,
    /// Whether the producer is active.
    pub active: bool,
    /// Whether the last write reported failure.
    pub bad: bool,
    /// Count of attached readers.
    pub readers_attached: u32,
    /// Driver table index, if this producer backs a driver.
    pub driver_index: Option<usize>,
    /// Owning writer process id.
    pub writer_pid: u32,
    /// Whether the owning process is still alive.
    pub writer_alive: bool,
}

/// Snapshot of one driver slot.
#[derive(Debug, Clone, Serialize)]
pub struct DriverSnapshot {
    /// Slot index.
    pub slot: usize,
    /// Declared patch count.
    pub patch_count: u32,
    /// Declared module count.
    pub module_count: u32,
    /// Declared sensor count.
    pub sensor_count: u32,
    /// Distinct sensor types served.
    pub sensor_types: Vec<u32>,
    /// Count of attached users.
    pub users_attached: u32,
    /// Backing producer slot index.
    pub writer_index: Option<usize>,
    /// Whether the driver is active.
    pub active: bool,
}

/// Consistent dump of both registry tables.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    /// All in-use producer slots.
    pub producers: Vec<ProducerSnapshot>,
    /// All in-use driver slots.
    pub drivers: Vec<DriverSnapshot>,
}

impl RegistrySnapshot {
    /// Serialize to pretty JSON for display.
    pub fn to_json(&self) -> FabricResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| crate::error::FabricError::Io {
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })
    }
}

impl Registry {
    /// Capture a snapshot of both tables under the read locks.
    pub fn snapshot(&self) -> FabricResult<RegistrySnapshot> {
        let global = self.global_read()?;
        let drivers_guard = self.drivers_read()?;

        let producers = global
            .producers()
            .iter()
            .enumerate()
            .filter(|(_, record)| record.in_use != 0)
            .map(|(slot, record)| ProducerSnapshot {
                slot,
                name: record.name_str().to_string(),
                buffer_size: record.buffer_size,
                buffer_count: record.buffer_count,
                period_us: record.period_us,
                active: record.active.load(Ordering::Acquire) != 0,
                bad: record.bad.load(Ordering::Acquire) != 0,
                readers_attached: record.readers_attached.load(Ordering::Acquire),
                driver_index: usize::try_from(record.driver_index).ok(),
                writer_pid: record.writer_pid,
                writer_alive: is_process_alive(record.writer_pid),
            })
            .collect();

        let drivers = drivers_guard
            .drivers()
            .iter()
            .enumerate()
            .filter(|(_, record)| record.in_use != 0)
            .map(|(slot, record)| DriverSnapshot {
                slot,
                patch_count: record.attr.patch_count,
                module_count: record.attr.module_count,
                sensor_count: record.attr.sensor_count,
                sensor_types: record.types().to_vec(),
                users_attached: record.users_attached.load(Ordering::Acquire),
                writer_index: usize::try_from(record.writer_index).ok(),
                active: record.active.load(Ordering::Acquire) != 0,
            })
            .collect();

        Ok(RegistrySnapshot { producers, drivers })
    }
}

/// Check whether a process exists, without signalling it.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[cfg(target_os = "linux")]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid as i32), None) {
            Ok(_) => true,
            Err(nix::Error::EPERM) => true,
            Err(_) => false,
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tacta::TuningConfig;

    #[test]
    fn own_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(0));
    }

    #[test]
    fn empty_registry_snapshots_empty() {
        let name = format!("snap_{}", std::process::id());
        let registry = Registry::create_or_attach(&name, TuningConfig::default()).unwrap();
        let snapshot = registry.snapshot().unwrap();
        assert!(snapshot.producers.is_empty());
        assert!(snapshot.drivers.is_empty());
        assert!(snapshot.to_json().unwrap().contains("producers"));
    }
}
