//! Driver layer: a writer that also publishes a topology description.
//!
//! A driver owns a `DS` block describing its patches, modules and
//! sensors. Fresh registration fills the block from the caller's details
//! callback; revival attaches the existing block and verifies both the
//! recorded struct layout and the declared dimensions before the caller
//! verifies the content. Either way the engine independently re-validates
//! internal consistency: per-module sensor counts must sum to the
//! declared sensor count, and symmetrically for modules and patches.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tacta::consts::MAX_SENSOR_TYPES;
use tacta::layout::topology::{
    modules_offset, patches_offset, sensors_offset, topology_block_size,
};
use tacta::layout::{ModuleRecord, PatchRecord, ProducerAttr, SensorRecord, TopologyHeader, NO_INDEX};
use tacta::naming::{resource_name, truncate_prefix, Role};
use tracing::{info, warn};

use crate::arena::Segment;
use crate::error::{FabricError, FabricResult};
use crate::hooks::{CleanFn, LifecycleHooks, WriteFn};
use crate::registry::Registry;
use crate::service::create_writer;
use crate::stats::TaskStatistics;
use crate::writer::{Provenance, Writer, WriterAttrs, WriterSchedule};

/// Details callback: fill (fresh) or verify (revived) the topology.
///
/// On a fresh registration the blueprint arrives empty and the callback
/// populates it; on revival it arrives reconstructed from the existing
/// block. Returning `false` aborts the registration with a cancellation
/// error.
pub type DetailsFn = Box<dyn FnMut(&mut TopologyBlueprint, Provenance) -> bool + Send>;

/// Creation attributes of a driver.
#[derive(Debug, Clone)]
pub struct DriverAttrs {
    /// Name prefix for the underlying writer and the topology block.
    pub name: String,
    /// Declared topology dimensions.
    pub attr: ProducerAttr,
    /// Bytes one sensor contributes to each buffer; the writer's buffer
    /// size is `sensor_count * response_size`.
    pub response_size: usize,
    /// Number of buffers for the underlying writer.
    pub buffer_count: usize,
    /// Scheduling discipline of the underlying writer.
    pub schedule: WriterSchedule,
}

impl DriverAttrs {
    /// The truncated name prefix.
    pub fn prefix(&self) -> &str {
        truncate_prefix(&self.name)
    }

    /// Validate the attributes.
    pub fn validate(&self) -> FabricResult<()> {
        if self.response_size == 0 {
            return Err(FabricError::InvalidArgument {
                reason: "driver response_size must be nonzero".to_string(),
            });
        }
        if self.attr.sensor_count == 0 || self.attr.module_count == 0 || self.attr.patch_count == 0
        {
            return Err(FabricError::InvalidArgument {
                reason: "driver topology dimensions must be nonzero".to_string(),
            });
        }
        Ok(())
    }
}

// ─── Topology blueprint ─────────────────────────────────────────────

/// One sensor in a blueprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorSpec {
    /// Declared sensor type.
    pub type_id: u32,
}

/// One module: an ordered list of sensors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleSpec {
    sensors: Vec<SensorSpec>,
}

impl ModuleSpec {
    /// Append a sensor of the given type.
    pub fn add_sensor(&mut self, type_id: u32) {
        self.sensors.push(SensorSpec { type_id });
    }

    /// The sensors of this module.
    pub fn sensors(&self) -> &[SensorSpec] {
        &self.sensors
    }
}

/// One patch: an ordered list of modules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSpec {
    modules: Vec<ModuleSpec>,
}

impl PatchSpec {
    /// Append an empty module and return it for population.
    pub fn add_module(&mut self) -> &mut ModuleSpec {
        self.modules.push(ModuleSpec::default());
        self.modules.last_mut().expect("just pushed")
    }

    /// The modules of this patch.
    pub fn modules(&self) -> &[ModuleSpec] {
        &self.modules
    }
}

/// The caller-facing topology description, serialized into the `DS`
/// block after validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyBlueprint {
    patches: Vec<PatchSpec>,
}

impl TopologyBlueprint {
    /// An empty blueprint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an empty patch and return it for population.
    pub fn add_patch(&mut self) -> &mut PatchSpec {
        self.patches.push(PatchSpec::default());
        self.patches.last_mut().expect("just pushed")
    }

    /// The patches of this blueprint.
    pub fn patches(&self) -> &[PatchSpec] {
        &self.patches
    }

    /// Total patch count.
    pub fn patch_count(&self) -> usize {
        self.patches.len()
    }

    /// Total module count across patches.
    pub fn module_count(&self) -> usize {
        self.patches.iter().map(|p| p.modules.len()).sum()
    }

    /// Total sensor count across modules.
    pub fn sensor_count(&self) -> usize {
        self.patches
            .iter()
            .flat_map(|p| p.modules.iter())
            .map(|m| m.sensors.len())
            .sum()
    }
}

/// Check blueprint consistency against the declared dimensions and
/// return the distinct sensor types, bounded by [`MAX_SENSOR_TYPES`].
fn validate_blueprint(blueprint: &TopologyBlueprint, attr: &ProducerAttr) -> FabricResult<Vec<u32>> {
    if blueprint.patch_count() != attr.patch_count as usize
        || blueprint.module_count() != attr.module_count as usize
        || blueprint.sensor_count() != attr.sensor_count as usize
    {
        return Err(FabricError::InvalidArgument {
            reason: format!(
                "topology totals {}p/{}m/{}s do not match declared {}p/{}m/{}s",
                blueprint.patch_count(),
                blueprint.module_count(),
                blueprint.sensor_count(),
                attr.patch_count,
                attr.module_count,
                attr.sensor_count
            ),
        });
    }
    let types: BTreeSet<u32> = blueprint
        .patches
        .iter()
        .flat_map(|p| p.modules.iter())
        .flat_map(|m| m.sensors.iter())
        .map(|s| s.type_id)
        .collect();
    if types.len() > MAX_SENSOR_TYPES {
        // A hard error, never truncation.
        return Err(FabricError::InvalidArgument {
            reason: format!(
                "{} distinct sensor types exceed the bound of {MAX_SENSOR_TYPES}",
                types.len()
            ),
        });
    }
    Ok(types.into_iter().collect())
}

/// Serialize a validated blueprint into the `DS` block.
fn write_topology(segment: &Segment, attr: &ProducerAttr, blueprint: &TopologyBlueprint) {
    // SAFETY: the block was created exclusively with the right size and
    // is not yet visible to any user.
    let header = unsafe { segment.at_mut::<TopologyHeader>(0) };
    header.init(*attr);

    let mut module_index = 0u32;
    let mut sensor_index = 0u32;
    for (pi, patch) in blueprint.patches.iter().enumerate() {
        // SAFETY: indices stay within the validated dimensions.
        let record = unsafe {
            segment.at_mut::<PatchRecord>(
                patches_offset() + pi * core::mem::size_of::<PatchRecord>(),
            )
        };
        *record = PatchRecord {
            first_module: module_index,
            module_count: patch.modules.len() as u32,
        };
        for module in &patch.modules {
            // SAFETY: as above.
            let record = unsafe {
                segment.at_mut::<ModuleRecord>(
                    modules_offset(attr) + module_index as usize * core::mem::size_of::<ModuleRecord>(),
                )
            };
            *record = ModuleRecord {
                first_sensor: sensor_index,
                sensor_count: module.sensors.len() as u32,
                patch: pi as u32,
            };
            for sensor in &module.sensors {
                // SAFETY: as above.
                let record = unsafe {
                    segment.at_mut::<SensorRecord>(
                        sensors_offset(attr)
                            + sensor_index as usize * core::mem::size_of::<SensorRecord>(),
                    )
                };
                *record = SensorRecord {
                    type_id: sensor.type_id,
                    module: module_index,
                    patch: pi as u32,
                };
                sensor_index += 1;
            }
            module_index += 1;
        }
    }
}

/// Reconstruct a blueprint from an attached `DS` block.
pub(crate) fn read_blueprint(segment: &Segment, attr: &ProducerAttr) -> TopologyBlueprint {
    let mut blueprint = TopologyBlueprint::new();
    for pi in 0..attr.patch_count as usize {
        // SAFETY: block length was validated against these dimensions.
        let patch = *unsafe {
            segment.at::<PatchRecord>(patches_offset() + pi * core::mem::size_of::<PatchRecord>())
        };
        let patch_spec = blueprint.add_patch();
        for mi in patch.first_module..patch.first_module + patch.module_count {
            if mi >= attr.module_count {
                // Malformed record; the consistency check rejects the
                // truncated blueprint afterwards.
                break;
            }
            // SAFETY: as above, with `mi` bounded by the declared count.
            let module = *unsafe {
                segment.at::<ModuleRecord>(
                    modules_offset(attr) + mi as usize * core::mem::size_of::<ModuleRecord>(),
                )
            };
            let module_spec = patch_spec.add_module();
            for si in module.first_sensor..module.first_sensor + module.sensor_count {
                if si >= attr.sensor_count {
                    break;
                }
                // SAFETY: as above, with `si` bounded by the declared count.
                let sensor = *unsafe {
                    segment.at::<SensorRecord>(
                        sensors_offset(attr) + si as usize * core::mem::size_of::<SensorRecord>(),
                    )
                };
                module_spec.add_sensor(sensor.type_id);
            }
        }
    }
    blueprint
}

/// Attach and validate an existing `DS` block against the expected
/// dimensions.
pub(crate) fn attach_topology(prefix: &str, attr: &ProducerAttr) -> FabricResult<Segment> {
    let name = resource_name(prefix, Role::Topology);
    let segment = Segment::attach(&name, topology_block_size(attr))?;
    // SAFETY: minimum length enforced by attach.
    let header = unsafe { segment.at::<TopologyHeader>(0) };
    if !header.is_magic_valid() || !header.layout_matches() {
        return Err(FabricError::LayoutMismatch { name });
    }
    if header.attr != *attr {
        return Err(FabricError::AlreadyExists { name });
    }
    Ok(segment)
}

// ─── Driver object ──────────────────────────────────────────────────

/// A live driver: a writer plus its published topology.
pub struct Driver {
    writer: Writer,
    topology: Segment,
    record_index: usize,
    registry: Arc<Registry>,
    attr: ProducerAttr,
    sensor_types: Vec<u32>,
    clean: Option<CleanFn>,
    torn_down: bool,
}

impl Driver {
    /// The driver's (truncated) name prefix.
    pub fn name(&self) -> &str {
        self.writer.name()
    }

    /// The declared topology dimensions.
    pub fn attr(&self) -> &ProducerAttr {
        &self.attr
    }

    /// The distinct sensor types served.
    pub fn sensor_types(&self) -> &[u32] {
        &self.sensor_types
    }

    /// Whether this driver revived an existing registration.
    pub fn provenance(&self) -> Provenance {
        self.writer.provenance()
    }

    /// The underlying writer.
    pub fn writer(&self) -> &Writer {
        &self.writer
    }

    /// The driver table index backing this driver.
    pub(crate) fn record_index(&self) -> usize {
        self.record_index
    }

    /// Pause the underlying writer.
    pub fn pause(&self) {
        self.writer.pause();
    }

    /// Resume the underlying writer.
    pub fn resume(&self) {
        self.writer.resume();
    }

    /// Whether the underlying producer is active.
    pub fn is_active(&self) -> bool {
        self.writer.is_active()
    }

    /// Statistics of the underlying writer task.
    pub fn statistics(&self) -> TaskStatistics {
        self.writer.statistics()
    }

    /// Fire an acquisition request (sporadic drivers only).
    pub fn request(&self, timeout: Duration) -> FabricResult<()> {
        self.writer.request(timeout)
    }

    /// Full teardown: unregister the driver record, remove the writer,
    /// release the topology block, invoke the clean hook.
    pub(crate) fn shutdown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if self.writer.is_alias() {
            // The driver belongs to another process; drop our view only.
            self.writer.shutdown();
            if let Some(clean) = self.clean.take() {
                clean();
            }
            return;
        }

        let mut release_topology = false;
        let mut writer_slot = None;
        match self.registry.drivers_write() {
            Ok(guard) => {
                let record = guard.driver_mut(self.record_index);
                record.active.store(0, Ordering::Release);
                if record.users_attached.load(Ordering::Acquire) == 0 {
                    if record.writer_index != NO_INDEX {
                        writer_slot = Some(record.writer_index as usize);
                    }
                    record.clear();
                    release_topology = true;
                }
            }
            Err(e) => warn!("driver {} teardown: {e}", self.name()),
        }
        if let Some(slot) = writer_slot {
            if let Ok(guard) = self.registry.global_write() {
                let producer = guard.producer_mut(slot);
                if producer.in_use != 0 {
                    producer.driver_index = NO_INDEX;
                }
            }
        }

        self.writer.shutdown();

        if release_topology {
            self.topology.unlink();
        } else {
            self.topology.disown();
        }

        if let Some(clean) = self.clean.take() {
            clean();
        }
        info!("driver removed");
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Register a driver: create or revive the underlying writer, publish or
/// verify the topology, claim or re-enter the driver record.
///
/// Failure at any step past writer creation unwinds the driver and the
/// writer; the clean hook still runs.
pub(crate) fn create_driver(
    registry: &Arc<Registry>,
    attrs: DriverAttrs,
    mut details: DetailsFn,
    acquire: WriteFn,
    mut hooks: LifecycleHooks,
) -> FabricResult<Driver> {
    let clean = hooks.clean.take();
    match create_driver_inner(registry, attrs, &mut details, acquire, hooks.init) {
        Ok(mut driver) => {
            driver.clean = clean;
            Ok(driver)
        }
        Err(e) => {
            if let Some(clean) = clean {
                clean();
            }
            Err(e)
        }
    }
}

fn create_driver_inner(
    registry: &Arc<Registry>,
    attrs: DriverAttrs,
    details: &mut DetailsFn,
    acquire: WriteFn,
    init: Option<crate::hooks::InitFn>,
) -> FabricResult<Driver> {
    attrs.validate()?;
    let prefix = attrs.prefix().to_string();
    let attr = attrs.attr;

    let writer_attrs = WriterAttrs {
        name: attrs.name.clone(),
        buffer_size: attr.sensor_count as usize * attrs.response_size,
        buffer_count: attrs.buffer_count,
        schedule: attrs.schedule,
    };
    let mut writer = create_writer(
        registry,
        writer_attrs,
        acquire,
        LifecycleHooks { init, clean: None },
    )?;
    let provenance = writer.provenance();

    let built = match provenance {
        Provenance::Fresh => add_fresh_driver(registry, &prefix, &attr, details, &writer),
        Provenance::Revived => revive_driver(registry, &prefix, &attr, details, &writer),
    };
    let (topology, record_index, sensor_types) = match built {
        Ok(parts) => parts,
        Err(e) => {
            // Unwind by removing the writer; a fresh topology block
            // unlinks itself when its owning segment drops.
            writer.shutdown();
            return Err(e);
        }
    };

    match provenance {
        Provenance::Fresh => info!("driver {prefix} registered"),
        Provenance::Revived => info!("driver {prefix} revived"),
    }
    Ok(Driver {
        writer,
        topology,
        record_index,
        registry: Arc::clone(registry),
        attr,
        sensor_types,
        clean: None,
        torn_down: false,
    })
}

fn add_fresh_driver(
    registry: &Arc<Registry>,
    prefix: &str,
    attr: &ProducerAttr,
    details: &mut DetailsFn,
    writer: &Writer,
) -> FabricResult<(Segment, usize, Vec<u32>)> {
    let name = resource_name(prefix, Role::Topology);
    let topology = Segment::create_exclusive(&name, topology_block_size(attr))?;

    let mut blueprint = TopologyBlueprint::new();
    if !details(&mut blueprint, Provenance::Fresh) {
        return Err(FabricError::Cancelled {
            reason: format!("details callback aborted registration of {prefix}"),
        });
    }
    let sensor_types = validate_blueprint(&blueprint, attr)?;
    write_topology(&topology, attr, &blueprint);

    let record_index = {
        let guard = registry.drivers_write()?;
        let index = guard.find_free_driver().ok_or(FabricError::OutOfSpace {
            what: "driver table",
        })?;
        let record = guard.driver_mut(index);
        record.clear();
        record.attr = *attr;
        record.sensor_type_count = sensor_types.len() as u32;
        record.sensor_types[..sensor_types.len()].copy_from_slice(&sensor_types);
        record.writer_index = writer.slot() as i32;
        record.in_use = 1;
        record.active.store(1, Ordering::Release);
        index
    };

    // Backlink from the producer record, under the global lock.
    {
        let guard = registry.global_write()?;
        guard.producer_mut(writer.slot()).driver_index = record_index as i32;
    }

    Ok((topology, record_index, sensor_types))
}

fn revive_driver(
    registry: &Arc<Registry>,
    prefix: &str,
    attr: &ProducerAttr,
    details: &mut DetailsFn,
    writer: &Writer,
) -> FabricResult<(Segment, usize, Vec<u32>)> {
    let topology = attach_topology(prefix, attr)?;

    let mut blueprint = read_blueprint(&topology, attr);
    if !details(&mut blueprint, Provenance::Revived) {
        return Err(FabricError::Cancelled {
            reason: format!("details callback rejected revival of {prefix}"),
        });
    }
    let sensor_types = validate_blueprint(&blueprint, attr)?;

    let record_index = {
        let guard = registry.drivers_write()?;
        match guard.find_by_writer(writer.slot()) {
            Some(index) => {
                let record = guard.driver_mut(index);
                if record.attr != *attr {
                    return Err(FabricError::AlreadyExists {
                        name: prefix.to_string(),
                    });
                }
                record.active.store(1, Ordering::Release);
                index
            }
            None => {
                // The driver record was freed when its last user left;
                // re-enter a fresh slot against the revived writer.
                let index = guard.find_free_driver().ok_or(FabricError::OutOfSpace {
                    what: "driver table",
                })?;
                let record = guard.driver_mut(index);
                record.clear();
                record.attr = *attr;
                record.sensor_type_count = sensor_types.len() as u32;
                record.sensor_types[..sensor_types.len()].copy_from_slice(&sensor_types);
                record.writer_index = writer.slot() as i32;
                record.in_use = 1;
                record.active.store(1, Ordering::Release);
                index
            }
        }
    };

    {
        let guard = registry.global_write()?;
        guard.producer_mut(writer.slot()).driver_index = record_index as i32;
    }

    Ok((topology, record_index, sensor_types))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_blueprint(patches: usize, modules_per: usize, sensors_per: usize) -> TopologyBlueprint {
        let mut blueprint = TopologyBlueprint::new();
        for _ in 0..patches {
            let patch = blueprint.add_patch();
            for _ in 0..modules_per {
                let module = patch.add_module();
                for s in 0..sensors_per {
                    module.add_sensor(s as u32 % 3);
                }
            }
        }
        blueprint
    }

    #[test]
    fn blueprint_counts() {
        let blueprint = square_blueprint(2, 3, 4);
        assert_eq!(blueprint.patch_count(), 2);
        assert_eq!(blueprint.module_count(), 6);
        assert_eq!(blueprint.sensor_count(), 24);
    }

    #[test]
    fn consistent_blueprint_passes() {
        let blueprint = square_blueprint(1, 2, 5);
        let attr = ProducerAttr {
            patch_count: 1,
            module_count: 2,
            sensor_count: 10,
        };
        let types = validate_blueprint(&blueprint, &attr).unwrap();
        assert_eq!(types, vec![0, 1, 2]);
    }

    #[test]
    fn sum_mismatch_is_rejected() {
        // Declares 10 sensors but the modules sum to 9.
        let mut blueprint = TopologyBlueprint::new();
        let patch = blueprint.add_patch();
        let module = patch.add_module();
        for _ in 0..9 {
            module.add_sensor(0);
        }
        let attr = ProducerAttr {
            patch_count: 1,
            module_count: 1,
            sensor_count: 10,
        };
        assert!(matches!(
            validate_blueprint(&blueprint, &attr),
            Err(FabricError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn type_bound_is_hard_error() {
        let mut blueprint = TopologyBlueprint::new();
        let patch = blueprint.add_patch();
        let module = patch.add_module();
        for t in 0..(MAX_SENSOR_TYPES as u32 + 1) {
            module.add_sensor(t);
        }
        let attr = ProducerAttr {
            patch_count: 1,
            module_count: 1,
            sensor_count: MAX_SENSOR_TYPES as u32 + 1,
        };
        assert!(matches!(
            validate_blueprint(&blueprint, &attr),
            Err(FabricError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn topology_roundtrip_through_block() {
        let attr = ProducerAttr {
            patch_count: 2,
            module_count: 4,
            sensor_count: 12,
        };
        let blueprint = square_blueprint(2, 2, 3);
        assert!(validate_blueprint(&blueprint, &attr).is_ok());

        let name = format!("drv_topo_{}", std::process::id());
        let segment = Segment::create_exclusive(
            &name,
            topology_block_size(&attr),
        )
        .unwrap();
        write_topology(&segment, &attr, &blueprint);

        let reread = read_blueprint(&segment, &attr);
        assert_eq!(reread, blueprint);
    }
}
