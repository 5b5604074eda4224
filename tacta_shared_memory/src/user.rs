//! User layer: a reader attached to a driver, with a locally
//! reconstructed topology view.
//!
//! Attachment resolves the target either by producer name or, when no
//! name is given, by scanning the driver table for an active driver
//! serving the requested sensor type that this process is not already
//! attached to. The topology block is copied once into a flattened,
//! index-linked view; a secondary per-type chain enables type-scoped
//! iteration without rescanning all sensors.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tacta::layout::{ProducerAttr, NO_INDEX};
use tracing::{debug, warn};

use crate::arena::Segment;
use crate::driver::{attach_topology, read_blueprint, TopologyBlueprint};
use crate::error::{FabricError, FabricResult};
use crate::hooks::{LifecycleHooks, ReadCycle, ReadFn, UserHooks};
use crate::reader::{Reader, ReaderAttrs, ReaderSchedule};
use crate::registry::Registry;
use crate::stats::TaskStatistics;

/// Peek callback: consume one locked buffer together with the topology
/// view describing its layout.
pub type PeekFn = Box<dyn FnMut(&[u8], &ReadCycle, &TopologyView) -> bool + Send>;

/// Attachment attributes of a user.
#[derive(Debug, Clone, Default)]
pub struct UserAttrs {
    /// Producer name to attach to. When absent, `sensor_type` drives
    /// discovery.
    pub name: Option<String>,
    /// Sensor type to discover a driver by, when no name is given.
    pub sensor_type: Option<u32>,
}

impl UserAttrs {
    /// Validate the attributes.
    pub fn validate(&self) -> FabricResult<()> {
        if self.name.is_none() && self.sensor_type.is_none() {
            return Err(FabricError::InvalidArgument {
                reason: "user attach needs a name or a sensor type".to_string(),
            });
        }
        Ok(())
    }
}

// ─── Topology view ──────────────────────────────────────────────────

/// One patch in the local view.
#[derive(Debug, Clone, Copy)]
pub struct Patch {
    /// Index of the first module of this patch.
    pub first_module: usize,
    /// Number of modules in this patch.
    pub module_count: usize,
}

/// One module in the local view.
#[derive(Debug, Clone, Copy)]
pub struct Module {
    /// Index of the first sensor of this module.
    pub first_sensor: usize,
    /// Number of sensors in this module.
    pub sensor_count: usize,
    /// Index of the owning patch.
    pub patch: usize,
}

/// One sensor in the local view, back-referencing its module and patch
/// and chaining to the next sensor of the same type.
#[derive(Debug, Clone, Copy)]
pub struct Sensor {
    /// Declared sensor type.
    pub type_id: u32,
    /// Index of the owning module.
    pub module: usize,
    /// Index of the owning patch.
    pub patch: usize,
    /// Next sensor of the same type, if any.
    pub next_of_type: Option<usize>,
}

/// Head of one per-type sensor chain.
#[derive(Debug, Clone, Copy)]
pub struct TypeChain {
    /// The sensor type.
    pub type_id: u32,
    /// Index of the first sensor of this type.
    pub first_sensor: usize,
    /// Number of sensors of this type.
    pub count: usize,
}

/// Flattened, index-linked copy of a driver's topology.
#[derive(Debug, Clone, Default)]
pub struct TopologyView {
    patches: Vec<Patch>,
    modules: Vec<Module>,
    sensors: Vec<Sensor>,
    types: Vec<TypeChain>,
}

impl TopologyView {
    /// Build the view from a reconstructed blueprint.
    pub(crate) fn from_blueprint(blueprint: &TopologyBlueprint) -> Self {
        let mut view = TopologyView::default();
        for patch_spec in blueprint.patches() {
            let first_module = view.modules.len();
            let patch_index = view.patches.len();
            for module_spec in patch_spec.modules() {
                let first_sensor = view.sensors.len();
                let module_index = view.modules.len();
                for sensor_spec in module_spec.sensors() {
                    view.sensors.push(Sensor {
                        type_id: sensor_spec.type_id,
                        module: module_index,
                        patch: patch_index,
                        next_of_type: None,
                    });
                }
                view.modules.push(Module {
                    first_sensor,
                    sensor_count: module_spec.sensors().len(),
                    patch: patch_index,
                });
            }
            view.patches.push(Patch {
                first_module,
                module_count: patch_spec.modules().len(),
            });
        }
        view.link_types();
        view
    }

    /// Build the per-type chains: `first_sensor` heads plus
    /// `next_of_type` links, in sensor order.
    fn link_types(&mut self) {
        let mut last_of_type: Vec<(u32, usize)> = Vec::new();
        for index in 0..self.sensors.len() {
            let type_id = self.sensors[index].type_id;
            match self.types.iter_mut().find(|chain| chain.type_id == type_id) {
                Some(chain) => {
                    chain.count += 1;
                    let (_, last) = last_of_type
                        .iter_mut()
                        .find(|(t, _)| *t == type_id)
                        .expect("chain exists, so a last element exists");
                    self.sensors[*last].next_of_type = Some(index);
                    *last = index;
                }
                None => {
                    self.types.push(TypeChain {
                        type_id,
                        first_sensor: index,
                        count: 1,
                    });
                    last_of_type.push((type_id, index));
                }
            }
        }
    }

    /// Number of patches.
    pub fn patch_count(&self) -> usize {
        self.patches.len()
    }

    /// Number of modules.
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Number of sensors.
    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    /// All patches.
    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    /// All modules.
    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    /// All sensors.
    pub fn sensors(&self) -> &[Sensor] {
        &self.sensors
    }

    /// The per-type chain heads.
    pub fn types(&self) -> &[TypeChain] {
        &self.types
    }

    /// Visit every sensor with its index.
    pub fn for_each_sensor(&self, mut f: impl FnMut(usize, &Sensor)) {
        for (index, sensor) in self.sensors.iter().enumerate() {
            f(index, sensor);
        }
    }

    /// Visit every sensor of one type, walking its chain.
    pub fn for_each_sensor_of_type(&self, type_id: u32, mut f: impl FnMut(usize, &Sensor)) {
        let Some(chain) = self.types.iter().find(|chain| chain.type_id == type_id) else {
            return;
        };
        let mut cursor = Some(chain.first_sensor);
        while let Some(index) = cursor {
            let sensor = &self.sensors[index];
            f(index, sensor);
            cursor = sensor.next_of_type;
        }
    }
}

// ─── User object ────────────────────────────────────────────────────

/// A live user: a reader plus its reconstructed topology view.
pub struct User {
    reader: Reader,
    topology: Segment,
    view: Arc<TopologyView>,
    record_index: usize,
    registry: Arc<Registry>,
    attr: ProducerAttr,
    hooks: UserHooks,
    torn_down: bool,
}

impl User {
    /// The attached producer's (truncated) name prefix.
    pub fn name(&self) -> &str {
        self.reader.name()
    }

    /// The topology view.
    pub fn view(&self) -> &TopologyView {
        &self.view
    }

    /// The declared topology dimensions at attach time.
    pub fn attr(&self) -> &ProducerAttr {
        &self.attr
    }

    /// The underlying reader.
    pub fn reader(&self) -> &Reader {
        &self.reader
    }

    /// The driver table index this user is attached to.
    pub(crate) fn record_index(&self) -> usize {
        self.record_index
    }

    /// Pause the underlying reader.
    pub fn pause(&self) {
        self.reader.pause();
    }

    /// Resume the underlying reader.
    pub fn resume(&self) {
        self.reader.resume();
    }

    /// Statistics of the underlying reader task.
    pub fn statistics(&self) -> TaskStatistics {
        self.reader.statistics()
    }

    /// Fire a refresh request (sporadic users only).
    pub fn request(&self, timeout: Duration) -> FabricResult<()> {
        self.reader.request(timeout)
    }

    /// Fire a refresh request without waiting (sporadic users only).
    pub fn request_nonblocking(&self) -> FabricResult<()> {
        self.reader.request_nonblocking()
    }

    /// Await a previously fired request (sporadic users only).
    pub fn await_response(&self, timeout: Duration) -> FabricResult<()> {
        self.reader.await_response(timeout)
    }

    /// Full teardown with the documented hook order: generic clean, then
    /// patch, module and sensor hooks, then the object-specific hook;
    /// afterwards the driver attachment and the reader are released.
    pub(crate) fn shutdown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if let Some(clean) = self.hooks.clean.take() {
            clean();
        }
        if let Some(mut patch_clean) = self.hooks.patch_clean.take() {
            for index in 0..self.view.patch_count() {
                patch_clean(index);
            }
        }
        if let Some(mut module_clean) = self.hooks.module_clean.take() {
            for index in 0..self.view.module_count() {
                module_clean(index);
            }
        }
        if let Some(mut sensor_clean) = self.hooks.sensor_clean.take() {
            for index in 0..self.view.sensor_count() {
                sensor_clean(index);
            }
        }
        if let Some(object_clean) = self.hooks.object_clean.take() {
            object_clean();
        }

        // Drop the driver attachment; the last user of an inactive
        // driver erases its record.
        let mut release_topology = false;
        let mut writer_slot = None;
        match self.registry.drivers_write() {
            Ok(guard) => {
                let record = guard.driver_mut(self.record_index);
                let before = record.users_attached.fetch_sub(1, Ordering::AcqRel);
                if before == 1
                    && record.in_use != 0
                    && record.active.load(Ordering::Acquire) == 0
                {
                    if record.writer_index != NO_INDEX {
                        writer_slot = Some(record.writer_index as usize);
                    }
                    record.clear();
                    release_topology = true;
                }
            }
            Err(e) => warn!("user {} detach: {e}", self.reader.name()),
        }
        if let Some(slot) = writer_slot {
            if let Ok(guard) = self.registry.global_write() {
                let producer = guard.producer_mut(slot);
                if producer.in_use != 0 {
                    producer.driver_index = NO_INDEX;
                }
            }
        }
        if release_topology {
            self.topology.unlink();
        }

        self.reader.shutdown();
        debug!("user detached");
    }
}

impl Drop for User {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Attach a user: resolve the target driver, copy its topology, attach
/// the reader, register the attachment.
///
/// `already_attached` lists driver table indices this process already
/// has users on; discovery by sensor type skips them.
pub(crate) fn create_user(
    registry: &Arc<Registry>,
    attrs: UserAttrs,
    schedule: ReaderSchedule,
    mut peek: PeekFn,
    hooks: UserHooks,
    already_attached: &[usize],
) -> FabricResult<User> {
    attrs.validate()?;

    // Resolve the driver record and producer name. Lock order: global
    // before drivers.
    let (record_index, producer_name, attr) = {
        let global = registry.global_read()?;
        let drivers = registry.drivers_read()?;
        match &attrs.name {
            Some(name) => {
                let prefix = tacta::naming::truncate_prefix(name);
                let slot = global
                    .find_producer(prefix)
                    .ok_or_else(|| FabricError::NotFound {
                        name: prefix.to_string(),
                    })?;
                let producer = global.producer(slot);
                if producer.driver_index == NO_INDEX {
                    return Err(FabricError::NotFound {
                        name: format!("{prefix} has no driver"),
                    });
                }
                let index = producer.driver_index as usize;
                let record = drivers.driver(index);
                if record.in_use == 0 || record.active.load(Ordering::Acquire) == 0 {
                    return Err(FabricError::NotFound {
                        name: prefix.to_string(),
                    });
                }
                (index, prefix.to_string(), record.attr)
            }
            None => {
                let sensor_type = attrs.sensor_type.expect("validated above");
                let found = drivers
                    .drivers()
                    .iter()
                    .enumerate()
                    .find(|(index, record)| {
                        record.in_use != 0
                            && record.active.load(Ordering::Acquire) != 0
                            && record.serves_type(sensor_type)
                            && !already_attached.contains(index)
                            && record.writer_index != NO_INDEX
                    })
                    .ok_or_else(|| FabricError::NotFound {
                        name: format!("driver serving sensor type {sensor_type}"),
                    })?;
                let (index, record) = found;
                let producer = global.producer(record.writer_index as usize);
                (index, producer.name_str().to_string(), record.attr)
            }
        }
    };

    // Copy the topology into the local view.
    let topology = attach_topology(&producer_name, &attr)?;
    let blueprint = read_blueprint(&topology, &attr);
    let view = Arc::new(TopologyView::from_blueprint(&blueprint));

    // Attach the reader, feeding the peek callback through the view.
    let reader_view = Arc::clone(&view);
    let read_fn: ReadFn = Box::new(move |buffer, cycle| peek(buffer, cycle, &reader_view));
    let reader = crate::service::attach_reader(
        registry,
        ReaderAttrs {
            name: producer_name,
            schedule,
        },
        read_fn,
        LifecycleHooks::none(),
    )?;

    // Register the attachment.
    {
        let guard = registry.drivers_read()?;
        let record = guard.driver(record_index);
        if record.in_use == 0 {
            // The driver vanished between resolution and registration.
            drop(guard);
            return Err(FabricError::NotFound {
                name: "driver record".to_string(),
            });
        }
        record.users_attached.fetch_add(1, Ordering::AcqRel);
    }

    Ok(User {
        reader,
        topology,
        view,
        record_index,
        registry: Arc::clone(registry),
        attr,
        hooks,
        torn_down: false,
    })
}
