//! Per-process session: registry attachment, object bookkeeping and
//! whole-process orchestration.
//!
//! A session is an explicitly owned object, never a process singleton.
//! It tracks every writer, reader, driver and user this process created
//! in generational arenas, so the process can enumerate them, pause and
//! resume them wholesale, and auto-clean everything on unload. Handles
//! are typed and generation-checked: a handle used after its object was
//! removed is a detectable error.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tacta::TuningConfig;
use tracing::{debug, info};

use crate::driver::{create_driver, DetailsFn, Driver, DriverAttrs};
use crate::error::{FabricError, FabricResult};
use crate::hooks::{LifecycleHooks, ReadFn, UserHooks, WriteFn};
use crate::reader::{Reader, ReaderAttrs, ReaderSchedule};
use crate::registry::Registry;
use crate::service::{attach_reader, create_writer, stale_handle, SlotId, Slots};
use crate::user::{create_user, PeekFn, User, UserAttrs};
use crate::writer::{Provenance, Writer, WriterAttrs};

/// Handle to a session-owned writer.
pub type WriterId = SlotId<Writer>;
/// Handle to a session-owned reader.
pub type ReaderId = SlotId<Reader>;
/// Handle to a session-owned driver.
pub type DriverId = SlotId<Driver>;
/// Handle to a session-owned user.
pub type UserId = SlotId<User>;

/// Template for orchestrated user attachment: `load` applies it to every
/// active driver this process is not yet attached to.
pub struct UserTemplate {
    /// Reader discipline for every attached user.
    pub schedule: ReaderSchedule,
    /// Builds the peek callback for a driver, given its producer name.
    pub make_peek: Box<dyn FnMut(&str) -> PeekFn + Send>,
}

/// A process's connection to the fabric.
pub struct Session {
    registry: Arc<Registry>,
    writers: Mutex<Slots<Writer>>,
    readers: Mutex<Slots<Reader>>,
    drivers: Mutex<Slots<Driver>>,
    users: Mutex<Slots<User>>,
}

impl Session {
    /// Open (create or attach) the named kernel registry.
    pub fn open(registry_name: &str, tuning: TuningConfig) -> FabricResult<Self> {
        let registry = Arc::new(Registry::create_or_attach(registry_name, tuning)?);
        Ok(Self {
            registry,
            writers: Mutex::new(Slots::new()),
            readers: Mutex::new(Slots::new()),
            drivers: Mutex::new(Slots::new()),
            users: Mutex::new(Slots::new()),
        })
    }

    /// The shared registry attachment.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    // ── Writers ──

    /// Create (or revive) a writer and register it in the bookkeeping.
    pub fn add_writer(
        &self,
        attrs: WriterAttrs,
        write_fn: WriteFn,
        hooks: LifecycleHooks,
    ) -> FabricResult<(WriterId, Provenance)> {
        let writer = create_writer(&self.registry, attrs, write_fn, hooks)?;
        let provenance = writer.provenance();
        let id = self.writers.lock().insert(writer);
        Ok((id, provenance))
    }

    /// Remove a writer: teardown plus bookkeeping unregistration.
    pub fn remove_writer(&self, id: WriterId) -> FabricResult<()> {
        let mut writer = self
            .writers
            .lock()
            .remove(id)
            .ok_or_else(|| stale_handle("writer"))?;
        writer.shutdown();
        Ok(())
    }

    /// Run a closure against a live writer.
    pub fn with_writer<R>(&self, id: WriterId, f: impl FnOnce(&Writer) -> R) -> FabricResult<R> {
        let guard = self.writers.lock();
        let writer = guard.get(id).ok_or_else(|| stale_handle("writer"))?;
        Ok(f(writer))
    }

    // ── Readers ──

    /// Attach a reader and register it in the bookkeeping.
    pub fn attach_reader(
        &self,
        attrs: ReaderAttrs,
        read_fn: ReadFn,
        hooks: LifecycleHooks,
    ) -> FabricResult<ReaderId> {
        let reader = attach_reader(&self.registry, attrs, read_fn, hooks)?;
        Ok(self.readers.lock().insert(reader))
    }

    /// Detach a reader: teardown plus bookkeeping unregistration.
    pub fn detach_reader(&self, id: ReaderId) -> FabricResult<()> {
        let mut reader = self
            .readers
            .lock()
            .remove(id)
            .ok_or_else(|| stale_handle("reader"))?;
        reader.shutdown();
        Ok(())
    }

    /// Run a closure against a live reader.
    pub fn with_reader<R>(&self, id: ReaderId, f: impl FnOnce(&Reader) -> R) -> FabricResult<R> {
        let guard = self.readers.lock();
        let reader = guard.get(id).ok_or_else(|| stale_handle("reader"))?;
        Ok(f(reader))
    }

    // ── Drivers ──

    /// Register (or revive) a driver and its writer.
    pub fn add_driver(
        &self,
        attrs: DriverAttrs,
        details: DetailsFn,
        acquire: WriteFn,
        hooks: LifecycleHooks,
    ) -> FabricResult<(DriverId, Provenance)> {
        let driver = create_driver(&self.registry, attrs, details, acquire, hooks)?;
        let provenance = driver.provenance();
        let id = self.drivers.lock().insert(driver);
        Ok((id, provenance))
    }

    /// Remove a driver: teardown plus bookkeeping unregistration.
    pub fn remove_driver(&self, id: DriverId) -> FabricResult<()> {
        let mut driver = self
            .drivers
            .lock()
            .remove(id)
            .ok_or_else(|| stale_handle("driver"))?;
        driver.shutdown();
        Ok(())
    }

    /// Run a closure against a live driver.
    pub fn with_driver<R>(&self, id: DriverId, f: impl FnOnce(&Driver) -> R) -> FabricResult<R> {
        let guard = self.drivers.lock();
        let driver = guard.get(id).ok_or_else(|| stale_handle("driver"))?;
        Ok(f(driver))
    }

    // ── Users ──

    /// Attach a user by name or by sensor-type discovery.
    pub fn attach_user(
        &self,
        attrs: UserAttrs,
        schedule: ReaderSchedule,
        peek: PeekFn,
        hooks: UserHooks,
    ) -> FabricResult<UserId> {
        let exclusions = user_record_indices(&self.users.lock());
        let user = create_user(&self.registry, attrs, schedule, peek, hooks, &exclusions)?;
        Ok(self.users.lock().insert(user))
    }

    /// Detach a user: ordered hooks, teardown, unregistration.
    pub fn detach_user(&self, id: UserId) -> FabricResult<()> {
        let mut user = self
            .users
            .lock()
            .remove(id)
            .ok_or_else(|| stale_handle("user"))?;
        user.shutdown();
        Ok(())
    }

    /// Run a closure against a live user.
    pub fn with_user<R>(&self, id: UserId, f: impl FnOnce(&User) -> R) -> FabricResult<R> {
        let guard = self.users.lock();
        let user = guard.get(id).ok_or_else(|| stale_handle("user"))?;
        Ok(f(user))
    }

    // ── Orchestration ──

    /// Attach a user to every active driver this process is not yet
    /// attached to. Success of at least one attachment is overall
    /// success; with no candidates at all, `Ok(0)`.
    pub fn load(&self, template: &mut UserTemplate) -> FabricResult<usize> {
        let candidates = self.unattached_drivers()?;
        if candidates.is_empty() {
            return Ok(0);
        }

        let mut attached = 0;
        let mut last_error: Option<FabricError> = None;
        for name in candidates {
            let peek = (template.make_peek)(&name);
            let attrs = UserAttrs {
                name: Some(name),
                sensor_type: None,
            };
            match self.attach_user(attrs, template.schedule, peek, UserHooks::none()) {
                Ok(_) => attached += 1,
                Err(e) => {
                    debug!("load: attach failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        if attached == 0 {
            Err(last_error.expect("candidates were nonempty"))
        } else {
            info!("load attached {attached} user(s)");
            Ok(attached)
        }
    }

    /// Detach users whose driver went inactive or changed its declared
    /// topology, then re-run [`Session::load`].
    pub fn update(&self, template: &mut UserTemplate) -> FabricResult<usize> {
        let stale = self.stale_users()?;
        for mut user in stale {
            user.shutdown();
        }
        self.load(template)
    }

    /// Pause every writer, reader, driver and user of this process.
    /// Idempotent; no registry interaction.
    pub fn pause(&self) {
        for writer in self.writers.lock().iter() {
            writer.pause();
        }
        for reader in self.readers.lock().iter() {
            reader.pause();
        }
        for driver in self.drivers.lock().iter() {
            driver.pause();
        }
        for user in self.users.lock().iter() {
            user.pause();
        }
    }

    /// Resume every paused task of this process. Idempotent.
    pub fn resume(&self) {
        for writer in self.writers.lock().iter() {
            writer.resume();
        }
        for reader in self.readers.lock().iter() {
            reader.resume();
        }
        for driver in self.drivers.lock().iter() {
            driver.resume();
        }
        for user in self.users.lock().iter() {
            user.resume();
        }
    }

    /// Refresh every sporadic user and reader: fan out the nonblocking
    /// requests first, then await all responses, overlapping the
    /// latencies instead of serializing them.
    pub fn request(&self, timeout: Duration) -> FabricResult<()> {
        {
            let users = self.users.lock();
            for user in users.iter() {
                if user.reader().attrs().schedule.is_sporadic() {
                    user.request_nonblocking()?;
                }
            }
            let readers = self.readers.lock();
            for reader in readers.iter() {
                if reader.attrs().schedule.is_sporadic() {
                    reader.request_nonblocking()?;
                }
            }
        }
        let users = self.users.lock();
        for user in users.iter() {
            if user.reader().attrs().schedule.is_sporadic() {
                user.await_response(timeout)?;
            }
        }
        let readers = self.readers.lock();
        for reader in readers.iter() {
            if reader.attrs().schedule.is_sporadic() {
                reader.await_response(timeout)?;
            }
        }
        Ok(())
    }

    /// Tear down every object this process owns: users, then drivers,
    /// then readers, then writers.
    pub fn unload(&self) {
        for mut user in self.users.lock().drain() {
            user.shutdown();
        }
        for mut driver in self.drivers.lock().drain() {
            driver.shutdown();
        }
        for mut reader in self.readers.lock().drain() {
            reader.shutdown();
        }
        for mut writer in self.writers.lock().drain() {
            writer.shutdown();
        }
    }

    /// Names of active drivers this process has no user attached to.
    fn unattached_drivers(&self) -> FabricResult<Vec<String>> {
        use std::sync::atomic::Ordering;
        use tacta::layout::NO_INDEX;

        let attached = user_record_indices(&self.users.lock());
        let global = self.registry.global_read()?;
        let drivers = self.registry.drivers_read()?;

        let mut names = Vec::new();
        for (index, record) in drivers.drivers().iter().enumerate() {
            if record.in_use == 0
                || record.active.load(Ordering::Acquire) == 0
                || record.writer_index == NO_INDEX
                || attached.contains(&index)
            {
                continue;
            }
            let producer = global.producer(record.writer_index as usize);
            if producer.in_use != 0 {
                names.push(producer.name_str().to_string());
            }
        }
        Ok(names)
    }

    /// Pull out every user whose driver is now inactive or whose declared
    /// topology changed.
    fn stale_users(&self) -> FabricResult<Vec<User>> {
        use std::sync::atomic::Ordering;

        let mut users = self.users.lock();
        let drivers = self.registry.drivers_read()?;

        let stale_ids: Vec<UserId> = users
            .iter_with_ids()
            .filter(|(_, user)| {
                let record = drivers.driver(user.record_index());
                record.in_use == 0
                    || record.active.load(Ordering::Acquire) == 0
                    || record.attr != *user.attr()
            })
            .map(|(id, _)| id)
            .collect();
        drop(drivers);

        Ok(stale_ids
            .into_iter()
            .filter_map(|id| users.remove(id))
            .collect())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.unload();
    }
}

/// Driver table indices the given user arena is attached to.
pub(crate) fn user_record_indices(users: &Slots<User>) -> Vec<usize> {
    users.iter().map(|user| user.record_index()).collect()
}
