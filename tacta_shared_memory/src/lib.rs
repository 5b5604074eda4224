//! # TACTA Shared Memory Fabric
//!
//! A real-time, shared-memory publish/subscribe fabric for tactile
//! sensor arrays. Producers ("writers"/"drivers") expose buffers of
//! sensor data under a name; consumers ("readers"/"users") attach to
//! that name and receive new data with bounded latency, honoring
//! periodic, sporadic or soft delivery contracts, across single- or
//! multi-buffered producers, even across process restarts.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────────┐   ┌──────────────┐
//! │ Writer task  │   │    Kernel Registry    │   │ Reader task  │
//! │ (per producer├──►│ producers[] drivers[] │◄──┤ (per consumer│
//! │  swap & fill)│   │ global / drivers lock │   │  select&read)│
//! └──────┬───────┘   └───────────────────────┘   └──────▲───────┘
//!        │             ┌──────────────────┐             │
//!        └────────────►│ MEM RW0..RWn     ├─────────────┘
//!                      │ REQ RES DS blocks│
//!                      └──────────────────┘
//! ```
//!
//! The kernel registry is one shared block attached by every process; it
//! records which producers exist and carries the two coarse locks. All
//! hot-path data flows through per-producer blocks (buffers, per-buffer
//! locks, request/response semaphores, topology), never through the
//! registry locks.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tacta_shared_memory::{
//!     LifecycleHooks, ReaderAttrs, ReaderSchedule, Session, WriterAttrs, WriterSchedule,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::open("kernel", Default::default())?;
//!
//! // Producer: 2 buffers of 64 bytes, written every millisecond.
//! let (writer, _provenance) = session.add_writer(
//!     WriterAttrs {
//!         name: "palm".into(),
//!         buffer_size: 64,
//!         buffer_count: 2,
//!         schedule: WriterSchedule::Periodic(Duration::from_millis(1)),
//!     },
//!     Box::new(|buffer, _cycle| {
//!         buffer.fill(0x42);
//!         true
//!     }),
//!     LifecycleHooks::none(),
//! )?;
//!
//! // Consumer: same period.
//! let reader = session.attach_reader(
//!     ReaderAttrs {
//!         name: "palm".into(),
//!         schedule: ReaderSchedule::Periodic(Duration::from_millis(1)),
//!     },
//!     Box::new(|buffer, _cycle| buffer[0] == 0x42),
//!     LifecycleHooks::none(),
//! )?;
//!
//! std::thread::sleep(Duration::from_millis(10));
//! session.detach_reader(reader)?;
//! session.remove_writer(writer)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency model
//!
//! One OS task per writer and per reader; tasks communicate only through
//! the registry and per-buffer locks. Cancellation is cooperative
//! (`must_stop` observed at every suspension point) and teardown always
//! signals-then-waits, so shared locks are never freed under a live
//! task. Statistics locks are best-effort and never block shutdown.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod buffers;
pub mod driver;
pub mod error;
pub mod hooks;
pub mod reader;
pub mod registry;
pub mod service;
pub mod session;
pub mod snapshot;
pub mod stats;
pub mod task;
pub mod user;
pub mod writer;

pub use driver::{Driver, DriverAttrs, DetailsFn, ModuleSpec, PatchSpec, SensorSpec, TopologyBlueprint};
pub use error::{FabricError, FabricResult};
pub use hooks::{CleanFn, InitFn, LifecycleHooks, ReadCycle, ReadFn, UserHooks, WriteCycle, WriteFn};
pub use reader::{ProducerView, Reader, ReaderAttrs, ReaderSchedule};
pub use registry::Registry;
pub use service::{SlotId, Slots};
pub use session::{DriverId, ReaderId, Session, UserId, UserTemplate, WriterId};
pub use snapshot::{DriverSnapshot, ProducerSnapshot, RegistrySnapshot};
pub use stats::TaskStatistics;
pub use user::{PeekFn, Sensor, TopologyView, TypeChain, User, UserAttrs};
pub use writer::{Provenance, Writer, WriterAttrs, WriterSchedule};

// Re-export the shared-layout crate under its package alias for
// consumers that need the raw record types.
pub use tacta;

/// Initialize tracing for RT-safe logging.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
