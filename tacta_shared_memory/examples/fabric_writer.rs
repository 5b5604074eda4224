//! Minimal producer: publishes a 16-byte counter buffer every 10 ms.
//!
//! Run together with `fabric_reader`:
//! ```bash
//! cargo run --example fabric_writer &
//! cargo run --example fabric_reader
//! ```

use std::time::Duration;

use tacta_shared_memory::{
    init_tracing, LifecycleHooks, Session, WriterAttrs, WriterSchedule,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let session = Session::open("demo", Default::default())?;
    let mut counter: u64 = 0;

    let (writer, provenance) = session.add_writer(
        WriterAttrs {
            name: "demo_counter".to_string(),
            buffer_size: 16,
            buffer_count: 2,
            schedule: WriterSchedule::Periodic(Duration::from_millis(10)),
        },
        Box::new(move |buffer, _cycle| {
            counter += 1;
            buffer[..8].copy_from_slice(&counter.to_ne_bytes());
            true
        }),
        LifecycleHooks::none(),
    )?;
    println!("writer up ({provenance:?}), publishing for 5 s...");

    std::thread::sleep(Duration::from_secs(5));

    let stats = session.with_writer(writer, |w| w.statistics())?;
    println!(
        "wrote {} cycles, best {} ns, worst {} ns, {} swap skips",
        stats.count, stats.best_ns, stats.worst_ns, stats.swap_skips
    );
    session.remove_writer(writer)?;
    Ok(())
}
