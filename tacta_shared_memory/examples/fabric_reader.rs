//! Minimal consumer: attaches to the `fabric_writer` demo and prints the
//! counter as it advances.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tacta_shared_memory::{
    init_tracing, LifecycleHooks, ReaderAttrs, ReaderSchedule, Session,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let session = Session::open("demo", Default::default())?;
    let latest = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&latest);

    let reader = session.attach_reader(
        ReaderAttrs {
            name: "demo_counter".to_string(),
            schedule: ReaderSchedule::Periodic(Duration::from_millis(10)),
        },
        Box::new(move |buffer, _cycle| {
            let value = u64::from_ne_bytes(buffer[..8].try_into().expect("8 bytes"));
            sink.store(value, Ordering::Release);
            true
        }),
        LifecycleHooks::none(),
    )?;
    println!("reader attached, sampling for 3 s...");

    for _ in 0..6 {
        std::thread::sleep(Duration::from_millis(500));
        println!("counter = {}", latest.load(Ordering::Acquire));
    }

    let stats = session.with_reader(reader, |r| r.statistics())?;
    println!("read {} cycles, mean {} ns", stats.count, stats.mean_ns());
    session.detach_reader(reader)?;
    Ok(())
}
