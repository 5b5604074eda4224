//! End-to-end data flow across the writer and reader engines.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tacta_shared_memory::{
    LifecycleHooks, ReaderAttrs, ReaderSchedule, Session, WriterAttrs, WriterSchedule,
};

fn open(tag: &str) -> Session {
    let name = format!("e2e{}{}", tag, std::process::id());
    Session::open(&name, Default::default()).expect("registry open")
}

#[test]
fn periodic_writer_periodic_reader_envelope() {
    let session = open("env");

    let (writer, _) = session
        .add_writer(
            WriterAttrs {
                name: "t1".to_string(),
                buffer_size: 4,
                buffer_count: 2,
                schedule: WriterSchedule::Periodic(Duration::from_millis(100)),
            },
            Box::new(|buffer, _cycle| {
                buffer.fill(7);
                true
            }),
            LifecycleHooks::none(),
        )
        .unwrap();

    let reads = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&reads);
    let reader = session
        .attach_reader(
            ReaderAttrs {
                name: "t1".to_string(),
                schedule: ReaderSchedule::Periodic(Duration::from_millis(100)),
            },
            Box::new(move |buffer, _cycle| {
                counter.fetch_add(1, Ordering::AcqRel);
                buffer[0] == 7
            }),
            LifecycleHooks::none(),
        )
        .unwrap();

    std::thread::sleep(Duration::from_millis(550));

    let count = reads.load(Ordering::Acquire);
    assert!(
        (3..=7).contains(&count),
        "expected roughly one read per period, got {count}"
    );
    let producer = session.with_reader(reader, |r| r.producer()).unwrap();
    assert!(!producer.bad, "no write may have reported failure");

    session.detach_reader(reader).unwrap();
    session.remove_writer(writer).unwrap();
}

#[test]
fn visibility_is_monotonic_per_producer() {
    let session = open("mono");

    let (writer, _) = session
        .add_writer(
            WriterAttrs {
                name: "mono".to_string(),
                buffer_size: 8,
                buffer_count: 2,
                schedule: WriterSchedule::Periodic(Duration::from_millis(5)),
            },
            Box::new(|buffer, _cycle| {
                buffer.fill(1);
                true
            }),
            LifecycleHooks::none(),
        )
        .unwrap();

    let seen: Arc<Mutex<Vec<(usize, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let reader = session
        .attach_reader(
            ReaderAttrs {
                name: "mono".to_string(),
                schedule: ReaderSchedule::Soft,
            },
            Box::new(move |_buffer, cycle| {
                sink.lock()
                    .unwrap()
                    .push((cycle.buffer_index, cycle.write_stamp_ns));
                true
            }),
            LifecycleHooks::none(),
        )
        .unwrap();

    std::thread::sleep(Duration::from_millis(200));
    session.detach_reader(reader).unwrap();
    session.remove_writer(writer).unwrap();

    let observed = seen.lock().unwrap();
    assert!(observed.len() >= 2, "reader must have delivered data");
    for pair in observed.windows(2) {
        let (prev_idx, prev_stamp) = pair[0];
        let (next_idx, next_stamp) = pair[1];
        if next_idx != prev_idx {
            assert!(
                next_stamp >= prev_stamp,
                "advanced to buffer {next_idx} with older stamp ({next_stamp} < {prev_stamp})"
            );
        }
    }
}

#[test]
fn paused_writer_freezes_stamps_but_readers_continue() {
    let session = open("pause");

    let (writer, _) = session
        .add_writer(
            WriterAttrs {
                name: "pz".to_string(),
                buffer_size: 8,
                buffer_count: 2,
                schedule: WriterSchedule::Periodic(Duration::from_millis(10)),
            },
            Box::new(|buffer, _cycle| {
                buffer.fill(3);
                true
            }),
            LifecycleHooks::none(),
        )
        .unwrap();

    let reads = Arc::new(AtomicU64::new(0));
    let last_stamp = Arc::new(AtomicU64::new(0));
    let (counter, stamp_sink) = (Arc::clone(&reads), Arc::clone(&last_stamp));
    let reader = session
        .attach_reader(
            ReaderAttrs {
                name: "pz".to_string(),
                schedule: ReaderSchedule::Soft,
            },
            Box::new(move |_buffer, cycle| {
                counter.fetch_add(1, Ordering::AcqRel);
                stamp_sink.store(cycle.write_stamp_ns, Ordering::Release);
                true
            }),
            LifecycleHooks::none(),
        )
        .unwrap();

    std::thread::sleep(Duration::from_millis(100));

    session.with_writer(writer, |w| w.pause()).unwrap();
    let deadline = Instant::now() + Duration::from_millis(500);
    while !session.with_writer(writer, |w| w.is_paused()).unwrap() {
        assert!(Instant::now() < deadline, "pause not acknowledged");
        std::thread::sleep(Duration::from_millis(5));
    }
    // Let any in-flight cycle settle before sampling.
    std::thread::sleep(Duration::from_millis(50));

    let stamp_at_pause = last_stamp.load(Ordering::Acquire);
    let reads_at_pause = reads.load(Ordering::Acquire);

    std::thread::sleep(Duration::from_millis(150));

    assert_eq!(
        last_stamp.load(Ordering::Acquire),
        stamp_at_pause,
        "stamps must not advance while paused"
    );
    assert!(
        reads.load(Ordering::Acquire) > reads_at_pause,
        "readers must keep receiving the last good buffer"
    );
    let producer = session.with_reader(reader, |r| r.producer()).unwrap();
    assert!(!producer.bad);

    session.detach_reader(reader).unwrap();
    session.remove_writer(writer).unwrap();
}

#[test]
fn sporadic_requests_coalesce_into_one_cycle() {
    let session = open("coal");

    let writes = Arc::new(AtomicU64::new(0));
    let write_counter = Arc::clone(&writes);
    let (writer, _) = session
        .add_writer(
            WriterAttrs {
                name: "sp".to_string(),
                buffer_size: 8,
                buffer_count: 1,
                schedule: WriterSchedule::Sporadic,
            },
            Box::new(move |buffer, _cycle| {
                // A deliberately slow write so the request burst lands
                // while the cycle is in flight.
                std::thread::sleep(Duration::from_millis(50));
                write_counter.fetch_add(1, Ordering::AcqRel);
                buffer.fill(9);
                true
            }),
            LifecycleHooks::none(),
        )
        .unwrap();

    // Burst of five requests.
    for _ in 0..5 {
        session
            .with_writer(writer, |w| w.request_nonblocking())
            .unwrap()
            .unwrap();
    }
    // All five must unblock.
    for _ in 0..5 {
        session
            .with_writer(writer, |w| w.await_response(Duration::from_secs(2)))
            .unwrap()
            .unwrap();
    }

    let total = writes.load(Ordering::Acquire);
    assert!(
        (1..=2).contains(&total),
        "a burst must coalesce into one cycle (maybe two), got {total}"
    );

    session.remove_writer(writer).unwrap();
}

#[test]
fn periodic_reader_pulls_sporadic_writer() {
    let session = open("pull");

    let writes = Arc::new(AtomicU64::new(0));
    let write_counter = Arc::clone(&writes);
    let (writer, _) = session
        .add_writer(
            WriterAttrs {
                name: "pull".to_string(),
                buffer_size: 8,
                buffer_count: 1,
                schedule: WriterSchedule::Sporadic,
            },
            Box::new(move |buffer, _cycle| {
                write_counter.fetch_add(1, Ordering::AcqRel);
                buffer.fill(4);
                true
            }),
            LifecycleHooks::none(),
        )
        .unwrap();

    let reads = Arc::new(AtomicU64::new(0));
    let read_counter = Arc::clone(&reads);
    let reader = session
        .attach_reader(
            ReaderAttrs {
                name: "pull".to_string(),
                schedule: ReaderSchedule::Periodic(Duration::from_millis(20)),
            },
            Box::new(move |buffer, _cycle| {
                read_counter.fetch_add(1, Ordering::AcqRel);
                buffer[0] == 4
            }),
            LifecycleHooks::none(),
        )
        .unwrap();

    std::thread::sleep(Duration::from_millis(250));

    assert!(
        writes.load(Ordering::Acquire) >= 3,
        "each reader period must pull a write"
    );
    assert!(reads.load(Ordering::Acquire) >= 3);

    session.detach_reader(reader).unwrap();
    session.remove_writer(writer).unwrap();
}

#[test]
fn copy_last_buffer_carries_state_across_swaps() {
    let session = open("seed");

    let (writer, _) = session
        .add_writer(
            WriterAttrs {
                name: "seed".to_string(),
                buffer_size: 8,
                buffer_count: 2,
                schedule: WriterSchedule::Periodic(Duration::from_millis(10)),
            },
            Box::new(|buffer, cycle| {
                // Producers that update part of their data each cycle
                // seed from the previous buffer first.
                if !cycle.copy_last_buffer(buffer) {
                    buffer.fill(0);
                }
                buffer[0] = buffer[0].wrapping_add(1);
                true
            }),
            LifecycleHooks::none(),
        )
        .unwrap();

    let highest = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&highest);
    let reader = session
        .attach_reader(
            ReaderAttrs {
                name: "seed".to_string(),
                schedule: ReaderSchedule::Soft,
            },
            Box::new(move |buffer, _cycle| {
                sink.fetch_max(buffer[0] as u64, Ordering::AcqRel);
                true
            }),
            LifecycleHooks::none(),
        )
        .unwrap();

    std::thread::sleep(Duration::from_millis(200));

    assert!(
        highest.load(Ordering::Acquire) >= 3,
        "the counter must accumulate across buffer swaps"
    );

    session.detach_reader(reader).unwrap();
    session.remove_writer(writer).unwrap();
}
