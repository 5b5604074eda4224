//! Registration lifecycle: slot reuse, revival, collision and unwind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tacta_shared_memory::{
    FabricError, LifecycleHooks, Provenance, ReaderAttrs, ReaderSchedule, Session, WriterAttrs,
    WriterSchedule,
};

fn open(tag: &str) -> Session {
    let name = format!("lc{}{}", tag, std::process::id());
    Session::open(&name, Default::default()).expect("registry open")
}

fn writer_attrs(name: &str, buffer_size: usize, buffer_count: usize, period_ms: u64) -> WriterAttrs {
    WriterAttrs {
        name: name.to_string(),
        buffer_size,
        buffer_count,
        schedule: if period_ms == 0 {
            WriterSchedule::Sporadic
        } else {
            WriterSchedule::Periodic(Duration::from_millis(period_ms))
        },
    }
}

fn fill_writer() -> tacta_shared_memory::WriteFn {
    Box::new(|buffer, _cycle| {
        buffer.fill(1);
        true
    })
}

fn noop_reader() -> tacta_shared_memory::ReadFn {
    Box::new(|_buffer, _cycle| true)
}

#[test]
fn removed_writer_leaves_slot_reusable() {
    let session = open("reuse");

    let (writer, provenance) = session
        .add_writer(writer_attrs("palm", 64, 1, 10), fill_writer(), LifecycleHooks::none())
        .unwrap();
    assert_eq!(provenance, Provenance::Fresh);
    session.remove_writer(writer).unwrap();

    // Same name, different attributes: no identity may leak.
    let (writer, provenance) = session
        .add_writer(writer_attrs("palm", 128, 2, 20), fill_writer(), LifecycleHooks::none())
        .unwrap();
    assert_eq!(provenance, Provenance::Fresh);
    session.remove_writer(writer).unwrap();
}

#[test]
fn revival_requires_identical_attributes() {
    let session = open("revive");

    let (writer, _) = session
        .add_writer(writer_attrs("wrist", 64, 2, 10), fill_writer(), LifecycleHooks::none())
        .unwrap();

    // A reader keeps the identity alive across the writer's removal.
    let reader = session
        .attach_reader(
            ReaderAttrs {
                name: "wrist".to_string(),
                schedule: ReaderSchedule::Soft,
            },
            noop_reader(),
            LifecycleHooks::none(),
        )
        .unwrap();
    session.remove_writer(writer).unwrap();

    // Identical attributes revive the slot with a working handle.
    let (writer, provenance) = session
        .add_writer(writer_attrs("wrist", 64, 2, 10), fill_writer(), LifecycleHooks::none())
        .unwrap();
    assert_eq!(provenance, Provenance::Revived);
    assert!(session.with_writer(writer, |w| w.is_active()).unwrap());
    session.remove_writer(writer).unwrap();

    // Any differing attribute is a fatal collision, no handle.
    let err = session
        .add_writer(writer_attrs("wrist", 128, 2, 10), fill_writer(), LifecycleHooks::none())
        .unwrap_err();
    assert!(matches!(err, FabricError::AlreadyExists { .. }));

    session.detach_reader(reader).unwrap();
}

#[test]
fn active_collision_with_matching_attrs_aliases() {
    let session = open("alias");

    let (owner, _) = session
        .add_writer(writer_attrs("thumb", 32, 1, 10), fill_writer(), LifecycleHooks::none())
        .unwrap();

    let (alias, provenance) = session
        .add_writer(writer_attrs("thumb", 32, 1, 10), fill_writer(), LifecycleHooks::none())
        .unwrap();
    assert_eq!(provenance, Provenance::Revived);
    assert!(session.with_writer(alias, |w| w.is_alias()).unwrap());
    assert!(session.with_writer(alias, |w| w.is_active()).unwrap());

    // Incompatible attributes stay fatal.
    let err = session
        .add_writer(writer_attrs("thumb", 32, 1, 20), fill_writer(), LifecycleHooks::none())
        .unwrap_err();
    assert!(matches!(err, FabricError::AlreadyExists { .. }));

    // Removing the alias must not deactivate the owner.
    session.remove_writer(alias).unwrap();
    assert!(session.with_writer(owner, |w| w.is_active()).unwrap());
    session.remove_writer(owner).unwrap();
}

#[test]
fn attach_to_missing_producer_is_not_found() {
    let session = open("missing");
    let err = session
        .attach_reader(
            ReaderAttrs {
                name: "nonexistent".to_string(),
                schedule: ReaderSchedule::Soft,
            },
            noop_reader(),
            LifecycleHooks::none(),
        )
        .unwrap_err();
    assert!(matches!(err, FabricError::NotFound { .. }));
}

#[test]
fn clean_hook_runs_when_registration_fails() {
    let session = open("clean");
    let cleaned = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cleaned);

    let result = session.attach_reader(
        ReaderAttrs {
            name: "nowhere".to_string(),
            schedule: ReaderSchedule::Soft,
        },
        noop_reader(),
        LifecycleHooks {
            init: None,
            clean: Some(Box::new(move || flag.store(true, Ordering::Release))),
        },
    );
    assert!(result.is_err());
    assert!(cleaned.load(Ordering::Acquire), "clean hook must run on unwind");
}

#[test]
fn teardown_frees_backing_files() {
    let session = open("files");
    let (writer, _) = session
        .add_writer(writer_attrs("index", 64, 1, 10), fill_writer(), LifecycleHooks::none())
        .unwrap();
    session.remove_writer(writer).unwrap();

    // With no readers attached the identity and its files are gone.
    let err = session
        .attach_reader(
            ReaderAttrs {
                name: "index".to_string(),
                schedule: ReaderSchedule::Soft,
            },
            noop_reader(),
            LifecycleHooks::none(),
        )
        .unwrap_err();
    assert!(matches!(err, FabricError::NotFound { .. }));
}

#[test]
fn writer_statistics_accumulate() {
    let session = open("stats");
    let (writer, _) = session
        .add_writer(writer_attrs("ring", 64, 1, 5), fill_writer(), LifecycleHooks::none())
        .unwrap();

    std::thread::sleep(Duration::from_millis(80));
    let stats = session.with_writer(writer, |w| w.statistics()).unwrap();
    assert!(stats.count >= 3, "expected several cycles, got {}", stats.count);
    assert!(stats.best_ns <= stats.worst_ns);
    assert!(stats.accumulated_ns >= stats.worst_ns);

    session.remove_writer(writer).unwrap();
}

#[test]
fn pause_and_resume_are_idempotent() {
    let session = open("pause");
    let (writer, _) = session
        .add_writer(writer_attrs("little", 64, 2, 5), fill_writer(), LifecycleHooks::none())
        .unwrap();

    session.pause();
    session.pause();
    // Wait until the task acknowledges.
    let deadline = std::time::Instant::now() + Duration::from_millis(500);
    while !session.with_writer(writer, |w| w.is_paused()).unwrap() {
        assert!(std::time::Instant::now() < deadline, "pause not acknowledged");
        std::thread::sleep(Duration::from_millis(5));
    }

    session.resume();
    session.resume();
    let deadline = std::time::Instant::now() + Duration::from_millis(500);
    while session.with_writer(writer, |w| w.is_paused()).unwrap() {
        assert!(std::time::Instant::now() < deadline, "resume not acknowledged");
        std::thread::sleep(Duration::from_millis(5));
    }

    session.remove_writer(writer).unwrap();
}
