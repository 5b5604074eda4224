//! Driver and user layers: topology publication, discovery, revival.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tacta::layout::ProducerAttr;
use tacta_shared_memory::{
    DetailsFn, DriverAttrs, FabricError, LifecycleHooks, Provenance, ReaderSchedule, Session,
    UserAttrs, UserHooks, WriterSchedule,
};

fn open(tag: &str) -> (Session, String) {
    let name = format!("du{}{}", tag, std::process::id());
    let session = Session::open(&name, Default::default()).expect("registry open");
    (session, name)
}

fn small_attr() -> ProducerAttr {
    ProducerAttr {
        patch_count: 1,
        module_count: 1,
        sensor_count: 3,
    }
}

fn driver_attrs(name: &str) -> DriverAttrs {
    DriverAttrs {
        name: name.to_string(),
        attr: small_attr(),
        response_size: 2,
        buffer_count: 2,
        schedule: WriterSchedule::Periodic(Duration::from_millis(10)),
    }
}

/// One patch, one module, three sensors of types [1, 1, 2].
fn small_details() -> DetailsFn {
    Box::new(|blueprint, provenance| {
        if provenance == Provenance::Fresh {
            let patch = blueprint.add_patch();
            let module = patch.add_module();
            module.add_sensor(1);
            module.add_sensor(1);
            module.add_sensor(2);
        }
        blueprint.sensor_count() == 3
    })
}

fn counting_acquire(counter: Arc<AtomicU64>) -> tacta_shared_memory::WriteFn {
    Box::new(move |buffer, _cycle| {
        let n = counter.fetch_add(1, Ordering::AcqRel) as u8;
        buffer.fill(n);
        true
    })
}

#[test]
fn driver_and_user_roundtrip() {
    let (session, _) = open("rt");

    let writes = Arc::new(AtomicU64::new(0));
    let (driver, provenance) = session
        .add_driver(
            driver_attrs("skin"),
            small_details(),
            counting_acquire(Arc::clone(&writes)),
            LifecycleHooks::none(),
        )
        .unwrap();
    assert_eq!(provenance, Provenance::Fresh);
    assert_eq!(
        session.with_driver(driver, |d| d.sensor_types().to_vec()).unwrap(),
        vec![1, 2]
    );

    let peeks = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&peeks);
    let user = session
        .attach_user(
            UserAttrs {
                name: Some("skin".to_string()),
                sensor_type: None,
            },
            ReaderSchedule::Soft,
            Box::new(move |buffer, _cycle, view| {
                counter.fetch_add(1, Ordering::AcqRel);
                // Buffer holds response_size bytes per sensor.
                buffer.len() == view.sensor_count() * 2
            }),
            UserHooks::none(),
        )
        .unwrap();

    // Topology view: counts, back-references and type chains.
    session
        .with_user(user, |u| {
            let view = u.view();
            assert_eq!(view.patch_count(), 1);
            assert_eq!(view.module_count(), 1);
            assert_eq!(view.sensor_count(), 3);

            let mut of_type_one = 0;
            view.for_each_sensor_of_type(1, |_, sensor| {
                assert_eq!(sensor.patch, 0);
                assert_eq!(sensor.module, 0);
                of_type_one += 1;
            });
            assert_eq!(of_type_one, 2);
        })
        .unwrap();

    std::thread::sleep(Duration::from_millis(100));
    assert!(writes.load(Ordering::Acquire) >= 3);
    assert!(peeks.load(Ordering::Acquire) >= 1);

    let snapshot = session.registry().snapshot().unwrap();
    assert_eq!(snapshot.drivers.len(), 1);
    assert_eq!(snapshot.drivers[0].users_attached, 1);
    assert_eq!(snapshot.drivers[0].sensor_count, 3);

    session.detach_user(user).unwrap();
    session.remove_driver(driver).unwrap();

    let snapshot = session.registry().snapshot().unwrap();
    assert!(snapshot.drivers.is_empty());
    assert!(snapshot.producers.is_empty());
}

#[test]
fn inconsistent_topology_is_rejected() {
    let (session, _) = open("sum");

    // Declares 3 sensors but provides only 2: the sums disagree.
    let details: DetailsFn = Box::new(|blueprint, _| {
        let patch = blueprint.add_patch();
        let module = patch.add_module();
        module.add_sensor(1);
        module.add_sensor(1);
        true
    });

    let err = session
        .add_driver(
            driver_attrs("bad"),
            details,
            Box::new(|_, _| true),
            LifecycleHooks::none(),
        )
        .unwrap_err();
    assert!(matches!(err, FabricError::InvalidArgument { .. }));

    // The unwind leaves no driver record and no producer behind.
    let snapshot = session.registry().snapshot().unwrap();
    assert!(snapshot.drivers.is_empty());
    assert!(snapshot.producers.is_empty());
}

#[test]
fn details_callback_can_cancel() {
    let (session, _) = open("cancel");

    let details: DetailsFn = Box::new(|_, _| false);
    let err = session
        .add_driver(
            driver_attrs("nope"),
            details,
            Box::new(|_, _| true),
            LifecycleHooks::none(),
        )
        .unwrap_err();
    assert!(matches!(err, FabricError::Cancelled { .. }));
}

#[test]
fn second_process_gets_already_active_driver() {
    let (session_a, registry_name) = open("two");

    let (driver_a, provenance) = session_a
        .add_driver(
            driver_attrs("shared"),
            small_details(),
            counting_acquire(Arc::new(AtomicU64::new(0))),
            LifecycleHooks::none(),
        )
        .unwrap();
    assert_eq!(provenance, Provenance::Fresh);

    // A second session (stand-in for a second process) registers the
    // same driver with identical attributes.
    let session_b = Session::open(&registry_name, Default::default()).unwrap();
    let (driver_b, provenance) = session_b
        .add_driver(
            driver_attrs("shared"),
            small_details(),
            counting_acquire(Arc::new(AtomicU64::new(0))),
            LifecycleHooks::none(),
        )
        .unwrap();
    assert_eq!(provenance, Provenance::Revived);

    // Both attach a user; the single driver record counts them both.
    let user_a = session_a
        .attach_user(
            UserAttrs {
                name: Some("shared".to_string()),
                sensor_type: None,
            },
            ReaderSchedule::Soft,
            Box::new(|_, _, _| true),
            UserHooks::none(),
        )
        .unwrap();
    let user_b = session_b
        .attach_user(
            UserAttrs {
                name: Some("shared".to_string()),
                sensor_type: None,
            },
            ReaderSchedule::Soft,
            Box::new(|_, _, _| true),
            UserHooks::none(),
        )
        .unwrap();

    let snapshot = session_a.registry().snapshot().unwrap();
    assert_eq!(snapshot.drivers.len(), 1);
    assert_eq!(snapshot.drivers[0].users_attached, 2);

    session_b.detach_user(user_b).unwrap();
    session_b.remove_driver(driver_b).unwrap();
    // The alias teardown must leave the owner active.
    assert!(session_a.with_driver(driver_a, |d| d.is_active()).unwrap());

    session_a.detach_user(user_a).unwrap();
    session_a.remove_driver(driver_a).unwrap();
}

#[test]
fn discovery_by_sensor_type() {
    let (session, _) = open("disco");

    let (driver, _) = session
        .add_driver(
            driver_attrs("touch"),
            small_details(),
            counting_acquire(Arc::new(AtomicU64::new(0))),
            LifecycleHooks::none(),
        )
        .unwrap();

    // No name: discovery finds the driver serving type 2.
    let user = session
        .attach_user(
            UserAttrs {
                name: None,
                sensor_type: Some(2),
            },
            ReaderSchedule::Soft,
            Box::new(|_, _, _| true),
            UserHooks::none(),
        )
        .unwrap();

    // Already attached to the only candidate: discovery finds nothing.
    let err = session
        .attach_user(
            UserAttrs {
                name: None,
                sensor_type: Some(2),
            },
            ReaderSchedule::Soft,
            Box::new(|_, _, _| true),
            UserHooks::none(),
        )
        .unwrap_err();
    assert!(matches!(err, FabricError::NotFound { .. }));

    // An unserved type finds nothing either.
    let err = session
        .attach_user(
            UserAttrs {
                name: None,
                sensor_type: Some(42),
            },
            ReaderSchedule::Soft,
            Box::new(|_, _, _| true),
            UserHooks::none(),
        )
        .unwrap_err();
    assert!(matches!(err, FabricError::NotFound { .. }));

    session.detach_user(user).unwrap();
    session.remove_driver(driver).unwrap();
}

#[test]
fn detach_hooks_run_in_documented_order() {
    let (session, _) = open("hooks");

    let (driver, _) = session
        .add_driver(
            driver_attrs("order"),
            small_details(),
            counting_acquire(Arc::new(AtomicU64::new(0))),
            LifecycleHooks::none(),
        )
        .unwrap();

    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let (l1, l2, l3, l4, l5) = (
        Arc::clone(&log),
        Arc::clone(&log),
        Arc::clone(&log),
        Arc::clone(&log),
        Arc::clone(&log),
    );
    let hooks = UserHooks {
        clean: Some(Box::new(move || l1.lock().unwrap().push("clean".into()))),
        patch_clean: Some(Box::new(move |i| {
            l2.lock().unwrap().push(format!("patch{i}"))
        })),
        module_clean: Some(Box::new(move |i| {
            l3.lock().unwrap().push(format!("module{i}"))
        })),
        sensor_clean: Some(Box::new(move |i| {
            l4.lock().unwrap().push(format!("sensor{i}"))
        })),
        object_clean: Some(Box::new(move || l5.lock().unwrap().push("object".into()))),
    };

    let user = session
        .attach_user(
            UserAttrs {
                name: Some("order".to_string()),
                sensor_type: None,
            },
            ReaderSchedule::Soft,
            Box::new(|_, _, _| true),
            hooks,
        )
        .unwrap();
    session.detach_user(user).unwrap();

    let observed = log.lock().unwrap();
    assert_eq!(
        *observed,
        vec![
            "clean".to_string(),
            "patch0".to_string(),
            "module0".to_string(),
            "sensor0".to_string(),
            "sensor1".to_string(),
            "sensor2".to_string(),
            "object".to_string(),
        ]
    );

    session.remove_driver(driver).unwrap();
}

#[test]
fn load_and_update_reconcile_users() {
    let (session_a, registry_name) = open("load");

    let (driver, _) = session_a
        .add_driver(
            driver_attrs("auto"),
            small_details(),
            counting_acquire(Arc::new(AtomicU64::new(0))),
            LifecycleHooks::none(),
        )
        .unwrap();

    let session_b = Session::open(&registry_name, Default::default()).unwrap();
    let mut template = tacta_shared_memory::UserTemplate {
        schedule: ReaderSchedule::Soft,
        make_peek: Box::new(|_name| Box::new(|_, _, _| true)),
    };

    assert_eq!(session_b.load(&mut template).unwrap(), 1);
    // Nothing new to attach on a second load.
    assert_eq!(session_b.load(&mut template).unwrap(), 0);

    // The driver goes away; update detaches the stale user and finds no
    // replacement.
    session_a.remove_driver(driver).unwrap();
    assert_eq!(session_b.update(&mut template).unwrap(), 0);

    let snapshot = session_b.registry().snapshot().unwrap();
    assert!(snapshot.drivers.is_empty());
}
