#![forbid(unsafe_code)]

use config::{Config, ObjectClass, ProcessLayout};
use monitor::walker::WalkAbort;
use monitor::{Error, MemoryGuest, Monitor, NoopCheck, Pa, Va};
use pretty_assertions::assert_eq;
use std::time::Duration;

const KERNEL: Va = Va(0xffff_ffff_8200_0000);

fn task(k: u64) -> Va {
    KERNEL + k * 0x1000
}

/// `count` task_structs linked through `tasks`, starting at `init_task`.
fn task_list(count: u64) -> MemoryGuest {
    let layout = ProcessLayout::default();
    let mut guest = MemoryGuest::new("victim");
    guest.map(KERNEL, Pa(0x40_0000), 16);
    guest.define_symbol("init_task", KERNEL);
    for k in 0..count {
        let next = task((k + 1) % count);
        guest
            .poke_u64(task(k) + layout.list_offset, (next + layout.list_offset).0)
            .unwrap();
        guest.poke_u32(task(k) + layout.pid_offset, k as u32).unwrap();
        guest
            .poke_str(task(k) + layout.name_offset, &format!("task{k}"))
            .unwrap();
    }
    guest
}

fn config() -> Config {
    let mut config = Config::default();
    config.session.classes = vec![ObjectClass::Process];
    config.session.poll_timeout = Duration::from_millis(10);
    config
}

#[test]
fn readable_list_yields_one_watchpoint_per_task() {
    let guest = task_list(3);
    let journal = guest.journal();
    let mut monitor = Monitor::new(config(), guest);

    assert_eq!(monitor.register_class(ObjectClass::Process).unwrap(), 3);

    assert_eq!(monitor.registry().len(), 3);
    let labels: Vec<_> = monitor
        .registry()
        .iter()
        .map(|w| w.targets[0].label.clone())
        .collect();
    assert_eq!(labels, ["[0] task0", "[1] task1", "[2] task2"]);
    assert_eq!(journal.watched().len(), 3);
}

#[test]
fn unreadable_name_fails_registration_and_watches_nothing() {
    let mut guest = task_list(3);
    guest.fail_reads_at(task(1) + ProcessLayout::default().name_offset);
    let journal = guest.journal();
    let mut monitor = Monitor::new(config(), guest);

    let err = monitor.register_class(ObjectClass::Process).unwrap_err();

    assert!(err.is_registration());
    assert!(matches!(
        err,
        Error::WalkAbort {
            class: ObjectClass::Process,
            source: WalkAbort::Field { field: "name", .. },
        }
    ));
    assert!(monitor.registry().is_empty());
    assert!(journal.watched().is_empty());
}

#[test]
fn failed_startup_still_releases_the_guest() {
    let mut guest = task_list(3);
    guest.fail_reads_at(task(1) + ProcessLayout::default().name_offset);
    let journal = guest.journal();

    let err = Monitor::new(config(), guest)
        .run(Box::new(NoopCheck))
        .unwrap_err();

    assert!(err.is_registration());
    assert_eq!(journal.pauses(), 1);
    assert_eq!(journal.resumes(), 1);
    assert!(journal.is_closed());
}

#[test]
fn every_refused_watchpoint_is_a_registration_failure() {
    let mut guest = task_list(2);
    guest.refuse_watch(Pa(0x40_0000).gfn());
    guest.refuse_watch(Pa(0x40_1000).gfn());
    let mut monitor = Monitor::new(config(), guest);

    assert!(matches!(
        monitor.register_class(ObjectClass::Process),
        Err(Error::Register {
            class: ObjectClass::Process,
            attempted: 2
        })
    ));
}

#[test]
fn some_refused_watchpoints_are_tolerated() {
    let mut guest = task_list(3);
    guest.refuse_watch(Pa(0x40_1000).gfn());
    let mut monitor = Monitor::new(config(), guest);

    assert_eq!(monitor.register_class(ObjectClass::Process).unwrap(), 2);
    assert_eq!(monitor.registry().len(), 2);
}

#[test]
fn pause_failure_aborts_before_registration() {
    let mut guest = task_list(3);
    guest.fail_pause();
    let journal = guest.journal();

    let err = Monitor::new(config(), guest)
        .run(Box::new(NoopCheck))
        .unwrap_err();

    assert!(matches!(err, Error::Pause(_)));
    assert!(journal.watched().is_empty());
    assert!(journal.is_closed());
}
