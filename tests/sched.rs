mod common;

use common::*;
use rvpk::process::ProcStatus;
use rvpk::scheduler::Dispatch;
use rvpk::syscalls::{TrapOutcome, SYS_EXIT, SYS_FORK, SYS_WAIT, SYS_YIELD};

const ANY_CHILD: u64 = -1i64 as u64;

#[test]
fn yield_rotates_through_the_ready_queue() {
    let (kernel, mut hart, parent) = boot(simple_image());
    let (child, _) = kernel.syscall(&mut hart, SYS_FORK, &[]).unwrap();
    let child = child as u32;

    let (ret, outcome) = kernel.syscall(&mut hart, SYS_YIELD, &[]).unwrap();
    assert_eq!((ret, outcome), (0, TrapOutcome::Reschedule));
    run_next(&kernel, &mut hart);
    assert_eq!(kernel.current_pid(&hart), Some(child));

    kernel.syscall(&mut hart, SYS_YIELD, &[]).unwrap();
    run_next(&kernel, &mut hart);
    assert_eq!(kernel.current_pid(&hart), Some(parent));
}

#[test]
fn exit_leaves_a_zombie_and_wait_reaps_it() {
    let (kernel, mut hart, parent) = boot(simple_image());
    let (child, _) = kernel.syscall(&mut hart, SYS_FORK, &[]).unwrap();
    let child = child as u32;

    kernel.syscall(&mut hart, SYS_YIELD, &[]).unwrap();
    run_next(&kernel, &mut hart);
    assert_eq!(kernel.current_pid(&hart), Some(child));

    let (_, outcome) = kernel.syscall(&mut hart, SYS_EXIT, &[7]).unwrap();
    assert_eq!(outcome, TrapOutcome::Reschedule);
    assert_eq!(kernel.status(child), ProcStatus::Zombie);

    run_next(&kernel, &mut hart);
    assert_eq!(kernel.current_pid(&hart), Some(parent));
    let (ret, outcome) = kernel.syscall(&mut hart, SYS_WAIT, &[ANY_CHILD]).unwrap();
    assert_eq!((ret, outcome), (child as i64, TrapOutcome::Resume));
    assert_eq!(kernel.status(child), ProcStatus::Free);
}

#[test]
fn wait_blocks_until_a_child_exits() {
    let (kernel, mut hart, parent) = boot(simple_image());
    let (child, _) = kernel.syscall(&mut hart, SYS_FORK, &[]).unwrap();
    let child = child as u32;

    let (ret, outcome) = kernel.syscall(&mut hart, SYS_WAIT, &[ANY_CHILD]).unwrap();
    assert_eq!((ret, outcome), (-2, TrapOutcome::Reschedule));
    assert_eq!(kernel.status(parent), ProcStatus::Blocked);

    run_next(&kernel, &mut hart);
    assert_eq!(kernel.current_pid(&hart), Some(child));
    kernel.syscall(&mut hart, SYS_EXIT, &[0]).unwrap();

    // the exit wakes the parent, which retries its wait
    run_next(&kernel, &mut hart);
    assert_eq!(kernel.current_pid(&hart), Some(parent));
    let (ret, _) = kernel.syscall(&mut hart, SYS_WAIT, &[ANY_CHILD]).unwrap();
    assert_eq!(ret, child as i64);
}

#[test]
fn wait_with_no_children_fails_fast() {
    let (kernel, mut hart, _pid) = boot(simple_image());
    let (ret, outcome) = kernel.syscall(&mut hart, SYS_WAIT, &[ANY_CHILD]).unwrap();
    assert_eq!((ret, outcome), (-1, TrapOutcome::Resume));
}

#[test]
fn wait_can_target_one_pid() {
    let (kernel, mut hart, parent) = boot(simple_image());
    let (c1, _) = kernel.syscall(&mut hart, SYS_FORK, &[]).unwrap();
    let (c2, _) = kernel.syscall(&mut hart, SYS_FORK, &[]).unwrap();
    let (c1, c2) = (c1 as u32, c2 as u32);

    let (ret, _) = kernel.syscall(&mut hart, SYS_WAIT, &[c2 as u64]).unwrap();
    assert_eq!(ret, -2);

    run_next(&kernel, &mut hart);
    assert_eq!(kernel.current_pid(&hart), Some(c1));
    kernel.syscall(&mut hart, SYS_EXIT, &[0]).unwrap();

    // c1's corpse does not satisfy a wait aimed at c2
    run_next(&kernel, &mut hart);
    assert_eq!(kernel.current_pid(&hart), Some(c2));
    assert_eq!(kernel.status(parent), ProcStatus::Blocked);
    kernel.syscall(&mut hart, SYS_EXIT, &[0]).unwrap();

    run_next(&kernel, &mut hart);
    assert_eq!(kernel.current_pid(&hart), Some(parent));
    let (ret, _) = kernel.syscall(&mut hart, SYS_WAIT, &[c2 as u64]).unwrap();
    assert_eq!(ret, c2 as i64);
    assert_eq!(kernel.status(c1), ProcStatus::Zombie);
    let (ret, _) = kernel.syscall(&mut hart, SYS_WAIT, &[ANY_CHILD]).unwrap();
    assert_eq!(ret, c1 as i64);
}

#[test]
fn reaped_slots_and_pids_are_reused() {
    let (kernel, mut hart, _parent) = boot(simple_image());
    let (first, _) = kernel.syscall(&mut hart, SYS_FORK, &[]).unwrap();
    let first = first as u32;

    kernel.syscall(&mut hart, SYS_YIELD, &[]).unwrap();
    run_next(&kernel, &mut hart);
    kernel.syscall(&mut hart, SYS_EXIT, &[0]).unwrap();
    run_next(&kernel, &mut hart);
    kernel.syscall(&mut hart, SYS_WAIT, &[ANY_CHILD]).unwrap();

    let (second, _) = kernel.syscall(&mut hart, SYS_FORK, &[]).unwrap();
    assert_eq!(second as u32, first);
}

#[test]
fn physical_memory_is_recovered_after_a_reap() {
    let (kernel, mut hart, _parent) = boot(simple_image());
    let baseline = kernel.resident_pages();

    kernel.syscall(&mut hart, SYS_FORK, &[]).unwrap();
    assert!(kernel.resident_pages() > baseline);
    kernel.syscall(&mut hart, SYS_YIELD, &[]).unwrap();
    run_next(&kernel, &mut hart);
    kernel.syscall(&mut hart, SYS_EXIT, &[0]).unwrap();
    run_next(&kernel, &mut hart);
    kernel.syscall(&mut hart, SYS_WAIT, &[ANY_CHILD]).unwrap();

    assert_eq!(kernel.resident_pages(), baseline);
}

#[test]
fn machine_shuts_down_when_nothing_is_left_to_run() {
    let (kernel, mut hart, _pid) = boot(simple_image());
    let (_, outcome) = kernel.syscall(&mut hart, SYS_EXIT, &[0]).unwrap();
    assert_eq!(outcome, TrapOutcome::Reschedule);
    assert_eq!(kernel.schedule(&mut hart), Dispatch::Shutdown);
    assert!(kernel.drain_console().contains("system shutdown now"));
}

#[test]
#[should_panic(expected = "ready queue empty")]
fn a_process_blocked_forever_is_a_kernel_bug() {
    let (kernel, mut hart, _pid) = boot(simple_image());
    let (id, _) = kernel.syscall(&mut hart, rvpk::syscalls::SYS_SEM_NEW, &[0]).unwrap();
    kernel.syscall(&mut hart, rvpk::syscalls::SYS_SEM_P, &[id as u64]).unwrap();
    kernel.schedule(&mut hart);
}
