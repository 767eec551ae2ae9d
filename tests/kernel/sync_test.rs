/*!
 * Synchronization Tests
 * Events, waits, cancellation, guest mutexes, condition variables and address arbitration
 */

use crate::harness::{child, heap, journal, start_child, Harness};
use hle_kernel::core::limits::{CURRENT_THREAD_HANDLE, HANDLE_WAIT_MASK};
use hle_kernel::svc;
use hle_kernel::{KernelError, KernelResult, ResultCode};
use pretty_assertions::assert_eq;
use std::time::{Duration, Instant};

const WAIT_IF_EQUAL: u32 = 2;
const SIGNAL: u32 = 0;
const SIGNAL_AND_INCREMENT_IF_EQUAL: u32 = 1;

/// Result code a syscall would leave in x0
fn code<T>(result: KernelResult<T>) -> ResultCode {
    match result {
        Ok(_) => ResultCode::SUCCESS,
        Err(err) => err.result_code(),
    }
}

#[test]
fn test_signal_wakes_blocked_waiter() {
    let harness = Harness::single_core();
    let log = journal();

    let entries = log.clone();
    harness.entry(child(1), move |ctx| {
        let readable = ctx.regs[0] as u32;
        entries.lock().push("waiting".to_string());
        let index = ctx.wait_synchronization(&[readable], -1)?;
        entries.lock().push(format!("woken {}", index));
        Ok(())
    });

    let entries = log.clone();
    harness.run(move |ctx| {
        let (writable, readable) = ctx.create_event()?;
        let thread = start_child(ctx, child(1), readable as u64, 20)?;
        entries.lock().push("signal".to_string());
        ctx.signal_event(writable)?;
        ctx.wait_synchronization(&[thread], -1)?;
        Ok(())
    });

    assert_eq!(*log.lock(), vec!["waiting", "signal", "woken 0"]);
}

#[test]
fn test_wait_reports_signaled_index() {
    let harness = Harness::new();
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let (_, quiet) = ctx.create_event()?;
        let (writable, readable) = ctx.create_event()?;
        ctx.signal_event(writable)?;
        entries.lock().push(ctx.wait_synchronization(&[quiet, readable], 0));
        Ok(())
    });

    assert_eq!(*log.lock(), vec![Ok(1)]);
}

#[test]
fn test_wait_timeouts() {
    let harness = Harness::new();
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let (_, readable) = ctx.create_event()?;
        let polled = ctx.wait_synchronization(&[readable], 0);
        let start = Instant::now();
        let timed = ctx.wait_synchronization(&[readable], 20_000_000);
        let elapsed = start.elapsed();
        entries.lock().push((polled, timed, elapsed >= Duration::from_millis(20)));
        Ok(())
    });

    assert_eq!(
        *log.lock(),
        vec![(Err(KernelError::TimedOut), Err(KernelError::TimedOut), true)]
    );
}

#[test]
fn test_event_sides_and_reset() {
    let harness = Harness::new();
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let (writable, readable) = ctx.create_event()?;
        let mut results = entries.lock();
        results.push(code(ctx.signal_event(readable)));
        results.push(code(svc::sync::reset_signal(ctx, readable)));
        results.push(code(ctx.signal_event(writable)));
        results.push(code(svc::sync::reset_signal(ctx, readable)));
        results.push(code(ctx.wait_synchronization(&[readable], 0)));
        results.push(code(ctx.signal_event(writable)));
        results.push(code(ctx.clear_event(writable)));
        results.push(code(ctx.wait_synchronization(&[readable], 0)));
        Ok(())
    });

    assert_eq!(
        *log.lock(),
        vec![
            ResultCode::INVALID_HANDLE,
            ResultCode::INVALID_STATE,
            ResultCode::SUCCESS,
            ResultCode::SUCCESS,
            ResultCode::TIMED_OUT,
            ResultCode::SUCCESS,
            ResultCode::SUCCESS,
            ResultCode::TIMED_OUT,
        ]
    );
}

#[test]
fn test_wait_on_unwaitable_handle_fails() {
    let harness = Harness::new();
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let (writable, _) = ctx.create_event()?;
        let mut results = entries.lock();
        results.push(code(ctx.wait_synchronization(&[writable], 0)));
        results.push(code(ctx.wait_synchronization(&[0x1234_5678], 0)));
        results.push(code(ctx.wait_synchronization(&vec![writable; 65], 0)));
        Ok(())
    });

    assert_eq!(
        *log.lock(),
        vec![
            ResultCode::INVALID_HANDLE,
            ResultCode::INVALID_HANDLE,
            ResultCode::OUT_OF_RANGE,
        ]
    );
}

#[test]
fn test_cancel_synchronization() {
    let harness = Harness::single_core();
    let log = journal();

    let entries = log.clone();
    harness.entry(child(1), move |ctx| {
        let readable = ctx.regs[0] as u32;
        let result = ctx.wait_synchronization(&[readable], -1);
        entries.lock().push(("child", code(result)));
        Ok(())
    });

    let entries = log.clone();
    harness.run(move |ctx| {
        // Cancelling a thread that is not waiting arms its next wait
        ctx.cancel_synchronization(CURRENT_THREAD_HANDLE)?;
        let (_, readable) = ctx.create_event()?;
        let armed = ctx.wait_synchronization(&[readable], -1);
        entries.lock().push(("main", code(armed)));

        let thread = start_child(ctx, child(1), readable as u64, 20)?;
        ctx.cancel_synchronization(thread)?;
        ctx.wait_synchronization(&[thread], -1)?;
        Ok(())
    });

    assert_eq!(
        *log.lock(),
        vec![("main", ResultCode::CANCELLED), ("child", ResultCode::CANCELLED)]
    );
}

#[test]
fn test_mutex_handoff_to_waiter() {
    let harness = Harness::single_core();
    let log = journal();

    let entries = log.clone();
    harness.entry(child(1), move |ctx| {
        let mutex = ctx.regs[0];
        let tag = ctx.read_u32(mutex + 8)?;
        let owner = ctx.read_u32(mutex)?;
        // Contended: publish the wait bit, then ask the kernel to queue us
        ctx.write_u32(mutex, owner | HANDLE_WAIT_MASK)?;
        ctx.arbitrate_lock(owner, mutex, tag)?;
        entries.lock().push(format!("child owns: {}", ctx.read_u32(mutex)? == tag));
        ctx.arbitrate_unlock(mutex)?;
        Ok(())
    });

    let entries = log.clone();
    harness.run(move |ctx| {
        let main_tag = ctx.regs[1] as u32;
        let mutex = heap(ctx)?;
        ctx.write_u32(mutex, main_tag)?;

        let thread = ctx.create_thread(child(1), mutex, ctx.sp, 20, 0)?;
        ctx.write_u32(mutex + 8, thread)?;
        ctx.start_thread(thread)?;

        entries.lock().push(format!("waiter flagged: {}", ctx.read_u32(mutex)? == main_tag | HANDLE_WAIT_MASK));
        ctx.arbitrate_unlock(mutex)?;
        ctx.wait_synchronization(&[thread], -1)?;
        entries.lock().push(format!("released: {}", ctx.read_u32(mutex)? == 0));
        Ok(())
    });

    assert_eq!(
        *log.lock(),
        vec!["waiter flagged: true", "child owns: true", "released: true"]
    );
}

#[test]
fn test_arbitrate_lock_returns_when_owner_changed() {
    let harness = Harness::new();
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let main_tag = ctx.regs[1] as u32;
        let mutex = heap(ctx)?;
        // The word no longer names the owner with the wait bit: no wait
        ctx.write_u32(mutex, 0)?;
        let unchanged = ctx.arbitrate_lock(main_tag, mutex, main_tag);
        let misaligned = ctx.arbitrate_lock(main_tag, mutex + 2, main_tag);
        entries.lock().push((code(unchanged), code(misaligned)));
        Ok(())
    });

    assert_eq!(
        *log.lock(),
        vec![(ResultCode::SUCCESS, ResultCode::INVALID_ADDRESS)]
    );
}

#[test]
fn test_condition_variable_signal_reacquires_mutex() {
    let harness = Harness::single_core();
    let log = journal();

    let entries = log.clone();
    harness.entry(child(1), move |ctx| {
        let mutex = ctx.regs[0];
        let key = mutex + 4;
        let tag = ctx.read_u32(mutex + 8)?;
        ctx.write_u32(mutex, tag)?;
        ctx.wait_process_wide_key(mutex, key, tag, -1)?;
        entries.lock().push(format!("child reacquired: {}", ctx.read_u32(mutex)? == tag));
        ctx.arbitrate_unlock(mutex)?;
        Ok(())
    });

    let entries = log.clone();
    harness.run(move |ctx| {
        let mutex = heap(ctx)?;
        let key = mutex + 4;
        let thread = ctx.create_thread(child(1), mutex, ctx.sp, 20, 0)?;
        ctx.write_u32(mutex + 8, thread)?;
        ctx.start_thread(thread)?;

        entries.lock().push(format!(
            "while waiting: mutex {} key {}",
            ctx.read_u32(mutex)?,
            ctx.read_u32(key)?
        ));
        ctx.signal_process_wide_key(key, 1)?;
        ctx.wait_synchronization(&[thread], -1)?;
        entries.lock().push(format!("after: mutex {} key {}", ctx.read_u32(mutex)?, ctx.read_u32(key)?));
        Ok(())
    });

    assert_eq!(
        *log.lock(),
        vec![
            "while waiting: mutex 0 key 1",
            "child reacquired: true",
            "after: mutex 0 key 0",
        ]
    );
}

#[test]
fn test_condition_variable_wait_times_out() {
    let harness = Harness::new();
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let tag = ctx.regs[1] as u32;
        let mutex = heap(ctx)?;
        ctx.write_u32(mutex, tag)?;
        let result = ctx.wait_process_wide_key(mutex, mutex + 4, tag, 10_000_000);
        entries.lock().push((code(result), ctx.read_u32(mutex)?));
        Ok(())
    });

    // The mutex stays released after a timeout
    assert_eq!(*log.lock(), vec![(ResultCode::TIMED_OUT, 0)]);
}

#[test]
fn test_signal_with_unmapped_key_is_not_a_guest_fault() {
    let harness = Harness::new();
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let key = heap(ctx)?;
        ctx.write_u32(key, 1)?;
        entries.lock().push(code(ctx.signal_process_wide_key(key, 1)));
        entries.lock().push(if ctx.read_u32(key)? == 0 { ResultCode::SUCCESS } else { ResultCode::INVALID_STATE });

        // Nothing is mapped below the code region
        entries.lock().push(code(ctx.signal_process_wide_key(0x10, -1)));
        Ok(())
    });

    assert_eq!(*log.lock(), vec![ResultCode::SUCCESS, ResultCode::SUCCESS, ResultCode::SUCCESS]);
}

#[test]
fn test_address_arbiter_wait_and_signal() {
    let harness = Harness::single_core();
    let log = journal();

    let entries = log.clone();
    harness.entry(child(1), move |ctx| {
        let word = ctx.regs[0];
        let result = ctx.wait_for_address(word, WAIT_IF_EQUAL, 0, -1);
        entries.lock().push(format!("child woke: {:?}", code(result)));
        Ok(())
    });

    let entries = log.clone();
    harness.run(move |ctx| {
        let word = heap(ctx)?;
        let thread = start_child(ctx, child(1), word, 20)?;
        entries.lock().push("signal".to_string());
        ctx.signal_to_address(word, SIGNAL, 0, 1)?;
        ctx.wait_synchronization(&[thread], -1)?;
        Ok(())
    });

    assert_eq!(
        *log.lock(),
        vec!["signal".to_string(), format!("child woke: {:?}", ResultCode::SUCCESS)]
    );
}

#[test]
fn test_address_arbiter_conditions() {
    let harness = Harness::new();
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let word = heap(ctx)?;
        ctx.write_u32(word, 5)?;
        let mut results = entries.lock();
        // 5 != 4: nothing to wait for
        results.push(code(ctx.wait_for_address(word, WAIT_IF_EQUAL, 4, -1)));
        results.push(code(ctx.wait_for_address(word, WAIT_IF_EQUAL, 5, 0)));
        results.push(code(ctx.wait_for_address(word, 9, 5, 0)));
        results.push(code(ctx.signal_to_address(word, SIGNAL_AND_INCREMENT_IF_EQUAL, 4, 1)));
        results.push(code(ctx.signal_to_address(word, SIGNAL_AND_INCREMENT_IF_EQUAL, 5, 1)));
        drop(results);
        entries.lock().push(if ctx.read_u32(word)? == 6 {
            ResultCode::SUCCESS
        } else {
            ResultCode::INVALID_STATE
        });
        Ok(())
    });

    assert_eq!(
        *log.lock(),
        vec![
            ResultCode::INVALID_STATE,
            ResultCode::TIMED_OUT,
            ResultCode::INVALID_ENUM_VALUE,
            ResultCode::INVALID_STATE,
            ResultCode::SUCCESS,
            ResultCode::SUCCESS,
        ]
    );
}
