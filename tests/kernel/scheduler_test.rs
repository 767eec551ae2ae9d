/*!
 * Scheduler Tests
 * Priority preemption, round robin, sleeping, limits and multi-core execution
 */

use crate::harness::{child, journal, start_child, Harness};
use hle_kernel::core::limits::CURRENT_THREAD_HANDLE;
use hle_kernel::{KernelConfig, KernelError};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn test_higher_priority_thread_preempts_at_start() {
    let harness = Harness::single_core();
    let log = journal();

    let entries = log.clone();
    harness.entry(child(1), move |_ctx| {
        entries.lock().push("child");
        Ok(())
    });

    let entries = log.clone();
    harness.run(move |ctx| {
        let handle = start_child(ctx, child(1), 0, 20)?;
        entries.lock().push("main");
        ctx.wait_synchronization(&[handle], -1)?;
        Ok(())
    });

    assert_eq!(*log.lock(), vec!["child", "main"]);
}

#[test]
fn test_lower_priority_thread_waits_for_core() {
    let harness = Harness::single_core();
    let log = journal();

    let entries = log.clone();
    harness.entry(child(1), move |_ctx| {
        entries.lock().push("child");
        Ok(())
    });

    let entries = log.clone();
    harness.run(move |ctx| {
        let handle = start_child(ctx, child(1), 0, 60)?;
        entries.lock().push("main");
        ctx.yield_now()?;
        entries.lock().push("main after yield");
        ctx.wait_synchronization(&[handle], -1)?;
        Ok(())
    });

    // Yielding only rotates within a priority level
    assert_eq!(*log.lock(), vec!["main", "main after yield", "child"]);
}

#[test]
fn test_equal_priority_threads_alternate_on_yield() {
    let harness = Harness::single_core();
    let log = journal();

    for (n, name) in [(1, "A"), (2, "B")] {
        let entries = log.clone();
        harness.entry(child(n), move |ctx| {
            for i in 0..3 {
                entries.lock().push(format!("{}{}", name, i));
                ctx.yield_now()?;
            }
            Ok(())
        });
    }

    harness.run(move |ctx| {
        let a = start_child(ctx, child(1), 0, 44)?;
        let b = start_child(ctx, child(2), 0, 44)?;
        ctx.wait_synchronization(&[a], -1)?;
        ctx.wait_synchronization(&[b], -1)?;
        Ok(())
    });

    assert_eq!(*log.lock(), vec!["A0", "B0", "A1", "B1", "A2", "B2"]);
}

#[test]
fn test_ready_threads_run_in_priority_order() {
    let harness = Harness::single_core();
    let log = journal();

    for (n, priority) in [(1, 30u32), (2, 20), (3, 40)] {
        let entries = log.clone();
        harness.entry(child(n), move |_ctx| {
            entries.lock().push(priority);
            Ok(())
        });
    }

    harness.run(move |ctx| {
        // Outrank every child so all of them are ready before any runs
        ctx.set_thread_priority(CURRENT_THREAD_HANDLE, 0)?;
        let handles = [
            start_child(ctx, child(1), 0, 30)?,
            start_child(ctx, child(2), 0, 20)?,
            start_child(ctx, child(3), 0, 40)?,
        ];
        for handle in handles {
            ctx.wait_synchronization(&[handle], -1)?;
        }
        Ok(())
    });

    assert_eq!(*log.lock(), vec![20, 30, 40]);
}

#[test]
fn test_sleep_blocks_for_duration() {
    let harness = Harness::new();
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let start = Instant::now();
        ctx.sleep(Duration::from_millis(30))?;
        entries.lock().push(start.elapsed());
        Ok(())
    });

    let log = log.lock();
    assert_eq!(log.len(), 1);
    assert!(log[0] >= Duration::from_millis(30));
}

#[test]
fn test_thread_limit_rejects_extra_threads() {
    let harness = Harness::with_config(KernelConfig::default().with_thread_limit(2));
    let log = journal();

    harness.entry(child(1), |_ctx| Ok(()));

    let entries = log.clone();
    harness.run(move |ctx| {
        let first = ctx.create_thread(child(1), 0, ctx.sp, 44, 0)?;
        let second = ctx.create_thread(child(1), 0, ctx.sp, 44, 0);
        entries.lock().push(second.map(|_| ()));
        ctx.start_thread(first)?;
        ctx.wait_synchronization(&[first], -1)?;
        Ok(())
    });

    let log = log.lock();
    assert!(matches!(log[0], Err(KernelError::LimitReached { limit: 2, .. })));
}

#[test]
fn test_invalid_priority_and_core_rejected() {
    let harness = Harness::new();
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let mut results = entries.lock();
        results.push(ctx.create_thread(child(1), 0, ctx.sp, 64, 0).map(|_| ()));
        results.push(ctx.create_thread(child(1), 0, ctx.sp, 44, 7).map(|_| ()));
        Ok(())
    });

    assert_eq!(
        *log.lock(),
        vec![Err(KernelError::InvalidPriority(64)), Err(KernelError::InvalidCoreId(7))]
    );
}

#[test]
fn test_threads_on_different_cores_run_in_parallel() {
    let harness = Harness::with_config(KernelConfig::default().with_core_count(2));
    let log = journal();
    let flag = Arc::new(AtomicBool::new(false));

    let seen = flag.clone();
    let entries = log.clone();
    harness.entry(child(1), move |ctx| {
        entries.lock().push(format!("child on core {}", ctx.current_processor()?));
        seen.store(true, Ordering::SeqCst);
        Ok(())
    });

    let seen = flag.clone();
    let entries = log.clone();
    harness.run(move |ctx| {
        let handle = ctx.create_thread(child(1), 0, ctx.sp, 44, 1)?;
        ctx.start_thread(handle)?;
        // Spin without syscalls: the child only makes progress on its own core
        let deadline = Instant::now() + Duration::from_secs(2);
        while !seen.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::hint::spin_loop();
        }
        entries.lock().push(format!("main saw child: {}", seen.load(Ordering::SeqCst)));
        ctx.wait_synchronization(&[handle], -1)?;
        Ok(())
    });

    assert_eq!(*log.lock(), vec!["child on core 1", "main saw child: true"]);
    assert_eq!(harness.kernel.scheduler().stats().threads, 0);
}
