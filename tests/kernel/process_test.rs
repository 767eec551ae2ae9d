/*!
 * Process Lifecycle Tests
 * Creation, termination, faults and resource cleanup
 */

use crate::harness::{child, heap, journal, start_child, wait_until, Harness, EXIT_TIMEOUT};
use hle_kernel::core::limits::DEFAULT_GUEST_STACK_SIZE;
use hle_kernel::kernel::{ProcessState, ThreadState};
use hle_kernel::svc::{self, number};
use hle_kernel::{KernelError, ProcessCreateInfo, ResultCode};
use pretty_assertions::assert_eq;

#[test]
fn test_pids_are_sequential_from_first_user_pid() {
    let harness = Harness::new();
    let first = harness.kernel.create_process(ProcessCreateInfo::new("first")).unwrap();
    let second = harness.kernel.create_process(ProcessCreateInfo::new("second")).unwrap();

    assert_eq!(first.pid(), 0x51);
    assert_eq!(second.pid(), 0x52);
    assert_eq!(harness.kernel.process_ids(), vec![0x51, 0x52]);
    assert_eq!(first.state(), ProcessState::Created);
}

#[test]
fn test_invalid_create_info_rejected() {
    let harness = Harness::new();
    let bad_core = harness
        .kernel
        .create_process(ProcessCreateInfo::new("bad").with_ideal_core(2).with_core_mask(0b1));
    let bad_priority = harness
        .kernel
        .create_process(ProcessCreateInfo::new("bad").with_priority(64));

    assert_eq!(bad_core.unwrap_err(), KernelError::InvalidCoreId(2));
    assert_eq!(bad_priority.unwrap_err(), KernelError::InvalidPriority(64));
    assert_eq!(harness.kernel.process_count(), 0);
}

#[test]
fn test_image_is_loaded_at_code_address() {
    let harness = Harness::new();
    let process = harness
        .kernel
        .create_process(ProcessCreateInfo::new("image").with_image(vec![0xAA; 16]).with_data_size(0x10))
        .unwrap();
    let code = process.page_table().read_bytes(process.code_address(), 16).unwrap();

    assert_eq!(code, vec![0xAA; 16]);
    // code pages are not writable from the guest
    assert!(process.page_table().write(process.code_address(), &[0]).is_err());
    // the data segment follows the code page
    assert!(process.page_table().write(process.code_address() + 0x1000, &[1]).is_ok());
}

#[test]
fn test_main_thread_receives_own_handle() {
    let harness = Harness::new();
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let own = ctx.regs[1] as u32;
        let tid = svc::thread::get_thread_id(ctx, own)?;
        entries.lock().push((ctx.regs[0], tid == ctx.thread().tid()));
        Ok(())
    });

    assert_eq!(*log.lock(), vec![(0, true)]);
}

#[test]
fn test_start_process_twice_fails() {
    let harness = Harness::new();
    let process = harness.run(|_ctx| Ok(()));

    let again = harness.kernel.start_process(&process, DEFAULT_GUEST_STACK_SIZE);
    assert_eq!(again.unwrap_err(), KernelError::Result(ResultCode::INVALID_STATE));
}

#[test]
fn test_exit_releases_handles_and_memory() {
    let harness = Harness::new();
    let process = harness.run(|ctx| {
        ctx.create_event()?;
        ctx.create_event()?;
        heap(ctx)?;
        Ok(())
    });

    assert_eq!(process.state(), ProcessState::Exited);
    assert_eq!(process.handle_count(), 0);
    assert_eq!(process.thread_count(), 0);
    assert!(harness.kernel.process(process.pid()).is_none());
    assert_eq!(harness.kernel.physical_memory().used(), 0);
}

#[test]
fn test_terminate_releases_blocked_threads() {
    let harness = Harness::new();
    let log = journal();

    let entries = log.clone();
    harness.entry(child(1), move |ctx| {
        let readable = ctx.regs[0] as u32;
        let result = ctx.wait_synchronization(&[readable], -1);
        entries.lock().push(result.clone().map(|_| ()));
        result.map(|_| ())
    });

    let entries = log.clone();
    let process = harness.spawn("blocked", move |ctx| {
        let (_, readable) = ctx.create_event()?;
        start_child(ctx, child(1), readable as u64, 44)?;
        let result = ctx.wait_synchronization(&[readable], -1);
        entries.lock().push(result.clone().map(|_| ()));
        result.map(|_| ())
    });

    let scheduler = harness.kernel.scheduler();
    let all_waiting = wait_until(EXIT_TIMEOUT, || {
        let threads = process.threads();
        threads.len() == 2
            && threads
                .iter()
                .all(|thread| scheduler.thread_state(thread.tid()) == Some(ThreadState::WaitingSync))
    });
    assert!(all_waiting, "threads never blocked");

    harness.kernel.terminate_process(process.pid()).unwrap();
    assert!(process.wait_for_exit(Some(EXIT_TIMEOUT)));

    assert_eq!(
        *log.lock(),
        vec![Err(KernelError::TerminationRequested), Err(KernelError::TerminationRequested)]
    );
    assert_eq!(process.state(), ProcessState::Exited);
    assert!(harness.kernel.process(process.pid()).is_none());
}

#[test]
fn test_guest_fault_terminates_process() {
    let harness = Harness::new();
    let log = journal();

    let entries = log.clone();
    harness.entry(child(1), move |ctx| {
        let readable = ctx.regs[0] as u32;
        let result = ctx.wait_synchronization(&[readable], -1);
        entries.lock().push(result.map(|_| ()));
        Ok(())
    });

    let process = harness.run(move |ctx| {
        let (_, readable) = ctx.create_event()?;
        let thread = ctx.create_thread(child(1), readable as u64, ctx.sp, 20, 0)?;
        ctx.start_thread(thread)?;
        Err(KernelError::invalid_state("guest fault"))
    });

    assert_eq!(process.state(), ProcessState::Exited);
    assert_eq!(*log.lock(), vec![Err(KernelError::TerminationRequested)]);
}

#[test]
fn test_exit_process_svc_ends_every_thread() {
    let harness = Harness::single_core();
    let log = journal();

    let entries = log.clone();
    harness.entry(child(1), move |ctx| {
        let readable = ctx.regs[0] as u32;
        let result = ctx.wait_synchronization(&[readable], -1);
        entries.lock().push(format!("child: {:?}", result));
        Ok(())
    });

    let entries = log.clone();
    let process = harness.run(move |ctx| {
        let (_, readable) = ctx.create_event()?;
        start_child(ctx, child(1), readable as u64, 20)?;
        let result = ctx.svc(number::EXIT_PROCESS);
        entries.lock().push(format!("main: {:?} x0={:#x}", result, ctx.regs[0]));
        result
    });

    assert_eq!(process.state(), ProcessState::Exited);
    let log = log.lock();
    assert_eq!(log.len(), 2);
    assert!(log.contains(&"child: Err(TerminationRequested)".to_string()));
    assert!(log.contains(&format!("main: Err(TerminationRequested) x0={:#x}", ResultCode::TERMINATION_REQUESTED.raw())));
}

#[test]
fn test_exit_thread_leaves_siblings_running() {
    let harness = Harness::single_core();
    let log = journal();

    let entries = log.clone();
    harness.entry(child(1), move |ctx| {
        entries.lock().push("child exiting");
        ctx.exit_thread()?;
        entries.lock().push("unreachable");
        Ok(())
    });

    let entries = log.clone();
    harness.run(move |ctx| {
        let thread = start_child(ctx, child(1), 0, 20)?;
        ctx.wait_synchronization(&[thread], -1)?;
        entries.lock().push("main continues");
        Ok(())
    });

    assert_eq!(*log.lock(), vec!["child exiting", "main continues"]);
}

#[test]
fn test_exited_thread_reports_terminated_until_process_exits() {
    let harness = Harness::single_core();
    let log = journal();

    harness.entry(child(1), |_ctx| Ok(()));

    let entries = log.clone();
    let process = harness.run(move |ctx| {
        let thread = start_child(ctx, child(1), 0, 20)?;
        let tid = svc::thread::get_thread_id(ctx, thread)?;
        ctx.wait_synchronization(&[thread], -1)?;
        let state = ctx.kernel().scheduler().thread_state(tid);
        entries.lock().push((tid, state));
        Ok(())
    });

    let (tid, state) = log.lock()[0];
    assert_eq!(state, Some(ThreadState::Terminated));
    assert_eq!(process.state(), ProcessState::Exited);
    assert_eq!(harness.kernel.scheduler().thread_state(tid), None);
}

#[test]
fn test_exit_detaches_shared_memory_mappings() {
    let harness = Harness::new();
    let log = journal();

    let entries = log.clone();
    let process = harness.run(move |ctx| {
        let handle = svc::memory::create_shared_memory(ctx, 0x2000, 3, 1)?;
        let address = ctx.process().page_table().layout().alias.base;
        svc::memory::map_shared_memory(ctx, handle, address, 0x2000, 3)?;
        let shared = ctx
            .process()
            .handle_object(handle)?
            .as_shared_memory()
            .cloned()
            .ok_or(KernelError::InvalidHandle(handle))?;
        entries.lock().push((shared.attached_pids(), shared));
        Ok(())
    });

    let log = log.lock();
    let (attached, shared) = &log[0];
    assert_eq!(*attached, vec![process.pid()]);
    assert!(shared.attached_pids().is_empty());
}

#[test]
fn test_shutdown_terminates_running_processes() {
    let harness = Harness::new();
    let process = harness.spawn("forever", |ctx| {
        let (_, readable) = ctx.create_event()?;
        ctx.wait_synchronization(&[readable], -1)?;
        Ok(())
    });
    let main = process.threads()[0].tid();
    assert!(wait_until(EXIT_TIMEOUT, || {
        harness.kernel.scheduler().thread_state(main) == Some(ThreadState::WaitingSync)
    }));

    harness.kernel.shutdown();

    assert_eq!(process.state(), ProcessState::Exited);
    assert_eq!(harness.kernel.process_count(), 0);
}
