/*!
 * Syscall ABI Tests
 * Register-level dispatch: arguments from x0-x5, result code in x0, outputs after it
 */

use crate::harness::{child, journal, Harness, EXIT_TIMEOUT};
use hle_kernel::core::limits::{CURRENT_PROCESS_HANDLE, CURRENT_THREAD_HANDLE, DEFAULT_GUEST_STACK_SIZE, HEAP_SIZE_ALIGNMENT};
use hle_kernel::kernel::{ProcessState, IDEAL_CORE_USE_PROCESS_VALUE};
use hle_kernel::svc::info::info_id;
use hle_kernel::svc::number;
use hle_kernel::{KernelError, KernelResult, ProcessCreateInfo, ResultCode, ThreadContext};
use pretty_assertions::assert_eq;

fn raw(code: ResultCode) -> u64 {
    code.raw() as u64
}

/// SetHeapSize through the register ABI, returning the heap base
fn map_heap(ctx: &mut ThreadContext) -> KernelResult<u64> {
    ctx.regs[1] = HEAP_SIZE_ALIGNMENT;
    ctx.svc(number::SET_HEAP_SIZE)?;
    if ctx.regs[0] != 0 {
        return Err(KernelError::Result(ResultCode::from_raw(ctx.regs[0] as u32)));
    }
    Ok(ctx.regs[1])
}

fn thread_priority(ctx: &mut ThreadContext) -> KernelResult<u64> {
    ctx.regs[1] = CURRENT_THREAD_HANDLE as u64;
    ctx.svc(number::GET_THREAD_PRIORITY)?;
    Ok(ctx.regs[1])
}

/// GetInfo, returning (x0, x1)
fn info(ctx: &mut ThreadContext, id: u32, handle: u32, sub_id: u64) -> KernelResult<(u64, u64)> {
    ctx.regs[1] = id as u64;
    ctx.regs[2] = handle as u64;
    ctx.regs[3] = sub_id;
    ctx.svc(number::GET_INFO)?;
    Ok((ctx.regs[0], ctx.regs[1]))
}

#[test]
fn test_event_syscalls_use_registers_and_guest_handle_arrays() {
    let harness = Harness::new();
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let base = map_heap(ctx)?;

        ctx.svc(number::CREATE_EVENT)?;
        let (writable, readable) = (ctx.regs[1], ctx.regs[2]);
        entries.lock().push(("create", ctx.regs[0], writable != readable && writable != 0 && readable != 0));

        ctx.regs[0] = writable;
        ctx.svc(number::SIGNAL_EVENT)?;
        entries.lock().push(("signal", ctx.regs[0], true));

        // The handle list lives in guest memory
        ctx.write_u32(base, readable as u32)?;
        ctx.regs[1] = base;
        ctx.regs[2] = 1;
        ctx.regs[3] = 0;
        ctx.svc(number::WAIT_SYNCHRONIZATION)?;
        entries.lock().push(("wait", ctx.regs[0], ctx.regs[1] == 0));

        ctx.regs[0] = readable;
        ctx.svc(number::CLEAR_EVENT)?;
        ctx.regs[1] = base;
        ctx.regs[2] = 1;
        ctx.regs[3] = 0;
        ctx.svc(number::WAIT_SYNCHRONIZATION)?;
        entries.lock().push(("wait cleared", ctx.regs[0], true));

        ctx.regs[1] = base;
        ctx.regs[2] = 65;
        ctx.svc(number::WAIT_SYNCHRONIZATION)?;
        entries.lock().push(("too many", ctx.regs[0], true));

        ctx.regs[0] = writable;
        ctx.svc(number::CLOSE_HANDLE)?;
        ctx.regs[0] = writable;
        ctx.svc(number::CLOSE_HANDLE)?;
        entries.lock().push(("close twice", ctx.regs[0], true));
        Ok(())
    });

    assert_eq!(
        *log.lock(),
        vec![
            ("create", 0, true),
            ("signal", 0, true),
            ("wait", 0, true),
            ("wait cleared", raw(ResultCode::TIMED_OUT), true),
            ("too many", raw(ResultCode::OUT_OF_RANGE), true),
            ("close twice", raw(ResultCode::INVALID_HANDLE), true),
        ]
    );
}

#[test]
fn test_value_returning_syscalls_write_x0() {
    let harness = Harness::new();
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        ctx.svc(number::GET_CURRENT_PROCESSOR_NUMBER)?;
        let core = ctx.regs[0];

        ctx.svc(number::GET_SYSTEM_TICK)?;
        let first = ctx.regs[0];
        ctx.regs[0] = 2_000_000;
        ctx.svc(number::SLEEP_THREAD)?;
        ctx.svc(number::GET_SYSTEM_TICK)?;
        let second = ctx.regs[0];

        entries.lock().push((core, second > first));
        Ok(())
    });

    assert_eq!(*log.lock(), vec![(0, true)]);
}

#[test]
fn test_unknown_syscall_reports_not_implemented() {
    let harness = Harness::new();
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let outcome = ctx.svc(0x7F);
        entries.lock().push((outcome.is_ok(), ctx.regs[0]));
        Ok(())
    });

    assert_eq!(*log.lock(), vec![(true, raw(ResultCode::NOT_IMPLEMENTED))]);
}

#[test]
fn test_thread_priority_round_trip() {
    let harness = Harness::new();
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let initial = thread_priority(ctx)?;

        ctx.regs[0] = CURRENT_THREAD_HANDLE as u64;
        ctx.regs[1] = 30;
        ctx.svc(number::SET_THREAD_PRIORITY)?;
        let set = ctx.regs[0];
        let updated = thread_priority(ctx)?;

        ctx.regs[0] = CURRENT_THREAD_HANDLE as u64;
        ctx.regs[1] = 64;
        ctx.svc(number::SET_THREAD_PRIORITY)?;
        let rejected = ctx.regs[0];

        entries.lock().push(vec![initial, set, updated, rejected]);
        Ok(())
    });

    assert_eq!(*log.lock(), vec![vec![44, 0, 30, raw(ResultCode::INVALID_PRIORITY)]]);
}

#[test]
fn test_create_thread_passes_argument_in_x0() {
    let harness = Harness::single_core();
    let log = journal();

    let entries = log.clone();
    harness.entry(child(1), move |ctx| {
        entries.lock().push(("child x0", ctx.regs[0]));
        Ok(())
    });

    let entries = log.clone();
    harness.run(move |ctx| {
        ctx.regs[1] = child(1);
        ctx.regs[2] = 0xC0FFEE;
        ctx.regs[3] = ctx.sp;
        ctx.regs[4] = 20;
        ctx.regs[5] = IDEAL_CORE_USE_PROCESS_VALUE as i64 as u64;
        ctx.svc(number::CREATE_THREAD)?;
        let handle = ctx.regs[1];
        entries.lock().push(("create", ctx.regs[0]));

        ctx.regs[1] = handle;
        ctx.svc(number::GET_THREAD_ID)?;
        entries.lock().push(("tid is set", (ctx.regs[1] != 0) as u64));

        ctx.regs[0] = handle;
        ctx.svc(number::START_THREAD)?;
        entries.lock().push(("start", ctx.regs[0]));

        ctx.wait_synchronization(&[handle as u32], -1)?;
        Ok(())
    });

    // The child outranks main and runs as soon as it starts
    assert_eq!(
        *log.lock(),
        vec![("create", 0), ("tid is set", 1), ("child x0", 0xC0FFEE), ("start", 0)]
    );
}

#[test]
fn test_get_info_reads_process_properties() {
    let harness = Harness::new();
    let log = journal();

    let process = harness
        .kernel
        .create_process(ProcessCreateInfo::new("info").with_program_id(0x0100_0000_0000_1000))
        .unwrap();
    let heap_base = process.page_table().layout().heap.base;

    let entries = log.clone();
    harness.entry(process.code_address(), move |ctx| {
        let mut results = Vec::new();
        results.push(info(ctx, info_id::PROGRAM_ID, CURRENT_PROCESS_HANDLE, 0)?);
        results.push(info(ctx, info_id::HEAP_REGION_ADDRESS, CURRENT_PROCESS_HANDLE, 0)?);
        results.push((info(ctx, info_id::RANDOM_ENTROPY, 0, 1)?.0, 0));
        results.push((info(ctx, info_id::RANDOM_ENTROPY, 0, 4)?.0, 0));
        results.push((info(ctx, 99, CURRENT_PROCESS_HANDLE, 0)?.0, 0));
        results.push((info(ctx, info_id::PROGRAM_ID, 0x1234, 0)?.0, 0));
        entries.lock().extend(results);
        Ok(())
    });

    harness.kernel.start_process(&process, DEFAULT_GUEST_STACK_SIZE).unwrap();
    assert!(process.wait_for_exit(Some(EXIT_TIMEOUT)));

    assert_eq!(
        *log.lock(),
        vec![
            (0, 0x0100_0000_0000_1000),
            (0, heap_base),
            (0, 0),
            (raw(ResultCode::OUT_OF_RANGE), 0),
            (raw(ResultCode::INVALID_ENUM_VALUE), 0),
            (raw(ResultCode::INVALID_HANDLE), 0),
        ]
    );
}

#[test]
fn test_query_memory_writes_guest_record() {
    let harness = Harness::new();
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let base = map_heap(ctx)?;
        let record = base + 0x1000;
        ctx.regs[0] = record;
        ctx.regs[2] = base + 0x10;
        ctx.svc(number::QUERY_MEMORY)?;
        let result = ctx.regs[0];

        let bytes = ctx.read_memory(record, 0x28)?;
        let word = |offset: usize| u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap_or([0; 8]));
        let half = |offset: usize| u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap_or([0; 4]));
        entries.lock().push((result, word(0) == base, word(8), half(0x10), half(0x18)));
        Ok(())
    });

    // Heap is state Normal (5) with read/write permission
    assert_eq!(*log.lock(), vec![(0, true, HEAP_SIZE_ALIGNMENT, 5, 3)]);
}

#[test]
fn test_connect_to_named_port_reads_name_from_memory() {
    let harness = Harness::new();
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let base = map_heap(ctx)?;
        ctx.write_memory(base, b"sm:\0")?;
        ctx.regs[1] = base;
        ctx.svc(number::CONNECT_TO_NAMED_PORT)?;
        entries.lock().push((ctx.regs[0], ctx.regs[1] != 0));

        ctx.write_memory(base, b"nowhere\0")?;
        ctx.regs[1] = base;
        ctx.svc(number::CONNECT_TO_NAMED_PORT)?;
        entries.lock().push((ctx.regs[0], true));
        Ok(())
    });

    assert_eq!(*log.lock(), vec![(0, true), (raw(ResultCode::NOT_FOUND), true)]);
}

#[test]
fn test_break_notification_returns_and_fatal_break_terminates() {
    let harness = Harness::new();
    let log = journal();

    let entries = log.clone();
    let process = harness.run(move |ctx| {
        ctx.regs[0] = 0x8000_0000;
        ctx.svc(number::BREAK)?;
        entries.lock().push(format!("notification -> {:#x}", ctx.regs[0]));

        ctx.regs[0] = 1;
        let outcome = ctx.svc(number::BREAK);
        entries.lock().push(format!("fatal -> {:?}", outcome));
        outcome
    });

    assert_eq!(process.state(), ProcessState::Exited);
    assert_eq!(
        *log.lock(),
        vec!["notification -> 0x0".to_string(), "fatal -> Err(TerminationRequested)".to_string()]
    );
}
