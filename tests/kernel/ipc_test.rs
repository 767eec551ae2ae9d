/*!
 * IPC Tests
 * Guest sessions through sm:, command dispatch, domains and handle transfer
 */

use crate::harness::{heap, journal, Harness};
use hle_kernel::ipc::{
    parse_response, CommandMap, CommandTable, IpcService, ParsedResponse, RequestBuilder, RequestContext,
    ServiceName, ServiceResult,
};
use hle_kernel::{
    FirmwareVersion, Handle, KernelConfig, KernelError, KernelResult, ResultCode, ThreadContext, VersionRange,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const ADD: u32 = 0;
const OPEN_CHILD: u32 = 1;
const GENERATION: u32 = 2;
const RESERVED: u32 = 3;
const REVERSE: u32 = 4;
const CLIENT_PID: u32 = 5;
const BOUNCE: u32 = 6;

/// Test service keeping a running total per object
struct Calc {
    total: AtomicU32,
    commands: CommandMap<Calc>,
}

impl Calc {
    fn commands() -> CommandTable<Calc> {
        CommandTable::new()
            .with(ADD, "Add", Self::add)
            .with(OPEN_CHILD, "OpenChild", Self::open_child)
            .with_versioned(
                GENERATION,
                "LegacyGeneration",
                VersionRange::until(FirmwareVersion::new(9, 2, 0)),
                Self::legacy_generation,
            )
            .with_versioned(
                GENERATION,
                "Generation",
                VersionRange::since(FirmwareVersion::new(10, 0, 0)),
                Self::generation,
            )
            .with_stub(RESERVED, "Reserved")
            .with(REVERSE, "Reverse", Self::reverse)
            .with(CLIENT_PID, "ClientPid", Self::client_pid)
            .with(BOUNCE, "Bounce", Self::bounce)
    }

    fn new(firmware: FirmwareVersion) -> Self {
        Self {
            total: AtomicU32::new(0),
            commands: Self::commands().build(firmware),
        }
    }

    fn add(&self, ctx: &mut RequestContext<'_>) -> ServiceResult {
        let a = ctx.pop_u32()?;
        let b = ctx.pop_u32()?;
        let total = self.total.fetch_add(a + b, Ordering::SeqCst) + a + b;
        ctx.push_u32(a + b);
        ctx.push_u32(total);
        Ok(())
    }

    fn open_child(&self, ctx: &mut RequestContext<'_>) -> ServiceResult {
        let child: Arc<dyn IpcService> = Arc::new(Calc::new(ctx.firmware_version()));
        ctx.push_interface(child);
        Ok(())
    }

    fn legacy_generation(&self, ctx: &mut RequestContext<'_>) -> ServiceResult {
        ctx.push_u32(1);
        Ok(())
    }

    fn generation(&self, ctx: &mut RequestContext<'_>) -> ServiceResult {
        ctx.push_u32(2);
        Ok(())
    }

    fn reverse(&self, ctx: &mut RequestContext<'_>) -> ServiceResult {
        let mut data = ctx.read_buffer(0)?;
        data.reverse();
        let written = ctx.write_buffer(0, &data)?;
        ctx.push_u32(written as u32);
        Ok(())
    }

    fn client_pid(&self, ctx: &mut RequestContext<'_>) -> ServiceResult {
        ctx.push_u64(ctx.pid());
        Ok(())
    }

    fn bounce(&self, ctx: &mut RequestContext<'_>) -> ServiceResult {
        let object = ctx.take_move_object(0)?;
        ctx.push_copy_object(object);
        Ok(())
    }
}

impl IpcService for Calc {
    fn service_name(&self) -> &str {
        "calc"
    }

    fn handle_request(&self, ctx: &mut RequestContext<'_>) -> ServiceResult {
        self.commands.dispatch(self, "calc", ctx)
    }
}

fn boot(config: KernelConfig) -> Harness {
    let harness = Harness::with_config(config);
    harness
        .kernel
        .service_manager()
        .register(
            "calc",
            Arc::new(|firmware: FirmwareVersion| -> Arc<dyn IpcService> { Arc::new(Calc::new(firmware)) }),
        )
        .unwrap();
    harness
}

fn ipc_error(code: ResultCode) -> KernelError {
    KernelError::Result(code)
}

/// Write a request to the TLS buffer, send it and parse the reply
fn send(ctx: &ThreadContext, session: Handle, request: RequestBuilder, is_domain: bool) -> KernelResult<ParsedResponse> {
    let bytes = request.build().map_err(|err| ipc_error(err.result_code()))?;
    ctx.write_message(&bytes)?;
    ctx.send_sync_request(session)?;
    let reply = ctx.read_message()?;
    parse_response(&reply, is_domain).map_err(|err| ipc_error(err.result_code()))
}

fn connect_sm(ctx: &ThreadContext) -> KernelResult<Handle> {
    let sm = ctx.connect_to_named_port("sm:")?;
    send(ctx, sm, RequestBuilder::new(0).with_pid(0), false)?;
    Ok(sm)
}

fn get_service(ctx: &ThreadContext, sm: Handle, name: &str) -> KernelResult<ParsedResponse> {
    let name = ServiceName::new(name).map_err(ipc_error)?;
    send(ctx, sm, RequestBuilder::new(1).push_u64(name.raw()), false)
}

fn open(ctx: &ThreadContext, name: &str) -> KernelResult<Handle> {
    let sm = connect_sm(ctx)?;
    let reply = get_service(ctx, sm, name)?;
    reply.move_handles.first().copied().ok_or(ipc_error(reply.result))
}

#[test]
fn test_service_reached_through_sm() {
    let harness = boot(KernelConfig::default());
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let calc = open(ctx, "calc")?;
        for (a, b) in [(2, 3), (10, 1)] {
            let reply = send(ctx, calc, RequestBuilder::new(ADD).push_u32(a).push_u32(b), false)?;
            entries.lock().push((reply.result, reply.read_u32(0), reply.read_u32(4)));
        }
        Ok(())
    });

    assert_eq!(
        *log.lock(),
        vec![
            (ResultCode::SUCCESS, Some(5), Some(5)),
            (ResultCode::SUCCESS, Some(11), Some(16)),
        ]
    );
}

#[test]
fn test_sm_requires_initialize_and_registered_names() {
    let harness = boot(KernelConfig::default());
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let sm = ctx.connect_to_named_port("sm:")?;
        let early = get_service(ctx, sm, "calc")?;
        entries.lock().push((early.result, early.move_handles.len()));

        send(ctx, sm, RequestBuilder::new(0).with_pid(0), false)?;
        let missing = get_service(ctx, sm, "nothere")?;
        entries.lock().push((missing.result, missing.move_handles.len()));

        let found = get_service(ctx, sm, "calc")?;
        entries.lock().push((found.result, found.move_handles.len()));
        Ok(())
    });

    assert_eq!(
        *log.lock(),
        vec![
            (ResultCode::SM_INVALID_CLIENT, 0),
            (ResultCode::SM_NOT_REGISTERED, 0),
            (ResultCode::SUCCESS, 1),
        ]
    );
}

#[test]
fn test_unknown_and_stubbed_commands() {
    let harness = boot(KernelConfig::default());
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let calc = open(ctx, "calc")?;
        for id in [99, RESERVED] {
            entries.lock().push(send(ctx, calc, RequestBuilder::new(id), false)?.result);
        }
        Ok(())
    });

    assert_eq!(*log.lock(), vec![ResultCode::CMIF_UNKNOWN_COMMAND_ID, ResultCode::NOT_IMPLEMENTED]);
}

#[test]
fn test_failed_command_keeps_moved_handles() {
    let harness = boot(KernelConfig::default());
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let calc = open(ctx, "calc")?;
        let (_, readable) = ctx.create_event()?;
        let handles_before = ctx.process().handle_count();

        for id in [99, RESERVED] {
            let reply = send(ctx, calc, RequestBuilder::new(id).with_move_handle(readable), false)?;
            entries.lock().push(format!("{:?}", reply.result));
        }
        entries.lock().push(format!("handles unchanged: {}", ctx.process().handle_count() == handles_before));
        entries.lock().push(format!("close: {:?}", ctx.close_handle(readable)));
        Ok(())
    });

    assert_eq!(
        *log.lock(),
        vec![
            format!("{:?}", ResultCode::CMIF_UNKNOWN_COMMAND_ID),
            format!("{:?}", ResultCode::NOT_IMPLEMENTED),
            "handles unchanged: true".to_string(),
            "close: Ok(())".to_string(),
        ]
    );
}

#[test]
fn test_versioned_commands_follow_firmware() {
    for (firmware, generation, detach) in [
        (FirmwareVersion::new(9, 1, 0), Some(1), ResultCode::CMIF_UNKNOWN_COMMAND_ID),
        (FirmwareVersion::new(16, 0, 0), Some(2), ResultCode::SUCCESS),
    ] {
        let harness = boot(KernelConfig::default().with_firmware_version(firmware));
        let log = journal();

        let entries = log.clone();
        harness.run(move |ctx| {
            let sm = connect_sm(ctx)?;
            let calc = get_service(ctx, sm, "calc")?
                .move_handles
                .first()
                .copied()
                .ok_or(ipc_error(ResultCode::NOT_FOUND))?;
            let reply = send(ctx, calc, RequestBuilder::new(GENERATION), false)?;
            let detached = send(ctx, sm, RequestBuilder::new(4), false)?;
            entries.lock().push((reply.read_u32(0), detached.result));
            Ok(())
        });

        assert_eq!(*log.lock(), vec![(generation, detach)], "firmware {}", firmware);
    }
}

#[test]
fn test_request_pid_defaults_to_client() {
    let harness = boot(KernelConfig::default());
    let log = journal();

    let entries = log.clone();
    let process = harness.run(move |ctx| {
        let calc = open(ctx, "calc")?;
        let sent = send(ctx, calc, RequestBuilder::new(CLIENT_PID).with_pid(0x1234), false)?;
        let implied = send(ctx, calc, RequestBuilder::new(CLIENT_PID), false)?;
        entries.lock().push((sent.read_u64(0), implied.read_u64(0)));
        Ok(())
    });

    assert_eq!(*log.lock(), vec![(Some(0x1234), Some(process.pid()))]);
}

#[test]
fn test_domain_objects_are_addressed_by_id() {
    let harness = boot(KernelConfig::default());
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let calc = open(ctx, "calc")?;
        let converted = send(ctx, calc, RequestBuilder::control(0), false)?;
        entries.lock().push(format!("converted -> {:?}", converted.read_u32(0)));

        let sum = send(ctx, calc, RequestBuilder::new(ADD).push_u32(1).push_u32(2).with_domain_object(1), true)?;
        entries.lock().push(format!("object 1 total {:?}", sum.read_u32(4)));

        let opened = send(ctx, calc, RequestBuilder::new(OPEN_CHILD).with_domain_object(1), true)?;
        let child = opened.domain_objects(0);
        entries.lock().push(format!("child ids {:?}", child));

        let sum = send(ctx, calc, RequestBuilder::new(ADD).push_u32(7).push_u32(0).with_domain_object(2), true)?;
        entries.lock().push(format!("object 2 total {:?}", sum.read_u32(4)));

        let closed = send(ctx, calc, RequestBuilder::close_domain_object(2), true)?;
        entries.lock().push(format!("close -> {}", closed.result == ResultCode::SUCCESS));

        let gone = send(ctx, calc, RequestBuilder::new(ADD).push_u32(0).push_u32(0).with_domain_object(2), true)?;
        entries.lock().push(format!("after close -> {}", gone.result == ResultCode::CMIF_TARGET_NOT_FOUND));

        let again = send(ctx, calc, RequestBuilder::control(0), false)?;
        entries.lock().push(format!("convert twice -> {}", again.result == ResultCode::INVALID_STATE));
        Ok(())
    });

    assert_eq!(
        *log.lock(),
        vec![
            "converted -> Some(1)",
            "object 1 total Some(3)",
            "child ids [2]",
            "object 2 total Some(7)",
            "close -> true",
            "after close -> true",
            "convert twice -> true",
        ]
    );
}

#[test]
fn test_control_commands() {
    let harness = boot(KernelConfig::default());
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let calc = open(ctx, "calc")?;
        let size = send(ctx, calc, RequestBuilder::control(3), false)?;
        entries.lock().push(size.read_u32(0).map(|word| word & 0xFFFF));

        send(ctx, calc, RequestBuilder::new(ADD).push_u32(4).push_u32(4), false)?;
        let cloned = send(ctx, calc, RequestBuilder::control(2), false)?;
        let clone = cloned.move_handles.first().copied().ok_or(ipc_error(cloned.result))?;
        // The clone reaches the same object
        let sum = send(ctx, clone, RequestBuilder::new(ADD).push_u32(1).push_u32(1), false)?;
        entries.lock().push(sum.read_u32(4));
        Ok(())
    });

    assert_eq!(*log.lock(), vec![Some(0x8000), Some(10)]);
}

#[test]
fn test_close_ends_session() {
    let harness = boot(KernelConfig::default());
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let calc = open(ctx, "calc")?;
        let bytes = RequestBuilder::close().build().map_err(|err| ipc_error(err.result_code()))?;
        ctx.write_message(&bytes)?;
        entries.lock().push(ctx.send_sync_request(calc));
        entries.lock().push(ctx.send_sync_request(calc));
        Ok(())
    });

    assert_eq!(*log.lock(), vec![Ok(()), Err(KernelError::SessionClosed)]);
}

#[test]
fn test_buffers_are_copied_through_guest_memory() {
    let harness = boot(KernelConfig::default());
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let calc = open(ctx, "calc")?;
        let base = heap(ctx)?;
        ctx.write_memory(base, b"hello")?;

        let request = RequestBuilder::new(REVERSE)
            .with_in_buffer(base, 5)
            .with_out_buffer(base + 0x100, 3);
        let reply = send(ctx, calc, request, false)?;
        let out = ctx.read_memory(base + 0x100, 3)?;
        entries.lock().push(format!("{:?} {}", reply.read_u32(0), String::from_utf8_lossy(&out)));

        // Unmapped buffers fail the syscall before the service runs
        let bad = RequestBuilder::new(REVERSE).with_in_buffer(0x10, 5).build().map_err(|err| ipc_error(err.result_code()))?;
        ctx.write_message(&bad)?;
        entries.lock().push(format!("{:?}", ctx.send_sync_request(calc)));
        Ok(())
    });

    assert_eq!(
        *log.lock(),
        vec![
            "Some(3) oll".to_string(),
            format!("{:?}", Err::<(), _>(KernelError::Result(ResultCode::INVALID_POINTER))),
        ]
    );
}

#[test]
fn test_move_handle_transfers_ownership() {
    let harness = boot(KernelConfig::default());
    let log = journal();

    let entries = log.clone();
    harness.run(move |ctx| {
        let calc = open(ctx, "calc")?;
        let (writable, readable) = ctx.create_event()?;
        let reply = send(ctx, calc, RequestBuilder::new(BOUNCE).with_move_handle(readable), false)?;
        let returned = reply.copy_handles.first().copied().ok_or(ipc_error(reply.result))?;

        entries.lock().push(ctx.close_handle(readable).is_err());
        ctx.signal_event(writable)?;
        entries.lock().push(ctx.wait_synchronization(&[returned], 0).is_ok());
        Ok(())
    });

    assert_eq!(*log.lock(), vec![true, true]);
}
