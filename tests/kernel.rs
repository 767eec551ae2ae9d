/*!
 * Kernel integration tests entry point
 */

#[path = "kernel/harness.rs"]
mod harness;

#[path = "kernel/handle_table_test.rs"]
mod handle_table_test;

#[path = "kernel/scheduler_test.rs"]
mod scheduler_test;

#[path = "kernel/sync_test.rs"]
mod sync_test;

#[path = "kernel/process_test.rs"]
mod process_test;

#[path = "kernel/ipc_test.rs"]
mod ipc_test;

#[path = "kernel/svc_abi_test.rs"]
mod svc_abi_test;
