/*!
 * Address Arbiter
 * WaitForAddress / SignalToAddress on 32-bit guest words
 */

use super::process::KProcess;
use super::scheduler::{KScheduler, SchedulerState, WaitKind};
use super::synchronization::deadline_from_ns;
use super::thread::KThread;
use crate::core::errors::{KernelError, ResultCode};
use crate::core::types::{KernelResult, Pid, Tid, VAddr};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArbitrationType {
    WaitIfLessThan = 0,
    DecrementAndWaitIfLessThan = 1,
    WaitIfEqual = 2,
}

impl ArbitrationType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::WaitIfLessThan),
            1 => Some(Self::DecrementAndWaitIfLessThan),
            2 => Some(Self::WaitIfEqual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalType {
    Signal = 0,
    SignalAndIncrementIfEqual = 1,
    SignalAndModifyByWaitingCountIfEqual = 2,
}

impl SignalType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Signal),
            1 => Some(Self::SignalAndIncrementIfEqual),
            2 => Some(Self::SignalAndModifyByWaitingCountIfEqual),
            _ => None,
        }
    }
}

fn invalid_state() -> KernelError {
    KernelError::Result(ResultCode::INVALID_STATE)
}

fn invalid_memory() -> KernelError {
    KernelError::Result(ResultCode::INVALID_CURRENT_MEMORY)
}

fn check_address(address: VAddr) -> KernelResult<()> {
    if address % 4 != 0 {
        return Err(KernelError::Result(ResultCode::INVALID_ADDRESS));
    }
    Ok(())
}

/// Block on `address` when its value passes the arbitration check
pub fn wait_for_address(
    scheduler: &KScheduler,
    process: &KProcess,
    thread: &KThread,
    address: VAddr,
    arbitration: ArbitrationType,
    value: i32,
    timeout_ns: i64,
) -> KernelResult<()> {
    check_address(address)?;
    let state = scheduler.lock();
    let page_table = process.page_table();
    let current = page_table.read_u32(address).map_err(|_| invalid_memory())? as i32;

    let should_wait = match arbitration {
        ArbitrationType::WaitIfLessThan => current < value,
        ArbitrationType::DecrementAndWaitIfLessThan => {
            let waits = current < value;
            if waits {
                page_table
                    .write_u32(address, current.wrapping_sub(1) as u32)
                    .map_err(|_| invalid_memory())?;
            }
            waits
        }
        ArbitrationType::WaitIfEqual => current == value,
    };
    if !should_wait {
        return Err(invalid_state());
    }
    if timeout_ns == 0 {
        return Err(KernelError::TimedOut);
    }

    scheduler
        .block(state, thread, WaitKind::Address { address }, deadline_from_ns(timeout_ns))
        .map(|_| ())
}

fn address_waiters(state: &SchedulerState, pid: Pid, address: VAddr) -> Vec<Tid> {
    state.waiters(pid, |kind| matches!(kind, WaitKind::Address { address: a } if *a == address))
}

fn wake(state: &mut SchedulerState, waiters: &[Tid], count: i32) {
    let take = if count <= 0 { waiters.len() } else { (count as usize).min(waiters.len()) };
    for &tid in &waiters[..take] {
        state.resolve_wait(tid, Ok(0));
    }
}

/// Wake up to `count` waiters on `address` (all when `count <= 0`), after
/// an optional conditional update of the word
pub fn signal_to_address(
    scheduler: &KScheduler,
    process: &KProcess,
    address: VAddr,
    signal: SignalType,
    value: i32,
    count: i32,
) -> KernelResult<()> {
    check_address(address)?;
    let mut state = scheduler.lock();
    let waiters = address_waiters(&state, process.pid(), address);
    let page_table = process.page_table();

    let update = match signal {
        SignalType::Signal => None,
        SignalType::SignalAndIncrementIfEqual => Some(value.wrapping_add(1)),
        SignalType::SignalAndModifyByWaitingCountIfEqual => {
            let waiting = waiters.len();
            let next = if count <= 0 {
                if waiting > 0 {
                    value.wrapping_sub(2)
                } else {
                    value.wrapping_add(1)
                }
            } else if waiting == 0 {
                value.wrapping_add(1)
            } else if waiting <= count as usize {
                value.wrapping_sub(1)
            } else {
                value
            };
            Some(next)
        }
    };

    if let Some(next) = update {
        let current = page_table.read_u32(address).map_err(|_| invalid_memory())? as i32;
        if current != value {
            return Err(invalid_state());
        }
        page_table
            .write_u32(address, next as u32)
            .map_err(|_| invalid_memory())?;
    }

    wake(&mut state, &waiters, count);
    Ok(())
}
