/*!
 * Execution Engines
 * Boundary between the kernel and whatever runs guest code on a host thread
 */

use super::context::ThreadContext;
use crate::core::errors::KernelError;
use crate::core::types::{KernelResult, VAddr};
use ahash::RandomState;
use dashmap::DashMap;
use log::debug;
use std::sync::Arc;

/// Runs guest code for one thread until it exits
///
/// Implementations call back into the kernel through the context; returning
/// (with `Ok` or any error) ends the thread.
pub trait ExecutionEngine: Send + Sync {
    fn run(&self, ctx: &mut ThreadContext) -> KernelResult<()>;
}

/// Host function standing in for guest code at an entry address
pub type HleEntry = Arc<dyn Fn(&mut ThreadContext) -> KernelResult<()> + Send + Sync>;

/// Engine that dispatches thread entry points to registered host closures
#[derive(Default)]
pub struct HleEntryTable {
    entries: DashMap<VAddr, HleEntry, RandomState>,
}

impl HleEntryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `entry` to a guest entry address, replacing any previous binding
    pub fn register<F>(&self, address: VAddr, entry: F)
    where
        F: Fn(&mut ThreadContext) -> KernelResult<()> + Send + Sync + 'static,
    {
        self.entries.insert(address, Arc::new(entry));
    }

    pub fn unregister(&self, address: VAddr) -> bool {
        self.entries.remove(&address).is_some()
    }

    pub fn contains(&self, address: VAddr) -> bool {
        self.entries.contains_key(&address)
    }
}

impl ExecutionEngine for HleEntryTable {
    fn run(&self, ctx: &mut ThreadContext) -> KernelResult<()> {
        let entry = self
            .entries
            .get(&ctx.pc)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| KernelError::NotImplemented(format!("no code at entry 0x{:x}", ctx.pc)))?;
        debug!("Thread {} entering HLE code at 0x{:x}", ctx.thread().tid(), ctx.pc);
        entry(ctx)
    }
}
