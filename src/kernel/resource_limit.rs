/*!
 * Resource Limits
 * Per-process quotas for memory, threads, events, transfer memories and sessions
 */

use crate::core::errors::{KernelError, ResultCode};
use crate::core::types::KernelResult;
use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Resource kinds a limit tracks, in GetResourceLimit* numbering
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitableResource {
    PhysicalMemory = 0,
    Threads = 1,
    Events = 2,
    TransferMemories = 3,
    Sessions = 4,
}

impl LimitableResource {
    pub const COUNT: usize = 5;

    pub const ALL: [LimitableResource; Self::COUNT] = [
        LimitableResource::PhysicalMemory,
        LimitableResource::Threads,
        LimitableResource::Events,
        LimitableResource::TransferMemories,
        LimitableResource::Sessions,
    ];

    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    pub fn name(&self) -> &'static str {
        match self {
            LimitableResource::PhysicalMemory => "physical_memory",
            LimitableResource::Threads => "threads",
            LimitableResource::Events => "events",
            LimitableResource::TransferMemories => "transfer_memories",
            LimitableResource::Sessions => "sessions",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Counter {
    limit: u64,
    current: u64,
    peak: u64,
}

/// Resource limit shared by a process and the objects it creates
#[derive(Debug)]
pub struct KResourceLimit {
    counters: Mutex<[Counter; LimitableResource::COUNT]>,
}

impl KResourceLimit {
    /// Limit with every resource unbounded
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(
                [Counter {
                    limit: u64::MAX,
                    current: 0,
                    peak: 0,
                }; LimitableResource::COUNT],
            ),
        }
    }

    pub fn with_limit(self, resource: LimitableResource, limit: u64) -> Self {
        self.counters.lock()[resource as usize].limit = limit;
        self
    }

    /// Change a limit; fails if current usage already exceeds it
    pub fn set_limit(&self, resource: LimitableResource, limit: u64) -> KernelResult<()> {
        let mut counters = self.counters.lock();
        let counter = &mut counters[resource as usize];
        if counter.current > limit {
            return Err(KernelError::Result(ResultCode::INVALID_STATE));
        }
        counter.limit = limit;
        Ok(())
    }

    /// Reserve `amount` units, failing with LimitReached if it would exceed the limit
    pub fn reserve(&self, resource: LimitableResource, amount: u64) -> KernelResult<()> {
        let mut counters = self.counters.lock();
        let counter = &mut counters[resource as usize];
        let requested = counter.current.saturating_add(amount);
        if requested > counter.limit {
            warn!(
                "Resource limit reached for {}: current {}, requested {}, limit {}",
                resource.name(),
                counter.current,
                amount,
                counter.limit
            );
            return Err(KernelError::LimitReached {
                resource: resource.name(),
                requested: amount,
                limit: counter.limit,
            });
        }
        counter.current = requested;
        counter.peak = counter.peak.max(requested);
        Ok(())
    }

    pub fn release(&self, resource: LimitableResource, amount: u64) {
        let mut counters = self.counters.lock();
        let counter = &mut counters[resource as usize];
        counter.current = counter.current.saturating_sub(amount);
    }

    pub fn limit(&self, resource: LimitableResource) -> u64 {
        self.counters.lock()[resource as usize].limit
    }

    pub fn current(&self, resource: LimitableResource) -> u64 {
        self.counters.lock()[resource as usize].current
    }

    pub fn peak(&self, resource: LimitableResource) -> u64 {
        self.counters.lock()[resource as usize].peak
    }

    pub fn available(&self, resource: LimitableResource) -> u64 {
        let counters = self.counters.lock();
        let counter = &counters[resource as usize];
        counter.limit.saturating_sub(counter.current)
    }
}

impl Default for KResourceLimit {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_release() {
        let limit = KResourceLimit::new().with_limit(LimitableResource::Threads, 2);
        assert!(limit.reserve(LimitableResource::Threads, 1).is_ok());
        assert!(limit.reserve(LimitableResource::Threads, 1).is_ok());
        let err = limit.reserve(LimitableResource::Threads, 1).unwrap_err();
        assert_eq!(err.result_code(), ResultCode::LIMIT_REACHED);
        assert_eq!(limit.current(LimitableResource::Threads), 2);

        limit.release(LimitableResource::Threads, 1);
        assert_eq!(limit.current(LimitableResource::Threads), 1);
        assert_eq!(limit.peak(LimitableResource::Threads), 2);
        assert_eq!(limit.available(LimitableResource::Threads), 1);
    }

    #[test]
    fn test_set_limit_below_usage_fails() {
        let limit = KResourceLimit::new();
        limit.reserve(LimitableResource::Events, 3).unwrap();
        assert!(limit.set_limit(LimitableResource::Events, 2).is_err());
        assert!(limit.set_limit(LimitableResource::Events, 3).is_ok());
    }
}
