/*!
 * Scheduler State
 * Thread records, per-core queues and core ownership, guarded by one lock
 */

use super::queue::PriorityQueue;
use crate::core::errors::KernelError;
use crate::core::types::{CoreMask, Handle, KernelResult, Pid, Priority, Tid, VAddr};
use crate::kernel::object::{KernelObject, SyncObject};
use crate::kernel::thread::{KThread, ThreadState};
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// What a blocked thread is waiting for
#[derive(Debug, Clone)]
pub(crate) enum WaitKind {
    Sleep,
    Synchronization { objects: Vec<KernelObject> },
    /// Waiting to own the mutex word at `address`; `tag` is written there on handoff
    Mutex { address: VAddr, tag: Handle, owner: Tid },
    ConditionVariable { key: VAddr, address: VAddr, tag: Handle },
    Address { address: VAddr },
}

#[derive(Debug)]
pub(crate) struct Wait {
    pub kind: WaitKind,
    pub seq: u64,
}

pub(crate) struct ThreadRecord {
    pub thread: Arc<KThread>,
    pub pid: Pid,
    pub state: ThreadState,
    pub priority: Priority,
    pub ideal_core: usize,
    pub affinity: CoreMask,
    pub active_core: usize,
    pub wait: Option<Wait>,
    pub wait_result: Option<KernelResult<usize>>,
    pub terminate_requested: bool,
    pub pause_requested: bool,
    pub sync_cancelled: bool,
}

#[derive(Debug)]
pub(super) struct CoreState {
    pub holder: Option<Tid>,
    pub granted_at: Instant,
}

pub(crate) struct SchedulerState {
    pub(super) threads: HashMap<Tid, ThreadRecord>,
    pub(super) queues: Vec<PriorityQueue>,
    pub(super) cores: Vec<CoreState>,
    /// Exited threads, kept until their process finalizes
    pub(super) terminated: HashMap<Tid, Pid>,
    next_wait_seq: u64,
    pub(super) context_switches: u64,
}

impl SchedulerState {
    pub fn new(core_count: usize) -> Self {
        let now = Instant::now();
        Self {
            threads: HashMap::new(),
            queues: (0..core_count).map(|_| PriorityQueue::new()).collect(),
            cores: (0..core_count)
                .map(|_| CoreState {
                    holder: None,
                    granted_at: now,
                })
                .collect(),
            terminated: HashMap::new(),
            next_wait_seq: 0,
            context_switches: 0,
        }
    }

    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    pub fn record(&self, tid: Tid) -> Option<&ThreadRecord> {
        self.threads.get(&tid)
    }

    pub fn record_mut(&mut self, tid: Tid) -> Option<&mut ThreadRecord> {
        self.threads.get_mut(&tid)
    }

    pub fn holder(&self, core: usize) -> Option<Tid> {
        self.cores.get(core).and_then(|core| core.holder)
    }

    pub(super) fn next_seq(&mut self) -> u64 {
        self.next_wait_seq += 1;
        self.next_wait_seq
    }

    pub(super) fn enqueue(&mut self, tid: Tid) {
        if let Some(record) = self.threads.get(&tid) {
            self.queues[record.active_core].push_back(record.priority, tid);
        }
    }

    pub(super) fn dequeue(&mut self, tid: Tid) {
        if let Some(record) = self.threads.get(&tid) {
            self.queues[record.active_core].remove(record.priority, tid);
        }
    }

    pub(super) fn rotate(&mut self, tid: Tid) {
        if let Some(record) = self.threads.get(&tid) {
            self.queues[record.active_core].rotate(record.priority, tid);
        }
    }

    /// First core in `mask`, preferring `preferred`
    fn pick_core(&self, mask: CoreMask, preferred: usize) -> usize {
        if preferred < self.cores.len() && mask & (1 << preferred) != 0 {
            return preferred;
        }
        (0..self.cores.len()).find(|core| mask & (1 << core) != 0).unwrap_or(0)
    }

    /// Put a thread in its core's queue and hand out any idle core
    pub fn make_ready(&mut self, tid: Tid) {
        let core_count = self.cores.len();
        let Some(record) = self.threads.get(&tid) else {
            return;
        };
        let (affinity, ideal, mut core) = (record.affinity, record.ideal_core, record.active_core);

        if affinity & (1 << core) == 0 {
            core = self.pick_core(affinity, ideal);
        }
        if self.cores[core].holder.is_some() {
            if let Some(idle) = (0..core_count).find(|&c| affinity & (1 << c) != 0 && self.cores[c].holder.is_none()) {
                core = idle;
            }
        }

        if let Some(record) = self.threads.get_mut(&tid) {
            record.state = ThreadState::Ready;
            record.active_core = core;
        }
        self.enqueue(tid);
        self.grant(core);
    }

    /// Give an idle core to its best queued thread, stealing if its queue is empty
    pub(super) fn grant(&mut self, core: usize) {
        if self.cores[core].holder.is_some() {
            return;
        }
        let Some(tid) = self.queues[core].front().or_else(|| self.steal_for(core)) else {
            return;
        };
        self.cores[core].holder = Some(tid);
        self.cores[core].granted_at = Instant::now();
        self.context_switches += 1;
        if let Some(record) = self.threads.get_mut(&tid) {
            record.state = ThreadState::Running;
            record.thread.wake.notify_one();
        }
    }

    /// Move the best ready, non-running thread that may run on `core` into its queue
    fn steal_for(&mut self, core: usize) -> Option<Tid> {
        let mut best: Option<(Priority, Tid)> = None;
        for (other, queue) in self.queues.iter().enumerate() {
            if other == core {
                continue;
            }
            let holder = self.cores[other].holder;
            for tid in queue.iter() {
                if Some(tid) == holder {
                    continue;
                }
                let Some(record) = self.threads.get(&tid) else {
                    continue;
                };
                if record.affinity & (1 << core) == 0 {
                    continue;
                }
                if best.map_or(true, |(priority, _)| record.priority < priority) {
                    best = Some((record.priority, tid));
                }
                break;
            }
        }
        let (_, tid) = best?;
        self.dequeue(tid);
        if let Some(record) = self.threads.get_mut(&tid) {
            debug!("Core {} steals thread {} from core {}", core, tid, record.active_core);
            record.active_core = core;
        }
        self.enqueue(tid);
        Some(tid)
    }

    /// Give up the core if `tid` holds it
    pub(super) fn release_core(&mut self, tid: Tid) {
        let Some(record) = self.threads.get(&tid) else {
            return;
        };
        let core = record.active_core;
        if self.cores[core].holder == Some(tid) {
            self.cores[core].holder = None;
            self.grant(core);
        }
    }

    /// Running thread yields its core to the queue front
    pub(super) fn hand_over(&mut self, tid: Tid) {
        let Some(record) = self.threads.get_mut(&tid) else {
            return;
        };
        record.state = ThreadState::Ready;
        let core = record.active_core;
        if self.cores[core].holder == Some(tid) {
            self.cores[core].holder = None;
        }
        self.grant(core);
    }

    /// Take a thread out of scheduling (pause)
    pub(super) fn suspend(&mut self, tid: Tid) {
        self.dequeue(tid);
        self.release_core(tid);
        if let Some(record) = self.threads.get_mut(&tid) {
            record.state = ThreadState::Paused;
        }
    }

    /// Move a queued thread to `core`
    pub(super) fn migrate(&mut self, tid: Tid, core: usize) {
        self.dequeue(tid);
        self.release_core(tid);
        if let Some(record) = self.threads.get_mut(&tid) {
            debug!("Thread {} migrates from core {} to core {}", tid, record.active_core, core);
            record.active_core = core;
            record.state = ThreadState::Ready;
        }
        self.enqueue(tid);
        self.grant(core);
    }

    /// Preferred core for a thread whose current core is outside its mask
    pub(super) fn migration_target(&self, tid: Tid) -> Option<usize> {
        let record = self.threads.get(&tid)?;
        if record.affinity & (1 << record.active_core) != 0 {
            return None;
        }
        Some(self.pick_core(record.affinity, record.ideal_core))
    }

    /// Remove a thread from every scheduling structure
    pub(super) fn unlink(&mut self, tid: Tid) -> Option<ThreadRecord> {
        if self.threads.get(&tid).map_or(false, |record| record.state.is_queued()) {
            self.dequeue(tid);
        }
        let record = self.threads.remove(&tid)?;
        let core = record.active_core;
        if self.cores[core].holder == Some(tid) {
            self.cores[core].holder = None;
            self.grant(core);
        }
        Some(record)
    }

    /// End a thread's wait with `result` and make it runnable (or paused)
    pub fn resolve_wait(&mut self, tid: Tid, result: KernelResult<usize>) {
        let Some(record) = self.threads.get_mut(&tid) else {
            return;
        };
        let Some(wait) = record.wait.take() else {
            return;
        };
        record.wait_result = Some(result);
        let paused = record.pause_requested;
        record.thread.wake.notify_one();
        drop(wait);

        if paused {
            if let Some(record) = self.threads.get_mut(&tid) {
                record.state = ThreadState::Paused;
            }
        } else {
            self.make_ready(tid);
        }
    }

    /// Begin a wait; the caller then releases the core via `block`
    pub(super) fn begin_wait(&mut self, tid: Tid, kind: WaitKind) {
        let seq = self.next_seq();
        self.dequeue(tid);
        if let Some(record) = self.threads.get_mut(&tid) {
            record.wait = Some(Wait { kind, seq });
            record.wait_result = None;
            record.state = ThreadState::WaitingSync;
        }
        self.release_core(tid);
    }

    /// Threads of `pid` whose wait matches `filter`, highest priority first, FIFO within a priority
    pub fn waiters<F>(&self, pid: Pid, filter: F) -> Vec<Tid>
    where
        F: Fn(&WaitKind) -> bool,
    {
        let mut found: Vec<(Priority, u64, Tid)> = self
            .threads
            .iter()
            .filter(|(_, record)| record.pid == pid)
            .filter_map(|(tid, record)| {
                record
                    .wait
                    .as_ref()
                    .filter(|wait| filter(&wait.kind))
                    .map(|wait| (record.priority, wait.seq, *tid))
            })
            .collect();
        found.sort_unstable();
        found.into_iter().map(|(_, _, tid)| tid).collect()
    }

    pub fn wait_kind(&self, tid: Tid) -> Option<&WaitKind> {
        self.threads.get(&tid)?.wait.as_ref().map(|wait| &wait.kind)
    }

    pub fn set_wait_kind(&mut self, tid: Tid, kind: WaitKind) {
        if let Some(wait) = self.threads.get_mut(&tid).and_then(|record| record.wait.as_mut()) {
            wait.kind = kind;
        }
    }

    /// Set an object signaled and resolve every thread waiting on it
    pub fn signal_object(&mut self, sync: &SyncObject) {
        sync.set_signaled(true);
        let woken: Vec<(Tid, usize)> = self
            .threads
            .iter()
            .filter_map(|(tid, record)| match record.wait.as_ref().map(|wait| &wait.kind) {
                Some(WaitKind::Synchronization { objects }) => objects
                    .iter()
                    .position(|object| object.waits_on(sync))
                    .map(|index| (*tid, index)),
                _ => None,
            })
            .collect();
        for (tid, index) in woken {
            self.resolve_wait(tid, Ok(index));
        }
    }

    pub fn priority(&self, tid: Tid) -> Option<Priority> {
        self.threads.get(&tid).map(|record| record.priority)
    }

    pub(super) fn termination_error(&self, tid: Tid) -> Option<KernelError> {
        match self.threads.get(&tid) {
            None => Some(KernelError::TerminationRequested),
            Some(record) if record.terminate_requested => Some(KernelError::TerminationRequested),
            Some(_) => None,
        }
    }
}
