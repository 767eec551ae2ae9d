/*!
 * Thread Scheduler
 * Priority scheduling of guest threads onto emulated cores
 *
 * Every started KThread runs on its own host thread, but only the holder of
 * a core may execute guest code. Holders hand their core over at preemption
 * points (syscall return and explicit yields); everyone else parks on their
 * own condvar tied to the scheduler lock.
 */

mod queue;
mod state;

pub(crate) use state::{SchedulerState, WaitKind};

use crate::core::errors::{KernelError, ResultCode};
use crate::core::types::{CoreMask, KernelResult, Pid, Priority, Tid};
use crate::core::limits::LOWEST_PRIORITY;
use crate::kernel::object::SyncObject;
use crate::kernel::thread::{KThread, ThreadState};
use log::{debug, info};
use parking_lot::{Mutex, MutexGuard};
use state::ThreadRecord;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Scheduler snapshot for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    pub threads: usize,
    pub holders: Vec<Option<Tid>>,
    pub queued: Vec<usize>,
    pub context_switches: u64,
}

/// Guest thread scheduler
///
/// # Performance
/// - Cache-line aligned; every scheduling decision goes through `state`
#[repr(C, align(64))]
pub struct KScheduler {
    state: Mutex<SchedulerState>,
    quantum: Duration,
    core_count: usize,
}

impl KScheduler {
    pub fn new(core_count: usize, quantum: Duration) -> Self {
        info!("Scheduler initialized: {} cores, quantum={:?}", core_count, quantum);
        Self {
            state: Mutex::new(SchedulerState::new(core_count)),
            quantum,
            core_count,
        }
    }

    pub fn core_count(&self) -> usize {
        self.core_count
    }

    pub fn quantum(&self) -> Duration {
        self.quantum
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock()
    }

    /// Track a new thread in the Created state
    pub(crate) fn register(&self, thread: &Arc<KThread>, priority: Priority, ideal_core: usize, affinity: CoreMask) {
        let mut state = self.state.lock();
        state.threads.insert(
            thread.tid(),
            ThreadRecord {
                thread: Arc::clone(thread),
                pid: thread.pid(),
                state: ThreadState::Created,
                priority,
                ideal_core,
                affinity,
                active_core: ideal_core,
                wait: None,
                wait_result: None,
                terminate_requested: false,
                pause_requested: false,
                sync_cancelled: false,
            },
        );
    }

    /// Created -> Ready
    pub(crate) fn start(&self, tid: Tid) -> KernelResult<()> {
        let mut state = self.state.lock();
        match state.record(tid).map(|record| record.state) {
            Some(ThreadState::Created) => {
                state.make_ready(tid);
                Ok(())
            }
            Some(_) => Err(KernelError::Result(ResultCode::INVALID_STATE)),
            None => Err(KernelError::TerminationRequested),
        }
    }

    /// Park until `thread` holds its core
    pub(crate) fn wait_for_core(&self, state: &mut MutexGuard<'_, SchedulerState>, thread: &KThread) -> KernelResult<()> {
        let tid = thread.tid();
        loop {
            if let Some(err) = state.termination_error(tid) {
                return Err(err);
            }
            let core = match state.record(tid) {
                Some(record) => record.active_core,
                None => return Err(KernelError::TerminationRequested),
            };
            if state.holder(core) == Some(tid) {
                return Ok(());
            }
            thread.wake.wait(state);
        }
    }

    /// First wait of a freshly started host thread
    pub(crate) fn enter(&self, thread: &KThread) -> KernelResult<()> {
        let mut state = self.state.lock();
        self.wait_for_core(&mut state, thread)
    }

    /// Reschedule at a syscall return
    pub fn preemption_point(&self, thread: &KThread) -> KernelResult<()> {
        let mut state = self.state.lock();
        self.reschedule(&mut state, thread, false)
    }

    /// Move to the back of the priority level and let others run
    pub fn yield_thread(&self, thread: &KThread) -> KernelResult<()> {
        let mut state = self.state.lock();
        self.reschedule(&mut state, thread, true)
    }

    fn reschedule(&self, state: &mut MutexGuard<'_, SchedulerState>, thread: &KThread, force_rotate: bool) -> KernelResult<()> {
        let tid = thread.tid();
        loop {
            self.wait_for_core(state, thread)?;
            let Some(record) = state.record(tid) else {
                return Err(KernelError::TerminationRequested);
            };
            if record.pause_requested {
                debug!("Thread {} pausing at preemption point", tid);
                state.suspend(tid);
                continue;
            }
            if let Some(core) = state.migration_target(tid) {
                state.migrate(tid, core);
                continue;
            }
            break;
        }

        let Some(core) = state.record(tid).map(|record| record.active_core) else {
            return Err(KernelError::TerminationRequested);
        };
        if force_rotate || state.cores[core].granted_at.elapsed() >= self.quantum {
            state.rotate(tid);
            state.cores[core].granted_at = Instant::now();
        }
        if state.queues[core].front() != Some(tid) {
            state.hand_over(tid);
            self.wait_for_core(state, thread)?;
        }
        Ok(())
    }

    /// Block the calling thread until its wait is resolved or `deadline` passes
    ///
    /// Returns the resolved value (signaled index for synchronization waits).
    pub(crate) fn block(
        &self,
        mut state: MutexGuard<'_, SchedulerState>,
        thread: &KThread,
        kind: WaitKind,
        deadline: Option<Instant>,
    ) -> KernelResult<usize> {
        let tid = thread.tid();
        if let Some(err) = state.termination_error(tid) {
            return Err(err);
        }
        state.begin_wait(tid, kind);

        let result = loop {
            let Some(record) = state.record_mut(tid) else {
                return Err(KernelError::TerminationRequested);
            };
            if let Some(result) = record.wait_result.take() {
                break result;
            }
            match deadline {
                Some(deadline) => {
                    if thread.wake.wait_until(&mut state, deadline).timed_out()
                        && state.record(tid).map_or(false, |record| record.wait.is_some())
                    {
                        state.resolve_wait(tid, Err(KernelError::TimedOut));
                    }
                }
                None => thread.wake.wait(&mut state),
            }
        };

        self.wait_for_core(&mut state, thread)?;
        result
    }

    /// Sleep for `duration`; zero yields
    pub fn sleep(&self, thread: &KThread, duration: Duration) -> KernelResult<()> {
        if duration.is_zero() {
            return self.yield_thread(thread);
        }
        let state = self.state.lock();
        match self.block(state, thread, WaitKind::Sleep, Some(Instant::now() + duration)) {
            Ok(_) | Err(KernelError::TimedOut) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn set_priority(&self, tid: Tid, priority: Priority) -> KernelResult<()> {
        if priority > LOWEST_PRIORITY {
            return Err(KernelError::InvalidPriority(priority as u32));
        }
        let mut state = self.state.lock();
        let Some(record) = state.record(tid) else {
            return Err(KernelError::InvalidHandle(0));
        };
        let queued = record.state.is_queued();
        if queued {
            state.dequeue(tid);
        }
        if let Some(record) = state.record_mut(tid) {
            record.priority = priority;
        }
        if queued {
            state.enqueue(tid);
        }
        Ok(())
    }

    pub fn priority(&self, tid: Tid) -> Option<Priority> {
        self.state.lock().priority(tid)
    }

    /// Current state; exited threads report Terminated until their process finalizes
    pub fn thread_state(&self, tid: Tid) -> Option<ThreadState> {
        let state = self.state.lock();
        match state.record(tid) {
            Some(record) => Some(record.state),
            None => state.terminated.contains_key(&tid).then_some(ThreadState::Terminated),
        }
    }

    pub fn current_core(&self, tid: Tid) -> Option<usize> {
        self.state.lock().record(tid).map(|record| record.active_core)
    }

    pub fn core_mask(&self, tid: Tid) -> Option<(usize, CoreMask)> {
        self.state
            .lock()
            .record(tid)
            .map(|record| (record.ideal_core, record.affinity))
    }

    /// Change affinity; a running thread migrates at its next preemption point
    pub fn set_core_mask(&self, tid: Tid, ideal_core: usize, affinity: CoreMask) -> KernelResult<()> {
        let mut state = self.state.lock();
        let Some(record) = state.record_mut(tid) else {
            return Err(KernelError::InvalidHandle(0));
        };
        record.ideal_core = ideal_core;
        record.affinity = affinity;
        let core = record.active_core;
        let ready = record.state == ThreadState::Ready;

        if ready && state.holder(core) != Some(tid) {
            if let Some(target) = state.migration_target(tid) {
                state.migrate(tid, target);
            }
        }
        Ok(())
    }

    /// Pause or resume a thread (SetThreadActivity)
    pub fn set_activity(&self, tid: Tid, paused: bool) -> KernelResult<()> {
        let mut state = self.state.lock();
        let Some(record) = state.record_mut(tid) else {
            return Err(KernelError::InvalidHandle(0));
        };
        if record.terminate_requested || record.state == ThreadState::Created {
            return Err(KernelError::Result(ResultCode::INVALID_STATE));
        }
        if paused {
            if record.pause_requested {
                return Err(KernelError::Result(ResultCode::INVALID_STATE));
            }
            record.pause_requested = true;
            // a running thread pauses itself at its next preemption point
            if record.state == ThreadState::Ready {
                state.suspend(tid);
            }
        } else {
            if !record.pause_requested {
                return Err(KernelError::Result(ResultCode::INVALID_STATE));
            }
            record.pause_requested = false;
            if record.state == ThreadState::Paused {
                state.make_ready(tid);
            }
        }
        Ok(())
    }

    /// Mark every thread of `pid` for termination and resolve their waits
    ///
    /// Returns threads that were never started; they have no host thread and
    /// must be finished by the caller.
    pub(crate) fn request_termination(&self, pid: Pid) -> Vec<Arc<KThread>> {
        let mut state = self.state.lock();
        let tids: Vec<Tid> = state
            .threads
            .iter()
            .filter(|(_, record)| record.pid == pid)
            .map(|(tid, _)| *tid)
            .collect();

        let mut unstarted = Vec::new();
        for tid in tids {
            let Some(record) = state.record_mut(tid) else {
                continue;
            };
            record.terminate_requested = true;
            record.pause_requested = false;
            let thread = Arc::clone(&record.thread);
            let current = record.state;
            match current {
                ThreadState::Created => unstarted.push(Arc::clone(&thread)),
                ThreadState::WaitingSync => state.resolve_wait(tid, Err(KernelError::TerminationRequested)),
                _ => {}
            }
            thread.wake.notify_one();
        }
        info!("Termination requested for process {} ({} unstarted threads)", pid, unstarted.len());
        unstarted
    }

    /// Flag a single thread for termination (ExitThread)
    pub(crate) fn request_thread_termination(&self, tid: Tid) {
        let mut state = self.state.lock();
        if let Some(record) = state.record_mut(tid) {
            record.terminate_requested = true;
        }
    }

    pub fn is_termination_requested(&self, tid: Tid) -> bool {
        self.state.lock().termination_error(tid).is_some()
    }

    /// Remove an exiting thread and signal its waiters
    pub(crate) fn exit(&self, thread: &KThread) {
        let mut state = self.state.lock();
        if let Some(record) = state.unlink(thread.tid()) {
            state.terminated.insert(thread.tid(), record.pid);
            debug!("Thread {} left the scheduler", thread.tid());
        }
        state.signal_object(thread.sync_object());
    }

    /// Drop the Terminated records of a finalized process
    pub(crate) fn forget_process(&self, pid: Pid) {
        self.state.lock().terminated.retain(|_, owner| *owner != pid);
    }

    /// Resolve a WaitSynchronization with Cancelled, or arm the next one
    pub fn cancel_synchronization(&self, tid: Tid) -> KernelResult<()> {
        let mut state = self.state.lock();
        let waiting = matches!(state.wait_kind(tid), Some(WaitKind::Synchronization { .. }));
        if waiting {
            state.resolve_wait(tid, Err(KernelError::Cancelled));
        } else {
            match state.record_mut(tid) {
                Some(record) => record.sync_cancelled = true,
                None => return Err(KernelError::InvalidHandle(0)),
            }
        }
        Ok(())
    }

    pub fn signal(&self, sync: &SyncObject) {
        self.state.lock().signal_object(sync);
    }

    pub fn clear(&self, sync: &SyncObject) {
        let _state = self.state.lock();
        sync.set_signaled(false);
    }

    /// Clear if signaled; returns whether it was
    pub fn reset(&self, sync: &SyncObject) -> bool {
        let _state = self.state.lock();
        let was = sync.is_signaled();
        sync.set_signaled(false);
        was
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.state.lock();
        SchedulerStats {
            threads: state.threads.len(),
            holders: state.cores.iter().map(|core| core.holder).collect(),
            queued: state.queues.iter().map(|queue| queue.len()).collect(),
            context_switches: state.context_switches,
        }
    }
}
