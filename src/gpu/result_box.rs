/*!
 * Result Box
 * Single-slot rendezvous between a producer and the render thread
 */

use super::GpuError;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

enum Slot<T> {
    Empty,
    Ready(Result<T, GpuError>),
    Taken,
}

/// Written once by the consumer, read once by the producer
pub struct ResultBox<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> Default for ResultBox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResultBox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Empty),
            ready: Condvar::new(),
        }
    }

    /// Store the result and wake the waiter; returns false if already completed
    pub fn complete(&self, result: Result<T, GpuError>) -> bool {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Empty) {
            return false;
        }
        *slot = Slot::Ready(result);
        self.ready.notify_all();
        true
    }

    pub fn is_complete(&self) -> bool {
        !matches!(*self.slot.lock(), Slot::Empty)
    }

    /// Block until completed, then take the result
    pub fn wait(&self) -> Result<T, GpuError> {
        let mut slot = self.slot.lock();
        while matches!(*slot, Slot::Empty) {
            self.ready.wait(&mut slot);
        }
        Self::take(&mut slot)
    }

    /// Like [`wait`](Self::wait); `None` if nothing arrived within `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, GpuError>> {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Empty) {
            let _ = self
                .ready
                .wait_while_for(&mut slot, |slot| matches!(slot, Slot::Empty), timeout);
        }
        if matches!(*slot, Slot::Empty) {
            return None;
        }
        Some(Self::take(&mut slot))
    }

    fn take(slot: &mut Slot<T>) -> Result<T, GpuError> {
        match std::mem::replace(slot, Slot::Taken) {
            Slot::Ready(result) => result,
            _ => Err(GpuError::ResultTaken),
        }
    }
}

impl<T> std::fmt::Debug for ResultBox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match *self.slot.lock() {
            Slot::Empty => "empty",
            Slot::Ready(Ok(_)) => "ready",
            Slot::Ready(Err(_)) => "failed",
            Slot::Taken => "taken",
        };
        f.debug_struct("ResultBox").field("state", &state).finish()
    }
}

/// Result slot referenced from a queued command
///
/// Dropping an uncompleted slot fails it with `QueueShutdown`, so a producer
/// can never wait on a box nobody will complete.
#[derive(Debug)]
pub enum PendingResult {
    Data(Arc<ResultBox<Vec<u8>>>),
    Fence(Arc<ResultBox<()>>),
}

impl PendingResult {
    pub fn fail(&self, error: GpuError) {
        match self {
            PendingResult::Data(result) => {
                result.complete(Err(error));
            }
            PendingResult::Fence(result) => {
                result.complete(Err(error));
            }
        }
    }

    pub fn complete_data(&self, data: Result<Vec<u8>, GpuError>) {
        match self {
            PendingResult::Data(result) => {
                result.complete(data);
            }
            PendingResult::Fence(result) => {
                result.complete(data.map(|_| ()));
            }
        }
    }

    pub fn complete_fence(&self, outcome: Result<(), GpuError>) {
        match self {
            PendingResult::Data(result) => {
                result.complete(outcome.map(|()| Vec::new()));
            }
            PendingResult::Fence(result) => {
                result.complete(outcome);
            }
        }
    }
}

impl Drop for PendingResult {
    fn drop(&mut self) {
        self.fail(GpuError::QueueShutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_producer_blocks_until_completed() {
        let result = Arc::new(ResultBox::<Vec<u8>>::new());
        let consumer = {
            let result = Arc::clone(&result);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                result.complete(Ok(vec![1, 2, 3]))
            })
        };
        assert_eq!(result.wait().unwrap(), vec![1, 2, 3]);
        assert!(consumer.join().unwrap());
        assert!(matches!(result.wait(), Err(GpuError::ResultTaken)));
    }

    #[test]
    fn test_complete_once() {
        let result = ResultBox::<u32>::new();
        assert!(result.complete(Ok(1)));
        assert!(!result.complete(Ok(2)));
        assert_eq!(result.wait_timeout(Duration::from_millis(1)).unwrap().unwrap(), 1);
    }

    #[test]
    fn test_dropped_pending_fails_waiter() {
        let result = Arc::new(ResultBox::<()>::new());
        drop(PendingResult::Fence(Arc::clone(&result)));
        assert!(matches!(result.wait(), Err(GpuError::QueueShutdown)));
    }

    #[test]
    fn test_wait_timeout_empty() {
        let result = ResultBox::<u32>::new();
        assert!(result.wait_timeout(Duration::from_millis(5)).is_none());
    }
}
