/*!
 * Priority Queue
 * Per-core ready queue: one FIFO per priority level
 */

use crate::core::limits::PRIORITY_LEVELS;
use crate::core::types::{Priority, Tid};
use std::collections::VecDeque;

#[derive(Debug)]
pub(super) struct PriorityQueue {
    levels: Vec<VecDeque<Tid>>,
    len: usize,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            levels: (0..PRIORITY_LEVELS).map(|_| VecDeque::new()).collect(),
            len: 0,
        }
    }

    pub fn push_back(&mut self, priority: Priority, tid: Tid) {
        self.levels[priority as usize].push_back(tid);
        self.len += 1;
    }

    pub fn remove(&mut self, priority: Priority, tid: Tid) -> bool {
        let level = &mut self.levels[priority as usize];
        match level.iter().position(|&queued| queued == tid) {
            Some(pos) => {
                level.remove(pos);
                self.len -= 1;
                true
            }
            None => false,
        }
    }

    /// Move to the back of its level
    pub fn rotate(&mut self, priority: Priority, tid: Tid) {
        if self.remove(priority, tid) {
            self.push_back(priority, tid);
        }
    }

    /// Highest-priority thread, oldest first within a level
    pub fn front(&self) -> Option<Tid> {
        self.levels.iter().find_map(|level| level.front().copied())
    }

    /// All queued threads in scheduling order
    pub fn iter(&self) -> impl Iterator<Item = Tid> + '_ {
        self.levels.iter().flat_map(|level| level.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_front_is_highest_priority() {
        let mut queue = PriorityQueue::new();
        queue.push_back(44, 1);
        queue.push_back(20, 2);
        queue.push_back(20, 3);
        assert_eq!(queue.front(), Some(2));
        assert_eq!(queue.iter().collect::<Vec<_>>(), vec![2, 3, 1]);
    }

    #[test]
    fn test_rotate_within_level() {
        let mut queue = PriorityQueue::new();
        queue.push_back(30, 1);
        queue.push_back(30, 2);
        queue.rotate(30, 1);
        assert_eq!(queue.front(), Some(2));
        assert!(queue.remove(30, 2));
        assert!(!queue.remove(30, 2));
        assert_eq!(queue.len(), 1);
    }
}
