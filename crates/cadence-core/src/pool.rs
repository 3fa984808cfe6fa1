//! Reusable [`DriveMovement`] records.
//!
//! Moves acquire one record per participating motor and hand it back when
//! the move completes, so steady-state printing allocates nothing. Records
//! live in an arena and thread through an intrusive free list (head index
//! plus a per-record link). Acquire and release happen only during move
//! setup and teardown, never from the step-generation context; callers that
//! prepare moves concurrently wrap the pool in a lock.

use crate::drive_movement::{DmState, DriveMovement};

/// Handle to a record owned by a [`DmPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmHandle(u32);

#[derive(Default)]
pub struct DmPool {
    records: Vec<DriveMovement>,
    free_head: Option<u32>,
}

impl DmPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grow the arena to at least `num` records at startup, all free.
    pub fn initial_allocate(&mut self, num: usize) {
        while self.records.len() < num {
            let index = self.records.len() as u32;
            let mut record = DriveMovement::new(0);
            record.next_free = self.free_head;
            self.free_head = Some(index);
            self.records.push(record);
        }
    }

    /// Acquire a record, reusing a free one when possible.
    pub fn allocate(&mut self, drive: u8, state: DmState) -> DmHandle {
        let index = match self.free_head {
            Some(index) => {
                self.free_head = self.records[index as usize].next_free.take();
                index
            }
            None => {
                let index = self.records.len() as u32;
                self.records.push(DriveMovement::new(0));
                index
            }
        };
        self.records[index as usize].assign(drive, state);
        DmHandle(index)
    }

    /// Return a record to the free list. The handle must not be used again
    /// until reissued by [`allocate`](Self::allocate).
    pub fn release(&mut self, handle: DmHandle) {
        let index = handle.0;
        self.records[index as usize].next_free = self.free_head;
        self.free_head = Some(index);
    }

    pub fn get(&self, handle: DmHandle) -> &DriveMovement {
        &self.records[handle.0 as usize]
    }

    pub fn get_mut(&mut self, handle: DmHandle) -> &mut DriveMovement {
        &mut self.records[handle.0 as usize]
    }

    /// Records ever created, free or not.
    pub fn num_created(&self) -> usize {
        self.records.len()
    }

    pub fn free_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.free_head;
        while let Some(index) = cursor {
            count += 1;
            cursor = self.records[index as usize].next_free;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preallocates_requested_records() {
        let mut pool = DmPool::new();
        pool.initial_allocate(4);
        assert_eq!(pool.num_created(), 4);
        assert_eq!(pool.free_count(), 4);

        // A second call never shrinks or duplicates.
        pool.initial_allocate(2);
        assert_eq!(pool.num_created(), 4);
    }

    #[test]
    fn allocate_reuses_the_free_list_lifo() {
        let mut pool = DmPool::new();
        pool.initial_allocate(2);

        let first = pool.allocate(3, DmState::Idle);
        assert_eq!(pool.get(first).drive(), 3);
        assert_eq!(pool.free_count(), 1);

        pool.release(first);
        assert_eq!(pool.free_count(), 2);

        // Most recently released comes back first.
        let again = pool.allocate(5, DmState::Idle);
        assert_eq!(again, first);
        assert_eq!(pool.get(again).drive(), 5);
    }

    #[test]
    fn grows_when_the_free_list_runs_dry() {
        let mut pool = DmPool::new();
        pool.initial_allocate(1);
        let a = pool.allocate(0, DmState::Idle);
        let b = pool.allocate(1, DmState::Idle);
        assert_ne!(a, b);
        assert_eq!(pool.num_created(), 2);
        assert_eq!(pool.free_count(), 0);
    }
}
