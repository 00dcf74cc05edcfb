/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Out-of-order buffer of future blocks, keyed by height.
//!
//! Blocks received during catch-up arrive in any order and from many peers. The queue keeps them until
//! the chain reaches their height. It never replaces an entry: inserting at an occupied height hands the
//! existing entry back, so the caller can compare hashes and detect a fork.

use std::collections::BTreeMap;

use crate::types::basic::BlockHeight;

/// Result of [`SortedBlockQueue::find_or_insert`].
#[derive(Debug, PartialEq, Eq)]
pub enum FindOrInsert<'a, T> {
    Inserted,
    /// An entry already occupied the height. The offered item was dropped.
    Found(&'a T),
}

#[derive(Debug)]
pub struct SortedBlockQueue<T> {
    items: BTreeMap<BlockHeight, T>,
}

impl<T> SortedBlockQueue<T> {
    pub fn new() -> SortedBlockQueue<T> {
        SortedBlockQueue {
            items: BTreeMap::new(),
        }
    }

    pub fn find_or_insert(&mut self, item: T, priority: BlockHeight) -> FindOrInsert<'_, T> {
        use std::collections::btree_map::Entry;
        match self.items.entry(priority) {
            Entry::Vacant(entry) => {
                entry.insert(item);
                FindOrInsert::Inserted
            }
            Entry::Occupied(entry) => FindOrInsert::Found(entry.into_mut()),
        }
    }

    /// The entry with the lowest priority.
    pub fn peek(&self) -> Option<(BlockHeight, &T)> {
        self.items
            .first_key_value()
            .map(|(priority, item)| (*priority, item))
    }

    /// Drop every entry below `priority`, then remove and return the entry at `priority`.
    pub fn pop_until(&mut self, priority: BlockHeight) -> Option<T> {
        let rest = self.items.split_off(&priority);
        self.items = rest;
        self.items.remove(&priority)
    }

    pub fn find(&self, priority: BlockHeight) -> Option<&T> {
        self.items.get(&priority)
    }

    pub fn remove(&mut self, priority: BlockHeight) -> Option<T> {
        self.items.remove(&priority)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> Default for SortedBlockQueue<T> {
    fn default() -> Self {
        SortedBlockQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn height(int: u32) -> BlockHeight {
        BlockHeight::new(int)
    }

    #[test]
    fn find_or_insert_never_replaces() {
        let mut queue = SortedBlockQueue::new();
        assert_eq!(queue.find_or_insert("x", height(100)), FindOrInsert::Inserted);
        assert_eq!(
            queue.find_or_insert("y", height(100)),
            FindOrInsert::Found(&"x")
        );
        assert_eq!(queue.find(height(100)), Some(&"x"));
    }

    #[test]
    fn pop_until_discards_lower_and_keeps_higher() {
        let mut queue = SortedBlockQueue::new();
        for int in [5, 3, 9, 4] {
            queue.find_or_insert(int, height(int));
        }
        assert_eq!(queue.peek(), Some((height(3), &3)));

        assert_eq!(queue.pop_until(height(5)), Some(5));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_until(height(6)), None);
        assert_eq!(queue.find(height(9)), Some(&9));
        assert_eq!(queue.pop_until(height(10)), None);
        assert!(queue.is_empty());
    }
}
