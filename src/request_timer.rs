/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-height expiry map that bounds how long a node waits for a block it requested.
//!
//! Every outstanding block request is recorded under the requested height together with the peer it
//! was sent to. A ticker thread periodically collects the entries that expired and passes them to a
//! callback, which typically re-requests the height from another peer. The callback is invoked without
//! the timer's lock held, and it must not block: it should only enqueue work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::types::basic::BlockHeight;

pub struct RequestTimer<V> {
    entries: Mutex<HashMap<BlockHeight, (Instant, V)>>,
}

impl<V: Clone + PartialEq> RequestTimer<V> {
    pub fn new() -> RequestTimer<V> {
        RequestTimer {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record that `height` expires after `timeout`. Replaces the entry for `height` if there is one.
    pub fn add(&self, height: BlockHeight, timeout: Duration, value: V) {
        self.lock().insert(height, (Instant::now() + timeout, value));
    }

    pub fn exist(&self, height: BlockHeight) -> bool {
        self.lock().contains_key(&height)
    }

    pub fn remove(&self, height: BlockHeight) {
        self.lock().remove(&height);
    }

    /// Remove every entry whose value equals `value`.
    pub fn removes_by_value(&self, value: &V) {
        self.lock().retain(|_, (_, entry)| entry != value);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove and return the entries that expired at or before `now`, in ascending height order.
    pub fn take_expired(&self, now: Instant) -> Vec<(BlockHeight, V)> {
        let mut entries = self.lock();
        let expired_heights: Vec<BlockHeight> = entries
            .iter()
            .filter(|(_, (expires_at, _))| *expires_at <= now)
            .map(|(height, _)| *height)
            .collect();

        let mut expired: Vec<(BlockHeight, V)> = expired_heights
            .into_iter()
            .filter_map(|height| entries.remove(&height).map(|(_, value)| (height, value)))
            .collect();
        expired.sort_by_key(|(height, _)| *height);
        expired
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<BlockHeight, (Instant, V)>> {
        // A poisoned map is still a consistent map: every mutation is a single insert or remove.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<V: Clone + PartialEq> Default for RequestTimer<V> {
    fn default() -> Self {
        RequestTimer::new()
    }
}

/// Spawn the ticker thread, which fires `on_expired` for every entry of `timer` that expires, until
/// `close` is set.
pub fn start_ticker<V, F>(
    timer: Arc<RequestTimer<V>>,
    tick: Duration,
    close: Arc<AtomicBool>,
    on_expired: F,
) -> JoinHandle<()>
where
    V: Clone + PartialEq + Send + 'static,
    F: Fn(BlockHeight, V) + Send + 'static,
{
    thread::spawn(move || {
        while !close.load(Ordering::Acquire) {
            thread::sleep(tick);
            for (height, value) in timer.take_expired(Instant::now()) {
                on_expired(height, value);
            }
        }
    })
}
