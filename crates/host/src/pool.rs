//! Per-device request pools
//!
//! A [`RequestPool`] keeps one FIFO queue per lifecycle state. Every pooled
//! object is owned by exactly one queue; moving it to another state moves the
//! value, so an object can never sit in two queues at once.
//!
//! The queues are guarded by a spin lock because `pop` runs from completion
//! context. Critical sections are a push or an unlink. Each queue starts with
//! a small reserve and grows on demand; the cache limit bounds its length.

use crate::cache::CacheObject;
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;

/// Lifecycle state that selects a queue
pub trait PoolState: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Every state, in `pop` priority order
    const PRIORITY: &'static [Self];

    /// Queue index of this state
    fn index(self) -> usize;
}

/// States of the transfer-request pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// Submitted, awaiting completion
    Init,
    /// Completed, awaiting transmission to the remote
    Tx,
    /// Reusable
    Free,
}

impl PoolState for RequestState {
    const PRIORITY: &'static [Self] = &[RequestState::Init, RequestState::Tx, RequestState::Free];

    fn index(self) -> usize {
        self as usize
    }
}

/// States of the transport-wrapper pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrapperState {
    /// Inbound pipeline, awaiting completion
    InInit,
    /// Outbound pipeline, awaiting completion
    OutInit,
    /// Management pipeline, awaiting completion
    MgmtInit,
    /// Completed, awaiting transmission
    Tx,
    /// Reusable
    Free,
}

impl PoolState for WrapperState {
    const PRIORITY: &'static [Self] = &[
        WrapperState::InInit,
        WrapperState::OutInit,
        WrapperState::MgmtInit,
        WrapperState::Tx,
        WrapperState::Free,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Queues of one pool family for one device
pub struct RequestPool<S: PoolState, T> {
    queues: spin::Mutex<Vec<VecDeque<CacheObject<T>>>>,
    _state: PhantomData<S>,
}

impl<S: PoolState, T> RequestPool<S, T> {
    /// Create empty queues, each able to hold `reserve` objects before it
    /// grows
    pub fn new(reserve: usize) -> Self {
        let queues = S::PRIORITY
            .iter()
            .map(|_| VecDeque::with_capacity(reserve))
            .collect();

        Self {
            queues: spin::Mutex::new(queues),
            _state: PhantomData,
        }
    }

    /// Append `object` to the tail of the `state` queue
    pub fn push(&self, state: S, object: CacheObject<T>) {
        self.queues.lock()[state.index()].push_back(object);
    }

    /// Remove the head of the first non-empty queue in priority order
    #[must_use]
    pub fn pop(&self) -> Option<(S, CacheObject<T>)> {
        let mut queues = self.queues.lock();
        S::PRIORITY
            .iter()
            .find_map(|&state| queues[state.index()].pop_front().map(|obj| (state, obj)))
    }

    /// Remove the head of the `state` queue
    #[must_use]
    pub fn pop_state(&self, state: S) -> Option<CacheObject<T>> {
        self.queues.lock()[state.index()].pop_front()
    }

    /// Remove the oldest object in `state` matching `predicate`
    #[must_use]
    pub fn unlink(&self, state: S, predicate: impl FnMut(&T) -> bool) -> Option<CacheObject<T>> {
        let mut queues = self.queues.lock();
        Self::unlink_locked(&mut queues[state.index()], predicate)
    }

    /// Move the oldest object in `from` matching `predicate` to the tail of
    /// `to`, applying `update` on the way, under one lock acquisition
    ///
    /// `update` runs under the pool lock and must not block. Returns false
    /// when no object matched.
    pub fn transition(
        &self,
        from: S,
        to: S,
        predicate: impl FnMut(&T) -> bool,
        update: impl FnOnce(&mut T),
    ) -> bool {
        let mut queues = self.queues.lock();
        match Self::unlink_locked(&mut queues[from.index()], predicate) {
            Some(mut object) => {
                update(&mut object);
                queues[to.index()].push_back(object);
                true
            }
            None => false,
        }
    }

    fn unlink_locked(
        queue: &mut VecDeque<CacheObject<T>>,
        mut predicate: impl FnMut(&T) -> bool,
    ) -> Option<CacheObject<T>> {
        let position = queue.iter().position(|obj| predicate(&**obj))?;
        queue.remove(position)
    }

    /// Number of objects in `state`
    pub fn len_of(&self, state: S) -> usize {
        self.queues.lock()[state.index()].len()
    }

    /// Number of objects across all states
    pub fn len(&self) -> usize {
        self.queues.lock().iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Like [`RequestPool::len`], but `None` if the lock is currently held
    pub fn try_len(&self) -> Option<usize> {
        self.queues
            .try_lock()
            .map(|queues| queues.iter().map(VecDeque::len).sum())
    }
}

impl<S: PoolState, T> fmt::Debug for RequestPool<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queues = self.queues.lock();
        let mut list = f.debug_map();
        for &state in S::PRIORITY {
            list.entry(&state, &queues[state.index()].len());
        }
        list.finish()
    }
}
