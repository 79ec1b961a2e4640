//! Backpressure policies for buffered streams.
//!
//! A policy decides what happens when a producer pushes faster than the
//! consumer drains:
//!
//! - **`Buffer`**: unbounded queue; nothing is dropped
//! - **`DropOldest(n)`**: ring of `n` items; overflow evicts the oldest
//! - **`Latest`**: keep only the most recent item
//! - **`Error(n)`**: overflow terminates the stream with `Overflow`
//! - **`Missing(n)`**: overflow is a consumer misconfiguration and terminates
//!   the stream with `MissingBackpressure`
//! - **`Block(n)`**: the producer waits for space (opt-in; every other policy
//!   never blocks the producer)

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::{RxResult, StreamError, ValidationError};

/// Overflow behaviour of a [`BufferedStream`](super::BufferedStream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "policy", content = "capacity", rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Unbounded buffering.
    #[default]
    Buffer,
    /// Bounded ring buffer discarding the oldest unconsumed item.
    DropOldest(usize),
    /// Only the most recently delivered item is kept.
    Latest,
    /// Overflow is a terminal stream error.
    Error(usize),
    /// Overflow is reported as missing backpressure handling.
    Missing(usize),
    /// The producer blocks until the consumer makes room.
    Block(usize),
}

impl BackpressurePolicy {
    /// Buffer bound, if the policy has one.
    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        match self {
            Self::Buffer => None,
            Self::Latest => Some(1),
            Self::DropOldest(n) | Self::Error(n) | Self::Missing(n) | Self::Block(n) => Some(*n),
        }
    }

    /// Returns true if a full buffer suspends the producer.
    #[must_use]
    pub const fn blocks_producer(&self) -> bool {
        matches!(self, Self::Block(_))
    }

    /// Rejects bounded policies with a capacity of zero.
    pub fn validate(&self) -> RxResult<()> {
        if self.capacity() == Some(0) {
            return Err(ValidationError::ZeroCapacity {
                field: format!("{self:?}"),
            }
            .into());
        }
        Ok(())
    }
}

/// Outcome of offering one item to a [`PolicyBuffer`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Offer<T> {
    /// Stored without loss.
    Accepted,
    /// Stored after discarding this many older items.
    Dropped(usize),
    /// Not stored; the stream must terminate with this error.
    Rejected(StreamError),
    /// Not stored; the producer must wait and offer the item again.
    Full(T),
}

/// The buffer state machine behind a stream, without any synchronization.
#[derive(Debug)]
pub(crate) struct PolicyBuffer<T> {
    items: VecDeque<T>,
    policy: BackpressurePolicy,
}

impl<T> PolicyBuffer<T> {
    pub(crate) fn new(policy: BackpressurePolicy) -> Self {
        let items = match policy.capacity() {
            Some(cap) => VecDeque::with_capacity(cap.min(1024)),
            None => VecDeque::new(),
        };
        Self { items, policy }
    }

    pub(crate) const fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    pub(crate) fn offer(&mut self, item: T) -> Offer<T> {
        let len = self.items.len();
        match self.policy {
            BackpressurePolicy::Buffer => {
                self.items.push_back(item);
                Offer::Accepted
            }
            BackpressurePolicy::DropOldest(cap) => {
                let mut dropped = 0;
                while self.items.len() >= cap {
                    self.items.pop_front();
                    dropped += 1;
                }
                self.items.push_back(item);
                if dropped == 0 {
                    Offer::Accepted
                } else {
                    Offer::Dropped(dropped)
                }
            }
            BackpressurePolicy::Latest => {
                self.items.clear();
                self.items.push_back(item);
                if len == 0 {
                    Offer::Accepted
                } else {
                    Offer::Dropped(len)
                }
            }
            BackpressurePolicy::Error(cap) if len >= cap => Offer::Rejected(StreamError::Overflow { capacity: cap }),
            BackpressurePolicy::Missing(cap) if len >= cap => {
                Offer::Rejected(StreamError::MissingBackpressure { capacity: cap })
            }
            BackpressurePolicy::Block(cap) if len >= cap => Offer::Full(item),
            BackpressurePolicy::Error(_) | BackpressurePolicy::Missing(_) | BackpressurePolicy::Block(_) => {
                self.items.push_back(item);
                Offer::Accepted
            }
        }
    }

    pub(crate) fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }
}
