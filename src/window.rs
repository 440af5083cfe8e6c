//! The sliding-window buffer (C4): a bounded, single-owner sequence of
//! mono events ordered by arrival, pruned by timestamp.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::model::MonoEvent;

pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

/// A bounded double-ended sequence of [`MonoEvent`]s ordered by arrival,
/// not by timestamp (§4.4). Owned by exactly one CEP worker; never shared.
pub struct SlidingWindowBuffer {
    size_cap: usize,
    max_window: Duration,
    events: VecDeque<MonoEvent>,
}

impl SlidingWindowBuffer {
    /// `size_cap` bounds the buffer regardless of age; `max_window` is the
    /// largest `window_duration` across all active rules, used as the
    /// prune horizon on every push.
    #[must_use]
    pub fn new(size_cap: usize, max_window: Duration) -> Self {
        Self {
            size_cap,
            max_window,
            events: VecDeque::new(),
        }
    }

    /// Appends `event` at the tail, evicting the oldest entry on overflow,
    /// then prunes everything older than `max_window` relative to `now`.
    pub fn push(&mut self, event: MonoEvent, now: DateTime<Utc>) {
        self.events.push_back(event);
        while self.events.len() > self.size_cap {
            self.events.pop_front();
        }
        self.prune(now);
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - chrono_duration(self.max_window);
        while matches!(self.events.front(), Some(e) if e.timestamp < cutoff) {
            self.events.pop_front();
        }
    }

    /// Iterates events whose timestamp is within `window` of `now`, in
    /// arrival order.
    pub fn iter_recent(
        &self,
        window: Duration,
        now: DateTime<Utc>,
    ) -> impl Iterator<Item = &MonoEvent> {
        let cutoff = now - chrono_duration(window);
        self.events.iter().filter(move |e| e.timestamp >= cutoff)
    }

    /// Iterates every buffered event in arrival order, regardless of
    /// window.
    pub fn iter(&self) -> impl Iterator<Item = &MonoEvent> {
        self.events.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[must_use]
    pub fn size_cap(&self) -> usize {
        self.size_cap
    }
}
