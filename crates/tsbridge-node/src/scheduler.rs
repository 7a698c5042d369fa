//! Host scheduler contract and a reference single-queue implementation.
//!
//! The bridge only needs to read the current tag, the start time, and
//! physical time, and to schedule a payload for a downstream action.
//! [`LocalScheduler`] takes the process-wide critical section before it moves
//! its current tag, so a subscriber computing a delay inside that section
//! sees time stand still until it has scheduled.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tsbridge_core::types::physical_now;
use tsbridge_core::{Instant, Interval, Tag};

use crate::critical::enter_critical_section;

/// Identifies the downstream action a scheduled payload is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ActionHandle(pub u32);

impl fmt::Display for ActionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "action#{}", self.0)
    }
}

/// Operations the bridge consumes from the host's deterministic scheduler.
pub trait HostScheduler: Send + Sync {
    /// Current logical tag. Stable while the critical section is held.
    fn current_tag(&self) -> Tag;
    /// Logical time at which execution started.
    fn start_time(&self) -> Instant;
    /// Local wall clock, nanoseconds since the UNIX epoch.
    fn physical_time(&self) -> Instant;
    /// Schedules `payload` for `action` at `current_tag().delay(delay)` or the
    /// next free microstep after it. Returns the tag actually used.
    ///
    /// Callers hold the critical section.
    fn schedule_at(&self, action: ActionHandle, delay: Interval, payload: Bytes) -> Tag;
}

pub trait PhysicalClock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl PhysicalClock for SystemClock {
    fn now(&self) -> Instant {
        physical_now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Instant) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: Instant) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Interval) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl PhysicalClock for ManualClock {
    fn now(&self) -> Instant {
        self.now.load(Ordering::SeqCst)
    }
}

impl<C: PhysicalClock + ?Sized> PhysicalClock for Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledEvent {
    pub tag: Tag,
    pub action: ActionHandle,
    pub payload: Bytes,
}

#[derive(Debug)]
struct SchedulerState {
    current: Tag,
    queue: BTreeMap<(Tag, ActionHandle), Bytes>,
}

/// Ordered event queue with a single current tag.
#[derive(Debug)]
pub struct LocalScheduler<C = SystemClock> {
    clock: C,
    start_time: Instant,
    state: Mutex<SchedulerState>,
}

impl LocalScheduler<SystemClock> {
    /// Starts at the current wall-clock time.
    pub fn system() -> Self {
        Self::new(SystemClock)
    }
}

impl<C: PhysicalClock> LocalScheduler<C> {
    pub fn new(clock: C) -> Self {
        let start = clock.now();
        Self::with_start(clock, start)
    }

    pub fn with_start(clock: C, start_time: Instant) -> Self {
        Self {
            clock,
            start_time,
            state: Mutex::new(SchedulerState {
                current: Tag::new(start_time, 0),
                queue: BTreeMap::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pending(&self) -> usize {
        self.state().queue.len()
    }

    pub fn peek_tag(&self) -> Option<Tag> {
        self.state().queue.keys().next().map(|(tag, _)| *tag)
    }

    /// Pops the earliest event and advances the current tag to it.
    pub fn next_event(&self) -> Option<ScheduledEvent> {
        let _section = enter_critical_section();
        Self::pop_into_current(&mut self.state())
    }

    /// Like [`LocalScheduler::next_event`], but only for events whose time
    /// is not ahead of physical time.
    pub fn next_ready_event(&self) -> Option<ScheduledEvent> {
        let _section = enter_critical_section();
        let now = self.clock.now();
        let mut state = self.state();
        let ready = state
            .queue
            .keys()
            .next()
            .is_some_and(|(tag, _)| tag.time <= now);
        if ready {
            Self::pop_into_current(&mut state)
        } else {
            None
        }
    }

    /// Moves the current tag forward to physical time.
    ///
    /// Does nothing while an event is pending at or before physical time;
    /// those must be drained first so nothing lands in the past.
    pub fn advance_to_physical(&self) -> Tag {
        let _section = enter_critical_section();
        let now = self.clock.now();
        let mut state = self.state();
        let blocked = state
            .queue
            .keys()
            .next()
            .is_some_and(|(tag, _)| tag.time <= now);
        if !blocked && now > state.current.time {
            state.current = Tag::new(now, 0);
        }
        state.current
    }

    fn pop_into_current(state: &mut SchedulerState) -> Option<ScheduledEvent> {
        let ((tag, action), payload) = state.queue.pop_first()?;
        if tag > state.current {
            state.current = tag;
        }
        Some(ScheduledEvent {
            tag,
            action,
            payload,
        })
    }
}

impl<C: PhysicalClock> HostScheduler for LocalScheduler<C> {
    fn current_tag(&self) -> Tag {
        self.state().current
    }

    fn start_time(&self) -> Instant {
        self.start_time
    }

    fn physical_time(&self) -> Instant {
        self.clock.now()
    }

    fn schedule_at(&self, action: ActionHandle, delay: Interval, payload: Bytes) -> Tag {
        let mut state = self.state();
        let mut tag = state.current.delay(delay);
        while state.queue.contains_key(&(tag, action)) {
            tag = tag.next_microstep();
        }
        state.queue.insert((tag, action), payload);
        tag
    }
}
