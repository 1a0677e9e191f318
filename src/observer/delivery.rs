//! Ordered change-set delivery
//!
//! Change sets are enqueued inside the runtime's critical section, so ticket
//! order is publication order. Delivery happens outside of it:
//!
//! 1. The publishing thread calls `deliver_through(ticket)`.
//! 2. If no other thread is delivering, it becomes the drainer and hands out
//!    every pending change set in ticket order, including ones enqueued by
//!    other threads while it runs.
//! 3. Otherwise it waits until its ticket has been fully delivered.
//!
//! An observer that publishes again (apply from inside a notification) does
//! not deliver recursively. Its change set is picked up by the drain loop
//! already running on this thread once the current observer returns.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

use super::change_set::ChangeSet;
use crate::snapshot::{poisoned, SnapshotResult};

/// Position of a change set in the delivery order.
pub type Ticket = u64;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Queues this thread is currently draining.
    static DRAINING: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<(Ticket, ChangeSet)>,
    next_ticket: Ticket,
    /// Every ticket below this has been handed to an observer.
    dispatched: Ticket,
    /// Every ticket below this has finished delivery.
    completed: Ticket,
    delivering: bool,
}

/// Ticketed delivery queue for one runtime.
#[derive(Debug)]
pub struct DeliveryQueue {
    id: u64,
    state: Mutex<QueueState>,
    delivered: Condvar,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(QueueState::default()),
            delivered: Condvar::new(),
        }
    }

    /// Append a change set. Call while holding the publication lock.
    pub fn enqueue(&self, change: ChangeSet) -> SnapshotResult<Ticket> {
        let mut state = self.state.lock().map_err(poisoned("delivery queue"))?;
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.pending.push_back((ticket, change));
        Ok(ticket)
    }

    /// Deliver every change set up to and including `ticket`.
    ///
    /// Returns the number of change sets this call delivered. Returns 0
    /// immediately when called from inside a delivery on the same thread.
    pub fn deliver_through<F>(&self, ticket: Ticket, mut notify: F) -> SnapshotResult<usize>
    where
        F: FnMut(&ChangeSet),
    {
        if self.is_draining_here() {
            return Ok(0);
        }

        let mut delivered = 0;
        let mut state = self.state.lock().map_err(poisoned("delivery queue"))?;
        loop {
            if state.completed > ticket {
                return Ok(delivered);
            }
            if state.delivering {
                state = self
                    .delivered
                    .wait(state)
                    .map_err(poisoned("delivery queue"))?;
                continue;
            }

            state.delivering = true;
            drop(state);
            delivered += self.drain(&mut notify)?;
            state = self.state.lock().map_err(poisoned("delivery queue"))?;
        }
    }

    /// Change sets waiting for delivery
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }

    fn drain<F>(&self, notify: &mut F) -> SnapshotResult<usize>
    where
        F: FnMut(&ChangeSet),
    {
        let _guard = DrainGuard::enter(self);
        let mut count = 0;
        loop {
            let next = {
                let mut state = self.state.lock().map_err(poisoned("delivery queue"))?;
                let next = state.pending.pop_front();
                if let Some((ticket, _)) = &next {
                    state.dispatched = ticket + 1;
                }
                next
            };
            let Some((ticket, change)) = next else {
                return Ok(count);
            };

            notify(&change);
            count += 1;

            let mut state = self.state.lock().map_err(poisoned("delivery queue"))?;
            state.completed = ticket + 1;
        }
    }

    fn is_draining_here(&self) -> bool {
        DRAINING.with(|d| d.borrow().contains(&self.id))
    }
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks this thread as the drainer; releases the role on drop, panics included.
struct DrainGuard<'a> {
    queue: &'a DeliveryQueue,
}

impl<'a> DrainGuard<'a> {
    fn enter(queue: &'a DeliveryQueue) -> Self {
        DRAINING.with(|d| d.borrow_mut().push(queue.id));
        Self { queue }
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        DRAINING.with(|d| d.borrow_mut().retain(|id| *id != self.queue.id));
        let mut state = self
            .queue
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // A panicking observer forfeits the change set it was handed.
        state.completed = state.completed.max(state.dispatched);
        state.delivering = false;
        drop(state);
        self.queue.delivered.notify_all();
    }
}
