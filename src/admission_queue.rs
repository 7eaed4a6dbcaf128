use std::collections::VecDeque;

use parking_lot::Mutex;

/// A deferred request: `start` is invoked once a slot frees up, on the same
/// mutex-serialized path that released it, so no other admission can race
/// in between the decrement and the dequeue.
type Waiter = Box<dyn FnOnce() + Send>;

/// Counts active tunnels, queues pending requests once `max` is hit, and
/// releases one waiter per tunnel close — FIFO, no preemption.
pub struct AdmissionQueue {
    max: Option<usize>,
    state: Mutex<State>,
}

struct State {
    active: usize,
    waiters: VecDeque<Waiter>,
}

impl AdmissionQueue {
    pub fn new(max: Option<usize>) -> Self {
        AdmissionQueue {
            max,
            state: Mutex::new(State {
                active: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Returns `true` and counts the caller in `active` if under the cap;
    /// otherwise enqueues `start` and returns `false`. `start` is *not*
    /// invoked here — the caller proceeds synchronously on `true`, and is
    /// invoked later (from another admission's `release`) on enqueue.
    pub fn admit(&self, start: impl FnOnce() + Send + 'static) -> bool {
        let mut state = self.state.lock();
        if self.max.map(|m| state.active < m).unwrap_or(true) {
            state.active += 1;
            true
        } else {
            state.waiters.push_back(Box::new(start));
            false
        }
    }

    /// Decrements `active` and, if waiters remain, dequeues and runs one
    /// `start` while still holding the slot it was just given (active stays
    /// incremented across this hand-off — the waiter is never double
    /// counted and never"leaks" a slot that was already released).
    pub fn release(&self) {
        let next = {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
            let next = state.waiters.pop_front();
            if next.is_some() {
                state.active += 1;
            }
            next
        };
        if let Some(start) = next {
            start();
        }
    }

    #[cfg(test)]
    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    #[cfg(test)]
    pub fn queued(&self) -> usize {
        self.state.lock().waiters.len()
    }
}
