/*!
Pending-send requests and the round-robin arbiter over endpoints.

When a send returns `NoResource` (the endpoint already has a datagram in
flight, or a descriptor pool ran dry), callers may park a retry callback on
the endpoint via `pending_add`. Each progress pass dispatches at most one
request, rotating fairly across endpoints that have queued work. A request
that still cannot make progress returns `NoResource` and is requeued at the
front of its endpoint's queue; the endpoint goes to the back of the
rotation.
*/

use std::collections::VecDeque;
use std::fmt;

use crate::status::Result;

/// A parked retry callback. `Ok` removes it from the queue; `NoResource`
/// keeps it at the front for a later pass; any other error drops it.
pub struct PendingReq {
    cb: Box<dyn FnMut() -> Result<()>>,
}

impl PendingReq {
    pub fn new(cb: impl FnMut() -> Result<()> + 'static) -> Self {
        Self { cb: Box::new(cb) }
    }

    pub(crate) fn dispatch(&mut self) -> Result<()> {
        (self.cb)()
    }
}

impl fmt::Debug for PendingReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PendingReq")
    }
}

/// Rotation of endpoint ids with non-empty pending queues.
#[derive(Debug, Default)]
pub(crate) struct Arbiter {
    rotation: VecDeque<u64>,
}

impl Arbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an endpoint to the rotation if it is not already scheduled.
    pub fn schedule(&mut self, group: u64) {
        if !self.rotation.contains(&group) {
            self.rotation.push_back(group);
        }
    }

    /// Drop an endpoint from the rotation (teardown, purge).
    pub fn deschedule(&mut self, group: u64) {
        self.rotation.retain(|g| *g != group);
    }

    pub fn pop(&mut self) -> Option<u64> {
        self.rotation.pop_front()
    }

    pub fn push_back(&mut self, group: u64) {
        self.rotation.push_back(group);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_is_idempotent() {
        let mut arb = Arbiter::new();
        arb.schedule(3);
        arb.schedule(3);
        arb.schedule(5);
        assert_eq!(arb.pop(), Some(3));
        assert_eq!(arb.pop(), Some(5));
        assert_eq!(arb.pop(), None);
    }

    #[test]
    fn deschedule_removes_group() {
        let mut arb = Arbiter::new();
        arb.schedule(1);
        arb.schedule(2);
        arb.deschedule(1);
        assert_eq!(arb.pop(), Some(2));
        assert_eq!(arb.pop(), None);
    }
}
