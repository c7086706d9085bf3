/*!
RDMA-side interface state: atomic-post descriptors, the completion queue
drain, and per-endpoint bookkeeping.

The public atomic operations live in `amo::facade`; this module owns the
machinery they run on:
- a pool of FMA descriptors tracking in-flight 64-bit atomic posts,
- the completion-queue progress loop: drain every ready event, invoke the
  completion (a countdown the facade spins on), decrement interface and
  endpoint outstanding counts, recycle the descriptor unless it is marked
  not-ready-to-free (then it is parked so the facade can harvest the fetch
  result), and finally dispatch one pending-queue entry via arbitration,
- endpoint create/destroy and the pending-request hooks upper layers use to
  park retries.
*/

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use log::{debug, error, trace, warn};

use crate::config::RdmaConfig;
use crate::pending::{Arbiter, PendingReq};
use crate::pool::Pool;
use crate::provider::{CqPoll, NicEp, ProviderGate};
use crate::status::{Error, Result};

/// Countdown completion shared between a posted operation and its waiter.
///
/// The facade arms fetching operations with a count of 2 and spins progress
/// until the count reaches 1; the completion-queue drain performs the single
/// decrement when the post completes.
pub struct Completion {
    count: Cell<i32>,
}

impl Completion {
    pub fn new(count: i32) -> Rc<Self> {
        Rc::new(Self {
            count: Cell::new(count),
        })
    }

    /// Record one completion.
    pub fn signal(&self) {
        self.count.set(self.count.get() - 1);
    }

    pub fn count(&self) -> i32 {
        self.count.get()
    }
}

/// In-flight record for one 64-bit atomic post.
pub(crate) struct FmaDesc {
    pub(crate) post_id: u64,
    /// Owning endpoint id, for the outstanding decrement at completion.
    pub(crate) ep: u64,
    pub(crate) comp: Option<Rc<Completion>>,
    /// Pre-op value delivered by the completion for fetching commands.
    pub(crate) result: Cell<u64>,
    /// When set, the completion path parks the descriptor instead of
    /// recycling it; the poster still needs to read `result`.
    pub(crate) not_ready_to_free: bool,
}

impl FmaDesc {
    fn new() -> Self {
        Self {
            post_id: 0,
            ep: 0,
            comp: None,
            result: Cell::new(0),
            not_ready_to_free: false,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.post_id = 0;
        self.ep = 0;
        self.comp = None;
        self.result.set(0);
        self.not_ready_to_free = false;
    }
}

pub(crate) struct RdmaEp {
    pub(crate) nic_ep: NicEp,
    pub(crate) outstanding: u64,
    pub(crate) pending: VecDeque<PendingReq>,
}

/// Interface for remote atomic operations over the provider's FMA path.
pub struct RdmaIface {
    pub(crate) provider: Arc<ProviderGate>,
    pub(crate) free_desc_famo: Pool<FmaDesc>,
    /// Posts awaiting a completion-queue event, by post id.
    pub(crate) inflight: HashMap<u64, Box<FmaDesc>>,
    /// Completed fetch posts whose result the facade has not harvested yet.
    pub(crate) parked: HashMap<u64, Box<FmaDesc>>,
    pub(crate) eps: HashMap<u64, RdmaEp>,
    pub(crate) arbiter: Arbiter,
    pub(crate) outstanding: u64,
    next_post_id: u64,
    next_ep_id: u64,
}

impl RdmaIface {
    pub fn new(provider: Arc<ProviderGate>, config: &RdmaConfig) -> Self {
        Self {
            provider,
            free_desc_famo: Pool::new("rdma-famo-desc", 128, config.max_bufs, FmaDesc::new),
            inflight: HashMap::new(),
            parked: HashMap::new(),
            eps: HashMap::new(),
            arbiter: Arbiter::new(),
            outstanding: 0,
            next_post_id: 0,
            next_ep_id: 0,
        }
    }

    /// Create an endpoint for atomic operations and return its id.
    pub fn create_ep(&mut self) -> Result<u64> {
        let nic_ep = self.provider.lock().create_ep()?;
        self.next_ep_id += 1;
        let id = self.next_ep_id;
        self.eps.insert(
            id,
            RdmaEp {
                nic_ep,
                outstanding: 0,
                pending: VecDeque::new(),
            },
        );
        Ok(id)
    }

    pub fn destroy_ep(&mut self, ep: u64) -> Result<()> {
        let entry = self
            .eps
            .remove(&ep)
            .ok_or(Error::InvalidParam("unknown endpoint"))?;
        if entry.outstanding != 0 {
            warn!(
                "destroying endpoint {ep:#x} with {} outstanding atomic post(s)",
                entry.outstanding
            );
        }
        if !entry.pending.is_empty() {
            debug!(
                "dropping {} pending request(s) on endpoint {ep:#x} teardown",
                entry.pending.len()
            );
        }
        self.arbiter.deschedule(ep);
        self.provider.lock().destroy_ep(entry.nic_ep)
    }

    pub(crate) fn lookup_nic_ep(&self, ep: u64) -> Result<NicEp> {
        self.eps
            .get(&ep)
            .map(|e| e.nic_ep)
            .ok_or(Error::InvalidParam("unknown endpoint"))
    }

    pub(crate) fn alloc_post_id(&mut self) -> u64 {
        self.next_post_id += 1;
        self.next_post_id
    }

    /// Drain the completion queue, then give the pending queue one dispatch
    /// opportunity.
    pub fn progress(&mut self) {
        while self.progress_events() {}
        self.dispatch_pending();
    }

    // One completion-queue poll. Returns true while the drain should
    // continue.
    fn progress_events(&mut self) -> bool {
        let poll = self.provider.lock().cq_get_event();
        let event = match poll {
            CqPoll::NotDone => return false,
            CqPoll::Overrun => {
                error!("completion queue overrun, events lost");
                return false;
            }
            CqPoll::Event(event) => event,
        };

        let cqe = match self.provider.lock().cq_get_completed(event) {
            Ok(cqe) => cqe,
            Err(e) => {
                error!("resolving completion event failed: {e}");
                return false;
            }
        };

        let Some(mut desc) = self.inflight.remove(&cqe.post_id) else {
            error!("completion for unknown post id {:#x}", cqe.post_id);
            return true;
        };
        trace!("completion received for post {:#x}", desc.post_id);

        if let Some(value) = cqe.result {
            desc.result.set(value);
        }
        if let Some(comp) = desc.comp.as_ref() {
            comp.signal();
        }

        self.outstanding -= 1;
        if let Some(ep) = self.eps.get_mut(&desc.ep) {
            ep.outstanding -= 1;
        }

        if desc.not_ready_to_free {
            self.parked.insert(cqe.post_id, desc);
        } else {
            desc.reset();
            self.free_desc_famo.put(desc);
        }
        true
    }

    /// Park a retry request on an endpoint; it runs during a later progress
    /// pass once the arbiter reaches the endpoint.
    pub fn ep_pending_add(&mut self, ep: u64, req: PendingReq) -> Result<()> {
        let entry = self
            .eps
            .get_mut(&ep)
            .ok_or(Error::InvalidParam("unknown endpoint"))?;
        entry.pending.push_back(req);
        self.arbiter.schedule(ep);
        Ok(())
    }

    /// Drop every pending request parked on the endpoint. Returns how many
    /// were discarded.
    pub fn ep_pending_purge(&mut self, ep: u64) -> Result<usize> {
        let entry = self
            .eps
            .get_mut(&ep)
            .ok_or(Error::InvalidParam("unknown endpoint"))?;
        let purged = entry.pending.len();
        entry.pending.clear();
        self.arbiter.deschedule(ep);
        Ok(purged)
    }

    // Dispatch at most one pending request, rotating across endpoints.
    pub(crate) fn dispatch_pending(&mut self) {
        let Some(id) = self.arbiter.pop() else {
            return;
        };
        let Some(ep) = self.eps.get_mut(&id) else {
            return;
        };
        let Some(mut req) = ep.pending.pop_front() else {
            return;
        };
        match req.dispatch() {
            Ok(()) => {
                if !ep.pending.is_empty() {
                    self.arbiter.push_back(id);
                }
            }
            Err(Error::NoResource) => {
                ep.pending.push_front(req);
                self.arbiter.push_back(id);
            }
            Err(e) => {
                debug!("pending request on endpoint {id:#x} failed: {e}");
                if !ep.pending.is_empty() {
                    self.arbiter.push_back(id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockNic;

    fn iface_with_mock() -> (RdmaIface, MockNic) {
        let nic = MockNic::new();
        let gate = Arc::new(ProviderGate::new(Box::new(nic.clone())));
        (RdmaIface::new(gate, &RdmaConfig::default()), nic)
    }

    #[test]
    fn pending_dispatch_rotates_across_endpoints() {
        let (mut iface, _nic) = iface_with_mock();
        let a = iface.create_ep().unwrap();
        let b = iface.create_ep().unwrap();

        let order = Rc::new(std::cell::RefCell::new(Vec::new()));
        for (ep, tag) in [(a, "a1"), (a, "a2"), (b, "b1")] {
            let order = order.clone();
            iface
                .ep_pending_add(
                    ep,
                    PendingReq::new(move || {
                        order.borrow_mut().push(tag);
                        Ok(())
                    }),
                )
                .unwrap();
        }

        // One entry per progress pass, endpoints rotating fairly.
        iface.progress();
        iface.progress();
        iface.progress();
        assert_eq!(*order.borrow(), vec!["a1", "b1", "a2"]);
    }

    #[test]
    fn pending_requeues_on_no_resource() {
        let (mut iface, _nic) = iface_with_mock();
        let ep = iface.create_ep().unwrap();

        let tries = Rc::new(Cell::new(0));
        let tries_cb = tries.clone();
        iface
            .ep_pending_add(
                ep,
                PendingReq::new(move || {
                    tries_cb.set(tries_cb.get() + 1);
                    if tries_cb.get() < 3 {
                        Err(Error::NoResource)
                    } else {
                        Ok(())
                    }
                }),
            )
            .unwrap();

        iface.progress();
        iface.progress();
        iface.progress();
        assert_eq!(tries.get(), 3);
        // Queue drained: further passes do not run the callback again.
        iface.progress();
        assert_eq!(tries.get(), 3);
    }

    #[test]
    fn purge_discards_parked_requests() {
        let (mut iface, _nic) = iface_with_mock();
        let ep = iface.create_ep().unwrap();
        iface.ep_pending_add(ep, PendingReq::new(|| Ok(()))).unwrap();
        iface.ep_pending_add(ep, PendingReq::new(|| Ok(()))).unwrap();
        assert_eq!(iface.ep_pending_purge(ep).unwrap(), 2);
        iface.progress();
        assert_eq!(iface.ep_pending_purge(ep).unwrap(), 0);
    }
}
