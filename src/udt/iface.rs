/*!
Datagram transport interface.

Responsibilities:
- Keep exactly one wildcard receive posted on the dedicated endpoint
  `ep_any` at all times; incoming connects land there.
- Progress: probe the provider for a completed datagram id and dispatch it —
  the wildcard id goes to the wildcard handler, anything else to the
  per-endpoint reply handler. Errors are logged, never propagated out of
  progress.
- Route active messages to their registered callbacks, honoring the
  sync/async contract: a callback registered SYNC must not run from async
  (timer) context, so such receives are parked on the `sync_am_events` FIFO
  and delivered by the next synchronous progress call, in detection order,
  before any new probe.
- Track descriptor ownership across the callback boundary: a callback that
  returns `Retain` owns the descriptor until `release_am_desc` trades the
  token back.

Context discipline: the owner drives this interface from one worker; the
sync entry point (`progress`) and the async entry point (`timer_tick`)
require `&mut self` and therefore cannot interleave. The provider gate is
the only lock taken, and only around provider calls.
*/

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
use log::{debug, error, trace, warn};

use crate::config::UdtConfig;
use crate::pending::Arbiter;
use crate::pool::Pool;
use crate::provider::{NicEp, ProviderGate, DATAGRAM_MAX_SIZE, UDT_ANY};
use crate::status::{Error, Result};
use crate::timer::{SlowTimer, UDT_SLOW_TICK};

use super::desc::{DescToken, UdtDesc};
use super::ep::UdtEp;
use super::wire::{MsgType, UDT_HEADER_LEN};

/// Number of active-message ids the interface dispatches on.
pub const MAX_AM: usize = 32;

bitflags! {
    /// Interface capabilities reported by `query`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IfaceFlags: u32 {
        const AM_SHORT         = 1 << 0;
        const AM_BCOPY         = 1 << 1;
        const CONNECT_TO_IFACE = 1 << 2;
        const PENDING          = 1 << 3;
        const AM_CB_SYNC       = 1 << 4;
        const AM_CB_ASYNC      = 1 << 5;
    }

    /// Invocation-context contract of a registered callback.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AmFlags: u32 {
        /// Only invoke from synchronous progress.
        const SYNC  = 1 << 0;
        /// Safe to invoke from async (timer) context.
        const ASYNC = 1 << 1;
    }
}

/// Interface attributes reported to upper layers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IfaceAttr {
    pub flags: IfaceFlags,
    pub max_short: usize,
    pub max_bcopy: usize,
    /// Per-message CPU cost estimate, seconds.
    pub overhead: f64,
    /// One-way latency estimate, seconds.
    pub latency: f64,
    /// Bytes per second.
    pub bandwidth: f64,
}

/// A received active message as presented to its callback.
pub struct AmMessage<'a> {
    pub am_id: u8,
    pub payload: &'a [u8],
    /// Redeemable proof of descriptor ownership, meaningful only when the
    /// callback returns `Retain`.
    pub token: DescToken,
}

/// What the callback decided about the receive descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmAction {
    /// The transport recycles the descriptor immediately.
    Release,
    /// The user keeps the descriptor (zero-copy) and returns it later via
    /// `release_am_desc`.
    Retain,
}

type AmCallback = Box<dyn FnMut(AmMessage<'_>) -> AmAction>;

struct AmHandler {
    cb: AmCallback,
    flags: AmFlags,
}

/// Which worker context the receive path is running in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchCtx {
    Sync,
    Async,
}

/// Record parking one receive until synchronous dispatch.
pub(crate) struct QueuedAm {
    desc: Option<Box<UdtDesc>>,
}

impl QueuedAm {
    fn new() -> Self {
        Self { desc: None }
    }
}

pub struct UdtIface {
    pub(crate) provider: Arc<ProviderGate>,
    pub(crate) free_desc: Pool<UdtDesc>,
    free_queue: Pool<QueuedAm>,
    sync_am_events: VecDeque<Box<QueuedAm>>,
    am_handlers: [Option<AmHandler>; MAX_AM],
    pub(crate) eps: HashMap<u64, UdtEp>,
    ep_any: NicEp,
    /// The descriptor currently backing the wildcard post.
    desc_any: Option<Box<UdtDesc>>,
    /// Receive descriptors retained by user callbacks, by token.
    held: HashMap<DescToken, Box<UdtDesc>>,
    next_token: u64,
    next_ep_key: u64,
    pub(crate) outstanding: u64,
    slow_timer: SlowTimer,
    pub(crate) arbiter: Arbiter,
}

impl UdtIface {
    /// Bring the interface up: create the wildcard endpoint, seed the
    /// pools, and post the first wildcard receive. `now` anchors the slow
    /// timer; the owner passes the same clock to `timer_tick`.
    pub fn new(provider: Arc<ProviderGate>, config: &UdtConfig, now: Instant) -> Result<Self> {
        let ep_any = provider.lock().create_ep().map_err(|e| {
            error!("failed to create the wildcard endpoint: {e}");
            Error::NoDevice
        })?;

        let rx_headroom = config.rx_headroom;
        let mut free_desc = Pool::new("udt-desc", 128, config.max_bufs, move || {
            UdtDesc::new(rx_headroom)
        });
        let free_queue = Pool::new("udt-queued-am", 128, config.max_bufs, QueuedAm::new);
        let desc_any = free_desc.get().ok_or(Error::NoResource)?;

        let mut iface = Self {
            provider,
            free_desc,
            free_queue,
            sync_am_events: VecDeque::new(),
            am_handlers: std::array::from_fn(|_| None),
            eps: HashMap::new(),
            ep_any,
            desc_any: Some(desc_any),
            held: HashMap::new(),
            next_token: 0,
            next_ep_key: 1, // 0 is the wildcard id
            outstanding: 0,
            slow_timer: SlowTimer::new(UDT_SLOW_TICK / 4, now),
            arbiter: Arbiter::new(),
        };
        if let Err(e) = iface.post_wildcard() {
            // Without the first wildcard receive the interface cannot
            // accept connections at all.
            error!("failed to post the initial wildcard receive: {e}");
            return Err(e);
        }
        Ok(iface)
    }

    /// Create an endpoint connected to this interface's peer space and
    /// return its id.
    pub fn create_ep(&mut self) -> Result<u64> {
        let nic_ep = self.provider.lock().create_ep()?;
        let key = self.next_ep_key;
        self.next_ep_key += 1;
        self.eps.insert(
            key,
            UdtEp {
                nic_ep,
                hash_key: key,
                outstanding: 0,
                posted_desc: None,
                pending: VecDeque::new(),
            },
        );
        Ok(key)
    }

    /// Register the callback for `id`. `flags` declares the context the
    /// callback tolerates; SYNC callbacks observed from async context are
    /// deferred to the next synchronous progress call.
    pub fn set_am_handler(
        &mut self,
        id: u8,
        flags: AmFlags,
        cb: impl FnMut(AmMessage<'_>) -> AmAction + 'static,
    ) -> Result<()> {
        if (id as usize) >= MAX_AM {
            return Err(Error::InvalidParam("active-message id out of range"));
        }
        self.am_handlers[id as usize] = Some(AmHandler {
            cb: Box::new(cb),
            flags,
        });
        Ok(())
    }

    /// Interface capabilities and size limits.
    pub fn query(&self) -> IfaceAttr {
        IfaceAttr {
            flags: IfaceFlags::AM_SHORT
                | IfaceFlags::AM_BCOPY
                | IfaceFlags::CONNECT_TO_IFACE
                | IfaceFlags::PENDING
                | IfaceFlags::AM_CB_SYNC
                | IfaceFlags::AM_CB_ASYNC,
            max_short: DATAGRAM_MAX_SIZE - UDT_HEADER_LEN,
            max_bcopy: DATAGRAM_MAX_SIZE - UDT_HEADER_LEN,
            overhead: 1e-6,
            latency: 40e-6,
            bandwidth: (1024 * 1024) as f64,
        }
    }

    /// Synchronous progress: deliver deferred sync receives first, then
    /// run one probe pass, then give the pending queue one dispatch
    /// opportunity.
    pub fn progress(&mut self) {
        while !self.sync_am_events.is_empty() {
            self.dispatch_queued_am();
        }
        self.progress_core(DispatchCtx::Sync);
        self.dispatch_pending();
    }

    /// Async progress, driven by the owner's timer at whatever rate it
    /// likes; the slow timer rate-limits the sweep to a quarter of the
    /// 100 ms slow tick.
    pub fn timer_tick(&mut self, now: Instant) {
        if !self.slow_timer.sweep(now) {
            return;
        }
        trace!("slow timer sweep");
        self.progress_core(DispatchCtx::Async);
        self.dispatch_pending();
    }

    /// Hand a retained receive descriptor back to the transport.
    pub fn release_am_desc(&mut self, token: DescToken) -> Result<()> {
        let mut desc = self
            .held
            .remove(&token)
            .ok_or(Error::InvalidParam("unknown receive descriptor token"))?;
        debug!("releasing retained AM descriptor");
        desc.reset();
        self.free_desc.put(desc);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    // One probe pass: ask the provider for a completed datagram id and
    // dispatch it.
    pub(crate) fn progress_core(&mut self, ctx: DispatchCtx) {
        let probed = self.provider.lock().probe_datagram();
        match probed {
            Ok(None) => {}
            Err(e) => error!("datagram probe failed: {e}"),
            Ok(Some(UDT_ANY)) => self.process_wildcard_datagram(ctx),
            Ok(Some(id)) => self.process_reply_datagram(id, ctx),
        }
    }

    // A peer connected to the interface: the wildcard post completed.
    fn process_wildcard_datagram(&mut self, ctx: DispatchCtx) {
        let waited = self.provider.lock().wait_datagram(self.ep_any, UDT_ANY);
        let wait = match waited {
            Ok(wait) => wait,
            Err(e) => {
                error!("wait-by-id on the wildcard post failed: {e}");
                return;
            }
        };

        let mut desc = self
            .desc_any
            .take()
            .expect("wildcard descriptor slot is empty");
        desc.fill_recv(&wait.data)
            .expect("malformed wildcard datagram");
        assert!(
            desc.recv_header.msg_type == MsgType::Payload,
            "wildcard completion without a payload"
        );

        if self.requires_sync(desc.recv_header.am_id) && ctx == DispatchCtx::Async {
            // Park for the progress thread; rotate a fresh wildcard
            // descriptor in.
            self.queue_rx_desc(desc);
        } else {
            match self.attempt_am(desc) {
                Some(mut done) => {
                    done.reset();
                    self.free_desc.put(done);
                }
                None => debug!("keeping the wildcard desc for a later AM release"),
            }
        }
        self.desc_any = Some(
            self.free_desc
                .get()
                .expect("descriptor pool exhausted while rotating the wildcard receive"),
        );
        if let Err(e) = self.post_wildcard() {
            error!("failed to re-post the wildcard receive: {e}");
        }
    }

    // A reply for a datagram this interface posted on one of its
    // endpoints.
    fn process_reply_datagram(&mut self, id: u64, ctx: DispatchCtx) {
        let Some(ep) = self.eps.get(&id) else {
            error!("cannot look up endpoint with id {id:#x}");
            return;
        };
        let nic_ep = ep.nic_ep;

        let waited = self.provider.lock().wait_datagram(nic_ep, id);
        let wait = match waited {
            Ok(wait) => wait,
            Err(e) => {
                error!("wait-by-id on endpoint {id:#x} failed: {e}");
                return;
            }
        };

        let mut desc = self
            .eps
            .get_mut(&id)
            .expect("endpoint vanished during reply handling")
            .posted_desc
            .take()
            .expect("reply completion without a posted descriptor");
        desc.fill_recv(&wait.data).expect("malformed reply datagram");

        if desc.recv_header.msg_type == MsgType::Payload {
            if self.requires_sync(desc.recv_header.am_id) && ctx == DispatchCtx::Async {
                self.queue_rx_desc(desc);
            } else {
                match self.attempt_am(desc) {
                    Some(mut done) => {
                        done.reset();
                        self.free_desc.put(done);
                    }
                    None => debug!("keeping the endpoint desc for a later AM release"),
                }
            }
        } else {
            // No data, just an ack.
            desc.reset();
            self.free_desc.put(desc);
        }

        self.outstanding -= 1;
        let ep = self
            .eps
            .get_mut(&id)
            .expect("endpoint vanished during reply handling");
        ep.outstanding -= 1;
    }

    // Invoke the registered callback for the descriptor's active message.
    // Returns the descriptor when the transport keeps ownership, `None`
    // when the callback retained it.
    fn attempt_am(&mut self, desc: Box<UdtDesc>) -> Option<Box<UdtDesc>> {
        let am_id = desc.recv_header.am_id as usize;
        trace!(
            "RX: AM am_id {am_id} length {}",
            desc.recv_header.length
        );

        let Some(handler) = self.am_handlers.get_mut(am_id).and_then(Option::as_mut) else {
            warn!("no handler registered for active-message id {am_id}, dropping");
            return Some(desc);
        };

        let token = DescToken(self.next_token);
        self.next_token += 1;

        let action = (handler.cb)(AmMessage {
            am_id: am_id as u8,
            payload: desc.recv_payload(),
            token,
        });
        match action {
            AmAction::Release => Some(desc),
            AmAction::Retain => {
                self.held.insert(token, desc);
                None
            }
        }
    }

    // Park a receive for synchronous delivery.
    fn queue_rx_desc(&mut self, desc: Box<UdtDesc>) {
        let mut record = self
            .free_queue
            .get()
            .expect("queued-AM record pool exhausted");
        record.desc = Some(desc);
        self.sync_am_events.push_back(record);
    }

    // Deliver one deferred receive in synchronous context.
    fn dispatch_queued_am(&mut self) {
        let Some(mut record) = self.sync_am_events.pop_front() else {
            return;
        };
        let desc = record
            .desc
            .take()
            .expect("queued AM record without a descriptor");
        self.free_queue.put(record);

        match self.attempt_am(desc) {
            Some(mut done) => {
                done.reset();
                self.free_desc.put(done);
            }
            None => debug!("keeping desc from the sync dispatcher for a later AM release"),
        }
    }

    fn requires_sync(&self, am_id: u8) -> bool {
        self.am_handlers
            .get(am_id as usize)
            .and_then(Option::as_ref)
            .is_some_and(|h| h.flags.contains(AmFlags::SYNC))
    }

    // (Re-)post the wildcard receive with an EMPTY send header: the peer
    // that matches it only gets an ack.
    fn post_wildcard(&mut self) -> Result<()> {
        let desc = self
            .desc_any
            .as_mut()
            .expect("wildcard descriptor slot is empty");
        desc.reset();
        let msg = desc.send_bytes();
        self.provider
            .lock()
            .post_datagram(self.ep_any, UDT_ANY, &msg, DATAGRAM_MAX_SIZE)
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

impl Drop for UdtIface {
    fn drop(&mut self) {
        if let Err(e) = self.provider.lock().cancel_datagram(self.ep_any, UDT_ANY) {
            debug!("wildcard post cancel failed during teardown: {e}");
        }
        if let Some(mut desc) = self.desc_any.take() {
            desc.reset();
            self.free_desc.put(desc);
        }
        // Deferred sync receives still get their delivery.
        while !self.sync_am_events.is_empty() {
            self.dispatch_queued_am();
        }
        if let Err(e) = self.provider.lock().destroy_ep(self.ep_any) {
            debug!("wildcard endpoint destroy failed during teardown: {e}");
        }
        // Descriptors still held by the user are tolerated here; the pools
        // log what never came home.
        self.free_desc.cleanup(true);
        self.free_queue.cleanup(true);
    }
}
