/*!
Datagram endpoint: the single-post send path and endpoint teardown.

Invariant: at most one datagram is in flight per endpoint. A send while
`posted_desc` is occupied fails with `NoResource`; the caller either retries
after progress or parks a pending request. Because only one post exists at a
time, per-endpoint completions arrive in submission order.

Endpoints are owned by the interface and addressed by their hash key, which
doubles as the datagram id the provider matches on. Id 0 is reserved for the
wildcard receive.
*/

use std::collections::VecDeque;

use log::{debug, error, trace, warn};

use crate::pending::PendingReq;
use crate::provider::{NicEp, PostState, DATAGRAM_MAX_SIZE};
use crate::status::{Error, Result};

use super::desc::UdtDesc;
use super::iface::{UdtIface, MAX_AM};
use super::wire::{MsgType, UDT_HEADER_LEN};

pub(crate) struct UdtEp {
    pub(crate) nic_ep: NicEp,
    /// Datagram id this endpoint posts under; also its key in the
    /// interface's endpoint table.
    pub(crate) hash_key: u64,
    pub(crate) outstanding: u32,
    /// The single in-flight descriptor, if any.
    pub(crate) posted_desc: Option<Box<UdtDesc>>,
    pub(crate) pending: VecDeque<PendingReq>,
}

impl UdtIface {
    /// Send a short active message: an 8-byte immediate header plus
    /// `payload`, copied into a transport descriptor.
    pub fn am_short(&mut self, ep: u64, id: u8, header: u64, payload: &[u8]) -> Result<()> {
        if (id as usize) >= MAX_AM {
            return Err(Error::InvalidParam("active-message id out of range"));
        }
        let max = DATAGRAM_MAX_SIZE - UDT_HEADER_LEN - std::mem::size_of_val(&header);
        if payload.len() > max {
            return Err(Error::InvalidParam("payload exceeds active-message limit"));
        }
        trace!("TX: AM_SHORT am_id {id} length {}", payload.len());
        self.am_common_send(ep, id, |desc| desc.pack_short(header, payload))
            .map(|_| ())
    }

    /// Send an active message packed by the caller directly into the send
    /// buffer. Returns the packed byte count reported by `pack`.
    pub fn am_bcopy(
        &mut self,
        ep: u64,
        id: u8,
        pack: impl FnOnce(&mut [u8]) -> usize,
    ) -> Result<usize> {
        if (id as usize) >= MAX_AM {
            return Err(Error::InvalidParam("active-message id out of range"));
        }
        trace!("TX: AM_BCOPY am_id {id}");
        self.am_common_send(ep, id, |desc| {
            desc.pack_bcopy(pack);
        })
    }

    // Shared send path. `fill` writes the payload and the send length into
    // the descriptor; the header type and am id are stamped here.
    fn am_common_send(
        &mut self,
        ep_id: u64,
        id: u8,
        fill: impl FnOnce(&mut UdtDesc),
    ) -> Result<usize> {
        let ep = self
            .eps
            .get_mut(&ep_id)
            .ok_or(Error::InvalidParam("unknown endpoint"))?;
        if ep.posted_desc.is_some() {
            trace!("endpoint {:#x} already has a datagram in flight", ep.hash_key);
            return Err(Error::NoResource);
        }

        let Some(mut desc) = self.free_desc.get() else {
            return Err(Error::NoResource);
        };
        debug!("got descriptor for active-message send");
        // Prime the receive side: an ack-only reply decodes as EMPTY.
        desc.reset();

        fill(&mut desc);
        desc.send_header.am_id = id;
        desc.send_header.msg_type = MsgType::Payload;
        let length = desc.send_header.length as usize;
        assert!(
            length <= DATAGRAM_MAX_SIZE,
            "datagram payload exceeds the provider segment size"
        );

        let msg = desc.send_bytes();
        let posted =
            self.provider
                .lock()
                .post_datagram(ep.nic_ep, ep.hash_key, &msg, DATAGRAM_MAX_SIZE);
        match posted {
            Ok(()) => {
                ep.posted_desc = Some(desc);
                ep.outstanding += 1;
                self.outstanding += 1;
                Ok(length)
            }
            // The transport built this post itself; a parameter rejection
            // is a provider contract breach, not a runtime condition.
            Err(Error::InvalidParam(reason)) => {
                panic!("provider rejected datagram post parameters: {reason}")
            }
            Err(e) => {
                self.free_desc.put(desc);
                Err(e)
            }
        }
    }

    /// Tear an endpoint down. An in-flight post is canceled and drained
    /// under the provider gate before the endpoint is destroyed.
    pub fn destroy_ep(&mut self, ep_id: u64) -> Result<()> {
        let mut ep = self
            .eps
            .remove(&ep_id)
            .ok_or(Error::InvalidParam("unknown endpoint"))?;
        self.arbiter.deschedule(ep_id);
        if !ep.pending.is_empty() {
            debug!(
                "dropping {} pending request(s) on endpoint {ep_id:#x} teardown",
                ep.pending.len()
            );
            ep.pending.clear();
        }

        if let Some(desc) = ep.posted_desc.take() {
            let mut nic = self.provider.lock();
            if let Err(e) = nic.cancel_datagram(ep.nic_ep, ep.hash_key) {
                error!("datagram cancel failed on endpoint teardown: {e}");
            }
            let waited = nic.wait_datagram(ep.nic_ep, ep.hash_key);
            drop(nic);
            match waited {
                Ok(wait) => {
                    assert!(
                        wait.state == PostState::Terminated,
                        "canceled datagram post did not terminate"
                    );
                    ep.outstanding -= 1;
                    self.outstanding -= 1;
                    self.free_desc.put(desc);
                }
                Err(e) => {
                    // The post state is unknown; the descriptor cannot be
                    // reused and is dropped. Pool cleanup will report it.
                    error!("wait after cancel failed on endpoint teardown: {e}");
                }
            }
        }
        if ep.outstanding != 0 {
            warn!(
                "endpoint {ep_id:#x} destroyed with outstanding count {}",
                ep.outstanding
            );
        }
        self.provider.lock().destroy_ep(ep.nic_ep)
    }

    /// Park a retry request on the endpoint; dispatched one per progress
    /// pass via the interface arbiter.
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

    /// `Ok` iff the endpoint has nothing in flight and nothing pending;
    /// otherwise progresses once and reports `NoResource` so the caller
    /// retries.
    pub fn ep_flush(&mut self, ep: u64) -> Result<()> {
        let entry = self
            .eps
            .get(&ep)
            .ok_or(Error::InvalidParam("unknown endpoint"))?;
        if entry.outstanding == 0 && entry.pending.is_empty() {
            return Ok(());
        }
        self.progress();
        Err(Error::NoResource)
    }
}
