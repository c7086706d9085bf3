/*!
Public atomic operations and the provider submission machinery.

Every 64-bit primitive follows the same pattern: reject misaligned
addresses before touching the provider, then submit in a loop that responds
to `NoResource` by progressing the interface once and retrying. Fetching
primitives arm a countdown completion at 2; a post the provider queues is
spun on (`progress` until the count reaches 1), after which the result is
harvested from the parked descriptor.

The 32-bit operations and 64-bit swap delegate to the emulation loops in
`super::emulate` after their own alignment check.
*/

use std::rc::Rc;

use log::debug;

use crate::provider::{AmoAck, AmoCommand, Rkey};
use crate::rdma::{Completion, RdmaIface};
use crate::status::{Error, Result};

use super::word::AmoOp;

enum Submitted {
    /// The provider finished the operation inline.
    Immediate(Option<u64>),
    /// Queued; the completion queue will deliver this post id.
    Queued(u64),
}

fn check_atomic_alignment(remote_addr: u64, size: u64) -> Result<()> {
    if remote_addr % size != 0 {
        debug!(
            "atomic variable must be naturally aligned (address {remote_addr:#x}, atomic size {size})"
        );
        return Err(Error::InvalidParam("misaligned atomic address"));
    }
    Ok(())
}

impl RdmaIface {
    /// Atomically add `add` to the 64-bit word at `remote_addr`.
    pub fn atomic_add64(&mut self, ep: u64, add: u64, remote_addr: u64, rkey: Rkey) -> Result<()> {
        check_atomic_alignment(remote_addr, 8)?;
        self.post_amo64(ep, AmoCommand::Add64(add), remote_addr, rkey)
    }

    /// Atomically add `add` to the 64-bit word at `remote_addr`, returning
    /// the value it held before the add.
    pub fn atomic_fadd64(
        &mut self,
        ep: u64,
        add: u64,
        remote_addr: u64,
        rkey: Rkey,
    ) -> Result<u64> {
        check_atomic_alignment(remote_addr, 8)?;
        self.fetch_amo64(ep, AmoCommand::Fadd64(add), remote_addr, rkey)
    }

    /// Atomically write `swap` to the 64-bit word at `remote_addr` iff it
    /// currently holds `compare`; returns the pre-operation value either
    /// way.
    pub fn atomic_cswap64(
        &mut self,
        ep: u64,
        compare: u64,
        swap: u64,
        remote_addr: u64,
        rkey: Rkey,
    ) -> Result<u64> {
        check_atomic_alignment(remote_addr, 8)?;
        self.fetch_amo64(ep, AmoCommand::Cswap64 { compare, swap }, remote_addr, rkey)
    }

    /// Atomically replace the 64-bit word at `remote_addr` with `swap`,
    /// returning the previous value. Emulated on compare-and-swap.
    pub fn atomic_swap64(
        &mut self,
        ep: u64,
        swap: u64,
        remote_addr: u64,
        rkey: Rkey,
    ) -> Result<u64> {
        check_atomic_alignment(remote_addr, 8)?;
        self.emulate_swap64(ep, swap, remote_addr, rkey)
    }

    /// Atomically add `add` to the 32-bit word at `remote_addr`.
    pub fn atomic_add32(&mut self, ep: u64, add: u32, remote_addr: u64, rkey: Rkey) -> Result<()> {
        check_atomic_alignment(remote_addr, 4)?;
        self.emulate_amo32(ep, AmoOp::Add, add, 0, 0, remote_addr, rkey)
            .map(|_| ())
    }

    /// Atomically add `add` to the 32-bit word at `remote_addr`, returning
    /// the value it held before the add.
    pub fn atomic_fadd32(
        &mut self,
        ep: u64,
        add: u32,
        remote_addr: u64,
        rkey: Rkey,
    ) -> Result<u32> {
        check_atomic_alignment(remote_addr, 4)?;
        self.emulate_amo32(ep, AmoOp::Fadd, add, 0, 0, remote_addr, rkey)
    }

    /// Atomically replace the 32-bit word at `remote_addr` with `swap`,
    /// returning the previous value.
    pub fn atomic_swap32(
        &mut self,
        ep: u64,
        swap: u32,
        remote_addr: u64,
        rkey: Rkey,
    ) -> Result<u32> {
        check_atomic_alignment(remote_addr, 4)?;
        self.emulate_amo32(ep, AmoOp::Swap, 0, swap, 0, remote_addr, rkey)
    }

    /// Atomically write `swap` to the 32-bit word at `remote_addr` iff it
    /// currently holds `compare`; returns the pre-operation value either
    /// way. The caller detects success by comparing the result to
    /// `compare`.
    pub fn atomic_cswap32(
        &mut self,
        ep: u64,
        compare: u32,
        swap: u32,
        remote_addr: u64,
        rkey: Rkey,
    ) -> Result<u32> {
        check_atomic_alignment(remote_addr, 4)?;
        self.emulate_amo32(ep, AmoOp::Cswap, 0, swap, compare, remote_addr, rkey)
    }

    // Submission for non-fetching posts: retry on transient exhaustion,
    // everything else is final.
    fn post_amo64(&mut self, ep: u64, cmd: AmoCommand, remote_addr: u64, rkey: Rkey) -> Result<()> {
        loop {
            match self.try_submit(ep, cmd, remote_addr, rkey, None, false) {
                Ok(_) => return Ok(()),
                Err(Error::NoResource) => self.progress(),
                Err(e) => return Err(e),
            }
        }
    }

    // Submission for fetching posts: completion armed at 2, spun down to 1
    // by the completion-queue drain.
    fn fetch_amo64(
        &mut self,
        ep: u64,
        cmd: AmoCommand,
        remote_addr: u64,
        rkey: Rkey,
    ) -> Result<u64> {
        let comp = Completion::new(2);
        loop {
            match self.try_submit(ep, cmd, remote_addr, rkey, Some(comp.clone()), true) {
                Ok(Submitted::Immediate(result)) => {
                    return result
                        .ok_or_else(|| Error::Provider("fetch completed without a result".into()));
                }
                Ok(Submitted::Queued(post_id)) => {
                    while comp.count() != 1 {
                        self.progress();
                    }
                    let mut desc = self
                        .parked
                        .remove(&post_id)
                        .expect("completed fetch post was not parked");
                    let value = desc.result.get();
                    desc.reset();
                    self.free_desc_famo.put(desc);
                    return Ok(value);
                }
                Err(Error::NoResource) => self.progress(),
                Err(e) => return Err(e),
            }
        }
    }

    fn try_submit(
        &mut self,
        ep: u64,
        cmd: AmoCommand,
        remote_addr: u64,
        rkey: Rkey,
        comp: Option<Rc<Completion>>,
        fetch: bool,
    ) -> Result<Submitted> {
        let nic_ep = self.lookup_nic_ep(ep)?;
        let Some(mut desc) = self.free_desc_famo.get() else {
            return Err(Error::NoResource);
        };
        let post_id = self.alloc_post_id();
        desc.post_id = post_id;
        desc.ep = ep;
        desc.comp = comp;
        desc.not_ready_to_free = fetch;

        let ack = self
            .provider
            .lock()
            .post_amo(nic_ep, cmd, remote_addr, rkey, post_id);
        match ack {
            Ok(AmoAck::Complete(result)) => {
                desc.reset();
                self.free_desc_famo.put(desc);
                Ok(Submitted::Immediate(result))
            }
            Ok(AmoAck::Queued) => {
                self.outstanding += 1;
                if let Some(entry) = self.eps.get_mut(&ep) {
                    entry.outstanding += 1;
                }
                self.inflight.insert(post_id, desc);
                Ok(Submitted::Queued(post_id))
            }
            Err(e) => {
                desc.reset();
                self.free_desc_famo.put(desc);
                Err(e)
            }
        }
    }
}
