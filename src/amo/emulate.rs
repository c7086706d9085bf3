/*!
Retry loops lifting 32-bit atomics onto 64-bit fetch-add + compare-and-swap.

One loop serves all four 32-bit operations. Each iteration reads the
container atomically (a fetch-add of zero), computes the post-operation word
and the compare word for this snapshot, and attempts a 64-bit CAS. For
ADD/FADD/SWAP the compare word is the snapshot itself, so the CAS only fails
when somebody changed the untouched half in between; the loop then retries
with a fresher snapshot. For CSWAP the loop also ends when the targeted half
is observed to differ from the caller's compare value: that is the
operation's own mismatch outcome, not a race.

The loop is unbounded by design; it converges as soon as the adjacent half
holds still for one fetch/CAS round trip. Transient `NoResource` conditions
never reach this layer because the 64-bit primitives progress and retry
internally; any other provider failure aborts the loop unchanged.
*/

use crate::provider::Rkey;
use crate::rdma::RdmaIface;
use crate::status::Result;

use super::word::{
    compute_compare_word, compute_new_word, extract_return, is_completed, split_remote_addr, AmoOp,
};

impl RdmaIface {
    pub(crate) fn emulate_amo32(
        &mut self,
        ep: u64,
        op: AmoOp,
        add: u32,
        swap: u32,
        compare: u32,
        remote_addr: u64,
        rkey: Rkey,
    ) -> Result<u32> {
        let (container, half) = split_remote_addr(remote_addr);
        loop {
            // Atomic read of the container: fetch-add of zero returns the
            // pre-add value.
            let fetched = self.atomic_fadd64(ep, 0, container, rkey)?;
            let new_word = compute_new_word(half, op, fetched, add, swap);
            let compare_word = compute_compare_word(half, op, fetched, compare);

            let result = self.atomic_cswap64(ep, compare_word, new_word, container, rkey)?;
            if is_completed(half, op, result, compare_word) {
                return Ok(extract_return(half, result));
            }
        }
    }

    pub(crate) fn emulate_swap64(
        &mut self,
        ep: u64,
        swap: u64,
        remote_addr: u64,
        rkey: Rkey,
    ) -> Result<u64> {
        loop {
            let old = self.atomic_fadd64(ep, 0, remote_addr, rkey)?;
            let result = self.atomic_cswap64(ep, old, swap, remote_addr, rkey)?;
            if result == old {
                return Ok(old);
            }
        }
    }
}
