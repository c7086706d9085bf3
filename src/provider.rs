/*!
Vendor NIC seam: the provider trait and the process-wide gate around it.

Purpose:
- Decouple the transport from the vendor datagram/atomic API so the same
  endpoint and interface logic runs against real hardware bindings or the
  in-memory test provider.
- Own the single mutex that serializes every call into the provider. The
  vendor API is not reentrant; post, probe, wait-by-id, cancel, endpoint
  create/destroy, and FMA posts all go through `ProviderGate::lock`.

Semantics the transport relies on:
- `post_amo` with `Fadd64` returns (or later completes with) the value the
  remote word held *before* the add. A fetch-add of zero is therefore an
  atomic read; the 32-bit emulation layer is built on this contract.
- `post_amo` either finishes inline (`AmoAck::Complete`) or queues the
  operation (`AmoAck::Queued`), in which case exactly one completion-queue
  event carrying the same `post_id` follows.
- A posted datagram is identified by `(endpoint, id)`. `probe_datagram`
  reports an id whose exchange completed without consuming it;
  `wait_datagram` drains the post and returns the peer's bytes. Waiting on a
  post that has not completed blocks until it terminates, so the transport
  only waits after a successful probe or after `cancel_datagram`.
*/

use parking_lot::{Mutex, MutexGuard};

use crate::status::Result;

/// Fixed provider datagram payload size in bytes.
pub const DATAGRAM_MAX_SIZE: usize = 128;

/// Datagram id reserved for the wildcard receive; never assigned to an
/// endpoint.
pub const UDT_ANY: u64 = 0;

/// Provider-side endpoint handle. Opaque to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NicEp(pub u64);

/// Opaque remote-memory key. Resolution from protocol-level keys happens in
/// an outer layer; the transport passes it through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rkey(pub u64);

/// Terminal state of a datagram post as reported by `wait_datagram`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostState {
    /// Still in flight (only observable from a blocking wait that raced a
    /// cancel; the transport treats it as a provider contract breach).
    Pending,
    /// Matched with a peer post; `data` holds the peer's bytes.
    Completed,
    /// Canceled before matching.
    Terminated,
}

/// Outcome of draining a datagram post.
#[derive(Debug, Clone)]
pub struct DatagramWait {
    pub state: PostState,
    /// The peer's message bytes (header + payload). Empty for a terminated
    /// post.
    pub data: Vec<u8>,
}

/// 64-bit atomic command understood by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmoCommand {
    Add64(u64),
    Fadd64(u64),
    Cswap64 { compare: u64, swap: u64 },
}

/// Submission outcome for an atomic post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmoAck {
    /// The operation finished inline. Fetching commands carry the pre-op
    /// value; `Add64` carries `None`. No completion-queue event follows.
    Complete(Option<u64>),
    /// The operation was queued; a completion-queue event with the same
    /// `post_id` follows.
    Queued,
}

/// One poll of the local completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqPoll {
    /// Nothing completed.
    NotDone,
    /// An event is ready; resolve it with `cq_get_completed`.
    Event(u64),
    /// The queue overran and events were lost.
    Overrun,
}

/// A resolved completion-queue event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqCompletion {
    pub post_id: u64,
    /// Pre-op value for fetching commands, `None` for `Add64`.
    pub result: Option<u64>,
}

/// The vendor NIC surface the transport is written against.
///
/// Implementations decide how endpoints, datagram matching, and atomics are
/// realized; the transport only assumes the semantics documented at module
/// level. All methods are called with the provider gate held.
pub trait Nic {
    /// Create a provider endpoint.
    fn create_ep(&mut self) -> Result<NicEp>;

    /// Destroy a provider endpoint. Any datagram still posted on it is the
    /// caller's bug.
    fn destroy_ep(&mut self, ep: NicEp) -> Result<()>;

    /// Post a datagram exchange: send `msg`, accept up to `recv_size` bytes
    /// from the matching peer post. `id` names the post for probe/wait.
    fn post_datagram(&mut self, ep: NicEp, id: u64, msg: &[u8], recv_size: usize) -> Result<()>;

    /// Report a completed datagram id without draining it, oldest first.
    fn probe_datagram(&mut self) -> Result<Option<u64>>;

    /// Drain the post named by `(ep, id)` and return its terminal state and
    /// the received bytes.
    fn wait_datagram(&mut self, ep: NicEp, id: u64) -> Result<DatagramWait>;

    /// Cancel the post named by `(ep, id)`; a subsequent wait observes
    /// `PostState::Terminated`.
    fn cancel_datagram(&mut self, ep: NicEp, id: u64) -> Result<()>;

    /// Submit a 64-bit atomic against `remote_addr` under `rkey`.
    fn post_amo(
        &mut self,
        ep: NicEp,
        cmd: AmoCommand,
        remote_addr: u64,
        rkey: Rkey,
        post_id: u64,
    ) -> Result<AmoAck>;

    /// Poll the local completion queue.
    fn cq_get_event(&mut self) -> CqPoll;

    /// Resolve an event returned by `cq_get_event`.
    fn cq_get_completed(&mut self, event: u64) -> Result<CqCompletion>;
}

/// Process-wide serialization point for the provider.
///
/// Interfaces share one gate; taking it is the only way to reach the `Nic`
/// implementation. This is the transport's rendering of the provider-global
/// lock: owned by the provider abstraction, not a module-level singleton.
pub struct ProviderGate {
    nic: Mutex<Box<dyn Nic + Send>>,
}

impl ProviderGate {
    pub fn new(nic: Box<dyn Nic + Send>) -> Self {
        Self { nic: Mutex::new(nic) }
    }

    /// Take the provider lock. Callers keep the guard for exactly the
    /// provider calls that must appear atomic to other contexts (e.g.
    /// cancel-then-wait during teardown) and drop it before running user
    /// callbacks.
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn Nic + Send>> {
        self.nic.lock()
    }
}
