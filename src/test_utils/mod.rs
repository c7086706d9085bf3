//! Shared test provider for the AMO and UDT test suites.
//!
//! `MockNic` is a scriptable in-memory `Nic`:
//! - Atomics run against a word-addressed map (`container address -> u64`).
//!   Tests can inject `NoResource` rejections, a one-shot provider error,
//!   queued completion (exercising the completion-queue path instead of
//!   inline completion), and an interference hook that mutates memory ahead
//!   of chosen provider calls to simulate concurrent peers.
//! - Datagrams follow the provider contract the transport assumes: a post
//!   is keyed by id, `deliver` plays the role of a matching peer post,
//!   `probe_datagram` reports completed ids oldest-first without draining,
//!   and `wait_datagram` drains a post and returns its bytes.
//!
//! The handle is cheaply cloneable; tests keep a clone to drive deliveries
//! and inspect state after the interface has taken ownership of the boxed
//! provider.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::provider::{
    AmoAck, AmoCommand, CqCompletion, CqPoll, DatagramWait, Nic, NicEp, PostState, Rkey,
};
use crate::status::{Error, Result};
use crate::udt::wire::{MsgType, UdtHeader};

/// Wire image of an active-message datagram, as an endpoint would post it.
pub fn am_wire_bytes(am_id: u8, header: u64, payload: &[u8]) -> Vec<u8> {
    let mut msg = UdtHeader {
        msg_type: MsgType::Payload,
        am_id,
        length: (8 + payload.len()) as u16,
    }
    .to_bytes()
    .to_vec();
    msg.extend_from_slice(&header.to_le_bytes());
    msg.extend_from_slice(payload);
    msg
}

/// Wire image of an ack-only datagram.
pub fn ack_wire_bytes() -> Vec<u8> {
    UdtHeader::EMPTY.to_bytes().to_vec()
}

struct PostedDatagram {
    ep: NicEp,
    msg: Vec<u8>,
    state: PostState,
    delivered: Option<Vec<u8>>,
}

type InterferenceHook = Box<dyn FnMut(AmoCommand, &mut HashMap<u64, u64>) + Send>;

#[derive(Default)]
struct MockState {
    mem: HashMap<u64, u64>,
    next_ep: u64,
    posts: HashMap<u64, PostedDatagram>,
    matched: VecDeque<u64>,
    amo_attempts: usize,
    datagram_posts: usize,
    no_resource_budget: usize,
    queue_amos: bool,
    cq: VecDeque<CqCompletion>,
    interfere: Option<InterferenceHook>,
    fail_next_amo: Option<Error>,
}

#[derive(Clone)]
pub struct MockNic {
    state: Arc<Mutex<MockState>>,
}

impl MockNic {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    // -------- remote-memory helpers --------

    pub fn set_word(&self, addr: u64, value: u64) {
        assert_eq!(addr % 8, 0, "container addresses are 8-byte aligned");
        self.state.lock().mem.insert(addr, value);
    }

    pub fn word(&self, addr: u64) -> u64 {
        self.state.lock().mem.get(&addr).copied().unwrap_or(0)
    }

    /// Seed a container shown as `[msb : lsb]`.
    pub fn set_container(&self, addr: u64, msb: u32, lsb: u32) {
        self.set_word(addr, ((msb as u64) << 32) | lsb as u64);
    }

    /// Read a container back as `(msb, lsb)`.
    pub fn container(&self, addr: u64) -> (u32, u32) {
        let word = self.word(addr);
        ((word >> 32) as u32, word as u32)
    }

    pub fn lsb(&self, addr: u64) -> u32 {
        self.word(addr) as u32
    }

    // -------- fault and behavior injection --------

    /// Reject the next `n` atomic posts with `NoResource`.
    pub fn set_no_resource_budget(&self, n: usize) {
        self.state.lock().no_resource_budget = n;
    }

    /// Fail exactly the next atomic post with the given error.
    pub fn fail_next_amo(&self, e: Error) {
        self.state.lock().fail_next_amo = Some(e);
    }

    /// Complete atomics through the completion queue instead of inline.
    pub fn set_queue_amos(&self, on: bool) {
        self.state.lock().queue_amos = on;
    }

    /// Run `hook` at the entry of every atomic post, before the operation
    /// applies; it may mutate remote memory to simulate concurrent peers.
    pub fn set_amo_interference(
        &self,
        hook: impl FnMut(AmoCommand, &mut HashMap<u64, u64>) + Send + 'static,
    ) {
        self.state.lock().interfere = Some(Box::new(hook));
    }

    // -------- datagram-side helpers --------

    /// Act as the matching peer of the post named `id`: complete it with
    /// `data` so the next probe reports it.
    pub fn deliver(&self, id: u64, data: Vec<u8>) {
        let mut s = self.state.lock();
        let post = s.posts.get_mut(&id).expect("no posted datagram with this id");
        post.state = PostState::Completed;
        post.delivered = Some(data);
        s.matched.push_back(id);
    }

    /// Is a datagram currently posted under `id`?
    pub fn has_post(&self, id: u64) -> bool {
        self.state.lock().posts.contains_key(&id)
    }

    /// The message bytes the transport posted under `id`.
    pub fn posted_msg(&self, id: u64) -> Option<Vec<u8>> {
        self.state.lock().posts.get(&id).map(|p| p.msg.clone())
    }

    // -------- counters --------

    /// Every atomic post seen, including rejected ones.
    pub fn amo_attempts(&self) -> usize {
        self.state.lock().amo_attempts
    }

    pub fn datagram_posts(&self) -> usize {
        self.state.lock().datagram_posts
    }
}

impl Default for MockNic {
    fn default() -> Self {
        Self::new()
    }
}

impl Nic for MockNic {
    fn create_ep(&mut self) -> Result<NicEp> {
        let mut s = self.state.lock();
        s.next_ep += 1;
        Ok(NicEp(s.next_ep))
    }

    fn destroy_ep(&mut self, _ep: NicEp) -> Result<()> {
        Ok(())
    }

    fn post_datagram(&mut self, ep: NicEp, id: u64, msg: &[u8], _recv_size: usize) -> Result<()> {
        let mut s = self.state.lock();
        if s.posts.contains_key(&id) {
            return Err(Error::Provider("datagram id already posted".into()));
        }
        s.datagram_posts += 1;
        s.posts.insert(
            id,
            PostedDatagram {
                ep,
                msg: msg.to_vec(),
                state: PostState::Pending,
                delivered: None,
            },
        );
        Ok(())
    }

    fn probe_datagram(&mut self) -> Result<Option<u64>> {
        Ok(self.state.lock().matched.front().copied())
    }

    fn wait_datagram(&mut self, _ep: NicEp, id: u64) -> Result<DatagramWait> {
        let mut s = self.state.lock();
        let post = s
            .posts
            .remove(&id)
            .ok_or_else(|| Error::Provider("no datagram post with this id".into()))?;
        s.matched.retain(|m| *m != id);
        match post.state {
            PostState::Completed => Ok(DatagramWait {
                state: PostState::Completed,
                data: post.delivered.unwrap_or_default(),
            }),
            PostState::Terminated => Ok(DatagramWait {
                state: PostState::Terminated,
                data: Vec::new(),
            }),
            PostState::Pending => Err(Error::Provider(
                "wait on a pending datagram post would block".into(),
            )),
        }
    }

    fn cancel_datagram(&mut self, _ep: NicEp, id: u64) -> Result<()> {
        if let Some(post) = self.state.lock().posts.get_mut(&id) {
            post.state = PostState::Terminated;
        }
        Ok(())
    }

    fn post_amo(
        &mut self,
        _ep: NicEp,
        cmd: AmoCommand,
        remote_addr: u64,
        _rkey: Rkey,
        post_id: u64,
    ) -> Result<AmoAck> {
        let mut s = self.state.lock();
        s.amo_attempts += 1;

        if let Some(e) = s.fail_next_amo.take() {
            return Err(e);
        }
        if s.no_resource_budget > 0 {
            s.no_resource_budget -= 1;
            return Err(Error::NoResource);
        }
        if remote_addr % 8 != 0 {
            return Err(Error::Provider("misaligned fma address".into()));
        }

        // Simulated concurrent peers act before our operation commits.
        let mut hook = s.interfere.take();
        if let Some(h) = hook.as_mut() {
            h(cmd, &mut s.mem);
        }
        s.interfere = hook;

        let current = s.mem.get(&remote_addr).copied().unwrap_or(0);
        let (new, result) = match cmd {
            AmoCommand::Add64(v) => (current.wrapping_add(v), None),
            AmoCommand::Fadd64(v) => (current.wrapping_add(v), Some(current)),
            AmoCommand::Cswap64 { compare, swap } => (
                if current == compare { swap } else { current },
                Some(current),
            ),
        };
        s.mem.insert(remote_addr, new);

        if s.queue_amos {
            s.cq.push_back(CqCompletion { post_id, result });
            Ok(AmoAck::Queued)
        } else {
            Ok(AmoAck::Complete(result))
        }
    }

    fn cq_get_event(&mut self) -> CqPoll {
        match self.state.lock().cq.front() {
            Some(cqe) => CqPoll::Event(cqe.post_id),
            None => CqPoll::NotDone,
        }
    }

    fn cq_get_completed(&mut self, event: u64) -> Result<CqCompletion> {
        let mut s = self.state.lock();
        let cqe = s
            .cq
            .pop_front()
            .ok_or_else(|| Error::Provider("no completion to resolve".into()))?;
        if cqe.post_id != event {
            return Err(Error::Provider("completion event mismatch".into()));
        }
        Ok(cqe)
    }
}
