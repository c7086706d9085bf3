#![doc = r#"
Remora library crate.

Remote-memory transport building blocks over an opaque vendor NIC: remote
atomic memory operations (with 32-bit atomics emulated on the provider's
64-bit primitives) and an unreliable-datagram active-message transport.

Modules:
- amo: word-packing helpers, the 32-bit emulation loops, and the public
  atomic operations
- config: recognized configuration knobs and their defaults
- pending: parked retry requests and the per-endpoint dispatch arbiter
- pool: typed free-list pools backing transport descriptors
- provider: the vendor NIC trait and the process-wide gate serializing it
- rdma: atomic-post descriptors and the completion-queue progress loop
- status: crate-wide status codes
- timer: slow-timer pacing for async progress
- udt: the datagram transport (endpoints, wildcard receive, callback
  dispatch)

In tests, the scriptable mock provider lives under `crate::test_utils`.
"#]

pub mod amo;
pub mod config;
pub mod pending;
pub mod pool;
pub mod provider;
pub mod rdma;
pub mod status;
pub mod timer;
pub mod udt;

// Re-export the surface upper layers touch most.
pub use config::{AllocPolicy, RdmaConfig, UdtConfig};
pub use pending::PendingReq;
pub use provider::{Nic, NicEp, ProviderGate, Rkey, DATAGRAM_MAX_SIZE, UDT_ANY};
pub use rdma::RdmaIface;
pub use status::{Error, Result};
pub use udt::{AmAction, AmFlags, AmMessage, DescToken, IfaceAttr, IfaceFlags, UdtIface, MAX_AM};

// Shared test utilities (only compiled for tests)
#[cfg(test)]
pub mod test_utils;
