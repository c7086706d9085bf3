/*!
Unreliable datagram transport: short-message active messaging over the
provider's id-matched datagram exchange.

Modules and responsibilities:
- wire: the 4-byte datagram header and its encoding.
- desc: pooled descriptors carrying one exchange's send and receive sides,
  plus the retention token users hold for kept receive descriptors.
- ep: per-peer endpoints; the single-outstanding-post send path
  (`am_short`, `am_bcopy`), pending-request hooks, flush, and teardown.
- iface: the interface facade — wildcard receive rotation, probe-driven
  progress in sync and async contexts, the deferred-sync delivery FIFO,
  callback registration and dispatch, and capability queries.
*/

pub mod wire;

mod desc;
mod ep;
mod iface;

pub use desc::DescToken;
pub use iface::{AmAction, AmFlags, AmMessage, IfaceAttr, IfaceFlags, UdtIface, MAX_AM};
