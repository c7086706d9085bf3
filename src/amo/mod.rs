/*!
Remote atomic memory operations.

Layering:
- `word`: pure helpers that pack, compare, and extract 32-bit halves of the
  8-byte container word. No provider involvement.
- `emulate`: the retry loops lifting 32-bit add/fetch-add/swap/compare-swap
  onto the provider's 64-bit fetch-add + compare-and-swap, and the 64-bit
  swap emulation (the provider has compare-and-swap but no plain swap).
- `facade`: the public `atomic_*` operations on `RdmaIface` — alignment
  enforcement, the submit/retry loop against transient resource exhaustion,
  and completion handling for fetching operations.

The 32-bit operations route through the emulation unconditionally: the
provider this transport targets has no native 32-bit atomics.
*/

pub mod word;

mod emulate;
mod facade;
