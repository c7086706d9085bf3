/*!
Configuration surfaces for the transport interfaces.

Parsing of these options from the environment or a config file belongs to an
outer layer; this module only defines the recognized knobs and their
defaults. The allocator policy list is carried as configuration even though
buffers come from the heap in this implementation: it records the caller's
preference order for descriptor backing storage (huge pages first, then
mmap, then plain heap), matching the transport's historical default of
`huge,mmap,heap`.
*/

/// Preference for the memory backing descriptor pool chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPolicy {
    /// Huge-page backed chunks when the platform provides them.
    Huge,
    /// Anonymous mmap chunks.
    Mmap,
    /// Plain heap allocation.
    Heap,
}

/// Options recognized by the datagram transport interface.
#[derive(Debug, Clone)]
pub struct UdtConfig {
    /// Cap on the number of descriptors (and queued-AM records) each pool
    /// may allocate. `None` means unbounded.
    pub max_bufs: Option<usize>,

    /// Allocator preference order for descriptor backing storage.
    pub alloc: Vec<AllocPolicy>,

    /// Bytes reserved ahead of the receive payload for upper-layer framing.
    pub rx_headroom: usize,
}

impl Default for UdtConfig {
    fn default() -> Self {
        Self {
            max_bufs: None,
            alloc: vec![AllocPolicy::Huge, AllocPolicy::Mmap, AllocPolicy::Heap],
            rx_headroom: 0,
        }
    }
}

/// Options recognized by the RDMA (atomic) interface.
#[derive(Debug, Clone, Default)]
pub struct RdmaConfig {
    /// Cap on the number of in-flight atomic descriptors the pool may
    /// allocate. `None` means unbounded.
    pub max_bufs: Option<usize>,
}
