// The subnet manager's control plane splits into two halves that must never
// trip over each other. The routing half is a strictly sequential pipeline:
// snapshot the discovered topology, build shortest-path trees, derive the
// channel dependency graph, break its cycles across virtual lanes, and only
// then swap every switch's forwarding table in one exclusive critical
// section. The management half is a pool of dispatch workers draining MAD
// receive callbacks; each callback takes the same subnet lock for the one
// record it touches and releases it before returning.

// Because both halves funnel through a single subnet-wide RwLock, a handler
// mutation can never interleave with a table commit: the commit holds the
// lock exclusively for the pointer swaps alone, and everything expensive
// happens off to the side on the sweep's private context. A failed sweep
// throws that context away and the previously committed tables stay live.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod lash;
pub mod lft;
pub mod mad;
pub mod names;
pub mod subnet;
pub mod sweep;
pub mod topology;

/// Globally unique identifier of a node or port, as discovery reported it.
pub type Guid = u64;

/// Local identifier, a port's address within one subnet.
pub type Lid = u16;

/// A physical port number on a switch. Port 0 is the management port.
pub type PortNum = u8;

/// Ingress marker for a channel that begins at its source switch: traffic
/// injected at the management port rather than arriving over a link.
pub const PORT_INJECT: PortNum = 0;
