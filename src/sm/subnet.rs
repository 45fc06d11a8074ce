use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use typed_builder::TypedBuilder;

use super::lft::LinearForwardingTable;
use super::names::NodeNameMap;
use super::{Guid, Lid, PortNum};

/// One end of a physical inter-switch link, as discovery recorded it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchLink {
    pub local_port: PortNum,
    pub peer: Guid,
    pub peer_port: PortNum,
}

/// A switch as the registry knows it between sweeps.
///
/// The committed forwarding table lives here: it is the only routing
/// artifact that survives a sweep, staying live until the next successful
/// commit supersedes it or the switch disappears from the topology.
#[derive(Debug, Clone, TypedBuilder)]
pub struct SwitchRecord {
    pub guid: Guid,
    pub lid: Lid,
    pub port_count: PortNum,
    /// Advertised linear forwarding table capacity. Zero means the switch
    /// supports no linear table, which fails routing for the whole sweep.
    pub lft_capacity: usize,
    #[builder(default)]
    pub description: String,
    #[builder(default)]
    pub links: Vec<SwitchLink>,
    #[builder(default)]
    pub lft: Option<LinearForwardingTable>,
}

/// A terminal port (host channel adapter) hanging off a switch. Its LID is
/// routed across the fabric like the attachment switch's own LID and exits
/// through the attachment port.
#[derive(Debug, Clone, Copy, TypedBuilder)]
pub struct HostRecord {
    pub guid: Guid,
    pub lid: Lid,
    pub switch: Guid,
    pub switch_port: PortNum,
}

/// The discovered subnet: every switch and host the last discovery pass
/// found, plus the routing state committed on top of them.
///
/// Shared between the dispatch workers and the routing sweep as
/// [`SharedSubnet`]; that single RwLock is the subnet-wide lock. Handlers
/// take it around the one record they touch, the sweep takes it exclusively
/// only for the final table swap.
#[derive(Debug, Default)]
pub struct Subnet {
    switches: HashMap<Guid, SwitchRecord>,
    hosts: HashMap<Guid, HostRecord>,
    names: NodeNameMap,
    lanes_in_use: u8,
    last_sweep: Option<DateTime<Utc>>,
}

pub type SharedSubnet = Arc<RwLock<Subnet>>;

pub fn shared(subnet: Subnet) -> SharedSubnet {
    Arc::new(RwLock::new(subnet))
}

impl Subnet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_switch(&mut self, record: SwitchRecord) {
        self.switches.insert(record.guid, record);
    }

    pub fn add_host(&mut self, record: HostRecord) {
        self.hosts.insert(record.guid, record);
    }

    /// Records a physical link in both directions.
    pub fn link(&mut self, a: Guid, port_a: PortNum, b: Guid, port_b: PortNum) {
        if let Some(rec) = self.switches.get_mut(&a) {
            rec.links.push(SwitchLink {
                local_port: port_a,
                peer: b,
                peer_port: port_b,
            });
        }
        if let Some(rec) = self.switches.get_mut(&b) {
            rec.links.push(SwitchLink {
                local_port: port_b,
                peer: a,
                peer_port: port_a,
            });
        }
    }

    /// Drops the link attached to `port` on `guid`, and its reverse half.
    pub fn unlink(&mut self, guid: Guid, port: PortNum) {
        let Some(rec) = self.switches.get_mut(&guid) else {
            return;
        };
        let Some(pos) = rec.links.iter().position(|l| l.local_port == port)
        else {
            return;
        };
        let gone = rec.links.swap_remove(pos);
        if let Some(peer) = self.switches.get_mut(&gone.peer) {
            peer.links.retain(|l| {
                !(l.peer == guid && l.local_port == gone.peer_port)
            });
        }
    }

    pub fn switch(&self, guid: Guid) -> Option<&SwitchRecord> {
        self.switches.get(&guid)
    }

    pub fn switch_mut(&mut self, guid: Guid) -> Option<&mut SwitchRecord> {
        self.switches.get_mut(&guid)
    }

    pub fn switches(&self) -> impl Iterator<Item = &SwitchRecord> {
        self.switches.values()
    }

    pub fn host(&self, guid: Guid) -> Option<&HostRecord> {
        self.hosts.get(&guid)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &HostRecord> {
        self.hosts.values()
    }

    pub fn names(&self) -> &NodeNameMap {
        &self.names
    }

    pub fn set_names(&mut self, names: NodeNameMap) {
        self.names = names;
    }

    /// Virtual lanes the committed tables rely on; 0 before the first
    /// successful sweep.
    pub fn lanes_in_use(&self) -> u8 {
        self.lanes_in_use
    }

    pub(crate) fn set_lanes_in_use(&mut self, lanes: u8) {
        self.lanes_in_use = lanes;
    }

    pub fn last_sweep(&self) -> Option<DateTime<Utc>> {
        self.last_sweep
    }

    pub(crate) fn set_last_sweep(&mut self, at: DateTime<Utc>) {
        self.last_sweep = Some(at);
    }
}
