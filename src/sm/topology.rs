use std::collections::VecDeque;

use hashbrown::HashMap;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use tracing::debug;

use super::error::Result;
use super::subnet::SwitchRecord;
use super::{Guid, PortNum};

/// A directed use of a physical link: the egress port it leaves the source
/// switch through and the ingress port it arrives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub out_port: PortNum,
    pub in_port: PortNum,
}

/// The switch adjacency graph for one sweep.
///
/// Switches get dense indices in ascending GUID order, so the same
/// discovered topology always produces the same graph. Each physical link
/// contributes one directed edge per direction. Neighbour lists are kept
/// sorted by egress port: that ordering is the fixed tie-break rule for
/// everything downstream (see [`FabricGraph::bfs`]).
pub struct FabricGraph {
    graph: DiGraph<Guid, Link>,
    index: HashMap<Guid, NodeIndex>,
    adjacency: Vec<Vec<(NodeIndex, Link)>>,
    ports: Vec<HashMap<PortNum, (NodeIndex, PortNum)>>,
}

impl FabricGraph {
    /// Builds the graph from switch records already sorted by GUID.
    pub fn build(switches: &[SwitchRecord]) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::with_capacity(switches.len());
        for record in switches {
            let idx = graph.add_node(record.guid);
            index.insert(record.guid, idx);
        }
        for (i, record) in switches.iter().enumerate() {
            let from = NodeIndex::new(i);
            for link in &record.links {
                let Some(&to) = index.get(&link.peer) else {
                    // discovery races can leave a link whose far end is
                    // gone; the next sweep sees a consistent picture
                    debug!(
                        "ignoring link {:#x}:{} -> missing peer {:#x}",
                        record.guid, link.local_port, link.peer
                    );
                    continue;
                };
                graph.add_edge(
                    from,
                    to,
                    Link {
                        out_port: link.local_port,
                        in_port: link.peer_port,
                    },
                );
            }
        }

        let mut adjacency = Vec::with_capacity(switches.len());
        let mut ports = Vec::with_capacity(switches.len());
        for node in graph.node_indices() {
            let mut out: Vec<(NodeIndex, Link)> = graph
                .edges(node)
                .map(|e| (e.target(), *e.weight()))
                .collect();
            out.sort_by_key(|(_, link)| link.out_port);
            let map = out
                .iter()
                .map(|&(peer, link)| (link.out_port, (peer, link.in_port)))
                .collect();
            adjacency.push(out);
            ports.push(map);
        }

        Self {
            graph,
            index,
            adjacency,
            ports,
        }
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn guid(&self, node: NodeIndex) -> Guid {
        self.graph[node]
    }

    pub fn index_of(&self, guid: Guid) -> Option<NodeIndex> {
        self.index.get(&guid).copied()
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeIndex> {
        self.graph.node_indices()
    }

    /// Neighbours of `node` in ascending egress-port order.
    pub fn neighbors(&self, node: NodeIndex) -> &[(NodeIndex, Link)] {
        &self.adjacency[node.index()]
    }

    /// Resolves an egress port to the switch and ingress port behind it.
    pub fn peer(
        &self,
        node: NodeIndex,
        port: PortNum,
    ) -> Option<(NodeIndex, PortNum)> {
        self.ports[node.index()].get(&port).copied()
    }

    /// Shortest-hop tree from `source` over the whole fabric.
    ///
    /// Plain breadth-first traversal; among equal-hop alternatives the
    /// parent reached through the lowest egress port wins, because
    /// neighbours are explored in that order. The rule is deliberate: it
    /// pins down which physical route, and therefore which channel
    /// dependency graph, every sweep produces. Unreachable switches are
    /// simply absent from the tree.
    pub fn bfs(&self, source: NodeIndex) -> Result<PathTree> {
        let mut hops = Vec::new();
        hops.try_reserve_exact(self.len())?;
        hops.resize(self.len(), None);

        let mut frontier = VecDeque::new();
        frontier.push_back(source);
        while let Some(node) = frontier.pop_front() {
            let dist = match hops[node.index()] {
                Some(Hop { dist, .. }) => dist,
                None => 0, // only the source has no hop entry while queued
            };
            for &(next, link) in self.neighbors(node) {
                if next == source || hops[next.index()].is_some() {
                    continue;
                }
                hops[next.index()] = Some(Hop {
                    dist: dist + 1,
                    prev: node,
                    link,
                });
                frontier.push_back(next);
            }
        }

        Ok(PathTree { source, hops })
    }

    /// One tree per switch, indexed like the switches themselves.
    pub fn path_trees(&self) -> Result<Vec<PathTree>> {
        let mut trees = Vec::new();
        trees.try_reserve_exact(self.len())?;
        for node in self.nodes() {
            trees.push(self.bfs(node)?);
        }
        Ok(trees)
    }
}

/// Parent-pointer/distance data for one switch towards every other switch
/// it can reach.
#[derive(Debug, Clone, Copy)]
pub struct Hop {
    pub dist: u32,
    /// Predecessor on the path from the tree's source.
    pub prev: NodeIndex,
    /// The directed link `prev` forwards through to get here.
    pub link: Link,
}

pub struct PathTree {
    pub source: NodeIndex,
    hops: Vec<Option<Hop>>,
}

impl PathTree {
    pub fn distance(&self, to: NodeIndex) -> Option<u32> {
        if to == self.source {
            return Some(0);
        }
        self.hops[to.index()].map(|h| h.dist)
    }

    pub fn reachable(&self, to: NodeIndex) -> bool {
        self.distance(to).is_some()
    }

    pub fn hop(&self, to: NodeIndex) -> Option<Hop> {
        self.hops[to.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sm::subnet::{Subnet, SwitchRecord};
    use crate::sm::{Guid, Lid};

    fn switch(guid: Guid, lid: Lid) -> SwitchRecord {
        SwitchRecord::builder()
            .guid(guid)
            .lid(lid)
            .port_count(8)
            .lft_capacity(64)
            .build()
    }

    fn sorted_switches(subnet: &Subnet) -> Vec<SwitchRecord> {
        let mut switches: Vec<_> = subnet.switches().cloned().collect();
        switches.sort_by_key(|s| s.guid);
        switches
    }

    /// 1 -(p1:p1)- 2 -(p2:p1)- 3
    fn line() -> FabricGraph {
        let mut subnet = Subnet::new();
        for (guid, lid) in [(1, 1), (2, 2), (3, 3)] {
            subnet.add_switch(switch(guid, lid));
        }
        subnet.link(1, 1, 2, 1);
        subnet.link(2, 2, 3, 1);
        FabricGraph::build(&sorted_switches(&subnet))
    }

    #[test]
    fn bfs_distances_on_a_line() {
        let fabric = line();
        let tree = fabric.bfs(NodeIndex::new(0)).unwrap();
        assert_eq!(tree.distance(NodeIndex::new(0)), Some(0));
        assert_eq!(tree.distance(NodeIndex::new(1)), Some(1));
        assert_eq!(tree.distance(NodeIndex::new(2)), Some(2));

        let hop = tree.hop(NodeIndex::new(2)).unwrap();
        assert_eq!(hop.prev, NodeIndex::new(1));
        assert_eq!(hop.link.out_port, 2);
        assert_eq!(hop.link.in_port, 1);
    }

    #[test]
    fn disconnected_switch_is_absent_not_an_error() {
        let mut subnet = Subnet::new();
        subnet.add_switch(switch(1, 1));
        subnet.add_switch(switch(2, 2));
        let fabric = FabricGraph::build(&sorted_switches(&subnet));
        let tree = fabric.bfs(NodeIndex::new(0)).unwrap();
        assert!(!tree.reachable(NodeIndex::new(1)));
    }

    #[test]
    fn equal_cost_tie_breaks_on_lowest_egress_port() {
        // two parallel links between the same pair of switches
        let mut subnet = Subnet::new();
        subnet.add_switch(switch(1, 1));
        subnet.add_switch(switch(2, 2));
        subnet.link(1, 4, 2, 2);
        subnet.link(1, 2, 2, 4);
        let fabric = FabricGraph::build(&sorted_switches(&subnet));
        let tree = fabric.bfs(NodeIndex::new(0)).unwrap();
        let hop = tree.hop(NodeIndex::new(1)).unwrap();
        assert_eq!(hop.link.out_port, 2);
    }

    #[test]
    fn peer_resolves_ports() {
        let fabric = line();
        let mid = NodeIndex::new(1);
        assert_eq!(fabric.peer(mid, 1), Some((NodeIndex::new(0), 1)));
        assert_eq!(fabric.peer(mid, 2), Some((NodeIndex::new(2), 1)));
        assert_eq!(fabric.peer(mid, 7), None);
    }
}
