use hashbrown::HashMap;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use tracing::{debug, trace};

use super::error::{Error, Result, Unsupported};
use super::PortNum;

/// One directed channel some computed path actually uses: traffic that
/// entered `switch` through `in_port` (or was injected there, see
/// [`super::PORT_INJECT`]) and leaves through `out_port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Channel {
    /// Per-sweep dense switch index.
    pub switch: usize,
    pub in_port: PortNum,
    pub out_port: PortNum,
}

/// A dependency between two channels: some path occupies the target
/// channel immediately after the source channel, which is the precondition
/// for a credit cycle. `refs` counts how many source-destination paths
/// impose it; `lane` is filled in by [`ChannelGraph::assign_lanes`].
#[derive(Debug, Clone, Copy)]
pub struct Dependency {
    pub refs: u32,
    pub lane: Option<u8>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Grey,
    Black,
}

/// The channel dependency graph for one sweep.
///
/// Vertices and edges live in a dense index-addressed arena; tearing the
/// whole graph down at sweep end is a single drop, and nothing in it points
/// at anything outside the sweep's routing context.
#[derive(Default)]
pub struct ChannelGraph {
    graph: DiGraph<Channel, Dependency>,
    index: HashMap<Channel, NodeIndex>,
    /// Highest lane any dependency through the channel was assigned to;
    /// 0 for channels with no dependencies. Valid after `assign_lanes`.
    vertex_lane: Vec<u8>,
}

impl ChannelGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a channel, returning its vertex.
    pub fn channel(&mut self, channel: Channel) -> NodeIndex {
        match self.index.get(&channel) {
            Some(&idx) => idx,
            None => {
                let idx = self.graph.add_node(channel);
                self.index.insert(channel, idx);
                idx
            }
        }
    }

    /// Records one path's channel sequence: a dependency edge from every
    /// channel to the one the path occupies right after it.
    pub fn record_path(&mut self, channels: &[Channel]) {
        for pair in channels.windows(2) {
            let from = self.channel(pair[0]);
            let to = self.channel(pair[1]);
            self.depend(from, to);
        }
        if let [only] = channels {
            // single-hop paths impose no dependency but still use a lane
            self.channel(*only);
        }
    }

    fn depend(&mut self, from: NodeIndex, to: NodeIndex) {
        if from == to {
            return;
        }
        match self.graph.find_edge(from, to) {
            Some(edge) => self.graph[edge].refs += 1,
            None => {
                self.graph.add_edge(from, to, Dependency {
                    refs: 1,
                    lane: None,
                });
            }
        }
    }

    pub fn channels(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependencies(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn vertex(&self, channel: Channel) -> Option<NodeIndex> {
        self.index.get(&channel).copied()
    }

    /// The lane a channel's traffic must be able to use; valid after
    /// [`assign_lanes`](Self::assign_lanes) succeeded.
    pub fn vertex_lane(&self, vertex: NodeIndex) -> u8 {
        self.vertex_lane[vertex.index()]
    }

    pub fn vertices(&self) -> impl Iterator<Item = (NodeIndex, &Channel)> {
        self.graph
            .node_indices()
            .map(move |idx| (idx, &self.graph[idx]))
    }

    /// Dependency edges assigned to `lane`, as (source, target) channels.
    pub fn lane_edges(&self, lane: u8) -> Vec<(Channel, Channel)> {
        self.graph
            .edge_references()
            .filter(|e| e.weight().lane == Some(lane))
            .map(|e| (self.graph[e.source()], self.graph[e.target()]))
            .collect()
    }

    /// Distributes every dependency edge over virtual lanes so that each
    /// lane's edge set is acyclic.
    ///
    /// Lane by lane, a depth-first sweep with three-colour marking takes
    /// the largest edge subset it can: an edge into a vertex still on the
    /// DFS stack would close a cycle and is deferred to a later lane,
    /// every other edge examined is kept. Kept edges always point at a
    /// vertex that finishes before their source, so reverse finishing
    /// order is a topological order of the lane and the lane is acyclic.
    ///
    /// Returns the number of lanes in use. Fails with UnsupportedTopology
    /// if the remaining edges still need another lane once `vl_min` are
    /// spent; the caller discards the whole context in that case.
    pub fn assign_lanes(&mut self, vl_min: u8) -> Result<u8> {
        if self.channels() == 0 {
            self.vertex_lane.clear();
            return Ok(0);
        }
        if vl_min == 0 {
            return Err(Error::UnsupportedTopology(Unsupported::LanesExceeded {
                available: 0,
            }));
        }

        let mut remaining = self.dependencies();
        let mut lane: u8 = 0;
        while remaining > 0 {
            if lane == vl_min {
                debug!(
                    "{} dependencies left after {} lanes",
                    remaining, vl_min
                );
                return Err(Error::UnsupportedTopology(
                    Unsupported::LanesExceeded { available: vl_min },
                ));
            }
            let kept = self.lane_sweep(lane);
            trace!("lane {}: kept {} dependency edges", lane, kept);
            remaining -= kept;
            lane += 1;
        }

        self.vertex_lane = vec![0; self.channels()];
        for edge in self.graph.edge_references() {
            let assigned = edge
                .weight()
                .lane
                .expect("every dependency has a lane after assignment");
            let src = &mut self.vertex_lane[edge.source().index()];
            *src = (*src).max(assigned);
            let dst = &mut self.vertex_lane[edge.target().index()];
            *dst = (*dst).max(assigned);
        }

        // even a dependency-free fabric moves traffic on lane 0
        Ok(lane.max(1))
    }

    /// One DFS round: assigns `lane` to every still-unassigned edge that
    /// does not close a cycle. Returns how many edges it assigned.
    fn lane_sweep(&mut self, lane: u8) -> usize {
        let mut mark = vec![Mark::White; self.channels()];
        let mut kept = 0usize;

        // roots in vertex order, targets in vertex order: the sweep is
        // deterministic for a given graph
        for root in self.graph.node_indices() {
            if mark[root.index()] != Mark::White {
                continue;
            }
            mark[root.index()] = Mark::Grey;
            let mut stack = vec![(root, self.unassigned_out(root))];
            loop {
                let next = match stack.last_mut() {
                    Some((_, edges)) => edges.pop(),
                    None => break,
                };
                match next {
                    Some((edge, target)) => match mark[target.index()] {
                        // back edge: keeping it would close a cycle in
                        // this lane, defer it to a later one
                        Mark::Grey => {}
                        Mark::Black => {
                            self.graph[edge].lane = Some(lane);
                            kept += 1;
                        }
                        Mark::White => {
                            self.graph[edge].lane = Some(lane);
                            kept += 1;
                            mark[target.index()] = Mark::Grey;
                            stack.push((target, self.unassigned_out(target)));
                        }
                    },
                    None => {
                        let (vertex, _) = stack.pop().unwrap();
                        mark[vertex.index()] = Mark::Black;
                    }
                }
            }
        }

        kept
    }

    /// Unassigned outgoing edges of `vertex`, ordered so that popping from
    /// the back explores the lowest-indexed target first.
    fn unassigned_out(
        &self,
        vertex: NodeIndex,
    ) -> Vec<(EdgeIndex, NodeIndex)> {
        let mut out: Vec<(EdgeIndex, NodeIndex)> = self
            .graph
            .edges(vertex)
            .filter(|e| e.weight().lane.is_none())
            .map(|e| (e.id(), e.target()))
            .collect();
        out.sort_by_key(|&(_, target)| std::cmp::Reverse(target.index()));
        out
    }
}
