use chrono::{DateTime, Utc};
use petgraph::graph::NodeIndex;
use tracing::{debug, debug_span, trace, warn};

use super::config::SmConfig;
use super::error::{Error, Result, Unsupported};
use super::lash::{Channel, ChannelGraph};
use super::lft::LinearForwardingTable;
use super::subnet::{HostRecord, SharedSubnet, SwitchRecord};
use super::topology::{FabricGraph, PathTree};
use super::{Guid, Lid, PortNum, PORT_INJECT};

/// What one successful sweep did.
#[derive(Debug, Clone)]
pub struct SweepReport {
    pub switches: usize,
    pub routed_pairs: usize,
    pub channels: usize,
    pub dependencies: usize,
    pub lanes_used: u8,
    pub at: DateTime<Utc>,
}

/// Per-sweep working state for one switch. Lives only inside the routing
/// context; the registry's own record is untouched until commit.
struct SweepSwitch {
    guid: Guid,
    lid: Lid,
    port_count: PortNum,
    lft_capacity: usize,
    /// How many destination routes leave through each egress port.
    usage: Vec<u64>,
    /// Highest virtual lane each egress port must provide.
    port_lane: Vec<u8>,
    /// The freshly built table, waiting for commit.
    lft: Option<LinearForwardingTable>,
}

/// Everything one routing sweep owns: the switches, their path trees, the
/// channel dependency graph and the lane state. Built fresh per sweep from
/// a registry snapshot and discarded whole at sweep end; only committed
/// tables outlive it.
struct RoutingContext {
    switches: Vec<SweepSwitch>,
    hosts: Vec<HostRecord>,
    fabric: FabricGraph,
    trees: Vec<PathTree>,
    /// Chosen egress port per (switch, destination switch); None when the
    /// destination is unreachable.
    egress: Vec<Vec<Option<PortNum>>>,
    cdg: ChannelGraph,
    lanes_used: u8,
    routed_pairs: usize,
    vl_min: u8,
    balance_limit: u64,
}

impl RoutingContext {
    fn build(
        switches: Vec<SwitchRecord>,
        hosts: Vec<HostRecord>,
        config: &SmConfig,
    ) -> Result<Self> {
        // a switch without a linear table makes the whole fabric
        // unroutable; fail before any heavy lifting
        for record in &switches {
            if record.lft_capacity == 0 {
                return Err(Error::UnsupportedTopology(
                    Unsupported::NoLinearTable(record.guid),
                ));
            }
        }

        let fabric = FabricGraph::build(&switches);
        let trees = fabric.path_trees()?;
        let count = switches.len();
        let sweep_switches = switches
            .into_iter()
            .map(|record| SweepSwitch {
                guid: record.guid,
                lid: record.lid,
                port_count: record.port_count,
                lft_capacity: record.lft_capacity,
                usage: vec![0; record.port_count as usize + 1],
                port_lane: vec![0; record.port_count as usize + 1],
                lft: None,
            })
            .collect();

        Ok(Self {
            switches: sweep_switches,
            hosts,
            fabric,
            trees,
            egress: vec![vec![None; count]; count],
            cdg: ChannelGraph::new(),
            lanes_used: 0,
            routed_pairs: 0,
            vl_min: config.vl_min,
            balance_limit: config.balance_limit,
        })
    }

    /// Picks the egress port every switch uses towards every destination.
    ///
    /// Equal-cost alternatives default to the lowest egress port (the same
    /// tie-break the path trees use). The default is abandoned only when
    /// its accumulated usage exceeds the least-used alternative by more
    /// than the balance limit, in which case the least-used port wins.
    /// Greedy and order dependent (destinations in ascending index order),
    /// so best effort: the configured bound holds, global optimality is
    /// not promised.
    fn select_routes(&mut self) {
        for dest in 0..self.switches.len() {
            let dest_idx = NodeIndex::new(dest);
            for from in 0..self.switches.len() {
                if from == dest {
                    continue;
                }
                let from_idx = NodeIndex::new(from);
                let Some(total) = self.trees[from].distance(dest_idx) else {
                    continue;
                };

                let mut default: Option<(PortNum, u64)> = None;
                let mut least: Option<(PortNum, u64)> = None;
                for &(next, link) in self.fabric.neighbors(from_idx) {
                    if self.trees[next.index()].distance(dest_idx)
                        != Some(total - 1)
                    {
                        continue;
                    }
                    let used = self.switches[from]
                        .usage
                        .get(link.out_port as usize)
                        .copied()
                        .unwrap_or(0);
                    if default.is_none() {
                        default = Some((link.out_port, used));
                    }
                    if least.map_or(true, |(_, best)| used < best) {
                        least = Some((link.out_port, used));
                    }
                }

                let (default_port, default_used) =
                    default.expect("reachable destination has a next hop");
                let (least_port, least_used) = least.unwrap();
                let port = if default_used > least_used + self.balance_limit {
                    least_port
                } else {
                    default_port
                };

                if let Some(counter) =
                    self.switches[from].usage.get_mut(port as usize)
                {
                    *counter += 1;
                }
                self.egress[from][dest] = Some(port);
            }
        }
    }

    /// Walks every routed pair's path and records its channel sequence in
    /// the dependency graph.
    fn build_dependencies(&mut self) {
        let mut channels = Vec::new();
        for from in 0..self.switches.len() {
            for dest in 0..self.switches.len() {
                if from == dest || self.egress[from][dest].is_none() {
                    continue;
                }
                channels.clear();
                let mut at = from;
                let mut in_port = PORT_INJECT;
                while at != dest {
                    let out = self.egress[at][dest]
                        .expect("routes shrink towards their destination");
                    channels.push(Channel {
                        switch: at,
                        in_port,
                        out_port: out,
                    });
                    let (next, next_in) = self
                        .fabric
                        .peer(NodeIndex::new(at), out)
                        .expect("chosen egress ports map to links");
                    at = next.index();
                    in_port = next_in;
                }
                self.cdg.record_path(&channels);
                self.routed_pairs += 1;
            }
        }
    }

    fn assign_lanes(&mut self) -> Result<()> {
        self.lanes_used = self.cdg.assign_lanes(self.vl_min)?;
        let mut lanes = Vec::new();
        for (vertex, channel) in self.cdg.vertices() {
            lanes.push((
                channel.switch,
                channel.out_port,
                self.cdg.vertex_lane(vertex),
            ));
        }
        for (switch, port, lane) in lanes {
            if let Some(slot) =
                self.switches[switch].port_lane.get_mut(port as usize)
            {
                *slot = (*slot).max(lane);
            }
        }
        for unit in &self.switches {
            let widest = unit.port_lane.iter().copied().max().unwrap_or(0);
            trace!(
                "switch {:#x} egress ports span lanes 0..={}",
                unit.guid,
                widest
            );
        }
        Ok(())
    }

    /// Builds every switch's new table off to the side of the live state.
    fn emit_tables(&mut self) -> Result<()> {
        let count = self.switches.len();
        for from in 0..count {
            let guid = self.switches[from].guid;
            let capacity = self.switches[from].lft_capacity;
            let mut lft = LinearForwardingTable::new(guid, capacity)?;

            // the switch's own LID terminates at the management port
            set_checked(&mut lft, guid, self.switches[from].lid, 0);

            for dest in 0..count {
                if let Some(port) = self.egress[from][dest] {
                    set_checked(&mut lft, guid, self.switches[dest].lid, port);
                }
            }

            for host in &self.hosts {
                let Some(attach) = self.fabric.index_of(host.switch) else {
                    warn!(
                        "host {:#x} attached to unknown switch {:#x}",
                        host.guid, host.switch
                    );
                    continue;
                };
                if attach.index() == from {
                    set_checked(&mut lft, guid, host.lid, host.switch_port);
                } else if let Some(port) = self.egress[from][attach.index()] {
                    set_checked(&mut lft, guid, host.lid, port);
                }
            }

            self.switches[from].lft = Some(lft);
        }
        Ok(())
    }
}

/// Sets an entry, leaving LIDs beyond the switch's advertised capacity at
/// the sentinel: such destinations are unreachable through this switch
/// rather than fatal.
fn set_checked(
    lft: &mut LinearForwardingTable,
    switch: Guid,
    lid: Lid,
    port: PortNum,
) {
    if (lid as usize) < lft.capacity() {
        lft.set(lid, port);
    } else {
        warn!(
            "lid {} beyond switch {:#x} table capacity {}",
            lid,
            switch,
            lft.capacity()
        );
    }
}

/// Computes and commits routing for the current topology: the one-shot
/// sweep entry point.
///
/// Strictly sequential; the only shared-state mutation is the final table
/// swap, done under the subnet's exclusive lock after every table has been
/// built successfully. Any failure discards the whole sweep context and
/// leaves the previously committed tables untouched.
pub fn run(subnet: &SharedSubnet, config: &SmConfig) -> Result<SweepReport> {
    let span = debug_span!("sweep");
    let _guard = span.enter();

    let (switches, hosts) = {
        let sub = subnet.read().expect("subnet lock poisoned");
        let mut switches: Vec<SwitchRecord> =
            sub.switches().cloned().collect();
        switches.sort_by_key(|s| s.guid);
        let mut hosts: Vec<HostRecord> = sub.hosts().copied().collect();
        hosts.sort_by_key(|h| h.guid);
        (switches, hosts)
    };
    debug!(
        "sweep over {} switches, {} hosts",
        switches.len(),
        hosts.len()
    );

    let mut ctx = RoutingContext::build(switches, hosts, config)?;
    ctx.select_routes();
    ctx.build_dependencies();
    debug!(
        "{} channels, {} dependencies over {} routed pairs",
        ctx.cdg.channels(),
        ctx.cdg.dependencies(),
        ctx.routed_pairs
    );
    ctx.assign_lanes()?;
    debug!("cycle-breaking settled on {} lanes", ctx.lanes_used);
    ctx.emit_tables()?;

    let report = SweepReport {
        switches: ctx.switches.len(),
        routed_pairs: ctx.routed_pairs,
        channels: ctx.cdg.channels(),
        dependencies: ctx.cdg.dependencies(),
        lanes_used: ctx.lanes_used,
        at: Utc::now(),
    };

    // the one exclusive critical section: swap every table pointer
    let mut sub = subnet.write().expect("subnet lock poisoned");
    for unit in &mut ctx.switches {
        let lft = unit.lft.take().expect("emit_tables built every table");
        match sub.switch_mut(unit.guid) {
            Some(record) => record.lft = Some(lft),
            None => warn!(
                "switch {:#x} disappeared mid-sweep; dropping its table",
                unit.guid
            ),
        }
    }
    sub.set_lanes_in_use(ctx.lanes_used);
    sub.set_last_sweep(report.at);
    drop(sub);

    debug!("committed {} tables", report.switches);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sm::lft::NO_PATH;
    use crate::sm::subnet::{shared, Subnet};

    fn switch(guid: Guid, lid: Lid) -> SwitchRecord {
        SwitchRecord::builder()
            .guid(guid)
            .lid(lid)
            .port_count(8)
            .lft_capacity(64)
            .build()
    }

    /// 1 - 2 - 3, each link on ports (1 or 2) : 1.
    fn line_subnet() -> SharedSubnet {
        let mut subnet = Subnet::new();
        for (guid, lid) in [(1, 1), (2, 2), (3, 3)] {
            subnet.add_switch(switch(guid, lid));
        }
        subnet.link(1, 1, 2, 1);
        subnet.link(2, 2, 3, 1);
        shared(subnet)
    }

    /// Six switches in a ring; port 1 towards the next switch, port 2
    /// towards the previous. Three-hop shortest paths then chain channel
    /// dependencies all the way around, which no single lane can hold.
    fn ring_subnet() -> SharedSubnet {
        let mut subnet = Subnet::new();
        for i in 0u64..6 {
            subnet.add_switch(switch(i + 1, i as Lid + 1));
        }
        for i in 0u64..6 {
            let a = i + 1;
            let b = (i + 1) % 6 + 1;
            subnet.link(a, 1, b, 2);
        }
        shared(subnet)
    }

    #[test]
    fn line_topology_routes_every_reachable_lid() {
        let subnet = line_subnet();
        let config = SmConfig::builder().vl_min(2).build();
        let report = run(&subnet, &config).unwrap();
        assert_eq!(report.switches, 3);
        assert_eq!(report.routed_pairs, 6);
        assert_eq!(report.lanes_used, 1);

        let sub = subnet.read().unwrap();
        for record in sub.switches() {
            let lft = record.lft.as_ref().expect("table committed");
            for lid in 1..=3 {
                let port = lft.get(lid);
                assert_ne!(port, NO_PATH, "lid {lid} unreachable");
                assert!(port <= record.port_count);
            }
        }
        // spot-check the actual routes
        let table = |guid: Guid| {
            sub.switch(guid).unwrap().lft.clone().unwrap()
        };
        assert_eq!(table(1).get(1), 0);
        assert_eq!(table(1).get(2), 1);
        assert_eq!(table(1).get(3), 1);
        assert_eq!(table(2).get(1), 1);
        assert_eq!(table(2).get(3), 2);
        assert_eq!(table(3).get(1), 1);
        assert_eq!(table(3).get(2), 1);
        assert_eq!(sub.lanes_in_use(), 1);
    }

    #[test]
    fn ring_fails_on_one_lane_and_keeps_tables_unset() {
        let subnet = ring_subnet();
        let config = SmConfig::builder().vl_min(1).build();
        let err = run(&subnet, &config).unwrap_err();
        assert!(matches!(err, Error::UnsupportedTopology(_)));

        let sub = subnet.read().unwrap();
        for record in sub.switches() {
            assert!(record.lft.is_none(), "no table may be committed");
        }
        assert_eq!(sub.lanes_in_use(), 0);
        assert!(sub.last_sweep().is_none());
    }

    #[test]
    fn ring_routes_on_two_lanes() {
        let subnet = ring_subnet();
        let config = SmConfig::builder().vl_min(2).build();
        let report = run(&subnet, &config).unwrap();
        assert_eq!(report.lanes_used, 2);
        assert_eq!(report.routed_pairs, 30);

        let sub = subnet.read().unwrap();
        assert_eq!(sub.lanes_in_use(), 2);
        for record in sub.switches() {
            let lft = record.lft.as_ref().unwrap();
            for lid in 1..=6 {
                assert_ne!(lft.get(lid), NO_PATH);
            }
        }
    }

    #[test]
    fn failed_sweep_preserves_previous_tables() {
        let subnet = ring_subnet();
        let good = SmConfig::builder().vl_min(2).build();
        run(&subnet, &good).unwrap();
        let before: Vec<_> = {
            let sub = subnet.read().unwrap();
            let mut tables: Vec<_> = sub
                .switches()
                .map(|s| (s.guid, s.lft.clone().unwrap()))
                .collect();
            tables.sort_by_key(|(guid, _)| *guid);
            tables
        };

        let bad = SmConfig::builder().vl_min(1).build();
        run(&subnet, &bad).unwrap_err();

        let sub = subnet.read().unwrap();
        for (guid, table) in before {
            assert_eq!(sub.switch(guid).unwrap().lft.as_ref(), Some(&table));
        }
        assert_eq!(sub.lanes_in_use(), 2);
    }

    #[test]
    fn host_lids_exit_through_attachment_port() {
        let subnet = line_subnet();
        {
            let mut sub = subnet.write().unwrap();
            sub.add_host(
                HostRecord::builder()
                    .guid(0x100)
                    .lid(40)
                    .switch(3)
                    .switch_port(5)
                    .build(),
            );
        }
        let config = SmConfig::builder().vl_min(2).build();
        run(&subnet, &config).unwrap();

        let sub = subnet.read().unwrap();
        assert_eq!(sub.switch(3).unwrap().lft.as_ref().unwrap().get(40), 5);
        assert_eq!(sub.switch(2).unwrap().lft.as_ref().unwrap().get(40), 2);
        assert_eq!(sub.switch(1).unwrap().lft.as_ref().unwrap().get(40), 1);
    }

    #[test]
    fn disconnected_destination_stays_at_sentinel() {
        let subnet = line_subnet();
        {
            let mut sub = subnet.write().unwrap();
            sub.add_switch(switch(9, 9)); // island
        }
        let config = SmConfig::builder().vl_min(2).build();
        run(&subnet, &config).unwrap();

        let sub = subnet.read().unwrap();
        assert_eq!(sub.switch(1).unwrap().lft.as_ref().unwrap().get(9), NO_PATH);
        assert_eq!(sub.switch(9).unwrap().lft.as_ref().unwrap().get(1), NO_PATH);
    }

    #[test]
    fn zero_capacity_switch_fails_the_sweep() {
        let subnet = line_subnet();
        {
            let mut sub = subnet.write().unwrap();
            sub.switch_mut(2).unwrap().lft_capacity = 0;
        }
        let config = SmConfig::builder().vl_min(2).build();
        let err = run(&subnet, &config).unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedTopology(Unsupported::NoLinearTable(2))
        ));
        let sub = subnet.read().unwrap();
        assert!(sub.switches().all(|s| s.lft.is_none()));
    }

    /// A(10) fans out to C(20) and D(30); four leaves hang off both, so
    /// every leaf is reachable from A at equal cost through port 1 or 2.
    fn fan_subnet() -> SharedSubnet {
        let mut subnet = Subnet::new();
        subnet.add_switch(switch(10, 10));
        subnet.add_switch(switch(20, 20));
        subnet.add_switch(switch(30, 30));
        for i in 0u64..4 {
            subnet.add_switch(switch(40 + i, 40 + i as Lid));
        }
        subnet.link(10, 1, 20, 7);
        subnet.link(10, 2, 30, 7);
        for i in 0u64..4 {
            subnet.link(20, i as PortNum + 1, 40 + i, 1);
            subnet.link(30, i as PortNum + 1, 40 + i, 2);
        }
        shared(subnet)
    }

    #[test]
    fn tight_balance_limit_splits_equal_cost_routes() {
        let subnet = fan_subnet();
        let config = SmConfig::builder().vl_min(4).balance_limit(0).build();
        run(&subnet, &config).unwrap();

        let sub = subnet.read().unwrap();
        let lft = sub.switch(10).unwrap().lft.clone().unwrap();
        let via_p1 =
            (40..44).filter(|&lid| lft.get(lid) == 1).count();
        let via_p2 =
            (40..44).filter(|&lid| lft.get(lid) == 2).count();
        assert_eq!(via_p1 + via_p2, 4);
        assert_eq!(via_p1, 2);
        assert_eq!(via_p2, 2);
    }

    #[test]
    fn loose_balance_limit_keeps_the_deterministic_choice() {
        let subnet = fan_subnet();
        let config = SmConfig::builder().vl_min(4).balance_limit(100).build();
        run(&subnet, &config).unwrap();

        let sub = subnet.read().unwrap();
        let lft = sub.switch(10).unwrap().lft.clone().unwrap();
        for lid in 40..44 {
            assert_eq!(lft.get(lid), 1);
        }
    }

    #[test]
    fn empty_subnet_sweeps_cleanly() {
        let subnet = shared(Subnet::new());
        let report = run(&subnet, &SmConfig::default()).unwrap();
        assert_eq!(report.switches, 0);
        assert_eq!(report.lanes_used, 0);
    }

    #[test]
    fn random_connected_fabrics_route_fully() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let _ = tracing_subscriber::fmt::try_init();
        let mut rng = StdRng::seed_from_u64(0x5EED);

        for _ in 0..8 {
            let count = rng.gen_range(2..10usize);
            let mut subnet = Subnet::new();
            let mut next_port = vec![1 as PortNum; count];
            for i in 0..count {
                subnet.add_switch(
                    SwitchRecord::builder()
                        .guid(i as Guid + 1)
                        .lid(i as Lid + 1)
                        .port_count(32)
                        .lft_capacity(64)
                        .build(),
                );
            }
            // spanning tree keeps it connected, extra links add cycles
            for i in 1..count {
                let peer = rng.gen_range(0..i);
                let (pa, pb) = (next_port[i], next_port[peer]);
                next_port[i] += 1;
                next_port[peer] += 1;
                subnet.link(i as Guid + 1, pa, peer as Guid + 1, pb);
            }
            for _ in 0..rng.gen_range(0..count) {
                let a = rng.gen_range(0..count);
                let b = rng.gen_range(0..count);
                if a == b || next_port[a] >= 32 || next_port[b] >= 32 {
                    continue;
                }
                let (pa, pb) = (next_port[a], next_port[b]);
                next_port[a] += 1;
                next_port[b] += 1;
                subnet.link(a as Guid + 1, pa, b as Guid + 1, pb);
            }

            let subnet = shared(subnet);
            let config = SmConfig::builder().vl_min(16).build();
            let report = run(&subnet, &config).unwrap();
            assert_eq!(report.routed_pairs, count * (count - 1));

            let sub = subnet.read().unwrap();
            for record in sub.switches() {
                let lft = record.lft.as_ref().unwrap();
                for lid in 1..=count as Lid {
                    let port = lft.get(lid);
                    assert_ne!(port, NO_PATH);
                    assert!(port <= record.port_count);
                }
            }
        }
    }
}
