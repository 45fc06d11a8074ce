use std::sync::Arc;

use fabricsm::sm::config::SmConfig;
use fabricsm::sm::dispatch::Dispatcher;
use fabricsm::sm::lft::NO_PATH;
use fabricsm::sm::mad::{
    self, LoopbackTransport, Mad, MadAttr, MadMethod, MadTransport,
};
use fabricsm::sm::names::{description_bytes, NodeNameMap};
use fabricsm::sm::subnet::{self, HostRecord, Subnet, SwitchRecord};
use fabricsm::sm::sweep;
use tracing::{info, warn};

/// Demo fabric: six switches in a ring with one host per switch. The ring
/// is the smallest shape whose shortest paths chain channel dependencies
/// all the way around, so it genuinely needs the second virtual lane.
fn demo_subnet() -> Subnet {
    let mut subnet = Subnet::new();
    for i in 0u64..6 {
        subnet.add_switch(
            SwitchRecord::builder()
                .guid(0x1000 + i)
                .lid(i as u16 + 1)
                .port_count(8)
                .lft_capacity(64)
                .build(),
        );
        subnet.add_host(
            HostRecord::builder()
                .guid(0x2000 + i)
                .lid(i as u16 + 10)
                .switch(0x1000 + i)
                .switch_port(5)
                .build(),
        );
    }
    for i in 0u64..6 {
        let a = 0x1000 + i;
        let b = 0x1000 + (i + 1) % 6;
        subnet.link(a, 1, b, 2);
    }
    subnet
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = SmConfig::builder()
        .vl_min(2)
        .balance_limit(4)
        .workers(4)
        .build();

    let mut subnet = demo_subnet();
    if let Some(path) = std::env::args().nth(1) {
        match NodeNameMap::load(path.as_ref()) {
            Ok(names) => {
                info!("loaded {} node names from {}", names.len(), path);
                subnet.set_names(names);
            }
            Err(e) => warn!("could not load name map {}: {}", path, e),
        }
    }
    let subnet = subnet::shared(subnet);

    let dispatcher = Dispatcher::new(config.workers);
    let loopback = Arc::new(LoopbackTransport::new());
    let transport = loopback.clone() as Arc<dyn MadTransport>;

    // a little management traffic, as if the fabric were talking to us
    for i in 0u64..6 {
        loopback.inject(&Mad {
            method: MadMethod::Set,
            attr: MadAttr::NodeDescription {
                guid: 0x1000 + i,
                raw: description_bytes(&format!("demo switch {i}")),
            },
        });
    }
    let queued = mad::pump(&transport, &dispatcher, &subnet);
    info!("queued {} management datagrams", queued);

    let report = sweep::run(&subnet, &config).unwrap();
    info!(
        "sweep routed {} pairs over {} switches on {} lanes",
        report.routed_pairs, report.switches, report.lanes_used
    );

    // drain the remaining handlers so the printout below is settled
    dispatcher.shutdown().await;

    {
        let sub = subnet.read().unwrap();
        for record in sub.switches() {
            let lft = record.lft.as_ref().unwrap();
            let routes: Vec<String> = (0..lft.capacity() as u16)
                .filter(|&lid| lft.get(lid) != NO_PATH)
                .map(|lid| format!("{}->{}", lid, lft.get(lid)))
                .collect();
            println!(
                "{:#06x} {:24} {}",
                record.guid,
                record.description,
                routes.join(" ")
            );
        }
    }

    let programmed = mad::program_lfts(&transport, &subnet).unwrap();
    info!("programmed {} forwarding table blocks", programmed);
}
