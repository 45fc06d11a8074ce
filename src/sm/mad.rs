use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, trace, warn};

use super::dispatch::Dispatcher;
use super::error::{Error, Result};
use super::lft::NO_PATH;
use super::names::{clean_description, description_bytes, NODE_DESC_LEN};
use super::subnet::SharedSubnet;
use super::{Guid, PortNum};

/// Entries per linear-forwarding-table block, as the management protocol
/// reads and writes them.
pub const LFT_BLOCK: usize = 64;

/// Encoded size of one management datagram at this seam: method, reserved
/// byte, attribute id, attribute modifier, GUID, 64-byte payload.
pub const MAD_SIZE: usize = 80;

const ATTR_NODE_DESCRIPTION: u16 = 0x0010;
const ATTR_PORT_INFO: u16 = 0x0015;
const ATTR_LINEAR_FWD_TABLE: u16 = 0x0019;

const PORT_STATE_DOWN: u8 = 1;
const PORT_STATE_ACTIVE: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MadMethod {
    Get,
    Set,
    GetResp,
}

impl MadMethod {
    fn byte(self) -> u8 {
        match self {
            MadMethod::Get => 0x01,
            MadMethod::Set => 0x02,
            MadMethod::GetResp => 0x81,
        }
    }
}

impl TryFrom<u8> for MadMethod {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, ()> {
        match value {
            0x01 => Ok(MadMethod::Get),
            0x02 => Ok(MadMethod::Set),
            0x81 => Ok(MadMethod::GetResp),
            _ => Err(()),
        }
    }
}

/// The decoded attribute payload of a management datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MadAttr {
    NodeDescription {
        guid: Guid,
        raw: [u8; NODE_DESC_LEN],
    },
    PortState {
        guid: Guid,
        port: PortNum,
        up: bool,
    },
    LftBlock {
        guid: Guid,
        block: u16,
        entries: [u8; LFT_BLOCK],
    },
}

/// One decoded management datagram. The transport owns framing, retries
/// and timeouts; the engine only ever sees this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mad {
    pub method: MadMethod,
    pub attr: MadAttr,
}

impl Mad {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; MAD_SIZE];
        buf[0] = self.method.byte();
        match &self.attr {
            MadAttr::NodeDescription { guid, raw } => {
                BigEndian::write_u16(&mut buf[2..4], ATTR_NODE_DESCRIPTION);
                BigEndian::write_u64(&mut buf[8..16], *guid);
                buf[16..16 + NODE_DESC_LEN].copy_from_slice(raw);
            }
            MadAttr::PortState { guid, port, up } => {
                BigEndian::write_u16(&mut buf[2..4], ATTR_PORT_INFO);
                BigEndian::write_u32(&mut buf[4..8], *port as u32);
                BigEndian::write_u64(&mut buf[8..16], *guid);
                buf[16] = if *up { PORT_STATE_ACTIVE } else { PORT_STATE_DOWN };
            }
            MadAttr::LftBlock {
                guid,
                block,
                entries,
            } => {
                BigEndian::write_u16(&mut buf[2..4], ATTR_LINEAR_FWD_TABLE);
                BigEndian::write_u32(&mut buf[4..8], *block as u32);
                BigEndian::write_u64(&mut buf[8..16], *guid);
                buf[16..16 + LFT_BLOCK].copy_from_slice(entries);
            }
        }
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() != MAD_SIZE {
            return None;
        }
        let method = MadMethod::try_from(buf[0]).ok()?;
        let attr_id = BigEndian::read_u16(&buf[2..4]);
        let modifier = BigEndian::read_u32(&buf[4..8]);
        let guid = BigEndian::read_u64(&buf[8..16]);
        let attr = match attr_id {
            ATTR_NODE_DESCRIPTION => {
                let mut raw = [0u8; NODE_DESC_LEN];
                raw.copy_from_slice(&buf[16..16 + NODE_DESC_LEN]);
                MadAttr::NodeDescription { guid, raw }
            }
            ATTR_PORT_INFO => MadAttr::PortState {
                guid,
                port: modifier as PortNum,
                up: buf[16] == PORT_STATE_ACTIVE,
            },
            ATTR_LINEAR_FWD_TABLE => {
                let mut entries = [0u8; LFT_BLOCK];
                entries.copy_from_slice(&buf[16..16 + LFT_BLOCK]);
                MadAttr::LftBlock {
                    guid,
                    block: modifier as u16,
                    entries,
                }
            }
            _ => return None,
        };
        Some(Mad { method, attr })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

/// One MAD transport backend: send one datagram, poll one datagram,
/// report link state. Implementations own their wire format and their
/// retry/timeout behaviour; which one runs is picked by configuration at
/// startup, not by build flags.
pub trait MadTransport: Send + Sync {
    fn send(&self, mad: &Mad) -> Result<()>;
    fn try_recv(&self) -> Option<Mad>;
    fn link_state(&self) -> LinkState;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// In-memory pair of queues; what the demo binary and tests run on.
    Loopback,
}

pub fn build_transport(kind: TransportKind) -> Arc<dyn MadTransport> {
    match kind {
        TransportKind::Loopback => Arc::new(LoopbackTransport::new()),
    }
}

/// Loopback transport: datagrams injected on one side come back out the
/// other, passing through the wire encoding both ways.
#[derive(Default)]
pub struct LoopbackTransport {
    inbound: Mutex<VecDeque<Vec<u8>>>,
    outbound: Mutex<VecDeque<Vec<u8>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a datagram as if the fabric had sent it to us.
    pub fn inject(&self, mad: &Mad) {
        self.inbound
            .lock()
            .expect("loopback queue poisoned")
            .push_back(mad.to_bytes());
    }

    /// Pops the next datagram the engine sent, if any.
    pub fn take_sent(&self) -> Option<Mad> {
        let buf = self
            .outbound
            .lock()
            .expect("loopback queue poisoned")
            .pop_front()?;
        Mad::from_bytes(&buf)
    }
}

impl MadTransport for LoopbackTransport {
    fn send(&self, mad: &Mad) -> Result<()> {
        self.outbound
            .lock()
            .expect("loopback queue poisoned")
            .push_back(mad.to_bytes());
        Ok(())
    }

    fn try_recv(&self) -> Option<Mad> {
        loop {
            let buf = self
                .inbound
                .lock()
                .expect("loopback queue poisoned")
                .pop_front()?;
            match Mad::from_bytes(&buf) {
                Some(mad) => return Some(mad),
                None => warn!("dropping undecodable datagram"),
            }
        }
    }

    fn link_state(&self) -> LinkState {
        LinkState::Up
    }
}

/// Drains everything the transport has buffered right now, queueing one
/// work item per datagram. Returns how many were queued.
pub fn pump(
    transport: &Arc<dyn MadTransport>,
    dispatcher: &Dispatcher,
    subnet: &SharedSubnet,
) -> usize {
    if transport.link_state() == LinkState::Down {
        warn!("management port link is down; nothing to pump");
        return 0;
    }
    let mut queued = 0;
    while let Some(mad) = transport.try_recv() {
        let subnet = subnet.clone();
        let transport = transport.clone();
        dispatcher.queue(move || handle_mad(&subnet, &transport, mad));
        queued += 1;
    }
    queued
}

/// One receive callback: takes the subnet lock appropriate to the state it
/// touches, mutates, releases, returns. Runs on a dispatch worker, so it
/// can never overlap a table commit: the commit holds the same lock
/// exclusively.
fn handle_mad(
    subnet: &SharedSubnet,
    transport: &Arc<dyn MadTransport>,
    mad: Mad,
) {
    match (mad.method, mad.attr) {
        (MadMethod::Set, MadAttr::NodeDescription { guid, raw }) => {
            let mut sub = subnet.write().expect("subnet lock poisoned");
            // the name map wins over whatever freeform bytes the node sent
            let mapped = sub.names().lookup(guid).map(str::to_owned);
            match sub.switch_mut(guid) {
                Some(record) => {
                    record.description =
                        mapped.unwrap_or_else(|| clean_description(&raw));
                    trace!(
                        "node description of {:#x} is now {:?}",
                        guid, record.description
                    );
                }
                None => stale(guid),
            }
        }
        (MadMethod::Get, MadAttr::NodeDescription { guid, .. }) => {
            let sub = subnet.read().expect("subnet lock poisoned");
            match sub.switch(guid) {
                Some(record) => {
                    let resp = Mad {
                        method: MadMethod::GetResp,
                        attr: MadAttr::NodeDescription {
                            guid,
                            raw: description_bytes(&record.description),
                        },
                    };
                    if let Err(e) = transport.send(&resp) {
                        warn!("node description response failed: {}", e);
                    }
                }
                None => stale(guid),
            }
        }
        (MadMethod::Set, MadAttr::PortState { guid, port, up }) => {
            let mut sub = subnet.write().expect("subnet lock poisoned");
            if sub.switch(guid).is_none() {
                stale(guid);
                return;
            }
            if up {
                // discovery owns link creation; nothing to do until the
                // next sweep sees the restored link
                debug!("port {:#x}:{} reported up", guid, port);
            } else {
                debug!("port {:#x}:{} went down, dropping its link", guid, port);
                sub.unlink(guid, port);
            }
        }
        (MadMethod::Get, MadAttr::LftBlock { guid, block, .. }) => {
            let sub = subnet.read().expect("subnet lock poisoned");
            match sub.switch(guid) {
                Some(record) => {
                    let mut entries = [NO_PATH; LFT_BLOCK];
                    if let Some(lft) = &record.lft {
                        let base = block as usize * LFT_BLOCK;
                        for (i, entry) in entries.iter_mut().enumerate() {
                            *entry = lft.get((base + i) as super::Lid);
                        }
                    }
                    let resp = Mad {
                        method: MadMethod::GetResp,
                        attr: MadAttr::LftBlock {
                            guid,
                            block,
                            entries,
                        },
                    };
                    if let Err(e) = transport.send(&resp) {
                        warn!("forwarding table response failed: {}", e);
                    }
                }
                None => stale(guid),
            }
        }
        (MadMethod::GetResp, attr) => {
            trace!("response datagram consumed: {:?}", attr);
        }
        (method, attr) => {
            warn!("unhandled datagram {:?} {:?}", method, attr);
        }
    }
}

fn stale(guid: Guid) {
    // raced with a topology change; the handler is a no-op
    warn!("{}", Error::InconsistentState(guid));
}

/// Pushes every committed forwarding table out to its switch, one Set
/// datagram per 64-entry block. Returns how many datagrams went out.
pub fn program_lfts(
    transport: &Arc<dyn MadTransport>,
    subnet: &SharedSubnet,
) -> Result<usize> {
    let sub = subnet.read().expect("subnet lock poisoned");
    let mut sent = 0;
    for record in sub.switches() {
        let Some(lft) = &record.lft else {
            continue;
        };
        let blocks = lft.capacity().div_ceil(LFT_BLOCK);
        for block in 0..blocks {
            let mut entries = [NO_PATH; LFT_BLOCK];
            let base = block * LFT_BLOCK;
            for (i, entry) in entries.iter_mut().enumerate() {
                *entry = lft.get((base + i) as super::Lid);
            }
            transport.send(&Mad {
                method: MadMethod::Set,
                attr: MadAttr::LftBlock {
                    guid: record.guid,
                    block: block as u16,
                    entries,
                },
            })?;
            sent += 1;
        }
    }
    Ok(sent)
}
