use super::error::{Error, Result, Unsupported};
use super::{Guid, Lid, PortNum};

/// The entry a forwarding table holds for a LID it has no route for.
pub const NO_PATH: PortNum = 0xFF;

/// A switch's linear forwarding table: an array indexed by unicast LID
/// holding the egress port that LID leaves the switch through, or
/// [`NO_PATH`] for destinations the last sweep could not reach.
///
/// The size is fixed at creation to the switch's advertised capacity and
/// every entry always holds either a valid port or the sentinel. Dropping
/// the table releases its storage; there is no separate destroy step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearForwardingTable {
    entries: Vec<PortNum>,
}

impl LinearForwardingTable {
    /// Allocates a table of `capacity` entries, all set to [`NO_PATH`].
    ///
    /// A switch that advertises a capacity of zero supports no linear
    /// forwarding table at all, which makes the topology unroutable.
    pub fn new(switch: Guid, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::UnsupportedTopology(Unsupported::NoLinearTable(
                switch,
            )));
        }
        let mut entries = Vec::new();
        entries.try_reserve_exact(capacity)?;
        entries.resize(capacity, NO_PATH);
        Ok(Self { entries })
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Overwrites the entry for `lid`.
    ///
    /// A LID outside the table is a programming error on the caller's
    /// side: it trips a debug assertion, and is a no-op in release builds
    /// so a miscounted LID range degrades to an unreachable destination
    /// instead of corrupting a neighbouring entry.
    pub fn set(&mut self, lid: Lid, port: PortNum) {
        debug_assert!(
            (lid as usize) < self.entries.len(),
            "lid {lid} outside table of {} entries",
            self.entries.len()
        );
        if let Some(entry) = self.entries.get_mut(lid as usize) {
            *entry = port;
        }
    }

    /// Returns the stored egress port for `lid`, or [`NO_PATH`] if the
    /// entry was never set or the LID lies outside the table.
    pub fn get(&self, lid: Lid) -> PortNum {
        self.entries.get(lid as usize).copied().unwrap_or(NO_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_table_is_all_sentinel() {
        let table = LinearForwardingTable::new(0xA0, 48).unwrap();
        for lid in 0..48 {
            assert_eq!(table.get(lid), NO_PATH);
        }
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut table = LinearForwardingTable::new(0xA0, 16).unwrap();
        table.set(3, 7);
        table.set(9, 1);
        assert_eq!(table.get(3), 7);
        assert_eq!(table.get(9), 1);
        assert_eq!(table.get(4), NO_PATH);
    }

    #[test]
    fn zero_capacity_is_unsupported() {
        let err = LinearForwardingTable::new(0xB1, 0).unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedTopology(Unsupported::NoLinearTable(0xB1))
        ));
    }

    #[test]
    fn out_of_range_get_is_sentinel() {
        let table = LinearForwardingTable::new(0xA0, 8).unwrap();
        assert_eq!(table.get(8), NO_PATH);
        assert_eq!(table.get(Lid::MAX), NO_PATH);
    }
}
