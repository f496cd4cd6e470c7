//! Last-seen sequence counter table.
//!
//! One entry per (comId, source, message type) records the last accepted
//! counter so duplicates and replays are dropped and gaps are counted.
//! Publishers seed their counters from the same table so a re-publish does
//! not jump backwards from a subscriber's point of view.

use std::net::Ipv4Addr;

use crate::frame::MsgType;

/// Initial table capacity; the table grows by powers of two.
pub const INITIAL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy)]
struct Entry {
    com_id: u32,
    src_ip: Ipv4Addr,
    msg_type: MsgType,
    last_seq: u32,
}

/// Outcome of checking a received counter against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqOutcome {
    /// Counter advanced; `missed` packets were skipped in between.
    Fresh {
        /// Gap to the previously accepted counter.
        missed: u32,
    },
    /// Counter equal or behind the stored one; drop the frame.
    Duplicate,
}

/// Per-session sequence counter table.
#[derive(Debug)]
pub struct SeqCntTable {
    entries: Vec<Entry>,
}

impl Default for SeqCntTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SeqCntTable {
    /// Create an empty table with the initial capacity preallocated.
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(INITIAL_CAPACITY),
        }
    }

    fn find(&self, com_id: u32, src_ip: Ipv4Addr, msg_type: MsgType) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.com_id == com_id && e.src_ip == src_ip && e.msg_type == msg_type)
    }

    /// Last stored counter, if any telegram of this key was seen or sent.
    pub fn last(&self, com_id: u32, src_ip: Ipv4Addr, msg_type: MsgType) -> Option<u32> {
        self.find(com_id, src_ip, msg_type)
            .map(|i| self.entries[i].last_seq)
    }

    /// Record a counter unconditionally (send path).
    pub fn store(&mut self, com_id: u32, src_ip: Ipv4Addr, msg_type: MsgType, seq: u32) {
        match self.find(com_id, src_ip, msg_type) {
            Some(i) => self.entries[i].last_seq = seq,
            None => {
                if self.entries.len() == self.entries.capacity() {
                    // Powers of two from the initial size.
                    self.entries.reserve(self.entries.capacity());
                }
                self.entries.push(Entry {
                    com_id,
                    src_ip,
                    msg_type,
                    last_seq: seq,
                });
            }
        }
    }

    /// Check a received counter; fresh counters are stored, duplicates
    /// leave the table untouched.
    ///
    /// The first telegram of a key is always fresh.
    pub fn check_and_update(
        &mut self,
        com_id: u32,
        src_ip: Ipv4Addr,
        msg_type: MsgType,
        seq: u32,
    ) -> SeqOutcome {
        match self.find(com_id, src_ip, msg_type) {
            Some(i) => {
                let stored = self.entries[i].last_seq;
                if seq <= stored {
                    SeqOutcome::Duplicate
                } else {
                    self.entries[i].last_seq = seq;
                    SeqOutcome::Fresh {
                        missed: seq - stored - 1,
                    }
                }
            }
            None => {
                self.store(com_id, src_ip, msg_type, seq);
                SeqOutcome::Fresh { missed: 0 }
            }
        }
    }

    /// Starting counter for a publisher of this key: the stored value, so
    /// the first emission (`stored + 1`) continues the old progression.
    pub fn publisher_seed(&self, com_id: u32, src_ip: Ipv4Addr, msg_type: MsgType) -> u32 {
        self.last(com_id, src_ip, msg_type).unwrap_or(0)
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    #[test]
    fn test_first_packet_is_fresh() {
        let mut table = SeqCntTable::new();
        assert_eq!(
            table.check_and_update(12345, SRC, MsgType::Pd, 1),
            SeqOutcome::Fresh { missed: 0 }
        );
    }

    #[test]
    fn test_duplicate_and_replay_dropped() {
        let mut table = SeqCntTable::new();
        table.check_and_update(12345, SRC, MsgType::Pd, 5);
        assert_eq!(
            table.check_and_update(12345, SRC, MsgType::Pd, 5),
            SeqOutcome::Duplicate
        );
        assert_eq!(
            table.check_and_update(12345, SRC, MsgType::Pd, 3),
            SeqOutcome::Duplicate
        );
        // stored value untouched by the duplicates
        assert_eq!(table.last(12345, SRC, MsgType::Pd), Some(5));
    }

    #[test]
    fn test_gap_counting() {
        let mut table = SeqCntTable::new();
        table.check_and_update(12345, SRC, MsgType::Pd, 1);
        assert_eq!(
            table.check_and_update(12345, SRC, MsgType::Pd, 5),
            SeqOutcome::Fresh { missed: 3 }
        );
    }

    #[test]
    fn test_keys_are_independent() {
        let mut table = SeqCntTable::new();
        table.check_and_update(1, SRC, MsgType::Pd, 10);
        // Same comId/source with the pull type runs its own counter.
        assert_eq!(
            table.check_and_update(1, SRC, MsgType::Pr, 1),
            SeqOutcome::Fresh { missed: 0 }
        );
        let other = Ipv4Addr::new(10, 0, 0, 2);
        assert_eq!(
            table.check_and_update(1, other, MsgType::Pd, 1),
            SeqOutcome::Fresh { missed: 0 }
        );
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_publisher_seed_continues_progression() {
        let mut table = SeqCntTable::new();
        assert_eq!(table.publisher_seed(7, SRC, MsgType::Pd), 0);
        table.store(7, SRC, MsgType::Pd, 41);
        assert_eq!(table.publisher_seed(7, SRC, MsgType::Pd), 41);
    }
}
