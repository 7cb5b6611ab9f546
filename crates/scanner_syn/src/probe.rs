//! In-flight probe tracking.
//!
//! One entry per outstanding SYN, keyed by destination port. A
//! per-port uniqueness invariant falls out for free from using the
//! port itself as the hash map key.

use std::collections::HashMap;

use crate::timestamp;

/// A probe that has been sent and has not yet been resolved by a
/// reply or by aging out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub dport: u16,
    pub sent_at: u32,
    pub retries: u8,
}

/// A probe is dropped once it has been retransmitted this many times
/// without a reply.
pub const NUM_RETRIES: u8 = 2;

#[derive(Debug, Default)]
pub struct ProbeTable {
    probes: HashMap<u16, Probe>,
}

impl ProbeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    /// Inserts a fresh probe, or if one for `dport` already exists,
    /// bumps its retry count and overwrites its send time.
    pub fn insert_or_bump(&mut self, dport: u16, sent_at: u32) {
        self.probes
            .entry(dport)
            .and_modify(|p| {
                p.retries += 1;
                p.sent_at = sent_at;
            })
            .or_insert(Probe {
                dport,
                sent_at,
                retries: 0,
            });
    }

    pub fn find(&self, dport: u16) -> Option<&Probe> {
        self.probes.get(&dport)
    }

    /// No-op if `dport` is not present.
    pub fn remove(&mut self, dport: u16) {
        self.probes.remove(&dport);
    }

    /// Sweeps every entry against `rtt`: probes that have aged past
    /// `2 * rtt` and still have retries left become retransmit
    /// candidates; probes that have exhausted their retries are
    /// dropped. Returns the last candidate seen during the sweep, not
    /// the whole set, since the driver only ever retransmits one port
    /// at a time per call.
    pub fn expire(&mut self, rtt: u32) -> Option<u16> {
        let mut candidate = None;
        let mut dead = Vec::new();

        for probe in self.probes.values() {
            if !timestamp::is_dead(probe.sent_at, rtt) {
                continue;
            }
            if probe.retries < NUM_RETRIES {
                candidate = Some(probe.dport);
            } else {
                dead.push(probe.dport);
            }
        }

        for dport in dead {
            self.probes.remove(&dport);
        }

        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_bump_keeps_single_entry() {
        let mut table = ProbeTable::new();
        table.insert_or_bump(22, 100);
        table.insert_or_bump(22, 200);
        assert_eq!(table.len(), 1);
        let probe = table.find(22).unwrap();
        assert_eq!(probe.sent_at, 200);
        assert_eq!(probe.retries, 1);
    }

    #[test]
    fn insert_then_remove_is_a_no_op_overall() {
        let mut table = ProbeTable::new();
        table.insert_or_bump(22, 100);
        table.remove(22);
        assert!(table.is_empty());
        table.remove(22); // removing again is a no-op, not an error
        assert!(table.is_empty());
    }

    #[test]
    fn at_most_one_entry_per_port() {
        let mut table = ProbeTable::new();
        for sent_at in 0..10 {
            table.insert_or_bump(443, sent_at);
        }
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn expire_drops_probes_past_retry_budget() {
        let mut table = ProbeTable::new();
        let rtt = timestamp::MAX_PACKED_INTERVAL;
        let ancient = timestamp::now().wrapping_sub(3 * rtt);
        table.insert_or_bump(80, ancient);
        table.probes.get_mut(&80).unwrap().retries = NUM_RETRIES;
        let candidate = table.expire(rtt);
        assert_eq!(candidate, None);
        assert!(table.is_empty());
    }

    #[test]
    fn expire_returns_a_retriable_candidate() {
        let mut table = ProbeTable::new();
        let rtt = timestamp::MAX_PACKED_INTERVAL;
        let ancient = timestamp::now().wrapping_sub(3 * rtt);
        table.insert_or_bump(80, ancient);
        let candidate = table.expire(rtt);
        assert_eq!(candidate, Some(80));
        assert_eq!(table.find(80).unwrap().retries, 0);
    }

    #[test]
    fn expire_leaves_fresh_probes_alone() {
        let mut table = ProbeTable::new();
        table.insert_or_bump(80, timestamp::now());
        assert_eq!(table.expire(timestamp::MAX_PACKED_INTERVAL), None);
        assert_eq!(table.len(), 1);
    }
}
