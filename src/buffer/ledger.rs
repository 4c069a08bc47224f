use std::collections::VecDeque;

use crate::frame::Packet;

/// Verdict returned by the [`Ledger::iterate`] visitor for each entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Drop the entry permanently.
    Delete,
    /// Stop the scan; remaining entries are left untouched.
    Cancel,
    Continue,
}

/// An unacknowledged reliable packet.
#[derive(Clone, Debug)]
pub struct InFlight {
    pub packet: Packet,
    pub send_time_ms: u64,
    // Sent before the handshake completed; excluded from RTT sampling
    pub no_rtt: bool,
}

/// Insertion-ordered record of reliable packets awaiting acknowledgement.
#[derive(Debug, Default)]
pub struct Ledger {
    entries: VecDeque<InFlight>,
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, packet: Packet, no_rtt: bool, now_ms: u64) {
        self.entries.push_back(InFlight {
            packet,
            send_time_ms: now_ms,
            no_rtt,
        });
    }

    /// Removes and returns the oldest entry carrying `sequence`.
    pub fn retrieve(&mut self, sequence: u16) -> Option<InFlight> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.packet.sequence == sequence)?;

        self.entries.remove(idx)
    }

    /// Visits entries oldest first. The visitor receives the number of entries visited so far.
    pub fn iterate<F>(&mut self, mut visit: F)
    where
        F: FnMut(usize, &InFlight) -> Operation,
    {
        let mut idx = 0;
        let mut visited = 0;

        while idx < self.entries.len() {
            match visit(visited, &self.entries[idx]) {
                Operation::Delete => {
                    self.entries.remove(idx);
                }
                Operation::Cancel => return,
                Operation::Continue => idx += 1,
            }

            visited += 1;
        }
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Descriptor;

    fn packet(sequence: u16) -> Packet {
        let mut p = Packet::new(Descriptor::RELIABLE, Box::new([]));
        p.sequence = sequence;
        p
    }

    fn sequences(ledger: &mut Ledger) -> Vec<u16> {
        let mut seqs = Vec::new();
        ledger.iterate(|_, e| {
            seqs.push(e.packet.sequence);
            Operation::Continue
        });
        seqs
    }

    #[test]
    fn retrieve() {
        let mut ledger = Ledger::new();

        ledger.add(packet(1), false, 100);
        ledger.add(packet(2), true, 110);
        ledger.add(packet(3), false, 120);

        let e = ledger.retrieve(2).unwrap();
        assert_eq!(e.send_time_ms, 110);
        assert!(e.no_rtt);

        assert!(ledger.retrieve(2).is_none());
        assert!(ledger.retrieve(9).is_none());
        assert_eq!(sequences(&mut ledger), vec![1, 3]);
    }

    #[test]
    fn iterate_delete_cancel() {
        let mut ledger = Ledger::new();

        for seq in 0..6 {
            ledger.add(packet(seq), false, seq as u64 * 10);
        }

        let mut resent = Vec::new();

        // Expire anything sent before t=20, visit at most 4 entries
        ledger.iterate(|i, e| {
            if i >= 4 {
                return Operation::Cancel;
            }
            if e.send_time_ms < 20 {
                return Operation::Delete;
            }
            resent.push(e.packet.sequence);
            Operation::Continue
        });

        assert_eq!(resent, vec![2, 3]);
        assert_eq!(sequences(&mut ledger), vec![2, 3, 4, 5]);
    }

    #[test]
    fn reset() {
        let mut ledger = Ledger::new();

        ledger.add(packet(1), false, 0);
        ledger.reset();

        assert!(ledger.is_empty());
    }
}
