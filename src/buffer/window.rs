#[derive(Clone, Copy, Debug, Default)]
struct Slot {
    owner: u16,
    seen: bool,
}

/// Fixed ring tracking which reliable sequence numbers have been received.
///
/// Slot `n % size` remembers the last sequence number written to it, so a lookup only succeeds for
/// the exact number stored there.
#[derive(Debug)]
pub struct SequenceWindow {
    slots: Box<[Slot]>,
}

impl SequenceWindow {
    pub fn new(size: usize) -> Self {
        assert!(size > 0);

        Self {
            slots: vec![Slot::default(); size].into_boxed_slice(),
        }
    }

    fn index(&self, sequence: u16) -> usize {
        sequence as usize % self.slots.len()
    }

    pub fn get(&self, sequence: u16) -> bool {
        let slot = &self.slots[self.index(sequence)];
        slot.owner == sequence && slot.seen
    }

    pub fn set(&mut self, sequence: u16, seen: bool) {
        let idx = self.index(sequence);
        self.slots[idx] = Slot {
            owner: sequence,
            seen,
        };
    }

    /// Builds the ack bitmap for `ack`: bit `i - 1` is set if `ack - i` has been seen.
    pub fn ack_bits(&self, ack: u16) -> u32 {
        let mut bits = 0;

        for i in 1..=32u16 {
            if self.get(ack.wrapping_sub(i)) {
                bits |= 1 << (i - 1);
            }
        }

        bits
    }

    pub fn reset(&mut self) {
        self.slots.fill(Slot::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get() {
        let mut window = SequenceWindow::new(200);

        assert!(!window.get(7));
        window.set(7, true);
        assert!(window.get(7));
        window.set(7, false);
        assert!(!window.get(7));
    }

    #[test]
    fn overwritten_slot() {
        let mut window = SequenceWindow::new(200);

        window.set(10, true);
        window.set(210, true);

        assert!(window.get(210));
        assert!(!window.get(10));
        assert!(!window.get(410));
    }

    #[test]
    fn wraparound() {
        let mut window = SequenceWindow::new(200);

        window.set(65535, true);
        window.set(0, true);

        assert!(window.get(65535));
        assert!(window.get(0));
    }

    #[test]
    fn ack_bits() {
        let mut window = SequenceWindow::new(200);

        // 65505 is 32 behind, 65504 is out of range
        for &seq in &[1u16, 0, 65535, 65505, 65504] {
            window.set(seq, true);
        }

        let bits = window.ack_bits(1);

        assert_eq!(bits & 0x1, 0x1);
        assert_eq!(bits & 0x2, 0x2);
        assert_eq!(bits & 0x4, 0);
        assert_eq!(bits & (1 << 31), 1 << 31);
        assert_eq!(bits.count_ones(), 3);
    }

    #[test]
    fn reset() {
        let mut window = SequenceWindow::new(200);

        window.set(3, true);
        window.reset();

        assert!(!window.get(3));
        assert!(!window.get(0));
    }
}
