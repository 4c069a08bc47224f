use std::collections::VecDeque;

use crate::frame::Packet;
use crate::seq::order_greater_than;

/// Bounded reorder buffer for the reliable-ordered stream.
///
/// Packets are kept sorted by order number using half-range comparison, so the buffer stays
/// correct across the 255 -> 0 wrap.
#[derive(Debug)]
pub struct Chain {
    // Sorted, oldest first
    packets: VecDeque<Packet>,
    // Next order number to deliver
    next: u8,
    length_max: usize,
}

impl Chain {
    pub fn new(length_max: usize) -> Self {
        assert!(length_max > 0);

        Self {
            packets: VecDeque::new(),
            next: 0,
            length_max,
        }
    }

    pub fn next(&self) -> u8 {
        self.next
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Inserts a packet in order. Packets behind `next`, or whose order number is already held,
    /// are discarded and `false` is returned. If the bound is exceeded the head is evicted.
    pub fn insert(&mut self, packet: Packet) -> bool {
        let order = packet.order;

        if order_greater_than(self.next, order) {
            return false;
        }

        let mut idx = 0;

        for p in self.packets.iter() {
            if p.order == order {
                return false;
            }
            if order_greater_than(order, p.order) {
                idx += 1;
            } else {
                break;
            }
        }

        self.packets.insert(idx, packet);

        if self.packets.len() > self.length_max {
            self.packets.pop_front();
        }

        true
    }

    /// Removes and returns the run of packets numbered `next, next + 1, ...`, stopping at the
    /// first gap.
    pub fn pop_consecutive(&mut self) -> Vec<Packet> {
        let mut popped = Vec::new();

        while let Some(p) = self.packets.front() {
            if p.order != self.next {
                break;
            }

            self.next = self.next.wrapping_add(1);

            if let Some(p) = self.packets.pop_front() {
                popped.push(p);
            }
        }

        popped
    }

    /// Gives up on the missing packet(s) in front of the head.
    pub fn skip(&mut self) {
        if let Some(p) = self.packets.front() {
            self.next = p.order;
        }
    }

    pub fn reset(&mut self) {
        self.packets.clear();
        self.next = 0;
    }
}
