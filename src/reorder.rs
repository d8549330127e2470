use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use bytes::Bytes;

use crate::Serial;

/// A packet buffered ahead of the next expected serial.
#[derive(Debug, Clone)]
pub(crate) struct Pending {
    pub serial: Serial,
    pub payload: Bytes,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.serial == other.serial
    }
}

impl Eq for Pending {}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.serial.cmp(&other.serial)
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap over serial for out-of-order arrivals. Only serials strictly
/// ahead of the next expected one are pushed.
#[derive(Debug, Default)]
pub(crate) struct ReorderQueue {
    heap: BinaryHeap<Reverse<Pending>>,
}

impl ReorderQueue {
    pub(crate) fn new() -> Self {
        Self { heap: BinaryHeap::new() }
    }

    pub(crate) fn push(&mut self, serial: Serial, payload: Bytes) {
        self.heap.push(Reverse(Pending { serial, payload }));
    }

    /// Pop the buffered packet for `expected`, if it is next in line.
    ///
    /// Entries below `expected` are duplicates of already delivered serials
    /// and are discarded on the way; an entry above it is a gap, and stays.
    pub(crate) fn pop_next(&mut self, expected: Serial) -> Option<Pending> {
        while let Some(Reverse(head)) = self.heap.pop() {
            match head.serial.cmp(&expected) {
                Ordering::Less => continue,
                Ordering::Equal => return Some(head),
                Ordering::Greater => {
                    self.heap.push(Reverse(head));
                    return None;
                }
            }
        }
        None
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(byte: u8) -> Bytes {
        Bytes::copy_from_slice(&[byte])
    }

    #[test]
    fn drains_in_serial_order() {
        let mut queue = ReorderQueue::new();
        queue.push(4, payload(4));
        queue.push(2, payload(2));
        queue.push(3, payload(3));

        assert!(queue.pop_next(1).is_none(), "serial 1 never arrived");
        for expected in 2..=4 {
            let pending = queue.pop_next(expected).unwrap();
            assert_eq!(pending.serial, expected);
            assert_eq!(pending.payload[0] as u32, expected);
        }
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn stops_at_first_gap() {
        let mut queue = ReorderQueue::new();
        queue.push(2, payload(2));
        queue.push(5, payload(5));

        assert_eq!(queue.pop_next(2).unwrap().serial, 2);
        assert!(queue.pop_next(3).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn discards_stale_duplicates() {
        let mut queue = ReorderQueue::new();
        queue.push(3, payload(3));
        queue.push(3, payload(3));
        queue.push(4, payload(4));

        assert_eq!(queue.pop_next(3).unwrap().serial, 3);
        // the second 3 is now stale and must not wedge the drain
        assert_eq!(queue.pop_next(4).unwrap().serial, 4);
        assert_eq!(queue.len(), 0);
    }
}
