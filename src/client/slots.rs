//! Ring of in-flight request slots.
//!
//! The ring holds `concurrency + 1` entries: a request's slot stays live
//! until the *next* response reports its completion, so one extra entry
//! guarantees a free slot whenever admission lets a new request start.

use crate::protocol::ProtocolError;

/// Timestamps of one direction of an exchange, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Leg {
    pub write_start: u64,
    pub write_end: u64,
    pub read_start: u64,
    pub read_end: u64,
}

/// One in-flight request. Free when `seq == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Slot {
    pub seq: u64,
    pub request: Leg,
    pub response: Leg,
}

impl Slot {
    pub fn is_free(&self) -> bool {
        self.seq == 0
    }
}

#[derive(Debug)]
pub struct SlotRing {
    slots: Vec<Slot>,
    last: usize,
    live: usize,
}

impl SlotRing {
    pub fn new(concurrency: usize) -> Self {
        let capacity = concurrency + 1;
        Self {
            slots: vec![Slot::default(); capacity],
            // Start scanning from the first entry.
            last: capacity - 1,
            live: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently holding a request.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Claims the first free slot after the last one handed out and returns
    /// its 1-based index, or `None` when every slot is live.
    pub fn allocate(&mut self, seq: u64, write_start: u64) -> Option<u64> {
        debug_assert!(seq != 0, "seq 0 marks a free slot");
        let capacity = self.slots.len();
        let index = (1..=capacity)
            .map(|step| (self.last + step) % capacity)
            .find(|&i| self.slots[i].is_free())?;

        self.slots[index] = Slot {
            seq,
            request: Leg {
                write_start,
                write_end: write_start,
                ..Leg::default()
            },
            response: Leg::default(),
        };
        self.last = index;
        self.live += 1;
        Some(index as u64 + 1)
    }

    /// Looks up a live slot by its 1-based index, checking that it holds `seq`.
    pub fn claim(&mut self, index: u64, seq: u64) -> Result<&mut Slot, ProtocolError> {
        let capacity = self.slots.len();
        let slot = index
            .checked_sub(1)
            .and_then(|i| self.slots.get_mut(i as usize))
            .ok_or(ProtocolError::SlotOutOfRange { index, capacity })?;
        if slot.seq != seq || slot.is_free() {
            return Err(ProtocolError::SlotMismatch {
                index,
                stored: slot.seq,
                claimed: seq,
            });
        }
        Ok(slot)
    }

    /// Frees a slot. The index must come from a successful [`claim`](Self::claim).
    pub fn release(&mut self, index: u64) {
        if let Some(slot) = index
            .checked_sub(1)
            .and_then(|i| self.slots.get_mut(i as usize))
        {
            if !slot.is_free() {
                *slot = Slot::default();
                self.live -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_capacity() {
        let ring = SlotRing::new(3);
        assert_eq!(ring.capacity(), 4);
        assert_eq!(ring.live(), 0);
    }

    #[test]
    fn test_allocation_walks_forward() {
        let mut ring = SlotRing::new(2);
        assert_eq!(ring.allocate(1, 100), Some(1));
        assert_eq!(ring.allocate(2, 101), Some(2));
        ring.release(1);
        // Scanning resumes after slot 2, so slot 3 comes before slot 1.
        assert_eq!(ring.allocate(3, 102), Some(3));
        assert_eq!(ring.allocate(4, 103), Some(1));
        assert_eq!(ring.allocate(5, 104), None);
        assert_eq!(ring.live(), 3);
    }

    #[test]
    fn test_claim_checks_seq() {
        let mut ring = SlotRing::new(1);
        let index = ring.allocate(7, 100).unwrap();
        assert_eq!(ring.claim(index, 7).unwrap().request.write_start, 100);
        assert_eq!(
            ring.claim(index, 8).unwrap_err(),
            ProtocolError::SlotMismatch {
                index,
                stored: 7,
                claimed: 8
            }
        );
    }

    #[test]
    fn test_claim_out_of_range() {
        let mut ring = SlotRing::new(1);
        assert!(matches!(
            ring.claim(0, 1),
            Err(ProtocolError::SlotOutOfRange { index: 0, .. })
        ));
        assert!(matches!(
            ring.claim(3, 1),
            Err(ProtocolError::SlotOutOfRange { index: 3, capacity: 2 })
        ));
    }

    #[test]
    fn test_free_slot_cannot_be_claimed() {
        let mut ring = SlotRing::new(1);
        assert!(matches!(
            ring.claim(1, 0),
            Err(ProtocolError::SlotMismatch { .. })
        ));
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut ring = SlotRing::new(1);
        let index = ring.allocate(1, 0).unwrap();
        ring.release(index);
        ring.release(index);
        assert_eq!(ring.live(), 0);
    }
}
