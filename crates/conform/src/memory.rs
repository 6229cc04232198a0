//! RAM accounting for source-cache packets across all sequences.
//!
//! The budget is a soft cap. Once exceeded, the oldest entries (by
//! insertion) are selected for eviction until usage falls to the purge
//! target. Evicted packets remain recoverable from the warm tier.

use std::collections::{HashMap, VecDeque};

use splice_timeline::SequenceId;

use crate::source_key::SourceKey;

type EntryId = (SequenceId, SourceKey);

#[derive(Debug)]
pub struct MemoryBudget {
    cap_bytes: usize,
    target_bytes: usize,
    used_bytes: usize,
    next_serial: u64,
    order: VecDeque<(u64, EntryId)>,
    live: HashMap<EntryId, (u64, usize)>,
}

impl MemoryBudget {
    pub fn new(cap_bytes: usize, target_bytes: usize) -> Self {
        Self {
            cap_bytes,
            target_bytes: target_bytes.min(cap_bytes),
            used_bytes: 0,
            next_serial: 0,
            order: VecDeque::new(),
            live: HashMap::new(),
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn cap_bytes(&self) -> usize {
        self.cap_bytes
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn is_over_cap(&self) -> bool {
        self.used_bytes > self.cap_bytes
    }

    /// Account for a packet. Re-recording a key replaces its size and moves
    /// it to the back of the purge order.
    pub fn record(&mut self, sequence_id: &SequenceId, key: &SourceKey, bytes: usize) {
        let id = (sequence_id.clone(), key.clone());
        let serial = self.next_serial;
        self.next_serial += 1;
        if let Some((_, old)) = self.live.insert(id.clone(), (serial, bytes)) {
            self.used_bytes -= old;
        }
        self.used_bytes += bytes;
        self.order.push_back((serial, id));
        self.compact();
    }

    pub fn forget(&mut self, sequence_id: &SequenceId, key: &SourceKey) {
        if let Some((_, bytes)) = self.live.remove(&(sequence_id.clone(), key.clone())) {
            self.used_bytes -= bytes;
        }
    }

    pub fn forget_sequence(&mut self, sequence_id: &SequenceId) {
        let mut freed = 0;
        self.live.retain(|(seq, _), (_, bytes)| {
            let keep = seq != sequence_id;
            if !keep {
                freed += *bytes;
            }
            keep
        });
        self.used_bytes -= freed;
        self.compact();
    }

    /// Remove the oldest entries until usage is at or below the purge target.
    /// Returns the evicted entries, oldest first.
    pub fn select_victims(&mut self) -> Vec<(SequenceId, SourceKey)> {
        let mut victims = Vec::new();
        while self.used_bytes > self.target_bytes {
            let Some((serial, id)) = self.order.pop_front() else {
                break;
            };
            // Entries re-recorded or forgotten since this slot was queued are stale.
            if self.live.get(&id).map(|(live, _)| *live) != Some(serial) {
                continue;
            }
            if let Some((_, bytes)) = self.live.remove(&id) {
                self.used_bytes -= bytes;
                victims.push(id);
            }
        }
        victims
    }

    fn compact(&mut self) {
        if self.order.len() > self.live.len() * 2 + 64 {
            let live = &self.live;
            self.order
                .retain(|(serial, id)| live.get(id).map(|(s, _)| s) == Some(serial));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splice_timeline::ClipId;

    fn key(frame: u64) -> SourceKey {
        SourceKey::new(ClipId::new("c"), frame, 0)
    }

    #[test]
    fn test_purge_evicts_oldest_to_target() {
        let seq = SequenceId::new("s");
        let mut budget = MemoryBudget::new(1000, 750);
        for frame in 0..11 {
            budget.record(&seq, &key(frame), 100);
        }
        assert!(budget.is_over_cap());

        let victims = budget.select_victims();
        let frames: Vec<u64> = victims.iter().map(|(_, k)| k.source_frame).collect();
        assert_eq!(frames, vec![0, 1, 2, 3]);
        assert_eq!(budget.used_bytes(), 700);
        assert!(!budget.is_over_cap());
    }

    #[test]
    fn test_rerecord_moves_entry_to_back() {
        let seq = SequenceId::new("s");
        let mut budget = MemoryBudget::new(300, 250);
        budget.record(&seq, &key(0), 100);
        budget.record(&seq, &key(1), 100);
        budget.record(&seq, &key(0), 100);
        budget.record(&seq, &key(2), 150);

        let victims = budget.select_victims();
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].1.source_frame, 1);
        assert_eq!(budget.used_bytes(), 250);
    }

    #[test]
    fn test_forget_sequence_frees_only_that_sequence() {
        let a = SequenceId::new("a");
        let b = SequenceId::new("b");
        let mut budget = MemoryBudget::new(10_000, 7_500);
        budget.record(&a, &key(0), 10);
        budget.record(&b, &key(0), 20);
        budget.forget_sequence(&a);
        assert_eq!(budget.used_bytes(), 20);
        assert_eq!(budget.len(), 1);
    }

    #[test]
    fn test_forgotten_entries_are_not_victims() {
        let seq = SequenceId::new("s");
        let mut budget = MemoryBudget::new(150, 100);
        budget.record(&seq, &key(0), 100);
        budget.record(&seq, &key(1), 100);
        budget.forget(&seq, &key(0));
        assert!(budget.select_victims().is_empty());
        assert_eq!(budget.used_bytes(), 100);
    }
}
