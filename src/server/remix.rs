use std::collections::VecDeque;
use std::ops::RangeInclusive;

/// The most recent mixes, numbered consecutively, kept for retransmission.
pub struct RemixBuffer {
    // entries[i] is mix number newest_nr + 1 - entries.len() + i
    entries: VecDeque<Box<[u8]>>,
    newest_nr: u32,
    capacity: usize,
}

impl RemixBuffer {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0);

        Self {
            entries: VecDeque::new(),
            newest_nr: 0,
            capacity,
        }
    }

    /// Stores `payload` under the next mix number and returns that number. The first mix is
    /// numbered 1.
    pub fn push(&mut self, payload: Box<[u8]>) -> u32 {
        self.newest_nr = self.newest_nr.wrapping_add(1);
        self.entries.push_back(payload);

        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }

        return self.newest_nr;
    }

    /// Number of the most recent mix, or 0 before the first.
    pub fn newest_nr(&self) -> u32 {
        self.newest_nr
    }

    /// Number of the oldest retained mix.
    pub fn oldest_nr(&self) -> u32 {
        self.newest_nr
            .wrapping_add(1)
            .wrapping_sub(self.entries.len() as u32)
    }

    pub fn get(&self, nr: u32) -> Option<&[u8]> {
        let offset = nr.wrapping_sub(self.oldest_nr()) as usize;
        self.entries.get(offset).map(|entry| &**entry)
    }

    /// The retained mix numbers from `nr` onwards. Requests for mixes which are no longer
    /// retained start at the oldest one instead.
    pub fn retransmit_range(&self, nr: u32) -> RangeInclusive<u32> {
        if self.entries.is_empty() {
            return 1..=0;
        }

        nr.max(self.oldest_nr())..=self.newest_nr
    }
}
