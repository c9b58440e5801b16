//! Offset-mapped log store.
//! Indices are 1-based over the conceptual sequence; entries below `offset`
//! have been folded into a snapshot. Physical slot 0 corresponds to `offset`
//! and carries only the term of the last snapshotted entry.

use super::LogEntry;

pub struct LogStore {
    /// Index of the last entry included in the most recent snapshot.
    offset: u64,
    /// Highest materialized index.
    last_index: u64,
    /// `entries[i]` holds index `offset + i`.
    entries: Vec<LogEntry>,
}

impl LogStore {
    pub fn new() -> Self {
        LogStore {
            offset: 0,
            last_index: 0,
            entries: vec![LogEntry::default()],
        }
    }

    /// Rebuild from persisted parts. `entries` includes slot 0.
    pub fn restore(offset: u64, last_index: u64, entries: Vec<LogEntry>) -> Self {
        assert!(
            last_index >= offset && entries.len() as u64 == last_index - offset + 1,
            "log restore mismatch: offset {} last {} entries {}",
            offset,
            last_index,
            entries.len()
        );
        LogStore {
            offset,
            last_index,
            entries,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    pub fn term_at(&self, index: u64) -> u64 {
        assert!(
            index >= self.offset && index <= self.last_index,
            "term_at out of range: index {} not in [{}, {}]",
            index,
            self.offset,
            self.last_index
        );
        self.entries[(index - self.offset) as usize].term
    }

    pub fn last_term(&self) -> u64 {
        self.term_at(self.last_index)
    }

    pub fn command_at(&self, index: u64) -> &[u8] {
        assert!(index > self.offset && index <= self.last_index);
        &self.entries[(index - self.offset) as usize].command
    }

    pub fn append_one(&mut self, entry: LogEntry) {
        self.last_index += 1;
        self.entries.push(entry);
    }

    pub fn append_many(&mut self, entries: Vec<LogEntry>) {
        self.last_index += entries.len() as u64;
        self.entries.extend(entries);
    }

    /// Discard entries at indices >= `from`.
    pub fn truncate_tail(&mut self, from: u64) {
        assert!(
            from > self.offset && from <= self.last_index,
            "truncate_tail out of range: from {} not in ({}, {}]",
            from,
            self.offset,
            self.last_index
        );
        self.entries.truncate((from - self.offset) as usize);
        self.last_index = from - 1;
    }

    /// Discard entries below `new_offset`, keeping slot 0 with `new_term`.
    /// A suffix whose indices exceed `new_offset` survives the trim.
    pub fn trim_head(&mut self, new_offset: u64, new_term: u64) {
        assert!(new_offset > self.offset);
        if new_offset >= self.last_index {
            self.entries = vec![LogEntry::default()];
            self.last_index = new_offset;
        } else {
            self.entries.drain(..(new_offset - self.offset) as usize);
        }
        self.entries[0].term = new_term;
        self.entries[0].command = Vec::new();
        self.offset = new_offset;
    }

    /// First index carrying the same term as `from`, walking backward but
    /// never past `offset`.
    pub fn first_index_of_term(&self, from: u64) -> u64 {
        let term = self.term_at(from);
        let mut i = from;
        while i > self.offset + 1 && self.term_at(i - 1) == term {
            i -= 1;
        }
        i
    }

    /// Highest index carrying `term`, if any entry does.
    pub fn last_index_of_term(&self, term: u64) -> Option<u64> {
        (self.offset..=self.last_index)
            .rev()
            .find(|&i| self.term_at(i) == term)
    }

    /// Entries from `from` through the tail, cloned for an outbound RPC.
    pub fn tail_from(&self, from: u64) -> Vec<LogEntry> {
        assert!(from > self.offset);
        if from > self.last_index {
            return Vec::new();
        }
        self.entries[(from - self.offset) as usize..].to_vec()
    }

    /// All slots including slot 0, for the persistence codec.
    pub fn as_slice(&self) -> &[LogEntry] {
        &self.entries
    }
}
