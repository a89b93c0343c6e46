use crate::stream::record::TelemetryRecord;
use std::collections::VecDeque;

/// Fixed-capacity FIFO of the most recent records, in insertion order.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    records: VecDeque<TelemetryRecord>,
    capacity: usize,
}

impl RollingWindow {
    /// A zero capacity is bumped to one so `latest()` always reflects the last append.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends `record`, evicting the oldest one once the window is full.
    pub fn append(&mut self, record: TelemetryRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Independent copy of the window, oldest first.
    pub fn snapshot(&self) -> Vec<TelemetryRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<TelemetryRecord> {
        self.records.back().cloned()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
