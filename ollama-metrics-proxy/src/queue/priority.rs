//! Priority tiers and heap ordering.

use std::cmp::Ordering;
use std::fmt;

use tokio::time::Instant;

/// Admission tier of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    #[default]
    Normal = 0,
    High = 1,
}

impl Priority {
    /// Parse the `X-Priority` header value. Anything but `high` is Normal.
    pub fn from_header(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("high") => Priority::High,
            _ => Priority::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heap entry: higher priority first, then earlier submission, then lower
/// sequence number.
#[derive(Debug)]
pub struct Prioritized<T> {
    pub priority: Priority,
    pub submitted_at: Instant,
    pub sequence: u64,
    pub item: T,
}

impl<T> PartialEq for Prioritized<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Prioritized<T> {}

impl<T> PartialOrd for Prioritized<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Prioritized<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: earlier timestamps and sequences must compare greater
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.submitted_at.cmp(&self.submitted_at))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;
    use std::time::Duration;

    fn entry(priority: Priority, offset_ms: u64, sequence: u64) -> Prioritized<&'static str> {
        let base = Instant::now();
        Prioritized {
            priority,
            submitted_at: base + Duration::from_millis(offset_ms),
            sequence,
            item: "",
        }
    }

    #[test]
    fn test_priority_from_header() {
        assert_eq!(Priority::from_header(Some("high")), Priority::High);
        assert_eq!(Priority::from_header(Some(" HIGH ")), Priority::High);
        assert_eq!(Priority::from_header(Some("low")), Priority::Normal);
        assert_eq!(Priority::from_header(None), Priority::Normal);
    }

    #[test]
    fn test_high_before_normal_regardless_of_age() {
        let mut heap = BinaryHeap::new();
        heap.push(entry(Priority::Normal, 0, 0));
        heap.push(entry(Priority::High, 50, 1));

        assert_eq!(heap.pop().unwrap().priority, Priority::High);
        assert_eq!(heap.pop().unwrap().priority, Priority::Normal);
    }

    #[test]
    fn test_fifo_within_tier() {
        let base = Instant::now();
        let mut heap = BinaryHeap::new();
        for (i, offset) in [30u64, 10, 20].iter().enumerate() {
            heap.push(Prioritized {
                priority: Priority::Normal,
                submitted_at: base + Duration::from_millis(*offset),
                sequence: i as u64,
                item: *offset,
            });
        }

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|e| e.item)).collect();
        assert_eq!(order, vec![10, 20, 30]);
    }

    #[test]
    fn test_sequence_breaks_timestamp_ties() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        heap.push(Prioritized { priority: Priority::High, submitted_at: now, sequence: 7, item: 'b' });
        heap.push(Prioritized { priority: Priority::High, submitted_at: now, sequence: 3, item: 'a' });

        assert_eq!(heap.pop().unwrap().item, 'a');
    }
}
