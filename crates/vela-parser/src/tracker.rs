use vela_core::{EditRangeSet, TextRange};

/// Accumulates edit ranges for one document while a parse for it is in
/// flight or pending.
///
/// Trackers are only touched under the scheduler lock, so no internal
/// synchronization is needed.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    ranges: EditRangeSet,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, range: TextRange) {
        self.ranges.insert(range);
    }

    /// Current union of all recorded ranges.
    pub fn snapshot(&self) -> EditRangeSet {
        self.ranges.clone()
    }

    pub(crate) fn into_ranges(self) -> EditRangeSet {
        self.ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_unions_ranges() {
        let mut tracker = ChangeTracker::new();
        tracker.add(TextRange::new(0, 10));
        tracker.add(TextRange::new(5, 20));
        tracker.add(TextRange::new(40, 50));

        let snapshot = tracker.snapshot();
        assert_eq!(
            snapshot.ranges(),
            &[TextRange::new(0, 20), TextRange::new(40, 50)]
        );
    }
}
