use core::ops::Range;

use heapless::Vec;

/// Ranges tracked before neighbours get merged.
pub const MAX_DIRTY_RANGES: usize = 16;

/// Byte ranges written to the fallback and not yet copied to the primary.
///
/// Ranges are kept sorted, disjoint and non-adjacent. When a new range does
/// not fit, the two closest ranges are merged across their gap and
/// [`is_coalesced`](Self::is_coalesced) reports it: the gap bytes are then
/// copied as well.
#[derive(Clone, Debug, Default)]
pub struct DirtyRanges {
    ranges: Vec<Range<u32>, MAX_DIRTY_RANGES>,
    coalesced: bool,
}

fn touches(a: &Range<u32>, b: &Range<u32>) -> bool {
    a.start <= b.end && b.start <= a.end
}

impl DirtyRanges {
    pub const fn new() -> Self {
        Self {
            ranges: Vec::new(),
            coalesced: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn as_slice(&self) -> &[Range<u32>] {
        &self.ranges
    }

    pub fn is_coalesced(&self) -> bool {
        self.coalesced
    }

    pub fn insert(&mut self, range: Range<u32>) {
        if range.is_empty() {
            return;
        }
        let mut merged = range;
        let mut i = 0;
        while i < self.ranges.len() {
            if touches(&self.ranges[i], &merged) {
                let old = self.ranges.remove(i);
                merged = old.start.min(merged.start)..old.end.max(merged.end);
            } else {
                i += 1;
            }
        }
        if self.ranges.is_full() {
            self.coalesce_closest();
            // the widened range may now reach `merged`
            return self.insert(merged);
        }
        let at = self
            .ranges
            .iter()
            .position(|r| r.start > merged.start)
            .unwrap_or(self.ranges.len());
        // not full, cannot fail
        let _ = self.ranges.insert(at, merged);
    }

    /// Forgets `range`, splitting a tracked range around it if needed.
    pub fn remove(&mut self, range: Range<u32>) {
        if range.is_empty() {
            return;
        }
        let mut i = 0;
        while i < self.ranges.len() {
            let current = self.ranges[i].clone();
            if current.end <= range.start || range.end <= current.start {
                i += 1;
                continue;
            }
            let left = current.start..range.start.max(current.start);
            let right = range.end.min(current.end)..current.end;
            match (left.is_empty(), right.is_empty()) {
                (true, true) => {
                    self.ranges.remove(i);
                }
                (false, true) => {
                    self.ranges[i] = left;
                    i += 1;
                }
                (true, false) => {
                    self.ranges[i] = right;
                    i += 1;
                }
                (false, false) => {
                    if self.ranges.is_full() {
                        self.coalesce_closest();
                        i = 0;
                        continue;
                    }
                    self.ranges[i] = left;
                    let _ = self.ranges.insert(i + 1, right);
                    i += 2;
                }
            }
        }
        if self.ranges.is_empty() {
            self.coalesced = false;
        }
    }

    /// First tracked range clipped to `window`.
    pub fn first_within(&self, window: &Range<u32>) -> Option<Range<u32>> {
        self.ranges
            .iter()
            .map(|r| r.start.max(window.start)..r.end.min(window.end))
            .find(|r| !r.is_empty())
    }

    fn coalesce_closest(&mut self) {
        let closest = (1..self.ranges.len())
            .min_by_key(|&i| self.ranges[i].start - self.ranges[i - 1].end);
        if let Some(i) = closest {
            let next = self.ranges.remove(i);
            warn!(
                "resilient: tracking {:x}..{:x} together with the previous range",
                next.start, next.end
            );
            self.ranges[i - 1].end = next.end;
            self.coalesced = true;
        }
    }
}
