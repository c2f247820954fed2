use std::collections::HashSet;

use crate::stats::StatGroup;

/// Tracks which cache lines and which external lines/pages were ever
/// touched. Per-line counts keep a cumulative half in the low 32 bits and a
/// per-period half above; the periodic smoothing clears the period half.
#[derive(Debug)]
pub struct UtilizationTracker {
    line_access_count: Vec<u64>,
    accessed_ext_lines: HashSet<u64>,
    accessed_ext_pages: HashSet<u64>,
    lines_per_page: u64,
    total_ext_lines: u64,
    accessed_lines: u64,
    reaccessed_lines: u64,
}

const PERIOD_SHIFT: u32 = 32;

impl UtilizationTracker {
    pub fn new(total_cache_lines: u64, total_ext_lines: u64, lines_per_page: u64) -> Self {
        Self {
            line_access_count: vec![0; total_cache_lines as usize],
            accessed_ext_lines: HashSet::new(),
            accessed_ext_pages: HashSet::new(),
            lines_per_page: lines_per_page.max(1),
            total_ext_lines,
            accessed_lines: 0,
            reaccessed_lines: 0,
        }
    }

    /// Note an access to a resident cache line (by flat set*ways+way index).
    pub fn touch_cache_line(&mut self, line_idx: u64) {
        let count = &mut self.line_access_count[line_idx as usize];
        if *count == 0 {
            self.accessed_lines += 1;
        } else {
            self.reaccessed_lines += 1;
        }
        *count += 1 + (1 << PERIOD_SHIFT);
    }

    /// Note an access to an external line address.
    pub fn touch_ext_line(&mut self, ext_line: u64) {
        self.accessed_ext_lines.insert(ext_line);
        self.accessed_ext_pages.insert(ext_line / self.lines_per_page);
    }

    /// Periodic smoothing: drop the per-period halves.
    pub fn smooth(&mut self) {
        for count in self.line_access_count.iter_mut() {
            *count &= (1 << PERIOD_SHIFT) - 1;
        }
    }

    pub fn log_summary(&self, name: &str) {
        log::info!(
            "{name}: {} cache lines touched ({} reaccesses), {} ext lines / {} ext pages seen",
            self.accessed_lines,
            self.reaccessed_lines,
            self.accessed_ext_lines.len(),
            self.accessed_ext_pages.len()
        );
    }

    pub fn append_to(&self, group: &mut StatGroup) {
        group.add("totalLines", self.line_access_count.len() as u64);
        group.add("accessedLines", self.accessed_lines);
        group.add("reaccessedLines", self.reaccessed_lines);
        group.add("totalExtLines", self.total_ext_lines);
        group.add("accessedExtLines", self.accessed_ext_lines.len() as u64);
        group.add(
            "totalExtPages",
            self.total_ext_lines / self.lines_per_page,
        );
        group.add("accessedExtPages", self.accessed_ext_pages.len() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::UtilizationTracker;
    use crate::stats::StatGroup;

    #[test]
    fn first_access_and_reaccess_counted_separately() {
        let mut tracker = UtilizationTracker::new(8, 64, 4);
        tracker.touch_cache_line(3);
        tracker.touch_cache_line(3);
        tracker.touch_cache_line(5);
        let mut g = StatGroup::new("util");
        tracker.append_to(&mut g);
        assert_eq!(g.counter("accessedLines"), Some(2));
        assert_eq!(g.counter("reaccessedLines"), Some(1));
    }

    #[test]
    fn smoothing_keeps_cumulative_half() {
        let mut tracker = UtilizationTracker::new(4, 64, 4);
        tracker.touch_cache_line(0);
        tracker.smooth();
        // Still counted as touched; a new access is a reaccess.
        tracker.touch_cache_line(0);
        let mut g = StatGroup::new("util");
        tracker.append_to(&mut g);
        assert_eq!(g.counter("accessedLines"), Some(1));
        assert_eq!(g.counter("reaccessedLines"), Some(1));
    }

    #[test]
    fn ext_pages_derive_from_lines() {
        let mut tracker = UtilizationTracker::new(4, 64, 4);
        for line in 0..8 {
            tracker.touch_ext_line(line);
        }
        let mut g = StatGroup::new("util");
        tracker.append_to(&mut g);
        assert_eq!(g.counter("accessedExtLines"), Some(8));
        assert_eq!(g.counter("accessedExtPages"), Some(2));
    }
}
