use std::{
    collections::{hash_map::Entry, HashMap},
    fmt,
    fmt::{Display, Formatter},
};

use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};

use crate::record::{Event, Record, TimedRecord, Timestamp};

/// Number of calls to one allocator function and the bytes they asked for.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpStats {
    pub calls: usize,
    pub bytes: usize,
}

impl OpStats {
    fn add(&mut self, bytes: usize) {
        self.calls += 1;
        self.bytes = self.bytes.saturating_add(bytes);
    }

    fn merge(&mut self, other: &OpStats) {
        self.calls += other.calls;
        self.bytes = self.bytes.saturating_add(other.bytes);
    }

    fn format_totals<W: fmt::Write>(&self, f: &mut W) -> Result<(), fmt::Error> {
        write!(
            f,
            "{} calls, {}B",
            self.calls.to_formatted_string(&Locale::en),
            self.bytes.to_formatted_string(&Locale::en)
        )
    }
}

/// Summary of one or more malloc traces.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct TraceSummary {
    pub malloc: OpStats,
    pub calloc: OpStats,
    pub realloc: OpStats,
    /// `bytes` counts the size of blocks whose allocation appears in the trace.
    pub free: OpStats,
    /// Allocations of a non-zero size that returned null.
    pub failed: usize,
    /// Blocks released without a matching allocation in the trace.
    pub unknown_frees: usize,
    pub live_allocations: usize,
    pub live_bytes: usize,
    pub peak_live_bytes: usize,
    pub first: Option<Timestamp>,
    pub last: Option<Timestamp>,
    // Live blocks of the current trace: address -> size.
    #[serde(skip)]
    live: HashMap<usize, usize>,
}

impl TraceSummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one traced call.
    pub fn record(&mut self, rec: &TimedRecord) {
        self.first = Some(self.first.map_or(rec.timestamp, |t| t.min(rec.timestamp)));
        self.last = Some(self.last.map_or(rec.timestamp, |t| t.max(rec.timestamp)));

        let requested = rec.record.requested();
        match rec.record {
            Record::Free { .. } => {}
            Record::Malloc { .. } => self.malloc.add(requested),
            Record::Calloc { .. } => self.calloc.add(requested),
            Record::Realloc { .. } => self.realloc.add(requested),
        }
        if rec.record.is_failure() {
            self.failed += 1;
        }

        let mut freed = 0;
        for event in rec.events() {
            match event {
                Event::Alloc { addr, size } => {
                    // A repeated address without a release in between means
                    // the trace lost a line; the old block is gone either way.
                    if let Some(old) = self.live.insert(addr, size) {
                        self.live_bytes = self.live_bytes.saturating_sub(old);
                    }
                    self.live_bytes = self.live_bytes.saturating_add(size);
                }
                Event::Release { addr } => match self.live.entry(addr) {
                    Entry::Occupied(oe) => {
                        let size = oe.remove();
                        self.live_bytes = self.live_bytes.saturating_sub(size);
                        freed = size.saturating_add(freed);
                    }
                    Entry::Vacant(_) => self.unknown_frees += 1,
                },
            }
        }
        if let Record::Free { .. } = rec.record {
            self.free.add(freed);
        }

        self.live_allocations = self.live.len();
        self.peak_live_bytes = self.peak_live_bytes.max(self.live_bytes);
    }

    /// Merge the summary of another trace into this one.
    ///
    /// Traces come from different processes, so live blocks are not matched
    /// across them and the peak is the larger of the two.
    pub fn merge(&mut self, other: &TraceSummary) {
        self.malloc.merge(&other.malloc);
        self.calloc.merge(&other.calloc);
        self.realloc.merge(&other.realloc);
        self.free.merge(&other.free);
        self.failed += other.failed;
        self.unknown_frees += other.unknown_frees;
        self.live_allocations += other.live_allocations;
        self.live_bytes = self.live_bytes.saturating_add(other.live_bytes);
        self.peak_live_bytes = self.peak_live_bytes.max(other.peak_live_bytes);
        self.first = match (self.first, other.first) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.last = self.last.max(other.last);
    }

    pub fn calls(&self) -> usize {
        self.malloc.calls + self.calloc.calls + self.realloc.calls + self.free.calls
    }
}

impl Display for TraceSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        for (name, stats) in [
            ("malloc", &self.malloc),
            ("calloc", &self.calloc),
            ("realloc", &self.realloc),
            ("free", &self.free),
        ] {
            write!(f, "{:>8}: ", name)?;
            stats.format_totals(f)?;
            f.write_str("\n")?;
        }
        writeln!(
            f,
            "{} calls in total, {} failed allocations, {} frees of unknown blocks",
            self.calls().to_formatted_string(&Locale::en),
            self.failed.to_formatted_string(&Locale::en),
            self.unknown_frees.to_formatted_string(&Locale::en)
        )?;
        writeln!(
            f,
            "live at exit: {} blocks, {}B (peak {}B)",
            self.live_allocations.to_formatted_string(&Locale::en),
            self.live_bytes.to_formatted_string(&Locale::en),
            self.peak_live_bytes.to_formatted_string(&Locale::en)
        )?;
        if let (Some(first), Some(last)) = (self.first, self.last) {
            write!(f, "traced from {} to {}", first, last)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{OpStats, TraceSummary};
    use crate::record::read_log;

    const LOG: &str = "\
1700000000.000001 malloc(10) = 1000
1700000000.000002 calloc(2, 8) = 2000
1700000000.000003 realloc(1000, 40) = 3000
1700000000.000004 malloc(ffffffff) = 0
1700000000.000005 free(2000)
1700000000.000006 free(4000)
1700000000.000007 free(0)
";

    fn summarize(log: &str) -> TraceSummary {
        let mut summary = TraceSummary::new();
        for rec in read_log(log.as_bytes()) {
            summary.record(&rec.unwrap());
        }
        summary
    }

    #[test]
    fn summarize_trace() {
        let s = summarize(LOG);
        assert_eq!(s.malloc, OpStats { calls: 2, bytes: 0x10 + 0xffffffff });
        assert_eq!(s.calloc, OpStats { calls: 1, bytes: 16 });
        assert_eq!(s.realloc, OpStats { calls: 1, bytes: 0x40 });
        assert_eq!(s.free, OpStats { calls: 3, bytes: 16 });
        assert_eq!(s.failed, 1);
        assert_eq!(s.unknown_frees, 1);
        assert_eq!(s.live_allocations, 1);
        assert_eq!(s.live_bytes, 0x40);
        assert_eq!(s.peak_live_bytes, 16 + 0x40);
        assert_eq!(s.calls(), 7);
        assert_eq!(s.first.unwrap().usec, 1);
        assert_eq!(s.last.unwrap().usec, 7);

        let text = s.to_string();
        assert!(text.contains("  malloc: 2 calls, 4,294,967,311B"));
        assert!(text.contains("live at exit: 1 blocks, 64B (peak 80B)"));
    }

    #[test]
    fn merge_traces() {
        let mut a = summarize(LOG);
        let b = summarize("1699999999.000000 malloc(100) = 1000\n");
        a.merge(&b);
        assert_eq!(a.malloc.calls, 3);
        assert_eq!(a.live_allocations, 2);
        assert_eq!(a.live_bytes, 0x40 + 0x100);
        assert_eq!(a.peak_live_bytes, 0x100);
        assert_eq!(a.first.unwrap().sec, 1699999999);
        assert_eq!(a.last.unwrap().usec, 7);
    }

    #[test]
    fn huge_sizes_saturate() {
        let mut s = summarize(
            "\
1.000001 malloc(ffffffffffffffff) = 10
1.000002 malloc(2) = 20
",
        );
        assert_eq!(s.live_allocations, 2);
        assert_eq!(s.live_bytes, usize::MAX);
        assert_eq!(s.peak_live_bytes, usize::MAX);

        let copy = summarize("1.000003 malloc(ffffffffffffffff) = 30\n");
        s.merge(&copy);
        assert_eq!(s.live_bytes, usize::MAX);

        let mut freed = summarize(
            "\
1.000001 malloc(ffffffffffffffff) = 10
1.000002 malloc(2) = 20
1.000003 free(20)
1.000004 free(10)
",
        );
        assert_eq!(freed.live_bytes, 0);
        assert_eq!(freed.free.bytes, usize::MAX);
        freed.merge(&TraceSummary::new());
        assert_eq!(freed.peak_live_bytes, usize::MAX);
    }

    #[test]
    fn yaml_round_trip() {
        let s = summarize(LOG);
        let yaml = serde_yaml::to_string(&s).unwrap();
        let back: TraceSummary = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.realloc, s.realloc);
        assert_eq!(back.peak_live_bytes, s.peak_live_bytes);
        assert_eq!(back.first, s.first);
    }
}
