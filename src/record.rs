//! Trace records and their text form.
//!
//! One line per call:
//!
//! ```text
//! 1700000000.000042 malloc(10) = 55d0c4a2b2a0
//! 1700000000.000051 calloc(4, 8) = 55d0c4a2b2c0
//! 1700000000.000060 realloc(55d0c4a2b2a0, 20) = 55d0c4a2b2f0
//! 1700000000.000071 free(55d0c4a2b2f0)
//! ```
//!
//! Sizes and addresses are lowercase hex without a `0x` prefix; a null
//! address is written as `0`.

use std::{
    fmt::{self, Display, Formatter},
    io::BufRead,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::error::TraceError;

/// Wall-clock time with microsecond resolution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub sec: u64,
    pub usec: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp {
            sec: since_epoch.as_secs(),
            usec: since_epoch.subsec_micros(),
        }
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

/// One allocator call together with its result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Record {
    Free { addr: usize },
    Malloc { size: usize, ret: usize },
    Calloc { count: usize, size: usize, ret: usize },
    Realloc { addr: usize, size: usize, ret: usize },
}

impl Record {
    pub fn name(&self) -> &'static str {
        match self {
            Record::Free { .. } => "free",
            Record::Malloc { .. } => "malloc",
            Record::Calloc { .. } => "calloc",
            Record::Realloc { .. } => "realloc",
        }
    }

    /// Number of bytes the caller asked for (0 for `free`).
    pub fn requested(&self) -> usize {
        match *self {
            Record::Free { .. } => 0,
            Record::Malloc { size, .. } | Record::Realloc { size, .. } => size,
            Record::Calloc { count, size, .. } => count.saturating_mul(size),
        }
    }

    /// An allocation of a non-zero size that returned null.
    pub fn is_failure(&self) -> bool {
        match *self {
            Record::Free { .. } => false,
            Record::Malloc { ret, .. } | Record::Calloc { ret, .. } | Record::Realloc { ret, .. } => {
                ret == 0 && self.requested() != 0
            }
        }
    }
}

impl Display for Record {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match *self {
            Record::Free { addr } => write!(f, "free({:x})", addr),
            Record::Malloc { size, ret } => write!(f, "malloc({:x}) = {:x}", size, ret),
            Record::Calloc { count, size, ret } => {
                write!(f, "calloc({:x}, {:x}) = {:x}", count, size, ret)
            }
            Record::Realloc { addr, size, ret } => {
                write!(f, "realloc({:x}, {:x}) = {:x}", addr, size, ret)
            }
        }
    }
}

/// A record as it appears in the trace log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimedRecord {
    pub timestamp: Timestamp,
    pub record: Record,
}

impl Display for TimedRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{} {}", self.timestamp, self.record)
    }
}

fn hex(s: &str) -> Option<usize> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    usize::from_str_radix(s, 16).ok()
}

impl FromStr for TimedRecord {
    type Err = TraceError;

    /// Parse one log line (trailing newline allowed).
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        Self::parse_fields(line).ok_or_else(|| TraceError::Malformed(line.to_string()))
    }
}

impl TimedRecord {
    fn parse_fields(line: &str) -> Option<TimedRecord> {
        let (ts, call) = line.trim_end().split_once(' ')?;
        let (sec, usec) = ts.split_once('.')?;
        if usec.len() != 6 {
            return None;
        }
        let timestamp = Timestamp {
            sec: sec.parse().ok()?,
            usec: usec.parse().ok()?,
        };

        let (name, rest) = call.split_once('(')?;
        let (args, result) = rest.split_once(')')?;
        let args = args.split(", ").map(hex).collect::<Option<Vec<_>>>()?;
        let ret = match result {
            "" => None,
            r => Some(hex(r.strip_prefix(" = ")?)?),
        };

        let record = match (name, args.as_slice(), ret) {
            ("free", &[addr], None) => Record::Free { addr },
            ("malloc", &[size], Some(ret)) => Record::Malloc { size, ret },
            ("calloc", &[count, size], Some(ret)) => Record::Calloc { count, size, ret },
            ("realloc", &[addr, size], Some(ret)) => Record::Realloc { addr, size, ret },
            _ => return None,
        };
        Some(TimedRecord { timestamp, record })
    }

    /// Heap events implied by this call.
    pub fn events(&self) -> impl Iterator<Item = Event> {
        let (release, alloc) = match self.record {
            Record::Free { addr } => (addr, None),
            Record::Malloc { size, ret } => (0, Some((ret, size))),
            Record::Calloc { ret, .. } => (0, Some((ret, self.record.requested()))),
            // realloc(p, 0) may free `p` and return null.
            Record::Realloc { addr, size: 0, ret: 0 } => (addr, None),
            Record::Realloc { ret: 0, .. } => (0, None),
            Record::Realloc { addr, size, ret } => (addr, Some((ret, size))),
        };
        let release = Some(release)
            .filter(|addr| *addr != 0)
            .map(|addr| Event::Release { addr });
        let alloc = alloc
            .filter(|(addr, _)| *addr != 0)
            .map(|(addr, size)| Event::Alloc { addr, size });
        [release, alloc].into_iter().flatten()
    }
}

/// Heap state change derived from a trace record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Alloc { addr: usize, size: usize },
    Release { addr: usize },
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Event::Alloc { addr, size } => write!(f, "+ {:#x} {:#x}", addr, size),
            Event::Release { addr } => write!(f, "- {:#x}", addr),
        }
    }
}

/// Read a trace log.  Each malformed line yields an error and reading continues.
pub fn read_log<R: BufRead>(reader: R) -> impl Iterator<Item = Result<TimedRecord, TraceError>> {
    reader.lines().enumerate().map(|(idx, line)| {
        let line = line?;
        line.parse::<TimedRecord>().map_err(|e| match e {
            TraceError::Malformed(text) => TraceError::Parse {
                line: idx + 1,
                text,
            },
            e => e,
        })
    })
}
