use crate::error::DecodeError;
use crate::raw::RawCursor;

pub const PERF_RECORD_MMAP: u32 = 1;
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_COMM: u32 = 3;
pub const PERF_RECORD_EXIT: u32 = 4;
pub const PERF_RECORD_THROTTLE: u32 = 5;
pub const PERF_RECORD_UNTHROTTLE: u32 = 6;
pub const PERF_RECORD_FORK: u32 = 7;
pub const PERF_RECORD_MMAP2: u32 = 10;
pub const PERF_RECORD_AUX: u32 = 11;
pub const PERF_RECORD_ITRACE_START: u32 = 12;
pub const PERF_RECORD_LOST_SAMPLES: u32 = 13;
pub const PERF_RECORD_SWITCH: u32 = 14;
pub const PERF_RECORD_SWITCH_CPU_WIDE: u32 = 15;

pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_TIME: u64 = 1 << 2;
pub const PERF_SAMPLE_ID: u64 = 1 << 6;
pub const PERF_SAMPLE_CPU: u64 = 1 << 7;
pub const PERF_SAMPLE_STREAM_ID: u64 = 1 << 9;
pub const PERF_SAMPLE_IDENTIFIER: u64 = 1 << 16;

pub const PERF_RECORD_MISC_SWITCH_OUT: u16 = 1 << 13;

/// The size of a `perf_event_header`.
pub const PERF_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfEventHeader {
    pub kind: u32,
    pub misc: u16,
    pub size: u16,
}

impl PerfEventHeader {
    pub fn parse(cur: &mut RawCursor) -> Result<Self, DecodeError> {
        let kind = cur.read_u32()?;
        let misc = cur.read_u16()?;
        let size = cur.read_u16()?;
        Ok(PerfEventHeader { kind, misc, size })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRecord {
    pub pid: u32,
    pub ppid: u32,
    pub tid: u32,
    pub ptid: u32,
    pub time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PerfRecord<'a> {
    Mmap {
        pid: u32,
        tid: u32,
        addr: u64,
        len: u64,
        pgoff: u64,
        filename: &'a [u8],
    },
    Mmap2 {
        pid: u32,
        tid: u32,
        addr: u64,
        len: u64,
        pgoff: u64,
        filename: &'a [u8],
    },
    Comm {
        pid: u32,
        tid: u32,
        name: &'a [u8],
    },
    Lost {
        id: u64,
        count: u64,
    },
    LostSamples {
        count: u64,
    },
    Exit(TaskRecord),
    Fork(TaskRecord),
    Throttle {
        time: u64,
        id: u64,
        stream_id: u64,
    },
    Unthrottle {
        time: u64,
        id: u64,
        stream_id: u64,
    },
    Aux {
        offset: u64,
        size: u64,
        flags: u64,
    },
    ItraceStart {
        pid: u32,
        tid: u32,
    },
    Switch,
    SwitchCpuWide {
        next_prev_pid: u32,
        next_prev_tid: u32,
    },
    /// A record type we do not interpret; skipped whole.
    Other,
}

/// The trailing `sample_id` fields of a non-sample record, gated by the
/// attr's `sample_type` bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleId {
    pub pid: Option<u32>,
    pub tid: Option<u32>,
    /// Sample time, already converted to TSC.
    pub tsc: Option<u64>,
    pub id: Option<u64>,
    pub stream_id: Option<u64>,
    pub cpu: Option<u32>,
    pub identifier: Option<u64>,
}

/// Byte layout of the trailing sample area, derived once per process from
/// the enabled `sample_type` bits walked in their defined order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleLayout {
    pub size: usize,
    pub cpu_offset: Option<usize>,
}

impl SampleLayout {
    pub fn from_sample_type(sample_type: u64) -> Self {
        let mut size = 0;
        let mut cpu_offset = None;
        for &bit in &[
            PERF_SAMPLE_TID,
            PERF_SAMPLE_TIME,
            PERF_SAMPLE_ID,
            PERF_SAMPLE_STREAM_ID,
            PERF_SAMPLE_CPU,
            PERF_SAMPLE_IDENTIFIER,
        ] {
            if sample_type & bit == 0 {
                continue;
            }
            if bit == PERF_SAMPLE_CPU {
                cpu_offset = Some(size);
            }
            size += 8;
        }
        SampleLayout { size, cpu_offset }
    }

    /// Reads the CPU field out of a record's trailing sample area, if the
    /// sample format carries one. `body` is the record without its header.
    pub fn cpu_of(&self, body: &[u8]) -> Option<u32> {
        let offset = self.cpu_offset?;
        if body.len() < self.size {
            return None;
        }
        let sample = &body[body.len() - self.size..];
        let mut cur = RawCursor::new(&sample[offset..]);
        cur.read_u32().ok()
    }
}

/// Advances past a NUL-terminated string padded to an 8-byte boundary,
/// returning the string bytes without the terminator. Fails with
/// `BadPacket` if no NUL occurs before the end of the record.
pub fn read_padded_string<'a>(
    cur: &mut RawCursor<'a>,
    record_offset: usize,
) -> Result<&'a [u8], DecodeError> {
    let rest = cur.rest();
    let nul = memchr::memchr(0, rest).ok_or(DecodeError::BadPacket(record_offset))?;
    let padded = ((nul + 1 + 7) & !7).min(rest.len());
    let name = &rest[..nul];
    cur.skip(padded)?;
    Ok(name)
}
