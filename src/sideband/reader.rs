use log::warn;

use super::records::*;
use super::time::TscConverter;
use crate::error::DecodeError;
use crate::raw::RawCursor;

/// Everything needed to parse one CPU's sideband slice: the TSC conversion
/// constants and the perf attr's sample_type mask from the capture header.
#[derive(Debug, Clone, Copy)]
pub struct SidebandConfig {
    pub converter: TscConverter,
    pub sample_type: u64,
}

/// A parsed perf record plus its trailing sample fields.
#[derive(Debug, Clone)]
pub struct PerfEvent<'a> {
    pub kind: u32,
    pub misc: u16,
    pub record: PerfRecord<'a>,
    pub sample: SampleId,
}

impl<'a> PerfEvent<'a> {
    /// The record's TSC, when the sample format carries a timestamp.
    pub fn tsc(&self) -> Option<u64> {
        self.sample.tsc
    }

    pub fn is_switch_out(&self) -> bool {
        self.misc & PERF_RECORD_MISC_SWITCH_OUT != 0
    }
}

/// Lazy reader over one CPU's sideband bytes.
///
/// Per-record failures are yielded as `Err` items; the reader then
/// resynchronizes at the next record boundary where the failed record's
/// header says it ends. Only a header that no longer fits, or missing
/// conversion constants, stop the iteration.
pub struct SidebandReader<'a> {
    data: &'a [u8],
    pos: usize,
    config: SidebandConfig,
    done: bool,
}

impl<'a> SidebandReader<'a> {
    pub fn new(data: &'a [u8], config: SidebandConfig) -> Self {
        SidebandReader {
            data,
            pos: 0,
            config,
            done: false,
        }
    }

    fn parse_record(&self, record_offset: usize) -> Result<(PerfEvent<'a>, usize), DecodeError> {
        let mut cur = RawCursor::new(&self.data[record_offset..]);
        if cur.remaining() < PERF_HEADER_SIZE {
            return Err(DecodeError::EndOfStream(record_offset));
        }
        let header = PerfEventHeader::parse(&mut cur)?;
        let size = header.size as usize;
        if header.kind == 0 || size < PERF_HEADER_SIZE || cur.remaining() < size - PERF_HEADER_SIZE
        {
            return Err(DecodeError::EndOfStream(record_offset));
        }
        let body = &self.data[record_offset + PERF_HEADER_SIZE..record_offset + size];
        let mut cur = RawCursor::new(body);

        let record = match header.kind {
            PERF_RECORD_MMAP => {
                let pid = cur.read_u32()?;
                let tid = cur.read_u32()?;
                let addr = cur.read_u64()?;
                let len = cur.read_u64()?;
                let pgoff = cur.read_u64()?;
                let filename = read_padded_string(&mut cur, record_offset)?;
                PerfRecord::Mmap {
                    pid,
                    tid,
                    addr,
                    len,
                    pgoff,
                    filename,
                }
            }
            PERF_RECORD_MMAP2 => {
                let pid = cur.read_u32()?;
                let tid = cur.read_u32()?;
                let addr = cur.read_u64()?;
                let len = cur.read_u64()?;
                let pgoff = cur.read_u64()?;
                cur.skip(4 + 4 + 8 + 8 + 4 + 4)?; // maj, min, ino, ino_generation, prot, flags
                let filename = read_padded_string(&mut cur, record_offset)?;
                PerfRecord::Mmap2 {
                    pid,
                    tid,
                    addr,
                    len,
                    pgoff,
                    filename,
                }
            }
            PERF_RECORD_COMM => {
                let pid = cur.read_u32()?;
                let tid = cur.read_u32()?;
                let name = read_padded_string(&mut cur, record_offset)?;
                PerfRecord::Comm { pid, tid, name }
            }
            PERF_RECORD_LOST => {
                let id = cur.read_u64()?;
                let count = cur.read_u64()?;
                PerfRecord::Lost { id, count }
            }
            PERF_RECORD_LOST_SAMPLES => {
                let count = cur.read_u64()?;
                PerfRecord::LostSamples { count }
            }
            PERF_RECORD_EXIT | PERF_RECORD_FORK => {
                let task = TaskRecord {
                    pid: cur.read_u32()?,
                    ppid: cur.read_u32()?,
                    tid: cur.read_u32()?,
                    ptid: cur.read_u32()?,
                    time: cur.read_u64()?,
                };
                if header.kind == PERF_RECORD_EXIT {
                    PerfRecord::Exit(task)
                } else {
                    PerfRecord::Fork(task)
                }
            }
            PERF_RECORD_THROTTLE | PERF_RECORD_UNTHROTTLE => {
                let time = cur.read_u64()?;
                let id = cur.read_u64()?;
                let stream_id = cur.read_u64()?;
                if header.kind == PERF_RECORD_THROTTLE {
                    PerfRecord::Throttle {
                        time,
                        id,
                        stream_id,
                    }
                } else {
                    PerfRecord::Unthrottle {
                        time,
                        id,
                        stream_id,
                    }
                }
            }
            PERF_RECORD_AUX => {
                let offset = cur.read_u64()?;
                let size = cur.read_u64()?;
                let flags = cur.read_u64()?;
                PerfRecord::Aux {
                    offset,
                    size,
                    flags,
                }
            }
            PERF_RECORD_ITRACE_START => {
                let pid = cur.read_u32()?;
                let tid = cur.read_u32()?;
                PerfRecord::ItraceStart { pid, tid }
            }
            PERF_RECORD_SWITCH => PerfRecord::Switch,
            PERF_RECORD_SWITCH_CPU_WIDE => {
                let next_prev_pid = cur.read_u32()?;
                let next_prev_tid = cur.read_u32()?;
                PerfRecord::SwitchCpuWide {
                    next_prev_pid,
                    next_prev_tid,
                }
            }
            _ => {
                // We don't interpret this type; take the header's word for
                // the size and don't attempt to parse sample fields.
                return Ok((
                    PerfEvent {
                        kind: header.kind,
                        misc: header.misc,
                        record: PerfRecord::Other,
                        sample: SampleId::default(),
                    },
                    size,
                ));
            }
        };

        let sample = self.parse_sample(&mut cur)?;
        if PERF_HEADER_SIZE + cur.pos() != size {
            return Err(DecodeError::NoSync(record_offset));
        }
        Ok((
            PerfEvent {
                kind: header.kind,
                misc: header.misc,
                record,
                sample,
            },
            size,
        ))
    }

    fn parse_sample(&self, cur: &mut RawCursor) -> Result<SampleId, DecodeError> {
        let sample_type = self.config.sample_type;
        let mut sample = SampleId::default();
        if sample_type & PERF_SAMPLE_TID != 0 {
            sample.pid = Some(cur.read_u32()?);
            sample.tid = Some(cur.read_u32()?);
        }
        if sample_type & PERF_SAMPLE_TIME != 0 {
            let time = cur.read_u64()?;
            sample.tsc = Some(self.config.converter.time_to_tsc(time)?);
        }
        if sample_type & PERF_SAMPLE_ID != 0 {
            sample.id = Some(cur.read_u64()?);
        }
        if sample_type & PERF_SAMPLE_STREAM_ID != 0 {
            sample.stream_id = Some(cur.read_u64()?);
        }
        if sample_type & PERF_SAMPLE_CPU != 0 {
            sample.cpu = Some(cur.read_u32()?);
            cur.skip(4)?;
        }
        if sample_type & PERF_SAMPLE_IDENTIFIER != 0 {
            sample.identifier = Some(cur.read_u64()?);
        }
        Ok(sample)
    }
}

impl<'a> Iterator for SidebandReader<'a> {
    type Item = Result<PerfEvent<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.data.len() {
            return None;
        }
        match self.parse_record(self.pos) {
            Ok((event, size)) => {
                self.pos += size;
                Some(Ok(event))
            }
            Err(err @ (DecodeError::NoSync(_) | DecodeError::BadPacket(_))) => {
                // The record is internally inconsistent but its header still
                // tells us where the next one starts.
                let offset = self.pos;
                let size = u16::from_le_bytes([self.data[offset + 6], self.data[offset + 7]]);
                self.pos += (size as usize).max(PERF_HEADER_SIZE);
                Some(Err(err))
            }
            Err(err) => {
                warn!("abandoning sideband slice at {:#x}: {err}", self.pos);
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
