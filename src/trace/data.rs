use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rustc_hash::FxHashMap;

use crate::error::DecodeError;

/// Event tag bytes. Every event in the trace buffer starts with one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventTag {
    Bytecode = 0,
    JitCode = 1,
    JitCodeEntry = 2,
    JitCodeOsrEntry = 3,
    MethodEntry = 4,
    InvokeReturn = 5,
    InvokeinterfaceReturn = 6,
    InvokedynamicReturn = 7,
    ResultHandler = 8,
    Throw = 9,
    Rethrow = 10,
    Deopt = 11,
    DeoptReexecuteReturn = 12,
    ThrowArrayIndexOutOfBounds = 13,
    ThrowArrayStore = 14,
    ThrowArithmetic = 15,
    ThrowClassCast = 16,
    ThrowNullPointer = 17,
    ThrowStackOverflow = 18,
    RemoveActivation = 19,
    RemoveActivationPreservingArgs = 20,
}

impl EventTag {
    pub fn from_u8(byte: u8) -> Option<EventTag> {
        use EventTag::*;
        Some(match byte {
            0 => Bytecode,
            1 => JitCode,
            2 => JitCodeEntry,
            3 => JitCodeOsrEntry,
            4 => MethodEntry,
            5 => InvokeReturn,
            6 => InvokeinterfaceReturn,
            7 => InvokedynamicReturn,
            8 => ResultHandler,
            9 => Throw,
            10 => Rethrow,
            11 => Deopt,
            12 => DeoptReexecuteReturn,
            13 => ThrowArrayIndexOutOfBounds,
            14 => ThrowArrayStore,
            15 => ThrowArithmetic,
            16 => ThrowClassCast,
            17 => ThrowNullPointer,
            18 => ThrowStackOverflow,
            19 => RemoveActivation,
            20 => RemoveActivationPreservingArgs,
            _ => return None,
        })
    }

    pub fn is_jit(self) -> bool {
        matches!(
            self,
            EventTag::JitCode | EventTag::JitCodeEntry | EventTag::JitCodeOsrEntry
        )
    }
}

/// Sentinel pc reference for a JIT event at an address with no pc
/// descriptor (typically the entry point itself).
pub const NO_PC_INFO: u32 = u32::MAX;

/// A contiguous single-thread region of the trace, bounded by context
/// switches or data loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSplit {
    pub tid: i64,
    pub start_offset: usize,
    pub end_offset: usize,
    pub start_tsc: u64,
    pub end_tsc: u64,
    pub head_loss: bool,
    pub tail_loss: bool,
}

const CHUNK: usize = 1024 * 1024;

/// The decoded trace: an append-only event buffer plus the per-thread
/// split index.
#[derive(Debug, Default)]
pub struct TraceData {
    data: Vec<u8>,
    thread_splits: FxHashMap<i64, Vec<ThreadSplit>>,
}

impl TraceData {
    pub fn new() -> Self {
        TraceData::default()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn ensure(&mut self, additional: usize) {
        let needed = self.data.len() + additional;
        if needed > self.data.capacity() {
            let target = needed.div_ceil(CHUNK) * CHUNK;
            self.data.reserve_exact(target - self.data.len());
        }
    }

    pub(super) fn push(&mut self, byte: u8) {
        self.ensure(1);
        self.data.push(byte);
    }

    pub(super) fn push_u32(&mut self, value: u32) {
        self.ensure(4);
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub(super) fn byte(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    pub(super) fn byte_mut(&mut self, offset: usize) -> &mut u8 {
        &mut self.data[offset]
    }

    pub(super) fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Inserts a split into its thread's list, position-sorted by start
    /// TSC; equal keys keep insertion order. Returns the index.
    pub(super) fn insert_split(&mut self, split: ThreadSplit) -> usize {
        let splits = self.thread_splits.entry(split.tid).or_default();
        let index = splits.partition_point(|s| s.start_tsc <= split.start_tsc);
        splits.insert(index, split);
        index
    }

    pub(super) fn split_mut(&mut self, tid: i64, index: usize) -> &mut ThreadSplit {
        &mut self.thread_splits.get_mut(&tid).unwrap()[index]
    }

    pub fn splits(&self, tid: i64) -> &[ThreadSplit] {
        self.thread_splits
            .get(&tid)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn threads(&self) -> impl Iterator<Item = i64> + '_ {
        self.thread_splits.keys().copied()
    }

    pub fn split_count(&self) -> usize {
        self.thread_splits.values().map(Vec::len).sum()
    }

    /// Appends another trace produced by a worker, rebasing its offsets
    /// and merging its splits per tid in start-TSC order. Callers absorb
    /// in (cpu, window) order, which is what breaks TSC ties.
    pub fn absorb(&mut self, other: TraceData) {
        let base = self.data.len();
        self.ensure(other.data.len());
        self.data.extend_from_slice(&other.data);
        for (_, splits) in other.thread_splits {
            for mut split in splits {
                split.start_offset += base;
                split.end_offset += base;
                self.insert_split(split);
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), DecodeError> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(b"JPTL")?;
        out.write_u32::<LittleEndian>(1)?;
        out.write_u64::<LittleEndian>(self.data.len() as u64)?;
        out.write_all(&self.data)?;
        let mut tids: Vec<i64> = self.thread_splits.keys().copied().collect();
        tids.sort_unstable();
        out.write_u32::<LittleEndian>(tids.len() as u32)?;
        for tid in tids {
            let splits = &self.thread_splits[&tid];
            out.write_i64::<LittleEndian>(tid)?;
            out.write_u32::<LittleEndian>(splits.len() as u32)?;
            for split in splits {
                out.write_u64::<LittleEndian>(split.start_offset as u64)?;
                out.write_u64::<LittleEndian>(split.end_offset as u64)?;
                out.write_u64::<LittleEndian>(split.start_tsc)?;
                out.write_u64::<LittleEndian>(split.end_tsc)?;
                let flags = split.head_loss as u8 | (split.tail_loss as u8) << 1;
                out.write_u8(flags)?;
            }
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<TraceData, DecodeError> {
        let mut file = File::open(path)?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != b"JPTL" {
            return Err(DecodeError::Format(0, "bad trace file magic"));
        }
        let version = file.read_u32::<LittleEndian>()?;
        if version != 1 {
            return Err(DecodeError::Format(4, "unsupported trace file version"));
        }
        let data_len = file.read_u64::<LittleEndian>()? as usize;
        let mut data = vec![0u8; data_len];
        file.read_exact(&mut data)?;
        let mut thread_splits = FxHashMap::default();
        let thread_count = file.read_u32::<LittleEndian>()?;
        for _ in 0..thread_count {
            let tid = file.read_i64::<LittleEndian>()?;
            let split_count = file.read_u32::<LittleEndian>()?;
            let mut splits = Vec::with_capacity(split_count as usize);
            for _ in 0..split_count {
                let start_offset = file.read_u64::<LittleEndian>()? as usize;
                let end_offset = file.read_u64::<LittleEndian>()? as usize;
                let start_tsc = file.read_u64::<LittleEndian>()?;
                let end_tsc = file.read_u64::<LittleEndian>()?;
                let flags = file.read_u8()?;
                splits.push(ThreadSplit {
                    tid,
                    start_offset,
                    end_offset,
                    start_tsc,
                    end_tsc,
                    head_loss: flags & 1 != 0,
                    tail_loss: flags & 2 != 0,
                });
            }
            thread_splits.insert(tid, splits);
        }
        Ok(TraceData {
            data,
            thread_splits,
        })
    }
}
