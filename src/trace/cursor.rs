use byteorder::{ByteOrder, LittleEndian};

use super::data::EventTag;
use crate::error::DecodeError;

/// One decoded trace event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent<'a> {
    /// A run of interpreted bytecodes.
    Bytecodes { opcodes: &'a [u8] },
    /// A run of pcs inside one compiled section.
    Jit {
        tag: EventTag,
        section: u32,
        pc_refs: Vec<u32>,
    },
    Point(EventTag),
}

/// Validating reader over a trace byte range. Each step checks the tag
/// and that every length stays inside the range; a violation poisons the
/// cursor and surfaces as a `Format` error.
pub struct TraceCursor<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> TraceCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        TraceCursor {
            data,
            pos: 0,
            end: data.len(),
        }
    }

    /// A cursor over one thread split's byte range.
    pub fn range(data: &'a [u8], start: usize, end: usize) -> Self {
        let end = end.min(data.len());
        TraceCursor {
            data,
            pos: start.min(end),
            end,
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    fn poison(&mut self, what: &'static str) -> DecodeError {
        let err = DecodeError::Format(self.pos, what);
        self.pos = self.end;
        err
    }
}

impl<'a> Iterator for TraceCursor<'a> {
    /// (event offset, event)
    type Item = Result<(usize, TraceEvent<'a>), DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }
        let loc = self.pos;
        let tag = match EventTag::from_u8(self.data[self.pos]) {
            Some(tag) => tag,
            None => return Some(Err(self.poison("unknown event tag"))),
        };
        match tag {
            EventTag::Bytecode => {
                if self.end - self.pos < 2 {
                    return Some(Err(self.poison("truncated bytecode record")));
                }
                let count = self.data[self.pos + 1] as usize;
                if count == 0 {
                    return Some(Err(self.poison("empty bytecode record")));
                }
                if self.end - self.pos - 2 < count {
                    return Some(Err(self.poison("bytecode record overruns the buffer")));
                }
                let opcodes = &self.data[self.pos + 2..self.pos + 2 + count];
                self.pos += 2 + count;
                Some(Ok((loc, TraceEvent::Bytecodes { opcodes })))
            }
            tag if tag.is_jit() => {
                if self.end - self.pos < 6 {
                    return Some(Err(self.poison("truncated jit record")));
                }
                let count = self.data[self.pos + 1] as usize;
                if count == 0 {
                    return Some(Err(self.poison("empty jit record")));
                }
                let section = LittleEndian::read_u32(&self.data[self.pos + 2..self.pos + 6]);
                if self.end - self.pos - 6 < count * 4 {
                    return Some(Err(self.poison("jit record overruns the buffer")));
                }
                let pc_refs = self.data[self.pos + 6..self.pos + 6 + count * 4]
                    .chunks_exact(4)
                    .map(LittleEndian::read_u32)
                    .collect();
                self.pos += 6 + count * 4;
                Some(Ok((
                    loc,
                    TraceEvent::Jit {
                        tag,
                        section,
                        pc_refs,
                    },
                )))
            }
            tag => {
                self.pos += 1;
                Some(Ok((loc, TraceEvent::Point(tag))))
            }
        }
    }
}
