use crate::error::DecodeError;

/// On-disk size of one PcDesc record in the scopes_pc blob.
pub const PC_DESC_SIZE: usize = 16;

/// A pc descriptor from a compiled method's scopes_pc blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcDesc {
    pub pc_offset: i32,
    pub scope_decode_offset: i32,
    pub obj_decode_offset: i32,
    pub flags: i32,
}

impl PcDesc {
    pub fn parse(bytes: &[u8]) -> Option<PcDesc> {
        if bytes.len() < PC_DESC_SIZE {
            return None;
        }
        let field = |i: usize| i32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        Some(PcDesc {
            pc_offset: field(0),
            scope_decode_offset: field(1),
            obj_decode_offset: field(2),
            flags: field(3),
        })
    }

    /// A zero scope offset is the serialized null descriptor.
    pub fn is_null(&self) -> bool {
        self.scope_decode_offset == 0
    }

    pub fn real_pc(&self, code_begin: u64) -> u64 {
        code_begin.wrapping_add(self.pc_offset as i64 as u64)
    }
}

/// Reader for the compressed scopes_data stream. Integers use the
/// UNSIGNED5 excess-192 encoding (up to five bytes, six payload bits per
/// excess byte).
pub struct CompressedReadStream<'a> {
    data: &'a [u8],
    pos: usize,
}

const L: u32 = 192;
const LG_H: u32 = 6;
const MAX_I: usize = 4;

impl<'a> CompressedReadStream<'a> {
    pub fn new(data: &'a [u8], pos: usize) -> Self {
        CompressedReadStream { data, pos }
    }

    fn read_byte(&mut self) -> Result<u32, DecodeError> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(DecodeError::Format(self.pos, "scopes_data truncated"))?;
        self.pos += 1;
        Ok(byte as u32)
    }

    pub fn read_int(&mut self) -> Result<u32, DecodeError> {
        let b0 = self.read_byte()?;
        if b0 < L {
            return Ok(b0);
        }
        let mut sum = b0;
        let mut lg_h_i = LG_H;
        for i in 1.. {
            let b_i = self.read_byte()?;
            sum = sum.wrapping_add(b_i << lg_h_i);
            if b_i < L || i == MAX_I {
                break;
            }
            lg_h_i += LG_H;
        }
        Ok(sum)
    }

    /// Bytecode indices are stored biased by the invocation-entry BCI (-1).
    pub fn read_bci(&mut self) -> Result<i32, DecodeError> {
        Ok(self.read_int()? as i32 - 1)
    }
}

/// One method activation within a compiled method's inline tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlineFrame {
    /// Index into the enclosing section's inline-method table.
    pub method_index: i32,
    pub bci: i32,
}

/// Decodes the inline frame stack for one pc descriptor: the scope itself
/// first, then each sender until the sentinel, so the outermost frame ends
/// up last.
pub fn decode_frames(
    scopes_data: &[u8],
    decode_offset: i32,
) -> Result<Vec<InlineFrame>, DecodeError> {
    let mut frames = Vec::new();
    let mut offset = decode_offset;
    while offset != 0 {
        if offset < 0 || offset as usize >= scopes_data.len() {
            return Err(DecodeError::Format(
                offset.max(0) as usize,
                "scope decode offset out of range",
            ));
        }
        let mut stream = CompressedReadStream::new(scopes_data, offset as usize);
        let sender = stream.read_int()? as i32;
        let method_index = stream.read_int()? as i32;
        let bci = stream.read_bci()?;
        frames.push(InlineFrame { method_index, bci });
        offset = sender;
    }
    Ok(frames)
}
