use std::sync::atomic::{AtomicU32, Ordering};

use rustc_hash::FxHashMap;

use super::scopes::{self, InlineFrame, PcDesc, PC_DESC_SIZE};
use crate::error::DecodeError;

static SECTION_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Source-level info for one pc inside a compiled method: the inline
/// frame stack at that address, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcInfo {
    pub pc: u64,
    pub frames: Vec<InlineFrame>,
}

/// A JIT-compiled code region with the metadata needed to map native pcs
/// back to (method, bci) inline stacks.
#[derive(Debug)]
pub struct JitSection {
    id: u32,
    code: Vec<u8>,
    code_begin: u64,
    code_size: u64,
    entry_point: u64,
    verified_entry_point: u64,
    osr_entry_point: u64,
    /// Method-table id of the root compiled method, when the load record
    /// carried one.
    main_method: Option<u32>,
    /// method_index (as referenced by scopes_data) -> method-table id.
    inline_methods: FxHashMap<i32, u32>,
    pc_info: Vec<PcInfo>,
}

impl JitSection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        code: Vec<u8>,
        code_begin: u64,
        entry_point: u64,
        verified_entry_point: u64,
        osr_entry_point: u64,
        main_method: Option<u32>,
        inline_methods: FxHashMap<i32, u32>,
        scopes_pc: &[u8],
        scopes_data: &[u8],
    ) -> Result<JitSection, DecodeError> {
        let code_size = code.len() as u64;
        let pc_info = build_pc_info(scopes_pc, scopes_data, code_begin)?;
        Ok(JitSection {
            id: SECTION_COUNTER.fetch_add(1, Ordering::Relaxed),
            code,
            code_begin,
            code_size,
            entry_point,
            verified_entry_point,
            osr_entry_point,
            main_method,
            inline_methods,
            pc_info,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn code_begin(&self) -> u64 {
        self.code_begin
    }

    pub fn code_size(&self) -> u64 {
        self.code_size
    }

    pub fn code_end(&self) -> u64 {
        self.code_begin + self.code_size
    }

    pub fn entry_point(&self) -> u64 {
        self.entry_point
    }

    pub fn verified_entry_point(&self) -> u64 {
        self.verified_entry_point
    }

    pub fn osr_entry_point(&self) -> u64 {
        self.osr_entry_point
    }

    pub fn main_method(&self) -> Option<u32> {
        self.main_method
    }

    pub fn method_id(&self, method_index: i32) -> Option<u32> {
        self.inline_methods.get(&method_index).copied()
    }

    pub fn contains(&self, ip: u64) -> bool {
        ip >= self.code_begin && ip < self.code_end()
    }

    /// Copies code bytes at `vaddr`, truncating at the section end.
    pub fn read(&self, vaddr: u64, buffer: &mut [u8]) -> Option<usize> {
        if !self.contains(vaddr) {
            return None;
        }
        let offset = (vaddr - self.code_begin) as usize;
        let len = buffer.len().min(self.code.len() - offset);
        buffer[..len].copy_from_slice(&self.code[offset..offset + len]);
        Some(len)
    }

    /// Index of the pc descriptor exactly at `vaddr`. PT reports branch
    /// target addresses, which line up with pc descriptors; anything else
    /// has no source-level mapping.
    pub fn find_pc(&self, vaddr: u64) -> Option<u32> {
        if !self.contains(vaddr) {
            return None;
        }
        self.pc_info
            .binary_search_by_key(&vaddr, |info| info.pc)
            .ok()
            .map(|idx| idx as u32)
    }

    pub fn pc_info(&self, index: u32) -> Option<&PcInfo> {
        self.pc_info.get(index as usize)
    }

    pub fn pc_info_len(&self) -> usize {
        self.pc_info.len()
    }
}

/// Walks scopes_pc, skipping serialized-null descriptors, and expands each
/// remaining entry's inline frame stack from scopes_data. The result keeps
/// scopes_pc order, which is sorted by pc offset.
fn build_pc_info(
    scopes_pc: &[u8],
    scopes_data: &[u8],
    code_begin: u64,
) -> Result<Vec<PcInfo>, DecodeError> {
    let mut pc_info = Vec::with_capacity(scopes_pc.len() / PC_DESC_SIZE);
    for chunk in scopes_pc.chunks_exact(PC_DESC_SIZE) {
        let desc = PcDesc::parse(chunk).expect("chunks_exact yields full descriptors");
        if desc.is_null() {
            continue;
        }
        let frames = scopes::decode_frames(scopes_data, desc.scope_decode_offset)?;
        pc_info.push(PcInfo {
            pc: desc.real_pc(code_begin),
            frames,
        });
    }
    Ok(pc_info)
}

#[cfg(test)]
pub mod testutil {
    use rustc_hash::FxHashMap;

    use super::super::scopes::testutil::CompressedWriteStream;
    use super::*;

    /// Encodes a scopes_pc blob from (pc_offset, scope_decode_offset) pairs.
    pub fn scopes_pc(descs: &[(i32, i32)]) -> Vec<u8> {
        let mut buf = Vec::new();
        for &(pc_offset, scope_decode_offset) in descs {
            buf.extend_from_slice(&pc_offset.to_le_bytes());
            buf.extend_from_slice(&scope_decode_offset.to_le_bytes());
            buf.extend_from_slice(&(-1i32).to_le_bytes()); // obj_decode_offset
            buf.extend_from_slice(&0i32.to_le_bytes()); // flags
        }
        buf
    }

    /// A section at `[begin, begin + size)` with one leaf scope per pc
    /// offset, method_index 0, bci = pc index.
    pub fn section(begin: u64, size: u64, pc_offsets: &[i32]) -> JitSection {
        let mut writer = CompressedWriteStream::new();
        let mut descs = Vec::new();
        for (i, &pc_offset) in pc_offsets.iter().enumerate() {
            let scope = writer.write_scope(0, 0, i as i32);
            descs.push((pc_offset, scope as i32));
        }
        let scopes_data = writer.finish();
        let mut inline_methods = FxHashMap::default();
        inline_methods.insert(0, 0);
        JitSection::new(
            vec![0x90; size as usize],
            begin,
            begin,
            begin + 0x20,
            0,
            Some(0),
            inline_methods,
            &scopes_pc(&descs),
            &scopes_data,
        )
        .unwrap()
    }
}
