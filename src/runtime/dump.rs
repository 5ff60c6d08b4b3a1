use log::{debug, warn};
use rustc_hash::FxHashMap;

use super::codelets::CodeletTable;
use super::jit_section::JitSection;
use super::methods::{MethodDescriptor, MethodTable};
use super::registry::{DynamicCode, JitRegistry};
use crate::error::DecodeError;
use crate::raw::RawCursor;

pub const DUMP_METHOD_ENTRY_INITIAL: u32 = 0;
pub const DUMP_METHOD_ENTRY: u32 = 1;
pub const DUMP_METHOD_EXIT: u32 = 2;
pub const DUMP_COMPILED_METHOD_LOAD: u32 = 3;
pub const DUMP_COMPILED_METHOD_UNLOAD: u32 = 4;
pub const DUMP_THREAD_START: u32 = 5;
pub const DUMP_INTERPRETER_INFO: u32 = 6;
pub const DUMP_DYNAMIC_CODE_GENERATED: u32 = 7;
pub const DUMP_INLINE_CACHE_ADD: u32 = 8;
pub const DUMP_INLINE_CACHE_CLEAR: u32 = 9;

/// Size of the DumpInfo header: type, alignment padding, size, time.
pub const DUMP_INFO_SIZE: usize = 24;

/// Number of u64 slots in the interpreter-info codelet address array.
pub const INTERPRETER_SLOTS: usize = 3200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStart {
    pub java_tid: i64,
    pub sys_tid: i64,
}

/// The reconstructed runtime state: everything the per-CPU decoders need
/// to map native IPs back to source-level locations. Frozen after replay;
/// workers only read it.
pub struct JvmRuntime {
    pub codelets: CodeletTable,
    pub methods: MethodTable,
    pub registry: JitRegistry,
    pub thread_starts: Vec<ThreadStart>,
    /// Inline-cache branch targets, src -> dest.
    pub inline_caches: FxHashMap<u64, u64>,
}

impl JvmRuntime {
    pub fn empty() -> Self {
        JvmRuntime {
            codelets: CodeletTable::empty(),
            methods: MethodTable::new(),
            registry: JitRegistry::new(),
            thread_starts: Vec::new(),
            inline_caches: FxHashMap::default(),
        }
    }

    /// Replays a dump log in stream order (the ring buffer writes records
    /// in time order) into a frozen runtime state.
    pub fn replay(dump: &[u8]) -> Result<JvmRuntime, DecodeError> {
        let mut runtime = JvmRuntime::empty();
        let mut pos = 0usize;
        while dump.len() - pos >= DUMP_INFO_SIZE {
            let mut header = RawCursor::new(&dump[pos..]);
            let kind = header.read_u32()?;
            header.skip(4)?;
            let size = header.read_u64()? as usize;
            let _time = header.read_u64()?;
            if size < DUMP_INFO_SIZE || size > dump.len() - pos {
                return Err(DecodeError::Format(pos, "dump record size out of range"));
            }
            let payload = &dump[pos + DUMP_INFO_SIZE..pos + size];
            if let Err(err) = runtime.apply(kind, payload) {
                // The record boundary is still trustworthy; drop just this
                // record.
                warn!("dump record at {pos:#x} (type {kind}) skipped: {err}");
            }
            pos += size;
        }
        if pos != dump.len() {
            warn!("{} trailing dump bytes ignored", dump.len() - pos);
        }
        debug!(
            "dump replayed: {} methods, {} live code regions, {} threads",
            runtime.methods.len(),
            runtime.registry.len(),
            runtime.thread_starts.len()
        );
        Ok(runtime)
    }

    fn apply(&mut self, kind: u32, payload: &[u8]) -> Result<(), DecodeError> {
        let mut cur = RawCursor::new(payload);
        match kind {
            DUMP_INTERPRETER_INFO => {
                let _trace_bytecodes = cur.read_u8()? != 0;
                cur.skip(7)?;
                let mut slots = Vec::with_capacity(INTERPRETER_SLOTS);
                for _ in 0..INTERPRETER_SLOTS {
                    slots.push(cur.read_u64()?);
                }
                self.codelets = CodeletTable::from_slots(&slots)?;
            }
            DUMP_METHOD_ENTRY_INITIAL => {
                let idx = cur.read_i32()?;
                cur.skip(4)?;
                let _tid = cur.read_u64()?;
                let klass_len = cur.read_i32()? as usize;
                let name_len = cur.read_i32()? as usize;
                let signature_len = cur.read_i32()? as usize;
                cur.skip(4)?;
                let klass = cur.read_str(klass_len)?;
                let name = cur.read_str(name_len)?;
                let signature = cur.read_str(signature_len)?;
                self.methods.insert(
                    idx as u32,
                    MethodDescriptor {
                        klass,
                        name,
                        signature,
                        is_jportal: true,
                    },
                );
            }
            // Entry/exit ticks are consumed by other tooling; the decoder
            // reconstructs control flow from PT instead.
            DUMP_METHOD_ENTRY | DUMP_METHOD_EXIT => {}
            DUMP_COMPILED_METHOD_LOAD => {
                let insts_begin = cur.read_u64()?;
                let insts_size = cur.read_u64()? as usize;
                let scopes_pc_size = cur.read_u64()? as usize;
                let scopes_data_size = cur.read_u64()? as usize;
                let entry_point = cur.read_u64()?;
                let verified_entry_point = cur.read_u64()?;
                let osr_entry_point = cur.read_u64()?;
                let inline_method_cnt = cur.read_i32()?;
                cur.skip(4)?;

                let mut inline_methods = FxHashMap::default();
                let mut main_method = None;
                for _ in 0..inline_method_cnt {
                    let klass_len = cur.read_i32()? as usize;
                    let name_len = cur.read_i32()? as usize;
                    let signature_len = cur.read_i32()? as usize;
                    let method_index = cur.read_i32()?;
                    let klass = cur.read_str(klass_len)?;
                    let name = cur.read_str(name_len)?;
                    let signature = cur.read_str(signature_len)?;
                    let id = self.methods.intern(&klass, &name, &signature);
                    inline_methods.insert(method_index, id);
                    main_method.get_or_insert(id);
                }

                let code = cur.read_bytes(insts_size)?.to_vec();
                let scopes_pc = cur.read_bytes(scopes_pc_size)?;
                let scopes_data = cur.read_bytes(scopes_data_size)?;
                let section = JitSection::new(
                    code,
                    insts_begin,
                    entry_point,
                    verified_entry_point,
                    osr_entry_point,
                    main_method,
                    inline_methods,
                    scopes_pc,
                    scopes_data,
                )?;
                self.registry.load(section);
            }
            DUMP_COMPILED_METHOD_UNLOAD => {
                let insts_begin = cur.read_u64()?;
                self.registry.unload(insts_begin);
            }
            DUMP_THREAD_START => {
                let java_tid = cur.read_i64()?;
                let sys_tid = cur.read_i64()?;
                self.thread_starts.push(ThreadStart { java_tid, sys_tid });
            }
            DUMP_DYNAMIC_CODE_GENERATED => {
                let name_len = cur.read_i32()? as usize;
                cur.skip(4)?;
                let code_begin = cur.read_u64()?;
                let code_size = cur.read_u64()?;
                let name = cur.read_str(name_len)?;
                cur.skip(code_size as usize)?;
                self.registry.dyn_load(DynamicCode {
                    begin: code_begin,
                    size: code_size,
                    name,
                });
            }
            DUMP_INLINE_CACHE_ADD => {
                let src = cur.read_u64()?;
                let dest = cur.read_u64()?;
                self.inline_caches.insert(src, dest);
            }
            DUMP_INLINE_CACHE_CLEAR => {
                let src = cur.read_u64()?;
                self.inline_caches.remove(&src);
            }
            other => {
                warn!("unknown dump record type {other}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod testutil {
    //! Builder for synthetic dump logs.

    use byteorder::{LittleEndian, WriteBytesExt};

    use super::super::codelets::CODELET_SLOT_COUNT;
    use super::*;

    pub struct DumpBuilder {
        buf: Vec<u8>,
    }

    impl DumpBuilder {
        pub fn new() -> Self {
            DumpBuilder { buf: Vec::new() }
        }

        fn record(&mut self, kind: u32, time: u64, payload: &[u8]) {
            self.buf.write_u32::<LittleEndian>(kind).unwrap();
            self.buf.write_u32::<LittleEndian>(0).unwrap();
            self.buf
                .write_u64::<LittleEndian>((DUMP_INFO_SIZE + payload.len()) as u64)
                .unwrap();
            self.buf.write_u64::<LittleEndian>(time).unwrap();
            self.buf.extend_from_slice(payload);
        }

        pub fn interpreter_info(&mut self, slots: &[u64]) {
            assert!(slots.len() >= CODELET_SLOT_COUNT);
            let mut payload = vec![0u8; 8];
            payload[0] = 1; // TraceBytecodes
            for i in 0..INTERPRETER_SLOTS {
                let value = slots.get(i).copied().unwrap_or(0);
                payload.extend_from_slice(&value.to_le_bytes());
            }
            self.record(DUMP_INTERPRETER_INFO, 0, &payload);
        }

        pub fn method_entry_initial(
            &mut self,
            idx: i32,
            tid: u64,
            klass: &str,
            name: &str,
            signature: &str,
        ) {
            let mut payload = Vec::new();
            payload.write_i32::<LittleEndian>(idx).unwrap();
            payload.write_u32::<LittleEndian>(0).unwrap();
            payload.write_u64::<LittleEndian>(tid).unwrap();
            payload
                .write_i32::<LittleEndian>(klass.len() as i32)
                .unwrap();
            payload.write_i32::<LittleEndian>(name.len() as i32).unwrap();
            payload
                .write_i32::<LittleEndian>(signature.len() as i32)
                .unwrap();
            payload.write_u32::<LittleEndian>(0).unwrap();
            payload.extend_from_slice(klass.as_bytes());
            payload.extend_from_slice(name.as_bytes());
            payload.extend_from_slice(signature.as_bytes());
            self.record(DUMP_METHOD_ENTRY_INITIAL, 0, &payload);
        }

        #[allow(clippy::too_many_arguments)]
        pub fn compiled_method_load(
            &mut self,
            insts_begin: u64,
            code: &[u8],
            scopes_pc: &[u8],
            scopes_data: &[u8],
            entry_point: u64,
            verified_entry_point: u64,
            osr_entry_point: u64,
            inline_methods: &[(&str, &str, &str, i32)],
        ) {
            let mut payload = Vec::new();
            payload.write_u64::<LittleEndian>(insts_begin).unwrap();
            payload.write_u64::<LittleEndian>(code.len() as u64).unwrap();
            payload
                .write_u64::<LittleEndian>(scopes_pc.len() as u64)
                .unwrap();
            payload
                .write_u64::<LittleEndian>(scopes_data.len() as u64)
                .unwrap();
            payload.write_u64::<LittleEndian>(entry_point).unwrap();
            payload
                .write_u64::<LittleEndian>(verified_entry_point)
                .unwrap();
            payload.write_u64::<LittleEndian>(osr_entry_point).unwrap();
            payload
                .write_i32::<LittleEndian>(inline_methods.len() as i32)
                .unwrap();
            payload.write_u32::<LittleEndian>(0).unwrap();
            for &(klass, name, signature, method_index) in inline_methods {
                payload
                    .write_i32::<LittleEndian>(klass.len() as i32)
                    .unwrap();
                payload.write_i32::<LittleEndian>(name.len() as i32).unwrap();
                payload
                    .write_i32::<LittleEndian>(signature.len() as i32)
                    .unwrap();
                payload.write_i32::<LittleEndian>(method_index).unwrap();
                payload.extend_from_slice(klass.as_bytes());
                payload.extend_from_slice(name.as_bytes());
                payload.extend_from_slice(signature.as_bytes());
            }
            payload.extend_from_slice(code);
            payload.extend_from_slice(scopes_pc);
            payload.extend_from_slice(scopes_data);
            self.record(DUMP_COMPILED_METHOD_LOAD, 0, &payload);
        }

        pub fn compiled_method_unload(&mut self, insts_begin: u64) {
            self.record(
                DUMP_COMPILED_METHOD_UNLOAD,
                0,
                &insts_begin.to_le_bytes(),
            );
        }

        pub fn thread_start(&mut self, java_tid: i64, sys_tid: i64) {
            let mut payload = Vec::new();
            payload.write_i64::<LittleEndian>(java_tid).unwrap();
            payload.write_i64::<LittleEndian>(sys_tid).unwrap();
            self.record(DUMP_THREAD_START, 0, &payload);
        }

        pub fn finish(self) -> Vec<u8> {
            self.buf
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::codelets::{testutil as codelets_testutil, Codelet};
    use super::super::scopes::testutil::CompressedWriteStream;
    use super::testutil::DumpBuilder;
    use super::*;
    use crate::runtime::bytecodes::Bytecode;
    use crate::runtime::jit_section::testutil::scopes_pc;

    #[test]
    fn replays_interpreter_info() {
        let mut dump = DumpBuilder::new();
        let mut slots = codelets_testutil::slots();
        slots.resize(INTERPRETER_SLOTS, 0);
        dump.interpreter_info(&slots);
        let runtime = JvmRuntime::replay(&dump.finish()).unwrap();
        let addr = codelets_testutil::normal_address(0x60, 0); // iadd
        assert_eq!(
            runtime.codelets.classify(addr),
            Codelet::Bytecode(Bytecode(0x60))
        );
    }

    #[test]
    fn load_then_unload_leaves_methods_behind() {
        // method_entry_initial(id=7) + load including inline child id=7 +
        // unload: the registry ends empty, the method table keeps id 7.
        let mut writer = CompressedWriteStream::new();
        let scope = writer.write_scope(0, 0, 0);
        let scopes_data = writer.finish();
        let descs = scopes_pc(&[(0x40, scope as i32)]);

        let mut dump = DumpBuilder::new();
        dump.method_entry_initial(7, 1, "LFoo;", "bar", "()V");
        dump.compiled_method_load(
            0x1000,
            &[0x90; 0x1000],
            &descs,
            &scopes_data,
            0x1000,
            0x1020,
            0,
            &[("LFoo;", "bar", "()V", 0)],
        );
        dump.compiled_method_unload(0x1000);
        let runtime = JvmRuntime::replay(&dump.finish()).unwrap();

        assert!(runtime.registry.is_empty());
        assert!(runtime.methods.contains(7));
    }

    #[test]
    fn inline_children_resolve_to_table_ids() {
        let mut writer = CompressedWriteStream::new();
        let scope = writer.write_scope(0, 1, 3);
        let scopes_data = writer.finish();
        let descs = scopes_pc(&[(0x40, scope as i32)]);

        let mut dump = DumpBuilder::new();
        dump.method_entry_initial(7, 1, "LFoo;", "bar", "()V");
        dump.compiled_method_load(
            0x1000,
            &[0x90; 0x100],
            &descs,
            &scopes_data,
            0x1000,
            0x1020,
            0,
            &[("LFoo;", "bar", "()V", 0), ("LFoo;", "helper", "()I", 1)],
        );
        let runtime = JvmRuntime::replay(&dump.finish()).unwrap();

        let section = runtime.registry.find_section(0x1040).unwrap();
        assert_eq!(section.main_method(), Some(7));
        assert_eq!(section.method_id(0), Some(7));
        let helper = section.method_id(1).unwrap();
        assert_eq!(runtime.methods.get(helper).unwrap().name, "helper");
        let info = section.pc_info(section.find_pc(0x1040).unwrap()).unwrap();
        assert_eq!(info.frames[0].method_index, 1);
    }

    #[test]
    fn thread_starts_are_collected() {
        let mut dump = DumpBuilder::new();
        dump.thread_start(1, 4242);
        dump.thread_start(2, 4243);
        let runtime = JvmRuntime::replay(&dump.finish()).unwrap();
        assert_eq!(runtime.thread_starts.len(), 2);
        assert_eq!(runtime.thread_starts[0].sys_tid, 4242);
    }

    #[test]
    fn oversized_record_is_a_format_error() {
        let mut dump = DumpBuilder::new();
        dump.thread_start(1, 2);
        let mut bytes = dump.finish();
        bytes[8] = 0xff; // inflate the record size past the buffer
        assert!(matches!(
            JvmRuntime::replay(&bytes),
            Err(DecodeError::Format(0, _))
        ));
    }
}
