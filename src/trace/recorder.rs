use log::trace;

use super::data::{EventTag, ThreadSplit, TraceData, NO_PC_INFO};
use crate::runtime::bytecodes::Bytecode;
use crate::runtime::codelets::Codelet;
use crate::runtime::jit_section::JitSection;

/// The record currently open at the end of the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenRecord {
    None,
    /// Last write was this point event's tag byte.
    Point(EventTag),
    Bytecode {
        count_at: usize,
    },
    Jit {
        count_at: usize,
        section: u32,
        variant: EventTag,
    },
}

/// Append-side view of a trace: coalesces events into run-length records
/// and maintains the thread-split bookkeeping for one decode job.
pub struct TraceRecorder {
    trace: TraceData,
    open: OpenRecord,
    /// The split currently receiving events, as (tid, index).
    current: Option<(i64, usize)>,
    current_tsc: u64,
    last_bytecode: Option<Bytecode>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        TraceRecorder {
            trace: TraceData::new(),
            open: OpenRecord::None,
            current: None,
            current_tsc: 0,
            last_bytecode: None,
        }
    }

    /// Closes the open split, if any, and hands back the trace.
    pub fn finish(mut self) -> TraceData {
        self.switch_out(false);
        self.trace
    }

    pub fn switch_in(&mut self, tid: i64, tsc: u64, loss: bool) {
        if let Some((current_tid, _)) = self.current {
            if current_tid == tid && !loss {
                return;
            }
            self.switch_out(false);
        }
        self.current_tsc = tsc;
        let index = self.trace.insert_split(ThreadSplit {
            tid,
            start_offset: self.trace.len(),
            end_offset: self.trace.len(),
            start_tsc: tsc,
            end_tsc: tsc,
            head_loss: loss,
            tail_loss: false,
        });
        self.current = Some((tid, index));
        self.open = OpenRecord::None;
    }

    pub fn switch_out(&mut self, loss: bool) {
        self.open = OpenRecord::None;
        if let Some((tid, index)) = self.current.take() {
            let end_offset = self.trace.len();
            let end_tsc = self.current_tsc;
            let split = self.trace.split_mut(tid, index);
            split.end_offset = end_offset;
            split.end_tsc = end_tsc;
            split.tail_loss = loss;
        }
    }

    pub fn add_bytecode(&mut self, tsc: u64, bytecode: Bytecode) {
        self.current_tsc = tsc;
        let full = match self.open {
            OpenRecord::Bytecode { count_at } => self.trace.byte(count_at) == u8::MAX,
            _ => true,
        };
        if full {
            self.trace.push(EventTag::Bytecode as u8);
            let count_at = self.trace.len();
            self.trace.push(0);
            self.open = OpenRecord::Bytecode { count_at };
        }
        self.trace.push(bytecode.0);
        if let OpenRecord::Bytecode { count_at } = self.open {
            *self.trace.byte_mut(count_at) += 1;
        }
        self.last_bytecode = Some(bytecode);
    }

    pub fn add_jitcode(&mut self, tsc: u64, section: &JitSection, pc_ref: Option<u32>, ip: u64) {
        self.current_tsc = tsc;

        // OSR entries only count as such when reached from a branching
        // bytecode; anything else at the OSR address is a plain event.
        let from_branch = matches!(self.open, OpenRecord::Bytecode { .. })
            && self.last_bytecode.is_some_and(Bytecode::can_enter_osr);
        let variant = if ip == section.osr_entry_point() && from_branch {
            EventTag::JitCodeOsrEntry
        } else if ip == section.entry_point() || ip == section.verified_entry_point() {
            EventTag::JitCodeEntry
        } else {
            EventTag::JitCode
        };

        // Entry variants always start a record of their own: every entry is
        // a distinct invocation. Plain events extend a plain record of the
        // same section.
        let extend = variant == EventTag::JitCode
            && matches!(self.open, OpenRecord::Jit { count_at, section: open_section, variant: open_variant }
                if open_section == section.id()
                    && open_variant == EventTag::JitCode
                    && self.trace.byte(count_at) < u8::MAX);
        if !extend {
            self.trace.push(variant as u8);
            let count_at = self.trace.len();
            self.trace.push(0);
            self.trace.push_u32(section.id());
            self.open = OpenRecord::Jit {
                count_at,
                section: section.id(),
                variant,
            };
        }
        self.trace.push_u32(pc_ref.unwrap_or(NO_PC_INFO));
        if let OpenRecord::Jit { count_at, .. } = self.open {
            *self.trace.byte_mut(count_at) += 1;
        }
    }

    pub fn add_codelet(&mut self, codelet: Codelet) {
        let tag = match codelet {
            Codelet::MethodEntry => EventTag::MethodEntry,
            Codelet::ThrowException => EventTag::Throw,
            Codelet::RethrowException => EventTag::Rethrow,
            Codelet::Deopt => EventTag::Deopt,
            Codelet::DeoptReexecuteReturn => EventTag::DeoptReexecuteReturn,
            Codelet::ThrowArrayIndexOutOfBounds => EventTag::ThrowArrayIndexOutOfBounds,
            Codelet::ThrowArrayStore => EventTag::ThrowArrayStore,
            Codelet::ThrowArithmetic => EventTag::ThrowArithmetic,
            Codelet::ThrowClassCast => EventTag::ThrowClassCast,
            Codelet::ThrowNullPointer => EventTag::ThrowNullPointer,
            Codelet::ThrowStackOverflow => EventTag::ThrowStackOverflow,
            Codelet::RemoveActivation => EventTag::RemoveActivation,
            Codelet::RemoveActivationPreservingArgs => EventTag::RemoveActivationPreservingArgs,
            Codelet::InvokeReturn => EventTag::InvokeReturn,
            Codelet::InvokeinterfaceReturn => EventTag::InvokeinterfaceReturn,
            Codelet::InvokedynamicReturn => EventTag::InvokedynamicReturn,
            Codelet::ResultHandler => EventTag::ResultHandler,
            Codelet::Return
            | Codelet::UnimplementedBytecode
            | Codelet::IllegalBytecodeSequence
            | Codelet::Illegal => {
                // Not recorded; they still end any open run.
                self.open = OpenRecord::None;
                return;
            }
            Codelet::Bytecode(_) => {
                debug_assert!(false, "bytecodes go through add_bytecode");
                return;
            }
        };

        if matches!(
            tag,
            EventTag::InvokeReturn
                | EventTag::InvokeinterfaceReturn
                | EventTag::InvokedynamicReturn
                | EventTag::ResultHandler
        ) && self.open == OpenRecord::Point(EventTag::MethodEntry)
        {
            // PT reports a method-entry codelet on the return path of the
            // caller; the pending method_entry is spurious. The tag is a
            // single byte, so rewinding one byte removes exactly it.
            let len = self.trace.len();
            debug_assert_eq!(self.trace.byte(len - 1), EventTag::MethodEntry as u8);
            self.trace.truncate(len - 1);
            trace!("spurious method_entry erased before {tag:?}");
        }

        self.trace.push(tag as u8);
        self.open = OpenRecord::Point(tag);
    }
}

#[cfg(test)]
mod tests {
    use super::super::cursor::{TraceCursor, TraceEvent};
    use super::*;
    use crate::runtime::jit_section::testutil::section;

    fn events(trace: &TraceData) -> Vec<TraceEvent<'_>> {
        TraceCursor::new(trace.data())
            .map(|item| item.unwrap().1)
            .collect()
    }

    #[test]
    fn bytecode_runs_coalesce() {
        let mut recorder = TraceRecorder::new();
        recorder.switch_in(1, 100, false);
        for _ in 0..5 {
            recorder.add_bytecode(100, Bytecode(0x60));
        }
        let trace = recorder.finish();
        match &events(&trace)[..] {
            [TraceEvent::Bytecodes { opcodes }] => assert_eq!(*opcodes, &[0x60; 5][..]),
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn bytecode_run_caps_at_255() {
        let mut recorder = TraceRecorder::new();
        recorder.switch_in(1, 100, false);
        for _ in 0..300 {
            recorder.add_bytecode(100, Bytecode(0x60));
        }
        let trace = recorder.finish();
        match &events(&trace)[..] {
            [TraceEvent::Bytecodes { opcodes: first }, TraceEvent::Bytecodes { opcodes: second }] =>
            {
                assert_eq!(first.len(), 255);
                assert_eq!(second.len(), 45);
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn point_event_closes_the_run() {
        let mut recorder = TraceRecorder::new();
        recorder.switch_in(1, 100, false);
        recorder.add_bytecode(100, Bytecode(0x60));
        recorder.add_codelet(Codelet::Deopt);
        recorder.add_bytecode(101, Bytecode(0x60));
        let trace = recorder.finish();
        let events = events(&trace);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[1], TraceEvent::Point(EventTag::Deopt)));
    }

    #[test]
    fn method_entry_cancelled_by_invoke_return() {
        let mut recorder = TraceRecorder::new();
        recorder.switch_in(1, 100, false);
        recorder.add_codelet(Codelet::MethodEntry);
        recorder.add_codelet(Codelet::InvokeReturn);
        let trace = recorder.finish();
        // No MethodEntry byte survives.
        assert!(!trace
            .data()
            .iter()
            .any(|&b| b == EventTag::MethodEntry as u8));
        match &events(&trace)[..] {
            [TraceEvent::Point(EventTag::InvokeReturn)] => {}
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn method_entry_survives_other_followers() {
        let mut recorder = TraceRecorder::new();
        recorder.switch_in(1, 100, false);
        recorder.add_codelet(Codelet::MethodEntry);
        recorder.add_bytecode(100, Bytecode(0x60));
        let trace = recorder.finish();
        let events = events(&trace);
        assert!(matches!(events[0], TraceEvent::Point(EventTag::MethodEntry)));
    }

    #[test]
    fn jit_entry_then_body_makes_two_records() {
        // Entry conditions differ between the entry IP and the body pc, so
        // the body opens a fresh record.
        let section = section(0x1000, 0x1000, &[0x40]);
        let mut recorder = TraceRecorder::new();
        recorder.switch_in(1, 100, false);
        recorder.add_jitcode(100, &section, None, 0x1000);
        recorder.add_jitcode(100, &section, Some(0), 0x1040);
        let trace = recorder.finish();
        match &events(&trace)[..] {
            [TraceEvent::Jit {
                tag: EventTag::JitCodeEntry,
                pc_refs: first,
                ..
            }, TraceEvent::Jit {
                tag: EventTag::JitCode,
                pc_refs: second,
                ..
            }] => {
                assert_eq!(first, &[NO_PC_INFO]);
                assert_eq!(second, &[0]);
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn plain_jit_events_coalesce_per_section() {
        let first = section(0x1000, 0x1000, &[0x40, 0x80]);
        let second = section(0x4000, 0x1000, &[0x10]);
        let mut recorder = TraceRecorder::new();
        recorder.switch_in(1, 100, false);
        recorder.add_jitcode(100, &first, Some(0), 0x1040);
        recorder.add_jitcode(100, &first, Some(1), 0x1080);
        recorder.add_jitcode(100, &second, Some(0), 0x4010);
        let trace = recorder.finish();
        match &events(&trace)[..] {
            [TraceEvent::Jit {
                section: section_a,
                pc_refs: refs_a,
                ..
            }, TraceEvent::Jit {
                section: section_b,
                pc_refs: refs_b,
                ..
            }] => {
                assert_eq!(refs_a, &[0, 1]);
                assert_eq!(refs_b, &[0]);
                assert_ne!(section_a, section_b);
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn osr_entry_requires_preceding_branch() {
        use crate::runtime::jit_section::JitSection;
        use rustc_hash::FxHashMap;
        let section = JitSection::new(
            vec![0; 0x1000],
            0x1000,
            0x1000,
            0x1020,
            0x1400, // OSR entry point
            Some(0),
            FxHashMap::default(),
            &[],
            &[],
        )
        .unwrap();

        let mut recorder = TraceRecorder::new();
        recorder.switch_in(1, 100, false);
        recorder.add_bytecode(100, Bytecode::GOTO);
        recorder.add_jitcode(100, &section, None, 0x1400);
        // Same address again, but now the previous event is a jit record.
        recorder.add_jitcode(100, &section, None, 0x1400);
        let trace = recorder.finish();
        let events = events(&trace);
        assert!(matches!(
            events[1],
            TraceEvent::Jit {
                tag: EventTag::JitCodeOsrEntry,
                ..
            }
        ));
        assert!(matches!(
            events[2],
            TraceEvent::Jit {
                tag: EventTag::JitCode,
                ..
            }
        ));
    }

    #[test]
    fn switch_in_same_tid_without_loss_is_a_noop() {
        let mut recorder = TraceRecorder::new();
        recorder.switch_in(1, 100, false);
        recorder.add_bytecode(150, Bytecode(0x60));
        recorder.switch_in(1, 200, false);
        recorder.add_bytecode(250, Bytecode(0x60));
        let trace = recorder.finish();
        assert_eq!(trace.splits(1).len(), 1);
        // The run kept coalescing across the no-op switch.
        assert_eq!(events(&trace).len(), 1);
    }

    #[test]
    fn loss_splits_the_thread() {
        let mut recorder = TraceRecorder::new();
        recorder.switch_in(1, 100, false);
        recorder.add_bytecode(150, Bytecode(0x60));
        recorder.switch_out(true);
        recorder.switch_in(1, 200, true);
        recorder.add_bytecode(250, Bytecode(0x60));
        let trace = recorder.finish();
        let splits = trace.splits(1);
        assert_eq!(splits.len(), 2);
        assert!(splits[0].tail_loss);
        assert!(splits[1].head_loss);
        assert!(!splits[1].tail_loss);
        assert_eq!(splits[0].end_offset, splits[1].start_offset);
    }

    #[test]
    fn splits_cover_every_byte_exactly_once() {
        let mut recorder = TraceRecorder::new();
        recorder.switch_in(1, 100, false);
        recorder.add_bytecode(100, Bytecode(0x60));
        recorder.switch_out(false);
        recorder.switch_in(2, 200, false);
        recorder.add_codelet(Codelet::ThrowException);
        let trace = recorder.finish();
        let first = &trace.splits(1)[0];
        let second = &trace.splits(2)[0];
        assert_eq!(first.start_offset, 0);
        assert_eq!(first.end_offset, second.start_offset);
        assert_eq!(second.end_offset, trace.len());
    }
}
