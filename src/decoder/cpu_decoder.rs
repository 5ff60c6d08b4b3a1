use log::{trace, warn};

use super::splitter::TracePart;
use crate::error::DecodeError;
use crate::pt::decoder::{PacketDecoder, PtConfig, PtEvent};
use crate::runtime::codelets::Codelet;
use crate::runtime::JvmRuntime;
use crate::trace::{TraceData, TraceRecorder};

/// Result of decoding one window. The trace is kept even when the window
/// died on a packet error; the error only marks where decoding stopped.
pub struct DecodedWindow {
    pub trace: TraceData,
    pub error: Option<DecodeError>,
}

/// Decodes PSB-aligned windows against the frozen runtime state. One
/// instance per worker; holds no per-window state.
pub struct WindowDecoder<'r> {
    runtime: &'r JvmRuntime,
    config: PtConfig,
}

impl<'r> WindowDecoder<'r> {
    pub fn new(runtime: &'r JvmRuntime, config: PtConfig) -> Self {
        WindowDecoder { runtime, config }
    }

    pub fn decode(&self, part: &TracePart) -> DecodedWindow {
        let mut recorder = TraceRecorder::new();
        let mut decoder = PacketDecoder::new(&part.pt);
        let mut schedule = part.schedule.cursor();
        let mut time = 0u64;
        let mut started = false;
        let mut pending_loss = false;
        let mut error = None;

        while let Some(event) = decoder.next_event() {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    // Fatal for this window only; close what we have with a
                    // tail loss and give up on the rest of the slice.
                    warn!(
                        "cpu {} window {}: packet error at {:#x}: {err}",
                        part.cpu,
                        part.window,
                        decoder.pos()
                    );
                    recorder.switch_out(true);
                    error = Some(err);
                    break;
                }
            };
            match event {
                PtEvent::Tsc(tsc) => {
                    time = tsc;
                    if started {
                        while let Some((crossing_tsc, tid)) = schedule.next_crossing(time) {
                            let loss = schedule.take_loss(crossing_tsc);
                            recorder.switch_out(false);
                            recorder.switch_in(tid, crossing_tsc, loss);
                        }
                    }
                }
                PtEvent::Loss => {
                    recorder.switch_out(true);
                    started = false;
                    pending_loss = true;
                }
                PtEvent::Ip(ip) => {
                    if !started {
                        // Open a split for whoever the sideband says is on
                        // this CPU at the window's current time.
                        schedule.seek(time);
                        let tid = part.schedule.tid_at(time).unwrap_or(0);
                        recorder.switch_in(tid, time, pending_loss);
                        pending_loss = false;
                        started = true;
                    }
                    self.classify(&mut recorder, time, ip);
                }
            }
        }

        DecodedWindow {
            trace: recorder.finish(),
            error,
        }
    }

    /// JIT first, interpreter second; everything else is expected
    /// non-instrumented code and dropped.
    fn classify(&self, recorder: &mut TraceRecorder, time: u64, ip: u64) {
        if let Some((low, high)) = self.config.filter {
            // The trace was collected with an address filter; anything
            // outside it is stale last-IP state.
            if ip < low || ip >= high {
                return;
            }
        }
        if let Some(section) = self.runtime.registry.find_section(ip) {
            recorder.add_jitcode(time, section, section.find_pc(ip), ip);
            return;
        }
        match self.runtime.codelets.classify(ip) {
            Codelet::Bytecode(bytecode) => recorder.add_bytecode(time, bytecode),
            Codelet::Illegal => trace!("ip {ip:#x} matches no codelet or section"),
            codelet => recorder.add_codelet(codelet),
        }
    }
}
