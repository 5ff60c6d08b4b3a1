use std::sync::Arc;

use log::{debug, warn};

use crate::capture::Capture;
use crate::pt::packet::{sync_forward, PSB_PATTERN};
use crate::sideband::records::SampleLayout;
use crate::sideband::schedule::CpuSchedule;

pub const DEFAULT_SYNC_SPLIT_NUMBER: usize = 500;

/// One independent decode job: a PSB-aligned PT window plus the owning
/// CPU's full sideband (read-only, shared across the CPU's windows).
pub struct TracePart {
    pub cpu: u32,
    pub window: u32,
    pub pt: Vec<u8>,
    pub sideband: Arc<Vec<u8>>,
    pub schedule: Arc<CpuSchedule>,
}

struct CpuState {
    cpu: u32,
    pt: Vec<u8>,
    sideband: Arc<Vec<u8>>,
    schedule: Arc<CpuSchedule>,
    /// Start of the next window; always a PSB offset.
    pos: usize,
    window: u32,
}

/// Partitions the capture into decode jobs: per CPU, then into windows
/// bounded by every Nth PSB. Only a PSB can start a window; the decoder
/// cannot restart anywhere else.
pub struct TraceSplitter<'a> {
    capture: &'a Capture,
    sync_split_number: usize,
    sample_layout: SampleLayout,
    next_cpu: usize,
    current: Option<CpuState>,
}

impl<'a> TraceSplitter<'a> {
    pub fn new(capture: &'a Capture, sync_split_number: usize) -> Self {
        TraceSplitter {
            capture,
            sync_split_number: sync_split_number.max(1),
            sample_layout: SampleLayout::from_sample_type(capture.header.sample_type),
            next_cpu: 0,
            current: None,
        }
    }

    pub fn sample_layout(&self) -> SampleLayout {
        self.sample_layout
    }

    /// Checks that the sideband slice filed under this CPU actually carries
    /// its CPU id, using the pre-computed sample layout.
    fn check_sideband_routing(&self, cpu: u32, sideband: &[u8]) {
        if sideband.len() < 8 {
            return;
        }
        let size = u16::from_le_bytes([sideband[6], sideband[7]]) as usize;
        if size < 8 || size > sideband.len() {
            return;
        }
        if let Some(sample_cpu) = self.sample_layout.cpu_of(&sideband[8..size]) {
            if sample_cpu != cpu {
                warn!("sideband for cpu {cpu} carries records stamped cpu {sample_cpu}");
            }
        }
    }

    fn open_next_cpu(&mut self) -> Option<CpuState> {
        while self.next_cpu < self.capture.cpus.len() {
            let index = self.next_cpu;
            self.next_cpu += 1;
            let cpu = self.capture.cpus[index].cpu;
            let pt = self.capture.pt_bytes(index);
            let Some(first_sync) = sync_forward(&pt, 0) else {
                if !pt.is_empty() {
                    warn!("cpu {cpu}: no PSB in {} bytes of PT data, skipped", pt.len());
                }
                continue;
            };
            let sideband = Arc::new(self.capture.sideband_bytes(index));
            self.check_sideband_routing(cpu, &sideband);
            let schedule = Arc::new(CpuSchedule::parse(
                &sideband,
                self.capture.header.sideband_config(),
            ));
            return Some(CpuState {
                cpu,
                pt,
                sideband,
                schedule,
                pos: first_sync,
                window: 0,
            });
        }
        None
    }
}

impl<'a> Iterator for TraceSplitter<'a> {
    type Item = TracePart;

    fn next(&mut self) -> Option<TracePart> {
        if self.current.is_none() {
            self.current = Some(self.open_next_cpu()?);
        }
        let state = self.current.as_mut().unwrap();

        let start = state.pos;
        // Advance past sync_split_number further PSBs; the last one found
        // bounds the window.
        let mut end = state.pt.len();
        let mut search_from = start + PSB_PATTERN.len();
        let mut complete_window = false;
        for _ in 0..self.sync_split_number {
            match sync_forward(&state.pt, search_from) {
                Some(offset) => {
                    end = offset;
                    search_from = offset + PSB_PATTERN.len();
                    complete_window = true;
                }
                None => {
                    end = state.pt.len();
                    complete_window = false;
                    break;
                }
            }
        }

        let part = TracePart {
            cpu: state.cpu,
            window: state.window,
            pt: state.pt[start..end].to_vec(),
            sideband: Arc::clone(&state.sideband),
            schedule: Arc::clone(&state.schedule),
        };
        debug!(
            "cpu {} window {}: {} PT bytes at [{start:#x}, {end:#x})",
            part.cpu,
            part.window,
            part.pt.len()
        );
        state.window += 1;
        state.pos = end;
        if !complete_window || end == state.pt.len() {
            self.current = None;
        }
        Some(part)
    }
}
