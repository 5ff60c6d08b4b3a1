use log::debug;

use super::reader::{SidebandConfig, SidebandReader};
use super::records::PerfRecord;

/// The per-CPU thread schedule, derived once from a CPU's sideband slice.
///
/// `switches` holds the thread running on the CPU after each context-switch
/// crossing; `losses` holds the TSCs of kernel-reported record loss.
#[derive(Debug, Clone, Default)]
pub struct CpuSchedule {
    switches: Vec<(u64, i64)>,
    losses: Vec<u64>,
}

impl CpuSchedule {
    pub fn parse(data: &[u8], config: SidebandConfig) -> CpuSchedule {
        let mut switches = Vec::new();
        let mut losses = Vec::new();
        let mut bad_records = 0usize;
        for event in SidebandReader::new(data, config) {
            let event = match event {
                Ok(event) => event,
                Err(_) => {
                    bad_records += 1;
                    continue;
                }
            };
            match event.record {
                PerfRecord::Switch | PerfRecord::SwitchCpuWide { .. } => {
                    if event.is_switch_out() {
                        continue;
                    }
                    if let (Some(tid), Some(tsc)) = (event.sample.tid, event.tsc()) {
                        switches.push((tsc, tid as i64));
                    }
                }
                PerfRecord::Lost { .. } | PerfRecord::LostSamples { .. } => {
                    if let Some(tsc) = event.tsc() {
                        losses.push(tsc);
                    }
                }
                _ => {}
            }
        }
        if bad_records > 0 {
            debug!("{bad_records} unparseable sideband records skipped");
        }
        // Records are written in time order; keep the derived views sorted
        // even if the stream was not.
        switches.sort_by_key(|&(tsc, _)| tsc);
        losses.sort_unstable();
        CpuSchedule { switches, losses }
    }

    /// The thread scheduled on this CPU at `tsc`: the last crossing at or
    /// before it.
    pub fn tid_at(&self, tsc: u64) -> Option<i64> {
        let idx = self.switches.partition_point(|&(t, _)| t <= tsc);
        idx.checked_sub(1).map(|idx| self.switches[idx].1)
    }

    pub fn cursor(&self) -> ScheduleCursor<'_> {
        ScheduleCursor {
            schedule: self,
            next_switch: 0,
            next_loss: 0,
        }
    }
}

/// Forward-only view over a schedule, used while decoding one window.
pub struct ScheduleCursor<'a> {
    schedule: &'a CpuSchedule,
    next_switch: usize,
    next_loss: usize,
}

impl<'a> ScheduleCursor<'a> {
    /// Consumes crossings up to and including `tsc` without reporting them;
    /// used to position the cursor at a window's start time.
    pub fn seek(&mut self, tsc: u64) {
        while let Some(&(t, _)) = self.schedule.switches.get(self.next_switch) {
            if t > tsc {
                break;
            }
            self.next_switch += 1;
        }
        self.take_loss(tsc);
    }

    /// The next switch crossing at or before `tsc`, if any.
    pub fn next_crossing(&mut self, tsc: u64) -> Option<(u64, i64)> {
        let &(t, tid) = self.schedule.switches.get(self.next_switch)?;
        if t > tsc {
            return None;
        }
        self.next_switch += 1;
        Some((t, tid))
    }

    /// Whether any kernel loss record landed at or before `tsc` since the
    /// last call.
    pub fn take_loss(&mut self, tsc: u64) -> bool {
        let mut seen = false;
        while let Some(&t) = self.schedule.losses.get(self.next_loss) {
            if t > tsc {
                break;
            }
            self.next_loss += 1;
            seen = true;
        }
        seen
    }
}
