use std::thread;

use log::{info, warn};

use super::cpu_decoder::{DecodedWindow, WindowDecoder};
use super::splitter::{TracePart, TraceSplitter};
use crate::capture::Capture;
use crate::pt::decoder::PtConfig;
use crate::runtime::JvmRuntime;
use crate::trace::TraceData;

#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeStats {
    pub windows: usize,
    pub failed_windows: usize,
}

/// Runs the full decode: splits the capture, fans the windows out to a
/// fixed worker pool, and merges the per-window traces in (cpu, window)
/// order. Workers only read the frozen runtime state; each owns the
/// recorder for the window it is decoding.
pub fn decode_capture(
    capture: &Capture,
    runtime: &JvmRuntime,
    sync_split_number: usize,
    workers: usize,
) -> (TraceData, DecodeStats) {
    let workers = workers.max(1);
    let config = PtConfig::from_header(&capture.header);
    let (job_tx, job_rx) = crossbeam_channel::bounded::<TracePart>(workers * 2);
    let (result_tx, result_rx) = crossbeam_channel::unbounded();

    let mut results: Vec<((u32, u32), DecodedWindow)> = thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                let decoder = WindowDecoder::new(runtime, config);
                for part in job_rx {
                    let key = (part.cpu, part.window);
                    let decoded = decoder.decode(&part);
                    if result_tx.send((key, decoded)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(job_rx);
        drop(result_tx);

        for part in TraceSplitter::new(capture, sync_split_number) {
            if job_tx.send(part).is_err() {
                break;
            }
        }
        drop(job_tx);

        result_rx.iter().collect()
    });
    results.sort_by_key(|&(key, _)| key);

    let mut stats = DecodeStats::default();
    let mut merged = TraceData::new();
    for ((cpu, window), decoded) in results {
        stats.windows += 1;
        if let Some(err) = decoded.error {
            stats.failed_windows += 1;
            warn!("cpu {cpu} window {window} ended early: {err}");
        }
        merged.absorb(decoded.trace);
    }
    info!(
        "decoded {} windows ({} with errors), {} bytes, {} thread splits",
        stats.windows,
        stats.failed_windows,
        merged.len(),
        merged.split_count()
    );
    (merged, stats)
}
