//! Decoder for JPortal captures: raw Intel PT data and perf sideband
//! recorded per CPU, plus a runtime dump log of methods, interpreter
//! codelets and compiled code.
//!
//! The pipeline replays the dump into a frozen [`runtime::JvmRuntime`],
//! splits each CPU's PT stream at synchronization points
//! ([`decoder::TraceSplitter`]), decodes the windows on a worker pool
//! ([`decoder::decode_capture`]), and merges the results into a
//! per-thread, time-ordered [`trace::TraceData`].

pub mod capture;
pub mod decoder;
pub mod error;
pub mod pt;
pub mod raw;
pub mod runtime;
pub mod sideband;
pub mod trace;
