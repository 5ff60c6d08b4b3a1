pub mod cpu_decoder;
pub mod splitter;
pub mod worker;

pub use splitter::{TraceSplitter, DEFAULT_SYNC_SPLIT_NUMBER};
pub use worker::{decode_capture, DecodeStats};
