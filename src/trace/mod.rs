pub mod cursor;
pub mod data;
pub mod recorder;

pub use cursor::{TraceCursor, TraceEvent};
pub use data::{EventTag, ThreadSplit, TraceData, NO_PC_INFO};
pub use recorder::TraceRecorder;
