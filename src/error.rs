use thiserror::Error;

/// The error type used throughout the decoder.
///
/// Only `Io` and `Config`-class errors abort the pipeline. Everything that
/// can go wrong inside a single window or sideband record is converted into
/// loss markers on the affected thread splits, and decoding continues.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported configuration: {0}")]
    Config(&'static str),

    #[error("Time conversion constants are missing or zero")]
    BadConfig,

    #[error("Record header does not fit the remaining bytes at offset {0:#x}")]
    EndOfStream(usize),

    #[error("Record at offset {0:#x} does not end where its header says")]
    NoSync(usize),

    #[error("Malformed packet at offset {0:#x}")]
    BadPacket(usize),

    #[error("Trace buffer corrupt at offset {0:#x}: {1}")]
    Format(usize, &'static str),
}

impl DecodeError {
    /// Process exit code for a top-level failure, per the CLI contract:
    /// 2 for file I/O, 3 for anything decode-related.
    pub fn exit_code(&self) -> i32 {
        match self {
            DecodeError::Io(_) => 2,
            _ => 3,
        }
    }
}
