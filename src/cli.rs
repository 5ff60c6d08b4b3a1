use std::path::PathBuf;

use clap::Parser;

use jportal_decoder::decoder::DEFAULT_SYNC_SPLIT_NUMBER;

#[derive(Debug, Parser)]
#[command(
    name = "decoder",
    version,
    about = r#"
Decodes a JPortal capture into per-thread bytecode-level traces.

The capture holds raw Intel PT data and perf sideband per CPU; the dump
file holds the runtime's method, codelet and compiled-code log. The
decoder replays the dump, splits the PT data at synchronization points,
and decodes the windows in parallel.

EXAMPLE:
    decoder JPortalTrace.data JPortalDump.data -o trace.out
"#
)]
pub struct Opt {
    /// Capture file written by the trace collector.
    pub trace_file: PathBuf,

    /// Dump log written by the in-process agent.
    pub dump_file: PathBuf,

    /// PT synchronization points per decode window.
    #[arg(long = "split", default_value_t = DEFAULT_SYNC_SPLIT_NUMBER)]
    pub split: usize,

    /// Worker thread count. Defaults to the number of logical CPUs.
    #[arg(short = 'w', long = "workers")]
    pub workers: Option<usize>,

    /// Output filename.
    #[arg(short = 'o', long = "output", default_value = "decode.out")]
    pub output: PathBuf,
}
