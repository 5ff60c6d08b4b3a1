mod cli;

use std::fs::File;

use clap::Parser;
use log::info;
use memmap2::Mmap;

use jportal_decoder::capture::Capture;
use jportal_decoder::decoder::{self, DecodeStats};
use jportal_decoder::error::DecodeError;
use jportal_decoder::runtime::JvmRuntime;

fn main() {
    env_logger::init();

    let opt = match cli::Opt::try_parse() {
        Ok(opt) => opt,
        Err(err) => {
            let _ = err.print();
            std::process::exit(1);
        }
    };

    match run(&opt) {
        Ok(stats) => {
            if stats.windows > 0 && stats.failed_windows == stats.windows {
                eprintln!("Every decode window failed; output is unusable.");
                std::process::exit(3);
            }
        }
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(err.exit_code());
        }
    }
}

fn run(opt: &cli::Opt) -> Result<DecodeStats, DecodeError> {
    let capture = Capture::open(&opt.trace_file)?;
    info!(
        "capture: {} cpus, family {:#x} model {:#x}",
        capture.header.nr_cpus, capture.header.family, capture.header.model
    );

    let dump_file = File::open(&opt.dump_file)?;
    let dump = unsafe { Mmap::map(&dump_file)? };
    let runtime = JvmRuntime::replay(&dump)?;

    let workers = opt.workers.unwrap_or_else(num_cpus::get);
    let (trace, stats) = decoder::decode_capture(&capture, &runtime, opt.split, workers);

    for tid in trace.threads() {
        info!("tid {tid}: {} splits", trace.splits(tid).len());
    }
    trace.save(&opt.output)?;
    info!("trace written to {}", opt.output.display());
    Ok(stats)
}
