//! Reconstruct JS calls from Chrome profiling data.
//!
//! This binary reads a Chrome Performance trace or a standalone cpuprofile,
//! reconciles the CPU samples with the trace events of every profiled
//! thread, and writes the reconstructed calls.
//!
//! Supported input formats:
//! - Chrome Performance traces (`.json`, or `.json.gz`)
//! - Standalone cpuprofile files (`.cpuprofile`)
//!
//! # Usage
//!
//! ```bash
//! trace_to_calls trace.json -o calls.json
//! trace_to_calls trace.json.gz --format lines --show-native-functions
//! trace_to_calls profile.cpuprofile
//! ```

use clap::{Parser, ValueEnum};
use profile_calls::filter::FilterConfig;
use profile_calls::timeline::{integrate_cpu_profile, integrate_trace};
use profile_calls::trace_model::{Input, open_input, parse_input};
use profile_calls::writer::{OutputFormat, write_calls};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    /// Chrome trace with one complete event per call
    Trace,
    /// Newline-delimited JSON records
    Lines,
}

impl From<Format> for OutputFormat {
    fn from(f: Format) -> Self {
        match f {
            Format::Trace => OutputFormat::Trace,
            Format::Lines => OutputFormat::Lines,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "trace_to_calls")]
#[command(about = "Reconstruct JS calls from CPU samples and trace events")]
#[command(version)]
struct Args {
    /// Input file (Performance trace or cpuprofile, optionally gzipped)
    input: PathBuf,

    /// Output file (defaults to input filename with .calls.json extension)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "trace")]
    format: Format,

    /// Keep frames of native functions
    #[arg(long)]
    show_native_functions: bool,

    /// Keep parse/compile V8 runtime frames
    #[arg(long)]
    show_runtime_call_stats: bool,

    /// Keep every frame, bypassing all filtering
    #[arg(long)]
    show_all_events: bool,

    /// Only keep threads of this process
    #[arg(long)]
    pid: Option<u64>,

    /// Only keep this thread
    #[arg(long)]
    tid: Option<u64>,
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let output_path = args.output.clone().unwrap_or_else(|| {
        let mut path = args.input.clone();
        path.set_extension("calls.json");
        path
    });

    let config = FilterConfig {
        show_all_events: args.show_all_events,
        show_native_functions: args.show_native_functions,
        show_runtime_call_stats: args.show_runtime_call_stats,
    };

    let input = open_input(&args.input)
        .map_err(|e| format!("Failed to open input file '{}': {}", args.input.display(), e))?;

    let mut threads = match parse_input(input)? {
        Input::Trace(trace) => {
            eprintln!("Detected: Chrome Performance trace");
            integrate_trace(&trace, config)?
        }
        Input::CpuProfile(model) => {
            eprintln!("Detected: V8 cpuprofile");
            vec![integrate_cpu_profile(&model, config)]
        }
    };

    threads.retain(|thread| {
        args.pid.is_none_or(|pid| thread.pid == pid) && args.tid.is_none_or(|tid| thread.tid == tid)
    });
    if threads.is_empty() {
        return Err("no profiled thread matches the --pid/--tid filter".into());
    }

    for thread in &threads {
        eprintln!(
            "Thread {}:{}: {} calls",
            thread.pid,
            thread.tid,
            thread.calls.len()
        );
        if !thread.diagnostics.is_empty() {
            eprintln!(
                "  {} stack inconsistencies recovered",
                thread.diagnostics.len()
            );
        }
    }

    let output_file = File::create(&output_path).map_err(|e| {
        format!(
            "Failed to create output file '{}': {}",
            output_path.display(),
            e
        )
    })?;
    let mut writer = BufWriter::new(output_file);
    write_calls(&threads, args.format.into(), &mut writer)?;
    writer.flush()?;

    eprintln!(
        "Converted '{}' -> '{}'",
        args.input.display(),
        output_path.display()
    );

    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
