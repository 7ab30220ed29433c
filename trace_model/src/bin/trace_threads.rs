//! Print the profiled threads of a Chrome Performance trace.
//!
//! Accepts the same inputs as `trace_to_calls`, gzipped or not.

use std::env;
use std::path::Path;
use std::process::ExitCode;
use trace_model::{open_input, parse_trace};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    if args.len() != 2 {
        let program = args.first().map_or("trace_threads", String::as_str);
        eprintln!("Usage: {} <trace.json[.gz]>", program);
        return ExitCode::from(2);
    }

    let path = &args[1];

    let file = match open_input(Path::new(path)) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening '{}': {}", path, e);
            return ExitCode::FAILURE;
        }
    };

    let trace = match parse_trace(file) {
        Ok(trace) => trace,
        Err(e) => {
            eprintln!("Invalid trace '{}': {}", path, e);
            return ExitCode::FAILURE;
        }
    };

    match trace.thread_profiles() {
        Ok(profiles) => {
            println!("Trace: {}", path);
            println!("  Events: {}", trace.events.len());
            if let Some(serde_json::Value::Object(metadata)) = &trace.metadata {
                for (key, value) in metadata {
                    if !value.is_object() && !value.is_array() {
                        println!("  {}: {}", key, value);
                    }
                }
            }
            for profile in &profiles {
                let model = &profile.model;
                println!(
                    "  Thread {}:{} profile {}",
                    profile.pid,
                    profile.tid,
                    profile.id.as_deref().unwrap_or("-")
                );
                println!("    Nodes: {}", model.nodes().len());
                println!("    Samples: {}", model.samples().len());
                println!(
                    "    Time range: {}us - {}us",
                    model.start_time(),
                    model.end_time()
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("No usable CPU profile in '{}': {}", path, e);
            ExitCode::FAILURE
        }
    }
}
