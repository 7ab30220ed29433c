//! Reconstruct JavaScript call spans from CPU samples and trace events.
//!
//! CPU profile samples record which JS stack was running at an instant;
//! trace events record durations of browser work. This crate reconciles
//! the two into [`ProfileCall`]s, one per call frame with an inferred
//! start and duration, ready to be drawn as a flame chart.
//!
//! # Modules
//!
//! - [`integrator`] - the single-pass reconstruction over one thread
//! - [`filter`] - which frames are shown (native, runtime, grouped)
//! - [`timeline`] - orders a thread's events and samples and drives the integrator
//! - [`writer`] - writes the calls as a Chrome trace or JSON lines
//!
//! # Example
//!
//! ```no_run
//! use profile_calls::filter::FilterConfig;
//! use profile_calls::timeline::integrate_trace;
//! use profile_calls::writer::{OutputFormat, write_calls};
//! use std::fs::File;
//! use std::io::{BufReader, BufWriter};
//!
//! let input = BufReader::new(File::open("trace.json").unwrap());
//! let output = BufWriter::new(File::create("calls.json").unwrap());
//!
//! let trace = trace_model::parse_trace(input).unwrap();
//! let threads = integrate_trace(&trace, FilterConfig::default()).unwrap();
//! write_calls(&threads, OutputFormat::Trace, output).unwrap();
//! ```

pub mod filter;
pub mod integrator;
pub mod timeline;
pub mod writer;

pub use integrator::{Diagnostic, ProfileCall, SamplesIntegrator};

// Re-export trace_model for convenience
pub use trace_model;

use thiserror::Error;

/// Errors that can occur while reconstructing or writing calls.
#[derive(Error, Debug)]
pub enum CallsError {
    #[error(transparent)]
    Model(#[from] trace_model::ModelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CallsError>;
