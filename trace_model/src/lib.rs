//! Chrome trace and V8 CPU profile model.
//!
//! This library parses Chrome DevTools Performance traces and standalone
//! `.cpuprofile` files from any `Read`-able source and exposes the two
//! streams call reconstruction works on: the trace events and, per thread,
//! the CPU profile model (call-stack trie plus timestamped samples).
//!
//! # Example
//!
//! ```no_run
//! use std::fs::File;
//! use trace_model::parse_trace;
//!
//! let file = File::open("trace.json").unwrap();
//! let trace = parse_trace(file).unwrap();
//!
//! for profile in trace.thread_profiles().unwrap() {
//!     println!("{}:{} {} samples", profile.pid, profile.tid, profile.model.samples().len());
//! }
//! ```

pub mod cpu_profile;
pub mod event;

pub use cpu_profile::{CallFrame, CpuProfile, CpuProfileModel, CpuProfileNode, ProfileNode};
pub use event::{KnownEventName, Phase, TraceEvent};

use flate2::read::GzDecoder;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while loading a trace or profile.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid profile: {0}")]
    InvalidProfile(String),

    #[error("no CPU profile data found in trace")]
    NoCpuProfile,
}

/// Result type for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;

// ============================================================================
// Trace file
// ============================================================================

/// Object form of a trace file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TraceFile {
    trace_events: Vec<TraceEvent>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

/// A loaded Chrome Performance trace.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    /// Events in file order.
    pub events: Vec<TraceEvent>,
    /// Optional metadata object.
    pub metadata: Option<serde_json::Value>,
}

/// The CPU profile recorded for one thread of a trace.
#[derive(Debug, Clone)]
pub struct ThreadProfile {
    pub pid: u64,
    pub tid: u64,
    /// Profile ID shared by the `Profile` and `ProfileChunk` events.
    pub id: Option<String>,
    pub model: CpuProfileModel,
}

/// Kind of input detected from the top-level JSON shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Performance trace (object with `traceEvents` or a bare event array).
    Trace,
    /// Standalone `.cpuprofile`.
    CpuProfile,
}

/// A parsed input of either kind.
#[derive(Debug, Clone)]
pub enum Input {
    Trace(Trace),
    CpuProfile(CpuProfileModel),
}

/// Detect the input kind from its parsed JSON value.
pub fn detect_input_kind(value: &serde_json::Value) -> Result<InputKind> {
    if value.is_array() || value.get("traceEvents").is_some() {
        Ok(InputKind::Trace)
    } else if value.get("nodes").is_some() {
        Ok(InputKind::CpuProfile)
    } else {
        Err(ModelError::InvalidProfile(
            "unrecognized format: expected 'traceEvents' or 'nodes' field".into(),
        ))
    }
}

/// Parse either a trace or a standalone cpuprofile.
pub fn parse_input<R: Read>(reader: R) -> Result<Input> {
    let value = read_json(reader)?;
    match detect_input_kind(&value)? {
        InputKind::Trace => Ok(Input::Trace(trace_from_value(value)?)),
        InputKind::CpuProfile => {
            let profile: CpuProfile = serde_json::from_value(value)?;
            Ok(Input::CpuProfile(CpuProfileModel::new(profile)?))
        }
    }
}

/// Open an input file for parsing, decompressing it when it ends in `.gz`.
pub fn open_input(path: &Path) -> Result<Box<dyn Read>> {
    let reader = BufReader::new(File::open(path)?);
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(GzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

/// Parse a Chrome Performance trace.
pub fn parse_trace<R: Read>(reader: R) -> Result<Trace> {
    let value = read_json(reader)?;
    match detect_input_kind(&value)? {
        InputKind::Trace => trace_from_value(value),
        InputKind::CpuProfile => Err(ModelError::InvalidProfile(
            "expected a trace, found a standalone cpuprofile".into(),
        )),
    }
}

/// Parse a standalone `.cpuprofile`.
pub fn parse_cpu_profile<R: Read>(reader: R) -> Result<CpuProfileModel> {
    let profile: CpuProfile = serde_json::from_reader(BufReader::new(reader))?;
    CpuProfileModel::new(profile)
}

fn read_json<R: Read>(reader: R) -> Result<serde_json::Value> {
    let mut contents = String::new();
    BufReader::new(reader).read_to_string(&mut contents)?;
    Ok(serde_json::from_str(&contents)?)
}

fn trace_from_value(value: serde_json::Value) -> Result<Trace> {
    if value.is_array() {
        let events: Vec<TraceEvent> = serde_json::from_value(value)?;
        return Ok(Trace {
            events,
            metadata: None,
        });
    }
    let file: TraceFile = serde_json::from_value(value)?;
    Ok(Trace {
        events: file.trace_events,
        metadata: file.metadata,
    })
}

// ============================================================================
// Profile extraction
// ============================================================================

/// `args.data` of a `ProfileChunk` event.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileChunkData {
    #[serde(default)]
    cpu_profile: Option<ProfileChunkCpuProfile>,
    #[serde(default)]
    time_deltas: Vec<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileChunkCpuProfile {
    #[serde(default)]
    nodes: Vec<CpuProfileNode>,
    #[serde(default)]
    samples: Vec<u64>,
}

/// Chunks collected so far for one `(pid, profile id)`.
struct PendingProfile {
    pid: u64,
    tid: u64,
    id: Option<String>,
    start_time: Option<u64>,
    profile: CpuProfile,
    last_ts: u64,
}

impl Trace {
    /// Events recorded on one thread, in file order.
    pub fn thread_events(&self, pid: u64, tid: u64) -> impl Iterator<Item = &TraceEvent> {
        self.events
            .iter()
            .filter(move |event| event.pid == pid && event.tid == tid)
    }

    /// Assemble the CPU profile of every profiled thread.
    ///
    /// `Profile` and `ProfileChunk` events are grouped by process and
    /// profile ID. The thread is taken from the `Profile` event. Legacy
    /// `CpuProfile` events holding a complete profile are accepted too.
    ///
    /// A thread whose profile cannot be modelled, for example because chunks
    /// were dropped and nodes reference missing parents, is skipped with a
    /// warning. Only a trace with no usable profile at all is an error.
    pub fn thread_profiles(&self) -> Result<Vec<ThreadProfile>> {
        let mut pending: Vec<PendingProfile> = Vec::new();
        let mut complete: Vec<ThreadProfile> = Vec::new();

        for event in &self.events {
            match event.name.as_str() {
                KnownEventName::PROFILE => {
                    let entry = pending_entry(&mut pending, event);
                    entry.tid = event.tid;
                    entry.start_time = event
                        .data()
                        .and_then(|data| data.get("startTime"))
                        .and_then(crate::event::micros_from_value)
                        .or(Some(event.ts));
                }
                KnownEventName::PROFILE_CHUNK => {
                    let Some(data) = event.data() else {
                        continue;
                    };
                    let chunk: ProfileChunkData = match serde_json::from_value(data.clone()) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            log::debug!("skipping malformed ProfileChunk at {}: {}", event.ts, e);
                            continue;
                        }
                    };
                    let entry = pending_entry(&mut pending, event);
                    if let Some(cpu_profile) = chunk.cpu_profile {
                        entry.profile.nodes.extend(cpu_profile.nodes);
                        entry.profile.samples.extend(cpu_profile.samples);
                    }
                    entry.profile.time_deltas.extend(chunk.time_deltas);
                    entry.last_ts = entry.last_ts.max(event.ts);
                }
                KnownEventName::CPU_PROFILE => {
                    let Some(data) = event.data().and_then(|data| data.get("cpuProfile")) else {
                        continue;
                    };
                    let profile: CpuProfile = match serde_json::from_value(data.clone()) {
                        Ok(profile) => profile,
                        Err(e) => {
                            log::warn!(
                                "skipping malformed CpuProfile of {}:{}: {}",
                                event.pid,
                                event.tid,
                                e
                            );
                            continue;
                        }
                    };
                    push_thread_profile(&mut complete, event.pid, event.tid, event.id.clone(), profile);
                }
                _ => {}
            }
        }

        for entry in pending {
            if entry.profile.nodes.is_empty() {
                log::debug!(
                    "profile {:?} of {}:{} has no nodes, skipping",
                    entry.id,
                    entry.pid,
                    entry.tid
                );
                continue;
            }
            let start_time = entry.start_time.unwrap_or(0);
            let profile = CpuProfile {
                start_time,
                end_time: entry.last_ts.max(start_time),
                ..entry.profile
            };
            push_thread_profile(&mut complete, entry.pid, entry.tid, entry.id, profile);
        }

        if complete.is_empty() {
            return Err(ModelError::NoCpuProfile);
        }
        Ok(complete)
    }
}

fn push_thread_profile(
    complete: &mut Vec<ThreadProfile>,
    pid: u64,
    tid: u64,
    id: Option<String>,
    profile: CpuProfile,
) {
    match CpuProfileModel::new(profile) {
        Ok(model) => complete.push(ThreadProfile { pid, tid, id, model }),
        Err(e) => log::warn!("skipping profile {:?} of {}:{}: {}", id, pid, tid, e),
    }
}

fn pending_entry<'a>(pending: &'a mut Vec<PendingProfile>, event: &TraceEvent) -> &'a mut PendingProfile {
    let position = pending
        .iter()
        .position(|p| p.pid == event.pid && p.id == event.id);
    let idx = match position {
        Some(idx) => idx,
        None => {
            pending.push(PendingProfile {
                pid: event.pid,
                tid: event.tid,
                id: event.id.clone(),
                start_time: None,
                profile: CpuProfile::default(),
                last_ts: 0,
            });
            pending.len() - 1
        }
    };
    &mut pending[idx]
}
