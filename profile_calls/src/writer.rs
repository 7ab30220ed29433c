//! Write reconstructed calls.
//!
//! Two layouts are supported:
//!
//! - [`OutputFormat::Trace`]: a Chrome trace (`{"traceEvents": [...]}`) with
//!   one complete event per call, named after the function. Loads in any
//!   trace viewer as a flame chart.
//! - [`OutputFormat::Lines`]: newline-delimited JSON records tagged with a
//!   `type` field (`thread`, `call`, `diagnostic`).

use crate::Result;
use crate::timeline::ThreadCalls;
use serde::Serialize;
use std::io::Write;
use trace_model::CallFrame;

const CALL_CATEGORY: &str = "ProfileCall";

/// Output layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Trace,
    Lines,
}

/// Write every thread's calls to `writer` in `format`.
pub fn write_calls<W: Write>(threads: &[ThreadCalls], format: OutputFormat, mut writer: W) -> Result<()> {
    match format {
        OutputFormat::Trace => write_trace(threads, &mut writer),
        OutputFormat::Lines => write_lines(threads, &mut writer),
    }
}

fn write_trace<W: Write>(threads: &[ThreadCalls], writer: &mut W) -> Result<()> {
    write!(writer, "{{\"traceEvents\":[")?;
    let mut first = true;
    for thread in threads {
        for call in &thread.calls {
            if !first {
                write!(writer, ",")?;
            }
            first = false;
            let record = CallEventRecord {
                name: display_name(&call.call_frame),
                cat: CALL_CATEGORY,
                ph: "X",
                pid: call.pid,
                tid: call.tid,
                ts: call.ts,
                dur: call.dur,
                args: CallArgs {
                    data: CallData {
                        node_id: call.node_id,
                        call_frame: &call.call_frame,
                    },
                },
            };
            writeln!(writer)?;
            serde_json::to_writer(&mut *writer, &record)?;
        }
    }
    writeln!(writer, "\n]}}")?;
    Ok(())
}

fn write_lines<W: Write>(threads: &[ThreadCalls], writer: &mut W) -> Result<()> {
    for thread in threads {
        let summary = ThreadRecord {
            pid: thread.pid,
            tid: thread.tid,
            calls: thread.calls.len(),
            diagnostics: thread.diagnostics.len(),
        };
        write_record(writer, "thread", &summary)?;
        for call in &thread.calls {
            write_record(writer, "call", call)?;
        }
        for diagnostic in &thread.diagnostics {
            let record = DiagnosticRecord {
                pid: thread.pid,
                tid: thread.tid,
                diagnostic,
            };
            write_record(writer, "diagnostic", &record)?;
        }
    }
    Ok(())
}

fn write_record<W: Write, T: Serialize>(writer: &mut W, record_type: &str, data: &T) -> Result<()> {
    let mut map = serde_json::to_value(data)?;
    if let serde_json::Value::Object(ref mut obj) = map {
        obj.insert(
            "type".to_string(),
            serde_json::Value::String(record_type.to_string()),
        );
    }
    writeln!(writer, "{}", serde_json::to_string(&map)?)?;
    Ok(())
}

fn display_name(frame: &CallFrame) -> &str {
    if frame.function_name.is_empty() {
        "(anonymous)"
    } else {
        &frame.function_name
    }
}

// ============================================================================
// Serialization records
// ============================================================================

#[derive(Serialize)]
struct CallEventRecord<'a> {
    name: &'a str,
    cat: &'static str,
    ph: &'static str,
    pid: u64,
    tid: u64,
    ts: u64,
    dur: u64,
    args: CallArgs<'a>,
}

#[derive(Serialize)]
struct CallArgs<'a> {
    data: CallData<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CallData<'a> {
    node_id: u64,
    #[serde(flatten)]
    call_frame: &'a CallFrame,
}

#[derive(Serialize)]
struct ThreadRecord {
    pid: u64,
    tid: u64,
    calls: usize,
    diagnostics: usize,
}

#[derive(Serialize)]
struct DiagnosticRecord<'a> {
    pid: u64,
    tid: u64,
    #[serde(flatten)]
    diagnostic: &'a crate::integrator::Diagnostic,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrator::{Diagnostic, ProfileCall};

    fn threads() -> Vec<ThreadCalls> {
        let call = |name: &str, ts: u64, dur: u64| ProfileCall {
            node_id: 2,
            pid: 1,
            tid: 7,
            ts,
            dur,
            self_time: 0,
            call_frame: CallFrame::new(name, "4", "ui.js", 3),
            sample_index: None,
        };
        vec![ThreadCalls {
            pid: 1,
            tid: 7,
            calls: vec![call("onClick", 10, 21), call("", 12, 3)],
            diagnostics: vec![Diagnostic::DeeperThanStack {
                depth: 3,
                stack: 1,
                time: 40,
            }],
        }]
    }

    #[test]
    fn trace_output_is_a_loadable_trace() {
        let mut out = Vec::new();
        write_calls(&threads(), OutputFormat::Trace, &mut out).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        let events = value["traceEvents"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["name"], "onClick");
        assert_eq!(events[0]["ph"], "X");
        assert_eq!(events[0]["dur"], 21);
        assert_eq!(events[0]["args"]["data"]["nodeId"], 2);
        assert_eq!(events[0]["args"]["data"]["url"], "ui.js");
        assert_eq!(events[0]["args"]["data"]["lineNumber"], 3);
        assert_eq!(events[1]["name"], "(anonymous)");
    }

    #[test]
    fn empty_trace_output() {
        let mut out = Vec::new();
        write_calls(&[], OutputFormat::Trace, &mut out).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert!(value["traceEvents"].as_array().unwrap().is_empty());
    }

    #[test]
    fn lines_output_tags_records() {
        let mut out = Vec::new();
        write_calls(&threads(), OutputFormat::Lines, &mut out).unwrap();

        let records: Vec<serde_json::Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        let types: Vec<&str> = records.iter().map(|r| r["type"].as_str().unwrap()).collect();
        assert_eq!(types, vec!["thread", "call", "call", "diagnostic"]);

        assert_eq!(records[0]["calls"], 2);
        assert_eq!(records[1]["ts"], 10);
        assert_eq!(records[1]["callFrame"]["functionName"], "onClick");
        assert_eq!(records[3]["kind"], "deeper_than_stack");
        assert_eq!(records[3]["tid"], 7);
    }
}
