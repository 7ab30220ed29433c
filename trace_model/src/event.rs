//! Trace events as they appear in the Chrome trace event format.

use serde::{Deserialize, Deserializer};

/// Names of trace events that carry meaning for call reconstruction.
pub struct KnownEventName;

impl KnownEventName {
    pub const RUN_TASK: &'static str = "RunTask";
    pub const RUN_MICROTASKS: &'static str = "RunMicrotasks";
    pub const FUNCTION_CALL: &'static str = "FunctionCall";
    pub const EVALUATE_SCRIPT: &'static str = "EvaluateScript";
    pub const EVALUATE_MODULE: &'static str = "v8.evaluateModule";
    pub const EVENT_DISPATCH: &'static str = "EventDispatch";
    pub const V8_EXECUTE: &'static str = "V8.Execute";
    pub const PROFILE: &'static str = "Profile";
    pub const PROFILE_CHUNK: &'static str = "ProfileChunk";
    pub const CPU_PROFILE: &'static str = "CpuProfile";
}

/// Event phase (the `ph` field).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum Phase {
    Complete,
    Begin,
    End,
    Instant,
    Sample,
    Metadata,
    Other(String),
}

impl From<String> for Phase {
    fn from(ph: String) -> Self {
        match ph.as_str() {
            "X" => Phase::Complete,
            "B" => Phase::Begin,
            "E" => Phase::End,
            "I" | "i" | "n" => Phase::Instant,
            "P" => Phase::Sample,
            "M" => Phase::Metadata,
            _ => Phase::Other(ph),
        }
    }
}

impl Default for Phase {
    fn default() -> Self {
        Phase::Other(String::new())
    }
}

/// A single trace event.
#[derive(Debug, Clone, Deserialize)]
pub struct TraceEvent {
    /// Event name.
    #[serde(default)]
    pub name: String,
    /// Event category.
    #[serde(default)]
    pub cat: String,
    /// Event phase.
    #[serde(default)]
    pub ph: Phase,
    /// Process ID.
    #[serde(default)]
    pub pid: u64,
    /// Thread ID.
    #[serde(default)]
    pub tid: u64,
    /// Timestamp in microseconds.
    #[serde(default, deserialize_with = "deserialize_micros")]
    pub ts: u64,
    /// Duration in microseconds (complete events only).
    #[serde(default, deserialize_with = "deserialize_optional_micros")]
    pub dur: Option<u64>,
    /// Event arguments.
    #[serde(default)]
    pub args: serde_json::Value,
    /// Event ID (for async and profile events) - can be string or number.
    #[serde(default, deserialize_with = "deserialize_optional_string_or_number")]
    pub id: Option<String>,
}

impl TraceEvent {
    /// Build a complete event, mostly useful when synthesizing events.
    pub fn complete(name: impl Into<String>, ts: u64, dur: u64) -> Self {
        Self {
            name: name.into(),
            cat: String::new(),
            ph: Phase::Complete,
            pid: 0,
            tid: 0,
            ts,
            dur: Some(dur),
            args: serde_json::Value::Null,
            id: None,
        }
    }

    /// End timestamp; events without a duration end where they start.
    pub fn end(&self) -> u64 {
        self.ts + self.dur.unwrap_or(0)
    }

    pub fn is_instant(&self) -> bool {
        self.ph == Phase::Instant
    }

    /// The `args.data` object, if any.
    pub fn data(&self) -> Option<&serde_json::Value> {
        self.args.get("data")
    }
}

/// Convert a JSON timestamp to whole microseconds.
pub(crate) fn micros_from_value(value: &serde_json::Value) -> Option<u64> {
    if let Some(v) = value.as_u64() {
        return Some(v);
    }
    let v = value.as_f64()?;
    if v.is_finite() && v >= 0.0 {
        Some(v.round() as u64)
    } else {
        None
    }
}

/// Deserialize a timestamp that can be an integer or a float.
fn deserialize_micros<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value: serde_json::Value = Deserialize::deserialize(deserializer)?;
    match value {
        serde_json::Value::Null => Ok(0),
        other => micros_from_value(&other)
            .ok_or_else(|| D::Error::custom("expected a non-negative number for timestamp")),
    }
}

fn deserialize_optional_micros<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<serde_json::Value> = Deserialize::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(micros_from_value))
}

/// Deserialize an optional field that can be either a string or number.
fn deserialize_optional_string_or_number<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<serde_json::Value> = Deserialize::deserialize(deserializer)?;
    match value {
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(serde_json::Value::Null) | None => Ok(None),
        Some(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_from_letters() {
        assert_eq!(Phase::from("X".to_string()), Phase::Complete);
        assert_eq!(Phase::from("i".to_string()), Phase::Instant);
        assert_eq!(Phase::from("I".to_string()), Phase::Instant);
        assert_eq!(Phase::from("q".to_string()), Phase::Other("q".to_string()));
    }

    #[test]
    fn float_timestamps_are_rounded() {
        let event: TraceEvent = serde_json::from_str(
            r#"{"name": "FunctionCall", "ph": "X", "ts": 10.6, "dur": 2.2, "pid": 1, "tid": 2}"#,
        )
        .unwrap();
        assert_eq!(event.ts, 11);
        assert_eq!(event.dur, Some(2));
        assert_eq!(event.end(), 13);
    }

    #[test]
    fn numeric_ids_become_strings() {
        let event: TraceEvent =
            serde_json::from_str(r#"{"name": "Profile", "ph": "P", "ts": 1, "id": 7}"#).unwrap();
        assert_eq!(event.id.as_deref(), Some("7"));
        assert_eq!(event.ph, Phase::Sample);
    }

    #[test]
    fn missing_fields_default() {
        let event: TraceEvent = serde_json::from_str(r#"{"name": "Mark", "ph": "I"}"#).unwrap();
        assert!(event.is_instant());
        assert_eq!(event.ts, 0);
        assert_eq!(event.dur, None);
        assert!(event.data().is_none());
    }
}
