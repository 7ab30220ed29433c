//! The V8 CPU profile: call-stack trie plus the sample stream.
//!
//! [`CpuProfile`] is the serde view of the JSON data (either a standalone
//! `.cpuprofile` or the nodes/samples merged from trace `ProfileChunk`s).
//! [`CpuProfileModel`] is the read-only model built from it: an arena of
//! [`ProfileNode`]s linked to their parents by index, the sample node IDs,
//! and absolute sample timestamps.

use crate::{ModelError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Function name of the node sampled while V8 runs native/unknown code.
pub const PROGRAM_NAME: &str = "(program)";
/// Function name of the node sampled while the thread is idle.
pub const IDLE_NAME: &str = "(idle)";
/// Function name of the node sampled during garbage collection.
pub const GC_NAME: &str = "(garbage collector)";

// ============================================================================
// Serde types
// ============================================================================

/// A V8 CPU profile as serialized by DevTools.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuProfile {
    /// Call tree nodes.
    pub nodes: Vec<CpuProfileNode>,
    /// Profile start time in microseconds.
    #[serde(default)]
    pub start_time: u64,
    /// Profile end time in microseconds.
    #[serde(default)]
    pub end_time: u64,
    /// Node ID of the top of the stack at each sample.
    #[serde(default)]
    pub samples: Vec<u64>,
    /// Time deltas between samples in microseconds.
    #[serde(default)]
    pub time_deltas: Vec<i64>,
}

/// A node as serialized. Standalone profiles link nodes with `children`,
/// trace chunks with `parent`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuProfileNode {
    pub id: u64,
    pub call_frame: CallFrame,
    #[serde(default)]
    pub children: Vec<u64>,
    #[serde(default)]
    pub parent: Option<u64>,
}

/// Information about a call frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    /// Function name.
    pub function_name: String,
    /// Script ID (internal V8 identifier) - can be string or number.
    #[serde(default, deserialize_with = "deserialize_script_id")]
    pub script_id: String,
    /// Script URL.
    #[serde(default)]
    pub url: String,
    /// Line number (0-based, -1 if unknown).
    #[serde(default = "default_line")]
    pub line_number: i64,
    /// Column number (0-based, -1 if unknown).
    #[serde(default = "default_line")]
    pub column_number: i64,
}

impl CallFrame {
    pub fn new(
        function_name: impl Into<String>,
        script_id: impl Into<String>,
        url: impl Into<String>,
        line_number: i64,
    ) -> Self {
        Self {
            function_name: function_name.into(),
            script_id: script_id.into(),
            url: url.into(),
            line_number,
            column_number: -1,
        }
    }
}

fn default_line() -> i64 {
    -1
}

fn deserialize_script_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value: serde_json::Value = Deserialize::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        _ => Err(D::Error::custom("expected string or number for scriptId")),
    }
}

// ============================================================================
// Model
// ============================================================================

/// A node of the call-stack trie. Identifies a call site, not an invocation.
#[derive(Debug, Clone)]
pub struct ProfileNode {
    pub id: u64,
    pub call_frame: CallFrame,
    /// Arena index of the enclosing node; `None` at the root.
    pub parent: Option<usize>,
    /// Distance from the root.
    pub depth: usize,
}

/// Read-only profile model shared by every consumer of one thread's profile.
#[derive(Debug, Clone)]
pub struct CpuProfileModel {
    nodes: Vec<ProfileNode>,
    index_by_id: HashMap<u64, usize>,
    samples: Vec<u64>,
    timestamps: Vec<u64>,
    root: usize,
    program_node: Option<usize>,
    idle_node: Option<usize>,
    gc_node: Option<usize>,
    start_time: u64,
    end_time: u64,
}

impl CpuProfileModel {
    /// Build the model from a parsed profile.
    pub fn new(profile: CpuProfile) -> Result<Self> {
        if profile.nodes.is_empty() {
            return Err(ModelError::InvalidProfile("no nodes in profile".into()));
        }

        let mut index_by_id = HashMap::with_capacity(profile.nodes.len());
        for (idx, node) in profile.nodes.iter().enumerate() {
            if index_by_id.insert(node.id, idx).is_some() {
                return Err(ModelError::InvalidProfile(format!(
                    "duplicate node id {}",
                    node.id
                )));
            }
        }

        let lookup = |id: u64| {
            index_by_id.get(&id).copied().ok_or_else(|| {
                ModelError::InvalidProfile(format!("reference to unknown node {}", id))
            })
        };

        let mut parents: Vec<Option<usize>> = vec![None; profile.nodes.len()];
        for (idx, node) in profile.nodes.iter().enumerate() {
            for &child_id in &node.children {
                parents[lookup(child_id)?] = Some(idx);
            }
            if let Some(parent_id) = node.parent {
                parents[idx] = Some(lookup(parent_id)?);
            }
        }

        let depths = compute_depths(&parents)?;
        let root = parents
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| ModelError::InvalidProfile("profile has no root node".into()))?;

        let nodes: Vec<ProfileNode> = profile
            .nodes
            .into_iter()
            .zip(parents)
            .zip(depths)
            .map(|((node, parent), depth)| ProfileNode {
                id: node.id,
                call_frame: node.call_frame,
                parent,
                depth,
            })
            .collect();

        let find = |name: &str| {
            nodes
                .iter()
                .position(|node| node.call_frame.function_name == name)
        };
        let program_node = find(PROGRAM_NAME);
        let idle_node = find(IDLE_NAME);
        let gc_node = find(GC_NAME);

        let (samples, timestamps) = sample_timestamps(
            profile.samples,
            &profile.time_deltas,
            profile.start_time,
            profile.end_time,
        );
        let end_time = timestamps
            .last()
            .copied()
            .unwrap_or(profile.start_time)
            .max(profile.end_time);

        Ok(Self {
            nodes,
            index_by_id,
            samples,
            timestamps,
            root,
            program_node,
            idle_node,
            gc_node,
            start_time: profile.start_time,
            end_time,
        })
    }

    /// Look up a node by its profile ID.
    pub fn node_by_id(&self, id: u64) -> Option<&ProfileNode> {
        self.index_by_id.get(&id).map(|&idx| &self.nodes[idx])
    }

    /// The leaf node of sample `index`.
    pub fn node_by_index(&self, index: usize) -> Option<&ProfileNode> {
        self.samples
            .get(index)
            .and_then(|&node_id| self.node_by_id(node_id))
    }

    pub fn parent(&self, node: &ProfileNode) -> Option<&ProfileNode> {
        node.parent.map(|idx| &self.nodes[idx])
    }

    /// `node` followed by each of its ancestors up to the root.
    pub fn ancestry<'a>(&'a self, node: &'a ProfileNode) -> impl Iterator<Item = &'a ProfileNode> {
        std::iter::successors(Some(node), move |current| self.parent(current))
    }

    pub fn nodes(&self) -> &[ProfileNode] {
        &self.nodes
    }

    /// Sampled leaf node IDs, ordered by timestamp.
    pub fn samples(&self) -> &[u64] {
        &self.samples
    }

    /// Absolute sample timestamps in microseconds, non-decreasing.
    pub fn timestamps(&self) -> &[u64] {
        &self.timestamps
    }

    pub fn root(&self) -> &ProfileNode {
        &self.nodes[self.root]
    }

    pub fn program_node(&self) -> Option<&ProfileNode> {
        self.program_node.map(|idx| &self.nodes[idx])
    }

    pub fn idle_node(&self) -> Option<&ProfileNode> {
        self.idle_node.map(|idx| &self.nodes[idx])
    }

    pub fn gc_node(&self) -> Option<&ProfileNode> {
        self.gc_node.map(|idx| &self.nodes[idx])
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    pub fn end_time(&self) -> u64 {
        self.end_time
    }
}

fn compute_depths(parents: &[Option<usize>]) -> Result<Vec<usize>> {
    let mut depths: Vec<Option<usize>> = vec![None; parents.len()];
    let mut chain = Vec::new();

    for start in 0..parents.len() {
        let mut current = start;
        // Walk up until a node with a known depth (or the root) is found.
        let base = loop {
            if let Some(depth) = depths[current] {
                break depth + 1;
            }
            chain.push(current);
            if chain.len() > parents.len() {
                return Err(ModelError::InvalidProfile(
                    "cycle in profile node parents".into(),
                ));
            }
            match parents[current] {
                Some(parent) => current = parent,
                None => break 0,
            }
        };
        for (offset, &idx) in chain.iter().rev().enumerate() {
            depths[idx] = Some(base + offset);
        }
        chain.clear();
    }

    Ok(depths.into_iter().map(|d| d.unwrap_or(0)).collect())
}

/// Resolve absolute timestamps for every sample.
///
/// Samples past the end of `time_deltas` are spread evenly up to
/// `end_time`. Out-of-order timestamps are sorted, keeping samples that
/// share a timestamp in their original order.
fn sample_timestamps(
    samples: Vec<u64>,
    time_deltas: &[i64],
    start_time: u64,
    end_time: u64,
) -> (Vec<u64>, Vec<u64>) {
    let mut timestamps = Vec::with_capacity(samples.len());
    let mut current = start_time as i64;
    for &delta in time_deltas.iter().take(samples.len()) {
        current += delta;
        timestamps.push(current.max(0) as u64);
    }

    let missing = samples.len() - timestamps.len();
    if missing > 0 {
        log::debug!("{} samples have no time delta, spacing them evenly", missing);
        let last = timestamps.last().copied().unwrap_or(start_time);
        let step = end_time.saturating_sub(last) / missing as u64;
        for k in 1..=missing as u64 {
            timestamps.push(last + step * k);
        }
    }

    if timestamps.windows(2).all(|w| w[0] <= w[1]) {
        return (samples, timestamps);
    }

    log::debug!("sample timestamps are out of order, sorting");
    let mut pairs: Vec<(u64, u64)> = samples.into_iter().zip(timestamps).collect();
    pairs.sort_by_key(|&(_, ts)| ts);
    pairs.into_iter().unzip()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u64, name: &str, parent: Option<u64>) -> CpuProfileNode {
        CpuProfileNode {
            id,
            call_frame: CallFrame::new(name, "1", "app.js", id as i64),
            children: Vec::new(),
            parent,
        }
    }

    fn standalone() -> &'static str {
        r#"{
            "nodes": [
                {"id": 1, "callFrame": {"functionName": "(root)", "scriptId": 0, "url": ""}, "children": [2, 3, 4]},
                {"id": 2, "callFrame": {"functionName": "(program)", "scriptId": 0, "url": ""}},
                {"id": 3, "callFrame": {"functionName": "(garbage collector)", "scriptId": 0, "url": ""}},
                {"id": 4, "callFrame": {"functionName": "main", "scriptId": "1", "url": "app.js", "lineNumber": 10}, "children": [5]},
                {"id": 5, "callFrame": {"functionName": "work", "scriptId": "1", "url": "app.js", "lineNumber": 20}}
            ],
            "startTime": 1000,
            "endTime": 2000,
            "samples": [4, 5, 3, 5],
            "timeDeltas": [100, 100, 100, 100]
        }"#
    }

    #[test]
    fn builds_arena_from_children() {
        let profile: CpuProfile = serde_json::from_str(standalone()).unwrap();
        let model = CpuProfileModel::new(profile).unwrap();

        assert_eq!(model.root().id, 1);
        assert_eq!(model.program_node().map(|n| n.id), Some(2));
        assert_eq!(model.gc_node().map(|n| n.id), Some(3));
        assert!(model.idle_node().is_none());

        let work = model.node_by_id(5).unwrap();
        assert_eq!(work.depth, 2);
        let names: Vec<&str> = model
            .ancestry(work)
            .map(|n| n.call_frame.function_name.as_str())
            .collect();
        assert_eq!(names, vec!["work", "main", "(root)"]);
    }

    #[test]
    fn timestamps_accumulate_deltas() {
        let profile: CpuProfile = serde_json::from_str(standalone()).unwrap();
        let model = CpuProfileModel::new(profile).unwrap();

        assert_eq!(model.timestamps(), &[1100, 1200, 1300, 1400]);
        assert_eq!(model.node_by_index(2).map(|n| n.id), Some(3));
        assert!(model.node_by_index(9).is_none());
        assert_eq!(model.end_time(), 2000);
    }

    #[test]
    fn builds_arena_from_parent_links() {
        let profile = CpuProfile {
            nodes: vec![
                node(1, "(root)", None),
                node(2, "a", Some(1)),
                node(3, "b", Some(2)),
            ],
            samples: vec![3],
            time_deltas: vec![5],
            ..Default::default()
        };
        let model = CpuProfileModel::new(profile).unwrap();
        let b = model.node_by_id(3).unwrap();
        assert_eq!(b.depth, 2);
        assert_eq!(model.parent(b).map(|n| n.id), Some(2));
    }

    #[test]
    fn out_of_order_samples_are_sorted() {
        let profile = CpuProfile {
            nodes: vec![node(1, "(root)", None), node(2, "a", Some(1)), node(3, "b", Some(1))],
            samples: vec![2, 3, 2],
            time_deltas: vec![10, 5, -3],
            ..Default::default()
        };
        let model = CpuProfileModel::new(profile).unwrap();
        assert_eq!(model.timestamps(), &[10, 12, 15]);
        assert_eq!(model.samples(), &[2, 2, 3]);
    }

    #[test]
    fn missing_deltas_are_spread_to_end_time() {
        let profile = CpuProfile {
            nodes: vec![node(1, "(root)", None)],
            start_time: 0,
            end_time: 100,
            samples: vec![1, 1, 1],
            time_deltas: vec![40],
        };
        let model = CpuProfileModel::new(profile).unwrap();
        assert_eq!(model.timestamps(), &[40, 70, 100]);
    }

    #[test]
    fn rejects_unknown_parent() {
        let profile = CpuProfile {
            nodes: vec![node(1, "(root)", None), node(2, "a", Some(9))],
            ..Default::default()
        };
        assert!(matches!(
            CpuProfileModel::new(profile),
            Err(ModelError::InvalidProfile(_))
        ));
    }

    #[test]
    fn rejects_cycles() {
        let profile = CpuProfile {
            nodes: vec![node(1, "a", Some(2)), node(2, "b", Some(1))],
            ..Default::default()
        };
        assert!(CpuProfileModel::new(profile).is_err());
    }

    #[test]
    fn rejects_empty_profile() {
        assert!(CpuProfileModel::new(CpuProfile::default()).is_err());
    }
}
