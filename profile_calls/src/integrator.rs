//! Reconstruct JS call durations from CPU samples and trace events.
//!
//! Samples say what the JS stack looked like at an instant but carry no
//! duration. The [`SamplesIntegrator`] makes an educated guess of how long
//! each call ran by tracking the current stack while the caller walks the
//! thread's samples and trace events in time order:
//!
//! 1. a sample was taken ([`SamplesIntegrator::on_profile_call`]),
//! 2. a trace event started ([`SamplesIntegrator::on_trace_event_start`]),
//! 3. a trace event ended ([`SamplesIntegrator::on_trace_event_end`]).
//!
//! Each step grows, truncates, or extends the tracked stack. Every frame
//! opened on the stack becomes a [`ProfileCall`] whose duration keeps
//! growing while later samples confirm it is still running.
//!
//! Reconstruction is approximate. Inconsistent input is clamped to the
//! nearest legal state and recorded as a [`Diagnostic`]; it never aborts.

use crate::filter::FilterConfig;
use serde::Serialize;
use std::collections::HashMap;
use trace_model::{CallFrame, CpuProfileModel, KnownEventName, ProfileNode, TraceEvent};

/// One reconstructed JS call: a call frame with a start and a duration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileCall {
    /// ID of the profile node whose call frame this is.
    pub node_id: u64,
    pub pid: u64,
    pub tid: u64,
    /// Start in microseconds.
    pub ts: u64,
    /// Duration in microseconds.
    pub dur: u64,
    /// Always zero here; computed by consumers of the calls.
    pub self_time: u64,
    pub call_frame: CallFrame,
    /// Index of the sample this call was made from, for sample calls.
    #[serde(skip)]
    pub sample_index: Option<usize>,
}

impl ProfileCall {
    /// A zero-duration call for `node` starting at `ts`.
    pub fn new(node: &ProfileNode, ts: u64, pid: u64, tid: u64) -> Self {
        Self {
            node_id: node.id,
            pid,
            tid,
            ts,
            dur: 0,
            self_time: 0,
            call_frame: node.call_frame.clone(),
            sample_index: None,
        }
    }

    pub fn end(&self) -> u64 {
        self.ts + self.dur
    }

    /// Stretch the call so it lasts at least until `time`.
    fn extend_to(&mut self, time: u64) {
        self.dur = self.dur.max(time.saturating_sub(self.ts));
    }
}

/// A recovered inconsistency in the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// A truncation asked to keep fewer frames than an open event locked.
    ShallowerThanLocked { depth: usize, locked: usize, time: u64 },
    /// A truncation asked to keep more frames than the stack holds.
    DeeperThanStack { depth: usize, stack: usize, time: u64 },
}

/// Whether samples are currently attributed to an assumed invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum InvocationState {
    /// Samples are only merged under a JS invocation event.
    #[default]
    Idle,
    /// Samples showed up with nothing on the stack and no invocation event
    /// open, so one is assumed until the next trace event starts.
    Implicit,
}

/// Watermarks of the open trace events.
///
/// Each entry is the stack depth right before an event started. While the
/// event is open, frames below its watermark stay on the stack.
#[derive(Debug, Default)]
struct LockedDepths(Vec<usize>);

impl LockedDepths {
    fn push(&mut self, depth: usize) {
        self.0.push(depth);
    }

    fn pop(&mut self) -> usize {
        self.0.pop().unwrap_or(0)
    }

    fn clear(&mut self) {
        self.0.clear();
    }

    /// Watermark of the innermost open event.
    fn current(&self) -> usize {
        self.0.last().copied().unwrap_or(0)
    }

    /// Clamp a requested truncation depth to `[current, stack_len]`.
    fn clamp(
        &self,
        depth: usize,
        stack_len: usize,
        time: u64,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> usize {
        let mut depth = depth;
        let locked = self.current();
        if depth < locked {
            log::warn!(
                "child stack is shallower ({}) than the parent stack ({}) at {}",
                depth,
                locked,
                time
            );
            diagnostics.push(Diagnostic::ShallowerThanLocked {
                depth,
                locked,
                time,
            });
            depth = locked;
        }
        if depth > stack_len {
            log::warn!(
                "truncating to {} frames, deeper than the current stack ({}) at {}",
                depth,
                stack_len,
                time
            );
            diagnostics.push(Diagnostic::DeeperThanStack {
                depth,
                stack: stack_len,
                time,
            });
            depth = stack_len;
        }
        depth
    }
}

/// What a stack merge reads its new stack from.
enum StackSource<'c> {
    /// The sample's call stack.
    Sample(&'c ProfileCall),
    /// A trace event; its stack is the tracked stack itself.
    Event { ts: u64, end: u64 },
}

/// Reconciles one thread's samples with its trace events.
pub struct SamplesIntegrator<'a> {
    model: &'a CpuProfileModel,
    pid: u64,
    tid: u64,
    config: FilterConfig,
    /// Every call opened so far, bookkeeping frames included.
    calls: Vec<ProfileCall>,
    /// Indices into `calls` of the emitted calls, in output order.
    constructed: Vec<usize>,
    /// Indices into `calls`, root first.
    stack: Vec<usize>,
    locked: LockedDepths,
    invocation: InvocationState,
    /// Sample index of a GC sample -> node of the sample preceding it.
    node_for_gc: HashMap<usize, u64>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> SamplesIntegrator<'a> {
    pub fn new(model: &'a CpuProfileModel, pid: u64, tid: u64, config: FilterConfig) -> Self {
        Self {
            model,
            pid,
            tid,
            config,
            calls: Vec::new(),
            constructed: Vec::new(),
            stack: Vec::new(),
            locked: LockedDepths::default(),
            invocation: InvocationState::Idle,
            node_for_gc: HashMap::new(),
            diagnostics: Vec::new(),
        }
    }

    /// Emitted calls so far, in the order they were opened.
    pub fn constructed_profile_calls(&self) -> Vec<&ProfileCall> {
        self.constructed.iter().map(|&idx| &self.calls[idx]).collect()
    }

    /// Consume the integrator, returning the emitted calls.
    pub fn into_profile_calls(self) -> Vec<ProfileCall> {
        let mut calls: Vec<Option<ProfileCall>> = self.calls.into_iter().map(Some).collect();
        self.constructed
            .iter()
            .filter_map(|&idx| calls[idx].take())
            .collect()
    }

    /// Inconsistencies recovered from so far.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Build one zero-duration call per sample, in sample order.
    ///
    /// These are meant to be merged with the thread's trace events so both
    /// can be walked in time order. GC samples carry no stack of their own,
    /// so the node of the preceding non-GC sample is remembered for them.
    pub fn calls_from_profile_samples(&mut self) -> Vec<ProfileCall> {
        let gc_id = self.model.gc_node().map(|node| node.id);
        let timestamps = self.model.timestamps();
        let mut calls = Vec::with_capacity(timestamps.len());
        let mut previous: Option<u64> = None;

        for (idx, &ts) in timestamps.iter().enumerate() {
            let Some(node) = self.model.node_by_index(idx) else {
                log::debug!("sample {} references an unknown node, skipping", idx);
                continue;
            };
            let mut call = ProfileCall::new(node, ts, self.pid, self.tid);
            call.sample_index = Some(idx);
            calls.push(call);

            if Some(node.id) == gc_id {
                if let Some(previous) = previous {
                    self.node_for_gc.insert(idx, previous);
                }
                continue;
            }
            previous = Some(node.id);
        }

        calls
    }

    pub fn on_trace_event_start(&mut self, event: &TraceEvent) {
        if event.is_instant() {
            return;
        }

        // Top level events are never nested in JS frames.
        if event.name == KnownEventName::RUN_MICROTASKS || event.name == KnownEventName::RUN_TASK {
            self.locked.clear();
            self.truncate(0, event.ts);
            self.invocation = InvocationState::Idle;
        }

        if self.invocation == InvocationState::Implicit {
            let depth = self.locked.pop();
            self.truncate(depth, event.ts);
            self.invocation = InvocationState::Idle;
        }

        self.extract_stack_trace(StackSource::Event {
            ts: event.ts,
            end: event.end(),
        });

        // Frames below this depth outlive the event; frames opened after it
        // are its descendants and are closed when it ends.
        self.locked.push(self.stack.len());
    }

    /// Handle a sample call. `parent` is the innermost open trace event.
    pub fn on_profile_call(&mut self, call: &ProfileCall, parent: Option<&TraceEvent>) {
        let under_invocation = parent.is_some_and(|event| Self::is_js_invocation_event(&event.name));

        if under_invocation || self.invocation == InvocationState::Implicit {
            self.extract_stack_trace(StackSource::Sample(call));
        } else if self.stack.is_empty() {
            // The invocation event may predate the start of tracing.
            self.invocation = InvocationState::Implicit;
            let depth_before = self.stack.len();
            self.extract_stack_trace(StackSource::Sample(call));
            self.locked.push(depth_before);
        }
    }

    pub fn on_trace_event_end(&mut self, event: &TraceEvent) {
        let depth = self.locked.pop();
        self.truncate(depth, event.end());
    }

    /// The filtered call stack of a sample call, root first.
    ///
    /// A GC sample gets the stack of the sample before it, with the GC call
    /// on top. An unknown node yields an empty stack.
    pub fn stack_trace(&self, call: &ProfileCall) -> Vec<ProfileCall> {
        let is_gc = self.model.gc_node().map(|node| node.id) == Some(call.node_id);
        let leaf = if is_gc {
            call.sample_index
                .and_then(|idx| self.node_for_gc.get(&idx))
                .and_then(|&id| self.model.node_by_id(id))
        } else {
            self.model.node_by_id(call.node_id)
        };
        let Some(leaf) = leaf else {
            return Vec::new();
        };

        let mut frames: Vec<ProfileCall> = self
            .model
            .ancestry(leaf)
            .map(|node| ProfileCall::new(node, call.ts, self.pid, self.tid))
            .collect();
        frames.reverse();
        if is_gc {
            frames.push(call.clone());
        }

        self.config
            .filter_stack_frames(&mut frames, |frame| &frame.call_frame);
        frames
    }

    /// Merge a new stack into the tracked one.
    fn extract_stack_trace(&mut self, source: StackSource<'_>) {
        match source {
            StackSource::Event { ts, end } => {
                let config = self.config;
                let calls = &self.calls;
                let mut previous_group = None;
                self.stack
                    .retain(|&idx| config.keep_frame(&calls[idx].call_frame, &mut previous_group));

                let first = self.locked.current();
                for &idx in self.stack.iter().skip(first) {
                    self.calls[idx].extend_to(end);
                }
                let depth = first.max(self.stack.len());
                self.truncate(depth, ts);
            }
            StackSource::Sample(call) => {
                let trace = self.stack_trace(call);
                let end = call.end();
                let shared = trace.len().min(self.stack.len());

                // Frames equal to the tracked ones extend them:
                //
                //   tracked        sample       merged
                //   [----A----]    [A]          [------A-----]
                //   [----B----]    [B]    =>    [------B-----]
                //   [----C----]    [C]          [------C-----]
                let mut depth = self.locked.current();
                while depth < shared {
                    let tracked = &mut self.calls[self.stack[depth]];
                    if !Self::frames_are_equal(&trace[depth].call_frame, &tracked.call_frame) {
                        break;
                    }
                    tracked.extend_to(end);
                    depth += 1;
                }

                // The rest of the tracked stack ends here and the rest of
                // the sample's stack opens on top of the shared frames:
                //
                //   [----C----]    [C]          [------C-----]
                //   [----D----]    [E]    =>    [----D----][E]
                self.truncate(depth, call.ts);
                for new_call in trace.into_iter().skip(depth) {
                    self.open(new_call);
                }
            }
        }
    }

    /// Push a call on the tracked stack, emitting it unless it is a
    /// bookkeeping frame.
    fn open(&mut self, call: ProfileCall) {
        let bookkeeping = call.node_id == self.model.root().id
            || self.model.program_node().map(|node| node.id) == Some(call.node_id)
            || self.model.idle_node().map(|node| node.id) == Some(call.node_id);

        let idx = self.calls.len();
        self.calls.push(call);
        self.stack.push(idx);
        if !bookkeeping {
            self.constructed.push(idx);
        }
    }

    /// Close the tracked stack down to `depth` frames at `time`.
    ///
    /// Every tracked frame is stretched to `time`; the ones above `depth`
    /// are removed and keep that duration.
    fn truncate(&mut self, depth: usize, time: u64) {
        let depth = self
            .locked
            .clamp(depth, self.stack.len(), time, &mut self.diagnostics);
        for &idx in &self.stack {
            self.calls[idx].extend_to(time);
        }
        self.stack.truncate(depth);
    }

    /// Whether an event runs JS, and so parents the samples taken during it.
    pub fn is_js_invocation_event(name: &str) -> bool {
        match name {
            KnownEventName::RUN_MICROTASKS
            | KnownEventName::FUNCTION_CALL
            | KnownEventName::EVALUATE_SCRIPT
            | KnownEventName::EVALUATE_MODULE
            | KnownEventName::EVENT_DISPATCH
            | KnownEventName::V8_EXECUTE => true,
            // Newer V8 events such as `V8.RunMicrotasks` and `v8.run`.
            _ => name.starts_with("v8") || name.starts_with("V8"),
        }
    }

    /// Frames are equal by location, not by node: the profiler may create
    /// distinct nodes for the same call site.
    pub fn frames_are_equal(a: &CallFrame, b: &CallFrame) -> bool {
        a.script_id == b.script_id && a.function_name == b.function_name && a.line_number == b.line_number
    }
}
