//! Drive the [`SamplesIntegrator`] over one thread's timeline.
//!
//! The integrator expects a single time-ordered walk of event starts,
//! samples, and event ends. This module builds that walk: `B`/`E` pairs
//! are folded into complete events, events are sorted parents first, and
//! samples are interleaved with a stack of open events.
//!
//! At one timestamp the walk visits event starts, then samples, then the
//! ends of events that ended at that instant. An event that ends exactly
//! where the next one starts is closed first, so touching siblings never
//! nest.

use crate::filter::FilterConfig;
use crate::integrator::{Diagnostic, ProfileCall, SamplesIntegrator};
use crate::Result;
use serde::Serialize;
use trace_model::{CpuProfileModel, Phase, Trace, TraceEvent};

/// Calls reconstructed for one thread.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadCalls {
    pub pid: u64,
    pub tid: u64,
    pub calls: Vec<ProfileCall>,
    pub diagnostics: Vec<Diagnostic>,
}

/// The duration-bearing events among `events`, sorted by start with
/// longer events first on ties.
///
/// Complete events are kept as they are. Each `E` closes the innermost
/// open `B`; a `B` left open ends at the latest timestamp seen.
pub fn duration_events<'e>(events: impl IntoIterator<Item = &'e TraceEvent>) -> Vec<TraceEvent> {
    let mut complete = Vec::new();
    let mut boundaries: Vec<&TraceEvent> = Vec::new();
    let mut last_ts = 0;

    for event in events {
        last_ts = last_ts.max(event.end());
        if event.name.is_empty() && event.ph != Phase::End {
            continue;
        }
        match event.ph {
            Phase::Complete => complete.push(event.clone()),
            Phase::Begin | Phase::End => boundaries.push(event),
            _ => {}
        }
    }

    boundaries.sort_by_key(|event| event.ts);
    let mut open: Vec<&TraceEvent> = Vec::new();
    for event in boundaries {
        if event.ph == Phase::Begin {
            open.push(event);
            continue;
        }
        match open.pop() {
            Some(begin) => {
                let mut paired = begin.clone();
                paired.ph = Phase::Complete;
                paired.dur = Some(event.ts.saturating_sub(begin.ts));
                complete.push(paired);
            }
            None => log::debug!("end event at {} has no matching begin", event.ts),
        }
    }
    for begin in open {
        log::debug!("begin event '{}' at {} never ended", begin.name, begin.ts);
        let mut paired = begin.clone();
        paired.ph = Phase::Complete;
        paired.dur = Some(last_ts.saturating_sub(begin.ts));
        complete.push(paired);
    }

    complete.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| b.end().cmp(&a.end())));
    complete
}

/// Reconstruct the JS calls of one thread from its profile and events.
///
/// `events` may hold events of any phase in any order; only duration
/// events take part.
pub fn integrate_thread<'e>(
    model: &CpuProfileModel,
    pid: u64,
    tid: u64,
    events: impl IntoIterator<Item = &'e TraceEvent>,
    config: FilterConfig,
) -> ThreadCalls {
    let mut integrator = SamplesIntegrator::new(model, pid, tid, config);
    let samples = integrator.calls_from_profile_samples();
    let events = duration_events(events);

    let mut open: Vec<&TraceEvent> = Vec::new();
    let mut next_events = events.iter().peekable();
    let mut next_samples = samples.iter().peekable();

    loop {
        let event_first = match (next_events.peek(), next_samples.peek()) {
            (Some(event), Some(sample)) => event.ts <= sample.ts,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };

        if event_first {
            let Some(event) = next_events.next() else {
                break;
            };
            close_events(&mut open, &mut integrator, |end| end <= event.ts);
            integrator.on_trace_event_start(event);
            open.push(event);
        } else {
            let Some(sample) = next_samples.next() else {
                break;
            };
            close_events(&mut open, &mut integrator, |end| end < sample.ts);
            integrator.on_profile_call(sample, open.last().copied());
        }
    }
    close_events(&mut open, &mut integrator, |_| true);

    let diagnostics = integrator.diagnostics().to_vec();
    let calls = integrator.into_profile_calls();
    log::info!(
        "thread {}:{}: {} samples, {} events, {} calls",
        pid,
        tid,
        samples.len(),
        events.len(),
        calls.len()
    );
    ThreadCalls {
        pid,
        tid,
        calls,
        diagnostics,
    }
}

/// End open events, innermost first, while `ended` holds for their end.
fn close_events<F>(open: &mut Vec<&TraceEvent>, integrator: &mut SamplesIntegrator<'_>, ended: F)
where
    F: Fn(u64) -> bool,
{
    while let Some(&top) = open.last() {
        if !ended(top.end()) {
            break;
        }
        integrator.on_trace_event_end(top);
        open.pop();
    }
}

/// Reconstruct calls for every profiled thread of a trace.
pub fn integrate_trace(trace: &Trace, config: FilterConfig) -> Result<Vec<ThreadCalls>> {
    let profiles = trace.thread_profiles()?;
    Ok(profiles
        .iter()
        .map(|profile| {
            integrate_thread(
                &profile.model,
                profile.pid,
                profile.tid,
                trace.thread_events(profile.pid, profile.tid),
                config,
            )
        })
        .collect())
}

/// Reconstruct calls for a standalone profile, which has no events.
pub fn integrate_cpu_profile(model: &CpuProfileModel, config: FilterConfig) -> ThreadCalls {
    integrate_thread(model, 0, 0, std::iter::empty(), config)
}
