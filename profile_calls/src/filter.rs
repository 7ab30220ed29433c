//! Stack-frame filtering applied to every stack before it is merged.
//!
//! Native frames (urls starting with `native `) are hidden unless native
//! functions are shown. V8 runtime frames (`native V8Runtime`) are only
//! shown for the parse/compile groups, and only with runtime call stats
//! enabled. Runs of frames from the same native group collapse into the
//! first frame of the run.

use trace_model::CallFrame;

const NATIVE_URL_PREFIX: &str = "native ";
const NATIVE_RUNTIME_URL: &str = "native V8Runtime";

/// Display options that decide which frames survive filtering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterConfig {
    /// Bypass filtering entirely.
    pub show_all_events: bool,
    /// Keep frames whose url starts with `native `.
    pub show_native_functions: bool,
    /// Keep parse/compile V8 runtime frames.
    pub show_runtime_call_stats: bool,
}

/// Group a V8 runtime function belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeGroup {
    Parse,
    Compile,
}

impl NativeGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            NativeGroup::Parse => "Parse",
            NativeGroup::Compile => "Compile",
        }
    }
}

/// The native group of a runtime function name, if it has one.
pub fn native_group(name: &str) -> Option<NativeGroup> {
    if name.starts_with("Parse") {
        Some(NativeGroup::Parse)
    } else if name.starts_with("Compile") || name.starts_with("Recompile") {
        Some(NativeGroup::Compile)
    } else {
        None
    }
}

pub fn is_native_runtime_frame(frame: &CallFrame) -> bool {
    frame.url == NATIVE_RUNTIME_URL
}

impl FilterConfig {
    /// Whether a V8 runtime function is worth showing.
    pub fn show_native_name(&self, name: &str) -> bool {
        self.show_runtime_call_stats && native_group(name).is_some()
    }

    /// Whether `frame` survives filtering, given the native group of the
    /// last frame kept before it. Updates `previous_group` for the next call.
    ///
    /// Callers walk their stack root first and drop every frame this rejects.
    pub fn keep_frame(&self, frame: &CallFrame, previous_group: &mut Option<NativeGroup>) -> bool {
        if self.show_all_events {
            return true;
        }
        if !self.show_native_functions && frame.url.starts_with(NATIVE_URL_PREFIX) {
            return false;
        }
        let runtime_frame = is_native_runtime_frame(frame);
        if runtime_frame && !self.show_native_name(&frame.function_name) {
            return false;
        }
        let group = if runtime_frame {
            native_group(&frame.function_name)
        } else {
            None
        };
        if let Some(group) = group.filter(|&group| *previous_group == Some(group)) {
            log::trace!(
                "collapsing {} frame {} into the run above it",
                group.as_str(),
                frame.function_name
            );
            return false;
        }
        *previous_group = group;
        true
    }

    /// Filter `stack` in place, keeping the relative order of what remains.
    ///
    /// `frame_of` maps a stack entry to the call frame it owns.
    pub fn filter_stack_frames<T, F>(&self, stack: &mut Vec<T>, frame_of: F)
    where
        F: Fn(&T) -> &CallFrame,
    {
        let mut previous_group = None;
        stack.retain(|entry| self.keep_frame(frame_of(entry), &mut previous_group));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn js(name: &str) -> CallFrame {
        CallFrame::new(name, "1", "app.js", 1)
    }

    fn runtime(name: &str) -> CallFrame {
        CallFrame::new(name, "0", NATIVE_RUNTIME_URL, -1)
    }

    fn native(name: &str) -> CallFrame {
        CallFrame::new(name, "0", "native array.js", -1)
    }

    fn names(stack: &[CallFrame]) -> Vec<&str> {
        stack.iter().map(|f| f.function_name.as_str()).collect()
    }

    fn filtered(config: FilterConfig, mut stack: Vec<CallFrame>) -> Vec<CallFrame> {
        config.filter_stack_frames(&mut stack, |frame| frame);
        stack
    }

    #[test]
    fn groups_runtime_names() {
        assert_eq!(native_group("ParseProgram"), Some(NativeGroup::Parse));
        assert_eq!(native_group("CompileLazy"), Some(NativeGroup::Compile));
        assert_eq!(native_group("RecompileSynchronous"), Some(NativeGroup::Compile));
        assert_eq!(native_group("StackGuard"), None);
        assert_eq!(NativeGroup::Compile.as_str(), "Compile");
    }

    #[test]
    fn native_frames_hidden_by_default() {
        let stack = vec![js("main"), native("sort"), runtime("ParseLazy"), js("cmp")];
        let result = filtered(FilterConfig::default(), stack);
        assert_eq!(names(&result), vec!["main", "cmp"]);
    }

    #[test]
    fn native_functions_shown_without_runtime_stats() {
        let config = FilterConfig {
            show_native_functions: true,
            ..Default::default()
        };
        let stack = vec![js("main"), native("sort"), runtime("ParseLazy"), js("cmp")];
        let result = filtered(config, stack);
        assert_eq!(names(&result), vec!["main", "sort", "cmp"]);
    }

    #[test]
    fn runtime_frames_need_a_group() {
        let config = FilterConfig {
            show_native_functions: true,
            show_runtime_call_stats: true,
            ..Default::default()
        };
        let stack = vec![js("main"), runtime("StackGuard"), runtime("CompileLazy")];
        let result = filtered(config, stack);
        assert_eq!(names(&result), vec!["main", "CompileLazy"]);
    }

    #[test]
    fn same_group_runs_collapse() {
        let config = FilterConfig {
            show_native_functions: true,
            show_runtime_call_stats: true,
            ..Default::default()
        };
        let stack = vec![
            js("main"),
            runtime("ParseProgram"),
            runtime("ParseFunctionLiteral"),
            runtime("CompileLazy"),
            runtime("RecompileSynchronous"),
            js("inner"),
            runtime("ParseLazy"),
        ];
        let result = filtered(config, stack);
        assert_eq!(
            names(&result),
            vec!["main", "ParseProgram", "CompileLazy", "inner", "ParseLazy"]
        );
    }

    #[test]
    fn show_all_events_bypasses_filtering() {
        let config = FilterConfig {
            show_all_events: true,
            ..Default::default()
        };
        let stack = vec![native("sort"), runtime("StackGuard"), runtime("StackGuard")];
        assert_eq!(filtered(config, stack).len(), 3);
    }

    #[test]
    fn filtering_is_idempotent() {
        let stack = vec![
            js("main"),
            runtime("ParseProgram"),
            runtime("ParseLazy"),
            native("sort"),
            runtime("CompileLazy"),
            runtime("Recompile"),
            js("leaf"),
        ];
        let configs = [
            FilterConfig::default(),
            FilterConfig {
                show_native_functions: true,
                show_runtime_call_stats: true,
                ..Default::default()
            },
            FilterConfig {
                show_native_functions: true,
                ..Default::default()
            },
        ];
        for config in configs {
            let once = filtered(config, stack.clone());
            let twice = filtered(config, once.clone());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn filters_index_stacks() {
        let frames = vec![js("main"), native("sort"), runtime("ParseLazy"), js("leaf")];
        let config = FilterConfig {
            show_native_functions: true,
            show_runtime_call_stats: true,
            ..Default::default()
        };
        let mut stack = vec![0usize, 1, 2, 2, 3];
        let mut previous_group = None;
        stack.retain(|&idx| config.keep_frame(&frames[idx], &mut previous_group));
        assert_eq!(stack, vec![0, 1, 2, 3]);
    }

    #[test]
    fn keep_frame_tracks_the_previous_group() {
        let config = FilterConfig {
            show_native_functions: true,
            show_runtime_call_stats: true,
            ..Default::default()
        };
        let mut previous_group = None;
        assert!(config.keep_frame(&runtime("ParseProgram"), &mut previous_group));
        assert_eq!(previous_group, Some(NativeGroup::Parse));
        assert!(!config.keep_frame(&runtime("ParseLazy"), &mut previous_group));
        assert!(config.keep_frame(&js("inner"), &mut previous_group));
        assert_eq!(previous_group, None);
    }
}
