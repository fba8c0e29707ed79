//! Stack-trace parsing and splicing across the script boundary.
//!
//! The engine reports script frames as text, one frame per line
//! (`    at f2 (test.js:10)`). This module turns that text into [`CallFrame`]
//! records and merges them with the host frames that led into the engine, so
//! a failure reads as one continuous trace from the innermost frame outwards.

use crate::error::ScriptException;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::Location;

/// Function names of the bridge entry points that cross into the engine.
///
/// A native frame carrying one of these names marks the point where script
/// frames are spliced into a host trace.
pub const BOUNDARY_FUNCTIONS: &[&str] = &[
    "ScriptContext::evaluate",
    "ScriptContext::execute",
    "RemoteProxy::call",
];

/// `<ws>* [at] <function> <ws> [(]<file>:<line>[:<column>][)] <trailing>`
static FRAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(at\s+)?([^\s(]+)\s+\(?([^\s()]+):(\d+)(?::\d+)?\)?")
        .expect("frame pattern is valid")
});

/// Which side of the boundary a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FrameOrigin {
    /// Host code
    Host,
    /// Script code running inside the engine
    Script,
}

/// Where a frame's code lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FrameLocation {
    /// A source file and 1-indexed line
    Source {
        /// File name as reported by the runtime
        file: String,
        /// Line number (1-indexed)
        line: u32,
    },
    /// The native call boundary
    Native,
    /// No location is known
    Unknown,
}

/// One entry of a merged host/script stack trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    /// Host or script
    pub origin: FrameOrigin,
    /// Function name
    pub function: String,
    /// Source location or native marker
    pub location: FrameLocation,
}

impl CallFrame {
    /// A host frame at a source location
    pub fn host(function: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            origin: FrameOrigin::Host,
            function: function.into(),
            location: FrameLocation::Source {
                file: file.into(),
                line,
            },
        }
    }

    /// A host frame for a `#[track_caller]` location
    pub fn caller(location: &Location<'_>) -> Self {
        Self::host("<caller>", location.file(), location.line())
    }

    /// A script frame at a source location
    pub fn script(function: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            origin: FrameOrigin::Script,
            function: function.into(),
            location: FrameLocation::Source {
                file: file.into(),
                line,
            },
        }
    }

    /// A native call-boundary frame
    pub fn native(function: impl Into<String>) -> Self {
        Self {
            origin: FrameOrigin::Host,
            function: function.into(),
            location: FrameLocation::Native,
        }
    }

    /// Whether this frame is the native side of a bridge entry point
    pub fn is_boundary(&self) -> bool {
        self.location == FrameLocation::Native
            && BOUNDARY_FUNCTIONS.contains(&self.function.as_str())
    }
}

impl fmt::Display for CallFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            FrameLocation::Source { file, line } => {
                write!(f, "at {} ({}:{})", self.function, file, line)
            }
            FrameLocation::Native => write!(f, "at {} (Native Method)", self.function),
            FrameLocation::Unknown => write!(f, "at {} (Unknown Source)", self.function),
        }
    }
}

/// Parse engine stack text into script frames, innermost first.
///
/// Lines that do not describe a named frame with a `file:line` location are
/// skipped, which drops native and anonymous engine frames.
pub fn parse_stack_trace(text: &str) -> Vec<CallFrame> {
    text.lines()
        .filter_map(|line| {
            let captures = FRAME_PATTERN.captures(line)?;
            // An unnamed `at (file:line)` frame matches with "at" as the name
            if captures.get(1).is_none() && &captures[2] == "at" {
                return None;
            }
            let line_number = captures[4].parse().ok()?;
            Some(CallFrame::script(&captures[2], &captures[3], line_number))
        })
        .collect()
}

/// Split raw error text into the message (first line) and the remainder.
pub fn split_message(raw: &str) -> (&str, &str) {
    match raw.split_once('\n') {
        Some((message, rest)) => (message.trim_end_matches('\r'), rest),
        None => (raw, ""),
    }
}

/// Insert script frames into a host trace directly above the first bridge
/// boundary frame. Without a boundary the script frames are appended.
pub fn splice(host_frames: &[CallFrame], script_frames: Vec<CallFrame>) -> Vec<CallFrame> {
    let at = host_frames
        .iter()
        .position(CallFrame::is_boundary)
        .unwrap_or(host_frames.len());

    let mut merged = Vec::with_capacity(host_frames.len() + script_frames.len());
    merged.extend_from_slice(&host_frames[..at]);
    merged.extend(script_frames);
    merged.extend_from_slice(&host_frames[at..]);
    merged
}

/// Build a script exception from a raw engine error.
///
/// Anything after the first line of `message` is treated as trace text, the
/// same as `stack`.
pub fn wrap(message: &str, stack: &str, host_frames: &[CallFrame]) -> ScriptException {
    let (first_line, rest) = split_message(message);
    let mut script_frames = parse_stack_trace(rest);
    script_frames.extend(parse_stack_trace(stack));
    ScriptException::new(first_line, splice(host_frames, script_frames))
}

/// Render frames one per line, tab-indented.
pub fn render(frames: &[CallFrame]) -> String {
    let mut out = String::new();
    for frame in frames {
        out.push('\t');
        out.push_str(&frame.to_string());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quickjs_stack() {
        let text = "    at f2 (test.js:10)\n    at f1 (test.js:5)\n    at <eval> (test.js:2)\n";
        let frames = parse_stack_trace(text);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], CallFrame::script("f2", "test.js", 10));
        assert_eq!(frames[2].function, "<eval>");
    }

    #[test]
    fn test_parse_skips_native_and_anonymous_frames() {
        let text = "    at print (native)\n    at test.js:4\n    at run (app.js:7:12)\n";
        let frames = parse_stack_trace(text);
        assert_eq!(frames, vec![CallFrame::script("run", "app.js", 7)]);
    }

    #[test]
    fn test_parse_skips_unnamed_frames() {
        let frames = parse_stack_trace("at (a.js:3)\n    at (a.js:4:2)\n    at at (b.js:5)\n");
        assert_eq!(frames, vec![CallFrame::script("at", "b.js", 5)]);
    }

    #[test]
    fn test_parse_bare_grammar() {
        let frames = parse_stack_trace("handler lib.js:42 trailing text");
        assert_eq!(frames, vec![CallFrame::script("handler", "lib.js", 42)]);
    }

    #[test]
    fn test_split_message() {
        assert_eq!(split_message("boom"), ("boom", ""));
        assert_eq!(
            split_message("boom\n    at f (a.js:1)"),
            ("boom", "    at f (a.js:1)")
        );
    }

    #[test]
    fn test_splice_above_boundary() {
        let host = vec![
            CallFrame::native("ScriptContext::evaluate"),
            CallFrame::host("ScriptContext::evaluate", "binder.rs", 10),
            CallFrame::host("<caller>", "main.rs", 3),
        ];
        let script = vec![CallFrame::script("f", "a.js", 1)];
        let merged = splice(&host, script);
        assert_eq!(merged[0].function, "f");
        assert!(merged[1].is_boundary());
        assert_eq!(merged.len(), 4);
    }

    #[test]
    fn test_splice_without_boundary_appends() {
        let host = vec![CallFrame::host("main", "main.rs", 1)];
        let merged = splice(&host, vec![CallFrame::script("f", "a.js", 1)]);
        assert_eq!(merged[0].function, "main");
        assert_eq!(merged[1].origin, FrameOrigin::Script);
    }

    #[test]
    fn test_wrap_uses_first_line_as_message() {
        let err = wrap("TypeError: not a function\n    at g (b.js:3)", "", &[]);
        assert_eq!(err.message(), "TypeError: not a function");
        assert_eq!(err.frames(), &[CallFrame::script("g", "b.js", 3)]);
    }

    #[test]
    fn test_render() {
        let out = render(&[CallFrame::script("f", "a.js", 1), CallFrame::native("RemoteProxy::call")]);
        assert_eq!(out, "\tat f (a.js:1)\n\tat RemoteProxy::call (Native Method)\n");
    }
}
