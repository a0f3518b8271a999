//! Structured call context for attributing channel failures to an action.
//!
//! The gateway and channel handlers push frames as control enters them; on
//! failure the frames are left in place, so the trace describes the stack at the
//! point of the error. `extract_action` reads the innermost channel method out of it.

use crate::envelope::UNKNOWN_ACTION;

/// Channel plumbing that never counts as the originating action.
pub const INTERNAL_METHODS: &[&str] = &[
    "dispatch_action",
    "perform_action",
    "handle_channel_error",
    "rescue_with_handler",
    "transmit",
    "transmit_error",
    "broadcast",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrigin {
    /// Code belonging to a channel handler.
    Channel,
    /// Gateway / transport plumbing.
    Framework,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrame {
    pub origin: FrameOrigin,
    pub method: Option<String>,
}

impl CallFrame {
    pub fn channel(method: impl Into<String>) -> Self {
        Self {
            origin: FrameOrigin::Channel,
            method: Some(method.into()),
        }
    }

    pub fn framework(method: impl Into<String>) -> Self {
        Self {
            origin: FrameOrigin::Framework,
            method: Some(method.into()),
        }
    }

    /// Frame with no enclosing method (e.g. a block or top-level code).
    pub fn anonymous(origin: FrameOrigin) -> Self {
        Self {
            origin,
            method: None,
        }
    }
}

/// Stack of frames, outermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallTrace {
    frames: Vec<CallFrame>,
}

impl CallTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: CallFrame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<CallFrame> {
        self.frames.pop()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames innermost first.
    pub fn innermost_first(&self) -> impl Iterator<Item = &CallFrame> {
        self.frames.iter().rev()
    }
}

impl FromIterator<CallFrame> for CallTrace {
    fn from_iter<I: IntoIterator<Item = CallFrame>>(iter: I) -> Self {
        Self {
            frames: iter.into_iter().collect(),
        }
    }
}

/// Innermost channel frame with a method outside `INTERNAL_METHODS`, or "unknown".
pub fn extract_action(trace: &CallTrace) -> String {
    trace
        .innermost_first()
        .filter(|f| f.origin == FrameOrigin::Channel)
        .filter_map(|f| f.method.as_deref())
        .find(|m| !INTERNAL_METHODS.contains(m))
        .unwrap_or(UNKNOWN_ACTION)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_internal_frames_yield_unknown() {
        let trace: CallTrace = INTERNAL_METHODS
            .iter()
            .map(|m| CallFrame::channel(*m))
            .collect();
        assert_eq!(extract_action(&trace), "unknown");
        assert_eq!(extract_action(&CallTrace::new()), "unknown");
    }

    #[test]
    fn single_qualifying_frame_is_returned() {
        let trace: CallTrace = [
            CallFrame::framework("receive"),
            CallFrame::channel("dispatch_action"),
            CallFrame::channel("send_alert"),
            CallFrame::framework("to_string"),
        ]
        .into_iter()
        .collect();
        assert_eq!(extract_action(&trace), "send_alert");
    }

    #[test]
    fn innermost_channel_method_wins() {
        let mut trace = CallTrace::new();
        trace.push(CallFrame::channel("speak"));
        trace.push(CallFrame::anonymous(FrameOrigin::Channel));
        trace.push(CallFrame::channel("normalize_body"));
        trace.push(CallFrame::channel("transmit"));
        assert_eq!(extract_action(&trace), "normalize_body");
        trace.pop();
        trace.pop();
        assert_eq!(extract_action(&trace), "speak");
    }

    #[test]
    fn framework_frames_never_qualify() {
        let trace: CallTrace = [CallFrame::framework("send_alert")].into_iter().collect();
        assert_eq!(extract_action(&trace), "unknown");
    }
}
