use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Flags shared by the capture thread, the encode thread and the stop signal
///
/// `started` mirrors kernel streaming (set on stream-on, cleared on
/// stream-off). `looping` is raised when the capture loop begins and may be
/// cleared from any thread, including a signal handler, to ask the loop to
/// finish after the frame it is currently handling. A stop requested before
/// the loop begins is latched in `stop_requested` and honoured on entry.
#[derive(Debug, Default)]
pub struct PipelineState {
    started: AtomicBool,
    looping: AtomicBool,
    stop_requested: AtomicBool,
}

impl PipelineState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::SeqCst)
    }

    /// Request loop termination. Safe to call from a signal handler.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.looping.store(false, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Raise `looping` unless a stop is already pending
    pub(crate) fn begin_loop(&self) -> bool {
        self.looping.store(true, Ordering::SeqCst);
        if self.stop_requested.load(Ordering::SeqCst) {
            self.looping.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// The loop has stopped; a later run starts clean
    pub(crate) fn end_loop(&self) {
        self.looping.store(false, Ordering::SeqCst);
        self.stop_requested.store(false, Ordering::SeqCst);
    }

    pub(crate) fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
    }

    pub(crate) fn set_looping(&self, looping: bool) {
        self.looping.store(looping, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = PipelineState::new();
        assert!(!state.is_started());
        assert!(!state.is_looping());
    }

    #[test]
    fn test_request_stop_from_other_thread() {
        let state = PipelineState::new();
        state.set_looping(true);
        let remote = state.clone();
        std::thread::spawn(move || remote.request_stop())
            .join()
            .unwrap();
        assert!(!state.is_looping());
    }

    #[test]
    fn test_stop_before_loop_is_latched() {
        let state = PipelineState::new();
        state.request_stop();
        assert!(!state.begin_loop());
        assert!(!state.is_looping());

        state.end_loop();
        assert!(!state.is_stop_requested());
        assert!(state.begin_loop());
        assert!(state.is_looping());
    }
}
