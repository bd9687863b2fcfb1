// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// 会话状态快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub tracking: bool,
    pub streaming: bool,
    pub secondary_detection: bool,
    pub pause_until: Option<Instant>,
}

/// Session flags plus the poll pause deadline. Written by the controller,
/// read by the poller once per iteration.
#[derive(Debug, Default)]
pub struct SessionState {
    inner: Mutex<SessionSnapshot>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SessionSnapshot> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 暂停期内禁止发送 GET_FRAME
    pub fn is_paused(&self, now: Instant) -> bool {
        matches!(self.lock().pause_until, Some(deadline) if now < deadline)
    }

    /// Moves the deadline to `deadline`, never earlier than an existing one.
    pub fn pause_until(&self, deadline: Instant) {
        let mut s = self.lock();
        s.pause_until = Some(match s.pause_until {
            Some(current) if current > deadline => current,
            _ => deadline,
        });
    }

    pub fn set_tracking(&self, on: bool) {
        self.lock().tracking = on;
    }

    pub fn set_streaming(&self, on: bool) {
        self.lock().streaming = on;
    }

    pub fn set_secondary_detection(&self, on: bool) {
        self.lock().secondary_detection = on;
    }

    pub fn reset(&self) {
        *self.lock() = SessionSnapshot::default();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        *self.lock()
    }
}
