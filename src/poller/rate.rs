// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 滑动窗口帧率统计 (客户端实际收到的FPS)
#[derive(Debug, Clone)]
pub struct RateWindow {
    window: Duration,
    stamps: VecDeque<Instant>,
}

impl RateWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            stamps: VecDeque::with_capacity(64),
        }
    }

    /// Records a completed poll and evicts entries older than the window.
    pub fn record(&mut self, now: Instant) {
        self.stamps.push_back(now);
        while let Some(&front) = self.stamps.front() {
            if now.saturating_duration_since(front) >= self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// `(count - 1) / duration` over the window; `None` until two samples.
    pub fn rate(&self) -> Option<f64> {
        let (first, last) = (self.stamps.front()?, self.stamps.back()?);
        let duration = last.saturating_duration_since(*first).as_secs_f64();
        if self.stamps.len() < 2 || duration <= 0.0 {
            return None;
        }
        Some((self.stamps.len() - 1) as f64 / duration)
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    pub fn clear(&mut self) {
        self.stamps.clear();
    }
}
