// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 取消令牌 (Cancellation token)
//!
//! A [`StopSource`] owns the only sender of a zero-capacity channel. Stopping
//! drops it, which disconnects every [`StopToken`] at once; tokens observe that
//! either by polling or while sleeping.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

#[derive(Debug)]
pub struct StopSource {
    tx: Option<Sender<()>>,
    rx: Receiver<()>,
}

#[derive(Debug, Clone)]
pub struct StopToken {
    rx: Receiver<()>,
}

impl StopSource {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self { tx: Some(tx), rx }
    }

    pub fn token(&self) -> StopToken {
        StopToken {
            rx: self.rx.clone(),
        }
    }

    pub fn stop(&mut self) {
        self.tx.take();
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.is_none()
    }
}

impl Default for StopSource {
    fn default() -> Self {
        Self::new()
    }
}

impl StopToken {
    pub fn is_stopped(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleeps for `dur`, waking early on stop. Returns true when stopped.
    pub fn sleep(&self, dur: Duration) -> bool {
        match self.rx.recv_timeout(dur) {
            Err(RecvTimeoutError::Timeout) => false,
            // nobody ever sends, so Ok is unreachable in practice
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}
