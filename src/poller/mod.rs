// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 帧轮询线程 (Frame poller)
///
/// 独立线程循环: 暂停检查 → GET_FRAME → 统计FPS → 推送给UI → 提交人脸分析 → 限速休眠
///
/// Connection loss ends the loop and is reported once through the exit hook;
/// any other per-frame failure is logged and retried after a backoff.
pub mod rate;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::analysis::{self, crop_face, AnalysisPipeline, AnalysisResult, SubmitOutcome};
use crate::cancel::{StopSource, StopToken};
use crate::clock::Clock;
use crate::config::ClientConfig;
use crate::error::{Result, VisionError};
use crate::protocol::{FaceBox, FrameMetadata};
use crate::session::{SessionEvent, SessionState};
use crate::transport::Connection;

pub use rate::RateWindow;

/// 推送给UI的一帧
#[derive(Debug, Clone)]
pub struct FrameUpdate {
    pub metadata: FrameMetadata,
    /// JPEG bytes as received; `None` when the server sent no image
    pub image: Option<Arc<Vec<u8>>>,
    /// Client-observed polls per second over the rolling window
    pub client_fps: Option<f64>,
    pub analysis: Option<Arc<AnalysisResult>>,
    pub analysis_busy: bool,
    pub received_at: Instant,
}

impl FrameUpdate {
    /// Race text to show next to this frame.
    pub fn race_display(&self) -> Option<String> {
        analysis::race_display(&self.metadata, self.analysis.as_deref(), self.analysis_busy)
    }
}

/// 轮询线程退出原因
#[derive(Debug)]
pub enum PollExit {
    Stopped,
    ConnectionLost(VisionError),
}

pub type ExitHook = Box<dyn FnOnce(PollExit) + Send + 'static>;

/// Everything the loop reads. The connection is shared with the controller,
/// which serialises access through the connection's own lock.
pub struct PollerContext {
    pub connection: Arc<Connection>,
    pub state: Arc<SessionState>,
    pub pipeline: Arc<AnalysisPipeline>,
    pub clock: Arc<dyn Clock>,
    pub events: Sender<SessionEvent>,
    pub config: ClientConfig,
}

pub struct FramePoller {
    stop: StopSource,
    // never sent on; disconnects when the thread finishes
    done: Receiver<()>,
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl FramePoller {
    /// 启动轮询线程
    pub fn start(ctx: PollerContext, on_exit: ExitHook) -> Result<Self> {
        let stop = StopSource::new();
        let token = stop.token();
        let (done_tx, done) = bounded::<()>(0);
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let handle = std::thread::Builder::new()
            .name("frame-poller".into())
            .spawn(move || {
                info!(peer = %ctx.connection.peer_addr(), "frame poller started");
                let exit = poll_loop(&ctx, &token);
                flag.store(false, Ordering::Release);
                info!(?exit, "frame poller exited");
                on_exit(exit);
                drop(done_tx);
            })
            .map_err(|source| VisionError::Spawn {
                name: "frame-poller",
                source,
            })?;

        Ok(Self {
            stop,
            done,
            handle: Some(handle),
            running,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Signals the loop and waits up to `timeout` for it to finish. Returns
    /// false if the thread was still blocked (it is detached, and exits once
    /// its pending read fails).
    pub fn stop(mut self, timeout: Duration) -> bool {
        self.stop.stop();
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(?timeout, "frame poller did not stop in time, detaching");
                false
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                true
            }
        }
    }

    /// Signals the loop without waiting. Used from the poller's own thread.
    pub fn detach(mut self) {
        self.stop.stop();
        self.handle.take();
    }
}

fn poll_loop(ctx: &PollerContext, token: &StopToken) -> PollExit {
    let mut window = RateWindow::new(ctx.config.rate_window());
    let mut polled: u64 = 0;

    while !token.is_stopped() {
        if ctx.state.is_paused(ctx.clock.now()) {
            trace!("paused");
            if token.sleep(ctx.config.pause_retry()) {
                break;
            }
            continue;
        }

        match poll_once(ctx, &mut window) {
            Ok(None) => {
                // the pause began while waiting for the link
                if token.sleep(ctx.config.pause_retry()) {
                    break;
                }
                continue;
            }
            Ok(Some(outcome)) => {
                polled += 1;
                if polled % 100 == 0 {
                    debug!(polled, fps = ?window.rate(), "poll stats");
                }
                if outcome == SubmitOutcome::Submitted {
                    debug!(polled, "face crop queued for analysis");
                }
            }
            Err(e) if e.is_fatal() => {
                if token.is_stopped() {
                    break;
                }
                return PollExit::ConnectionLost(e);
            }
            Err(e) => {
                warn!(error = %e, "frame poll failed, backing off");
                let _ = ctx
                    .events
                    .try_send(SessionEvent::Status(format!("Frame error: {}", e)));
                if token.sleep(ctx.config.error_backoff()) {
                    break;
                }
                continue;
            }
        }

        if token.sleep(ctx.config.poll_interval()) {
            break;
        }
    }
    PollExit::Stopped
}

/// 一次轮询: 请求帧, 推送给UI, 然后尝试提交分析。
///
/// `Ok(None)` when the pause deadline was set while waiting for the link.
fn poll_once(ctx: &PollerContext, window: &mut RateWindow) -> Result<Option<SubmitOutcome>> {
    let frame = ctx
        .connection
        .request_frame_if(|| !ctx.state.is_paused(ctx.clock.now()))?;
    let (metadata, image) = match frame {
        Some(frame) => frame,
        None => return Ok(None),
    };
    let now = ctx.clock.now();
    window.record(now);

    if let Some(ref header) = metadata.error {
        debug!(header = %header, "server sent no frame");
    }

    let image = image.map(Arc::new);
    let face = metadata
        .primary_face()
        .filter(|_| metadata.has_face())
        .cloned();

    let update = FrameUpdate {
        metadata,
        image: image.clone(),
        client_fps: window.rate(),
        analysis: ctx.pipeline.snapshot(),
        analysis_busy: ctx.pipeline.is_busy(),
        received_at: now,
    };
    if let Err(TrySendError::Full(_)) = ctx.events.try_send(SessionEvent::Frame(update)) {
        trace!("event queue full, frame dropped");
    }

    Ok(Some(submit_analysis(
        ctx,
        face,
        image.as_deref().map(|v| v.as_slice()),
    )))
}

/// Best effort: a frame that cannot be decoded or cropped is skipped for
/// analysis only, never reported as a poll failure.
fn submit_analysis(
    ctx: &PollerContext,
    face: Option<FaceBox>,
    jpeg: Option<&[u8]>,
) -> SubmitOutcome {
    let (face, jpeg) = match (face, jpeg) {
        (Some(face), Some(jpeg)) => (face, jpeg),
        _ => return SubmitOutcome::NoFace,
    };
    // skip decoding when the slot or the rate limiter would drop the crop anyway
    if let Some(outcome) = ctx.pipeline.blocked_reason() {
        return outcome;
    }

    let frame = match image::load_from_memory(jpeg) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, bytes = jpeg.len(), "frame image undecodable, analysis skipped");
            return SubmitOutcome::Undecodable;
        }
    };
    match crop_face(&frame, &face, ctx.config.face_padding) {
        Some(crop) => ctx.pipeline.try_submit(crop),
        None => {
            debug!(?face, "face box outside image");
            SubmitOutcome::NoFace
        }
    }
}
