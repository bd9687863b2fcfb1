// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 异步分析流水线 (Analysis pipeline)
///
/// 单槽队列 + 常驻工作线程:
/// - 轮询线程: 满足条件时 `try_submit` 人脸裁剪, 队列已满则直接丢弃
/// - 工作线程: 阻塞调用分类引擎 → 写入结果快照
/// - 渲染端: `snapshot()` 无锁读取最近一次结果
///
/// The worker lives as long as the pipeline, not per session; `reset()` only
/// forgets the cached result.
pub mod classifier;
pub mod crop;

use arc_swap::ArcSwapOption;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use image::RgbImage;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ClientConfig;
use crate::protocol::FrameMetadata;

pub use classifier::{Classification, FaceClassifier, HealthStatus, HttpFaceClassifier};
pub use crop::crop_face;

/// Label published when the engine fails on a job
pub const ERROR_LABEL: &str = "Error";

/// 待分析的人脸裁剪
#[derive(Clone, Debug)]
pub struct AnalysisJob {
    pub face: RgbImage,
    pub submitted_at: Instant,
}

/// 最近一次分析结果 (整体替换, 从不原地修改)
#[derive(Clone, Debug, PartialEq)]
pub struct AnalysisResult {
    pub label: String,
    pub at: chrono::DateTime<chrono::Local>,
    pub instant: Instant,
    pub is_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted,
    /// No classification engine configured
    Unavailable,
    /// Frame has no face to crop
    NoFace,
    /// Frame image could not be decoded
    Undecodable,
    /// Worker is classifying a previous crop
    Busy,
    /// A crop is already waiting in the slot
    QueueFull,
    /// Less than the analysis interval since the last submission
    TooSoon,
}

/// Callback run on the worker thread after each published result
pub type ResultHook = Box<dyn Fn(&Arc<AnalysisResult>) + Send + 'static>;

enum WorkerMsg {
    Job { job: AnalysisJob, generation: u64 },
    Shutdown,
}

struct Shared {
    busy: AtomicBool,
    in_flight: AtomicBool,
    generation: AtomicU64,
    latest: ArcSwapOption<AnalysisResult>,
}

pub struct AnalysisPipeline {
    available: bool,
    interval: Duration,
    clock: Arc<dyn Clock>,
    tx: Sender<WorkerMsg>,
    shared: Arc<Shared>,
    last_submit: Mutex<Option<Instant>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AnalysisPipeline {
    /// 创建流水线; 有分类引擎时立即启动工作线程。
    pub fn new(
        classifier: Option<Arc<dyn FaceClassifier>>,
        config: &ClientConfig,
        clock: Arc<dyn Clock>,
        hook: Option<ResultHook>,
    ) -> Self {
        let (tx, rx) = bounded::<WorkerMsg>(1);
        let shared = Arc::new(Shared {
            busy: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            latest: ArcSwapOption::empty(),
        });

        let available = classifier.is_some();
        let worker = classifier.map(|engine| {
            let shared = shared.clone();
            let clock = clock.clone();
            let poll = config.analysis_poll();
            std::thread::Builder::new()
                .name("analysis-worker".into())
                .spawn(move || worker_loop(rx, engine, shared, clock, poll, hook))
        });

        let worker = match worker {
            Some(Ok(handle)) => Some(handle),
            Some(Err(e)) => {
                warn!(error = %e, "cannot spawn analysis worker, analysis disabled");
                None
            }
            None => {
                info!("no classification engine, analysis disabled");
                None
            }
        };

        Self {
            available: available && worker.is_some(),
            interval: config.analysis_interval(),
            clock,
            tx,
            shared,
            last_submit: Mutex::new(None),
            worker: Mutex::new(worker),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// True while the worker is inside the classification call.
    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }

    /// Pending slot depth: 0 or 1.
    pub fn queue_len(&self) -> usize {
        self.tx.len()
    }

    /// Why a submission right now would be dropped, if it would.
    ///
    /// Lets the caller skip decoding and cropping a frame that cannot be
    /// queued anyway; `try_submit` repeats the check.
    pub fn blocked_reason(&self) -> Option<SubmitOutcome> {
        if !self.available {
            return Some(SubmitOutcome::Unavailable);
        }
        if let Some(outcome) = self.check_slot() {
            return Some(outcome);
        }
        let last = *self.last_submit.lock().unwrap_or_else(|e| e.into_inner());
        self.too_soon(last, self.clock.now())
    }

    fn too_soon(&self, last: Option<Instant>, now: Instant) -> Option<SubmitOutcome> {
        match last {
            Some(prev) if now.saturating_duration_since(prev) <= self.interval => {
                Some(SubmitOutcome::TooSoon)
            }
            _ => None,
        }
    }

    /// 非阻塞提交; 不满足条件时丢弃并返回原因。
    pub fn try_submit(&self, face: RgbImage) -> SubmitOutcome {
        if !self.available {
            return SubmitOutcome::Unavailable;
        }
        if let Some(outcome) = self.check_slot() {
            return outcome;
        }

        let now = self.clock.now();
        let mut last = self.last_submit.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(outcome) = self.too_soon(*last, now) {
            return outcome;
        }

        if self
            .shared
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return self.check_slot().unwrap_or(SubmitOutcome::QueueFull);
        }

        let msg = WorkerMsg::Job {
            job: AnalysisJob {
                face,
                submitted_at: now,
            },
            generation: self.shared.generation.load(Ordering::Acquire),
        };
        match self.tx.try_send(msg) {
            Ok(()) => {
                *last = Some(now);
                debug!("analysis job submitted");
                SubmitOutcome::Submitted
            }
            Err(TrySendError::Full(_)) => {
                self.shared.in_flight.store(false, Ordering::Release);
                SubmitOutcome::QueueFull
            }
            Err(TrySendError::Disconnected(_)) => {
                self.shared.in_flight.store(false, Ordering::Release);
                SubmitOutcome::Unavailable
            }
        }
    }

    fn check_slot(&self) -> Option<SubmitOutcome> {
        if self.is_busy() {
            Some(SubmitOutcome::Busy)
        } else if self.shared.in_flight.load(Ordering::Acquire) || self.tx.is_full() {
            Some(SubmitOutcome::QueueFull)
        } else {
            None
        }
    }

    /// 读取最近一次结果快照 (不阻塞工作线程)
    pub fn snapshot(&self) -> Option<Arc<AnalysisResult>> {
        self.shared.latest.load_full()
    }

    /// Forgets the cached result and the rate limiter. A job still running
    /// from before the reset is classified but not published.
    pub fn reset(&self) {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        self.shared.latest.store(None);
        *self.last_submit.lock().unwrap_or_else(|e| e.into_inner()) = None;
        debug!("analysis cache cleared");
    }

    /// 发送毒丸并等待工作线程退出
    pub fn shutdown(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            // the slot may hold a pending job; the worker drains it first
            if self
                .tx
                .send_timeout(WorkerMsg::Shutdown, Duration::from_secs(5))
                .is_err()
            {
                warn!("analysis worker did not accept shutdown, detaching");
                return;
            }
            let _ = handle.join();
            info!("analysis worker stopped");
        }
    }
}

impl Drop for AnalysisPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    rx: Receiver<WorkerMsg>,
    engine: Arc<dyn FaceClassifier>,
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
    poll: Duration,
    hook: Option<ResultHook>,
) {
    info!("analysis worker started");
    loop {
        let (job, generation) = match rx.recv_timeout(poll) {
            Ok(WorkerMsg::Job { job, generation }) => (job, generation),
            Ok(WorkerMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => continue,
        };

        shared.busy.store(true, Ordering::Release);
        let start = Instant::now();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| engine.classify(&job.face)));
        let (label, is_error) = match outcome {
            Ok(Ok(classification)) => (classification.label(), false),
            Ok(Err(e)) => {
                warn!(error = %e, "classification failed");
                (ERROR_LABEL.to_string(), true)
            }
            Err(_) => {
                warn!("classification engine panicked");
                (ERROR_LABEL.to_string(), true)
            }
        };

        if generation == shared.generation.load(Ordering::Acquire) {
            let result = Arc::new(AnalysisResult {
                label,
                at: chrono::Local::now(),
                instant: clock.now(),
                is_error,
            });
            info!(
                label = %result.label,
                ms = start.elapsed().as_millis() as u64,
                "analysis result"
            );
            shared.latest.store(Some(result.clone()));
            if let Some(ref hook) = hook {
                hook(&result);
            }
        } else {
            debug!("discarding result from before reset");
        }

        // cleared before busy so a finished job never reads as still queued
        shared.in_flight.store(false, Ordering::Release);
        shared.busy.store(false, Ordering::Release);
    }
    info!("analysis worker exited");
}

/// 人种显示优先级: 异步结果 > 分析中 > 服务端PFAGR估计
///
/// The async result wins even when it is older than the frame on screen.
pub fn race_display(
    metadata: &FrameMetadata,
    snapshot: Option<&AnalysisResult>,
    busy: bool,
) -> Option<String> {
    if let Some(result) = snapshot {
        return Some(result.label.clone());
    }
    if busy {
        return Some("analyzing...".to_string());
    }
    metadata.server_race()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{Result, VisionError};
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    /// Engine that blocks until released, counts calls, and fails on demand.
    struct GateEngine {
        gate: Receiver<()>,
        calls: AtomicUsize,
        fail_first: bool,
    }

    impl FaceClassifier for GateEngine {
        fn classify(&self, _face: &RgbImage) -> Result<Classification> {
            let _ = self.gate.recv_timeout(Duration::from_secs(5));
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(VisionError::Analysis("model exploded".into()));
            }
            let scores: BTreeMap<String, f32> = [("asian".to_string(), 87.0)].into_iter().collect();
            Ok(Classification::from_scores(scores).unwrap())
        }
    }

    fn face() -> RgbImage {
        RgbImage::new(8, 8)
    }

    fn fast_config() -> ClientConfig {
        ClientConfig {
            analysis_poll_ms: 10,
            ..ClientConfig::default()
        }
    }

    fn wait_until(mut f: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn pipeline(fail_first: bool) -> (AnalysisPipeline, Sender<()>, Arc<ManualClock>) {
        let (gate_tx, gate_rx) = bounded(16);
        let engine = Arc::new(GateEngine {
            gate: gate_rx,
            calls: AtomicUsize::new(0),
            fail_first,
        });
        let clock = Arc::new(ManualClock::new());
        let p = AnalysisPipeline::new(Some(engine), &fast_config(), clock.clone(), None);
        (p, gate_tx, clock)
    }

    #[test]
    fn test_unavailable_without_engine() {
        let p = AnalysisPipeline::new(None, &fast_config(), Arc::new(ManualClock::new()), None);
        assert!(!p.is_available());
        assert_eq!(p.try_submit(face()), SubmitOutcome::Unavailable);
        assert!(p.snapshot().is_none());
    }

    #[test]
    fn test_single_slot_drops_excess() {
        let (p, gate, clock) = pipeline(false);

        assert_eq!(p.try_submit(face()), SubmitOutcome::Submitted);
        wait_until(|| p.is_busy());

        clock.advance(Duration::from_secs(6));
        assert_eq!(p.try_submit(face()), SubmitOutcome::Busy);
        assert!(p.queue_len() <= 1);

        gate.send(()).unwrap();
        wait_until(|| p.snapshot().is_some() && !p.is_busy());
        assert_eq!(p.snapshot().unwrap().label, "Asian (87%)");
    }

    #[test]
    fn test_rate_limited() {
        let (p, gate, clock) = pipeline(false);
        gate.send(()).unwrap();

        assert_eq!(p.try_submit(face()), SubmitOutcome::Submitted);
        wait_until(|| p.snapshot().is_some() && !p.is_busy());

        clock.advance(Duration::from_secs(1));
        assert_eq!(p.blocked_reason(), Some(SubmitOutcome::TooSoon));
        assert_eq!(p.try_submit(face()), SubmitOutcome::TooSoon);

        clock.advance(Duration::from_secs(5));
        gate.send(()).unwrap();
        assert_eq!(p.try_submit(face()), SubmitOutcome::Submitted);
    }

    #[test]
    fn test_worker_survives_engine_failure() {
        let (p, gate, clock) = pipeline(true);
        gate.send(()).unwrap();
        gate.send(()).unwrap();

        assert_eq!(p.try_submit(face()), SubmitOutcome::Submitted);
        wait_until(|| p.snapshot().map(|r| r.is_error).unwrap_or(false) && !p.is_busy());
        assert_eq!(p.snapshot().unwrap().label, ERROR_LABEL);

        clock.advance(Duration::from_secs(6));
        assert_eq!(p.try_submit(face()), SubmitOutcome::Submitted);
        wait_until(|| p.snapshot().map(|r| !r.is_error).unwrap_or(false));
        assert_eq!(p.snapshot().unwrap().label, "Asian (87%)");
    }

    #[test]
    fn test_reset_discards_in_flight_result() {
        let (p, gate, _clock) = pipeline(false);

        assert_eq!(p.try_submit(face()), SubmitOutcome::Submitted);
        wait_until(|| p.is_busy());
        p.reset();
        gate.send(()).unwrap();
        wait_until(|| !p.is_busy() && p.queue_len() == 0);

        assert!(p.snapshot().is_none());
        // rate limiter was reset too
        gate.send(()).unwrap();
        wait_until(|| !p.shared.in_flight.load(Ordering::Acquire));
        assert_eq!(p.try_submit(face()), SubmitOutcome::Submitted);
    }

    #[test]
    fn test_race_display_precedence() {
        let mut meta = FrameMetadata::default();
        meta.race = Some("Mongoloid".into());
        meta.race_score = Some(512.0);

        assert_eq!(race_display(&meta, None, false).as_deref(), Some("Mongoloid (512)"));
        assert_eq!(race_display(&meta, None, true).as_deref(), Some("analyzing..."));

        let cached = AnalysisResult {
            label: "Asian (87%)".into(),
            at: chrono::Local::now(),
            instant: Instant::now(),
            is_error: false,
        };
        assert_eq!(
            race_display(&meta, Some(&cached), true).as_deref(),
            Some("Asian (87%)")
        );
        assert!(race_display(&FrameMetadata::default(), None, false).is_none());
    }

    #[test]
    fn test_shutdown_joins_worker() {
        let (p, _gate, _clock) = pipeline(false);
        p.shutdown();
        assert!(p.worker.lock().unwrap().is_none());
        // second shutdown is a no-op
        p.shutdown();
    }
}
