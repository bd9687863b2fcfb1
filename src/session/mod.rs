// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 会话控制器 (Session controller)
///
/// 对外暴露追踪/拍照/PFAGR等操作, 每个操作映射为一次或多次协议交互,
/// 并负责轮询线程与分析流水线的生命周期。
///
/// Events for the UI go out on a bounded crossbeam channel with `try_send`;
/// a slow consumer loses frames, never stalls the network thread.
pub mod state;

use crossbeam_channel::Sender;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

use crate::analysis::{AnalysisPipeline, AnalysisResult, FaceClassifier, ResultHook};
use crate::clock::Clock;
use crate::config::ClientConfig;
use crate::error::{Result, VisionError};
use crate::poller::{FramePoller, FrameUpdate, PollExit, PollerContext};
use crate::protocol::{Command, ServerStatus};
use crate::transport::Connection;

pub use state::{SessionSnapshot, SessionState};

/// 发给UI的事件
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected(SocketAddr),
    Disconnected,
    Frame(FrameUpdate),
    Analysis(Arc<AnalysisResult>),
    Status(String),
    PhotoCaptured(Arc<Vec<u8>>),
    PhotoFailed(String),
    ConnectionLost(String),
}

/// Operations that can be run off the caller's thread with
/// [`SessionController::spawn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOp {
    Connect(Option<String>),
    Disconnect,
    StartTracking,
    StopTracking,
    EnableSecondaryDetection,
    DisableSecondaryDetection,
    CapturePhoto,
    QueryStatus,
    EndSession,
}

impl fmt::Display for SessionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionOp::Connect(_) => "connect",
            SessionOp::Disconnect => "disconnect",
            SessionOp::StartTracking => "start tracking",
            SessionOp::StopTracking => "stop tracking",
            SessionOp::EnableSecondaryDetection => "enable PFAGR",
            SessionOp::DisableSecondaryDetection => "disable PFAGR",
            SessionOp::CapturePhoto => "capture photo",
            SessionOp::QueryStatus => "status",
            SessionOp::EndSession => "end session",
        };
        f.write_str(name)
    }
}

struct Inner {
    config: ClientConfig,
    clock: Arc<dyn Clock>,
    events: Sender<SessionEvent>,
    state: Arc<SessionState>,
    pipeline: Arc<AnalysisPipeline>,
    connection: Mutex<Option<Arc<Connection>>>,
    poller: Mutex<Option<FramePoller>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    /// 创建控制器; 分析工作线程随之启动并常驻。
    pub fn new(
        config: ClientConfig,
        classifier: Option<Arc<dyn FaceClassifier>>,
        clock: Arc<dyn Clock>,
        events: Sender<SessionEvent>,
    ) -> Self {
        let hook_tx = events.clone();
        let hook: ResultHook = Box::new(move |result| {
            let _ = hook_tx.try_send(SessionEvent::Analysis(result.clone()));
        });
        let pipeline = Arc::new(AnalysisPipeline::new(
            classifier,
            &config,
            clock.clone(),
            Some(hook),
        ));

        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                events,
                state: Arc::new(SessionState::new()),
                pipeline,
                connection: Mutex::new(None),
                poller: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn pipeline(&self) -> &AnalysisPipeline {
        &self.inner.pipeline
    }

    pub fn state(&self) -> SessionSnapshot {
        self.inner.state.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.connection)
            .as_ref()
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    pub fn is_streaming(&self) -> bool {
        lock(&self.inner.poller)
            .as_ref()
            .map(|p| p.is_running())
            .unwrap_or(false)
    }

    fn emit(&self, event: SessionEvent) {
        if self.inner.events.try_send(event).is_err() {
            debug!("event queue full or closed, event dropped");
        }
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        lock(&self.inner.connection)
            .clone()
            .filter(|c| c.is_connected())
            .ok_or(VisionError::NotConnected)
    }

    /// Runs `f` on the live connection; a fatal error tears the session down.
    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.connection()?;
        let result = f(&conn);
        if let Err(ref e) = result {
            if e.is_fatal() {
                self.connection_lost(&conn, e, false);
            }
        }
        result
    }

    // ========== 连接管理 ==========

    /// 连接机器人; `addr` 缺省时使用配置中的 host:port。
    pub fn connect(&self, addr: Option<&str>) -> Result<SocketAddr> {
        if let Ok(conn) = self.connection() {
            info!(peer = %conn.peer_addr(), "already connected");
            return Ok(conn.peer_addr());
        }

        let addr = addr
            .map(str::to_string)
            .unwrap_or_else(|| self.inner.config.address());
        let conn = Connection::connect(
            &addr,
            self.inner.config.connect_timeout(),
            self.inner.config.read_timeout(),
        )?;
        let peer = conn.peer_addr();

        self.inner.state.reset();
        *lock(&self.inner.connection) = Some(Arc::new(conn));
        self.emit(SessionEvent::Connected(peer));
        Ok(peer)
    }

    /// 断开连接 (不发送 STOP_TRACKING)
    pub fn disconnect(&self) {
        self.close(false);
    }

    /// 结束会话: 停止轮询, 清空分析缓存, 追踪中则先 STOP_TRACKING, 再 QUIT。
    pub fn end_session(&self) {
        self.close(true);
    }

    fn close(&self, stop_tracking: bool) {
        // a poller that missed the join deadline still holds the link in a read
        let poller_stopped = self.stop_poller();
        self.inner.pipeline.reset();

        let conn = lock(&self.inner.connection).take();
        if let Some(conn) = conn {
            let tracking = self.inner.state.snapshot().tracking;
            if !poller_stopped {
                debug!("poller still blocked, skipping STOP_TRACKING");
            } else if stop_tracking && tracking && conn.is_connected() {
                match conn.command(Command::StopTracking) {
                    Ok(reply) => debug!(%reply, "tracking stopped"),
                    Err(e) => warn!(error = %e, "STOP_TRACKING failed during shutdown"),
                }
            }
            conn.disconnect();
            self.inner.state.reset();
            self.emit(SessionEvent::Disconnected);
        } else {
            self.inner.state.reset();
        }
    }

    /// Returns false if the poller had to be detached.
    fn stop_poller(&self) -> bool {
        let poller = lock(&self.inner.poller).take();
        let stopped = poller
            .map(|p| p.stop(self.inner.config.join_timeout()))
            .unwrap_or(true);
        self.inner.state.set_streaming(false);
        stopped
    }

    /// 连接丢失后的会话清理。`conn` 必须仍是当前连接, 否则说明已重连, 忽略。
    fn connection_lost(&self, conn: &Arc<Connection>, err: &VisionError, on_poller: bool) {
        {
            let mut current = lock(&self.inner.connection);
            match current.as_ref() {
                Some(c) if Arc::ptr_eq(c, conn) => {
                    current.take();
                }
                _ => return,
            }
        }
        warn!(error = %err, "connection lost, ending session");

        let poller = lock(&self.inner.poller).take();
        if let Some(poller) = poller {
            if on_poller {
                poller.detach();
            } else {
                poller.stop(self.inner.config.join_timeout());
            }
        }

        conn.disconnect();
        self.inner.state.reset();
        self.inner.pipeline.reset();
        self.emit(SessionEvent::ConnectionLost(err.to_string()));
    }

    pub fn server_status(&self) -> Result<ServerStatus> {
        self.with_connection(|c| c.status())
    }

    // ========== 追踪 ==========

    /// START_TRACKING, 然后启动轮询线程
    pub fn start_tracking(&self) -> Result<()> {
        let conn = self.connection()?;
        self.with_connection(|c| c.command(Command::StartTracking))?;
        self.inner.state.set_tracking(true);

        let mut slot = lock(&self.inner.poller);
        if slot.as_ref().map(|p| p.is_running()).unwrap_or(false) {
            return Ok(());
        }

        let ctx = PollerContext {
            connection: conn.clone(),
            state: self.inner.state.clone(),
            pipeline: self.inner.pipeline.clone(),
            clock: self.inner.clock.clone(),
            events: self.inner.events.clone(),
            config: self.inner.config.clone(),
        };
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let poller = FramePoller::start(
            ctx,
            Box::new(move |exit| {
                if let PollExit::ConnectionLost(err) = exit {
                    if let Some(inner) = weak.upgrade() {
                        SessionController { inner }.connection_lost(&conn, &err, true);
                    }
                }
            }),
        )?;
        *slot = Some(poller);
        self.inner.state.set_streaming(true);
        info!("tracking started");
        Ok(())
    }

    /// 停止轮询 (有界等待), 然后 STOP_TRACKING
    pub fn stop_tracking(&self) -> Result<()> {
        self.stop_poller();
        self.with_connection(|c| c.command(Command::StopTracking))?;
        self.inner.state.set_tracking(false);
        info!("tracking stopped");
        Ok(())
    }

    pub fn enable_secondary_detection(&self) -> Result<()> {
        self.with_connection(|c| c.command(Command::EnablePfagr))?;
        self.inner.state.set_secondary_detection(true);
        Ok(())
    }

    pub fn disable_secondary_detection(&self) -> Result<()> {
        self.with_connection(|c| c.command(Command::DisablePfagr))?;
        self.inner.state.set_secondary_detection(false);
        Ok(())
    }

    // ========== 拍照 ==========

    /// 拍照: 先设置暂停截止时间, 再发送 TAKE_PHOTO。
    ///
    /// `Ok(None)` means the robot refused or failed the capture.
    pub fn capture_photo(&self) -> Result<Option<Arc<Vec<u8>>>> {
        let deadline = self.inner.clock.now() + self.inner.config.photo_pause();
        self.inner.state.pause_until(deadline);

        match self.with_connection(|c| c.request_photo()) {
            Ok(Some(jpeg)) => {
                info!(bytes = jpeg.len(), "photo captured");
                let jpeg = Arc::new(jpeg);
                self.emit(SessionEvent::PhotoCaptured(jpeg.clone()));
                Ok(Some(jpeg))
            }
            Ok(None) => {
                warn!("photo capture failed on robot");
                self.emit(SessionEvent::PhotoFailed("no image returned".into()));
                Ok(None)
            }
            Err(e) => {
                self.emit(SessionEvent::PhotoFailed(e.to_string()));
                Err(e)
            }
        }
    }

    // ========== 后台执行 ==========

    /// 执行一个操作并返回状态文本
    pub fn run(&self, op: &SessionOp) -> Result<String> {
        match op {
            SessionOp::Connect(addr) => self
                .connect(addr.as_deref())
                .map(|peer| format!("Connected to {}", peer)),
            SessionOp::Disconnect => {
                self.disconnect();
                Ok("Disconnected".into())
            }
            SessionOp::StartTracking => self.start_tracking().map(|_| "Tracking started".into()),
            SessionOp::StopTracking => self.stop_tracking().map(|_| "Tracking stopped".into()),
            SessionOp::EnableSecondaryDetection => self
                .enable_secondary_detection()
                .map(|_| "PFAGR enabled".into()),
            SessionOp::DisableSecondaryDetection => self
                .disable_secondary_detection()
                .map(|_| "PFAGR disabled".into()),
            SessionOp::CapturePhoto => self.capture_photo().map(|photo| match photo {
                Some(jpeg) => format!("Photo captured ({} bytes)", jpeg.len()),
                None => "Photo capture failed".into(),
            }),
            SessionOp::QueryStatus => self.server_status().map(|s| {
                format!(
                    "tracking={} pfagr={} camera={} robot={}",
                    s.tracking, s.pfagr_enabled, s.camera_ready, s.robot_connected
                )
            }),
            SessionOp::EndSession => {
                self.end_session();
                Ok("Session ended".into())
            }
        }
    }

    /// Runs `op` on a short-lived thread and reports the outcome as a
    /// `Status` event, so a UI thread never waits on a network round trip.
    pub fn spawn(&self, op: SessionOp) -> Result<JoinHandle<()>> {
        let this = self.clone();
        std::thread::Builder::new()
            .name("session-op".into())
            .spawn(move || {
                let status = match this.run(&op) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(%op, error = %e, "operation failed");
                        format!("{} failed: {}", op, e)
                    }
                };
                this.emit(SessionEvent::Status(status));
            })
            .map_err(|source| VisionError::Spawn {
                name: "session-op",
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crossbeam_channel::bounded;

    fn controller() -> (SessionController, crossbeam_channel::Receiver<SessionEvent>) {
        let (tx, rx) = bounded(64);
        let c = SessionController::new(
            ClientConfig::default(),
            None,
            Arc::new(ManualClock::new()),
            tx,
        );
        (c, rx)
    }

    #[test]
    fn test_operations_require_connection() {
        let (c, _rx) = controller();
        assert!(!c.is_connected());
        assert!(matches!(c.start_tracking(), Err(VisionError::NotConnected)));
        assert!(matches!(c.server_status(), Err(VisionError::NotConnected)));
        assert!(matches!(
            c.enable_secondary_detection(),
            Err(VisionError::NotConnected)
        ));
    }

    #[test]
    fn test_capture_photo_pauses_even_when_it_fails() {
        let (c, rx) = controller();
        assert!(c.capture_photo().is_err());
        assert!(c.state().pause_until.is_some());
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::PhotoFailed(_))));
    }

    #[test]
    fn test_disconnect_without_connection_is_quiet() {
        let (c, rx) = controller();
        c.disconnect();
        c.end_session();
        assert!(rx.try_recv().is_err());
        assert_eq!(c.state(), SessionSnapshot::default());
    }

    #[test]
    fn test_spawn_reports_status() {
        let (c, rx) = controller();
        c.spawn(SessionOp::StopTracking).unwrap().join().unwrap();
        match rx.try_recv() {
            Ok(SessionEvent::Status(msg)) => assert!(msg.starts_with("stop tracking failed")),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
