// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
use anyhow::{Context, Result};
use clap::Parser;
/// Sota视觉客户端 - 命令行版
///
/// 连接机器人 → START_TRACKING → 轮询帧并打印摘要 → (可选)拍照 → 结束会话
///
/// 直接运行: cargo run --bin sota-vision -- --ip 192.168.11.1 --seconds 30
use crossbeam_channel::{bounded, RecvTimeoutError};
use sota_vision_rs::{
    gen_time_string, ClientConfig, FaceClassifier, HttpFaceClassifier, SessionController,
    SessionEvent, SessionOp, SystemClock,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Sota视觉测试客户端
#[derive(Parser, Debug)]
#[command(author, version, about = "Sota robot vision client", long_about = None)]
struct Args {
    /// 机器人IP (默认取配置文件)
    #[arg(long)]
    ip: Option<String>,

    /// 视觉服务端口
    #[arg(short, long)]
    port: Option<u16>,

    /// 配置文件路径
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 人种分类服务地址, 例如 http://127.0.0.1:5050
    #[arg(long)]
    classifier_url: Option<String>,

    /// 启用服务端 PFAGR (年龄/性别/人种) 检测
    #[arg(long)]
    pfagr: bool,

    /// 运行时长 (秒)
    #[arg(short, long, default_value_t = 30)]
    seconds: u64,

    /// 运行中途拍一张照片并保存到当前目录
    #[arg(long)]
    photo: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(ClientConfig::default_path);
    let mut config = ClientConfig::load(&config_path);
    if let Some(ip) = args.ip {
        config.host = ip;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.classifier_url.is_some() {
        config.classifier_url = args.classifier_url;
    }
    config.validate().context("invalid configuration")?;

    let classifier: Option<Arc<dyn FaceClassifier>> = match config.classifier_url.as_deref() {
        Some(url) => {
            let client = HttpFaceClassifier::new(url, config.classifier_timeout());
            match client.health() {
                Ok(h) => info!(url, status = %h.status, model = ?h.model, device = ?h.device, "classifier ready"),
                Err(e) => warn!(url, error = %e, "classifier health check failed, will retry per job"),
            }
            Some(Arc::new(client))
        }
        None => None,
    };

    let (tx, rx) = bounded::<SessionEvent>(64);
    let session = SessionController::new(config.clone(), classifier, Arc::new(SystemClock), tx);

    let peer = session
        .connect(None)
        .with_context(|| format!("cannot connect to {}", config.address()))?;
    info!(%peer, "session started");

    if args.pfagr {
        session.enable_secondary_detection()?;
    }
    session.start_tracking()?;

    let run_for = Duration::from_secs(args.seconds);
    let mut photo_at = args.photo.then(|| run_for / 2);
    let start = Instant::now();
    let mut frames: u64 = 0;

    while start.elapsed() < run_for {
        if photo_at.is_some_and(|at| start.elapsed() >= at) {
            photo_at = None;
            session.spawn(SessionOp::CapturePhoto)?;
        }

        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(SessionEvent::Frame(update)) => {
                frames += 1;
                if frames % 20 == 1 {
                    let m = &update.metadata;
                    info!(
                        faces = m.face_num,
                        smile = ?m.smile,
                        age = ?m.age,
                        gender = ?m.gender,
                        race = ?update.race_display(),
                        server_fps = ?m.fps,
                        client_fps = ?update.client_fps.map(|f| (f * 10.0).round() / 10.0),
                        error = ?m.error,
                        "frame"
                    );
                }
            }
            Ok(SessionEvent::Analysis(result)) => {
                info!(label = %result.label, at = %result.at.format("%H:%M:%S"), "analysis");
            }
            Ok(SessionEvent::PhotoCaptured(jpeg)) => {
                let path = format!("photo_{}.jpg", gen_time_string("-"));
                std::fs::write(&path, jpeg.as_slice())
                    .with_context(|| format!("cannot write {}", path))?;
                info!(path = %path, bytes = jpeg.len(), "photo saved");
            }
            Ok(SessionEvent::PhotoFailed(reason)) => warn!(%reason, "photo failed"),
            Ok(SessionEvent::Status(msg)) => info!(%msg, "status"),
            Ok(SessionEvent::ConnectionLost(reason)) => {
                warn!(%reason, "connection lost");
                return Ok(());
            }
            Ok(SessionEvent::Connected(_)) | Ok(SessionEvent::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    session.end_session();
    session.pipeline().shutdown();
    info!("session ended");
    Ok(())
}
