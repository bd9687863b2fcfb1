// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 客户端配置 - 通过JSON文件调整参数

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Result, VisionError};

/// 客户端参数配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    // === 连接参数 ===
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64, // 连接超时
    pub read_timeout_ms: u64,    // 稳态读写超时

    // === 轮询参数 ===
    pub poll_interval_ms: u64,  // 每次轮询后休眠 (~20fps上限)
    pub pause_retry_ms: u64,    // 暂停期间的重试间隔
    pub error_backoff_ms: u64,  // 瞬时错误后的退避
    pub rate_window_ms: u64,    // 客户端FPS滑动窗口
    pub photo_pause_ms: u64,    // 拍照时暂停取帧
    pub join_timeout_ms: u64,   // 停止轮询线程的等待上限

    // === 分析参数 ===
    pub analysis_interval_ms: u64, // 两次提交之间的最小间隔
    pub analysis_poll_ms: u64,     // 工作线程队列等待超时
    pub face_padding: f32,         // 人脸框外扩比例
    pub classifier_url: Option<String>,
    pub classifier_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "192.168.11.1".to_string(),
            port: 8889,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 15_000,

            poll_interval_ms: 30,
            pause_retry_ms: 200,
            error_backoff_ms: 500,
            rate_window_ms: 2_000,
            photo_pause_ms: 4_000,
            join_timeout_ms: 3_000,

            analysis_interval_ms: 5_000,
            analysis_poll_ms: 1_000,
            face_padding: 0.2,
            classifier_url: None,
            classifier_timeout_ms: 30_000,
        }
    }
}

impl ClientConfig {
    /// 从JSON文件加载配置
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(config) => {
                    info!(path = %path.display(), "config loaded");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "config parse failed, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                info!(path = %path.display(), "config missing, writing defaults");
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    warn!(error = %e, "cannot write default config");
                }
                config
            }
        }
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| VisionError::Config(format!("{}: {}", parent.display(), e)))?;
        }
        fs::write(path, json).map_err(|e| VisionError::Config(format!("{}: {}", path.display(), e)))
    }

    /// `<config dir>/sota-vision/client.json`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sota-vision")
            .join("client.json")
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(VisionError::Config("port must be non-zero".into()));
        }
        if self.connect_timeout_ms == 0 || self.read_timeout_ms == 0 {
            return Err(VisionError::Config("socket timeouts must be non-zero".into()));
        }
        if self.rate_window_ms == 0 || self.analysis_poll_ms == 0 {
            return Err(VisionError::Config("window and worker timeouts must be non-zero".into()));
        }
        if !(0.0..=1.0).contains(&self.face_padding) {
            return Err(VisionError::Config(format!(
                "face_padding {} outside [0, 1]",
                self.face_padding
            )));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn pause_retry(&self) -> Duration {
        Duration::from_millis(self.pause_retry_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn photo_pause(&self) -> Duration {
        Duration::from_millis(self.photo_pause_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn analysis_interval(&self) -> Duration {
        Duration::from_millis(self.analysis_interval_ms)
    }

    pub fn analysis_poll(&self) -> Duration {
        Duration::from_millis(self.analysis_poll_ms)
    }

    pub fn classifier_timeout(&self) -> Duration {
        Duration::from_millis(self.classifier_timeout_ms)
    }
}
