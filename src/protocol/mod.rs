// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 视觉服务协议 (Vision server protocol)
///
/// 半双工请求/应答, 单条TCP连接:
/// - 客户端发送以 `\n` 结尾的文本命令
/// - 简单命令应答一行: `OK:<msg>` / `ERR:<msg>` / `STATUS:<json>`
/// - `GET_FRAME`  → `FRAME\n` + [4B len][JSON] + [4B len][JPEG或0]
/// - `TAKE_PHOTO` → `PHOTO\n` + [4B len][JPEG或0]
///
/// 所有长度前缀均为大端有符号32位整数。
pub mod codec;
pub mod metadata;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, VisionError};

pub use codec::{
    read_frame_response, read_len, read_line, read_photo_response, read_exact, write_command,
};
pub use metadata::{FaceBox, FrameMetadata};

// ========== 协议常量 ==========

pub const FRAME_HEADER: &str = "FRAME";
pub const PHOTO_HEADER: &str = "PHOTO";
pub const STATUS_PREFIX: &str = "STATUS:";
pub const OK_PREFIX: &str = "OK:";
pub const ERR_PREFIX: &str = "ERR:";

/// Upper bound for one length-prefixed segment (a 5MP still JPEG fits easily)
pub const MAX_SEGMENT_LEN: usize = 64 * 1024 * 1024;

/// 客户端命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartTracking,
    StopTracking,
    EnablePfagr,
    DisablePfagr,
    GetFrame,
    TakePhoto,
    Status,
    Quit,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::StartTracking => "START_TRACKING",
            Command::StopTracking => "STOP_TRACKING",
            Command::EnablePfagr => "ENABLE_PFAGR",
            Command::DisablePfagr => "DISABLE_PFAGR",
            Command::GetFrame => "GET_FRAME",
            Command::TakePhoto => "TAKE_PHOTO",
            Command::Status => "STATUS",
            Command::Quit => "QUIT",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单行应答分类
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok(String),
    Err(String),
    Other(String),
}

impl Reply {
    pub fn parse(line: &str) -> Self {
        if let Some(msg) = line.strip_prefix(OK_PREFIX) {
            Reply::Ok(msg.to_string())
        } else if let Some(msg) = line.strip_prefix(ERR_PREFIX) {
            Reply::Err(msg.to_string())
        } else {
            Reply::Other(line.to_string())
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Ok(_))
    }

    /// Turns an `ERR:` reply to `cmd` into a protocol mismatch.
    pub fn into_result(self, cmd: Command) -> Result<String> {
        match self {
            Reply::Ok(msg) | Reply::Other(msg) => Ok(msg),
            Reply::Err(msg) => Err(VisionError::ProtocolMismatch {
                expected: cmd.to_string(),
                header: format!("{}{}", ERR_PREFIX, msg),
            }),
        }
    }
}

/// `STATUS` 命令返回的服务端状态
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerStatus {
    pub tracking: bool,
    pub pfagr_enabled: bool,
    pub camera_ready: bool,
    pub robot_connected: bool,
}

impl ServerStatus {
    pub fn parse(line: &str) -> Result<Self> {
        let json = line
            .strip_prefix(STATUS_PREFIX)
            .ok_or_else(|| VisionError::ProtocolMismatch {
                expected: Command::Status.to_string(),
                header: line.to_string(),
            })?;
        Ok(serde_json::from_str(json)?)
    }
}
