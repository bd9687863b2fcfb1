// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 帧元数据 (Frame metadata)
///
/// Typed view of the JSON the server sends with every `FRAME`. Keys we do not
/// know about are kept in `extra` instead of being dropped.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 人脸检测框 (像素坐标, 左上角 + 宽高)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FrameMetadata {
    pub tracking: bool,
    pub pfagr_enabled: bool,

    // === 人脸检测 ===
    pub face_detected: bool,
    pub face_num: u32,
    pub faces: Vec<FaceBox>,
    pub smile: Option<i32>,

    // === 头部姿态 ===
    pub pitch: Option<f64>,
    pub yaw: Option<f64>,
    pub roll: Option<f64>,

    // === PFAGR (年龄/性别/人种) ===
    pub age_detected: bool,
    pub age: Option<i32>,
    pub gender: Option<String>,
    pub race: Option<String>,
    pub race_score: Option<f64>,

    /// 相机端FPS
    pub fps: Option<f64>,

    /// Raw header of a non-`FRAME` reply; set only on the client side.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FrameMetadata {
    /// Metadata for a reply that carried no frame.
    pub fn no_frame(header: impl Into<String>) -> Self {
        Self {
            error: Some(header.into()),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn has_face(&self) -> bool {
        self.face_detected && !self.faces.is_empty()
    }

    /// 主人脸 (列表中的第一个)
    pub fn primary_face(&self) -> Option<&FaceBox> {
        if self.face_detected {
            self.faces.first()
        } else {
            None
        }
    }

    /// Server-side race estimate formatted for display, if any.
    ///
    /// A zero score is the server's "not scored" default and is not shown.
    pub fn server_race(&self) -> Option<String> {
        let race = self.race.as_deref().filter(|r| !r.is_empty())?;
        Some(match self.race_score.filter(|s| *s != 0.0) {
            Some(score) => format!("{} ({})", race, score),
            None => race.to_string(),
        })
    }
}
