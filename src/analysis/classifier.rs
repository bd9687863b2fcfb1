// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 人种分类引擎 (Face classification engine)
///
/// The engine is a blocking call: face crop in, dominant category out. The
/// HTTP implementation talks to the DeepFace sidecar (`/health`,
/// `/analyze_face`).
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{ClassifyError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const JPEG_QUALITY: u8 = 90;

/// 分类结果
#[derive(Clone, Debug, PartialEq)]
pub struct Classification {
    pub dominant: String,
    /// 0-100
    pub confidence: f32,
    pub scores: BTreeMap<String, f32>,
}

impl Classification {
    /// Picks the highest-scoring category.
    pub fn from_scores(scores: BTreeMap<String, f32>) -> Option<Self> {
        let (dominant, confidence) = scores
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(k, v)| (k.clone(), *v))?;
        Some(Self {
            dominant,
            confidence,
            scores,
        })
    }

    /// `"Asian (87%)"`
    pub fn label(&self) -> String {
        format!("{} ({}%)", title_case(&self.dominant), self.confidence as i32)
    }
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(|c| c.to_lowercase()))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Blocking face classifier. Implementations must be callable from the
/// analysis worker thread.
pub trait FaceClassifier: Send + Sync {
    fn classify(&self, face: &RgbImage) -> Result<Classification>;
}

// ========== HTTP实现 ==========

#[derive(Clone, Debug, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub deepface: bool,
}

#[derive(Debug, Deserialize)]
struct AnalyzeFaceResponse {
    ok: bool,
    #[serde(default)]
    dominant_race: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    all_races: BTreeMap<String, f32>,
    #[serde(default)]
    processing_ms: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpFaceClassifier {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpFaceClassifier {
    pub fn new(base_url: &str, read_timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(read_timeout)
            .build();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /health`
    pub fn health(&self) -> std::result::Result<HealthStatus, ClassifyError> {
        let resp = self
            .agent
            .get(&format!("{}/health", self.base_url))
            .call()
            .map_err(map_ureq)?;
        resp.into_json::<HealthStatus>()
            .map_err(|e| ClassifyError::Http(e.to_string()))
    }

    fn analyze(&self, face: &RgbImage) -> std::result::Result<Classification, ClassifyError> {
        let jpeg = encode_jpeg(face)?;
        let boundary = format!("----SotaVisionBoundary{}", chrono::Utc::now().timestamp_millis());
        let body = multipart_body(&boundary, "face.jpg", &jpeg);

        let start = Instant::now();
        let resp = self
            .agent
            .post(&format!("{}/analyze_face", self.base_url))
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={}", boundary),
            )
            .send_bytes(&body)
            .map_err(map_ureq)?;
        let parsed: AnalyzeFaceResponse = resp
            .into_json()
            .map_err(|e| ClassifyError::Http(e.to_string()))?;

        debug!(
            ok = parsed.ok,
            race = %parsed.dominant_race,
            confidence = parsed.confidence,
            server_ms = ?parsed.processing_ms,
            total_ms = start.elapsed().as_millis() as u64,
            "analyze_face"
        );

        if !parsed.ok {
            return Err(ClassifyError::Rejected(
                parsed.error.unwrap_or_else(|| "ok=false".to_string()),
            ));
        }
        Ok(Classification {
            dominant: parsed.dominant_race,
            confidence: parsed.confidence,
            scores: parsed.all_races,
        })
    }
}

impl FaceClassifier for HttpFaceClassifier {
    fn classify(&self, face: &RgbImage) -> Result<Classification> {
        Ok(self.analyze(face)?)
    }
}

fn map_ureq(e: ureq::Error) -> ClassifyError {
    match e {
        ureq::Error::Status(code, resp) => ClassifyError::Status {
            code,
            body: resp.into_string().unwrap_or_default(),
        },
        ureq::Error::Transport(t) => ClassifyError::Http(t.to_string()),
    }
}

fn encode_jpeg(face: &RgbImage) -> std::result::Result<Vec<u8>, ClassifyError> {
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode_image(face)
        .map_err(|e| ClassifyError::Encode(e.to_string()))?;
    Ok(jpeg)
}

/// 构造 multipart/form-data 请求体 (字段名 `image`)
fn multipart_body(boundary: &str, filename: &str, image: &[u8]) -> Vec<u8> {
    let header = format!(
        "--{}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"{}\"\r\nContent-Type: image/jpeg\r\n\r\n",
        boundary, filename
    );
    let footer = format!("\r\n--{}--\r\n", boundary);

    let mut body = Vec::with_capacity(header.len() + image.len() + footer.len());
    body.extend_from_slice(header.as_bytes());
    body.extend_from_slice(image);
    body.extend_from_slice(footer.as_bytes());
    body
}
