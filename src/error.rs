// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 错误类型 (Error taxonomy)

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VisionError>;

/// Client-side error type for every protocol and pipeline operation
#[derive(Error, Debug)]
pub enum VisionError {
    /// Peer closed the socket, timed out, or the stream lost framing.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Initial connect failed (refused, timed out, unresolvable)
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("not connected")]
    NotConnected,

    /// Server answered with a header we did not ask for
    #[error("unexpected response to {expected}: {header:?}")]
    ProtocolMismatch { expected: String, header: String },

    /// Malformed metadata JSON or image bytes
    #[error("decode error: {0}")]
    Decode(String),

    /// Classification engine failure
    #[error("analysis failed: {0}")]
    Analysis(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl VisionError {
    /// Fatal errors end the session; everything else is contained per frame.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VisionError::ConnectionLost(_) | VisionError::NotConnected)
    }
}

/// Errors from the HTTP classification service
#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("http transport: {0}")]
    Http(String),

    #[error("server returned HTTP {code}: {body}")]
    Status { code: u16, body: String },

    /// Server answered `ok:false`
    #[error("classification rejected: {0}")]
    Rejected(String),

    #[error("cannot encode face crop: {0}")]
    Encode(String),
}

impl From<ClassifyError> for VisionError {
    fn from(e: ClassifyError) -> Self {
        VisionError::Analysis(e.to_string())
    }
}

impl From<serde_json::Error> for VisionError {
    fn from(e: serde_json::Error) -> Self {
        VisionError::Decode(e.to_string())
    }
}

impl From<image::ImageError> for VisionError {
    fn from(e: image::ImageError) -> Self {
        VisionError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_kinds() {
        assert!(VisionError::ConnectionLost("eof".into()).is_fatal());
        assert!(VisionError::NotConnected.is_fatal());
        assert!(!VisionError::Decode("bad json".into()).is_fatal());
        assert!(!VisionError::ProtocolMismatch {
            expected: "FRAME".into(),
            header: "ERR:NO_CAMERA".into(),
        }
        .is_fatal());
    }

    #[test]
    fn test_classify_error_becomes_analysis() {
        let e: VisionError = ClassifyError::Rejected("DeepFace not installed".into()).into();
        assert!(matches!(e, VisionError::Analysis(ref m) if m.contains("DeepFace")));
    }
}
