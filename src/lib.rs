// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod analysis; // 异步人种/年龄分析流水线
pub mod cancel; // 轮询线程取消令牌
pub mod clock; // 可替换时钟 (测试用)
pub mod config; // 客户端配置参数
pub mod error; // 错误类型
pub mod poller; // 帧轮询线程
pub mod protocol; // 协议编解码
pub mod session; // 会话控制器
pub mod transport; // TCP连接

pub use crate::analysis::{
    AnalysisJob, AnalysisPipeline, AnalysisResult, Classification, FaceClassifier,
    HttpFaceClassifier, SubmitOutcome,
};
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::ClientConfig;
pub use crate::error::{ClassifyError, Result, VisionError};
pub use crate::poller::{FramePoller, FrameUpdate, PollExit, RateWindow};
pub use crate::protocol::{Command, FaceBox, FrameMetadata, Reply, ServerStatus};
pub use crate::session::{SessionController, SessionEvent, SessionOp, SessionSnapshot};
pub use crate::transport::Connection;

pub fn gen_time_string(delimiter: &str) -> String {
    let t_now = chrono::Local::now();
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S",
        delimiter, delimiter, delimiter, delimiter, delimiter
    );
    t_now.format(&fmt).to_string()
}
