use std::path::PathBuf;

use axum::http::StatusCode;
use thiserror::Error;

/// 推理管线统一的结果类型
pub type Result<T> = std::result::Result<T, SentimentError>;

/// 推理管线的错误分类
///
/// 每个变体对应一种对外可见的失败方式，HTTP 层通过 [`SentimentError::status_code`]
/// 映射响应码，CLI 直接打印消息。
#[derive(Error, Debug)]
pub enum SentimentError {
    /// 视频无法打开或已损坏
    #[error("无法打开视频: {path}: {reason}")]
    CannotOpen { path: PathBuf, reason: String },

    /// 视频没有可解码的帧
    #[error("视频不包含任何帧: {0}")]
    EmptyVideo(PathBuf),

    /// 流式写入超过大小上限
    #[error("视频大小超过 {limit_mb}MB 上限")]
    SizeLimitExceeded { limit_mb: u64 },

    /// 模型目录不存在，需要先训练/导出
    #[error("未找到模型: {path}，请先运行训练并导出 ONNX 模型")]
    ModelNotFound { path: PathBuf },

    /// 远程视频下载失败
    #[error("下载视频失败: {0}")]
    FetchFailure(String),

    /// 请求参数不合法
    #[error("{0}")]
    InvalidInput(String),

    /// 预处理或前向推理中的任何意外错误
    #[error("推理失败: {0}")]
    InferenceFailure(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

impl SentimentError {
    /// 映射为 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            SentimentError::CannotOpen { .. }
            | SentimentError::EmptyVideo(_)
            | SentimentError::SizeLimitExceeded { .. }
            | SentimentError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            SentimentError::FetchFailure(_) => StatusCode::BAD_GATEWAY,
            SentimentError::ModelNotFound { .. }
            | SentimentError::InferenceFailure(_)
            | SentimentError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ort::Error> for SentimentError {
    fn from(e: ort::Error) -> Self {
        SentimentError::InferenceFailure(e.to_string())
    }
}

impl From<ndarray::ShapeError> for SentimentError {
    fn from(e: ndarray::ShapeError) -> Self {
        SentimentError::InferenceFailure(e.to_string())
    }
}

impl From<reqwest::Error> for SentimentError {
    fn from(e: reqwest::Error) -> Self {
        SentimentError::FetchFailure(e.to_string())
    }
}
