use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Json as ResponseJson, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::classifier::ClassificationResult;
use crate::context::AppContext;
use crate::error::SentimentError;
use crate::ingest::{download_video, parse_video_url, save_upload, TempVideo};
use crate::processor::predict_video;

/// multipart 边界和表单字段的额外开销
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

/// `/predict` 成功响应
#[derive(Debug, Clone, Serialize)]
pub struct PredictResponse {
    pub label: String,
    pub label_index: usize,
    pub confidence: f64,
    pub probabilities: BTreeMap<String, f64>,
    /// "url" 或 "upload"
    pub source: &'static str,
}

impl PredictResponse {
    pub fn new(result: ClassificationResult, source: VideoSource) -> Self {
        Self {
            label: result.label,
            label_index: result.label_index,
            confidence: result.confidence,
            probabilities: result.probabilities,
            source: source.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoSource {
    Url,
    Upload,
}

impl VideoSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoSource::Url => "url",
            VideoSource::Upload => "upload",
        }
    }
}

/// 错误响应：`{"detail": "..."}`
#[derive(Debug)]
pub struct ApiError(pub SentimentError);

impl From<SentimentError> for ApiError {
    fn from(e: SentimentError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        if status.is_server_error() {
            error!("请求处理失败: {}", self.0);
        } else {
            warn!("请求被拒绝 ({}): {}", status, self.0);
        }
        (status, ResponseJson(json!({ "detail": self.0.to_string() }))).into_response()
    }
}

/// 健康检查
pub async fn health_check() -> ResponseJson<serde_json::Value> {
    ResponseJson(json!({ "status": "ok" }))
}

/// 表单中解析出的视频来源
enum VideoInput {
    Url(reqwest::Url),
    Upload(TempVideo),
}

/// 读取全部表单字段，`video_url` 与 `video_file` 必须恰好提供一个
///
/// 上传文件在读到时直接写入临时文件；如果同时出现了 `video_url`，该文件随即被丢弃。
async fn read_form(ctx: &AppContext, multipart: &mut Multipart) -> Result<VideoInput, SentimentError> {
    let mut video_url: Option<String> = None;
    let mut upload: Option<TempVideo> = None;
    let mut saw_file = false;
    let limit_mb = ctx.config.max_file_size_mb;

    while let Some(field) = multipart.next_field().await.map_err(|e| multipart_error(e, limit_mb))? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "video_url" => {
                let text = field.text().await.map_err(|e| multipart_error(e, limit_mb))?;
                if !text.trim().is_empty() {
                    video_url = Some(text);
                    upload = None;
                }
            }
            "video_file" => {
                if field.file_name().map_or(true, str::is_empty) {
                    continue;
                }
                saw_file = true;
                if video_url.is_none() {
                    upload = Some(
                        save_upload(field, &ctx.config.temp_dir, ctx.config.max_file_size_bytes()).await?,
                    );
                }
            }
            other => warn!("忽略未知表单字段: {}", other),
        }
    }

    match (video_url, upload, saw_file) {
        (None, _, false) => Err(SentimentError::InvalidInput(
            "需要提供 video_url 或 video_file".to_string(),
        )),
        (Some(_), _, true) => Err(SentimentError::InvalidInput(
            "video_url 与 video_file 只能选择其一".to_string(),
        )),
        (Some(url), _, false) => Ok(VideoInput::Url(parse_video_url(&url)?)),
        (None, Some(video), true) => Ok(VideoInput::Upload(video)),
        (None, None, true) => Err(SentimentError::InvalidInput("上传文件为空".to_string())),
    }
}

fn multipart_error(e: axum::extract::multipart::MultipartError, limit_mb: u64) -> SentimentError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        SentimentError::SizeLimitExceeded { limit_mb }
    } else {
        SentimentError::InvalidInput(format!("表单解析失败: {}", e.body_text()))
    }
}

/// 视频情感分类
pub async fn predict(
    State(ctx): State<Arc<AppContext>>,
    mut multipart: Multipart,
) -> Result<ResponseJson<PredictResponse>, ApiError> {
    let input = read_form(&ctx, &mut multipart).await?;
    let state = ctx.components().await?;

    let (video, source) = match input {
        VideoInput::Url(url) => {
            let video = download_video(
                &ctx.http,
                &url,
                &ctx.config.temp_dir,
                ctx.config.max_file_size_bytes(),
                Duration::from_secs(ctx.config.download_timeout_secs),
            )
            .await?;
            (video, VideoSource::Url)
        }
        VideoInput::Upload(video) => (video, VideoSource::Upload),
    };

    let num_frames = ctx.config.num_frames;
    let result = tokio::task::spawn_blocking(move || {
        let result = predict_video(&state, video.path(), num_frames);
        drop(video);
        result
    })
    .await
    .map_err(|e| SentimentError::InferenceFailure(format!("推理任务异常退出: {}", e)))??;

    info!("预测结果: {} ({:.4}), 来源: {}", result.label, result.confidence, source.as_str());
    Ok(ResponseJson(PredictResponse::new(result, source)))
}

/// 构建 HTTP 路由
pub fn router(ctx: Arc<AppContext>) -> Router {
    let body_limit = (ctx.config.max_file_size_bytes() as usize).saturating_add(MULTIPART_OVERHEAD);
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/predict", post(predict))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}
