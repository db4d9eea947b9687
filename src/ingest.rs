use axum::extract::multipart::Field;
use axum::http::StatusCode;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Result, SentimentError};

const DEFAULT_SUFFIX: &str = ".mp4";

/// 请求期间的临时视频文件，drop 时删除
///
/// 每个请求独占一个文件；无论成功还是在哪一步失败，文件都会被清理。
#[derive(Debug)]
pub struct TempVideo {
    path: PathBuf,
}

impl TempVideo {
    /// 在 `dir` 下创建一个唯一命名的空文件
    pub async fn create(dir: &Path, suffix: &str) -> Result<(Self, tokio::fs::File)> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}{}", uuid::Uuid::new_v4(), suffix));
        let file = tokio::fs::File::create(&path).await?;
        Ok((Self { path }, file))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempVideo {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("已删除临时文件: {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("删除临时文件失败 {}: {}", self.path.display(), e),
        }
    }
}

/// 累计字节数的上限检查，在写入之前判断
#[derive(Debug, Clone, Copy)]
pub struct ByteBudget {
    limit: u64,
    written: u64,
}

impl ByteBudget {
    pub fn new(limit: u64) -> Self {
        Self { limit, written: 0 }
    }

    /// 准许写入 `len` 字节；超过上限立即失败，超出部分不会落盘
    pub fn admit(&mut self, len: usize) -> Result<()> {
        let next = self.written.saturating_add(len as u64);
        if next > self.limit {
            return Err(self.exceeded());
        }
        self.written = next;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    fn exceeded(&self) -> SentimentError {
        SentimentError::SizeLimitExceeded {
            limit_mb: self.limit.div_ceil(1024 * 1024),
        }
    }
}

/// 从文件名或 URL 路径中提取扩展名，缺失或异常时使用 `.mp4`
pub fn video_suffix(name: &str) -> String {
    let name = name.split(['?', '#']).next().unwrap_or(name);
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_else(|| DEFAULT_SUFFIX.to_string())
}

/// 校验视频 URL，只接受 http/https
pub fn parse_video_url(raw: &str) -> Result<reqwest::Url> {
    let url = reqwest::Url::parse(raw.trim())
        .map_err(|e| SentimentError::InvalidInput(format!("video_url 不是合法的 URL: {}", e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(SentimentError::InvalidInput(format!("不支持的 URL 协议: {}", other))),
    }
}

/// 流式下载视频到临时文件
///
/// 整个传输受 `timeout` 限制；累计字节数超过 `max_bytes` 时立即中止。
pub async fn download_video(
    client: &reqwest::Client,
    url: &reqwest::Url,
    dir: &Path,
    max_bytes: u64,
    timeout: Duration,
) -> Result<TempVideo> {
    info!("正在下载视频: {}", url);

    let response = client.get(url.clone()).timeout(timeout).send().await?;
    if !response.status().is_success() {
        return Err(SentimentError::FetchFailure(format!("HTTP {} - {}", response.status(), url)));
    }

    let mut budget = ByteBudget::new(max_bytes);
    if let Some(length) = response.content_length() {
        if length > max_bytes {
            return Err(budget.exceeded());
        }
    }

    let (video, mut file) = TempVideo::create(dir, &video_suffix(url.path())).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        budget.admit(chunk.len())?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    info!("视频已下载到: {} ({} 字节)", video.path().display(), budget.written());
    Ok(video)
}

/// 将上传的 multipart 字段流式写入临时文件，同样受大小上限约束
pub async fn save_upload(mut field: Field<'_>, dir: &Path, max_bytes: u64) -> Result<TempVideo> {
    let suffix = video_suffix(field.file_name().unwrap_or("upload.mp4"));
    let (video, mut file) = TempVideo::create(dir, &suffix).await?;

    let mut budget = ByteBudget::new(max_bytes);
    while let Some(chunk) = field.chunk().await.map_err(|e| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            budget.exceeded()
        } else {
            SentimentError::InvalidInput(format!("读取上传文件失败: {}", e))
        }
    })? {
        budget.admit(chunk.len())?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    info!("上传文件已保存: {} ({} 字节)", video.path().display(), budget.written());
    Ok(video)
}
