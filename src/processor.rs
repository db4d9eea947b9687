use std::path::Path;
use std::time::Instant;
use tracing::info;

use crate::classifier::ClassificationResult;
use crate::error::Result;
use crate::frame_sampler::load_video;
use crate::loader::LoadedModelState;

/// 对本地视频文件做一次完整推理：采样 -> 预处理 -> 分类
///
/// 同步阻塞，服务层应放在 `spawn_blocking` 中调用。
pub fn predict_video(
    state: &LoadedModelState,
    video_path: impl AsRef<Path>,
    num_frames: usize,
) -> Result<ClassificationResult> {
    let video_path = video_path.as_ref();
    let num_frames = state.effective_num_frames(num_frames);
    let start = Instant::now();

    info!("开始分析视频: {} ({} 帧)", video_path.display(), num_frames);
    let frames = load_video(video_path, num_frames)?;
    let decoded = start.elapsed();

    let result = state.classify_frames(&frames)?;

    info!(
        "分析完成: {} -> {} ({:.4})，解码 {:.2}s，总计 {:.2}s",
        video_path.display(),
        result.label,
        result.confidence,
        decoded.as_secs_f64(),
        start.elapsed().as_secs_f64()
    );
    Ok(result)
}
