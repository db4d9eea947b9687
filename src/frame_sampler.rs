use ffmpeg_next as ffmpeg;
use image::RgbImage;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Result, SentimentError};

/// 默认采样帧数（VideoMAE 的 num_frames）
pub const DEFAULT_NUM_FRAMES: usize = 16;

/// seek 之后最多读取的数据包数，避免在损坏的流上无限解码
const MAX_PACKETS_PER_SEEK: usize = 1024;

/// 单帧读取失败的原因
#[derive(Debug, Clone, PartialEq)]
pub enum FrameReadError {
    /// seek 失败
    Seek(String),
    /// 解码或颜色转换失败
    Decode(String),
    /// 到达流末尾仍未得到目标帧
    EndOfStream,
}

/// 一次按帧号读取的结果
pub type FrameAttempt = std::result::Result<RgbImage, FrameReadError>;

/// 可按帧号随机读取的视频源
pub trait FrameSource {
    /// 视频总帧数
    fn frame_count(&self) -> usize;

    /// seek 到指定帧并解码为 RGB
    fn read_frame(&mut self, index: usize) -> FrameAttempt;
}

/// 计算均匀分布的采样位置：`floor(i * T / N)`
///
/// 第一个位置总是 0，最后一帧不保证被选中。
pub fn sample_positions(total_frames: usize, num_frames: usize) -> Vec<usize> {
    (0..num_frames)
        .map(|i| (i as u128 * total_frames as u128 / num_frames as u128) as usize)
        .collect()
}

/// 单帧的回退策略：主读取成功则使用；否则使用回退读取；两次都失败则丢弃。
pub fn resolve_attempts(primary: FrameAttempt, fallback: impl FnOnce() -> FrameAttempt) -> Option<RgbImage> {
    match primary {
        Ok(frame) => Some(frame),
        Err(_) => fallback().ok(),
    }
}

/// 从视频源采样 `num_frames` 帧
///
/// 每个位置失败时在 `min(position, T-1)` 上重试一次，仍失败则丢弃该帧。
/// 丢帧导致序列不足时用最后一帧补齐，保证返回长度恰好为 `num_frames`；
/// 一帧都没有解出时返回 `EmptyVideo`。
pub fn sample_frames<S: FrameSource>(source: &mut S, num_frames: usize, origin: &Path) -> Result<Vec<RgbImage>> {
    if num_frames == 0 {
        return Err(SentimentError::InvalidInput("采样帧数必须大于 0".to_string()));
    }

    let total = source.frame_count();
    if total == 0 {
        return Err(SentimentError::EmptyVideo(origin.to_path_buf()));
    }

    let mut frames = Vec::with_capacity(num_frames);
    for position in sample_positions(total, num_frames) {
        let primary = source.read_frame(position);
        if let Err(e) = &primary {
            debug!("读取第 {} 帧失败: {:?}，尝试回退读取", position, e);
        }
        let fallback_position = position.min(total - 1);
        match resolve_attempts(primary, || source.read_frame(fallback_position)) {
            Some(frame) => frames.push(frame),
            None => warn!("丢弃第 {} 帧：两次读取均失败", position),
        }
    }

    pad_to_length(frames, num_frames, origin)
}

/// 用最后一帧补齐到目标长度
fn pad_to_length(mut frames: Vec<RgbImage>, num_frames: usize, origin: &Path) -> Result<Vec<RgbImage>> {
    let last = match frames.last() {
        Some(last) => last.clone(),
        None => return Err(SentimentError::EmptyVideo(origin.to_path_buf())),
    };
    if frames.len() < num_frames {
        warn!(
            "仅解码出 {}/{} 帧，使用最后一帧补齐: {}",
            frames.len(),
            num_frames,
            origin.display()
        );
        frames.resize(num_frames, last);
    }
    Ok(frames)
}

/// 打开视频并采样 `num_frames` 帧（RGB 顺序）
///
/// 视频句柄在返回前释放，包括采样中途失败的情况。
pub fn load_video(path: impl AsRef<Path>, num_frames: usize) -> Result<Vec<RgbImage>> {
    let path = path.as_ref();
    let mut handle = VideoHandle::open(path)?;
    debug!(
        "视频信息: {}x{}, {} 帧, {:.2} fps",
        handle.width(),
        handle.height(),
        handle.frame_count(),
        handle.fps
    );
    sample_frames(&mut handle, num_frames, path)
}

/// FFmpeg 打开的视频句柄
///
/// 持有输入上下文、解码器和 RGB24 缩放器，drop 时一并释放。
pub struct VideoHandle {
    path: PathBuf,
    input: ffmpeg::format::context::Input,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    stream_index: usize,
    time_base: f64,
    start_pts: i64,
    fps: f64,
    total_frames: usize,
}

impl VideoHandle {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let cannot_open = |reason: String| SentimentError::CannotOpen {
            path: path.clone(),
            reason,
        };

        ffmpeg::init().map_err(|e| cannot_open(format!("初始化 FFmpeg 失败: {}", e)))?;
        // 只保留 FFmpeg 的错误日志
        unsafe {
            ffmpeg::sys::av_log_set_level(ffmpeg::sys::AV_LOG_ERROR as i32);
        }

        let input = ffmpeg::format::input(&path).map_err(|e| cannot_open(e.to_string()))?;

        let (stream_index, parameters, time_base, start_pts, fps, total_frames) = {
            let stream = input
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or_else(|| cannot_open("未找到视频流".to_string()))?;

            let tb = stream.time_base();
            let time_base = if tb.denominator() > 0 {
                tb.numerator() as f64 / tb.denominator() as f64
            } else {
                0.0
            };

            let rate = stream.avg_frame_rate();
            let fps = if rate.denominator() > 0 && rate.numerator() > 0 {
                rate.numerator() as f64 / rate.denominator() as f64
            } else {
                0.0
            };

            let total_frames = if stream.frames() > 0 {
                stream.frames() as usize
            } else {
                // 容器没有记录帧数时，用时长 × 帧率估算
                let duration_secs = if stream.duration() > 0 && time_base > 0.0 {
                    stream.duration() as f64 * time_base
                } else if input.duration() > 0 {
                    input.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64
                } else {
                    0.0
                };
                (duration_secs * fps).round().max(0.0) as usize
            };

            let start_pts = if stream.start_time() == ffmpeg::ffi::AV_NOPTS_VALUE {
                0
            } else {
                stream.start_time()
            };

            (stream.index(), stream.parameters(), time_base, start_pts, fps, total_frames)
        };

        let decoder = ffmpeg::codec::context::Context::from_parameters(parameters)
            .map_err(|e| cannot_open(format!("无法创建解码器上下文: {}", e)))?
            .decoder()
            .video()
            .map_err(|e| cannot_open(format!("无法创建视频解码器: {}", e)))?;

        let scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .map_err(|e| cannot_open(format!("无法创建缩放器: {}", e)))?;

        Ok(Self {
            path,
            input,
            decoder,
            scaler,
            stream_index,
            time_base,
            start_pts,
            fps,
            total_frames,
        })
    }

    pub fn width(&self) -> u32 {
        self.decoder.width()
    }

    pub fn height(&self) -> u32 {
        self.decoder.height()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 帧号对应的流内时间戳
    fn frame_pts(&self, index: usize) -> i64 {
        if self.fps <= 0.0 || self.time_base <= 0.0 {
            return self.start_pts;
        }
        self.start_pts + (index as f64 / self.fps / self.time_base).round() as i64
    }

    /// 半帧对应的时间戳跨度，用来容忍 pts 的取整误差
    fn half_frame_ticks(&self) -> i64 {
        if self.fps <= 0.0 || self.time_base <= 0.0 {
            return 0;
        }
        (0.5 / self.fps / self.time_base).floor() as i64
    }

    /// 将 RGB24 帧转换为 RgbImage（按行拷贝，跳过 stride 填充）
    fn frame_to_image(frame: &ffmpeg::frame::Video) -> std::result::Result<RgbImage, FrameReadError> {
        let width = frame.width() as usize;
        let height = frame.height() as usize;
        let stride = frame.stride(0);
        let data = frame.data(0);
        let row_bytes = width * 3;

        let mut buf = Vec::with_capacity(row_bytes * height);
        for y in 0..height {
            let start = y * stride;
            let row = data
                .get(start..start + row_bytes)
                .ok_or_else(|| FrameReadError::Decode("RGB 帧数据不完整".to_string()))?;
            buf.extend_from_slice(row);
        }

        RgbImage::from_raw(width as u32, height as u32, buf)
            .ok_or_else(|| FrameReadError::Decode("RGB 帧尺寸不匹配".to_string()))
    }
}

impl FrameSource for VideoHandle {
    fn frame_count(&self) -> usize {
        self.total_frames
    }

    fn read_frame(&mut self, index: usize) -> FrameAttempt {
        let target = self.frame_pts(index);
        let tolerance = self.half_frame_ticks();

        // Seek 到目标帧之前最近的关键帧
        let ret = unsafe {
            ffmpeg::sys::av_seek_frame(
                self.input.as_mut_ptr(),
                self.stream_index as i32,
                target,
                ffmpeg::sys::AVSEEK_FLAG_BACKWARD as i32,
            )
        };
        if ret < 0 {
            return Err(FrameReadError::Seek(format!("av_seek_frame 返回 {}", ret)));
        }
        self.decoder.flush();

        let stream_index = self.stream_index;
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut packets_read = 0;
        let mut hit = false;

        for (stream, packet) in self.input.packets() {
            if stream.index() != stream_index {
                continue;
            }
            packets_read += 1;
            if packets_read > MAX_PACKETS_PER_SEEK {
                break;
            }
            if let Err(e) = self.decoder.send_packet(&packet) {
                return Err(FrameReadError::Decode(format!("发送数据包失败: {}", e)));
            }
            while self.decoder.receive_frame(&mut decoded).is_ok() {
                let pts = decoded.timestamp().unwrap_or(target);
                if pts + tolerance >= target {
                    hit = true;
                    break;
                }
            }
            if hit {
                break;
            }
        }

        if !hit {
            // 排空解码器中剩余的帧
            if self.decoder.send_eof().is_ok() {
                while self.decoder.receive_frame(&mut decoded).is_ok() {
                    let pts = decoded.timestamp().unwrap_or(target);
                    if pts + tolerance >= target {
                        hit = true;
                        break;
                    }
                }
            }
        }

        if !hit {
            return Err(FrameReadError::EndOfStream);
        }

        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(&decoded, &mut rgb_frame)
            .map_err(|e| FrameReadError::Decode(format!("转换 RGB 失败: {}", e)))?;
        Self::frame_to_image(&rgb_frame)
    }
}

/// 生成 YUV4MPEG2 (4:4:4) 测试片段
///
/// 左半边为纯红色；右半边为灰色，亮度随帧号递增，可以据此判断帧的先后。
#[cfg(test)]
pub(crate) fn y4m_clip(width: u32, height: u32, frames: usize) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let mut out = format!("YUV4MPEG2 W{} H{} F25:1 Ip A1:1 C444\n", width, height).into_bytes();
    for i in 0..frames {
        let gray = 16 + (8 * i).min(219) as u8;
        out.extend_from_slice(b"FRAME\n");
        // (Y, U, V)：BT.601 有限范围的红色，以及中性灰
        for (red, neutral) in [(81u8, gray), (90, 128), (240, 128)] {
            for _ in 0..h {
                for x in 0..w {
                    out.push(if x < w / 2 { red } else { neutral });
                }
            }
        }
    }
    out
}
