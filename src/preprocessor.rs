use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::{Array5, ArrayD};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, SentimentError};

/// VideoMAE 默认使用的 ImageNet 均值/方差
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 模型默认的输入张量名
pub const DEFAULT_INPUT_NAME: &str = "pixel_values";

/// 预处理器接受输入的方式，加载时确定一次
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InputConvention {
    /// 视频处理器：整段视频统一做短边缩放 + 中心裁剪
    VideoKeyed,
    /// 图像列表处理器：逐帧直接缩放到固定宽高
    ImageListKeyed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SizeSpec {
    #[serde(default)]
    pub shortest_edge: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub width: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CropSize {
    pub height: u32,
    pub width: u32,
}

/// `preprocessor_config.json` 中与推理相关的字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessorConfig {
    #[serde(default)]
    pub image_processor_type: Option<String>,
    #[serde(default = "default_true")]
    pub do_resize: bool,
    #[serde(default = "default_size")]
    pub size: SizeSpec,
    #[serde(default)]
    pub do_center_crop: Option<bool>,
    #[serde(default)]
    pub crop_size: Option<CropSize>,
    #[serde(default = "default_true")]
    pub do_rescale: bool,
    #[serde(default = "default_rescale_factor")]
    pub rescale_factor: f32,
    #[serde(default = "default_true")]
    pub do_normalize: bool,
    #[serde(default = "default_mean")]
    pub image_mean: Vec<f32>,
    #[serde(default = "default_std")]
    pub image_std: Vec<f32>,
    /// PIL 重采样编号：0 最近邻, 1 Lanczos, 2 双线性, 3 双三次
    #[serde(default = "default_resample")]
    pub resample: u32,
}

fn default_true() -> bool {
    true
}

fn default_size() -> SizeSpec {
    SizeSpec {
        shortest_edge: Some(224),
        height: None,
        width: None,
    }
}

fn default_rescale_factor() -> f32 {
    1.0 / 255.0
}

fn default_mean() -> Vec<f32> {
    IMAGENET_MEAN.to_vec()
}

fn default_std() -> Vec<f32> {
    IMAGENET_STD.to_vec()
}

fn default_resample() -> u32 {
    2
}

impl Default for PreprocessorConfig {
    /// 与 VideoMAEImageProcessor 的默认值一致
    fn default() -> Self {
        Self {
            image_processor_type: Some("VideoMAEImageProcessor".to_string()),
            do_resize: true,
            size: default_size(),
            do_center_crop: Some(true),
            crop_size: Some(CropSize {
                height: 224,
                width: 224,
            }),
            do_rescale: true,
            rescale_factor: default_rescale_factor(),
            do_normalize: true,
            image_mean: default_mean(),
            image_std: default_std(),
            resample: default_resample(),
        }
    }
}

impl PreprocessorConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            SentimentError::InferenceFailure(format!("解析预处理配置失败: {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.image_mean.len() != 3 || self.image_std.len() != 3 {
            return Err(SentimentError::InferenceFailure(format!(
                "image_mean/image_std 需要 3 个通道值，实际为 {}/{}",
                self.image_mean.len(),
                self.image_std.len()
            )));
        }
        if self.image_std.iter().any(|s| *s == 0.0) {
            return Err(SentimentError::InferenceFailure("image_std 不能为 0".to_string()));
        }
        Ok(())
    }

    /// 根据处理器声明的能力确定输入约定，加载模型时调用一次
    pub fn convention(&self) -> InputConvention {
        let declares_video = self
            .image_processor_type
            .as_deref()
            .map(|t| t.contains("Video"))
            .unwrap_or(false);
        let crops_shortest_edge = self.size.shortest_edge.is_some() && self.crop_size.is_some();

        if declares_video || crops_shortest_edge {
            InputConvention::VideoKeyed
        } else {
            InputConvention::ImageListKeyed
        }
    }

    /// 输出张量的空间尺寸 (height, width)
    pub fn output_size(&self, convention: InputConvention) -> (u32, u32) {
        match convention {
            InputConvention::VideoKeyed => match (&self.crop_size, self.do_center_crop.unwrap_or(true)) {
                (Some(crop), true) => (crop.height, crop.width),
                _ => match (self.size.shortest_edge, self.size.height, self.size.width) {
                    (None, Some(height), Some(width)) => (height, width),
                    (edge, _, _) => {
                        let edge = edge.unwrap_or(224);
                        (edge, edge)
                    }
                },
            },
            InputConvention::ImageListKeyed => {
                let height = self.size.height.or(self.size.shortest_edge).unwrap_or(224);
                let width = self.size.width.or(self.size.shortest_edge).unwrap_or(224);
                (height, width)
            }
        }
    }

    fn filter(&self) -> FilterType {
        match self.resample {
            0 => FilterType::Nearest,
            1 => FilterType::Lanczos3,
            3 => FilterType::CatmullRom,
            _ => FilterType::Triangle,
        }
    }
}

/// 送入模型的一组命名张量，batch 维为 1
#[derive(Debug, Clone)]
pub struct ModelInputBatch {
    pub tensors: Vec<(String, ArrayD<f32>)>,
}

impl ModelInputBatch {
    pub fn single(name: impl Into<String>, tensor: ArrayD<f32>) -> Self {
        Self {
            tensors: vec![(name.into(), tensor)],
        }
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }
}

/// 将帧序列转换为模型输入 `[1, T, 3, H, W]`
///
/// `convention` 由加载阶段的 [`PreprocessorConfig::convention`] 给出。
pub fn preprocess(
    frames: &[RgbImage],
    config: &PreprocessorConfig,
    convention: InputConvention,
    input_name: &str,
) -> Result<ModelInputBatch> {
    if frames.is_empty() {
        return Err(SentimentError::InferenceFailure("帧序列为空".to_string()));
    }

    let (height, width) = config.output_size(convention);
    let mut tensor = Array5::<f32>::zeros((1, frames.len(), 3, height as usize, width as usize));

    for (t, frame) in frames.iter().enumerate() {
        let prepared = match convention {
            InputConvention::VideoKeyed => resize_and_crop(frame, config, height, width),
            InputConvention::ImageListKeyed => resize_exact(frame, config, height, width),
        };

        for (x, y, pixel) in prepared.enumerate_pixels() {
            for c in 0..3 {
                let mut value = pixel[c] as f32;
                if config.do_rescale {
                    value *= config.rescale_factor;
                }
                if config.do_normalize {
                    value = (value - config.image_mean[c]) / config.image_std[c];
                }
                tensor[[0, t, c, y as usize, x as usize]] = value;
            }
        }
    }

    Ok(ModelInputBatch::single(input_name, tensor.into_dyn()))
}

/// 视频约定：缩放（短边到 `shortest_edge`，或直接到 `height × width`），再中心裁剪
fn resize_and_crop(frame: &RgbImage, config: &PreprocessorConfig, height: u32, width: u32) -> RgbImage {
    let (w, h) = frame.dimensions();
    let size = &config.size;
    let resized = match (config.do_resize, size.shortest_edge, size.height, size.width) {
        (true, Some(edge), _, _) => {
            let (new_w, new_h) = if w <= h {
                (edge, (edge as u64 * h as u64 / w.max(1) as u64) as u32)
            } else {
                ((edge as u64 * w as u64 / h.max(1) as u64) as u32, edge)
            };
            imageops::resize(frame, new_w.max(1), new_h.max(1), config.filter())
        }
        (true, None, Some(size_h), Some(size_w)) => {
            imageops::resize(frame, size_w.max(1), size_h.max(1), config.filter())
        }
        _ => frame.clone(),
    };

    let (rw, rh) = resized.dimensions();
    if rw < width || rh < height {
        return imageops::resize(&resized, width, height, config.filter());
    }
    let left = (rw - width) / 2;
    let top = (rh - height) / 2;
    imageops::crop_imm(&resized, left, top, width, height).to_image()
}

/// 图像列表约定：逐帧直接缩放
fn resize_exact(frame: &RgbImage, config: &PreprocessorConfig, height: u32, width: u32) -> RgbImage {
    if frame.dimensions() == (width, height) {
        return frame.clone();
    }
    imageops::resize(frame, width, height, config.filter())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn frames(n: usize, w: u32, h: u32) -> Vec<RgbImage> {
        (0..n).map(|_| RgbImage::from_pixel(w, h, Rgb([255, 128, 0]))).collect()
    }

    #[test]
    fn videomae_config_is_video_keyed() {
        let json = r#"{
            "crop_size": {"height": 224, "width": 224},
            "do_center_crop": true,
            "do_normalize": true,
            "do_rescale": true,
            "do_resize": true,
            "image_mean": [0.485, 0.456, 0.406],
            "image_processor_type": "VideoMAEImageProcessor",
            "image_std": [0.229, 0.224, 0.225],
            "resample": 2,
            "rescale_factor": 0.00392156862745098,
            "size": {"shortest_edge": 224}
        }"#;
        let config: PreprocessorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.convention(), InputConvention::VideoKeyed);
        assert_eq!(config.output_size(InputConvention::VideoKeyed), (224, 224));
    }

    #[test]
    fn image_processor_config_is_image_list_keyed() {
        let json = r#"{
            "image_processor_type": "ViTImageProcessor",
            "size": {"height": 160, "width": 192},
            "image_mean": [0.5, 0.5, 0.5],
            "image_std": [0.5, 0.5, 0.5]
        }"#;
        let config: PreprocessorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.convention(), InputConvention::ImageListKeyed);
        assert_eq!(config.output_size(config.convention()), (160, 192));
    }

    #[test]
    fn video_keyed_shape_and_normalization() {
        let config = PreprocessorConfig::default();
        let batch = preprocess(&frames(16, 320, 240), &config, config.convention(), DEFAULT_INPUT_NAME).unwrap();
        let tensor = batch.get(DEFAULT_INPUT_NAME).unwrap();
        assert_eq!(tensor.shape(), &[1, 16, 3, 224, 224]);

        let expected_r = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        let expected_b = (0.0 - IMAGENET_MEAN[2]) / IMAGENET_STD[2];
        assert!((tensor[[0, 0, 0, 10, 10]] - expected_r).abs() < 1e-4);
        assert!((tensor[[0, 15, 2, 200, 100]] - expected_b).abs() < 1e-4);
    }

    #[test]
    fn image_list_keyed_shape_uses_config_constants() {
        let config = PreprocessorConfig {
            image_processor_type: Some("ViTImageProcessor".into()),
            size: SizeSpec {
                shortest_edge: None,
                height: Some(32),
                width: Some(48),
            },
            do_center_crop: None,
            crop_size: None,
            image_mean: vec![0.5, 0.5, 0.5],
            image_std: vec![0.5, 0.5, 0.5],
            ..PreprocessorConfig::default()
        };
        let batch = preprocess(&frames(8, 64, 64), &config, config.convention(), "video").unwrap();
        let tensor = batch.get("video").unwrap();
        assert_eq!(tensor.shape(), &[1, 8, 3, 32, 48]);
        assert!((tensor[[0, 0, 0, 0, 0]] - 1.0).abs() < 1e-4);
        assert!((tensor[[0, 0, 2, 0, 0]] + 1.0).abs() < 1e-4);
    }

    #[test]
    fn center_crop_keeps_middle() {
        // 左半黑、右半白的宽图，中心裁剪后两侧都应保留
        let mut img = RgbImage::new(448, 224);
        for (x, _, p) in img.enumerate_pixels_mut() {
            *p = if x < 224 { Rgb([0, 0, 0]) } else { Rgb([255, 255, 255]) };
        }
        let config = PreprocessorConfig {
            do_normalize: false,
            do_rescale: false,
            resample: 0,
            ..PreprocessorConfig::default()
        };
        let batch = preprocess(&[img], &config, InputConvention::VideoKeyed, DEFAULT_INPUT_NAME).unwrap();
        let tensor = batch.get(DEFAULT_INPUT_NAME).unwrap();
        assert_eq!(tensor[[0, 0, 0, 100, 0]], 0.0);
        assert_eq!(tensor[[0, 0, 0, 100, 223]], 255.0);
    }

    #[test]
    fn video_processor_with_fixed_size_resizes_before_cropping() {
        let config: PreprocessorConfig = serde_json::from_str(
            r#"{
                "image_processor_type": "VideoMAEImageProcessor",
                "size": {"height": 224, "width": 224},
                "crop_size": {"height": 224, "width": 224},
                "do_rescale": false,
                "do_normalize": false,
                "resample": 0
            }"#,
        )
        .unwrap();
        assert_eq!(config.convention(), InputConvention::VideoKeyed);

        // 640x480，左侧 100 列为红色；缩放后红带仍应出现在第 0 列
        let mut img = RgbImage::from_pixel(640, 480, Rgb([0, 0, 255]));
        for (x, _, p) in img.enumerate_pixels_mut() {
            if x < 100 {
                *p = Rgb([255, 0, 0]);
            }
        }
        let batch = preprocess(&[img], &config, config.convention(), DEFAULT_INPUT_NAME).unwrap();
        let tensor = batch.get(DEFAULT_INPUT_NAME).unwrap();
        assert_eq!(tensor.shape(), &[1, 1, 3, 224, 224]);
        assert_eq!(tensor[[0, 0, 0, 112, 0]], 255.0);
        assert_eq!(tensor[[0, 0, 2, 112, 0]], 0.0);
        assert_eq!(tensor[[0, 0, 2, 112, 223]], 255.0);
    }

    #[test]
    fn empty_sequence_is_inference_failure() {
        let err = preprocess(&[], &PreprocessorConfig::default(), InputConvention::VideoKeyed, DEFAULT_INPUT_NAME).unwrap_err();
        assert!(matches!(err, SentimentError::InferenceFailure(_)));
    }

    #[test]
    fn rejects_bad_channel_stats() {
        let dir = std::env::temp_dir().join(format!("vs-pre-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("preprocessor_config.json");
        std::fs::write(&path, r#"{"image_mean": [0.5], "image_std": [0.5]}"#).unwrap();
        assert!(PreprocessorConfig::from_file(&path).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
