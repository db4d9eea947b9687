use image::RgbImage;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::classifier::{ClassificationResult, OnnxClassifier, VideoClassifier, LABELS};
use crate::error::{Result, SentimentError};
use crate::preprocessor::{preprocess, InputConvention, PreprocessorConfig};

/// 模型目录的环境变量
pub const MODEL_PATH_ENV: &str = "VIDEOMAE_MODEL_PATH";
/// 默认模型目录（训练脚本的输出目录）
pub const DEFAULT_MODEL_PATH: &str = "./videomae_finetuned_final";

pub const MODEL_FILE: &str = "model.onnx";
pub const PREPROCESSOR_CONFIG_FILE: &str = "preprocessor_config.json";
pub const MODEL_CONFIG_FILE: &str = "config.json";

/// 解析模型目录：显式参数 > 环境变量 > 默认路径
pub fn resolve_model_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(MODEL_PATH_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH))
}

/// `config.json` 中推理关心的字段
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub num_frames: Option<usize>,
    #[serde(default)]
    pub id2label: Option<HashMap<String, String>>,
}

/// 已加载的模型组件：预处理配置 + 模型权重
///
/// 加载后只读，可以在多个请求间共享。
pub struct LoadedModelState {
    pub preprocessor: PreprocessorConfig,
    /// 加载时确定的输入约定
    pub convention: InputConvention,
    pub model: Box<dyn VideoClassifier>,
    /// 模型声明的帧数（来自 config.json）
    pub num_frames: Option<usize>,
}

impl LoadedModelState {
    pub fn new(preprocessor: PreprocessorConfig, model: Box<dyn VideoClassifier>) -> Self {
        Self {
            convention: preprocessor.convention(),
            preprocessor,
            model,
            num_frames: None,
        }
    }

    /// 实际使用的采样帧数：模型声明优先于服务配置
    pub fn effective_num_frames(&self, configured: usize) -> usize {
        match self.num_frames {
            Some(n) if n > 0 => {
                if n != configured {
                    warn!("模型声明的帧数 {} 覆盖了配置的帧数 {}", n, configured);
                }
                n
            }
            _ => configured,
        }
    }

    /// 对已采样的帧序列做预处理和分类
    pub fn classify_frames(&self, frames: &[RgbImage]) -> Result<ClassificationResult> {
        let batch = preprocess(frames, &self.preprocessor, self.convention, self.model.input_name())?;
        self.model.classify(batch)
    }
}

/// 加载模型组件的抽象，便于在服务层替换
pub trait ComponentLoader: Send + Sync {
    fn load(&self) -> Result<LoadedModelState>;
}

/// 从磁盘上的模型目录加载 ONNX 模型
pub struct OnnxComponentLoader {
    pub model_path: PathBuf,
    pub intra_threads: usize,
}

impl OnnxComponentLoader {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            intra_threads: default_intra_threads(),
        }
    }
}

impl ComponentLoader for OnnxComponentLoader {
    fn load(&self) -> Result<LoadedModelState> {
        load_components(&self.model_path, self.intra_threads)
    }
}

/// ONNX 推理默认线程数：可用核心数
pub fn default_intra_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// 加载模型目录
///
/// 无状态、可重入：同一路径调用两次会得到两份等价的组件。
/// 调用方负责缓存返回值，不应每个请求都加载一次。
pub fn load_components(model_path: &Path, intra_threads: usize) -> Result<LoadedModelState> {
    if !model_path.exists() {
        return Err(SentimentError::ModelNotFound {
            path: model_path.to_path_buf(),
        });
    }

    let model_file = model_path.join(MODEL_FILE);
    if !model_file.exists() {
        return Err(SentimentError::ModelNotFound { path: model_file });
    }

    let preprocessor = load_preprocessor_config(model_path)?;
    let model_config = load_model_config(model_path)?;
    let model = OnnxClassifier::load(&model_file, intra_threads)?;
    let convention = preprocessor.convention();

    info!(
        "模型组件加载完成: {} (输入约定: {:?}, 帧数: {:?})",
        model_path.display(),
        convention,
        model_config.num_frames
    );

    Ok(LoadedModelState {
        preprocessor,
        convention,
        model: Box::new(model),
        num_frames: model_config.num_frames,
    })
}

fn load_preprocessor_config(model_path: &Path) -> Result<PreprocessorConfig> {
    let path = model_path.join(PREPROCESSOR_CONFIG_FILE);
    if path.exists() {
        PreprocessorConfig::from_file(&path)
    } else {
        warn!("未找到 {}，使用 VideoMAE 默认预处理参数", path.display());
        Ok(PreprocessorConfig::default())
    }
}

fn load_model_config(model_path: &Path) -> Result<ModelConfig> {
    let path = model_path.join(MODEL_CONFIG_FILE);
    if !path.exists() {
        return Ok(ModelConfig::default());
    }

    let text = std::fs::read_to_string(&path)?;
    let config: ModelConfig = serde_json::from_str(&text)
        .map_err(|e| SentimentError::InferenceFailure(format!("解析模型配置失败: {}: {}", path.display(), e)))?;

    if let Some(id2label) = &config.id2label {
        if id2label.len() != LABELS.len() {
            return Err(SentimentError::InferenceFailure(format!(
                "模型声明了 {} 个类别，期望 {}",
                id2label.len(),
                LABELS.len()
            )));
        }
    }
    Ok(config)
}
