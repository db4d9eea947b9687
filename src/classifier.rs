use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionInputValue};
use ort::value::Tensor;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, SentimentError};
use crate::preprocessor::{ModelInputBatch, DEFAULT_INPUT_NAME};

/// 固定的二分类标签：0 = 正面, 1 = 负面
pub const LABELS: [&str; 2] = ["POSITIVE", "NEGATIVE"];

/// 单次推理的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// 预测类别 (0 或 1)
    pub label_index: usize,
    /// 类别名称
    pub label: String,
    /// 预测类别的概率
    pub confidence: f64,
    /// 两个类别的完整概率分布
    pub probabilities: BTreeMap<String, f64>,
}

/// 数值稳定的 softmax（先减去最大值）
pub fn softmax(logits: &[f32]) -> Vec<f64> {
    let max = logits
        .iter()
        .map(|&l| l as f64)
        .fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|&l| (l as f64 - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// 由 logits 得出分类结果：softmax + argmax，并列时取较小的下标
pub fn decide(logits: &[f32]) -> Result<ClassificationResult> {
    if logits.len() != LABELS.len() {
        return Err(SentimentError::InferenceFailure(format!(
            "模型输出 {} 个 logits，期望 {}",
            logits.len(),
            LABELS.len()
        )));
    }
    if logits.iter().any(|l| !l.is_finite()) {
        return Err(SentimentError::InferenceFailure(format!("logits 含有非有限值: {:?}", logits)));
    }

    let probs = softmax(logits);
    let mut label_index = 0;
    for (i, p) in probs.iter().enumerate() {
        if *p > probs[label_index] {
            label_index = i;
        }
    }

    let probabilities = LABELS
        .iter()
        .zip(probs.iter())
        .map(|(label, p)| (label.to_string(), *p))
        .collect();

    Ok(ClassificationResult {
        label_index,
        label: LABELS[label_index].to_string(),
        confidence: probs[label_index],
        probabilities,
    })
}

/// 视频分类模型：对一个样本做一次前向推理，返回 logits
pub trait VideoClassifier: Send + Sync {
    /// 模型期望的输入张量名
    fn input_name(&self) -> &str;

    /// 单次前向推理（batch = 1），返回类别 logits
    fn forward(&self, batch: ModelInputBatch) -> Result<Vec<f32>>;

    /// 前向推理 + softmax + argmax
    fn classify(&self, batch: ModelInputBatch) -> Result<ClassificationResult> {
        let logits = self.forward(batch)?;
        debug!("logits: {:?}", logits);
        decide(&logits)
    }
}

/// 基于 ONNX Runtime 的分类器
///
/// `Session::run` 需要可变借用，这里用 Mutex 串行化前向推理；
/// 解码和预处理仍然可以在多个请求间并行。
pub struct OnnxClassifier {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
}

impl OnnxClassifier {
    pub fn load(model_file: impl AsRef<Path>, intra_threads: usize) -> Result<Self> {
        let model_file = model_file.as_ref();
        info!("正在加载 ONNX 模型: {}", model_file.display());

        let session = Session::builder()
            .map_err(|e| SentimentError::InferenceFailure(format!("创建 ONNX 会话失败: {}", e)))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| SentimentError::InferenceFailure(format!("设置优化级别失败: {}", e)))?
            .with_intra_threads(intra_threads.max(1))
            .map_err(|e| SentimentError::InferenceFailure(format!("设置线程数失败: {}", e)))?
            .commit_from_file(model_file)
            .map_err(|e| {
                SentimentError::InferenceFailure(format!("加载模型失败: {}: {}", model_file.display(), e))
            })?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .unwrap_or_else(|| DEFAULT_INPUT_NAME.to_string());
        let output_name = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or_else(|| SentimentError::InferenceFailure("模型没有输出节点".to_string()))?;

        info!("模型已加载: input={}, output={}", input_name, output_name);

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
        })
    }
}

impl VideoClassifier for OnnxClassifier {
    fn input_name(&self) -> &str {
        &self.input_name
    }

    fn forward(&self, batch: ModelInputBatch) -> Result<Vec<f32>> {
        let mut inputs: Vec<(Cow<'_, str>, SessionInputValue<'_>)> = Vec::with_capacity(batch.tensors.len());
        for (name, array) in batch.tensors {
            let tensor = Tensor::from_array(array)?;
            inputs.push((Cow::Owned(name), SessionInputValue::from(tensor.into_dyn())));
        }

        let mut session = self
            .session
            .lock()
            .map_err(|_| SentimentError::InferenceFailure("ONNX 会话锁已中毒".to_string()))?;
        let outputs = session.run(inputs)?;

        let logits = outputs
            .get(self.output_name.as_str())
            .ok_or_else(|| SentimentError::InferenceFailure(format!("缺少输出节点: {}", self.output_name)))?;
        let (shape, data) = logits.try_extract_tensor::<f32>()?;

        if shape.first().copied().unwrap_or(1) != 1 {
            return Err(SentimentError::InferenceFailure(format!(
                "输出 batch 维应为 1，实际形状 {:?}",
                shape
            )));
        }
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    #[test]
    fn softmax_sums_to_one() {
        let cases: [&[f32]; 5] = [&[0.0, 0.0], &[2.5, -1.0], &[-300.0, 300.0], &[1e-8, 1e-8], &[88.0, 87.5]];
        for logits in cases {
            let probs = softmax(logits);
            let sum: f64 = probs.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6, "{logits:?} -> {probs:?}");
            assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
        }
    }

    #[test]
    fn decide_picks_argmax_and_reports_both_classes() {
        let result = decide(&[-0.4, 1.6]).unwrap();
        assert_eq!(result.label_index, 1);
        assert_eq!(result.label, "NEGATIVE");
        assert_eq!(result.probabilities.len(), 2);
        assert_eq!(result.confidence, result.probabilities["NEGATIVE"]);
        let sum: f64 = result.probabilities.values().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(result.confidence > 0.5);
    }

    #[test]
    fn ties_go_to_positive() {
        let result = decide(&[0.3, 0.3]).unwrap();
        assert_eq!(result.label_index, 0);
        assert_eq!(result.label, "POSITIVE");
        assert!((result.confidence - 0.5).abs() < 1e-12);
    }

    #[test]
    fn wrong_class_count_is_inference_failure() {
        assert!(matches!(decide(&[1.0, 2.0, 3.0]), Err(SentimentError::InferenceFailure(_))));
        assert!(matches!(decide(&[]), Err(SentimentError::InferenceFailure(_))));
        assert!(matches!(decide(&[f32::NAN, 1.0]), Err(SentimentError::InferenceFailure(_))));
    }

    struct FixedLogits(Vec<f32>);

    impl VideoClassifier for FixedLogits {
        fn input_name(&self) -> &str {
            DEFAULT_INPUT_NAME
        }

        fn forward(&self, batch: ModelInputBatch) -> Result<Vec<f32>> {
            assert!(batch.get(DEFAULT_INPUT_NAME).is_some());
            Ok(self.0.clone())
        }
    }

    #[test]
    fn classify_is_deterministic() {
        let model = FixedLogits(vec![0.7, -0.2]);
        let batch = || ModelInputBatch::single(DEFAULT_INPUT_NAME, ArrayD::zeros(vec![1, 16, 3, 4, 4]));
        let a = model.classify(batch()).unwrap();
        let b = model.classify(batch()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.label_index, 0);
    }

    #[test]
    fn missing_model_file_fails_to_load() {
        let result = OnnxClassifier::load("/nonexistent/model.onnx", 1);
        assert!(matches!(result, Err(SentimentError::InferenceFailure(_))));
    }
}
