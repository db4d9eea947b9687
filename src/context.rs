use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::error::{Result, SentimentError};
use crate::loader::{ComponentLoader, LoadedModelState, OnnxComponentLoader};

/// 服务级共享状态
///
/// 模型组件在第一次需要时加载，之后所有请求共享同一份。
/// 加载失败不会被缓存，下一个请求会重新尝试。
pub struct AppContext {
    pub config: ServiceConfig,
    pub http: reqwest::Client,
    loader: Arc<dyn ComponentLoader>,
    slot: Mutex<Option<Arc<LoadedModelState>>>,
}

impl AppContext {
    /// 按配置构建，使用磁盘上的 ONNX 模型目录
    pub fn new(config: ServiceConfig) -> Self {
        let loader = Arc::new(OnnxComponentLoader::new(config.model_path.clone()));
        Self::with_loader(config, loader)
    }

    pub fn with_loader(config: ServiceConfig, loader: Arc<dyn ComponentLoader>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.download_timeout_secs.max(1)))
            .build()
            .unwrap_or_else(|e| {
                warn!("构建 HTTP 客户端失败，使用默认配置: {}", e);
                reqwest::Client::new()
            });
        Self {
            config,
            http,
            loader,
            slot: Mutex::new(None),
        }
    }

    /// 取得模型组件，必要时加载
    ///
    /// 并发调用时只有一个会真正执行加载，其余等待同一结果。
    pub async fn components(&self) -> Result<Arc<LoadedModelState>> {
        let mut slot = self.slot.lock().await;
        if let Some(state) = slot.as_ref() {
            return Ok(state.clone());
        }

        info!("正在加载模型组件: {}", self.config.model_path.display());
        let loader = self.loader.clone();
        let state = tokio::task::spawn_blocking(move || loader.load())
            .await
            .map_err(|e| SentimentError::InferenceFailure(format!("模型加载任务异常退出: {}", e)))??;

        let state = Arc::new(state);
        *slot = Some(state.clone());
        Ok(state)
    }

    pub async fn is_loaded(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// 释放已加载的模型组件
    pub async fn shutdown(&self) {
        if self.slot.lock().await.take().is_some() {
            info!("模型组件已释放");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::VideoClassifier;
    use crate::preprocessor::{ModelInputBatch, PreprocessorConfig};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Constant;

    impl VideoClassifier for Constant {
        fn input_name(&self) -> &str {
            "pixel_values"
        }
        fn forward(&self, _batch: ModelInputBatch) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
    }

    /// 记录调用次数；前 `failures` 次返回 ModelNotFound
    struct CountingLoader {
        calls: AtomicUsize,
        failures: usize,
    }

    impl CountingLoader {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failures,
            })
        }
    }

    impl ComponentLoader for CountingLoader {
        fn load(&self) -> Result<LoadedModelState> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            if n < self.failures {
                return Err(SentimentError::ModelNotFound {
                    path: PathBuf::from("/missing"),
                });
            }
            Ok(LoadedModelState::new(PreprocessorConfig::default(), Box::new(Constant)))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_use_loads_once() {
        let loader = CountingLoader::new(0);
        let ctx = Arc::new(AppContext::with_loader(ServiceConfig::default(), loader.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ctx = ctx.clone();
                tokio::spawn(async move { ctx.components().await.map(|_| ()) })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert!(ctx.is_loaded().await);

        let a = ctx.components().await.unwrap();
        let b = ctx.components().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_load_is_retried() {
        let loader = CountingLoader::new(1);
        let ctx = AppContext::with_loader(ServiceConfig::default(), loader.clone());

        assert!(matches!(ctx.components().await, Err(SentimentError::ModelNotFound { .. })));
        assert!(!ctx.is_loaded().await);

        assert!(ctx.components().await.is_ok());
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_releases_components() {
        let loader = CountingLoader::new(0);
        let ctx = AppContext::with_loader(ServiceConfig::default(), loader.clone());

        ctx.components().await.unwrap();
        ctx.shutdown().await;
        assert!(!ctx.is_loaded().await);

        ctx.components().await.unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }
}
