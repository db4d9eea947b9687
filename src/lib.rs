pub mod error;
pub mod frame_sampler;
pub mod preprocessor;
pub mod classifier;
pub mod loader;
pub mod config;
pub mod context;
pub mod ingest;
pub mod processor;
pub mod handler;
pub mod dataset;

pub use error::{Result, SentimentError};
pub use frame_sampler::{load_video, FrameSource, VideoHandle, DEFAULT_NUM_FRAMES};
pub use preprocessor::{preprocess, InputConvention, ModelInputBatch, PreprocessorConfig};
pub use classifier::{ClassificationResult, OnnxClassifier, VideoClassifier, LABELS};
pub use loader::{load_components, resolve_model_path, ComponentLoader, LoadedModelState, OnnxComponentLoader};
pub use config::{ConfigLoader, ConfigOverrides, ServiceConfig};
pub use context::AppContext;
pub use processor::predict_video;
