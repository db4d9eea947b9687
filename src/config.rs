use anyhow::Result;
use std::env;
use std::path::{Path, PathBuf};

use crate::frame_sampler::DEFAULT_NUM_FRAMES;
use crate::loader::{DEFAULT_MODEL_PATH, MODEL_PATH_ENV};

pub const DEFAULT_MAX_FILE_SIZE_MB: u64 = 300;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_PORT: u16 = 8000;

/// 服务配置
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// 模型目录
    pub model_path: PathBuf,
    /// 每个视频采样的帧数
    pub num_frames: usize,
    /// 下载/上传大小上限（MB）
    pub max_file_size_mb: u64,
    /// 下载超时（秒）
    pub download_timeout_secs: u64,
    /// 监听地址
    pub bind: String,
    /// 临时视频文件目录
    pub temp_dir: PathBuf,
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            num_frames: DEFAULT_NUM_FRAMES,
            max_file_size_mb: DEFAULT_MAX_FILE_SIZE_MB,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            bind: format!("0.0.0.0:{}", DEFAULT_PORT),
            temp_dir: default_temp_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }
}

pub fn default_temp_dir() -> PathBuf {
    env::temp_dir().join("video-sentiment")
}

/// 命令行覆盖项
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub model_path: Option<PathBuf>,
    pub num_frames: Option<usize>,
    pub bind: Option<String>,
}

/// 单个来源（环境变量或配置文件）读到的值，缺失的项为 None
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialConfig {
    pub model_path: Option<PathBuf>,
    pub num_frames: Option<usize>,
    pub max_file_size_mb: Option<u64>,
    pub download_timeout_secs: Option<u64>,
    pub bind: Option<String>,
    pub temp_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    pub fn load_config(config_file: Option<&Path>, overrides: ConfigOverrides) -> Result<ServiceConfig> {
        // 1. 先加载配置文件（如果存在）
        let file_config = match config_file {
            Some(config_path) => Some(Self::load_from_file(config_path)?),
            None => Self::load_from_default_locations().ok(),
        };

        // 2. 加载环境变量
        let env_config = Self::load_from_env();

        // 3. 合并
        Ok(Self::merge(overrides, env_config, file_config.unwrap_or_default()))
    }

    /// 按优先级合并各来源
    pub fn merge(cli: ConfigOverrides, env_config: PartialConfig, file_config: PartialConfig) -> ServiceConfig {
        let defaults = ServiceConfig::default();
        ServiceConfig {
            model_path: cli
                .model_path
                .or(env_config.model_path)
                .or(file_config.model_path)
                .unwrap_or(defaults.model_path),
            num_frames: cli
                .num_frames
                .or(env_config.num_frames)
                .or(file_config.num_frames)
                .filter(|n| *n > 0)
                .unwrap_or(defaults.num_frames),
            max_file_size_mb: env_config
                .max_file_size_mb
                .or(file_config.max_file_size_mb)
                .unwrap_or(defaults.max_file_size_mb),
            download_timeout_secs: env_config
                .download_timeout_secs
                .or(file_config.download_timeout_secs)
                .unwrap_or(defaults.download_timeout_secs),
            bind: cli
                .bind
                .or(env_config.bind)
                .or(file_config.bind)
                .unwrap_or(defaults.bind),
            temp_dir: env_config
                .temp_dir
                .or(file_config.temp_dir)
                .unwrap_or(defaults.temp_dir),
            log_level: env_config
                .log_level
                .or(file_config.log_level)
                .unwrap_or(defaults.log_level),
        }
    }

    /// 从环境变量加载配置
    fn load_from_env() -> PartialConfig {
        PartialConfig {
            model_path: env::var_os(MODEL_PATH_ENV).map(PathBuf::from),
            num_frames: env::var("VIDEO_SENTIMENT_NUM_FRAMES")
                .ok()
                .and_then(|v| v.parse().ok()),
            max_file_size_mb: env::var("VIDEO_SENTIMENT_MAX_FILE_SIZE_MB")
                .ok()
                .and_then(|v| v.parse().ok()),
            download_timeout_secs: env::var("VIDEO_SENTIMENT_DOWNLOAD_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok()),
            bind: env::var("VIDEO_SENTIMENT_PORT")
                .ok()
                .map(|port| format!("0.0.0.0:{}", port)),
            temp_dir: env::var_os("VIDEO_SENTIMENT_TEMP_DIR").map(PathBuf::from),
            log_level: env::var("LOG_LEVEL").ok(),
        }
    }

    /// 从INI配置文件加载配置
    pub fn load_from_file(config_path: &Path) -> Result<PartialConfig> {
        if !config_path.exists() {
            return Err(anyhow::anyhow!("配置文件不存在: {}", config_path.display()));
        }

        let mut config_parser = configparser::ini::Ini::new();
        config_parser
            .load(config_path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;

        // 尝试从对应节读取，如果没有则使用 [DEFAULT] 节
        let get = |section: &str, key: &str| {
            config_parser
                .get(section, key)
                .or_else(|| config_parser.get("DEFAULT", key))
                .filter(|v| !v.is_empty())
        };

        Ok(PartialConfig {
            model_path: get("video_sentiment", "model_path").map(PathBuf::from),
            num_frames: get("video_sentiment", "num_frames").and_then(|v| v.parse().ok()),
            max_file_size_mb: get("video_sentiment", "max_file_size_mb").and_then(|v| v.parse().ok()),
            download_timeout_secs: get("video_sentiment", "download_timeout").and_then(|v| v.parse().ok()),
            bind: get("server", "bind"),
            temp_dir: get("video_sentiment", "temp_dir").map(PathBuf::from),
            log_level: get("logging", "level"),
        })
    }

    /// 从默认位置加载配置文件
    fn load_from_default_locations() -> Result<PartialConfig> {
        let mut candidates = vec![
            // 1. 当前目录的 video-sentiment.ini
            PathBuf::from("video-sentiment.ini"),
            // 2. 当前目录的 .video-sentiment.ini
            PathBuf::from(".video-sentiment.ini"),
        ];
        // 3. 用户主目录的 .video-sentiment.ini
        if let Some(home) = env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(".video-sentiment.ini"));
        }
        // 4. /etc/video-sentiment.ini (Linux/macOS)
        candidates.push(PathBuf::from("/etc/video-sentiment.ini"));

        for candidate in candidates {
            if candidate.exists() {
                return Self::load_from_file(&candidate);
            }
        }

        Err(anyhow::anyhow!("未找到配置文件"))
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let defaults = ServiceConfig::default();
        let mut config_parser = configparser::ini::Ini::new();
        config_parser.set(
            "video_sentiment",
            "model_path",
            Some(defaults.model_path.to_string_lossy().to_string()),
        );
        config_parser.set("video_sentiment", "num_frames", Some(defaults.num_frames.to_string()));
        config_parser.set(
            "video_sentiment",
            "max_file_size_mb",
            Some(defaults.max_file_size_mb.to_string()),
        );
        config_parser.set(
            "video_sentiment",
            "download_timeout",
            Some(defaults.download_timeout_secs.to_string()),
        );
        config_parser.set("video_sentiment", "temp_dir", Some("".to_string()));
        config_parser.set("server", "bind", Some(defaults.bind));
        config_parser.set("logging", "level", Some(defaults.log_level));

        config_parser
            .write(config_path)
            .map_err(|e| anyhow::anyhow!("写入配置文件失败: {}: {}", config_path.display(), e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_file(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("vs-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = ConfigLoader::merge(ConfigOverrides::default(), PartialConfig::default(), PartialConfig::default());
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.num_frames, 16);
        assert_eq!(config.max_file_size_bytes(), 300 * 1024 * 1024);
        assert_eq!(config.model_path, PathBuf::from("./videomae_finetuned_final"));
    }

    #[test]
    fn cli_beats_env_beats_file() {
        let file = PartialConfig {
            model_path: Some("/file/model".into()),
            num_frames: Some(8),
            max_file_size_mb: Some(50),
            bind: Some("127.0.0.1:1000".into()),
            ..PartialConfig::default()
        };
        let env_config = PartialConfig {
            model_path: Some("/env/model".into()),
            num_frames: Some(12),
            ..PartialConfig::default()
        };
        let cli = ConfigOverrides {
            model_path: Some("/cli/model".into()),
            ..ConfigOverrides::default()
        };

        let config = ConfigLoader::merge(cli, env_config, file);
        assert_eq!(config.model_path, PathBuf::from("/cli/model"));
        assert_eq!(config.num_frames, 12);
        assert_eq!(config.max_file_size_mb, 50);
        assert_eq!(config.bind, "127.0.0.1:1000");
    }

    #[test]
    fn huge_size_limit_saturates() {
        let config = ServiceConfig {
            max_file_size_mb: u64::MAX / 2,
            ..ServiceConfig::default()
        };
        assert_eq!(config.max_file_size_bytes(), u64::MAX);
    }

    #[test]
    fn zero_frames_falls_back_to_default() {
        let cli = ConfigOverrides {
            num_frames: Some(0),
            ..ConfigOverrides::default()
        };
        let config = ConfigLoader::merge(cli, PartialConfig::default(), PartialConfig::default());
        assert_eq!(config.num_frames, DEFAULT_NUM_FRAMES);
    }

    #[test]
    fn default_config_file_round_trips_through_loader() {
        let path = scratch_file("video-sentiment.ini");
        ConfigLoader::create_default_config(&path).unwrap();

        let partial = ConfigLoader::load_from_file(&path).unwrap();
        assert_eq!(partial.num_frames, Some(16));
        assert_eq!(partial.max_file_size_mb, Some(300));
        assert_eq!(partial.download_timeout_secs, Some(120));
        // 空值视为未设置
        assert_eq!(partial.temp_dir, None);
        assert_eq!(partial.log_level.as_deref(), Some("info"));

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn explicit_missing_config_file_is_an_error() {
        let path = env::temp_dir().join(format!("vs-none-{}.ini", uuid::Uuid::new_v4()));
        assert!(ConfigLoader::load_config(Some(&path), ConfigOverrides::default()).is_err());
    }
}
