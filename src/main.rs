use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use video_sentiment::{
    config::{ConfigLoader, ConfigOverrides, ServiceConfig},
    dataset, handler,
    loader::default_intra_threads,
    load_components, load_video, predict_video, AppContext,
};

/// 视频情感分类服务 - 基于导出的 VideoMAE ONNX 模型判断视频正面/负面
#[derive(Parser, Debug)]
#[command(name = "video-sentiment")]
#[command(about = "视频情感分类：帧采样、预处理、ONNX 推理，提供 HTTP 服务", long_about = None)]
struct Args {
    /// 配置文件路径（可选，支持 .ini 格式）
    /// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Web 服务模式：启动 HTTP 服务器
    Serve {
        /// 监听地址（默认从环境变量 VIDEO_SENTIMENT_PORT 读取，如果不存在则使用 0.0.0.0:8000）
        #[arg(short, long)]
        bind: Option<String>,

        /// 模型目录（也可通过 VIDEOMAE_MODEL_PATH 设置）
        #[arg(short, long)]
        model: Option<PathBuf>,
    },
    /// CLI 模式：对本地视频做一次预测
    Predict {
        /// 输入视频文件路径
        video: PathBuf,

        /// 模型目录
        #[arg(short, long)]
        model: Option<PathBuf>,

        /// 采样帧数
        #[arg(short, long)]
        num_frames: Option<usize>,
    },
    /// 导出采样得到的帧（JPEG），用于检查采样结果
    Frames {
        /// 输入视频文件路径
        video: PathBuf,

        /// 输出目录
        #[arg(short, long, default_value = "./frames")]
        output: PathBuf,

        /// 采样帧数
        #[arg(short, long)]
        num_frames: Option<usize>,
    },
    /// 创建数据集目录结构
    InitDataset {
        /// 数据集根目录
        #[arg(short, long, default_value = "dataset")]
        root: PathBuf,
    },
    /// 在验证集上评估模型准确率
    Evaluate {
        /// 数据集根目录
        #[arg(short, long, default_value = "dataset")]
        root: PathBuf,

        /// 模型目录
        #[arg(short, long)]
        model: Option<PathBuf>,
    },
    /// 生成默认配置文件
    InitConfig {
        /// 输出路径
        #[arg(default_value = "video-sentiment.ini")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let overrides = match &args.command {
        Commands::Serve { bind, model } => ConfigOverrides {
            model_path: model.clone(),
            bind: bind.clone(),
            ..ConfigOverrides::default()
        },
        Commands::Predict { model, num_frames, .. } => ConfigOverrides {
            model_path: model.clone(),
            num_frames: *num_frames,
            ..ConfigOverrides::default()
        },
        Commands::Frames { num_frames, .. } => ConfigOverrides {
            num_frames: *num_frames,
            ..ConfigOverrides::default()
        },
        Commands::Evaluate { model, .. } => ConfigOverrides {
            model_path: model.clone(),
            ..ConfigOverrides::default()
        },
        Commands::InitDataset { .. } | Commands::InitConfig { .. } => ConfigOverrides::default(),
    };
    let config = ConfigLoader::load_config(args.config.as_deref(), overrides).context("加载配置失败")?;

    // 初始化日志
    init_tracing(&config.log_level);

    match args.command {
        Commands::Serve { .. } => start_web_server(config).await?,
        Commands::Predict { video, .. } => run_predict(&config, video).await?,
        Commands::Frames { video, output, .. } => dump_frames(&config, &video, &output)?,
        Commands::InitDataset { root } => {
            dataset::init_dataset(&root)?;
            println!("✓ 已创建数据集结构:");
            println!("  {}/", root.display());
            println!("    ├── {}/   正面视频", dataset::POSITIVE_DIR);
            println!("    ├── {}/   负面视频", dataset::NEGATIVE_DIR);
            println!("    └── README.txt");
        }
        Commands::Evaluate { root, .. } => run_evaluate(&config, &root).await?,
        Commands::InitConfig { path } => {
            ConfigLoader::create_default_config(&path)?;
            println!("✓ 已生成配置文件: {}", path.display());
        }
    }

    Ok(())
}

fn init_tracing(level: &str) {
    let level = level.parse::<tracing::Level>().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();
}

async fn run_predict(config: &ServiceConfig, video: PathBuf) -> Result<()> {
    let model_path = config.model_path.clone();
    let num_frames = config.num_frames;

    let result = tokio::task::spawn_blocking(move || -> Result<_> {
        let state = load_components(&model_path, default_intra_threads())?;
        Ok(predict_video(&state, &video, num_frames)?)
    })
    .await
    .context("推理任务异常退出")??;

    println!("预测标签: {} (label_index = {})", result.label, result.label_index);
    println!("置信度: {:.4}", result.confidence);
    for (label, p) in &result.probabilities {
        println!("  {}: {:.4}", label, p);
    }
    Ok(())
}

fn dump_frames(config: &ServiceConfig, video: &Path, output: &Path) -> Result<()> {
    let frames = load_video(video, config.num_frames)?;
    std::fs::create_dir_all(output).with_context(|| format!("创建输出目录失败: {}", output.display()))?;

    for (i, frame) in frames.into_iter().enumerate() {
        let path = output.join(format!("frame_{:03}.jpg", i));
        DynamicImage::ImageRgb8(frame)
            .save(&path)
            .with_context(|| format!("保存帧失败: {}", path.display()))?;
    }
    info!("已导出 {} 帧到 {}", config.num_frames, output.display());
    Ok(())
}

async fn run_evaluate(config: &ServiceConfig, root: &Path) -> Result<()> {
    let videos = dataset::collect_labelled_videos(root)?;
    let (train, val) = dataset::split_train_val(&videos);
    info!("样本总数: {}，训练集: {}，验证集: {}", videos.len(), train.len(), val.len());
    if val.is_empty() {
        anyhow::bail!("验证集为空，至少需要 2 个视频");
    }

    let val = val.to_vec();
    let model_path = config.model_path.clone();
    let num_frames = config.num_frames;
    let (correct, total) = tokio::task::spawn_blocking(move || -> Result<(usize, usize)> {
        let state = load_components(&model_path, default_intra_threads())?;
        let mut correct = 0;
        let mut total = 0;
        for sample in &val {
            match predict_video(&state, &sample.path, num_frames) {
                Ok(result) => {
                    total += 1;
                    if result.label_index == sample.label {
                        correct += 1;
                    }
                }
                Err(e) => warn!("跳过无法处理的视频 {}: {}", sample.path.display(), e),
            }
        }
        Ok((correct, total))
    })
    .await
    .context("评估任务异常退出")??;

    if total == 0 {
        anyhow::bail!("验证集中没有可以处理的视频");
    }
    println!("验证集准确率: {:.4} ({}/{})", correct as f64 / total as f64, correct, total);
    Ok(())
}

async fn start_web_server(config: ServiceConfig) -> Result<()> {
    let bind = config.bind.clone();
    let ctx = Arc::new(AppContext::new(config));

    // 启动时加载模型；失败时继续启动，第一个请求会重新尝试
    if let Err(e) = ctx.components().await {
        warn!("启动时加载模型失败，将在首次请求时重试: {}", e);
    }

    let app = handler::router(ctx.clone());

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .context(format!("绑定地址失败: {}", bind))?;

    info!("Web 服务器启动在: http://{}", bind);
    info!("健康检查: http://{}/health", bind);
    info!("视频预测: http://{}/predict", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("启动服务器失败")?;

    ctx.shutdown().await;
    info!("服务已停止");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("监听退出信号失败: {}", e);
        std::future::pending::<()>().await;
    }
}
