use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// 正面样本目录名（标签 0）
pub const POSITIVE_DIR: &str = "positive";
/// 负面样本目录名（标签 1）
pub const NEGATIVE_DIR: &str = "negative";
/// 训练集占比
pub const TRAIN_FRACTION: f64 = 0.8;

const README: &str = "# 数据集说明

将视频文件放入对应目录：
- positive/：正面情感的视频
- negative/：负面情感的视频

训练与评估只读取 .mp4 文件。
";

/// 带标签的视频样本
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelledVideo {
    pub path: PathBuf,
    /// 0 = 正面, 1 = 负面
    pub label: usize,
}

/// 创建数据集目录结构：positive/、negative/ 和 README.txt
///
/// 已存在的目录和文件中的视频不受影响。
pub fn init_dataset(root: &Path) -> Result<()> {
    for dir in [POSITIVE_DIR, NEGATIVE_DIR] {
        let path = root.join(dir);
        std::fs::create_dir_all(&path).with_context(|| format!("创建目录失败: {}", path.display()))?;
    }
    let readme = root.join("README.txt");
    std::fs::write(&readme, README).with_context(|| format!("写入文件失败: {}", readme.display()))?;

    info!("已创建数据集结构: {}", root.display());
    Ok(())
}

/// 枚举带标签的视频：先正面后负面，各自按路径排序
pub fn collect_labelled_videos(root: &Path) -> Result<Vec<LabelledVideo>> {
    let mut videos = Vec::new();
    for (dir, label) in [(POSITIVE_DIR, 0), (NEGATIVE_DIR, 1)] {
        let mut paths = list_mp4(&root.join(dir))?;
        paths.sort();
        videos.extend(paths.into_iter().map(|path| LabelledVideo { path, label }));
    }

    if videos.is_empty() {
        bail!(
            "在 {} 或 {} 中没有找到视频，请先运行 init-dataset 并放入 .mp4 文件",
            root.join(POSITIVE_DIR).display(),
            root.join(NEGATIVE_DIR).display()
        );
    }
    Ok(videos)
}

fn list_mp4(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("读取目录失败: {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "mp4") {
            paths.push(path);
        }
    }
    Ok(paths)
}

/// 按固定比例切分训练集和验证集（前 80% 为训练集）
pub fn split_train_val(videos: &[LabelledVideo]) -> (&[LabelledVideo], &[LabelledVideo]) {
    let split = (videos.len() as f64 * TRAIN_FRACTION) as usize;
    videos.split_at(split)
}
