use std::path::PathBuf;
use std::sync::LazyLock;

use clap::{Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::cli::*;

static DEFAULT_ROOT: LazyLock<String> = LazyLock::new(|| {
    let proj_dirs = ProjectDirs::from("", "", "imdex").expect("failed to get project dir");
    proj_dirs.data_dir().to_string_lossy().into_owned()
});

pub(crate) fn default_root() -> &'static str {
    &DEFAULT_ROOT
}

#[derive(Parser, Debug, Clone)]
#[command(name = "imdex", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 扫描图片目录并创建一个新的目录库
    Create(CreateCommand),
    /// 查看目录库的头信息
    Show(ShowCommand),
    /// 把一个描述符的全部签名导出为文本
    Export(ExportCommand),
}

/// 目录库的基本配置
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// 目录库名称
    pub name: String,
    /// 目录库根路径
    #[arg(short, long, default_value = default_root())]
    pub root: PathBuf,
    /// 图片子目录
    #[arg(long, default_value = "pictures")]
    pub images: String,
    /// 签名子目录
    #[arg(long, default_value = "signatures")]
    pub signatures: String,
    /// 扫描的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long, default_value = "jpg,png,webp")]
    pub suffix: String,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum OutputFormat {
    /// JSON 输出
    Json,
    /// 表格输出
    Table,
}
