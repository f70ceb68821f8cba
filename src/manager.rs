//! 目录库的创建 / 加载 / 保存 / 索引 / 导出入口

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use indicatif::{ProgressBar, ProgressIterator};
use log::info;
use regex::Regex;
use walkdir::WalkDir;

use crate::catalog::Catalog;
use crate::config::CatalogConfig;
use crate::descriptor::ImageLoader;
use crate::indexer::{CatalogIndexer, IndexReport, IndexingConfig};
use crate::persist::CatalogPersistence;
use crate::pool::WorkerPool;
use crate::utils::pb_style;

/// 一次索引运行的选项
#[derive(Debug, Clone)]
pub struct IndexingOptions {
    /// 是否在运行期间周期性转储进度
    pub partial_dump: bool,
    /// 两次转储之间的间隔（分钟）
    pub checkpoint_interval_minutes: f64,
    /// 只补算缺失的签名
    pub only_missing: bool,
    /// 工作线程数，缺省取硬件并行度
    pub threads: Option<usize>,
}

impl Default for IndexingOptions {
    fn default() -> Self {
        Self {
            partial_dump: false,
            checkpoint_interval_minutes: 5.0,
            only_missing: false,
            threads: None,
        }
    }
}

/// 扫描图片目录并创建一个新的目录库，每个匹配的文件一个条目
///
/// 条目按目录列出的顺序创建，id 从 0 开始连续分配
pub fn create(conf: &CatalogConfig) -> Result<Catalog> {
    info!("创建新目录库: {}", conf.name);
    let mut catalog = Catalog::new(&conf.name, &conf.root, &conf.images, &conf.signatures);

    let image_dir = catalog.root_image_dir();
    if !image_dir.is_dir() {
        bail!("unknown images directory {}", image_dir.display());
    }

    let re_suffix = Regex::new(&format!("(?i)^({})$", conf.suffix.replace(',', "|")))
        .context("failed to build suffix regex")?;

    let pb = ProgressBar::no_length().with_style(pb_style());
    for entry in WalkDir::new(&image_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .progress_with(pb)
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(ext) = entry.path().extension() else {
            continue;
        };
        if re_suffix.is_match(&ext.to_string_lossy()) {
            catalog.add(entry.file_name().to_string_lossy().to_string());
        }
    }

    info!(" - 共找到 {} 张图片", catalog.len());
    Ok(catalog)
}

/// 把目录库完整写入磁盘（headers + 全部签名）
pub fn save(catalog: &Catalog) -> Result<()> {
    CatalogPersistence::new(catalog.root_signature_dir()).dump(catalog)
}

/// 从磁盘加载目录库；`headers_only` 时跳过所有签名文件
pub fn load(conf: &CatalogConfig, headers_only: bool) -> Result<Catalog> {
    info!("加载目录库 {}", conf.name);
    let persistence = CatalogPersistence::new(conf.root.join(&conf.signatures));
    let mut catalog =
        if headers_only { persistence.load_headers()? } else { persistence.load(true)? };
    catalog.set_root(&conf.root);
    catalog.set_image_dir(&conf.images);
    catalog.set_sig_dir(&conf.signatures);
    info!("加载完成");
    Ok(catalog)
}

/// 对目录库跑一轮索引
///
/// 非增量模式先清空已注册的描述符和全部旧签名；描述符由
/// `conf.populate` 注册，提取结果直接写在条目上
pub fn index(
    catalog: &Arc<Catalog>,
    loader: Arc<dyn ImageLoader>,
    conf: &dyn IndexingConfig,
    opts: &IndexingOptions,
) -> Result<IndexReport> {
    if !opts.only_missing {
        catalog.clear_descriptors();
    }

    let mut indexer = CatalogIndexer::new(catalog.clone(), loader);
    if opts.partial_dump {
        indexer.set_partial_dump(Some(Duration::from_secs_f64(
            opts.checkpoint_interval_minutes * 60.0,
        )));
    }
    indexer.set_only_missing(opts.only_missing);
    conf.populate(&mut indexer)?;

    if opts.only_missing {
        info!("开始补算缺失的签名 ({})", conf.name());
    } else {
        info!("开始提取签名 ({})", conf.name());
    }

    let pool = match opts.threads {
        Some(threads) => WorkerPool::new("main", threads),
        None => WorkerPool::with_default_size("main"),
    };
    let report = indexer.launch(&pool)?;

    catalog.update_available_descriptors();
    Ok(report)
}

/// 导出的区域行 id：条目 id 和区域序号拼成一个全局唯一的数
pub fn unique_region_id(entry_id: u64, ordinal: usize) -> u64 {
    entry_id * 100_000_000 + ordinal as u64
}

/// 把一个描述符的全部签名导出为空白分隔的文本
///
/// 头四行依次是库名、描述符名、非空签名数量和维度，
/// 之后每行 `id v0 v1 ...`，局部描述符每个区域一行
pub fn text_dump(catalog: &Catalog, desc: &str) -> Result<PathBuf> {
    let global = catalog.contains_global_descriptor(desc);
    if !global && !catalog.contains_local_descriptor(desc) {
        bail!("descriptor {desc} not registered on {}", catalog.name());
    }

    let path = catalog.root().join(format!("{}_{desc}.export", catalog.name()));
    info!("导出 {} 的 {desc} 到 {}", catalog.name(), path.display());

    let mut nb_signatures = 0usize;
    let mut sig_size: i64 = -1;
    for entry in catalog.entries() {
        if global {
            if let Some(sig) = entry.global_signature(desc) {
                if sig_size < 0 {
                    sig_size = sig.size() as i64;
                }
                nb_signatures += 1;
            }
        } else if let Some(bag) = entry.local_signature(desc) {
            for sig in &bag {
                if sig_size < 0 {
                    sig_size = sig.size() as i64;
                }
                nb_signatures += 1;
            }
        }
    }

    let file =
        File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    writeln!(w, "{}", catalog.name())?;
    writeln!(w, "{desc}")?;
    writeln!(w, "{nb_signatures}")?;
    writeln!(w, "{sig_size}")?;

    for entry in catalog.entries() {
        if global {
            if let Some(sig) = entry.global_signature(desc) {
                write!(w, "{}", entry.id())?;
                for d in 0..sig.size() {
                    write!(w, " {}", sig.get(d)?)?;
                }
                writeln!(w)?;
            }
        } else if let Some(bag) = entry.local_signature(desc) {
            for (ordinal, sig) in bag.iter().enumerate() {
                write!(w, "{}", unique_region_id(entry.id(), ordinal))?;
                for d in 0..sig.size() {
                    write!(w, " {}", sig.get(d)?)?;
                }
                writeln!(w)?;
            }
        }
    }
    w.flush()?;
    Ok(path)
}
