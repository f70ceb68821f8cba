//! 索引管线：每个条目一个任务，并发提取签名
//!
//! 单个条目的失败只记录在条目上，不会中断整批；
//! 开启增量转储后由独立线程周期性地把进度刷到磁盘

use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, select};
use log::{error, info};

use crate::catalog::{Catalog, Entry};
use crate::descriptor::{
    EntryDescriptor, GlobalDescriptor, ImageLoader, LocalDescriptor, Region, RegionFactory,
};
use crate::persist::CatalogPersistence;
use crate::pool::{WorkerPool, panic_message};
use crate::signature::Signature;

/// 一次索引运行的配置：向索引器注册描述符与区域工厂
pub trait IndexingConfig {
    fn name(&self) -> &str;

    fn populate(&self, indexer: &mut CatalogIndexer) -> Result<()>;
}

/// 一次索引运行的结果汇总
#[derive(Debug, Default)]
pub struct IndexReport {
    /// 实际计算的全局签名数量
    pub processed: usize,
    /// 因 `only_missing` 而跳过的全局签名数量
    pub ignored: usize,
    /// (条目 id, 错误信息)
    pub failed: Vec<(u64, String)>,
}

/// 目录库索引器
pub struct CatalogIndexer {
    catalog: Arc<Catalog>,
    loader: Arc<dyn ImageLoader>,
    global: BTreeMap<String, Arc<dyn GlobalDescriptor>>,
    local: BTreeMap<String, Arc<dyn LocalDescriptor>>,
    entry_level: BTreeMap<String, Arc<dyn EntryDescriptor>>,
    region_factories: BTreeMap<String, Arc<dyn RegionFactory>>,
    factory_for_local: BTreeMap<String, String>,
    partial_dump: Option<Duration>,
    only_missing: bool,
}

impl CatalogIndexer {
    pub fn new(catalog: Arc<Catalog>, loader: Arc<dyn ImageLoader>) -> Self {
        Self {
            catalog,
            loader,
            global: BTreeMap::new(),
            local: BTreeMap::new(),
            entry_level: BTreeMap::new(),
            region_factories: BTreeMap::new(),
            factory_for_local: BTreeMap::new(),
            partial_dump: None,
            only_missing: false,
        }
    }

    pub fn add_global_descriptor(
        &mut self,
        name: impl Into<String>,
        desc: Arc<dyn GlobalDescriptor>,
    ) {
        self.global.insert(name.into(), desc);
    }

    /// 注册局部描述符；`factory` 为空时该描述符没有支持区域，得到空包
    pub fn add_local_descriptor(
        &mut self,
        name: impl Into<String>,
        factory: Option<&str>,
        desc: Arc<dyn LocalDescriptor>,
    ) {
        let name = name.into();
        if let Some(factory) = factory {
            self.factory_for_local.insert(name.clone(), factory.to_string());
        }
        self.local.insert(name, desc);
    }

    pub fn add_entry_descriptor(
        &mut self,
        name: impl Into<String>,
        desc: Arc<dyn EntryDescriptor>,
    ) {
        self.entry_level.insert(name.into(), desc);
    }

    pub fn add_region_factory(&mut self, name: impl Into<String>, factory: Arc<dyn RegionFactory>) {
        self.region_factories.insert(name.into(), factory);
    }

    /// 开启增量转储并设置两次转储之间的间隔
    pub fn set_partial_dump(&mut self, interval: Option<Duration>) {
        self.partial_dump = interval;
    }

    /// 只补算缺失的签名，已有的跳过
    pub fn set_only_missing(&mut self, only_missing: bool) {
        self.only_missing = only_missing;
    }

    /// 运行索引：每个条目提交一个任务并等待整批结束
    ///
    /// 条目级失败不会让整批失败，统一汇总在返回的报告里
    pub fn launch(&self, pool: &WorkerPool) -> Result<IndexReport> {
        // 只要有任何描述符需要源图片就按需加载
        let load_images = !self.region_factories.is_empty()
            || self.local.values().any(|d| d.needs_source_image())
            || self.global.values().any(|d| d.needs_source_image())
            || self.entry_level.values().any(|d| d.needs_source_image());

        for (name, desc) in &self.local {
            if let Err(e) = desc.init_for_catalog(&self.catalog) {
                error!("描述符 {name} 初始化失败，继续以降级状态运行: {e:#}");
            }
        }
        for (name, desc) in &self.global {
            if let Err(e) = desc.init_for_catalog(&self.catalog) {
                error!("描述符 {name} 初始化失败，继续以降级状态运行: {e:#}");
            }
        }
        for (name, desc) in &self.entry_level {
            if let Err(e) = desc.init_for_catalog(&self.catalog) {
                error!("描述符 {name} 初始化失败，继续以降级状态运行: {e:#}");
            }
        }

        let (ready_tx, ready_rx) = bounded::<()>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let ctx = Arc::new(TaskContext {
            image_root: self.catalog.root_image_dir(),
            loader: self.loader.clone(),
            global: self.global.clone(),
            local: self.local.clone(),
            entry_level: self.entry_level.clone(),
            region_factories: self.region_factories.clone(),
            factory_for_local: self.factory_for_local.clone(),
            load_images,
            only_missing: self.only_missing,
            processed: AtomicUsize::new(0),
            ignored: AtomicUsize::new(0),
            ready: if self.partial_dump.is_some() { Some(ready_tx) } else { None },
        });

        let checkpoint = self
            .partial_dump
            .map(|interval| self.spawn_checkpoint(interval, ready_rx, stop_rx, ctx.clone()));

        let handles = self
            .catalog
            .entries()
            .iter()
            .map(|entry| {
                let ctx = ctx.clone();
                let entry = entry.clone();
                pool.submit(move || Ok(index_entry(&ctx, &entry)))
            })
            .collect();

        let result = pool.wait_all(handles, "index", Duration::from_millis(5000));

        // 先停掉检查点线程再汇总，结束后不再有额外的转储
        drop(stop_tx);
        if let Some(checkpoint) = checkpoint {
            let _ = checkpoint.join();
        }
        result.context("indexing batch failed")?;

        let mut failed = vec![];
        for entry in self.catalog.entries() {
            if let Some(message) = entry.error() {
                error!("{} : {}", entry.file(), message);
                failed.push((entry.id(), message));
            }
        }

        Ok(IndexReport {
            processed: ctx.processed.load(Ordering::Relaxed),
            ignored: ctx.ignored.load(Ordering::Relaxed),
            failed,
        })
    }

    /// 检查点线程：第一个条目完成后写一次 headers，
    /// 之后每个间隔转储一次全部签名，收到停止信号立即退出
    fn spawn_checkpoint(
        &self,
        interval: Duration,
        ready_rx: Receiver<()>,
        stop_rx: Receiver<()>,
        ctx: Arc<TaskContext>,
    ) -> JoinHandle<()> {
        let catalog = self.catalog.clone();
        std::thread::Builder::new()
            .name("partial-dump".to_string())
            .spawn(move || {
                info!("增量转储线程启动");
                let persistence = CatalogPersistence::new(catalog.root_signature_dir());

                // 等到第一个条目完成（或整个运行提前结束）再写 headers
                select! {
                    recv(ready_rx) -> _ => {}
                    recv(stop_rx) -> _ => {}
                }

                info!(
                    "processed: {} - ignored: {}",
                    ctx.processed.load(Ordering::Relaxed),
                    ctx.ignored.load(Ordering::Relaxed)
                );
                if let Err(e) = persistence.dump_headers(&catalog) {
                    error!("headers 转储失败: {e:#}");
                }

                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            info!(
                                "processed: {} - ignored: {}",
                                ctx.processed.load(Ordering::Relaxed),
                                ctx.ignored.load(Ordering::Relaxed)
                            );
                            if let Err(e) = persistence.dump_all_signatures(&catalog) {
                                error!("签名转储失败: {e:#}");
                            }
                        }
                        _ => break,
                    }
                }
                info!("增量转储线程退出");
            })
            .expect("failed to spawn checkpoint thread")
    }
}

struct TaskContext {
    image_root: PathBuf,
    loader: Arc<dyn ImageLoader>,
    global: BTreeMap<String, Arc<dyn GlobalDescriptor>>,
    local: BTreeMap<String, Arc<dyn LocalDescriptor>>,
    entry_level: BTreeMap<String, Arc<dyn EntryDescriptor>>,
    region_factories: BTreeMap<String, Arc<dyn RegionFactory>>,
    factory_for_local: BTreeMap<String, String>,
    load_images: bool,
    only_missing: bool,
    processed: AtomicUsize,
    ignored: AtomicUsize,
    ready: Option<Sender<()>>,
}

/// 单个条目的索引任务，返回软失败码（0 成功 / 1 失败）
///
/// 所有错误（包括 panic）都收拢到条目的 last-error 上
fn index_entry(ctx: &TaskContext, entry: &Arc<Entry>) -> i32 {
    entry.clear_error();
    let mut loaded_here = false;
    let outcome = catch_unwind(AssertUnwindSafe(|| run_entry(ctx, entry, &mut loaded_here)));

    // 只要是本任务加载的图片，无论成败都在任务结束时卸载
    if loaded_here {
        entry.unload_image();
    }

    let code = match outcome {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            entry.set_error(e);
            1
        }
        Err(payload) => {
            entry.set_error(anyhow!("task panicked: {}", panic_message(&payload)));
            1
        }
    };
    if let Some(ready) = &ctx.ready {
        let _ = ready.try_send(());
    }
    code
}

fn run_entry(ctx: &TaskContext, entry: &Entry, loaded_here: &mut bool) -> Result<()> {
    if ctx.global.is_empty() && ctx.local.is_empty() && ctx.entry_level.is_empty() {
        return Ok(());
    }

    // 同一个任务内按工厂名缓存区域，共享工厂的描述符不会重复提取
    let mut region_cache: HashMap<&str, Arc<Vec<Region>>> = HashMap::new();

    for (name, desc) in &ctx.local {
        if ctx.only_missing && entry.has_local(name) {
            continue;
        }
        ensure_image(ctx, entry, loaded_here)?;

        let regions = match ctx.factory_for_local.get(name) {
            Some(factory_name) => match region_cache.get(factory_name.as_str()) {
                Some(regions) => regions.clone(),
                None => {
                    let factory = ctx
                        .region_factories
                        .get(factory_name)
                        .with_context(|| format!("region factory {factory_name} not registered"))?;
                    let guard = entry.image();
                    let image = guard
                        .as_deref()
                        .with_context(|| format!("no image loaded for {}", entry.file()))?;
                    let regions = Arc::new(factory.extract_regions(image)?);
                    drop(guard);
                    region_cache.insert(factory_name.as_str(), regions.clone());
                    regions
                }
            },
            None => Arc::new(vec![]),
        };

        let guard = entry.image();
        let image = guard.as_deref();
        desc.pre_process(image)?;
        let mut bag = Vec::with_capacity(regions.len());
        for region in regions.iter() {
            bag.push(desc.extract(image, region)?);
        }
        desc.post_process(image)?;
        drop(guard);
        entry.put_local(name.clone(), bag);
    }

    for (name, desc) in &ctx.global {
        if !ctx.only_missing || !entry.has_global(name) {
            ensure_image(ctx, entry, loaded_here)?;
            let guard = entry.image();
            let image = guard.as_deref();
            desc.pre_process(image)?;
            let sig = desc.extract(image)?;
            desc.post_process(image)?;
            drop(guard);
            entry.put_global(name.clone(), sig);
            ctx.processed.fetch_add(1, Ordering::Relaxed);
        } else {
            ctx.ignored.fetch_add(1, Ordering::Relaxed);
        }
    }

    for (name, desc) in &ctx.entry_level {
        if ctx.only_missing && entry.has_global(name) {
            continue;
        }
        ensure_image(ctx, entry, loaded_here)?;
        desc.pre_process(entry)?;
        let sig: Signature = desc.extract(entry)?;
        desc.post_process(entry)?;
        entry.put_global(name.clone(), sig);
    }

    Ok(())
}

fn ensure_image(ctx: &TaskContext, entry: &Entry, loaded_here: &mut bool) -> Result<()> {
    if ctx.load_images && entry.load_image(&ctx.image_root, ctx.loader.as_ref())? {
        *loaded_here = true;
    }
    Ok(())
}
