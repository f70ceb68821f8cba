use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use imdex::config::CatalogConfig;
use imdex::descriptor::{
    DecodedImage, GlobalDescriptor, ImageLoader, LocalDescriptor, Region, RegionFactory,
};
use imdex::indexer::{CatalogIndexer, IndexingConfig};
use imdex::manager::{self, IndexingOptions};
use imdex::pool::WorkerPool;
use imdex::signature::Signature;
use rstest::*;
use tempfile::TempDir;

#[fixture]
fn temp_dir() -> TempDir {
    TempDir::new().unwrap()
}

fn fake_pictures(root: &Path, names: &[&str]) -> CatalogConfig {
    let pictures = root.join("pictures");
    fs::create_dir_all(&pictures).unwrap();
    for name in names {
        fs::write(pictures.join(name), b"pixels").unwrap();
    }
    CatalogConfig {
        name: "testdb".to_string(),
        root: root.to_path_buf(),
        images: "pictures".to_string(),
        signatures: "signatures".to_string(),
        suffix: "jpg,png,webp".to_string(),
    }
}

struct FakeImage;

impl DecodedImage for FakeImage {
    fn width(&self) -> u32 {
        8
    }

    fn height(&self) -> u32 {
        8
    }
}

/// 路径里带 "bad" 的图片读取失败，其余正常
struct PickyLoader {
    loads: AtomicUsize,
}

impl PickyLoader {
    fn new() -> Arc<Self> {
        Arc::new(Self { loads: AtomicUsize::new(0) })
    }
}

impl ImageLoader for PickyLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn DecodedImage>> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        if path.to_string_lossy().contains("bad") {
            anyhow::bail!("cannot decode {}", path.display());
        }
        Ok(Box::new(FakeImage))
    }
}

struct CountingDescriptor {
    calls: AtomicUsize,
    sleep: Duration,
}

impl CountingDescriptor {
    fn new(sleep: Duration) -> Arc<Self> {
        Arc::new(Self { calls: AtomicUsize::new(0), sleep })
    }
}

impl GlobalDescriptor for CountingDescriptor {
    fn extract(&self, image: Option<&dyn DecodedImage>) -> Result<Signature> {
        assert!(image.is_some(), "source image should be loaded");
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !self.sleep.is_zero() {
            std::thread::sleep(self.sleep);
        }
        Ok(Signature::dense_from(vec![1.0, 2.0]))
    }
}

struct SingleGlobal {
    desc: Arc<CountingDescriptor>,
}

impl IndexingConfig for SingleGlobal {
    fn name(&self) -> &str {
        "single-global"
    }

    fn populate(&self, indexer: &mut CatalogIndexer) -> Result<()> {
        indexer.add_global_descriptor("count", self.desc.clone());
        Ok(())
    }
}

// 一个坏条目不会中断整批，错误落在条目上并出现在报告里
#[rstest]
fn continue_on_error(temp_dir: TempDir) {
    let conf = fake_pictures(temp_dir.path(), &["a.jpg", "bad.jpg", "c.jpg", "d.jpg"]);
    let catalog = Arc::new(manager::create(&conf).unwrap());
    let desc = CountingDescriptor::new(Duration::ZERO);

    let report = manager::index(
        &catalog,
        PickyLoader::new(),
        &SingleGlobal { desc: desc.clone() },
        &IndexingOptions::default(),
    )
    .unwrap();

    assert_eq!(report.processed, 3);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].1.contains("cannot decode"));

    for entry in catalog.entries() {
        if entry.file() == "bad.jpg" {
            assert!(entry.error().is_some());
            assert!(!entry.is_indexed_by("count"));
        } else {
            assert!(entry.error().is_none());
            assert!(entry.has_global("count"));
        }
    }
}

// panic 和普通错误一样被收拢到条目上
#[rstest]
fn panicking_descriptor_is_contained(temp_dir: TempDir) {
    struct PanickingDescriptor;

    impl GlobalDescriptor for PanickingDescriptor {
        fn extract(&self, _image: Option<&dyn DecodedImage>) -> Result<Signature> {
            panic!("descriptor exploded");
        }
    }

    struct PanicConfig;

    impl IndexingConfig for PanicConfig {
        fn name(&self) -> &str {
            "panic"
        }

        fn populate(&self, indexer: &mut CatalogIndexer) -> Result<()> {
            indexer.add_global_descriptor("boom", Arc::new(PanickingDescriptor));
            Ok(())
        }
    }

    let conf = fake_pictures(temp_dir.path(), &["a.jpg", "b.jpg"]);
    let catalog = Arc::new(manager::create(&conf).unwrap());
    let report =
        manager::index(&catalog, PickyLoader::new(), &PanicConfig, &IndexingOptions::default())
            .unwrap();
    assert_eq!(report.failed.len(), 2);
    assert!(report.failed[0].1.contains("descriptor exploded"));
}

// only_missing 模式下已有签名的条目被跳过
#[rstest]
fn only_missing_skips_present_signatures(temp_dir: TempDir) {
    let conf = fake_pictures(temp_dir.path(), &["a.jpg", "b.jpg", "c.jpg"]);
    let catalog = Arc::new(manager::create(&conf).unwrap());
    let desc = CountingDescriptor::new(Duration::ZERO);
    let config = SingleGlobal { desc: desc.clone() };

    let report =
        manager::index(&catalog, PickyLoader::new(), &config, &IndexingOptions::default()).unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(desc.calls.load(Ordering::Relaxed), 3);

    // 手动去掉一个签名后补算，只会重新计算缺的那一个
    catalog.entries()[1].remove_signature("count");
    let opts = IndexingOptions { only_missing: true, ..Default::default() };
    let report = manager::index(&catalog, PickyLoader::new(), &config, &opts).unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.ignored, 2);
    assert_eq!(desc.calls.load(Ordering::Relaxed), 4);
    assert!(catalog.entries().iter().all(|e| e.has_global("count")));
}

struct GridFactory {
    calls: AtomicUsize,
}

impl RegionFactory for GridFactory {
    fn extract_regions(&self, image: &dyn DecodedImage) -> Result<Vec<Region>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let half = image.width() / 2;
        Ok(vec![
            Region { x: 0, y: 0, width: half, height: image.height() },
            Region { x: half, y: 0, width: half, height: image.height() },
        ])
    }
}

struct MeanPatch;

impl LocalDescriptor for MeanPatch {
    fn extract(&self, _image: Option<&dyn DecodedImage>, region: &Region) -> Result<Signature> {
        Ok(Signature::dense_from(vec![region.x as f64, region.width as f64]))
    }
}

struct TwoLocals {
    factory: Arc<GridFactory>,
}

impl IndexingConfig for TwoLocals {
    fn name(&self) -> &str {
        "two-locals"
    }

    fn populate(&self, indexer: &mut CatalogIndexer) -> Result<()> {
        indexer.add_region_factory("grid", self.factory.clone());
        // 两个局部描述符共享同一个区域工厂
        indexer.add_local_descriptor("patch_a", Some("grid"), Arc::new(MeanPatch));
        indexer.add_local_descriptor("patch_b", Some("grid"), Arc::new(MeanPatch));
        Ok(())
    }
}

// 共享区域工厂的描述符不会重复提取区域，每个条目只提取一次
#[rstest]
fn region_factory_results_are_cached_per_task(temp_dir: TempDir) {
    let conf = fake_pictures(temp_dir.path(), &["a.jpg", "b.jpg", "c.jpg"]);
    let catalog = Arc::new(manager::create(&conf).unwrap());
    let factory = Arc::new(GridFactory { calls: AtomicUsize::new(0) });

    manager::index(
        &catalog,
        PickyLoader::new(),
        &TwoLocals { factory: factory.clone() },
        &IndexingOptions::default(),
    )
    .unwrap();

    assert_eq!(factory.calls.load(Ordering::Relaxed), 3);
    for entry in catalog.entries() {
        for desc in ["patch_a", "patch_b"] {
            let bag = entry.local_signature(desc).expect("bag missing");
            assert_eq!(bag.len(), 2);
            assert_eq!(bag[0].get(0).unwrap(), 0.0);
            assert_eq!(bag[1].get(0).unwrap(), 4.0);
        }
        assert!(catalog.contains_local_descriptor("patch_a"));
    }
}

// 源图片由任务按需加载，并在任务结束时无条件卸载
#[rstest]
fn images_are_loaded_once_and_unloaded(temp_dir: TempDir) {
    let conf = fake_pictures(temp_dir.path(), &["a.jpg", "b.jpg"]);
    let catalog = Arc::new(manager::create(&conf).unwrap());
    let loader = PickyLoader::new();
    let desc = CountingDescriptor::new(Duration::ZERO);

    manager::index(
        &catalog,
        loader.clone(),
        &SingleGlobal { desc },
        &IndexingOptions::default(),
    )
    .unwrap();

    // 每个条目只加载一次
    assert_eq!(loader.loads.load(Ordering::Relaxed), 2);
    for entry in catalog.entries() {
        assert!(entry.image().is_none());
    }
}

// 增量转储：运行过程中 headers 和签名被周期性刷到磁盘
#[rstest]
fn partial_dump_checkpoints_during_run(temp_dir: TempDir) {
    let conf = fake_pictures(temp_dir.path(), &["a.jpg", "b.jpg", "c.jpg", "d.jpg"]);
    let catalog = Arc::new(manager::create(&conf).unwrap());
    let desc = CountingDescriptor::new(Duration::from_millis(80));

    let mut indexer = CatalogIndexer::new(catalog.clone(), PickyLoader::new());
    SingleGlobal { desc }.populate(&mut indexer).unwrap();
    indexer.set_partial_dump(Some(Duration::from_millis(10)));

    let pool = WorkerPool::new("index-test", 2);
    let report = indexer.launch(&pool).unwrap();
    assert_eq!(report.processed, 4);

    // 没有调用过 save，文件只可能来自检查点线程
    let sig_root = catalog.root_signature_dir();
    assert!(sig_root.join("db_headers.obj").exists());
    assert!(sig_root.join("sigs_count.obj").exists());
}
